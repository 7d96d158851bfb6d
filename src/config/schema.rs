//! Configuration schema for envspace
//!
//! Configuration is stored at `~/.config/envspace/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Space pool settings
    pub pool: PoolConfig,

    /// Builder tool settings
    pub builder: BuilderConfig,

    /// Spec identity settings
    pub identity: IdentityConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Space pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Directory holding the spaces (defaults to the state directory)
    pub base_dir: Option<PathBuf>,

    /// Maximum number of spaces that may exist at once
    pub max_spaces: usize,

    /// Spaces kept by `prune` when no explicit count is given
    pub max_retained: usize,

    /// Idle seconds before a non-matching space may be rebuilt
    pub reuse_timeout_secs: u64,

    /// Seconds to wait for a space lock
    pub lock_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            max_spaces: 10,
            max_retained: 10,
            reuse_timeout_secs: 3600,
            lock_timeout_secs: 60,
        }
    }
}

impl PoolConfig {
    pub fn reuse_timeout(&self) -> Duration {
        Duration::from_secs(self.reuse_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Builder tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Builder executable (looked up on PATH when not absolute)
    pub program: String,

    /// Seconds before a build is aborted
    pub build_timeout_secs: u64,

    /// Seconds before a hash computation is aborted
    pub hash_timeout_secs: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            program: "envspace-builder".to_string(),
            build_timeout_secs: 1800,
            hash_timeout_secs: 60,
        }
    }
}

/// Spec identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Memoized normalized specs and hashes
    pub cache_capacity: usize,

    /// List items starting with one of these are ignored when comparing
    /// specs without a hash
    pub volatile_directives: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 64,
            volatile_directives: vec!["--use-feature".to_string()],
        }
    }
}
