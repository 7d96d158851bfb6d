//! Space records and persisted status values
//!
//! A space is a directory under the pool's base directory. Its metadata lives
//! in small marker files inside that directory (see [`files`]).

use crate::error::{SpaceError, SpaceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Marker file names inside a space directory
pub mod files {
    /// Text of the last successfully built spec
    pub const SPEC_CONTENT: &str = "space_spec.yaml";
    /// Source path of that spec, used when recomputing its hash
    pub const SPEC_PATH: &str = "space_spec_path";
    /// Persisted [`super::SpaceStatus`]
    pub const STATE: &str = "state";
    /// Presence means the space is damaged
    pub const DAMAGED: &str = "damaged";
    /// JSON map of environment variables captured by the builder
    pub const CAPTURED_ENV: &str = "space_env.json";
    /// Pid of the last process that requested a build
    pub const REQUESTED_PID: &str = "requested_pid";
    /// Modification time is the last-usage timestamp
    pub const LAST_USAGE: &str = "last_usage";
    /// Prefix of legacy `time_<epoch>` usage markers
    pub const LEGACY_USAGE_PREFIX: &str = "time_";
}

/// Captured environment key pointing at the built toolchain root
pub const TOOLCHAIN_ROOT_KEY: &str = "TOOLCHAIN_ROOT";

/// An environment specification presented by a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    /// Raw spec text
    pub text: String,
    /// Where the text came from
    pub path: PathBuf,
}

impl EnvironmentSpec {
    pub fn new(text: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            text: text.into(),
            path: path.into(),
        }
    }

    /// Read a spec from disk
    pub fn from_file(path: &Path) -> SpaceResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| SpaceError::io(format!("reading spec {}", path.display()), e))?;
        Ok(Self::new(text, path))
    }
}

/// Stable identifier of a space, also its directory name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpaceName(String);

impl SpaceName {
    /// Validate and wrap a space name
    pub fn new(name: impl Into<String>) -> SpaceResult<Self> {
        let name = name.into();
        let invalid = |reason: &str| SpaceError::InvalidSpaceName {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if name.starts_with('.') {
            return Err(invalid("name must not start with '.'"));
        }
        if name.contains(['/', '\\']) {
            return Err(invalid("name must not contain path separators"));
        }
        Ok(Self(name))
    }

    /// Generate a fresh name for a new space
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("space-{}", &id[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SpaceName {
    type Error = SpaceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SpaceName> for String {
    fn from(value: SpaceName) -> Self {
        value.0
    }
}

/// Build status of a space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceStatus {
    /// Directory exists, nothing requested yet
    Created,
    /// A build was requested (in progress, failed or interrupted)
    EnvRequested,
    /// Build finished and identity files are in place
    EnvReady,
}

impl SpaceStatus {
    /// Parse from the state marker contents
    pub fn from_marker(s: &str) -> Option<Self> {
        match s.trim() {
            "created" => Some(Self::Created),
            "environment_requested" => Some(Self::EnvRequested),
            "environment_ready" => Some(Self::EnvReady),
            _ => None,
        }
    }

    /// Convert to state marker contents
    pub fn as_marker(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::EnvRequested => "environment_requested",
            Self::EnvReady => "environment_ready",
        }
    }
}

impl fmt::Display for SpaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::EnvRequested => write!(f, "requested"),
            Self::EnvReady => write!(f, "ready"),
        }
    }
}

/// In-memory descriptor of one on-disk space
#[derive(Debug, Clone, Serialize)]
pub struct SpaceRecord {
    pub name: SpaceName,
    /// Always `base_dir/name`
    pub path: PathBuf,
    pub status: SpaceStatus,
    /// `None` until the space has been touched for the first time
    pub last_usage: Option<DateTime<Utc>>,
    pub damaged: bool,
    pub requested_pid: Option<u32>,
}

impl SpaceRecord {
    /// Create a record for `base_dir/name` with no metadata loaded
    pub fn new(base_dir: &Path, name: SpaceName) -> Self {
        Self {
            path: base_dir.join(name.as_str()),
            name,
            status: SpaceStatus::Created,
            last_usage: None,
            damaged: false,
            requested_pid: None,
        }
    }

    /// Path of a marker file inside this space
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Ready and not damaged
    pub fn is_usable(&self) -> bool {
        self.status == SpaceStatus::EnvReady && !self.damaged
    }
}
