//! Error types for envspace
//!
//! All modules use `SpaceResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for envspace operations
pub type SpaceResult<T> = Result<T, SpaceError>;

/// All errors that can occur in envspace
#[derive(Error, Debug)]
pub enum SpaceError {
    // Allocation errors
    #[error("Timed out after {timeout_secs}s waiting for lock on space {name}")]
    LockTimeout { name: String, timeout_secs: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to build space {name}: {reason}")]
    BuildFailed {
        name: String,
        reason: String,
        stdout: String,
        stderr: String,
    },

    #[error("All {max_spaces} spaces are in use and none can be reused")]
    ResourceExhausted { max_spaces: usize },

    #[error("Hash computation failed: {0}")]
    Hash(String),

    // Registry errors
    #[error("Invalid space name: {name}: {reason}")]
    InvalidSpaceName { name: String, reason: String },

    #[error("Space not found: {0}")]
    SpaceNotFound(String),

    #[error("Space {0} is not damaged; refusing to remove a healthy space")]
    NotDamaged(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {timeout_secs}s: {command}")]
    CommandTimeout { command: String, timeout_secs: u64 },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SpaceError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Check if error is retryable
    ///
    /// Retrying is left to the caller; nothing in the crate retries internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::CommandTimeout { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockTimeout { .. } => Some("Another process is using the space. Retry later."),
            Self::ResourceExhausted { .. } => {
                Some("Run: envspace prune, or raise pool.max_spaces in the config")
            }
            Self::BuildFailed { .. } => {
                Some("The space was marked damaged. Run: envspace repair <name>")
            }
            _ => None,
        }
    }
}
