//! Audit log of destructive space operations
//!
//! Writes JSON lines to `<state_dir>/envspace/audit.log`. Several processes
//! may append to the same file; each entry carries the writer's pid.

use crate::config::{schema::Config, ConfigManager};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Events recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    /// A new space directory was allocated
    SpaceCreated,
    /// An evicted space was rebuilt for another spec
    SpaceRebuilt,
    /// A space was marked damaged
    SpaceDamaged,
    /// A space directory was deleted by repair or prune
    SpaceRemoved,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpaceCreated => "space.created",
            Self::SpaceRebuilt => "space.rebuilt",
            Self::SpaceDamaged => "space.damaged",
            Self::SpaceRemoved => "space.removed",
        }
    }
}

/// File-based audit logger that appends JSON lines
#[derive(Debug, Clone)]
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: ConfigManager::audit_log_path(),
        }
    }

    /// Audit logger writing to an explicit path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            path: path.into(),
        }
    }

    /// Audit logger that drops every event
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log an audit event as a JSON line
    ///
    /// IO failures are only logged as warnings.
    pub async fn log(&self, event: AuditEvent, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "pid": std::process::id(),
            "event": event.as_str(),
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
