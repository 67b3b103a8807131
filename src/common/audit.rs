//! Audit logging for topology-changing actions
//!
//! Every promotion, data wipe, membership change and raft admin call is
//! recorded as one JSON line, to a file and/or through `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Audit log event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    Promotion,
    Switchover,
    StandbyTakeover,
    DataArchived,
    DataWiped,
    MemberAdded,
    MemberRemoved,
    RaftMemberAdded,
    RaftMemberRemoved,
    SecretGranted,
    LinkBroken,
    System,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub event: AuditEventType,
    pub actor: String,          // member name
    pub target: Option<String>, // affected member, link or address
    pub message: String,
    pub meta: Option<serde_json::Value>,
}

/// Audit logger, one per agent
pub struct AuditLogger {
    file: Option<Mutex<File>>,
    to_tracing: bool,
    entries: Mutex<Vec<AuditEntry>>,
    keep_entries: bool,
}

impl AuditLogger {
    /// Create a new audit logger appending to `path`
    pub fn new(path: Option<&Path>, to_tracing: bool) -> Self {
        let file = path.and_then(|p| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .map_err(|e| tracing::warn!("Cannot open audit log {}: {}", p.display(), e))
                .ok()
                .map(Mutex::new)
        });
        Self {
            file,
            to_tracing,
            entries: Mutex::new(Vec::new()),
            keep_entries: false,
        }
    }

    /// Logger that keeps entries in memory only
    pub fn in_memory() -> Self {
        Self {
            file: None,
            to_tracing: false,
            entries: Mutex::new(Vec::new()),
            keep_entries: true,
        }
    }

    /// Log an audit entry
    pub fn log(&self, entry: AuditEntry) {
        let line = serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string());
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{}", line);
            }
        }
        if self.to_tracing {
            tracing::info!(target: "audit", "{}", line);
        }
        if self.keep_entries {
            if let Ok(mut entries) = self.entries.lock() {
                entries.push(entry);
            }
        }
    }

    /// Convenience for logging an event
    pub fn log_event(
        &self,
        event: AuditEventType,
        actor: impl Into<String>,
        target: Option<String>,
        message: impl Into<String>,
        meta: Option<serde_json::Value>,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
            actor: actor.into(),
            target,
            message: message.into(),
            meta,
        };
        self.log(entry);
    }

    /// Entries kept by an in-memory logger
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::new(Some(&path), false);
        logger.log_event(
            AuditEventType::Promotion,
            "pg-east/0",
            Some("dr-link".to_string()),
            "promoted to epoch 4",
            Some(serde_json::json!({ "epoch": 4 })),
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let entry: AuditEntry = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(entry.event, AuditEventType::Promotion);
        assert_eq!(entry.actor, "pg-east/0");
    }

    #[test]
    fn test_audit_in_memory() {
        let logger = AuditLogger::in_memory();
        logger.log_event(AuditEventType::DataWiped, "pg/1", None, "wiped", None);
        assert_eq!(logger.entries().len(), 1);
    }
}
