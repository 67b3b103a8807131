//! Error types for topokeeper

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Coordination channel Errors ===
    #[error("Permission denied: {caller} cannot write {partition}")]
    Permission { caller: String, partition: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Unknown link: {0}")]
    UnknownLink(String),

    // === Topology Errors ===
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("{0}")]
    OperatorConflict(String),

    // === HA supervisor Errors ===
    #[error("Supervisor returned {status} for {path}: {body}")]
    Supervisor {
        path: String,
        status: u16,
        body: String,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Raft admin Errors ===
    #[error("Raft admin error: {0}")]
    RaftAdmin(String),

    #[error("Failed to remove {0} from the raft group")]
    RemoveRaftMemberFailed(String),

    // === Workload Errors ===
    #[error("Workload error: {0}")]
    Workload(String),

    #[error("Secret error: {0}")]
    Secret(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_)
            | Error::ConnectionFailed(_)
            | Error::NotReady(_)
            | Error::RaftAdmin(_) => true,
            Error::Supervisor { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("x".into()).is_retryable());
        assert!(Error::Supervisor {
            path: "/cluster".into(),
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!Error::Supervisor {
            path: "/switchover".into(),
            status: 412,
            body: String::new()
        }
        .is_retryable());
        assert!(!Error::OperatorConflict("x".into()).is_retryable());
    }
}
