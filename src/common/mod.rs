//! Common utilities and types shared across topokeeper

pub mod audit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use audit::{AuditEntry, AuditEventType, AuditLogger};
pub use config::{AgentConfig, RetryPolicy, SyncNodePolicy};
pub use error::{Error, Result};
pub use metrics::MetricsRegistry;
pub use utils::{generate_password, retry_with_backoff, run_command, CommandOutput};
