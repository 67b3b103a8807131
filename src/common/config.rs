//! Configuration for the topokeeper agent
//!
//! Values come from an optional TOML file, then `TOPOKEEPER_*` environment
//! variables, then command-line flags (applied by the binaries).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::common::{Error, Result};

/// Agent configuration for one member process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable member name (e.g. `pg-east/0`)
    pub member: String,

    /// Deployment this member belongs to (e.g. `pg-east`)
    pub deployment: String,

    /// Network address other members and the linked deployment reach us on
    pub address: String,

    /// HA supervisor REST port
    #[serde(default = "default_supervisor_port")]
    pub supervisor_port: u16,

    /// Talk to the supervisor over HTTPS first
    #[serde(default)]
    pub supervisor_tls: bool,

    /// Database port advertised to the linked deployment
    #[serde(default = "default_database_port")]
    pub database_port: u16,

    /// Raft port of the supervisor's quorum group
    #[serde(default = "default_raft_port")]
    pub raft_port: u16,

    /// Raft admin CLI
    #[serde(default = "default_raft_admin_tool")]
    pub raft_admin_tool: PathBuf,

    /// Storage-engine tool that prints the system identifier
    #[serde(default = "default_controldata_tool")]
    pub controldata_tool: PathBuf,

    /// Shared coordination-channel directory
    #[serde(default = "default_channel_dir")]
    pub channel_dir: PathBuf,

    /// Shared secret store directory
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,

    /// Database data directory (owned exclusively by this member)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Raft persisted state directory
    #[serde(default = "default_raft_dir")]
    pub raft_dir: PathBuf,

    /// Where archival copies of diverged data directories are written
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Rendered supervisor configuration document
    #[serde(default = "default_supervisor_config_path")]
    pub supervisor_config_path: PathBuf,

    /// Service manager unit running the supervisor + database
    #[serde(default = "default_service_unit")]
    pub service_unit: String,

    /// Database engine major version, published to the linked deployment
    #[serde(default = "default_engine_version")]
    pub engine_version: String,

    /// Synchronous replica count policy
    #[serde(default)]
    pub synchronous_node_count: SyncNodePolicy,

    /// Periodic status tick
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Timeout for a single supervisor HTTP request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Timeout for a single CLI invocation
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Attempts for retried external calls
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,

    /// First backoff delay, doubled on every retry
    #[serde(default = "default_retry_backoff")]
    pub retry_initial_backoff_ms: u64,

    /// Polls while waiting for a standby leader to be promoted
    #[serde(default = "default_promotion_wait_attempts")]
    pub promotion_wait_attempts: usize,

    #[serde(default = "default_promotion_wait_interval")]
    pub promotion_wait_interval_ms: u64,

    /// Agent status/actions HTTP server
    #[serde(default = "default_status_bind")]
    pub status_bind: SocketAddr,

    /// JSON-lines audit log, disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_supervisor_port() -> u16 {
    8008
}
fn default_database_port() -> u16 {
    5432
}
fn default_raft_port() -> u16 {
    2222
}
fn default_raft_admin_tool() -> PathBuf {
    PathBuf::from("syncobj_admin")
}
fn default_controldata_tool() -> PathBuf {
    PathBuf::from("pg_controldata")
}
fn default_channel_dir() -> PathBuf {
    PathBuf::from("/var/lib/topokeeper/channel")
}
fn default_secrets_dir() -> PathBuf {
    PathBuf::from("/var/lib/topokeeper/secrets")
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/postgresql/data")
}
fn default_raft_dir() -> PathBuf {
    PathBuf::from("/var/lib/postgresql/raft")
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("/var/lib/postgresql/archive")
}
fn default_supervisor_config_path() -> PathBuf {
    PathBuf::from("/etc/patroni/patroni.json")
}
fn default_service_unit() -> String {
    "patroni.service".to_string()
}
fn default_engine_version() -> String {
    "16".to_string()
}
fn default_tick_interval() -> u64 {
    30
}
fn default_request_timeout() -> u64 {
    5_000
}
fn default_command_timeout() -> u64 {
    60
}
fn default_retry_attempts() -> usize {
    5
}
fn default_retry_backoff() -> u64 {
    500
}
fn default_promotion_wait_attempts() -> usize {
    20
}
fn default_promotion_wait_interval() -> u64 {
    3_000
}
fn default_status_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8090))
}
fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    /// Minimal configuration with defaults for everything but identity
    pub fn new(member: &str, deployment: &str, address: &str) -> Self {
        Self {
            member: member.to_string(),
            deployment: deployment.to_string(),
            address: address.to_string(),
            supervisor_port: default_supervisor_port(),
            supervisor_tls: false,
            database_port: default_database_port(),
            raft_port: default_raft_port(),
            raft_admin_tool: default_raft_admin_tool(),
            controldata_tool: default_controldata_tool(),
            channel_dir: default_channel_dir(),
            secrets_dir: default_secrets_dir(),
            data_dir: default_data_dir(),
            raft_dir: default_raft_dir(),
            archive_dir: default_archive_dir(),
            supervisor_config_path: default_supervisor_config_path(),
            service_unit: default_service_unit(),
            engine_version: default_engine_version(),
            synchronous_node_count: SyncNodePolicy::default(),
            tick_interval_secs: default_tick_interval(),
            request_timeout_ms: default_request_timeout(),
            command_timeout_secs: default_command_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_initial_backoff_ms: default_retry_backoff(),
            promotion_wait_attempts: default_promotion_wait_attempts(),
            promotion_wait_interval_ms: default_promotion_wait_interval(),
            status_bind: default_status_bind(),
            audit_log: None,
            log_level: default_log_level(),
        }
    }

    /// Load from an optional TOML file and `TOPOKEEPER_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix("TOPOKEEPER"));

        let cfg: AgentConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.member.is_empty() || self.deployment.is_empty() {
            return Err(Error::InvalidConfig(
                "member and deployment must be set".into(),
            ));
        }
        if !self.member.starts_with(&format!("{}/", self.deployment)) {
            return Err(Error::InvalidConfig(format!(
                "member {} does not belong to deployment {}",
                self.member, self.deployment
            )));
        }
        if self.address.is_empty() {
            return Err(Error::InvalidConfig("address must be set".into()));
        }
        if self.retry_attempts == 0 {
            return Err(Error::InvalidConfig("retry_attempts must be >= 1".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
        }
    }

    pub fn promotion_wait(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.promotion_wait_attempts.max(1),
            initial_backoff: Duration::from_millis(self.promotion_wait_interval_ms),
        }
    }

    /// Endpoint the linked deployment replicates from
    pub fn database_endpoint(&self) -> String {
        format!("{}:{}", self.address, self.database_port)
    }
}

/// Bounded retry parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// No waiting between attempts, for simulations
    pub fn immediate(attempts: usize) -> Self {
        Self {
            attempts,
            initial_backoff: Duration::ZERO,
        }
    }
}

/// How many synchronous standbys the supervisor should keep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SyncNodePolicy {
    /// Every other member
    #[default]
    All,
    /// Half of the members, rounded down
    Majority,
    Fixed(usize),
}

impl SyncNodePolicy {
    /// Synchronous node count for a deployment of `members` members
    pub fn node_count(&self, members: usize) -> usize {
        let others = members.saturating_sub(1);
        match self {
            SyncNodePolicy::All => others,
            SyncNodePolicy::Majority => members / 2,
            SyncNodePolicy::Fixed(n) => (*n).min(others),
        }
    }
}

impl FromStr for SyncNodePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "all" => Ok(SyncNodePolicy::All),
            "majority" => Ok(SyncNodePolicy::Majority),
            other => other.parse().map(SyncNodePolicy::Fixed).map_err(|_| {
                Error::InvalidConfig(format!("invalid synchronous_node_count: {}", other))
            }),
        }
    }
}

impl TryFrom<String> for SyncNodePolicy {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SyncNodePolicy> for String {
    fn from(p: SyncNodePolicy) -> Self {
        match p {
            SyncNodePolicy::All => "all".to_string(),
            SyncNodePolicy::Majority => "majority".to_string(),
            SyncNodePolicy::Fixed(n) => n.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sync_node_policy() {
        assert_eq!(SyncNodePolicy::All.node_count(3), 2);
        assert_eq!(SyncNodePolicy::Majority.node_count(3), 1);
        assert_eq!(SyncNodePolicy::Majority.node_count(4), 2);
        assert_eq!(SyncNodePolicy::Fixed(5).node_count(3), 2);
        assert_eq!(SyncNodePolicy::All.node_count(1), 0);
        assert_eq!("majority".parse::<SyncNodePolicy>().unwrap(), SyncNodePolicy::Majority);
        assert_eq!("2".parse::<SyncNodePolicy>().unwrap(), SyncNodePolicy::Fixed(2));
        assert!("some".parse::<SyncNodePolicy>().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(AgentConfig::new("pg/0", "pg", "10.0.0.1").validate().is_ok());
        assert!(AgentConfig::new("other/0", "pg", "10.0.0.1").validate().is_err());
        assert!(AgentConfig::new("pg/0", "pg", "").validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
member = "pg-east/1"
deployment = "pg-east"
address = "10.1.0.2"
raft_port = 2223
synchronous_node_count = "majority"
"#
        )
        .unwrap();

        let cfg = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.member, "pg-east/1");
        assert_eq!(cfg.raft_port, 2223);
        assert_eq!(cfg.supervisor_port, 8008);
        assert_eq!(cfg.synchronous_node_count, SyncNodePolicy::Majority);
        assert_eq!(cfg.database_endpoint(), "10.1.0.2:5432");
    }
}
