//! # topokeeper
//!
//! Topology-control agent for replicated PostgreSQL deployments:
//! - Local membership reconciliation through the HA supervisor
//! - Cross-cluster replication with epoch-based primary arbitration
//! - Standby takeover that never destroys data before every member stopped
//! - Raft quorum witness integration for two-member deployments
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────── deployment "east" ───────────────┐      ┌── "west" ──┐
//! │  agent east/0 (leader)   agent east/1   ...      │      │  agents    │
//! │    │  dispatcher: notices + tick + actions       │      │            │
//! │    ├─ membership   ── HA supervisor (REST)       │ link │            │
//! │    ├─ arbitration  ── epochs, takeover           ├──────┤            │
//! │    └─ witness      ── raft admin tool            │      │            │
//! └──────────────────────────┬───────────────────────┘      └─────┬──────┘
//!                            │     coordination channel           │
//!                            └────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Run the agent on a member
//! ```bash
//! topokeeper-agent serve --config /etc/topokeeper/agent.toml
//! ```
//!
//! ### Operator actions
//! ```bash
//! topokeeper link create dr --deployments east,west --channel /var/lib/topokeeper/channel
//! topokeeper create-replication --agent http://10.0.0.1:8090
//! topokeeper promote-to-primary --agent http://10.1.0.1:8090 --force
//! ```

pub mod agent;
pub mod arbitration;
pub mod channel;
pub mod common;
pub mod context;
pub mod dispatch;
pub mod membership;
pub mod raft_admin;
pub mod secrets;
pub mod supervisor;
pub mod testing;
pub mod witness;
pub mod workload;

// Re-export commonly used types
pub use agent::{Agent, AgentHandle};
pub use common::{AgentConfig, Error, Result};
pub use context::{Context, MemberStatus, StatusKind};
pub use dispatch::{Dispatcher, Event, Outcome};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
