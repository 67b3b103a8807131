//! HA supervisor integration
//!
//! The supervisor (Patroni-style) runs next to every database process and
//! owns role/health/switchover decisions inside one deployment. This module
//! exposes:
//! - [`HaSupervisor`]: the REST primitives we consume
//! - [`HttpSupervisor`]: the reqwest-backed client
//! - [`SupervisorConfig`]: the configuration document we render and push

pub mod client;
pub mod config;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::{RetryPolicy, Result};

pub use client::HttpSupervisor;
pub use config::{
    supervisor_name, RaftSettings, RenderInputs, StandbySettings, SupervisorConfig,
};

/// Role of a member as reported by `GET /cluster`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Leader,
    StandbyLeader,
    SyncStandby,
    Replica,
    #[serde(other)]
    Unknown,
}

/// One entry of the supervisor's member list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub name: String,
    pub host: String,
    pub role: MemberRole,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lag: Option<serde_json::Value>,
}

impl ClusterMember {
    /// Running (or streaming from its upstream)
    pub fn is_ready(&self) -> bool {
        matches!(self.state.as_str(), "running" | "streaming")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterResponse {
    #[serde(default)]
    pub members: Vec<ClusterMember>,
}

/// `GET /health` of the local member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberHealth {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl MemberHealth {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// REST primitives of the HA supervisor
#[async_trait]
pub trait HaSupervisor: Send + Sync {
    /// Member roster as seen by the supervisor quorum
    async fn cluster(&self) -> Result<Vec<ClusterMember>>;

    /// Health of the local member
    async fn health(&self) -> Result<MemberHealth>;

    async fn switchover(&self, leader: &str, candidate: Option<&str>) -> Result<()>;

    async fn failover(&self, candidate: &str) -> Result<()>;

    /// Re-read the configuration document
    async fn reload(&self) -> Result<()>;

    async fn restart(&self) -> Result<()>;

    async fn reinitialize(&self) -> Result<()>;

    /// Patch the dynamic (quorum-stored) configuration
    async fn patch_config(&self, patch: serde_json::Value) -> Result<()>;

    /// Addresses tried when the local endpoint is unreachable
    fn set_peers(&self, _peers: Vec<String>) {}
}

/// True when every member the supervisor knows about is running or streaming
pub async fn are_all_members_ready(supervisor: &dyn HaSupervisor) -> Result<bool> {
    let members = supervisor.cluster().await?;
    Ok(!members.is_empty() && members.iter().all(ClusterMember::is_ready))
}

/// Name of the writable primary, if any
pub async fn primary(supervisor: &dyn HaSupervisor) -> Result<Option<String>> {
    Ok(primary_member(supervisor).await?.map(|m| m.name))
}

pub async fn primary_member(supervisor: &dyn HaSupervisor) -> Result<Option<ClusterMember>> {
    Ok(supervisor
        .cluster()
        .await?
        .into_iter()
        .find(|m| m.role == MemberRole::Leader))
}

/// Name of the standby leader, if the deployment replicates from another one
pub async fn standby_leader(
    supervisor: &dyn HaSupervisor,
    require_running: bool,
) -> Result<Option<String>> {
    Ok(supervisor
        .cluster()
        .await?
        .into_iter()
        .find(|m| m.role == MemberRole::StandbyLeader && (!require_running || m.is_ready()))
        .map(|m| m.name))
}

/// Turn a standby deployment into a primary one
pub async fn promote_standby_cluster(supervisor: &dyn HaSupervisor) -> Result<()> {
    supervisor
        .patch_config(serde_json::json!({ "standby_cluster": null }))
        .await
}

/// Poll until the deployment reports a writable primary
pub async fn wait_for_primary(
    supervisor: &dyn HaSupervisor,
    policy: RetryPolicy,
) -> Result<Option<String>> {
    for attempt in 0..policy.attempts {
        match primary(supervisor).await {
            Ok(Some(name)) => return Ok(Some(name)),
            Ok(None) => tracing::debug!("No primary yet (attempt {})", attempt + 1),
            Err(e) => tracing::debug!("Primary check failed (attempt {}): {}", attempt + 1, e),
        }
        if attempt + 1 < policy.attempts {
            tokio::time::sleep(policy.initial_backoff).await;
        }
    }
    Ok(None)
}

pub async fn update_synchronous_node_count(
    supervisor: &dyn HaSupervisor,
    count: usize,
) -> Result<()> {
    supervisor
        .patch_config(serde_json::json!({ "synchronous_node_count": count }))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cluster_response() {
        let body = r#"{
            "members": [
                {"name": "pg-0", "host": "10.0.0.1", "role": "leader", "state": "running", "lag": 0},
                {"name": "pg-1", "host": "10.0.0.2", "role": "sync_standby", "state": "streaming", "lag": 0},
                {"name": "pg-2", "host": "10.0.0.3", "role": "quorum_standby", "state": "starting"}
            ]
        }"#;
        let parsed: ClusterResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.members.len(), 3);
        assert_eq!(parsed.members[0].role, MemberRole::Leader);
        assert!(parsed.members[1].is_ready());
        assert_eq!(parsed.members[2].role, MemberRole::Unknown);
        assert!(!parsed.members[2].is_ready());
    }
}
