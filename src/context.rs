//! Per-member context handed to every handler

use serde::Serialize;
use std::sync::{Arc, RwLock};

use crate::channel::keys;
use crate::channel::{CoordinationChannel, Partition};
use crate::common::{AgentConfig, AuditEventType, AuditLogger, Error, MetricsRegistry, Result};
use crate::raft_admin::{ensure_member, AddOutcome, RaftAdmin, RemoveOutcome};
use crate::secrets::{SecretStore, SharedSecret};
use crate::supervisor::{HaSupervisor, RenderInputs, SupervisorConfig};
use crate::workload::Workload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Active,
    Waiting,
    Blocked,
}

/// Status shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberStatus {
    pub kind: StatusKind,
    pub message: String,
}

/// External collaborators of one member
pub struct Collaborators {
    pub channel: Arc<dyn CoordinationChannel>,
    pub supervisor: Arc<dyn HaSupervisor>,
    pub raft: Arc<dyn RaftAdmin>,
    pub workload: Arc<dyn Workload>,
    pub secrets: Arc<dyn SecretStore>,
}

pub struct Context {
    pub config: AgentConfig,
    pub channel: Arc<dyn CoordinationChannel>,
    pub supervisor: Arc<dyn HaSupervisor>,
    pub raft: Arc<dyn RaftAdmin>,
    pub workload: Arc<dyn Workload>,
    pub secrets: Arc<dyn SecretStore>,
    pub audit: Arc<AuditLogger>,
    pub metrics: Arc<MetricsRegistry>,
    status: RwLock<MemberStatus>,
}

impl Context {
    pub fn new(
        config: AgentConfig,
        collaborators: Collaborators,
        audit: Arc<AuditLogger>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            channel: collaborators.channel,
            supervisor: collaborators.supervisor,
            raft: collaborators.raft,
            workload: collaborators.workload,
            secrets: collaborators.secrets,
            audit,
            metrics,
            status: RwLock::new(MemberStatus {
                kind: StatusKind::Waiting,
                message: "starting".to_string(),
            }),
        }
    }

    pub fn member(&self) -> &str {
        &self.config.member
    }

    pub fn deployment(&self) -> &str {
        &self.config.deployment
    }

    pub fn deployment_partition(&self) -> Partition {
        Partition::Deployment(self.config.deployment.clone())
    }

    pub fn own_partition(&self) -> Partition {
        Partition::Member(self.config.member.clone())
    }

    pub async fn is_leader(&self) -> Result<bool> {
        Ok(self.channel.leader(self.deployment()).await?.as_deref() == Some(self.member()))
    }

    pub async fn read_deployment(&self, key: &str) -> Result<Option<String>> {
        self.channel.read(&self.deployment_partition(), key).await
    }

    pub async fn read_member(&self, member: &str, key: &str) -> Result<Option<String>> {
        self.channel
            .read(&Partition::Member(member.to_string()), key)
            .await
    }

    pub async fn read_own(&self, key: &str) -> Result<Option<String>> {
        self.channel.read(&self.own_partition(), key).await
    }

    /// Write unless the key already holds `value`; returns whether it wrote
    pub async fn write_if_changed(
        &self,
        partition: &Partition,
        key: &str,
        value: Option<&str>,
    ) -> Result<bool> {
        if self.channel.read(partition, key).await?.as_deref() == value {
            return Ok(false);
        }
        self.channel
            .write(self.member(), partition, key, value)
            .await?;
        Ok(true)
    }

    pub async fn set_deployment(&self, key: &str, value: Option<&str>) -> Result<bool> {
        self.write_if_changed(&self.deployment_partition(), key, value)
            .await
    }

    pub async fn set_own(&self, key: &str, value: Option<&str>) -> Result<bool> {
        self.write_if_changed(&self.own_partition(), key, value)
            .await
    }

    pub async fn is_initialised(&self) -> Result<bool> {
        Ok(keys::flag(
            self.read_deployment(keys::CLUSTER_INITIALISED)
                .await?
                .as_deref(),
        ))
    }

    pub async fn members_ips(&self) -> Result<Vec<String>> {
        Ok(keys::string_list(
            self.read_deployment(keys::MEMBERS_IPS).await?.as_deref(),
        ))
    }

    /// Deployment credentials, once the leader has created them
    pub async fn credentials(&self) -> Result<Option<SharedSecret>> {
        match self.read_deployment(keys::CREDENTIALS_SECRET_ID).await? {
            Some(id) => Ok(Some(self.secrets.fetch(&id, self.deployment()).await?)),
            None => Ok(None),
        }
    }

    /// Admin endpoint of the local raft node
    pub fn raft_conn(&self) -> String {
        self.raft_addr(&self.config.address)
    }

    pub fn raft_addr(&self, ip: &str) -> String {
        format!("{}:{}", ip, self.config.raft_port)
    }

    async fn raft_password(&self) -> Result<String> {
        self.credentials()
            .await?
            .map(|c| c.raft_password)
            .ok_or_else(|| Error::NotReady("deployment credentials not created yet".into()))
    }

    pub async fn add_raft_member(&self, addr: &str) -> Result<AddOutcome> {
        let password = self.raft_password().await?;
        self.metrics.raft_admin_calls.inc();
        let outcome = ensure_member(self.raft.as_ref(), &self.raft_conn(), &password, addr).await?;
        if outcome == AddOutcome::Added {
            tracing::info!(member = %self.member(), "Added {} to the raft group", addr);
            self.audit.log_event(
                AuditEventType::RaftMemberAdded,
                self.member(),
                Some(addr.to_string()),
                "raft member added",
                None,
            );
        }
        Ok(outcome)
    }

    pub async fn remove_raft_member(&self, addr: &str) -> Result<RemoveOutcome> {
        let password = self.raft_password().await?;
        self.metrics.raft_admin_calls.inc();
        let outcome = self
            .raft
            .remove(&self.raft_conn(), &password, addr)
            .await
            .map_err(|e| {
                tracing::warn!("Raft remove of {} failed: {}", addr, e);
                Error::RemoveRaftMemberFailed(addr.to_string())
            })?;
        if outcome == RemoveOutcome::Removed {
            self.audit.log_event(
                AuditEventType::RaftMemberRemoved,
                self.member(),
                Some(addr.to_string()),
                "raft member removed",
                None,
            );
        }
        Ok(outcome)
    }

    pub fn set_status(&self, kind: StatusKind, message: impl Into<String>) {
        let message = message.into();
        if let Ok(mut status) = self.status.write() {
            if status.kind != kind || status.message != message {
                tracing::info!(member = %self.config.member, "Status {:?}: {}", kind, message);
                *status = MemberStatus { kind, message };
            }
        }
    }

    pub fn status(&self) -> MemberStatus {
        self.status
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|_| MemberStatus {
                kind: StatusKind::Blocked,
                message: "status unavailable".to_string(),
            })
    }

    /// Render the supervisor document from channel state; `None` until
    /// credentials exist
    pub async fn render_supervisor_config(&self) -> Result<Option<SupervisorConfig>> {
        let Some(credentials) = self.credentials().await? else {
            return Ok(None);
        };
        let members_ips = self.members_ips().await?;
        let (standby, standby_hosts) = crate::arbitration::replication_render_inputs(self).await?;
        let inputs = RenderInputs {
            synchronous_node_count: self
                .config
                .synchronous_node_count
                .node_count(members_ips.len()),
            members_ips,
            witness: self.read_deployment(keys::WITNESS_ADDRESS).await?,
            credentials,
            standby,
            standby_hosts,
        };
        Ok(Some(SupervisorConfig::render(&self.config, &inputs)))
    }

    /// Write the rendered document; returns whether it changed
    pub async fn refresh_supervisor_config(&self) -> Result<bool> {
        let Some(rendered) = self.render_supervisor_config().await? else {
            return Ok(false);
        };
        self.supervisor.set_peers(self.members_ips().await?);
        self.workload
            .write_supervisor_config(&rendered.to_document()?)
            .await
    }

    /// Refresh, then reload a running supervisor if the document changed
    pub async fn apply_supervisor_config(&self) -> Result<bool> {
        let changed = self.refresh_supervisor_config().await?;
        if changed && self.workload.service_active().await? {
            self.supervisor.reload().await?;
            self.metrics.supervisor_reloads.inc();
        }
        Ok(changed)
    }
}
