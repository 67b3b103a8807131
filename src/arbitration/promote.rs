//! Operator promotion actions

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{current_view, LinkView, PrimaryClusterData, Side};
use crate::channel::keys;
use crate::common::{AuditEventType, Error, Result};
use crate::context::{Context, StatusKind};
use crate::supervisor::{self, supervisor_name, MemberRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromoteScope {
    /// Switch the primary role inside the deployment to this member
    Unit,
    /// Make this deployment the primary of its replication link
    #[default]
    Cluster,
}

impl FromStr for PromoteScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unit" => Ok(PromoteScope::Unit),
            "cluster" => Ok(PromoteScope::Cluster),
            other => Err(Error::InvalidConfig(format!("unknown scope {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PromoteRequest {
    #[serde(default)]
    pub scope: PromoteScope,
    #[serde(default)]
    pub force: bool,
}

pub async fn promote_to_primary(ctx: &Context, request: PromoteRequest) -> Result<String> {
    match request.scope {
        PromoteScope::Unit => switchover_to_self(ctx).await,
        PromoteScope::Cluster => promote_cluster(ctx, request.force).await,
    }
}

/// Start replication on a link where no primary has been chosen yet
pub async fn create_replication(ctx: &Context) -> Result<String> {
    let view = current_view(ctx)
        .await?
        .ok_or_else(|| Error::OperatorConflict("no replication link to set up".into()))?;
    if view.local_epoch > 0 || view.remote_epoch > 0 {
        return Err(Error::OperatorConflict(format!(
            "replication on {} is already set up (epoch {})",
            view.link.name,
            view.highest()
        )));
    }
    promote_cluster(ctx, false).await
}

async fn switchover_to_self(ctx: &Context) -> Result<String> {
    let own = supervisor_name(ctx.member());
    let primary = supervisor::primary(ctx.supervisor.as_ref())
        .await?
        .ok_or_else(|| Error::NotReady("the deployment has no primary".into()))?;
    if primary == own {
        return Err(Error::OperatorConflict(format!(
            "{} is already the primary",
            ctx.member()
        )));
    }
    ctx.supervisor.switchover(&primary, Some(&own)).await?;
    ctx.audit.log_event(
        AuditEventType::Switchover,
        ctx.member(),
        Some(primary.clone()),
        format!("switchover from {} to {}", primary, own),
        None,
    );
    Ok(format!("switchover from {} to {} requested", primary, own))
}

async fn promote_cluster(ctx: &Context, force: bool) -> Result<String> {
    let Some(view) = current_view(ctx).await? else {
        return promote_standby_leader(ctx).await;
    };
    if !ctx.is_leader().await? {
        return Err(Error::OperatorConflict(
            "promotion must run on the deployment leader".into(),
        ));
    }
    if !ctx.is_initialised().await? {
        return Err(Error::NotReady("the cluster is not initialised".into()));
    }
    match view.primary() {
        Some(Side::Local) => {
            return Err(Error::OperatorConflict(format!(
                "{} is already the primary cluster",
                view.local
            )))
        }
        Some(Side::Remote) if !force => {
            return Err(Error::OperatorConflict(format!(
                "{} is the primary cluster (epoch {}). Pass force=true to promote anyway",
                view.remote, view.remote_epoch
            )))
        }
        _ => {}
    }

    let epoch = view.highest() + 1;
    publish_primary_data(ctx, &view).await?;
    let value = epoch.to_string();
    ctx.set_deployment(keys::PROMOTED_CLUSTER_COUNTER, Some(&value))
        .await?;
    ctx.write_if_changed(
        &view.local_partition(),
        keys::PROMOTED_CLUSTER_COUNTER,
        Some(&value),
    )
    .await?;

    ctx.metrics.promotions.inc();
    ctx.metrics.highest_epoch.set(epoch);
    ctx.audit.log_event(
        AuditEventType::Promotion,
        ctx.member(),
        Some(view.link.name.clone()),
        format!("{} promoted to primary", view.local),
        Some(serde_json::json!({ "epoch": epoch, "force": force })),
    );
    tracing::info!(link = %view.link.name, epoch, "Promoted {} to primary", view.local);
    Ok(format!(
        "{} promoted to primary on {} (epoch {})",
        view.local, view.link.name, epoch
    ))
}

/// No link: promote the local standby leader, if there is one
async fn promote_standby_leader(ctx: &Context) -> Result<String> {
    let standby = supervisor::standby_leader(ctx.supervisor.as_ref(), false)
        .await?
        .ok_or_else(|| {
            Error::OperatorConflict("no replication link and no standby leader to promote".into())
        })?;
    supervisor::promote_standby_cluster(ctx.supervisor.as_ref()).await?;
    ctx.set_status(StatusKind::Active, "standby leader promoted, deployment is writable");
    ctx.audit.log_event(
        AuditEventType::Promotion,
        ctx.member(),
        Some(standby.clone()),
        "standby leader promoted without a link",
        None,
    );
    Ok(format!("standby leader {} promoted", standby))
}

/// Endpoint of the member that is (or is about to become) writable
async fn primary_endpoint(ctx: &Context) -> Result<String> {
    let top = ctx
        .supervisor
        .cluster()
        .await?
        .into_iter()
        .find(|m| matches!(m.role, MemberRole::Leader | MemberRole::StandbyLeader));
    Ok(match top {
        Some(m) => format!("{}:{}", m.host, ctx.config.database_port),
        None => ctx.config.database_endpoint(),
    })
}

/// Publish endpoint, lineage and credentials for the standby side
pub(crate) async fn publish_primary_data(ctx: &Context, view: &LinkView) -> Result<()> {
    let secret_id = ctx
        .read_deployment(keys::CREDENTIALS_SECRET_ID)
        .await?
        .ok_or_else(|| Error::NotReady("deployment credentials not created yet".into()))?;
    ctx.secrets.grant(&secret_id, &view.remote).await?;
    let data = PrimaryClusterData {
        endpoint: primary_endpoint(ctx).await?,
        secret_id,
        system_id: ctx.workload.system_identifier().await?,
        engine_version: ctx.config.engine_version.clone(),
    };
    let encoded = serde_json::to_string(&data)?;
    if ctx
        .write_if_changed(
            &view.local_partition(),
            keys::PRIMARY_CLUSTER_DATA,
            Some(&encoded),
        )
        .await?
    {
        ctx.audit.log_event(
            AuditEventType::SecretGranted,
            ctx.member(),
            Some(view.remote.clone()),
            "credentials granted to the standby deployment",
            None,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req: PromoteRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.scope, PromoteScope::Cluster);
        assert!(!req.force);

        let req: PromoteRequest =
            serde_json::from_str(r#"{"scope": "unit", "force": true}"#).unwrap();
        assert_eq!(req.scope, PromoteScope::Unit);
        assert!(req.force);
        assert!("region".parse::<PromoteScope>().is_err());
    }
}
