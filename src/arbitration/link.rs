//! Link-changed and link-broken handlers

use super::promote::publish_primary_data;
use super::{takeover, LinkView, Side};
use crate::channel::keys;
use crate::channel::{LinkInfo, LinkKind, Partition};
use crate::common::{AuditEventType, Result};
use crate::context::{Context, StatusKind};
use crate::dispatch::Outcome;
use crate::supervisor;

/// Re-arbitrate a replication link after either side changed
pub async fn on_link_changed(ctx: &Context, name: &str) -> Result<Outcome> {
    let Some(link) = ctx.channel.link(name).await? else {
        return Ok(Outcome::Converged);
    };
    if link.kind != LinkKind::Replication {
        return Ok(Outcome::Converged);
    }
    publish_unit_address(ctx, &link).await?;

    let view = LinkView::load(ctx, link).await?;
    ctx.metrics.highest_epoch.set(view.highest());
    match view.primary() {
        None => {
            ctx.set_status(
                StatusKind::Active,
                format!("linked to {} on {}, no primary chosen", view.remote, view.link.name),
            );
            Ok(Outcome::Converged)
        }
        Some(Side::Local) => primary_side(ctx, &view).await,
        Some(Side::Remote) => takeover::standby_side(ctx, &view).await,
    }
}

/// Every member advertises its address so the primary side can admit it
async fn publish_unit_address(ctx: &Context, link: &LinkInfo) -> Result<()> {
    let part = Partition::LinkMember {
        link: link.name.clone(),
        member: ctx.member().to_string(),
    };
    ctx.write_if_changed(&part, keys::UNIT_ADDRESS, Some(&ctx.config.address))
        .await?;
    Ok(())
}

async fn primary_side(ctx: &Context, view: &LinkView) -> Result<Outcome> {
    let leader = ctx.is_leader().await?;
    let sup = ctx.supervisor.as_ref();

    // A former standby must be writable before the remote side demotes itself
    if supervisor::standby_leader(sup, false).await?.is_some() {
        if !leader {
            return Ok(Outcome::Deferred(
                "waiting for the leader to promote the standby cluster".into(),
            ));
        }
        tracing::info!(link = %view.link.name, "Promoting standby cluster {}", view.local);
        if let Err(e) = supervisor::promote_standby_cluster(sup).await {
            return Ok(Outcome::Deferred(format!(
                "could not promote the standby cluster: {}",
                e
            )));
        }
    }
    if supervisor::wait_for_primary(sup, ctx.config.promotion_wait())
        .await?
        .is_none()
    {
        return Ok(Outcome::Deferred("no writable primary yet".into()));
    }

    let epoch = view.local_epoch;
    let value = epoch.to_string();
    if leader {
        ctx.write_if_changed(
            &view.local_partition(),
            keys::PROMOTED_CLUSTER_COUNTER,
            Some(&value),
        )
        .await?;
        publish_primary_data(ctx, view).await?;
        ctx.write_if_changed(
            &view.local_partition(),
            keys::PROMOTED_CLUSTER_CONFIRMED,
            Some(&value),
        )
        .await?;
    }
    ctx.set_own(keys::UNIT_PROMOTED_CLUSTER_COUNTER, Some(&value))
        .await?;
    ctx.set_own(keys::STOPPED, None).await?;
    ctx.apply_supervisor_config().await?;

    ctx.set_status(
        StatusKind::Active,
        format!("primary cluster on {} (epoch {})", view.link.name, epoch),
    );
    Ok(Outcome::Converged)
}

pub async fn on_link_broken(ctx: &Context, link: &LinkInfo) -> Result<Outcome> {
    if link.kind == LinkKind::Witness {
        return crate::witness::on_witness_broken(ctx, link).await;
    }

    let was_standby = match supervisor::standby_leader(ctx.supervisor.as_ref(), false).await {
        Ok(found) => found.is_some(),
        Err(e) => {
            tracing::warn!("Cannot query the supervisor, using channel state: {}", e);
            keys::counter(ctx.read_own(keys::REINITIALISED_COUNTER).await?.as_deref()) > 0
        }
    };

    if was_standby {
        ctx.set_status(
            StatusKind::Blocked,
            format!(
                "replication link {} broken: standby cluster is read-only until promoted",
                link.name
            ),
        );
        if ctx.is_leader().await? {
            ctx.set_deployment(keys::PROMOTED_CLUSTER_COUNTER, None)
                .await?;
        }
    } else {
        ctx.set_status(StatusKind::Active, "primary cluster, no replication link");
    }

    ctx.set_own(keys::STOPPED, None).await?;
    ctx.set_own(keys::REINITIALISED_COUNTER, None).await?;
    ctx.set_own(keys::UNIT_PROMOTED_CLUSTER_COUNTER, None)
        .await?;

    if let Err(e) = ctx.apply_supervisor_config().await {
        tracing::warn!("Could not re-render configuration after {} broke: {}", link.name, e);
    }
    ctx.audit.log_event(
        AuditEventType::LinkBroken,
        ctx.member(),
        Some(link.name.clone()),
        if was_standby {
            "standby lost its primary"
        } else {
            "replication link removed"
        },
        None,
    );
    Ok(Outcome::Converged)
}
