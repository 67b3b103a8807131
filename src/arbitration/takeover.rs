//! Standby takeover
//!
//! Runs on every member of the deployment that lost arbitration:
//! stop, mark `stopped`, wait until the whole deployment is stopped or
//! converged, then (leader first) archive diverged data, wipe, reinitialise,
//! render the standby configuration, start and ack the epoch. Nothing is
//! destroyed before every member has stopped.

use super::{LinkView, PrimaryClusterData};
use crate::channel::keys;
use crate::common::{AuditEventType, Result};
use crate::context::{Context, StatusKind};
use crate::dispatch::Outcome;
use crate::secrets::SharedSecret;

struct Progress {
    ack: u64,
    stopped: bool,
    reinitialised: u64,
}

async fn progress(ctx: &Context, member: &str) -> Result<Progress> {
    Ok(Progress {
        ack: keys::counter(
            ctx.read_member(member, keys::UNIT_PROMOTED_CLUSTER_COUNTER)
                .await?
                .as_deref(),
        ),
        stopped: keys::flag(ctx.read_member(member, keys::STOPPED).await?.as_deref()),
        reinitialised: keys::counter(
            ctx.read_member(member, keys::REINITIALISED_COUNTER)
                .await?
                .as_deref(),
        ),
    })
}

fn blocked(ctx: &Context, message: String) -> Outcome {
    ctx.set_status(StatusKind::Blocked, message.clone());
    Outcome::Failed(message)
}

pub async fn standby_side(ctx: &Context, view: &LinkView) -> Result<Outcome> {
    let epoch = view.highest();
    let Some(primary) = view.remote_data.as_ref() else {
        return Ok(Outcome::Deferred(format!(
            "waiting for {} to publish its primary data",
            view.remote
        )));
    };
    if view.remote_confirmed < epoch {
        return Ok(Outcome::Deferred(format!(
            "waiting for {} to confirm promotion to epoch {}",
            view.remote, epoch
        )));
    }
    if !primary.engine_version.is_empty() && primary.engine_version != ctx.config.engine_version {
        return Ok(blocked(
            ctx,
            format!(
                "{} runs engine version {}, this deployment runs {}",
                view.remote, primary.engine_version, ctx.config.engine_version
            ),
        ));
    }

    let leader = ctx.is_leader().await?;
    let own = progress(ctx, ctx.member()).await?;

    if own.ack == epoch && !own.stopped {
        return settled(ctx, view, leader).await;
    }

    // 1. stop
    if !own.stopped {
        if leader {
            ctx.set_deployment(keys::CLUSTER_INITIALISED, None).await?;
        }
        tracing::info!(member = %ctx.member(), epoch, "Stopping for standby takeover");
        if let Err(e) = ctx.workload.stop_service().await {
            ctx.set_status(StatusKind::Blocked, format!("cannot stop the database: {}", e));
            return Ok(Outcome::Deferred(format!("stop failed: {}", e)));
        }
        ctx.set_own(keys::STOPPED, Some(keys::TRUE)).await?;
        ctx.metrics.takeovers.inc();
        ctx.audit.log_event(
            AuditEventType::StandbyTakeover,
            ctx.member(),
            Some(view.link.name.clone()),
            format!("stopped to follow {}", view.remote),
            Some(serde_json::json!({ "epoch": epoch })),
        );
    }

    // 2. the whole deployment must be down (or already following)
    let members = ctx.channel.members(ctx.deployment()).await?;
    let mut waiting = Vec::new();
    for member in &members {
        let p = progress(ctx, member).await?;
        if !p.stopped && p.ack != epoch {
            waiting.push(member.clone());
        }
    }
    if !waiting.is_empty() {
        ctx.set_status(
            StatusKind::Waiting,
            format!("waiting for {} to stop", waiting.join(", ")),
        );
        return Ok(Outcome::Deferred(format!(
            "{} member(s) still running",
            waiting.len()
        )));
    }

    // 3. reinitialise local state for this epoch
    if own.reinitialised != epoch {
        if leader {
            archive_if_diverged(ctx, primary).await;
        }
        if let Err(e) = ctx.workload.reset_data_dir().await {
            return Ok(blocked(ctx, format!("cannot wipe the data directory: {}", e)));
        }
        ctx.metrics.data_wipes.inc();
        ctx.audit.log_event(
            AuditEventType::DataWiped,
            ctx.member(),
            None,
            format!("data directory reset to follow {}", view.remote),
            Some(serde_json::json!({ "epoch": epoch })),
        );
        if let Err(e) = ctx.workload.discard_raft_state().await {
            return Ok(blocked(ctx, format!("cannot discard raft state: {}", e)));
        }
        if leader {
            ctx.set_deployment(keys::STANZA, None).await?;
            adopt_primary_credentials(ctx, primary).await?;
        }
        ctx.set_own(keys::REINITIALISED_COUNTER, Some(&epoch.to_string()))
            .await?;
    }

    // 4. replicas clone from the standby leader, which starts first
    if !leader {
        let leader_acked = match ctx.channel.leader(ctx.deployment()).await? {
            Some(l) => progress(ctx, &l).await?.ack == epoch,
            None => false,
        };
        if !leader_acked {
            ctx.set_status(StatusKind::Waiting, "waiting for the standby leader to start");
            return Ok(Outcome::Deferred("standby leader not started yet".into()));
        }
    }

    // 5. configure and start as a standby
    ctx.refresh_supervisor_config().await?;
    if let Err(e) = ctx.workload.start_service().await {
        ctx.set_status(StatusKind::Blocked, format!("cannot start the database: {}", e));
        return Ok(Outcome::Deferred(format!("start failed: {}", e)));
    }
    let health = ctx.supervisor.health().await?;
    if !health.is_running() {
        ctx.set_status(StatusKind::Waiting, "waiting for the database to start");
        return Ok(Outcome::Deferred(format!("database is {}", health.state)));
    }

    // 6. ack
    ctx.set_own(keys::UNIT_PROMOTED_CLUSTER_COUNTER, Some(&epoch.to_string()))
        .await?;
    ctx.set_own(keys::STOPPED, None).await?;
    tracing::info!(member = %ctx.member(), epoch, "Following {}", view.remote);
    settled(ctx, view, leader).await
}

/// This member follows the current epoch; the leader re-marks the
/// deployment initialised once every member does
async fn settled(ctx: &Context, view: &LinkView, leader: bool) -> Result<Outcome> {
    let epoch = view.highest();
    if leader && !ctx.is_initialised().await? {
        let mut lagging = 0;
        for member in ctx.channel.members(ctx.deployment()).await? {
            let p = progress(ctx, &member).await?;
            if p.ack != epoch || p.stopped {
                lagging += 1;
            }
        }
        if lagging > 0 {
            ctx.set_status(
                StatusKind::Waiting,
                format!("{} member(s) still joining the standby cluster", lagging),
            );
            return Ok(Outcome::Converged);
        }
        ctx.set_deployment(keys::CLUSTER_INITIALISED, Some(keys::TRUE))
            .await?;
    }
    ctx.set_status(
        StatusKind::Active,
        format!("standby of {} on {} (epoch {})", view.remote, view.link.name, epoch),
    );
    Ok(Outcome::Converged)
}

/// Replicate with the primary's passwords; the raft password stays local,
/// a witness of this deployment holds it
async fn adopt_primary_credentials(ctx: &Context, primary: &PrimaryClusterData) -> Result<()> {
    let remote = ctx.secrets.fetch(&primary.secret_id, ctx.deployment()).await?;
    let local = ctx.credentials().await?;
    let raft_password = match &local {
        Some(local) => local.raft_password.clone(),
        None => remote.raft_password.clone(),
    };
    let adopted = SharedSecret {
        raft_password,
        ..remote
    };
    if local.as_ref() == Some(&adopted) {
        return Ok(());
    }
    let id = ctx.secrets.create(ctx.deployment(), &adopted).await?;
    ctx.set_deployment(keys::CREDENTIALS_SECRET_ID, Some(&id))
        .await?;
    tracing::info!(member = %ctx.member(), "Adopted the primary's replication credentials");
    Ok(())
}

/// Keep a copy of local data whose lineage differs from the new primary's
async fn archive_if_diverged(ctx: &Context, primary: &PrimaryClusterData) {
    let local = match ctx.workload.system_identifier().await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("Cannot read the local system identifier, not archiving: {}", e);
            return;
        }
    };
    if local == primary.system_id {
        return;
    }
    match ctx.workload.archive_data_dir(&local).await {
        Ok(path) => {
            tracing::warn!(
                "Local lineage {} differs from primary {}, archived to {}",
                local,
                primary.system_id,
                path.display()
            );
            ctx.audit.log_event(
                AuditEventType::DataArchived,
                ctx.member(),
                Some(path.display().to_string()),
                "diverged data directory archived",
                Some(serde_json::json!({ "local": local, "primary": primary.system_id })),
            );
        }
        Err(e) => tracing::warn!("Archiving diverged data failed: {}", e),
    }
}
