//! Local membership reconciliation
//!
//! The deployment leader keeps `members-ips` equal to the addresses of the
//! live members and pushes the list into the supervisor configuration.
//! Changes go one member at a time and only while every member is ready;
//! a removal first takes the member out of the raft group.

use std::collections::BTreeSet;

use crate::channel::keys;
use crate::common::{AuditEventType, Error, Result};
use crate::context::{Context, StatusKind};
use crate::dispatch::Outcome;
use crate::secrets::SharedSecret;
use crate::supervisor;

/// Publish this member's address, remembering the previous one for removal
pub async fn publish_address(ctx: &Context) -> Result<()> {
    let address = ctx.config.address.as_str();
    let previous = ctx.read_own(keys::IP).await?;
    if previous.as_deref() != Some(address) {
        if let Some(old) = previous.as_deref() {
            tracing::info!(member = %ctx.member(), "Address changed from {} to {}", old, address);
            ctx.set_own(keys::IP_TO_REMOVE, Some(old)).await?;
        }
        ctx.set_own(keys::IP, Some(address)).await?;
    }

    // The leader has dropped the old address
    if let Some(old) = ctx.read_own(keys::IP_TO_REMOVE).await? {
        if !ctx.members_ips().await?.contains(&old) {
            ctx.set_own(keys::IP_TO_REMOVE, None).await?;
        }
    }
    Ok(())
}

/// Seed the deployment and start the local database once this member is
/// part of the member list
pub async fn bootstrap(ctx: &Context) -> Result<Outcome> {
    publish_address(ctx).await?;
    let leader = ctx.is_leader().await?;

    if leader {
        if ctx.read_deployment(keys::CREDENTIALS_SECRET_ID).await?.is_none() {
            let id = ctx
                .secrets
                .create(ctx.deployment(), &SharedSecret::generate())
                .await?;
            ctx.set_deployment(keys::CREDENTIALS_SECRET_ID, Some(&id))
                .await?;
        }
        if ctx.read_deployment(keys::MEMBERS_IPS).await?.is_none() {
            ctx.set_deployment(
                keys::MEMBERS_IPS,
                Some(&keys::encode_list(&[ctx.config.address.as_str()])),
            )
            .await?;
        }
    }

    ensure_started(ctx).await?;

    if leader && !ctx.is_initialised().await? {
        if crate::arbitration::is_standby_designate(ctx).await? {
            return Ok(Outcome::Converged);
        }
        if keys::flag(ctx.read_own(keys::STOPPED).await?.as_deref()) {
            return Ok(Outcome::Converged);
        }
        let running = supervisor::primary_member(ctx.supervisor.as_ref())
            .await?
            .is_some_and(|m| m.is_ready());
        if !running {
            ctx.set_status(StatusKind::Waiting, "waiting for the primary to start");
            return Ok(Outcome::Deferred("primary not running yet".into()));
        }
        ctx.set_deployment(keys::CLUSTER_INITIALISED, Some(keys::TRUE))
            .await?;
        tracing::info!(deployment = %ctx.deployment(), "Cluster initialised");
        ctx.set_status(StatusKind::Active, "cluster initialised");
    }
    Ok(Outcome::Converged)
}

/// Render the configuration and start the service unless a takeover
/// owns it or this member has not been added yet
async fn ensure_started(ctx: &Context) -> Result<()> {
    if keys::flag(ctx.read_own(keys::STOPPED).await?.as_deref()) {
        return Ok(());
    }
    if !ctx.members_ips().await?.contains(&ctx.config.address) {
        ctx.set_status(StatusKind::Waiting, "waiting to be added to the cluster");
        return Ok(());
    }
    if ctx.credentials().await?.is_none() {
        return Ok(());
    }
    ctx.apply_supervisor_config().await?;
    if !ctx.workload.service_active().await? {
        ctx.workload.start_service().await?;
    }
    Ok(())
}

/// Append `ip` to the member list. Fails with [`Error::NotReady`] unless
/// every member is ready.
pub async fn add_member(ctx: &Context, ip: &str) -> Result<()> {
    if !supervisor::are_all_members_ready(ctx.supervisor.as_ref()).await? {
        return Err(Error::NotReady(format!(
            "not all members are ready to add {}",
            ip
        )));
    }
    let mut ips = ctx.members_ips().await?;
    if ips.iter().any(|i| i == ip) {
        return Ok(());
    }
    ips.push(ip.to_string());
    ctx.set_deployment(keys::MEMBERS_IPS, Some(&keys::encode_list(&ips)))
        .await?;
    ctx.apply_supervisor_config().await?;
    ctx.audit.log_event(
        AuditEventType::MemberAdded,
        ctx.member(),
        Some(ip.to_string()),
        "member added",
        None,
    );
    tracing::info!(deployment = %ctx.deployment(), "Added member {}", ip);
    Ok(())
}

async fn remove_member(ctx: &Context, ip: &str) -> Result<Outcome> {
    if !supervisor::are_all_members_ready(ctx.supervisor.as_ref()).await? {
        return Ok(Outcome::Deferred(format!(
            "not all members are ready to remove {}",
            ip
        )));
    }
    if let Err(e) = ctx.remove_raft_member(&ctx.raft_addr(ip)).await {
        return Ok(Outcome::Deferred(e.to_string()));
    }
    let ips: Vec<String> = ctx
        .members_ips()
        .await?
        .into_iter()
        .filter(|i| i != ip)
        .collect();
    ctx.set_deployment(keys::MEMBERS_IPS, Some(&keys::encode_list(&ips)))
        .await?;
    ctx.apply_supervisor_config().await?;
    ctx.audit.log_event(
        AuditEventType::MemberRemoved,
        ctx.member(),
        Some(ip.to_string()),
        "member removed",
        None,
    );
    tracing::info!(deployment = %ctx.deployment(), "Removed member {}", ip);
    Ok(Outcome::Converged)
}

/// Addresses published by the members currently on the roster
async fn live_addresses(ctx: &Context) -> Result<BTreeSet<String>> {
    let mut ips = BTreeSet::new();
    for member in ctx.channel.members(ctx.deployment()).await? {
        if let Some(ip) = ctx.read_member(&member, keys::IP).await? {
            ips.insert(ip);
        }
    }
    Ok(ips)
}

pub async fn reconcile(ctx: &Context) -> Result<Outcome> {
    if !ctx.is_leader().await? {
        ensure_started(ctx).await?;
        return Ok(Outcome::Converged);
    }
    if !ctx.is_initialised().await? {
        return Ok(Outcome::Deferred("cluster not initialised".into()));
    }

    let current: BTreeSet<String> = ctx.members_ips().await?.into_iter().collect();
    let desired = live_addresses(ctx).await?;
    let to_add: Vec<&String> = desired.difference(&current).collect();
    let to_remove: Vec<&String> = current.difference(&desired).collect();
    let pending = to_add.len() + to_remove.len();

    if let Some(ip) = to_add.first() {
        match add_member(ctx, ip).await {
            Ok(()) => {}
            Err(Error::NotReady(reason)) => return Ok(Outcome::Deferred(reason)),
            Err(e) => return Err(e),
        }
    } else if let Some(ip) = to_remove.first() {
        if let Outcome::Deferred(reason) = remove_member(ctx, ip).await? {
            return Ok(Outcome::Deferred(reason));
        }
    }

    if pending > 0 {
        let count = ctx
            .config
            .synchronous_node_count
            .node_count(ctx.members_ips().await?.len());
        supervisor::update_synchronous_node_count(ctx.supervisor.as_ref(), count).await?;
        if pending > 1 {
            return Ok(Outcome::Deferred(format!(
                "{} membership change(s) pending",
                pending - 1
            )));
        }
    }

    ensure_started(ctx).await?;
    Ok(Outcome::Converged)
}
