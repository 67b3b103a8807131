//! Quorum witness integration
//!
//! A witness holds no data and only votes in the raft group, so that a
//! two-member deployment can fail over safely. The deployment leader shares
//! the raft password with it and admits it into the running raft group.

use crate::channel::keys;
use crate::channel::{LinkInfo, LinkKind, Partition};
use crate::common::{AuditEventType, Result};
use crate::context::Context;
use crate::dispatch::Outcome;
use crate::secrets::SharedSecret;

async fn witness_link(ctx: &Context, name: &str) -> Result<Option<LinkInfo>> {
    Ok(ctx
        .channel
        .link(name)
        .await?
        .filter(|l| l.kind == LinkKind::Witness && l.involves(ctx.deployment())))
}

fn own_side(ctx: &Context, link: &LinkInfo) -> Partition {
    Partition::Link {
        link: link.name.clone(),
        deployment: ctx.deployment().to_string(),
    }
}

/// Share the raft secret and our endpoints with a newly linked witness
pub async fn on_witness_joined(ctx: &Context, name: &str) -> Result<Outcome> {
    let Some(link) = witness_link(ctx, name).await? else {
        return Ok(Outcome::Converged);
    };
    if !ctx.is_leader().await? {
        return Ok(Outcome::Converged);
    }
    if !ctx.is_initialised().await? {
        return Ok(Outcome::Deferred(
            "cluster not initialised, witness must wait".into(),
        ));
    }
    let Some(credentials) = ctx.credentials().await? else {
        return Ok(Outcome::Deferred("deployment credentials not created yet".into()));
    };
    let witness = link.remote_of(ctx.deployment()).unwrap_or_default().to_string();
    let side = own_side(ctx, &link);

    let secret_id = witness_secret_id(ctx, &side, &credentials, &witness).await?;

    let ips = ctx.members_ips().await?;
    let endpoints: Vec<String> = ips
        .iter()
        .map(|ip| format!("{}:{}", ip, ctx.config.database_port))
        .collect();
    let endpoints = keys::encode_list(&endpoints);
    let partners = keys::encode_list(&ips);
    let raft_port = ctx.config.raft_port.to_string();
    let entries = [
        (keys::RAFT_SECRET_ID, secret_id.as_str()),
        (keys::PG_ENDPOINTS, endpoints.as_str()),
        (keys::RAFT_PARTNER_ADDRS, partners.as_str()),
        (keys::RAFT_PORT, raft_port.as_str()),
        (keys::CLUSTER_NAME, ctx.deployment()),
    ];
    for (key, value) in entries {
        ctx.write_if_changed(&side, key, Some(value)).await?;
    }

    sync_witness(ctx, &link).await
}

/// Id of a secret holding the deployment's current raft password, issuing a
/// new one when there is none or the password changed
async fn witness_secret_id(
    ctx: &Context,
    side: &Partition,
    credentials: &SharedSecret,
    witness: &str,
) -> Result<String> {
    let wanted = credentials.raft_only();
    if let Some(id) = ctx.channel.read(side, keys::RAFT_SECRET_ID).await? {
        match ctx.secrets.fetch(&id, ctx.deployment()).await {
            Ok(shared) if shared == wanted => return Ok(id),
            Ok(_) => tracing::info!(witness = %witness, "Raft password changed, reissuing the witness secret"),
            Err(e) => tracing::warn!(witness = %witness, "Witness secret {} unreadable, reissuing: {}", id, e),
        }
    }
    let id = ctx.secrets.create(ctx.deployment(), &wanted).await?;
    ctx.secrets.grant(&id, witness).await?;
    ctx.audit.log_event(
        AuditEventType::SecretGranted,
        ctx.member(),
        Some(witness.to_string()),
        "raft secret granted to witness",
        None,
    );
    Ok(id)
}

pub async fn on_witness_changed(ctx: &Context, name: &str) -> Result<Outcome> {
    match witness_link(ctx, name).await? {
        Some(link) => sync_witness(ctx, &link).await,
        None => Ok(Outcome::Converged),
    }
}

/// Address the witness advertised on the link, as `addr:raftPort`
async fn witness_raft_addr(ctx: &Context, link: &LinkInfo) -> Result<Option<String>> {
    let Some(witness) = link.remote_of(ctx.deployment()) else {
        return Ok(None);
    };
    for member in ctx.channel.members(witness).await? {
        let part = Partition::LinkMember {
            link: link.name.clone(),
            member,
        };
        if let Some(addr) = ctx.channel.read(&part, keys::UNIT_ADDRESS).await? {
            return Ok(Some(ctx.raft_addr(&addr)));
        }
    }
    Ok(None)
}

/// Leader: keep the raft group equal to the data members plus the witness
async fn sync_witness(ctx: &Context, link: &LinkInfo) -> Result<Outcome> {
    if !ctx.is_leader().await? {
        return Ok(Outcome::Converged);
    }
    if !ctx.is_initialised().await? {
        return Ok(Outcome::Deferred("cluster not initialised".into()));
    }
    let Some(witness) = witness_raft_addr(ctx, link).await? else {
        tracing::debug!(link = %link.name, "Witness has not published its address yet");
        return Ok(Outcome::Converged);
    };

    if let Err(e) = ctx.add_raft_member(&witness).await {
        return Ok(Outcome::Deferred(format!(
            "could not add witness {} to the raft group: {}",
            witness, e
        )));
    }
    for ip in ctx.members_ips().await? {
        if ip == ctx.config.address {
            continue;
        }
        let addr = ctx.raft_addr(&ip);
        if let Err(e) = ctx.add_raft_member(&addr).await {
            return Ok(Outcome::Deferred(format!(
                "could not add {} to the raft group: {}",
                addr, e
            )));
        }
    }
    ctx.set_deployment(keys::WITNESS_ADDRESS, Some(&witness))
        .await?;
    Ok(Outcome::Converged)
}

/// Leader: drop the witness from the raft group and the configuration
pub async fn on_witness_broken(ctx: &Context, link: &LinkInfo) -> Result<Outcome> {
    if !ctx.is_leader().await? {
        return Ok(Outcome::Converged);
    }
    if let Some(addr) = ctx.read_deployment(keys::WITNESS_ADDRESS).await? {
        if let Err(e) = ctx.remove_raft_member(&addr).await {
            tracing::warn!(link = %link.name, "Witness removal failed, continuing: {}", e);
        }
        ctx.set_deployment(keys::WITNESS_ADDRESS, None).await?;
    }
    Ok(Outcome::Converged)
}

/// Re-share and re-sync every witness link after the data members or the
/// credentials changed
pub async fn on_membership_changed(ctx: &Context) -> Result<Outcome> {
    for link in ctx.channel.links(ctx.deployment()).await? {
        if link.kind != LinkKind::Witness {
            continue;
        }
        let outcome = on_witness_joined(ctx, &link.name).await?;
        if outcome != Outcome::Converged {
            return Ok(outcome);
        }
    }
    Ok(Outcome::Converged)
}
