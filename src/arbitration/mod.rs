//! Cross-cluster replication arbitration
//!
//! Two deployments linked for disaster recovery share no consensus store.
//! Each side's leader publishes a `promoted-cluster-counter` (epoch) in its
//! link partition; the side holding the highest epoch is the primary
//! deployment. Epochs only grow through an explicit promotion, which always
//! writes `max(local, remote) + 1`.

pub mod link;
pub mod promote;
pub mod takeover;

use serde::{Deserialize, Serialize};

use crate::channel::keys;
use crate::channel::{LinkInfo, LinkKind, Partition};
use crate::common::Result;
use crate::context::Context;
use crate::supervisor::StandbySettings;

pub use link::{on_link_broken, on_link_changed};
pub use promote::{create_replication, promote_to_primary, PromoteRequest, PromoteScope};

/// What the primary side publishes for its standby
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryClusterData {
    pub endpoint: String,
    #[serde(rename = "secret-id")]
    pub secret_id: String,
    #[serde(rename = "system-id")]
    pub system_id: String,
    #[serde(rename = "engine-version", default)]
    pub engine_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArbitrationState {
    NoLink,
    Unarbitrated,
    LocalPrimary,
    RemotePrimary,
    /// Local epoch written, promotion not yet confirmed by our supervisor
    Promoting,
}

/// Side holding the highest epoch. Nobody is primary before the first
/// promotion; equal epochs go to the deployment whose name sorts first so
/// both sides agree.
pub fn primary_side(local: &str, local_epoch: u64, remote: &str, remote_epoch: u64) -> Option<Side> {
    if local_epoch == 0 && remote_epoch == 0 {
        return None;
    }
    let side = match local_epoch.cmp(&remote_epoch) {
        std::cmp::Ordering::Greater => Side::Local,
        std::cmp::Ordering::Less => Side::Remote,
        std::cmp::Ordering::Equal if local < remote => Side::Local,
        std::cmp::Ordering::Equal => Side::Remote,
    };
    Some(side)
}

/// Both sides of a replication link as read from the channel
#[derive(Debug, Clone)]
pub struct LinkView {
    pub link: LinkInfo,
    pub local: String,
    pub remote: String,
    pub local_epoch: u64,
    pub remote_epoch: u64,
    pub local_data: Option<PrimaryClusterData>,
    pub remote_data: Option<PrimaryClusterData>,
    pub local_confirmed: u64,
    pub remote_confirmed: u64,
}

fn parse_data(value: Option<String>) -> Option<PrimaryClusterData> {
    value.and_then(|v| serde_json::from_str(&v).ok())
}

impl LinkView {
    pub async fn load(ctx: &Context, link: LinkInfo) -> Result<Self> {
        let local = ctx.deployment().to_string();
        let remote = link.remote_of(&local).unwrap_or_default().to_string();
        let local_side = Partition::Link {
            link: link.name.clone(),
            deployment: local.clone(),
        };
        let remote_side = Partition::Link {
            link: link.name.clone(),
            deployment: remote.clone(),
        };

        let local_part = ctx.channel.read_all(&local_side).await?;
        let remote_part = ctx.channel.read_all(&remote_side).await?;
        let deployment_epoch = keys::counter(
            ctx.read_deployment(keys::PROMOTED_CLUSTER_COUNTER)
                .await?
                .as_deref(),
        );
        let get = |part: &std::collections::BTreeMap<String, String>, key: &str| {
            part.get(key).cloned()
        };

        Ok(Self {
            local_epoch: deployment_epoch.max(keys::counter(
                get(&local_part, keys::PROMOTED_CLUSTER_COUNTER).as_deref(),
            )),
            remote_epoch: keys::counter(get(&remote_part, keys::PROMOTED_CLUSTER_COUNTER).as_deref()),
            local_data: parse_data(get(&local_part, keys::PRIMARY_CLUSTER_DATA)),
            remote_data: parse_data(get(&remote_part, keys::PRIMARY_CLUSTER_DATA)),
            local_confirmed: keys::counter(
                get(&local_part, keys::PROMOTED_CLUSTER_CONFIRMED).as_deref(),
            ),
            remote_confirmed: keys::counter(
                get(&remote_part, keys::PROMOTED_CLUSTER_CONFIRMED).as_deref(),
            ),
            link,
            local,
            remote,
        })
    }

    pub fn highest(&self) -> u64 {
        self.local_epoch.max(self.remote_epoch)
    }

    pub fn primary(&self) -> Option<Side> {
        primary_side(&self.local, self.local_epoch, &self.remote, self.remote_epoch)
    }

    pub fn state(&self) -> ArbitrationState {
        match self.primary() {
            None => ArbitrationState::Unarbitrated,
            Some(Side::Local) if self.local_confirmed < self.local_epoch => {
                ArbitrationState::Promoting
            }
            Some(Side::Local) => ArbitrationState::LocalPrimary,
            Some(Side::Remote) => ArbitrationState::RemotePrimary,
        }
    }

    pub fn local_partition(&self) -> Partition {
        Partition::Link {
            link: self.link.name.clone(),
            deployment: self.local.clone(),
        }
    }
}

/// The replication link this deployment takes part in, if any
pub async fn replication_link(ctx: &Context) -> Result<Option<LinkInfo>> {
    Ok(ctx
        .channel
        .links(ctx.deployment())
        .await?
        .into_iter()
        .find(|l| l.kind == LinkKind::Replication))
}

pub async fn current_view(ctx: &Context) -> Result<Option<LinkView>> {
    match replication_link(ctx).await? {
        Some(link) => Ok(Some(LinkView::load(ctx, link).await?)),
        None => Ok(None),
    }
}

pub async fn state(ctx: &Context) -> Result<ArbitrationState> {
    Ok(current_view(ctx)
        .await?
        .map(|v| v.state())
        .unwrap_or(ArbitrationState::NoLink))
}

/// The linked deployment holds the highest epoch
pub async fn is_standby_designate(ctx: &Context) -> Result<bool> {
    Ok(current_view(ctx)
        .await?
        .is_some_and(|v| v.primary() == Some(Side::Remote)))
}

/// Standby upstream (once this member reinitialised for the current epoch)
/// and the remote members allowed to replicate from us
pub async fn replication_render_inputs(
    ctx: &Context,
) -> Result<(Option<StandbySettings>, Vec<String>)> {
    let Some(view) = current_view(ctx).await? else {
        return Ok((None, Vec::new()));
    };
    match view.primary() {
        Some(Side::Remote) => {
            let reinitialised = keys::counter(
                ctx.read_own(keys::REINITIALISED_COUNTER)
                    .await?
                    .as_deref(),
            );
            let standby = view
                .remote_data
                .as_ref()
                .filter(|_| reinitialised == view.highest())
                .and_then(|d| StandbySettings::from_endpoint(&d.endpoint));
            Ok((standby, Vec::new()))
        }
        Some(Side::Local) => {
            let mut hosts = Vec::new();
            for member in ctx.channel.members(&view.remote).await? {
                let part = Partition::LinkMember {
                    link: view.link.name.clone(),
                    member,
                };
                if let Some(addr) = ctx.channel.read(&part, keys::UNIT_ADDRESS).await? {
                    hosts.push(addr);
                }
            }
            Ok((None, hosts))
        }
        None => Ok((None, Vec::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_side() {
        assert_eq!(primary_side("east", 0, "west", 0), None);
        assert_eq!(primary_side("east", 3, "west", 0), Some(Side::Local));
        assert_eq!(primary_side("east", 3, "west", 4), Some(Side::Remote));
        assert_eq!(primary_side("east", 2, "west", 2), Some(Side::Local));
        assert_eq!(primary_side("west", 2, "east", 2), Some(Side::Remote));
    }

    #[test]
    fn test_primary_cluster_data_wire_names() {
        let data = PrimaryClusterData {
            endpoint: "10.0.0.1:5432".into(),
            secret_id: "secret:abc".into(),
            system_id: "7301947462870211345".into(),
            engine_version: "16".into(),
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["secret-id"], "secret:abc");
        assert_eq!(value["system-id"], "7301947462870211345");

        let old: PrimaryClusterData = serde_json::from_str(
            r#"{"endpoint": "h:5432", "secret-id": "s", "system-id": "1"}"#,
        )
        .unwrap();
        assert!(old.engine_version.is_empty());
    }
}
