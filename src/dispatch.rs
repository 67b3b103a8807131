//! Event dispatch
//!
//! Each member handles one event at a time. A handler ends in one of three
//! outcomes: converged, deferred (re-run at the start of the next cycle) or
//! failed (blocked status, not retried automatically). Errors never cross
//! the dispatch boundary.

use std::sync::Arc;
use std::time::Instant;

use crate::arbitration::{self, PromoteRequest};
use crate::channel::{ChangeNotice, LinkInfo, LinkKind, Partition, Roster};
use crate::channel::keys;
use crate::common::{Error, Result};
use crate::context::{Context, StatusKind};
use crate::{membership, witness};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Converged,
    Deferred(String),
    Failed(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Converged => "converged",
            Outcome::Deferred(_) => "deferred",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// Closed set of events a member reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Periodic status update
    Tick,
    /// This member became the deployment leader
    LeaderElected,
    MembershipChanged,
    LinkChanged { link: String },
    LinkBroken { link: LinkInfo },
    WitnessJoined { link: String },
    WitnessChanged { link: String },
    WitnessBroken { link: LinkInfo },
    PromoteRequested { request: PromoteRequest },
    CreateReplication,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Tick => "tick",
            Event::LeaderElected => "leader_elected",
            Event::MembershipChanged => "membership_changed",
            Event::LinkChanged { .. } => "link_changed",
            Event::LinkBroken { .. } => "link_broken",
            Event::WitnessJoined { .. } => "witness_joined",
            Event::WitnessChanged { .. } => "witness_changed",
            Event::WitnessBroken { .. } => "witness_broken",
            Event::PromoteRequested { .. } => "promote_requested",
            Event::CreateReplication => "create_replication",
        }
    }

    /// Operator actions are answered once and never deferred
    pub fn is_action(&self) -> bool {
        matches!(self, Event::PromoteRequested { .. } | Event::CreateReplication)
    }
}

/// Events a notice triggers on `member` of `deployment`
pub fn events_for(notice: &ChangeNotice, deployment: &str, member: &str, roster: &Roster) -> Vec<Event> {
    let replication_links = || -> Vec<Event> {
        roster
            .links
            .values()
            .filter(|l| l.kind == LinkKind::Replication && l.involves(deployment))
            .map(|l| Event::LinkChanged {
                link: l.name.clone(),
            })
            .collect()
    };
    let in_deployment = |m: &str| roster.deployment_of(m) == Some(deployment);

    match notice {
        ChangeNotice::Written { partition, key } => match partition {
            Partition::Deployment(d) if d == deployment => match key.as_str() {
                keys::MEMBERS_IPS
                | keys::WITNESS_ADDRESS
                | keys::CREDENTIALS_SECRET_ID
                | keys::CLUSTER_INITIALISED => vec![Event::MembershipChanged],
                keys::PROMOTED_CLUSTER_COUNTER => replication_links(),
                _ => Vec::new(),
            },
            Partition::Member(m) if in_deployment(m.as_str()) => match key.as_str() {
                keys::IP | keys::IP_TO_REMOVE => vec![Event::MembershipChanged],
                keys::UNIT_PROMOTED_CLUSTER_COUNTER | keys::STOPPED | keys::REINITIALISED_COUNTER => {
                    replication_links()
                }
                _ => Vec::new(),
            },
            Partition::Link { link, deployment: side } => match roster.links.get(link) {
                Some(l) if l.involves(deployment) => match l.kind {
                    LinkKind::Replication => vec![Event::LinkChanged { link: link.clone() }],
                    LinkKind::Witness if side != deployment => {
                        vec![Event::WitnessChanged { link: link.clone() }]
                    }
                    LinkKind::Witness => Vec::new(),
                },
                _ => Vec::new(),
            },
            Partition::LinkMember { link, member: writer } => match roster.links.get(link) {
                Some(l) if l.involves(deployment) && !in_deployment(writer.as_str()) => match l.kind {
                    LinkKind::Replication => vec![Event::LinkChanged { link: link.clone() }],
                    LinkKind::Witness => vec![Event::WitnessChanged { link: link.clone() }],
                },
                _ => Vec::new(),
            },
            _ => Vec::new(),
        },
        ChangeNotice::MemberJoined { deployment: d, .. }
        | ChangeNotice::MemberDeparted { deployment: d, .. }
            if d == deployment =>
        {
            vec![Event::MembershipChanged]
        }
        ChangeNotice::LeaderChanged {
            deployment: d,
            leader: Some(l),
        } if d == deployment && l == member => vec![Event::LeaderElected],
        ChangeNotice::LinkEstablished { link } if link.involves(deployment) => match link.kind {
            LinkKind::Replication => vec![Event::LinkChanged {
                link: link.name.clone(),
            }],
            LinkKind::Witness => vec![Event::WitnessJoined {
                link: link.name.clone(),
            }],
        },
        ChangeNotice::LinkBroken { link } if link.involves(deployment) => match link.kind {
            LinkKind::Replication => vec![Event::LinkBroken { link: link.clone() }],
            LinkKind::Witness => vec![Event::WitnessBroken { link: link.clone() }],
        },
        _ => Vec::new(),
    }
}

/// Events re-running every handler, used after missed notices
pub fn resync_events(roster: &Roster, deployment: &str) -> Vec<Event> {
    let mut events = vec![Event::Tick, Event::MembershipChanged];
    for link in roster.links.values().filter(|l| l.involves(deployment)) {
        events.push(match link.kind {
            LinkKind::Replication => Event::LinkChanged {
                link: link.name.clone(),
            },
            LinkKind::Witness => Event::WitnessJoined {
                link: link.name.clone(),
            },
        });
    }
    events
}

fn push_unique(events: &mut Vec<Event>, event: Event) {
    if !events.contains(&event) {
        events.push(event);
    }
}

/// First outcome that is not converged
fn first_pending(outcomes: Vec<Outcome>) -> Outcome {
    outcomes
        .into_iter()
        .find(|o| *o != Outcome::Converged)
        .unwrap_or(Outcome::Converged)
}

pub struct Dispatcher {
    ctx: Arc<Context>,
    deferred: Vec<Event>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            deferred: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn deferred(&self) -> &[Event] {
        &self.deferred
    }

    /// Run deferred events, then `events`, each at most once
    pub async fn run_cycle(&mut self, events: Vec<Event>) -> Vec<(Event, Outcome)> {
        let mut queue = std::mem::take(&mut self.deferred);
        for event in events {
            push_unique(&mut queue, event);
        }

        let mut results = Vec::with_capacity(queue.len());
        for event in queue {
            let outcome = self.dispatch(&event).await;
            if matches!(outcome, Outcome::Deferred(_)) && !event.is_action() {
                push_unique(&mut self.deferred, event.clone());
            }
            results.push((event, outcome));
        }
        self.ctx.metrics.deferred_queue.set(self.deferred.len() as u64);
        results
    }

    /// Run one handler to completion
    pub async fn dispatch(&self, event: &Event) -> Outcome {
        let start = Instant::now();
        let outcome = match self.handle(event).await {
            Ok(outcome) => outcome,
            Err(e) => self.absorb(event, e),
        };
        self.ctx
            .metrics
            .record_dispatch(event.kind(), outcome.label(), start.elapsed());

        match &outcome {
            Outcome::Converged => {
                tracing::debug!(member = %self.ctx.member(), event = event.kind(), "Converged")
            }
            Outcome::Deferred(reason) => {
                tracing::info!(member = %self.ctx.member(), event = event.kind(), "Deferred: {}", reason)
            }
            Outcome::Failed(reason) => {
                tracing::error!(member = %self.ctx.member(), event = event.kind(), "Failed: {}", reason);
                self.ctx.set_status(StatusKind::Blocked, reason.clone());
            }
        }
        outcome
    }

    /// Operator action: answer with the result, then re-run the link
    /// handlers right away so a promotion takes effect without waiting
    pub async fn act(&mut self, event: Event) -> Result<String> {
        let start = Instant::now();
        let result = match &event {
            Event::PromoteRequested { request } => {
                arbitration::promote_to_primary(&self.ctx, *request).await
            }
            Event::CreateReplication => arbitration::create_replication(&self.ctx).await,
            other => Err(Error::InvalidConfig(format!(
                "{} is not an operator action",
                other.kind()
            ))),
        };
        let label = if result.is_ok() { "converged" } else { "failed" };
        self.ctx
            .metrics
            .record_dispatch(event.kind(), label, start.elapsed());

        if result.is_ok() {
            let links = match self.ctx.channel.roster().await {
                Ok(roster) => roster
                    .links
                    .values()
                    .filter(|l| l.kind == LinkKind::Replication && l.involves(self.ctx.deployment()))
                    .map(|l| Event::LinkChanged {
                        link: l.name.clone(),
                    })
                    .collect(),
                Err(_) => Vec::new(),
            };
            self.run_cycle(links).await;
        }
        result
    }

    /// Convert a handler error into an outcome
    fn absorb(&self, event: &Event, error: Error) -> Outcome {
        match error {
            Error::NotReady(reason) => Outcome::Deferred(reason),
            // Leadership moved while the handler ran
            Error::Permission { .. } => Outcome::Deferred(error.to_string()),
            other => {
                tracing::warn!(event = event.kind(), "Handler error: {}", other);
                self.ctx.set_status(StatusKind::Blocked, other.to_string());
                Outcome::Deferred(other.to_string())
            }
        }
    }

    async fn handle(&self, event: &Event) -> Result<Outcome> {
        let ctx = self.ctx.as_ref();
        match event {
            Event::Tick => {
                let outcome = membership::bootstrap(ctx).await?;
                let state = arbitration::state(ctx).await?;
                tracing::debug!(member = %ctx.member(), ?state, "Status tick");
                Ok(outcome)
            }
            Event::LeaderElected => {
                tracing::info!(member = %ctx.member(), "Elected deployment leader");
                let mut outcomes = vec![
                    membership::bootstrap(ctx).await?,
                    membership::reconcile(ctx).await?,
                ];
                for link in ctx.channel.links(ctx.deployment()).await? {
                    outcomes.push(match link.kind {
                        LinkKind::Replication => arbitration::on_link_changed(ctx, &link.name).await?,
                        LinkKind::Witness => witness::on_witness_joined(ctx, &link.name).await?,
                    });
                }
                Ok(first_pending(outcomes))
            }
            Event::MembershipChanged => {
                let outcomes = vec![
                    membership::reconcile(ctx).await?,
                    witness::on_membership_changed(ctx).await?,
                ];
                Ok(first_pending(outcomes))
            }
            Event::LinkChanged { link } => arbitration::on_link_changed(ctx, link).await,
            Event::LinkBroken { link } => arbitration::on_link_broken(ctx, link).await,
            Event::WitnessJoined { link } => witness::on_witness_joined(ctx, link).await,
            Event::WitnessChanged { link } => witness::on_witness_changed(ctx, link).await,
            Event::WitnessBroken { link } => witness::on_witness_broken(ctx, link).await,
            Event::PromoteRequested { request } => {
                match arbitration::promote_to_primary(ctx, *request).await {
                    Ok(_) => Ok(Outcome::Converged),
                    Err(e) => Ok(Outcome::Failed(e.to_string())),
                }
            }
            Event::CreateReplication => match arbitration::create_replication(ctx).await {
                Ok(_) => Ok(Outcome::Converged),
                Err(e) => Ok(Outcome::Failed(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Roster {
        let mut roster = Roster::default();
        roster.join("east", "east/0");
        roster.join("east", "east/1");
        roster.join("west", "west/0");
        roster.join("witness", "witness/0");
        roster
            .establish_link(LinkInfo {
                name: "dr".into(),
                kind: LinkKind::Replication,
                deployments: ["east".into(), "west".into()],
            })
            .unwrap();
        roster
            .establish_link(LinkInfo {
                name: "quorum".into(),
                kind: LinkKind::Witness,
                deployments: ["east".into(), "witness".into()],
            })
            .unwrap();
        roster
    }

    fn written(partition: Partition, key: &str) -> ChangeNotice {
        ChangeNotice::Written {
            partition,
            key: key.to_string(),
        }
    }

    #[test]
    fn test_member_writes_map_to_events() {
        let roster = roster();
        let ip = written(Partition::Member("east/1".into()), keys::IP);
        assert_eq!(
            events_for(&ip, "east", "east/0", &roster),
            vec![Event::MembershipChanged]
        );
        assert!(events_for(&ip, "west", "west/0", &roster).is_empty());

        let ack = written(
            Partition::Member("east/1".into()),
            keys::UNIT_PROMOTED_CLUSTER_COUNTER,
        );
        assert_eq!(
            events_for(&ack, "east", "east/0", &roster),
            vec![Event::LinkChanged { link: "dr".into() }]
        );
    }

    #[test]
    fn test_link_writes_map_to_events() {
        let roster = roster();
        let remote_side = written(
            Partition::Link {
                link: "dr".into(),
                deployment: "west".into(),
            },
            keys::PROMOTED_CLUSTER_COUNTER,
        );
        assert_eq!(
            events_for(&remote_side, "east", "east/1", &roster),
            vec![Event::LinkChanged { link: "dr".into() }]
        );

        let own_witness_side = written(
            Partition::Link {
                link: "quorum".into(),
                deployment: "east".into(),
            },
            keys::RAFT_PORT,
        );
        assert!(events_for(&own_witness_side, "east", "east/0", &roster).is_empty());

        let witness_address = written(
            Partition::LinkMember {
                link: "quorum".into(),
                member: "witness/0".into(),
            },
            keys::UNIT_ADDRESS,
        );
        assert_eq!(
            events_for(&witness_address, "east", "east/0", &roster),
            vec![Event::WitnessChanged {
                link: "quorum".into()
            }]
        );
    }

    #[test]
    fn test_leadership_and_links() {
        let roster = roster();
        let elected = ChangeNotice::LeaderChanged {
            deployment: "east".into(),
            leader: Some("east/1".into()),
        };
        assert_eq!(
            events_for(&elected, "east", "east/1", &roster),
            vec![Event::LeaderElected]
        );
        assert!(events_for(&elected, "east", "east/0", &roster).is_empty());

        let quorum = roster.links["quorum"].clone();
        assert_eq!(
            events_for(
                &ChangeNotice::LinkEstablished { link: quorum.clone() },
                "east",
                "east/0",
                &roster
            ),
            vec![Event::WitnessJoined {
                link: "quorum".into()
            }]
        );
        assert_eq!(
            events_for(
                &ChangeNotice::LinkBroken { link: quorum.clone() },
                "east",
                "east/0",
                &roster
            ),
            vec![Event::WitnessBroken { link: quorum }]
        );
    }

    #[test]
    fn test_resync_covers_links() {
        let events = resync_events(&roster(), "east");
        assert!(events.contains(&Event::LinkChanged { link: "dr".into() }));
        assert!(events.contains(&Event::WitnessJoined {
            link: "quorum".into()
        }));
        assert_eq!(resync_events(&roster(), "west").len(), 3);
    }
}
