//! Deterministic multi-deployment simulation
//!
//! This module provides:
//! - fakes for the HA supervisor, the raft admin tool and the workload
//! - [`Simulation`]: several deployments sharing one [`MemoryChannel`],
//!   each member driven by its own [`Dispatcher`]
//!
//! Members run in rounds. A round drains every member's notices and runs
//! one dispatch cycle per member, deferred events first. The simulation has
//! settled once a round neither writes to the channel nor changes any fake.
//!
//! ```rust,ignore
//! let mut sim = Simulation::new();
//! sim.add_member("east", "east/0", "10.0.0.1").await?;
//! sim.add_member("east", "east/1", "10.0.0.2").await?;
//! sim.settle(50).await?;
//! assert!(sim.is_initialised("east").await);
//! ```

pub mod fakes;

pub use fakes::{FakeDeployment, FakeRaftAdmin, FakeSupervisor, FakeWorkload, HostRegistry};

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::arbitration::PromoteRequest;
use crate::channel::keys;
use crate::channel::{ChangeNotice, CoordinationChannel, LinkInfo, LinkKind, MemoryChannel, Partition};
use crate::common::{AgentConfig, AuditLogger, Error, MetricsRegistry, Result};
use crate::context::{Collaborators, Context, MemberStatus};
use crate::dispatch::{events_for, resync_events, Dispatcher, Event, Outcome};
use crate::secrets::MemorySecretStore;

struct SimMember {
    dispatcher: Dispatcher,
    notices: broadcast::Receiver<ChangeNotice>,
    /// The first cycle starts with a tick, like the agent's interval
    ticked: bool,
}

impl SimMember {
    fn ctx(&self) -> &Arc<Context> {
        self.dispatcher.context()
    }

    /// Drain notices into events; returns the events and how many notices
    /// were seen
    async fn pending_events(&mut self) -> Result<(Vec<Event>, usize)> {
        let mut notices = Vec::new();
        let mut lagged = false;
        loop {
            match self.notices.try_recv() {
                Ok(n) => notices.push(n),
                Err(TryRecvError::Lagged(_)) => lagged = true,
                Err(_) => break,
            }
        }
        let seen = notices.len();
        let ctx = self.ctx().clone();
        let roster = ctx.channel.roster().await?;

        let mut events = Vec::new();
        if !self.ticked {
            self.ticked = true;
            events.push(Event::Tick);
        }
        if lagged {
            events.extend(resync_events(&roster, ctx.deployment()));
        } else {
            for notice in &notices {
                for event in events_for(notice, ctx.deployment(), ctx.member(), &roster) {
                    if !events.contains(&event) {
                        events.push(event);
                    }
                }
            }
        }
        Ok((events, seen))
    }
}

/// Configuration used for simulated members: no waiting between retries
pub fn simulation_config(deployment: &str, member: &str, address: &str) -> AgentConfig {
    let mut config = AgentConfig::new(member, deployment, address);
    config.retry_attempts = 2;
    config.retry_initial_backoff_ms = 0;
    config.promotion_wait_attempts = 1;
    config.promotion_wait_interval_ms = 0;
    config
}

pub struct Simulation {
    channel: Arc<MemoryChannel>,
    secrets: Arc<MemorySecretStore>,
    hosts: HostRegistry,
    deployments: BTreeMap<String, Arc<FakeDeployment>>,
    members: Vec<SimMember>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    pub fn new() -> Self {
        Self {
            channel: Arc::new(MemoryChannel::new()),
            secrets: Arc::new(MemorySecretStore::new()),
            hosts: HostRegistry::default(),
            deployments: BTreeMap::new(),
            members: Vec::new(),
        }
    }

    pub fn channel(&self) -> &Arc<MemoryChannel> {
        &self.channel
    }

    pub fn secrets(&self) -> &Arc<MemorySecretStore> {
        &self.secrets
    }

    /// Fake host state of `deployment`, created on first use
    pub fn deployment(&mut self, deployment: &str) -> Arc<FakeDeployment> {
        self.deployments
            .entry(deployment.to_string())
            .or_insert_with(|| FakeDeployment::new(deployment))
            .clone()
    }

    /// Start an agent for `member` and join it to the channel
    pub async fn add_member(
        &mut self,
        deployment: &str,
        member: &str,
        address: &str,
    ) -> Result<Arc<Context>> {
        self.add_member_with(simulation_config(deployment, member, address))
            .await
    }

    pub async fn add_member_with(&mut self, config: AgentConfig) -> Result<Arc<Context>> {
        let fake = self.deployment(&config.deployment);
        fake.add_member(&config.member, &config.address);
        if let Ok(mut hosts) = self.hosts.lock() {
            hosts.insert(config.address.clone(), fake.clone());
        }

        let collaborators = Collaborators {
            channel: self.channel.clone(),
            supervisor: Arc::new(FakeSupervisor::new(fake.clone(), &config.member)),
            raft: Arc::new(FakeRaftAdmin::new(fake.clone())),
            workload: Arc::new(FakeWorkload::new(
                fake.clone(),
                &config.member,
                self.hosts.clone(),
            )),
            secrets: self.secrets.clone(),
        };
        let ctx = Arc::new(Context::new(
            config,
            collaborators,
            Arc::new(AuditLogger::in_memory()),
            Arc::new(MetricsRegistry::new()),
        ));

        let notices = self.channel.subscribe();
        self.channel.join(ctx.deployment(), ctx.member()).await?;
        self.members.push(SimMember {
            dispatcher: Dispatcher::new(ctx.clone()),
            notices,
            ticked: false,
        });
        Ok(ctx)
    }

    /// The member's machine is lost: it leaves the channel and the supervisor
    pub async fn remove_member(&mut self, member: &str) -> Result<()> {
        let idx = self
            .members
            .iter()
            .position(|m| m.ctx().member() == member)
            .ok_or_else(|| Error::Other(format!("unknown member {}", member)))?;
        let removed = self.members.remove(idx);
        let deployment = removed.ctx().deployment().to_string();
        self.channel.depart(member).await?;
        self.deployment(&deployment).remove_member(member);
        Ok(())
    }

    /// Join a witness member; witnesses run no agent here
    pub async fn add_witness(&mut self, deployment: &str, member: &str) -> Result<()> {
        self.channel.join(deployment, member).await
    }

    /// Write `member`'s unit address on its side of `link`
    pub async fn publish_unit_address(&self, link: &str, member: &str, address: &str) -> Result<()> {
        self.channel
            .write(
                member,
                &Partition::LinkMember {
                    link: link.to_string(),
                    member: member.to_string(),
                },
                keys::UNIT_ADDRESS,
                Some(address),
            )
            .await
    }

    pub async fn establish_link(&self, name: &str, kind: LinkKind, a: &str, b: &str) -> Result<()> {
        self.channel
            .establish_link(LinkInfo {
                name: name.to_string(),
                kind,
                deployments: [a.to_string(), b.to_string()],
            })
            .await
    }

    pub async fn break_link(&self, name: &str) -> Result<()> {
        self.channel.break_link(name).await
    }

    /// Write a deployment's epoch as its leader, as an earlier promotion would
    pub async fn set_epoch(&self, deployment: &str, epoch: u64) -> Result<()> {
        let leader = self
            .channel
            .leader(deployment)
            .await?
            .ok_or_else(|| Error::NotReady(format!("{} has no leader", deployment)))?;
        self.channel
            .write(
                &leader,
                &Partition::Deployment(deployment.to_string()),
                keys::PROMOTED_CLUSTER_COUNTER,
                Some(&epoch.to_string()),
            )
            .await
    }

    fn activity(&self) -> usize {
        self.deployments.values().map(|d| d.activity()).sum()
    }

    /// One round; returns how many notices were consumed
    pub async fn step(&mut self) -> Result<usize> {
        let mut seen = 0;
        for member in self.members.iter_mut() {
            let (events, n) = member.pending_events().await?;
            seen += n;
            member.dispatcher.run_cycle(events).await;
        }
        Ok(seen)
    }

    /// Run rounds until nothing changes; returns the rounds used
    pub async fn settle(&mut self, max_rounds: usize) -> Result<usize> {
        for round in 1..=max_rounds {
            let before = (self.channel.write_count(), self.activity());
            let seen = self.step().await?;
            let after = (self.channel.write_count(), self.activity());
            if seen == 0 && before == after {
                return Ok(round);
            }
        }
        Err(Error::Timeout(format!(
            "simulation still changing after {} rounds",
            max_rounds
        )))
    }

    /// Re-run every handler on every member, as after missed notices
    pub async fn resync(&mut self) -> Result<()> {
        let roster = self.channel.roster().await?;
        for member in self.members.iter_mut() {
            let events = resync_events(&roster, member.ctx().deployment());
            member.dispatcher.run_cycle(events).await;
        }
        Ok(())
    }

    /// Periodic tick on every member
    pub async fn tick(&mut self) -> Vec<(String, Outcome)> {
        let mut results = Vec::new();
        for member in self.members.iter_mut() {
            let name = member.ctx().member().to_string();
            for (_, outcome) in member.dispatcher.run_cycle(vec![Event::Tick]).await {
                results.push((name.clone(), outcome));
            }
        }
        results
    }

    fn member_mut(&mut self, member: &str) -> Result<&mut SimMember> {
        self.members
            .iter_mut()
            .find(|m| m.ctx().member() == member)
            .ok_or_else(|| Error::Other(format!("unknown member {}", member)))
    }

    /// Operator action on `member`
    pub async fn act(&mut self, member: &str, event: Event) -> Result<String> {
        self.member_mut(member)?.dispatcher.act(event).await
    }

    pub async fn promote(&mut self, member: &str, request: PromoteRequest) -> Result<String> {
        self.act(member, Event::PromoteRequested { request }).await
    }

    pub fn context(&self, member: &str) -> Option<Arc<Context>> {
        self.members
            .iter()
            .find(|m| m.ctx().member() == member)
            .map(|m| m.ctx().clone())
    }

    pub fn status(&self, member: &str) -> Option<MemberStatus> {
        self.context(member).map(|c| c.status())
    }

    pub fn deferred(&self, member: &str) -> Vec<Event> {
        self.members
            .iter()
            .find(|m| m.ctx().member() == member)
            .map(|m| m.dispatcher.deferred().to_vec())
            .unwrap_or_default()
    }

    pub fn members_of(&self, deployment: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.ctx().deployment() == deployment)
            .map(|m| m.ctx().member().to_string())
            .collect()
    }

    pub async fn read(&self, partition: Partition, key: &str) -> Option<String> {
        self.channel.read(&partition, key).await.ok().flatten()
    }

    pub async fn member_value(&self, member: &str, key: &str) -> Option<String> {
        self.read(Partition::Member(member.to_string()), key).await
    }

    pub async fn deployment_value(&self, deployment: &str, key: &str) -> Option<String> {
        self.read(Partition::Deployment(deployment.to_string()), key)
            .await
    }

    pub async fn is_initialised(&self, deployment: &str) -> bool {
        keys::flag(
            self.deployment_value(deployment, keys::CLUSTER_INITIALISED)
                .await
                .as_deref(),
        )
    }

    pub async fn members_ips(&self, deployment: &str) -> Vec<String> {
        keys::string_list(
            self.deployment_value(deployment, keys::MEMBERS_IPS)
                .await
                .as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_member_bootstraps() {
        let mut sim = Simulation::new();
        sim.add_member("east", "east/0", "10.0.0.1").await.unwrap();
        sim.settle(20).await.unwrap();

        assert!(sim.is_initialised("east").await);
        assert_eq!(sim.members_ips("east").await, vec!["10.0.0.1"]);
        assert!(sim.deployment("east").is_running("east/0"));
    }

    #[tokio::test]
    async fn test_settle_reports_exhaustion() {
        let mut sim = Simulation::new();
        sim.add_member("east", "east/0", "10.0.0.1").await.unwrap();
        assert!(matches!(sim.settle(1).await, Err(Error::Timeout(_))));
    }
}
