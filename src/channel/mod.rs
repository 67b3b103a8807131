//! Coordination channel
//!
//! An eventually-consistent, partitioned key-value store shared by every
//! member of a deployment and, through links, by two deployments:
//! - one partition per deployment, writable only by its elected leader
//! - one partition per member, writable only by that member
//! - one partition per (link, deployment) and per (link, member) with the
//!   same writer rules
//!
//! Every write is announced to all subscribers as a [`ChangeNotice`]. There
//! is no ordering guarantee across partitions.

pub mod file;
pub mod keys;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;

use crate::common::{Error, Result};

pub use file::FileChannel;
pub use memory::MemoryChannel;

/// Capacity of the notice broadcast; slow subscribers see `Lagged` and resync
pub const NOTICE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Partition {
    /// Deployment-wide data, leader-written
    Deployment(String),
    /// Per-member data
    Member(String),
    /// A deployment's side of a link, leader-written
    Link { link: String, deployment: String },
    /// A member's side of a link
    LinkMember { link: String, member: String },
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partition::Deployment(d) => write!(f, "deployment:{}", d),
            Partition::Member(m) => write!(f, "member:{}", m),
            Partition::Link { link, deployment } => write!(f, "link:{}:{}", link, deployment),
            Partition::LinkMember { link, member } => write!(f, "link-member:{}:{}", link, member),
        }
    }
}

/// What a link connects a deployment to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// Cross-cluster disaster-recovery replication
    Replication,
    /// Raft quorum witness
    Witness,
}

/// A link between two deployments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub name: String,
    pub kind: LinkKind,
    pub deployments: [String; 2],
}

impl LinkInfo {
    pub fn involves(&self, deployment: &str) -> bool {
        self.deployments.iter().any(|d| d == deployment)
    }

    /// The other side of the link, seen from `local`
    pub fn remote_of(&self, local: &str) -> Option<&str> {
        match &self.deployments {
            [a, b] if a == local => Some(b.as_str()),
            [a, b] if b == local => Some(a.as_str()),
            _ => None,
        }
    }
}

/// Notification delivered to every subscriber after a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ChangeNotice {
    Written { partition: Partition, key: String },
    MemberJoined { deployment: String, member: String },
    MemberDeparted { deployment: String, member: String },
    LeaderChanged { deployment: String, leader: Option<String> },
    LinkEstablished { link: LinkInfo },
    LinkBroken { link: LinkInfo },
}

/// Members, leaders and links of every deployment sharing the channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    pub members: BTreeMap<String, BTreeSet<String>>,
    pub leaders: BTreeMap<String, String>,
    pub links: BTreeMap<String, LinkInfo>,
}

impl Roster {
    pub fn deployment_of(&self, member: &str) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, ms)| ms.contains(member))
            .map(|(d, _)| d.as_str())
    }

    fn is_leader(&self, deployment: &str, member: &str) -> bool {
        self.leaders.get(deployment).map(String::as_str) == Some(member)
    }

    /// Single-writer-per-partition rule
    pub fn check_writer(&self, caller: &str, partition: &Partition) -> Result<()> {
        let allowed = match partition {
            Partition::Deployment(d) => self.is_leader(d, caller),
            Partition::Member(m) => m == caller,
            Partition::Link { link, deployment } => {
                self.links.get(link).is_some_and(|l| l.involves(deployment))
                    && self.is_leader(deployment, caller)
            }
            Partition::LinkMember { link, member } => {
                member == caller
                    && self.links.get(link).is_some_and(|l| {
                        self.deployment_of(caller).is_some_and(|d| l.involves(d))
                    })
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::Permission {
                caller: caller.to_string(),
                partition: partition.to_string(),
            })
        }
    }

    /// Add a member; the first member of a deployment becomes its leader
    pub fn join(&mut self, deployment: &str, member: &str) -> Vec<ChangeNotice> {
        let mut notices = Vec::new();
        let inserted = self
            .members
            .entry(deployment.to_string())
            .or_default()
            .insert(member.to_string());
        if inserted {
            notices.push(ChangeNotice::MemberJoined {
                deployment: deployment.to_string(),
                member: member.to_string(),
            });
        }
        if !self.leaders.contains_key(deployment) {
            notices.extend(self.elect(deployment));
        }
        notices
    }

    pub fn depart(&mut self, member: &str) -> Vec<ChangeNotice> {
        let Some(deployment) = self.deployment_of(member).map(str::to_string) else {
            return Vec::new();
        };
        if let Some(ms) = self.members.get_mut(&deployment) {
            ms.remove(member);
        }
        let mut notices = vec![ChangeNotice::MemberDeparted {
            deployment: deployment.clone(),
            member: member.to_string(),
        }];
        if self.is_leader(&deployment, member) {
            self.leaders.remove(&deployment);
            notices.extend(self.elect(&deployment));
        }
        notices
    }

    pub fn set_leader(&mut self, deployment: &str, member: &str) -> Result<Vec<ChangeNotice>> {
        let known = self
            .members
            .get(deployment)
            .is_some_and(|ms| ms.contains(member));
        if !known {
            return Err(Error::Channel(format!(
                "{} is not a member of {}",
                member, deployment
            )));
        }
        if self.is_leader(deployment, member) {
            return Ok(Vec::new());
        }
        self.leaders
            .insert(deployment.to_string(), member.to_string());
        Ok(vec![ChangeNotice::LeaderChanged {
            deployment: deployment.to_string(),
            leader: Some(member.to_string()),
        }])
    }

    /// Lowest-named member becomes leader
    fn elect(&mut self, deployment: &str) -> Vec<ChangeNotice> {
        let next = self
            .members
            .get(deployment)
            .and_then(|ms| ms.iter().next().cloned());
        match &next {
            Some(m) => {
                self.leaders.insert(deployment.to_string(), m.clone());
            }
            None => {
                self.leaders.remove(deployment);
            }
        }
        vec![ChangeNotice::LeaderChanged {
            deployment: deployment.to_string(),
            leader: next,
        }]
    }

    pub fn establish_link(&mut self, link: LinkInfo) -> Result<Vec<ChangeNotice>> {
        if link.deployments[0] == link.deployments[1] {
            return Err(Error::Channel(format!(
                "link {} must join two different deployments",
                link.name
            )));
        }
        if let Some(existing) = self.links.get(&link.name) {
            if existing == &link {
                return Ok(Vec::new());
            }
            return Err(Error::Channel(format!("link {} already exists", link.name)));
        }
        self.links.insert(link.name.clone(), link.clone());
        Ok(vec![ChangeNotice::LinkEstablished { link }])
    }

    pub fn break_link(&mut self, name: &str) -> Result<(LinkInfo, Vec<ChangeNotice>)> {
        let link = self
            .links
            .remove(name)
            .ok_or_else(|| Error::UnknownLink(name.to_string()))?;
        Ok((link.clone(), vec![ChangeNotice::LinkBroken { link }]))
    }
}

/// Partitions owned by a link, dropped when it breaks
pub fn link_partitions(link: &LinkInfo, roster: &Roster) -> Vec<Partition> {
    let mut parts = Vec::new();
    for d in &link.deployments {
        parts.push(Partition::Link {
            link: link.name.clone(),
            deployment: d.clone(),
        });
        for m in roster.members.get(d).into_iter().flatten() {
            parts.push(Partition::LinkMember {
                link: link.name.clone(),
                member: m.clone(),
            });
        }
    }
    parts
}

/// Shared key-value store every component reads and writes through
#[async_trait]
pub trait CoordinationChannel: Send + Sync {
    async fn read(&self, partition: &Partition, key: &str) -> Result<Option<String>>;

    async fn read_all(&self, partition: &Partition) -> Result<BTreeMap<String, String>>;

    /// Write (or delete, with `None`) a key. Fails with [`Error::Permission`]
    /// unless `caller` is the partition's current writer.
    async fn write(
        &self,
        caller: &str,
        partition: &Partition,
        key: &str,
        value: Option<&str>,
    ) -> Result<()>;

    async fn roster(&self) -> Result<Roster>;

    async fn join(&self, deployment: &str, member: &str) -> Result<()>;

    async fn depart(&self, member: &str) -> Result<()>;

    async fn set_leader(&self, deployment: &str, member: &str) -> Result<()>;

    async fn establish_link(&self, link: LinkInfo) -> Result<()>;

    async fn break_link(&self, name: &str) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotice>;

    async fn members(&self, deployment: &str) -> Result<Vec<String>> {
        Ok(self
            .roster()
            .await?
            .members
            .get(deployment)
            .map(|ms| ms.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn leader(&self, deployment: &str) -> Result<Option<String>> {
        Ok(self.roster().await?.leaders.get(deployment).cloned())
    }

    async fn links(&self, deployment: &str) -> Result<Vec<LinkInfo>> {
        Ok(self
            .roster()
            .await?
            .links
            .into_values()
            .filter(|l| l.involves(deployment))
            .collect())
    }

    async fn link(&self, name: &str) -> Result<Option<LinkInfo>> {
        Ok(self.roster().await?.links.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(name: &str, a: &str, b: &str) -> LinkInfo {
        LinkInfo {
            name: name.to_string(),
            kind: LinkKind::Replication,
            deployments: [a.to_string(), b.to_string()],
        }
    }

    #[test]
    fn test_first_member_leads() {
        let mut roster = Roster::default();
        roster.join("pg", "pg/1");
        roster.join("pg", "pg/0");
        assert_eq!(roster.leaders.get("pg").unwrap(), "pg/1");

        let notices = roster.depart("pg/1");
        assert!(notices.contains(&ChangeNotice::LeaderChanged {
            deployment: "pg".into(),
            leader: Some("pg/0".into())
        }));
    }

    #[test]
    fn test_writer_rules() {
        let mut roster = Roster::default();
        roster.join("east", "east/0");
        roster.join("east", "east/1");
        roster.join("west", "west/0");
        roster.establish_link(link("dr", "east", "west")).unwrap();

        let dep = Partition::Deployment("east".into());
        assert!(roster.check_writer("east/0", &dep).is_ok());
        assert!(matches!(
            roster.check_writer("east/1", &dep),
            Err(Error::Permission { .. })
        ));

        let own = Partition::Member("east/1".into());
        assert!(roster.check_writer("east/1", &own).is_ok());
        assert!(roster.check_writer("east/0", &own).is_err());

        let east_side = Partition::Link {
            link: "dr".into(),
            deployment: "east".into(),
        };
        assert!(roster.check_writer("east/0", &east_side).is_ok());
        assert!(roster.check_writer("west/0", &east_side).is_err());

        let lm = Partition::LinkMember {
            link: "dr".into(),
            member: "west/0".into(),
        };
        assert!(roster.check_writer("west/0", &lm).is_ok());
        assert!(roster.check_writer("east/0", &lm).is_err());
    }

    #[test]
    fn test_link_remote_of() {
        let l = link("dr", "east", "west");
        assert_eq!(l.remote_of("east"), Some("west"));
        assert_eq!(l.remote_of("west"), Some("east"));
        assert_eq!(l.remote_of("north"), None);
    }

    #[test]
    fn test_establish_link_rejects_self_link() {
        let mut roster = Roster::default();
        assert!(roster.establish_link(link("x", "east", "east")).is_err());
        assert!(roster.establish_link(link("x", "east", "west")).is_ok());
        assert!(roster.establish_link(link("x", "east", "west")).unwrap().is_empty());
        assert!(roster.establish_link(link("x", "east", "north")).is_err());
    }
}
