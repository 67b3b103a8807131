//! In-process coordination channel
//!
//! All members of a simulation share one `MemoryChannel` behind an `Arc`.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::broadcast;

use super::{
    link_partitions, ChangeNotice, CoordinationChannel, LinkInfo, Partition, Roster,
    NOTICE_CAPACITY,
};
use crate::common::{Error, Result};

#[derive(Default)]
struct MemoryState {
    roster: Roster,
    data: HashMap<Partition, BTreeMap<String, String>>,
    writes: u64,
}

pub struct MemoryChannel {
    state: Mutex<MemoryState>,
    notices: broadcast::Sender<ChangeNotice>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        let (notices, _rx) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            notices,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Channel("channel state poisoned".into()))
    }

    fn announce(&self, notices: Vec<ChangeNotice>) {
        for n in notices {
            // No subscribers is fine
            let _ = self.notices.send(n);
        }
    }

    /// Number of accepted writes since creation
    pub fn write_count(&self) -> u64 {
        self.lock().map(|s| s.writes).unwrap_or(0)
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationChannel for MemoryChannel {
    async fn read(&self, partition: &Partition, key: &str) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(state.data.get(partition).and_then(|p| p.get(key)).cloned())
    }

    async fn read_all(&self, partition: &Partition) -> Result<BTreeMap<String, String>> {
        let state = self.lock()?;
        Ok(state.data.get(partition).cloned().unwrap_or_default())
    }

    async fn write(
        &self,
        caller: &str,
        partition: &Partition,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        {
            let mut state = self.lock()?;
            state.roster.check_writer(caller, partition)?;
            let entries = state.data.entry(partition.clone()).or_default();
            match value {
                Some(v) => {
                    entries.insert(key.to_string(), v.to_string());
                }
                None => {
                    entries.remove(key);
                }
            }
            state.writes += 1;
        }
        self.announce(vec![ChangeNotice::Written {
            partition: partition.clone(),
            key: key.to_string(),
        }]);
        Ok(())
    }

    async fn roster(&self) -> Result<Roster> {
        Ok(self.lock()?.roster.clone())
    }

    async fn join(&self, deployment: &str, member: &str) -> Result<()> {
        let notices = self.lock()?.roster.join(deployment, member);
        self.announce(notices);
        Ok(())
    }

    async fn depart(&self, member: &str) -> Result<()> {
        let notices = {
            let mut state = self.lock()?;
            let notices = state.roster.depart(member);
            state.data.remove(&Partition::Member(member.to_string()));
            notices
        };
        self.announce(notices);
        Ok(())
    }

    async fn set_leader(&self, deployment: &str, member: &str) -> Result<()> {
        let notices = self.lock()?.roster.set_leader(deployment, member)?;
        self.announce(notices);
        Ok(())
    }

    async fn establish_link(&self, link: LinkInfo) -> Result<()> {
        let notices = self.lock()?.roster.establish_link(link)?;
        self.announce(notices);
        Ok(())
    }

    async fn break_link(&self, name: &str) -> Result<()> {
        let notices = {
            let mut state = self.lock()?;
            let (link, notices) = state.roster.break_link(name)?;
            for p in link_partitions(&link, &state.roster) {
                state.data.remove(&p);
            }
            notices
        };
        self.announce(notices);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.notices.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LinkKind;

    #[tokio::test]
    async fn test_write_and_notify() {
        let channel = MemoryChannel::new();
        channel.join("pg", "pg/0").await.unwrap();
        channel.join("pg", "pg/1").await.unwrap();
        let mut rx = channel.subscribe();

        let dep = Partition::Deployment("pg".into());
        channel
            .write("pg/0", &dep, "members-ips", Some("[]"))
            .await
            .unwrap();
        assert_eq!(
            channel.read(&dep, "members-ips").await.unwrap().as_deref(),
            Some("[]")
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ChangeNotice::Written {
                partition: dep.clone(),
                key: "members-ips".into()
            }
        );

        let err = channel.write("pg/1", &dep, "members-ips", Some("[]")).await;
        assert!(matches!(err, Err(Error::Permission { .. })));
        assert_eq!(channel.write_count(), 1);

        channel.write("pg/0", &dep, "members-ips", None).await.unwrap();
        assert!(channel.read(&dep, "members-ips").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_break_link_drops_link_data() {
        let channel = MemoryChannel::new();
        channel.join("east", "east/0").await.unwrap();
        channel.join("west", "west/0").await.unwrap();
        channel
            .establish_link(LinkInfo {
                name: "dr".into(),
                kind: LinkKind::Replication,
                deployments: ["east".into(), "west".into()],
            })
            .await
            .unwrap();

        let side = Partition::Link {
            link: "dr".into(),
            deployment: "east".into(),
        };
        channel.write("east/0", &side, "k", Some("v")).await.unwrap();
        assert_eq!(channel.links("west").await.unwrap().len(), 1);

        channel.break_link("dr").await.unwrap();
        assert!(channel.read_all(&side).await.unwrap().is_empty());
        assert!(channel.links("west").await.unwrap().is_empty());
        assert!(channel.write("east/0", &side, "k", Some("v")).await.is_err());
    }
}
