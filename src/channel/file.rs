//! File-backed coordination channel
//!
//! A shared directory (e.g. a network mount visible to every member) holds:
//! - `roster.json`: members, leaders and links
//! - `partitions/<id>.json`: one JSON object per partition
//!
//! Documents are replaced atomically (write to a temp file, then rename).
//! Notices for writes made by other processes are produced by polling.
//! Roster updates hold `roster.lock`, which records its holder; a lock older
//! than `STALE_LOCK_AGE` belongs to a crashed member and is broken.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use super::{
    link_partitions, ChangeNotice, CoordinationChannel, LinkInfo, Partition, Roster,
    NOTICE_CAPACITY,
};
use crate::common::{Error, Result};

const ROSTER_FILE: &str = "roster.json";
const ROSTER_LOCK: &str = "roster.lock";
const PARTITIONS_DIR: &str = "partitions";
const LOCK_ATTEMPTS: usize = 50;
const LOCK_RETRY: Duration = Duration::from_millis(100);
/// Roster updates take milliseconds; a lock this old has no live holder
const STALE_LOCK_AGE: Duration = Duration::from_secs(10);

type Document = BTreeMap<String, String>;

#[derive(Default)]
struct Seen {
    roster: Roster,
    partitions: HashMap<Partition, Document>,
}

pub struct FileChannel {
    dir: PathBuf,
    notices: broadcast::Sender<ChangeNotice>,
    seen: Mutex<Seen>,
}

impl FileChannel {
    /// Open (creating if needed) a channel directory and start polling it
    pub async fn open(dir: impl AsRef<Path>, poll_interval: Duration) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(dir.join(PARTITIONS_DIR)).await?;

        let (notices, _rx) = broadcast::channel(NOTICE_CAPACITY);
        let channel = Arc::new(Self {
            dir,
            notices,
            seen: Mutex::new(Seen::default()),
        });

        // Prime the snapshot so existing data is not replayed as new
        let roster = channel.load_roster().await?;
        let partitions = channel.load_partitions().await?;
        if let Ok(mut seen) = channel.seen.lock() {
            seen.roster = roster;
            seen.partitions = partitions;
        }

        tokio::spawn(poll_loop(Arc::downgrade(&channel), poll_interval));
        Ok(channel)
    }

    fn partition_path(&self, partition: &Partition) -> Result<PathBuf> {
        let id = URL_SAFE_NO_PAD.encode(serde_json::to_vec(partition)?);
        Ok(self.dir.join(PARTITIONS_DIR).join(format!("{}.json", id)))
    }

    fn partition_from_file(name: &str) -> Option<Partition> {
        let id = name.strip_suffix(".json")?;
        let raw = URL_SAFE_NO_PAD.decode(id).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn load_roster(&self) -> Result<Roster> {
        match tokio::fs::read(self.dir.join(ROSTER_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Roster::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_document(&self, partition: &Partition) -> Result<Document> {
        match tokio::fs::read(self.partition_path(partition)?).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_partitions(&self) -> Result<HashMap<Partition, Document>> {
        let mut out = HashMap::new();
        let mut entries = tokio::fs::read_dir(self.dir.join(PARTITIONS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(partition) = Self::partition_from_file(&name) else {
                continue;
            };
            // A document replaced mid-read shows up on the next poll
            if let Ok(bytes) = tokio::fs::read(entry.path()).await {
                if let Ok(doc) = serde_json::from_slice::<Document>(&bytes) {
                    out.insert(partition, doc);
                }
            }
        }
        Ok(out)
    }

    async fn store(&self, path: &Path, bytes: Vec<u8>) -> Result<()> {
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn store_document(&self, partition: &Partition, doc: &Document) -> Result<()> {
        let path = self.partition_path(partition)?;
        if doc.is_empty() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            self.store(&path, serde_json::to_vec_pretty(doc)?).await
        }
    }

    /// Read-modify-write of the roster under the directory lock
    async fn update_roster<T>(
        &self,
        f: impl FnOnce(&mut Roster) -> Result<T>,
    ) -> Result<(Roster, T)> {
        let lock = self.dir.join(ROSTER_LOCK);
        let record = LockRecord::new();
        let mut acquired = false;
        for _ in 0..LOCK_ATTEMPTS {
            if try_lock(&lock, &record).await? {
                acquired = true;
                break;
            }
            let holder = read_lock(&lock).await;
            let stale = match &holder {
                Some(h) => h.is_stale(),
                None => lock_age(&lock).await.is_some_and(|age| age > STALE_LOCK_AGE),
            };
            if stale {
                tracing::warn!("Breaking stale roster lock {} ({:?})", lock.display(), holder);
                break_lock(&lock, holder.as_ref()).await?;
                continue;
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
        if !acquired {
            return Err(Error::Timeout(format!("roster lock {}", lock.display())));
        }

        let result = async {
            let mut roster = self.load_roster().await?;
            let value = f(&mut roster)?;
            self.store(&self.dir.join(ROSTER_FILE), serde_json::to_vec_pretty(&roster)?)
                .await?;
            Ok((roster, value))
        }
        .await;

        if read_lock(&lock).await.as_ref() == Some(&record) {
            let _ = tokio::fs::remove_file(&lock).await;
        }
        result
    }

    fn announce(&self, roster: Option<&Roster>, notices: Vec<ChangeNotice>) {
        if let (Some(roster), Ok(mut seen)) = (roster, self.seen.lock()) {
            seen.roster = roster.clone();
        }
        for n in notices {
            let _ = self.notices.send(n);
        }
    }

    /// Compare the directory with the last snapshot and announce differences
    async fn poll(&self) -> Result<()> {
        let roster = self.load_roster().await?;
        let partitions = self.load_partitions().await?;

        let notices = {
            let mut seen = self
                .seen
                .lock()
                .map_err(|_| Error::Channel("snapshot poisoned".into()))?;
            let mut notices = roster_diff(&seen.roster, &roster);
            for (partition, doc) in &partitions {
                let before = seen.partitions.get(partition);
                for key in changed_keys(before, Some(doc)) {
                    notices.push(ChangeNotice::Written {
                        partition: partition.clone(),
                        key,
                    });
                }
            }
            for (partition, doc) in &seen.partitions {
                if !partitions.contains_key(partition) {
                    for key in changed_keys(Some(doc), None) {
                        notices.push(ChangeNotice::Written {
                            partition: partition.clone(),
                            key,
                        });
                    }
                }
            }
            seen.roster = roster;
            seen.partitions = partitions;
            notices
        };

        for n in notices {
            let _ = self.notices.send(n);
        }
        Ok(())
    }
}

/// Holder of `roster.lock`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockRecord {
    token: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn new() -> Self {
        Self {
            token: uuid::Uuid::new_v4().simple().to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    fn is_stale(&self) -> bool {
        Utc::now()
            .signed_duration_since(self.acquired_at)
            .to_std()
            .is_ok_and(|age| age > STALE_LOCK_AGE)
    }
}

async fn try_lock(path: &Path, record: &LockRecord) -> Result<bool> {
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(mut file) => {
            file.write_all(&serde_json::to_vec(record)?).await?;
            file.flush().await?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// `None` when the lock is gone or its holder never finished writing it
async fn read_lock(path: &Path) -> Option<LockRecord> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn lock_age(path: &Path) -> Option<Duration> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    modified.elapsed().ok()
}

/// Move the stale lock aside; if another member re-took the lock in the
/// meantime, link its lock back into place
async fn break_lock(path: &Path, stale: Option<&LockRecord>) -> Result<()> {
    let moved = path.with_extension(format!("stale-{}", uuid::Uuid::new_v4().simple()));
    match tokio::fs::rename(path, &moved).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    if read_lock(&moved).await.as_ref() != stale {
        let _ = tokio::fs::hard_link(&moved, path).await;
    }
    let _ = tokio::fs::remove_file(&moved).await;
    Ok(())
}

async fn poll_loop(channel: Weak<FileChannel>, interval: Duration) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    loop {
        ticker.tick().await;
        let Some(channel) = channel.upgrade() else {
            break;
        };
        if let Err(e) = channel.poll().await {
            tracing::warn!("Channel poll of {} failed: {}", channel.dir.display(), e);
        }
    }
}

fn changed_keys(before: Option<&Document>, after: Option<&Document>) -> Vec<String> {
    let empty = Document::new();
    let before = before.unwrap_or(&empty);
    let after = after.unwrap_or(&empty);
    let mut keys: Vec<String> = after
        .iter()
        .filter(|(k, v)| before.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    keys.extend(
        before
            .keys()
            .filter(|k| !after.contains_key(*k))
            .cloned(),
    );
    keys
}

fn roster_diff(before: &Roster, after: &Roster) -> Vec<ChangeNotice> {
    let mut notices = Vec::new();
    for (deployment, members) in &after.members {
        let old = before.members.get(deployment);
        for m in members {
            if !old.is_some_and(|o| o.contains(m)) {
                notices.push(ChangeNotice::MemberJoined {
                    deployment: deployment.clone(),
                    member: m.clone(),
                });
            }
        }
    }
    for (deployment, members) in &before.members {
        let new = after.members.get(deployment);
        for m in members {
            if !new.is_some_and(|n| n.contains(m)) {
                notices.push(ChangeNotice::MemberDeparted {
                    deployment: deployment.clone(),
                    member: m.clone(),
                });
            }
        }
    }
    let deployments: std::collections::BTreeSet<&String> =
        before.leaders.keys().chain(after.leaders.keys()).collect();
    for d in deployments {
        if before.leaders.get(d) != after.leaders.get(d) {
            notices.push(ChangeNotice::LeaderChanged {
                deployment: d.clone(),
                leader: after.leaders.get(d).cloned(),
            });
        }
    }
    for (name, link) in &after.links {
        if !before.links.contains_key(name) {
            notices.push(ChangeNotice::LinkEstablished { link: link.clone() });
        }
    }
    for (name, link) in &before.links {
        if !after.links.contains_key(name) {
            notices.push(ChangeNotice::LinkBroken { link: link.clone() });
        }
    }
    notices
}

#[async_trait]
impl CoordinationChannel for FileChannel {
    async fn read(&self, partition: &Partition, key: &str) -> Result<Option<String>> {
        Ok(self.load_document(partition).await?.remove(key))
    }

    async fn read_all(&self, partition: &Partition) -> Result<BTreeMap<String, String>> {
        self.load_document(partition).await
    }

    async fn write(
        &self,
        caller: &str,
        partition: &Partition,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        self.load_roster().await?.check_writer(caller, partition)?;

        let mut doc = self.load_document(partition).await?;
        match value {
            Some(v) => {
                doc.insert(key.to_string(), v.to_string());
            }
            None => {
                doc.remove(key);
            }
        }
        self.store_document(partition, &doc).await?;

        if let Ok(mut seen) = self.seen.lock() {
            seen.partitions.insert(partition.clone(), doc);
        }
        self.announce(
            None,
            vec![ChangeNotice::Written {
                partition: partition.clone(),
                key: key.to_string(),
            }],
        );
        Ok(())
    }

    async fn roster(&self) -> Result<Roster> {
        self.load_roster().await
    }

    async fn join(&self, deployment: &str, member: &str) -> Result<()> {
        let (roster, notices) = self
            .update_roster(|r| Ok(r.join(deployment, member)))
            .await?;
        self.announce(Some(&roster), notices);
        Ok(())
    }

    async fn depart(&self, member: &str) -> Result<()> {
        let (roster, notices) = self.update_roster(|r| Ok(r.depart(member))).await?;
        self.store_document(&Partition::Member(member.to_string()), &Document::new())
            .await?;
        self.announce(Some(&roster), notices);
        Ok(())
    }

    async fn set_leader(&self, deployment: &str, member: &str) -> Result<()> {
        let (roster, notices) = self
            .update_roster(|r| r.set_leader(deployment, member))
            .await?;
        self.announce(Some(&roster), notices);
        Ok(())
    }

    async fn establish_link(&self, link: LinkInfo) -> Result<()> {
        let (roster, notices) = self.update_roster(|r| r.establish_link(link)).await?;
        self.announce(Some(&roster), notices);
        Ok(())
    }

    async fn break_link(&self, name: &str) -> Result<()> {
        let before = self.load_roster().await?;
        let (roster, (link, notices)) = self.update_roster(|r| r.break_link(name)).await?;
        for p in link_partitions(&link, &before) {
            self.store_document(&p, &Document::new()).await?;
        }
        self.announce(Some(&roster), notices);
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
    async fn test_file_channel_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileChannel::open(dir.path(), Duration::from_secs(3600))
            .await
            .unwrap();
        channel.join("pg", "pg/0").await.unwrap();

        let member = Partition::Member("pg/0".into());
        channel.write("pg/0", &member, "ip", Some("10.0.0.1")).await.unwrap();
        assert_eq!(
            channel.read(&member, "ip").await.unwrap().as_deref(),
            Some("10.0.0.1")
        );
        assert!(channel.write("pg/1", &member, "ip", Some("x")).await.is_err());

        // A second handle on the same directory sees the data
        let other = FileChannel::open(dir.path(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(other.leader("pg").await.unwrap().as_deref(), Some("pg/0"));
        assert_eq!(other.read_all(&member).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_sees_foreign_writes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileChannel::open(dir.path(), Duration::from_secs(3600))
            .await
            .unwrap();
        let reader = FileChannel::open(dir.path(), Duration::from_secs(3600))
            .await
            .unwrap();
        let mut rx = reader.subscribe();

        writer.join("pg", "pg/0").await.unwrap();
        writer
            .establish_link(LinkInfo {
                name: "witness".into(),
                kind: LinkKind::Witness,
                deployments: ["pg".into(), "raft-witness".into()],
            })
            .await
            .unwrap();
        let member = Partition::Member("pg/0".into());
        writer.write("pg/0", &member, "stopped", Some("True")).await.unwrap();

        reader.poll().await.unwrap();
        let mut seen = Vec::new();
        while let Ok(n) = rx.try_recv() {
            seen.push(n);
        }
        assert!(seen.contains(&ChangeNotice::MemberJoined {
            deployment: "pg".into(),
            member: "pg/0".into()
        }));
        assert!(seen.iter().any(|n| matches!(n, ChangeNotice::LinkEstablished { .. })));
        assert!(seen.contains(&ChangeNotice::Written {
            partition: member,
            key: "stopped".into()
        }));
    }

    #[tokio::test]
    async fn test_crashed_holder_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileChannel::open(dir.path(), Duration::from_secs(3600))
            .await
            .unwrap();
        let crashed = LockRecord {
            acquired_at: Utc::now() - chrono::Duration::seconds(60),
            ..LockRecord::new()
        };
        let lock = dir.path().join(ROSTER_LOCK);
        std::fs::write(&lock, serde_json::to_vec(&crashed).unwrap()).unwrap();

        channel.join("pg", "pg/0").await.unwrap();
        assert_eq!(channel.leader("pg").await.unwrap().as_deref(), Some("pg/0"));
        assert!(!lock.exists());
    }

    #[tokio::test]
    async fn test_live_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join(ROSTER_LOCK);
        let live = LockRecord::new();
        assert!(try_lock(&lock, &live).await.unwrap());
        assert!(!live.is_stale());

        // A second holder neither takes nor breaks it
        assert!(!try_lock(&lock, &LockRecord::new()).await.unwrap());
        assert_eq!(read_lock(&lock).await, Some(live));
    }

    #[test]
    fn test_changed_keys() {
        let mut a = Document::new();
        a.insert("x".into(), "1".into());
        a.insert("y".into(), "1".into());
        let mut b = a.clone();
        b.insert("x".into(), "2".into());
        b.remove("y");
        let mut keys = changed_keys(Some(&a), Some(&b));
        keys.sort();
        assert_eq!(keys, vec!["x".to_string(), "y".to_string()]);
    }
}
