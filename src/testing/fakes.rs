//! In-process stand-ins for the supervisor, the raft admin tool and the
//! local workload
//!
//! Every member of one simulated deployment shares a [`FakeDeployment`],
//! which plays the supervisor quorum: it knows which members run, which one
//! holds the primary role and whether the deployment is a standby. Every
//! externally visible action is appended to its event log as `kind:subject`.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::common::{Error, Result};
use crate::raft_admin::{AddOutcome, RaftAdmin, RaftStatus, RemoveOutcome};
use crate::supervisor::{supervisor_name, ClusterMember, HaSupervisor, MemberHealth, MemberRole};
use crate::workload::Workload;

/// Address -> deployment, used to follow a standby upstream's lineage
pub type HostRegistry = Arc<Mutex<HashMap<String, Arc<FakeDeployment>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Clone)]
struct FakeMember {
    host: String,
    /// Listed by the supervisor once started the first time
    registered: bool,
    run: RunState,
    document: Option<String>,
}

#[derive(Default)]
struct FakeState {
    members: BTreeMap<String, FakeMember>,
    leader: Option<String>,
    standby: bool,
    lineage: String,
    raft_group: BTreeSet<String>,
    events: Vec<String>,
    patches: Vec<serde_json::Value>,
    fail_stop: BTreeSet<String>,
    fail_wipe: BTreeSet<String>,
    fail_removes: bool,
    delay_start: bool,
}

impl FakeState {
    fn record(&mut self, kind: &str, subject: &str) {
        self.events.push(format!("{}:{}", kind, subject));
    }

    fn member(&mut self, name: &str) -> Result<&mut FakeMember> {
        self.members
            .get_mut(name)
            .ok_or_else(|| Error::Workload(format!("unknown member {}", name)))
    }

    fn is_up(&self, name: &str) -> bool {
        self.members
            .get(name)
            .is_some_and(|m| m.run != RunState::Stopped)
    }

    /// Hand the primary role to a running member when the holder is down
    fn elect(&mut self) {
        if self.leader.as_deref().is_some_and(|l| self.is_up(l)) {
            return;
        }
        self.leader = self
            .members
            .iter()
            .find(|(_, m)| m.run != RunState::Stopped)
            .map(|(name, _)| name.clone());
    }

    fn role(&self, name: &str) -> MemberRole {
        if self.leader.as_deref() == Some(name) {
            if self.standby {
                MemberRole::StandbyLeader
            } else {
                MemberRole::Leader
            }
        } else {
            MemberRole::Replica
        }
    }

    fn state_label(&self, name: &str, role: &MemberRole) -> &'static str {
        match self.members.get(name).map(|m| m.run) {
            Some(RunState::Running) if *role == MemberRole::Replica => "streaming",
            Some(RunState::Running) => "running",
            Some(RunState::Starting) => "starting",
            _ => "stopped",
        }
    }
}

/// Upstream host named by the rendered configuration, if it is a standby one
fn standby_host(document: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(document).ok()?;
    value["bootstrap"]["dcs"]["standby_cluster"]["host"]
        .as_str()
        .map(str::to_string)
}

/// Supervisor quorum and host state of one simulated deployment
pub struct FakeDeployment {
    name: String,
    state: Mutex<FakeState>,
}

impl FakeDeployment {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(FakeState {
                lineage: format!("{}-lineage", name),
                ..Default::default()
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> Result<MutexGuard<'_, FakeState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal(format!("{} state poisoned", self.name)))
    }

    fn read<T>(&self, f: impl FnOnce(&FakeState) -> T) -> T
    where
        T: Default,
    {
        self.lock().map(|s| f(&*s)).unwrap_or_default()
    }

    fn update(&self, f: impl FnOnce(&mut FakeState)) {
        if let Ok(mut state) = self.lock() {
            f(&mut *state);
        }
    }

    pub(crate) fn add_member(&self, member: &str, host: &str) {
        self.update(|s| {
            s.members.entry(member.to_string()).or_insert(FakeMember {
                host: host.to_string(),
                registered: false,
                run: RunState::Stopped,
                document: None,
            });
        });
    }

    /// The member's machine is gone
    pub(crate) fn remove_member(&self, member: &str) {
        self.update(|s| {
            s.members.remove(member);
            s.record("removed", member);
            s.elect();
        });
    }

    /// Everything that happened so far, as `kind:subject`
    pub fn events(&self) -> Vec<String> {
        self.read(|s| s.events.clone())
    }

    /// Events of one kind, subjects only
    pub fn events_of(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{}:", kind);
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn activity(&self) -> usize {
        self.read(|s| s.events.len())
    }

    pub fn patches(&self) -> Vec<serde_json::Value> {
        self.read(|s| s.patches.clone())
    }

    pub fn raft_group(&self) -> BTreeSet<String> {
        self.read(|s| s.raft_group.clone())
    }

    pub fn is_standby(&self) -> bool {
        self.read(|s| s.standby)
    }

    pub fn lineage(&self) -> String {
        self.read(|s| s.lineage.clone())
    }

    pub fn set_lineage(&self, lineage: &str) {
        self.update(|s| s.lineage = lineage.to_string());
    }

    pub fn is_running(&self, member: &str) -> bool {
        self.read(|s| s.members.get(member).is_some_and(|m| m.run == RunState::Running))
    }

    /// Agent member name currently holding the primary or standby-leader role
    pub fn leader(&self) -> Option<String> {
        self.read(|s| s.leader.clone())
    }

    pub fn document(&self, member: &str) -> Option<String> {
        self.read(|s| s.members.get(member).and_then(|m| m.document.clone()))
    }

    pub fn fail_stop(&self, member: &str, fail: bool) {
        self.update(|s| {
            if fail {
                s.fail_stop.insert(member.to_string());
            } else {
                s.fail_stop.remove(member);
            }
        });
    }

    pub fn fail_wipe(&self, member: &str, fail: bool) {
        self.update(|s| {
            if fail {
                s.fail_wipe.insert(member.to_string());
            } else {
                s.fail_wipe.remove(member);
            }
        });
    }

    pub fn fail_removes(&self, fail: bool) {
        self.update(|s| s.fail_removes = fail);
    }

    /// While set, started members stay in `starting`; clearing it finishes
    /// every pending start
    pub fn delay_start(&self, delay: bool) {
        self.update(|s| {
            s.delay_start = delay;
            if !delay {
                let pending: Vec<String> = s
                    .members
                    .iter()
                    .filter(|(_, m)| m.run == RunState::Starting)
                    .map(|(n, _)| n.clone())
                    .collect();
                for name in pending {
                    if let Some(m) = s.members.get_mut(&name) {
                        m.run = RunState::Running;
                    }
                    s.record("started", &name);
                }
            }
        });
    }

    fn cluster(&self) -> Result<Vec<ClusterMember>> {
        let state = self.lock()?;
        Ok(state
            .members
            .iter()
            .filter(|(_, m)| m.registered)
            .map(|(name, m)| {
                let role = state.role(name);
                ClusterMember {
                    name: supervisor_name(name),
                    host: m.host.clone(),
                    state: state.state_label(name, &role).to_string(),
                    role,
                    lag: None,
                }
            })
            .collect())
    }

    fn by_supervisor_name(state: &FakeState, name: &str) -> Option<String> {
        state
            .members
            .keys()
            .find(|m| supervisor_name(m) == name)
            .cloned()
    }
}

/// One member's view of the supervisor
pub struct FakeSupervisor {
    deployment: Arc<FakeDeployment>,
    member: String,
}

impl FakeSupervisor {
    pub fn new(deployment: Arc<FakeDeployment>, member: &str) -> Self {
        Self {
            deployment,
            member: member.to_string(),
        }
    }

    fn refused(&self, path: &str, body: String) -> Error {
        Error::Supervisor {
            path: path.to_string(),
            status: 412,
            body,
        }
    }
}

#[async_trait]
impl HaSupervisor for FakeSupervisor {
    async fn cluster(&self) -> Result<Vec<ClusterMember>> {
        self.deployment.cluster()
    }

    async fn health(&self) -> Result<MemberHealth> {
        let state = self.deployment.lock()?;
        let role = state.role(&self.member);
        Ok(MemberHealth {
            state: match state.state_label(&self.member, &role) {
                "streaming" => "running".to_string(),
                other => other.to_string(),
            },
            role: Some(format!("{:?}", role).to_lowercase()),
        })
    }

    async fn switchover(&self, leader: &str, candidate: Option<&str>) -> Result<()> {
        let mut state = self.deployment.lock()?;
        let current = state.leader.as_deref().map(supervisor_name);
        if current.as_deref() != Some(leader) {
            return Err(self.refused("/switchover", format!("{} is not the leader", leader)));
        }
        let target = candidate
            .and_then(|c| FakeDeployment::by_supervisor_name(&state, c))
            .or_else(|| {
                state
                    .members
                    .iter()
                    .find(|(n, m)| m.run == RunState::Running && Some(n.as_str()) != state.leader.as_deref())
                    .map(|(n, _)| n.clone())
            });
        match target {
            Some(t) if state.is_up(&t) => {
                state.record("switchover", &t);
                state.leader = Some(t);
                Ok(())
            }
            _ => Err(self.refused("/switchover", "no running candidate".into())),
        }
    }

    async fn failover(&self, candidate: &str) -> Result<()> {
        let mut state = self.deployment.lock()?;
        match FakeDeployment::by_supervisor_name(&state, candidate) {
            Some(t) if state.is_up(&t) => {
                state.record("failover", &t);
                state.leader = Some(t);
                Ok(())
            }
            _ => Err(self.refused("/failover", format!("{} is not running", candidate))),
        }
    }

    async fn reload(&self) -> Result<()> {
        self.deployment.lock()?.record("reload", &self.member);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.deployment.lock()?.record("restart", &self.member);
        Ok(())
    }

    async fn reinitialize(&self) -> Result<()> {
        self.deployment.lock()?.record("reinitialize", &self.member);
        Ok(())
    }

    async fn patch_config(&self, patch: serde_json::Value) -> Result<()> {
        let mut state = self.deployment.lock()?;
        if patch.get("standby_cluster").is_some_and(|v| v.is_null()) {
            state.standby = false;
        }
        state.record("patch", &patch.to_string());
        state.patches.push(patch);
        Ok(())
    }
}

/// Raft admin over the deployment's shared group
pub struct FakeRaftAdmin {
    deployment: Arc<FakeDeployment>,
}

impl FakeRaftAdmin {
    pub fn new(deployment: Arc<FakeDeployment>) -> Self {
        Self { deployment }
    }
}

#[async_trait]
impl RaftAdmin for FakeRaftAdmin {
    async fn status(&self, conn: &str, _password: &str) -> Result<RaftStatus> {
        let state = self.deployment.lock()?;
        Ok(RaftStatus {
            self_addr: Some(conn.to_string()),
            leader: Some(conn.to_string()),
            has_quorum: true,
            partners: state
                .raft_group
                .iter()
                .filter(|a| *a != conn)
                .cloned()
                .collect(),
        })
    }

    async fn add(&self, _conn: &str, _password: &str, member: &str) -> Result<AddOutcome> {
        let mut state = self.deployment.lock()?;
        if !state.raft_group.insert(member.to_string()) {
            return Ok(AddOutcome::AlreadyMember);
        }
        state.record("raft-add", member);
        Ok(AddOutcome::Added)
    }

    async fn remove(&self, _conn: &str, _password: &str, member: &str) -> Result<RemoveOutcome> {
        let mut state = self.deployment.lock()?;
        if state.fail_removes {
            return Err(Error::RaftAdmin(format!("cannot reach the raft group to remove {}", member)));
        }
        if !state.raft_group.remove(member) {
            return Ok(RemoveOutcome::NotMember);
        }
        state.record("raft-remove", member);
        Ok(RemoveOutcome::Removed)
    }
}

/// One member's host: service, data directory and rendered configuration
pub struct FakeWorkload {
    deployment: Arc<FakeDeployment>,
    member: String,
    hosts: HostRegistry,
}

impl FakeWorkload {
    pub fn new(deployment: Arc<FakeDeployment>, member: &str, hosts: HostRegistry) -> Self {
        Self {
            deployment,
            member: member.to_string(),
            hosts,
        }
    }

    fn upstream_lineage(&self, document: Option<&str>) -> Option<String> {
        let host = standby_host(document?)?;
        let upstream = self.hosts.lock().ok()?.get(&host).cloned()?;
        if upstream.name() == self.deployment.name() {
            return None;
        }
        Some(upstream.lineage())
    }
}

#[async_trait]
impl Workload for FakeWorkload {
    async fn stop_service(&self) -> Result<()> {
        let mut state = self.deployment.lock()?;
        if state.fail_stop.contains(&self.member) {
            return Err(Error::Workload(format!("{} did not stop", self.member)));
        }
        state.member(&self.member)?.run = RunState::Stopped;
        state.record("stop", &self.member);
        state.elect();
        Ok(())
    }

    async fn start_service(&self) -> Result<()> {
        let document = self.deployment.document(&self.member);
        let upstream = self.upstream_lineage(document.as_deref());

        let mut state = self.deployment.lock()?;
        let delayed = state.delay_start;
        let first_up = !state.members.values().any(|m| m.run != RunState::Stopped);
        let member = state.member(&self.member)?;
        if member.run != RunState::Stopped {
            return Ok(());
        }
        member.registered = true;
        member.run = if delayed {
            RunState::Starting
        } else {
            RunState::Running
        };
        if first_up {
            state.standby = upstream.is_some();
        }
        if let Some(lineage) = upstream {
            state.lineage = lineage;
        }
        state.record("start", &self.member);
        state.elect();
        Ok(())
    }

    async fn service_active(&self) -> Result<bool> {
        Ok(self.deployment.lock()?.is_up(&self.member))
    }

    async fn system_identifier(&self) -> Result<String> {
        Ok(self.deployment.lineage())
    }

    async fn archive_data_dir(&self, label: &str) -> Result<PathBuf> {
        self.deployment.lock()?.record("archive", &self.member);
        Ok(PathBuf::from(format!(
            "/archive/{}-{}.tar.gz",
            supervisor_name(&self.member),
            label
        )))
    }

    async fn reset_data_dir(&self) -> Result<()> {
        let mut state = self.deployment.lock()?;
        if state.fail_wipe.contains(&self.member) {
            return Err(Error::Workload(format!(
                "cannot remove the data directory of {}",
                self.member
            )));
        }
        state.record("wipe", &self.member);
        Ok(())
    }

    async fn discard_raft_state(&self) -> Result<()> {
        self.deployment.lock()?.record("raft-reset", &self.member);
        Ok(())
    }

    async fn write_supervisor_config(&self, document: &str) -> Result<bool> {
        let mut state = self.deployment.lock()?;
        let member = state.member(&self.member)?;
        if member.document.as_deref() == Some(document) {
            return Ok(false);
        }
        member.document = Some(document.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> (Arc<FakeDeployment>, HostRegistry) {
        let d = FakeDeployment::new("east");
        d.add_member("east/0", "10.0.0.1");
        d.add_member("east/1", "10.0.0.2");
        (d, HostRegistry::default())
    }

    #[tokio::test]
    async fn test_first_started_member_leads() {
        let (d, hosts) = deployment();
        let sup = FakeSupervisor::new(d.clone(), "east/0");
        assert!(sup.cluster().await.unwrap().is_empty());

        FakeWorkload::new(d.clone(), "east/1", hosts.clone())
            .start_service()
            .await
            .unwrap();
        FakeWorkload::new(d.clone(), "east/0", hosts)
            .start_service()
            .await
            .unwrap();

        let members = sup.cluster().await.unwrap();
        assert_eq!(members.len(), 2);
        let leader = members.iter().find(|m| m.role == MemberRole::Leader).unwrap();
        assert_eq!(leader.name, "east-1");
        assert!(members.iter().all(ClusterMember::is_ready));
    }

    #[tokio::test]
    async fn test_stop_fails_over() {
        let (d, hosts) = deployment();
        let w0 = FakeWorkload::new(d.clone(), "east/0", hosts.clone());
        let w1 = FakeWorkload::new(d.clone(), "east/1", hosts);
        w0.start_service().await.unwrap();
        w1.start_service().await.unwrap();

        w0.stop_service().await.unwrap();
        assert_eq!(d.leader().as_deref(), Some("east/1"));
        w1.stop_service().await.unwrap();
        assert_eq!(d.leader(), None);
        assert_eq!(d.events_of("stop"), vec!["east/0", "east/1"]);
    }

    #[tokio::test]
    async fn test_standby_start_follows_upstream_lineage() {
        let (d, hosts) = deployment();
        let west = FakeDeployment::new("west");
        hosts
            .lock()
            .unwrap()
            .insert("10.1.0.1".to_string(), west.clone());

        let w0 = FakeWorkload::new(d.clone(), "east/0", hosts);
        w0.write_supervisor_config(
            r#"{"bootstrap": {"dcs": {"standby_cluster": {"host": "10.1.0.1", "port": 5432}}}}"#,
        )
        .await
        .unwrap();
        w0.start_service().await.unwrap();

        assert!(d.is_standby());
        assert_eq!(d.lineage(), "west-lineage");
        let sup = FakeSupervisor::new(d.clone(), "east/0");
        sup.patch_config(serde_json::json!({ "standby_cluster": null }))
            .await
            .unwrap();
        assert!(!d.is_standby());
    }

    #[tokio::test]
    async fn test_raft_group_add_is_idempotent() {
        let (d, _) = deployment();
        let raft = FakeRaftAdmin::new(d.clone());
        assert_eq!(raft.add("a:1", "pw", "b:1").await.unwrap(), AddOutcome::Added);
        assert_eq!(
            raft.add("a:1", "pw", "b:1").await.unwrap(),
            AddOutcome::AlreadyMember
        );
        assert!(raft.status("a:1", "pw").await.unwrap().contains("b:1"));

        d.fail_removes(true);
        assert!(raft.remove("a:1", "pw", "b:1").await.is_err());
        d.fail_removes(false);
        assert_eq!(
            raft.remove("a:1", "pw", "b:1").await.unwrap(),
            RemoveOutcome::Removed
        );
        assert_eq!(d.events_of("raft-add"), vec!["b:1"]);
    }
}
