//! Raft group administration
//!
//! Updating the supervisor's static partner list does not admit a member
//! into an already-running raft group; an explicit admin join is needed.
//! The admin tool is driven as
//! `<tool> -conn <host:port> -pass <password> -add|-remove <addr:port>` or
//! `-status`.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::common::{retry_with_backoff, run_command, Error, Result, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyMember,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotMember,
}

/// Parsed `-status` output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftStatus {
    pub self_addr: Option<String>,
    pub leader: Option<String>,
    pub has_quorum: bool,
    pub partners: BTreeSet<String>,
}

impl RaftStatus {
    /// Partner or self
    pub fn contains(&self, addr: &str) -> bool {
        self.partners.contains(addr) || self.self_addr.as_deref() == Some(addr)
    }

    pub fn parse(output: &str) -> Self {
        let mut status = RaftStatus::default();
        for line in output.lines() {
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            let value = value.trim();
            if let Some(addr) = key.strip_prefix("partner_node_status_server_") {
                status.partners.insert(addr.to_string());
                continue;
            }
            match key.trim() {
                "self" => status.self_addr = Some(value.to_string()),
                "leader" if value != "None" => status.leader = Some(value.to_string()),
                "has_quorum" => status.has_quorum = value == "True",
                _ => {}
            }
        }
        status
    }
}

#[async_trait]
pub trait RaftAdmin: Send + Sync {
    async fn status(&self, conn: &str, password: &str) -> Result<RaftStatus>;

    async fn add(&self, conn: &str, password: &str, member: &str) -> Result<AddOutcome>;

    async fn remove(&self, conn: &str, password: &str, member: &str) -> Result<RemoveOutcome>;
}

/// Add `member` unless the group already lists it. An "already a member"
/// answer is only accepted once status shows the exact address.
pub async fn ensure_member(
    admin: &dyn RaftAdmin,
    conn: &str,
    password: &str,
    member: &str,
) -> Result<AddOutcome> {
    if admin.status(conn, password).await?.contains(member) {
        return Ok(AddOutcome::AlreadyMember);
    }
    match admin.add(conn, password, member).await? {
        AddOutcome::Added => Ok(AddOutcome::Added),
        AddOutcome::AlreadyMember => {
            if admin.status(conn, password).await?.contains(member) {
                Ok(AddOutcome::AlreadyMember)
            } else {
                Err(Error::RaftAdmin(format!(
                    "{} reported as a member but absent from the raft status",
                    member
                )))
            }
        }
    }
}

/// Raft admin over the CLI tool
pub struct CliRaftAdmin {
    tool: PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
}

impl CliRaftAdmin {
    pub fn new(tool: PathBuf, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            tool,
            timeout,
            retry,
        }
    }

    async fn invoke(&self, conn: &str, password: &str, op: &[&str]) -> Result<String> {
        let mut args = vec!["-conn", conn, "-pass", password];
        args.extend_from_slice(op);
        let out = run_command(&self.tool, &args, self.timeout).await?;
        let text = format!("{}{}", out.stdout, out.stderr);
        if out.success {
            Ok(text)
        } else {
            Err(Error::RaftAdmin(format!(
                "{} {} exited with {:?}: {}",
                self.tool.display(),
                op.join(" "),
                out.code,
                text.trim()
            )))
        }
    }
}

fn already_member(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("already a member") || lower.contains("already in")
}

fn not_member(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("not a member") || lower.contains("not found")
}

#[async_trait]
impl RaftAdmin for CliRaftAdmin {
    async fn status(&self, conn: &str, password: &str) -> Result<RaftStatus> {
        let out = retry_with_backoff(|| self.invoke(conn, password, &["-status"]), self.retry).await?;
        Ok(RaftStatus::parse(&out))
    }

    async fn add(&self, conn: &str, password: &str, member: &str) -> Result<AddOutcome> {
        retry_with_backoff(
            || async {
                match self.invoke(conn, password, &["-add", member]).await {
                    Ok(out) if already_member(&out) => Ok(AddOutcome::AlreadyMember),
                    Ok(out) if out.contains("FAIL") => Err(Error::RaftAdmin(out.trim().to_string())),
                    Ok(_) => Ok(AddOutcome::Added),
                    Err(Error::RaftAdmin(msg)) if already_member(&msg) => {
                        Ok(AddOutcome::AlreadyMember)
                    }
                    Err(e) => Err(e),
                }
            },
            self.retry,
        )
        .await
    }

    async fn remove(&self, conn: &str, password: &str, member: &str) -> Result<RemoveOutcome> {
        retry_with_backoff(
            || async {
                match self.invoke(conn, password, &["-remove", member]).await {
                    Ok(out) if not_member(&out) => Ok(RemoveOutcome::NotMember),
                    Ok(out) if out.contains("FAIL") => Err(Error::RaftAdmin(out.trim().to_string())),
                    Ok(_) => Ok(RemoveOutcome::Removed),
                    Err(Error::RaftAdmin(msg)) if not_member(&msg) => Ok(RemoveOutcome::NotMember),
                    Err(e) => Err(e),
                }
            },
            self.retry,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const STATUS: &str = "\
commit_idx: 112
enabled_code_version: 0
has_quorum: True
leader: 10.0.0.1:2222
partner_node_status_server_10.0.0.2:2222: 2
partner_node_status_server_10.0.9.1:2222: 2
partners_count: 2
raft_term: 4
self: 10.0.0.1:2222
state: 2
";

    #[test]
    fn test_parse_status() {
        let status = RaftStatus::parse(STATUS);
        assert_eq!(status.self_addr.as_deref(), Some("10.0.0.1:2222"));
        assert_eq!(status.leader.as_deref(), Some("10.0.0.1:2222"));
        assert!(status.has_quorum);
        assert_eq!(status.partners.len(), 2);
        assert!(status.contains("10.0.9.1:2222"));
        assert!(status.contains("10.0.0.1:2222"));
        assert!(!status.contains("10.0.9.1:2223"));
    }

    /// Admin whose `add` always claims "already a member"
    struct Liar {
        group: Mutex<BTreeSet<String>>,
    }

    #[async_trait]
    impl RaftAdmin for Liar {
        async fn status(&self, _conn: &str, _password: &str) -> Result<RaftStatus> {
            Ok(RaftStatus {
                partners: self.group.lock().unwrap().clone(),
                ..Default::default()
            })
        }
        async fn add(&self, _: &str, _: &str, _: &str) -> Result<AddOutcome> {
            Ok(AddOutcome::AlreadyMember)
        }
        async fn remove(&self, _: &str, _: &str, _: &str) -> Result<RemoveOutcome> {
            Ok(RemoveOutcome::NotMember)
        }
    }

    #[tokio::test]
    async fn test_ensure_member_verifies_already_member() {
        let admin = Liar {
            group: Mutex::new(BTreeSet::from(["10.0.9.1:2222".to_string()])),
        };
        let listed = ensure_member(&admin, "10.0.0.1:2222", "pw", "10.0.9.1:2222").await;
        assert_eq!(listed.unwrap(), AddOutcome::AlreadyMember);

        let mismatched = ensure_member(&admin, "10.0.0.1:2222", "pw", "10.0.9.1:2223").await;
        assert!(matches!(mismatched, Err(Error::RaftAdmin(_))));
    }

    #[test]
    fn test_outcome_text() {
        assert!(already_member("FAIL ADD 10.0.0.2:2222: already a member"));
        assert!(not_member("10.0.0.2:2222 is not a member"));
        assert!(!not_member("SUCCESS REMOVE 10.0.0.2:2222"));
    }
}
