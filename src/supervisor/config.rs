//! Rendered supervisor configuration
//!
//! Every member renders the same document shape from channel state: the
//! deployment's member addresses, the raft partners (including an admitted
//! witness), credentials, and, on a standby deployment, where to replicate
//! from.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::common::{AgentConfig, Result};
use crate::secrets::SharedSecret;

/// Name the supervisor uses for a member (`pg-east/0` -> `pg-east-0`)
pub fn supervisor_name(member: &str) -> String {
    member.replace('/', "-")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestApiSettings {
    pub listen: String,
    pub connect_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaftSettings {
    pub data_dir: PathBuf,
    pub self_addr: String,
    pub partner_addrs: Vec<String>,
    pub password: String,
}

/// Upstream of a standby deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandbySettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub create_replica_methods: Vec<String>,
}

impl StandbySettings {
    /// From a `host:port` endpoint
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        let (host, port) = endpoint.rsplit_once(':')?;
        Some(Self {
            host: host.to_string(),
            port: port.parse().ok()?,
            create_replica_methods: vec!["basebackup".to_string()],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcsSettings {
    pub synchronous_mode: bool,
    pub synchronous_node_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standby_cluster: Option<StandbySettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSettings {
    pub dcs: DcsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authentication {
    pub superuser: UserCredentials,
    pub replication: UserCredentials,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub listen: String,
    pub connect_address: String,
    pub data_dir: PathBuf,
    pub authentication: Authentication,
    pub pg_hba: Vec<String>,
}

/// Channel-derived inputs of one rendering
#[derive(Debug, Clone, Default)]
pub struct RenderInputs {
    pub members_ips: Vec<String>,
    /// Admitted witness, `addr:port`
    pub witness: Option<String>,
    pub credentials: SharedSecret,
    pub standby: Option<StandbySettings>,
    /// Addresses of the linked standby deployment's members
    pub standby_hosts: Vec<String>,
    pub synchronous_node_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub scope: String,
    pub name: String,
    pub restapi: RestApiSettings,
    pub raft: RaftSettings,
    pub bootstrap: BootstrapSettings,
    pub postgresql: DatabaseSettings,
}

impl SupervisorConfig {
    pub fn render(config: &AgentConfig, inputs: &RenderInputs) -> Self {
        let raft_addr = |ip: &str| format!("{}:{}", ip, config.raft_port);

        let mut partner_addrs: Vec<String> = inputs
            .members_ips
            .iter()
            .filter(|ip| **ip != config.address)
            .map(|ip| raft_addr(ip))
            .collect();
        if let Some(witness) = &inputs.witness {
            partner_addrs.push(witness.clone());
        }
        partner_addrs.sort();
        partner_addrs.dedup();

        let mut pg_hba = vec![
            "local all all peer".to_string(),
            "host all all 0.0.0.0/0 scram-sha-256".to_string(),
        ];
        let mut replication_hosts: Vec<&String> = inputs
            .members_ips
            .iter()
            .chain(inputs.standby_hosts.iter())
            .collect();
        replication_hosts.sort();
        replication_hosts.dedup();
        for host in replication_hosts {
            pg_hba.push(format!("host replication replication {}/32 scram-sha-256", host));
        }

        Self {
            scope: config.deployment.clone(),
            name: supervisor_name(&config.member),
            restapi: RestApiSettings {
                listen: format!("0.0.0.0:{}", config.supervisor_port),
                connect_address: format!("{}:{}", config.address, config.supervisor_port),
            },
            raft: RaftSettings {
                data_dir: config.raft_dir.clone(),
                self_addr: raft_addr(&config.address),
                partner_addrs,
                password: inputs.credentials.raft_password.clone(),
            },
            bootstrap: BootstrapSettings {
                dcs: DcsSettings {
                    synchronous_mode: inputs.synchronous_node_count > 0,
                    synchronous_node_count: inputs.synchronous_node_count,
                    standby_cluster: inputs.standby.clone(),
                },
            },
            postgresql: DatabaseSettings {
                listen: format!("0.0.0.0:{}", config.database_port),
                connect_address: config.database_endpoint(),
                data_dir: config.data_dir.clone(),
                authentication: Authentication {
                    superuser: UserCredentials {
                        username: "operator".to_string(),
                        password: inputs.credentials.superuser_password.clone(),
                    },
                    replication: UserCredentials {
                        username: "replication".to_string(),
                        password: inputs.credentials.replication_password.clone(),
                    },
                },
                pg_hba,
            },
        }
    }

    pub fn to_document(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> RenderInputs {
        RenderInputs {
            members_ips: vec!["10.0.0.2".into(), "10.0.0.1".into()],
            witness: Some("10.0.9.1:2222".into()),
            credentials: SharedSecret {
                superuser_password: "su".into(),
                replication_password: "repl".into(),
                raft_password: "raft".into(),
            },
            standby: None,
            standby_hosts: vec!["10.1.0.1".into()],
            synchronous_node_count: 1,
        }
    }

    #[test]
    fn test_render_partners_and_hba() {
        let cfg = AgentConfig::new("pg/0", "pg", "10.0.0.1");
        let rendered = SupervisorConfig::render(&cfg, &inputs());

        assert_eq!(rendered.name, "pg-0");
        assert_eq!(rendered.raft.self_addr, "10.0.0.1:2222");
        assert_eq!(
            rendered.raft.partner_addrs,
            vec!["10.0.0.2:2222", "10.0.9.1:2222"]
        );
        assert_eq!(rendered.raft.password, "raft");
        assert!(rendered
            .postgresql
            .pg_hba
            .contains(&"host replication replication 10.1.0.1/32 scram-sha-256".to_string()));
        assert!(rendered.bootstrap.dcs.synchronous_mode);
    }

    #[test]
    fn test_render_standby_section() {
        let cfg = AgentConfig::new("pg/0", "pg", "10.0.0.1");
        let mut inputs = inputs();
        inputs.standby = StandbySettings::from_endpoint("10.1.0.1:5432");
        let doc = SupervisorConfig::render(&cfg, &inputs).to_document().unwrap();

        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(value["bootstrap"]["dcs"]["standby_cluster"]["host"], "10.1.0.1");
        assert_eq!(value["bootstrap"]["dcs"]["standby_cluster"]["port"], 5432);
        assert!(StandbySettings::from_endpoint("no-port").is_none());
    }
}
