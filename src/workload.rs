//! Local database workload
//!
//! The data directory and the raft state directory belong to this member
//! alone. They are only destroyed by the standby takeover.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::{run_command, AgentConfig, Error, Result};

#[async_trait]
pub trait Workload: Send + Sync {
    async fn stop_service(&self) -> Result<()>;

    async fn start_service(&self) -> Result<()>;

    async fn service_active(&self) -> Result<bool>;

    /// Lineage identifier of the local data directory
    async fn system_identifier(&self) -> Result<String>;

    /// Compress the data directory into the archive directory
    async fn archive_data_dir(&self, label: &str) -> Result<PathBuf>;

    /// Remove and recreate the data directory (mode 0700)
    async fn reset_data_dir(&self) -> Result<()>;

    async fn discard_raft_state(&self) -> Result<()>;

    /// Write the supervisor configuration, returning whether it changed
    async fn write_supervisor_config(&self, document: &str) -> Result<bool>;
}

/// Workload managed through the service manager and local tools
pub struct LocalWorkload {
    service_unit: String,
    controldata_tool: PathBuf,
    data_dir: PathBuf,
    raft_dir: PathBuf,
    archive_dir: PathBuf,
    config_path: PathBuf,
    timeout: Duration,
}

impl LocalWorkload {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            service_unit: config.service_unit.clone(),
            controldata_tool: config.controldata_tool.clone(),
            data_dir: config.data_dir.clone(),
            raft_dir: config.raft_dir.clone(),
            archive_dir: config.archive_dir.clone(),
            config_path: config.supervisor_config_path.clone(),
            timeout: config.command_timeout(),
        }
    }

    async fn systemctl(&self, verb: &str) -> Result<()> {
        let out = run_command("systemctl", [verb, self.service_unit.as_str()], self.timeout).await?;
        if out.success {
            Ok(())
        } else {
            Err(Error::Workload(format!(
                "systemctl {} {} failed: {}",
                verb,
                self.service_unit,
                out.stderr.trim()
            )))
        }
    }
}

/// Value of the "Database system identifier" line
pub fn parse_system_identifier(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "Database system identifier").then(|| value.trim().to_string())
    })
}

async fn recreate_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

/// Atomically replace `path` with `document` unless it already holds it
pub async fn write_if_changed(path: &Path, document: &str) -> Result<bool> {
    match tokio::fs::read_to_string(path).await {
        Ok(existing) if existing == document => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, document).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(true)
}

#[async_trait]
impl Workload for LocalWorkload {
    async fn stop_service(&self) -> Result<()> {
        tracing::info!("Stopping {}", self.service_unit);
        self.systemctl("stop").await
    }

    async fn start_service(&self) -> Result<()> {
        tracing::info!("Starting {}", self.service_unit);
        self.systemctl("start").await
    }

    async fn service_active(&self) -> Result<bool> {
        let out = run_command(
            "systemctl",
            ["is-active", "--quiet", self.service_unit.as_str()],
            self.timeout,
        )
        .await?;
        Ok(out.success)
    }

    async fn system_identifier(&self) -> Result<String> {
        let out = run_command(&self.controldata_tool, [&self.data_dir], self.timeout).await?;
        if !out.success {
            return Err(Error::Workload(format!(
                "{} failed: {}",
                self.controldata_tool.display(),
                out.stderr.trim()
            )));
        }
        parse_system_identifier(&out.stdout)
            .ok_or_else(|| Error::Workload("no system identifier in control data".into()))
    }

    async fn archive_data_dir(&self, label: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.archive_dir).await?;
        let target = self.archive_dir.join(format!(
            "{}-{}.tar.gz",
            label,
            chrono::Utc::now().format("%Y%m%dT%H%M%S")
        ));
        let parent = self.data_dir.parent().unwrap_or_else(|| Path::new("/"));
        let name = self
            .data_dir
            .file_name()
            .ok_or_else(|| Error::Workload("data directory has no name".into()))?;
        let out = run_command(
            "tar",
            [
                OsStr::new("-czf"),
                target.as_os_str(),
                OsStr::new("-C"),
                parent.as_os_str(),
                name,
            ],
            self.timeout,
        )
        .await?;
        if !out.success {
            return Err(Error::Workload(format!("tar failed: {}", out.stderr.trim())));
        }
        Ok(target)
    }

    async fn reset_data_dir(&self) -> Result<()> {
        tracing::warn!("Wiping data directory {}", self.data_dir.display());
        recreate_dir(&self.data_dir).await
    }

    async fn discard_raft_state(&self) -> Result<()> {
        recreate_dir(&self.raft_dir).await
    }

    async fn write_supervisor_config(&self, document: &str) -> Result<bool> {
        write_if_changed(&self.config_path, document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_identifier() {
        let output = "\
pg_control version number:            1300
Catalog version number:               202307071
Database system identifier:           7301947462870211345
Database cluster state:               in production
";
        assert_eq!(
            parse_system_identifier(output).as_deref(),
            Some("7301947462870211345")
        );
        assert!(parse_system_identifier("garbage").is_none());
    }

    #[tokio::test]
    async fn test_reset_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AgentConfig::new("pg/0", "pg", "10.0.0.1");
        cfg.data_dir = dir.path().join("data");
        cfg.raft_dir = dir.path().join("raft");
        std::fs::create_dir_all(&cfg.data_dir).unwrap();
        std::fs::write(cfg.data_dir.join("PG_VERSION"), "16").unwrap();

        let workload = LocalWorkload::new(&cfg);
        workload.reset_data_dir().await.unwrap();
        assert!(cfg.data_dir.exists());
        assert_eq!(std::fs::read_dir(&cfg.data_dir).unwrap().count(), 0);

        workload.discard_raft_state().await.unwrap();
        assert!(cfg.raft_dir.exists());
    }

    #[tokio::test]
    async fn test_write_supervisor_config_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AgentConfig::new("pg/0", "pg", "10.0.0.1");
        cfg.supervisor_config_path = dir.path().join("patroni").join("patroni.json");

        let workload = LocalWorkload::new(&cfg);
        assert!(workload.write_supervisor_config("{}").await.unwrap());
        assert!(!workload.write_supervisor_config("{}").await.unwrap());
        assert!(workload.write_supervisor_config("{\"a\":1}").await.unwrap());
    }
}
