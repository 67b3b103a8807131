//! Shared secrets
//!
//! Credential bundles are referenced from the coordination channel by an
//! opaque id and fetched out-of-band. A secret is readable by the deployment
//! that created it and by every deployment it was granted to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::common::{generate_password, Error, Result};

/// Passwords exchanged between linked deployments or with a witness
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedSecret {
    #[serde(default)]
    pub superuser_password: String,
    #[serde(default)]
    pub replication_password: String,
    #[serde(default)]
    pub raft_password: String,
}

impl SharedSecret {
    pub fn generate() -> Self {
        Self {
            superuser_password: generate_password(),
            replication_password: generate_password(),
            raft_password: generate_password(),
        }
    }

    /// Only the raft password, for a witness
    pub fn raft_only(&self) -> Self {
        Self {
            raft_password: self.raft_password.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SecretRecord {
    owner: String,
    #[serde(default)]
    granted: BTreeSet<String>,
    secret: SharedSecret,
}

impl SecretRecord {
    fn readable_by(&self, reader: &str) -> bool {
        self.owner == reader || self.granted.contains(reader)
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store a secret owned by `owner`, returning its id
    async fn create(&self, owner: &str, secret: &SharedSecret) -> Result<String>;

    /// Let `grantee` read the secret
    async fn grant(&self, id: &str, grantee: &str) -> Result<()>;

    async fn fetch(&self, id: &str, reader: &str) -> Result<SharedSecret>;
}

fn new_secret_id() -> String {
    format!("secret:{}", uuid::Uuid::new_v4().simple())
}

fn unreadable(id: &str, reader: &str) -> Error {
    Error::Secret(format!("{} cannot read {}", reader, id))
}

#[derive(Default)]
pub struct MemorySecretStore {
    records: Mutex<HashMap<String, SecretRecord>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SecretRecord>>> {
        self.records
            .lock()
            .map_err(|_| Error::Secret("secret store poisoned".into()))
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn create(&self, owner: &str, secret: &SharedSecret) -> Result<String> {
        let id = new_secret_id();
        self.lock()?.insert(
            id.clone(),
            SecretRecord {
                owner: owner.to_string(),
                granted: BTreeSet::new(),
                secret: secret.clone(),
            },
        );
        Ok(id)
    }

    async fn grant(&self, id: &str, grantee: &str) -> Result<()> {
        let mut records = self.lock()?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::Secret(format!("unknown secret {}", id)))?;
        record.granted.insert(grantee.to_string());
        Ok(())
    }

    async fn fetch(&self, id: &str, reader: &str) -> Result<SharedSecret> {
        let records = self.lock()?;
        match records.get(id) {
            Some(r) if r.readable_by(reader) => Ok(r.secret.clone()),
            Some(_) => Err(unreadable(id, reader)),
            None => Err(Error::Secret(format!("unknown secret {}", id))),
        }
    }
}

/// One JSON document per secret in a shared directory
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let name = id
            .strip_prefix("secret:")
            .filter(|n| n.chars().all(|c| c.is_ascii_alphanumeric()))
            .ok_or_else(|| Error::Secret(format!("malformed secret id {}", id)))?;
        Ok(self.dir.join(format!("{}.json", name)))
    }

    async fn load(&self, id: &str) -> Result<SecretRecord> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::Secret(format!("unknown secret {}", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, id: &str, record: &SecretRecord) -> Result<()> {
        let path = self.path_for(id)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn create(&self, owner: &str, secret: &SharedSecret) -> Result<String> {
        let id = new_secret_id();
        let record = SecretRecord {
            owner: owner.to_string(),
            granted: BTreeSet::new(),
            secret: secret.clone(),
        };
        self.store(&id, &record).await?;
        Ok(id)
    }

    async fn grant(&self, id: &str, grantee: &str) -> Result<()> {
        let mut record = self.load(id).await?;
        if record.granted.insert(grantee.to_string()) {
            self.store(id, &record).await?;
        }
        Ok(())
    }

    async fn fetch(&self, id: &str, reader: &str) -> Result<SharedSecret> {
        let record = self.load(id).await?;
        if !record.readable_by(reader) {
            return Err(unreadable(id, reader));
        }
        Ok(record.secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_grant_and_fetch() {
        let store = MemorySecretStore::new();
        let secret = SharedSecret::generate();
        let id = store.create("east", &secret).await.unwrap();

        assert_eq!(store.fetch(&id, "east").await.unwrap(), secret);
        assert!(matches!(
            store.fetch(&id, "west").await,
            Err(Error::Secret(_))
        ));

        store.grant(&id, "west").await.unwrap();
        assert_eq!(store.fetch(&id, "west").await.unwrap(), secret);
        assert!(store.grant("secret:missing", "west").await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let secret = SharedSecret::generate();
        let id = {
            let store = FileSecretStore::open(dir.path()).unwrap();
            let id = store.create("east", &secret.raft_only()).await.unwrap();
            store.grant(&id, "witness").await.unwrap();
            id
        };

        let store = FileSecretStore::open(dir.path()).unwrap();
        let fetched = store.fetch(&id, "witness").await.unwrap();
        assert_eq!(fetched.raft_password, secret.raft_password);
        assert!(fetched.superuser_password.is_empty());
        assert!(store.fetch("../../etc/passwd", "east").await.is_err());
    }
}
