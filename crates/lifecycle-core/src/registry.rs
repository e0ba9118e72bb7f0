//! Registration store
//!
//! Durable record of tenant registrations. Writes are conditional on the
//! record's `version`: an update carrying a stale version fails with
//! [`RegistryError::VersionConflict`] and the caller re-reads and retries.

use crate::error::RegistryError;
use crate::types::{RegistrationId, TenantId, TenantRegistration};
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Storage of tenant registrations
#[async_trait::async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Record a new registration
    async fn insert(&self, registration: TenantRegistration)
        -> Result<TenantRegistration, RegistryError>;

    /// Fetch by id
    async fn get(&self, id: RegistrationId) -> Result<Option<TenantRegistration>, RegistryError>;

    /// Replace a registration whose stored version equals `registration.version`.
    /// Returns the stored record with its version bumped.
    async fn update(&self, registration: TenantRegistration)
        -> Result<TenantRegistration, RegistryError>;

    /// All registrations in creation order
    async fn list(&self) -> Result<Vec<TenantRegistration>, RegistryError>;

    /// Registrations for a tenant id, newest first
    async fn find_by_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<TenantRegistration>, RegistryError> {
        let mut found: Vec<_> = self
            .list()
            .await?
            .into_iter()
            .filter(|r| &r.tenant_id == tenant_id)
            .collect();
        found.reverse();
        Ok(found)
    }
}

type Records = IndexMap<RegistrationId, TenantRegistration>;

fn insert_record(
    records: &mut Records,
    registration: TenantRegistration,
) -> Result<TenantRegistration, RegistryError> {
    if records.contains_key(&registration.id) {
        return Err(RegistryError::AlreadyExists(registration.id));
    }
    records.insert(registration.id, registration.clone());
    Ok(registration)
}

fn update_record(
    records: &mut Records,
    mut registration: TenantRegistration,
) -> Result<TenantRegistration, RegistryError> {
    let stored = records
        .get_mut(&registration.id)
        .ok_or(RegistryError::NotFound(registration.id))?;
    if stored.version != registration.version {
        return Err(RegistryError::VersionConflict {
            id: registration.id,
            expected: registration.version,
            found: stored.version,
        });
    }
    registration.version += 1;
    registration.updated_at = Utc::now();
    *stored = registration.clone();
    Ok(registration)
}

/// Registration store held in process memory
#[derive(Debug, Default)]
pub struct InMemoryRegistrationStore {
    records: RwLock<Records>,
}

impl InMemoryRegistrationStore {
    /// Create empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RegistrationStore for InMemoryRegistrationStore {
    async fn insert(
        &self,
        registration: TenantRegistration,
    ) -> Result<TenantRegistration, RegistryError> {
        insert_record(&mut self.records.write(), registration)
    }

    async fn get(&self, id: RegistrationId) -> Result<Option<TenantRegistration>, RegistryError> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn update(
        &self,
        registration: TenantRegistration,
    ) -> Result<TenantRegistration, RegistryError> {
        update_record(&mut self.records.write(), registration)
    }

    async fn list(&self) -> Result<Vec<TenantRegistration>, RegistryError> {
        Ok(self.records.read().values().cloned().collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    format: u32,
    registrations: Vec<TenantRegistration>,
}

const SNAPSHOT_FORMAT: u32 = 1;

/// Registration store persisted as a JSON snapshot
///
/// Every write rewrites the snapshot to a sibling temp file, syncs it and
/// renames it over the original, then syncs the directory. A crash or power
/// loss leaves either the old or the new snapshot.
#[derive(Debug)]
pub struct FileRegistrationStore {
    path: PathBuf,
    records: Mutex<Records>,
}

impl FileRegistrationStore {
    /// Open the snapshot at `path`, starting empty if it does not exist
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                if snapshot.format != SNAPSHOT_FORMAT {
                    return Err(RegistryError::Storage(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unsupported snapshot format {}", snapshot.format),
                    )));
                }
                snapshot
                    .registrations
                    .into_iter()
                    .map(|r| (r.id, r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Records::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(path = %path.display(), registrations = records.len(), "registration store opened");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Snapshot location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &Records) -> Result<(), RegistryError> {
        let snapshot = Snapshot {
            format: SNAPSHOT_FORMAT,
            registrations: records.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        self.sync_parent().await
    }

    /// Flush the directory entry so the rename survives power loss
    #[cfg(unix)]
    async fn sync_parent(&self) -> Result<(), RegistryError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        tokio::fs::File::open(parent).await?.sync_all().await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn sync_parent(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl RegistrationStore for FileRegistrationStore {
    async fn insert(
        &self,
        registration: TenantRegistration,
    ) -> Result<TenantRegistration, RegistryError> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        let stored = insert_record(&mut next, registration)?;
        self.persist(&next).await?;
        *records = next;
        Ok(stored)
    }

    async fn get(&self, id: RegistrationId) -> Result<Option<TenantRegistration>, RegistryError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn update(
        &self,
        registration: TenantRegistration,
    ) -> Result<TenantRegistration, RegistryError> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        let stored = update_record(&mut next, registration)?;
        self.persist(&next).await?;
        *records = next;
        Ok(stored)
    }

    async fn list(&self) -> Result<Vec<TenantRegistration>, RegistryError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RegistrationRequest, TenantStatus, Tier};
    use pretty_assertions::assert_eq;

    fn registration(tenant: &str) -> TenantRegistration {
        TenantRegistration::new(&RegistrationRequest::new(tenant, "ops@example.com", Tier::Basic))
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let store = InMemoryRegistrationStore::new();
        let stored = store.insert(registration("acme")).await.unwrap();

        let mut next = stored.clone();
        next.status = TenantStatus::Provisioning;
        let updated = store.update(next).await.unwrap();

        assert_eq!(updated.version, 1);
        assert_eq!(
            store.get(stored.id).await.unwrap().unwrap().status,
            TenantStatus::Provisioning
        );
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = InMemoryRegistrationStore::new();
        let stored = store.insert(registration("acme")).await.unwrap();
        store.update(stored.clone()).await.unwrap();

        let err = store.update(stored).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryRegistrationStore::new();
        let stored = store.insert(registration("acme")).await.unwrap();
        assert!(matches!(
            store.insert(stored).await,
            Err(RegistryError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn find_by_tenant_returns_newest_first() {
        let store = InMemoryRegistrationStore::new();
        let first = store.insert(registration("acme")).await.unwrap();
        store.insert(registration("other")).await.unwrap();
        let second = store.insert(registration("acme")).await.unwrap();

        let found = store.find_by_tenant(&TenantId::new("acme")).await.unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("registrations.json");

        let stored = {
            let store = FileRegistrationStore::open(&path).await.unwrap();
            let stored = store.insert(registration("acme")).await.unwrap();
            let mut next = stored.clone();
            next.status = TenantStatus::Provisioning;
            store.update(next).await.unwrap()
        };

        let reopened = FileRegistrationStore::open(&path).await.unwrap();
        let loaded = reopened.get(stored.id).await.unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registrations.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        assert!(matches!(
            FileRegistrationStore::open(&path).await,
            Err(RegistryError::Serialization(_))
        ));
    }
}
