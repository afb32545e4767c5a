use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{BackupFilter, BackupRepository, ConnectionRepository, DestinationRepository};
use crate::error::{BackupError, Result};
use crate::model::{
    BackupId, BackupRecord, BackupUpdate, Connection, ConnectionId, ConnectionStatus,
    DestinationId, NewBackup, StorageDestination,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackupCatalog {
    next_id: BackupId,
    backups: BTreeMap<BackupId, BackupRecord>,
    #[serde(default)]
    last_promotion_at: Option<DateTime<Utc>>,
}

/// In-process store for all three repositories. Backup records can be
/// snapshotted to a JSON catalog so history survives restarts; connections
/// and destinations come from the configuration file on every start.
pub struct MemoryStore {
    connections: RwLock<BTreeMap<ConnectionId, Connection>>,
    destinations: RwLock<BTreeMap<DestinationId, StorageDestination>>,
    backups: RwLock<BackupCatalog>,
    catalog_path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            destinations: RwLock::new(BTreeMap::new()),
            backups: RwLock::new(BackupCatalog {
                next_id: 1,
                backups: BTreeMap::new(),
                last_promotion_at: None,
            }),
            catalog_path: None,
        }
    }

    /// Opens a store backed by `path`, loading existing records if the file
    /// exists. Records left `running` by a previous process stay as they
    /// were; callers decide how to reconcile them.
    pub async fn with_catalog(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut store = Self::new();

        if tokio::fs::try_exists(&path).await? {
            let contents = tokio::fs::read_to_string(&path).await?;
            let mut catalog: BackupCatalog = serde_json::from_str(&contents)?;
            let max_id = catalog.backups.keys().next_back().copied().unwrap_or(0);
            catalog.next_id = catalog.next_id.max(max_id + 1);
            info!("Loaded {} backup records from {:?}", catalog.backups.len(), path);
            store.backups = RwLock::new(catalog);
        } else {
            debug!("Backup catalog not found at {:?}, starting empty", path);
        }

        store.catalog_path = Some(path);
        Ok(store)
    }

    pub fn catalog_path(&self) -> Option<&Path> {
        self.catalog_path.as_deref()
    }

    /// Writes the catalog through a temporary file. Callers roll back their
    /// in-memory change when this fails.
    async fn persist(&self, catalog: &BackupCatalog) -> Result<()> {
        let Some(path) = &self.catalog_path else {
            return Ok(());
        };

        let write = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let contents = serde_json::to_string_pretty(catalog)?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, contents).await?;
            tokio::fs::rename(&tmp, path).await?;
            Ok::<(), BackupError>(())
        };
        write.await.map_err(|e| {
            BackupError::Repository(format!("failed to write catalog {}: {}", path.display(), e))
        })
    }
}

#[async_trait::async_trait]
impl ConnectionRepository for MemoryStore {
    async fn find_connection(&self, id: ConnectionId) -> Result<Option<Connection>> {
        Ok(self.connections.read().await.get(&id).cloned())
    }

    async fn list_connections(&self) -> Result<Vec<Connection>> {
        Ok(self.connections.read().await.values().cloned().collect())
    }

    async fn save_connection(&self, connection: Connection) -> Result<Connection> {
        self.connections
            .write()
            .await
            .insert(connection.id, connection.clone());
        Ok(connection)
    }

    async fn delete_connection(&self, id: ConnectionId) -> Result<()> {
        self.connections.write().await.remove(&id);
        Ok(())
    }

    async fn set_last_backup_at(&self, id: ConnectionId, at: DateTime<Utc>) -> Result<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or_else(|| BackupError::NotFound(format!("connection {}", id)))?;
        connection.last_backup_at = Some(at);
        Ok(())
    }

    async fn set_test_result(
        &self,
        id: ConnectionId,
        status: ConnectionStatus,
        tested_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<Connection> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or_else(|| BackupError::NotFound(format!("connection {}", id)))?;
        connection.status = status;
        connection.last_tested_at = Some(tested_at);
        connection.last_error = error;
        Ok(connection.clone())
    }
}

#[async_trait::async_trait]
impl BackupRepository for MemoryStore {
    async fn create_backup(&self, backup: NewBackup) -> Result<BackupRecord> {
        let mut catalog = self.backups.write().await;
        let id = catalog.next_id;
        let record = backup.into_record(id);

        catalog.next_id += 1;
        catalog.backups.insert(id, record.clone());
        if let Err(e) = self.persist(&catalog).await {
            catalog.backups.remove(&id);
            catalog.next_id = id;
            return Err(e);
        }
        Ok(record)
    }

    async fn update_backup(&self, id: BackupId, update: BackupUpdate) -> Result<BackupRecord> {
        let mut catalog = self.backups.write().await;
        let record = catalog
            .backups
            .get_mut(&id)
            .ok_or_else(|| BackupError::NotFound(format!("backup {}", id)))?;

        let previous = record.clone();
        if !record.apply(update) {
            return Ok(previous);
        }
        let updated = record.clone();
        if let Err(e) = self.persist(&catalog).await {
            catalog.backups.insert(id, previous);
            return Err(e);
        }
        Ok(updated)
    }

    async fn find_backup(&self, id: BackupId) -> Result<Option<BackupRecord>> {
        Ok(self.backups.read().await.backups.get(&id).cloned())
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        let catalog = self.backups.read().await;
        let mut records: Vec<BackupRecord> = catalog
            .backups
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    async fn delete_backup(&self, id: BackupId) -> Result<()> {
        let mut catalog = self.backups.write().await;
        let Some(removed) = catalog.backups.remove(&id) else {
            return Err(BackupError::NotFound(format!("backup {}", id)));
        };
        if let Err(e) = self.persist(&catalog).await {
            catalog.backups.insert(id, removed);
            return Err(e);
        }
        Ok(())
    }

    async fn last_promotion_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.backups.read().await.last_promotion_at)
    }

    async fn set_last_promotion_at(&self, at: DateTime<Utc>) -> Result<()> {
        let mut catalog = self.backups.write().await;
        let previous = catalog.last_promotion_at.replace(at);
        if let Err(e) = self.persist(&catalog).await {
            catalog.last_promotion_at = previous;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DestinationRepository for MemoryStore {
    async fn find_destination(&self, id: DestinationId) -> Result<Option<StorageDestination>> {
        Ok(self.destinations.read().await.get(&id).cloned())
    }

    async fn find_default_destination(&self) -> Result<Option<StorageDestination>> {
        Ok(self
            .destinations
            .read()
            .await
            .values()
            .find(|d| d.is_default && d.is_active())
            .cloned())
    }

    async fn list_destinations(&self) -> Result<Vec<StorageDestination>> {
        Ok(self.destinations.read().await.values().cloned().collect())
    }

    async fn save_destination(&self, destination: StorageDestination) -> Result<StorageDestination> {
        let mut destinations = self.destinations.write().await;
        if destination.is_default {
            for other in destinations.values_mut() {
                if other.id != destination.id {
                    other.is_default = false;
                }
            }
        }
        destinations.insert(destination.id, destination.clone());
        Ok(destination)
    }

    async fn delete_destination(&self, id: DestinationId) -> Result<()> {
        self.destinations.write().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BackupStatus, BackupTrigger, DestinationKind, DestinationStatus, RetentionTier,
    };
    use chrono::Duration;
    use tempfile::tempdir;

    fn destination(id: DestinationId, is_default: bool) -> StorageDestination {
        StorageDestination {
            id,
            name: format!("dest-{}", id),
            kind: DestinationKind::Local,
            config_encrypted: String::new(),
            status: DestinationStatus::Active,
            is_default,
        }
    }

    fn new_backup(connection_id: ConnectionId, started_at: DateTime<Utc>) -> NewBackup {
        NewBackup {
            connection_id,
            target_id: None,
            database_name: "app".to_string(),
            storage_destination_id: None,
            retention: RetentionTier::Hourly,
            trigger: BackupTrigger::Manual,
            started_at,
        }
    }

    #[tokio::test]
    async fn test_new_default_replaces_previous() {
        let store = MemoryStore::new();
        store.save_destination(destination(1, true)).await.unwrap();
        store.save_destination(destination(2, true)).await.unwrap();

        let all = store.list_destinations().await.unwrap();
        let defaults: Vec<_> = all.iter().filter(|d| d.is_default && d.is_active()).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, 2);
        assert_eq!(store.find_default_destination().await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_inactive_default_is_ignored() {
        let store = MemoryStore::new();
        let mut inactive = destination(1, true);
        inactive.status = DestinationStatus::Inactive;
        store.save_destination(inactive).await.unwrap();
        assert!(store.find_default_destination().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_backup_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_backup(99, BackupUpdate::SetProtected(true))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_newest_first() {
        let store = MemoryStore::new();
        let base = Utc::now() - Duration::days(3);
        for i in 0..3 {
            store
                .create_backup(new_backup(1, base + Duration::days(i)))
                .await
                .unwrap();
        }
        store.create_backup(new_backup(2, base)).await.unwrap();

        let records = store
            .list_backups(&BackupFilter::all().connection(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].created_at > records[1].created_at);

        let older = store
            .list_backups(&BackupFilter::all().created_before(base + Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(older.len(), 2);
        assert!(older.iter().all(|r| r.status == BackupStatus::Running));
    }

    #[tokio::test]
    async fn test_catalog_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let store = MemoryStore::with_catalog(&path).await.unwrap();
        let record = store.create_backup(new_backup(1, Utc::now())).await.unwrap();
        store
            .update_backup(record.id, BackupUpdate::SetProtected(true))
            .await
            .unwrap();
        assert!(store.last_promotion_at().await.unwrap().is_none());
        store.set_last_promotion_at(record.created_at).await.unwrap();
        drop(store);

        let reopened = MemoryStore::with_catalog(&path).await.unwrap();
        let loaded = reopened.find_backup(record.id).await.unwrap().unwrap();
        assert!(loaded.protected);
        assert_eq!(reopened.last_promotion_at().await.unwrap(), Some(record.created_at));

        let next = reopened.create_backup(new_backup(1, Utc::now())).await.unwrap();
        assert!(next.id > record.id);
    }

    #[tokio::test]
    async fn test_failed_catalog_write_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let store = MemoryStore::with_catalog(&path).await.unwrap();
        let record = store.create_backup(new_backup(1, Utc::now())).await.unwrap();

        std::fs::create_dir(dir.path().join("catalog.json.tmp")).unwrap();

        let err = store.create_backup(new_backup(1, Utc::now())).await.unwrap_err();
        assert!(matches!(err, BackupError::Repository(_)));
        let running = store
            .list_backups(&BackupFilter::all().status(BackupStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, record.id);

        assert!(store
            .update_backup(record.id, BackupUpdate::SetProtected(true))
            .await
            .is_err());
        assert!(!store.find_backup(record.id).await.unwrap().unwrap().protected);

        assert!(store.delete_backup(record.id).await.is_err());
        assert!(store.find_backup(record.id).await.unwrap().is_some());

        std::fs::remove_dir(dir.path().join("catalog.json.tmp")).unwrap();
        let next = store.create_backup(new_backup(1, Utc::now())).await.unwrap();
        assert_eq!(next.id, record.id + 1);
    }
}
