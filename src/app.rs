use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::compression::verify_checksum;
use crate::backup::{
    BackupExecutor, ConnectionInspector, DumpCommandBuilder, ExecuteAllSummary, Scheduler,
    VendorDumpCommands,
};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::crypto::CredentialVault;
use crate::error::{BackupError, Result};
use crate::model::{
    BackupId, BackupRecord, BackupStatus, BackupTrigger, BackupUpdate, Connection, ConnectionId,
    DestinationConfig, StorageDestination,
};
use crate::repository::{
    BackupFilter, BackupRepository, ConnectionRepository, DestinationRepository, MemoryStore,
};
use crate::retention::RetentionManager;
use crate::space::{SpaceInfo, SpaceMonitor};
use crate::storage::ArtifactStore;

/// Every engine component wired from one configuration.
pub struct App {
    pub config: AppConfig,
    pub store: Arc<MemoryStore>,
    pub vault: Arc<CredentialVault>,
    pub artifacts: Arc<ArtifactStore>,
    pub space: Arc<SpaceMonitor>,
    pub executor: Arc<BackupExecutor>,
    pub retention: Arc<RetentionManager>,
    pub inspector: ConnectionInspector,
    pub scheduler: Scheduler,
}

impl App {
    pub async fn bootstrap(config: AppConfig) -> Result<Self> {
        Self::bootstrap_with(config, Arc::new(SystemClock), Arc::new(VendorDumpCommands)).await
    }

    pub async fn bootstrap_with(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        dump_commands: Arc<dyn DumpCommandBuilder>,
    ) -> Result<Self> {
        let vault = Arc::new(config.vault()?);
        let store = Arc::new(match &config.catalog_path {
            Some(path) => MemoryStore::with_catalog(path).await?,
            None => MemoryStore::new(),
        });

        for entry in &config.destinations {
            store.save_destination(entry.to_destination(&vault)?).await?;
        }
        for entry in &config.connections {
            store.save_connection(entry.to_connection(&vault)?).await?;
        }
        reconcile_catalog(&store, clock.as_ref()).await?;

        let artifacts = Arc::new(ArtifactStore::new(
            store.clone(),
            vault.clone(),
            config.local_backup_dir.clone(),
        ));
        let space = Arc::new(SpaceMonitor::new(config.low_space_threshold_percent));
        let executor = Arc::new(
            BackupExecutor::new(
                store.clone(),
                store.clone(),
                artifacts.clone(),
                vault.clone(),
                space.clone(),
                clock.clone(),
            )
            .with_dump_commands(dump_commands.clone()),
        );
        let inspector = ConnectionInspector::new(store.clone(), vault.clone(), dump_commands, clock.clone());
        let retention = Arc::new(RetentionManager::new(
            store.clone(),
            artifacts.clone(),
            clock.clone(),
            config.retention,
        ));
        let scheduler = Scheduler::new(
            store.clone(),
            executor.clone(),
            retention.clone(),
            clock,
            config.retention_run_at,
        );

        info!(
            "Loaded {} connections and {} destinations",
            config.connections.len(),
            config.destinations.len()
        );

        Ok(Self {
            config,
            store,
            vault,
            artifacts,
            space,
            executor,
            retention,
            inspector,
            scheduler,
        })
    }

    pub async fn connection(&self, id: ConnectionId) -> Result<Connection> {
        self.store
            .find_connection(id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("connection {}", id)))
    }

    pub async fn connections(&self) -> Result<Vec<Connection>> {
        self.store.list_connections().await
    }

    /// Backs up one named database of a connection, or all its enabled ones.
    pub async fn backup(&self, connection_id: ConnectionId, database: Option<&str>) -> Result<ExecuteAllSummary> {
        let connection = self.connection(connection_id).await?;
        let _running = self.scheduler.reserve(connection_id).ok_or_else(|| {
            BackupError::Refused(format!("a backup of '{}' is already running", connection.name))
        })?;

        let Some(database) = database else {
            return Ok(self.executor.execute_all(&connection, BackupTrigger::Manual).await);
        };

        let target = connection
            .targets
            .iter()
            .find(|t| t.name == database)
            .ok_or_else(|| {
                BackupError::NotFound(format!("database '{}' on connection '{}'", database, connection.name))
            })?;
        let outcome = self.executor.execute(&connection, target, BackupTrigger::Manual).await?;
        let success = outcome.result.success;
        Ok(ExecuteAllSummary {
            total_databases: 1,
            successful: usize::from(success),
            failed: usize::from(!success),
            results: vec![outcome.result],
        })
    }

    pub async fn backups(&self, connection: Option<ConnectionId>) -> Result<Vec<BackupRecord>> {
        let filter = match connection {
            Some(id) => BackupFilter::all().connection(id),
            None => BackupFilter::all(),
        };
        self.store.list_backups(&filter).await
    }

    /// Decompresses the artifact and compares it with the recorded checksum.
    /// Returns the uncompressed size.
    pub async fn verify(&self, id: BackupId) -> Result<u64> {
        let record = self
            .store
            .find_backup(id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("backup #{}", id)))?;
        let checksum = record
            .checksum
            .as_deref()
            .ok_or_else(|| BackupError::Integrity(format!("backup #{} has no checksum", id)))?;

        let stream = self.artifacts.open_artifact(&record).await?;
        let size = verify_checksum(stream.reader, checksum).await?;
        info!("Backup #{} verified ({} bytes uncompressed)", id, size);
        Ok(size)
    }

    /// Destinations with their settings decoded and every secret masked.
    pub async fn destinations(&self) -> Result<Vec<(StorageDestination, DestinationConfig)>> {
        let mut listed = Vec::new();
        for destination in self.store.list_destinations().await? {
            let config = self.vault.decrypt_config(&destination.config_encrypted)?;
            listed.push((destination, config.redacted()));
        }
        Ok(listed)
    }

    pub fn space_info(&self) -> Option<SpaceInfo> {
        self.space.space_info(&self.config.local_backup_dir)
    }
}

/// Records still `running` belong to a process that is gone; they are marked
/// failed. Connections get their last successful backup time back.
async fn reconcile_catalog(store: &MemoryStore, clock: &dyn Clock) -> Result<()> {
    let stale = store
        .list_backups(&BackupFilter::all().status(BackupStatus::Running))
        .await?;
    for record in &stale {
        store
            .update_backup(
                record.id,
                BackupUpdate::Failed {
                    message: "Interrupted before completion".to_string(),
                    exit_code: None,
                    finished_at: clock.now_utc(),
                },
            )
            .await?;
    }
    if !stale.is_empty() {
        warn!("Marked {} interrupted backups as failed", stale.len());
    }

    for connection in store.list_connections().await? {
        let latest = store
            .list_backups(
                &BackupFilter::all()
                    .connection(connection.id)
                    .status(BackupStatus::Completed),
            )
            .await?
            .into_iter()
            .next();
        if let Some(at) = latest.and_then(|r| r.finished_at) {
            store.set_last_backup_at(connection.id, at).await?;
        }
    }
    Ok(())
}
