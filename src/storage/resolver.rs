use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{create_backend, DownloadStream, LocalBackend, StorageBackend};
use crate::crypto::CredentialVault;
use crate::error::{BackupError, Result};
use crate::model::{BackupRecord, Connection, DestinationConfig, StorageDestination};
use crate::repository::DestinationRepository;

/// A destination together with its decrypted settings.
#[derive(Debug, Clone)]
pub struct ResolvedDestination {
    pub destination: StorageDestination,
    pub config: DestinationConfig,
}

impl ResolvedDestination {
    pub fn is_local(&self) -> bool {
        self.config.is_local()
    }

    pub fn label(&self) -> String {
        format!("{} ({})", self.destination.name, self.destination.kind)
    }
}

/// Maps connections and backup records to the place their artifacts live.
pub struct ArtifactStore {
    destinations: Arc<dyn DestinationRepository>,
    vault: Arc<CredentialVault>,
    default_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(
        destinations: Arc<dyn DestinationRepository>,
        vault: Arc<CredentialVault>,
        default_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            destinations,
            vault,
            default_dir: default_dir.into(),
        }
    }

    fn decode(&self, destination: StorageDestination) -> Result<ResolvedDestination> {
        let config = self.vault.decrypt_config(&destination.config_encrypted)?;
        if config.kind() != destination.kind {
            return Err(BackupError::Config(format!(
                "destination '{}' is declared as {} but its settings are {}",
                destination.name,
                destination.kind,
                config.kind()
            )));
        }
        Ok(ResolvedDestination {
            destination,
            config,
        })
    }

    /// The connection's own destination when it exists and is active,
    /// otherwise the active default, otherwise none.
    pub async fn resolve_for_connection(&self, connection: &Connection) -> Result<Option<ResolvedDestination>> {
        if let Some(id) = connection.storage_destination_id {
            match self.destinations.find_destination(id).await? {
                Some(destination) if destination.is_active() => return self.decode(destination).map(Some),
                Some(_) => debug!("Destination {} of connection {} is inactive", id, connection.name),
                None => warn!("Destination {} of connection {} no longer exists", id, connection.name),
            }
        }

        match self.destinations.find_default_destination().await? {
            Some(destination) => self.decode(destination).map(Some),
            None => Ok(None),
        }
    }

    /// The destination a record was written to, whatever its current status.
    pub async fn resolve_for_backup(&self, record: &BackupRecord) -> Result<Option<ResolvedDestination>> {
        let Some(id) = record.storage_destination_id else {
            return Ok(None);
        };
        match self.destinations.find_destination(id).await? {
            Some(destination) => self.decode(destination).map(Some),
            None => Ok(None),
        }
    }

    pub fn default_dir(&self) -> &PathBuf {
        &self.default_dir
    }

    pub fn local_base_path(&self, resolved: Option<&ResolvedDestination>) -> PathBuf {
        match resolved.map(|r| &r.config) {
            Some(DestinationConfig::Local(settings)) => settings
                .base_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| self.default_dir.clone()),
            _ => self.default_dir.clone(),
        }
    }

    pub fn local_full_path(&self, resolved: Option<&ResolvedDestination>, key: &str) -> PathBuf {
        self.local_base_path(resolved).join(key.trim_start_matches('/'))
    }

    pub fn backend(&self, resolved: &ResolvedDestination) -> Box<dyn StorageBackend> {
        create_backend(&resolved.config, &self.local_base_path(Some(resolved)))
    }

    /// Removes the local copy, then the remote object. Either being absent
    /// already counts as success.
    pub async fn delete_artifact(&self, record: &BackupRecord) -> Result<()> {
        let Some(key) = record.file_path.as_deref() else {
            return Ok(());
        };
        let resolved = self.resolve_for_backup(record).await?;

        let local = LocalBackend::new(self.local_base_path(resolved.as_ref()));
        local.delete(key).await?;

        if let Some(resolved) = resolved.filter(|r| !r.is_local()) {
            self.backend(&resolved).delete(key).await?;
        }
        debug!("Deleted artifact {} of backup {}", key, record.id);
        Ok(())
    }

    /// Opens the artifact for reading, preferring a local copy.
    pub async fn open_artifact(&self, record: &BackupRecord) -> Result<DownloadStream> {
        let key = record
            .file_path
            .as_deref()
            .ok_or_else(|| BackupError::NotFound(format!("backup {} has no artifact", record.id)))?;
        let resolved = self.resolve_for_backup(record).await?;

        let local_path = self.local_full_path(resolved.as_ref(), key);
        if tokio::fs::try_exists(&local_path).await? {
            return LocalBackend::new(self.local_base_path(resolved.as_ref()))
                .download_stream(key)
                .await;
        }

        match resolved.filter(|r| !r.is_local()) {
            Some(resolved) => self.backend(&resolved).download_stream(key).await,
            None => Err(BackupError::NotFound(format!(
                "artifact {} of backup {}",
                local_path.display(),
                record.id
            ))),
        }
    }
}
