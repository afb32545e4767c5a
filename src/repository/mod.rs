pub mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    BackupId, BackupRecord, BackupStatus, BackupUpdate, Connection, ConnectionId,
    ConnectionStatus, DestinationId, NewBackup, RetentionTier, StorageDestination,
};

#[async_trait::async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn find_connection(&self, id: ConnectionId) -> Result<Option<Connection>>;

    async fn list_connections(&self) -> Result<Vec<Connection>>;

    /// Inserts or replaces by id.
    async fn save_connection(&self, connection: Connection) -> Result<Connection>;

    async fn delete_connection(&self, id: ConnectionId) -> Result<()>;

    async fn set_last_backup_at(&self, id: ConnectionId, at: DateTime<Utc>) -> Result<()>;

    /// Stores the outcome of a connectivity check.
    async fn set_test_result(
        &self,
        id: ConnectionId,
        status: ConnectionStatus,
        tested_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<Connection>;
}

#[async_trait::async_trait]
pub trait BackupRepository: Send + Sync {
    /// Persists a new record in `running` state and assigns its id.
    async fn create_backup(&self, backup: NewBackup) -> Result<BackupRecord>;

    /// Applies one transition atomically. Unknown ids are `NotFound`.
    async fn update_backup(&self, id: BackupId, update: BackupUpdate) -> Result<BackupRecord>;

    async fn find_backup(&self, id: BackupId) -> Result<Option<BackupRecord>>;

    /// Matching records, newest first.
    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>>;

    async fn delete_backup(&self, id: BackupId) -> Result<()>;

    /// When tier promotion last ran against this catalog, if ever.
    async fn last_promotion_at(&self) -> Result<Option<DateTime<Utc>>>;

    async fn set_last_promotion_at(&self, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait::async_trait]
pub trait DestinationRepository: Send + Sync {
    async fn find_destination(&self, id: DestinationId) -> Result<Option<StorageDestination>>;

    /// The single active destination flagged as default, if any.
    async fn find_default_destination(&self) -> Result<Option<StorageDestination>>;

    async fn list_destinations(&self) -> Result<Vec<StorageDestination>>;

    /// Inserts or replaces by id. Saving a destination as default clears the
    /// flag on every other destination in the same step.
    async fn save_destination(&self, destination: StorageDestination) -> Result<StorageDestination>;

    async fn delete_destination(&self, id: DestinationId) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub connection_id: Option<ConnectionId>,
    pub status: Option<BackupStatus>,
    pub retention: Option<RetentionTier>,
    pub protected: Option<bool>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
}

impl BackupFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn connection(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }

    pub fn status(mut self, status: BackupStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn retention(mut self, tier: RetentionTier) -> Self {
        self.retention = Some(tier);
        self
    }

    pub fn protected(mut self, protected: bool) -> Self {
        self.protected = Some(protected);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    /// Inclusive lower bound.
    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn matches(&self, record: &BackupRecord) -> bool {
        self.connection_id.map_or(true, |id| record.connection_id == id)
            && self.status.map_or(true, |s| record.status == s)
            && self.retention.map_or(true, |t| record.retention == t)
            && self.protected.map_or(true, |p| record.protected == p)
            && self.created_before.map_or(true, |at| record.created_at < at)
            && self.created_after.map_or(true, |at| record.created_at >= at)
    }
}
