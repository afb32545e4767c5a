use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BackupId, ConnectionId, DestinationId, TargetId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// GFS retention class. Variants are declared in promotion order, so `Ord`
/// follows hourly < daily < weekly < monthly < yearly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RetentionTier {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RetentionTier {
    pub const ALL: [RetentionTier; 5] = [
        RetentionTier::Hourly,
        RetentionTier::Daily,
        RetentionTier::Weekly,
        RetentionTier::Monthly,
        RetentionTier::Yearly,
    ];
}

impl std::fmt::Display for RetentionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RetentionTier::Hourly => "hourly",
            RetentionTier::Daily => "daily",
            RetentionTier::Weekly => "weekly",
            RetentionTier::Monthly => "monthly",
            RetentionTier::Yearly => "yearly",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupTrigger {
    Manual,
    Scheduled,
}

impl std::fmt::Display for BackupTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupTrigger::Manual => write!(f, "manual"),
            BackupTrigger::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// The artifact produced by a successful dump.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: BackupId,
    pub connection_id: ConnectionId,
    pub target_id: Option<TargetId>,
    pub database_name: String,
    pub storage_destination_id: Option<DestinationId>,
    pub status: BackupStatus,

    pub file_path: Option<String>,

    pub file_name: Option<String>,

    pub file_size: Option<u64>,

    pub checksum: Option<String>,

    pub compressed: bool,
    pub retention: RetentionTier,
    pub protected: bool,
    pub trigger: BackupTrigger,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    pub duration_seconds: Option<i64>,

    pub error_message: Option<String>,

    pub exit_code: Option<i32>,

    pub created_at: DateTime<Utc>,
}

/// Fields of a record about to be created in `running` state.
#[derive(Debug, Clone)]
pub struct NewBackup {
    pub connection_id: ConnectionId,
    pub target_id: Option<TargetId>,
    pub database_name: String,
    pub storage_destination_id: Option<DestinationId>,
    pub retention: RetentionTier,
    pub trigger: BackupTrigger,
    pub started_at: DateTime<Utc>,
}

impl NewBackup {
    pub fn into_record(self, id: BackupId) -> BackupRecord {
        BackupRecord {
            id,
            connection_id: self.connection_id,
            target_id: self.target_id,
            database_name: self.database_name,
            storage_destination_id: self.storage_destination_id,
            status: BackupStatus::Running,
            file_path: None,
            file_name: None,
            file_size: None,
            checksum: None,
            compressed: true,
            retention: self.retention,
            protected: false,
            trigger: self.trigger,
            started_at: Some(self.started_at),
            finished_at: None,
            duration_seconds: None,
            error_message: None,
            exit_code: None,
            created_at: self.started_at,
        }
    }
}

/// A single state transition, applied atomically to one record.
#[derive(Debug, Clone)]
pub enum BackupUpdate {
    Completed {
        artifact: Artifact,
        finished_at: DateTime<Utc>,
    },
    Failed {
        message: String,
        exit_code: Option<i32>,
        finished_at: DateTime<Utc>,
    },
    /// The dump succeeded but the remote copy did not; the local artifact
    /// reference is kept for manual recovery.
    UploadFailed {
        artifact: Artifact,
        message: String,
        finished_at: DateTime<Utc>,
    },
    Cancelled {
        finished_at: DateTime<Utc>,
    },
    Promote(RetentionTier),
    SetProtected(bool),
}

impl BackupRecord {
    pub fn is_successful(&self) -> bool {
        self.status == BackupStatus::Completed
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, BackupStatus::Running | BackupStatus::Pending)
    }

    pub fn can_be_deleted(&self) -> bool {
        !self.protected && !self.is_running()
    }

    /// Applies a transition. Returns whether anything changed.
    pub fn apply(&mut self, update: BackupUpdate) -> bool {
        match update {
            BackupUpdate::Completed {
                artifact,
                finished_at,
            } => {
                self.set_artifact(artifact);
                self.status = BackupStatus::Completed;
                self.exit_code = Some(0);
                self.error_message = None;
                self.finish(finished_at);
                true
            }
            BackupUpdate::Failed {
                message,
                exit_code,
                finished_at,
            } => {
                self.status = BackupStatus::Failed;
                self.error_message = Some(message);
                self.exit_code = exit_code;
                self.finish(finished_at);
                true
            }
            BackupUpdate::UploadFailed {
                artifact,
                message,
                finished_at,
            } => {
                self.set_artifact(artifact);
                self.status = BackupStatus::Failed;
                self.exit_code = Some(0);
                self.error_message = Some(message);
                self.finish(finished_at);
                true
            }
            BackupUpdate::Cancelled { finished_at } => {
                self.status = BackupStatus::Cancelled;
                self.error_message = Some("Backup cancelled".to_string());
                self.finish(finished_at);
                true
            }
            BackupUpdate::Promote(tier) => {
                if tier > self.retention {
                    self.retention = tier;
                    true
                } else {
                    false
                }
            }
            BackupUpdate::SetProtected(protected) => {
                let changed = self.protected != protected;
                self.protected = protected;
                changed
            }
        }
    }

    fn set_artifact(&mut self, artifact: Artifact) {
        self.file_path = Some(artifact.file_path);
        self.file_name = Some(artifact.file_name);
        self.file_size = Some(artifact.file_size);
        self.checksum = Some(artifact.checksum);
    }

    fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
        if let Some(started_at) = self.started_at {
            self.duration_seconds = Some((finished_at - started_at).num_seconds().max(0));
        }
    }

    pub fn formatted_size(&self) -> String {
        match self.file_size {
            Some(size) => crate::space::format_bytes(size),
            None => "N/A".to_string(),
        }
    }

    pub fn formatted_duration(&self) -> String {
        let Some(total) = self.duration_seconds else {
            return "N/A".to_string();
        };
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let seconds = total % 60;
        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}
