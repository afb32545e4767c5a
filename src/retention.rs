use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::calendar::{prune_cutoff, Period};
use crate::clock::Clock;
use crate::error::{BackupError, Result};
use crate::model::{BackupId, BackupRecord, BackupStatus, BackupUpdate, RetentionTier};
use crate::repository::{BackupFilter, BackupRepository};
use crate::storage::ArtifactStore;

/// How many whole periods of each tier are kept before the current one.
/// Hourly backups only survive the current day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    #[serde(default = "default_daily")]
    pub daily: u32,
    #[serde(default = "default_weekly")]
    pub weekly: u32,
    #[serde(default = "default_monthly")]
    pub monthly: u32,
    #[serde(default = "default_yearly")]
    pub yearly: u32,
}

fn default_daily() -> u32 {
    7
}

fn default_weekly() -> u32 {
    4
}

fn default_monthly() -> u32 {
    12
}

fn default_yearly() -> u32 {
    5
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: default_daily(),
            weekly: default_weekly(),
            monthly: default_monthly(),
            yearly: default_yearly(),
        }
    }
}

impl RetentionPolicy {
    pub fn keep(&self, tier: RetentionTier) -> u32 {
        match tier {
            RetentionTier::Hourly => 0,
            RetentionTier::Daily => self.daily,
            RetentionTier::Weekly => self.weekly,
            RetentionTier::Monthly => self.monthly,
            RetentionTier::Yearly => self.yearly,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneReport {
    pub deleted: usize,
    pub promoted: usize,
    /// Protected records in the catalog after the run.
    pub protected: usize,
    pub errors: Vec<String>,
}

struct Window {
    period: Period,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct PruneOutcome {
    deleted: usize,
    errors: Vec<String>,
}

/// Grandfather-father-son promotion and pruning over the backup catalog.
/// The time of the last promotion run is kept in the catalog so crossed
/// boundaries are found across restarts.
pub struct RetentionManager {
    backups: Arc<dyn BackupRepository>,
    artifacts: Arc<ArtifactStore>,
    clock: Arc<dyn Clock>,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(
        backups: Arc<dyn BackupRepository>,
        artifacts: Arc<ArtifactStore>,
        clock: Arc<dyn Clock>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            backups,
            artifacts,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Periods to examine now, as `[start, end)` with an open end for a
    /// period that is still closing. Each whole period since the previous run
    /// is its own window. With no previous run, the period just before the
    /// current one counts as crossed.
    async fn promotion_windows(&self, now: DateTime<FixedOffset>) -> Result<Vec<Window>> {
        let last = self
            .backups
            .last_promotion_at()
            .await?
            .map(|at| at.with_timezone(now.offset()));
        let mut windows = Vec::new();

        for period in Period::ALL {
            let current = period.start(now);
            let mut start = match last {
                Some(last) => period.start(last),
                None => period.start(current - Duration::seconds(1)),
            };
            while start < current {
                let end = period.next_start(start).min(current);
                windows.push(Window {
                    period,
                    start: start.with_timezone(&Utc),
                    end: Some(end.with_timezone(&Utc)),
                });
                start = end;
            }
            if period.is_closing(now) {
                windows.push(Window {
                    period,
                    start: current.with_timezone(&Utc),
                    end: None,
                });
            }
        }
        Ok(windows)
    }

    /// Raises the newest completed backup of each connection in every
    /// closing or crossed period to that period's tier. Returns how many
    /// records changed.
    pub async fn promote(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut promoted = 0;

        for window in self.promotion_windows(now).await? {
            let mut filter = BackupFilter::all()
                .status(BackupStatus::Completed)
                .created_after(window.start);
            if let Some(end) = window.end {
                filter = filter.created_before(end);
            }

            let tier = window.period.tier();
            let mut seen = HashSet::new();
            for record in self.backups.list_backups(&filter).await? {
                if !seen.insert(record.connection_id) {
                    continue;
                }
                if record.retention >= tier {
                    continue;
                }
                self.backups.update_backup(record.id, BackupUpdate::Promote(tier)).await?;
                debug!(
                    "Promoted backup #{} of connection {} from {} to {} ({} starting {})",
                    record.id, record.connection_id, record.retention, tier, window.period, window.start
                );
                promoted += 1;
            }
        }

        if let Err(e) = self.backups.set_last_promotion_at(now.with_timezone(&Utc)).await {
            warn!("Failed to record promotion time: {}", e);
        }
        if promoted > 0 {
            info!("Promoted {} backups", promoted);
        }
        Ok(promoted)
    }

    async fn prune(&self) -> Result<PruneOutcome> {
        let now = self.clock.now();
        let mut outcome = PruneOutcome::default();

        for tier in RetentionTier::ALL {
            let Some(cutoff) = prune_cutoff(tier, now, self.policy.keep(tier)) else {
                continue;
            };
            let filter = BackupFilter::all()
                .retention(tier)
                .protected(false)
                .created_before(cutoff);

            for record in self.backups.list_backups(&filter).await? {
                if !record.can_be_deleted() {
                    continue;
                }
                match self.remove(&record).await {
                    Ok(()) => outcome.deleted += 1,
                    Err(e) => {
                        warn!("Failed to prune backup #{}: {}", record.id, e);
                        outcome.errors.push(format!("Backup #{}: {}", record.id, e));
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn remove(&self, record: &BackupRecord) -> Result<()> {
        self.artifacts.delete_artifact(record).await?;
        self.backups.delete_backup(record.id).await
    }

    /// Promotion followed by pruning. Per-record deletion failures are
    /// reported, not raised.
    pub async fn prune_backups(&self) -> Result<PruneReport> {
        let promoted = self.promote().await?;
        let pruned = self.prune().await?;
        let protected = self
            .backups
            .list_backups(&BackupFilter::all().protected(true))
            .await?
            .len();

        let report = PruneReport {
            deleted: pruned.deleted,
            promoted,
            protected,
            errors: pruned.errors,
        };
        if report.errors.is_empty() {
            info!(
                "Retention run: {} deleted, {} promoted, {} protected",
                report.deleted, report.promoted, report.protected
            );
        } else {
            error!(
                "Retention run finished with {} errors: {} deleted, {} promoted",
                report.errors.len(),
                report.deleted,
                report.promoted
            );
        }
        Ok(report)
    }

    pub async fn protect(&self, id: BackupId) -> Result<BackupRecord> {
        let record = self.backups.update_backup(id, BackupUpdate::SetProtected(true)).await?;
        info!("Backup #{} is protected from pruning", id);
        Ok(record)
    }

    pub async fn unprotect(&self, id: BackupId) -> Result<BackupRecord> {
        let record = self.backups.update_backup(id, BackupUpdate::SetProtected(false)).await?;
        info!("Backup #{} is no longer protected", id);
        Ok(record)
    }

    /// Removes one backup on request. Protected and running backups are refused.
    pub async fn delete_backup(&self, id: BackupId) -> Result<()> {
        let record = self
            .backups
            .find_backup(id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("backup #{}", id)))?;

        if !record.can_be_deleted() {
            let reason = if record.protected {
                "is protected; unprotect it first"
            } else {
                "is still running"
            };
            return Err(BackupError::Refused(format!("backup #{} {}", id, reason)));
        }

        self.remove(&record).await?;
        info!("Deleted backup #{} ({})", id, record.database_name);
        Ok(())
    }
}
