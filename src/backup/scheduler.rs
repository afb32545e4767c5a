use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::{BackupExecutor, ExecuteAllSummary};
use crate::calendar::DailyAt;
use crate::clock::Clock;
use crate::error::Result;
use crate::model::{BackupTrigger, Connection, ConnectionId, Frequency};
use crate::repository::ConnectionRepository;
use crate::retention::{PruneReport, RetentionManager};

struct ConnectionJob {
    frequency: Frequency,
    generation: u64,
    /// Ends the trigger loop; a run already in progress finishes.
    stop: CancellationToken,
    /// Cancels the run in progress.
    abort: CancellationToken,
    handle: JoinHandle<()>,
}

struct RetentionJob {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub connection_id: ConnectionId,
    pub frequency: Frequency,
    pub next_fire: DateTime<FixedOffset>,
    pub in_flight: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub jobs: Vec<ScheduledJob>,
    pub retention_at: DailyAt,
    pub next_retention_run: Option<DateTime<FixedOffset>>,
}

#[derive(Debug)]
enum FireOutcome {
    Ran(ExecuteAllSummary),
    Skipped,
    Unregistered,
}

struct Inner {
    connections: Arc<dyn ConnectionRepository>,
    executor: Arc<BackupExecutor>,
    retention: Arc<RetentionManager>,
    clock: Arc<dyn Clock>,
    retention_at: DailyAt,
    jobs: Mutex<HashMap<ConnectionId, ConnectionJob>>,
    retention_job: Mutex<Option<RetentionJob>>,
    in_flight: std::sync::Mutex<HashSet<ConnectionId>>,
    generation: AtomicU64,
    running: AtomicBool,
}

/// Marks a connection as busy until dropped.
pub struct InFlightGuard<'a> {
    set: &'a std::sync::Mutex<HashSet<ConnectionId>>,
    id: ConnectionId,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a std::sync::Mutex<HashSet<ConnectionId>>, id: ConnectionId) -> Option<Self> {
        let mut busy = match set.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        busy.insert(id).then(|| Self { set, id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        match self.set.lock() {
            Ok(mut busy) => busy.remove(&self.id),
            Err(poisoned) => poisoned.into_inner().remove(&self.id),
        };
    }
}

impl Inner {
    fn is_in_flight(&self, id: ConnectionId) -> bool {
        match self.in_flight.lock() {
            Ok(busy) => busy.contains(&id),
            Err(poisoned) => poisoned.into_inner().contains(&id),
        }
    }

    /// Drops the job only if it is still the one that asked.
    async fn unregister(&self, id: ConnectionId, generation: u64) {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(&id).is_some_and(|job| job.generation == generation) {
            if let Some(job) = jobs.remove(&id) {
                job.stop.cancel();
            }
            info!("Unregistered backup trigger for connection {}", id);
        }
    }

    async fn fire(&self, id: ConnectionId, generation: u64, abort: &CancellationToken) -> FireOutcome {
        let connection = match self.connections.find_connection(id).await {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                warn!("Connection {} no longer exists", id);
                self.unregister(id, generation).await;
                return FireOutcome::Unregistered;
            }
            Err(e) => {
                error!("Failed to load connection {} for scheduled backup: {}", id, e);
                return FireOutcome::Skipped;
            }
        };

        if !connection.schedule_enabled || connection.schedule_frequency.is_none() {
            info!("Schedule of '{}' was disabled", connection.name);
            self.unregister(id, generation).await;
            return FireOutcome::Unregistered;
        }
        if !connection.is_active() {
            debug!("Skipping scheduled backup of inactive connection '{}'", connection.name);
            return FireOutcome::Skipped;
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, id) else {
            warn!(
                "Skipping scheduled backup of '{}': previous run still in progress",
                connection.name
            );
            return FireOutcome::Skipped;
        };

        info!("Executing scheduled backup for '{}'", connection.name);
        let summary = self
            .executor
            .execute_all_cancellable(&connection, BackupTrigger::Scheduled, abort)
            .await;
        if summary.failed > 0 {
            warn!(
                "Scheduled backup of '{}': {} of {} databases failed",
                connection.name, summary.failed, summary.total_databases
            );
        }
        FireOutcome::Ran(summary)
    }
}

async fn run_connection_trigger(
    inner: Arc<Inner>,
    id: ConnectionId,
    frequency: Frequency,
    generation: u64,
    stop: CancellationToken,
    abort: CancellationToken,
) {
    loop {
        let now = inner.clock.now();
        let next = frequency.next_fire(now);
        let wait = (next - now).to_std().unwrap_or_default();
        debug!("Next backup of connection {} at {}", id, next);

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if let FireOutcome::Unregistered = inner.fire(id, generation, &abort).await {
            break;
        }
    }
    debug!("Backup trigger for connection {} stopped", id);
}

async fn run_retention_trigger(inner: Arc<Inner>, stop: CancellationToken) {
    loop {
        let now = inner.clock.now();
        let next = inner.retention_at.next_fire(now);
        let wait = (next - now).to_std().unwrap_or_default();
        debug!("Next retention run at {}", next);

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = inner.retention.prune_backups().await {
            error!("Retention run failed: {}", e);
        }
    }
}

/// Owns one calendar trigger per scheduled connection and the daily
/// retention trigger.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        connections: Arc<dyn ConnectionRepository>,
        executor: Arc<BackupExecutor>,
        retention: Arc<RetentionManager>,
        clock: Arc<dyn Clock>,
        retention_at: DailyAt,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections,
                executor,
                retention,
                clock,
                retention_at,
                jobs: Mutex::new(HashMap::new()),
                retention_job: Mutex::new(None),
                in_flight: std::sync::Mutex::new(HashSet::new()),
                generation: AtomicU64::new(0),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Installs triggers for every schedulable connection and the retention
    /// trigger. Returns the number of connection triggers.
    pub async fn start(&self) -> Result<usize> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler is already running");
            return Ok(self.inner.jobs.lock().await.len());
        }
        info!("Starting backup scheduler");

        let connections = match self.inner.connections.list_connections().await {
            Ok(connections) => connections,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut scheduled = 0;
        for connection in connections.iter().filter(|c| c.is_schedulable()) {
            if self.schedule_connection(connection).await {
                scheduled += 1;
            }
        }

        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_retention_trigger(self.inner.clone(), stop.clone()));
        if let Some(previous) = self.inner.retention_job.lock().await.replace(RetentionJob { stop, handle }) {
            previous.stop.cancel();
        }

        info!(
            "Scheduler started: {} connection triggers, retention daily at {}",
            scheduled, self.inner.retention_at
        );
        Ok(scheduled)
    }

    /// Cancels every trigger and aborts runs in progress, then waits for the
    /// trigger tasks to wind down so their records are finalized.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping backup scheduler");

        let jobs: Vec<ConnectionJob> = self.inner.jobs.lock().await.drain().map(|(_, job)| job).collect();
        let retention = self.inner.retention_job.lock().await.take();

        let mut handles = Vec::with_capacity(jobs.len() + 1);
        for job in jobs {
            job.stop.cancel();
            job.abort.cancel();
            handles.push(job.handle);
        }
        if let Some(job) = retention {
            job.stop.cancel();
            handles.push(job.handle);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Scheduler task ended abnormally: {}", e);
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// Installs or replaces the trigger of `connection`. Replacing stops the
    /// old trigger's future fires; a run it already started completes.
    /// Returns whether a trigger is now installed.
    pub async fn schedule_connection(&self, connection: &Connection) -> bool {
        if !self.is_running() {
            debug!("Scheduler not running, not scheduling '{}'", connection.name);
            return false;
        }
        let Some(frequency) = connection.schedule_frequency.filter(|_| connection.is_schedulable()) else {
            self.remove_job(connection.id, false).await;
            return false;
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let handle = tokio::spawn(run_connection_trigger(
            self.inner.clone(),
            connection.id,
            frequency,
            generation,
            stop.clone(),
            abort.clone(),
        ));

        let job = ConnectionJob {
            frequency,
            generation,
            stop,
            abort,
            handle,
        };
        if let Some(previous) = self.inner.jobs.lock().await.insert(connection.id, job) {
            previous.stop.cancel();
            debug!("Replaced backup trigger of '{}'", connection.name);
        }
        info!("Scheduled '{}': {}", connection.name, frequency);
        true
    }

    /// Removes the trigger and aborts a run in progress. Returns whether a
    /// trigger was installed.
    pub async fn unschedule_connection(&self, id: ConnectionId) -> bool {
        self.remove_job(id, true).await
    }

    pub async fn update_connection_schedule(&self, connection: &Connection) -> bool {
        if connection.is_schedulable() {
            self.schedule_connection(connection).await
        } else {
            self.remove_job(connection.id, false).await;
            false
        }
    }

    async fn remove_job(&self, id: ConnectionId, abort: bool) -> bool {
        let Some(job) = self.inner.jobs.lock().await.remove(&id) else {
            return false;
        };
        job.stop.cancel();
        if abort {
            job.abort.cancel();
        }
        info!("Unscheduled connection {}", id);
        true
    }

    pub async fn stats(&self) -> SchedulerStats {
        let now = self.inner.clock.now();
        let mut jobs: Vec<ScheduledJob> = self
            .inner
            .jobs
            .lock()
            .await
            .iter()
            .map(|(id, job)| ScheduledJob {
                connection_id: *id,
                frequency: job.frequency,
                next_fire: job.frequency.next_fire(now),
                in_flight: self.inner.is_in_flight(*id),
            })
            .collect();
        jobs.sort_by_key(|job| job.connection_id);

        let running = self.is_running();
        SchedulerStats {
            running,
            jobs,
            retention_at: self.inner.retention_at,
            next_retention_run: running.then(|| self.inner.retention_at.next_fire(now)),
        }
    }

    pub async fn run_retention_now(&self) -> Result<PruneReport> {
        self.inner.retention.prune_backups().await
    }

    /// Claims `id` for a run outside the triggers. `None` while a scheduled
    /// or manual run of that connection is in progress.
    pub fn reserve(&self, id: ConnectionId) -> Option<InFlightGuard<'_>> {
        InFlightGuard::acquire(&self.inner.in_flight, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::dump::{DumpCommand, DumpCommandBuilder};
    use crate::clock::FixedClock;
    use crate::crypto::CredentialVault;
    use crate::model::{
        BackupStatus, ConnectionStatus, DatabaseEngine, DatabaseTarget,
    };
    use crate::repository::{BackupFilter, BackupRepository, MemoryStore};
    use crate::retention::RetentionPolicy;
    use crate::space::SpaceMonitor;
    use crate::storage::ArtifactStore;
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    struct Script(&'static str);

    impl DumpCommandBuilder for Script {
        fn build(&self, _connection: &Connection, _database: &str, _password: &str) -> DumpCommand {
            DumpCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), self.0.to_string()],
                env: vec![],
            }
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        scheduler: Scheduler,
    }

    fn harness(script: &'static str) -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(CredentialVault::from_hex(KEY).unwrap());
        let artifacts = Arc::new(ArtifactStore::new(store.clone(), vault.clone(), dir.path().join("backups")));
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(
            FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2024, 3, 5, 10, 30, 0)
                .unwrap(),
        ));
        let executor = BackupExecutor::new(
            store.clone(),
            store.clone(),
            artifacts.clone(),
            vault,
            Arc::new(SpaceMonitor::new(0.0)),
            clock.clone(),
        )
        .with_dump_commands(Arc::new(Script(script)));
        let retention = RetentionManager::new(store.clone(), artifacts, clock.clone(), RetentionPolicy::default());
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(executor),
            Arc::new(retention),
            clock,
            DailyAt::default(),
        );
        Harness {
            _dir: dir,
            store,
            scheduler,
        }
    }

    fn connection(id: ConnectionId, frequency: Option<Frequency>, enabled: bool) -> Connection {
        Connection {
            id,
            name: format!("conn-{}", id),
            engine: DatabaseEngine::PostgreSql,
            host: "localhost".to_string(),
            port: 5432,
            username: "backup".to_string(),
            password_encrypted: String::new(),
            targets: vec![DatabaseTarget {
                id: id * 10,
                name: "app".to_string(),
                enabled: true,
            }],
            schedule_frequency: frequency,
            schedule_enabled: enabled,
            storage_destination_id: None,
            status: ConnectionStatus::Active,
            last_error: None,
            last_tested_at: None,
            last_backup_at: None,
        }
    }

    async fn job_tokens(scheduler: &Scheduler, id: ConnectionId) -> (u64, CancellationToken) {
        let jobs = scheduler.inner.jobs.lock().await;
        let job = jobs.get(&id).unwrap();
        (job.generation, job.abort.clone())
    }

    #[tokio::test]
    async fn test_start_schedules_only_eligible_connections() {
        let h = harness("echo ok");
        h.store.save_connection(connection(1, Some(Frequency::EverySixHours), true)).await.unwrap();
        h.store.save_connection(connection(2, Some(Frequency::Hourly), false)).await.unwrap();
        let mut inactive = connection(3, Some(Frequency::Hourly), true);
        inactive.status = ConnectionStatus::Inactive;
        h.store.save_connection(inactive).await.unwrap();
        h.store.save_connection(connection(4, None, true)).await.unwrap();

        assert_eq!(h.scheduler.start().await.unwrap(), 1);
        let stats = h.scheduler.stats().await;
        assert!(stats.running);
        assert_eq!(stats.jobs.len(), 1);
        assert_eq!(stats.jobs[0].connection_id, 1);
        assert_eq!(stats.jobs[0].next_fire.to_rfc3339(), "2024-03-05T12:00:00+00:00");
        assert_eq!(stats.next_retention_run.unwrap().to_rfc3339(), "2024-03-06T02:00:00+00:00");

        h.scheduler.stop().await;
        let stats = h.scheduler.stats().await;
        assert!(!stats.running);
        assert!(stats.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_rescheduling_replaces_instead_of_stacking() {
        let h = harness("echo ok");
        h.scheduler.start().await.unwrap();

        let mut conn = connection(1, Some(Frequency::Hourly), true);
        assert!(h.scheduler.schedule_connection(&conn).await);
        assert!(h.scheduler.schedule_connection(&conn).await);
        conn.schedule_frequency = Some(Frequency::Daily);
        assert!(h.scheduler.update_connection_schedule(&conn).await);

        let stats = h.scheduler.stats().await;
        assert_eq!(stats.jobs.len(), 1);
        assert_eq!(stats.jobs[0].frequency, Frequency::Daily);

        conn.schedule_enabled = false;
        assert!(!h.scheduler.update_connection_schedule(&conn).await);
        assert!(h.scheduler.stats().await.jobs.is_empty());
        assert!(!h.scheduler.unschedule_connection(1).await);
        h.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_fire_runs_backup_and_unregisters_deleted_connection() {
        let h = harness("echo 'select 1;'");
        h.scheduler.start().await.unwrap();
        let conn = h.store.save_connection(connection(1, Some(Frequency::Hourly), true)).await.unwrap();
        h.scheduler.schedule_connection(&conn).await;
        let (generation, abort) = job_tokens(&h.scheduler, 1).await;

        match h.scheduler.inner.fire(1, generation, &abort).await {
            FireOutcome::Ran(summary) => assert_eq!(summary.successful, 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        let records = h.store.list_backups(&BackupFilter::all().connection(1)).await.unwrap();
        assert_eq!(records[0].trigger, BackupTrigger::Scheduled);

        h.store.delete_connection(1).await.unwrap();
        assert!(matches!(
            h.scheduler.inner.fire(1, generation, &abort).await,
            FireOutcome::Unregistered
        ));
        assert!(h.scheduler.stats().await.jobs.is_empty());
        h.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_fire_skips_overlapping_and_inactive_runs() {
        let h = harness("echo ok");
        h.scheduler.start().await.unwrap();
        let conn = h.store.save_connection(connection(1, Some(Frequency::Hourly), true)).await.unwrap();
        h.scheduler.schedule_connection(&conn).await;
        let (generation, abort) = job_tokens(&h.scheduler, 1).await;

        {
            let _busy = InFlightGuard::acquire(&h.scheduler.inner.in_flight, 1).unwrap();
            assert!(matches!(
                h.scheduler.inner.fire(1, generation, &abort).await,
                FireOutcome::Skipped
            ));
        }

        let mut inactive = conn.clone();
        inactive.status = ConnectionStatus::Inactive;
        h.store.save_connection(inactive).await.unwrap();
        assert!(matches!(
            h.scheduler.inner.fire(1, generation, &abort).await,
            FireOutcome::Skipped
        ));
        assert_eq!(h.scheduler.stats().await.jobs.len(), 1);
        assert!(h.store.list_backups(&BackupFilter::all()).await.unwrap().is_empty());
        h.scheduler.stop().await;
    }

    #[test]
    fn test_in_flight_claim_is_exclusive_until_dropped() {
        let h = harness("echo ok");
        let first = h.scheduler.reserve(1).unwrap();
        assert!(h.scheduler.reserve(1).is_none());
        assert!(h.scheduler.inner.is_in_flight(1));

        let other = h.scheduler.reserve(2).unwrap();
        drop(first);
        assert!(!h.scheduler.inner.is_in_flight(1));
        assert!(h.scheduler.inner.is_in_flight(2));
        drop(other);
        assert!(h.scheduler.reserve(1).is_some());
    }

    #[tokio::test]
    async fn test_unschedule_aborts_run_in_progress() {
        let h = harness("exec sleep 30");
        h.scheduler.start().await.unwrap();
        let conn = h.store.save_connection(connection(1, Some(Frequency::Hourly), true)).await.unwrap();
        h.scheduler.schedule_connection(&conn).await;
        let (generation, abort) = job_tokens(&h.scheduler, 1).await;

        let inner = h.scheduler.inner.clone();
        let run = tokio::spawn(async move { inner.fire(1, generation, &abort).await });
        while !h.scheduler.inner.is_in_flight(1) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.scheduler.unschedule_connection(1).await);
        match run.await.unwrap() {
            FireOutcome::Ran(summary) => assert_eq!(summary.failed, 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        let records = h.store.list_backups(&BackupFilter::all()).await.unwrap();
        assert_eq!(records[0].status, BackupStatus::Cancelled);
        assert!(!h.scheduler.inner.is_in_flight(1));
        h.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_schedule_requires_running_scheduler() {
        let h = harness("echo ok");
        let conn = connection(1, Some(Frequency::Hourly), true);
        assert!(!h.scheduler.schedule_connection(&conn).await);
        assert!(h.scheduler.run_retention_now().await.unwrap().errors.is_empty());
    }
}
