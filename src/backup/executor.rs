use chrono::{DateTime, FixedOffset, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::compression::{compress_stream, StreamSummary};
use super::dump::{DumpCommandBuilder, VendorDumpCommands};
use crate::calendar::initial_tier;
use crate::clock::Clock;
use crate::crypto::CredentialVault;
use crate::error::{BackupError, Result};
use crate::model::{
    Artifact, BackupId, BackupRecord, BackupStatus, BackupTrigger, BackupUpdate, Connection,
    DatabaseTarget, NewBackup,
};
use crate::repository::{BackupRepository, ConnectionRepository};
use crate::space::SpaceMonitor;
use crate::storage::{ArtifactStore, ResolvedDestination};

const STDERR_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct BackupResult {
    pub backup_id: Option<BackupId>,

    pub database_name: String,

    pub success: bool,

    /// Storage key relative to the destination root.
    pub file_path: Option<String>,

    pub file_name: Option<String>,

    pub file_size: Option<u64>,

    pub checksum: Option<String>,

    pub error: Option<String>,

    pub exit_code: Option<i32>,

    /// Low-space advisory. Never affects `success`.
    pub warning: Option<String>,

    pub local_full_path: Option<PathBuf>,

    pub duration_secs: u64,
}

impl BackupResult {
    fn from_record(record: &BackupRecord, warning: Option<String>, local_full_path: PathBuf, started: Instant) -> Self {
        Self {
            backup_id: Some(record.id),
            database_name: record.database_name.clone(),
            success: record.is_successful(),
            file_path: record.file_path.clone(),
            file_name: record.file_name.clone(),
            file_size: record.file_size,
            checksum: record.checksum.clone(),
            error: record.error_message.clone(),
            exit_code: record.exit_code,
            warning,
            local_full_path: record.file_path.as_ref().map(|_| local_full_path),
            duration_secs: started.elapsed().as_secs(),
        }
    }

    fn unrecorded(database: &str, err: &BackupError, started: Instant) -> Self {
        Self {
            backup_id: None,
            database_name: database.to_string(),
            success: false,
            file_path: None,
            file_name: None,
            file_size: None,
            checksum: None,
            error: Some(err.to_string()),
            exit_code: err.exit_code(),
            warning: None,
            local_full_path: None,
            duration_secs: started.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub record: BackupRecord,
    pub result: BackupResult,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteAllSummary {
    pub total_databases: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BackupResult>,
}

/// `{database}_{YYYYmmdd_HHMMSS}.sql.gz`, timestamped in the clock's offset.
pub fn artifact_file_name(database: &str, at: DateTime<FixedOffset>) -> String {
    format!("{}_{}.sql.gz", database, at.format("%Y%m%d_%H%M%S"))
}

pub fn artifact_key(connection_id: i64, file_name: &str) -> String {
    format!("{}/{}", connection_id, file_name)
}

struct DumpJob<'a> {
    connection: &'a Connection,
    database: &'a str,
    destination: Option<&'a ResolvedDestination>,
    key: String,
    file_name: String,
    local_path: PathBuf,
}

/// Runs one dump per database target and records every attempt.
pub struct BackupExecutor {
    connections: Arc<dyn ConnectionRepository>,
    backups: Arc<dyn BackupRepository>,
    artifacts: Arc<ArtifactStore>,
    vault: Arc<CredentialVault>,
    space: Arc<SpaceMonitor>,
    clock: Arc<dyn Clock>,
    dump_commands: Arc<dyn DumpCommandBuilder>,
}

impl BackupExecutor {
    pub fn new(
        connections: Arc<dyn ConnectionRepository>,
        backups: Arc<dyn BackupRepository>,
        artifacts: Arc<ArtifactStore>,
        vault: Arc<CredentialVault>,
        space: Arc<SpaceMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connections,
            backups,
            artifacts,
            vault,
            space,
            clock,
            dump_commands: Arc::new(VendorDumpCommands),
        }
    }

    pub fn with_dump_commands(mut self, dump_commands: Arc<dyn DumpCommandBuilder>) -> Self {
        self.dump_commands = dump_commands;
        self
    }

    pub async fn execute(
        &self,
        connection: &Connection,
        target: &DatabaseTarget,
        trigger: BackupTrigger,
    ) -> Result<BackupOutcome> {
        self.execute_cancellable(connection, target, trigger, &CancellationToken::new())
            .await
    }

    /// Produces exactly one record. Only a failure to create that record is
    /// returned as `Err`; every later failure ends up on the record.
    pub async fn execute_cancellable(
        &self,
        connection: &Connection,
        target: &DatabaseTarget,
        trigger: BackupTrigger,
        cancel: &CancellationToken,
    ) -> Result<BackupOutcome> {
        let started = Instant::now();
        let now = self.clock.now();

        let (destination, setup_error) = match self.artifacts.resolve_for_connection(connection).await {
            Ok(destination) => (destination, None),
            Err(e) => {
                error!("Failed to resolve storage for connection '{}': {}", connection.name, e);
                (None, Some(e))
            }
        };

        let record = self
            .backups
            .create_backup(NewBackup {
                connection_id: connection.id,
                target_id: Some(target.id),
                database_name: target.name.clone(),
                storage_destination_id: destination.as_ref().map(|d| d.destination.id),
                retention: initial_tier(now),
                trigger,
                started_at: now.with_timezone(&Utc),
            })
            .await?;

        info!(
            "Starting {} backup #{} of '{}' on connection '{}' ({})",
            trigger,
            record.id,
            target.name,
            connection.name,
            destination
                .as_ref()
                .map(|d| d.label())
                .unwrap_or_else(|| "local".to_string())
        );

        let file_name = artifact_file_name(&target.name, now);
        let key = artifact_key(connection.id, &file_name);
        let job = DumpJob {
            connection,
            database: &target.name,
            destination: destination.as_ref(),
            local_path: self.artifacts.local_full_path(destination.as_ref(), &key),
            key,
            file_name,
        };

        let mut warning = None;
        let update = match setup_error {
            Some(e) => self.failure(e),
            None => self.run(&job, cancel, &mut warning).await,
        };

        let record = match self.backups.update_backup(record.id, update.clone()).await {
            Ok(updated) => updated,
            Err(e) => {
                error!("Failed to persist final state of backup #{}: {}", record.id, e);
                let mut record = record;
                record.apply(update);
                record
            }
        };

        match record.status {
            BackupStatus::Completed => {
                info!(
                    "Backup #{} of '{}' completed: {} in {}",
                    record.id,
                    target.name,
                    record.formatted_size(),
                    record.formatted_duration()
                );
                if let Err(e) = self
                    .connections
                    .set_last_backup_at(connection.id, self.clock.now_utc())
                    .await
                {
                    warn!("Failed to update last backup time of '{}': {}", connection.name, e);
                }
            }
            BackupStatus::Cancelled => warn!("Backup #{} of '{}' was cancelled", record.id, target.name),
            _ => error!(
                "Backup #{} of '{}' failed: {}",
                record.id,
                target.name,
                record.error_message.as_deref().unwrap_or("unknown error")
            ),
        }

        let result = BackupResult::from_record(&record, warning, job.local_path, started);
        Ok(BackupOutcome { record, result })
    }

    pub async fn execute_all(&self, connection: &Connection, trigger: BackupTrigger) -> ExecuteAllSummary {
        self.execute_all_cancellable(connection, trigger, &CancellationToken::new())
            .await
    }

    /// Backs up every enabled target in order. One target failing does not
    /// stop the others.
    pub async fn execute_all_cancellable(
        &self,
        connection: &Connection,
        trigger: BackupTrigger,
        cancel: &CancellationToken,
    ) -> ExecuteAllSummary {
        let targets: Vec<&DatabaseTarget> = connection.enabled_targets().collect();
        let mut summary = ExecuteAllSummary {
            total_databases: targets.len(),
            ..Default::default()
        };

        for target in targets {
            let started = Instant::now();
            let result = match self.execute_cancellable(connection, target, trigger, cancel).await {
                Ok(outcome) => outcome.result,
                Err(e) => {
                    error!("Could not record backup of '{}': {}", target.name, e);
                    BackupResult::unrecorded(&target.name, &e, started)
                }
            };
            if result.success {
                summary.successful += 1;
            } else {
                summary.failed += 1;
            }
            summary.results.push(result);
        }

        info!(
            "Connection '{}': {}/{} databases backed up",
            connection.name, summary.successful, summary.total_databases
        );
        summary
    }

    async fn run(&self, job: &DumpJob<'_>, cancel: &CancellationToken, warning: &mut Option<String>) -> BackupUpdate {
        if cancel.is_cancelled() {
            return self.failure(BackupError::Cancelled);
        }

        let base = self.artifacts.local_base_path(job.destination);
        if let Err(e) = tokio::fs::create_dir_all(&base).await {
            return self.failure(BackupError::Storage(format!(
                "Failed to create backup directory {}: {}",
                base.display(),
                e
            )));
        }

        let label = job
            .destination
            .map(|d| d.label())
            .unwrap_or_else(|| "local backups".to_string());
        let local_base = match job.destination {
            Some(d) if !d.is_local() => None,
            _ => Some(base.as_path()),
        };
        *warning = self.space.check(&label, local_base).warning;

        let summary = match self.dump(job, cancel).await {
            Ok(summary) => summary,
            Err(e) => return self.failure(e),
        };

        let file_size = match tokio::fs::metadata(&job.local_path).await {
            Ok(meta) => meta.len(),
            Err(_) => summary.bytes_out,
        };
        let artifact = Artifact {
            file_path: job.key.clone(),
            file_name: job.file_name.clone(),
            file_size,
            checksum: summary.checksum,
        };

        let remote = job.destination.filter(|d| !d.is_local());
        if let Some(destination) = remote {
            if let Err(e) = self.upload(destination, job, cancel).await {
                warn!(
                    "Keeping local copy {} after failed upload: {}",
                    job.local_path.display(),
                    e
                );
                return BackupUpdate::UploadFailed {
                    artifact,
                    message: e.to_string(),
                    finished_at: self.clock.now_utc(),
                };
            }
        }

        BackupUpdate::Completed {
            artifact,
            finished_at: self.clock.now_utc(),
        }
    }

    async fn dump(&self, job: &DumpJob<'_>, cancel: &CancellationToken) -> Result<StreamSummary> {
        let password = self.vault.reveal(&job.connection.password_encrypted)?;
        let command = self.dump_commands.build(job.connection, job.database, &password);
        debug!("Running {}", command.display());

        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| BackupError::ProcessSpawn {
                tool: command.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::Stream("dump process has no stdout".to_string()))?;
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(capture_stderr(pipe)));

        let streamed = tokio::select! {
            _ = cancel.cancelled() => None,
            summary = compress_stream(stdout, &job.local_path) => Some(summary),
        };
        let summary = match streamed {
            Some(Ok(summary)) => summary,
            Some(Err(e)) => {
                let _ = child.kill().await;
                remove_partial(&job.local_path).await;
                return Err(e);
            }
            None => {
                let _ = child.kill().await;
                remove_partial(&job.local_path).await;
                return Err(BackupError::Cancelled);
            }
        };

        let exited = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let status = match exited {
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                remove_partial(&job.local_path).await;
                return Err(e.into());
            }
            None => {
                let _ = child.kill().await;
                remove_partial(&job.local_path).await;
                return Err(BackupError::Cancelled);
            }
        };

        let stderr = match stderr {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            remove_partial(&job.local_path).await;
            return Err(BackupError::ProcessExit {
                code: status.code(),
                stderr,
            });
        }
        if !stderr.trim().is_empty() {
            debug!("{} reported: {}", command.program, stderr.trim());
        }

        Ok(summary)
    }

    async fn upload(&self, destination: &ResolvedDestination, job: &DumpJob<'_>, cancel: &CancellationToken) -> Result<()> {
        let backend = self.artifacts.backend(destination);
        info!("Uploading {} to {}", job.file_name, destination.label());

        let uploaded = tokio::select! {
            _ = cancel.cancelled() => Err(BackupError::Upload("upload cancelled".to_string())),
            result = backend.upload(&job.local_path, &job.key) => result,
        };
        uploaded.map_err(|e| match e {
            BackupError::Upload(_) => e,
            other => BackupError::Upload(format!("{} to {}", other, destination.label())),
        })
    }

    fn failure(&self, err: BackupError) -> BackupUpdate {
        let finished_at = self.clock.now_utc();
        match err {
            BackupError::Cancelled => BackupUpdate::Cancelled { finished_at },
            err => BackupUpdate::Failed {
                exit_code: err.exit_code(),
                message: err.to_string(),
                finished_at,
            },
        }
    }
}

/// Drains the pipe to the end, keeping at most `STDERR_LIMIT` bytes.
async fn capture_stderr<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut captured = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        match pipe.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_LIMIT.saturating_sub(captured.len());
                captured.extend_from_slice(&buffer[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial artifact {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial artifact {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::compression::verify_checksum;
    use crate::backup::dump::DumpCommand;
    use crate::clock::FixedClock;
    use crate::model::{
        DatabaseEngine, DestinationConfig, DestinationStatus, RetentionTier, S3Settings,
        StorageDestination,
    };
    use crate::repository::{BackupFilter, DestinationRepository, MemoryStore};
    use crate::space::FilesystemStats;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    /// Runs a shell snippet per database instead of a real dump tool.
    struct ShellDump(HashMap<String, String>);

    impl DumpCommandBuilder for ShellDump {
        fn build(&self, _connection: &Connection, database: &str, _password: &str) -> DumpCommand {
            DumpCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), self.0.get(database).cloned().unwrap_or_default()],
                env: vec![],
            }
        }
    }

    struct MissingTool;

    impl DumpCommandBuilder for MissingTool {
        fn build(&self, _connection: &Connection, _database: &str, _password: &str) -> DumpCommand {
            DumpCommand {
                program: "/nonexistent/gfs-dump-tool".to_string(),
                args: vec![],
                env: vec![],
            }
        }
    }

    struct AlmostFull;

    impl FilesystemStats for AlmostFull {
        fn capacity(&self, _path: &Path) -> Option<(u64, u64)> {
            Some((1000, 20))
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        vault: Arc<CredentialVault>,
        artifacts: Arc<ArtifactStore>,
        clock: Arc<FixedClock>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let store = Arc::new(MemoryStore::new());
            let vault = Arc::new(CredentialVault::from_hex(KEY).unwrap());
            let artifacts = Arc::new(ArtifactStore::new(store.clone(), vault.clone(), dir.path().join("backups")));
            let clock = Arc::new(FixedClock::new(
                FixedOffset::east_opt(0)
                    .unwrap()
                    .with_ymd_and_hms(2024, 3, 5, 10, 0, 0)
                    .unwrap(),
            ));
            Self {
                _dir: dir,
                store,
                vault,
                artifacts,
                clock,
            }
        }

        fn executor(&self, space: SpaceMonitor, dump: Arc<dyn DumpCommandBuilder>) -> BackupExecutor {
            BackupExecutor::new(
                self.store.clone(),
                self.store.clone(),
                self.artifacts.clone(),
                self.vault.clone(),
                Arc::new(space),
                self.clock.clone(),
            )
            .with_dump_commands(dump)
        }

        fn shell(&self, scripts: &[(&str, &str)]) -> BackupExecutor {
            let scripts = scripts
                .iter()
                .map(|(db, script)| (db.to_string(), script.to_string()))
                .collect();
            self.executor(SpaceMonitor::new(0.0), Arc::new(ShellDump(scripts)))
        }

        async fn connection(&self, databases: &[&str]) -> Connection {
            let connection = Connection {
                id: 1,
                name: "primary".to_string(),
                engine: DatabaseEngine::MySql,
                host: "127.0.0.1".to_string(),
                port: 3306,
                username: "backup".to_string(),
                password_encrypted: self.vault.encrypt("s3cret").unwrap(),
                targets: databases
                    .iter()
                    .enumerate()
                    .map(|(i, name)| DatabaseTarget {
                        id: i as i64 + 1,
                        name: name.to_string(),
                        enabled: true,
                    })
                    .collect(),
                schedule_frequency: None,
                schedule_enabled: false,
                storage_destination_id: None,
                status: Default::default(),
                last_error: None,
                last_tested_at: None,
                last_backup_at: None,
            };
            self.store.save_connection(connection).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_execute_all_backs_up_each_database() {
        let h = Harness::new();
        let executor = h.shell(&[
            ("app", "head -c 1000 /dev/zero | tr '\\0' 'a'"),
            ("logs", "head -c 2000 /dev/zero | tr '\\0' 'b'"),
        ]);
        let connection = h.connection(&["app", "logs"]).await;

        let summary = executor.execute_all(&connection, BackupTrigger::Manual).await;
        assert_eq!(summary.total_databases, 2);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 0);
        assert_ne!(summary.results[0].checksum, summary.results[1].checksum);

        let app = &summary.results[0];
        assert_eq!(app.file_path.as_deref(), Some("1/app_20240305_100000.sql.gz"));
        let file = tokio::fs::File::open(app.local_full_path.as_ref().unwrap()).await.unwrap();
        let len = verify_checksum(file, app.checksum.as_deref().unwrap()).await.unwrap();
        assert_eq!(len, 1000);

        let records = h.store.list_backups(&BackupFilter::all().connection(1)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == BackupStatus::Completed));
        assert!(records.iter().all(|r| r.retention == RetentionTier::Hourly));

        let stored = h.store.find_connection(1).await.unwrap().unwrap();
        assert!(stored.last_backup_at.is_some());
    }

    #[tokio::test]
    async fn test_nonzero_exit_records_stderr_and_code() {
        let h = Harness::new();
        let executor = h.shell(&[("app", "echo 'access denied' >&2; exit 2")]);
        let connection = h.connection(&["app"]).await;

        let outcome = executor
            .execute(&connection, &connection.targets[0], BackupTrigger::Scheduled)
            .await
            .unwrap();
        assert_eq!(outcome.record.status, BackupStatus::Failed);
        assert_eq!(outcome.record.exit_code, Some(2));
        assert!(outcome.record.error_message.as_deref().unwrap().contains("access denied"));
        assert!(!outcome.result.success);
        assert!(outcome.record.file_path.is_none());

        let staging = h.artifacts.local_full_path(None, "1/app_20240305_100000.sql.gz");
        assert!(!staging.exists());
        assert!(h.store.find_connection(1).await.unwrap().unwrap().last_backup_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_tool_is_recorded() {
        let h = Harness::new();
        let executor = h.executor(SpaceMonitor::new(0.0), Arc::new(MissingTool));
        let connection = h.connection(&["app"]).await;

        let outcome = executor
            .execute(&connection, &connection.targets[0], BackupTrigger::Manual)
            .await
            .unwrap();
        assert_eq!(outcome.record.status, BackupStatus::Failed);
        let message = outcome.record.error_message.unwrap();
        assert!(message.contains("/nonexistent/gfs-dump-tool"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_dump_and_removes_partial_file() {
        let h = Harness::new();
        let executor = h.shell(&[("app", "printf 'partial'; exec sleep 30")]);
        let connection = h.connection(&["app"]).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = executor
            .execute_cancellable(&connection, &connection.targets[0], BackupTrigger::Scheduled, &cancel)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.record.status, BackupStatus::Cancelled);

        let staging = h.artifacts.local_full_path(None, "1/app_20240305_100000.sql.gz");
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_low_space_warns_without_blocking() {
        let h = Harness::new();
        let scripts = HashMap::from([("app".to_string(), "echo 'select 1;'".to_string())]);
        let executor = h.executor(SpaceMonitor::with_stats(10.0, Box::new(AlmostFull)), Arc::new(ShellDump(scripts)));
        let connection = h.connection(&["app"]).await;

        let outcome = executor
            .execute(&connection, &connection.targets[0], BackupTrigger::Manual)
            .await
            .unwrap();
        assert!(outcome.result.success);
        assert!(outcome.result.warning.unwrap().contains("2.0% free"));
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_local_artifact() {
        let h = Harness::new();
        let config = DestinationConfig::S3(S3Settings::default());
        h.store
            .save_destination(StorageDestination {
                id: 9,
                name: "offsite".to_string(),
                kind: config.kind(),
                config_encrypted: h.vault.encrypt_config(&config).unwrap(),
                status: DestinationStatus::Active,
                is_default: true,
            })
            .await
            .unwrap();
        let executor = h.shell(&[("app", "echo 'select 1;'")]);
        let connection = h.connection(&["app"]).await;

        let outcome = executor
            .execute(&connection, &connection.targets[0], BackupTrigger::Manual)
            .await
            .unwrap();
        let record = outcome.record;
        assert_eq!(record.status, BackupStatus::Failed);
        assert_eq!(record.storage_destination_id, Some(9));
        assert!(record.error_message.unwrap().contains("bucket"));
        assert!(record.checksum.is_some() && record.file_size.is_some());
        assert!(outcome.result.local_full_path.unwrap().exists());
    }

    #[tokio::test]
    async fn test_disabled_targets_are_skipped() {
        let h = Harness::new();
        let executor = h.shell(&[("app", "echo ok"), ("archive", "echo ok")]);
        let mut connection = h.connection(&["app", "archive"]).await;
        connection.targets[1].enabled = false;

        let summary = executor.execute_all(&connection, BackupTrigger::Manual).await;
        assert_eq!(summary.total_databases, 1);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.results[0].database_name, "app");
    }

    #[test]
    fn test_artifact_naming() {
        let at = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 12, 31, 23, 5, 9)
            .unwrap();
        let name = artifact_file_name("shop", at);
        assert_eq!(name, "shop_20241231_230509.sql.gz");
        assert_eq!(artifact_key(4, &name), "4/shop_20241231_230509.sql.gz");
    }
}
