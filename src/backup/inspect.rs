use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backup::{DumpCommand, DumpCommandBuilder};
use crate::clock::Clock;
use crate::crypto::CredentialVault;
use crate::error::{BackupError, Result};
use crate::model::{Connection, ConnectionId, ConnectionStatus, DatabaseEngine};
use crate::repository::ConnectionRepository;

pub const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

fn version_query(engine: DatabaseEngine) -> &'static str {
    match engine {
        DatabaseEngine::MySql | DatabaseEngine::MariaDb => "SELECT VERSION()",
        DatabaseEngine::PostgreSql => "SELECT version()",
    }
}

fn databases_query(engine: DatabaseEngine) -> &'static str {
    match engine {
        DatabaseEngine::MySql | DatabaseEngine::MariaDb => "SHOW DATABASES",
        DatabaseEngine::PostgreSql => {
            "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn = true ORDER BY datname"
        }
    }
}

/// Talks to a connection's server through the engine client to check that
/// it is reachable and to list what it holds.
pub struct ConnectionInspector {
    connections: Arc<dyn ConnectionRepository>,
    vault: Arc<CredentialVault>,
    commands: Arc<dyn DumpCommandBuilder>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl ConnectionInspector {
    pub fn new(
        connections: Arc<dyn ConnectionRepository>,
        vault: Arc<CredentialVault>,
        commands: Arc<dyn DumpCommandBuilder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connections,
            vault,
            commands,
            clock,
            timeout: CHECK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn find(&self, id: ConnectionId) -> Result<Connection> {
        self.connections
            .find_connection(id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("connection {}", id)))
    }

    /// Asks the server for its version and records the outcome on the
    /// connection: `active` on success, `error` with the message otherwise.
    /// A failed check is returned as `Ok` with the updated connection so the
    /// caller can show `last_error`.
    pub async fn test(&self, id: ConnectionId) -> Result<(Connection, Option<String>)> {
        let connection = self.find(id).await?;
        let checked = self.version(&connection).await;
        let tested_at = self.clock.now_utc();

        match checked {
            Ok(version) => {
                info!("Connection '{}' is reachable: {}", connection.name, version);
                let updated = self
                    .connections
                    .set_test_result(id, ConnectionStatus::Active, tested_at, None)
                    .await?;
                Ok((updated, Some(version)))
            }
            Err(e) => {
                warn!("Connection '{}' failed its check: {}", connection.name, e);
                let updated = self
                    .connections
                    .set_test_result(id, ConnectionStatus::Error, tested_at, Some(e.to_string()))
                    .await?;
                Ok((updated, None))
            }
        }
    }

    async fn version(&self, connection: &Connection) -> Result<String> {
        let password = self.vault.reveal(&connection.password_encrypted)?;
        let command = self.commands.query(
            connection,
            connection.check_database(),
            &password,
            version_query(connection.engine),
        );
        let output = self.run(&command).await?;
        Ok(output.lines().next().unwrap_or_default().trim().to_string())
    }

    /// Lists the databases on the server that can be backed up, system
    /// schemas left out.
    pub async fn discover(&self, id: ConnectionId) -> Result<Vec<String>> {
        let connection = self.find(id).await?;
        let password = self.vault.reveal(&connection.password_encrypted)?;
        let command = self.commands.query(
            &connection,
            connection.engine.maintenance_database(),
            &password,
            databases_query(connection.engine),
        );
        let output = self.run(&command).await?;

        let databases: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && !connection.engine.is_system_database(name))
            .map(str::to_string)
            .collect();
        debug!("Found {} databases on '{}'", databases.len(), connection.name);
        Ok(databases)
    }

    async fn run(&self, command: &DumpCommand) -> Result<String> {
        debug!("Running {}", command.display());
        let mut process = command.to_command();
        let output = match tokio::time::timeout(self.timeout, process.output()).await {
            Ok(result) => result.map_err(|source| BackupError::ProcessSpawn {
                tool: command.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(BackupError::Timeout(format!(
                    "{} gave no answer within {}s",
                    command.program,
                    self.timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            return Err(BackupError::ProcessExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::DatabaseTarget;
    use crate::repository::MemoryStore;
    use chrono::{FixedOffset, TimeZone, Utc};

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    /// Answers every query with a fixed shell script.
    struct Client(&'static str);

    impl DumpCommandBuilder for Client {
        fn build(&self, _connection: &Connection, _database: &str, _password: &str) -> DumpCommand {
            unreachable!("no dumps in these tests")
        }

        fn query(&self, _connection: &Connection, database: &str, _password: &str, _sql: &str) -> DumpCommand {
            DumpCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), self.0.to_string(), "sh".to_string(), database.to_string()],
                env: vec![],
            }
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<FixedClock>,
        vault: Arc<CredentialVault>,
    }

    impl Harness {
        async fn new(engine: DatabaseEngine, targets: Vec<DatabaseTarget>) -> Self {
            let vault = Arc::new(CredentialVault::from_hex(KEY).unwrap());
            let store = Arc::new(MemoryStore::new());
            store
                .save_connection(Connection {
                    id: 1,
                    name: "shop".to_string(),
                    engine,
                    host: "localhost".to_string(),
                    port: engine.default_port(),
                    username: "backup".to_string(),
                    password_encrypted: vault.encrypt("s3cret").unwrap(),
                    targets,
                    schedule_frequency: None,
                    schedule_enabled: false,
                    storage_destination_id: None,
                    status: ConnectionStatus::Inactive,
                    last_error: None,
                    last_tested_at: None,
                    last_backup_at: None,
                })
                .await
                .unwrap();
            let clock = Arc::new(FixedClock::new(
                FixedOffset::east_opt(0)
                    .unwrap()
                    .with_ymd_and_hms(2024, 6, 4, 9, 0, 0)
                    .unwrap(),
            ));
            Self { store, clock, vault }
        }

        fn inspector(&self, script: &'static str) -> ConnectionInspector {
            ConnectionInspector::new(
                self.store.clone(),
                self.vault.clone(),
                Arc::new(Client(script)),
                self.clock.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_successful_check_marks_connection_active() {
        let targets = vec![
            DatabaseTarget {
                id: 1,
                name: "archive".to_string(),
                enabled: false,
            },
            DatabaseTarget {
                id: 2,
                name: "orders".to_string(),
                enabled: true,
            },
        ];
        let harness = Harness::new(DatabaseEngine::MySql, targets).await;
        let inspector = harness.inspector("echo \"8.0.36 on $1\"");

        let (connection, version) = inspector.test(1).await.unwrap();
        assert_eq!(version.as_deref(), Some("8.0.36 on orders"));
        assert_eq!(connection.status, ConnectionStatus::Active);
        assert_eq!(connection.last_tested_at, Some(Utc.with_ymd_and_hms(2024, 6, 4, 9, 0, 0).unwrap()));
        assert!(connection.last_error.is_none());

        let stored = harness.store.find_connection(1).await.unwrap().unwrap();
        assert!(stored.is_active());
    }

    #[tokio::test]
    async fn test_failed_check_records_error_and_clears_on_success() {
        let harness = Harness::new(DatabaseEngine::PostgreSql, vec![]).await;

        let failing = harness.inspector("echo \"FATAL: database $1 refused login\" >&2; exit 2");
        let (connection, version) = failing.test(1).await.unwrap();
        assert!(version.is_none());
        assert_eq!(connection.status, ConnectionStatus::Error);
        assert_eq!(
            connection.last_error.as_deref(),
            Some("FATAL: database postgres refused login")
        );
        assert!(connection.last_tested_at.is_some());

        let passing = harness.inspector("echo 'PostgreSQL 16.2'");
        let (connection, _) = passing.test(1).await.unwrap();
        assert_eq!(connection.status, ConnectionStatus::Active);
        assert!(connection.last_error.is_none());
    }

    #[tokio::test]
    async fn test_check_times_out() {
        let harness = Harness::new(DatabaseEngine::MySql, vec![]).await;
        let inspector = harness
            .inspector("sleep 5")
            .with_timeout(Duration::from_millis(100));

        let (connection, _) = inspector.test(1).await.unwrap();
        assert_eq!(connection.status, ConnectionStatus::Error);
        assert!(connection.last_error.unwrap().contains("no answer"));
    }

    #[tokio::test]
    async fn test_discover_skips_system_databases() {
        let harness = Harness::new(DatabaseEngine::MySql, vec![]).await;
        let inspector = harness.inspector(
            "printf 'information_schema\\nmysql\\norders\\nperformance_schema\\nsys\\nwarehouse\\n'",
        );

        let databases = inspector.discover(1).await.unwrap();
        assert_eq!(databases, vec!["orders", "warehouse"]);

        let missing = inspector.discover(9).await.unwrap_err();
        assert!(matches!(missing, BackupError::NotFound(_)));
    }
}
