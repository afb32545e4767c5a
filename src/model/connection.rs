use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConnectionId, DestinationId, TargetId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    MySql,
    MariaDb,
    PostgreSql,
}

impl DatabaseEngine {
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseEngine::MySql | DatabaseEngine::MariaDb => 3306,
            DatabaseEngine::PostgreSql => 5432,
        }
    }

    pub fn dump_tool(&self) -> &'static str {
        match self {
            DatabaseEngine::MySql | DatabaseEngine::MariaDb => "mysqldump",
            DatabaseEngine::PostgreSql => "pg_dump",
        }
    }

    /// Interactive client used for connectivity checks and discovery.
    pub fn client_tool(&self) -> &'static str {
        match self {
            DatabaseEngine::MySql | DatabaseEngine::MariaDb => "mysql",
            DatabaseEngine::PostgreSql => "psql",
        }
    }

    /// Database every server of this engine accepts logins to.
    pub fn maintenance_database(&self) -> &'static str {
        match self {
            DatabaseEngine::MySql | DatabaseEngine::MariaDb => "mysql",
            DatabaseEngine::PostgreSql => "postgres",
        }
    }

    /// Server-internal schemas that are never offered for backup.
    pub fn is_system_database(&self, name: &str) -> bool {
        match self {
            DatabaseEngine::MySql | DatabaseEngine::MariaDb => matches!(
                name,
                "information_schema" | "mysql" | "performance_schema" | "sys"
            ),
            DatabaseEngine::PostgreSql => name == "postgres",
        }
    }
}

impl std::fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseEngine::MySql => write!(f, "MySQL"),
            DatabaseEngine::MariaDb => write!(f, "MariaDB"),
            DatabaseEngine::PostgreSql => write!(f, "PostgreSQL"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Frequency {
    #[serde(rename = "1h")]
    Hourly,
    #[serde(rename = "6h")]
    EverySixHours,
    #[serde(rename = "12h")]
    EveryTwelveHours,
    #[serde(rename = "24h")]
    Daily,
}

impl Frequency {
    pub fn hours(&self) -> u32 {
        match self {
            Frequency::Hourly => 1,
            Frequency::EverySixHours => 6,
            Frequency::EveryTwelveHours => 12,
            Frequency::Daily => 24,
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Every {} hour(s)", self.hours())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Active,
    Inactive,
    Error,
}

/// A named database under a connection. Disabled targets keep their backup
/// history but are skipped by `execute_all`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseTarget {
    pub id: TargetId,
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub name: String,
    pub engine: DatabaseEngine,
    pub host: String,
    pub port: u16,
    pub username: String,

    #[serde(default)]
    pub password_encrypted: String,

    #[serde(default)]
    pub targets: Vec<DatabaseTarget>,

    #[serde(default)]
    pub schedule_frequency: Option<Frequency>,

    #[serde(default)]
    pub schedule_enabled: bool,

    #[serde(default)]
    pub storage_destination_id: Option<DestinationId>,

    #[serde(default)]
    pub status: ConnectionStatus,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub last_tested_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_backup_at: Option<DateTime<Utc>>,
}

impl Connection {
    pub fn enabled_targets(&self) -> impl Iterator<Item = &DatabaseTarget> {
        self.targets.iter().filter(|t| t.enabled)
    }

    /// First enabled database, falling back to the engine's maintenance one.
    pub fn check_database(&self) -> &str {
        self.enabled_targets()
            .next()
            .map(|t| t.name.as_str())
            .unwrap_or_else(|| self.engine.maintenance_database())
    }

    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }

    /// Whether the scheduler should keep a trigger for this connection.
    pub fn is_schedulable(&self) -> bool {
        self.schedule_enabled && self.schedule_frequency.is_some() && self.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_serde_names() {
        let json = serde_json::to_string(&Frequency::EverySixHours).unwrap();
        assert_eq!(json, "\"6h\"");
        let parsed: Frequency = serde_json::from_str("\"24h\"").unwrap();
        assert_eq!(parsed, Frequency::Daily);
        assert_eq!(Frequency::EveryTwelveHours.hours(), 12);
    }

    #[test]
    fn test_engine_defaults() {
        assert_eq!(DatabaseEngine::PostgreSql.default_port(), 5432);
        assert_eq!(DatabaseEngine::MariaDb.dump_tool(), "mysqldump");
        assert_eq!(DatabaseEngine::PostgreSql.client_tool(), "psql");
        assert!(DatabaseEngine::MySql.is_system_database("performance_schema"));
        assert!(!DatabaseEngine::PostgreSql.is_system_database("shop"));
        let parsed: DatabaseEngine = serde_json::from_str("\"postgresql\"").unwrap();
        assert_eq!(parsed, DatabaseEngine::PostgreSql);
    }
}
