use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::calendar::DailyAt;
use crate::crypto::{CredentialVault, KEY_ENV_VAR};
use crate::error::{BackupError, Result};
use crate::model::{
    Connection, ConnectionId, ConnectionStatus, DatabaseEngine, DatabaseTarget, DestinationConfig,
    DestinationId, DestinationKind, DestinationStatus, Frequency, StorageDestination,
};
use crate::retention::RetentionPolicy;
use crate::space::DEFAULT_LOW_SPACE_THRESHOLD_PERCENT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub id: ConnectionId,
    pub name: String,
    pub engine: DatabaseEngine,
    #[serde(default = "default_host")]
    pub host: String,
    /// Defaults to the engine's standard port.
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    /// Plaintext until sealed, then an encrypted envelope.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub databases: Vec<DatabaseTarget>,
    #[serde(default)]
    pub schedule: Option<Frequency>,
    #[serde(default)]
    pub schedule_enabled: bool,
    #[serde(default)]
    pub destination: Option<DestinationId>,
    #[serde(default)]
    pub status: ConnectionStatus,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl ConnectionConfig {
    pub fn to_connection(&self, vault: &CredentialVault) -> Result<Connection> {
        Ok(Connection {
            id: self.id,
            name: self.name.clone(),
            engine: self.engine,
            host: self.host.clone(),
            port: self.port.unwrap_or_else(|| self.engine.default_port()),
            username: self.username.clone(),
            password_encrypted: vault.seal(&self.password)?,
            targets: self.databases.clone(),
            schedule_frequency: self.schedule,
            schedule_enabled: self.schedule_enabled,
            storage_destination_id: self.destination,
            status: self.status,
            last_error: None,
            last_tested_at: None,
            last_backup_at: None,
        })
    }
}

/// Destination settings as written in the file: a plain table, or the
/// envelope it was sealed into.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DestinationSettings {
    Sealed(String),
    Plain(DestinationConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationEntry {
    pub id: DestinationId,
    pub name: String,
    pub kind: DestinationKind,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub status: DestinationStatus,
    pub config: DestinationSettings,
}

impl DestinationEntry {
    pub fn to_destination(&self, vault: &CredentialVault) -> Result<StorageDestination> {
        let config_encrypted = match &self.config {
            DestinationSettings::Sealed(envelope) => envelope.clone(),
            DestinationSettings::Plain(config) => {
                if config.kind() != self.kind {
                    return Err(BackupError::Config(format!(
                        "destination '{}' is declared as {} but configured as {}",
                        self.name,
                        self.kind,
                        config.kind()
                    )));
                }
                vault.encrypt_config(config)?
            }
        };
        Ok(StorageDestination {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            config_encrypted,
            status: self.status,
            is_default: self.is_default,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 64 hex characters. `BACKUP_ENCRYPTION_KEY` takes precedence.
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default = "default_backup_dir")]
    pub local_backup_dir: PathBuf,
    /// Where backup records are kept between runs.
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default = "default_threshold")]
    pub low_space_threshold_percent: f64,
    #[serde(default)]
    pub retention_run_at: DailyAt,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub destinations: Vec<DestinationEntry>,
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_threshold() -> f64 {
    DEFAULT_LOW_SPACE_THRESHOLD_PERCENT
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            local_backup_dir: default_backup_dir(),
            catalog_path: None,
            retention: RetentionPolicy::default(),
            low_space_threshold_percent: default_threshold(),
            retention_run_at: DailyAt::default(),
            connections: Vec::new(),
            destinations: Vec::new(),
        }
    }
}

impl AppConfig {
    /// The environment variable wins over the file.
    pub fn vault(&self) -> Result<CredentialVault> {
        let from_env = std::env::var(KEY_ENV_VAR).ok().filter(|k| !k.trim().is_empty());
        let key = from_env
            .or_else(|| self.encryption_key.clone().filter(|k| !k.trim().is_empty()))
            .ok_or_else(|| {
                BackupError::Config(format!(
                    "no encryption key configured; set {} or encryption_key in the config file",
                    KEY_ENV_VAR
                ))
            })?;
        CredentialVault::from_hex(&key)
    }

    /// Replaces plaintext passwords and destination settings with
    /// envelopes. Returns whether anything changed.
    pub fn seal(&mut self, vault: &CredentialVault) -> Result<bool> {
        let mut changed = false;

        for connection in &mut self.connections {
            let sealed = vault.seal(&connection.password)?;
            if sealed != connection.password {
                connection.password = sealed;
                changed = true;
            }
        }

        for entry in &mut self.destinations {
            if let DestinationSettings::Plain(_) = entry.config {
                let destination = entry.to_destination(vault)?;
                entry.config = DestinationSettings::Sealed(destination.config_encrypted);
                changed = true;
            }
        }
        Ok(changed)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.id == id)
    }
}
