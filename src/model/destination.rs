use serde::{Deserialize, Serialize};

use super::DestinationId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Local,
    S3,
    Gcs,
    AzureBlob,
    Sftp,
}

impl std::fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestinationKind::Local => write!(f, "local"),
            DestinationKind::S3 => write!(f, "s3"),
            DestinationKind::Gcs => write!(f, "gcs"),
            DestinationKind::AzureBlob => write!(f, "azure_blob"),
            DestinationKind::Sftp => write!(f, "sftp"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DestinationStatus {
    #[default]
    Active,
    Inactive,
}

/// A stored destination. The backend settings stay encrypted here and are
/// only decoded into a [`DestinationConfig`] at the point of use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDestination {
    pub id: DestinationId,
    pub name: String,
    pub kind: DestinationKind,

    #[serde(default)]
    pub config_encrypted: String,

    #[serde(default)]
    pub status: DestinationStatus,

    #[serde(default)]
    pub is_default: bool,
}

impl StorageDestination {
    pub fn is_active(&self) -> bool {
        self.status == DestinationStatus::Active
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LocalSettings {
    #[serde(default)]
    pub base_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct S3Settings {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GcsSettings {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub credentials_json: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AzureBlobSettings {
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SftpSettings {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub base_path: Option<String>,
}

/// Decrypted backend settings. Required fields are checked by each backend
/// when it is first used, not when the configuration is saved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationConfig {
    Local(LocalSettings),
    S3(S3Settings),
    Gcs(GcsSettings),
    AzureBlob(AzureBlobSettings),
    Sftp(SftpSettings),
}

const MASK: &str = "***";

fn mask(value: &mut Option<String>) {
    if value.is_some() {
        *value = Some(MASK.to_string());
    }
}

impl DestinationConfig {
    pub fn kind(&self) -> DestinationKind {
        match self {
            DestinationConfig::Local(_) => DestinationKind::Local,
            DestinationConfig::S3(_) => DestinationKind::S3,
            DestinationConfig::Gcs(_) => DestinationKind::Gcs,
            DestinationConfig::AzureBlob(_) => DestinationKind::AzureBlob,
            DestinationConfig::Sftp(_) => DestinationKind::Sftp,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, DestinationConfig::Local(_))
    }

    /// A copy safe to print: every secret is replaced by `***`.
    pub fn redacted(&self) -> DestinationConfig {
        let mut copy = self.clone();
        match &mut copy {
            DestinationConfig::Local(_) => {}
            DestinationConfig::S3(s) => mask(&mut s.secret_access_key),
            DestinationConfig::Gcs(s) => mask(&mut s.credentials_json),
            DestinationConfig::AzureBlob(s) => mask(&mut s.connection_string),
            DestinationConfig::Sftp(s) => {
                mask(&mut s.password);
                mask(&mut s.private_key);
                mask(&mut s.passphrase);
            }
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_config_decoding() {
        let json = r#"{"type":"s3","region":"eu-west-1","bucket":"backups","force_path_style":true}"#;
        let config: DestinationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind(), DestinationKind::S3);
        match config {
            DestinationConfig::S3(s) => {
                assert_eq!(s.bucket.as_deref(), Some("backups"));
                assert!(s.access_key_id.is_none());
                assert!(s.force_path_style);
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let config = DestinationConfig::Sftp(SftpSettings {
            host: Some("backup.example.com".to_string()),
            username: Some("ops".to_string()),
            password: Some("hunter2".to_string()),
            ..Default::default()
        });
        let DestinationConfig::Sftp(safe) = config.redacted() else {
            panic!("kind changed");
        };
        assert_eq!(safe.password.as_deref(), Some("***"));
        assert!(safe.private_key.is_none());
        assert_eq!(safe.host.as_deref(), Some("backup.example.com"));
    }
}
