mod azure;
mod gcs;
mod local;
mod resolver;
mod s3;
mod sftp;

pub use azure::AzureBlobBackend;
pub use gcs::GcsBackend;
pub use local::LocalBackend;
pub use resolver::{ArtifactStore, ResolvedDestination};
pub use s3::S3Backend;
pub use sftp::SftpBackend;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncRead;

use crate::error::{BackupError, Result};
use crate::model::{DestinationConfig, DestinationKind};

/// A readable artifact body. Dropping the reader releases the underlying
/// connection or file handle.
pub struct DownloadStream {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Storage for backup artifacts addressed by a relative key such as
/// `12/app_20240305_100000.sql.gz`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()>;

    async fn download_stream(&self, key: &str) -> Result<DownloadStream>;

    /// Removing an object that does not exist is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    fn kind(&self) -> DestinationKind;
}

pub fn create_backend(config: &DestinationConfig, local_base: &Path) -> Box<dyn StorageBackend> {
    match config {
        DestinationConfig::Local(settings) => {
            let base = settings
                .base_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| local_base.to_path_buf());
            Box::new(LocalBackend::new(base))
        }
        DestinationConfig::S3(settings) => Box::new(S3Backend::new(settings.clone())),
        DestinationConfig::Gcs(settings) => Box::new(GcsBackend::new(settings.clone())),
        DestinationConfig::AzureBlob(settings) => Box::new(AzureBlobBackend::new(settings.clone())),
        DestinationConfig::Sftp(settings) => Box::new(SftpBackend::new(settings.clone())),
    }
}

/// Trims whitespace and surrounding slashes. An empty result means "no prefix".
pub fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .unwrap_or_default()
        .trim()
        .trim_matches('/')
        .to_string()
}

pub fn build_remote_key(prefix: Option<&str>, relative: &str) -> String {
    let prefix = normalize_prefix(prefix);
    let relative = relative.trim_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", prefix, relative)
    }
}

pub(crate) fn required<'a>(value: &'a Option<String>, field: &str, kind: DestinationKind) -> Result<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(BackupError::Config(format!(
            "{} destination is missing required field '{}'",
            kind, field
        ))),
    }
}
