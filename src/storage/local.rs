use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{DownloadStream, StorageBackend};
use crate::error::{BackupError, Result};
use crate::model::DestinationKind;

/// Artifacts that already live on the local filesystem under `base`.
pub struct LocalBackend {
    base: PathBuf,
}

impl LocalBackend {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn full_path(&self, key: &str) -> PathBuf {
        self.base.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let target = self.full_path(key);
        if target == local_path {
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &target).await?;
        debug!("Copied {} to {}", local_path.display(), target.display());
        Ok(())
    }

    async fn download_stream(&self, key: &str) -> Result<DownloadStream> {
        let path = self.full_path(key);
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(format!("artifact {}", path.display())));
            }
            Err(e) => return Err(e.into()),
        };
        let content_length = file.metadata().await.ok().map(|m| m.len());

        Ok(DownloadStream {
            reader: Box::pin(file),
            content_length,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_upload_in_place_is_noop_and_download_reads_file() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let path = backend.full_path("1/app.sql.gz");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"payload").await.unwrap();

        backend.upload(&path, "1/app.sql.gz").await.unwrap();

        let mut download = backend.download_stream("1/app.sql.gz").await.unwrap();
        assert_eq!(download.content_length, Some(7));
        let mut body = Vec::new();
        download.reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"payload");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        tokio::fs::write(backend.full_path("a.sql.gz"), b"x").await.unwrap();

        backend.delete("a.sql.gz").await.unwrap();
        backend.delete("a.sql.gz").await.unwrap();
        assert!(matches!(
            backend.download_stream("a.sql.gz").await,
            Err(BackupError::NotFound(_))
        ));
    }
}
