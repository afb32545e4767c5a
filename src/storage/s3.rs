use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tracing::{debug, info};

use super::{build_remote_key, required, DownloadStream, StorageBackend};
use crate::error::{BackupError, Result};
use crate::model::{DestinationKind, S3Settings};

/// S3 and S3-compatible object stores (MinIO, Spaces, R2).
pub struct S3Backend {
    settings: S3Settings,
}

impl S3Backend {
    pub fn new(settings: S3Settings) -> Self {
        Self { settings }
    }

    fn bucket(&self) -> Result<&str> {
        required(&self.settings.bucket, "bucket", DestinationKind::S3)
    }

    fn key(&self, relative: &str) -> String {
        build_remote_key(self.settings.prefix.as_deref(), relative)
    }

    async fn client(&self) -> Result<s3::Client> {
        let region = required(&self.settings.region, "region", DestinationKind::S3)?;
        let access_key = required(&self.settings.access_key_id, "access_key_id", DestinationKind::S3)?;
        let secret_key = required(&self.settings.secret_access_key, "secret_access_key", DestinationKind::S3)?;

        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(s3::config::Credentials::new(
                access_key, secret_key, None, None, "Static",
            ));
        if let Some(endpoint) = self.settings.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let config = s3::config::Builder::from(&sdk_config)
            .force_path_style(self.settings.force_path_style)
            .build();
        Ok(s3::Client::from_conf(config))
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let bucket = self.bucket()?;
        let key = self.key(key);
        let client = self.client().await?;

        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            BackupError::Upload(format!("Failed to read {}: {}", local_path.display(), e))
        })?;

        client
            .put_object()
            .bucket(bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                BackupError::Upload(format!(
                    "Failed to upload to s3://{}/{}: {}",
                    bucket,
                    key,
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;

        info!("Uploaded {} to s3://{}/{}", local_path.display(), bucket, key);
        Ok(())
    }

    async fn download_stream(&self, key: &str) -> Result<DownloadStream> {
        let bucket = self.bucket()?;
        let key = self.key(key);
        let client = self.client().await?;

        let object = client
            .get_object()
            .bucket(bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                if not_found {
                    BackupError::NotFound(format!("s3://{}/{}", bucket, key))
                } else {
                    BackupError::Storage(format!(
                        "Failed to download s3://{}/{}: {}",
                        bucket,
                        key,
                        s3::error::DisplayErrorContext(&e)
                    ))
                }
            })?;

        let content_length = object.content_length().and_then(|l| u64::try_from(l).ok());
        Ok(DownloadStream {
            reader: Box::pin(object.body.into_async_read()),
            content_length,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let bucket = self.bucket()?;
        let key = self.key(key);
        let client = self.client().await?;

        // S3 reports success for keys that do not exist.
        client
            .delete_object()
            .bucket(bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                BackupError::Storage(format!(
                    "Failed to delete s3://{}/{}: {}",
                    bucket,
                    key,
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;

        debug!("Deleted s3://{}/{}", bucket, key);
        Ok(())
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::S3
    }
}
