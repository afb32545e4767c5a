use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Body, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info};

use super::{build_remote_key, required, DownloadStream, StorageBackend};
use crate::error::{BackupError, Result};
use crate::model::{DestinationKind, GcsSettings};

const STORAGE_API: &str = "https://storage.googleapis.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

#[derive(Debug, Deserialize)]
struct ServiceAccount {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Google Cloud Storage over the JSON API. Authenticates with the configured
/// service account, or with the instance metadata server when none is set.
pub struct GcsBackend {
    settings: GcsSettings,
    client: Client,
}

impl GcsBackend {
    pub fn new(settings: GcsSettings) -> Self {
        Self {
            settings,
            client: Client::new(),
        }
    }

    fn bucket(&self) -> Result<&str> {
        required(&self.settings.bucket, "bucket", DestinationKind::Gcs)
    }

    fn object_name(&self, relative: &str) -> String {
        build_remote_key(self.settings.prefix.as_deref(), relative)
    }

    fn object_url(&self, bucket: &str, name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            STORAGE_API,
            urlencoding::encode(bucket),
            urlencoding::encode(name)
        )
    }

    async fn access_token(&self) -> Result<String> {
        let credentials = self
            .settings
            .credentials_json
            .as_deref()
            .filter(|c| !c.trim().is_empty());

        let response = match credentials {
            Some(json) => {
                let account: ServiceAccount = serde_json::from_str(json).map_err(|e| {
                    BackupError::Config(format!("gcs credentials_json is not a service account key: {}", e))
                })?;
                let assertion = service_account_assertion(&account)?;
                let form = format!(
                    "grant_type={}&assertion={}",
                    urlencoding::encode("urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    urlencoding::encode(&assertion)
                );
                self.client
                    .post(account.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI))
                    .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(form)
                    .send()
                    .await?
            }
            None => {
                self.client
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BackupError::Storage(format!(
                "Failed to obtain GCS access token: {} - {}",
                status, text
            )));
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.access_token().await?;
        let mut builder = builder.bearer_auth(token);
        if let Some(project) = self.settings.project_id.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.header("x-goog-user-project", project);
        }
        Ok(builder)
    }
}

fn service_account_assertion(account: &ServiceAccount) -> Result<String> {
    let iat = Utc::now().timestamp();
    let claims = AssertionClaims {
        iss: &account.client_email,
        scope: SCOPE,
        aud: account.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI),
        iat,
        exp: iat + 3600,
    };
    let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
        .map_err(|e| BackupError::Config(format!("gcs private_key is not a valid RSA key: {}", e)))?;
    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| BackupError::Config(format!("failed to sign gcs token request: {}", e)))
}

#[async_trait]
impl StorageBackend for GcsBackend {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let bucket = self.bucket()?;
        let name = self.object_name(key);

        let file = tokio::fs::File::open(local_path).await?;
        let length = file.metadata().await?.len();

        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            STORAGE_API,
            urlencoding::encode(bucket),
            urlencoding::encode(&name)
        );
        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(Body::wrap_stream(ReaderStream::new(file)));

        let response = self.authorized(request).await?.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BackupError::Upload(format!(
                "Failed to upload gs://{}/{}: {} - {}",
                bucket, name, status, text
            )));
        }

        info!("Uploaded {} to gs://{}/{}", local_path.display(), bucket, name);
        Ok(())
    }

    async fn download_stream(&self, key: &str) -> Result<DownloadStream> {
        let bucket = self.bucket()?;
        let name = self.object_name(key);

        let request = self
            .client
            .get(self.object_url(bucket, &name))
            .query(&[("alt", "media")]);
        let response = self.authorized(request).await?.send().await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(BackupError::NotFound(format!("gs://{}/{}", bucket, name))),
            status => {
                let text = response.text().await.unwrap_or_default();
                return Err(BackupError::Storage(format!(
                    "Failed to download gs://{}/{}: {} - {}",
                    bucket, name, status, text
                )));
            }
        }

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(DownloadStream {
            reader: Box::pin(StreamReader::new(stream)),
            content_length,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let bucket = self.bucket()?;
        let name = self.object_name(key);

        let request = self.client.delete(self.object_url(bucket, &name));
        let response = self.authorized(request).await?.send().await?;

        match response.status() {
            status if status.is_success() => {
                debug!("Deleted gs://{}/{}", bucket, name);
                Ok(())
            }
            StatusCode::NOT_FOUND => Ok(()),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(BackupError::Storage(format!(
                    "Failed to delete gs://{}/{}: {} - {}",
                    bucket, name, status, text
                )))
            }
        }
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::Gcs
    }
}
