use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use futures::TryStreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Body, Client, Method, Response, StatusCode};
use sha2::Sha256;
use std::path::Path;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info};

use super::{build_remote_key, required, DownloadStream, StorageBackend};
use crate::error::{BackupError, Result};
use crate::model::{AzureBlobSettings, DestinationKind};

const API_VERSION: &str = "2021-08-06";

#[derive(Debug, Clone, PartialEq)]
enum Credential {
    SharedKey { account: String, key: Vec<u8> },
    Sas(String),
}

/// The parts of an Azure storage connection string this backend needs.
#[derive(Debug, Clone, PartialEq)]
struct AzureAccount {
    blob_endpoint: String,
    credential: Credential,
}

impl AzureAccount {
    fn parse(connection_string: &str) -> Result<Self> {
        let mut protocol = "https".to_string();
        let mut account_name = None;
        let mut account_key = None;
        let mut suffix = "core.windows.net".to_string();
        let mut blob_endpoint = None;
        let mut sas = None;

        for part in connection_string.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            match name {
                "DefaultEndpointsProtocol" => protocol = value.to_string(),
                "AccountName" => account_name = Some(value.to_string()),
                "AccountKey" => account_key = Some(value.to_string()),
                "EndpointSuffix" => suffix = value.to_string(),
                "BlobEndpoint" => blob_endpoint = Some(value.trim_end_matches('/').to_string()),
                "SharedAccessSignature" => sas = Some(value.trim_start_matches('?').to_string()),
                _ => {}
            }
        }

        let blob_endpoint = match (blob_endpoint, &account_name) {
            (Some(endpoint), _) => endpoint,
            (None, Some(account)) => format!("{}://{}.blob.{}", protocol, account, suffix),
            (None, None) => {
                return Err(BackupError::Config(
                    "azure_blob connection string needs AccountName or BlobEndpoint".to_string(),
                ))
            }
        };

        let credential = match (account_name, account_key, sas) {
            (_, _, Some(sas)) => Credential::Sas(sas),
            (Some(account), Some(key), None) => {
                let key = STANDARD.decode(key.trim()).map_err(|e| {
                    BackupError::Config(format!("azure_blob AccountKey is not valid base64: {}", e))
                })?;
                Credential::SharedKey { account, key }
            }
            _ => {
                return Err(BackupError::Config(
                    "azure_blob connection string needs AccountName and AccountKey, or SharedAccessSignature"
                        .to_string(),
                ))
            }
        };

        Ok(Self {
            blob_endpoint,
            credential,
        })
    }
}

/// Azure Blob Storage over the REST API, signed with the account key or
/// authorised by a SAS token from the connection string.
pub struct AzureBlobBackend {
    settings: AzureBlobSettings,
    client: Client,
}

struct BlobRequest<'a> {
    method: Method,
    path: String,
    query: Vec<(&'a str, &'a str)>,
    headers: Vec<(&'static str, String)>,
    content_length: Option<u64>,
    content_type: Option<&'static str>,
    body: Option<Body>,
}

impl<'a> BlobRequest<'a> {
    fn new(method: Method, path: String) -> Self {
        Self {
            method,
            path,
            query: Vec::new(),
            headers: Vec::new(),
            content_length: None,
            content_type: None,
            body: None,
        }
    }
}

impl AzureBlobBackend {
    pub fn new(settings: AzureBlobSettings) -> Self {
        Self {
            settings,
            client: Client::new(),
        }
    }

    fn account(&self) -> Result<AzureAccount> {
        let connection_string = required(
            &self.settings.connection_string,
            "connection_string",
            DestinationKind::AzureBlob,
        )?;
        AzureAccount::parse(connection_string)
    }

    fn container(&self) -> Result<&str> {
        required(&self.settings.container, "container", DestinationKind::AzureBlob)
    }

    fn blob_path(&self, container: &str, relative: &str) -> String {
        let key = build_remote_key(self.settings.prefix.as_deref(), relative);
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("/{}/{}", container, encoded.join("/"))
    }

    async fn send(&self, account: &AzureAccount, request: BlobRequest<'_>) -> Result<Response> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let mut ms_headers: Vec<(String, String)> = request
            .headers
            .iter()
            .filter(|(name, _)| name.starts_with("x-ms-"))
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        ms_headers.push(("x-ms-date".to_string(), date.clone()));
        ms_headers.push(("x-ms-version".to_string(), API_VERSION.to_string()));

        let mut query: Vec<String> = request
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        if let Credential::Sas(sas) = &account.credential {
            query.push(sas.clone());
        }
        let mut url = format!("{}{}", account.blob_endpoint, request.path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }

        let mut builder = self.client.request(request.method.clone(), &url);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        builder = builder
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION);
        if let Some(length) = request.content_length {
            builder = builder.header(reqwest::header::CONTENT_LENGTH, length);
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }

        if let Credential::SharedKey { account: name, key } = &account.credential {
            let to_sign = string_to_sign(
                request.method.as_str(),
                request.content_length,
                request.content_type,
                &ms_headers,
                name,
                &request.path,
                &request.query,
            );
            let signature = sign(key, &to_sign)?;
            builder = builder.header(
                reqwest::header::AUTHORIZATION,
                format!("SharedKey {}:{}", name, signature),
            );
        }

        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        Ok(builder.send().await?)
    }

    async fn ensure_container(&self, account: &AzureAccount, container: &str) -> Result<()> {
        let mut request = BlobRequest::new(Method::PUT, format!("/{}", container));
        request.query.push(("restype", "container"));
        request.content_length = Some(0);

        let response = self.send(account, request).await?;
        match response.status() {
            StatusCode::CREATED => {
                info!("Created Azure container {}", container);
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(BackupError::Upload(format!(
                    "Failed to create container {}: {} - {}",
                    container, status, text
                )))
            }
        }
    }
}

/// Shared Key string-to-sign for the blob service. Content-Length is empty
/// when zero, as the 2015-02-21+ protocol requires.
fn string_to_sign(
    method: &str,
    content_length: Option<u64>,
    content_type: Option<&str>,
    ms_headers: &[(String, String)],
    account: &str,
    path: &str,
    query: &[(&str, &str)],
) -> String {
    let length = match content_length {
        Some(0) | None => String::new(),
        Some(n) => n.to_string(),
    };

    let mut headers: Vec<(String, &str)> = ms_headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.trim()))
        .collect();
    headers.sort();
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let mut params: Vec<(String, &str)> = query.iter().map(|(k, v)| (k.to_lowercase(), *v)).collect();
    params.sort();
    let mut canonical_resource = format!("/{}{}", account, path);
    for (name, value) in params {
        canonical_resource.push_str(&format!("\n{}:{}", name, value));
    }

    [
        method,
        "",
        "",
        length.as_str(),
        "",
        content_type.unwrap_or(""),
        "",
        "",
        "",
        "",
        "",
        "",
    ]
    .join("\n")
        + "\n"
        + &canonical_headers
        + &canonical_resource
}

fn sign(key: &[u8], string_to_sign: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| BackupError::Config(format!("invalid azure account key: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl StorageBackend for AzureBlobBackend {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let account = self.account()?;
        let container = self.container()?;
        self.ensure_container(&account, container).await?;

        let file = tokio::fs::File::open(local_path).await?;
        let length = file.metadata().await?.len();

        let path = self.blob_path(container, key);
        let mut request = BlobRequest::new(Method::PUT, path.clone());
        request.headers.push(("x-ms-blob-type", "BlockBlob".to_string()));
        request.content_length = Some(length);
        request.content_type = Some("application/octet-stream");
        request.body = Some(Body::wrap_stream(ReaderStream::new(file)));

        let response = self.send(&account, request).await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BackupError::Upload(format!(
                "Failed to upload blob {}: {} - {}",
                path, status, text
            )));
        }

        info!("Uploaded {} to Azure blob {}", local_path.display(), path);
        Ok(())
    }

    async fn download_stream(&self, key: &str) -> Result<DownloadStream> {
        let account = self.account()?;
        let container = self.container()?;
        let path = self.blob_path(container, key);

        let response = self
            .send(&account, BlobRequest::new(Method::GET, path.clone()))
            .await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(BackupError::NotFound(format!("azure blob {}", path))),
            status => {
                let text = response.text().await.unwrap_or_default();
                return Err(BackupError::Storage(format!(
                    "Failed to download blob {}: {} - {}",
                    path, status, text
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
        let account = self.account()?;
        let container = self.container()?;
        let path = self.blob_path(container, key);

        let response = self
            .send(&account, BlobRequest::new(Method::DELETE, path.clone()))
            .await?;
        match response.status() {
            status if status.is_success() => {
                debug!("Deleted Azure blob {}", path);
                Ok(())
            }
            StatusCode::NOT_FOUND => Ok(()),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(BackupError::Storage(format!(
                    "Failed to delete blob {}: {} - {}",
                    path, status, text
                )))
            }
        }
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::AzureBlob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shared_key_connection_string() {
        let account = AzureAccount::parse(
            "DefaultEndpointsProtocol=https;AccountName=acme;AccountKey=c2VjcmV0;EndpointSuffix=core.windows.net",
        )
        .unwrap();
        assert_eq!(account.blob_endpoint, "https://acme.blob.core.windows.net");
        assert_eq!(
            account.credential,
            Credential::SharedKey {
                account: "acme".to_string(),
                key: b"secret".to_vec()
            }
        );
    }

    #[test]
    fn test_parse_sas_connection_string() {
        let account = AzureAccount::parse(
            "BlobEndpoint=https://acme.blob.core.windows.net/;SharedAccessSignature=?sv=2021-08-06&sig=abc%3D",
        )
        .unwrap();
        assert_eq!(account.blob_endpoint, "https://acme.blob.core.windows.net");
        assert_eq!(account.credential, Credential::Sas("sv=2021-08-06&sig=abc%3D".to_string()));
    }

    #[test]
    fn test_parse_rejects_missing_credentials() {
        let err = AzureAccount::parse("AccountName=acme").unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_string_to_sign_layout() {
        let headers = vec![
            ("x-ms-version".to_string(), API_VERSION.to_string()),
            ("x-ms-date".to_string(), "Tue, 05 Mar 2024 10:00:00 GMT".to_string()),
            ("x-ms-blob-type".to_string(), "BlockBlob".to_string()),
        ];
        let signed = string_to_sign(
            "PUT",
            Some(42),
            Some("application/octet-stream"),
            &headers,
            "acme",
            "/backups/1/app.sql.gz",
            &[],
        );

        let lines: Vec<&str> = signed.split('\n').collect();
        assert_eq!(lines[0], "PUT");
        assert_eq!(lines[3], "42");
        assert_eq!(lines[5], "application/octet-stream");
        assert_eq!(lines[12], "x-ms-blob-type:BlockBlob");
        assert_eq!(lines[13], "x-ms-date:Tue, 05 Mar 2024 10:00:00 GMT");
        assert_eq!(lines[14], format!("x-ms-version:{}", API_VERSION));
        assert_eq!(lines[15], "/acme/backups/1/app.sql.gz");
    }

    #[test]
    fn test_canonical_resource_includes_sorted_query() {
        let signed = string_to_sign(
            "PUT",
            Some(0),
            None,
            &[],
            "acme",
            "/backups",
            &[("restype", "container"), ("comp", "list")],
        );
        assert!(signed.ends_with("/acme/backups\ncomp:list\nrestype:container"));
        assert_eq!(signed.split('\n').nth(3), Some(""));
    }

    #[test]
    fn test_signature_is_stable_base64_hmac() {
        let a = sign(b"key", "payload").unwrap();
        assert_eq!(a, sign(b"key", "payload").unwrap());
        assert_ne!(a, sign(b"other", "payload").unwrap());
        assert_eq!(STANDARD.decode(a).unwrap().len(), 32);
    }

    #[test]
    fn test_blob_path_encodes_segments() {
        let backend = AzureBlobBackend::new(AzureBlobSettings {
            prefix: Some("nightly".to_string()),
            ..Default::default()
        });
        assert_eq!(
            backend.blob_path("backups", "1/my db_20240305.sql.gz"),
            "/backups/nightly/1/my%20db_20240305.sql.gz"
        );
    }
}
