use async_trait::async_trait;
use bytes::Bytes;
use ssh2::{ErrorCode, Session, Sftp};
use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use super::{build_remote_key, required, DownloadStream, StorageBackend};
use crate::error::{BackupError, Result};
use crate::model::{DestinationKind, SftpSettings};

const DEFAULT_PORT: u16 = 22;
const CHUNK_SIZE: usize = 64 * 1024;
const NO_SUCH_FILE: i32 = 2;

/// SFTP over libssh2. Each operation opens its own session on a blocking
/// thread and drops it when the operation ends.
pub struct SftpBackend {
    settings: SftpSettings,
}

struct Connection {
    // Keeps the session alive for as long as the SFTP channel is used.
    _session: Session,
    sftp: Sftp,
}

impl SftpBackend {
    pub fn new(settings: SftpSettings) -> Self {
        Self { settings }
    }

    /// `base_path / key`. An absolute base path stays absolute; a relative
    /// one resolves against the login directory.
    fn remote_path(&self, key: &str) -> String {
        let key = build_remote_key(None, key);
        let base = self.settings.base_path.as_deref().unwrap_or_default().trim();
        let absolute = base.starts_with('/');
        let base = base.trim_matches('/');
        match (absolute, base.is_empty()) {
            (true, true) => format!("/{}", key),
            (true, false) => format!("/{}/{}", base, key),
            (false, true) => key,
            (false, false) => format!("{}/{}", base, key),
        }
    }
}

fn connect(settings: &SftpSettings) -> Result<Connection> {
    let host = required(&settings.host, "host", DestinationKind::Sftp)?;
    let username = required(&settings.username, "username", DestinationKind::Sftp)?;
    let port = settings.port.unwrap_or(DEFAULT_PORT);

    let tcp = TcpStream::connect((host, port))
        .map_err(|e| BackupError::Storage(format!("Failed to connect to {}:{}: {}", host, port, e)))?;
    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake()?;

    let private_key = settings.private_key.as_deref().filter(|k| !k.trim().is_empty());
    let password = settings.password.as_deref().filter(|p| !p.is_empty());
    match (private_key, password) {
        (Some(key), _) => authenticate_with_key(&session, username, key, settings.passphrase.as_deref())?,
        (None, Some(password)) => session.userauth_password(username, password)?,
        (None, None) => {
            return Err(BackupError::Config(
                "sftp destination needs a password or a private_key".to_string(),
            ))
        }
    }

    if !session.authenticated() {
        return Err(BackupError::Storage(format!(
            "SFTP authentication failed for {}@{}",
            username, host
        )));
    }

    let sftp = session.sftp()?;
    Ok(Connection {
        _session: session,
        sftp,
    })
}

#[cfg(unix)]
fn authenticate_with_key(session: &Session, username: &str, key: &str, passphrase: Option<&str>) -> Result<()> {
    let passphrase = passphrase.filter(|p| !p.is_empty());
    session.userauth_pubkey_memory(username, None, key, passphrase)?;
    Ok(())
}

#[cfg(not(unix))]
fn authenticate_with_key(_session: &Session, _username: &str, _key: &str, _passphrase: Option<&str>) -> Result<()> {
    Err(BackupError::Config(
        "sftp private key authentication is only supported on unix hosts".to_string(),
    ))
}

fn create_dir_all(sftp: &Sftp, dir: &Path) -> Result<()> {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if current.as_os_str().is_empty() || current == Path::new("/") {
            continue;
        }
        if sftp.stat(&current).is_err() {
            sftp.mkdir(&current, 0o755)?;
        }
    }
    Ok(())
}

fn is_missing(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::SFTP(NO_SUCH_FILE))
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| BackupError::Storage(format!("SFTP task failed: {}", e)))?
}

#[async_trait]
impl StorageBackend for SftpBackend {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let settings = self.settings.clone();
        let remote = self.remote_path(key);
        let local = local_path.to_path_buf();

        let target = remote.clone();
        blocking(move || {
            let conn = connect(&settings)?;
            let remote_path = Path::new(&target);
            if let Some(parent) = remote_path.parent() {
                create_dir_all(&conn.sftp, parent)?;
            }

            let mut source = std::fs::File::open(&local)?;
            let mut sink = conn.sftp.create(remote_path)?;
            std::io::copy(&mut source, &mut sink)?;
            Ok(())
        })
        .await?;

        info!("Uploaded {} to sftp:{}", local_path.display(), remote);
        Ok(())
    }

    async fn download_stream(&self, key: &str) -> Result<DownloadStream> {
        let settings = self.settings.clone();
        let remote = self.remote_path(key);
        let (opened_tx, opened_rx) = oneshot::channel::<Result<Option<u64>>>();
        let (chunk_tx, chunk_rx) = mpsc::channel::<std::io::Result<Bytes>>(8);

        tokio::task::spawn_blocking(move || {
            let opened = connect(&settings).and_then(|conn| {
                let path = Path::new(&remote);
                let mut file = conn.sftp.open(path).map_err(|e| {
                    if is_missing(&e) {
                        BackupError::NotFound(format!("sftp:{}", remote))
                    } else {
                        e.into()
                    }
                })?;
                let size = file.stat().ok().and_then(|s| s.size);
                Ok((conn, size, file))
            });

            let (_conn, size, mut file) = match opened {
                Ok(parts) => parts,
                Err(e) => {
                    let _ = opened_tx.send(Err(e));
                    return;
                }
            };
            if opened_tx.send(Ok(size)).is_err() {
                return;
            }

            let mut buffer = vec![0u8; CHUNK_SIZE];
            loop {
                match file.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if chunk_tx.blocking_send(Ok(Bytes::copy_from_slice(&buffer[..n]))).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = chunk_tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        let content_length = opened_rx
            .await
            .map_err(|_| BackupError::Storage("SFTP download task ended unexpectedly".to_string()))??;

        let stream = futures::stream::unfold(chunk_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(DownloadStream {
            reader: Box::pin(StreamReader::new(stream)),
            content_length,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let settings = self.settings.clone();
        let remote = self.remote_path(key);

        let target = remote.clone();
        blocking(move || {
            let conn = connect(&settings)?;
            match conn.sftp.unlink(Path::new(&target)) {
                Ok(()) => Ok(()),
                Err(e) if is_missing(&e) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        debug!("Deleted sftp:{}", remote);
        Ok(())
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::Sftp
    }
}
