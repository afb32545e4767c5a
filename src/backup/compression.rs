use crate::error::{BackupError, Result};
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    /// Uncompressed bytes read from the source.
    pub bytes_in: u64,

    pub bytes_out: u64,

    /// SHA-256 of the uncompressed stream, lowercase hex.
    pub checksum: String,
}

/// Reads `source` to the end, hashing and gzip-compressing each chunk, and
/// writes the compressed bytes to `dest`. A chunk is only read once the
/// previous one has been written, so a slow disk slows the producer down.
pub async fn compress_stream<R>(mut source: R, dest: &Path) -> Result<StreamSummary>
where
    R: AsyncRead + Unpin,
{
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut hasher = Sha256::new();
    let mut encoder = GzEncoder::new(Vec::with_capacity(CHUNK_SIZE), Compression::default());
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut bytes_in = 0u64;
    let mut bytes_out = 0u64;

    loop {
        let n = source
            .read(&mut buffer)
            .await
            .map_err(|e| BackupError::Stream(format!("failed reading dump output: {}", e)))?;
        if n == 0 {
            break;
        }
        bytes_in += n as u64;
        hasher.update(&buffer[..n]);
        encoder.write_all(&buffer[..n])?;

        let compressed = encoder.get_mut();
        if !compressed.is_empty() {
            file.write_all(compressed).await?;
            bytes_out += compressed.len() as u64;
            compressed.clear();
        }
    }

    let tail = encoder.finish()?;
    file.write_all(&tail).await?;
    bytes_out += tail.len() as u64;
    file.flush().await?;
    file.sync_all().await?;

    debug!(
        "Compressed {} bytes into {} bytes at {}",
        bytes_in,
        bytes_out,
        dest.display()
    );

    Ok(StreamSummary {
        bytes_in,
        bytes_out,
        checksum: format!("{:x}", hasher.finalize()),
    })
}

struct HashingSink {
    hasher: Sha256,
    len: u64,
}

impl Write for HashingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.len += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Decompresses a gzip stream and returns the SHA-256 and length of its
/// content. Malformed gzip input is an integrity error.
pub async fn checksum_compressed<R>(mut source: R) -> Result<(String, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = GzDecoder::new(HashingSink {
        hasher: Sha256::new(),
        len: 0,
    });
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let n = source
            .read(&mut buffer)
            .await
            .map_err(|e| BackupError::Stream(format!("failed reading artifact: {}", e)))?;
        if n == 0 {
            break;
        }
        decoder
            .write_all(&buffer[..n])
            .map_err(|e| BackupError::Integrity(format!("artifact is not valid gzip: {}", e)))?;
    }

    let sink = decoder
        .finish()
        .map_err(|e| BackupError::Integrity(format!("artifact is not valid gzip: {}", e)))?;
    Ok((format!("{:x}", sink.hasher.finalize()), sink.len))
}

/// Fails with `Integrity` when the artifact content does not match `expected`.
pub async fn verify_checksum<R>(source: R, expected: &str) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let (actual, len) = checksum_compressed(source).await?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(BackupError::Integrity(format!(
            "checksum mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_checksum_is_of_uncompressed_content() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("1/test.sql.gz");

        let summary = compress_stream(&b"hello world"[..], &dest).await.unwrap();
        assert_eq!(
            summary.checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(summary.bytes_in, 11);
        assert_eq!(summary.bytes_out, std::fs::metadata(&dest).unwrap().len());
    }

    #[tokio::test]
    async fn test_decompressed_output_matches_input() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("dump.sql.gz");
        let input: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();

        let summary = compress_stream(input.as_slice(), &dest).await.unwrap();

        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(std::fs::File::open(&dest).unwrap())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, input);
        assert_eq!(format!("{:x}", Sha256::digest(&input)), summary.checksum);
    }

    #[tokio::test]
    async fn test_empty_input_still_produces_valid_gzip() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("empty.sql.gz");
        let summary = compress_stream(&b""[..], &dest).await.unwrap();
        assert_eq!(summary.bytes_in, 0);
        assert!(summary.bytes_out > 0);

        let file = tokio::fs::File::open(&dest).await.unwrap();
        assert_eq!(verify_checksum(file, &summary.checksum).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_verify_detects_mismatch_and_garbage() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.sql.gz");
        let summary = compress_stream(&b"CREATE TABLE t (id int);"[..], &dest).await.unwrap();

        let file = tokio::fs::File::open(&dest).await.unwrap();
        assert_eq!(verify_checksum(file, &summary.checksum).await.unwrap(), 24);

        let file = tokio::fs::File::open(&dest).await.unwrap();
        assert!(matches!(
            verify_checksum(file, "00").await,
            Err(BackupError::Integrity(_))
        ));

        assert!(matches!(
            checksum_compressed(&b"definitely not gzip"[..]).await,
            Err(BackupError::Integrity(_))
        ));
    }
}
