use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Failed to execute {tool}: {source}. Make sure the binary is installed and on PATH")]
    ProcessSpawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{}", exit_message(.code, .stderr))]
    ProcessExit { code: Option<i32>, stderr: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Operation refused: {0}")]
    Refused(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Backup cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn exit_message(code: &Option<i32>, stderr: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    match code {
        Some(code) => format!("process exited with code {}", code),
        None => "process terminated by signal".to_string(),
    }
}

impl BackupError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            BackupError::ProcessExit { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for BackupError {
    fn from(err: toml::ser::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(err: reqwest::Error) -> Self {
        BackupError::Storage(err.to_string())
    }
}

impl From<ssh2::Error> for BackupError {
    fn from(err: ssh2::Error) -> Self {
        BackupError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_exit_prefers_stderr() {
        let err = BackupError::ProcessExit {
            code: Some(2),
            stderr: "access denied\n".to_string(),
        };
        assert_eq!(err.to_string(), "access denied");
        assert_eq!(err.exit_code(), Some(2));
    }

    #[test]
    fn test_process_exit_without_stderr() {
        let err = BackupError::ProcessExit {
            code: Some(1),
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "process exited with code 1");
    }
}
