use std::io;
use std::path::PathBuf;

/// Error kinds surfaced by the core. Each carries enough context to print a
/// useful root cause without the caller re-wrapping it.
#[derive(Debug, thiserror::Error)]
pub enum TpmError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited, retry in {wait_seconds}s")]
    RateLimited { wait_seconds: u64 },

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("filesystem error at {path}: {source}")]
    Filesystem { path: PathBuf, source: io::Error },

    #[error("another operation holds the lock: {0}")]
    Busy(String),

    #[error("{context} aborted, rolled back ({rollback_failures} rollback step(s) failed): {source}")]
    TransactionAborted {
        context: String,
        rollback_failures: usize,
        source: Box<TpmError>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl TpmError {
    pub fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TpmError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error. `TransactionAborted` reports the
    /// code of the error that triggered the rollback.
    pub fn exit_code(&self) -> u8 {
        match self {
            TpmError::Usage(_) => 2,
            TpmError::RateLimited { .. } => 3,
            TpmError::Network(_) => 4,
            TpmError::UnsupportedArch(_) => 5,
            TpmError::TransactionAborted { source, .. } => source.exit_code(),
            _ => 1,
        }
    }
}

impl From<io::Error> for TpmError {
    fn from(e: io::Error) -> Self {
        TpmError::Filesystem {
            path: PathBuf::new(),
            source: e,
        }
    }
}

impl From<reqwest::Error> for TpmError {
    fn from(e: reqwest::Error) -> Self {
        TpmError::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TpmError>;
