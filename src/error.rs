use crate::model::CacheStore;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a South or North adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("rejected by destination (status {status_code}): {message}")]
    Rejected { status_code: u16, message: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("cancelled")]
    Cancelled,
}

impl ConnectorError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn rejected(status_code: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status_code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid cache metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("cache entry {0} not found in {1} store")]
    NotFound(String, CacheStore),
    #[error("cache entry {0} is being dispatched")]
    Busy(String),
    #[error("cache for north {north_id} is full ({size} bytes, limit {limit} bytes)")]
    Full {
        north_id: String,
        size: u64,
        limit: u64,
    },
    #[error("invalid cache file name {0:?}")]
    InvalidName(String),
    #[error("cache content could not be decoded: {0}")]
    Content(String),
}

impl CacheError {
    pub fn io(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
        move |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid checkpoint instant {0:?}")]
    InvalidInstant(String),
    #[error("checkpoint store lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid cron expression {expression:?} for scan mode {scan_mode}: {reason}")]
    InvalidCron {
        scan_mode: String,
        expression: String,
        reason: String,
    },
    #[error("scan mode {0} never triggers in the future")]
    NoFutureTrigger(String),
    #[error("unknown scan mode {scan_mode} referenced by {owner}")]
    UnknownScanMode { scan_mode: String, owner: String },
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: String },
    #[error("unknown {role} connector type {kind}")]
    UnknownType { role: &'static str, kind: String },
    #[error("subscription references unknown {role} connector {id}")]
    UnknownConnector { role: &'static str, id: String },
    #[error("north {0} has groupCount = 0")]
    InvalidGroupCount(String),
    #[error("invalid settings for {owner}: {reason}")]
    InvalidSettings { owner: String, reason: String },
}

/// Failure of one South acquisition tick.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown {role} connector {id}")]
    UnknownConnector { role: &'static str, id: String },
    #[error("{role} connector {id} already exists")]
    ConnectorExists { role: &'static str, id: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}
