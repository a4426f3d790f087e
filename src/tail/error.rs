use crate::config::ConfigError;
use crate::source::entry::EntryError;
use crate::source::op::Namespace;
use crate::storage::{CheckpointError, StoreError};
use serde_json::Value;
use thiserror::Error;

/// Everything that can go wrong while tailing.
///
/// Only [`TailError::Fatal`] ends a session. Every other variant is
/// reported to the error handler while data keeps flowing.
#[derive(Debug, Clone, Error)]
pub enum TailError {
    #[error("transient log read failure: {0}")]
    Transient(StoreError),

    #[error("failed to fetch {namespace} document {id}: {source}")]
    Fetch {
        namespace: Namespace,
        id: Value,
        #[source]
        source: StoreError,
    },

    #[error("direct read of {namespace} shard {shard} failed: {source}")]
    DirectRead {
        namespace: Namespace,
        shard: usize,
        #[source]
        source: StoreError,
    },

    #[error("skipping malformed log entry: {0}")]
    Malformed(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("fatal log source error: {0}")]
    Fatal(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("log source '{0}' already has an active tail session")]
    SourceBusy(String),

    #[error("session stopped before the initial snapshot completed")]
    SnapshotAborted,
}

impl TailError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TailError::Fatal(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TailError::Transient(_))
    }
}

impl From<EntryError> for TailError {
    fn from(e: EntryError) -> Self {
        TailError::Malformed(e.to_string())
    }
}

impl From<ConfigError> for TailError {
    fn from(e: ConfigError) -> Self {
        TailError::Config(e.to_string())
    }
}

impl From<CheckpointError> for TailError {
    fn from(e: CheckpointError) -> Self {
        TailError::Checkpoint(e.to_string())
    }
}
