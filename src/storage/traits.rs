use crate::source::entry::RawLogEntry;
use crate::source::op::{Document, Namespace};
use crate::source::position::LogPosition;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

/// Lazy, unbounded sequence of log entries in log order.
pub type LogCursor = BoxStream<'static, Result<RawLogEntry, StoreError>>;

/// Lazy sequence of the documents in one shard of a collection.
pub type DocumentStream = BoxStream<'static, Result<Document, StoreError>>;

/// The document store the tailer reads from. The tailer never writes to it.
#[async_trait]
pub trait Store: Send + Sync {
    /// Stable name of the underlying log source. Used to keep at most one
    /// tail session per source.
    fn source_name(&self) -> String;

    async fn open_session(&self) -> Result<Box<dyn Session>, StoreError>;
}

/// A scoped connection. Sessions are shared between fetch workers, so every
/// method takes `&self`.
#[async_trait]
pub trait Session: Send + Sync {
    async fn fetch_by_id(&self, ns: &Namespace, id: &Value)
        -> Result<Option<Document>, StoreError>;

    async fn scan_shard(
        &self,
        ns: &Namespace,
        shard: ShardSpec,
        batch_size: usize,
    ) -> Result<DocumentStream, StoreError>;

    /// Position of the newest entry in the log, `None` while it is empty.
    async fn latest_position(&self) -> Result<Option<LogPosition>, StoreError>;

    /// Entries strictly after `after`, or only entries appended after the
    /// call when `after` is `None`.
    async fn open_log_cursor(&self, after: Option<LogPosition>) -> Result<LogCursor, StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// One slice of a collection scanned by a single direct reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub index: usize,
    pub count: usize,
    /// Maximum documents to read from this shard; `None` reads to exhaustion.
    pub limit: Option<usize>,
}

impl ShardSpec {
    pub fn new(index: usize, count: usize, limit: usize) -> Self {
        Self {
            index,
            count,
            limit: (limit > 0).then_some(limit),
        }
    }

    /// Whether the n-th document of a collection (in the store's natural
    /// order) belongs to this shard.
    pub fn owns(&self, n: usize) -> bool {
        self.count <= 1 || n % self.count == self.index
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("cursor timed out: {0}")]
    CursorTimeout(String),

    #[error("log cursor is no longer valid: {0}")]
    CursorInvalid(String),

    #[error("log history no longer contains position {requested}; oldest retained is {oldest}")]
    HistoryLost {
        requested: LogPosition,
        oldest: LogPosition,
    },

    #[error("io error: {0}")]
    Io(String),

    #[error("decode error: {0}")]
    Decode(String),

    /// A log entry that cannot be decoded. The cursor has already moved
    /// past it.
    #[error("undecodable log entry {0}")]
    MalformedEntry(String),
}

impl StoreError {
    /// Errors after which reopening the log cursor cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            StoreError::CursorInvalid(_) | StoreError::HistoryLost { .. }
        )
    }

    /// Errors that concern a single log entry; the cursor stays usable.
    pub fn is_skippable(&self) -> bool {
        matches!(self, StoreError::MalformedEntry(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Decode(e.to_string())
    }
}
