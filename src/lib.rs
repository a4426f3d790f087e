pub mod cli;
pub mod config;
pub mod dispatch;
pub mod pipeline;
pub mod sequencer;
pub mod source;
pub mod storage;
pub mod tail;

pub use config::Config;
pub use dispatch::{EventHandler, HandlerSet, Sanitizer};
pub use source::{Body, Document, LogPosition, Namespace, Operation, OperationKind};
pub use source::{SnapshotProgress, SnapshotSummary};
pub use storage::{MemoryPositionStore, MemoryStore, PositionStore, Store};
pub use tail::{SessionState, TailError, TailHandle, TailSession};
