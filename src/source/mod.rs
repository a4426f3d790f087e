pub mod direct;
pub mod entry;
pub mod op;
pub mod position;
pub mod reader;
pub mod snapshot;

pub use direct::DirectReadCoordinator;
pub use entry::{EntryError, RawLogEntry};
pub use op::{Body, Document, Namespace, NamespaceError, Operation, OperationKind, Provenance};
pub use position::{LogPosition, PositionError};
pub use reader::LogReader;
pub use snapshot::{SnapshotProgress, SnapshotState, SnapshotSummary, SnapshotTracker};
