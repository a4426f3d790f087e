pub mod checkpoint;
pub mod jsonl;
pub mod memory;
pub mod traits;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointManager, FilePositionStore, MemoryPositionStore,
    PositionStore,
};
pub use jsonl::JsonLinesStore;
pub use memory::MemoryStore;
pub use traits::{DocumentStream, LogCursor, Session, ShardSpec, Store, StoreError};
