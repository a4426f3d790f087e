pub mod merge;
pub mod reorder;

pub use merge::run_merger;
pub use reorder::ReorderBuffer;
