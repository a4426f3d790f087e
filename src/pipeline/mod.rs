pub mod batch;
pub mod channel;
pub mod fetch;

pub use batch::{run_batcher, BatchWindow};
pub use channel::{create_channel, ErrorSink, Receiver, Sender};
pub use fetch::FetchWorkerPool;

use crate::source::op::Operation;

/// An operation in flight, with the sequence number the log reader uses to
/// acknowledge it. Direct-read operations carry no sequence number.
#[derive(Debug, Clone)]
pub struct Tagged {
    pub seq: Option<u64>,
    pub op: Operation,
}

/// What the fetch stage hands downstream for every operation it received.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Ready to deliver.
    Ready(Tagged),
    /// Given up on; still travels downstream so it can be acknowledged.
    Dropped(Tagged),
}

impl Outcome {
    pub fn seq(&self) -> Option<u64> {
        match self {
            Outcome::Ready(t) | Outcome::Dropped(t) => t.seq,
        }
    }

    pub fn tagged(&self) -> &Tagged {
        match self {
            Outcome::Ready(t) | Outcome::Dropped(t) => t,
        }
    }
}
