use super::channel::{Receiver, Sender};
use super::Tagged;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// Groups operations for the fetch workers.
///
/// A batch closes when it holds `size` operations or when `max_latency` has
/// passed since its first operation arrived, whichever comes first.
pub struct BatchWindow {
    size: usize,
    max_latency: Duration,
    ops: Vec<Tagged>,
    opened_at: Option<Instant>,
}

impl BatchWindow {
    pub fn new(size: usize, max_latency: Duration) -> Self {
        let size = size.max(1);
        Self {
            size,
            max_latency,
            ops: Vec::with_capacity(size),
            opened_at: None,
        }
    }

    /// Add an operation. Returns the full batch once the size trigger fires.
    pub fn push(&mut self, op: Tagged, now: Instant) -> Option<Vec<Tagged>> {
        if self.ops.is_empty() {
            self.opened_at = Some(now);
        }
        self.ops.push(op);

        if self.ops.len() >= self.size {
            trace!(size = self.ops.len(), "Batch full");
            self.take()
        } else {
            None
        }
    }

    /// When the open batch must be flushed, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.max_latency)
    }

    /// Close the current batch. `None` when nothing is buffered.
    pub fn take(&mut self) -> Option<Vec<Tagged>> {
        self.opened_at = None;
        if self.ops.is_empty() {
            return None;
        }
        Some(std::mem::replace(
            &mut self.ops,
            Vec::with_capacity(self.size),
        ))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Move operations from `input` to `output` in batches until `input`
/// closes; whatever is buffered at that point is flushed before returning.
pub async fn run_batcher(
    mut input: Receiver<Tagged>,
    output: Sender<Vec<Tagged>>,
    mut window: BatchWindow,
) {
    loop {
        let deadline = window.deadline();
        let ready = tokio::select! {
            received = input.recv() => match received {
                Some(op) => window.push(op, Instant::now()),
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                trace!(size = window.len(), "Batch latency reached");
                window.take()
            }
        };

        if let Some(batch) = ready {
            if output.send(batch).await.is_err() {
                debug!("Fetch stage closed, batcher exiting");
                return;
            }
        }
    }

    if let Some(batch) = window.take() {
        debug!(size = batch.len(), "Flushing final batch");
        let _ = output.send(batch).await;
    }
}
