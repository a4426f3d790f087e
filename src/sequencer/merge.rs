use crate::config::OrderingMode;
use crate::pipeline::{Outcome, Receiver, Sender};
use crate::sequencer::reorder::ReorderBuffer;
use tracing::{debug, warn};

/// Forward fetch results to the dispatcher.
///
/// In strict mode log-origin results leave in sequence order; direct-read
/// results are never held. In unordered mode everything is forwarded as it
/// arrives. Returns once `input` closes and everything has been forwarded.
pub async fn run_merger(
    mut input: Receiver<Outcome>,
    output: Sender<Outcome>,
    mode: OrderingMode,
) {
    let mut buffer = ReorderBuffer::new();

    while let Some(outcome) = input.recv().await {
        let ready = match mode {
            OrderingMode::Strict => buffer.push(outcome.seq(), outcome),
            OrderingMode::Unordered => vec![outcome],
        };
        for outcome in ready {
            if output.send(outcome).await.is_err() {
                debug!("Dispatcher closed, merger exiting");
                return;
            }
        }
    }

    if buffer.held() > 0 {
        // Only reachable when an upstream stage lost an operation.
        warn!(
            held = buffer.held(),
            waiting_for = buffer.next_seq(),
            "Sequence gap at shutdown, releasing held operations"
        );
        for outcome in buffer.drain() {
            if output.send(outcome).await.is_err() {
                return;
            }
        }
    }
}
