use super::channel::{ErrorSink, Receiver, Sender};
use super::{Outcome, Tagged};
use crate::source::op::Body;
use crate::storage::{Session, Store, StoreError};
use crate::tail::error::TailError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Loads full documents for operations that only carry an id or a delta.
///
/// All workers share one store session and pull whole batches from a
/// common queue, so a slow fetch holds up only its own batch.
pub struct FetchWorkerPool {
    session: Arc<dyn Session>,
    workers: usize,
    deliver_deltas: bool,
}

impl FetchWorkerPool {
    pub async fn open(
        store: &dyn Store,
        workers: usize,
        deliver_deltas: bool,
    ) -> Result<Self, StoreError> {
        let session = store.open_session().await?;
        Ok(Self {
            session: Arc::from(session),
            workers: workers.max(1),
            deliver_deltas,
        })
    }

    /// Release the session of a pool that is never started.
    pub async fn close(self) {
        if let Err(e) = self.session.close().await {
            warn!(error = %e, "Failed to close fetch session");
        }
    }

    /// Start the workers. The returned task finishes once `input` is closed
    /// and every worker has handed off its last outcome; the shared session
    /// is closed then.
    pub fn spawn(
        self,
        input: Receiver<Vec<Tagged>>,
        output: Sender<Outcome>,
        errors: ErrorSink,
    ) -> JoinHandle<()> {
        let input = Arc::new(Mutex::new(input));
        let mut workers = JoinSet::new();

        for worker_id in 0..self.workers {
            let worker = FetchWorker {
                id: worker_id,
                session: Arc::clone(&self.session),
                deliver_deltas: self.deliver_deltas,
                errors: errors.clone(),
            };
            workers.spawn(worker.run(Arc::clone(&input), output.clone()));
        }
        drop(output);

        let session = self.session;
        let count = self.workers;
        tokio::spawn(async move {
            info!(workers = count, "Fetch workers started");
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Fetch worker panicked");
                }
            }
            if let Err(e) = session.close().await {
                warn!(error = %e, "Failed to close fetch session");
            }
            debug!("Fetch workers stopped");
        })
    }
}

struct FetchWorker {
    id: usize,
    session: Arc<dyn Session>,
    deliver_deltas: bool,
    errors: ErrorSink,
}

impl FetchWorker {
    async fn run(self, input: Arc<Mutex<Receiver<Vec<Tagged>>>>, output: Sender<Outcome>) {
        loop {
            let batch = {
                let mut rx = input.lock().await;
                rx.recv().await
            };
            let Some(batch) = batch else {
                break;
            };

            debug!(worker = self.id, size = batch.len(), "Fetching batch");
            for tagged in batch {
                let outcome = self.resolve(tagged).await;
                if output.send(outcome).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn resolve(&self, tagged: Tagged) -> Outcome {
        if !tagged.op.needs_fetch(self.deliver_deltas) {
            return Outcome::Ready(tagged);
        }

        let Some(id) = tagged.op.id().cloned() else {
            warn!(
                namespace = %tagged.op.namespace(),
                "Operation without a document id, dropping"
            );
            return Outcome::Dropped(tagged);
        };

        match self.session.fetch_by_id(tagged.op.namespace(), &id).await {
            Ok(Some(document)) => Outcome::Ready(Tagged {
                seq: tagged.seq,
                op: tagged.op.with_body(Body::Full(document)),
            }),
            Ok(None) => {
                warn!(
                    namespace = %tagged.op.namespace(),
                    id = %id,
                    "Document no longer exists, dropping operation"
                );
                Outcome::Dropped(tagged)
            }
            Err(source) => {
                self.errors.report(TailError::Fetch {
                    namespace: tagged.op.namespace().clone(),
                    id,
                    source,
                });
                Outcome::Dropped(tagged)
            }
        }
    }
}
