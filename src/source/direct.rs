use crate::config::DirectReadConfig;
use crate::pipeline::{ErrorSink, Sender, Tagged};
use crate::source::op::{Namespace, NamespaceError, Operation};
use crate::source::snapshot::SnapshotTracker;
use crate::storage::{ShardSpec, Store, StoreError};
use crate::tail::error::TailError;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scans existing documents of the configured namespaces and emits a
/// synthetic insert for each one.
///
/// Every namespace is split into `readers_per_collection` shards scanned
/// concurrently, each on its own store session. Scanning runs alongside the
/// log reader, so a document changed during the scan can arrive twice.
pub struct DirectReadCoordinator {
    store: Arc<dyn Store>,
    namespaces: Vec<Namespace>,
    readers: usize,
    batch_size: usize,
    limit: usize,
    tracker: Arc<SnapshotTracker>,
}

/// Parse the configured namespace list.
pub fn parse_namespaces(config: &DirectReadConfig) -> Result<Vec<Namespace>, NamespaceError> {
    config.namespaces.iter().map(|ns| ns.parse()).collect()
}

impl DirectReadCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        namespaces: Vec<Namespace>,
        config: &DirectReadConfig,
        tracker: Arc<SnapshotTracker>,
    ) -> Self {
        Self {
            store,
            namespaces,
            readers: config.readers_per_collection.max(1),
            batch_size: config.batch_size.max(1),
            limit: config.limit,
            tracker,
        }
    }

    pub fn shards_per_namespace(config: &DirectReadConfig) -> usize {
        config.readers_per_collection.max(1)
    }

    /// Start one task per (namespace, shard). The returned task finishes when
    /// all of them have, or when `cancel` fires.
    pub fn spawn(
        self,
        output: Sender<Tagged>,
        errors: ErrorSink,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.namespaces.is_empty() {
                return;
            }
            info!(
                namespaces = self.namespaces.len(),
                readers_per_collection = self.readers,
                "Starting direct read"
            );

            let mut tasks = JoinSet::new();
            for ns in &self.namespaces {
                for index in 0..self.readers {
                    let task = DirectReadTask {
                        store: Arc::clone(&self.store),
                        namespace: ns.clone(),
                        shard: ShardSpec::new(index, self.readers, self.limit),
                        batch_size: self.batch_size,
                        tracker: Arc::clone(&self.tracker),
                    };
                    tasks.spawn(task.run(output.clone(), errors.clone(), cancel.clone()));
                }
            }
            drop(output);

            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Direct read task panicked");
                }
            }
            debug!("Direct read tasks finished");
        })
    }
}

struct DirectReadTask {
    store: Arc<dyn Store>,
    namespace: Namespace,
    shard: ShardSpec,
    batch_size: usize,
    tracker: Arc<SnapshotTracker>,
}

enum ScanEnd {
    Exhausted,
    Failed(StoreError),
    Cancelled,
}

impl DirectReadTask {
    async fn run(self, output: Sender<Tagged>, errors: ErrorSink, cancel: CancellationToken) {
        let session = match self.store.open_session().await {
            Ok(session) => session,
            Err(e) => {
                self.finish(ScanEnd::Failed(e), 0, &errors);
                return;
            }
        };

        let mut emitted = 0u64;
        let end = match session
            .scan_shard(&self.namespace, self.shard, self.batch_size)
            .await
        {
            Ok(mut docs) => loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break ScanEnd::Cancelled,
                    next = docs.next() => next,
                };
                match next {
                    Some(Ok(doc)) => {
                        self.tracker.emitted(&self.namespace);
                        let op = Operation::direct_read(self.namespace.clone(), doc);
                        if output.send(Tagged { seq: None, op }).await.is_err() {
                            self.tracker.retracted(&self.namespace);
                            break ScanEnd::Cancelled;
                        }
                        emitted += 1;
                    }
                    Some(Err(e)) => break ScanEnd::Failed(e),
                    None => break ScanEnd::Exhausted,
                }
            },
            Err(e) => ScanEnd::Failed(e),
        };

        if let Err(e) = session.close().await {
            warn!(namespace = %self.namespace, error = %e, "Failed to close direct read session");
        }
        self.finish(end, emitted, &errors);
    }

    fn finish(&self, end: ScanEnd, emitted: u64, errors: &ErrorSink) {
        match end {
            ScanEnd::Exhausted => {
                debug!(
                    namespace = %self.namespace,
                    shard = self.shard.index,
                    documents = emitted,
                    "Shard scan complete"
                );
                self.tracker.shard_finished(&self.namespace, false);
            }
            ScanEnd::Failed(source) => {
                errors.report(TailError::DirectRead {
                    namespace: self.namespace.clone(),
                    shard: self.shard.index,
                    source,
                });
                self.tracker.shard_finished(&self.namespace, true);
            }
            ScanEnd::Cancelled => {
                debug!(
                    namespace = %self.namespace,
                    shard = self.shard.index,
                    documents = emitted,
                    "Shard scan stopped early"
                );
            }
        }
    }
}
