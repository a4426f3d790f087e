use crate::config::{validate_config, Config};
use crate::dispatch::{Dispatcher, EventHandler, HandlerSet, NamespaceFilter, Sanitizer};
use crate::pipeline::{create_channel, run_batcher, BatchWindow, ErrorSink, FetchWorkerPool};
use crate::sequencer::run_merger;
use crate::source::direct::{parse_namespaces, DirectReadCoordinator};
use crate::source::op::Namespace;
use crate::source::position::LogPosition;
use crate::source::reader::LogReader;
use crate::source::snapshot::{
    wait_for_snapshot, SnapshotProgress, SnapshotState, SnapshotSummary, SnapshotTracker,
};
use crate::storage::{CheckpointManager, FilePositionStore, PositionStore, Store};
use crate::tail::error::TailError;
use crate::tail::position::{PositionTracker, PositionWatch};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
struct Status {
    state: SessionState,
    error: Option<TailError>,
}

fn active_sources() -> &'static Mutex<HashSet<String>> {
    static ACTIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on a log source, released on drop.
struct SourceClaim(String);

impl SourceClaim {
    fn acquire(source: String) -> Result<Self, TailError> {
        let mut active = active_sources()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !active.insert(source.clone()) {
            return Err(TailError::SourceBusy(source));
        }
        Ok(Self(source))
    }
}

impl Drop for SourceClaim {
    fn drop(&mut self) {
        active_sources()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.0);
    }
}

/// Entry point for tailing a store.
///
/// ```ignore
/// let handle = TailSession::builder(store)
///     .handler(Arc::new(HandlerSet::new().on_insert(|op| println!("{:?}", op))))
///     .start(config)
///     .await?;
/// handle.await_snapshot_complete().await?;
/// handle.stop().await;
/// ```
pub struct TailSession;

impl TailSession {
    pub fn builder(store: Arc<dyn Store>) -> TailSessionBuilder {
        TailSessionBuilder {
            store,
            handler: Arc::new(HandlerSet::new()),
            sanitizer: None,
            positions: None,
        }
    }
}

pub struct TailSessionBuilder {
    store: Arc<dyn Store>,
    handler: Arc<dyn EventHandler>,
    sanitizer: Option<Arc<dyn Sanitizer>>,
    positions: Option<Arc<dyn PositionStore>>,
}

impl TailSessionBuilder {
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    /// Where the acknowledged position is persisted. Without one, a file
    /// store is used when `checkpoint.enabled` is set.
    pub fn positions(mut self, positions: Arc<dyn PositionStore>) -> Self {
        self.positions = Some(positions);
        self
    }

    /// Validate `config`, open the log cursor and start every stage.
    ///
    /// Configuration problems fail before anything is spawned. The returned
    /// handle is already `Running`.
    pub async fn start(self, config: Config) -> Result<TailHandle, TailError> {
        validate_config(&config)?;
        let filter = NamespaceFilter::from_config(&config.filter)
            .map_err(|e| TailError::Config(e.to_string()))?;
        let namespaces = parse_namespaces(&config.direct_read)
            .map_err(|e| TailError::Config(e.to_string()))?;

        let source = self.store.source_name();
        let claim = SourceClaim::acquire(source.clone())?;
        let session_id = Uuid::new_v4();
        let (status, _) = watch::channel(Status {
            state: SessionState::Created,
            error: None,
        });
        info!(session = %session_id, source = %source, "Starting tail session");

        let positions = self.positions.or_else(|| {
            config.checkpoint.enabled.then(|| {
                Arc::new(FilePositionStore::new(config.checkpoint.path.clone()))
                    as Arc<dyn PositionStore>
            })
        });
        let mut checkpoints = positions.map(|store| {
            CheckpointManager::new(store, source.clone(), config.checkpoint.interval)
        });

        let resume = resolve_resume(&config, checkpoints.as_mut(), namespaces.is_empty()).await?;

        let tracker = PositionTracker::new(resume);
        let position = tracker.subscribe();
        let (errors, error_rx) = ErrorSink::new();
        let mut reader = LogReader::new(
            Arc::clone(&self.store),
            tracker,
            checkpoints.map(|manager| (manager, config.checkpoint.interval)),
            errors.clone(),
        );
        let pool = FetchWorkerPool::open(
            self.store.as_ref(),
            config.workers,
            config.update_data_as_delta,
        )
        .await
        .map_err(|e| TailError::Fatal(format!("cannot open fetch session: {}", e)))?;
        let cursor = match reader.open().await {
            Ok(cursor) => cursor,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };
        status.send_modify(|s| s.state = SessionState::Running);

        let snapshot = Arc::new(SnapshotTracker::new(
            &namespaces,
            DirectReadCoordinator::shards_per_namespace(&config.direct_read),
        ));
        let cancel = CancellationToken::new();

        let (ingest_tx, ingest_rx) = create_channel(config.channel_size);
        let (batch_tx, batch_rx) = create_channel(config.channel_size);
        let (fetched_tx, fetched_rx) = create_channel(config.channel_size);
        let (ordered_tx, ordered_rx) = create_channel(config.channel_size);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let error_task = tokio::spawn(run_error_sink(error_rx, Arc::clone(&self.handler)));

        let direct = DirectReadCoordinator::new(
            Arc::clone(&self.store),
            namespaces,
            &config.direct_read,
            Arc::clone(&snapshot),
        )
        .spawn(ingest_tx.clone(), errors.clone(), cancel.clone());

        let reader_task = tokio::spawn(reader.run(cursor, ingest_tx, ack_rx, cancel.clone()));

        let window = BatchWindow::new(config.buffer.size, config.buffer.max_latency);
        let dispatcher = Dispatcher::new(
            filter,
            self.handler,
            self.sanitizer,
            ack_tx,
            Arc::clone(&snapshot),
        );
        let stages = vec![
            direct,
            tokio::spawn(run_batcher(ingest_rx, batch_tx, window)),
            pool.spawn(batch_rx, fetched_tx, errors),
            tokio::spawn(run_merger(fetched_rx, ordered_tx, config.ordering)),
            tokio::spawn(async move {
                dispatcher.run(ordered_rx).await;
            }),
        ];

        let status = Arc::new(status);
        tokio::spawn(supervise(
            reader_task,
            stages,
            error_task,
            Arc::clone(&status),
            Arc::clone(&snapshot),
            claim,
        ));

        Ok(TailHandle {
            session_id,
            cancel,
            status,
            position,
            snapshot,
        })
    }
}

/// Decide where tailing starts: explicit config, then checkpoint, then the
/// end of the log.
async fn resolve_resume(
    config: &Config,
    checkpoints: Option<&mut CheckpointManager>,
    no_direct_read: bool,
) -> Result<Option<LogPosition>, TailError> {
    if let Some(position) = config.resume_position {
        info!(position = %position, "Resuming from configured position");
        return Ok(Some(position));
    }

    if let Some(manager) = checkpoints {
        if let Some(position) = manager.load().await? {
            info!(position = %position, "Resuming from checkpoint");
            return Ok(Some(position));
        }
    }

    if no_direct_read {
        warn!(
            "No resume position; tailing from the end of the log. \
             Documents written before now are not delivered unless direct_read is configured"
        );
    }
    Ok(None)
}

async fn run_error_sink(
    mut errors: mpsc::UnboundedReceiver<TailError>,
    handler: Arc<dyn EventHandler>,
) {
    while let Some(error) = errors.recv().await {
        handler.on_error(&error).await;
    }
}

/// Waits for the reader, then for every downstream stage to drain, and
/// publishes the final state.
async fn supervise(
    reader: JoinHandle<Result<(), TailError>>,
    stages: Vec<JoinHandle<()>>,
    error_task: JoinHandle<()>,
    status: Arc<watch::Sender<Status>>,
    snapshot: Arc<SnapshotTracker>,
    claim: SourceClaim,
) {
    let outcome = match reader.await {
        Ok(result) => result,
        Err(e) => Err(TailError::Fatal(format!("log reader panicked: {}", e))),
    };
    if let Err(e) = &outcome {
        error!(error = %e, "Tail session failed");
    }
    status.send_modify(|s| {
        if s.state == SessionState::Running {
            s.state = SessionState::Draining;
        }
    });

    for stage in stages {
        if let Err(e) = stage.await {
            warn!(error = %e, "Pipeline stage panicked");
        }
    }
    if let Err(e) = error_task.await {
        warn!(error = %e, "Error handler task panicked");
    }

    snapshot.abort();
    drop(claim);
    status.send_modify(|s| {
        s.state = SessionState::Stopped;
        s.error = outcome.err();
    });
    info!("Tail session stopped");
}

/// Control surface of a running session.
pub struct TailHandle {
    session_id: Uuid,
    cancel: CancellationToken,
    status: Arc<watch::Sender<Status>>,
    position: PositionWatch,
    snapshot: Arc<SnapshotTracker>,
}

impl TailHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Last acknowledged log position.
    pub fn position(&self) -> Option<LogPosition> {
        self.position.current()
    }

    pub fn snapshot_progress(&self) -> BTreeMap<Namespace, SnapshotProgress> {
        self.snapshot.progress()
    }

    pub fn snapshot_state(&self) -> SnapshotState {
        self.snapshot.state()
    }

    /// Resolves once every direct-read document has been delivered.
    pub async fn await_snapshot_complete(&self) -> Result<SnapshotSummary, TailError> {
        wait_for_snapshot(self.snapshot.subscribe()).await
    }

    /// Stop producing new work and wait until everything in flight has been
    /// delivered or reported. Calling it again is harmless.
    pub async fn stop(&self) {
        let requested = self.status.send_if_modified(|s| match s.state {
            SessionState::Created | SessionState::Running => {
                s.state = SessionState::Draining;
                true
            }
            SessionState::Draining | SessionState::Stopped => false,
        });
        if requested {
            info!(session = %self.session_id, "Stop requested, draining");
            self.cancel.cancel();
        } else {
            debug!(session = %self.session_id, "Stop already in progress");
        }
        let _ = self.wait().await;
    }

    /// Resolves when the session is `Stopped`, with the fatal error that
    /// ended it, if any.
    pub async fn wait(&self) -> Result<(), TailError> {
        let mut status = self.status.subscribe();
        let stopped = status
            .wait_for(|s| s.state == SessionState::Stopped)
            .await
            .map_err(|_| TailError::Fatal("session supervisor vanished".into()))?;
        match &stopped.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
