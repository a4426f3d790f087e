use crate::pipeline::{ErrorSink, Sender, Tagged};
use crate::source::entry::RawLogEntry;
use crate::source::position::LogPosition;
use crate::storage::{CheckpointManager, LogCursor, Session, Store, StoreError};
use crate::tail::error::TailError;
use crate::tail::position::{AckWindow, PositionTracker};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const IDLE_FLUSH_INTERVAL: Duration = Duration::from_secs(3600);

/// Owns the log cursor and the acknowledged position.
///
/// Entries are normalised and tagged with a sequence number before they
/// enter the pipeline. The dispatcher acknowledges sequence numbers back,
/// and only a contiguous run of acknowledgements moves the position.
pub struct LogReader {
    store: Arc<dyn Store>,
    session: Option<Box<dyn Session>>,
    tracker: PositionTracker,
    window: AckWindow,
    /// Newest entry handed downstream; re-read entries up to here are skipped.
    last_read: Option<LogPosition>,
    checkpoints: Option<CheckpointManager>,
    checkpoint_interval: Duration,
    errors: ErrorSink,
}

impl LogReader {
    pub fn new(
        store: Arc<dyn Store>,
        tracker: PositionTracker,
        checkpoints: Option<(CheckpointManager, Duration)>,
        errors: ErrorSink,
    ) -> Self {
        let (checkpoints, checkpoint_interval) = match checkpoints {
            Some((manager, interval)) => (Some(manager), interval),
            None => (None, IDLE_FLUSH_INTERVAL),
        };
        Self {
            store,
            session: None,
            tracker,
            window: AckWindow::new(),
            last_read: None,
            checkpoints,
            checkpoint_interval,
            errors,
        }
    }

    /// Open the log session and a cursor at the tracked position. Without a
    /// position the end of the log becomes the starting point, so a later
    /// reopen cannot skip entries appended in between.
    pub async fn open(&mut self) -> Result<LogCursor, TailError> {
        let session = self
            .store
            .open_session()
            .await
            .map_err(|e| TailError::Fatal(format!("cannot open log session: {}", e)))?;

        if self.tracker.current().is_none() {
            let latest = session
                .latest_position()
                .await
                .map_err(|e| TailError::Fatal(format!("cannot read log end: {}", e)))?;
            let start = latest.unwrap_or(LogPosition::MIN);
            info!(position = %start, "Tailing from the end of the log");
            self.tracker.advance(start);
        }

        let from = self.tracker.current();
        let cursor = session.open_log_cursor(from).await.map_err(|e| {
            error!(error = %e, "Failed to open log cursor");
            TailError::Fatal(e.to_string())
        });
        match cursor {
            Ok(cursor) => {
                info!(after = ?from.map(|p| p.to_string()), "Log cursor open");
                self.session = Some(session);
                Ok(cursor)
            }
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    /// Read until `cancel` fires or the log fails for good, then wait for
    /// every operation already handed downstream to be acknowledged and
    /// persist the final position.
    pub async fn run(
        mut self,
        mut cursor: LogCursor,
        output: Sender<Tagged>,
        mut acks: UnboundedReceiver<u64>,
        cancel: CancellationToken,
    ) -> Result<(), TailError> {
        let mut flush = tokio::time::interval(self.checkpoint_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush.tick().await;

        let mut reopened = false;
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Log reader stopping");
                    break Ok(());
                }
                Some(seq) = acks.recv() => self.acknowledge(seq).await,
                _ = flush.tick() => self.flush_checkpoint(false).await,
                next = cursor.next() => {
                    let failure = match next {
                        Some(Ok(entry)) => {
                            if self.last_read.is_some_and(|last| entry.ts <= last) {
                                trace!(position = %entry.ts, "Skipping re-read log entry");
                                continue;
                            }
                            reopened = false;
                            if !self.handle_entry(entry, &output).await {
                                debug!("Pipeline closed, log reader stopping");
                                break Ok(());
                            }
                            continue;
                        }
                        Some(Err(e)) if e.is_skippable() => {
                            self.errors.report(TailError::Malformed(e.to_string()));
                            continue;
                        }
                        Some(Err(e)) => e,
                        None => StoreError::Connection("log cursor closed by the store".into()),
                    };
                    match self.recover(failure, reopened).await {
                        Ok(fresh) => {
                            cursor = fresh;
                            reopened = true;
                        }
                        Err(fatal) => break Err(fatal),
                    }
                }
            }
        };

        if result.is_err() {
            cancel.cancel();
        }
        drop(cursor);
        drop(output);

        while let Some(seq) = acks.recv().await {
            self.acknowledge(seq).await;
        }
        if self.window.in_flight() > 0 {
            warn!(
                in_flight = self.window.in_flight(),
                "Operations were never acknowledged; position not advanced past them"
            );
        }
        self.flush_checkpoint(true).await;

        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(error = %e, "Failed to close log session");
            }
        }
        info!(position = ?self.tracker.current().map(|p| p.to_string()), "Log reader stopped");
        result
    }

    /// Returns false once the pipeline no longer accepts operations.
    async fn handle_entry(&mut self, entry: RawLogEntry, output: &Sender<Tagged>) -> bool {
        let position = entry.ts;
        self.last_read = Some(position);

        match entry.normalize() {
            Ok(Some(op)) => {
                let seq = self.window.register(position);
                trace!(seq, position = %position, kind = %op.kind(), "Read log entry");
                return output
                    .send(Tagged {
                        seq: Some(seq),
                        op,
                    })
                    .await
                    .is_ok();
            }
            Ok(None) => trace!(position = %position, op = %entry.op, "Skipping log entry"),
            Err(e) => self.errors.report(e.into()),
        }

        if let Some(advanced) = self.window.skip(position) {
            self.advance(advanced).await;
        }
        true
    }

    async fn acknowledge(&mut self, seq: u64) {
        if let Some(position) = self.window.complete(seq) {
            self.advance(position).await;
        }
    }

    async fn advance(&mut self, position: LogPosition) {
        if self.tracker.advance(position) {
            trace!(position = %position, "Position advanced");
            self.flush_checkpoint(false).await;
        }
    }

    async fn flush_checkpoint(&mut self, force: bool) {
        let Some(manager) = self.checkpoints.as_mut() else {
            return;
        };
        let Some(position) = self.tracker.current() else {
            return;
        };
        if !force && !manager.should_save() {
            return;
        }
        if let Err(e) = manager.save(position).await {
            self.errors.report(e.into());
        }
    }

    /// One reopen per failure streak; a second failure before any new entry
    /// ends the session.
    async fn recover(
        &mut self,
        failure: StoreError,
        reopened: bool,
    ) -> Result<LogCursor, TailError> {
        if failure.is_permanent() {
            error!(error = %failure, "Log cursor failed permanently");
            return Err(TailError::Fatal(failure.to_string()));
        }
        if reopened {
            error!(error = %failure, "Log cursor failed again after reopen");
            return Err(TailError::Fatal(format!(
                "log cursor failed again after reopen: {}",
                failure
            )));
        }

        self.errors.report(TailError::Transient(failure));

        if let Some(old) = self.session.take() {
            let _ = old.close().await;
        }
        let session = self
            .store
            .open_session()
            .await
            .map_err(|e| TailError::Fatal(format!("cannot reopen log session: {}", e)))?;

        let from = self.tracker.current();
        info!(after = ?from.map(|p| p.to_string()), "Reopening log cursor");
        match session.open_log_cursor(from).await {
            Ok(cursor) => {
                self.session = Some(session);
                Ok(cursor)
            }
            Err(e) => {
                let _ = session.close().await;
                error!(error = %e, "Failed to reopen log cursor");
                Err(TailError::Fatal(format!("cannot reopen log cursor: {}", e)))
            }
        }
    }
}
