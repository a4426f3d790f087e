use crate::source::op::Namespace;
use crate::tail::error::TailError;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotState {
    Pending,
    Complete(SnapshotSummary),
    /// The session stopped before every shard finished.
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    /// Direct-read documents that reached the dispatcher.
    pub documents: u64,
    pub failed_shards: usize,
}

/// Direct-read progress of one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotProgress {
    pub shards_remaining: usize,
    pub failed_shards: usize,
    /// Emitted by a reader but not yet seen by the dispatcher.
    pub outstanding: u64,
    pub delivered: u64,
}

impl SnapshotProgress {
    pub fn is_complete(&self) -> bool {
        self.shards_remaining == 0 && self.outstanding == 0
    }
}

/// Counts direct-read work from the shard readers to the dispatcher.
///
/// The snapshot is complete when every shard has finished scanning and every
/// document it emitted has been delivered, so completion is only signalled
/// after the last synthetic insert reached the handler.
pub struct SnapshotTracker {
    progress: Mutex<BTreeMap<Namespace, SnapshotProgress>>,
    state: watch::Sender<SnapshotState>,
}

impl SnapshotTracker {
    pub fn new(namespaces: &[Namespace], shards_per_namespace: usize) -> Self {
        let progress: BTreeMap<Namespace, SnapshotProgress> = namespaces
            .iter()
            .map(|ns| {
                let entry = SnapshotProgress {
                    shards_remaining: shards_per_namespace,
                    ..Default::default()
                };
                (ns.clone(), entry)
            })
            .collect();

        let initial = if progress.values().all(SnapshotProgress::is_complete) {
            SnapshotState::Complete(SnapshotSummary::default())
        } else {
            SnapshotState::Pending
        };
        let (state, _) = watch::channel(initial);

        Self {
            progress: Mutex::new(progress),
            state,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Namespace, SnapshotProgress>> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A reader is about to hand a document downstream.
    pub fn emitted(&self, ns: &Namespace) {
        if let Some(entry) = self.lock().get_mut(ns) {
            entry.outstanding += 1;
        }
    }

    /// An emitted document never made it downstream.
    pub fn retracted(&self, ns: &Namespace) -> bool {
        self.apply(ns, |entry| {
            entry.outstanding = entry.outstanding.saturating_sub(1);
        })
    }

    /// The dispatcher is done with a direct-read document.
    pub fn delivered(&self, ns: &Namespace) -> bool {
        self.apply(ns, |entry| {
            entry.outstanding = entry.outstanding.saturating_sub(1);
            entry.delivered += 1;
        })
    }

    pub fn shard_finished(&self, ns: &Namespace, failed: bool) -> bool {
        self.apply(ns, |entry| {
            entry.shards_remaining = entry.shards_remaining.saturating_sub(1);
            if failed {
                entry.failed_shards += 1;
            }
        })
    }

    /// Mark the snapshot aborted unless it already completed.
    pub fn abort(&self) {
        self.state.send_if_modified(|state| match state {
            SnapshotState::Pending => {
                *state = SnapshotState::Aborted;
                true
            }
            _ => false,
        });
    }

    pub fn state(&self) -> SnapshotState {
        self.state.borrow().clone()
    }

    pub fn progress(&self) -> BTreeMap<Namespace, SnapshotProgress> {
        self.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SnapshotState> {
        self.state.subscribe()
    }

    /// Apply `change` to the progress of `ns`. Returns true when this change
    /// completed the namespace.
    fn apply(&self, ns: &Namespace, change: impl FnOnce(&mut SnapshotProgress)) -> bool {
        let mut progress = self.lock();
        let Some(entry) = progress.get_mut(ns) else {
            return false;
        };
        let was_complete = entry.is_complete();
        change(entry);
        if was_complete || !entry.is_complete() {
            return false;
        }

        info!(
            namespace = %ns,
            documents = entry.delivered,
            failed_shards = entry.failed_shards,
            "Direct read of namespace complete"
        );

        if matches!(*self.state.borrow(), SnapshotState::Pending)
            && progress.values().all(SnapshotProgress::is_complete)
        {
            let summary = SnapshotSummary {
                documents: progress.values().map(|p| p.delivered).sum(),
                failed_shards: progress.values().map(|p| p.failed_shards).sum(),
            };
            info!(
                documents = summary.documents,
                failed_shards = summary.failed_shards,
                "Initial snapshot complete"
            );
            self.state.send_replace(SnapshotState::Complete(summary));
        }
        true
    }
}

/// Resolve once the snapshot finishes. Fails with
/// [`TailError::SnapshotAborted`] if the session stopped first.
pub async fn wait_for_snapshot(
    mut state: watch::Receiver<SnapshotState>,
) -> Result<SnapshotSummary, TailError> {
    let settled = state
        .wait_for(|s| !matches!(s, SnapshotState::Pending))
        .await
        .map_err(|_| TailError::SnapshotAborted)?;
    match &*settled {
        SnapshotState::Complete(summary) => Ok(summary.clone()),
        _ => Err(TailError::SnapshotAborted),
    }
}
