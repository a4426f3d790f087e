use super::filter::NamespaceFilter;
use super::handler::{EventHandler, Sanitizer};
use crate::pipeline::{Outcome, Receiver, Tagged};
use crate::source::op::{Body, Operation, OperationKind};
use crate::source::snapshot::SnapshotTracker;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub filtered: u64,
    pub dropped: u64,
}

/// Last stage of the pipeline: filter, sanitize, route by kind.
///
/// Every log-origin operation is acknowledged back to the log reader once
/// the dispatcher is done with it, whatever happened to it.
pub struct Dispatcher {
    filter: NamespaceFilter,
    handler: Arc<dyn EventHandler>,
    sanitizer: Option<Arc<dyn Sanitizer>>,
    acks: UnboundedSender<u64>,
    snapshot: Arc<SnapshotTracker>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        filter: NamespaceFilter,
        handler: Arc<dyn EventHandler>,
        sanitizer: Option<Arc<dyn Sanitizer>>,
        acks: UnboundedSender<u64>,
        snapshot: Arc<SnapshotTracker>,
    ) -> Self {
        Self {
            filter,
            handler,
            sanitizer,
            acks,
            snapshot,
            stats: DispatchStats::default(),
        }
    }

    pub async fn run(mut self, mut input: Receiver<Outcome>) -> DispatchStats {
        while let Some(outcome) = input.recv().await {
            self.dispatch(outcome).await;
        }
        info!(
            delivered = self.stats.delivered,
            filtered = self.stats.filtered,
            dropped = self.stats.dropped,
            "Dispatcher drained"
        );
        self.stats
    }

    pub async fn dispatch(&mut self, outcome: Outcome) {
        let (tagged, ready) = match outcome {
            Outcome::Ready(tagged) => (tagged, true),
            Outcome::Dropped(tagged) => (tagged, false),
        };
        let Tagged { seq, op } = tagged;
        let direct_read = op.is_direct_read().then(|| op.namespace().clone());

        if !ready {
            self.stats.dropped += 1;
        } else if !self.filter.matches(op.namespace()) {
            trace!(namespace = %op.namespace(), "Filtered out");
            self.stats.filtered += 1;
        } else {
            let op = self.sanitize(op);
            self.deliver(&op).await;
            self.stats.delivered += 1;
        }

        if let Some(seq) = seq {
            if self.acks.send(seq).is_err() {
                debug!(seq, "Log reader gone, acknowledgement discarded");
            }
        }
        if let Some(ns) = direct_read {
            self.snapshot.delivered(&ns);
        }
    }

    fn sanitize(&self, op: Operation) -> Operation {
        let Some(sanitizer) = self
            .sanitizer
            .as_ref()
            .filter(|s| s.requires_sanitizing(op.namespace()))
        else {
            return op;
        };

        let ns = op.namespace().clone();
        let body = match op.body().clone() {
            Body::Full(doc) => Body::Full(sanitizer.sanitize(&ns, doc)),
            Body::Delta(doc) => Body::Delta(sanitizer.sanitize(&ns, doc)),
            Body::Absent => return op,
        };
        op.with_body(body)
    }

    async fn deliver(&self, op: &Operation) {
        match op.kind() {
            OperationKind::Insert => self.handler.on_insert(op).await,
            OperationKind::Update => self.handler.on_update(op).await,
            OperationKind::Delete => self.handler.on_delete(op).await,
            OperationKind::Drop => self.handler.on_drop(op).await,
        }
    }
}
