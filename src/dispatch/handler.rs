use crate::source::op::{Document, Namespace, Operation, OperationKind};
use crate::tail::error::TailError;
use async_trait::async_trait;
use std::sync::Arc;

/// Receives delivered operations. Every method defaults to doing nothing,
/// which is how an operation kind is discarded.
///
/// Calls are awaited one at a time; a slow handler slows the whole
/// pipeline down rather than letting queues grow.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_insert(&self, _op: &Operation) {}

    async fn on_update(&self, _op: &Operation) {}

    async fn on_delete(&self, _op: &Operation) {}

    async fn on_drop(&self, _op: &Operation) {}

    /// Non-fatal errors, delivered off the data path.
    async fn on_error(&self, _error: &TailError) {}
}

/// Rewrites document bodies before they reach the handler.
pub trait Sanitizer: Send + Sync {
    fn requires_sanitizing(&self, ns: &Namespace) -> bool;

    fn sanitize(&self, ns: &Namespace, body: Document) -> Document;
}

type OpCallback = Arc<dyn Fn(&Operation) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&TailError) + Send + Sync>;

/// An [`EventHandler`] assembled from plain closures.
///
/// ```ignore
/// let handler = HandlerSet::new()
///     .on_insert(|op| println!("insert {}", op.namespace()))
///     .on_error(|e| eprintln!("{}", e));
/// ```
#[derive(Clone, Default)]
pub struct HandlerSet {
    insert: Option<OpCallback>,
    update: Option<OpCallback>,
    delete: Option<OpCallback>,
    drop: Option<OpCallback>,
    error: Option<ErrorCallback>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert(mut self, f: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.insert = Some(Arc::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.update = Some(Arc::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.delete = Some(Arc::new(f));
        self
    }

    pub fn on_drop(mut self, f: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.drop = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&TailError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    /// Whether a closure is registered for `kind`.
    pub fn handles(&self, kind: OperationKind) -> bool {
        self.callback(kind).is_some()
    }

    fn callback(&self, kind: OperationKind) -> Option<&OpCallback> {
        match kind {
            OperationKind::Insert => self.insert.as_ref(),
            OperationKind::Update => self.update.as_ref(),
            OperationKind::Delete => self.delete.as_ref(),
            OperationKind::Drop => self.drop.as_ref(),
        }
    }
}

fn call(callback: &Option<OpCallback>, op: &Operation) {
    if let Some(f) = callback {
        f(op);
    }
}

// The builder methods share these names, so callers holding a concrete
// `HandlerSet` reach the trait through `EventHandler::on_insert(&set, op)`.
#[async_trait]
impl EventHandler for HandlerSet {
    async fn on_insert(&self, op: &Operation) {
        call(&self.insert, op);
    }

    async fn on_update(&self, op: &Operation) {
        call(&self.update, op);
    }

    async fn on_delete(&self, op: &Operation) {
        call(&self.delete, op);
    }

    async fn on_drop(&self, op: &Operation) {
        call(&self.drop, op);
    }

    async fn on_error(&self, error: &TailError) {
        if let Some(f) = &self.error {
            f(error);
        }
    }
}
