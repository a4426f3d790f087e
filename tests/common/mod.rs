#![allow(dead_code)]

use optail::{Config, Document, EventHandler, HandlerSet, Operation, OperationKind, TailError};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One delivered event, reduced to what the tests compare.
#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub kind: OperationKind,
    pub namespace: String,
    pub id: Option<Value>,
    pub direct_read: bool,
    pub body: Option<Document>,
}

/// Records everything a session delivers.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Seen>>>,
    errors: Arc<Mutex<Vec<TailError>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Arc<dyn EventHandler> {
        let errors = self.errors.clone();
        Arc::new(
            HandlerSet::new()
                .on_insert(record(self.events.clone()))
                .on_update(record(self.events.clone()))
                .on_delete(record(self.events.clone()))
                .on_drop(record(self.events.clone()))
                .on_error(move |e| errors.lock().unwrap().push(e.clone())),
        )
    }

    pub fn events(&self) -> Vec<Seen> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn errors(&self) -> Vec<TailError> {
        self.errors.lock().unwrap().clone()
    }

    /// Ids of delivered events of one kind, in delivery order.
    pub fn ids(&self, kind: OperationKind) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.id)
            .collect()
    }
}

fn record(events: Arc<Mutex<Vec<Seen>>>) -> impl Fn(&Operation) + Send + Sync + 'static {
    move |op: &Operation| {
        events.lock().unwrap().push(Seen {
            kind: op.kind(),
            namespace: op.namespace().to_string(),
            id: op.id().cloned(),
            direct_read: op.is_direct_read(),
            body: op.document().cloned(),
        });
    }
}

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

/// Poll until `cond` holds, failing the test after `limit`.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) {
    let step = Duration::from_millis(5);
    let mut waited = Duration::ZERO;
    while !cond() {
        assert!(waited < limit, "condition not met within {:?}", limit);
        tokio::time::sleep(step).await;
        waited += step;
    }
}

/// Small batches and a short latency so tests move quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.buffer.size = 4;
    config.buffer.max_latency = Duration::from_millis(50);
    config.workers = 3;
    config.channel_size = 8;
    config
}
