use super::traits::{DocumentStream, LogCursor, Session, ShardSpec, Store, StoreError};
use crate::source::entry::RawLogEntry;
use crate::source::op::{Document, Namespace};
use crate::source::position::LogPosition;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const BASE_SECONDS: u32 = 1_700_000_000;

/// An in-process store holding collections and an operation log.
///
/// Mutations made through the `log_*` methods update the collections and
/// append the matching log entry, like a real primary would. Faults can be
/// injected per document (latency, failures) and per cursor.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    appended: watch::Sender<u64>,
    open_sessions: AtomicUsize,
}

#[derive(Default)]
struct State {
    log: Vec<RawLogEntry>,
    truncated_through: Option<LogPosition>,
    ordinal: u32,
    collections: BTreeMap<Namespace, Vec<Document>>,
    fetch_delays: HashMap<String, Duration>,
    fetch_failures: HashSet<String>,
    cursor_read_failures: usize,
    cursor_open_failures: usize,
}

impl State {
    fn next_position(&mut self) -> LogPosition {
        self.ordinal += 1;
        LogPosition::new(BASE_SECONDS, self.ordinal)
    }

    fn find(&self, ns: &Namespace, id: &Value) -> Option<&Document> {
        self.collections
            .get(ns)?
            .iter()
            .find(|doc| doc.get("_id") == Some(id))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::named(format!("memory-{}", Uuid::new_v4()))
    }

    pub fn named(name: impl Into<String>) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                appended,
                open_sessions: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_cursors(&self) {
        self.inner.appended.send_modify(|v| *v += 1);
    }

    /// Add documents without writing log entries, as if they predate the
    /// retained log history.
    pub fn seed(&self, ns: &Namespace, docs: impl IntoIterator<Item = Document>) {
        let mut state = self.state();
        state
            .collections
            .entry(ns.clone())
            .or_default()
            .extend(docs);
    }

    pub fn append_raw(&self, op: &str, ns: &str, o: Document, o2: Option<Document>) -> LogPosition {
        let position = {
            let mut state = self.state();
            let ts = state.next_position();
            state.log.push(RawLogEntry {
                ts,
                op: op.to_string(),
                ns: ns.to_string(),
                o,
                o2,
            });
            ts
        };
        self.wake_cursors();
        position
    }

    pub fn log_insert(&self, ns: &Namespace, doc: Document) -> LogPosition {
        self.state()
            .collections
            .entry(ns.clone())
            .or_default()
            .push(doc.clone());
        self.append_raw("i", &ns.to_string(), doc, None)
    }

    /// Apply `$set` semantics to the stored document and log the delta.
    pub fn log_update(&self, ns: &Namespace, id: Value, set: Document) -> LogPosition {
        {
            let mut state = self.state();
            if let Some(doc) = state
                .collections
                .get_mut(ns)
                .and_then(|docs| docs.iter_mut().find(|d| d.get("_id") == Some(&id)))
            {
                for (k, v) in &set {
                    doc.insert(k.clone(), v.clone());
                }
            }
        }
        self.append_raw(
            "u",
            &ns.to_string(),
            object(json!({ "$set": Value::Object(set) })),
            Some(object(json!({ "_id": id }))),
        )
    }

    pub fn log_delete(&self, ns: &Namespace, id: Value) -> LogPosition {
        if let Some(docs) = self.state().collections.get_mut(ns) {
            docs.retain(|d| d.get("_id") != Some(&id));
        }
        self.append_raw("d", &ns.to_string(), object(json!({ "_id": id })), None)
    }

    pub fn log_drop(&self, ns: &Namespace) -> LogPosition {
        self.state().collections.remove(ns);
        self.append_raw(
            "c",
            &format!("{}.$cmd", ns.database()),
            object(json!({ "drop": ns.collection() })),
            None,
        )
    }

    pub fn log_noop(&self) -> LogPosition {
        self.append_raw("n", "", object(json!({ "msg": "periodic noop" })), None)
    }

    pub fn document(&self, ns: &Namespace, id: &Value) -> Option<Document> {
        self.state().find(ns, id).cloned()
    }

    pub fn latest_position(&self) -> Option<LogPosition> {
        let state = self.state();
        state.log.last().map(|e| e.ts).or(state.truncated_through)
    }

    /// Discard log entries up to and including `through`.
    pub fn truncate_log_through(&self, through: LogPosition) {
        let mut state = self.state();
        state.log.retain(|e| e.ts > through);
        state.truncated_through = Some(through);
    }

    pub fn set_fetch_delay(&self, id: &Value, delay: Duration) {
        self.state().fetch_delays.insert(id.to_string(), delay);
    }

    pub fn fail_fetch(&self, id: &Value) {
        self.state().fetch_failures.insert(id.to_string());
    }

    /// Make the next `n` cursor reads fail with a timeout.
    pub fn fail_cursor_reads(&self, n: usize) {
        self.state().cursor_read_failures = n;
        self.wake_cursors();
    }

    pub fn fail_cursor_opens(&self, n: usize) {
        self.state().cursor_open_failures = n;
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }
}

fn object(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn source_name(&self) -> String {
        self.inner.name.clone()
    }

    async fn open_session(&self) -> Result<Box<dyn Session>, StoreError> {
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            store: self.clone(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    store: MemoryStore,
    closed: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl Session for MemorySession {
    async fn fetch_by_id(
        &self,
        ns: &Namespace,
        id: &Value,
    ) -> Result<Option<Document>, StoreError> {
        let key = id.to_string();
        let (delay, fail) = {
            let state = self.store.state();
            (
                state.fetch_delays.get(&key).copied(),
                state.fetch_failures.contains(&key),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(StoreError::Connection(format!("injected fetch failure for {}", key)));
        }

        Ok(self.store.state().find(ns, id).cloned())
    }

    async fn scan_shard(
        &self,
        ns: &Namespace,
        shard: ShardSpec,
        _batch_size: usize,
    ) -> Result<DocumentStream, StoreError> {
        // Everything is in memory; the shard is materialised up front.
        let docs: Vec<Document> = {
            let state = self.store.state();
            let all = state.collections.get(ns).map(Vec::as_slice).unwrap_or(&[]);
            let owned = all
                .iter()
                .enumerate()
                .filter(|(n, _)| shard.owns(*n))
                .map(|(_, d)| d.clone());
            match shard.limit {
                Some(limit) => owned.take(limit).collect(),
                None => owned.collect(),
            }
        };
        Ok(stream::iter(docs.into_iter().map(Ok)).boxed())
    }

    async fn latest_position(&self) -> Result<Option<LogPosition>, StoreError> {
        Ok(self.store.latest_position())
    }

    async fn open_log_cursor(&self, after: Option<LogPosition>) -> Result<LogCursor, StoreError> {
        let start_after = {
            let mut state = self.store.state();
            if state.cursor_open_failures > 0 {
                state.cursor_open_failures -= 1;
                return Err(StoreError::Connection("injected cursor open failure".into()));
            }

            match after {
                Some(requested) => {
                    if let Some(through) = state.truncated_through {
                        if requested < through {
                            let oldest = state.log.first().map(|e| e.ts).unwrap_or(through);
                            return Err(StoreError::HistoryLost { requested, oldest });
                        }
                    }
                    Some(requested)
                }
                None => state.log.last().map(|e| e.ts),
            }
        };

        let cursor = MemoryCursor {
            store: self.store.clone(),
            after: start_after,
            changes: self.store.inner.appended.subscribe(),
        };

        Ok(stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next().await;
            Some((item, cursor))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.store.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryCursor {
    store: MemoryStore,
    after: Option<LogPosition>,
    changes: watch::Receiver<u64>,
}

impl MemoryCursor {
    async fn next(&mut self) -> Result<RawLogEntry, StoreError> {
        loop {
            self.changes.borrow_and_update();
            {
                let mut state = self.store.state();
                if state.cursor_read_failures > 0 {
                    state.cursor_read_failures -= 1;
                    return Err(StoreError::CursorTimeout("injected cursor timeout".into()));
                }

                let next = state
                    .log
                    .iter()
                    .find(|e| self.after.map_or(true, |after| e.ts > after))
                    .cloned();
                if let Some(entry) = next {
                    self.after = Some(entry.ts);
                    return Ok(entry);
                }
            }

            if self.changes.changed().await.is_err() {
                return Err(StoreError::CursorInvalid("store dropped".into()));
            }
        }
    }
}
