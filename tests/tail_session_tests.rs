//! Session-level tests: a full pipeline over an in-memory store.
//!
//! Most tests run on paused time, so batch latencies and injected fetch
//! delays cost nothing in wall-clock time.
mod common;

use common::{doc, test_config, wait_until, Recorder};
use optail::config::OrderingMode;
use optail::storage::MemoryStore;
use optail::{
    Document, MemoryPositionStore, Namespace, OperationKind, Sanitizer, SessionState,
    TailError, TailHandle, TailSession,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> Namespace {
        Namespace::new("shop", "orders")
    }

    async fn start(store: &MemoryStore, recorder: &Recorder, config: optail::Config) -> TailHandle {
        TailSession::builder(Arc::new(store.clone()))
            .handler(recorder.handler())
            .start(config)
            .await
            .expect("session starts")
    }

    // ---------------------------------------------------------------
    // Ordering
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_strict_order_survives_fetch_jitter() {
        let store = MemoryStore::new();
        store.seed(&orders(), (0..20).map(|i| doc(json!({"_id": i, "v": 0}))));
        let recorder = Recorder::new();
        let mut config = test_config();
        config.ordering = OrderingMode::Strict;
        let handle = start(&store, &recorder, config).await;

        // Later entries fetch faster than earlier ones.
        for i in 0..20i64 {
            store.set_fetch_delay(&json!(i), Duration::from_millis((100 - 5 * i) as u64));
            store.log_update(&orders(), json!(i), doc(json!({"v": 1})));
        }

        wait_until(Duration::from_secs(30), || recorder.count() == 20).await;
        let expected: Vec<_> = (0..20).map(|i| json!(i)).collect();
        assert_eq!(recorder.ids(OperationKind::Update), expected);

        // Full documents, not deltas.
        let first = &recorder.events()[0];
        assert_eq!(first.body.as_ref().unwrap().get("v"), Some(&json!(1)));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unordered_delivers_as_fetches_complete() {
        let store = MemoryStore::new();
        store.seed(&orders(), (0..20).map(|i| doc(json!({"_id": i}))));
        let recorder = Recorder::new();
        let mut config = test_config();
        config.ordering = OrderingMode::Unordered;
        let handle = start(&store, &recorder, config).await;

        let mut last = None;
        for i in 0..20i64 {
            store.set_fetch_delay(&json!(i), Duration::from_millis((100 - 5 * i) as u64));
            last = Some(store.log_update(&orders(), json!(i), doc(json!({"v": 1}))));
        }

        wait_until(Duration::from_secs(30), || recorder.count() == 20).await;
        let mut ids: Vec<i64> = recorder
            .ids(OperationKind::Update)
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_ne!(ids[0], 0, "first batch is the slowest to fetch");
        ids.sort();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());

        // The position only reaches the end once everything is delivered.
        wait_until(Duration::from_secs(5), || handle.position() == last).await;
        handle.stop().await;
    }

    // ---------------------------------------------------------------
    // Direct read
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_delivers_every_document_before_completing() {
        let store = MemoryStore::new();
        let users = Namespace::new("shop", "users");
        store.seed(&orders(), (0..37).map(|i| doc(json!({"_id": i}))));
        store.seed(&users, (0..5).map(|i| doc(json!({"_id": i}))));

        let recorder = Recorder::new();
        let mut config = test_config();
        config.direct_read.namespaces = vec!["shop.orders".into(), "shop.users".into()];
        config.direct_read.readers_per_collection = 4;
        config.direct_read.batch_size = 5;
        let handle = start(&store, &recorder, config).await;

        let summary = handle.await_snapshot_complete().await.unwrap();
        assert_eq!(summary.documents, 42);
        assert_eq!(summary.failed_shards, 0);

        let direct: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| e.direct_read)
            .collect();
        assert_eq!(direct.len(), 42);
        assert!(direct.iter().all(|e| e.kind == OperationKind::Insert));

        let progress = handle.snapshot_progress();
        assert_eq!(progress[&orders()].delivered, 37);
        assert_eq!(progress[&users].delivered, 5);
        assert_eq!(progress[&users].shards_remaining, 0);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_without_namespaces_is_immediately_complete() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let handle = start(&store, &recorder, test_config()).await;

        let summary = handle.await_snapshot_complete().await.unwrap();
        assert_eq!(summary.documents, 0);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_runs_alongside_live_log() {
        let store = MemoryStore::new();
        store.seed(&orders(), (0..10).map(|i| doc(json!({"_id": i}))));
        let recorder = Recorder::new();
        let mut config = test_config();
        config.direct_read.namespaces = vec!["shop.orders".into()];
        config.direct_read.readers_per_collection = 2;
        let handle = start(&store, &recorder, config).await;

        store.log_insert(&orders(), doc(json!({"_id": 100})));
        let summary = handle.await_snapshot_complete().await.unwrap();
        assert!(summary.documents >= 10);

        // The live insert always arrives from the log. The scan may also
        // have seen the document; duplicates are part of the contract.
        wait_until(Duration::from_secs(5), || {
            recorder
                .events()
                .iter()
                .any(|e| e.id == Some(json!(100)) && !e.direct_read)
        })
        .await;
        let from_scan = recorder
            .events()
            .iter()
            .filter(|e| e.direct_read)
            .count() as u64;
        assert_eq!(from_scan, summary.documents);
        handle.stop().await;
    }

    // ---------------------------------------------------------------
    // Fetch
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_update_of_deleted_document_is_dropped() {
        let store = MemoryStore::new();
        store.seed(&orders(), [doc(json!({"_id": 1, "v": 0}))]);
        let recorder = Recorder::new();
        let handle = start(&store, &recorder, test_config()).await;

        store.set_fetch_delay(&json!(1), Duration::from_millis(100));
        store.log_update(&orders(), json!(1), doc(json!({"v": 1})));
        let deleted = store.log_delete(&orders(), json!(1));

        wait_until(Duration::from_secs(5), || handle.position() == Some(deleted)).await;
        let kinds: Vec<_> = recorder.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![OperationKind::Delete]);
        assert!(recorder.errors().is_empty());

        handle.stop().await;
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_reaches_error_handler() {
        let store = MemoryStore::new();
        store.seed(&orders(), [doc(json!({"_id": 1})), doc(json!({"_id": 2}))]);
        let recorder = Recorder::new();
        let handle = start(&store, &recorder, test_config()).await;

        store.fail_fetch(&json!(1));
        store.log_update(&orders(), json!(1), doc(json!({"v": 1})));
        let last = store.log_update(&orders(), json!(2), doc(json!({"v": 1})));

        wait_until(Duration::from_secs(5), || handle.position() == Some(last)).await;
        assert_eq!(recorder.ids(OperationKind::Update), vec![json!(2)]);
        handle.stop().await;

        let errors = recorder.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], TailError::Fetch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delta_mode_delivers_log_delta() {
        let store = MemoryStore::new();
        store.seed(&orders(), [doc(json!({"_id": 1, "v": 0, "other": true}))]);
        let recorder = Recorder::new();
        let mut config = test_config();
        config.update_data_as_delta = true;
        let handle = start(&store, &recorder, config).await;

        store.log_update(&orders(), json!(1), doc(json!({"v": 1})));
        wait_until(Duration::from_secs(5), || recorder.count() == 1).await;

        let body = recorder.events()[0].body.clone().unwrap();
        assert_eq!(body.get("$set"), Some(&json!({"v": 1})));
        assert!(body.get("other").is_none());
        handle.stop().await;
    }

    // ---------------------------------------------------------------
    // Batching
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_without_waiting() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let mut config = test_config();
        config.buffer.size = 5;
        config.buffer.max_latency = Duration::from_secs(3600);
        let handle = start(&store, &recorder, config).await;

        let started = Instant::now();
        for i in 0..5 {
            store.log_insert(&orders(), doc(json!({"_id": i})));
        }
        wait_until(Duration::from_secs(60), || recorder.count() == 5).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_at_max_latency() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let mut config = test_config();
        config.buffer.size = 50;
        config.buffer.max_latency = Duration::from_millis(750);
        let handle = start(&store, &recorder, config).await;

        let started = Instant::now();
        store.log_insert(&orders(), doc(json!({"_id": 1})));
        wait_until(Duration::from_secs(5), || recorder.count() == 1).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(750), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(800), "{:?}", elapsed);

        handle.stop().await;
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_in_flight_operations() {
        let store = MemoryStore::new();
        store.seed(&orders(), (0..10).map(|i| doc(json!({"_id": i}))));
        let recorder = Recorder::new();
        let mut config = test_config();
        config.buffer.size = 50;
        config.buffer.max_latency = Duration::from_secs(10);
        let handle = start(&store, &recorder, config).await;
        assert_eq!(handle.state(), SessionState::Running);

        let mut last = None;
        for i in 0..10i64 {
            store.set_fetch_delay(&json!(i), Duration::from_millis(200));
            last = Some(store.log_update(&orders(), json!(i), doc(json!({"v": 1}))));
        }
        // Let the reader hand everything to the batch window.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(recorder.count(), 0);

        handle.stop().await;
        assert_eq!(handle.state(), SessionState::Stopped);
        assert_eq!(recorder.ids(OperationKind::Update).len(), 10);
        assert_eq!(handle.position(), last);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_stop_is_a_no_op() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let handle = start(&store, &recorder, test_config()).await;

        handle.stop().await;
        handle.stop().await;
        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_session_per_source() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let first = start(&store, &recorder, test_config()).await;

        let second = TailSession::builder(Arc::new(store.clone()))
            .start(test_config())
            .await;
        assert!(matches!(second, Err(TailError::SourceBusy(_))));

        first.stop().await;
        let third = start(&store, &recorder, test_config()).await;
        assert_ne!(first.session_id(), third.session_id());
        third.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_fails_before_anything_starts() {
        let store = MemoryStore::new();

        let mut config = test_config();
        config.workers = 0;
        let result = TailSession::builder(Arc::new(store.clone()))
            .start(config)
            .await;
        assert!(matches!(result, Err(TailError::Config(_))));

        let mut config = test_config();
        config.filter.include = vec!["(".into()];
        let result = TailSession::builder(Arc::new(store.clone()))
            .start(config)
            .await;
        assert!(matches!(result, Err(TailError::Config(_))));

        let mut config = test_config();
        config.direct_read.namespaces = vec!["shop.orders".into(), "shop.orders".into()];
        let result = TailSession::builder(Arc::new(store.clone()))
            .start(config)
            .await;
        assert!(matches!(result, Err(TailError::Config(_))));
        assert_eq!(store.open_sessions(), 0);

        // Nothing was claimed by the failed attempts.
        let recorder = Recorder::new();
        let handle = start(&store, &recorder, test_config()).await;
        handle.stop().await;
    }

    // ---------------------------------------------------------------
    // Positions
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_resume_delivers_only_later_operations() {
        let store = MemoryStore::new();
        let positions = MemoryPositionStore::new();

        let first = Recorder::new();
        let handle = TailSession::builder(Arc::new(store.clone()))
            .handler(first.handler())
            .positions(Arc::new(positions.clone()))
            .start(test_config())
            .await
            .unwrap();
        let mut acknowledged = None;
        for i in 1..=3 {
            acknowledged = Some(store.log_insert(&orders(), doc(json!({"_id": i}))));
        }
        wait_until(Duration::from_secs(5), || first.count() == 3).await;
        handle.stop().await;
        assert_eq!(positions.position(), acknowledged);

        // Written while nothing was tailing.
        store.log_insert(&orders(), doc(json!({"_id": 4})));
        store.log_insert(&orders(), doc(json!({"_id": 5})));

        let second = Recorder::new();
        let handle = TailSession::builder(Arc::new(store.clone()))
            .handler(second.handler())
            .positions(Arc::new(positions.clone()))
            .start(test_config())
            .await
            .unwrap();
        wait_until(Duration::from_secs(5), || second.count() == 2).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            second.ids(OperationKind::Insert),
            vec![json!(4), json!(5)]
        );
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_resume_position_wins_over_checkpoint() {
        let store = MemoryStore::new();
        let positions = MemoryPositionStore::new();
        let p1 = store.log_insert(&orders(), doc(json!({"_id": 1})));
        store.log_insert(&orders(), doc(json!({"_id": 2})));
        store.log_insert(&orders(), doc(json!({"_id": 3})));

        // A checkpoint at the end of the log.
        let recorder = Recorder::new();
        let handle = TailSession::builder(Arc::new(store.clone()))
            .handler(recorder.handler())
            .positions(Arc::new(positions.clone()))
            .start(test_config())
            .await
            .unwrap();
        handle.stop().await;
        assert!(positions.position().is_some());

        let mut config = test_config();
        config.resume_position = Some(p1);
        let recorder = Recorder::new();
        let handle = TailSession::builder(Arc::new(store.clone()))
            .handler(recorder.handler())
            .positions(Arc::new(positions.clone()))
            .start(config)
            .await
            .unwrap();
        wait_until(Duration::from_secs(5), || recorder.count() == 2).await;
        assert_eq!(recorder.ids(OperationKind::Insert), vec![json!(2), json!(3)]);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_history_fails_start() {
        let store = MemoryStore::new();
        let p1 = store.log_insert(&orders(), doc(json!({"_id": 1})));
        let p2 = store.log_insert(&orders(), doc(json!({"_id": 2})));
        store.log_insert(&orders(), doc(json!({"_id": 3})));
        store.truncate_log_through(p2);

        let mut config = test_config();
        config.resume_position = Some(p1);
        let result = TailSession::builder(Arc::new(store.clone()))
            .start(config)
            .await;
        assert!(matches!(result, Err(TailError::Fatal(_))));
        assert_eq!(store.open_sessions(), 0);
    }

    // ---------------------------------------------------------------
    // Log cursor failures
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_transient_cursor_failure_recovers() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let handle = start(&store, &recorder, test_config()).await;

        store.fail_cursor_reads(1);
        store.log_insert(&orders(), doc(json!({"_id": 1})));
        wait_until(Duration::from_secs(5), || recorder.count() == 1).await;

        assert_eq!(handle.state(), SessionState::Running);
        assert!(recorder.errors().iter().any(TailError::is_transient));
        handle.stop().await;
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_cursor_failure_is_fatal() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let handle = start(&store, &recorder, test_config()).await;

        store.fail_cursor_reads(2);
        let result = handle.wait().await;
        assert!(matches!(result, Err(TailError::Fatal(_))));
        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(recorder.errors().iter().any(TailError::is_transient));
        assert_eq!(store.open_sessions(), 0);

        // Stopping a dead session changes nothing.
        handle.stop().await;
        assert!(handle.wait().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reopen_is_fatal() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let handle = start(&store, &recorder, test_config()).await;

        store.fail_cursor_opens(1);
        store.fail_cursor_reads(1);
        let result = handle.wait().await;

        match result {
            Err(TailError::Fatal(msg)) => assert!(msg.contains("reopen"), "{}", msg),
            other => panic!("expected fatal error, got {:?}", other),
        }
        assert_eq!(handle.state(), SessionState::Stopped);
        assert_eq!(
            recorder
                .errors()
                .iter()
                .filter(|e| e.is_transient())
                .count(),
            1
        );
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_lost_while_running_is_fatal() {
        let store = MemoryStore::new();
        store.seed(&orders(), [doc(json!({"_id": 1})), doc(json!({"_id": 2}))]);
        let recorder = Recorder::new();
        let handle = start(&store, &recorder, test_config()).await;

        // The slow fetch holds the acknowledged position at the start of
        // the log while the entries behind it are truncated away.
        store.set_fetch_delay(&json!(1), Duration::from_secs(10));
        store.log_update(&orders(), json!(1), doc(json!({"v": 1})));
        let second = store.log_update(&orders(), json!(2), doc(json!({"v": 1})));
        store.truncate_log_through(second);
        store.fail_cursor_reads(1);

        let result = handle.wait().await;
        match result {
            Err(TailError::Fatal(msg)) => assert!(msg.contains("no longer contains"), "{}", msg),
            other => panic!("expected fatal error, got {:?}", other),
        }
        assert!(handle.position() < Some(second));
        assert_eq!(store.open_sessions(), 0);
    }

    // ---------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_drops_reach_drop_handler() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let handle = start(&store, &recorder, test_config()).await;

        store.log_drop(&orders());
        store.append_raw("c", "shop.$cmd", doc(json!({"dropDatabase": 1})), None);
        wait_until(Duration::from_secs(5), || recorder.count() == 2).await;

        let events = recorder.events();
        assert!(events.iter().all(|e| e.kind == OperationKind::Drop));
        assert_eq!(events[0].namespace, "shop.orders");
        assert_eq!(events[1].namespace, "shop");
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_still_advances_position() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let mut config = test_config();
        config.filter.include = vec![r"^shop\.".into()];
        config.filter.exclude = vec![r"\.audit$".into()];
        let handle = start(&store, &recorder, config).await;

        store.log_insert(&orders(), doc(json!({"_id": 1})));
        store.log_insert(&Namespace::new("shop", "audit"), doc(json!({"_id": 2})));
        let last = store.log_insert(&Namespace::new("other", "things"), doc(json!({"_id": 3})));

        wait_until(Duration::from_secs(5), || handle.position() == Some(last)).await;
        assert_eq!(recorder.ids(OperationKind::Insert), vec![json!(1)]);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_entry_is_reported_and_skipped() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let handle = start(&store, &recorder, test_config()).await;

        store.append_raw("i", "shop.orders", doc(json!({"no_id": true})), None);
        let last = store.log_insert(&orders(), doc(json!({"_id": 1})));

        wait_until(Duration::from_secs(5), || handle.position() == Some(last)).await;
        assert_eq!(recorder.count(), 1);
        handle.stop().await;
        assert!(matches!(recorder.errors().as_slice(), [TailError::Malformed(_)]));
    }

    struct DropSecrets;

    impl Sanitizer for DropSecrets {
        fn requires_sanitizing(&self, ns: &Namespace) -> bool {
            ns.collection() == "users"
        }

        fn sanitize(&self, _ns: &Namespace, mut body: Document) -> Document {
            body.remove("token");
            body
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sanitizer_rewrites_configured_namespaces() {
        let store = MemoryStore::new();
        let recorder = Recorder::new();
        let handle = TailSession::builder(Arc::new(store.clone()))
            .handler(recorder.handler())
            .sanitizer(Arc::new(DropSecrets))
            .start(test_config())
            .await
            .unwrap();

        let users = Namespace::new("shop", "users");
        store.log_insert(&users, doc(json!({"_id": 1, "token": "s3cret"})));
        store.log_insert(&orders(), doc(json!({"_id": 2, "token": "kept"})));
        wait_until(Duration::from_secs(5), || recorder.count() == 2).await;

        let events = recorder.events();
        assert!(events[0].body.as_ref().unwrap().get("token").is_none());
        assert!(events[1].body.as_ref().unwrap().get("token").is_some());
        handle.stop().await;
    }
}
