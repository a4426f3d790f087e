//! End-to-end tailing of a JSON-lines store on disk, in real time.

mod common;

use common::{test_config, wait_until, Recorder};
use optail::storage::{FilePositionStore, JsonLinesStore, PositionStore};
use optail::{LogPosition, OperationKind, SessionState, TailError, TailSession};
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[cfg(test)]
mod tests {
    use super::*;

    fn append(path: &Path, lines: &[String]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
    }

    fn entry(ts: &str, op: &str, o: serde_json::Value, o2: Option<serde_json::Value>) -> String {
        let mut entry = json!({"ts": ts, "op": op, "ns": "shop.orders", "o": o});
        if let Some(o2) = o2 {
            entry["o2"] = o2;
        }
        entry.to_string()
    }

    #[tokio::test]
    async fn test_snapshot_then_follow_log_file() {
        let dir = TempDir::new().unwrap();
        let oplog = dir.path().join("oplog.jsonl");
        let orders = dir.path().join("shop/orders.jsonl");

        append(
            &orders,
            &(0..6)
                .map(|i| json!({"_id": i, "total": i * 10}).to_string())
                .collect::<Vec<_>>(),
        );
        append(&oplog, &[entry("100:1", "n", json!({}), None)]);

        let recorder = Recorder::new();
        let mut config = test_config();
        config.direct_read.namespaces = vec!["shop.orders".into()];
        config.direct_read.readers_per_collection = 2;
        config.checkpoint.enabled = true;
        config.checkpoint.path = dir.path().join("state/checkpoint.json");

        let handle = TailSession::builder(Arc::new(JsonLinesStore::new(dir.path())))
            .handler(recorder.handler())
            .start(config.clone())
            .await
            .unwrap();

        let summary = handle.await_snapshot_complete().await.unwrap();
        assert_eq!(summary.documents, 6);

        append(&orders, &[json!({"_id": 1, "total": 99}).to_string()]);
        append(
            &oplog,
            &[
                entry(
                    "100:2",
                    "u",
                    json!({"$set": {"total": 99}}),
                    Some(json!({"_id": 1})),
                ),
                entry("100:3", "d", json!({"_id": 2}), None),
            ],
        );

        wait_until(Duration::from_secs(10), || {
            handle.position() == Some(LogPosition::new(100, 3))
        })
        .await;
        handle.stop().await;

        let updates: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| e.kind == OperationKind::Update)
            .collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].body.as_ref().unwrap().get("total"),
            Some(&json!(99))
        );
        assert_eq!(recorder.ids(OperationKind::Delete), vec![json!(2)]);

        let saved = FilePositionStore::new(&config.checkpoint.path)
            .load()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.position, LogPosition::new(100, 3));
    }

    #[tokio::test]
    async fn test_undecodable_log_line_is_reported_and_skipped() {
        let dir = TempDir::new().unwrap();
        let oplog = dir.path().join("oplog.jsonl");
        append(&oplog, &[entry("100:1", "n", json!({}), None)]);

        let recorder = Recorder::new();
        let handle = TailSession::builder(Arc::new(JsonLinesStore::new(dir.path())))
            .handler(recorder.handler())
            .start(test_config())
            .await
            .unwrap();

        append(
            &oplog,
            &[
                r#"{"ts":"100:2","op":"#.to_string(),
                entry("100:3", "d", json!({"_id": 7}), None),
            ],
        );

        wait_until(Duration::from_secs(10), || {
            handle.position() == Some(LogPosition::new(100, 3))
        })
        .await;
        assert_eq!(handle.state(), SessionState::Running);
        handle.stop().await;

        assert_eq!(recorder.ids(OperationKind::Delete), vec![json!(7)]);
        assert!(matches!(
            recorder.errors().as_slice(),
            [TailError::Malformed(_)]
        ));
    }

    #[tokio::test]
    async fn test_missing_oplog_fails_start() {
        let dir = TempDir::new().unwrap();
        let result = TailSession::builder(Arc::new(JsonLinesStore::new(dir.path())))
            .start(test_config())
            .await;
        assert!(matches!(result, Err(TailError::Fatal(_))));
    }
}
