use super::traits::{DocumentStream, LogCursor, Session, ShardSpec, Store, StoreError};
use crate::source::entry::RawLogEntry;
use crate::source::op::{Document, Namespace};
use crate::source::position::LogPosition;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::time::{sleep, Duration};

const OPLOG_FILE: &str = "oplog.jsonl";
const FOLLOW_INTERVAL: Duration = Duration::from_millis(100);

/// A store laid out as JSON-lines files under a root directory:
///
/// ```text
/// <root>/oplog.jsonl          one RawLogEntry per line, appended to
/// <root>/<db>/<coll>.jsonl    one document per line; the last line with
///                             a given _id is its current version
/// ```
///
/// The oplog file is followed like a growing log file.
pub struct JsonLinesStore {
    root: PathBuf,
}

impl JsonLinesStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Store for JsonLinesStore {
    fn source_name(&self) -> String {
        self.root.join(OPLOG_FILE).display().to_string()
    }

    async fn open_session(&self) -> Result<Box<dyn Session>, StoreError> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Err(StoreError::Connection(format!(
                "store directory '{}' does not exist",
                self.root.display()
            )));
        }
        Ok(Box::new(JsonLinesSession {
            root: self.root.clone(),
        }))
    }
}

struct JsonLinesSession {
    root: PathBuf,
}

impl JsonLinesSession {
    fn collection_path(&self, ns: &Namespace) -> PathBuf {
        self.root
            .join(ns.database())
            .join(format!("{}.jsonl", ns.collection()))
    }
}

async fn open_lines(path: &Path) -> Result<Option<Lines<BufReader<File>>>, StoreError> {
    match File::open(path).await {
        Ok(file) => Ok(Some(BufReader::new(file).lines())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Session for JsonLinesSession {
    async fn fetch_by_id(
        &self,
        ns: &Namespace,
        id: &Value,
    ) -> Result<Option<Document>, StoreError> {
        let Some(mut lines) = open_lines(&self.collection_path(ns)).await? else {
            return Ok(None);
        };

        let mut found = None;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let doc: Document = serde_json::from_str(&line)?;
            if doc.get("_id") == Some(id) {
                found = Some(doc);
            }
        }
        Ok(found)
    }

    /// Every shard resolves the whole file first, so shards partition the
    /// distinct documents rather than the physical lines.
    async fn scan_shard(
        &self,
        ns: &Namespace,
        shard: ShardSpec,
        _batch_size: usize,
    ) -> Result<DocumentStream, StoreError> {
        let Some(lines) = open_lines(&self.collection_path(ns)).await? else {
            return Ok(stream::empty().boxed());
        };

        let owned = current_versions(lines)
            .await?
            .into_iter()
            .enumerate()
            .filter(|(n, _)| shard.owns(*n))
            .map(|(_, doc)| doc);
        let docs: Vec<Document> = match shard.limit {
            Some(limit) => owned.take(limit).collect(),
            None => owned.collect(),
        };
        Ok(stream::iter(docs.into_iter().map(Ok)).boxed())
    }

    async fn latest_position(&self) -> Result<Option<LogPosition>, StoreError> {
        let Some(mut lines) = open_lines(&self.root.join(OPLOG_FILE)).await? else {
            return Ok(None);
        };

        let mut latest = None;
        while let Some(line) = lines.next_line().await? {
            if let Ok(Some(entry)) = parse_entry(&line) {
                latest = Some(entry.ts);
            }
        }
        Ok(latest)
    }

    async fn open_log_cursor(&self, after: Option<LogPosition>) -> Result<LogCursor, StoreError> {
        let path = self.root.join(OPLOG_FILE);
        let file = File::open(&path).await.map_err(|e| {
            StoreError::Connection(format!("cannot open '{}': {}", path.display(), e))
        })?;

        let mut cursor = FileCursor {
            path,
            reader: BufReader::new(file),
            offset: 0,
            pending: String::new(),
            after,
        };

        if after.is_none() {
            cursor.skip_to_end().await?;
        }

        Ok(stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next_entry().await;
            Some((item, cursor))
        })
        .boxed())
    }
}

/// The current version of every document in a collection file, in order of
/// first appearance. Documents without an `_id` are kept as written.
async fn current_versions(
    mut lines: Lines<BufReader<File>>,
) -> Result<Vec<Document>, StoreError> {
    let mut docs: Vec<Document> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let doc: Document = serde_json::from_str(&line)?;
        match doc.get("_id").map(Value::to_string) {
            Some(key) => match slots.get(&key) {
                Some(&slot) => docs[slot] = doc,
                None => {
                    slots.insert(key, docs.len());
                    docs.push(doc);
                }
            },
            None => docs.push(doc),
        }
    }
    Ok(docs)
}

struct FileCursor {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    pending: String,
    after: Option<LogPosition>,
}

impl FileCursor {
    /// Position the cursor after the last complete entry currently in the file.
    async fn skip_to_end(&mut self) -> Result<(), StoreError> {
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Ok(());
            }
            if !line.ends_with('\n') {
                // Partial trailing write; pick it up once it completes.
                self.pending = line;
                self.offset += n as u64;
                return Ok(());
            }
            self.offset += n as u64;
            // Undecodable lines before "now" are never delivered anyway.
            if let Ok(Some(entry)) = parse_entry(&line) {
                self.after = Some(entry.ts);
            }
        }
    }

    async fn next_entry(&mut self) -> Result<RawLogEntry, StoreError> {
        loop {
            let n = self.reader.read_line(&mut self.pending).await?;
            self.offset += n as u64;

            if n == 0 || !self.pending.ends_with('\n') {
                // At EOF: wait for the writer, then make sure the file was not
                // truncated underneath us.
                sleep(FOLLOW_INTERVAL).await;
                let len = tokio::fs::metadata(&self.path).await?.len();
                if len < self.offset {
                    return Err(StoreError::CursorInvalid(format!(
                        "'{}' shrank from {} to {} bytes",
                        self.path.display(),
                        self.offset,
                        len
                    )));
                }
                continue;
            }

            let line = std::mem::take(&mut self.pending);
            let entry = match parse_entry(&line) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    return Err(StoreError::MalformedEntry(format!(
                        "ending at byte {} of '{}': {}",
                        self.offset,
                        self.path.display(),
                        e
                    )))
                }
            };
            if self.after.is_some_and(|after| entry.ts <= after) {
                continue;
            }
            self.after = Some(entry.ts);
            return Ok(entry);
        }
    }
}

fn parse_entry(line: &str) -> Result<Option<RawLogEntry>, StoreError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(trimmed)?))
}
