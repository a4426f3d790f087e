use crate::source::position::LogPosition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A stored document. Field order is preserved as written by the store.
pub type Document = serde_json::Map<String, Value>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamespaceError {
    #[error("namespace '{0}' must be of the form 'database.collection'")]
    Malformed(String),
}

/// A (database, collection) pair. A drop of a whole database carries an
/// empty collection and displays as just the database name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    pub fn database_only(database: impl Into<String>) -> Self {
        Self::new(database, String::new())
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn is_database_only(&self) -> bool {
        self.collection.is_empty()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.collection.is_empty() {
            write!(f, "{}", self.database)
        } else {
            write!(f, "{}.{}", self.database, self.collection)
        }
    }
}

impl FromStr for Namespace {
    type Err = NamespaceError;

    /// Splits on the first dot; collection names may themselves contain dots.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(NamespaceError::Malformed(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Drop,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Drop => "drop",
        };
        f.write_str(name)
    }
}

/// Where an operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Log,
    DirectRead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Body {
    /// The complete current document.
    Full(Document),
    /// Only the changed fields, straight from the log.
    Delta(Document),
    Absent,
}

impl Body {
    pub fn document(&self) -> Option<&Document> {
        match self {
            Body::Full(doc) | Body::Delta(doc) => Some(doc),
            Body::Absent => None,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Body::Full(_))
    }
}

/// One change event. Fields are fixed at construction; enrichment produces
/// a new value via [`Operation::with_body`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    kind: OperationKind,
    namespace: Namespace,
    id: Option<Value>,
    body: Body,
    position: Option<LogPosition>,
    provenance: Provenance,
}

impl Operation {
    pub fn from_log(
        kind: OperationKind,
        namespace: Namespace,
        id: Option<Value>,
        body: Body,
        position: LogPosition,
    ) -> Self {
        Self {
            kind,
            namespace,
            id,
            body,
            position: Some(position),
            provenance: Provenance::Log,
        }
    }

    /// A synthetic insert for a document found by a direct read.
    pub fn direct_read(namespace: Namespace, document: Document) -> Self {
        let id = document.get("_id").cloned();
        Self {
            kind: OperationKind::Insert,
            namespace,
            id,
            body: Body::Full(document),
            position: None,
            provenance: Provenance::DirectRead,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn document(&self) -> Option<&Document> {
        self.body.document()
    }

    /// None for direct-read operations.
    pub fn position(&self) -> Option<LogPosition> {
        self.position
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn is_direct_read(&self) -> bool {
        self.provenance == Provenance::DirectRead
    }

    /// Whether the fetch stage has to load the document from the store
    /// before this operation can be delivered.
    pub fn needs_fetch(&self, deliver_deltas: bool) -> bool {
        match self.kind {
            OperationKind::Delete | OperationKind::Drop => false,
            OperationKind::Update if deliver_deltas => false,
            OperationKind::Insert | OperationKind::Update => !self.body.is_full(),
        }
    }

    pub fn with_body(self, body: Body) -> Self {
        Self { body, ..self }
    }
}
