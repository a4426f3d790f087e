use crate::source::op::{Body, Document, Namespace, Operation, OperationKind};
use crate::source::position::LogPosition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EntryError {
    #[error("entry at {position} has malformed namespace '{ns}'")]
    Namespace { position: LogPosition, ns: String },

    #[error("{op} entry at {position} in {ns} has no _id")]
    MissingId {
        op: String,
        position: LogPosition,
        ns: String,
    },

    #[error("entry at {position} has unknown op '{op}'")]
    UnknownOp { position: LogPosition, op: String },
}

/// One record exactly as the store's operation log holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLogEntry {
    pub ts: LogPosition,
    pub op: String,
    pub ns: String,
    #[serde(default)]
    pub o: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o2: Option<Document>,
}

impl RawLogEntry {
    /// Convert into an [`Operation`].
    ///
    /// Returns `Ok(None)` for entries that carry no change event (no-ops and
    /// commands other than drops).
    pub fn normalize(&self) -> Result<Option<Operation>, EntryError> {
        match self.op.as_str() {
            "n" => Ok(None),
            "i" => {
                let ns = self.namespace()?;
                let id = self.require_id(self.o.get("_id"))?;
                Ok(Some(Operation::from_log(
                    OperationKind::Insert,
                    ns,
                    Some(id),
                    Body::Full(self.o.clone()),
                    self.ts,
                )))
            }
            "u" => {
                let ns = self.namespace()?;
                let id = self.require_id(self.o2.as_ref().and_then(|o2| o2.get("_id")))?;
                let body = if is_operator_update(&self.o) {
                    Body::Delta(self.o.clone())
                } else {
                    Body::Full(self.o.clone())
                };
                Ok(Some(Operation::from_log(
                    OperationKind::Update,
                    ns,
                    Some(id),
                    body,
                    self.ts,
                )))
            }
            "d" => {
                let ns = self.namespace()?;
                let id = self.require_id(self.o.get("_id"))?;
                Ok(Some(Operation::from_log(
                    OperationKind::Delete,
                    ns,
                    Some(id),
                    Body::Absent,
                    self.ts,
                )))
            }
            "c" => Ok(self.command()),
            other => Err(EntryError::UnknownOp {
                position: self.ts,
                op: other.to_string(),
            }),
        }
    }

    fn namespace(&self) -> Result<Namespace, EntryError> {
        self.ns.parse().map_err(|_| EntryError::Namespace {
            position: self.ts,
            ns: self.ns.clone(),
        })
    }

    fn require_id(&self, id: Option<&Value>) -> Result<Value, EntryError> {
        id.cloned().ok_or_else(|| EntryError::MissingId {
            op: self.op.clone(),
            position: self.ts,
            ns: self.ns.clone(),
        })
    }

    // Command entries are written against "<db>.$cmd".
    fn command(&self) -> Option<Operation> {
        let database = self.ns.split('.').next().unwrap_or_default();
        if database.is_empty() {
            return None;
        }

        if let Some(Value::String(collection)) = self.o.get("drop") {
            return Some(Operation::from_log(
                OperationKind::Drop,
                Namespace::new(database, collection.as_str()),
                None,
                Body::Absent,
                self.ts,
            ));
        }

        if self.o.contains_key("dropDatabase") {
            return Some(Operation::from_log(
                OperationKind::Drop,
                Namespace::database_only(database),
                None,
                Body::Absent,
                self.ts,
            ));
        }

        None
    }
}

fn is_operator_update(o: &Document) -> bool {
    o.keys().any(|k| k.starts_with('$'))
}
