use crate::component::Component;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The default document type for documents created implicitly by an edit.
pub const DEFAULT_DOC_TYPE: &str = "json0";

/// Identifies a document: `(collection, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Broadcast channel name for this document: `collection.id`.
    pub fn channel(&self) -> String {
        format!("{}.{}", self.collection, self.id)
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    Create { doc_type: String, data: Value },
    Edit { components: Vec<Component> },
    Delete,
}

/// A unit of change against one document.
///
/// `v` is the version the operation applies on top of. For committed
/// operations it is the version the document had just before the commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub src: String,
    pub seq: u64,
    pub v: u64,
    #[serde(flatten)]
    pub kind: OpKind,
}

impl Operation {
    pub fn edit(src: impl Into<String>, seq: u64, v: u64, components: Vec<Component>) -> Self {
        Self {
            src: src.into(),
            seq,
            v,
            kind: OpKind::Edit { components },
        }
    }

    pub fn create(
        src: impl Into<String>,
        seq: u64,
        doc_type: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            src: src.into(),
            seq,
            v: 0,
            kind: OpKind::Create {
                doc_type: doc_type.into(),
                data,
            },
        }
    }

    pub fn delete(src: impl Into<String>, seq: u64, v: u64) -> Self {
        Self {
            src: src.into(),
            seq,
            v,
            kind: OpKind::Delete,
        }
    }

    pub fn components(&self) -> &[Component] {
        match &self.kind {
            OpKind::Edit { components } => components,
            _ => &[],
        }
    }

    pub fn is_edit(&self) -> bool {
        matches!(self.kind, OpKind::Edit { .. })
    }
}

/// Outcome of a successful append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub collection: String,
    pub document: String,
    /// Document version after this commit.
    pub version: u64,
    pub operation: Operation,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl CommitRecord {
    pub fn new(key: &DocKey, version: u64, operation: Operation) -> Self {
        Self {
            collection: key.collection.clone(),
            document: key.id.clone(),
            version,
            source: operation.src.clone(),
            operation,
            timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> DocKey {
        DocKey::new(self.collection.clone(), self.document.clone())
    }
}

/// Point-in-time view of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub v: u64,
    #[serde(rename = "type")]
    pub doc_type: Option<String>,
    pub data: Value,
}

impl Snapshot {
    /// Whether the document currently exists (created and not deleted).
    pub fn exists(&self) -> bool {
        self.doc_type.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_doc_key_channel_and_display() {
        let key = DocKey::new("record_tbl1", "rec1");
        assert_eq!(key.channel(), "record_tbl1.rec1");
        assert_eq!(key.to_string(), "record_tbl1/rec1");
    }

    #[test]
    fn test_commit_record_takes_source_from_operation() {
        let key = DocKey::new("c", "d");
        let op = Operation::edit("session-a", 1, 0, vec![]);
        let rec = CommitRecord::new(&key, 1, op);
        assert_eq!(rec.source, "session-a");
        assert_eq!(rec.key(), key);
    }

    #[test]
    fn test_operation_serializes_kind_inline() {
        let op = Operation::create("s", 1, "json0", json!({"a": 1}));
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v["kind"], "create");
        assert_eq!(v["data"], json!({"a": 1}));
        let back: Operation = serde_json::from_value(v).unwrap();
        assert_eq!(back, op);
    }
}
