//! Source operations as emitted by a change feed.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ObjectId;

/// Kind of change an operation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Document inserted.
    #[serde(rename = "i")]
    Insert,
    /// Document updated.
    #[serde(rename = "u")]
    Update,
    /// Document deleted.
    #[serde(rename = "d")]
    Delete,
    /// Database command (drop, rename, ...).
    #[serde(rename = "c")]
    Command,
}

impl OpKind {
    /// Single-letter code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            OpKind::Insert => "i",
            OpKind::Update => "u",
            OpKind::Delete => "d",
            OpKind::Command => "c",
        }
    }

    /// Parse a single-letter code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(OpKind::Insert),
            "u" => Some(OpKind::Update),
            "d" => Some(OpKind::Delete),
            "c" => Some(OpKind::Command),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Native identifier of the document an operation touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NativeId {
    /// The data store's canonical object id.
    ObjectId(ObjectId),
    /// Any other identifier value.
    Other(Value),
}

impl NativeId {
    /// Text used as the change event id.
    ///
    /// Object ids render as lowercase hex. Strings render without quotes and
    /// any other value renders as compact JSON.
    pub fn to_event_id(&self) -> String {
        match self {
            NativeId::ObjectId(oid) => oid.to_hex(),
            NativeId::Other(Value::String(s)) => s.clone(),
            NativeId::Other(other) => other.to_string(),
        }
    }
}

impl From<ObjectId> for NativeId {
    fn from(id: ObjectId) -> Self {
        NativeId::ObjectId(id)
    }
}

impl From<Value> for NativeId {
    fn from(value: Value) -> Self {
        NativeId::Other(value)
    }
}

impl From<&str> for NativeId {
    fn from(value: &str) -> Self {
        NativeId::Other(Value::String(value.to_string()))
    }
}

impl From<String> for NativeId {
    fn from(value: String) -> Self {
        NativeId::Other(Value::String(value))
    }
}

impl From<i64> for NativeId {
    fn from(value: i64) -> Self {
        NativeId::Other(Value::from(value))
    }
}

/// A single operation read from the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    /// Identifier of the affected document.
    pub id: NativeId,
    /// Kind of change.
    #[serde(rename = "op")]
    pub kind: OpKind,
    /// `<database>.<collection>` the change happened in.
    #[serde(rename = "ns")]
    pub namespace: String,
    /// Document body, when the feed carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Source timestamp of the change.
    #[serde(rename = "ts", default)]
    pub timestamp: u64,
}

impl Op {
    /// Create an operation without a body.
    pub fn new(kind: OpKind, namespace: impl Into<String>, id: impl Into<NativeId>) -> Self {
        Self {
            id: id.into(),
            kind,
            namespace: namespace.into(),
            data: None,
            timestamp: 0,
        }
    }

    /// Create an insert carrying the new document.
    pub fn insert(namespace: impl Into<String>, id: impl Into<NativeId>, data: Value) -> Self {
        Self::new(OpKind::Insert, namespace, id).with_data(data)
    }

    /// Create an update carrying the changed document.
    pub fn update(namespace: impl Into<String>, id: impl Into<NativeId>, data: Value) -> Self {
        Self::new(OpKind::Update, namespace, id).with_data(data)
    }

    /// Create a delete.
    pub fn delete(namespace: impl Into<String>, id: impl Into<NativeId>) -> Self {
        Self::new(OpKind::Delete, namespace, id)
    }

    /// Attach a document body.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Set the source timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Database part of the namespace.
    pub fn database(&self) -> &str {
        self.namespace
            .split_once('.')
            .map_or(self.namespace.as_str(), |(db, _)| db)
    }

    /// Collection part of the namespace; empty when the namespace has no dot.
    pub fn collection(&self) -> &str {
        self.namespace.split_once('.').map_or("", |(_, coll)| coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_id_rendering() {
        let oid: ObjectId = "5f2a0c3e9b1d4e0012ab34cd".parse().unwrap();
        assert_eq!(NativeId::from(oid).to_event_id(), "5f2a0c3e9b1d4e0012ab34cd");
        assert_eq!(NativeId::from("user-7").to_event_id(), "user-7");
        assert_eq!(NativeId::from(42i64).to_event_id(), "42");
        assert_eq!(NativeId::from(json!(1.5)).to_event_id(), "1.5");
        assert_eq!(NativeId::from(json!(true)).to_event_id(), "true");
    }

    #[test]
    fn test_decode_native_ids() {
        let op: Op = serde_json::from_str(
            r#"{"id":{"$oid":"5f2a0c3e9b1d4e0012ab34cd"},"op":"i","ns":"app.users"}"#,
        )
        .unwrap();
        assert!(matches!(op.id, NativeId::ObjectId(_)));
        assert_eq!(op.kind, OpKind::Insert);
        assert_eq!(op.timestamp, 0);

        // A malformed $oid is still an identifier, just not an object id.
        let op: Op =
            serde_json::from_str(r#"{"id":{"$oid":"nope"},"op":"d","ns":"app.users"}"#).unwrap();
        assert_eq!(op.id, NativeId::Other(json!({"$oid": "nope"})));
    }

    #[test]
    fn test_serialized_field_names() {
        let op = Op::insert("app.users", 7i64, json!({"name": "ada"})).with_timestamp(99);
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({"id": 7, "op": "i", "ns": "app.users", "data": {"name": "ada"}, "ts": 99})
        );

        let delete = serde_json::to_value(Op::delete("app.users", 7i64)).unwrap();
        assert!(delete.get("data").is_none());
    }

    #[test]
    fn test_namespace_parts() {
        let op = Op::delete("app.users.archive", "x");
        assert_eq!(op.database(), "app");
        assert_eq!(op.collection(), "users.archive");

        let op = Op::new(OpKind::Command, "admin", "x");
        assert_eq!(op.database(), "admin");
        assert_eq!(op.collection(), "");
    }

    #[test]
    fn test_kind_codes() {
        for kind in [OpKind::Insert, OpKind::Update, OpKind::Delete, OpKind::Command] {
            assert_eq!(OpKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(OpKind::from_code("n"), None);
    }
}
