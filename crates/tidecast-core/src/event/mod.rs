//! Change events and the source records they are built from.

mod object_id;
mod op;

pub use object_id::{ObjectId, OBJECT_ID_LEN};
pub use op::{NativeId, Op, OpKind};

use serde_json::Value;

use crate::error::Result;

/// An immutable change event as fanned out to subscribers.
///
/// The payload is opaque to the broker; filters may look into it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    id: String,
    payload: Value,
}

impl ChangeEvent {
    /// Create an event from an already derived id and payload.
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Wrap a source operation, deriving the event id from its native id.
    pub fn from_op(op: &Op) -> Result<Self> {
        Ok(Self {
            id: op.id.to_event_id(),
            payload: serde_json::to_value(op)?,
        })
    }

    /// Derived event id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Event payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Namespace of the change, when the payload carries one.
    pub fn namespace(&self) -> Option<&str> {
        self.payload.get("ns").and_then(Value::as_str)
    }

    /// Kind of change, when the payload carries one.
    pub fn kind(&self) -> Option<OpKind> {
        self.payload
            .get("op")
            .and_then(Value::as_str)
            .and_then(OpKind::from_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_op_with_object_id() {
        let oid: ObjectId = "5f2a0c3e9b1d4e0012ab34cd".parse().unwrap();
        let op = Op::insert("app.users", oid, json!({"name": "ada"}));

        let event = ChangeEvent::from_op(&op).unwrap();
        assert_eq!(event.id(), "5f2a0c3e9b1d4e0012ab34cd");
        assert_eq!(event.namespace(), Some("app.users"));
        assert_eq!(event.kind(), Some(OpKind::Insert));
        assert_eq!(event.payload()["data"]["name"], "ada");
    }

    #[test]
    fn test_from_op_with_other_id() {
        let event = ChangeEvent::from_op(&Op::delete("app.users", "user-7")).unwrap();
        assert_eq!(event.id(), "user-7");
        assert_eq!(event.kind(), Some(OpKind::Delete));
    }

    #[test]
    fn test_opaque_payload() {
        let event = ChangeEvent::new("abc123", json!([1, 2, 3]));
        assert_eq!(event.id(), "abc123");
        assert_eq!(event.namespace(), None);
        assert_eq!(event.kind(), None);
    }
}
