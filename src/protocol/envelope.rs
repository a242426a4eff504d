//! Wire envelopes exchanged with the client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Error, Result};

/// `blockID` reserved for page-level actions.
pub const PAGE_BLOCK_ID: &str = "_page";

/// Client → server action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "blockID")]
    pub block_id: String,
    pub action: String,
    /// Action payload; its shape depends on the action.
    #[serde(default)]
    pub data: Value,
}

impl MessageEnvelope {
    pub fn new(block_id: impl Into<String>, action: impl Into<String>, data: Value) -> Self {
        Self {
            block_id: block_id.into(),
            action: action.into(),
            data,
        }
    }

    pub fn page(action: impl Into<String>, data: Value) -> Self {
        Self::new(PAGE_BLOCK_ID, action, data)
    }

    pub fn is_page(&self) -> bool {
        self.block_id == PAGE_BLOCK_ID
    }

    /// Decode one inbound message, refusing anything over `max_bytes`.
    pub fn decode(raw: &str, max_bytes: usize) -> Result<Self> {
        if raw.len() > max_bytes {
            return Err(Error::validation(format!(
                "message of {} bytes exceeds limit of {max_bytes}",
                raw.len()
            )));
        }
        serde_json::from_str(raw).map_err(|e| Error::validation(format!("malformed message: {e}")))
    }
}

/// Server → client update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "blockID")]
    pub block_id: String,
    /// `{"full": tree}` or `{"patch": [...]}`; `null` when nothing is rendered.
    pub tree: Value,
    pub meta: Map<String, Value>,
}

impl ResponseEnvelope {
    pub fn success(block_id: impl Into<String>, tree: Value) -> Self {
        let mut meta = Map::new();
        meta.insert("success".into(), Value::Bool(true));
        Self {
            block_id: block_id.into(),
            tree,
            meta,
        }
    }

    /// Failure report; the client keeps its current tree.
    pub fn failure(block_id: impl Into<String>, err: &Error) -> Self {
        let mut meta = Map::new();
        meta.insert("success".into(), Value::Bool(false));
        meta.insert("error".into(), Value::String(err.to_string()));
        meta.insert("code".into(), Value::String(err.code().to_string()));
        Self {
            block_id: block_id.into(),
            tree: Value::Null,
            meta,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.meta.get("success").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn error(&self) -> Option<&str> {
        self.meta.get("error").and_then(Value::as_str)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_names() {
        let msg = MessageEnvelope::decode(
            r#"{"blockID":"tasks","action":"delete","data":{"id":3}}"#,
            1024,
        )
        .unwrap();
        assert_eq!(msg.block_id, "tasks");
        assert_eq!(msg.action, "delete");
        assert_eq!(msg.data, json!({"id": 3}));

        let back: MessageEnvelope = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_missing_data_is_null() {
        let msg = MessageEnvelope::decode(r#"{"blockID":"_page","action":"nextStep"}"#, 1024).unwrap();
        assert!(msg.is_page());
        assert_eq!(msg.data, Value::Null);
    }

    #[test]
    fn test_decode_limits() {
        let err = MessageEnvelope::decode(&"x".repeat(64), 16).unwrap_err();
        assert!(err.to_string().contains("exceeds limit of 16"));
        let err = MessageEnvelope::decode("{not json", 1024).unwrap_err();
        assert!(err.to_string().contains("malformed message"));
    }

    #[test]
    fn test_response_meta() {
        let ok = ResponseEnvelope::success("_page", json!({"full": {}})).with_meta("result", json!(1));
        let wire: Value = serde_json::from_str(&ok.encode().unwrap()).unwrap();
        assert_eq!(wire["blockID"], "_page");
        assert_eq!(wire["meta"], json!({"success": true, "result": 1}));

        let failed = ResponseEnvelope::failure("tasks", &Error::UnknownBlock("tasks".into()));
        assert!(!failed.is_success());
        assert_eq!(failed.error(), Some("unknown block: tasks"));
        assert_eq!(failed.meta["code"], "NOT_FOUND");

        let back: ResponseEnvelope = serde_json::from_str(&failed.encode().unwrap()).unwrap();
        assert_eq!(back, failed);
    }
}
