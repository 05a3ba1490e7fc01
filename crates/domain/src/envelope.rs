//! The bidirectional streaming envelope.
//!
//! Every server→client frame carries the same five-field header plus a typed
//! payload; client→server frames are prompts (or a `disconnect` marker).
//! Envelopes are also what the snapshot store persists: the ordered list of
//! frames a tree has emitted is sufficient to re-render the conversation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `type` discriminant of a server→client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Status,
    Update,
    Result,
    Text,
    Response,
    Title,
    Ner,
    Warning,
    Error,
    Completed,
    Heartbeat,
    TreeTimeoutError,
    UserTimeoutError,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Status => "status",
            EnvelopeKind::Update => "update",
            EnvelopeKind::Result => "result",
            EnvelopeKind::Text => "text",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Title => "title",
            EnvelopeKind::Ner => "ner",
            EnvelopeKind::Warning => "warning",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Completed => "completed",
            EnvelopeKind::Heartbeat => "heartbeat",
            EnvelopeKind::TreeTimeoutError => "tree_timeout_error",
            EnvelopeKind::UserTimeoutError => "user_timeout_error",
        }
    }
}

/// One server→client frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub query_id: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(
        kind: EnvelopeKind,
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        query_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            query_id: query_id.into(),
            payload,
        }
    }

    /// An `error` frame. Error frames carry an `err-` prefixed id so clients
    /// can spot them in logs without parsing the payload.
    pub fn error(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        query_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Error,
            id: format!("err-{}", uuid::Uuid::new_v4()),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            query_id: query_id.into(),
            payload: serde_json::json!({ "text": text.into() }),
        }
    }

    /// The conversation-expired frame sent when a tree was evicted and no
    /// snapshot exists to restore it from.
    pub fn tree_timeout(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        query_id: impl Into<String>,
    ) -> Self {
        Self::new(
            EnvelopeKind::TreeTimeoutError,
            user_id,
            conversation_id,
            query_id,
            serde_json::json!({
                "text": "This conversation has been timed out due to inactivity. \
                         Please start a new conversation."
            }),
        )
    }

    /// The user-expired frame sent when the user record was evicted.
    pub fn user_timeout(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        query_id: impl Into<String>,
    ) -> Self {
        Self::new(
            EnvelopeKind::UserTimeoutError,
            user_id,
            conversation_id,
            query_id,
            serde_json::json!({
                "text": "You have been timed out due to inactivity. \
                         Please start a new conversation."
            }),
        )
    }

    /// The liveness probe sent after 60 s of client silence. Heartbeats carry
    /// no addressing; they are connection-scoped, not conversation-scoped.
    pub fn heartbeat() -> Self {
        Self {
            kind: EnvelopeKind::Heartbeat,
            id: uuid::Uuid::new_v4().to_string(),
            user_id: String::new(),
            conversation_id: String::new(),
            query_id: String::new(),
            payload: Value::Object(Default::default()),
        }
    }

    /// True for the frames that belong in a tree's persisted envelope log.
    /// Heartbeats are connection chatter, not conversation content.
    pub fn is_recordable(&self) -> bool {
        !matches!(self.kind, EnvelopeKind::Heartbeat)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client→server frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A client→server frame on the query websocket.
///
/// A frame with `type: "disconnect"` requests a graceful close; everything
/// else is a prompt submission.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientFrame {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub query_id: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub collection_names: Vec<String>,
    /// Training route: a `/`-joined path of node ids that bypasses the
    /// selector until exhausted.
    #[serde(default)]
    pub route: Option<String>,
}

impl ClientFrame {
    pub fn is_disconnect(&self) -> bool {
        self.kind.as_deref() == Some("disconnect")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_type_tag() {
        let env = Envelope::new(
            EnvelopeKind::Status,
            "u1",
            "c1",
            "q1",
            serde_json::json!({ "text": "thinking" }),
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "status");
        assert_eq!(v["user_id"], "u1");
        assert_eq!(v["payload"]["text"], "thinking");
    }

    #[test]
    fn error_envelope_has_err_prefix() {
        let env = Envelope::error("u1", "c1", "q1", "boom");
        assert!(env.id.starts_with("err-"));
        assert_eq!(env.kind, EnvelopeKind::Error);
    }

    #[test]
    fn timeout_kinds_round_trip() {
        let env = Envelope::tree_timeout("u1", "c1", "q1");
        let raw = serde_json::to_string(&env).unwrap();
        assert!(raw.contains("\"tree_timeout_error\""));
        let back: Envelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.kind, EnvelopeKind::TreeTimeoutError);
    }

    #[test]
    fn heartbeat_is_not_recordable() {
        assert!(!Envelope::heartbeat().is_recordable());
        assert!(Envelope::error("u", "c", "q", "x").is_recordable());
    }

    #[test]
    fn client_frame_disconnect() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"disconnect"}"#).unwrap();
        assert!(frame.is_disconnect());

        let frame: ClientFrame = serde_json::from_str(
            r#"{"user_id":"u1","conversation_id":"c1","query_id":"q1",
                "query":"hi","collection_names":[]}"#,
        )
        .unwrap();
        assert!(!frame.is_disconnect());
        assert_eq!(frame.query, "hi");
    }
}
