// Frame types for the realtime WebSocket protocol.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{ChannelBindings, RowChange};
use crate::protocol::events::BroadcastEvent;
use crate::types::UserPresence;

pub const CURRENT_PROTOCOL_VERSION: &str = "scrumflow-realtime.v1";
pub const MAX_FRAME_BYTES: usize = 262_144;

/// Presence keyed by user id. A user may be present through several
/// connections (tabs), hence the list.
pub type PresenceState = BTreeMap<Uuid, Vec<UserPresence>>;

/// All frames exchanged on `/v1/realtime`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeMessage {
    /// Client -> Server: become a member of a topic.
    Join {
        topic: String,
        #[serde(default)]
        bindings: ChannelBindings,
    },

    /// Client -> Server: stop receiving a topic and drop any tracked presence.
    Leave { topic: String },

    /// Bidirectional: a broadcast event on a topic.
    Broadcast { topic: String, event: BroadcastEvent },

    /// Client -> Server: announce (or refresh) presence on a topic.
    Track { topic: String, presence: UserPresence },

    /// Client -> Server: withdraw presence from a topic.
    Untrack { topic: String },

    /// Server -> Client: join confirmed.
    Joined { topic: String },

    /// Server -> Client: full presence snapshot, sent on join.
    PresenceState { topic: String, state: PresenceState },

    /// Server -> Client: incremental presence change.
    PresenceDiff {
        topic: String,
        #[serde(default)]
        joins: PresenceState,
        #[serde(default)]
        leaves: PresenceState,
    },

    /// Server -> Client: durable row change routed to this topic.
    RowChange { topic: String, change: RowChange },

    /// Server -> Client: error.
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
}

impl RealtimeMessage {
    /// Short label used for metrics and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Broadcast { .. } => "broadcast",
            Self::Track { .. } => "track",
            Self::Untrack { .. } => "untrack",
            Self::Joined { .. } => "joined",
            Self::PresenceState { .. } => "presence_state",
            Self::PresenceDiff { .. } => "presence_diff",
            Self::RowChange { .. } => "row_change",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(code: &str, message: impl Into<String>, topic: Option<String>) -> Self {
        Self::Error { code: code.to_string(), message: message.into(), topic }
    }
}

pub fn decode_message(raw: &str) -> Result<RealtimeMessage, serde_json::Error> {
    serde_json::from_str::<RealtimeMessage>(raw)
}

pub fn encode_message(message: &RealtimeMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PresenceUpdate, UserPresence};
    use chrono::Utc;

    #[test]
    fn join_without_bindings_defaults_to_nothing() {
        let message = decode_message(r#"{"type":"join","topic":"cursor_tracking_x"}"#).unwrap();
        assert_eq!(
            message,
            RealtimeMessage::Join {
                topic: "cursor_tracking_x".into(),
                bindings: ChannelBindings::default()
            }
        );
    }

    #[test]
    fn presence_state_keys_are_user_id_strings() {
        let user_id = Uuid::new_v4();
        let mut state = PresenceState::new();
        state.insert(
            user_id,
            vec![UserPresence::from_update(user_id, PresenceUpdate::default(), None, Utc::now())],
        );
        let encoded = encode_message(&RealtimeMessage::PresenceState {
            topic: "session_1".into(),
            state,
        })
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "presence_state");
        assert!(value["state"].get(user_id.to_string()).is_some());

        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded.kind(), "presence_state");
    }

    #[test]
    fn error_omits_missing_topic() {
        let encoded =
            encode_message(&RealtimeMessage::error("REALTIME_INVALID_MESSAGE", "bad frame", None))
                .unwrap();
        assert!(!encoded.contains("topic"));
    }
}
