// Session-action RPC: one endpoint, one request type tagged by `action`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{PresenceUpdate, Selection, SessionType};

/// Every accepted `action` tag, in declaration order.
pub const SESSION_ACTIONS: &[&str] = &[
    "create-session",
    "join-session",
    "leave-session",
    "update-presence",
    "get-active-users",
    "send-cursor",
    "send-selection",
    "get-session-info",
    "end-session",
];

/// A validated session-action request. Each variant carries exactly the
/// fields its action requires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SessionAction {
    CreateSession {
        project_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        work_item_id: Option<Uuid>,
        user_id: Uuid,
        data: CreateSessionData,
    },
    JoinSession {
        session_id: Uuid,
        user_id: Uuid,
    },
    LeaveSession {
        session_id: Uuid,
        user_id: Uuid,
    },
    UpdatePresence {
        user_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<Uuid>,
        data: PresenceUpdate,
    },
    GetActiveUsers {
        project_id: Uuid,
    },
    SendCursor {
        project_id: Uuid,
        user_id: Uuid,
        data: CursorData,
    },
    SendSelection {
        session_id: Uuid,
        user_id: Uuid,
        data: SelectionData,
    },
    GetSessionInfo {
        session_id: Uuid,
    },
    EndSession {
        session_id: Uuid,
        user_id: Uuid,
    },
}

impl SessionAction {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateSession { .. } => "create-session",
            Self::JoinSession { .. } => "join-session",
            Self::LeaveSession { .. } => "leave-session",
            Self::UpdatePresence { .. } => "update-presence",
            Self::GetActiveUsers { .. } => "get-active-users",
            Self::SendCursor { .. } => "send-cursor",
            Self::SendSelection { .. } => "send-selection",
            Self::GetSessionInfo { .. } => "get-session-info",
            Self::EndSession { .. } => "end-session",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionData {
    pub session_type: SessionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorData {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionData {
    pub selection: Selection,
}

/// Result of the broadcast-only actions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BroadcastReceipt {
    /// Members the event was handed to. Not a delivery guarantee.
    pub delivered: usize,
}

/// Success envelope: `{ "data": ..., "success": true }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcSuccess<T> {
    pub data: T,
    pub success: bool,
}

impl<T> RpcSuccess<T> {
    pub fn new(data: T) -> Self {
        Self { data, success: true }
    }
}

/// Error envelope returned with every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionParseError {
    #[error("request body must be a JSON object with an `action` field")]
    MissingAction,
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid {action} request: {reason}")]
    Invalid { action: String, reason: String },
}

/// Validate a raw request body into a [`SessionAction`].
///
/// Unknown actions are distinguished from malformed known ones so callers can
/// report them separately.
pub fn parse_session_action(body: Value) -> Result<SessionAction, ActionParseError> {
    let action = body
        .get("action")
        .and_then(Value::as_str)
        .ok_or(ActionParseError::MissingAction)?
        .to_owned();

    if !SESSION_ACTIONS.contains(&action.as_str()) {
        return Err(ActionParseError::UnknownAction(action));
    }

    serde_json::from_value(body)
        .map_err(|error| ActionParseError::Invalid { action, reason: error.to_string() })
}
