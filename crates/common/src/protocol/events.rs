// Broadcast event catalogue.
//
// Broadcasts are fire-and-forget: they are fanned out to the members of a
// channel at the moment they are sent and are never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{RowChange, RowChangeKind};
use crate::types::{CollaborativeSession, Selection, UserPresence};

/// Every event that can travel over a channel broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum BroadcastEvent {
    CursorUpdate(CursorUpdate),
    Notification(NotificationPayload),
    UserJoined(MembershipChange),
    UserLeft(MembershipChange),
    EditingStatusUpdate(EditingStatus),
    SelectionUpdate(SelectionUpdate),
    SessionCreated(CollaborativeSession),
    SessionEnded(CollaborativeSession),
    PresenceUpdated(UserPresence),
}

impl BroadcastEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CursorUpdate(_) => "cursor_update",
            Self::Notification(_) => "notification",
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft(_) => "user_left",
            Self::EditingStatusUpdate(_) => "editing_status_update",
            Self::SelectionUpdate(_) => "selection_update",
            Self::SessionCreated(_) => "session_created",
            Self::SessionEnded(_) => "session_ended",
            Self::PresenceUpdated(_) => "presence_updated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdate {
    pub user_id: Uuid,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub user_id: Uuid,
    pub project_id: Uuid,
}

impl NotificationPayload {
    /// Materialize a notification on receipt.
    pub fn materialize(self, now: DateTime<Utc>) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            kind: self.kind,
            title: self.title,
            message: self.message,
            user_id: self.user_id,
            project_id: self.project_id,
            read: false,
            created_at: now,
        }
    }
}

/// A notification as consumers see it, whether it came from a broadcast or a
/// durable `notifications` row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Present the notification as an insert on the `notifications` table.
    pub fn into_row_change(self) -> RowChange {
        RowChange {
            table: "notifications".to_string(),
            event_type: RowChangeKind::Insert,
            new: serde_json::to_value(self).ok(),
            old: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MembershipChange {
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EditingStatus {
    pub user_id: Uuid,
    pub is_editing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelectionUpdate {
    pub user_id: Uuid,
    pub selection: Selection,
}
