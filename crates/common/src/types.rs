// Core domain types shared by the relay and the collaboration client.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Presence older than this is treated as offline.
pub const PRESENCE_FRESHNESS_WINDOW_SECS: i64 = 300;

/// Display name used when a peer never announced one.
pub const UNKNOWN_USER_NAME: &str = "Unknown User";

pub fn presence_freshness_window() -> Duration {
    Duration::seconds(PRESENCE_FRESHNESS_WINDOW_SECS)
}

/// What a collaborative session is centred on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    WorkItem,
    Board,
    Planning,
    Retrospective,
}

impl SessionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WorkItem => "work_item",
            Self::Board => "board",
            Self::Planning => "planning",
            Self::Retrospective => "retrospective",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "work_item" => Some(Self::WorkItem),
            "board" => Some(Self::Board),
            "planning" => Some(Self::Planning),
            "retrospective" => Some(Self::Retrospective),
            _ => None,
        }
    }
}

/// A durable shared editing/viewing context with a tracked participant set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollaborativeSession {
    pub id: Uuid,
    pub project_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<Uuid>,
    pub session_type: SessionType,
    pub created_by: Uuid,
    /// Participant user ids in join order. Never contains duplicates.
    pub participants: Vec<Uuid>,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Bumped on every write; participant updates compare against it.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollaborativeSession {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    /// Whole minutes elapsed since creation, clamped at zero.
    pub fn duration_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_minutes().max(0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    #[default]
    Active,
    Idle,
    Away,
}

impl PresenceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Away => "away",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "idle" => Some(Self::Idle),
            "away" => Some(Self::Away),
            _ => None,
        }
    }
}

/// Pointer position in board/page coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// Selected element on a page, optionally narrowed to a text range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub element_id: String,
    pub element_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<SelectionRange>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionRange {
    pub start: u32,
    pub end: u32,
}

/// A user's presence record.
///
/// Staleness is evaluated at read time via [`UserPresence::is_fresh`];
/// nothing evicts these rows on the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: Uuid,
    pub user_name: String,
    #[serde(default)]
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    /// Project scope of the most recent update, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

impl UserPresence {
    /// Build a fresh record from a partial update for a user seen for the first time.
    pub fn from_update(
        user_id: Uuid,
        update: PresenceUpdate,
        project_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            user_name: update.user_name.unwrap_or_else(|| UNKNOWN_USER_NAME.to_string()),
            status: update.status.unwrap_or_default(),
            last_seen: now,
            project_id,
            current_page: update.current_page,
            cursor: update.cursor,
            selection: update.selection,
        }
    }

    /// Merge a partial update. Absent fields keep their previous value.
    pub fn apply_update(
        &mut self,
        update: PresenceUpdate,
        project_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) {
        if let Some(user_name) = update.user_name {
            self.user_name = user_name;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if project_id.is_some() {
            self.project_id = project_id;
        }
        if update.current_page.is_some() {
            self.current_page = update.current_page;
        }
        if update.cursor.is_some() {
            self.cursor = update.cursor;
        }
        if update.selection.is_some() {
            self.selection = update.selection;
        }
        self.last_seen = now;
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_seen >= now - window
    }
}

/// Fields a client may set on its own presence row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

/// Answer to `get-session-info`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session: CollaborativeSession,
    /// Participants whose presence is within the freshness window.
    pub active_users: Vec<UserPresence>,
    pub participant_count: usize,
    pub duration_minutes: i64,
}
