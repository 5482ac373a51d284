// Ephemeral cursor and selection caches, fed by broadcasts only.
//
// Timestamps are receipt times, not sender clocks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use scrumflow_common::protocol::events::{CursorUpdate, SelectionUpdate};
use scrumflow_common::types::{Selection, UNKNOWN_USER_NAME};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserCursor {
    pub user_id: Uuid,
    pub user_name: String,
    pub x: f64,
    pub y: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSelection {
    pub user_id: Uuid,
    pub selection: Selection,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CursorStore {
    cursors: Arc<RwLock<HashMap<Uuid, UserCursor>>>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a cursor broadcast. A missing name keeps the last known one.
    pub async fn apply_cursor_update(&self, update: CursorUpdate, now: DateTime<Utc>) -> UserCursor {
        let mut cursors = self.cursors.write().await;
        let user_name = update
            .user_name
            .or_else(|| cursors.get(&update.user_id).map(|cursor| cursor.user_name.clone()))
            .unwrap_or_else(|| UNKNOWN_USER_NAME.to_string());
        let cursor =
            UserCursor { user_id: update.user_id, user_name, x: update.x, y: update.y, timestamp: now };
        cursors.insert(update.user_id, cursor.clone());
        cursor
    }

    pub async fn get(&self, user_id: Uuid) -> Option<UserCursor> {
        self.cursors.read().await.get(&user_id).cloned()
    }

    pub async fn get_all(&self) -> Vec<UserCursor> {
        self.cursors.read().await.values().cloned().collect()
    }

    pub async fn sweep(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        let mut cursors = self.cursors.write().await;
        let before = cursors.len();
        cursors.retain(|_, cursor| cursor.timestamp >= cutoff);
        before - cursors.len()
    }

    pub async fn len(&self) -> usize {
        self.cursors.read().await.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectionStore {
    selections: Arc<RwLock<HashMap<Uuid, UserSelection>>>,
}

impl SelectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply_selection_update(&self, update: SelectionUpdate, now: DateTime<Utc>) -> UserSelection {
        let selection =
            UserSelection { user_id: update.user_id, selection: update.selection, timestamp: now };
        self.selections.write().await.insert(update.user_id, selection.clone());
        selection
    }

    pub async fn get(&self, user_id: Uuid) -> Option<UserSelection> {
        self.selections.read().await.get(&user_id).cloned()
    }

    pub async fn get_all(&self) -> Vec<UserSelection> {
        self.selections.read().await.values().cloned().collect()
    }

    pub async fn sweep(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        let mut selections = self.selections.write().await;
        let before = selections.len();
        selections.retain(|_, selection| selection.timestamp >= cutoff);
        before - selections.len()
    }

    pub async fn len(&self) -> usize {
        self.selections.read().await.len()
    }
}
