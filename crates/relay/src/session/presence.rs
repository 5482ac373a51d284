use chrono::{Duration, Utc};
use scrumflow_common::channel::ChannelConfig;
use scrumflow_common::protocol::events::{BroadcastEvent, CursorUpdate};
use scrumflow_common::protocol::rpc::{BroadcastReceipt, CursorData};
use scrumflow_common::realtime::RealtimeHub;
use scrumflow_common::types::{PresenceUpdate, UserPresence};
use tracing::debug;
use uuid::Uuid;

use super::error::SessionError;
use super::store::CollaborationStore;

/// Presence rows and pointer broadcasts.
#[derive(Clone)]
pub struct PresenceService {
    store: CollaborationStore,
    hub: RealtimeHub,
    window: Duration,
}

impl PresenceService {
    pub fn new(store: CollaborationStore, hub: RealtimeHub, window: Duration) -> Self {
        Self { store, hub, window }
    }

    pub async fn update_presence(
        &self,
        user_id: Uuid,
        update: PresenceUpdate,
        project_id: Option<Uuid>,
    ) -> Result<UserPresence, SessionError> {
        validate_presence_update(&update)?;

        let presence = self.store.upsert_presence(user_id, &update, project_id, Utc::now()).await?;

        if let Some(project_id) = project_id {
            let topic = ChannelConfig::ProjectUpdates { project_id }.canonical_id();
            let delivered = self
                .hub
                .broadcast(None, &topic, BroadcastEvent::PresenceUpdated(presence.clone()))
                .await;
            debug!(user_id = %user_id, topic = %topic, delivered, "presence update published");
        }

        Ok(presence)
    }

    /// Presence rows for `project_id` seen within the freshness window, newest first.
    pub async fn active_users(&self, project_id: Uuid) -> Result<Vec<UserPresence>, SessionError> {
        self.store.presences_seen_since(project_id, Utc::now() - self.window).await
    }

    pub async fn send_cursor(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        cursor: CursorData,
    ) -> Result<BroadcastReceipt, SessionError> {
        if !cursor.x.is_finite() || !cursor.y.is_finite() {
            return Err(SessionError::validation("cursor coordinates must be finite numbers"));
        }

        let topic = ChannelConfig::CursorTracking { project_id }.canonical_id();
        let event = BroadcastEvent::CursorUpdate(CursorUpdate {
            user_id,
            x: cursor.x,
            y: cursor.y,
            user_name: cursor.user_name,
        });
        let delivered = self.hub.broadcast(None, &topic, event).await;
        Ok(BroadcastReceipt { delivered })
    }
}

fn validate_presence_update(update: &PresenceUpdate) -> Result<(), SessionError> {
    if update.user_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
        return Err(SessionError::validation("userName must not be blank"));
    }
    if let Some(cursor) = update.cursor {
        if !cursor.x.is_finite() || !cursor.y.is_finite() {
            return Err(SessionError::validation("cursor coordinates must be finite numbers"));
        }
    }
    Ok(())
}
