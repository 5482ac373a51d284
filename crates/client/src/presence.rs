// Client-side cache of other users' presence, keyed by user id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use scrumflow_common::protocol::realtime::PresenceState;
use scrumflow_common::types::UserPresence;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct PresenceEntry {
    presence: UserPresence,
    topic: String,
    received_at: DateTime<Utc>,
}

/// Reconciled from snapshots plus join/leave diffs. Never the source of truth.
#[derive(Debug, Clone, Default)]
pub struct PresenceStore {
    entries: Arc<RwLock<HashMap<Uuid, PresenceEntry>>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a full snapshot. Users absent from the snapshot are kept; for a
    /// user with several presences the last one wins.
    pub async fn apply_sync(&self, topic: &str, state: &PresenceState, now: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        for (user_id, presences) in state {
            if let Some(presence) = presences.last() {
                entries.insert(
                    *user_id,
                    PresenceEntry { presence: presence.clone(), topic: topic.to_string(), received_at: now },
                );
            }
        }
    }

    /// A user came online: their first presence replaces whatever was cached.
    pub async fn apply_join(&self, topic: &str, user_id: Uuid, presences: &[UserPresence], now: DateTime<Utc>) {
        if let Some(presence) = presences.first() {
            self.entries.write().await.insert(
                user_id,
                PresenceEntry { presence: presence.clone(), topic: topic.to_string(), received_at: now },
            );
        }
    }

    pub async fn apply_leave(&self, user_id: Uuid) -> bool {
        self.entries.write().await.remove(&user_id).is_some()
    }

    pub async fn get(&self, user_id: Uuid) -> Option<UserPresence> {
        self.entries.read().await.get(&user_id).map(|entry| entry.presence.clone())
    }

    /// Every cached presence, in no particular order.
    pub async fn get_all(&self) -> Vec<UserPresence> {
        self.entries.read().await.values().map(|entry| entry.presence.clone()).collect()
    }

    pub async fn fresh(&self, now: DateTime<Utc>, window: Duration) -> Vec<UserPresence> {
        let cutoff = now - window;
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.received_at >= cutoff)
            .map(|entry| entry.presence.clone())
            .collect()
    }

    /// Drop entries received before `now - window` whose channel is no longer
    /// live. Entries from a live channel are removed only by a leave.
    /// Returns how many were removed.
    pub async fn sweep<F>(&self, now: DateTime<Utc>, window: Duration, is_live: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let cutoff = now - window;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.received_at >= cutoff || is_live(&entry.topic));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use scrumflow_common::types::PresenceStatus;

    use super::*;

    const TOPIC: &str = "project_updates_test";

    fn presence(user_id: Uuid, name: &str, status: PresenceStatus) -> UserPresence {
        UserPresence {
            user_id,
            user_name: name.to_string(),
            status,
            last_seen: Utc::now(),
            project_id: None,
            current_page: None,
            cursor: None,
            selection: None,
        }
    }

    #[tokio::test]
    async fn sync_then_leave_removes_user() {
        let store = PresenceStore::new();
        let u1 = Uuid::new_v4();
        let mut state = PresenceState::new();
        state.insert(u1, vec![presence(u1, "Ada", PresenceStatus::Active)]);

        store.apply_sync(TOPIC, &state, Utc::now()).await;
        assert_eq!(store.get(u1).await.map(|p| p.user_name), Some("Ada".to_string()));

        assert!(store.apply_leave(u1).await);
        assert!(store.get_all().await.iter().all(|p| p.user_id != u1));
        assert!(!store.apply_leave(u1).await);
    }

    #[tokio::test]
    async fn sync_merges_and_last_presence_wins() {
        let store = PresenceStore::new();
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        store.apply_join(TOPIC, u1, &[presence(u1, "Ada", PresenceStatus::Active)], Utc::now()).await;

        let mut state = PresenceState::new();
        state.insert(
            u2,
            vec![presence(u2, "Bo", PresenceStatus::Active), presence(u2, "Bo", PresenceStatus::Away)],
        );
        store.apply_sync(TOPIC, &state, Utc::now()).await;

        assert_eq!(store.len().await, 2);
        assert_eq!(store.get(u2).await.map(|p| p.status), Some(PresenceStatus::Away));
    }

    #[tokio::test]
    async fn join_takes_first_presence() {
        let store = PresenceStore::new();
        let u1 = Uuid::new_v4();
        store
            .apply_join(
                TOPIC,
                u1,
                &[presence(u1, "Ada", PresenceStatus::Idle), presence(u1, "Ada", PresenceStatus::Away)],
                Utc::now(),
            )
            .await;
        assert_eq!(store.get(u1).await.map(|p| p.status), Some(PresenceStatus::Idle));

        store.apply_join(TOPIC, u1, &[], Utc::now()).await;
        assert!(store.get(u1).await.is_some());
    }

    #[tokio::test]
    async fn sweep_drops_entries_outside_window() {
        let store = PresenceStore::new();
        let (old, recent) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        store
            .apply_join(TOPIC, old, &[presence(old, "Old", PresenceStatus::Away)], now - Duration::minutes(6))
            .await;
        store.apply_join(TOPIC, recent, &[presence(recent, "New", PresenceStatus::Active)], now).await;

        assert_eq!(store.fresh(now, Duration::minutes(5)).await.len(), 1);
        assert_eq!(store.sweep(now, Duration::minutes(5), |_| false).await, 1);
        assert!(store.get(old).await.is_none());
        assert!(store.get(recent).await.is_some());
    }

    #[tokio::test]
    async fn sweep_keeps_quiet_users_on_live_channels() {
        let store = PresenceStore::new();
        let (quiet, orphaned) = (Uuid::new_v4(), Uuid::new_v4());
        let long_ago = Utc::now() - Duration::minutes(30);
        store.apply_join(TOPIC, quiet, &[presence(quiet, "Quiet", PresenceStatus::Idle)], long_ago).await;
        store
            .apply_join("project_updates_closed", orphaned, &[presence(orphaned, "Gone", PresenceStatus::Away)], long_ago)
            .await;

        let removed = store.sweep(Utc::now(), Duration::minutes(5), |topic| topic == TOPIC).await;

        assert_eq!(removed, 1);
        assert!(store.get(quiet).await.is_some());
        assert!(store.get(orphaned).await.is_none());
    }
}
