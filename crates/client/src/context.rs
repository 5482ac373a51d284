// Per-connection collaboration state.
//
// One context owns the registry and every cache fed by it. Create one per
// relay connection (or per test) and pass it by reference.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use scrumflow_common::channel::ChannelConfig;
use scrumflow_common::protocol::events::{BroadcastEvent, CursorUpdate, NotificationPayload, SelectionUpdate};
use scrumflow_common::types::UserPresence;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::cursor::{CursorStore, SelectionStore};
use crate::notification::NotificationRelay;
use crate::presence::PresenceStore;
use crate::reaper::{spawn_reaper, SweepReport};
use crate::registry::{ChannelRegistry, ChannelSinks};
use crate::transport::{RealtimeTransport, TransportError, WsTransport};

#[derive(Clone)]
pub struct CollaborationContext {
    config: ClientConfig,
    registry: ChannelRegistry,
}

impl CollaborationContext {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: ClientConfig) -> Self {
        Self { registry: ChannelRegistry::new(transport, ChannelSinks::default()), config }
    }

    /// Open a WebSocket to the configured relay.
    pub async fn connect(config: ClientConfig) -> Result<Self, TransportError> {
        let transport = WsTransport::connect(&config.realtime_url()?).await?;
        Ok(Self::new(transport, config))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.registry.sinks().presence
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.registry.sinks().cursors
    }

    pub fn selections(&self) -> &SelectionStore {
        &self.registry.sinks().selections
    }

    pub fn notifications(&self) -> &NotificationRelay {
        &self.registry.sinks().notifications
    }

    /// Broadcast a cursor move to `cursor_tracking_{project_id}`. Returns
    /// `false` without error when that channel is not open.
    pub fn send_cursor(&self, project_id: Uuid, update: CursorUpdate) -> bool {
        self.registry.broadcast(
            &ChannelConfig::CursorTracking { project_id },
            BroadcastEvent::CursorUpdate(update),
        )
    }

    pub fn send_selection(&self, work_item_id: Uuid, update: SelectionUpdate) -> bool {
        self.registry.broadcast(
            &ChannelConfig::CollaborativeEditing { work_item_id },
            BroadcastEvent::SelectionUpdate(update),
        )
    }

    pub fn send_notification(&self, project_id: Uuid, payload: NotificationPayload) -> bool {
        self.registry.broadcast(
            &ChannelConfig::Notifications { project_id },
            BroadcastEvent::Notification(payload),
        )
    }

    /// Announce the local user on `project_updates_{project_id}`.
    pub fn track_presence(&self, project_id: Uuid, presence: UserPresence) -> bool {
        self.registry.track(&ChannelConfig::ProjectUpdates { project_id }, presence)
    }

    /// Drop cache entries older than the freshness window. Presence from a
    /// channel that is still live is kept until its leave arrives.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let window = chrono::Duration::from_std(self.config.freshness_window)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        SweepReport {
            presence: self.presence().sweep(now, window, |topic| self.registry.is_live(topic)).await,
            cursors: self.cursors().sweep(now, window).await,
            selections: self.selections().sweep(now, window).await,
        }
    }

    /// Sweep periodically until the returned task is aborted.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        spawn_reaper(self.clone(), self.config.reaper_interval)
    }

    /// Close every channel.
    pub fn shutdown(&self) -> usize {
        self.registry.unsubscribe_all()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use scrumflow_common::realtime::RealtimeHub;
    use scrumflow_common::types::Selection;

    use super::*;
    use crate::transport::MemoryTransport;

    async fn context(hub: &RealtimeHub) -> CollaborationContext {
        CollaborationContext::new(MemoryTransport::connect(hub.clone()).await, ClientConfig::default())
    }

    #[tokio::test]
    async fn send_cursor_without_subscription_is_a_no_op() {
        let ctx = context(&RealtimeHub::new()).await;
        let sent = ctx.send_cursor(
            Uuid::new_v4(),
            CursorUpdate { user_id: Uuid::new_v4(), x: 10.0, y: 20.0, user_name: None },
        );
        assert!(!sent);
        assert!(!ctx.send_notification(
            Uuid::new_v4(),
            NotificationPayload {
                kind: "info".into(),
                title: "t".into(),
                message: "m".into(),
                user_id: Uuid::new_v4(),
                project_id: Uuid::new_v4(),
            },
        ));
    }

    #[tokio::test]
    async fn selection_reaches_other_editors() {
        let hub = RealtimeHub::new();
        let (alice, bob) = (context(&hub).await, context(&hub).await);
        let work_item_id = Uuid::new_v4();
        let config = ChannelConfig::CollaborativeEditing { work_item_id };
        let _a = alice.registry().subscribe(config, |_| {}).unwrap();
        let _b = bob.registry().subscribe(config, |_| {}).unwrap();

        let topic = config.canonical_id();
        for _ in 0..100 {
            if hub.topic_members(&topic).await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let user = Uuid::new_v4();
        assert!(alice.send_selection(
            work_item_id,
            SelectionUpdate {
                user_id: user,
                selection: Selection {
                    element_id: "description".into(),
                    element_type: "field".into(),
                    range: None,
                },
            },
        ));

        for _ in 0..100 {
            if bob.selections().get(user).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            bob.selections().get(user).await.map(|s| s.selection.element_id),
            Some("description".to_string())
        );
        assert!(alice.selections().get(user).await.is_none(), "sender does not receive its own broadcast");
        assert_eq!(alice.shutdown(), 1);
    }
}
