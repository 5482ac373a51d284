// Channel registry: the single entry and exit point for subscriptions.
//
// At most one live subscription exists per canonical channel id. Each
// subscription owns a routing task that drains its topic's inbound frames into
// the local caches and forwards the rest to the caller's callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use scrumflow_common::channel::{ChannelConfig, RowChange};
use scrumflow_common::protocol::events::BroadcastEvent;
use scrumflow_common::protocol::realtime::RealtimeMessage;
use scrumflow_common::types::UserPresence;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cursor::{CursorStore, SelectionStore};
use crate::notification::NotificationRelay;
use crate::presence::PresenceStore;
use crate::transport::{RealtimeTransport, TransportError};

/// What a subscription's callback sees.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A durable row change, or a received notification presented as an
    /// `INSERT` on `notifications`.
    RowChange(RowChange),
    /// Session lifecycle, membership, editing-status and presence broadcasts.
    /// Cursor and selection updates only feed the caches.
    Broadcast(BroadcastEvent),
    Error { code: String, message: String },
}

pub type EventCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Caches the routing tasks write into.
#[derive(Debug, Clone, Default)]
pub struct ChannelSinks {
    pub presence: PresenceStore,
    pub cursors: CursorStore,
    pub selections: SelectionStore,
    pub notifications: NotificationRelay,
}

#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    transport: Arc<dyn RealtimeTransport>,
    sinks: ChannelSinks,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    next_generation: AtomicU64,
}

struct ChannelEntry {
    generation: u64,
    task: JoinHandle<()>,
}

/// Handle to one subscription. Unsubscribing a handle whose channel has since
/// been replaced leaves the replacement alone.
#[must_use = "the channel stays open until `unsubscribe` is called"]
#[derive(Debug, Clone)]
pub struct Subscription {
    registry: Weak<RegistryInner>,
    channel_id: String,
    generation: u64,
}

impl Subscription {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Tear down this subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let mut channels = inner.lock_channels();
        match channels.get(&self.channel_id) {
            Some(entry) if entry.generation == self.generation => {
                if let Some(entry) = channels.remove(&self.channel_id) {
                    inner.teardown(&self.channel_id, entry);
                }
                true
            }
            _ => false,
        }
    }
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn RealtimeTransport>, sinks: ChannelSinks) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                sinks,
                channels: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Open the channel for `config`, replacing any live subscription with the
    /// same canonical id. Open failures are logged and returned; nothing retries.
    pub fn subscribe<F>(&self, config: ChannelConfig, on_event: F) -> Result<Subscription, TransportError>
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        let channel_id = config.canonical_id();
        let inner = &self.inner;
        let mut channels = inner.lock_channels();

        if let Some(previous) = channels.remove(&channel_id) {
            debug!(channel_id = %channel_id, "replacing existing subscription");
            inner.teardown(&channel_id, previous);
        }

        let (sink, frames) = mpsc::unbounded_channel();
        inner.transport.router().insert(&channel_id, sink);
        let join = RealtimeMessage::Join { topic: channel_id.clone(), bindings: config.bindings() };
        if let Err(open_error) = inner.transport.send(join) {
            inner.transport.router().remove(&channel_id);
            error!(channel_id = %channel_id, error = %open_error, "failed to open channel");
            return Err(open_error);
        }

        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(route_channel(
            inner.sinks.clone(),
            frames,
            Arc::new(on_event),
            channel_id.clone(),
        ));
        channels.insert(channel_id.clone(), ChannelEntry { generation, task });
        info!(channel_id = %channel_id, kind = config.kind().as_str(), "channel subscribed");

        Ok(Subscription { registry: Arc::downgrade(inner), channel_id, generation })
    }

    pub fn is_subscribed(&self, channel_id: &str) -> bool {
        self.inner.lock_channels().contains_key(channel_id)
    }

    /// Subscribed and the transport is still connected, so leaves on this
    /// channel will arrive.
    pub fn is_live(&self, channel_id: &str) -> bool {
        self.inner.transport.is_connected() && self.is_subscribed(channel_id)
    }

    /// Canonical ids of every live subscription, sorted.
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock_channels().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tear down every subscription. Returns how many were open.
    pub fn unsubscribe_all(&self) -> usize {
        let mut channels = self.inner.lock_channels();
        let count = channels.len();
        for (channel_id, entry) in channels.drain() {
            self.inner.teardown(&channel_id, entry);
        }
        count
    }

    /// Broadcast on an open channel. A channel that is not open is skipped
    /// without error; returns whether the event was queued.
    pub fn broadcast(&self, config: &ChannelConfig, event: BroadcastEvent) -> bool {
        let topic = config.canonical_id();
        if !self.is_subscribed(&topic) {
            debug!(channel_id = %topic, event = event.name(), "channel not open; broadcast skipped");
            return false;
        }
        let event_name = event.name();
        match self.inner.transport.send(RealtimeMessage::Broadcast { topic: topic.clone(), event }) {
            Ok(()) => true,
            Err(send_error) => {
                warn!(channel_id = %topic, event = event_name, error = %send_error, "broadcast failed");
                false
            }
        }
    }

    /// Announce the local user's presence on an open channel.
    pub fn track(&self, config: &ChannelConfig, presence: UserPresence) -> bool {
        let topic = config.canonical_id();
        if !self.is_subscribed(&topic) {
            return false;
        }
        match self.inner.transport.send(RealtimeMessage::Track { topic: topic.clone(), presence }) {
            Ok(()) => true,
            Err(send_error) => {
                warn!(channel_id = %topic, error = %send_error, "presence track failed");
                false
            }
        }
    }

    pub fn untrack(&self, config: &ChannelConfig) -> bool {
        let topic = config.canonical_id();
        if !self.is_subscribed(&topic) {
            return false;
        }
        self.inner.transport.send(RealtimeMessage::Untrack { topic }).is_ok()
    }

    pub fn sinks(&self) -> &ChannelSinks {
        &self.inner.sinks
    }
}

impl RegistryInner {
    fn lock_channels(&self) -> MutexGuard<'_, HashMap<String, ChannelEntry>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self, channel_id: &str, entry: ChannelEntry) {
        entry.task.abort();
        self.transport.router().remove(channel_id);
        if let Err(leave_error) =
            self.transport.send(RealtimeMessage::Leave { topic: channel_id.to_string() })
        {
            debug!(channel_id = %channel_id, error = %leave_error, "leave not sent");
        }
        info!(channel_id = %channel_id, "channel unsubscribed");
    }
}

async fn route_channel(
    sinks: ChannelSinks,
    mut frames: mpsc::UnboundedReceiver<RealtimeMessage>,
    on_event: EventCallback,
    channel_id: String,
) {
    while let Some(frame) = frames.recv().await {
        let now = Utc::now();
        match frame {
            RealtimeMessage::Joined { .. } => debug!(channel_id = %channel_id, "channel joined"),
            RealtimeMessage::PresenceState { state, .. } => {
                sinks.presence.apply_sync(&channel_id, &state, now).await;
            }
            RealtimeMessage::PresenceDiff { joins, leaves, .. } => {
                for (user_id, presences) in &joins {
                    sinks.presence.apply_join(&channel_id, *user_id, presences, now).await;
                }
                for user_id in leaves.keys() {
                    sinks.presence.apply_leave(*user_id).await;
                }
            }
            RealtimeMessage::RowChange { change, .. } => on_event(ChannelEvent::RowChange(change)),
            RealtimeMessage::Broadcast { event, .. } => match event {
                BroadcastEvent::CursorUpdate(update) => {
                    sinks.cursors.apply_cursor_update(update, now).await;
                }
                BroadcastEvent::SelectionUpdate(update) => {
                    sinks.selections.apply_selection_update(update, now).await;
                }
                BroadcastEvent::Notification(payload) => {
                    let notification = sinks.notifications.receive(payload, now);
                    on_event(ChannelEvent::RowChange(notification.into_row_change()));
                }
                other => on_event(ChannelEvent::Broadcast(other)),
            },
            RealtimeMessage::Error { code, message, .. } => {
                warn!(channel_id = %channel_id, code = %code, message = %message, "channel error");
                on_event(ChannelEvent::Error { code, message });
            }
            RealtimeMessage::Join { .. }
            | RealtimeMessage::Leave { .. }
            | RealtimeMessage::Track { .. }
            | RealtimeMessage::Untrack { .. } => {}
        }
    }
    debug!(channel_id = %channel_id, "channel routing finished");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use scrumflow_common::channel::RowChangeKind;
    use scrumflow_common::protocol::events::{CursorUpdate, MembershipChange, NotificationPayload};
    use scrumflow_common::realtime::RealtimeHub;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::transport::MemoryTransport;

    async fn registry(hub: &RealtimeHub) -> ChannelRegistry {
        let transport = MemoryTransport::connect(hub.clone()).await;
        ChannelRegistry::new(transport, ChannelSinks::default())
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn collector() -> (Arc<Mutex<Vec<ChannelEvent>>>, impl Fn(ChannelEvent) + Send + Sync + 'static) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |event| sink.lock().unwrap().push(event))
    }

    #[tokio::test]
    async fn resubscribing_same_channel_keeps_one_live_subscription() {
        let hub = RealtimeHub::new();
        let registry = registry(&hub).await;
        let project_id = Uuid::new_v4();

        let first = registry.subscribe(ChannelConfig::ProjectUpdates { project_id }, |_| {}).unwrap();
        let second = registry.subscribe(ChannelConfig::ProjectUpdates { project_id }, |_| {}).unwrap();

        assert_eq!(first.channel_id(), second.channel_id());
        assert_eq!(registry.channel_ids(), vec![format!("project_updates_{project_id}")]);
        eventually(|| async { hub.topic_members(second.channel_id()).await == 1 }).await;
    }

    #[tokio::test]
    async fn stale_handle_does_not_tear_down_replacement() {
        let hub = RealtimeHub::new();
        let registry = registry(&hub).await;
        let config = ChannelConfig::CursorTracking { project_id: Uuid::new_v4() };

        let stale = registry.subscribe(config, |_| {}).unwrap();
        let current = registry.subscribe(config, |_| {}).unwrap();

        assert!(!stale.unsubscribe());
        assert!(!stale.unsubscribe());
        assert!(registry.is_subscribed(current.channel_id()));

        assert!(current.unsubscribe());
        assert!(!current.unsubscribe());
        assert!(registry.channel_ids().is_empty());
        eventually(|| async { hub.topic_members(current.channel_id()).await == 0 }).await;
    }

    #[tokio::test]
    async fn broadcast_without_open_channel_is_a_no_op() {
        let hub = RealtimeHub::new();
        let registry = registry(&hub).await;
        let sent = registry.broadcast(
            &ChannelConfig::CursorTracking { project_id: Uuid::new_v4() },
            BroadcastEvent::CursorUpdate(CursorUpdate {
                user_id: Uuid::new_v4(),
                x: 10.0,
                y: 20.0,
                user_name: None,
            }),
        );
        assert!(!sent);
    }

    #[tokio::test]
    async fn inbound_events_feed_caches_and_callback() {
        let hub = RealtimeHub::new();
        let registry = registry(&hub).await;
        let project_id = Uuid::new_v4();
        let (events, on_event) = collector();

        let notifications = registry.subscribe(ChannelConfig::Notifications { project_id }, on_event).unwrap();
        let cursors = registry.subscribe(ChannelConfig::CursorTracking { project_id }, |_| {}).unwrap();
        eventually(|| async { hub.topic_members(notifications.channel_id()).await == 1 }).await;
        eventually(|| async { hub.topic_members(cursors.channel_id()).await == 1 }).await;

        let user = Uuid::new_v4();
        hub.broadcast(
            None,
            cursors.channel_id(),
            BroadcastEvent::CursorUpdate(CursorUpdate { user_id: user, x: 3.0, y: 4.0, user_name: None }),
        )
        .await;
        hub.broadcast(
            None,
            notifications.channel_id(),
            BroadcastEvent::Notification(NotificationPayload {
                kind: "mention".into(),
                title: "Mentioned".into(),
                message: "You were mentioned".into(),
                user_id: user,
                project_id,
            }),
        )
        .await;
        hub.broadcast(
            None,
            notifications.channel_id(),
            BroadcastEvent::UserJoined(MembershipChange { user_id: user, session_id: None }),
        )
        .await;

        let sinks = registry.sinks().clone();
        eventually(|| {
            let sinks = sinks.clone();
            async move { sinks.cursors.get(user).await.is_some() }
        })
        .await;
        eventually(|| async { events.lock().unwrap().len() == 2 }).await;

        let events = events.lock().unwrap().clone();
        match &events[0] {
            ChannelEvent::RowChange(change) => {
                assert_eq!(change.table, "notifications");
                assert_eq!(change.event_type, RowChangeKind::Insert);
                assert_eq!(change.new.as_ref().unwrap()["read"], json!(false));
            }
            other => panic!("expected notification row change, got {other:?}"),
        }
        assert!(matches!(events[1], ChannelEvent::Broadcast(BroadcastEvent::UserJoined(_))));
    }

    #[tokio::test]
    async fn presence_diffs_reconcile_the_presence_store() {
        let hub = RealtimeHub::new();
        let watcher = registry(&hub).await;
        let project_id = Uuid::new_v4();
        let config = ChannelConfig::ProjectUpdates { project_id };
        let _watching = watcher.subscribe(config, |_| {}).unwrap();

        let other_transport = MemoryTransport::connect(hub.clone()).await;
        let other = ChannelRegistry::new(other_transport.clone(), ChannelSinks::default());
        let other_sub = other.subscribe(config, |_| {}).unwrap();
        let user = Uuid::new_v4();
        assert!(other.track(
            &config,
            UserPresence {
                user_id: user,
                user_name: "Bo".into(),
                status: Default::default(),
                last_seen: Utc::now(),
                project_id: Some(project_id),
                current_page: None,
                cursor: None,
                selection: None,
            },
        ));

        let presence = watcher.sinks().presence.clone();
        eventually(|| {
            let presence = presence.clone();
            async move { presence.get(user).await.is_some() }
        })
        .await;

        assert!(other_sub.unsubscribe());
        eventually(|| {
            let presence = presence.clone();
            async move { presence.get(user).await.is_none() }
        })
        .await;
    }

    #[tokio::test]
    async fn subscribe_on_closed_transport_fails() {
        let hub = RealtimeHub::new();
        let transport = MemoryTransport::connect(hub).await;
        transport.close();
        let registry = ChannelRegistry::new(transport, ChannelSinks::default());

        let result = registry.subscribe(ChannelConfig::Session { session_id: Uuid::new_v4() }, |_| {});
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(registry.channel_ids().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_every_channel() {
        let hub = RealtimeHub::new();
        let registry = registry(&hub).await;
        let project_id = Uuid::new_v4();
        let _a = registry.subscribe(ChannelConfig::ProjectUpdates { project_id }, |_| {}).unwrap();
        let _b = registry
            .subscribe(ChannelConfig::SprintUpdates { project_id, sprint_id: None }, |_| {})
            .unwrap();

        assert_eq!(registry.unsubscribe_all(), 2);
        assert!(registry.channel_ids().is_empty());
        assert_eq!(registry.unsubscribe_all(), 0);
    }
}
