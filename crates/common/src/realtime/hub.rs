// In-process topic hub: membership, broadcast fan-out, presence tracking and
// row-change delivery.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::channel::{ChannelBindings, RowChange};
use crate::protocol::events::BroadcastEvent;
use crate::protocol::realtime::{PresenceState, RealtimeMessage};
use crate::types::UserPresence;

pub type ConnectionId = Uuid;

/// Fan-out hub shared by every connection of a relay process.
///
/// Delivery is best-effort and at-most-once: a message is handed to each
/// recipient's outbound queue and the hub forgets it.
#[derive(Debug, Clone, Default)]
pub struct RealtimeHub {
    state: Arc<RwLock<HubState>>,
}

#[derive(Debug, Default)]
struct HubState {
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<RealtimeMessage>>,
    topics: HashMap<String, TopicState>,
}

#[derive(Debug, Default)]
struct TopicState {
    members: HashMap<ConnectionId, ChannelBindings>,
    presences: HashMap<ConnectionId, UserPresence>,
}

impl TopicState {
    fn presence_state(&self) -> PresenceState {
        let mut state = PresenceState::new();
        for presence in self.presences.values() {
            state.entry(presence.user_id).or_default().push(presence.clone());
        }
        state
    }

    fn user_still_present(&self, user_id: Uuid) -> bool {
        self.presences.values().any(|presence| presence.user_id == user_id)
    }

    fn presence_recipients(
        &self,
        connections: &HashMap<ConnectionId, mpsc::UnboundedSender<RealtimeMessage>>,
    ) -> Vec<mpsc::UnboundedSender<RealtimeMessage>> {
        self.members
            .iter()
            .filter(|(_, bindings)| bindings.presence)
            .filter_map(|(connection_id, _)| connections.get(connection_id).cloned())
            .collect()
    }
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its outbound queue.
    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<RealtimeMessage>) {
        let connection_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.write().await.connections.insert(connection_id, sender);
        (connection_id, receiver)
    }

    /// Drop a connection, its memberships and any presence it tracked.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let mut outbound = Vec::new();
        {
            let mut guard = self.state.write().await;
            guard.connections.remove(&connection_id);

            let HubState { connections, topics } = &mut *guard;
            topics.retain(|topic, state| {
                state.members.remove(&connection_id);
                if let Some(diff) = remove_presence(topic, state, connection_id) {
                    for recipient in state.presence_recipients(connections) {
                        outbound.push((recipient, diff.clone()));
                    }
                }
                !state.members.is_empty()
            });
        }
        deliver(outbound);
    }

    /// Add (or re-bind) a connection to a topic.
    ///
    /// Returns `false` if the connection is unknown.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        topic: &str,
        bindings: ChannelBindings,
    ) -> bool {
        let mut guard = self.state.write().await;
        let Some(sender) = guard.connections.get(&connection_id).cloned() else {
            return false;
        };

        let state = guard.topics.entry(topic.to_string()).or_default();
        state.members.insert(connection_id, bindings);
        let snapshot = bindings.presence.then(|| state.presence_state());
        drop(guard);

        let _ = sender.send(RealtimeMessage::Joined { topic: topic.to_string() });
        if let Some(state) = snapshot {
            let _ = sender.send(RealtimeMessage::PresenceState { topic: topic.to_string(), state });
        }
        true
    }

    /// Remove a connection from a topic. Leaving a topic never joined is a no-op.
    pub async fn leave(&self, connection_id: ConnectionId, topic: &str) -> bool {
        let mut outbound = Vec::new();
        let was_member = {
            let mut guard = self.state.write().await;
            let HubState { connections, topics } = &mut *guard;
            let Some(state) = topics.get_mut(topic) else {
                return false;
            };

            let was_member = state.members.remove(&connection_id).is_some();
            if let Some(diff) = remove_presence(topic, state, connection_id) {
                for recipient in state.presence_recipients(connections) {
                    outbound.push((recipient, diff.clone()));
                }
            }
            if state.members.is_empty() {
                topics.remove(topic);
            }
            was_member
        };
        deliver(outbound);
        was_member
    }

    /// Fan an event out to every broadcast member of `topic` except `sender`.
    ///
    /// Returns how many outbound queues accepted the message.
    pub async fn broadcast(
        &self,
        sender: Option<ConnectionId>,
        topic: &str,
        event: BroadcastEvent,
    ) -> usize {
        let recipients: Vec<_> = {
            let guard = self.state.read().await;
            let Some(state) = guard.topics.get(topic) else {
                return 0;
            };
            state
                .members
                .iter()
                .filter(|(connection_id, bindings)| {
                    bindings.broadcast && Some(**connection_id) != sender
                })
                .filter_map(|(connection_id, _)| guard.connections.get(connection_id).cloned())
                .collect()
        };

        let message = RealtimeMessage::Broadcast { topic: topic.to_string(), event };
        let mut sent_count = 0;
        for recipient in recipients {
            if recipient.send(message.clone()).is_ok() {
                sent_count += 1;
            }
        }
        sent_count
    }

    /// Record a connection's presence on a topic it has joined and announce it
    /// to every presence member, the tracker included.
    pub async fn track(
        &self,
        connection_id: ConnectionId,
        topic: &str,
        presence: UserPresence,
    ) -> bool {
        let outbound = {
            let mut guard = self.state.write().await;
            let HubState { connections, topics } = &mut *guard;
            let Some(state) = topics.get_mut(topic) else {
                return false;
            };
            if !state.members.contains_key(&connection_id) {
                return false;
            }

            let mut joins = PresenceState::new();
            joins.insert(presence.user_id, vec![presence.clone()]);
            state.presences.insert(connection_id, presence);

            let diff = RealtimeMessage::PresenceDiff {
                topic: topic.to_string(),
                joins,
                leaves: PresenceState::new(),
            };
            state
                .presence_recipients(connections)
                .into_iter()
                .map(|recipient| (recipient, diff.clone()))
                .collect::<Vec<_>>()
        };
        deliver(outbound);
        true
    }

    /// Withdraw a connection's presence from a topic without leaving it.
    pub async fn untrack(&self, connection_id: ConnectionId, topic: &str) -> bool {
        let mut outbound = Vec::new();
        let removed = {
            let mut guard = self.state.write().await;
            let HubState { connections, topics } = &mut *guard;
            let Some(state) = topics.get_mut(topic) else {
                return false;
            };
            let had_presence = state.presences.contains_key(&connection_id);
            if let Some(diff) = remove_presence(topic, state, connection_id) {
                for recipient in state.presence_recipients(connections) {
                    outbound.push((recipient, diff.clone()));
                }
            }
            had_presence
        };
        deliver(outbound);
        removed
    }

    /// Deliver a row change to every row-change member of each topic it routes to.
    pub async fn publish_row_change(&self, change: &RowChange) -> usize {
        let topics = change.topics();
        let mut outbound = Vec::new();
        {
            let guard = self.state.read().await;
            for topic in topics {
                let Some(state) = guard.topics.get(&topic) else {
                    continue;
                };
                let message = RealtimeMessage::RowChange { topic: topic.clone(), change: change.clone() };
                for (connection_id, bindings) in &state.members {
                    if !bindings.row_changes {
                        continue;
                    }
                    if let Some(sender) = guard.connections.get(connection_id) {
                        outbound.push((sender.clone(), message.clone()));
                    }
                }
            }
        }
        deliver(outbound)
    }

    /// Current presence snapshot of a topic.
    pub async fn presence_state(&self, topic: &str) -> PresenceState {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .map(TopicState::presence_state)
            .unwrap_or_default()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn topic_members(&self, topic: &str) -> usize {
        self.state.read().await.topics.get(topic).map(|state| state.members.len()).unwrap_or(0)
    }

    pub async fn is_member(&self, connection_id: ConnectionId, topic: &str) -> bool {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .is_some_and(|state| state.members.contains_key(&connection_id))
    }
}

/// Drop a connection's presence and build the diff to announce, if any.
///
/// A user only appears in `leaves` once their last presence on the topic is
/// gone, so clients keyed by user id never drop a user who is still present
/// through another connection.
fn remove_presence(
    topic: &str,
    state: &mut TopicState,
    connection_id: ConnectionId,
) -> Option<RealtimeMessage> {
    let presence = state.presences.remove(&connection_id)?;
    if state.user_still_present(presence.user_id) {
        return None;
    }
    let mut leaves = PresenceState::new();
    leaves.insert(presence.user_id, vec![presence]);
    Some(RealtimeMessage::PresenceDiff {
        topic: topic.to_string(),
        joins: PresenceState::new(),
        leaves,
    })
}

fn deliver(outbound: Vec<(mpsc::UnboundedSender<RealtimeMessage>, RealtimeMessage)>) -> usize {
    let mut sent_count = 0;
    for (recipient, message) in outbound {
        if recipient.send(message).is_ok() {
            sent_count += 1;
        }
    }
    sent_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RowChangeKind;
    use crate::protocol::events::CursorUpdate;
    use crate::types::PresenceUpdate;
    use chrono::Utc;
    use serde_json::json;

    const ALL: ChannelBindings = ChannelBindings { row_changes: true, broadcast: true, presence: true };
    const BROADCAST_ONLY: ChannelBindings =
        ChannelBindings { row_changes: false, broadcast: true, presence: false };

    fn drain(receiver: &mut mpsc::UnboundedReceiver<RealtimeMessage>) -> Vec<RealtimeMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn presence(user_id: Uuid, name: &str) -> UserPresence {
        UserPresence::from_update(
            user_id,
            PresenceUpdate { user_name: Some(name.into()), ..Default::default() },
            None,
            Utc::now(),
        )
    }

    fn cursor(user_id: Uuid) -> BroadcastEvent {
        BroadcastEvent::CursorUpdate(CursorUpdate { user_id, x: 1.0, y: 2.0, user_name: None })
    }

    #[tokio::test]
    async fn join_confirms_and_sends_presence_snapshot_when_bound() {
        let hub = RealtimeHub::new();
        let (conn, mut rx) = hub.connect().await;

        assert!(hub.join(conn, "session_a", ALL).await);
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], RealtimeMessage::Joined { topic: "session_a".into() });
        assert!(matches!(&messages[1], RealtimeMessage::PresenceState { state, .. } if state.is_empty()));

        assert!(hub.join(conn, "cursor_tracking_p", BROADCAST_ONLY).await);
        let messages = drain(&mut rx);
        assert_eq!(messages, vec![RealtimeMessage::Joined { topic: "cursor_tracking_p".into() }]);
    }

    #[tokio::test]
    async fn join_with_unknown_connection_is_rejected() {
        let hub = RealtimeHub::new();
        assert!(!hub.join(Uuid::new_v4(), "session_a", ALL).await);
        assert_eq!(hub.topic_members("session_a").await, 0);
    }

    #[tokio::test]
    async fn broadcast_excludes_sender_and_non_broadcast_members() {
        let hub = RealtimeHub::new();
        let (alice, mut alice_rx) = hub.connect().await;
        let (bob, mut bob_rx) = hub.connect().await;
        let (carol, mut carol_rx) = hub.connect().await;
        hub.join(alice, "t", BROADCAST_ONLY).await;
        hub.join(bob, "t", BROADCAST_ONLY).await;
        hub.join(carol, "t", ChannelBindings { row_changes: true, ..Default::default() }).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        drain(&mut carol_rx);

        let delivered = hub.broadcast(Some(alice), "t", cursor(Uuid::nil())).await;
        assert_eq!(delivered, 1);
        assert!(drain(&mut alice_rx).is_empty());
        assert!(drain(&mut carol_rx).is_empty());
        let bob_messages = drain(&mut bob_rx);
        assert!(matches!(&bob_messages[..], [RealtimeMessage::Broadcast { topic, .. }] if topic == "t"));
    }

    #[tokio::test]
    async fn broadcast_to_topic_without_members_is_a_no_op() {
        let hub = RealtimeHub::new();
        assert_eq!(hub.broadcast(None, "cursor_tracking_nobody", cursor(Uuid::nil())).await, 0);
    }

    #[tokio::test]
    async fn track_announces_join_to_every_presence_member() {
        let hub = RealtimeHub::new();
        let user = Uuid::new_v4();
        let (alice, mut alice_rx) = hub.connect().await;
        let (bob, mut bob_rx) = hub.connect().await;
        hub.join(alice, "session_s", ALL).await;
        hub.join(bob, "session_s", ALL).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        assert!(hub.track(alice, "session_s", presence(user, "Alice")).await);

        for messages in [drain(&mut alice_rx), drain(&mut bob_rx)] {
            let [RealtimeMessage::PresenceDiff { joins, leaves, .. }] = &messages[..] else {
                panic!("expected one presence diff, got {messages:?}");
            };
            assert!(leaves.is_empty());
            assert_eq!(joins[&user][0].user_name, "Alice");
        }
        assert_eq!(hub.presence_state("session_s").await[&user].len(), 1);
    }

    #[tokio::test]
    async fn track_requires_membership() {
        let hub = RealtimeHub::new();
        let (conn, _rx) = hub.connect().await;
        assert!(!hub.track(conn, "session_s", presence(Uuid::new_v4(), "A")).await);
    }

    #[tokio::test]
    async fn disconnect_announces_leave_and_drops_empty_topics() {
        let hub = RealtimeHub::new();
        let user = Uuid::new_v4();
        let (alice, _alice_rx) = hub.connect().await;
        let (bob, mut bob_rx) = hub.connect().await;
        hub.join(alice, "session_s", ALL).await;
        hub.join(bob, "session_s", ALL).await;
        hub.join(alice, "solo", BROADCAST_ONLY).await;
        hub.track(alice, "session_s", presence(user, "Alice")).await;
        drain(&mut bob_rx);

        hub.disconnect(alice).await;

        let messages = drain(&mut bob_rx);
        let [RealtimeMessage::PresenceDiff { leaves, joins, .. }] = &messages[..] else {
            panic!("expected one presence diff, got {messages:?}");
        };
        assert!(joins.is_empty());
        assert!(leaves.contains_key(&user));
        assert_eq!(hub.topic_members("solo").await, 0);
        assert_eq!(hub.topic_members("session_s").await, 1);
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn leave_is_withheld_while_user_present_on_another_connection() {
        let hub = RealtimeHub::new();
        let user = Uuid::new_v4();
        let (tab_one, _rx1) = hub.connect().await;
        let (tab_two, _rx2) = hub.connect().await;
        let (observer, mut observer_rx) = hub.connect().await;
        for conn in [tab_one, tab_two, observer] {
            hub.join(conn, "session_s", ALL).await;
        }
        hub.track(tab_one, "session_s", presence(user, "Ada")).await;
        hub.track(tab_two, "session_s", presence(user, "Ada")).await;
        drain(&mut observer_rx);

        assert!(hub.untrack(tab_one, "session_s").await);
        assert!(drain(&mut observer_rx).is_empty());

        assert!(hub.leave(tab_two, "session_s").await);
        let messages = drain(&mut observer_rx);
        assert!(matches!(
            &messages[..],
            [RealtimeMessage::PresenceDiff { leaves, .. }] if leaves.contains_key(&user)
        ));
    }

    #[tokio::test]
    async fn leave_of_unjoined_topic_is_a_no_op() {
        let hub = RealtimeHub::new();
        let (conn, _rx) = hub.connect().await;
        assert!(!hub.leave(conn, "never_joined").await);
    }

    #[tokio::test]
    async fn membership_follows_join_and_leave() {
        let hub = RealtimeHub::new();
        let (conn, _rx) = hub.connect().await;
        assert!(!hub.is_member(conn, "cursor_tracking_p").await);
        hub.join(conn, "cursor_tracking_p", BROADCAST_ONLY).await;
        assert!(hub.is_member(conn, "cursor_tracking_p").await);
        hub.leave(conn, "cursor_tracking_p").await;
        assert!(!hub.is_member(conn, "cursor_tracking_p").await);
    }

    #[tokio::test]
    async fn row_changes_reach_only_row_change_members() {
        let hub = RealtimeHub::new();
        let project = Uuid::new_v4();
        let topic = format!("project_updates_{project}");
        let (listener, mut listener_rx) = hub.connect().await;
        let (chatter, mut chatter_rx) = hub.connect().await;
        hub.join(listener, &topic, ALL).await;
        hub.join(chatter, &topic, BROADCAST_ONLY).await;
        drain(&mut listener_rx);
        drain(&mut chatter_rx);

        let change = RowChange {
            table: "projects".into(),
            event_type: RowChangeKind::Update,
            new: Some(json!({ "id": project.to_string(), "name": "Apollo" })),
            old: None,
        };
        assert_eq!(hub.publish_row_change(&change).await, 1);

        let messages = drain(&mut listener_rx);
        assert!(matches!(&messages[..], [RealtimeMessage::RowChange { change: c, .. }] if c == &change));
        assert!(drain(&mut chatter_rx).is_empty());
    }
}
