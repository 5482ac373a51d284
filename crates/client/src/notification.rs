// Transient notification fan-out. Nothing here is persisted.

use chrono::{DateTime, Utc};
use scrumflow_common::protocol::events::{Notification, NotificationPayload};
use tokio::sync::broadcast;
use tracing::debug;

const LISTENER_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct NotificationRelay {
    listeners: broadcast::Sender<Notification>,
}

impl Default for NotificationRelay {
    fn default() -> Self {
        let (listeners, _) = broadcast::channel(LISTENER_CAPACITY);
        Self { listeners }
    }
}

impl NotificationRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every notification materialized after this call. Slow
    /// listeners lose the oldest entries.
    pub fn listen(&self) -> broadcast::Receiver<Notification> {
        self.listeners.subscribe()
    }

    /// Materialize an incoming payload and hand it to every listener.
    pub fn receive(&self, payload: NotificationPayload, now: DateTime<Utc>) -> Notification {
        let notification = payload.materialize(now);
        let listeners = self.listeners.send(notification.clone()).unwrap_or(0);
        debug!(notification_id = %notification.id, listeners, "notification relayed");
        notification
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn payload() -> NotificationPayload {
        NotificationPayload {
            kind: "sprint_started".into(),
            title: "Sprint 5".into(),
            message: "Sprint 5 has started".into(),
            user_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn listeners_receive_materialized_notifications() {
        let relay = NotificationRelay::new();
        let mut first = relay.listen();
        let mut second = relay.listen();

        let now = Utc::now();
        let notification = relay.receive(payload(), now);

        assert!(!notification.read);
        assert_eq!(notification.created_at, now);
        assert_eq!(first.recv().await.unwrap(), notification);
        assert_eq!(second.recv().await.unwrap().id, notification.id);
    }

    #[test]
    fn receive_without_listeners_still_materializes() {
        let relay = NotificationRelay::new();
        let a = relay.receive(payload(), Utc::now());
        let b = relay.receive(payload(), Utc::now());
        assert_ne!(a.id, b.id);
    }
}
