// Realtime transport abstraction.
//
// A transport is an ordered outbound frame queue plus a router that hands each
// inbound frame to the subscription owning its topic. The WebSocket transport
// talks to a relay; the memory transport drives a `RealtimeHub` in process.

pub mod memory;
pub mod ws;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use scrumflow_common::protocol::realtime::RealtimeMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use memory::MemoryTransport;
pub use ws::WsTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("failed to connect to relay: {0}")]
    Connect(String),
    #[error("transport is closed")]
    Closed,
}

pub trait RealtimeTransport: Send + Sync + 'static {
    /// Queue a frame. Frames reach the relay in the order they were queued.
    fn send(&self, frame: RealtimeMessage) -> Result<(), TransportError>;

    fn router(&self) -> &TopicRouter;

    fn is_connected(&self) -> bool;
}

/// Routes inbound frames to per-topic queues.
#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<RealtimeMessage>>>>,
}

impl TopicRouter {
    /// Route `topic` to `sink`, replacing any previous route.
    pub fn insert(&self, topic: &str, sink: mpsc::UnboundedSender<RealtimeMessage>) {
        self.lock().insert(topic.to_string(), sink);
    }

    pub fn remove(&self, topic: &str) -> bool {
        self.lock().remove(topic).is_some()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.lock().contains_key(topic)
    }

    /// Drop every route. Subscription tasks see their queue close and exit.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Hand an inbound frame to its topic's queue. Returns whether it was routed.
    pub fn dispatch(&self, frame: RealtimeMessage) -> bool {
        let Some(topic) = inbound_topic(&frame) else {
            if let RealtimeMessage::Error { code, message, .. } = &frame {
                warn!(code = %code, message = %message, "relay reported an error");
            }
            return false;
        };

        let sink = self.lock().get(topic).cloned();
        match sink {
            Some(sink) => sink.send(frame).is_ok(),
            None => {
                debug!(topic = %topic, kind = frame.kind(), "dropping frame for unrouted topic");
                false
            }
        }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<RealtimeMessage>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn inbound_topic(frame: &RealtimeMessage) -> Option<&str> {
    match frame {
        RealtimeMessage::Joined { topic }
        | RealtimeMessage::Broadcast { topic, .. }
        | RealtimeMessage::PresenceState { topic, .. }
        | RealtimeMessage::PresenceDiff { topic, .. }
        | RealtimeMessage::RowChange { topic, .. } => Some(topic),
        RealtimeMessage::Error { topic, .. } => topic.as_deref(),
        RealtimeMessage::Join { .. }
        | RealtimeMessage::Leave { .. }
        | RealtimeMessage::Track { .. }
        | RealtimeMessage::Untrack { .. } => None,
    }
}
