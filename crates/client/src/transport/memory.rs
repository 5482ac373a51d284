// In-process transport over a shared `RealtimeHub`.
//
// Frames are applied to the hub by one task in queue order, so the transport
// observes the same ordering a relay socket would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use scrumflow_common::protocol::realtime::RealtimeMessage;
use scrumflow_common::realtime::{ConnectionId, RealtimeHub};
use tokio::sync::mpsc;
use tracing::debug;

use super::{RealtimeTransport, TopicRouter, TransportError};

const NOT_JOINED: &str = "REALTIME_NOT_JOINED";

#[derive(Debug)]
pub struct MemoryTransport {
    connection_id: ConnectionId,
    outbound: Mutex<Option<mpsc::UnboundedSender<RealtimeMessage>>>,
    router: TopicRouter,
    connected: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub async fn connect(hub: RealtimeHub) -> Arc<Self> {
        let (connection_id, mut inbound) = hub.connect().await;
        let (outbound, mut frames) = mpsc::unbounded_channel::<RealtimeMessage>();
        let router = TopicRouter::default();
        let connected = Arc::new(AtomicBool::new(true));

        let inbound_router = router.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                inbound_router.dispatch(frame);
            }
        });

        let apply_router = router.clone();
        let apply_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                apply_frame(&hub, connection_id, &apply_router, frame).await;
            }
            apply_connected.store(false, Ordering::SeqCst);
            hub.disconnect(connection_id).await;
            debug!(connection_id = %connection_id, "memory transport closed");
        });

        Arc::new(Self { connection_id, outbound: Mutex::new(Some(outbound)), router, connected })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Stop accepting frames. Already-queued frames are still applied before
    /// the hub connection is dropped.
    pub fn close(&self) {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl RealtimeTransport for MemoryTransport {
    fn send(&self, frame: RealtimeMessage) -> Result<(), TransportError> {
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(TransportError::Closed)?;
        sender.send(frame).map_err(|_| TransportError::Closed)
    }

    fn router(&self) -> &TopicRouter {
        &self.router
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn apply_frame(
    hub: &RealtimeHub,
    connection_id: ConnectionId,
    router: &TopicRouter,
    frame: RealtimeMessage,
) {
    match frame {
        RealtimeMessage::Join { topic, bindings } => {
            hub.join(connection_id, &topic, bindings).await;
        }
        RealtimeMessage::Leave { topic } => {
            hub.leave(connection_id, &topic).await;
        }
        RealtimeMessage::Broadcast { topic, event } => {
            if hub.is_member(connection_id, &topic).await {
                hub.broadcast(Some(connection_id), &topic, event).await;
            } else {
                router.dispatch(not_joined(topic));
            }
        }
        RealtimeMessage::Track { topic, presence } => {
            if !hub.track(connection_id, &topic, presence).await {
                router.dispatch(not_joined(topic));
            }
        }
        RealtimeMessage::Untrack { topic } => {
            hub.untrack(connection_id, &topic).await;
        }
        other => debug!(kind = other.kind(), "ignoring server-only frame"),
    }
}

fn not_joined(topic: String) -> RealtimeMessage {
    RealtimeMessage::error(NOT_JOINED, format!("join {topic} before using it"), Some(topic))
}
