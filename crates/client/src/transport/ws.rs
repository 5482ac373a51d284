// WebSocket transport to a relay's `/v1/realtime` endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use scrumflow_common::protocol::realtime::{decode_message, encode_message, RealtimeMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{RealtimeTransport, TopicRouter, TransportError};

#[derive(Debug)]
pub struct WsTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<RealtimeMessage>>>,
    router: TopicRouter,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    /// Open the socket and start the reader and writer tasks.
    pub async fn connect(url: &Url) -> Result<Arc<Self>, TransportError> {
        let (stream, _) = connect_async(url.as_str()).await.map_err(|connect_error| {
            error!(url = %url, error = %connect_error, "realtime connection failed");
            TransportError::Connect(connect_error.to_string())
        })?;
        info!(url = %url, "realtime connection established");

        let (mut sink, mut source) = stream.split();
        let (outbound, mut frames) = mpsc::unbounded_channel::<RealtimeMessage>();
        let router = TopicRouter::default();
        let connected = Arc::new(AtomicBool::new(true));

        let writer_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let encoded = match encode_message(&frame) {
                    Ok(encoded) => encoded,
                    Err(encode_error) => {
                        warn!(error = %encode_error, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(send_error) = sink.send(Message::Text(encoded.into())).await {
                    warn!(error = %send_error, "realtime socket write failed");
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
            let _ = sink.close().await;
        });

        let reader_router = router.clone();
        let reader_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => match decode_message(&text) {
                        Ok(frame) => {
                            reader_router.dispatch(frame);
                        }
                        Err(decode_error) => {
                            warn!(error = %decode_error, "undecodable realtime frame");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "relay closed the realtime socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(read_error) => {
                        warn!(error = %read_error, "realtime socket read failed");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            // Closing every route lets subscription tasks finish.
            reader_router.clear();
        });

        Ok(Arc::new(Self { outbound: Mutex::new(Some(outbound)), router, connected }))
    }

    /// Stop sending. The writer flushes queued frames and closes the socket.
    pub fn close(&self) {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl RealtimeTransport for WsTransport {
    fn send(&self, frame: RealtimeMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
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
