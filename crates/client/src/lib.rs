// scrumflow-client: channel subscriptions, ephemeral collaboration caches and
// the session-action client.

pub mod config;
pub mod context;
pub mod cursor;
pub mod notification;
pub mod presence;
pub mod reaper;
pub mod registry;
pub mod session_client;
pub mod transport;

pub use config::ClientConfig;
pub use context::CollaborationContext;
pub use registry::{ChannelEvent, ChannelRegistry, Subscription};
pub use session_client::{ClientError, SessionClient};
pub use transport::{RealtimeTransport, TransportError};
