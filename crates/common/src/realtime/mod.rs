pub mod hub;

pub use hub::{ConnectionId, RealtimeHub};
