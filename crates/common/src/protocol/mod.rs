pub mod events;
pub mod realtime;
pub mod rpc;
