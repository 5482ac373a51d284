// scrumflow-common: shared types, channel routing and the realtime hub

pub mod channel;
pub mod protocol;
pub mod realtime;
pub mod types;
