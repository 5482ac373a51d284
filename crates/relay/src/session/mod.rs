// Collaborative sessions and presence: services, store and domain errors.

pub mod error;
pub mod presence;
pub mod service;
pub mod store;

pub use error::SessionError;
pub use presence::PresenceService;
pub use service::{CollaborativeSessionService, MAX_PARTICIPANT_UPDATE_ATTEMPTS};
pub use store::CollaborationStore;
