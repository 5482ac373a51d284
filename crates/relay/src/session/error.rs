use thiserror::Error;

use crate::error::{ErrorCode, RelayError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),
    #[error("session not found")]
    NotFound,
    #[error("only the session creator can end a session")]
    Forbidden,
    #[error("session has ended")]
    Ended,
    #[error("the session creator cannot leave an active session; end it instead")]
    CreatorCannotLeave,
    #[error("session participants changed concurrently; retry the request")]
    Conflict,
    #[error("collaboration store failure")]
    Persistence(#[source] anyhow::Error),
}

/// A stored record that does not round-trip through JSON is a store failure.
impl From<serde_json::Error> for SessionError {
    fn from(error: serde_json::Error) -> Self {
        Self::Persistence(anyhow::Error::new(error).context("collaboration record is not valid JSON"))
    }
}

impl SessionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::NotFound => ErrorCode::NotFound,
            Self::Forbidden => ErrorCode::AuthForbidden,
            Self::Ended => ErrorCode::SessionEnded,
            Self::CreatorCannotLeave => ErrorCode::CreatorCannotLeave,
            Self::Conflict => ErrorCode::ParticipantsConflict,
            Self::Persistence(_) => ErrorCode::PersistenceFailed,
        }
    }

    /// Label used for the per-action outcome metric.
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Ended => "ended",
            Self::CreatorCannotLeave => "creator_cannot_leave",
            Self::Conflict => "conflict",
            Self::Persistence(_) => "error",
        }
    }
}

impl From<SessionError> for RelayError {
    fn from(error: SessionError) -> Self {
        let code = error.code();
        match error {
            SessionError::Persistence(source) => {
                tracing::error!(error = ?source, "collaboration store failure");
                RelayError::from_code(code).with_details(format!("{source:#}"))
            }
            other => RelayError::new(code, other.to_string()),
        }
    }
}
