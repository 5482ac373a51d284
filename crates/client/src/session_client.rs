// HTTP client for the session-action endpoint.

use reqwest::StatusCode;
use scrumflow_common::protocol::rpc::{
    BroadcastReceipt, CreateSessionData, CursorData, RpcErrorBody, RpcSuccess, SelectionData,
    SessionAction,
};
use scrumflow_common::types::{
    CollaborativeSession, PresenceUpdate, Selection, SessionInfo, SessionType, UserPresence,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Url(#[from] TransportError),
    #[error("session request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay rejected {action} ({status}): {message}")]
    Rejected {
        action: &'static str,
        status: u16,
        code: Option<String>,
        message: String,
        retryable: bool,
    },
    #[error("unexpected response to {action}: {source}")]
    Decode {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientError {
    /// The relay's error code, when it sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl SessionClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self { http: reqwest::Client::new(), endpoint: config.rpc_url()? })
    }

    pub async fn create_session(
        &self,
        project_id: Uuid,
        work_item_id: Option<Uuid>,
        session_type: SessionType,
        user_id: Uuid,
        metadata: Option<Map<String, Value>>,
    ) -> Result<CollaborativeSession, ClientError> {
        self.call(SessionAction::CreateSession {
            project_id,
            work_item_id,
            user_id,
            data: CreateSessionData { session_type, metadata },
        })
        .await
    }

    pub async fn join_session(&self, session_id: Uuid, user_id: Uuid) -> Result<CollaborativeSession, ClientError> {
        self.call(SessionAction::JoinSession { session_id, user_id }).await
    }

    pub async fn leave_session(&self, session_id: Uuid, user_id: Uuid) -> Result<CollaborativeSession, ClientError> {
        self.call(SessionAction::LeaveSession { session_id, user_id }).await
    }

    pub async fn end_session(&self, session_id: Uuid, user_id: Uuid) -> Result<CollaborativeSession, ClientError> {
        self.call(SessionAction::EndSession { session_id, user_id }).await
    }

    pub async fn session_info(&self, session_id: Uuid) -> Result<SessionInfo, ClientError> {
        self.call(SessionAction::GetSessionInfo { session_id }).await
    }

    pub async fn update_presence(
        &self,
        user_id: Uuid,
        project_id: Option<Uuid>,
        update: PresenceUpdate,
    ) -> Result<UserPresence, ClientError> {
        self.call(SessionAction::UpdatePresence { user_id, project_id, data: update }).await
    }

    pub async fn active_users(&self, project_id: Uuid) -> Result<Vec<UserPresence>, ClientError> {
        self.call(SessionAction::GetActiveUsers { project_id }).await
    }

    pub async fn send_cursor(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        cursor: CursorData,
    ) -> Result<BroadcastReceipt, ClientError> {
        self.call(SessionAction::SendCursor { project_id, user_id, data: cursor }).await
    }

    pub async fn send_selection(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        selection: Selection,
    ) -> Result<BroadcastReceipt, ClientError> {
        self.call(SessionAction::SendSelection {
            session_id,
            user_id,
            data: SelectionData { selection },
        })
        .await
    }

    async fn call<T: DeserializeOwned>(&self, action: SessionAction) -> Result<T, ClientError> {
        let name = action.name();
        let response = self.http.post(self.endpoint.clone()).json(&action).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        debug!(action = name, status = status.as_u16(), "session action answered");
        decode_response(name, status, &body)
    }
}

fn decode_response<T: DeserializeOwned>(
    action: &'static str,
    status: StatusCode,
    body: &[u8],
) -> Result<T, ClientError> {
    if status.is_success() {
        let envelope: RpcSuccess<T> = serde_json::from_slice(body)
            .map_err(|source| ClientError::Decode { action, source })?;
        return Ok(envelope.data);
    }

    let rejection = match serde_json::from_slice::<RpcErrorBody>(body) {
        Ok(error_body) => ClientError::Rejected {
            action,
            status: status.as_u16(),
            code: error_body.code,
            message: error_body.error,
            retryable: error_body.retryable,
        },
        Err(_) => ClientError::Rejected {
            action,
            status: status.as_u16(),
            code: None,
            message: String::from_utf8_lossy(body).into_owned(),
            retryable: status.is_server_error(),
        },
    };
    Err(rejection)
}
