// Session-action RPC endpoint.
//
// Route:
//   POST /v1/collaboration   body: { "action": "...", ...fields }
//
// Success: 200 `{ "data": ..., "success": true }`. Failures use the relay
// error envelope.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use scrumflow_common::protocol::rpc::{parse_session_action, ActionParseError, RpcSuccess, SessionAction};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{ErrorCode, RelayError};
use crate::metrics::RelayMetrics;
use crate::session::{CollaborativeSessionService, PresenceService, SessionError};

pub const SESSION_ACTION_PATH: &str = "/v1/collaboration";

#[derive(Clone)]
struct RpcState {
    sessions: CollaborativeSessionService,
    presence: PresenceService,
    metrics: Arc<RelayMetrics>,
}

pub fn router(
    sessions: CollaborativeSessionService,
    presence: PresenceService,
    metrics: Arc<RelayMetrics>,
) -> Router {
    Router::new()
        .route(SESSION_ACTION_PATH, post(handle_session_action))
        .with_state(RpcState { sessions, presence, metrics })
}

async fn handle_session_action(State(state): State<RpcState>, body: Bytes) -> Response {
    let action = match decode_action(&body) {
        Ok(action) => action,
        Err((label, error)) => {
            state.metrics.record_session_action(&label, "invalid");
            return error.into_response();
        }
    };

    let name = action.name();
    debug!(action = name, "dispatching session action");
    match dispatch(&state, action).await {
        Ok(data) => {
            state.metrics.record_session_action(name, "ok");
            Json(RpcSuccess::new(data)).into_response()
        }
        Err(error) => {
            state.metrics.record_session_action(name, error.outcome());
            RelayError::from(error).into_response()
        }
    }
}

/// Parse the body into a typed action. The error side carries the metric
/// label to record alongside the response.
fn decode_action(body: &[u8]) -> Result<SessionAction, (String, RelayError)> {
    let value: Value = serde_json::from_slice(body).map_err(|error| {
        (
            "unknown".to_string(),
            RelayError::new(ErrorCode::ValidationFailed, format!("request body is not valid JSON: {error}")),
        )
    })?;

    parse_session_action(value).map_err(|error| match error {
        ActionParseError::UnknownAction(ref action) => (
            "unknown".to_string(),
            RelayError::new(ErrorCode::UnknownAction, format!("unknown action: {action}")),
        ),
        ActionParseError::MissingAction => {
            ("unknown".to_string(), RelayError::new(ErrorCode::ValidationFailed, error.to_string()))
        }
        ActionParseError::Invalid { ref action, .. } => {
            (action.clone(), RelayError::new(ErrorCode::ValidationFailed, error.to_string()))
        }
    })
}

async fn dispatch(state: &RpcState, action: SessionAction) -> Result<Value, SessionError> {
    match action {
        SessionAction::CreateSession { project_id, work_item_id, user_id, data } => into_data(
            state
                .sessions
                .create_session(project_id, work_item_id, data.session_type, user_id, data.metadata)
                .await?,
        ),
        SessionAction::JoinSession { session_id, user_id } => {
            into_data(state.sessions.join_session(session_id, user_id).await?)
        }
        SessionAction::LeaveSession { session_id, user_id } => {
            into_data(state.sessions.leave_session(session_id, user_id).await?)
        }
        SessionAction::UpdatePresence { user_id, project_id, data } => {
            into_data(state.presence.update_presence(user_id, data, project_id).await?)
        }
        SessionAction::GetActiveUsers { project_id } => {
            into_data(state.presence.active_users(project_id).await?)
        }
        SessionAction::SendCursor { project_id, user_id, data } => {
            into_data(state.presence.send_cursor(project_id, user_id, data).await?)
        }
        SessionAction::SendSelection { session_id, user_id, data } => {
            into_data(state.sessions.send_selection(session_id, user_id, data.selection).await?)
        }
        SessionAction::GetSessionInfo { session_id } => {
            into_data(state.sessions.session_info(session_id).await?)
        }
        SessionAction::EndSession { session_id, user_id } => {
            into_data(state.sessions.end_session(session_id, user_id).await?)
        }
    }
}

fn into_data<T: Serialize>(value: T) -> Result<Value, SessionError> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use chrono::Duration;
    use scrumflow_common::realtime::RealtimeHub;
    use serde_json::json;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::session::CollaborationStore;

    fn test_router() -> Router {
        let store = CollaborationStore::memory();
        let hub = RealtimeHub::new();
        let window = Duration::minutes(5);
        router(
            CollaborativeSessionService::new(store.clone(), hub.clone(), window),
            PresenceService::new(store, hub, window),
            Arc::default(),
        )
    }

    async fn call(app: &Router, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(SESSION_ACTION_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        (status, serde_json::from_slice(&bytes).expect("body should be json"))
    }

    #[tokio::test]
    async fn create_session_returns_success_envelope() {
        let app = test_router();
        let user = Uuid::new_v4();
        let (status, body) = call(
            &app,
            json!({
                "action": "create-session",
                "projectId": Uuid::new_v4(),
                "userId": user,
                "data": { "sessionType": "board", "metadata": { "column": "doing" } }
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["participants"], json!([user]));
        assert_eq!(body["data"]["isActive"], true);
        assert_eq!(body["data"]["metadata"]["column"], "doing");
    }

    #[tokio::test]
    async fn missing_field_is_bad_request() {
        let app = test_router();
        let (status, body) = call(&app, json!({ "action": "join-session", "userId": Uuid::new_v4() })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_FAILED");
        assert!(body["error"].as_str().unwrap().contains("sessionId"));
    }

    #[tokio::test]
    async fn unknown_action_is_bad_request() {
        let app = test_router();
        let (status, body) = call(&app, json!({ "action": "archive-session" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "UNKNOWN_ACTION");
    }

    #[tokio::test]
    async fn non_json_body_is_bad_request() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(SESSION_ACTION_PATH)
                    .body(Body::from("action=join"))
                    .expect("request should build"),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lifecycle_errors_map_to_http_statuses() {
        let app = test_router();
        let (creator, other) = (Uuid::new_v4(), Uuid::new_v4());

        let (_, created) = call(
            &app,
            json!({
                "action": "create-session",
                "projectId": Uuid::new_v4(),
                "userId": creator,
                "data": { "sessionType": "planning" }
            }),
        )
        .await;
        let session_id = created["data"]["id"].clone();

        let (status, body) =
            call(&app, json!({ "action": "end-session", "sessionId": session_id, "userId": other })).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "AUTH_FORBIDDEN");

        let (status, _) =
            call(&app, json!({ "action": "leave-session", "sessionId": session_id, "userId": creator }))
                .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) =
            call(&app, json!({ "action": "end-session", "sessionId": session_id, "userId": creator })).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            call(&app, json!({ "action": "join-session", "sessionId": session_id, "userId": other })).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "SESSION_ENDED");

        let (status, body) = call(
            &app,
            json!({ "action": "get-session-info", "sessionId": Uuid::new_v4() }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn presence_round_trip_through_active_users() {
        let app = test_router();
        let (project, user) = (Uuid::new_v4(), Uuid::new_v4());

        let (status, _) = call(
            &app,
            json!({
                "action": "update-presence",
                "userId": user,
                "projectId": project,
                "data": { "userName": "Linus", "status": "idle", "currentPage": "/backlog" }
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            call(&app, json!({ "action": "get-active-users", "projectId": project })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["userName"], "Linus");
        assert_eq!(body["data"][0]["status"], "idle");
    }

    #[tokio::test]
    async fn send_cursor_reports_delivery_count() {
        let app = test_router();
        let (status, body) = call(
            &app,
            json!({
                "action": "send-cursor",
                "projectId": Uuid::new_v4(),
                "userId": Uuid::new_v4(),
                "data": { "x": 12.5, "y": 40.0 }
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["delivered"], 0);
    }
}
