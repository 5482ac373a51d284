// Durable session and presence records.
//
// Postgres in production; the in-memory variant keeps identical semantics
// under a single write lock and backs tests and database-less development.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use scrumflow_common::types::{
    CollaborativeSession, PresenceStatus, PresenceUpdate, SessionType, UserPresence,
};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::SessionError;

const SESSION_COLUMNS: &str = "id, project_id, work_item_id, session_type, created_by, \
     participants, is_active, metadata, version, created_at, updated_at";

const PRESENCE_COLUMNS: &str = "user_id, user_name, status, last_seen, project_id, \
     current_page, cursor_position, selection";

#[derive(Clone)]
pub enum CollaborationStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryCollaborationStore>>),
}

#[derive(Default)]
pub struct MemoryCollaborationStore {
    sessions: HashMap<Uuid, CollaborativeSession>,
    presence: HashMap<Uuid, UserPresence>,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    project_id: Uuid,
    work_item_id: Option<Uuid>,
    session_type: String,
    created_by: Uuid,
    participants: Vec<Uuid>,
    is_active: bool,
    metadata: Value,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for CollaborativeSession {
    type Error = SessionError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let session_type = SessionType::from_db_value(&row.session_type).ok_or_else(|| {
            SessionError::Persistence(anyhow::anyhow!(
                "unknown session_type `{}` on session {}",
                row.session_type,
                row.id
            ))
        })?;
        let metadata = match row.metadata {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        Ok(Self {
            id: row.id,
            project_id: row.project_id,
            work_item_id: row.work_item_id,
            session_type,
            created_by: row.created_by,
            participants: row.participants,
            is_active: row.is_active,
            metadata,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PresenceRow {
    user_id: Uuid,
    user_name: String,
    status: String,
    last_seen: DateTime<Utc>,
    project_id: Option<Uuid>,
    current_page: Option<String>,
    cursor_position: Option<Value>,
    selection: Option<Value>,
}

impl TryFrom<PresenceRow> for UserPresence {
    type Error = SessionError;

    fn try_from(row: PresenceRow) -> Result<Self, Self::Error> {
        let status = PresenceStatus::from_db_value(&row.status).unwrap_or_default();
        let cursor = row.cursor_position.map(serde_json::from_value).transpose()?;
        let selection = row.selection.map(serde_json::from_value).transpose()?;

        Ok(Self {
            user_id: row.user_id,
            user_name: row.user_name,
            status,
            last_seen: row.last_seen,
            project_id: row.project_id,
            current_page: row.current_page,
            cursor,
            selection,
        })
    }
}

impl CollaborationStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryCollaborationStore::default())))
    }

    pub async fn insert_session(&self, session: &CollaborativeSession) -> Result<(), SessionError> {
        match self {
            Self::Postgres(pool) => insert_session_pg(pool, session).await,
            Self::Memory(store) => {
                store.write().await.sessions.insert(session.id, session.clone());
                Ok(())
            }
        }
    }

    pub async fn session(&self, session_id: Uuid) -> Result<Option<CollaborativeSession>, SessionError> {
        match self {
            Self::Postgres(pool) => session_pg(pool, session_id).await,
            Self::Memory(store) => Ok(store.read().await.sessions.get(&session_id).cloned()),
        }
    }

    /// Replace the participant list if the stored version still equals
    /// `expected_version`. Returns `None` when the row moved on (or vanished).
    pub async fn compare_and_set_participants(
        &self,
        session_id: Uuid,
        expected_version: i64,
        participants: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Option<CollaborativeSession>, SessionError> {
        match self {
            Self::Postgres(pool) => {
                compare_and_set_participants_pg(pool, session_id, expected_version, participants, now)
                    .await
            }
            Self::Memory(store) => {
                let mut store = store.write().await;
                let Some(session) = store.sessions.get_mut(&session_id) else {
                    return Ok(None);
                };
                if session.version != expected_version {
                    return Ok(None);
                }
                session.participants = participants.to_vec();
                session.version += 1;
                session.updated_at = now;
                Ok(Some(session.clone()))
            }
        }
    }

    pub async fn deactivate_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<CollaborativeSession>, SessionError> {
        match self {
            Self::Postgres(pool) => deactivate_session_pg(pool, session_id, now).await,
            Self::Memory(store) => {
                let mut store = store.write().await;
                let Some(session) = store.sessions.get_mut(&session_id) else {
                    return Ok(None);
                };
                session.is_active = false;
                session.version += 1;
                session.updated_at = now;
                Ok(Some(session.clone()))
            }
        }
    }

    /// Insert or merge a presence row. Absent fields keep their stored value
    /// and `last_seen` is always set to `now`.
    pub async fn upsert_presence(
        &self,
        user_id: Uuid,
        update: &PresenceUpdate,
        project_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<UserPresence, SessionError> {
        match self {
            Self::Postgres(pool) => upsert_presence_pg(pool, user_id, update, project_id, now).await,
            Self::Memory(store) => {
                let mut store = store.write().await;
                let presence = store
                    .presence
                    .entry(user_id)
                    .and_modify(|existing| existing.apply_update(update.clone(), project_id, now))
                    .or_insert_with(|| {
                        UserPresence::from_update(user_id, update.clone(), project_id, now)
                    });
                Ok(presence.clone())
            }
        }
    }

    /// Presence rows scoped to `project_id` seen at or after `cutoff`, newest first.
    pub async fn presences_seen_since(
        &self,
        project_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<UserPresence>, SessionError> {
        match self {
            Self::Postgres(pool) => presences_seen_since_pg(pool, project_id, cutoff).await,
            Self::Memory(store) => {
                let store = store.read().await;
                Ok(newest_first(
                    store
                        .presence
                        .values()
                        .filter(|p| p.project_id == Some(project_id) && p.last_seen >= cutoff)
                        .cloned()
                        .collect(),
                ))
            }
        }
    }

    pub async fn presences_for_users_since(
        &self,
        user_ids: &[Uuid],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<UserPresence>, SessionError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Self::Postgres(pool) => presences_for_users_since_pg(pool, user_ids, cutoff).await,
            Self::Memory(store) => {
                let store = store.read().await;
                Ok(newest_first(
                    user_ids
                        .iter()
                        .filter_map(|user_id| store.presence.get(user_id))
                        .filter(|p| p.last_seen >= cutoff)
                        .cloned()
                        .collect(),
                ))
            }
        }
    }
}

fn newest_first(mut presences: Vec<UserPresence>) -> Vec<UserPresence> {
    presences.sort_by(|left, right| right.last_seen.cmp(&left.last_seen));
    presences
}

// ── Postgres implementations ───────────────────────────────────────

async fn insert_session_pg(pool: &PgPool, session: &CollaborativeSession) -> Result<(), SessionError> {
    sqlx::query(
        r#"
        INSERT INTO collaborative_sessions
            (id, project_id, work_item_id, session_type, created_by, participants,
             is_active, metadata, version, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(session.id)
    .bind(session.project_id)
    .bind(session.work_item_id)
    .bind(session.session_type.as_str())
    .bind(session.created_by)
    .bind(&session.participants)
    .bind(session.is_active)
    .bind(Value::Object(session.metadata.clone()))
    .bind(session.version)
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

async fn session_pg(pool: &PgPool, session_id: Uuid) -> Result<Option<CollaborativeSession>, SessionError> {
    let row = sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {SESSION_COLUMNS} FROM collaborative_sessions WHERE id = $1"
    ))
    .bind(session_id)
    .fetch_optional(pool)
    .await
    .map_err(map_sqlx_error)?;

    row.map(CollaborativeSession::try_from).transpose()
}

async fn compare_and_set_participants_pg(
    pool: &PgPool,
    session_id: Uuid,
    expected_version: i64,
    participants: &[Uuid],
    now: DateTime<Utc>,
) -> Result<Option<CollaborativeSession>, SessionError> {
    let row = sqlx::query_as::<_, SessionRow>(&format!(
        "UPDATE collaborative_sessions \
         SET participants = $3, version = version + 1, updated_at = $4 \
         WHERE id = $1 AND version = $2 \
         RETURNING {SESSION_COLUMNS}"
    ))
    .bind(session_id)
    .bind(expected_version)
    .bind(participants)
    .bind(now)
    .fetch_optional(pool)
    .await
    .map_err(map_sqlx_error)?;

    row.map(CollaborativeSession::try_from).transpose()
}

async fn deactivate_session_pg(
    pool: &PgPool,
    session_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<CollaborativeSession>, SessionError> {
    let row = sqlx::query_as::<_, SessionRow>(&format!(
        "UPDATE collaborative_sessions \
         SET is_active = FALSE, version = version + 1, updated_at = $2 \
         WHERE id = $1 \
         RETURNING {SESSION_COLUMNS}"
    ))
    .bind(session_id)
    .bind(now)
    .fetch_optional(pool)
    .await
    .map_err(map_sqlx_error)?;

    row.map(CollaborativeSession::try_from).transpose()
}

async fn upsert_presence_pg(
    pool: &PgPool,
    user_id: Uuid,
    update: &PresenceUpdate,
    project_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<UserPresence, SessionError> {
    let cursor = update.cursor.map(serde_json::to_value).transpose()?;
    let selection = update.selection.as_ref().map(serde_json::to_value).transpose()?;

    let row = sqlx::query_as::<_, PresenceRow>(&format!(
        "INSERT INTO user_presence \
             (user_id, user_name, status, last_seen, project_id, current_page, cursor_position, selection) \
         VALUES ($1, COALESCE($2, $9), COALESCE($3, 'active'), $4, $5, $6, $7, $8) \
         ON CONFLICT (user_id) DO UPDATE SET \
             user_name = COALESCE($2, user_presence.user_name), \
             status = COALESCE($3, user_presence.status), \
             last_seen = $4, \
             project_id = COALESCE($5, user_presence.project_id), \
             current_page = COALESCE($6, user_presence.current_page), \
             cursor_position = COALESCE($7, user_presence.cursor_position), \
             selection = COALESCE($8, user_presence.selection) \
         RETURNING {PRESENCE_COLUMNS}"
    ))
    .bind(user_id)
    .bind(update.user_name.as_deref())
    .bind(update.status.map(PresenceStatus::as_str))
    .bind(now)
    .bind(project_id)
    .bind(update.current_page.as_deref())
    .bind(cursor)
    .bind(selection)
    .bind(scrumflow_common::types::UNKNOWN_USER_NAME)
    .fetch_one(pool)
    .await
    .map_err(map_sqlx_error)?;

    UserPresence::try_from(row)
}

async fn presences_seen_since_pg(
    pool: &PgPool,
    project_id: Uuid,
    cutoff: DateTime<Utc>,
) -> Result<Vec<UserPresence>, SessionError> {
    let rows = sqlx::query_as::<_, PresenceRow>(&format!(
        "SELECT {PRESENCE_COLUMNS} FROM user_presence \
         WHERE project_id = $1 AND last_seen >= $2 \
         ORDER BY last_seen DESC"
    ))
    .bind(project_id)
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .map_err(map_sqlx_error)?;

    rows.into_iter().map(UserPresence::try_from).collect()
}

async fn presences_for_users_since_pg(
    pool: &PgPool,
    user_ids: &[Uuid],
    cutoff: DateTime<Utc>,
) -> Result<Vec<UserPresence>, SessionError> {
    let rows = sqlx::query_as::<_, PresenceRow>(&format!(
        "SELECT {PRESENCE_COLUMNS} FROM user_presence \
         WHERE user_id = ANY($1) AND last_seen >= $2 \
         ORDER BY last_seen DESC"
    ))
    .bind(user_ids)
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .map_err(map_sqlx_error)?;

    rows.into_iter().map(UserPresence::try_from).collect()
}

fn map_sqlx_error(error: sqlx::Error) -> SessionError {
    SessionError::Persistence(error.into())
}
