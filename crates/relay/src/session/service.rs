use chrono::{Duration, Utc};
use scrumflow_common::channel::ChannelConfig;
use scrumflow_common::protocol::events::{BroadcastEvent, MembershipChange, SelectionUpdate};
use scrumflow_common::protocol::rpc::BroadcastReceipt;
use scrumflow_common::realtime::RealtimeHub;
use scrumflow_common::types::{CollaborativeSession, Selection, SessionInfo, SessionType};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::SessionError;
use super::store::CollaborationStore;

/// Participant updates give up with [`SessionError::Conflict`] after this many
/// lost compare-and-set rounds.
pub const MAX_PARTICIPANT_UPDATE_ATTEMPTS: usize = 8;

/// Authoritative session lifecycle: create, join, leave, end.
///
/// Every mutation is committed to the store first; the matching broadcast is
/// published afterwards and never fails the call.
#[derive(Clone)]
pub struct CollaborativeSessionService {
    store: CollaborationStore,
    hub: RealtimeHub,
    presence_window: Duration,
}

enum ParticipantChange {
    Unchanged(CollaborativeSession),
    Applied(CollaborativeSession),
}

impl CollaborativeSessionService {
    pub fn new(store: CollaborationStore, hub: RealtimeHub, presence_window: Duration) -> Self {
        Self { store, hub, presence_window }
    }

    pub async fn create_session(
        &self,
        project_id: Uuid,
        work_item_id: Option<Uuid>,
        session_type: SessionType,
        creator_id: Uuid,
        metadata: Option<Map<String, Value>>,
    ) -> Result<CollaborativeSession, SessionError> {
        if session_type == SessionType::WorkItem && work_item_id.is_none() {
            return Err(SessionError::validation("workItemId is required for work_item sessions"));
        }

        let now = Utc::now();
        let session = CollaborativeSession {
            id: Uuid::new_v4(),
            project_id,
            work_item_id,
            session_type,
            created_by: creator_id,
            participants: vec![creator_id],
            is_active: true,
            metadata: metadata.unwrap_or_default(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_session(&session).await?;

        info!(
            session_id = %session.id,
            project_id = %project_id,
            session_type = session_type.as_str(),
            "collaborative session created"
        );
        self.publish(
            &ChannelConfig::ProjectUpdates { project_id }.canonical_id(),
            BroadcastEvent::SessionCreated(session.clone()),
        )
        .await;

        Ok(session)
    }

    pub async fn join_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<CollaborativeSession, SessionError> {
        let change = self
            .update_participants(session_id, |session| {
                if !session.is_active {
                    return Err(SessionError::Ended);
                }
                if session.has_participant(user_id) {
                    return Ok(None);
                }
                let mut participants = session.participants.clone();
                participants.push(user_id);
                Ok(Some(participants))
            })
            .await?;

        match change {
            ParticipantChange::Unchanged(session) => Ok(session),
            ParticipantChange::Applied(session) => {
                info!(session_id = %session_id, user_id = %user_id, "user joined session");
                self.publish(
                    &session_topic(session_id),
                    BroadcastEvent::UserJoined(MembershipChange {
                        user_id,
                        session_id: Some(session_id),
                    }),
                )
                .await;
                Ok(session)
            }
        }
    }

    pub async fn leave_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<CollaborativeSession, SessionError> {
        let change = self
            .update_participants(session_id, |session| {
                if !session.has_participant(user_id) {
                    return Ok(None);
                }
                if session.is_active && session.created_by == user_id {
                    return Err(SessionError::CreatorCannotLeave);
                }
                Ok(Some(
                    session.participants.iter().copied().filter(|id| *id != user_id).collect(),
                ))
            })
            .await?;

        match change {
            ParticipantChange::Unchanged(session) => Ok(session),
            ParticipantChange::Applied(session) => {
                info!(session_id = %session_id, user_id = %user_id, "user left session");
                self.publish(
                    &session_topic(session_id),
                    BroadcastEvent::UserLeft(MembershipChange {
                        user_id,
                        session_id: Some(session_id),
                    }),
                )
                .await;
                Ok(session)
            }
        }
    }

    /// End a session. Only its creator may do so; ending twice is allowed.
    pub async fn end_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<CollaborativeSession, SessionError> {
        let session = self.load(session_id).await?;
        if session.created_by != user_id {
            warn!(session_id = %session_id, user_id = %user_id, "non-creator attempted to end session");
            return Err(SessionError::Forbidden);
        }

        let ended = self
            .store
            .deactivate_session(session_id, Utc::now())
            .await?
            .ok_or(SessionError::NotFound)?;

        info!(session_id = %session_id, "collaborative session ended");
        self.publish(&session_topic(session_id), BroadcastEvent::SessionEnded(ended.clone())).await;
        self.publish(
            &ChannelConfig::ProjectUpdates { project_id: ended.project_id }.canonical_id(),
            BroadcastEvent::SessionEnded(ended.clone()),
        )
        .await;

        Ok(ended)
    }

    pub async fn session_info(&self, session_id: Uuid) -> Result<SessionInfo, SessionError> {
        let session = self.load(session_id).await?;
        let now = Utc::now();
        let active_users = self
            .store
            .presences_for_users_since(&session.participants, now - self.presence_window)
            .await?;

        Ok(SessionInfo {
            participant_count: session.participants.len(),
            duration_minutes: session.duration_minutes(now),
            active_users,
            session,
        })
    }

    pub async fn send_selection(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        selection: Selection,
    ) -> Result<BroadcastReceipt, SessionError> {
        if selection.element_id.trim().is_empty() {
            return Err(SessionError::validation("selection.elementId must not be blank"));
        }
        if let Some(range) = selection.range {
            if range.start > range.end {
                return Err(SessionError::validation("selection.range start must not exceed end"));
            }
        }

        let delivered = self
            .publish(
                &session_topic(session_id),
                BroadcastEvent::SelectionUpdate(SelectionUpdate { user_id, selection }),
            )
            .await;
        Ok(BroadcastReceipt { delivered })
    }

    async fn load(&self, session_id: Uuid) -> Result<CollaborativeSession, SessionError> {
        self.store.session(session_id).await?.ok_or(SessionError::NotFound)
    }

    /// Read-modify-write of the participant list guarded by the row version.
    ///
    /// `plan` returns the new list, `None` for "nothing to do", or an error
    /// that aborts without writing. It is re-run against fresh state after
    /// every lost round.
    async fn update_participants<F>(
        &self,
        session_id: Uuid,
        mut plan: F,
    ) -> Result<ParticipantChange, SessionError>
    where
        F: FnMut(&CollaborativeSession) -> Result<Option<Vec<Uuid>>, SessionError>,
    {
        for attempt in 1..=MAX_PARTICIPANT_UPDATE_ATTEMPTS {
            let session = self.load(session_id).await?;
            let Some(participants) = plan(&session)? else {
                return Ok(ParticipantChange::Unchanged(session));
            };

            if let Some(updated) = self
                .store
                .compare_and_set_participants(session_id, session.version, &participants, Utc::now())
                .await?
            {
                return Ok(ParticipantChange::Applied(updated));
            }
            debug!(session_id = %session_id, attempt, "participant update lost a version race");
        }

        warn!(
            session_id = %session_id,
            attempts = MAX_PARTICIPANT_UPDATE_ATTEMPTS,
            "giving up on contended participant update"
        );
        Err(SessionError::Conflict)
    }

    async fn publish(&self, topic: &str, event: BroadcastEvent) -> usize {
        let name = event.name();
        let delivered = self.hub.broadcast(None, topic, event).await;
        debug!(topic, event = name, delivered, "collaboration event published");
        delivered
    }
}

fn session_topic(session_id: Uuid) -> String {
    ChannelConfig::Session { session_id }.canonical_id()
}
