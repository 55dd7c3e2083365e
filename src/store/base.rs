//! Persistence contract for actor and session records.
//!
//! The engine coordinates everything through these narrow CRUD interfaces;
//! the storage format behind them is a backend concern. Updates carry patch
//! structs with merge semantics: absent fields leave the stored record
//! unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    Actor, ActorSessionState, Session, SessionId, SessionResult, SessionStatus, TestContext,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Partial update for an actor record.
#[derive(Clone, Debug, Default)]
pub struct ActorPatch {
    pub tags: Option<Vec<String>>,
    pub ip: Option<Option<String>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// `Some(None)` clears the assignment, `Some(Some(id))` overwrites it.
    pub session_id: Option<Option<SessionId>>,
}

impl ActorPatch {
    pub fn clear_session() -> Self {
        Self {
            session_id: Some(None),
            ..Self::default()
        }
    }
}

/// Partial update for a session record.
#[derive(Clone, Debug, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub result: Option<SessionResult>,
    pub current_iteration: Option<u32>,
    pub current_test_index: Option<usize>,
    pub current_segment_index: Option<usize>,
    pub current_data_record_index: Option<Option<usize>>,
    pub actors: Option<std::collections::HashMap<String, ActorSessionState>>,
    pub tests: Option<Vec<TestContext>>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl SessionPatch {
    /// Patch carrying every mutable runtime field of `session`. Used after
    /// an in-memory state-machine pass so the write is all-or-nothing.
    pub fn snapshot(session: &Session) -> Self {
        Self {
            status: Some(session.status),
            result: Some(session.result),
            current_iteration: Some(session.current_iteration),
            current_test_index: Some(session.current_test_index),
            current_segment_index: Some(session.current_segment_index),
            current_data_record_index: Some(session.current_data_record_index),
            actors: Some(session.actors.clone()),
            tests: Some(session.tests.clone()),
            time_started: session.time_started,
            time_completed: session.time_completed,
            last_activity: Some(session.last_activity),
        }
    }
}

/// CRUD surface for actor records.
#[async_trait]
pub trait ActorStore: Send + Sync {
    async fn get_actor(&self, actor_id: &str) -> StoreResult<Option<Actor>>;

    async fn insert_actor(&self, actor: &Actor) -> StoreResult<()>;

    /// Merge-patch an actor; returns whether the record existed.
    async fn update_actor(&self, actor_id: &str, patch: ActorPatch) -> StoreResult<bool>;

    /// Conditionally assign an actor to a session. The write succeeds only
    /// while the actor exists and is unassigned; callers re-read to confirm.
    async fn try_assign_actor(
        &self,
        actor_id: &str,
        session_id: &SessionId,
    ) -> StoreResult<bool>;

    async fn delete_actor(&self, actor_id: &str) -> StoreResult<bool>;

    async fn list_actors(&self) -> StoreResult<Vec<Actor>>;
}

/// CRUD surface for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, session_id: &SessionId) -> StoreResult<Option<Session>>;

    async fn insert_session(&self, session: &Session) -> StoreResult<()>;

    /// Merge-patch a session; returns whether the record existed.
    async fn update_session(&self, session_id: &SessionId, patch: SessionPatch)
    -> StoreResult<bool>;

    async fn delete_session(&self, session_id: &SessionId) -> StoreResult<bool>;

    /// Sessions sorted by creation time descending.
    async fn list_sessions(&self, limit: usize, skip: usize) -> StoreResult<Vec<Session>>;
}

/// Combined persistence capability the engine is constructed over.
pub trait Store: ActorStore + SessionStore {}

impl<T: ActorStore + SessionStore> Store for T {}
