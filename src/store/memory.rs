//! In-memory store for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::base::{ActorPatch, ActorStore, SessionPatch, SessionStore, StoreResult};
use crate::model::{Actor, Session, SessionId};

/// Store that keeps actors and sessions behind mutexes. External backends
/// (embedded store, networked document store) implement the same traits out
/// of tree.
#[derive(Clone, Default)]
pub struct MemoryStore {
    actors: Arc<Mutex<HashMap<String, Actor>>>,
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_actor_patch(actor: &mut Actor, patch: ActorPatch) {
    if let Some(tags) = patch.tags {
        actor.tags = tags;
    }
    if let Some(ip) = patch.ip {
        actor.ip = ip;
    }
    if let Some(last_seen) = patch.last_seen {
        actor.last_seen = last_seen;
    }
    if let Some(session_id) = patch.session_id {
        actor.session_id = session_id;
    }
}

fn apply_session_patch(session: &mut Session, patch: SessionPatch) {
    if let Some(status) = patch.status {
        session.status = status;
    }
    if let Some(result) = patch.result {
        session.result = result;
    }
    if let Some(current_iteration) = patch.current_iteration {
        session.current_iteration = current_iteration;
    }
    if let Some(current_test_index) = patch.current_test_index {
        session.current_test_index = current_test_index;
    }
    if let Some(current_segment_index) = patch.current_segment_index {
        session.current_segment_index = current_segment_index;
    }
    if let Some(current_data_record_index) = patch.current_data_record_index {
        session.current_data_record_index = current_data_record_index;
    }
    if let Some(actors) = patch.actors {
        session.actors = actors;
    }
    if let Some(tests) = patch.tests {
        session.tests = tests;
    }
    if let Some(time_started) = patch.time_started {
        session.time_started = Some(time_started);
    }
    if let Some(time_completed) = patch.time_completed {
        session.time_completed = Some(time_completed);
    }
    if let Some(last_activity) = patch.last_activity {
        session.last_activity = last_activity;
    }
}

#[async_trait]
impl ActorStore for MemoryStore {
    async fn get_actor(&self, actor_id: &str) -> StoreResult<Option<Actor>> {
        let guard = self.actors.lock().expect("actors poisoned");
        Ok(guard.get(actor_id).cloned())
    }

    async fn insert_actor(&self, actor: &Actor) -> StoreResult<()> {
        let mut guard = self.actors.lock().expect("actors poisoned");
        guard.insert(actor.id.clone(), actor.clone());
        Ok(())
    }

    async fn update_actor(&self, actor_id: &str, patch: ActorPatch) -> StoreResult<bool> {
        let mut guard = self.actors.lock().expect("actors poisoned");
        match guard.get_mut(actor_id) {
            Some(actor) => {
                apply_actor_patch(actor, patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn try_assign_actor(
        &self,
        actor_id: &str,
        session_id: &SessionId,
    ) -> StoreResult<bool> {
        let mut guard = self.actors.lock().expect("actors poisoned");
        match guard.get_mut(actor_id) {
            Some(actor) if actor.session_id.is_none() => {
                actor.session_id = Some(session_id.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_actor(&self, actor_id: &str) -> StoreResult<bool> {
        let mut guard = self.actors.lock().expect("actors poisoned");
        Ok(guard.remove(actor_id).is_some())
    }

    async fn list_actors(&self) -> StoreResult<Vec<Actor>> {
        let guard = self.actors.lock().expect("actors poisoned");
        let mut actors: Vec<_> = guard.values().cloned().collect();
        actors.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(actors)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_session(&self, session_id: &SessionId) -> StoreResult<Option<Session>> {
        let guard = self.sessions.lock().expect("sessions poisoned");
        Ok(guard.get(session_id).cloned())
    }

    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        let mut guard = self.sessions.lock().expect("sessions poisoned");
        guard.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn update_session(
        &self,
        session_id: &SessionId,
        patch: SessionPatch,
    ) -> StoreResult<bool> {
        let mut guard = self.sessions.lock().expect("sessions poisoned");
        match guard.get_mut(session_id) {
            Some(session) => {
                apply_session_patch(session, patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, session_id: &SessionId) -> StoreResult<bool> {
        let mut guard = self.sessions.lock().expect("sessions poisoned");
        Ok(guard.remove(session_id).is_some())
    }

    async fn list_sessions(&self, limit: usize, skip: usize) -> StoreResult<Vec<Session>> {
        let guard = self.sessions.lock().expect("sessions poisoned");
        let mut sessions: Vec<_> = guard.values().cloned().collect();
        sessions.sort_by(|a, b| {
            b.time_created
                .cmp(&a.time_created)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(sessions.into_iter().skip(skip).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::model::SessionStatus;

    fn actor(id: &str) -> Actor {
        Actor {
            id: id.to_string(),
            actor_type: "worker".to_string(),
            tags: vec!["lab".to_string()],
            ip: None,
            last_seen: Utc::now(),
            session_id: None,
        }
    }

    fn session(id: &str, created_offset_secs: i64) -> Session {
        let now = Utc::now() + Duration::seconds(created_offset_secs);
        Session {
            id: SessionId::from(id),
            label: id.to_string(),
            status: SessionStatus::AcquiringActors,
            result: Default::default(),
            max_iterations: 1,
            current_iteration: 1,
            current_test_index: 0,
            current_segment_index: 0,
            current_data_record_index: None,
            required_actors: Vec::new(),
            actors: Default::default(),
            tests: Vec::new(),
            missing_tests: Vec::new(),
            time_created: now,
            time_started: None,
            time_completed: None,
            last_activity: now,
        }
    }

    #[tokio::test]
    async fn actor_crud_round_trip() {
        let store = MemoryStore::new();
        store.insert_actor(&actor("a-1")).await.expect("insert");

        let loaded = store.get_actor("a-1").await.expect("get").expect("exists");
        assert_eq!(loaded.actor_type, "worker");

        let updated = store
            .update_actor(
                "a-1",
                ActorPatch {
                    tags: Some(vec!["bench".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert!(updated);
        let loaded = store.get_actor("a-1").await.expect("get").expect("exists");
        assert_eq!(loaded.tags, vec!["bench".to_string()]);

        assert!(store.delete_actor("a-1").await.expect("delete"));
        assert!(store.get_actor("a-1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn try_assign_actor_is_conditional() {
        let store = MemoryStore::new();
        store.insert_actor(&actor("a-1")).await.expect("insert");

        let first = SessionId::from("s-1");
        let second = SessionId::from("s-2");

        assert!(store.try_assign_actor("a-1", &first).await.expect("assign"));
        // Second assignment loses: the actor is no longer free.
        assert!(!store.try_assign_actor("a-1", &second).await.expect("assign"));

        let loaded = store.get_actor("a-1").await.expect("get").expect("exists");
        assert_eq!(loaded.session_id, Some(first));
    }

    #[tokio::test]
    async fn clear_session_patch_frees_actor() {
        let store = MemoryStore::new();
        store.insert_actor(&actor("a-1")).await.expect("insert");
        let sid = SessionId::from("s-1");
        assert!(store.try_assign_actor("a-1", &sid).await.expect("assign"));

        store
            .update_actor("a-1", ActorPatch::clear_session())
            .await
            .expect("update");
        let loaded = store.get_actor("a-1").await.expect("get").expect("exists");
        assert!(loaded.session_id.is_none());
        assert!(store.try_assign_actor("a-1", &sid).await.expect("assign"));
    }

    #[tokio::test]
    async fn sessions_list_newest_first() {
        let store = MemoryStore::new();
        store.insert_session(&session("s-old", -30)).await.expect("insert");
        store.insert_session(&session("s-mid", -20)).await.expect("insert");
        store.insert_session(&session("s-new", -10)).await.expect("insert");

        let listed = store.list_sessions(10, 0).await.expect("list");
        let ids: Vec<_> = listed.iter().map(|s| s.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["s-new", "s-mid", "s-old"]);

        let paged = store.list_sessions(1, 1).await.expect("list");
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id.as_str(), "s-mid");
    }

    #[tokio::test]
    async fn session_patch_merges_fields() {
        let store = MemoryStore::new();
        let original = session("s-1", 0);
        store.insert_session(&original).await.expect("insert");

        let updated = store
            .update_session(
                &original.id,
                SessionPatch {
                    status: Some(SessionStatus::Started),
                    current_test_index: Some(2),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert!(updated);

        let loaded = store
            .get_session(&original.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status, SessionStatus::Started);
        assert_eq!(loaded.current_test_index, 2);
        // Untouched fields survive the merge.
        assert_eq!(loaded.label, original.label);
        assert_eq!(loaded.max_iterations, original.max_iterations);
    }
}
