//! Session materialization.
//!
//! Expands a session request (selected tests + actor tags + iteration
//! count) into a fully-populated session document in `ACQUIRING_ACTORS`
//! status, ready for the acquisition loop.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::catalog::TestCatalog;
use crate::error::{EngineError, EngineResult};
use crate::model::{
    RequiredActor, SelectedTest, Session, SessionId, SessionResult, SessionStatus, TestContext,
    TestResult, TestSegmentInfo, TestStatus,
};
use crate::store::{SessionStore, Store};

/// A session creation request.
#[derive(Clone, Debug, Default)]
pub struct SessionRequest {
    pub tests: Vec<SelectedTest>,
    /// Extra tag expressions every required actor must satisfy.
    pub actor_tags: Vec<String>,
    pub max_iterations: u32,
    pub label: String,
}

/// Allocates session ids from a coarse wall-clock timestamp.
///
/// Ids within the same timestamp second are disambiguated with a counter.
/// Allocation is the one named critical section in the engine: concurrent
/// session creations must serialize here or collide.
#[derive(Default)]
pub struct SessionIdAllocator {
    last: Mutex<(String, u32)>,
}

impl SessionIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, now: DateTime<Utc>) -> SessionId {
        let prefix = now.format("%Y%m%d-%H%M%S").to_string();
        let mut last = self.last.lock().expect("session id allocator poisoned");
        if last.0 == prefix {
            last.1 += 1;
            SessionId(format!("{prefix}.{}", last.1))
        } else {
            *last = (prefix.clone(), 0);
            SessionId(prefix)
        }
    }
}

pub struct SessionBuilder {
    store: Arc<dyn Store>,
    catalog: Arc<dyn TestCatalog>,
    ids: Arc<SessionIdAllocator>,
}

impl SessionBuilder {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<dyn TestCatalog>,
        ids: Arc<SessionIdAllocator>,
    ) -> Self {
        Self { store, catalog, ids }
    }

    /// Materialize and persist a session from a request.
    ///
    /// Selections absent from the catalog are recorded as missing and
    /// excluded; the request only fails when nothing resolves.
    pub async fn build_session(&self, request: SessionRequest) -> EngineResult<Session> {
        if request.tests.is_empty() {
            return Err(EngineError::InvalidRequest(
                "session request selects no tests".to_string(),
            ));
        }

        let mut tests = Vec::new();
        let mut missing = Vec::new();
        let mut required: Vec<RequiredActor> = Vec::new();

        for selected in &request.tests {
            let Some(info) = self
                .catalog
                .resolve_test(&selected.name, &selected.path)
                .await
            else {
                warn!(
                    test = %selected.name,
                    path = %selected.path,
                    "selected test not in catalog; excluding"
                );
                missing.push(selected.clone());
                continue;
            };

            for actor in &info.actors {
                let mut tags = actor.tags.clone();
                tags.extend(request.actor_tags.iter().cloned());
                tags.sort();
                tags.dedup();
                let requirement = RequiredActor {
                    actor_type: actor.actor_type.clone(),
                    tags,
                };
                if !required.contains(&requirement) {
                    required.push(requirement);
                }
            }

            let segment_count = info.max_segment_index() + 1;
            tests.push(TestContext {
                name: info.name.clone(),
                path: info.path.clone(),
                tags: info.tags.clone(),
                data_driven: info.data_driven,
                data_record_count: None,
                current_data_record_index: info.data_driven.then_some(0),
                current_iteration: 1,
                segments: (0..segment_count).map(TestSegmentInfo::pending).collect(),
                subtests: Vec::new(),
                actions: Vec::new(),
                shared_data: serde_json::Value::Null,
                status: TestStatus::Pending,
                result: TestResult::Pending,
                time_started: None,
                time_completed: None,
            });
        }

        if tests.is_empty() {
            return Err(EngineError::NoMatchingTests);
        }
        required.sort();

        let now = Utc::now();
        let id = self.ids.allocate(now);
        let current_data_record_index = tests
            .first()
            .and_then(|test| test.current_data_record_index);
        let session = Session {
            id: id.clone(),
            label: if request.label.is_empty() {
                id.to_string()
            } else {
                request.label
            },
            status: SessionStatus::AcquiringActors,
            result: SessionResult::Pending,
            max_iterations: request.max_iterations.max(1),
            current_iteration: 1,
            current_test_index: 0,
            current_segment_index: 0,
            current_data_record_index,
            required_actors: required,
            actors: Default::default(),
            tests,
            missing_tests: missing,
            time_created: now,
            time_started: None,
            time_completed: None,
            last_activity: now,
        };

        self.store.insert_session(&session).await?;
        info!(
            session_id = %session.id,
            label = %session.label,
            tests = session.tests.len(),
            required_actors = session.required_actors.len(),
            "session created"
        );
        Ok(session)
    }
}
