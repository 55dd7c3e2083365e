//! Core data model: actors, sessions, tests and segments.
//!
//! The session is the unit of persistence; every sub-entity (test contexts,
//! per-actor progress, segments, subtests) is owned by and mutated through
//! its session. Actor records are owned by the registry and cross-referenced
//! by id only.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier for one orchestrated test session.
///
/// Derived from a coarse wall-clock timestamp and disambiguated under a lock
/// (see `builder::SessionIdAllocator`), so ids sort chronologically.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A remote worker process that executes test actions and reports progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub actor_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ip: Option<String>,
    pub last_seen: DateTime<Utc>,
    /// The session this actor is currently assigned to, if any. Non-null for
    /// at most one session at a time; set by acquisition, cleared on session
    /// completion.
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

impl Actor {
    pub fn is_free(&self) -> bool {
        self.session_id.is_none()
    }
}

/// Named set of actors (by tag predicate) with a cap on how many of its
/// members may be assigned to sessions simultaneously. Read-only at runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActorGroup {
    pub name: String,
    pub tag_predicate: String,
    pub max_parallel_sessions: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    AcquiringActors,
    Started,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcquiringActors => "acquiring_actors",
            Self::Started => "started",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionResult {
    #[default]
    Pending,
    Passed,
    Failed,
    Cancelled,
}

impl SessionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    Pending,
    Started,
    Completed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    #[default]
    Pending,
    Passed,
    Failed,
    Skipped,
    Cancelled,
}

impl TestResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    #[default]
    Pending,
    Started,
    Completed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentResult {
    #[default]
    Pending,
    Passed,
    Failed,
    Skipped,
}

impl SegmentResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for SegmentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The smallest unit of progress an actor reports within a test.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestSegmentInfo {
    pub index: usize,
    pub status: SegmentStatus,
    pub result: SegmentResult,
    #[serde(default)]
    pub time_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_completed: Option<DateTime<Utc>>,
}

impl TestSegmentInfo {
    pub fn pending(index: usize) -> Self {
        Self {
            index,
            status: SegmentStatus::Pending,
            result: SegmentResult::Pending,
            time_started: None,
            time_completed: None,
        }
    }
}

/// One data record's run of a data-driven test.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubtestContext {
    pub data_record_index: usize,
    pub result: TestResult,
    #[serde(default)]
    pub time_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_completed: Option<DateTime<Utc>>,
}

/// Authoritative per-actor progress for one test within a session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActorSessionTestState {
    /// Index of the segment this actor currently has open, `None` before the
    /// first start and after a data-record reset.
    #[serde(default)]
    pub current_segment_index: Option<usize>,
    #[serde(default)]
    pub segments: Vec<TestSegmentInfo>,
    #[serde(default)]
    pub time_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_completed: Option<DateTime<Utc>>,
}

/// Per-actor session progress, one entry per session test.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActorSessionState {
    pub tests: Vec<ActorSessionTestState>,
}

impl ActorSessionState {
    /// Empty per-test state for a session with `test_count` tests.
    pub fn for_tests(test_count: usize) -> Self {
        Self {
            tests: vec![ActorSessionTestState::default(); test_count],
        }
    }
}

/// A required (actor type, tag expressions) pair for a session. Every tag
/// entry is a predicate expression a matching actor must satisfy.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequiredActor {
    pub actor_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A `{name, path}` test selection from a session request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedTest {
    pub name: String,
    pub path: String,
}

/// One selected test within a session, with the aggregate segment view
/// derived from the per-actor states.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestContext {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub data_driven: bool,
    #[serde(default)]
    pub data_record_count: Option<usize>,
    #[serde(default)]
    pub current_data_record_index: Option<usize>,
    pub current_iteration: u32,
    pub segments: Vec<TestSegmentInfo>,
    #[serde(default)]
    pub subtests: Vec<SubtestContext>,
    /// Action log appended verbatim from actor reports.
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(default)]
    pub shared_data: Value,
    pub status: TestStatus,
    pub result: TestResult,
    #[serde(default)]
    pub time_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_completed: Option<DateTime<Utc>>,
}

impl TestContext {
    pub fn last_segment_index(&self) -> usize {
        self.segments.len().saturating_sub(1)
    }
}

/// One orchestrated run of a set of tests across acquired actors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub label: String,
    pub status: SessionStatus,
    pub result: SessionResult,
    pub max_iterations: u32,
    /// 1-based retry pass counter.
    pub current_iteration: u32,
    pub current_test_index: usize,
    pub current_segment_index: usize,
    #[serde(default)]
    pub current_data_record_index: Option<usize>,
    pub required_actors: Vec<RequiredActor>,
    /// Per-actor authoritative progress, keyed by actor id. Populated when
    /// the session transitions to `Started`.
    #[serde(default)]
    pub actors: HashMap<String, ActorSessionState>,
    pub tests: Vec<TestContext>,
    /// Selections that did not resolve against the catalog. Kept for audit;
    /// they are excluded from execution.
    #[serde(default)]
    pub missing_tests: Vec<SelectedTest>,
    pub time_created: DateTime<Utc>,
    #[serde(default)]
    pub time_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_completed: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn current_test(&self) -> Option<&TestContext> {
        self.tests.get(self.current_test_index)
    }
}

/// Segment status report pushed by an actor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SegmentUpdate {
    pub status: SegmentStatus,
    #[serde(default)]
    pub result: Option<SegmentResult>,
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(default)]
    pub data_record_count: Option<usize>,
    #[serde(default)]
    pub stack_trace: Option<String>,
}

impl SegmentUpdate {
    pub fn started() -> Self {
        Self {
            status: SegmentStatus::Started,
            ..Self::default()
        }
    }

    pub fn completed(result: SegmentResult) -> Self {
        Self {
            status: SegmentStatus::Completed,
            result: Some(result),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::AcquiringActors).expect("serialize");
        assert_eq!(json, "\"acquiring_actors\"");
        let back: SessionStatus = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, SessionStatus::AcquiringActors);
    }

    #[test]
    fn actor_session_state_sizes_to_test_count() {
        let state = ActorSessionState::for_tests(3);
        assert_eq!(state.tests.len(), 3);
        assert!(state.tests.iter().all(|t| t.current_segment_index.is_none()));
        assert!(state.tests.iter().all(|t| t.segments.is_empty()));
    }

    #[test]
    fn pending_segment_starts_unresolved() {
        let segment = TestSegmentInfo::pending(4);
        assert_eq!(segment.index, 4);
        assert_eq!(segment.status, SegmentStatus::Pending);
        assert_eq!(segment.result, SegmentResult::Pending);
    }
}
