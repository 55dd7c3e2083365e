//! Session progress state machine.
//!
//! Consumes per-actor segment updates, enforces strict per-actor ordering,
//! aggregates across actors into the test-level segment view, advances the
//! session pointers, and drives data-driven iteration and whole-session
//! retry to a terminal result.
//!
//! The state transition itself is pure (`apply_update` mutates an owned
//! session copy); persistence happens once per call, so a store failure
//! leaves the session in its last durably-written state with no partial
//! aggregate visible.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::{
    ActorSessionTestState, SegmentResult, SegmentStatus, SegmentUpdate, Session, SessionId,
    SessionResult, SessionStatus, SubtestContext, TestContext, TestResult, TestSegmentInfo,
    TestStatus,
};
use crate::notify::Notifier;
use crate::session_log::{LogLevel, SessionLogRecord, SessionLogSink};
use crate::store::{ActorPatch, ActorStore, SessionPatch, SessionStore, Store};

/// What one segment update changed beyond the per-actor transition.
#[derive(Clone, Debug, Default)]
pub struct UpdateOutcome {
    /// Aggregate result when every actor completed the segment this call.
    pub aggregate_segment_completed: Option<SegmentResult>,
    /// Terminal result of the test if this update finalized it.
    pub test_finalized: Option<TestResult>,
    /// Next data record index if a data-driven test advanced.
    pub data_record_advanced: Option<usize>,
    /// New iteration number if a retry pass started.
    pub iteration_started: Option<u32>,
    /// Terminal session result if this update completed the session.
    pub session_completed: Option<SessionResult>,
}

/// Aggregate view of one test segment across every actor in the session.
///
/// `COMPLETED` only when every actor's corresponding segment is completed;
/// `PASSED` only when additionally every result is passed. Recomputed from
/// scratch on each call so cross-actor report order cannot matter.
pub fn compute_current_test_segment_info(
    session: &Session,
    test_index: usize,
    segment_index: usize,
) -> TestSegmentInfo {
    let mut info = TestSegmentInfo::pending(segment_index);
    if session.actors.is_empty() {
        return info;
    }
    let mut any_failed = false;
    let mut any_skipped = false;
    for state in session.actors.values() {
        let Some(segment) = state
            .tests
            .get(test_index)
            .and_then(|test| test.segments.get(segment_index))
        else {
            return info;
        };
        if segment.status != SegmentStatus::Completed {
            return info;
        }
        match segment.result {
            SegmentResult::Failed => any_failed = true,
            SegmentResult::Skipped => any_skipped = true,
            _ => {}
        }
    }
    info.status = SegmentStatus::Completed;
    info.result = if any_failed {
        SegmentResult::Failed
    } else if any_skipped {
        SegmentResult::Skipped
    } else {
        SegmentResult::Passed
    };
    info
}

/// Apply one actor's segment update to a session document.
///
/// Transition violations are rejected before any mutation, so an `Err`
/// leaves the session untouched.
pub fn apply_update(
    session: &mut Session,
    actor_id: &str,
    test_index: usize,
    segment_index: usize,
    update: &SegmentUpdate,
    now: DateTime<Utc>,
) -> EngineResult<UpdateOutcome> {
    let mut outcome = UpdateOutcome::default();
    if session.is_completed() {
        return Err(EngineError::SessionCompleted(session.id.clone()));
    }
    let test_count = session.tests.len();
    if test_index >= test_count {
        return Err(EngineError::TestIndexOutOfRange {
            session_id: session.id.clone(),
            test_index,
            test_count,
        });
    }

    // Per-actor transition, strictly ordered.
    let test_segment_count = session.tests[test_index].segments.len();
    {
        let session_id = session.id.clone();
        let Some(actor_state) = session.actors.get_mut(actor_id) else {
            return Err(EngineError::ActorNotInSession {
                session_id,
                actor_id: actor_id.to_string(),
            });
        };
        if actor_state.tests.len() < test_count {
            actor_state
                .tests
                .resize(test_count, ActorSessionTestState::default());
        }
        let actor_test = &mut actor_state.tests[test_index];

        match update.status {
            SegmentStatus::Started => {
                if actor_test.current_segment_index == Some(segment_index) {
                    return Err(EngineError::SegmentAlreadyStarted {
                        actor_id: actor_id.to_string(),
                        test_index,
                        segment_index,
                    });
                }
                if segment_index > 0 {
                    let previous_completed = actor_test
                        .segments
                        .get(segment_index - 1)
                        .map(|segment| segment.status == SegmentStatus::Completed)
                        .unwrap_or(false);
                    if !previous_completed {
                        return Err(EngineError::SegmentOutOfOrder {
                            actor_id: actor_id.to_string(),
                            test_index,
                            segment_index,
                            detail: format!("segment {} is not completed", segment_index - 1),
                        });
                    }
                }
                while actor_test.segments.len() <= segment_index {
                    let index = actor_test.segments.len();
                    actor_test.segments.push(TestSegmentInfo::pending(index));
                }
                let segment = &mut actor_test.segments[segment_index];
                segment.status = SegmentStatus::Started;
                segment.time_started.get_or_insert(now);
                actor_test.current_segment_index = Some(segment_index);
                actor_test.time_started.get_or_insert(now);
            }
            SegmentStatus::Completed => {
                if actor_test.current_segment_index != Some(segment_index) {
                    return Err(EngineError::SegmentOutOfOrder {
                        actor_id: actor_id.to_string(),
                        test_index,
                        segment_index,
                        detail: format!(
                            "only the open segment {:?} can be completed",
                            actor_test.current_segment_index
                        ),
                    });
                }
                let result = update.result.ok_or(EngineError::MissingSegmentResult {
                    segment_index,
                })?;
                let segment = &mut actor_test.segments[segment_index];
                if segment.status == SegmentStatus::Completed {
                    return Err(EngineError::SegmentOutOfOrder {
                        actor_id: actor_id.to_string(),
                        test_index,
                        segment_index,
                        detail: "segment is already completed".to_string(),
                    });
                }
                segment.status = SegmentStatus::Completed;
                segment.result = result;
                segment.time_completed = Some(now);
                if segment_index + 1 >= test_segment_count {
                    actor_test.time_completed = Some(now);
                }
            }
            other => return Err(EngineError::InvalidSegmentStatus(other)),
        }
    }

    // Test- and session-level bookkeeping.
    let test = &mut session.tests[test_index];
    if update.status == SegmentStatus::Started {
        if test.status == TestStatus::Pending {
            test.status = TestStatus::Started;
        }
        test.time_started.get_or_insert(now);
        session.time_started.get_or_insert(now);
    }

    for action in &update.actions {
        test.actions.push(normalize_action(action.clone()));
    }

    if let Some(count) = update.data_record_count
        && test.data_driven
        && test.data_record_count.is_none()
        && session.current_segment_index == 0
    {
        test.data_record_count = Some(count);
    }

    // Cross-actor aggregation for this test segment.
    let aggregate = compute_current_test_segment_info(session, test_index, segment_index);
    if aggregate.status == SegmentStatus::Completed {
        outcome.aggregate_segment_completed = Some(aggregate.result);

        let test = &mut session.tests[test_index];
        while test.segments.len() <= segment_index {
            let index = test.segments.len();
            test.segments.push(TestSegmentInfo::pending(index));
        }
        let segment = &mut test.segments[segment_index];
        segment.status = SegmentStatus::Completed;
        segment.result = aggregate.result;
        segment.time_started.get_or_insert(now);
        segment.time_completed = Some(now);

        let failed = aggregate.result == SegmentResult::Failed;
        let last = segment_index + 1 >= test.segments.len();
        if last || failed {
            if test.data_driven {
                finalize_data_record(session, test_index, aggregate.result, now, &mut outcome);
            } else {
                let result = test_result_from_segments(&session.tests[test_index]);
                finalize_test(&mut session.tests[test_index], result, now);
                outcome.test_finalized = Some(result);
                advance_session(session, now, &mut outcome);
            }
        } else if test_index == session.current_test_index {
            session.current_segment_index = segment_index + 1;
        }
    }

    session.last_activity = now;
    Ok(outcome)
}

fn normalize_action(mut action: Value) -> Value {
    if let Some(object) = action.as_object_mut()
        && !object.contains_key("duration_ms")
        && let Some(duration) = object.get("duration").and_then(Value::as_f64)
    {
        object.insert("duration_ms".to_string(), Value::from(duration * 1000.0));
    }
    action
}

fn test_result_from_segments(test: &TestContext) -> TestResult {
    if test
        .segments
        .iter()
        .any(|segment| segment.result == SegmentResult::Failed)
    {
        TestResult::Failed
    } else if test
        .segments
        .iter()
        .any(|segment| segment.result == SegmentResult::Skipped)
    {
        TestResult::Skipped
    } else {
        TestResult::Passed
    }
}

fn finalize_test(test: &mut TestContext, result: TestResult, now: DateTime<Utc>) {
    test.status = TestStatus::Completed;
    test.result = result;
    test.time_completed = Some(now);
}

/// Close out the current data record as a subtest, then either move to the
/// next un-passed record or finalize the whole test on the "all subtests
/// passed" criterion.
fn finalize_data_record(
    session: &mut Session,
    test_index: usize,
    aggregate_result: SegmentResult,
    now: DateTime<Utc>,
    outcome: &mut UpdateOutcome,
) {
    let test = &mut session.tests[test_index];
    let record_index = test.current_data_record_index.unwrap_or(0);
    let record_result = match aggregate_result {
        SegmentResult::Failed => TestResult::Failed,
        SegmentResult::Skipped => TestResult::Skipped,
        _ => TestResult::Passed,
    };
    test.subtests.push(SubtestContext {
        data_record_index: record_index,
        result: record_result,
        time_started: test.time_started,
        time_completed: Some(now),
    });

    if let Some(next) = next_unpassed_record(test, record_index + 1) {
        reset_test_segments(test);
        test.current_data_record_index = Some(next);
        reset_actor_test_state(session, test_index);
        if test_index == session.current_test_index {
            session.current_segment_index = 0;
            session.current_data_record_index = Some(next);
        }
        outcome.data_record_advanced = Some(next);
        return;
    }

    let passed = match test.data_record_count {
        Some(count) => (0..count).all(|index| record_passed(test, index)),
        None => test
            .subtests
            .last()
            .map(|subtest| subtest.result == TestResult::Passed)
            .unwrap_or(false),
    };
    let result = if passed {
        TestResult::Passed
    } else {
        TestResult::Failed
    };
    finalize_test(&mut session.tests[test_index], result, now);
    outcome.test_finalized = Some(result);
    advance_session(session, now, outcome);
}

fn record_passed(test: &TestContext, record_index: usize) -> bool {
    test.subtests
        .iter()
        .rev()
        .find(|subtest| subtest.data_record_index == record_index)
        .map(|subtest| subtest.result == TestResult::Passed)
        .unwrap_or(false)
}

fn next_unpassed_record(test: &TestContext, from: usize) -> Option<usize> {
    let count = test.data_record_count?;
    (from..count).find(|index| !record_passed(test, *index))
}

fn reset_test_segments(test: &mut TestContext) {
    for segment in &mut test.segments {
        *segment = TestSegmentInfo::pending(segment.index);
    }
}

fn reset_actor_test_state(session: &mut Session, test_index: usize) {
    for state in session.actors.values_mut() {
        if let Some(actor_test) = state.tests.get_mut(test_index) {
            *actor_test = ActorSessionTestState::default();
        }
    }
}

/// Prepare a finished (non-passed) test for another iteration. Subtest
/// history survives so already-passed data records are not re-run.
fn reset_test_for_retry(test: &mut TestContext) {
    test.status = TestStatus::Pending;
    test.result = TestResult::Pending;
    test.current_iteration += 1;
    test.time_started = None;
    test.time_completed = None;
    reset_test_segments(test);
    if test.data_driven {
        let first = (0..test.data_record_count.unwrap_or(0))
            .find(|index| !record_passed(test, *index))
            .unwrap_or(0);
        test.current_data_record_index = Some(first);
    }
}

/// Move the session pointers past a finalized test: next pending test, a new
/// retry iteration, or a terminal session result.
fn advance_session(session: &mut Session, now: DateTime<Utc>, outcome: &mut UpdateOutcome) {
    let next = session
        .tests
        .iter()
        .enumerate()
        .skip(session.current_test_index + 1)
        .find(|(_, test)| test.status == TestStatus::Pending)
        .map(|(index, _)| index);
    if let Some(next) = next {
        session.current_test_index = next;
        session.current_segment_index = 0;
        session.current_data_record_index = session.tests[next].current_data_record_index;
        return;
    }

    let all_passed = session
        .tests
        .iter()
        .all(|test| test.result == TestResult::Passed);
    if all_passed {
        complete_session_state(session, SessionResult::Passed, now);
        outcome.session_completed = Some(SessionResult::Passed);
        return;
    }

    if session.current_iteration < session.max_iterations {
        let mut first_reset = None;
        for (index, test) in session.tests.iter_mut().enumerate() {
            if matches!(test.result, TestResult::Failed | TestResult::Skipped) {
                reset_test_for_retry(test);
                first_reset.get_or_insert(index);
            }
        }
        if let Some(first) = first_reset {
            let reset_indices: Vec<usize> = session
                .tests
                .iter()
                .enumerate()
                .filter(|(_, test)| test.status == TestStatus::Pending)
                .map(|(index, _)| index)
                .collect();
            for index in reset_indices {
                reset_actor_test_state(session, index);
            }
            session.current_iteration += 1;
            session.current_test_index = first;
            session.current_segment_index = 0;
            session.current_data_record_index =
                session.tests[first].current_data_record_index;
            outcome.iteration_started = Some(session.current_iteration);
            return;
        }
    }

    complete_session_state(session, SessionResult::Failed, now);
    outcome.session_completed = Some(SessionResult::Failed);
}

fn complete_session_state(session: &mut Session, result: SessionResult, now: DateTime<Utc>) {
    session.status = SessionStatus::Completed;
    session.result = result;
    session.time_completed = Some(now);
}

/// Mark every incomplete test cancelled and the session terminally
/// cancelled. Completed tests keep their recorded results.
pub(crate) fn mark_cancelled(session: &mut Session, now: DateTime<Utc>) {
    for test in &mut session.tests {
        if test.status != TestStatus::Completed {
            test.status = TestStatus::Completed;
            if test.result == TestResult::Pending {
                test.result = TestResult::Cancelled;
            }
            test.time_completed = Some(now);
        }
    }
    complete_session_state(session, SessionResult::Cancelled, now);
}

/// Store-backed wrapper around the pure state machine: loads the session,
/// applies one update, persists the result and fans out notifications.
pub struct ProgressEngine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    log: Arc<dyn SessionLogSink>,
}

impl ProgressEngine {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        log: Arc<dyn SessionLogSink>,
    ) -> Self {
        Self {
            store,
            notifier,
            log,
        }
    }

    pub async fn apply_segment_update(
        &self,
        session_id: &SessionId,
        actor_id: &str,
        test_index: usize,
        segment_index: usize,
        update: SegmentUpdate,
    ) -> EngineResult<UpdateOutcome> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.clone()))?;

        let now = Utc::now();
        let outcome = apply_update(
            &mut session,
            actor_id,
            test_index,
            segment_index,
            &update,
            now,
        )?;

        if let Err(err) = self
            .store
            .update_session(session_id, SessionPatch::snapshot(&session))
            .await
        {
            error!(
                session_id = %session_id,
                actor_id,
                error = %err,
                "failed to persist segment update; mutation abandoned"
            );
            return Err(err.into());
        }

        if let Some(trace) = &update.stack_trace {
            self.log_session(
                session_id,
                LogLevel::Error,
                format!(
                    "actor {actor_id} reported a failure in test {test_index} \
                     segment {segment_index}: {trace}"
                ),
            )
            .await;
        }
        if let Some(next) = outcome.data_record_advanced {
            self.log_session(
                session_id,
                LogLevel::Info,
                format!("test {test_index} advanced to data record {next}"),
            )
            .await;
        }
        if let Some(result) = outcome.test_finalized {
            self.log_session(
                session_id,
                LogLevel::Info,
                format!("test {test_index} completed with result {result}"),
            )
            .await;
        }
        if let Some(iteration) = outcome.iteration_started {
            self.log_session(
                session_id,
                LogLevel::Info,
                format!("starting iteration {iteration}"),
            )
            .await;
        }

        if let Some(result) = outcome.session_completed {
            self.release_session_actors(session_id).await?;
            self.log_session(
                session_id,
                LogLevel::Info,
                format!("session completed with result {result}"),
            )
            .await;
            self.notifier
                .session_status_changed(session_id, SessionStatus::Completed)
                .await;
            metrics::counter!("ensemble_sessions_completed_total").increment(1);
            info!(session_id = %session_id, result = %result, "session completed");
        }
        self.notifier.session_progress(session_id).await;
        Ok(outcome)
    }

    /// Cancel a session: mark incomplete work, free its actors, record the
    /// reason. Returns false when the session is gone or already completed.
    pub async fn cancel_session(&self, session_id: &SessionId, reason: &str) -> EngineResult<bool> {
        let Some(mut session) = self.store.get_session(session_id).await? else {
            return Ok(false);
        };
        if session.is_completed() {
            return Ok(false);
        }
        mark_cancelled(&mut session, Utc::now());
        self.store
            .update_session(session_id, SessionPatch::snapshot(&session))
            .await?;
        self.release_session_actors(session_id).await?;
        self.log_session(
            session_id,
            LogLevel::Warn,
            format!("session cancelled: {reason}"),
        )
        .await;
        self.notifier
            .session_status_changed(session_id, SessionStatus::Completed)
            .await;
        metrics::counter!("ensemble_sessions_cancelled_total").increment(1);
        info!(session_id = %session_id, reason, "session cancelled");
        Ok(true)
    }

    /// Clear `session_id` on every actor assigned to the session.
    pub(crate) async fn release_session_actors(&self, session_id: &SessionId) -> EngineResult<()> {
        for actor in self.store.list_actors().await? {
            if actor.session_id.as_ref() == Some(session_id) {
                self.store
                    .update_actor(&actor.id, ActorPatch::clear_session())
                    .await?;
                self.notifier.actors_changed(&actor.id).await;
            }
        }
        Ok(())
    }

    pub(crate) async fn log_session(
        &self,
        session_id: &SessionId,
        level: LogLevel,
        message: String,
    ) {
        let record = SessionLogRecord::new(session_id.clone(), level, message);
        if let Err(err) = self.log.append(record).await {
            warn!(session_id = %session_id, error = %err, "failed to append session log record");
        }
    }
}
