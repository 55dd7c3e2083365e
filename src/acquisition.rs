//! Per-session actor acquisition task.
//!
//! Each session in `ACQUIRING_ACTORS` owns one background task that retries
//! on a fixed cadence until every required actor type is assigned, the
//! session disappears or completes externally, or the acquisition timeout
//! elapses and the session is cancelled.
//!
//! Assignment is optimistic: a conditional store write followed by a
//! re-read. A lost race is not an error, the requirement simply stays
//! unsatisfied until the next tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::error::EngineResult;
use crate::model::{
    Actor, ActorGroup, ActorSessionState, RequiredActor, Session, SessionId, SessionStatus,
};
use crate::notify::Notifier;
use crate::progress::ProgressEngine;
use crate::registry::{actor_matches_requirement, assigned_count_in_group, groups_for_actor};
use crate::session_log::LogLevel;
use crate::store::{ActorStore, SessionPatch, SessionStore, Store};

/// Configuration for one acquisition task.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Retry cadence.
    pub retry_interval: Duration,
    /// Give up and cancel the session after this long. `None` disables the
    /// timeout entirely; callers must not conflate it with "expired".
    pub timeout: Option<Duration>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(1200)),
        }
    }
}

enum Tick {
    /// Every required actor is assigned; the session is started.
    Satisfied,
    /// Still waiting on at least one requirement.
    Pending,
    /// Session gone, externally completed, or timed out.
    Stop,
}

pub struct AcquisitionTask {
    session_id: SessionId,
    store: Arc<dyn Store>,
    progress: Arc<ProgressEngine>,
    notifier: Arc<dyn Notifier>,
    groups: Vec<ActorGroup>,
    config: AcquisitionConfig,
    shutdown_rx: watch::Receiver<bool>,
    /// Groups already reported as saturated, so the condition is logged once
    /// per session.
    saturated_logged: HashSet<String>,
}

impl AcquisitionTask {
    pub fn new(
        session_id: SessionId,
        store: Arc<dyn Store>,
        progress: Arc<ProgressEngine>,
        notifier: Arc<dyn Notifier>,
        groups: Vec<ActorGroup>,
        config: AcquisitionConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            session_id,
            store,
            progress,
            notifier,
            groups,
            config,
            shutdown_rx,
            saturated_logged: HashSet::new(),
        }
    }

    /// Run the acquisition retry loop.
    pub async fn run(mut self) {
        info!(
            session_id = %self.session_id,
            retry_interval_ms = self.config.retry_interval.as_millis(),
            timeout_secs = self.config.timeout.map(|t| t.as_secs()),
            "actor acquisition started"
        );

        let started_at = Instant::now();
        let mut ticker = interval(self.config.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        debug!(session_id = %self.session_id, "actor acquisition shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.tick(started_at).await {
                        Ok(Tick::Pending) => {}
                        Ok(Tick::Satisfied) => {
                            break;
                        }
                        Ok(Tick::Stop) => {
                            debug!(session_id = %self.session_id, "actor acquisition stopped");
                            break;
                        }
                        Err(err) => {
                            // Transient persistence trouble; keep retrying
                            // until the timeout resolves the session.
                            error!(
                                session_id = %self.session_id,
                                error = %err,
                                "acquisition attempt failed"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn tick(&mut self, started_at: Instant) -> EngineResult<Tick> {
        // Handles externally-cancelled or deleted sessions silently.
        let Some(session) = self.store.get_session(&self.session_id).await? else {
            return Ok(Tick::Stop);
        };
        if session.is_completed() {
            return Ok(Tick::Stop);
        }
        if session.status == SessionStatus::Started {
            return Ok(Tick::Satisfied);
        }

        let mut actors = self.store.list_actors().await?;
        let mut used: HashSet<String> = HashSet::new();
        let mut satisfied = 0usize;

        for requirement in &session.required_actors {
            if let Some(existing) = actors.iter().find(|actor| {
                actor.session_id.as_ref() == Some(&self.session_id)
                    && !used.contains(&actor.id)
                    && self.requirement_matches(actor, requirement)
            }) {
                used.insert(existing.id.clone());
                satisfied += 1;
                continue;
            }
            if let Some(actor_id) = self.acquire_one(requirement, &mut actors).await? {
                used.insert(actor_id);
                satisfied += 1;
            }
        }

        if satisfied == session.required_actors.len() && satisfied > 0 {
            self.transition_started(&session, &actors).await?;
            return Ok(Tick::Satisfied);
        }

        if let Some(timeout) = self.config.timeout
            && started_at.elapsed() >= timeout
        {
            self.progress
                .cancel_session(
                    &self.session_id,
                    &format!(
                        "actor acquisition timed out after {}s",
                        timeout.as_secs()
                    ),
                )
                .await?;
            return Ok(Tick::Stop);
        }
        Ok(Tick::Pending)
    }

    /// Try to assign one free matching actor for a requirement. Returns the
    /// winning actor id, or `None` when no candidate could be committed this
    /// tick.
    async fn acquire_one(
        &mut self,
        requirement: &RequiredActor,
        actors: &mut [Actor],
    ) -> EngineResult<Option<String>> {
        let candidate_ids: Vec<String> = actors
            .iter()
            .filter(|actor| actor.is_free() && self.requirement_matches(actor, requirement))
            .map(|actor| actor.id.clone())
            .collect();

        for candidate_id in candidate_ids {
            let Some(candidate) = actors.iter().find(|actor| actor.id == candidate_id) else {
                continue;
            };

            if let Some(saturated) = self.saturated_group(candidate, actors) {
                if self.saturated_logged.insert(saturated.clone()) {
                    warn!(
                        session_id = %self.session_id,
                        group = %saturated,
                        "actor group saturated; deferring acquisition"
                    );
                    self.progress
                        .log_session(
                            &self.session_id,
                            LogLevel::Warn,
                            format!("actor group {saturated} is at its parallel session limit"),
                        )
                        .await;
                }
                // Do not consume partial group capacity; give up on this
                // actor type until a slot frees up.
                return Ok(None);
            }

            if !self
                .store
                .try_assign_actor(&candidate_id, &self.session_id)
                .await?
            {
                continue;
            }
            // Re-read to confirm the assignment won; a concurrent
            // acquisition may have raced and won first.
            let confirmed = self
                .store
                .get_actor(&candidate_id)
                .await?
                .map(|actor| actor.session_id.as_ref() == Some(&self.session_id))
                .unwrap_or(false);
            if !confirmed {
                debug!(
                    session_id = %self.session_id,
                    actor_id = %candidate_id,
                    "lost acquisition race; will retry"
                );
                continue;
            }

            if let Some(actor) = actors.iter_mut().find(|actor| actor.id == candidate_id) {
                actor.session_id = Some(self.session_id.clone());
            }
            self.notifier.actors_changed(&candidate_id).await;
            debug!(
                session_id = %self.session_id,
                actor_id = %candidate_id,
                actor_type = %requirement.actor_type,
                "actor acquired"
            );
            return Ok(Some(candidate_id));
        }
        Ok(None)
    }

    /// The first group the candidate belongs to whose assignment cap is
    /// already reached, if any.
    fn saturated_group(&self, candidate: &Actor, actors: &[Actor]) -> Option<String> {
        let groups = match groups_for_actor(candidate, &self.groups) {
            Ok(groups) => groups,
            Err(err) => {
                warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "malformed actor group predicate; treating candidate as ungrouped"
                );
                return None;
            }
        };
        for group in groups {
            match assigned_count_in_group(actors, group) {
                Ok(count) if count >= group.max_parallel_sessions => {
                    return Some(group.name.clone());
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        session_id = %self.session_id,
                        group = %group.name,
                        error = %err,
                        "malformed actor group predicate; skipping capacity check"
                    );
                }
            }
        }
        None
    }

    fn requirement_matches(&self, actor: &Actor, requirement: &RequiredActor) -> bool {
        match actor_matches_requirement(actor, requirement) {
            Ok(matched) => matched,
            Err(err) => {
                warn!(
                    session_id = %self.session_id,
                    actor_id = %actor.id,
                    error = %err,
                    "malformed requirement predicate; actor does not match"
                );
                false
            }
        }
    }

    /// Every requirement is covered: snapshot the acquired actors into the
    /// session and transition it to `STARTED`.
    async fn transition_started(&self, session: &Session, actors: &[Actor]) -> EngineResult<()> {
        // A cancellation may have landed while candidates were being
        // committed; a completed session must stay completed.
        let current = self.store.get_session(&self.session_id).await?;
        if current.map(|session| session.is_completed()).unwrap_or(true) {
            return Ok(());
        }
        let now = Utc::now();
        let assigned: Vec<&Actor> = actors
            .iter()
            .filter(|actor| actor.session_id.as_ref() == Some(&self.session_id))
            .collect();
        let snapshot = assigned
            .iter()
            .map(|actor| {
                (
                    actor.id.clone(),
                    ActorSessionState::for_tests(session.tests.len()),
                )
            })
            .collect();

        self.store
            .update_session(
                &self.session_id,
                SessionPatch {
                    status: Some(SessionStatus::Started),
                    actors: Some(snapshot),
                    time_started: Some(now),
                    last_activity: Some(now),
                    ..Default::default()
                },
            )
            .await?;

        self.progress
            .log_session(
                &self.session_id,
                LogLevel::Info,
                format!("session started with {} actors", assigned.len()),
            )
            .await;
        self.notifier
            .session_status_changed(&self.session_id, SessionStatus::Started)
            .await;
        info!(
            session_id = %self.session_id,
            actors = assigned.len(),
            "session started"
        );
        Ok(())
    }
}

/// Handle to a spawned acquisition task.
pub struct AcquisitionHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AcquisitionHandle {
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.trigger_shutdown();
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawn an acquisition task for a freshly-created session.
#[allow(clippy::too_many_arguments)]
pub fn spawn_acquisition(
    session_id: SessionId,
    store: Arc<dyn Store>,
    progress: Arc<ProgressEngine>,
    notifier: Arc<dyn Notifier>,
    groups: Vec<ActorGroup>,
    config: AcquisitionConfig,
) -> AcquisitionHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = AcquisitionTask::new(
        session_id,
        store,
        progress,
        notifier,
        groups,
        config,
        shutdown_rx,
    );
    let handle = tokio::spawn(task.run());
    AcquisitionHandle {
        shutdown_tx,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionResult, TestContext, TestResult, TestSegmentInfo, TestStatus};
    use crate::notify::NoopNotifier;
    use crate::session_log::MemorySessionLog;
    use crate::store::{ActorStore, MemoryStore, SessionStore};

    fn test_context() -> TestContext {
        TestContext {
            name: "t".to_string(),
            path: "suite".to_string(),
            tags: vec![],
            data_driven: false,
            data_record_count: None,
            current_data_record_index: None,
            current_iteration: 1,
            segments: vec![TestSegmentInfo::pending(0)],
            subtests: Vec::new(),
            actions: Vec::new(),
            shared_data: serde_json::Value::Null,
            status: TestStatus::Pending,
            result: TestResult::Pending,
            time_started: None,
            time_completed: None,
        }
    }

    fn acquiring_session(id: &str, required: Vec<RequiredActor>) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::from(id),
            label: id.to_string(),
            status: SessionStatus::AcquiringActors,
            result: SessionResult::Pending,
            max_iterations: 1,
            current_iteration: 1,
            current_test_index: 0,
            current_segment_index: 0,
            current_data_record_index: None,
            required_actors: required,
            actors: Default::default(),
            tests: vec![test_context()],
            missing_tests: Vec::new(),
            time_created: now,
            time_started: None,
            time_completed: None,
            last_activity: now,
        }
    }

    fn required(actor_type: &str) -> RequiredActor {
        RequiredActor {
            actor_type: actor_type.to_string(),
            tags: vec![],
        }
    }

    fn free_actor(id: &str, actor_type: &str, tags: &[&str]) -> Actor {
        Actor {
            id: id.to_string(),
            actor_type: actor_type.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ip: None,
            last_seen: Utc::now(),
            session_id: None,
        }
    }

    struct Fixture {
        store: MemoryStore,
        progress: Arc<ProgressEngine>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = MemoryStore::new();
            let progress = Arc::new(ProgressEngine::new(
                Arc::new(store.clone()),
                Arc::new(NoopNotifier),
                Arc::new(MemorySessionLog::new()),
            ));
            Self { store, progress }
        }

        fn task(
            &self,
            session_id: &str,
            groups: Vec<ActorGroup>,
            config: AcquisitionConfig,
        ) -> AcquisitionTask {
            let (_tx, shutdown_rx) = watch::channel(false);
            AcquisitionTask::new(
                SessionId::from(session_id),
                Arc::new(self.store.clone()),
                Arc::clone(&self.progress),
                Arc::new(NoopNotifier),
                groups,
                config,
                shutdown_rx,
            )
        }
    }

    #[tokio::test]
    async fn acquires_and_starts_when_all_types_present() {
        let fixture = Fixture::new();
        let session = acquiring_session("s-1", vec![required("android"), required("ios")]);
        fixture.store.insert_session(&session).await.expect("insert");
        fixture
            .store
            .insert_actor(&free_actor("a-1", "android", &[]))
            .await
            .expect("insert");
        fixture
            .store
            .insert_actor(&free_actor("a-2", "ios", &[]))
            .await
            .expect("insert");

        let mut task = fixture.task("s-1", vec![], AcquisitionConfig::default());
        let tick = task.tick(Instant::now()).await.expect("tick");
        assert!(matches!(tick, Tick::Satisfied));

        let stored = fixture
            .store
            .get_session(&session.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, SessionStatus::Started);
        assert!(stored.time_started.is_some());
        assert_eq!(stored.actors.len(), 2);
        assert!(stored.actors.values().all(|state| state.tests.len() == 1));

        let actor = fixture
            .store
            .get_actor("a-1")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(actor.session_id, Some(session.id.clone()));
    }

    #[tokio::test]
    async fn stays_pending_until_every_type_is_available() {
        let fixture = Fixture::new();
        let session = acquiring_session("s-1", vec![required("android"), required("ios")]);
        fixture.store.insert_session(&session).await.expect("insert");
        fixture
            .store
            .insert_actor(&free_actor("a-1", "android", &[]))
            .await
            .expect("insert");

        let mut task = fixture.task("s-1", vec![], AcquisitionConfig::default());
        let tick = task.tick(Instant::now()).await.expect("tick");
        assert!(matches!(tick, Tick::Pending));

        // The one matching actor is held while the session waits.
        let actor = fixture
            .store
            .get_actor("a-1")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(actor.session_id, Some(session.id.clone()));

        // The missing type arrives; the next tick completes acquisition.
        fixture
            .store
            .insert_actor(&free_actor("a-2", "ios", &[]))
            .await
            .expect("insert");
        let tick = task.tick(Instant::now()).await.expect("tick");
        assert!(matches!(tick, Tick::Satisfied));
    }

    #[tokio::test]
    async fn two_sessions_never_share_one_actor() {
        let fixture = Fixture::new();
        let first = acquiring_session("s-1", vec![required("android")]);
        let second = acquiring_session("s-2", vec![required("android")]);
        fixture.store.insert_session(&first).await.expect("insert");
        fixture.store.insert_session(&second).await.expect("insert");
        fixture
            .store
            .insert_actor(&free_actor("a-1", "android", &[]))
            .await
            .expect("insert");

        let mut task_one = fixture.task("s-1", vec![], AcquisitionConfig::default());
        let mut task_two = fixture.task("s-2", vec![], AcquisitionConfig::default());

        let tick_one = task_one.tick(Instant::now()).await.expect("tick");
        let tick_two = task_two.tick(Instant::now()).await.expect("tick");
        assert!(matches!(tick_one, Tick::Satisfied));
        assert!(matches!(tick_two, Tick::Pending));

        let actor = fixture
            .store
            .get_actor("a-1")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(actor.session_id, Some(first.id.clone()));
    }

    #[tokio::test]
    async fn saturated_group_defers_acquisition() {
        let fixture = Fixture::new();
        let session = acquiring_session("s-2", vec![required("android")]);
        fixture.store.insert_session(&session).await.expect("insert");

        // One lab actor already assigned elsewhere, one free.
        let mut busy = free_actor("a-1", "android", &["lab"]);
        busy.session_id = Some(SessionId::from("s-1"));
        fixture.store.insert_actor(&busy).await.expect("insert");
        fixture
            .store
            .insert_actor(&free_actor("a-2", "android", &["lab"]))
            .await
            .expect("insert");

        let groups = vec![ActorGroup {
            name: "lab".to_string(),
            tag_predicate: "lab".to_string(),
            max_parallel_sessions: 1,
        }];
        let mut task = fixture.task("s-2", groups, AcquisitionConfig::default());
        let tick = task.tick(Instant::now()).await.expect("tick");
        assert!(matches!(tick, Tick::Pending));

        let actor = fixture
            .store
            .get_actor("a-2")
            .await
            .expect("get")
            .expect("exists");
        assert!(actor.session_id.is_none());

        // Slot frees up; the next tick acquires.
        fixture
            .store
            .update_actor("a-1", crate::store::ActorPatch::clear_session())
            .await
            .expect("update");
        let tick = task.tick(Instant::now()).await.expect("tick");
        assert!(matches!(tick, Tick::Satisfied));
    }

    #[tokio::test]
    async fn externally_completed_session_stops_silently() {
        let fixture = Fixture::new();
        let mut session = acquiring_session("s-1", vec![required("android")]);
        session.status = SessionStatus::Completed;
        session.result = SessionResult::Cancelled;
        fixture.store.insert_session(&session).await.expect("insert");

        let mut task = fixture.task("s-1", vec![], AcquisitionConfig::default());
        let tick = task.tick(Instant::now()).await.expect("tick");
        assert!(matches!(tick, Tick::Stop));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_the_session() {
        let fixture = Fixture::new();
        let session = acquiring_session("s-1", vec![required("android")]);
        fixture.store.insert_session(&session).await.expect("insert");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = AcquisitionTask::new(
            session.id.clone(),
            Arc::new(fixture.store.clone()),
            Arc::clone(&fixture.progress),
            Arc::new(NoopNotifier),
            vec![],
            AcquisitionConfig {
                retry_interval: Duration::from_secs(1),
                timeout: Some(Duration::from_secs(3)),
            },
            shutdown_rx,
        );
        let handle = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let _ = shutdown_tx.send(true);
        handle.await.expect("join");

        let stored = fixture
            .store
            .get_session(&session.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.result, SessionResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_timeout_keeps_waiting() {
        let fixture = Fixture::new();
        let session = acquiring_session("s-1", vec![required("android")]);
        fixture.store.insert_session(&session).await.expect("insert");

        let mut task = fixture.task(
            "s-1",
            vec![],
            AcquisitionConfig {
                retry_interval: Duration::from_secs(1),
                timeout: None,
            },
        );
        let started_long_ago = Instant::now();
        tokio::time::advance(Duration::from_secs(3600)).await;
        let tick = task.tick(started_long_ago).await.expect("tick");
        assert!(matches!(tick, Tick::Pending));
    }
}
