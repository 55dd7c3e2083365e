//! Background cleanup task.
//!
//! One periodic sweep keeps the system self-healing: sessions stuck in
//! actor acquisition or inactive after starting are cancelled, old
//! completed sessions are retired from history (record, log and artifacts),
//! and idle unassigned actors are evicted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::EngineResult;
use crate::model::{Session, SessionId, SessionStatus};
use crate::progress::ProgressEngine;
use crate::registry::ActorRegistry;
use crate::session_log::SessionLogSink;
use crate::store::{SessionStore, Store, StoreResult};

const SESSION_PAGE_SIZE: usize = 100;

/// External collaborator that removes artifact files referenced by a
/// session (screenshots, videos, downloads).
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn remove_session_artifacts(&self, session_id: &SessionId) -> StoreResult<()>;
}

/// Artifact store for deployments that keep no artifacts.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopArtifactStore;

#[async_trait]
impl ArtifactStore for NoopArtifactStore {
    async fn remove_session_artifacts(&self, _session_id: &SessionId) -> StoreResult<()> {
        Ok(())
    }
}

/// Configuration for the cleanup task.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How often to run a sweep.
    pub interval: Duration,
    /// Cancel sessions stuck acquiring actors after this long. `None` disables.
    pub acquire_actors_timeout: Option<Duration>,
    /// Cancel started sessions without activity for this long. `None` disables.
    pub no_activity_timeout: Option<Duration>,
    /// Evict unassigned actors unseen for this long.
    pub actor_idle_timeout: Duration,
    /// Completed sessions retained before count-based retirement.
    pub history_max_count: usize,
    /// Completed session retention window. `None` disables age-based retirement.
    pub history_max_age: Option<Duration>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            acquire_actors_timeout: Some(Duration::from_secs(1200)),
            no_activity_timeout: Some(Duration::from_secs(600)),
            actor_idle_timeout: Duration::from_secs(8),
            history_max_count: 100,
            history_max_age: Some(Duration::from_secs(30 * 24 * 60 * 60)),
        }
    }
}

impl CleanupConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.cleanup_interval(),
            acquire_actors_timeout: config.acquire_actors_timeout(),
            no_activity_timeout: config.no_activity_timeout(),
            actor_idle_timeout: config.actor_idle_timeout(),
            history_max_count: config.session_history_max_count,
            history_max_age: config.session_history_max_age(),
        }
    }
}

/// Background cleanup task.
pub struct CleanupTask {
    store: Arc<dyn Store>,
    progress: Arc<ProgressEngine>,
    registry: Arc<ActorRegistry>,
    log: Arc<dyn SessionLogSink>,
    artifacts: Arc<dyn ArtifactStore>,
    config: CleanupConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl CleanupTask {
    pub fn new(
        store: Arc<dyn Store>,
        progress: Arc<ProgressEngine>,
        registry: Arc<ActorRegistry>,
        log: Arc<dyn SessionLogSink>,
        artifacts: Arc<dyn ArtifactStore>,
        config: CleanupConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            progress,
            registry,
            log,
            artifacts,
            config,
            shutdown_rx,
        }
    }

    /// Run the cleanup loop.
    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.interval.as_millis(),
            history_max_count = self.config.history_max_count,
            "cleanup task started"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("cleanup task shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!(error = %err, "cleanup sweep failed");
                    }
                }
            }
        }
    }

    async fn sweep(&self) -> EngineResult<()> {
        let now = Utc::now();
        let mut completed = Vec::new();
        let mut skip = 0usize;
        loop {
            let page = self.store.list_sessions(SESSION_PAGE_SIZE, skip).await?;
            let page_len = page.len();
            for session in page {
                match session.status {
                    SessionStatus::AcquiringActors => {
                        self.cancel_if_stuck_acquiring(&session, now).await?;
                    }
                    SessionStatus::Started => {
                        self.cancel_if_inactive(&session, now).await?;
                    }
                    SessionStatus::Completed => completed.push(session),
                }
            }
            if page_len < SESSION_PAGE_SIZE {
                break;
            }
            skip += SESSION_PAGE_SIZE;
        }

        self.retire_history(completed, now).await;

        self.registry
            .evict_idle(self.config.actor_idle_timeout)
            .await?;
        Ok(())
    }

    async fn cancel_if_stuck_acquiring(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let Some(timeout) = self.config.acquire_actors_timeout else {
            return Ok(());
        };
        if age(now, session.time_created) >= timeout {
            self.progress
                .cancel_session(
                    &session.id,
                    &format!(
                        "actor acquisition timed out after {}s",
                        timeout.as_secs()
                    ),
                )
                .await?;
        }
        Ok(())
    }

    async fn cancel_if_inactive(&self, session: &Session, now: DateTime<Utc>) -> EngineResult<()> {
        let Some(timeout) = self.config.no_activity_timeout else {
            return Ok(());
        };
        if age(now, session.last_activity) >= timeout {
            self.progress
                .cancel_session(
                    &session.id,
                    &format!("no session activity for {}s", timeout.as_secs()),
                )
                .await?;
        }
        Ok(())
    }

    /// Retire completed sessions above the history cap or past the retention
    /// window: persisted record, session log and artifacts all go.
    async fn retire_history(&self, completed: Vec<Session>, now: DateTime<Utc>) {
        for (index, session) in completed.iter().enumerate() {
            let over_count = index >= self.config.history_max_count;
            let over_age = self
                .config
                .history_max_age
                .map(|window| {
                    age(now, session.time_completed.unwrap_or(session.time_created)) >= window
                })
                .unwrap_or(false);
            if !(over_count || over_age) {
                continue;
            }

            debug!(session_id = %session.id, over_count, over_age, "retiring session");
            if let Err(err) = self.store.delete_session(&session.id).await {
                warn!(session_id = %session.id, error = %err, "failed to delete session record");
                continue;
            }
            if let Err(err) = self.log.remove(&session.id).await {
                warn!(session_id = %session.id, error = %err, "failed to delete session log");
            }
            if let Err(err) = self.artifacts.remove_session_artifacts(&session.id).await {
                warn!(session_id = %session.id, error = %err, "failed to delete session artifacts");
            }
            metrics::counter!("ensemble_sessions_retired_total").increment(1);
        }
    }
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or_default()
}

/// Convenience function to spawn a cleanup task.
#[allow(clippy::too_many_arguments)]
pub fn spawn_cleanup(
    store: Arc<dyn Store>,
    progress: Arc<ProgressEngine>,
    registry: Arc<ActorRegistry>,
    log: Arc<dyn SessionLogSink>,
    artifacts: Arc<dyn ArtifactStore>,
    config: CleanupConfig,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = CleanupTask::new(store, progress, registry, log, artifacts, config, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::model::{Actor, SessionResult};
    use crate::notify::NoopNotifier;
    use crate::session_log::{LogLevel, MemorySessionLog, SessionLogRecord};
    use crate::store::{ActorStore, MemoryStore, SessionStore};

    fn session(id: &str, status: SessionStatus, created_secs_ago: i64) -> Session {
        let created = Utc::now() - TimeDelta::seconds(created_secs_ago);
        Session {
            id: SessionId::from(id),
            label: id.to_string(),
            status,
            result: if status == SessionStatus::Completed {
                SessionResult::Passed
            } else {
                SessionResult::Pending
            },
            max_iterations: 1,
            current_iteration: 1,
            current_test_index: 0,
            current_segment_index: 0,
            current_data_record_index: None,
            required_actors: Vec::new(),
            actors: Default::default(),
            tests: Vec::new(),
            missing_tests: Vec::new(),
            time_created: created,
            time_started: None,
            time_completed: (status == SessionStatus::Completed).then_some(created),
            last_activity: created,
        }
    }

    struct Fixture {
        store: MemoryStore,
        log: Arc<MemorySessionLog>,
        task: CleanupTask,
    }

    fn fixture(config: CleanupConfig) -> Fixture {
        let store = MemoryStore::new();
        let log = Arc::new(MemorySessionLog::new());
        let progress = Arc::new(ProgressEngine::new(
            Arc::new(store.clone()),
            Arc::new(NoopNotifier),
            log.clone() as Arc<dyn SessionLogSink>,
        ));
        let registry = Arc::new(ActorRegistry::new(
            Arc::new(store.clone()),
            Arc::new(NoopNotifier),
        ));
        let (_tx, shutdown_rx) = watch::channel(false);
        let task = CleanupTask::new(
            Arc::new(store.clone()),
            progress,
            registry,
            log.clone() as Arc<dyn SessionLogSink>,
            Arc::new(NoopArtifactStore),
            config,
            shutdown_rx,
        );
        Fixture { store, log, task }
    }

    #[tokio::test]
    async fn cancels_sessions_stuck_in_acquisition() {
        let fixture = fixture(CleanupConfig {
            acquire_actors_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        fixture
            .store
            .insert_session(&session("s-stuck", SessionStatus::AcquiringActors, 120))
            .await
            .expect("insert");
        fixture
            .store
            .insert_session(&session("s-fresh", SessionStatus::AcquiringActors, 5))
            .await
            .expect("insert");

        fixture.task.sweep().await.expect("sweep");

        let stuck = fixture
            .store
            .get_session(&SessionId::from("s-stuck"))
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stuck.status, SessionStatus::Completed);
        assert_eq!(stuck.result, SessionResult::Cancelled);

        let fresh = fixture
            .store
            .get_session(&SessionId::from("s-fresh"))
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(fresh.status, SessionStatus::AcquiringActors);
    }

    #[tokio::test]
    async fn cancels_started_sessions_without_activity() {
        let fixture = fixture(CleanupConfig {
            no_activity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let mut stale = session("s-stale", SessionStatus::Started, 600);
        stale.last_activity = Utc::now() - TimeDelta::seconds(300);
        fixture.store.insert_session(&stale).await.expect("insert");

        let mut active = session("s-active", SessionStatus::Started, 600);
        active.last_activity = Utc::now();
        fixture.store.insert_session(&active).await.expect("insert");

        fixture.task.sweep().await.expect("sweep");

        let stale = fixture
            .store
            .get_session(&SessionId::from("s-stale"))
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stale.result, SessionResult::Cancelled);

        let active = fixture
            .store
            .get_session(&SessionId::from("s-active"))
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(active.status, SessionStatus::Started);
    }

    #[tokio::test]
    async fn cancellation_frees_assigned_actors() {
        let fixture = fixture(CleanupConfig {
            no_activity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let mut stale = session("s-stale", SessionStatus::Started, 600);
        stale.last_activity = Utc::now() - TimeDelta::seconds(300);
        fixture.store.insert_session(&stale).await.expect("insert");

        let actor = Actor {
            id: "a-1".to_string(),
            actor_type: "android".to_string(),
            tags: vec![],
            ip: None,
            last_seen: Utc::now(),
            session_id: Some(stale.id.clone()),
        };
        fixture.store.insert_actor(&actor).await.expect("insert");

        fixture.task.sweep().await.expect("sweep");

        let freed = fixture
            .store
            .get_actor("a-1")
            .await
            .expect("get")
            .expect("exists");
        assert!(freed.session_id.is_none());
    }

    #[tokio::test]
    async fn retires_history_beyond_max_count() {
        let fixture = fixture(CleanupConfig {
            history_max_count: 2,
            history_max_age: None,
            ..Default::default()
        });
        // Newest first by creation time: s-3, s-2, s-1.
        for (id, age) in [("s-1", 300), ("s-2", 200), ("s-3", 100)] {
            fixture
                .store
                .insert_session(&session(id, SessionStatus::Completed, age))
                .await
                .expect("insert");
        }
        fixture
            .log
            .append(SessionLogRecord::new(
                SessionId::from("s-1"),
                LogLevel::Info,
                "old session",
            ))
            .await
            .expect("append");

        fixture.task.sweep().await.expect("sweep");

        assert!(
            fixture
                .store
                .get_session(&SessionId::from("s-1"))
                .await
                .expect("get")
                .is_none()
        );
        assert!(
            fixture
                .store
                .get_session(&SessionId::from("s-2"))
                .await
                .expect("get")
                .is_some()
        );
        assert!(
            fixture
                .store
                .get_session(&SessionId::from("s-3"))
                .await
                .expect("get")
                .is_some()
        );
        // The retired session's log went with it.
        assert!(
            fixture
                .log
                .read(&SessionId::from("s-1"))
                .await
                .expect("read")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn retires_history_beyond_max_age() {
        let fixture = fixture(CleanupConfig {
            history_max_count: 100,
            history_max_age: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        fixture
            .store
            .insert_session(&session("s-old", SessionStatus::Completed, 600))
            .await
            .expect("insert");
        fixture
            .store
            .insert_session(&session("s-new", SessionStatus::Completed, 5))
            .await
            .expect("insert");

        fixture.task.sweep().await.expect("sweep");

        assert!(
            fixture
                .store
                .get_session(&SessionId::from("s-old"))
                .await
                .expect("get")
                .is_none()
        );
        assert!(
            fixture
                .store
                .get_session(&SessionId::from("s-new"))
                .await
                .expect("get")
                .is_some()
        );
    }

    #[tokio::test]
    async fn evicts_idle_actors_during_sweep() {
        let fixture = fixture(CleanupConfig {
            actor_idle_timeout: Duration::from_secs(8),
            ..Default::default()
        });
        let mut idle = Actor {
            id: "a-idle".to_string(),
            actor_type: "android".to_string(),
            tags: vec![],
            ip: None,
            last_seen: Utc::now() - TimeDelta::seconds(60),
            session_id: None,
        };
        fixture.store.insert_actor(&idle).await.expect("insert");
        idle.id = "a-held".to_string();
        idle.session_id = Some(SessionId::from("s-1"));
        fixture.store.insert_actor(&idle).await.expect("insert");

        fixture.task.sweep().await.expect("sweep");

        assert!(fixture.store.get_actor("a-idle").await.expect("get").is_none());
        assert!(fixture.store.get_actor("a-held").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn disabled_timeouts_leave_sessions_alone() {
        let fixture = fixture(CleanupConfig {
            acquire_actors_timeout: None,
            no_activity_timeout: None,
            ..Default::default()
        });
        fixture
            .store
            .insert_session(&session(
                "s-ancient",
                SessionStatus::AcquiringActors,
                100_000,
            ))
            .await
            .expect("insert");

        fixture.task.sweep().await.expect("sweep");

        let stored = fixture
            .store
            .get_session(&SessionId::from("s-ancient"))
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, SessionStatus::AcquiringActors);
    }
}
