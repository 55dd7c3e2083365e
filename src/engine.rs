//! Long-lived orchestration service.
//!
//! The engine owns every piece of shared state (store, catalog, registry,
//! notifier, session log, background task handles) so multiple instances
//! can coexist and tests get clean isolation. Request-driven mutations and
//! the recurring background tasks all coordinate through the persisted
//! records, not in-memory locks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::acquisition::{AcquisitionConfig, AcquisitionHandle, spawn_acquisition};
use crate::builder::{SessionBuilder, SessionIdAllocator, SessionRequest};
use crate::catalog::TestCatalog;
use crate::cleanup::{ArtifactStore, CleanupConfig, NoopArtifactStore, spawn_cleanup};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::model::{Actor, SegmentUpdate, Session, SessionId};
use crate::notify::{Notifier, NoopNotifier};
use crate::progress::{ProgressEngine, UpdateOutcome};
use crate::registry::ActorRegistry;
use crate::session_log::{LogLevel, MemorySessionLog, SessionLogRecord, SessionLogSink};
use crate::store::{ActorStore, SessionStore, Store};

pub struct Engine {
    store: Arc<dyn Store>,
    config: Config,
    registry: Arc<ActorRegistry>,
    builder: SessionBuilder,
    progress: Arc<ProgressEngine>,
    notifier: Arc<dyn Notifier>,
    log: Arc<dyn SessionLogSink>,
    artifacts: Arc<dyn ArtifactStore>,
    acquisitions: Mutex<HashMap<SessionId, AcquisitionHandle>>,
    cleanup: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<dyn TestCatalog>, config: Config) -> Self {
        Self::with_collaborators(
            store,
            catalog,
            config,
            Arc::new(NoopNotifier),
            Arc::new(MemorySessionLog::new()),
            Arc::new(NoopArtifactStore),
        )
    }

    pub fn with_collaborators(
        store: Arc<dyn Store>,
        catalog: Arc<dyn TestCatalog>,
        config: Config,
        notifier: Arc<dyn Notifier>,
        log: Arc<dyn SessionLogSink>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let registry = Arc::new(ActorRegistry::new(store.clone(), notifier.clone()));
        let builder = SessionBuilder::new(
            store.clone(),
            catalog,
            Arc::new(SessionIdAllocator::new()),
        );
        let progress = Arc::new(ProgressEngine::new(
            store.clone(),
            notifier.clone(),
            log.clone(),
        ));
        Self {
            store,
            config,
            registry,
            builder,
            progress,
            notifier,
            log,
            artifacts,
            acquisitions: Mutex::new(HashMap::new()),
            cleanup: Mutex::new(None),
        }
    }

    /// Spawn the recurring cleanup task. Idempotent.
    pub async fn start(&self) {
        let mut cleanup = self.cleanup.lock().await;
        if cleanup.is_some() {
            return;
        }
        *cleanup = Some(spawn_cleanup(
            self.store.clone(),
            self.progress.clone(),
            self.registry.clone(),
            self.log.clone(),
            self.artifacts.clone(),
            CleanupConfig::from_config(&self.config),
        ));
    }

    /// Stop the cleanup task and every acquisition task still running.
    pub async fn shutdown(&self) {
        if let Some((handle, shutdown_tx)) = self.cleanup.lock().await.take() {
            let _ = shutdown_tx.send(true);
            if let Err(err) = handle.await {
                warn!(error = %err, "cleanup task did not shut down cleanly");
            }
        }
        let handles: Vec<_> = {
            let mut acquisitions = self.acquisitions.lock().await;
            acquisitions.drain().collect()
        };
        futures::future::join_all(
            handles
                .into_iter()
                .map(|(_, handle)| handle.shutdown()),
        )
        .await;
        info!("engine shut down");
    }

    /// Handle an actor announcement (registration or heartbeat).
    pub async fn announce_actor(
        &self,
        actor_id: &str,
        actor_type: &str,
        tags: Vec<String>,
        ip: Option<String>,
    ) -> EngineResult<Actor> {
        self.registry.announce(actor_id, actor_type, tags, ip).await
    }

    /// Actor heartbeat: refresh liveness and metadata only.
    pub async fn touch_actor(
        &self,
        actor_id: &str,
        tags: Vec<String>,
        ip: Option<String>,
    ) -> EngineResult<()> {
        self.registry.touch(actor_id, tags, ip).await
    }

    /// Build and persist a session, then hand it to an acquisition task.
    pub async fn create_session(&self, request: SessionRequest) -> EngineResult<Session> {
        let session = self.builder.build_session(request).await?;
        self.progress
            .log_session(
                &session.id,
                LogLevel::Info,
                format!(
                    "session created with {} tests, awaiting {} actors",
                    session.tests.len(),
                    session.required_actors.len()
                ),
            )
            .await;

        let handle = spawn_acquisition(
            session.id.clone(),
            self.store.clone(),
            self.progress.clone(),
            self.notifier.clone(),
            self.config.actor_groups.clone(),
            AcquisitionConfig {
                retry_interval: self.config.acquire_retry_interval(),
                timeout: self.config.acquire_actors_timeout(),
            },
        );
        let mut acquisitions = self.acquisitions.lock().await;
        acquisitions.retain(|_, existing| !existing.is_finished());
        acquisitions.insert(session.id.clone(), handle);
        Ok(session)
    }

    /// Apply one actor segment report to its session.
    pub async fn apply_segment_update(
        &self,
        session_id: &SessionId,
        actor_id: &str,
        test_index: usize,
        segment_index: usize,
        update: SegmentUpdate,
    ) -> EngineResult<UpdateOutcome> {
        self.progress
            .apply_segment_update(session_id, actor_id, test_index, segment_index, update)
            .await
    }

    /// Out-of-band critical error from an actor: cancel the session now,
    /// bypassing the cleanup timers.
    pub async fn report_critical_error(
        &self,
        session_id: &SessionId,
        actor_id: &str,
        message: &str,
    ) -> EngineResult<()> {
        self.progress
            .log_session(
                session_id,
                LogLevel::Error,
                format!("critical error reported by actor {actor_id}: {message}"),
            )
            .await;
        self.progress
            .cancel_session(
                session_id,
                &format!("critical error reported by actor {actor_id}"),
            )
            .await?;
        Ok(())
    }

    /// Explicitly cancel a session. Returns false when it was already
    /// completed or does not exist.
    pub async fn cancel_session(&self, session_id: &SessionId, reason: &str) -> EngineResult<bool> {
        self.progress.cancel_session(session_id, reason).await
    }

    pub async fn get_session(&self, session_id: &SessionId) -> EngineResult<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.clone()))
    }

    pub async fn list_sessions(&self, limit: usize, skip: usize) -> EngineResult<Vec<Session>> {
        Ok(self.store.list_sessions(limit, skip).await?)
    }

    pub async fn list_actors(&self) -> EngineResult<Vec<Actor>> {
        Ok(self.store.list_actors().await?)
    }

    pub async fn session_log(&self, session_id: &SessionId) -> EngineResult<Vec<SessionLogRecord>> {
        Ok(self.log.read(session_id).await?)
    }
}
