//! Fire-and-forget notifications for observers (web UI, websocket pushes).
//!
//! Implementations must swallow their own failures; a lost notification
//! never affects orchestration correctness.

use async_trait::async_trait;

use crate::model::{SessionId, SessionStatus};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn actors_changed(&self, actor_id: &str);

    async fn session_status_changed(&self, session_id: &SessionId, status: SessionStatus);

    async fn session_progress(&self, session_id: &SessionId);
}

/// Notifier that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn actors_changed(&self, _actor_id: &str) {}

    async fn session_status_changed(&self, _session_id: &SessionId, _status: SessionStatus) {}

    async fn session_progress(&self, _session_id: &SessionId) {}
}
