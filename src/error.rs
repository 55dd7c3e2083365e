//! Error taxonomy for the orchestration engine.
//!
//! Request errors (caller-fixable) are surfaced synchronously; lost
//! acquisition races and timeout-driven cancellations are not errors at all
//! but background outcomes recorded on the session itself.

use thiserror::Error;

use crate::model::{SegmentStatus, SessionId};
use crate::predicate::PredicateError;
use crate::store::StoreError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {0} is already completed")]
    SessionCompleted(SessionId),

    #[error("actor not found: {0}")]
    ActorNotFound(String),

    #[error("actor {actor_id} is not assigned to session {session_id}")]
    ActorNotInSession {
        session_id: SessionId,
        actor_id: String,
    },

    #[error("invalid session request: {0}")]
    InvalidRequest(String),

    #[error("none of the selected tests matched the catalog")]
    NoMatchingTests,

    #[error("test index {test_index} out of range for session {session_id} ({test_count} tests)")]
    TestIndexOutOfRange {
        session_id: SessionId,
        test_index: usize,
        test_count: usize,
    },

    #[error("segment update status {0} is not applicable")]
    InvalidSegmentStatus(SegmentStatus),

    #[error("completed segment update for index {segment_index} is missing a result")]
    MissingSegmentResult { segment_index: usize },

    #[error(
        "segment {segment_index} already started for actor {actor_id} in test {test_index}"
    )]
    SegmentAlreadyStarted {
        actor_id: String,
        test_index: usize,
        segment_index: usize,
    },

    #[error(
        "out-of-order segment transition for actor {actor_id} in test {test_index}: \
         {detail} (segment {segment_index})"
    )]
    SegmentOutOfOrder {
        actor_id: String,
        test_index: usize,
        segment_index: usize,
        detail: String,
    },

    #[error(transparent)]
    Predicate(#[from] PredicateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether the error is caller-fixable (a bad request) rather than an
    /// engine-side failure.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound(_)
                | Self::SessionCompleted(_)
                | Self::ActorNotFound(_)
                | Self::ActorNotInSession { .. }
                | Self::InvalidRequest(_)
                | Self::NoMatchingTests
                | Self::TestIndexOutOfRange { .. }
                | Self::InvalidSegmentStatus(_)
                | Self::MissingSegmentResult { .. }
                | Self::SegmentAlreadyStarted { .. }
                | Self::SegmentOutOfOrder { .. }
        )
    }
}
