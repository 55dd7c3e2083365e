//! Ensemble - session orchestration for distributed test execution.
//!
//! Remote actor processes announce themselves to the engine, get matched to
//! test sessions by type and tag predicate, and report per-segment progress
//! that is aggregated into test and session outcomes. Background tasks keep
//! the system self-healing: acquisition retries until a timeout, and a
//! cleanup sweep reclaims stalled sessions and idle actors.
//!
//! Transport, test-definition parsing and durable storage are external
//! collaborators behind the contracts in [`catalog`], [`notify`],
//! [`session_log`] and [`store`].

pub mod acquisition;
pub mod builder;
pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod notify;
pub mod observability;
pub mod predicate;
pub mod progress;
pub mod registry;
pub mod session_log;
pub mod store;

pub use acquisition::{AcquisitionConfig, AcquisitionHandle, spawn_acquisition};
pub use builder::{SessionBuilder, SessionIdAllocator, SessionRequest};
pub use catalog::{StaticCatalog, TestActorInfo, TestCatalog, TestInfo};
pub use cleanup::{ArtifactStore, CleanupConfig, CleanupTask, NoopArtifactStore, spawn_cleanup};
pub use config::Config;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use model::{
    Actor, ActorGroup, ActorSessionState, ActorSessionTestState, RequiredActor, SegmentResult,
    SegmentStatus, SegmentUpdate, SelectedTest, Session, SessionId, SessionResult, SessionStatus,
    SubtestContext, TestContext, TestResult, TestSegmentInfo, TestStatus,
};
pub use notify::{NoopNotifier, Notifier};
pub use observability::init_tracing;
pub use predicate::{Predicate, PredicateError, matches_expression};
pub use progress::{ProgressEngine, UpdateOutcome, compute_current_test_segment_info};
pub use registry::{ActorRegistry, match_by_tag_predicate};
pub use session_log::{
    FileSessionLog, LogLevel, MemorySessionLog, SessionLogRecord, SessionLogSink,
};
pub use store::{ActorPatch, ActorStore, MemoryStore, SessionPatch, SessionStore, Store, StoreError};
