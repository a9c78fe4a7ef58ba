//! # Graceful Degradation
//!
//! Service health tracking, fallback resolution and the write-ahead queue that
//! holds deferred writes until their service recovers.

pub mod coordinator;
pub mod health;
pub mod write_queue;

pub use coordinator::{
    DegradationCoordinator, FallbackHandler, ProbeHandler, RecoveryReport, ReplayHandler,
    ResolutionSource, Resolved, SweepReport,
};
pub use health::{HealthState, ServiceHealthRecord};
pub use write_queue::{hash_payload, MemoryWriteQueue, QueuedWrite, RedisWriteQueue, WriteQueue};
