//! Core types and primitives for the droidforge execution core.
//!
//! This crate provides the plan and status types, the error taxonomy,
//! configuration loading and the async synchronization primitives that the
//! scheduler, lock manager, staging and persistence layers are built on.

/// Configuration for scheduling, staging and persistence.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// Async mutex and semaphore primitives.
pub mod sync;
/// Plan, status, timeline and snapshot types.
pub mod types;

pub use config::{
    ForgeConfig, PersistenceConfig, SchedulerConfig, StagingConfig, WorkspaceConfig,
};
pub use error::{ExecutionError, Result};
pub use sync::{ExecutionLock, ExecutionSemaphore, IgnoreLock, SemaphoreRelease};
pub use types::{
    ExecutionPlan, ExecutionSnapshot, ExecutionStatus, LockMode, LockSnapshot, LockTable,
    NodeSchedule, NodeSnapshot, NodeStatus, PlanEdge, PlanNode, PollSnapshot, TimelineEvent,
    TimelineEventKind,
};
