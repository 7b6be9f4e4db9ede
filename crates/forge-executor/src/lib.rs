//! Scheduling core for droid executions.
//!
//! This crate turns an [`ExecutionPlan`](forge_core::ExecutionPlan) into a
//! live execution: it hands out runnable nodes under a concurrency cap,
//! fences conflicting resource claims with the lock manager, detects
//! deadlocks, isolates writers in staging workspaces, merges their output
//! and persists state for crash recovery.

/// Atomic file replacement.
pub mod atomic;
/// Deadlock detection.
pub mod deadlock;
/// Timeline event broadcast.
pub mod events;
/// Resource lock manager.
pub mod locks;
/// Scheduler.
pub mod manager;
/// Resource claim matching and glob expansion.
pub mod matcher;
/// Merging staged changes.
pub mod merger;
/// Persistence and recovery.
pub mod persistence;
/// Live execution state.
pub mod record;
/// Staging workspaces.
pub mod staging;

pub use deadlock::{DeadlockDetector, DeadlockReport, LockDependency};
pub use events::{EventBus, ExecutionSubscription};
pub use locks::ResourceLockManager;
pub use manager::ExecutionManager;
pub use matcher::ResourceMatcher;
pub use merger::{ExecutionMerger, MergeResult, StagedNode};
pub use persistence::{ExecutionPersistence, PersistedExecution};
pub use record::{ExecutionRecord, NodeState};
pub use staging::{DirectoryStaging, StagedChanges, StagingManager};
