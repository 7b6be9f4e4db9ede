//! Resource lock manager with all-or-nothing acquisition and a timed wait queue.
//!
//! Every request is canonicalized (normalized, sorted, deduplicated) before it
//! touches the table and is granted for all of its resources or none of them.
//! Conflict checks go through [`ResourceMatcher::overlaps`], so a claim on
//! `src/**` fences a claim on `src/api.ts` even though the keys differ.

use crate::matcher::ResourceMatcher;
use core::mem;
use core::time::Duration;
use forge_core::{ExecutionError, IgnoreLock as _, LockMode, LockSnapshot, LockTable, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Outcome delivered to a queued waiter: the resources it newly owns.
type Grant = Result<Vec<String>>;

/// Lock state of one resource.
#[derive(Debug)]
struct ResourceLock {
    mode: LockMode,
    owners: BTreeSet<String>,
    queue: VecDeque<u64>,
}

impl ResourceLock {
    const fn vacant(mode: LockMode) -> Self {
        Self {
            mode,
            owners: BTreeSet::new(),
            queue: VecDeque::new(),
        }
    }

    fn is_held(&self) -> bool {
        !self.owners.is_empty()
    }

    fn is_idle(&self) -> bool {
        self.owners.is_empty() && self.queue.is_empty()
    }

    /// Whether `node_id` may take this lock in `mode` given the current owners.
    fn admits(&self, node_id: &str, mode: LockMode) -> bool {
        if !self.is_held() {
            return true;
        }
        let sole_owner = self.owners.len() == 1 && self.owners.contains(node_id);
        sole_owner || self.mode.is_compatible_with(mode)
    }
}

/// Queued lock request.
#[derive(Debug)]
struct Waiter {
    node_id: String,
    mode: LockMode,
    resources: Vec<String>,
    sender: oneshot::Sender<Grant>,
}

#[derive(Debug, Default)]
struct LockState {
    locks: BTreeMap<String, ResourceLock>,
    waiters: BTreeMap<u64, Waiter>,
    next_waiter: u64,
}

impl LockState {
    /// Whether every resource is free for `node_id` in `mode`, including
    /// held resources that overlap it under a different key.
    fn can_acquire_all(&self, resources: &[String], mode: LockMode, node_id: &str) -> bool {
        resources.iter().all(|resource| {
            self.locks
                .iter()
                .filter(|(key, lock)| {
                    lock.is_held() && ResourceMatcher::overlaps(key.as_str(), resource)
                })
                .all(|(_, lock)| lock.admits(node_id, mode))
        })
    }

    /// Record ownership and return the resources `node_id` did not hold before.
    fn grant(&mut self, resources: &[String], mode: LockMode, node_id: &str) -> Vec<String> {
        let mut newly_owned = Vec::new();
        for resource in resources {
            let lock = self
                .locks
                .entry(resource.clone())
                .or_insert_with(|| ResourceLock::vacant(mode));
            lock.mode = if lock.is_held() {
                lock.mode.strongest(mode)
            } else {
                mode
            };
            if lock.owners.insert(node_id.to_owned()) {
                newly_owned.push(resource.clone());
            }
        }
        newly_owned
    }

    /// Drop `node_id` from the given resources; returns those it actually held.
    fn revoke(&mut self, resources: &[String], node_id: &str) -> Vec<String> {
        let mut released = Vec::new();
        for resource in resources {
            if let Some(lock) = self.locks.get_mut(resource)
                && lock.owners.remove(node_id)
            {
                released.push(resource.clone());
            }
        }
        self.collect_idle();
        released
    }

    fn collect_idle(&mut self) {
        self.locks.retain(|_, lock| !lock.is_idle());
    }

    fn enqueue(&mut self, waiter: Waiter) -> u64 {
        let waiter_id = self.next_waiter;
        self.next_waiter += 1;
        for resource in &waiter.resources {
            self.locks
                .entry(resource.clone())
                .or_insert_with(|| ResourceLock::vacant(waiter.mode))
                .queue
                .push_back(waiter_id);
        }
        self.waiters.insert(waiter_id, waiter);
        waiter_id
    }

    /// Remove a waiter from the table and from every queue it sits in.
    fn dequeue(&mut self, waiter_id: u64) -> Option<Waiter> {
        let waiter = self.waiters.remove(&waiter_id)?;
        for resource in &waiter.resources {
            if let Some(lock) = self.locks.get_mut(resource) {
                lock.queue.retain(|queued| *queued != waiter_id);
            }
        }
        self.collect_idle();
        Some(waiter)
    }

    /// Grant queued requests in arrival order until none can proceed.
    fn process_queue(&mut self) {
        while self.grant_next_waiter() {}
    }

    fn grant_next_waiter(&mut self) -> bool {
        let Some(waiter_id) = self
            .waiters
            .iter()
            .find(|(_, waiter)| {
                self.can_acquire_all(&waiter.resources, waiter.mode, &waiter.node_id)
            })
            .map(|(waiter_id, _)| *waiter_id)
        else {
            return false;
        };
        let Some(waiter) = self.dequeue(waiter_id) else {
            return false;
        };

        let newly_owned = self.grant(&waiter.resources, waiter.mode, &waiter.node_id);
        debug!(
            "Granted queued {} lock on [{}] to {}",
            waiter.mode,
            waiter.resources.join(", "),
            waiter.node_id
        );
        if waiter.sender.send(Ok(newly_owned.clone())).is_err() {
            debug!("Waiter {} went away; rolling back its grant", waiter.node_id);
            self.revoke(&newly_owned, &waiter.node_id);
        }
        true
    }

    /// Reject every queued waiter with `LockCancelled`.
    fn reject_all(&mut self) {
        let waiters = mem::take(&mut self.waiters);
        for lock in self.locks.values_mut() {
            lock.queue.clear();
        }
        for waiter in waiters.into_values() {
            let cancelled = ExecutionError::LockCancelled {
                node_id: waiter.node_id.clone(),
                resources: waiter.resources,
            };
            if waiter.sender.send(Err(cancelled)).is_err() {
                debug!("Waiter {} was already gone at shutdown", waiter.node_id);
            }
        }
        self.collect_idle();
    }
}

/// Owns the lock table of one execution.
///
/// Ownership is keyed by node id. All table access is synchronous and short;
/// only queued acquisition suspends, outside the table lock.
#[derive(Debug, Default)]
pub struct ResourceLockManager {
    state: Mutex<LockState>,
}

impl ResourceLockManager {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize, sort and deduplicate a resource set.
    pub fn canonicalize(resources: &[String]) -> Vec<String> {
        resources
            .iter()
            .map(|resource| ResourceMatcher::normalize_path(resource))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Acquire every resource now, or none of them.
    pub fn try_acquire(&self, resources: &[String], mode: LockMode, node_id: &str) -> bool {
        let canonical = Self::canonicalize(resources);
        let mut state = self.state.lock_ignore_poison();
        if !state.can_acquire_all(&canonical, mode, node_id) {
            return false;
        }
        state.grant(&canonical, mode, node_id);
        debug!("Acquired {mode} lock on [{}] for {node_id}", canonical.join(", "));
        true
    }

    /// Acquire every resource, waiting in the queue for up to `wait`.
    ///
    /// # Errors
    /// Returns `LockTimeout` if the request is not granted in time and
    /// `LockCancelled` if the manager shuts down while it waits. Neither
    /// leaves any of the resources held by this request.
    pub async fn acquire_lock(
        &self,
        resources: &[String],
        mode: LockMode,
        node_id: &str,
        wait: Duration,
    ) -> Result<()> {
        let canonical = Self::canonicalize(resources);
        let (sender, receiver) = oneshot::channel();

        let waiter_id = {
            let mut state = self.state.lock_ignore_poison();
            if state.can_acquire_all(&canonical, mode, node_id) {
                state.grant(&canonical, mode, node_id);
                debug!("Acquired {mode} lock on [{}] for {node_id}", canonical.join(", "));
                return Ok(());
            }
            state.enqueue(Waiter {
                node_id: node_id.to_owned(),
                mode,
                resources: canonical.clone(),
                sender,
            })
        };
        debug!("Queued {mode} lock on [{}] for {node_id}", canonical.join(", "));

        let mut pending = PendingAcquire {
            manager: self,
            waiter_id,
            node_id,
            receiver,
            settled: false,
        };

        let waited = timeout(wait, &mut pending.receiver).await;
        let outcome = match waited {
            Ok(Ok(grant)) => grant.map(drop),
            Ok(Err(_closed)) => Err(ExecutionError::LockCancelled {
                node_id: node_id.to_owned(),
                resources: canonical,
            }),
            Err(_elapsed) => {
                let removed = self.state.lock_ignore_poison().dequeue(waiter_id).is_some();
                if removed {
                    warn!(
                        "Lock request of {node_id} on [{}] timed out after {}ms",
                        canonical.join(", "),
                        wait.as_millis()
                    );
                    Err(ExecutionError::LockTimeout {
                        node_id: node_id.to_owned(),
                        resources: canonical,
                        timeout_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    })
                } else {
                    match (&mut pending.receiver).await {
                        Ok(grant) => grant.map(drop),
                        Err(_closed) => Err(ExecutionError::LockCancelled {
                            node_id: node_id.to_owned(),
                            resources: canonical,
                        }),
                    }
                }
            }
        };

        pending.settled = true;
        outcome
    }

    /// Release the given resources held by `node_id` and wake the queue.
    ///
    /// Returns the resources that were actually released.
    pub fn release(&self, resources: &[String], node_id: &str) -> Vec<String> {
        let canonical = Self::canonicalize(resources);
        let mut state = self.state.lock_ignore_poison();
        let released = state.revoke(&canonical, node_id);
        if !released.is_empty() {
            debug!("Released [{}] for {node_id}", released.join(", "));
        }
        state.process_queue();
        released
    }

    /// Release everything `node_id` holds.
    pub fn release_all(&self, node_id: &str) -> Vec<String> {
        let mut state = self.state.lock_ignore_poison();
        let held: Vec<String> = state
            .locks
            .iter()
            .filter(|(_, lock)| lock.owners.contains(node_id))
            .map(|(resource, _)| resource.clone())
            .collect();
        let released = state.revoke(&held, node_id);
        state.process_queue();
        released
    }

    /// Whether anyone holds exactly this resource.
    pub fn is_locked(&self, resource: &str) -> bool {
        let key = ResourceMatcher::normalize_path(resource);
        self.state
            .lock_ignore_poison()
            .locks
            .get(&key)
            .is_some_and(ResourceLock::is_held)
    }

    /// Owners of a resource, sorted.
    pub fn owners(&self, resource: &str) -> Vec<String> {
        let key = ResourceMatcher::normalize_path(resource);
        self.state
            .lock_ignore_poison()
            .locks
            .get(&key)
            .map(|lock| lock.owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every held resource.
    pub fn lock_state(&self) -> LockTable {
        self.state
            .lock_ignore_poison()
            .locks
            .iter()
            .filter(|(_, lock)| lock.is_held())
            .map(|(resource, lock)| {
                (
                    resource.clone(),
                    LockSnapshot {
                        mode: lock.mode,
                        owners: lock.owners.iter().cloned().collect(),
                    },
                )
            })
            .collect()
    }

    /// Number of held resources.
    pub fn locked_resource_count(&self) -> usize {
        self.state
            .lock_ignore_poison()
            .locks
            .values()
            .filter(|lock| lock.is_held())
            .count()
    }

    /// Number of queued requests.
    pub fn pending_requests(&self) -> usize {
        self.state.lock_ignore_poison().waiters.len()
    }

    /// Re-establish ownership from a persisted table.
    pub fn restore(&self, table: &LockTable) {
        let mut state = self.state.lock_ignore_poison();
        for (resource, snapshot) in table {
            let lock = state
                .locks
                .entry(resource.clone())
                .or_insert_with(|| ResourceLock::vacant(snapshot.mode));
            lock.mode = snapshot.mode;
            lock.owners.extend(snapshot.owners.iter().cloned());
        }
        debug!("Restored {} locked resources", table.len());
    }

    /// Drop all ownership and grant whatever queued requests now fit.
    pub fn clear(&self) {
        let mut state = self.state.lock_ignore_poison();
        for lock in state.locks.values_mut() {
            lock.owners.clear();
        }
        state.collect_idle();
        state.process_queue();
    }

    /// Reject every queued request and drop all ownership.
    pub fn shutdown(&self) {
        let mut state = self.state.lock_ignore_poison();
        let rejected = state.waiters.len();
        state.reject_all();
        state.locks.clear();
        if rejected > 0 {
            debug!("Lock manager shut down, rejected {rejected} queued requests");
        }
    }
}

/// In-flight queued acquisition. Dropping it before it settles withdraws the
/// request, or returns the resources if the grant raced the drop.
struct PendingAcquire<'manager> {
    manager: &'manager ResourceLockManager,
    waiter_id: u64,
    node_id: &'manager str,
    receiver: oneshot::Receiver<Grant>,
    settled: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.manager.state.lock_ignore_poison();
        if state.dequeue(self.waiter_id).is_some() {
            return;
        }
        if let Ok(Ok(granted)) = self.receiver.try_recv() {
            state.revoke(&granted, self.node_id);
            state.process_queue();
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code asserts on results directly"
)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::time::sleep;

    fn claims(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|path| (*path).to_owned()).collect()
    }

    #[test]
    fn test_write_is_exclusive() {
        let manager = ResourceLockManager::new();
        let file = claims(&["src/file.ts"]);

        assert!(manager.try_acquire(&file, LockMode::Write, "a"));
        assert!(!manager.try_acquire(&file, LockMode::Write, "b"));
        assert!(!manager.try_acquire(&file, LockMode::Read, "b"));
        assert!(!manager.try_acquire(&file, LockMode::Analysis, "b"));
        assert_eq!(manager.owners("src/file.ts"), vec!["a"]);
    }

    #[test]
    fn test_shared_modes_coexist() {
        let manager = ResourceLockManager::new();
        let file = claims(&["src/file.ts"]);

        assert!(manager.try_acquire(&file, LockMode::Read, "a"));
        assert!(manager.try_acquire(&file, LockMode::Read, "b"));
        assert!(manager.try_acquire(&file, LockMode::Analysis, "c"));
        assert!(!manager.try_acquire(&file, LockMode::Write, "d"));
        assert_eq!(manager.owners("src/file.ts"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sole_owner_can_extend() {
        let manager = ResourceLockManager::new();
        let file = claims(&["src/file.ts"]);

        assert!(manager.try_acquire(&file, LockMode::Read, "a"));
        assert!(manager.try_acquire(&file, LockMode::Write, "a"));
        assert_eq!(manager.lock_state()["src/file.ts"].mode, LockMode::Write);
    }

    #[test]
    fn test_try_acquire_is_all_or_nothing() {
        let manager = ResourceLockManager::new();
        assert!(manager.try_acquire(&claims(&["b.ts"]), LockMode::Write, "holder"));

        let acquired = manager.try_acquire(&claims(&["a.ts", "b.ts", "c.ts"]), LockMode::Write, "n");
        assert!(!acquired);
        assert!(!manager.is_locked("a.ts"));
        assert!(!manager.is_locked("c.ts"));
        assert_eq!(manager.owners("b.ts"), vec!["holder"]);
        assert_eq!(manager.locked_resource_count(), 1);
    }

    #[test]
    fn test_overlapping_claims_conflict() {
        let manager = ResourceLockManager::new();
        assert!(manager.try_acquire(&claims(&["src/**"]), LockMode::Write, "a"));
        assert!(!manager.try_acquire(&claims(&["src/api/server.ts"]), LockMode::Read, "b"));
        assert!(manager.try_acquire(&claims(&["tests/a.ts"]), LockMode::Write, "b"));
    }

    #[test]
    fn test_canonical_ordering_and_normalization() {
        let canonical =
            ResourceLockManager::canonicalize(&claims(&["./b.ts", "a.ts", "b.ts", "c\\d.ts"]));
        assert_eq!(canonical, vec!["a.ts", "b.ts", "c/d.ts"]);
    }

    #[test]
    fn test_release_collects_garbage() {
        let manager = ResourceLockManager::new();
        let files = claims(&["a.ts", "b.ts"]);
        assert!(manager.try_acquire(&files, LockMode::Write, "a"));

        let released = manager.release(&files, "a");
        assert_eq!(released, files);
        assert_eq!(manager.locked_resource_count(), 0);
        assert!(manager.lock_state().is_empty());

        assert!(manager.try_acquire(&files, LockMode::Write, "b"));
        assert_eq!(manager.release_all("b"), files);
    }

    /// Tests that a queued request is granted once the holder releases.
    ///
    /// # Errors
    /// Returns an error if the queued acquisition fails.
    #[tokio::test]
    async fn test_queued_request_granted_on_release() -> Result<()> {
        let manager = Arc::new(ResourceLockManager::new());
        let file = claims(&["file.ts"]);
        assert!(manager.try_acquire(&file, LockMode::Write, "holder"));

        let waiter_manager = Arc::clone(&manager);
        let waiter_file = file.clone();
        let waiter = tokio::spawn(async move {
            waiter_manager
                .acquire_lock(&waiter_file, LockMode::Write, "waiter", Duration::from_secs(5))
                .await
        });

        sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.pending_requests(), 1);
        manager.release(&file, "holder");

        waiter
            .await
            .map_err(|error| ExecutionError::Other(error.to_string()))??;
        assert_eq!(manager.owners("file.ts"), vec!["waiter"]);
        assert_eq!(manager.pending_requests(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_acquire_lock_times_out() {
        let manager = ResourceLockManager::new();
        let file = claims(&["file.ts"]);
        assert!(manager.try_acquire(&file, LockMode::Write, "holder"));

        let started = Instant::now();
        let outcome = manager
            .acquire_lock(&file, LockMode::Write, "late", Duration::from_millis(100))
            .await;

        assert!(started.elapsed() >= Duration::from_millis(100));
        match outcome {
            Err(ExecutionError::LockTimeout {
                node_id,
                resources,
                timeout_ms,
            }) => {
                assert_eq!(node_id, "late");
                assert_eq!(resources, file);
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected lock timeout, got {other:?}"),
        }
        assert_eq!(manager.owners("file.ts"), vec!["holder"]);
        assert_eq!(manager.pending_requests(), 0);
    }

    /// Tests that a waiter needing two resources is only granted when both are free.
    ///
    /// # Errors
    /// Returns an error if the queued acquisition fails.
    #[tokio::test]
    async fn test_queue_never_grants_partially() -> Result<()> {
        let manager = Arc::new(ResourceLockManager::new());
        assert!(manager.try_acquire(&claims(&["a.ts"]), LockMode::Write, "first"));
        assert!(manager.try_acquire(&claims(&["b.ts"]), LockMode::Write, "second"));

        let waiter_manager = Arc::clone(&manager);
        let waiter = tokio::spawn(async move {
            waiter_manager
                .acquire_lock(
                    &claims(&["b.ts", "a.ts"]),
                    LockMode::Write,
                    "both",
                    Duration::from_secs(5),
                )
                .await
        });

        sleep(Duration::from_millis(20)).await;
        manager.release(&claims(&["a.ts"]), "first");
        sleep(Duration::from_millis(20)).await;
        assert!(!manager.is_locked("a.ts"));
        assert!(!waiter.is_finished());

        manager.release(&claims(&["b.ts"]), "second");
        waiter
            .await
            .map_err(|error| ExecutionError::Other(error.to_string()))??;
        assert_eq!(manager.owners("a.ts"), vec!["both"]);
        assert_eq!(manager.owners("b.ts"), vec!["both"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_rejects_waiters() {
        let manager = Arc::new(ResourceLockManager::new());
        let file = claims(&["file.ts"]);
        assert!(manager.try_acquire(&file, LockMode::Write, "holder"));

        let waiter_manager = Arc::clone(&manager);
        let waiter_file = file.clone();
        let waiter = tokio::spawn(async move {
            waiter_manager
                .acquire_lock(&waiter_file, LockMode::Read, "reader", Duration::from_secs(5))
                .await
        });

        sleep(Duration::from_millis(20)).await;
        manager.shutdown();

        match waiter.await {
            Ok(Err(ExecutionError::LockCancelled { node_id, .. })) => {
                assert_eq!(node_id, "reader");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(manager.locked_resource_count(), 0);
        assert_eq!(manager.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_withdrawn() {
        let manager = ResourceLockManager::new();
        let file = claims(&["file.ts"]);
        assert!(manager.try_acquire(&file, LockMode::Write, "holder"));

        let abandoned = timeout(
            Duration::from_millis(20),
            manager.acquire_lock(&file, LockMode::Write, "gone", Duration::from_secs(5)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(manager.pending_requests(), 0);

        manager.release(&file, "holder");
        assert!(!manager.is_locked("file.ts"));
    }

    #[test]
    fn test_restore_and_clear() {
        let manager = ResourceLockManager::new();
        let mut table = LockTable::new();
        table.insert(
            "src/a.ts".to_owned(),
            LockSnapshot {
                mode: LockMode::Read,
                owners: vec!["x".to_owned(), "y".to_owned()],
            },
        );
        manager.restore(&table);
        assert_eq!(manager.lock_state(), table);
        assert!(!manager.try_acquire(&claims(&["src/a.ts"]), LockMode::Write, "z"));

        manager.clear();
        assert_eq!(manager.locked_resource_count(), 0);
        assert!(manager.try_acquire(&claims(&["src/a.ts"]), LockMode::Write, "z"));
    }
}
