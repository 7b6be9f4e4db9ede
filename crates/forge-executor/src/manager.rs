//! The scheduler: turns plans into live executions and hands out work.
//!
//! Every mutation of an execution runs inside that execution's
//! [`ExecutionLock`], so at most one mutation per execution is in flight.
//! Different executions proceed independently.

use crate::deadlock::DeadlockDetector;
use crate::events::{EventBus, ExecutionSubscription};
use crate::locks::ResourceLockManager;
use crate::merger::{ExecutionMerger, MergeResult, StagedNode};
use crate::persistence::{ExecutionPersistence, PersistedExecution};
use crate::record::ExecutionRecord;
use crate::staging::{DirectoryStaging, StagingManager};
use core::mem;
use forge_core::{
    ExecutionError, ExecutionLock, ExecutionPlan, ExecutionSnapshot, ExecutionStatus,
    ForgeConfig, IgnoreLock as _, NodeSchedule, NodeStatus, PollSnapshot, Result, TimelineEvent,
    TimelineEventKind,
};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, RwLock, broadcast};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One live execution.
#[derive(Debug)]
struct ExecutionEntry {
    exclusive: ExecutionLock,
    record: Mutex<ExecutionRecord>,
    locks: Arc<ResourceLockManager>,
    persist: AsyncMutex<()>,
}

impl ExecutionEntry {
    fn new(record: ExecutionRecord, locks: ResourceLockManager) -> Self {
        Self {
            exclusive: ExecutionLock::new(),
            record: Mutex::new(record),
            locks: Arc::new(locks),
            persist: AsyncMutex::new(()),
        }
    }

    /// Write the latest state. Writes of one execution never interleave.
    async fn persist(&self, persistence: &ExecutionPersistence) -> Result<()> {
        let _write = self.persist.lock().await;
        let state = {
            let record = self.record.lock_ignore_poison();
            PersistedExecution::from_record(&record, &self.locks.lock_state())
        };
        persistence.write(&state).await
    }

    fn status(&self) -> ExecutionStatus {
        self.record.lock_ignore_poison().status
    }
}

/// Orchestrates executions: planning, scheduling, completion, persistence
/// and recovery.
pub struct ExecutionManager {
    config: ForgeConfig,
    executions: RwLock<HashMap<String, Arc<ExecutionEntry>>>,
    persistence: ExecutionPersistence,
    staging: Arc<dyn StagingManager>,
    events: EventBus,
    background: Mutex<JoinSet<()>>,
}

impl Default for ExecutionManager {
    fn default() -> Self {
        Self::new(ForgeConfig::default())
    }
}

impl ExecutionManager {
    /// Create a manager with directory staging.
    pub fn new(config: ForgeConfig) -> Self {
        let staging = Arc::new(DirectoryStaging::from_config(&config));
        Self::with_staging(config, staging)
    }

    /// Create a manager with a custom staging implementation.
    pub fn with_staging(config: ForgeConfig, staging: Arc<dyn StagingManager>) -> Self {
        Self {
            persistence: ExecutionPersistence::from_config(&config),
            config,
            executions: RwLock::new(HashMap::new()),
            staging,
            events: EventBus::default(),
            background: Mutex::new(JoinSet::new()),
        }
    }

    /// Create a manager configured by `<repo>/.droidforge/config.toml`.
    ///
    /// # Errors
    /// Returns an error if the config file exists but is invalid
    pub fn for_repo(repo_root: &Path) -> Result<Self> {
        Ok(Self::new(ForgeConfig::load_for_repo(repo_root)?))
    }

    /// The active configuration.
    pub const fn config(&self) -> &ForgeConfig {
        &self.config
    }

    /// Plan a new execution under a generated `exec-<uuid>` id.
    ///
    /// # Errors
    /// Returns an error if the plan repeats a node id
    pub async fn plan(&self, repo_root: &Path, plan: ExecutionPlan) -> Result<String> {
        let execution_id = format!("exec-{}", Uuid::new_v4());
        self.plan_with_id(repo_root, plan, &execution_id).await?;
        Ok(execution_id)
    }

    /// Plan a new execution under a caller-chosen id.
    ///
    /// # Errors
    /// Returns an error if the id is taken or the plan repeats a node id
    pub async fn plan_with_id(
        &self,
        repo_root: &Path,
        plan: ExecutionPlan,
        execution_id: &str,
    ) -> Result<()> {
        let record = ExecutionRecord::from_plan(
            execution_id.to_owned(),
            PathBuf::from(repo_root),
            plan,
            self.config.scheduler.default_concurrency,
        )?;
        let events = record.timeline.clone();
        info!(
            "Planned {execution_id} with {} nodes, concurrency {}",
            record.nodes.len(),
            record.concurrency
        );

        let entry = Arc::new(ExecutionEntry::new(record, ResourceLockManager::new()));
        {
            let mut executions = self.executions.write().await;
            if executions.contains_key(execution_id) {
                return Err(ExecutionError::Other(format!(
                    "Execution {execution_id} already exists"
                )));
            }
            executions.insert(execution_id.to_owned(), Arc::clone(&entry));
        }

        self.events.publish_all(events);
        self.persist_transition(&entry);
        Ok(())
    }

    /// Move a planned or paused execution to running.
    ///
    /// Starting a running execution changes nothing.
    ///
    /// # Errors
    /// Returns an error if the execution is unknown or terminal
    pub async fn start(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let entry = self.entry(execution_id).await?;
        let changed = entry
            .exclusive
            .run_exclusive(|| async {
                self.update(&entry, |record| match record.status {
                    ExecutionStatus::Running => Ok(false),
                    ExecutionStatus::Planned | ExecutionStatus::Paused => {
                        record.set_status(
                            ExecutionStatus::Running,
                            TimelineEventKind::ExecutionStarted,
                            None,
                        );
                        record.check_completion();
                        Ok(true)
                    }
                    status => Err(ExecutionError::InvalidExecutionState {
                        execution_id: execution_id.to_owned(),
                        status,
                        operation: "start",
                    }),
                })
            })
            .await?;

        if changed {
            info!("Started {execution_id}");
            self.persist_transition(&entry);
        }
        Ok(entry.status())
    }

    /// Hand out the first ready node whose claims can all be locked.
    ///
    /// Returns `None` when the execution is not running, nothing is ready,
    /// the concurrency cap is reached or every ready node is blocked. A block
    /// with nothing running pauses the execution as deadlocked.
    ///
    /// # Errors
    /// Returns an error if the execution is unknown or staging fails
    pub async fn request_next(&self, execution_id: &str) -> Result<Option<NodeSchedule>> {
        let entry = self.entry(execution_id).await?;
        entry
            .exclusive
            .run_exclusive(|| self.request_next_exclusive(&entry))
            .await
    }

    async fn request_next_exclusive(
        &self,
        entry: &Arc<ExecutionEntry>,
    ) -> Result<Option<NodeSchedule>> {
        let (repo_root, execution_id, candidates) = {
            let record = entry.record.lock_ignore_poison();
            if record.status != ExecutionStatus::Running
                || record.ready_queue.is_empty()
                || record.running_nodes.len() >= record.concurrency
            {
                return Ok(None);
            }
            let default_mode = self.config.scheduler.default_mode;
            let candidates: Vec<NodeSchedule> = record
                .ready_queue
                .iter()
                .filter_map(|node_id| record.nodes.get(node_id))
                .map(|state| NodeSchedule {
                    node_id: state.spec.node_id.clone(),
                    droid_id: state.spec.droid_id.clone(),
                    title: state.spec.title.clone(),
                    description: state.spec.description.clone(),
                    mode: state.spec.mode.unwrap_or(default_mode),
                    resource_claims: state.spec.resource_claims.clone(),
                    staging_path: None,
                })
                .collect();
            (record.repo_root.clone(), record.id.clone(), candidates)
        };

        let chosen = candidates.into_iter().find(|candidate| {
            entry
                .locks
                .try_acquire(&candidate.resource_claims, candidate.mode, &candidate.node_id)
        });

        let Some(mut schedule) = chosen else {
            self.check_deadlock(entry, &execution_id)?;
            return Ok(None);
        };

        if self.config.staging.enabled {
            match self
                .staging
                .create_staging(&repo_root, &execution_id, &schedule.node_id)
                .await
            {
                Ok(path) => schedule.staging_path = Some(path),
                Err(error) => {
                    entry.locks.release_all(&schedule.node_id);
                    return Err(error);
                }
            }
        }

        let started = self.update(entry, |record| record.start_node(&schedule.node_id));
        if let Err(error) = started {
            entry.locks.release_all(&schedule.node_id);
            return Err(error);
        }

        debug!(
            "Scheduled {} of {execution_id} ({} claims, {})",
            schedule.node_id,
            schedule.resource_claims.len(),
            schedule.mode
        );
        self.persist_transition(entry);
        Ok(Some(schedule))
    }

    /// Pause the execution when nothing runs and every ready node is blocked.
    fn check_deadlock(&self, entry: &Arc<ExecutionEntry>, execution_id: &str) -> Result<()> {
        let lock_state = entry.locks.lock_state();
        let paused = self.update(entry, |record| {
            let ready: Vec<String> = record.ready_queue.clone();
            let running: Vec<String> = record.running_nodes.iter().cloned().collect();
            let Some(report) =
                DeadlockDetector::detect(&ready, &running, &record.claims_map(), &lock_state)
            else {
                return Ok(false);
            };

            let mut detail = serde_json::to_value(&report)?;
            if let Value::Object(fields) = &mut detail {
                fields.insert("locks".to_owned(), serde_json::to_value(&lock_state)?);
            }
            record.set_status(
                ExecutionStatus::Paused,
                TimelineEventKind::ExecutionDeadlock,
                Some(detail),
            );
            warn!(
                "Deadlock in {execution_id}: blocked [{}], cycle {:?}",
                report.blocked_nodes.join(", "),
                report.cycle
            );
            Ok(true)
        })?;

        if paused {
            self.persist_transition(entry);
        }
        Ok(())
    }

    /// Mark a running node completed, release its locks and queue the
    /// dependents it unblocks.
    ///
    /// # Errors
    /// Returns an error if the execution or node is unknown, the node is not
    /// running, the execution was aborted or the state cannot be persisted
    pub async fn complete_node(
        &self,
        execution_id: &str,
        node_id: &str,
        detail: Option<Value>,
    ) -> Result<()> {
        self.finish_node(execution_id, node_id, NodeStatus::Completed, detail)
            .await
    }

    /// Mark a running node failed and fail the whole execution.
    ///
    /// # Errors
    /// Returns an error if the execution or node is unknown, the node is not
    /// running, the execution was aborted or the state cannot be persisted
    pub async fn fail_node(
        &self,
        execution_id: &str,
        node_id: &str,
        detail: Option<Value>,
    ) -> Result<()> {
        self.finish_node(execution_id, node_id, NodeStatus::Failed, detail)
            .await
    }

    async fn finish_node(
        &self,
        execution_id: &str,
        node_id: &str,
        status: NodeStatus,
        detail: Option<Value>,
    ) -> Result<()> {
        let entry = self.entry(execution_id).await?;
        entry
            .exclusive
            .run_exclusive(|| async {
                self.update(&entry, |record| {
                    if record.status == ExecutionStatus::Aborted {
                        return Err(ExecutionError::InvalidExecutionState {
                            execution_id: execution_id.to_owned(),
                            status: record.status,
                            operation: if status == NodeStatus::Completed {
                                "complete a node"
                            } else {
                                "fail a node"
                            },
                        });
                    }
                    record.finish_node(node_id, status, detail)?;
                    entry.locks.release_all(node_id);

                    if status == NodeStatus::Failed {
                        if !record.status.is_terminal() {
                            let failure = json!({ "failedNode": node_id });
                            record.set_status(
                                ExecutionStatus::Failed,
                                TimelineEventKind::ExecutionFailed,
                                Some(failure),
                            );
                        }
                        warn!("Node {node_id} of {execution_id} failed");
                    } else if !record.status.is_terminal() {
                        record.promote_dependents(node_id)?;
                        record.check_completion();
                    }
                    Ok(())
                })?;

                if self.config.persistence.enabled {
                    entry.persist(&self.persistence).await?;
                }
                Ok::<(), ExecutionError>(())
            })
            .await?;

        debug!("Node {node_id} of {execution_id} finished as {status}");
        Ok(())
    }

    /// Suspend a running execution. Pausing a paused execution changes
    /// nothing.
    ///
    /// # Errors
    /// Returns an error if the execution is unknown, planned or terminal
    pub async fn pause(&self, execution_id: &str) -> Result<ExecutionStatus> {
        self.toggle(execution_id, ExecutionStatus::Running, ExecutionStatus::Paused)
            .await
    }

    /// Continue a paused execution. Resuming a running execution changes
    /// nothing.
    ///
    /// # Errors
    /// Returns an error if the execution is unknown, planned or terminal
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionStatus> {
        self.toggle(execution_id, ExecutionStatus::Paused, ExecutionStatus::Running)
            .await
    }

    async fn toggle(
        &self,
        execution_id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<ExecutionStatus> {
        let (event, operation) = if to == ExecutionStatus::Paused {
            (TimelineEventKind::ExecutionPaused, "pause")
        } else {
            (TimelineEventKind::ExecutionResumed, "resume")
        };

        let entry = self.entry(execution_id).await?;
        let changed = entry
            .exclusive
            .run_exclusive(|| async {
                self.update(&entry, |record| {
                    if record.status == to {
                        return Ok(false);
                    }
                    if record.status != from {
                        return Err(ExecutionError::InvalidExecutionState {
                            execution_id: execution_id.to_owned(),
                            status: record.status,
                            operation,
                        });
                    }
                    record.set_status(to, event, None);
                    record.check_completion();
                    Ok(true)
                })
            })
            .await?;

        if changed {
            info!("Execution {execution_id} is now {to}");
            self.persist_transition(&entry);
        }
        Ok(entry.status())
    }

    /// Stop an execution for good: clears the ready queue, the running set
    /// and the lock table, and rejects queued lock requests.
    ///
    /// Aborting an aborted execution changes nothing.
    ///
    /// # Errors
    /// Returns an error if the execution is unknown, completed or failed
    pub async fn abort(&self, execution_id: &str) -> Result<()> {
        let entry = self.entry(execution_id).await?;
        let changed = entry
            .exclusive
            .run_exclusive(|| async {
                self.update(&entry, |record| match record.status {
                    ExecutionStatus::Aborted => Ok(false),
                    ExecutionStatus::Completed | ExecutionStatus::Failed => {
                        Err(ExecutionError::InvalidExecutionState {
                            execution_id: execution_id.to_owned(),
                            status: record.status,
                            operation: "abort",
                        })
                    }
                    ExecutionStatus::Planned
                    | ExecutionStatus::Running
                    | ExecutionStatus::Paused => {
                        let detail = json!({
                            "readyQueue": record.ready_queue,
                            "runningNodes": record.running_nodes,
                        });
                        record.ready_queue.clear();
                        record.running_nodes.clear();
                        entry.locks.shutdown();
                        record.set_status(
                            ExecutionStatus::Aborted,
                            TimelineEventKind::ExecutionAborted,
                            Some(detail),
                        );
                        Ok(true)
                    }
                })
            })
            .await?;

        if changed {
            warn!("Aborted {execution_id}");
            self.persist_transition(&entry);
        }
        Ok(())
    }

    /// Merge the staging workspaces of completed nodes into the repository.
    ///
    /// On success the merged workspaces are removed. A conflict writes
    /// nothing and is reported in the result and on the timeline.
    ///
    /// # Errors
    /// Returns an error if the execution is unknown, planned or aborted, or a
    /// workspace cannot be read or a file cannot be written
    pub async fn merge(&self, execution_id: &str) -> Result<MergeResult> {
        let entry = self.entry(execution_id).await?;
        let result = entry
            .exclusive
            .run_exclusive(|| async {
                let (repo_root, nodes) = {
                    let record = entry.record.lock_ignore_poison();
                    if matches!(
                        record.status,
                        ExecutionStatus::Planned | ExecutionStatus::Aborted
                    ) {
                        return Err(ExecutionError::InvalidExecutionState {
                            execution_id: execution_id.to_owned(),
                            status: record.status,
                            operation: "merge",
                        });
                    }
                    let nodes: Vec<StagedNode> = record
                        .nodes_with_status(NodeStatus::Completed)
                        .into_iter()
                        .filter_map(|node_id| record.nodes.get(&node_id))
                        .map(|state| StagedNode {
                            node_id: state.spec.node_id.clone(),
                            resource_claims: state.spec.resource_claims.clone(),
                        })
                        .collect();
                    (record.repo_root.clone(), nodes)
                };

                let result =
                    ExecutionMerger::merge(&repo_root, execution_id, &nodes, self.staging.as_ref())
                        .await?;

                if result.success {
                    for node in &nodes {
                        self.staging
                            .clean_staging(&repo_root, execution_id, &node.node_id)
                            .await?;
                    }
                }

                self.update(&entry, |record| {
                    if result.success {
                        let detail = json!({ "mergedFiles": result.merged_files });
                        record.push_event(None, TimelineEventKind::ExecutionMerged, Some(detail));
                    } else {
                        let detail = json!({ "conflicts": result.conflicts });
                        record.push_event(
                            None,
                            TimelineEventKind::ExecutionMergeConflict,
                            Some(detail),
                        );
                    }
                    Ok(())
                })?;
                Ok(result)
            })
            .await?;

        self.persist_transition(&entry);
        Ok(result)
    }

    /// Read-only view of one execution.
    ///
    /// # Errors
    /// Returns an error if the execution is unknown
    pub async fn poll(&self, execution_id: &str) -> Result<PollSnapshot> {
        let entry = self.entry(execution_id).await?;
        let snapshot = entry.record.lock_ignore_poison().poll_snapshot();
        Ok(snapshot)
    }

    /// Summaries of every live execution, newest first.
    pub async fn list(&self) -> Vec<ExecutionSnapshot> {
        let mut snapshots: Vec<ExecutionSnapshot> = self
            .executions
            .read()
            .await
            .values()
            .map(|entry| entry.record.lock_ignore_poison().execution_snapshot())
            .collect();
        snapshots.sort_by(|first, second| {
            second
                .created_at
                .cmp(&first.created_at)
                .then_with(|| first.id.cmp(&second.id))
        });
        snapshots
    }

    /// Rehydrate every execution a previous process left running. They come
    /// back paused, with their completed nodes, queues and lock ownership;
    /// call [`Self::resume`] to continue.
    ///
    /// Executions already live in this manager are left untouched.
    ///
    /// # Errors
    /// Returns an error if the persisted state cannot be listed or rewritten
    pub async fn recover_all(&self, repo_root: &Path) -> Result<Vec<String>> {
        let mut executions = self.executions.write().await;
        let live: HashSet<String> = executions.keys().cloned().collect();
        let recovered = self.persistence.recover_all(repo_root, &live).await?;
        let mut ids = Vec::with_capacity(recovered.len());

        for (record, lock_table) in recovered {
            let recovered_event = record.timeline.last().cloned();
            let locks = ResourceLockManager::new();
            locks.restore(&lock_table);

            let execution_id = record.id.clone();
            executions.insert(
                execution_id.clone(),
                Arc::new(ExecutionEntry::new(record, locks)),
            );
            if let Some(event) = recovered_event {
                self.events.publish(event);
            }
            ids.push(execution_id);
        }

        info!("Recovered {} executions from {}", ids.len(), repo_root.display());
        Ok(ids)
    }

    /// Receive every timeline event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }

    /// Receive the timeline events of one execution published from now on.
    pub fn subscribe_execution(&self, execution_id: &str) -> ExecutionSubscription {
        self.events.subscribe_execution(execution_id)
    }

    /// Lock table of an execution, for fencing work outside the scheduler.
    ///
    /// # Errors
    /// Returns an error if the execution is unknown
    pub async fn lock_manager(&self, execution_id: &str) -> Result<Arc<ResourceLockManager>> {
        let entry = self.entry(execution_id).await?;
        Ok(Arc::clone(&entry.locks))
    }

    /// Wait for every background persistence write and reject queued lock
    /// requests. The manager should not be used afterwards.
    pub async fn shutdown(&self) {
        let mut pending = mem::take(&mut *self.background.lock_ignore_poison());
        let mut drained = 0usize;
        while let Some(joined) = pending.join_next().await {
            if let Err(error) = joined {
                warn!("Persistence task failed: {error}");
            }
            drained += 1;
        }

        for entry in self.executions.read().await.values() {
            entry.locks.shutdown();
        }
        debug!("Execution manager shut down after {drained} pending writes");
    }

    async fn entry(&self, execution_id: &str) -> Result<Arc<ExecutionEntry>> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownExecution(execution_id.to_owned()))
    }

    /// Mutate a record and publish the events the mutation appended.
    fn update<T, F>(&self, entry: &ExecutionEntry, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut ExecutionRecord) -> Result<T>,
    {
        let (outcome, events) = {
            let mut record = entry.record.lock_ignore_poison();
            let mark = record.timeline.len();
            let outcome = mutate(&mut record);
            (outcome, record.events_since(mark))
        };
        self.events.publish_all(events);
        outcome
    }

    /// Persist in the background after a status change, when configured.
    fn persist_transition(&self, entry: &Arc<ExecutionEntry>) {
        if !self.config.persistence.enabled || !self.config.scheduler.persist_on_transition {
            return;
        }
        let entry = Arc::clone(entry);
        let persistence = self.persistence.clone();

        let mut background = self.background.lock_ignore_poison();
        while background.try_join_next().is_some() {}
        background.spawn(async move {
            if let Err(error) = entry.persist(&persistence).await {
                warn!("Failed to persist execution state: {error}");
            }
        });
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code asserts on results directly"
)]
mod tests {
    use super::*;
    use core::time::Duration;
    use forge_core::{LockMode, PlanNode};
    use std::fs as stdfs;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn memory_config() -> ForgeConfig {
        let mut config = ForgeConfig::default();
        config.persistence.enabled = false;
        config
    }

    fn writer(node_id: &str, claims: &[&str]) -> PlanNode {
        PlanNode::new(node_id, format!("droid-{node_id}"))
            .with_claims(claims.iter().copied())
            .with_mode(LockMode::Write)
    }

    /// Tests the status machine around start, pause and resume.
    ///
    /// # Errors
    /// Returns an error if a manager call fails.
    #[tokio::test]
    async fn test_start_pause_resume() -> Result<()> {
        let repo = TempDir::new()?;
        let manager = ExecutionManager::new(memory_config());
        let plan = ExecutionPlan::new(vec![writer("a", &["a.ts"])]);
        let execution_id = manager.plan(repo.path(), plan).await?;
        assert!(execution_id.starts_with("exec-"));

        assert!(manager.request_next(&execution_id).await?.is_none());
        assert!(manager.pause(&execution_id).await.is_err());
        assert_eq!(manager.start(&execution_id).await?, ExecutionStatus::Running);
        assert_eq!(manager.start(&execution_id).await?, ExecutionStatus::Running);

        assert_eq!(manager.pause(&execution_id).await?, ExecutionStatus::Paused);
        assert!(manager.request_next(&execution_id).await?.is_none());
        assert_eq!(manager.resume(&execution_id).await?, ExecutionStatus::Running);

        let Some(next) = manager.request_next(&execution_id).await? else {
            panic!("expected a node");
        };
        assert_eq!(next.node_id, "a");
        assert_eq!(next.droid_id, "droid-a");
        assert!(next.staging_path.is_none());

        manager.complete_node(&execution_id, "a", None).await?;
        let snapshot = manager.poll(&execution_id).await?;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert!(manager.start(&execution_id).await.is_err());
        Ok(())
    }

    /// Tests that an empty plan completes as soon as it starts.
    ///
    /// # Errors
    /// Returns an error if a manager call fails.
    #[tokio::test]
    async fn test_empty_plan_completes_on_start() -> Result<()> {
        let repo = TempDir::new()?;
        let manager = ExecutionManager::new(memory_config());
        let execution_id = manager.plan(repo.path(), ExecutionPlan::default()).await?;
        assert_eq!(manager.start(&execution_id).await?, ExecutionStatus::Completed);
        Ok(())
    }

    /// Tests that unknown ids are programming errors.
    ///
    /// # Errors
    /// Returns an error if planning fails.
    #[tokio::test]
    async fn test_unknown_ids() -> Result<()> {
        let repo = TempDir::new()?;
        let manager = ExecutionManager::new(memory_config());
        let missing = manager.poll("missing").await;
        assert!(matches!(missing, Err(ExecutionError::UnknownExecution(_))));

        let plan = ExecutionPlan::new(vec![writer("a", &[])]);
        manager.plan_with_id(repo.path(), plan.clone(), "exec-1").await?;
        assert!(manager.plan_with_id(repo.path(), plan, "exec-1").await.is_err());

        let unknown_node = manager.complete_node("exec-1", "ghost", None).await;
        let Err(error) = unknown_node else {
            panic!("expected an unknown node error");
        };
        assert!(error.is_programming_error());
        Ok(())
    }

    /// Tests that nodes without a mode are locked in the configured default.
    ///
    /// # Errors
    /// Returns an error if a manager call fails.
    #[tokio::test]
    async fn test_default_mode_applies_to_unmoded_nodes() -> Result<()> {
        let repo = TempDir::new()?;
        let mut config = memory_config();
        config.scheduler.default_mode = LockMode::Read;
        let manager = ExecutionManager::new(config);
        let plan = ExecutionPlan::new(vec![
            PlanNode::new("first", "droid").with_claims(["shared.ts"]),
            PlanNode::new("second", "droid").with_claims(["shared.ts"]),
        ]);
        manager.plan_with_id(repo.path(), plan, "exec-1").await?;
        manager.start("exec-1").await?;

        let first = manager.request_next("exec-1").await?;
        let second = manager.request_next("exec-1").await?;
        assert_eq!(first.map(|schedule| schedule.mode), Some(LockMode::Read));
        assert_eq!(second.map(|schedule| schedule.mode), Some(LockMode::Read));
        let locks = manager.lock_manager("exec-1").await?;
        assert_eq!(locks.owners("shared.ts"), vec!["first", "second"]);
        Ok(())
    }

    /// Tests that completing a node that is not running is rejected.
    ///
    /// # Errors
    /// Returns an error if a manager call fails.
    #[tokio::test]
    async fn test_complete_requires_running() -> Result<()> {
        let repo = TempDir::new()?;
        let manager = ExecutionManager::new(memory_config());
        let plan = ExecutionPlan::new(vec![writer("a", &["a.ts"])]);
        manager.plan_with_id(repo.path(), plan, "exec-1").await?;
        manager.start("exec-1").await?;

        let early = manager.complete_node("exec-1", "a", None).await;
        assert!(matches!(
            early,
            Err(ExecutionError::InvalidNodeTransition {
                from: NodeStatus::Ready,
                ..
            })
        ));
        Ok(())
    }

    /// Tests that one failure fails the execution and releases the node's locks.
    ///
    /// # Errors
    /// Returns an error if a manager call fails.
    #[tokio::test]
    async fn test_fail_fast() -> Result<()> {
        let repo = TempDir::new()?;
        let manager = ExecutionManager::new(memory_config());
        let plan = ExecutionPlan::new(vec![
            writer("a", &["a.ts"]),
            writer("b", &["b.ts"]),
            writer("c", &["c.ts"]),
        ])
        .with_edge("a", "c");
        manager.plan_with_id(repo.path(), plan, "exec-1").await?;
        manager.start("exec-1").await?;
        manager.request_next("exec-1").await?;
        manager.request_next("exec-1").await?;

        manager
            .fail_node("exec-1", "a", Some(json!({ "reason": "boom" })))
            .await?;
        let locks = manager.lock_manager("exec-1").await?;
        assert!(!locks.is_locked("a.ts"));

        let snapshot = manager.poll("exec-1").await?;
        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        assert!(manager.request_next("exec-1").await?.is_none());

        manager.complete_node("exec-1", "b", None).await?;
        let after = manager.poll("exec-1").await?;
        assert_eq!(after.status, ExecutionStatus::Failed);
        assert_eq!(after.nodes[2].status, NodeStatus::Pending);
        Ok(())
    }

    /// Tests that abort clears queues and locks and refuses later completions.
    ///
    /// # Errors
    /// Returns an error if a manager call fails.
    #[tokio::test]
    async fn test_abort_clears_state() -> Result<()> {
        let repo = TempDir::new()?;
        let manager = ExecutionManager::new(memory_config());
        let plan = ExecutionPlan::new(vec![writer("a", &["a.ts"]), writer("b", &["b.ts"])]);
        manager.plan_with_id(repo.path(), plan, "exec-1").await?;
        manager.start("exec-1").await?;
        manager.request_next("exec-1").await?;

        manager.abort("exec-1").await?;
        manager.abort("exec-1").await?;
        let snapshot = manager.poll("exec-1").await?;
        assert_eq!(snapshot.status, ExecutionStatus::Aborted);
        assert!(snapshot.ready_queue.is_empty());
        assert!(snapshot.running_nodes.is_empty());
        assert_eq!(manager.lock_manager("exec-1").await?.locked_resource_count(), 0);

        let Err(error) = manager.complete_node("exec-1", "a", None).await else {
            panic!("expected an aborted execution error");
        };
        assert_eq!(
            error.to_string(),
            "Execution exec-1 is aborted; cannot complete a node"
        );
        assert!(manager.resume("exec-1").await.is_err());
        Ok(())
    }

    /// Tests that every mutation reaches subscribers in timeline order.
    ///
    /// # Errors
    /// Returns an error if a manager call fails.
    #[tokio::test]
    async fn test_events_published() -> Result<()> {
        let repo = TempDir::new()?;
        let manager = ExecutionManager::new(memory_config());
        let mut subscription = manager.subscribe_execution("exec-1");
        let plan = ExecutionPlan::new(vec![writer("a", &["a.ts"])]);
        manager.plan_with_id(repo.path(), plan, "exec-1").await?;
        manager.start("exec-1").await?;
        manager.request_next("exec-1").await?;
        manager.complete_node("exec-1", "a", None).await?;

        let mut kinds = Vec::new();
        for _ in 0..6 {
            if let Some(event) = subscription.recv().await {
                kinds.push(event.event);
            }
        }
        assert_eq!(
            kinds,
            vec![
                TimelineEventKind::ExecutionPlanned,
                TimelineEventKind::TaskReady,
                TimelineEventKind::ExecutionStarted,
                TimelineEventKind::TaskStarted,
                TimelineEventKind::TaskCompleted,
                TimelineEventKind::ExecutionCompleted,
            ]
        );

        let timeline: Vec<TimelineEventKind> = manager
            .poll("exec-1")
            .await?
            .timeline
            .iter()
            .map(|event| event.event)
            .collect();
        assert_eq!(timeline, kinds);
        Ok(())
    }

    /// Tests that listings are newest first.
    ///
    /// # Errors
    /// Returns an error if planning fails.
    #[tokio::test]
    async fn test_list_newest_first() -> Result<()> {
        let repo = TempDir::new()?;
        let manager = ExecutionManager::new(memory_config());
        manager
            .plan_with_id(repo.path(), ExecutionPlan::default(), "exec-old")
            .await?;
        sleep(Duration::from_millis(5)).await;
        manager
            .plan_with_id(repo.path(), ExecutionPlan::default(), "exec-new")
            .await?;

        let ids: Vec<String> = manager.list().await.into_iter().map(|item| item.id).collect();
        assert_eq!(ids, vec!["exec-new", "exec-old"]);
        Ok(())
    }

    /// Tests that staged nodes get a workspace when staging is enabled.
    ///
    /// # Errors
    /// Returns an error if a manager call fails.
    #[tokio::test]
    async fn test_staging_path_handed_out() -> Result<()> {
        let repo = TempDir::new()?;
        stdfs::write(repo.path().join("a.ts"), "original")?;
        let mut config = memory_config();
        config.staging.enabled = true;
        let manager = ExecutionManager::new(config);

        let plan = ExecutionPlan::new(vec![writer("a", &["a.ts"])]);
        manager.plan_with_id(repo.path(), plan, "exec-1").await?;
        manager.start("exec-1").await?;
        let Some(next) = manager.request_next("exec-1").await? else {
            panic!("expected a node");
        };
        let Some(staging_path) = next.staging_path else {
            panic!("expected a staging workspace");
        };
        assert_eq!(stdfs::read_to_string(staging_path.join("a.ts"))?, "original");
        Ok(())
    }
}
