//! Durable execution state for crash recovery.
//!
//! Each execution is stored as `<repo>/<state_dir>/exec/<id>/state.json`,
//! replaced atomically on every save.

use crate::atomic::write_atomic;
use crate::record::ExecutionRecord;
use chrono::{DateTime, Utc};
use forge_core::{
    ExecutionError, ExecutionPlan, ExecutionStatus, ForgeConfig, LockMode, LockSnapshot, LockTable,
    NodeStatus, PlanNode, Result, TimelineEvent, TimelineEventKind,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs as tfs;
use tracing::{debug, info, warn};

/// File name of the state file inside an execution directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// One node as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNode {
    /// Node id
    pub node_id: String,
    /// The submitted node
    pub spec: PlanNode,
    /// Status at save time
    pub status: NodeStatus,
    /// When the node started running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the node finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// One held resource as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedLock {
    /// Canonical resource key
    pub resource: String,
    /// Held mode
    pub mode: LockMode,
    /// Owning node ids
    pub owners: Vec<String>,
}

/// Serializable projection of an execution and its lock table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedExecution {
    /// Execution id
    pub id: String,
    /// Repository the execution works on
    pub repo_root: PathBuf,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last event
    pub last_updated: DateTime<Utc>,
    /// Status at save time
    pub status: ExecutionStatus,
    /// The submitted plan
    pub plan: ExecutionPlan,
    /// Effective concurrency cap
    pub concurrency: usize,
    /// Nodes in plan order
    pub nodes: Vec<PersistedNode>,
    /// Ready queue in scheduling order
    pub ready_queue: Vec<String>,
    /// Running node ids
    pub running_nodes: Vec<String>,
    /// Held resources
    pub locks: Vec<PersistedLock>,
    /// Timeline so far
    #[serde(default)]
    pub timeline: Vec<TimelineEvent>,
}

impl PersistedExecution {
    /// Project a live record and its lock table.
    pub fn from_record(record: &ExecutionRecord, locks: &LockTable) -> Self {
        let nodes = record
            .plan
            .nodes
            .iter()
            .filter_map(|node| record.nodes.get(&node.node_id))
            .map(|state| PersistedNode {
                node_id: state.spec.node_id.clone(),
                spec: state.spec.clone(),
                status: state.status,
                started_at: state.started_at,
                finished_at: state.finished_at,
            })
            .collect();

        let locks = locks
            .iter()
            .map(|(resource, snapshot)| PersistedLock {
                resource: resource.clone(),
                mode: snapshot.mode,
                owners: snapshot.owners.clone(),
            })
            .collect();

        Self {
            id: record.id.clone(),
            repo_root: record.repo_root.clone(),
            created_at: record.created_at,
            last_updated: record.last_updated,
            status: record.status,
            plan: record.plan.clone(),
            concurrency: record.concurrency,
            nodes,
            ready_queue: record.ready_queue.clone(),
            running_nodes: record.running_nodes.iter().cloned().collect(),
            locks,
            timeline: record.timeline.clone(),
        }
    }

    /// Rehydrate the live record and lock table.
    ///
    /// Dependency counts are recomputed from the edges and node statuses. The
    /// ready queue keeps its saved order, drops entries that are no longer
    /// ready and appends ready nodes it was missing; the running set is
    /// rebuilt from node statuses.
    pub fn into_record(self) -> (ExecutionRecord, LockTable) {
        let mut record = ExecutionRecord::from_parts(
            self.id,
            self.repo_root,
            self.plan,
            self.concurrency,
            self.created_at,
        );

        for persisted in self.nodes {
            if let Some(state) = record.nodes.get_mut(&persisted.node_id) {
                state.status = persisted.status;
                state.started_at = persisted.started_at;
                state.finished_at = persisted.finished_at;
            } else {
                warn!(
                    "Dropping persisted node {} of {}: not in plan",
                    persisted.node_id, record.id
                );
            }
        }
        record.recount_dependencies();

        let mut ready_queue: Vec<String> = self
            .ready_queue
            .into_iter()
            .filter(|node_id| {
                record
                    .nodes
                    .get(node_id)
                    .is_some_and(|state| state.status == NodeStatus::Ready)
            })
            .collect();
        for node_id in record.nodes_with_status(NodeStatus::Ready) {
            if !ready_queue.contains(&node_id) {
                ready_queue.push(node_id);
            }
        }
        record.ready_queue = ready_queue;
        record.running_nodes = record
            .nodes_with_status(NodeStatus::Running)
            .into_iter()
            .collect();

        record.status = self.status;
        record.timeline = self.timeline;
        record.last_updated = self.last_updated;

        let locks = self
            .locks
            .into_iter()
            .map(|lock| {
                (
                    lock.resource,
                    LockSnapshot {
                        mode: lock.mode,
                        owners: lock.owners,
                    },
                )
            })
            .collect();

        (record, locks)
    }
}

/// Reads and writes execution state files.
#[derive(Debug, Clone)]
pub struct ExecutionPersistence {
    config: ForgeConfig,
}

impl Default for ExecutionPersistence {
    fn default() -> Self {
        Self::from_config(&ForgeConfig::default())
    }
}

impl ExecutionPersistence {
    /// Use the workspace layout of a config.
    pub fn from_config(config: &ForgeConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Path of an execution's state file.
    pub fn state_path(&self, repo_root: &Path, execution_id: &str) -> PathBuf {
        self.config
            .execution_dir(repo_root, execution_id)
            .join(STATE_FILE_NAME)
    }

    /// Save a record together with its lock table.
    ///
    /// # Errors
    /// Returns an error if the state cannot be serialized or written
    pub async fn save(&self, record: &ExecutionRecord, locks: &LockTable) -> Result<()> {
        self.write(&PersistedExecution::from_record(record, locks))
            .await
    }

    /// Atomically replace the state file of an execution.
    ///
    /// # Errors
    /// Returns an error if the state cannot be serialized or written
    pub async fn write(&self, state: &PersistedExecution) -> Result<()> {
        let path = self.state_path(&state.repo_root, &state.id);
        let contents = serde_json::to_string_pretty(state)?;
        write_atomic(&path, &contents).await?;
        debug!("Persisted {} ({}) to {}", state.id, state.status, path.display());
        Ok(())
    }

    /// Load a saved execution, `None` if it was never saved.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed
    pub async fn load(
        &self,
        repo_root: &Path,
        execution_id: &str,
    ) -> Result<Option<PersistedExecution>> {
        let path = self.state_path(repo_root, execution_id);
        match tfs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Ids of every saved execution, sorted.
    ///
    /// # Errors
    /// Returns an error if the execution directory cannot be read
    pub async fn list_executions(&self, repo_root: &Path) -> Result<Vec<String>> {
        let executions_dir = self.config.executions_dir(repo_root);
        let mut entries = match tfs::read_dir(&executions_dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if tfs::try_exists(entry.path().join(STATE_FILE_NAME)).await? {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Whether an execution has a state file.
    pub fn exists(&self, repo_root: &Path, execution_id: &str) -> bool {
        self.state_path(repo_root, execution_id).exists()
    }

    /// Remove an execution directory, including its staging workspaces.
    ///
    /// # Errors
    /// Returns an error if the directory exists but cannot be removed
    pub async fn delete(&self, repo_root: &Path, execution_id: &str) -> Result<()> {
        if execution_id.is_empty() || execution_id.contains(['/', '\\']) || execution_id == ".." {
            return Err(ExecutionError::Persistence(format!(
                "Invalid execution id: {execution_id}"
            )));
        }
        let dir = self.config.execution_dir(repo_root, execution_id);
        match tfs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("Deleted persisted state of {execution_id}");
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Load every execution left `running` by a process that is gone, demote
    /// it to `paused` and rewrite it.
    ///
    /// Executions named in `live` are still owned by this process; their state
    /// files are neither read nor rewritten. Unreadable state files are
    /// skipped with a warning.
    ///
    /// # Errors
    /// Returns an error if the execution directory cannot be listed or a
    /// recovered state cannot be rewritten
    pub async fn recover_all(
        &self,
        repo_root: &Path,
        live: &HashSet<String>,
    ) -> Result<Vec<(ExecutionRecord, LockTable)>> {
        let mut recovered = Vec::new();

        for execution_id in self.list_executions(repo_root).await? {
            if live.contains(&execution_id) {
                debug!("Skipping recovery of {execution_id}: still live");
                continue;
            }
            let persisted = match self.load(repo_root, &execution_id).await {
                Ok(Some(persisted)) => persisted,
                Ok(None) => continue,
                Err(error) => {
                    warn!("Skipping unreadable state of {execution_id}: {error}");
                    continue;
                }
            };
            if persisted.status != ExecutionStatus::Running {
                continue;
            }

            let (mut record, locks) = persisted.into_record();
            let detail = json!({
                "previousStatus": ExecutionStatus::Running,
                "runningNodes": record.running_nodes,
                "readyQueue": record.ready_queue,
            });
            record.set_status(
                ExecutionStatus::Paused,
                TimelineEventKind::ExecutionRecovered,
                Some(detail),
            );
            self.save(&record, &locks).await?;

            info!(
                "Recovered {} as paused with {} running and {} ready nodes",
                record.id,
                record.running_nodes.len(),
                record.ready_queue.len()
            );
            recovered.push((record, locks));
        }

        Ok(recovered)
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code asserts on results directly"
)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use tempfile::TempDir;

    fn chain(repo_root: &Path) -> Result<ExecutionRecord> {
        let plan = ExecutionPlan::new(vec![
            PlanNode::new("a", "droid").with_claims(["a.ts"]),
            PlanNode::new("b", "droid").with_claims(["b.ts"]),
            PlanNode::new("c", "droid"),
        ])
        .with_edge("a", "b");
        ExecutionRecord::from_plan("exec-1".to_owned(), repo_root.to_path_buf(), plan, 2)
    }

    fn held(resource: &str, owner: &str) -> LockTable {
        LockTable::from([(
            resource.to_owned(),
            LockSnapshot {
                mode: LockMode::Write,
                owners: vec![owner.to_owned()],
            },
        )])
    }

    /// Tests that a saved record loads back with the same state.
    ///
    /// # Errors
    /// Returns an error if saving or loading fails.
    #[tokio::test]
    async fn test_save_and_load() -> Result<()> {
        let repo = TempDir::new()?;
        let persistence = ExecutionPersistence::default();
        let mut record = chain(repo.path())?;
        record.status = ExecutionStatus::Running;
        record.start_node("a")?;
        let locks = held("a.ts", "a");

        persistence.save(&record, &locks).await?;
        assert!(persistence.exists(repo.path(), "exec-1"));
        assert!(
            repo.path()
                .join(".droidforge/exec/exec-1/state.json")
                .exists()
        );

        let Some(loaded) = persistence.load(repo.path(), "exec-1").await? else {
            panic!("expected persisted state");
        };
        assert_eq!(loaded.running_nodes, vec!["a"]);
        assert_eq!(loaded.locks[0].owners, vec!["a"]);

        let (restored, restored_locks) = loaded.into_record();
        assert_eq!(restored.status, ExecutionStatus::Running);
        assert_eq!(restored.ready_queue, vec!["c"]);
        assert_eq!(restored.running_nodes.len(), 1);
        assert_eq!(restored.node("b")?.remaining_dependencies, 1);
        assert_eq!(restored.timeline, record.timeline);
        assert_eq!(restored_locks, locks);
        Ok(())
    }

    /// Tests that missing state loads as `None`.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    #[tokio::test]
    async fn test_load_missing() -> Result<()> {
        let repo = TempDir::new()?;
        let persistence = ExecutionPersistence::default();
        assert!(persistence.load(repo.path(), "nope").await?.is_none());
        assert!(persistence.list_executions(repo.path()).await?.is_empty());
        Ok(())
    }

    /// Tests that only running executions are recovered, demoted to paused.
    ///
    /// # Errors
    /// Returns an error if saving or recovery fails.
    #[tokio::test]
    async fn test_recover_all_demotes_running() -> Result<()> {
        let repo = TempDir::new()?;
        let persistence = ExecutionPersistence::default();

        let mut running = chain(repo.path())?;
        running.status = ExecutionStatus::Running;
        running.start_node("a")?;
        running.finish_node("a", NodeStatus::Completed, None)?;
        running.promote_dependents("a")?;
        persistence.save(&running, &LockTable::new()).await?;

        let mut finished = ExecutionRecord::from_plan(
            "exec-2".to_owned(),
            repo.path().to_path_buf(),
            ExecutionPlan::default(),
            2,
        )?;
        finished.status = ExecutionStatus::Completed;
        persistence.save(&finished, &LockTable::new()).await?;

        let corrupt = repo.path().join(".droidforge/exec/exec-3");
        stdfs::create_dir_all(&corrupt)?;
        stdfs::write(corrupt.join(STATE_FILE_NAME), "{ not json")?;

        assert_eq!(
            persistence.list_executions(repo.path()).await?,
            vec!["exec-1", "exec-2", "exec-3"]
        );

        let recovered = persistence.recover_all(repo.path(), &HashSet::new()).await?;
        assert_eq!(recovered.len(), 1);
        let (record, _) = &recovered[0];
        assert_eq!(record.id, "exec-1");
        assert_eq!(record.status, ExecutionStatus::Paused);
        assert_eq!(record.node("a")?.status, NodeStatus::Completed);
        assert_eq!(record.ready_queue, vec!["c", "b"]);
        assert_eq!(
            record.timeline.last().map(|event| event.event),
            Some(TimelineEventKind::ExecutionRecovered)
        );

        let Some(on_disk) = persistence.load(repo.path(), "exec-1").await? else {
            panic!("expected persisted state");
        };
        assert_eq!(on_disk.status, ExecutionStatus::Paused);
        assert!(persistence.recover_all(repo.path(), &HashSet::new()).await?.is_empty());
        Ok(())
    }

    /// Tests that executions owned by this process are not demoted.
    ///
    /// # Errors
    /// Returns an error if saving or recovery fails.
    #[tokio::test]
    async fn test_recover_all_skips_live_executions() -> Result<()> {
        let repo = TempDir::new()?;
        let persistence = ExecutionPersistence::default();

        let mut running = chain(repo.path())?;
        running.status = ExecutionStatus::Running;
        persistence.save(&running, &LockTable::new()).await?;

        let live = HashSet::from(["exec-1".to_owned()]);
        assert!(persistence.recover_all(repo.path(), &live).await?.is_empty());

        let Some(on_disk) = persistence.load(repo.path(), "exec-1").await? else {
            panic!("expected persisted state");
        };
        assert_eq!(on_disk.status, ExecutionStatus::Running);
        assert_eq!(on_disk.timeline.len(), running.timeline.len());
        Ok(())
    }

    /// Tests deleting persisted state.
    ///
    /// # Errors
    /// Returns an error if saving or deleting fails.
    #[tokio::test]
    async fn test_delete() -> Result<()> {
        let repo = TempDir::new()?;
        let persistence = ExecutionPersistence::default();
        let record = chain(repo.path())?;
        persistence.save(&record, &LockTable::new()).await?;

        persistence.delete(repo.path(), "exec-1").await?;
        assert!(!persistence.exists(repo.path(), "exec-1"));
        persistence.delete(repo.path(), "exec-1").await?;
        assert!(persistence.delete(repo.path(), "../escape").await.is_err());
        Ok(())
    }
}
