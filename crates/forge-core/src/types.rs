//! Plan, status, timeline and snapshot types shared across the execution core.

use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Access mode a node requests on its resource claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Shared access
    Read,
    /// Exclusive access
    #[default]
    Write,
    /// Shared with read and analysis, exclusive against write
    Analysis,
}

impl LockMode {
    /// Whether several owners may hold this mode at once.
    pub const fn is_shared(self) -> bool {
        matches!(self, Self::Read | Self::Analysis)
    }

    /// Whether a holder in `self` mode can coexist with a holder in `other` mode.
    pub const fn is_compatible_with(self, other: Self) -> bool {
        self.is_shared() && other.is_shared()
    }

    /// The stronger of two modes, used when one owner extends its hold.
    #[must_use]
    pub const fn strongest(self, other: Self) -> Self {
        if matches!(self, Self::Write) || matches!(other, Self::Write) {
            Self::Write
        } else {
            self
        }
    }

    /// Wire name of the mode.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Analysis => "analysis",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Lifecycle of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Planned but not started
    Planned,
    /// Handing out work
    Running,
    /// Suspended by a caller, a deadlock or a recovery
    Paused,
    /// Every node completed
    Completed,
    /// Aborted by a caller
    Aborted,
    /// A node failed
    Failed,
}

impl ExecutionStatus {
    /// Terminal executions never change status again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }

    /// Wire name of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Lifecycle of a single node. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Waiting on dependencies
    Pending,
    /// Dependencies satisfied, waiting for locks and a slot
    Ready,
    /// Holding its locks
    Running,
    /// Finished successfully
    Completed,
    /// Finished with a failure
    Failed,
}

impl NodeStatus {
    /// Whether the node has finished.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Wire name of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    /// Unique id within the plan
    pub node_id: String,
    /// Worker that will run the node
    pub droid_id: String,
    /// Short title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Longer description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lock mode for the claims; the configured default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<LockMode>,
    /// Literal paths or glob patterns the node will touch
    #[serde(default)]
    pub resource_claims: Vec<String>,
    /// Opaque caller data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl PlanNode {
    /// Create a node with no claims.
    pub fn new(node_id: impl Into<String>, droid_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            droid_id: droid_id.into(),
            title: None,
            description: None,
            mode: None,
            resource_claims: Vec::new(),
            metadata: None,
        }
    }

    /// Set the resource claims.
    #[must_use]
    pub fn with_claims<I, S>(mut self, claims: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_claims = claims.into_iter().map(Into::into).collect();
        self
    }

    /// Set the lock mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: LockMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Dependency edge: `to` may not start before `from` completes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanEdge {
    /// Prerequisite node
    pub from: String,
    /// Dependent node
    pub to: String,
}

impl PlanEdge {
    /// Create an edge.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Caller-supplied DAG of nodes. Immutable once planned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Nodes in submission order
    pub nodes: Vec<PlanNode>,
    /// Dependency edges
    #[serde(default)]
    pub edges: Vec<PlanEdge>,
    /// Maximum number of running nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

impl ExecutionPlan {
    /// Create a plan without edges.
    pub fn new(nodes: Vec<PlanNode>) -> Self {
        Self {
            nodes,
            edges: Vec::new(),
            concurrency: None,
        }
    }

    /// Add a dependency edge.
    #[must_use]
    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(PlanEdge::new(from, to));
        self
    }

    /// Set the concurrency cap.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Concurrency cap with `default` applied, floored at 1.
    pub fn effective_concurrency(&self, default: usize) -> usize {
        self.concurrency.unwrap_or(default).max(1)
    }
}

/// Kinds of timeline events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimelineEventKind {
    /// Execution was planned
    #[serde(rename = "execution.planned")]
    ExecutionPlanned,
    /// Execution started handing out work
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    /// Execution was paused
    #[serde(rename = "execution.paused")]
    ExecutionPaused,
    /// Execution resumed
    #[serde(rename = "execution.resumed")]
    ExecutionResumed,
    /// Every node completed
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    /// A node failed
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    /// Execution was aborted
    #[serde(rename = "execution.aborted")]
    ExecutionAborted,
    /// Scheduling stalled with nothing running
    #[serde(rename = "execution.deadlock")]
    ExecutionDeadlock,
    /// Execution was rehydrated after a restart
    #[serde(rename = "execution.recovered")]
    ExecutionRecovered,
    /// Staged changes were merged into the repository
    #[serde(rename = "execution.merged")]
    ExecutionMerged,
    /// Staged changes conflicted and nothing was merged
    #[serde(rename = "execution.merge_conflict")]
    ExecutionMergeConflict,
    /// Node became ready
    #[serde(rename = "task.ready")]
    TaskReady,
    /// Node started running
    #[serde(rename = "task.started")]
    TaskStarted,
    /// Node completed
    #[serde(rename = "task.completed")]
    TaskCompleted,
    /// Node failed
    #[serde(rename = "task.failed")]
    TaskFailed,
}

impl TimelineEventKind {
    /// Dotted wire name of the event.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionPlanned => "execution.planned",
            Self::ExecutionStarted => "execution.started",
            Self::ExecutionPaused => "execution.paused",
            Self::ExecutionResumed => "execution.resumed",
            Self::ExecutionCompleted => "execution.completed",
            Self::ExecutionFailed => "execution.failed",
            Self::ExecutionAborted => "execution.aborted",
            Self::ExecutionDeadlock => "execution.deadlock",
            Self::ExecutionRecovered => "execution.recovered",
            Self::ExecutionMerged => "execution.merged",
            Self::ExecutionMergeConflict => "execution.merge_conflict",
            Self::TaskReady => "task.ready",
            Self::TaskStarted => "task.started",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
        }
    }
}

impl fmt::Display for TimelineEventKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Entry of an execution's append-only timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// Execution the event belongs to
    pub execution_id: String,
    /// Node the event concerns, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Event kind
    pub event: TimelineEventKind,
    /// Event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl TimelineEvent {
    /// Create an event stamped with the current time.
    pub fn now(
        execution_id: impl Into<String>,
        node_id: Option<String>,
        event: TimelineEventKind,
        detail: Option<Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            execution_id: execution_id.into(),
            node_id,
            event,
            detail,
        }
    }
}

/// Work handed to a caller by `request_next`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSchedule {
    /// Node id
    pub node_id: String,
    /// Worker that runs the node
    pub droid_id: String,
    /// Short title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Longer description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Mode the claims were locked in
    pub mode: LockMode,
    /// Claims now held by the node
    pub resource_claims: Vec<String>,
    /// Private staging workspace, when staging is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_path: Option<PathBuf>,
}

/// Per-node view inside a poll snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    /// Node id
    pub node_id: String,
    /// Worker that runs the node
    pub droid_id: String,
    /// Current status
    pub status: NodeStatus,
    /// When the node started running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the node finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Full read-only view of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSnapshot {
    /// Execution id
    pub execution_id: String,
    /// Current status
    pub status: ExecutionStatus,
    /// Timeline so far
    pub timeline: Vec<TimelineEvent>,
    /// Nodes in plan order
    pub nodes: Vec<NodeSnapshot>,
    /// The submitted plan
    pub plan: ExecutionPlan,
    /// Ready queue in scheduling order
    pub ready_queue: Vec<String>,
    /// Running node ids, sorted
    pub running_nodes: Vec<String>,
    /// Effective concurrency cap
    pub concurrency: usize,
    /// Last mutation time
    pub last_updated: DateTime<Utc>,
}

/// Summary of one execution for health and listing consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    /// Execution id
    pub id: String,
    /// Repository the execution works on
    pub repo_root: PathBuf,
    /// Current status
    pub status: ExecutionStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub last_updated: DateTime<Utc>,
    /// Running node ids, sorted
    pub running_nodes: Vec<String>,
    /// Ready queue in scheduling order
    pub ready_queue: Vec<String>,
}

/// Ownership of one locked resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    /// Mode the resource is held in
    pub mode: LockMode,
    /// Owning node ids, sorted
    pub owners: Vec<String>,
}

/// Lock ownership keyed by resource, in resource order.
pub type LockTable = BTreeMap<String, LockSnapshot>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Error as JsonError, from_str, json, to_value};

    #[test]
    fn test_lock_mode_compatibility() {
        assert!(LockMode::Read.is_compatible_with(LockMode::Read));
        assert!(LockMode::Read.is_compatible_with(LockMode::Analysis));
        assert!(LockMode::Analysis.is_compatible_with(LockMode::Analysis));
        assert!(!LockMode::Write.is_compatible_with(LockMode::Write));
        assert!(!LockMode::Write.is_compatible_with(LockMode::Read));
        assert!(!LockMode::Analysis.is_compatible_with(LockMode::Write));
    }

    #[test]
    fn test_lock_mode_strongest() {
        assert_eq!(LockMode::Read.strongest(LockMode::Write), LockMode::Write);
        assert_eq!(LockMode::Analysis.strongest(LockMode::Read), LockMode::Analysis);
        assert_eq!(LockMode::default(), LockMode::Write);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Aborted.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
    }

    #[test]
    fn test_effective_concurrency() {
        let plan = ExecutionPlan::new(vec![]);
        assert_eq!(plan.effective_concurrency(2), 2);
        assert_eq!(plan.clone().with_concurrency(0).effective_concurrency(2), 1);
        assert_eq!(plan.with_concurrency(5).effective_concurrency(2), 5);
    }

    /// Tests that plans in the camelCase submission format deserialize.
    ///
    /// # Errors
    /// Returns an error if deserialization fails.
    #[test]
    fn test_plan_from_json() -> Result<(), JsonError> {
        let plan: ExecutionPlan = from_str(
            r#"{
                "nodes": [
                    {"nodeId": "a", "droidId": "coder", "mode": "analysis",
                     "resourceClaims": ["src/**/*.ts"]},
                    {"nodeId": "b", "droidId": "tester"}
                ],
                "edges": [{"from": "a", "to": "b"}],
                "concurrency": 3
            }"#,
        )?;

        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.nodes[0].mode, Some(LockMode::Analysis));
        assert_eq!(plan.nodes[0].resource_claims, vec!["src/**/*.ts"]);
        assert!(plan.nodes[1].resource_claims.is_empty());
        assert_eq!(plan.edges, vec![PlanEdge::new("a", "b")]);
        assert_eq!(plan.concurrency, Some(3));
        Ok(())
    }

    /// Tests the dotted wire names of timeline events.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    #[test]
    fn test_timeline_event_wire_format() -> Result<(), JsonError> {
        let event = TimelineEvent::now(
            "exec-1",
            Some("a".to_owned()),
            TimelineEventKind::ExecutionMergeConflict,
            Some(json!({"conflicts": ["x.ts"]})),
        );
        let value = to_value(&event)?;
        assert_eq!(value["event"], "execution.merge_conflict");
        assert_eq!(value["executionId"], "exec-1");
        assert_eq!(value["nodeId"], "a");

        let kind: TimelineEventKind = from_str("\"task.started\"")?;
        assert_eq!(kind, TimelineEventKind::TaskStarted);
        assert_eq!(kind.to_string(), "task.started");
        Ok(())
    }
}
