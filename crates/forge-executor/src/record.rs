//! Live state of one execution and the dependency bookkeeping behind it.

use chrono::{DateTime, Utc};
use forge_core::{
    ExecutionError, ExecutionPlan, ExecutionSnapshot, ExecutionStatus, NodeSnapshot,
    NodeStatus, PlanNode, PollSnapshot, Result, TimelineEvent, TimelineEventKind,
};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use tracing::warn;

/// Scheduling state of one plan node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    /// The submitted node
    pub spec: PlanNode,
    /// Current status
    pub status: NodeStatus,
    /// Nodes whose dependency count this node contributes to
    pub dependents: Vec<String>,
    /// Prerequisites that have not completed yet
    pub remaining_dependencies: usize,
    /// When the node started running
    pub started_at: Option<DateTime<Utc>>,
    /// When the node finished
    pub finished_at: Option<DateTime<Utc>>,
}

/// One scheduling session. Mutated only under the execution's exclusive lock.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    /// Execution id
    pub id: String,
    /// Repository the execution works on
    pub repo_root: PathBuf,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Current status
    pub status: ExecutionStatus,
    /// The submitted plan
    pub plan: ExecutionPlan,
    /// Node states keyed by node id
    pub nodes: HashMap<String, NodeState>,
    /// Runnable nodes in scheduling order
    pub ready_queue: Vec<String>,
    /// Nodes currently holding their locks
    pub running_nodes: BTreeSet<String>,
    /// Append-only event log
    pub timeline: Vec<TimelineEvent>,
    /// Time of the last appended event
    pub last_updated: DateTime<Utc>,
    /// Maximum number of running nodes
    pub concurrency: usize,
}

/// Forward-only node transitions.
const fn is_allowed(from: NodeStatus, to: NodeStatus) -> bool {
    matches!(
        (from, to),
        (NodeStatus::Pending, NodeStatus::Ready)
            | (NodeStatus::Ready, NodeStatus::Running)
            | (NodeStatus::Running, NodeStatus::Completed | NodeStatus::Failed)
    )
}

impl ExecutionRecord {
    /// Build a planned execution: dependency counts from the edges, nodes
    /// without prerequisites queued as ready.
    ///
    /// # Errors
    /// Returns an error if two nodes share an id
    pub fn from_plan(
        id: String,
        repo_root: PathBuf,
        plan: ExecutionPlan,
        default_concurrency: usize,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for node in &plan.nodes {
            if !seen.insert(node.node_id.as_str()) {
                return Err(ExecutionError::Other(format!(
                    "Duplicate node id {} in plan",
                    node.node_id
                )));
            }
        }

        let concurrency = plan.effective_concurrency(default_concurrency);
        let mut record = Self::from_parts(id, repo_root, plan, concurrency, Utc::now());

        let detail = json!({
            "nodes": record.plan.nodes.len(),
            "edges": record.plan.edges.len(),
            "concurrency": concurrency,
        });
        record.push_event(None, TimelineEventKind::ExecutionPlanned, Some(detail));

        let roots: Vec<String> = record
            .plan
            .nodes
            .iter()
            .filter(|node| {
                record
                    .nodes
                    .get(&node.node_id)
                    .is_some_and(|state| state.remaining_dependencies == 0)
            })
            .map(|node| node.node_id.clone())
            .collect();
        for node_id in roots {
            record.mark_ready(&node_id)?;
        }

        Ok(record)
    }

    /// Build an execution with every node pending and dependency counts taken
    /// from the edges. Edges naming unknown nodes are ignored.
    pub fn from_parts(
        id: String,
        repo_root: PathBuf,
        plan: ExecutionPlan,
        concurrency: usize,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut nodes: HashMap<String, NodeState> = plan
            .nodes
            .iter()
            .map(|node| {
                (
                    node.node_id.clone(),
                    NodeState {
                        spec: node.clone(),
                        status: NodeStatus::Pending,
                        dependents: Vec::new(),
                        remaining_dependencies: 0,
                        started_at: None,
                        finished_at: None,
                    },
                )
            })
            .collect();

        for edge in &plan.edges {
            if !nodes.contains_key(&edge.from) || !nodes.contains_key(&edge.to) {
                warn!(
                    "Ignoring edge {} -> {} in {id}: unknown node",
                    edge.from, edge.to
                );
                continue;
            }
            if let Some(source) = nodes.get_mut(&edge.from) {
                source.dependents.push(edge.to.clone());
            }
            if let Some(target) = nodes.get_mut(&edge.to) {
                target.remaining_dependencies += 1;
            }
        }

        Self {
            id,
            repo_root,
            created_at,
            status: ExecutionStatus::Planned,
            plan,
            nodes,
            ready_queue: Vec::new(),
            running_nodes: BTreeSet::new(),
            timeline: Vec::new(),
            last_updated: created_at,
            concurrency: concurrency.max(1),
        }
    }

    /// Recompute dependency counts from the current node statuses.
    pub fn recount_dependencies(&mut self) {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for state in self.nodes.values() {
            if state.status == NodeStatus::Completed {
                continue;
            }
            for dependent in &state.dependents {
                *counts.entry(dependent.clone()).or_default() += 1;
            }
        }
        for (node_id, state) in &mut self.nodes {
            state.remaining_dependencies = counts.get(node_id).copied().unwrap_or(0);
        }
    }

    /// Append an event and bump `last_updated`.
    pub fn push_event(
        &mut self,
        node_id: Option<&str>,
        event: TimelineEventKind,
        detail: Option<Value>,
    ) {
        let entry = TimelineEvent::now(self.id.clone(), node_id.map(str::to_owned), event, detail);
        self.last_updated = entry.timestamp;
        self.timeline.push(entry);
    }

    /// Events appended after the timeline had `mark` entries.
    pub fn events_since(&self, mark: usize) -> Vec<TimelineEvent> {
        self.timeline.get(mark..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Change the execution status and record the event.
    pub fn set_status(
        &mut self,
        status: ExecutionStatus,
        event: TimelineEventKind,
        detail: Option<Value>,
    ) {
        self.status = status;
        self.push_event(None, event, detail);
    }

    /// Look up a node.
    ///
    /// # Errors
    /// Returns `UnknownNode` if the plan has no such node
    pub fn node(&self, node_id: &str) -> Result<&NodeState> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| ExecutionError::UnknownNode {
                execution_id: self.id.clone(),
                node_id: node_id.to_owned(),
            })
    }

    fn transition(&mut self, node_id: &str, to: NodeStatus) -> Result<&mut NodeState> {
        let execution_id = self.id.clone();
        let state = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ExecutionError::UnknownNode {
                execution_id,
                node_id: node_id.to_owned(),
            })?;
        if !is_allowed(state.status, to) {
            return Err(ExecutionError::InvalidNodeTransition {
                node_id: node_id.to_owned(),
                from: state.status,
                to,
            });
        }
        state.status = to;
        Ok(state)
    }

    fn mark_ready(&mut self, node_id: &str) -> Result<()> {
        self.transition(node_id, NodeStatus::Ready)?;
        self.ready_queue.push(node_id.to_owned());
        self.push_event(Some(node_id), TimelineEventKind::TaskReady, None);
        Ok(())
    }

    /// Move a ready node to running once its locks are held.
    ///
    /// # Errors
    /// Returns an error if the node is unknown or not ready
    pub fn start_node(&mut self, node_id: &str) -> Result<()> {
        let state = self.transition(node_id, NodeStatus::Running)?;
        state.started_at = Some(Utc::now());
        let droid_id = state.spec.droid_id.clone();

        self.ready_queue.retain(|queued| queued != node_id);
        self.running_nodes.insert(node_id.to_owned());
        self.push_event(
            Some(node_id),
            TimelineEventKind::TaskStarted,
            Some(json!({ "droidId": droid_id })),
        );
        Ok(())
    }

    /// Finish a running node as completed or failed.
    ///
    /// # Errors
    /// Returns an error if the node is unknown or not running
    pub fn finish_node(
        &mut self,
        node_id: &str,
        status: NodeStatus,
        detail: Option<Value>,
    ) -> Result<()> {
        let state = self.transition(node_id, status)?;
        state.finished_at = Some(Utc::now());

        self.running_nodes.remove(node_id);
        let event = if status == NodeStatus::Completed {
            TimelineEventKind::TaskCompleted
        } else {
            TimelineEventKind::TaskFailed
        };
        self.push_event(Some(node_id), event, detail);
        Ok(())
    }

    /// Count a completed node against its dependents and queue those with no
    /// prerequisites left.
    ///
    /// # Errors
    /// Returns an error if a dependent is missing from the plan
    pub fn promote_dependents(&mut self, node_id: &str) -> Result<Vec<String>> {
        let dependents = self.node(node_id)?.dependents.clone();
        let mut promoted = Vec::new();
        for dependent_id in dependents {
            let execution_id = self.id.clone();
            let dependent = self.nodes.get_mut(&dependent_id).ok_or_else(|| {
                ExecutionError::UnknownNode {
                    execution_id,
                    node_id: dependent_id.clone(),
                }
            })?;
            dependent.remaining_dependencies = dependent.remaining_dependencies.saturating_sub(1);
            if dependent.status == NodeStatus::Pending && dependent.remaining_dependencies == 0 {
                self.mark_ready(&dependent_id)?;
                promoted.push(dependent_id);
            }
        }
        Ok(promoted)
    }

    /// Mark the execution completed once every node has completed.
    pub fn check_completion(&mut self) -> bool {
        if self.status.is_terminal() || !self.is_complete() {
            return false;
        }
        let detail = json!({ "nodes": self.nodes.len() });
        self.set_status(
            ExecutionStatus::Completed,
            TimelineEventKind::ExecutionCompleted,
            Some(detail),
        );
        true
    }

    /// Whether every node has completed.
    pub fn is_complete(&self) -> bool {
        self.nodes
            .values()
            .all(|state| state.status == NodeStatus::Completed)
    }

    /// Claims of every node keyed by node id.
    pub fn claims_map(&self) -> HashMap<String, Vec<String>> {
        self.nodes
            .iter()
            .map(|(node_id, state)| (node_id.clone(), state.spec.resource_claims.clone()))
            .collect()
    }

    /// Nodes in `status`, in plan order.
    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<String> {
        self.plan
            .nodes
            .iter()
            .filter(|node| {
                self.nodes
                    .get(&node.node_id)
                    .is_some_and(|state| state.status == status)
            })
            .map(|node| node.node_id.clone())
            .collect()
    }

    /// Full read-only view.
    pub fn poll_snapshot(&self) -> PollSnapshot {
        let nodes = self
            .plan
            .nodes
            .iter()
            .filter_map(|node| self.nodes.get(&node.node_id))
            .map(|state| NodeSnapshot {
                node_id: state.spec.node_id.clone(),
                droid_id: state.spec.droid_id.clone(),
                status: state.status,
                started_at: state.started_at,
                finished_at: state.finished_at,
            })
            .collect();

        PollSnapshot {
            execution_id: self.id.clone(),
            status: self.status,
            timeline: self.timeline.clone(),
            nodes,
            plan: self.plan.clone(),
            ready_queue: self.ready_queue.clone(),
            running_nodes: self.running_nodes.iter().cloned().collect(),
            concurrency: self.concurrency,
            last_updated: self.last_updated,
        }
    }

    /// Summary for listings and health consumers.
    pub fn execution_snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: self.id.clone(),
            repo_root: self.repo_root.clone(),
            status: self.status,
            created_at: self.created_at,
            last_updated: self.last_updated,
            running_nodes: self.running_nodes.iter().cloned().collect(),
            ready_queue: self.ready_queue.clone(),
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

    fn diamond() -> ExecutionPlan {
        ExecutionPlan::new(vec![
            PlanNode::new("a", "droid-a"),
            PlanNode::new("b", "droid-b"),
            PlanNode::new("c", "droid-c"),
            PlanNode::new("d", "droid-d"),
        ])
        .with_edge("a", "b")
        .with_edge("a", "c")
        .with_edge("b", "d")
        .with_edge("c", "d")
    }

    fn planned(plan: ExecutionPlan) -> Result<ExecutionRecord> {
        ExecutionRecord::from_plan("exec-1".to_owned(), PathBuf::from("/repo"), plan, 2)
    }

    /// Tests that only nodes without prerequisites start ready.
    ///
    /// # Errors
    /// Returns an error if planning fails.
    #[test]
    fn test_from_plan_queues_roots() -> Result<()> {
        let record = planned(diamond())?;
        assert_eq!(record.status, ExecutionStatus::Planned);
        assert_eq!(record.ready_queue, vec!["a"]);
        assert_eq!(record.node("d")?.remaining_dependencies, 2);
        assert_eq!(record.node("a")?.dependents, vec!["b", "c"]);
        assert_eq!(record.timeline[0].event, TimelineEventKind::ExecutionPlanned);
        assert_eq!(record.timeline[1].event, TimelineEventKind::TaskReady);
        assert_eq!(record.concurrency, 2);
        Ok(())
    }

    #[test]
    fn test_duplicate_node_ids_rejected() {
        let plan = ExecutionPlan::new(vec![PlanNode::new("a", "x"), PlanNode::new("a", "y")]);
        assert!(planned(plan).is_err());
    }

    /// Tests that dependents become ready only once every prerequisite completed.
    ///
    /// # Errors
    /// Returns an error if a transition fails.
    #[test]
    fn test_dependents_promoted_after_all_prerequisites() -> Result<()> {
        let mut record = planned(diamond())?;
        record.start_node("a")?;
        record.finish_node("a", NodeStatus::Completed, None)?;
        assert_eq!(record.promote_dependents("a")?, vec!["b", "c"]);

        record.start_node("b")?;
        record.finish_node("b", NodeStatus::Completed, None)?;
        assert!(record.promote_dependents("b")?.is_empty());
        assert_eq!(record.node("d")?.status, NodeStatus::Pending);

        record.start_node("c")?;
        record.finish_node("c", NodeStatus::Completed, None)?;
        assert_eq!(record.promote_dependents("c")?, vec!["d"]);
        assert_eq!(record.ready_queue, vec!["d"]);
        Ok(())
    }

    /// Tests that nodes only move forward.
    ///
    /// # Errors
    /// Returns an error if planning fails.
    #[test]
    fn test_invalid_transitions_rejected() -> Result<()> {
        let mut record = planned(diamond())?;
        assert!(matches!(
            record.finish_node("a", NodeStatus::Completed, None),
            Err(ExecutionError::InvalidNodeTransition {
                from: NodeStatus::Ready,
                to: NodeStatus::Completed,
                ..
            })
        ));
        assert!(matches!(
            record.start_node("d"),
            Err(ExecutionError::InvalidNodeTransition { .. })
        ));
        assert!(matches!(
            record.start_node("missing"),
            Err(ExecutionError::UnknownNode { .. })
        ));
        Ok(())
    }

    /// Tests completion detection.
    ///
    /// # Errors
    /// Returns an error if a transition fails.
    #[test]
    fn test_check_completion() -> Result<()> {
        let plan = ExecutionPlan::new(vec![PlanNode::new("only", "droid")]);
        let mut record = planned(plan)?;
        assert!(!record.check_completion());

        record.start_node("only")?;
        record.finish_node("only", NodeStatus::Completed, None)?;
        assert!(record.check_completion());
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(!record.check_completion());
        Ok(())
    }

    /// Tests dependency recounting after statuses are restored.
    ///
    /// # Errors
    /// Returns an error if planning fails.
    #[test]
    fn test_recount_dependencies() -> Result<()> {
        let mut record = planned(diamond())?;
        if let Some(state) = record.nodes.get_mut("a") {
            state.status = NodeStatus::Completed;
        }
        if let Some(state) = record.nodes.get_mut("b") {
            state.status = NodeStatus::Completed;
        }
        record.recount_dependencies();
        assert_eq!(record.node("c")?.remaining_dependencies, 0);
        assert_eq!(record.node("d")?.remaining_dependencies, 1);
        Ok(())
    }

    #[test]
    fn test_unknown_edges_ignored() {
        let plan = ExecutionPlan::new(vec![PlanNode::new("a", "x")]).with_edge("ghost", "a");
        let record = ExecutionRecord::from_parts(
            "exec-1".to_owned(),
            PathBuf::from("/repo"),
            plan,
            0,
            Utc::now(),
        );
        assert_eq!(record.nodes["a"].remaining_dependencies, 0);
        assert_eq!(record.concurrency, 1);
    }

    /// Tests the snapshots keep plan order and queue order.
    ///
    /// # Errors
    /// Returns an error if planning fails.
    #[test]
    fn test_snapshots() -> Result<()> {
        let mut record = planned(diamond())?;
        record.start_node("a")?;

        let poll = record.poll_snapshot();
        let order: Vec<&str> = poll.nodes.iter().map(|node| node.node_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        assert_eq!(poll.running_nodes, vec!["a"]);
        assert!(poll.nodes[0].started_at.is_some());

        let summary = record.execution_snapshot();
        assert_eq!(summary.id, "exec-1");
        assert!(summary.ready_queue.is_empty());
        assert_eq!(record.events_since(record.timeline.len() - 1).len(), 1);
        Ok(())
    }
}
