//! Deadlock detection for stalled scheduling attempts.

use crate::matcher::ResourceMatcher;
use forge_core::LockTable;
use petgraph::algo;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// What one blocked node waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDependency {
    /// Blocked node
    pub node: String,
    /// Claims of the node that someone else holds
    pub waiting_for: Vec<String>,
    /// Other nodes holding those claims, sorted
    pub held_by: Vec<String>,
}

/// Diagnosis attached to an `execution.deadlock` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlockReport {
    /// Ready nodes that cannot start, in queue order
    pub blocked_nodes: Vec<String>,
    /// Per-node wait analysis
    pub lock_dependencies: Vec<LockDependency>,
    /// A wait-for cycle among the blocked nodes, if one exists
    pub cycle: Option<Vec<String>>,
}

/// Decides whether a stalled execution can still make progress.
///
/// A stall is only a deadlock when nothing is running: a running node may
/// still release the resources the ready nodes are waiting on.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlockDetector;

impl DeadlockDetector {
    /// Report a deadlock when `running` is empty and `ready_queue` is not.
    pub fn detect(
        ready_queue: &[String],
        running: &[String],
        claims: &HashMap<String, Vec<String>>,
        lock_state: &LockTable,
    ) -> Option<DeadlockReport> {
        if !running.is_empty() || ready_queue.is_empty() {
            return None;
        }

        let lock_dependencies = Self::analyze_dependencies(ready_queue, claims, lock_state);
        let cycle = Self::find_cycle(&lock_dependencies);

        Some(DeadlockReport {
            blocked_nodes: ready_queue.to_vec(),
            lock_dependencies,
            cycle,
        })
    }

    /// Cheaper check: nothing runs and every ready node has all of its claims
    /// held by someone else.
    pub fn is_deadlock_likely(
        ready_queue: &[String],
        running: &[String],
        claims: &HashMap<String, Vec<String>>,
        lock_state: &LockTable,
    ) -> bool {
        if !running.is_empty() || ready_queue.is_empty() {
            return false;
        }

        ready_queue.iter().all(|node_id| {
            let node_claims = claims.get(node_id).map_or(&[][..], Vec::as_slice);
            !node_claims.is_empty()
                && node_claims
                    .iter()
                    .all(|claim| !Self::holders(node_id, claim, lock_state).is_empty())
        })
    }

    fn analyze_dependencies(
        ready_queue: &[String],
        claims: &HashMap<String, Vec<String>>,
        lock_state: &LockTable,
    ) -> Vec<LockDependency> {
        ready_queue
            .iter()
            .map(|node_id| {
                let mut waiting_for = Vec::new();
                let mut held_by = BTreeSet::new();
                for claim in claims.get(node_id).into_iter().flatten() {
                    let holders = Self::holders(node_id, claim, lock_state);
                    if !holders.is_empty() {
                        waiting_for.push(claim.clone());
                        held_by.extend(holders);
                    }
                }
                LockDependency {
                    node: node_id.clone(),
                    waiting_for,
                    held_by: held_by.into_iter().collect(),
                }
            })
            .collect()
    }

    /// Owners other than `node_id` of any held resource overlapping `claim`.
    fn holders(node_id: &str, claim: &str, lock_state: &LockTable) -> BTreeSet<String> {
        lock_state
            .iter()
            .filter(|(resource, _)| ResourceMatcher::overlaps(resource, claim))
            .flat_map(|(_, snapshot)| snapshot.owners.iter())
            .filter(|owner| owner.as_str() != node_id)
            .cloned()
            .collect()
    }

    /// Find a cycle in the wait-for graph (`node -> holder`).
    fn find_cycle(dependencies: &[LockDependency]) -> Option<Vec<String>> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();

        for dependency in dependencies {
            let from = *indices
                .entry(dependency.node.as_str())
                .or_insert_with(|| graph.add_node(dependency.node.clone()));
            for holder in &dependency.held_by {
                let to = *indices
                    .entry(holder.as_str())
                    .or_insert_with(|| graph.add_node(holder.clone()));
                graph.add_edge(from, to, ());
            }
        }

        let component = algo::tarjan_scc(&graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .min_by_key(|component| component.iter().map(|index| index.index()).min())?;

        let start = component.iter().copied().min_by_key(|index| index.index())?;
        let members: BTreeSet<NodeIndex> = component.iter().copied().collect();
        let next = graph
            .neighbors(start)
            .filter(|neighbor| members.contains(neighbor))
            .min_by_key(|neighbor| neighbor.index())?;

        let (_, path) = algo::astar(
            &graph,
            next,
            |finish| finish == start,
            |_| 1usize,
            |_| 0usize,
        )?;

        let mut cycle = vec![graph[start].clone()];
        cycle.extend(
            path.iter()
                .filter(|index| **index != start)
                .map(|index| graph[*index].clone()),
        );
        Some(cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::{LockMode, LockSnapshot};

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    fn held(entries: &[(&str, LockMode, &[&str])]) -> LockTable {
        entries
            .iter()
            .map(|(resource, mode, owners)| {
                (
                    (*resource).to_owned(),
                    LockSnapshot {
                        mode: *mode,
                        owners: ids(owners),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_no_deadlock_while_something_runs() {
        let claims = HashMap::from([("b".to_owned(), ids(&["file.ts"]))]);
        let locks = held(&[("file.ts", LockMode::Write, &["a"])]);

        let report = DeadlockDetector::detect(&ids(&["b"]), &ids(&["a"]), &claims, &locks);
        assert!(report.is_none());
        assert!(!DeadlockDetector::is_deadlock_likely(
            &ids(&["b"]),
            &ids(&["a"]),
            &claims,
            &locks
        ));
    }

    #[test]
    fn test_no_deadlock_with_empty_queue() {
        let report = DeadlockDetector::detect(&[], &[], &HashMap::new(), &LockTable::new());
        assert!(report.is_none());
    }

    #[test]
    fn test_blocked_nodes_reported() {
        let claims = HashMap::from([
            ("b".to_owned(), ids(&["src/file.ts", "docs/readme.md"])),
            ("c".to_owned(), ids(&["src/**"])),
        ]);
        let locks = held(&[("src/file.ts", LockMode::Write, &["external"])]);

        let report = DeadlockDetector::detect(&ids(&["b", "c"]), &[], &claims, &locks);
        let Some(report) = report else {
            panic!("expected a deadlock report");
        };

        assert_eq!(report.blocked_nodes, ids(&["b", "c"]));
        assert_eq!(report.lock_dependencies[0].waiting_for, ids(&["src/file.ts"]));
        assert_eq!(report.lock_dependencies[0].held_by, ids(&["external"]));
        assert_eq!(report.lock_dependencies[1].waiting_for, ids(&["src/**"]));
        assert!(report.cycle.is_none());
    }

    #[test]
    fn test_cycle_found() {
        let claims = HashMap::from([
            ("a".to_owned(), ids(&["b.ts"])),
            ("b".to_owned(), ids(&["a.ts"])),
        ]);
        let locks = held(&[
            ("a.ts", LockMode::Write, &["a"]),
            ("b.ts", LockMode::Write, &["b"]),
        ]);

        let report = DeadlockDetector::detect(&ids(&["a", "b"]), &[], &claims, &locks);
        let Some(report) = report else {
            panic!("expected a deadlock report");
        };
        assert_eq!(report.cycle, Some(ids(&["a", "b"])));
    }

    #[test]
    fn test_deadlock_likely_heuristic() {
        let claims = HashMap::from([
            ("a".to_owned(), ids(&["x.ts"])),
            ("b".to_owned(), ids(&["y.ts"])),
        ]);
        let locks = held(&[("x.ts", LockMode::Write, &["other"])]);

        assert!(!DeadlockDetector::is_deadlock_likely(
            &ids(&["a", "b"]),
            &[],
            &claims,
            &locks
        ));

        let both = held(&[
            ("x.ts", LockMode::Write, &["other"]),
            ("y.ts", LockMode::Read, &["other"]),
        ]);
        assert!(DeadlockDetector::is_deadlock_likely(
            &ids(&["a", "b"]),
            &[],
            &claims,
            &both
        ));

        let unclaimed = HashMap::from([("a".to_owned(), Vec::new())]);
        assert!(!DeadlockDetector::is_deadlock_likely(
            &ids(&["a"]),
            &[],
            &unclaimed,
            &both
        ));
    }
}
