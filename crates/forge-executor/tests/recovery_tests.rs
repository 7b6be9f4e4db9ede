//! Persistence, crash recovery and merge scenarios.
#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::tests_outside_test_module,
        clippy::assertions_on_result_states,
        reason = "Test allows"
    )
)]

mod common;

use common::{init_tracing, memory_config, node};
use forge_core::{
    ExecutionPlan, ExecutionStatus, ForgeConfig, LockMode, NodeSnapshot, NodeStatus,
    TimelineEventKind,
};
use forge_executor::{ExecutionManager, ExecutionPersistence};
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

fn status_of(nodes: &[NodeSnapshot], node_id: &str) -> Option<NodeStatus> {
    nodes
        .iter()
        .find(|snapshot| snapshot.node_id == node_id)
        .map(|snapshot| snapshot.status)
}

#[tokio::test]
async fn test_recovery_after_restart_is_paused() {
    init_tracing();
    let repo = TempDir::new().unwrap();
    let plan = ExecutionPlan::new(vec![
        node("a", LockMode::Write, &["a.ts"]),
        node("b", LockMode::Write, &["b.ts"]),
        node("c", LockMode::Write, &["c.ts"]),
    ])
    .with_edge("a", "b");

    let execution_id = {
        let manager = ExecutionManager::new(ForgeConfig::default());
        let execution_id = manager.plan(repo.path(), plan).await.unwrap();
        manager.start(&execution_id).await.unwrap();

        let first = manager.request_next(&execution_id).await.unwrap();
        assert_eq!(first.map(|schedule| schedule.node_id).as_deref(), Some("a"));
        manager.complete_node(&execution_id, "a", None).await.unwrap();

        let second = manager.request_next(&execution_id).await.unwrap();
        assert_eq!(second.map(|schedule| schedule.node_id).as_deref(), Some("c"));
        manager.shutdown().await;
        execution_id
    };

    let restarted = ExecutionManager::new(ForgeConfig::default());
    let recovered = restarted.recover_all(repo.path()).await.unwrap();
    assert_eq!(recovered, vec![execution_id.clone()]);

    let snapshot = restarted.poll(&execution_id).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Paused);
    assert_eq!(status_of(&snapshot.nodes, "a"), Some(NodeStatus::Completed));
    assert_eq!(status_of(&snapshot.nodes, "c"), Some(NodeStatus::Running));
    assert_eq!(snapshot.ready_queue, vec!["b"]);
    assert_eq!(
        snapshot.timeline.last().map(|event| event.event),
        Some(TimelineEventKind::ExecutionRecovered)
    );

    let locks = restarted.lock_manager(&execution_id).await.unwrap();
    assert_eq!(locks.owners("c.ts"), vec!["c"]);
    assert!(restarted.request_next(&execution_id).await.unwrap().is_none());

    restarted.resume(&execution_id).await.unwrap();
    let next = restarted.request_next(&execution_id).await.unwrap();
    assert_eq!(next.map(|schedule| schedule.node_id).as_deref(), Some("b"));
    restarted.complete_node(&execution_id, "b", None).await.unwrap();
    restarted.complete_node(&execution_id, "c", None).await.unwrap();

    let finished = restarted.poll(&execution_id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    restarted.shutdown().await;

    let persistence = ExecutionPersistence::default();
    let on_disk = persistence
        .load(repo.path(), &execution_id)
        .await
        .unwrap()
        .expect("persisted state");
    assert_eq!(on_disk.status, ExecutionStatus::Completed);
    assert!(restarted.recover_all(repo.path()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recovery_leaves_live_executions_alone() {
    init_tracing();
    let repo = TempDir::new().unwrap();
    let manager = ExecutionManager::new(ForgeConfig::default());
    let plan = ExecutionPlan::new(vec![node("a", LockMode::Write, &["a.ts"])]);
    manager
        .plan_with_id(repo.path(), plan, "exec-1")
        .await
        .unwrap();
    manager.start("exec-1").await.unwrap();
    manager.shutdown().await;

    let persistence = ExecutionPersistence::default();
    let before = persistence
        .load(repo.path(), "exec-1")
        .await
        .unwrap()
        .expect("persisted state");
    assert_eq!(before.status, ExecutionStatus::Running);

    assert!(manager.recover_all(repo.path()).await.unwrap().is_empty());

    let live = manager.poll("exec-1").await.unwrap();
    assert_eq!(live.status, ExecutionStatus::Running);
    let on_disk = persistence
        .load(repo.path(), "exec-1")
        .await
        .unwrap()
        .expect("persisted state");
    assert_eq!(on_disk.status, live.status);
    assert!(
        on_disk
            .timeline
            .iter()
            .all(|event| event.event != TimelineEventKind::ExecutionRecovered)
    );
}

#[tokio::test]
async fn test_state_file_written_on_completion() {
    init_tracing();
    let repo = TempDir::new().unwrap();
    let mut config = ForgeConfig::default();
    config.scheduler.persist_on_transition = false;
    let manager = ExecutionManager::new(config);

    let plan = ExecutionPlan::new(vec![node("a", LockMode::Write, &["a.ts"])]);
    manager
        .plan_with_id(repo.path(), plan, "exec-1")
        .await
        .unwrap();
    manager.start("exec-1").await.unwrap();
    manager.request_next("exec-1").await.unwrap();

    let state_path = repo.path().join(".droidforge/exec/exec-1/state.json");
    assert!(!state_path.exists());

    manager.complete_node("exec-1", "a", None).await.unwrap();
    let contents = fs::read_to_string(&state_path).unwrap();
    let state: Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(state["status"], "completed");
    assert_eq!(state["nodes"][0]["nodeId"], "a");
    assert_eq!(state["nodes"][0]["status"], "completed");
}

#[tokio::test]
async fn test_merge_convergent_and_divergent_writes() {
    init_tracing();
    let repo = TempDir::new().unwrap();
    fs::write(repo.path().join("file.ts"), "original").unwrap();
    let mut config = memory_config();
    config.staging.enabled = true;
    let manager = ExecutionManager::new(config);

    let plan = ExecutionPlan::new(vec![
        node("a", LockMode::Write, &["file.ts"]),
        node("b", LockMode::Write, &["file.ts"]),
    ]);

    let divergent = manager.plan(repo.path(), plan.clone()).await.unwrap();
    manager.start(&divergent).await.unwrap();
    for content in ["from a", "from b"] {
        let schedule = manager
            .request_next(&divergent)
            .await
            .unwrap()
            .expect("next node");
        let staging = schedule.staging_path.expect("staging path");
        fs::write(staging.join("file.ts"), content).unwrap();
        manager
            .complete_node(&divergent, &schedule.node_id, None)
            .await
            .unwrap();
    }

    let conflicted = manager.merge(&divergent).await.unwrap();
    assert!(!conflicted.success);
    assert_eq!(conflicted.conflicts, vec!["file.ts"]);
    assert_eq!(
        fs::read_to_string(repo.path().join("file.ts")).unwrap(),
        "original"
    );
    let snapshot = manager.poll(&divergent).await.unwrap();
    assert_eq!(
        snapshot.timeline.last().map(|event| event.event),
        Some(TimelineEventKind::ExecutionMergeConflict)
    );

    let convergent = manager.plan(repo.path(), plan).await.unwrap();
    manager.start(&convergent).await.unwrap();
    let mut staging_dirs = Vec::new();
    for _ in 0..2 {
        let schedule = manager
            .request_next(&convergent)
            .await
            .unwrap()
            .expect("next node");
        let staging = schedule.staging_path.expect("staging path");
        fs::write(staging.join("file.ts"), "shared").unwrap();
        manager
            .complete_node(&convergent, &schedule.node_id, None)
            .await
            .unwrap();
        staging_dirs.push(staging);
    }

    let merged = manager.merge(&convergent).await.unwrap();
    assert!(merged.success);
    assert_eq!(merged.merged_files, vec!["file.ts"]);
    assert_eq!(
        fs::read_to_string(repo.path().join("file.ts")).unwrap(),
        "shared"
    );
    assert!(staging_dirs.iter().all(|dir| !dir.exists()));
}

#[tokio::test]
async fn test_merge_refused_for_planned_execution() {
    init_tracing();
    let repo = TempDir::new().unwrap();
    let manager = ExecutionManager::new(memory_config());
    let execution_id = manager
        .plan(repo.path(), ExecutionPlan::default())
        .await
        .unwrap();
    assert!(manager.merge(&execution_id).await.is_err());
}

#[tokio::test]
async fn test_config_loaded_from_repository() {
    init_tracing();
    let repo = TempDir::new().unwrap();
    let mut config = ForgeConfig::default();
    config.scheduler.default_concurrency = 1;
    config.persistence.enabled = false;
    config
        .save_to_file(&ForgeConfig::config_path(repo.path()))
        .unwrap();

    let manager = ExecutionManager::for_repo(repo.path()).unwrap();
    assert_eq!(manager.config().scheduler.default_concurrency, 1);

    let plan = ExecutionPlan::new(vec![
        node("a", LockMode::Write, &["a.ts"]),
        node("b", LockMode::Write, &["b.ts"]),
    ]);
    let execution_id = manager.plan(repo.path(), plan).await.unwrap();
    manager.start(&execution_id).await.unwrap();
    assert!(manager.request_next(&execution_id).await.unwrap().is_some());
    assert!(manager.request_next(&execution_id).await.unwrap().is_none());
    assert!(!repo.path().join(".droidforge/exec").exists());
}
