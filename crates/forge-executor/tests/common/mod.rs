//! Common test utilities for forge-executor integration tests
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::missing_errors_doc,
        clippy::tests_outside_test_module,
        clippy::assertions_on_result_states,
        reason = "Test allows"
    )
)]

use forge_core::{ExecutionPlan, ForgeConfig, LockMode, PlanNode};
use std::env;
use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests (idempotent).
/// Honors `RUST_LOG` if set, otherwise defaults to "debug".
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_owned());
        if fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_test_writer()
            .try_init()
            .is_err()
        {
            // tracing already initialized in this process
        }
    });
}

/// Config that keeps everything in memory
pub fn memory_config() -> ForgeConfig {
    let mut config = ForgeConfig::default();
    config.persistence.enabled = false;
    config
}

/// Node claiming `claims` in `mode`
pub fn node(node_id: &str, mode: LockMode, claims: &[&str]) -> PlanNode {
    PlanNode::new(node_id, format!("droid-{node_id}"))
        .with_claims(claims.iter().copied())
        .with_mode(mode)
}

/// `count` independent writers, each claiming its own file
pub fn independent_plan(count: usize, concurrency: usize) -> ExecutionPlan {
    let nodes = (0..count)
        .map(|index| {
            let file = format!("file-{index}.ts");
            node(&format!("node-{index}"), LockMode::Write, &[file.as_str()])
        })
        .collect();
    ExecutionPlan::new(nodes).with_concurrency(concurrency)
}
