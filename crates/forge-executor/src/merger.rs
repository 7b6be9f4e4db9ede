//! Reconciles staged node output back into the repository.
//!
//! Merging is whole-file and all-or-nothing per call: a path written with two
//! different contents is a conflict, and any conflict means nothing is written.

use crate::atomic::write_atomic;
use crate::staging::StagingManager;
use forge_core::{ExecutionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash as _, Hasher as _};
use std::path::{Component, Path};
use tokio::fs as tfs;
use tracing::{debug, info, warn};

/// A completed node whose staging workspace should be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedNode {
    /// Node id
    pub node_id: String,
    /// Claims restricting which staged files are considered
    pub resource_claims: Vec<String>,
}

/// One node's content for a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Node that produced the content
    pub node_id: String,
    /// Full file content
    pub content: String,
    /// Hash of `content`
    pub content_hash: u64,
}

/// Changes grouped by repository-relative path.
pub type ChangeSet = BTreeMap<String, Vec<FileChange>>;

/// Outcome of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    /// Whether the changes were written
    pub success: bool,
    /// Paths with diverging content, sorted
    pub conflicts: Vec<String>,
    /// Paths written to the repository, sorted
    pub merged_files: Vec<String>,
}

/// Merges staging workspaces of completed nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionMerger;

impl ExecutionMerger {
    /// Collect every node's changes and write them back if none conflict.
    ///
    /// Nodes without a staging workspace are skipped.
    ///
    /// # Errors
    /// Returns an error if a workspace cannot be read or a file cannot be written
    pub async fn merge(
        repo_root: &Path,
        execution_id: &str,
        nodes: &[StagedNode],
        staging: &dyn StagingManager,
    ) -> Result<MergeResult> {
        let mut changes = ChangeSet::new();

        for node in nodes {
            let staging_dir = staging.staging_path(repo_root, execution_id, &node.node_id);
            if !tfs::try_exists(&staging_dir).await? {
                debug!("No staging for {execution_id}/{}, skipping", node.node_id);
                continue;
            }

            let node_changes = staging
                .collect_changes(repo_root, &staging_dir, &node.resource_claims)
                .await?;
            for (path, content) in node_changes {
                changes.entry(path).or_default().push(FileChange {
                    node_id: node.node_id.clone(),
                    content_hash: hash_content(&content),
                    content,
                });
            }
        }

        let conflicts = Self::detect_conflicts(&changes);
        if !conflicts.is_empty() {
            warn!(
                "Merge of {execution_id} found {} conflicting files: {}",
                conflicts.len(),
                conflicts.join(", ")
            );
            return Ok(MergeResult {
                success: false,
                conflicts,
                merged_files: Vec::new(),
            });
        }

        for path in changes.keys() {
            if !is_safe_relative(Path::new(path)) {
                return Err(ExecutionError::Staging(format!(
                    "Unsafe relative path in staged changes: {path}"
                )));
            }
        }

        let mut merged_files = Vec::with_capacity(changes.len());
        for (path, file_changes) in &changes {
            let Some(first) = file_changes.first() else {
                continue;
            };
            write_atomic(&repo_root.join(path), &first.content).await?;
            merged_files.push(path.clone());
        }

        info!("Merged {} files for {execution_id}", merged_files.len());
        Ok(MergeResult {
            success: true,
            conflicts: Vec::new(),
            merged_files,
        })
    }

    /// Paths where two or more distinct contents were produced, sorted.
    pub fn detect_conflicts(changes: &ChangeSet) -> Vec<String> {
        changes
            .iter()
            .filter(|(_, file_changes)| {
                file_changes
                    .iter()
                    .map(|change| change.content_hash)
                    .collect::<BTreeSet<_>>()
                    .len()
                    > 1
            })
            .map(|(path, _)| path.clone())
            .collect()
    }
}

/// Hash of a file's content.
pub fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::default();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Relative paths without `..` or root components.
fn is_safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::DirectoryStaging;
    use std::fs as stdfs;
    use tempfile::TempDir;

    fn change(node_id: &str, content: &str) -> FileChange {
        FileChange {
            node_id: node_id.to_owned(),
            content: content.to_owned(),
            content_hash: hash_content(content),
        }
    }

    fn staged(node_id: &str, claims: &[&str]) -> StagedNode {
        StagedNode {
            node_id: node_id.to_owned(),
            resource_claims: claims.iter().map(|claim| (*claim).to_owned()).collect(),
        }
    }

    #[test]
    fn test_identical_content_is_not_a_conflict() {
        let mut changes = ChangeSet::new();
        changes.insert(
            "same.ts".to_owned(),
            vec![change("a", "shared"), change("b", "shared")],
        );
        changes.insert(
            "diff.ts".to_owned(),
            vec![change("a", "one"), change("b", "two")],
        );
        changes.insert("solo.ts".to_owned(), vec![change("a", "only")]);

        assert_eq!(ExecutionMerger::detect_conflicts(&changes), vec!["diff.ts"]);
    }

    /// Tests that convergent writes merge and divergent writes block the batch.
    ///
    /// # Errors
    /// Returns an error if the fixture, staging or merge fails.
    #[tokio::test]
    async fn test_merge_all_or_nothing() -> Result<()> {
        let repo = TempDir::new()?;
        stdfs::write(repo.path().join("file.ts"), "original")?;
        stdfs::write(repo.path().join("other.ts"), "other")?;
        let staging = DirectoryStaging::default();

        let path_a = staging.create_staging(repo.path(), "exec-1", "a").await?;
        let path_b = staging.create_staging(repo.path(), "exec-1", "b").await?;
        stdfs::write(path_a.join("file.ts"), "from a")?;
        stdfs::write(path_b.join("file.ts"), "from b")?;
        stdfs::write(path_a.join("other.ts"), "other changed")?;

        let nodes = vec![staged("a", &["*.ts"]), staged("b", &["*.ts"])];
        let result = ExecutionMerger::merge(repo.path(), "exec-1", &nodes, &staging).await?;
        assert!(!result.success);
        assert_eq!(result.conflicts, vec!["file.ts"]);
        assert!(result.merged_files.is_empty());
        assert_eq!(stdfs::read_to_string(repo.path().join("file.ts"))?, "original");
        assert_eq!(stdfs::read_to_string(repo.path().join("other.ts"))?, "other");

        stdfs::write(path_b.join("file.ts"), "from a")?;
        let merged = ExecutionMerger::merge(repo.path(), "exec-1", &nodes, &staging).await?;
        assert!(merged.success);
        assert_eq!(merged.merged_files, vec!["file.ts", "other.ts"]);
        assert_eq!(stdfs::read_to_string(repo.path().join("file.ts"))?, "from a");
        assert_eq!(
            stdfs::read_to_string(repo.path().join("other.ts"))?,
            "other changed"
        );
        Ok(())
    }

    /// Tests that nodes without staging are skipped and new files are created.
    ///
    /// # Errors
    /// Returns an error if the fixture, staging or merge fails.
    #[tokio::test]
    async fn test_merge_creates_files_and_skips_unstaged_nodes() -> Result<()> {
        let repo = TempDir::new()?;
        let staging = DirectoryStaging::default();
        let path = staging.create_staging(repo.path(), "exec-1", "writer").await?;
        stdfs::create_dir_all(path.join("src/new"))?;
        stdfs::write(path.join("src/new/mod.ts"), "export {}")?;

        let nodes = vec![staged("writer", &["src"]), staged("ghost", &["src"])];
        let result = ExecutionMerger::merge(repo.path(), "exec-1", &nodes, &staging).await?;
        assert!(result.success);
        assert_eq!(result.merged_files, vec!["src/new/mod.ts"]);
        assert_eq!(
            stdfs::read_to_string(repo.path().join("src/new/mod.ts"))?,
            "export {}"
        );
        Ok(())
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        assert!(is_safe_relative(Path::new("src/a.ts")));
        assert!(!is_safe_relative(Path::new("../a.ts")));
        assert!(!is_safe_relative(Path::new("/etc/passwd")));
        assert!(!is_safe_relative(Path::new("")));
    }
}
