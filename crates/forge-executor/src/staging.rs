//! Per-node staging workspaces.
//!
//! A staging workspace is a private copy of the repository tree keyed by
//! `(execution, node)`. The node writes only inside it; its changes are later
//! collected and merged back by [`crate::merger::ExecutionMerger`].

use crate::matcher::ResourceMatcher;
use async_trait::async_trait;
use forge_core::config::DEFAULT_STATE_DIR;
use forge_core::{ExecutionError, ForgeConfig, Result};
use std::collections::BTreeMap;
use std::fs as stdfs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs as tfs;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Staged file contents keyed by repository-relative path.
pub type StagedChanges = BTreeMap<String, String>;

/// Creates, diffs and removes staging workspaces.
#[async_trait]
pub trait StagingManager: Send + Sync {
    /// Location of the workspace for a node.
    fn staging_path(&self, repo_root: &Path, execution_id: &str, node_id: &str) -> PathBuf;

    /// Copy the repository tree into a fresh workspace and return its path.
    ///
    /// # Errors
    /// Returns an error if the tree cannot be copied
    async fn create_staging(
        &self,
        repo_root: &Path,
        execution_id: &str,
        node_id: &str,
    ) -> Result<PathBuf>;

    /// Files under `claims` whose staged content differs from the repository.
    ///
    /// # Errors
    /// Returns an error if the workspace cannot be walked
    async fn collect_changes(
        &self,
        repo_root: &Path,
        staging_dir: &Path,
        claims: &[String],
    ) -> Result<StagedChanges>;

    /// Remove a node's workspace and prune the empty staging directory.
    ///
    /// # Errors
    /// Returns an error if the workspace exists but cannot be removed
    async fn clean_staging(&self, repo_root: &Path, execution_id: &str, node_id: &str)
    -> Result<()>;
}

/// Staging workspaces as plain directories under
/// `<repo>/<state_dir>/exec/<execution>/staging/<node>`.
#[derive(Debug, Clone)]
pub struct DirectoryStaging {
    state_dir: PathBuf,
    excluded: Vec<String>,
}

impl Default for DirectoryStaging {
    fn default() -> Self {
        Self::from_config(&ForgeConfig::default())
    }
}

impl DirectoryStaging {
    /// Build from the workspace and staging sections of a config.
    ///
    /// The top-level component of the state directory is always excluded.
    pub fn from_config(config: &ForgeConfig) -> Self {
        let state_dir = config.workspace.state_dir.clone();
        let mut excluded = config.staging.excluded.clone();
        let state_root = state_dir
            .components()
            .next()
            .and_then(|component| component.as_os_str().to_str())
            .unwrap_or(DEFAULT_STATE_DIR)
            .to_owned();
        if !excluded.contains(&state_root) {
            excluded.push(state_root);
        }
        Self {
            state_dir,
            excluded,
        }
    }

    fn staging_root(&self, repo_root: &Path, execution_id: &str) -> PathBuf {
        repo_root
            .join(&self.state_dir)
            .join("exec")
            .join(execution_id)
            .join("staging")
    }

    fn copy_tree(source: &Path, target: &Path, excluded: &[String]) -> Result<usize> {
        stdfs::create_dir_all(target)?;
        let mut copied = 0usize;

        let walker = WalkDir::new(source)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() != 1
                    || entry
                        .file_name()
                        .to_str()
                        .is_none_or(|name| !excluded.iter().any(|skip| skip == name))
            });

        for entry in walker {
            let entry = entry.map_err(|error| {
                ExecutionError::Staging(format!("Failed to walk {}: {error}", source.display()))
            })?;
            let Ok(relative) = entry.path().strip_prefix(source) else {
                continue;
            };
            if relative.as_os_str().is_empty() {
                continue;
            }
            let destination = target.join(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                stdfs::create_dir_all(&destination)?;
            } else if file_type.is_file() || (file_type.is_symlink() && entry.path().is_file()) {
                if let Some(parent) = destination.parent() {
                    stdfs::create_dir_all(parent)?;
                }
                stdfs::copy(entry.path(), &destination)?;
                copied += 1;
            }
        }

        Ok(copied)
    }

    fn diff_tree(repo_root: &Path, staging_dir: &Path, claims: &[String]) -> StagedChanges {
        let mut changes = StagedChanges::new();

        for entry in WalkDir::new(staging_dir).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    warn!("Skipping unreadable staged entry: {error}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = entry
                .path()
                .strip_prefix(staging_dir)
                .ok()
                .and_then(Path::to_str)
                .map(|relative| relative.replace('\\', "/"))
            else {
                continue;
            };
            if !claims
                .iter()
                .any(|claim| ResourceMatcher::claim_covers(claim, &relative))
            {
                continue;
            }

            let staged = match stdfs::read_to_string(entry.path()) {
                Ok(content) => content,
                Err(error) => {
                    warn!("Skipping staged file {relative}: {error}");
                    continue;
                }
            };
            match stdfs::read_to_string(repo_root.join(&relative)) {
                Ok(original) if original == staged => {}
                Ok(_) => {
                    changes.insert(relative, staged);
                }
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    changes.insert(relative, staged);
                }
                Err(error) => {
                    warn!("Cannot compare {relative} with the repository copy: {error}");
                    changes.insert(relative, staged);
                }
            }
        }

        changes
    }
}

#[async_trait]
impl StagingManager for DirectoryStaging {
    fn staging_path(&self, repo_root: &Path, execution_id: &str, node_id: &str) -> PathBuf {
        self.staging_root(repo_root, execution_id).join(node_id)
    }

    async fn create_staging(
        &self,
        repo_root: &Path,
        execution_id: &str,
        node_id: &str,
    ) -> Result<PathBuf> {
        if !is_safe_component(node_id) {
            return Err(ExecutionError::Staging(format!(
                "Node id {node_id} cannot be used as a directory name"
            )));
        }

        let staging_path = self.staging_path(repo_root, execution_id, node_id);
        if tfs::try_exists(&staging_path).await? {
            tfs::remove_dir_all(&staging_path).await?;
        }

        let source = repo_root.to_path_buf();
        let target = staging_path.clone();
        let excluded = self.excluded.clone();
        let copied = spawn_blocking(move || Self::copy_tree(&source, &target, &excluded))
            .await
            .map_err(|error| ExecutionError::Staging(format!("Staging copy panicked: {error}")))??;

        debug!(
            "Created staging for {execution_id}/{node_id} at {} ({copied} files)",
            staging_path.display()
        );
        Ok(staging_path)
    }

    async fn collect_changes(
        &self,
        repo_root: &Path,
        staging_dir: &Path,
        claims: &[String],
    ) -> Result<StagedChanges> {
        if claims.is_empty() {
            return Ok(StagedChanges::new());
        }

        let root = repo_root.to_path_buf();
        let staged = staging_dir.to_path_buf();
        let claim_list = claims.to_vec();
        let changes = spawn_blocking(move || Self::diff_tree(&root, &staged, &claim_list))
            .await
            .map_err(|error| ExecutionError::Staging(format!("Staging diff panicked: {error}")))?;

        debug!(
            "Collected {} changed files from {}",
            changes.len(),
            staging_dir.display()
        );
        Ok(changes)
    }

    async fn clean_staging(
        &self,
        repo_root: &Path,
        execution_id: &str,
        node_id: &str,
    ) -> Result<()> {
        let staging_path = self.staging_path(repo_root, execution_id, node_id);
        match tfs::remove_dir_all(&staging_path).await {
            Ok(()) => debug!("Removed staging {}", staging_path.display()),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        let staging_root = self.staging_root(repo_root, execution_id);
        if let Ok(mut entries) = tfs::read_dir(&staging_root).await
            && matches!(entries.next_entry().await, Ok(None))
            && let Err(error) = tfs::remove_dir(&staging_root).await
        {
            debug!("Could not prune {}: {error}", staging_root.display());
        }
        Ok(())
    }
}

/// Whether `name` is a single normal path component.
fn is_safe_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
