//! Atomic file replacement.

use forge_core::{ExecutionError, Result};
use std::path::{Path, PathBuf};
use tokio::fs as tfs;
use tracing::debug;
use uuid::Uuid;

/// Write through a temporary file in the target directory, then rename.
///
/// Readers see either the old content or the new content, never a partial
/// write.
///
/// # Errors
/// Returns an error if the directory cannot be created or the file cannot be
/// written or renamed
pub async fn write_atomic(target: &Path, content: &str) -> Result<()> {
    let parent = target.parent().map_or_else(PathBuf::new, Path::to_path_buf);
    if !parent.as_os_str().is_empty() {
        tfs::create_dir_all(&parent).await?;
    }

    let file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            ExecutionError::Other(format!("Invalid target path: {}", target.display()))
        })?;
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    tfs::write(&temp_path, content).await?;
    if let Err(error) = tfs::rename(&temp_path, target).await {
        if let Err(cleanup) = tfs::remove_file(&temp_path).await {
            debug!("Could not remove {}: {cleanup}", temp_path.display());
        }
        return Err(error.into());
    }
    Ok(())
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

    /// Tests that atomic writes replace content and leave no temporary files.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    #[tokio::test]
    async fn test_write_atomic_replaces_content() -> Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("nested/out.txt");
        write_atomic(&target, "first").await?;
        write_atomic(&target, "second").await?;

        assert_eq!(stdfs::read_to_string(&target)?, "second");
        let entries = stdfs::read_dir(dir.path().join("nested"))?.count();
        assert_eq!(entries, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_atomic_rejects_rootless_target() {
        let outcome = write_atomic(Path::new("/"), "content").await;
        assert!(outcome.is_err());
    }
}
