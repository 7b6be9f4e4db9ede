//! Configuration types for scheduling, workspace layout, staging and persistence.

use crate::error::{ExecutionError, Result};
use crate::types::LockMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the namespaced state directory inside a repository.
pub const DEFAULT_STATE_DIR: &str = ".droidforge";

/// File name of the per-repository configuration.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Complete execution core configuration.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Workspace layout configuration
    pub workspace: WorkspaceConfig,
    /// Staging configuration
    pub staging: StagingConfig,
    /// Persistence configuration
    pub persistence: PersistenceConfig,
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrency cap for plans that do not set one
    pub default_concurrency: usize,
    /// Lock mode for nodes that do not set one
    pub default_mode: LockMode,
    /// Also persist on start, pause, resume, abort and deadlock
    pub persist_on_transition: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 2,
            default_mode: LockMode::Write,
            persist_on_transition: true,
        }
    }
}

/// Workspace layout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// State directory, relative to the repository root
    pub state_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

/// Staging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Create a staging workspace when a node starts
    pub enabled: bool,
    /// Top-level entries never copied into staging
    pub excluded: Vec<String>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            excluded: vec![".git".to_owned(), DEFAULT_STATE_DIR.to_owned()],
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Write execution state to disk
    pub enabled: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ForgeConfig {
    /// Path of the configuration file for a repository
    /// (`<repo>/.droidforge/config.toml`).
    pub fn config_path(repo_root: &Path) -> PathBuf {
        repo_root.join(DEFAULT_STATE_DIR).join(CONFIG_FILE_NAME)
    }

    /// Load the configuration of a repository, falling back to defaults when
    /// the file does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed
    pub fn load_for_repo(repo_root: &Path) -> Result<Self> {
        let config_path = Self::config_path(repo_root);
        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            debug!("No config at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load config from a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!(
            "Loaded config from {:?}: concurrency={}, mode={}, staging={}, persistence={}",
            path,
            config.scheduler.default_concurrency,
            config.scheduler.default_mode,
            config.staging.enabled,
            config.persistence.enabled
        );

        Ok(config)
    }

    /// Save config to a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;

        let header = "# Droidforge Execution Configuration\n\
                      # Missing keys take their default values\n\n";

        fs::write(path, format!("{header}{contents}"))?;
        Ok(())
    }

    /// Check values that deserialize but make no sense.
    ///
    /// # Errors
    /// Returns an error if the state directory is empty or absolute
    pub fn validate(&self) -> Result<()> {
        let state_dir = &self.workspace.state_dir;
        if state_dir.as_os_str().is_empty() || state_dir.is_absolute() {
            return Err(ExecutionError::Config(format!(
                "workspace.state_dir must be a relative path, got {}",
                state_dir.display()
            )));
        }
        Ok(())
    }

    /// Directory holding all executions of a repository (`<repo>/<state_dir>/exec`).
    pub fn executions_dir(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.workspace.state_dir).join("exec")
    }

    /// Directory of one execution (`<repo>/<state_dir>/exec/<id>`).
    pub fn execution_dir(&self, repo_root: &Path, execution_id: &str) -> PathBuf {
        self.executions_dir(repo_root).join(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ForgeConfig::default();
        assert_eq!(config.scheduler.default_concurrency, 2);
        assert_eq!(config.scheduler.default_mode, LockMode::Write);
        assert!(config.persistence.enabled);
        assert!(!config.staging.enabled);
        assert_eq!(config.staging.excluded, vec![".git", ".droidforge"]);
    }

    /// Tests that a partial file keeps defaults for missing keys.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written or parsed.
    #[test]
    fn test_partial_config_from_toml() -> Result<()> {
        let tmp_dir = TempDir::new()?;
        let path = ForgeConfig::config_path(tmp_dir.path());
        fs::create_dir_all(tmp_dir.path().join(DEFAULT_STATE_DIR))?;
        fs::write(
            &path,
            r#"
[scheduler]
default_concurrency = 4
default_mode = "read"

[staging]
enabled = true
"#,
        )?;

        let config = ForgeConfig::load_for_repo(tmp_dir.path())?;
        assert_eq!(config.scheduler.default_concurrency, 4);
        assert_eq!(config.scheduler.default_mode, LockMode::Read);
        assert!(config.scheduler.persist_on_transition);
        assert!(config.staging.enabled);
        assert_eq!(config.staging.excluded, vec![".git", ".droidforge"]);
        assert_eq!(config.workspace.state_dir, PathBuf::from(".droidforge"));
        Ok(())
    }

    /// Tests that a missing file yields defaults.
    ///
    /// # Errors
    /// Returns an error if the temporary directory cannot be created.
    #[test]
    fn test_missing_config_uses_defaults() -> Result<()> {
        let tmp_dir = TempDir::new()?;
        let config = ForgeConfig::load_for_repo(tmp_dir.path())?;
        assert_eq!(config, ForgeConfig::default());
        Ok(())
    }

    /// Tests saving and loading back a modified config.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written or parsed.
    #[test]
    fn test_save_and_load() -> Result<()> {
        let tmp_dir = TempDir::new()?;
        let path = tmp_dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = ForgeConfig::default();
        config.scheduler.default_concurrency = 8;
        config.persistence.enabled = false;
        config.save_to_file(&path)?;

        let contents = fs::read_to_string(&path)?;
        assert!(contents.starts_with("# Droidforge Execution Configuration"));

        let loaded = ForgeConfig::load_from_file(&path)?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[test]
    fn test_invalid_state_dir_rejected() {
        let mut config = ForgeConfig::default();
        config.workspace.state_dir = PathBuf::new();
        assert!(matches!(config.validate(), Err(ExecutionError::Config(_))));
    }

    #[test]
    fn test_execution_dir_layout() {
        let config = ForgeConfig::default();
        let dir = config.execution_dir(Path::new("/repo"), "exec-1");
        assert_eq!(dir, PathBuf::from("/repo/.droidforge/exec/exec-1"));
    }
}
