//! Local git-checkout environment.
//!
//! Two isolation modes:
//! - [`IsolationMode::Clean`]: every setup hard-resets the checkout and
//!   removes untracked files, so each iteration starts from the last commit.
//! - [`IsolationMode::PreserveUncommitted`]: setup snapshots the user's
//!   uncommitted work as a patch; teardown resets and re-applies it. The
//!   restore is best-effort: a patch that no longer applies is logged and
//!   dropped. Git writes the patch straight to a file, so it round-trips
//!   byte for byte whatever the encoding of the changed files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{git, run_shell, shell_quote, Environment, ExecOptions, ExecOutput};
use crate::error::EnvironmentError;

/// How the local environment treats pre-existing changes in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Discard everything not committed before each iteration.
    #[default]
    Clean,
    /// Keep the user's uncommitted work and restore it after each iteration.
    PreserveUncommitted,
}

/// Environment running commands directly on the host inside a git checkout.
pub struct LocalEnvironment {
    mode: IsolationMode,
    /// Saved patch files, keyed by workspace root.
    snapshots: Mutex<HashMap<PathBuf, NamedTempFile>>,
}

impl LocalEnvironment {
    pub fn new(mode: IsolationMode) -> Self {
        Self {
            mode,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Clean-isolation environment.
    pub fn clean() -> Self {
        Self::new(IsolationMode::Clean)
    }

    /// Snapshot-and-restore environment.
    pub fn preserving() -> Self {
        Self::new(IsolationMode::PreserveUncommitted)
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    async fn snapshot(&self, root: &Path) -> Result<(), EnvironmentError> {
        let file = tempfile::Builder::new()
            .prefix("judge-forge-snapshot-")
            .suffix(".patch")
            .tempfile()
            .map_err(|e| EnvironmentError::Setup(format!("Failed to create patch file: {e}")))?;
        let target = shell_quote(&file.path().to_string_lossy());

        // Intent-to-add makes untracked files show up in the patch.
        let command = if git::has_head(self, root).await {
            format!(
                "git add --all --intent-to-add && git diff HEAD --binary --no-color --no-ext-diff > {target}"
            )
        } else {
            format!("git add --all && git diff --cached --binary --no-color --no-ext-diff > {target}")
        };
        let out = self
            .execute(&command, root, ExecOptions::with_timeout(git::GIT_TIMEOUT))
            .await;
        if !out.is_success() {
            return Err(EnvironmentError::Setup(format!(
                "Failed to snapshot uncommitted changes: {}",
                out.stderr.trim()
            )));
        }

        let bytes = file.as_file().metadata().map(|m| m.len()).unwrap_or(0);
        debug!(root = %root.display(), bytes, "Saved uncommitted work");
        self.snapshots
            .lock()
            .map_err(|_| EnvironmentError::Setup("snapshot store poisoned".to_string()))?
            .insert(root.to_path_buf(), file);
        Ok(())
    }

    async fn restore(&self, root: &Path, patch: NamedTempFile) {
        match patch.as_file().metadata() {
            Ok(meta) if meta.len() == 0 => return,
            Ok(_) => {}
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Saved patch is unreadable; uncommitted work was not restored");
                return;
            }
        }

        let command = format!(
            "git apply --binary --whitespace=nowarn {}",
            shell_quote(&patch.path().to_string_lossy())
        );
        let out = self
            .execute(&command, root, ExecOptions::with_timeout(git::GIT_TIMEOUT))
            .await;
        if out.is_success() {
            info!(root = %root.display(), "Restored uncommitted work");
        } else {
            warn!(
                root = %root.display(),
                stderr = %out.stderr.trim(),
                "Saved patch no longer applies; uncommitted work was not restored"
            );
        }
    }
}

impl Default for LocalEnvironment {
    fn default() -> Self {
        Self::clean()
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn name(&self) -> &str {
        "local"
    }

    async fn setup(&self, root: &Path) -> Result<(), EnvironmentError> {
        if !root.is_dir() {
            return Err(EnvironmentError::Setup(format!(
                "Workspace {} does not exist",
                root.display()
            )));
        }
        git::ensure_repository(self, root).await?;

        match self.mode {
            IsolationMode::Clean => {
                git::reset_and_clean(self, root).await?;
                debug!(root = %root.display(), "Workspace reset to last commit");
            }
            IsolationMode::PreserveUncommitted => self.snapshot(root).await?,
        }
        Ok(())
    }

    async fn execute(&self, command: &str, cwd: &Path, options: ExecOptions) -> ExecOutput {
        run_shell(command, cwd, &options).await
    }

    async fn diff(&self, root: &Path) -> Result<String, EnvironmentError> {
        git::collect_diff(self, root).await
    }

    async fn teardown(&self, root: &Path) -> Result<(), EnvironmentError> {
        if self.mode == IsolationMode::Clean {
            return Ok(());
        }

        git::reset_and_clean(self, root)
            .await
            .map_err(|e| EnvironmentError::Teardown(e.to_string()))?;

        let patch = self
            .snapshots
            .lock()
            .map_err(|_| EnvironmentError::Teardown("snapshot store poisoned".to_string()))?
            .remove(root);
        if let Some(patch) = patch {
            self.restore(root, patch).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_is_clean() {
        assert_eq!(LocalEnvironment::default().mode(), IsolationMode::Clean);
        assert_eq!(
            LocalEnvironment::preserving().mode(),
            IsolationMode::PreserveUncommitted
        );
    }

    #[test]
    fn test_isolation_mode_serde() {
        let mode: IsolationMode = serde_yaml::from_str("preserve_uncommitted").unwrap();
        assert_eq!(mode, IsolationMode::PreserveUncommitted);
    }

    #[tokio::test]
    async fn test_setup_rejects_non_repository() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalEnvironment::clean();
        let err = env.setup(dir.path()).await.unwrap_err();
        assert!(matches!(err, EnvironmentError::NotAGitRepository(_)));
    }
}
