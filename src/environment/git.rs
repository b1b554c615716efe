//! Git commands shared by the local and container environments.
//!
//! The commands are plain shell strings so they run unchanged on the host or
//! inside a container through [`Environment::execute`].

use std::path::Path;
use std::time::Duration;

use super::{shell_quote, Environment, ExecOptions, ExecOutput};
use crate::error::EnvironmentError;

/// Timeout for individual git plumbing commands.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(60);

pub const CHECK_REPO: &str = "git rev-parse --git-dir";
pub const HAS_HEAD: &str = "git rev-parse --verify -q HEAD";
pub const RESET_HARD: &str = "git reset --hard -q HEAD";
pub const EMPTY_INDEX: &str = "git read-tree --empty";
pub const CLEAN: &str = "git clean -fdq";
pub const DIFF_STAGED: &str = "git diff --cached --no-color --no-ext-diff";
pub const DIFF_UNSTAGED: &str = "git diff --no-color --no-ext-diff";
pub const LIST_UNTRACKED: &str = "git ls-files --others --exclude-standard -z";

fn git_options() -> ExecOptions {
    ExecOptions::with_timeout(GIT_TIMEOUT)
}

async fn run<E: Environment + ?Sized>(env: &E, root: &Path, command: &str) -> ExecOutput {
    env.execute(command, root, git_options()).await
}

/// Fails with [`EnvironmentError::NotAGitRepository`] unless `root` is inside a work tree.
pub async fn ensure_repository<E: Environment + ?Sized>(
    env: &E,
    root: &Path,
) -> Result<(), EnvironmentError> {
    let out = run(env, root, CHECK_REPO).await;
    if out.is_success() {
        Ok(())
    } else {
        Err(EnvironmentError::NotAGitRepository(root.to_path_buf()))
    }
}

/// Whether the repository has at least one commit.
pub async fn has_head<E: Environment + ?Sized>(env: &E, root: &Path) -> bool {
    run(env, root, HAS_HEAD).await.is_success()
}

/// Resets tracked files to the last commit and removes untracked files.
///
/// On an unborn branch there is no commit to reset to, so the index is emptied
/// instead and the clean removes everything that is not ignored.
pub async fn reset_and_clean<E: Environment + ?Sized>(
    env: &E,
    root: &Path,
) -> Result<(), EnvironmentError> {
    let reset = if has_head(env, root).await {
        RESET_HARD
    } else {
        EMPTY_INDEX
    };
    for command in [reset, CLEAN] {
        let out = run(env, root, command).await;
        if !out.is_success() {
            return Err(EnvironmentError::Setup(format!(
                "`{}` failed in {}: {}",
                command,
                root.display(),
                out.stderr.trim()
            )));
        }
    }
    Ok(())
}

/// Collects the full diff of the work tree.
///
/// Output is the staged diff, then the unstaged diff, then one added-file
/// diff per untracked file in path order. Identical trees give identical text.
pub async fn collect_diff<E: Environment + ?Sized>(
    env: &E,
    root: &Path,
) -> Result<String, EnvironmentError> {
    let mut diff = String::new();

    for command in [DIFF_STAGED, DIFF_UNSTAGED] {
        let out = run(env, root, command).await;
        if !out.is_success() {
            return Err(EnvironmentError::Diff(format!(
                "`{}` failed: {}",
                command,
                out.stderr.trim()
            )));
        }
        diff.push_str(&out.stdout);
    }

    let listing = run(env, root, LIST_UNTRACKED).await;
    if !listing.is_success() {
        return Err(EnvironmentError::Diff(format!(
            "Listing untracked files failed: {}",
            listing.stderr.trim()
        )));
    }
    let mut untracked: Vec<&str> = listing
        .stdout
        .split('\0')
        .filter(|p| !p.is_empty())
        .collect();
    untracked.sort_unstable();

    for path in untracked {
        let command = format!(
            "git diff --no-color --no-ext-diff --no-index -- /dev/null {}",
            shell_quote(path)
        );
        let out = run(env, root, &command).await;
        // --no-index exits 1 when the files differ, which is the expected case.
        if out.exit_code > 1 {
            return Err(EnvironmentError::Diff(format!(
                "Diffing untracked file {} failed: {}",
                path,
                out.stderr.trim()
            )));
        }
        diff.push_str(&out.stdout);
    }

    Ok(diff)
}
