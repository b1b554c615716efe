//! Shared fixtures for integration tests: scratch git repositories and
//! deterministic judges.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use judge_forge::error::{EnvironmentError, JudgeError};
use judge_forge::environment::{Environment, ExecOptions, ExecOutput};
use judge_forge::judge::{Judge, JudgeRequest, JudgeResult};

pub fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "judge-forge tests")
        .env("GIT_AUTHOR_EMAIL", "tests@example.com")
        .env("GIT_COMMITTER_NAME", "judge-forge tests")
        .env("GIT_COMMITTER_EMAIL", "tests@example.com")
        .status()
        .expect("git is installed");
    assert!(status.success(), "git {:?} failed", args);
}

/// A repository with no commits.
pub fn empty_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-q"]);
    dir
}

/// A repository with one commit containing `README.md`.
pub fn committed_repo() -> tempfile::TempDir {
    let dir = empty_repo();
    std::fs::write(dir.path().join("README.md"), "# demo\n").unwrap();
    git(dir.path(), &["add", "README.md"]);
    git(dir.path(), &["commit", "-q", "-m", "initial"]);
    dir
}

pub fn verdict(pass: bool, score: f64, reason: &str) -> JudgeResult {
    JudgeResult {
        pass,
        score,
        reason: reason.to_string(),
        improvement: String::new(),
    }
}

/// Judge returning queued verdicts in order, repeating the last one.
pub struct FixedJudge {
    verdicts: Mutex<VecDeque<JudgeResult>>,
    last: Mutex<Option<JudgeResult>>,
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl FixedJudge {
    pub fn new(verdicts: Vec<JudgeResult>) -> Arc<Self> {
        Arc::new(Self {
            verdicts: Mutex::new(verdicts.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn passing() -> Arc<Self> {
        Self::new(vec![verdict(true, 0.9, "looks right")])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Judge for FixedJudge {
    fn identity(&self) -> &str {
        "fixed"
    }

    async fn evaluate(&self, request: JudgeRequest) -> Result<JudgeResult, JudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt);
        let next = self.verdicts.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone()
            .ok_or_else(|| JudgeError::InvalidResponse("no verdict queued".to_string()))
    }
}

/// Wraps an environment and counts setup/teardown calls.
pub struct CountingEnvironment<E> {
    pub inner: E,
    pub setups: AtomicUsize,
    pub teardowns: AtomicUsize,
}

impl<E> CountingEnvironment<E> {
    pub fn new(inner: E) -> Arc<Self> {
        Arc::new(Self {
            inner,
            setups: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl<E: Environment> Environment for CountingEnvironment<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn setup(&self, root: &Path) -> Result<(), EnvironmentError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        self.inner.setup(root).await
    }

    async fn execute(&self, command: &str, cwd: &Path, options: ExecOptions) -> ExecOutput {
        self.inner.execute(command, cwd, options).await
    }

    async fn diff(&self, root: &Path) -> Result<String, EnvironmentError> {
        self.inner.diff(root).await
    }

    async fn teardown(&self, root: &Path) -> Result<(), EnvironmentError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.inner.teardown(root).await
    }
}
