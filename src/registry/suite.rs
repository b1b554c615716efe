//! Declarative test suites loaded from YAML.
//!
//! ```yaml
//! suite: api
//! tests:
//!   - title: adds a health endpoint
//!     prompt: Add GET /health returning 200 with body "ok".
//!     tags: [smoke]
//!     iterations: 2
//!     verify:
//!       - name: build
//!         command: cargo build
//!     criteria: |
//!       A /health route exists and returns 200.
//!     expected_files: [src/health.rs]
//!     tasks:
//!       - name: tests
//!         check: cargo test health
//!         criteria: A test covers the new route.
//!         weight: 2
//!     thresholds: { pass: 0.8, warn: 0.6 }
//! ```
//!
//! Each entry becomes a [`TestDefinition`] whose body runs the agent, captures
//! the diff, runs the `verify` commands in order, then judges either the whole
//! outcome against `criteria` or each weighted task separately.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{test_fn, TestDefinition, TestRegistry};
use crate::error::{ConfigError, ValidationError};
use crate::orchestrator::{JudgeTask, TestScope};
use crate::scoring::Thresholds;

/// A suite file: an optional suite name and its tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteFile {
    /// Outermost suite path segment; tests sit at the top level when absent.
    #[serde(default)]
    pub suite: Option<String>,
    #[serde(default)]
    pub tests: Vec<TaskSpec>,
}

/// A named verification command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyCommand {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A separately judged part of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightedTask {
    pub name: String,
    /// Command run before judging; its output becomes part of the evidence.
    #[serde(default)]
    pub check: Option<String>,
    pub criteria: String,
    /// Defaults to 1.
    #[serde(default)]
    pub weight: Option<f64>,
}

/// One declarative test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub iterations: Option<u32>,
    #[serde(default)]
    pub verify: Vec<VerifyCommand>,
    /// Markdown criteria for the whole outcome. With `tasks`, it is prepended
    /// to each task's criteria as shared context.
    #[serde(default)]
    pub criteria: Option<String>,
    #[serde(default)]
    pub expected_files: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<WeightedTask>,
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
}

impl TaskSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |msg: String| Err(ValidationError::Config(msg));

        if self.title.trim().is_empty() {
            return invalid("test title must not be empty".to_string());
        }
        if self.prompt.trim().is_empty() {
            return invalid(format!("test '{}' has an empty prompt", self.title));
        }
        let has_criteria = self
            .criteria
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        if !has_criteria && self.tasks.is_empty() {
            return invalid(format!(
                "test '{}' needs criteria or at least one task",
                self.title
            ));
        }
        for task in &self.tasks {
            if task.criteria.trim().is_empty() {
                return invalid(format!(
                    "task '{}' in '{}' has empty criteria",
                    task.name, self.title
                ));
            }
            if let Some(weight) = task.weight {
                if !weight.is_finite() || weight <= 0.0 {
                    return Err(ValidationError::InvalidWeight {
                        name: task.name.clone(),
                        weight,
                    });
                }
            }
        }
        if self.iterations == Some(0) {
            return invalid(format!(
                "test '{}' must run at least one iteration",
                self.title
            ));
        }
        if let Some(thresholds) = &self.thresholds {
            thresholds.validate()?;
        }
        Ok(())
    }

    /// Builds the registered definition under `suite_path`.
    pub fn into_definition(self, suite_path: Vec<String>) -> TestDefinition {
        let task = Arc::new(self);
        let shared = Arc::clone(&task);
        let body = test_fn(move |scope| {
            let task = Arc::clone(&shared);
            async move { task.execute(&scope).await }
        });

        let mut definition = TestDefinition::new(task.title.clone(), suite_path, body);
        definition.tags = task.tags.iter().cloned().collect();
        definition.iterations = task.iterations;
        definition.thresholds = task.thresholds;
        definition
    }

    async fn execute(&self, scope: &TestScope) -> Result<(), crate::error::EvalError> {
        scope.agent(&self.prompt).await?;
        scope.store_diff().await?;

        for verify in &self.verify {
            let timeout = verify.timeout_ms.map(Duration::from_millis);
            scope
                .run_command_with_timeout(&verify.name, &verify.command, timeout)
                .await;
        }

        if self.tasks.is_empty() {
            let criteria = self.criteria.as_deref().unwrap_or_default();
            scope.to_pass_judge(criteria, &self.expected_files).await?;
            return Ok(());
        }

        let mut judged = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if let Some(check) = &task.check {
                scope.run_command(&task.name, check).await;
            }
            let criteria = match self.criteria.as_deref().map(str::trim) {
                Some(shared) if !shared.is_empty() => {
                    format!("{shared}\n\n### {}\n\n{}", task.name, task.criteria.trim())
                }
                _ => task.criteria.clone(),
            };
            judged.push(JudgeTask::new(&task.name, criteria).with_weight(task.weight));
        }
        scope.judge_tasks(&judged, &self.expected_files).await?;
        Ok(())
    }
}

fn read_suite(path: &Path) -> Result<SuiteFile, ConfigError> {
    let path_str = path.display().to_string();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path_str.clone(),
        source,
    })?;
    let suite: SuiteFile = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path_str,
        source,
    })?;
    for test in &suite.tests {
        test.validate()?;
    }
    Ok(suite)
}

/// Loads one suite file into `registry`, appending its tests.
///
/// The whole file is validated before anything is registered.
pub fn load_suite(registry: &mut TestRegistry, path: &Path) -> Result<usize, ConfigError> {
    let suite = read_suite(path)?;
    let base: Vec<String> = registry
        .suite_path()
        .iter()
        .cloned()
        .chain(suite.suite.clone())
        .collect();

    let count = suite.tests.len();
    for test in suite.tests {
        registry.add(test.into_definition(base.clone()));
    }
    debug!(path = %path.display(), tests = count, "Loaded suite file");
    Ok(count)
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false)
}

/// YAML files under `dir`, recursively, in path order.
fn collect_suite_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), ConfigError> {
    let entries = fs::read_dir(dir).map_err(|source| ConfigError::Read {
        path: dir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let path = entry
            .map_err(|source| ConfigError::Read {
                path: dir.display().to_string(),
                source,
            })?
            .path();
        if path.is_dir() {
            collect_suite_files(&path, files)?;
        } else if is_yaml(&path) {
            files.push(path);
        }
    }
    Ok(())
}

/// Clears `registry` and loads every given file, or every YAML file beneath
/// each given directory. Returns the number of tests registered.
pub fn load_suites(registry: &mut TestRegistry, paths: &[PathBuf]) -> Result<usize, ConfigError> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found = Vec::new();
            collect_suite_files(path, &mut found)?;
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }

    registry.clear();
    let mut total = 0;
    for file in &files {
        total += load_suite(registry, file)?;
    }
    registry.validate()?;
    info!(files = files.len(), tests = total, "Loaded test suites");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITE: &str = r#"
suite: api
tests:
  - title: adds a health endpoint
    prompt: Add GET /health
    tags: [smoke]
    iterations: 2
    verify:
      - name: build
        command: cargo build
        timeout_ms: 60000
    criteria: A /health route exists.
    expected_files: [src/health.rs]
  - title: documents the endpoint
    prompt: Document /health
    tasks:
      - name: readme
        check: grep -q health README.md
        criteria: README mentions /health.
        weight: 2
      - name: changelog
        criteria: CHANGELOG has an entry.
    thresholds: { pass: 0.8, warn: 0.6 }
"#;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_suite_registers_declarative_tests() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "api.yaml", SUITE);

        let mut registry = TestRegistry::new();
        assert_eq!(load_suite(&mut registry, &path).unwrap(), 2);

        let first = registry.get("api > adds a health endpoint").unwrap();
        assert_eq!(first.iterations, Some(2));
        assert!(first.tags.contains("smoke"));
        assert_eq!(first.suite_path, ["api"]);

        let second = registry.get("api > documents the endpoint").unwrap();
        assert_eq!(second.thresholds, Some(Thresholds { pass: 0.8, warn: 0.6 }));
    }

    #[test]
    fn test_load_suites_clears_and_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b/second.yml", "tests:\n  - {title: two, prompt: p, criteria: c}\n");
        write(dir.path(), "a.yaml", "tests:\n  - {title: one, prompt: p, criteria: c}\n");
        write(dir.path(), "notes.txt", "ignored");

        let mut registry = TestRegistry::new();
        registry.test("stale", |_scope| async { Ok(()) });

        let count = load_suites(&mut registry, &[dir.path().to_path_buf()]).unwrap();
        assert_eq!(count, 2);
        let ids: Vec<&str> = registry.tests().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["one", "two"]);
    }

    #[test]
    fn test_invalid_suites_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = TestRegistry::new();

        let no_criteria = write(dir.path(), "x.yaml", "tests:\n  - {title: t, prompt: p}\n");
        assert!(matches!(
            load_suite(&mut registry, &no_criteria),
            Err(ConfigError::Validation(_))
        ));

        let bad_weight = write(
            dir.path(),
            "y.yaml",
            "tests:\n  - title: t\n    prompt: p\n    tasks:\n      - {name: a, criteria: c, weight: 0}\n",
        );
        assert!(matches!(
            load_suite(&mut registry, &bad_weight),
            Err(ConfigError::Validation(ValidationError::InvalidWeight { .. }))
        ));

        let unknown_field = write(dir.path(), "z.yaml", "tests:\n  - {title: t, prompt: p, criteria: c, extra: 1}\n");
        assert!(matches!(
            load_suite(&mut registry, &unknown_field),
            Err(ConfigError::Parse { .. })
        ));
        assert!(registry.is_empty());
    }
}
