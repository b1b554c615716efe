//! Test definitions and the registry that owns them.
//!
//! Tests are registered either in code, with a closure receiving a
//! [`TestScope`], or declaratively from YAML suite files (see [`suite`]).
//!
//! ```ignore
//! let mut registry = TestRegistry::new();
//! registry.describe("api", |api| {
//!     api.test("adds a health endpoint", |scope| async move {
//!         scope.agent("Add GET /health returning 200").await?;
//!         scope.store_diff().await?;
//!         scope.run_command("test", "cargo test").await;
//!         scope.to_pass_judge("A /health route exists and is tested", &[]).await?;
//!         Ok(())
//!     })
//!     .tag("smoke");
//! });
//! ```

pub mod suite;

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{EvalError, ValidationError};
use crate::orchestrator::TestScope;
use crate::scoring::Thresholds;

pub use suite::{load_suite, load_suites, SuiteFile, TaskSpec, VerifyCommand, WeightedTask};

/// Separator between suite path segments and the title in a test id.
pub const ID_SEPARATOR: &str = " > ";

/// The body of a test, invoked once per iteration.
pub type TestFn = Arc<dyn Fn(TestScope) -> BoxFuture<'static, Result<(), EvalError>> + Send + Sync>;

/// A registered test.
#[derive(Clone)]
pub struct TestDefinition {
    /// Suite path and title joined with [`ID_SEPARATOR`].
    pub id: String,
    pub title: String,
    pub suite_path: Vec<String>,
    pub tags: BTreeSet<String>,
    /// Falls back to the orchestrator default when `None`.
    pub iterations: Option<u32>,
    /// Falls back to the configured thresholds when `None`.
    pub thresholds: Option<Thresholds>,
    pub body: TestFn,
}

impl TestDefinition {
    pub fn new(title: impl Into<String>, suite_path: Vec<String>, body: TestFn) -> Self {
        let title = title.into();
        let id = test_id(&suite_path, &title);
        Self {
            id,
            title,
            suite_path,
            tags: BTreeSet::new(),
            iterations: None,
            thresholds: None,
            body,
        }
    }

    pub fn tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn iterations(&mut self, iterations: u32) -> &mut Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn thresholds(&mut self, thresholds: Thresholds) -> &mut Self {
        self.thresholds = Some(thresholds);
        self
    }

    /// True when `filter` is empty or shares a tag with this test.
    pub fn matches_tags(&self, filter: &[String]) -> bool {
        filter.is_empty() || filter.iter().any(|t| self.tags.contains(t))
    }
}

impl std::fmt::Debug for TestDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDefinition")
            .field("id", &self.id)
            .field("tags", &self.tags)
            .field("iterations", &self.iterations)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

pub fn test_id(suite_path: &[String], title: &str) -> String {
    suite_path
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(title))
        .collect::<Vec<_>>()
        .join(ID_SEPARATOR)
}

/// Wraps an async closure as a [`TestFn`].
pub fn test_fn<F, Fut>(f: F) -> TestFn
where
    F: Fn(TestScope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), EvalError>> + Send + 'static,
{
    Arc::new(move |scope| Box::pin(f(scope)))
}

/// Explicitly owned collection of tests. Append-only while loading.
#[derive(Default)]
pub struct TestRegistry {
    tests: Vec<TestDefinition>,
    suite_stack: Vec<String>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a test under the current suite path.
    pub fn test<F, Fut>(&mut self, title: impl Into<String>, body: F) -> &mut TestDefinition
    where
        F: Fn(TestScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EvalError>> + Send + 'static,
    {
        self.add(TestDefinition::new(
            title,
            self.suite_stack.clone(),
            test_fn(body),
        ))
    }

    /// Appends a prepared definition as is.
    pub fn add(&mut self, definition: TestDefinition) -> &mut TestDefinition {
        self.tests.push(definition);
        let last = self.tests.len() - 1;
        &mut self.tests[last]
    }

    /// Registers everything `f` adds under the nested suite `name`.
    pub fn describe(&mut self, name: impl Into<String>, f: impl FnOnce(&mut TestRegistry)) {
        self.suite_stack.push(name.into());
        f(self);
        self.suite_stack.pop();
    }

    /// Current suite path, outermost first.
    pub fn suite_path(&self) -> &[String] {
        &self.suite_stack
    }

    /// Removes all tests, e.g. before reloading suite files.
    pub fn clear(&mut self) {
        self.tests.clear();
        self.suite_stack.clear();
    }

    pub fn tests(&self) -> &[TestDefinition] {
        &self.tests
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TestDefinition> {
        self.tests.iter().find(|t| t.id == id)
    }

    /// Tests matching any of `tags` (all tests when `tags` is empty).
    pub fn filter_by_tags(&self, tags: &[String]) -> Vec<&TestDefinition> {
        self.tests.iter().filter(|t| t.matches_tags(tags)).collect()
    }

    /// Rejects duplicate ids and invalid per-test settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for test in &self.tests {
            if !seen.insert(test.id.as_str()) {
                return Err(ValidationError::Config(format!(
                    "duplicate test id '{}'",
                    test.id
                )));
            }
            if test.iterations == Some(0) {
                return Err(ValidationError::Config(format!(
                    "test '{}' must run at least one iteration",
                    test.id
                )));
            }
            if let Some(thresholds) = &test.thresholds {
                thresholds.validate()?;
            }
        }
        Ok(())
    }
}
