//! Test definitions, callbacks and the per-file registration context

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::action::{ActionExecutor, ActionInput, ActionOutput};
use crate::error::{EngineResult, TestError};

/// Derive the stable cache key for a test from its file and name.
pub fn test_identifier(file_path: &Path, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(name.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Inclusive, 1-based line range a test occupies in its source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub start_line: usize,
    pub end_line: usize,
}

impl SourceRange {
    pub fn contains(&self, line: usize) -> bool {
        self.start_line <= line && line <= self.end_line
    }
}

/// What a callback gets to work with while it runs.
pub struct CallbackContext<'a> {
    pub executor: &'a mut dyn ActionExecutor,
    pub test: Option<&'a TestCase>,
    pub base_url: &'a str,
}

/// User code attached to a test, an expectation or a hook.
#[async_trait]
pub trait TestCallback: Send + Sync {
    async fn call(&self, ctx: &mut CallbackContext<'_>) -> Result<(), TestError>;
}

/// Checks evaluated after a scripted callback's actions have run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(default)]
    pub url_contains: Option<String>,
    #[serde(default)]
    pub title_contains: Option<String>,
    #[serde(default)]
    pub output_contains: Option<String>,
}

/// A callback written as a list of actions plus assertions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptedCallback {
    #[serde(default)]
    pub actions: Vec<ActionInput>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

impl ScriptedCallback {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.assertions.is_empty()
    }

    fn check(assertion: &Assertion, page: &ActionOutput, last: &ActionOutput) -> Result<(), TestError> {
        if let Some(expected) = &assertion.url_contains {
            let url = page.metadata.url.as_deref().unwrap_or_default();
            if !url.contains(expected.as_str()) {
                return Err(TestError::AssertionFailed(format!(
                    "expected url to contain '{}', got '{}'",
                    expected, url
                )));
            }
        }
        if let Some(expected) = &assertion.title_contains {
            let title = page.metadata.title.as_deref().unwrap_or_default();
            if !title.contains(expected.as_str()) {
                return Err(TestError::AssertionFailed(format!(
                    "expected title to contain '{}', got '{}'",
                    expected, title
                )));
            }
        }
        if let Some(expected) = &assertion.output_contains {
            if !last.output.contains(expected.as_str()) {
                return Err(TestError::AssertionFailed(format!(
                    "expected output to contain '{}', got '{}'",
                    expected, last.output
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TestCallback for ScriptedCallback {
    async fn call(&self, ctx: &mut CallbackContext<'_>) -> Result<(), TestError> {
        let mut last = ActionOutput::default();
        for action in &self.actions {
            debug!("Callback action: {}", action.name());
            last = ctx
                .executor
                .execute(action)
                .await
                .map_err(|e| TestError::CallbackFailed(format!("{}: {}", action.name(), e)))?;
        }

        if self.assertions.is_empty() {
            return Ok(());
        }

        // Assertions about the page read a fresh observation.
        let page = ctx
            .executor
            .execute(&ActionInput::Screenshot)
            .await
            .map_err(|e| TestError::CallbackFailed(e.to_string()))?;
        for assertion in &self.assertions {
            Self::check(assertion, &page, &last)?;
        }
        Ok(())
    }
}

/// Something the test must observe
#[derive(Clone)]
pub struct Expectation {
    pub description: String,
    pub payload: Option<serde_json::Value>,
    pub callback: Option<Arc<dyn TestCallback>>,
}

impl Expectation {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            payload: None,
            callback: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn TestCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("description", &self.description)
            .field("payload", &self.payload)
            .field("has_callback", &self.has_callback())
            .finish()
    }
}

/// Immutable description of one test
#[derive(Clone)]
pub struct TestCase {
    pub name: String,
    pub file_path: PathBuf,
    pub identifier: String,
    pub payload: Option<serde_json::Value>,
    pub callback: Option<Arc<dyn TestCallback>>,
    /// Run `callback` directly, bypassing cache and decider
    pub direct_execution: bool,
    pub expectations: Vec<Expectation>,
    pub before: Option<Arc<dyn TestCallback>>,
    pub after: Option<Arc<dyn TestCallback>>,
    pub location: Option<SourceRange>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let file_path = file_path.into();
        let identifier = test_identifier(&file_path, &name);
        Self {
            name,
            file_path,
            identifier,
            payload: None,
            callback: None,
            direct_execution: false,
            expectations: Vec::new(),
            before: None,
            after: None,
            location: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn TestCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Mark for direct execution of `callback`
    pub fn direct(mut self) -> Self {
        self.direct_execution = true;
        self
    }

    pub fn with_expectation(mut self, expectation: Expectation) -> Self {
        self.expectations.push(expectation);
        self
    }

    pub fn with_before(mut self, callback: Arc<dyn TestCallback>) -> Self {
        self.before = Some(callback);
        self
    }

    pub fn with_after(mut self, callback: Arc<dyn TestCallback>) -> Self {
        self.after = Some(callback);
        self
    }

    pub fn with_location(mut self, location: SourceRange) -> Self {
        self.location = Some(location);
        self
    }

    pub fn covers_line(&self, line: usize) -> bool {
        self.location.map(|r| r.contains(line)).unwrap_or(false)
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("file_path", &self.file_path)
            .field("identifier", &self.identifier)
            .field("payload", &self.payload)
            .field("direct_execution", &self.direct_execution)
            .field("expectations", &self.expectations)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Hooks registered by a test file
#[derive(Clone, Default)]
pub struct FileHooks {
    pub before_all: Vec<Arc<dyn TestCallback>>,
    pub after_all: Vec<Arc<dyn TestCallback>>,
    pub before_each: Vec<Arc<dyn TestCallback>>,
    pub after_each: Vec<Arc<dyn TestCallback>>,
}

/// Everything registered while loading one test file.
///
/// Created per load and handed back to the caller, so nothing registered by
/// one file is visible while another file runs.
#[derive(Clone, Default)]
pub struct LoadedFile {
    pub path: PathBuf,
    pub cases: Vec<Arc<TestCase>>,
    pub hooks: FileHooks,
}

impl LoadedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn register(&mut self, case: TestCase) {
        self.cases.push(Arc::new(case));
    }

    /// Restrict to tests whose source range contains `line`.
    pub fn narrow_to_line(&mut self, line: usize) -> usize {
        self.cases.retain(|c| c.covers_line(line));
        self.cases.len()
    }
}

/// Compiles or parses a test file into its registration context.
pub trait TestLoader: Send + Sync {
    fn load(&self, path: &Path) -> EngineResult<LoadedFile>;
}
