//! Declarative YAML test files
//!
//! ```yaml
//! before_each:
//!   - actions:
//!       - action: navigate
//!         url: /login
//! tests:
//!   - name: user can log in
//!     payload: { email: demo@example.com }
//!     expect:
//!       - the dashboard greets the user
//!       - description: the session cookie survives a reload
//!         check:
//!           actions: [{ action: key, text: F5 }]
//!           assertions: [{ url_contains: /dashboard }]
//!   - name: health endpoint responds
//!     direct: true
//!     run:
//!       actions: [{ action: navigate, url: /health }]
//!       assertions: [{ title_contains: OK }]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::test_case::{
    Expectation, FileHooks, LoadedFile, ScriptedCallback, SourceRange, TestCallback, TestCase,
    TestLoader,
};

/// A whole test file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestFileSpec {
    #[serde(default)]
    pub before_all: Vec<ScriptedCallback>,
    #[serde(default)]
    pub after_all: Vec<ScriptedCallback>,
    #[serde(default)]
    pub before_each: Vec<ScriptedCallback>,
    #[serde(default)]
    pub after_each: Vec<ScriptedCallback>,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

/// One test in a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub name: String,

    #[serde(default)]
    pub payload: Option<serde_json::Value>,

    #[serde(default)]
    pub expect: Vec<ExpectationSpec>,

    /// Run `run` directly instead of asking the decider
    #[serde(default)]
    pub direct: bool,

    #[serde(default)]
    pub run: Option<ScriptedCallback>,

    #[serde(default)]
    pub before: Option<ScriptedCallback>,

    #[serde(default)]
    pub after: Option<ScriptedCallback>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpectationSpec {
    Description(String),
    Detailed {
        description: String,
        #[serde(default)]
        payload: Option<serde_json::Value>,
        #[serde(default)]
        check: Option<ScriptedCallback>,
    },
}

fn callback(script: ScriptedCallback) -> Arc<dyn TestCallback> {
    Arc::new(script)
}

fn callbacks(scripts: Vec<ScriptedCallback>) -> Vec<Arc<dyn TestCallback>> {
    scripts.into_iter().map(callback).collect()
}

impl ExpectationSpec {
    fn into_expectation(self) -> Expectation {
        match self {
            ExpectationSpec::Description(description) => Expectation::new(description),
            ExpectationSpec::Detailed {
                description,
                payload,
                check,
            } => {
                let mut expectation = Expectation::new(description);
                expectation.payload = payload;
                expectation.callback = check.map(callback);
                expectation
            }
        }
    }
}

impl TestSpec {
    fn into_test_case(self, file_path: &Path, location: Option<SourceRange>) -> TestCase {
        let mut case = TestCase::new(self.name, file_path);
        case.payload = self.payload;
        case.direct_execution = self.direct;
        case.callback = self.run.map(callback);
        case.before = self.before.map(callback);
        case.after = self.after.map(callback);
        case.location = location;
        case.expectations = self
            .expect
            .into_iter()
            .map(ExpectationSpec::into_expectation)
            .collect();
        case
    }
}

impl TestFileSpec {
    /// Parse a test file from YAML string
    pub fn from_yaml(yaml: &str) -> EngineResult<Self> {
        serde_yaml::from_str(yaml).map_err(EngineError::from)
    }

    fn validate(&self, path: &Path) -> EngineResult<()> {
        let mut seen = HashSet::new();
        for test in &self.tests {
            if test.name.trim().is_empty() {
                return Err(EngineError::Loader {
                    path: path.to_path_buf(),
                    reason: "test without a name".to_string(),
                });
            }
            if !seen.insert(test.name.as_str()) {
                return Err(EngineError::Loader {
                    path: path.to_path_buf(),
                    reason: format!("duplicate test name '{}'", test.name),
                });
            }
            if test.direct && test.run.is_none() {
                return Err(EngineError::Loader {
                    path: path.to_path_buf(),
                    reason: format!("direct test '{}' has no `run` block", test.name),
                });
            }
        }
        Ok(())
    }

    /// Turn the parsed file into a fresh registration context.
    pub fn into_loaded(self, path: &Path, source: &str) -> EngineResult<LoadedFile> {
        self.validate(path)?;

        let ranges = test_line_ranges(source);
        let ranges = (ranges.len() == self.tests.len()).then_some(ranges);

        let mut loaded = LoadedFile::new(path);
        loaded.hooks = FileHooks {
            before_all: callbacks(self.before_all),
            after_all: callbacks(self.after_all),
            before_each: callbacks(self.before_each),
            after_each: callbacks(self.after_each),
        };
        for (index, test) in self.tests.into_iter().enumerate() {
            let location = ranges.as_ref().map(|r| r[index]);
            loaded.register(test.into_test_case(path, location));
        }
        Ok(loaded)
    }
}

/// Line ranges of the items of the top-level `tests:` sequence.
fn test_line_ranges(source: &str) -> Vec<SourceRange> {
    let lines: Vec<&str> = source.lines().collect();
    let Some(header) = lines
        .iter()
        .position(|l| l.trim_end() == "tests:" && !l.starts_with(char::is_whitespace))
    else {
        return Vec::new();
    };

    let mut starts = Vec::new();
    let mut item_indent = None;
    let mut section_end = lines.len();
    for (i, line) in lines.iter().enumerate().skip(header + 1) {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - trimmed.len();
        if indent == 0 && !trimmed.starts_with('-') {
            section_end = i;
            break;
        }
        if trimmed == "-" || trimmed.starts_with("- ") {
            match item_indent {
                None => {
                    item_indent = Some(indent);
                    starts.push(i);
                }
                Some(expected) if expected == indent => starts.push(i),
                Some(_) => {}
            }
        }
    }

    let mut ranges = Vec::with_capacity(starts.len());
    for (k, &start) in starts.iter().enumerate() {
        let mut end = starts.get(k + 1).copied().unwrap_or(section_end);
        while end > start + 1 {
            let previous = lines[end - 1].trim_start();
            if previous.is_empty() || previous.starts_with('#') {
                end -= 1;
            } else {
                break;
            }
        }
        ranges.push(SourceRange {
            start_line: start + 1,
            end_line: end,
        });
    }
    ranges
}

/// Loads `*.test.yaml` files relative to a project root.
pub struct YamlTestLoader {
    root: PathBuf,
}

impl YamlTestLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TestLoader for YamlTestLoader {
    fn load(&self, path: &Path) -> EngineResult<LoadedFile> {
        let content = std::fs::read_to_string(self.root.join(path))?;
        let spec = TestFileSpec::from_yaml(&content).map_err(|e| EngineError::Loader {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        spec.into_loaded(path, &content)
    }
}
