//! Test runner that turns a file pattern into an overall pass/fail

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::action::{ActionExecutor, ActionInput, ExecutorFactory};
use crate::cache::CacheStore;
use crate::config::EngineConfig;
use crate::decider::{ActionDecider, DecisionSession, VerdictStatus};
use crate::discovery::{GlobDiscovery, TestDiscovery};
use crate::error::{CacheError, EngineError, EngineResult, TestError};
use crate::prompt;
use crate::replay::CachedReplay;
use crate::spec::YamlTestLoader;
use crate::test_case::{CallbackContext, LoadedFile, TestCallback, TestCase, TestLoader};
use crate::test_run::{RunStatus, TestRun, TokenUsage};

/// Result of running a single test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    pub name: String,
    pub identifier: String,
    pub run_id: String,
    pub status: RunStatus,
    pub reason: Option<String>,
    pub from_cache: bool,
    pub token_usage: TokenUsage,
    pub duration_ms: u64,
}

impl TestOutcome {
    fn from_run(run: &TestRun, duration_ms: u64) -> Self {
        Self {
            name: run.test_case().name.clone(),
            identifier: run.test_case().identifier.clone(),
            run_id: run.run_id().to_string(),
            status: run.status(),
            reason: run.reason().map(String::from),
            from_cache: run.executed_from_cache(),
            token_usage: run.token_usage(),
            duration_ms,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }
}

/// Result of running one test file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResult {
    pub path: PathBuf,
    pub tests: Vec<TestOutcome>,
    /// File-level failure: load error, browser launch, after-all hook
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl FileResult {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            tests: Vec::new(),
            error: None,
            duration_ms: 0,
        }
    }

    fn failed(path: &Path, error: &EngineError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(path)
        }
    }

    pub fn passed(&self) -> bool {
        self.error.is_none() && self.tests.iter().all(TestOutcome::passed)
    }
}

/// Result of one `execute` call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub pattern: String,
    pub line: Option<usize>,
    pub discovery_error: Option<String>,
    pub files: Vec<FileResult>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl RunReport {
    fn new(pattern: &str, line: Option<usize>) -> Self {
        Self {
            pattern: pattern.to_string(),
            line,
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.discovery_error.is_none()
            && !self.files.is_empty()
            && self.files.iter().all(FileResult::passed)
    }

    fn push(&mut self, file: FileResult) {
        self.total += file.tests.len();
        self.passed += file.tests.iter().filter(|t| t.passed()).count();
        self.failed += file.tests.iter().filter(|t| !t.passed()).count();
        self.files.push(file);
    }
}

/// Drives discovery, loading, cached replay and the live decider
pub struct TestRunner {
    config: EngineConfig,
    root: PathBuf,
    browsers: Arc<dyn ExecutorFactory>,
    decider: Arc<dyn ActionDecider>,
    discovery: Arc<dyn TestDiscovery>,
    loader: Arc<dyn TestLoader>,
    replay: CachedReplay,
    report: RunReport,
}

impl TestRunner {
    pub fn new(
        config: EngineConfig,
        browsers: Arc<dyn ExecutorFactory>,
        decider: Arc<dyn ActionDecider>,
    ) -> Self {
        let root = PathBuf::from(".");
        Self {
            discovery: Arc::new(GlobDiscovery::new(&root, config.test_pattern.clone())),
            loader: Arc::new(YamlTestLoader::new(&root)),
            replay: CachedReplay::new(config.replay.settle_delay()),
            config,
            root,
            browsers,
            decider,
            report: RunReport::default(),
        }
    }

    /// Resolve test files and the cache directory against `root`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self.discovery = Arc::new(GlobDiscovery::new(
            &self.root,
            self.config.test_pattern.clone(),
        ));
        self.loader = Arc::new(YamlTestLoader::new(&self.root));
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn TestDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn TestLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(&self.config.cache.dir)
    }

    /// Report of the last `execute` call
    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Run every test matched by `pattern`, optionally only the one at `line`.
    ///
    /// Returns true iff every test in every file passed. Zero matching files
    /// is a failed run, not an error.
    pub async fn execute(&mut self, pattern: &str, line: Option<usize>) -> EngineResult<bool> {
        let start = Instant::now();
        let mut report = RunReport::new(pattern, line);

        let files = match self.discovery.discover(pattern) {
            Ok(files) => files,
            Err(e) if e.is_recoverable() => {
                error!("Test discovery failed: {}", e);
                report.discovery_error = Some(e.to_string());
                self.report = report;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if files.is_empty() {
            let e = EngineError::Discovery(format!("no test files match '{}'", pattern));
            error!("{}", e);
            report.discovery_error = Some(e.to_string());
            self.report = report;
            return Ok(false);
        }

        info!("Running {} test file(s)...", files.len());

        for path in &files {
            let file_start = Instant::now();
            let mut loaded = match self.loader.load(path) {
                Ok(loaded) => loaded,
                Err(e) if e.is_recoverable() => {
                    error!("✗ {} - {}", path.display(), e);
                    report.push(FileResult::failed(path, &e));
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(line) = line {
                if loaded.narrow_to_line(line) == 0 {
                    return Err(EngineError::Loader {
                        path: path.clone(),
                        reason: format!("no test found at line {}", line),
                    });
                }
            }

            let mut result = self.run_file(loaded).await;
            result.duration_ms = file_start.elapsed().as_millis() as u64;
            report.push(result);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!("");
        info!(
            "Test Results: {} passed, {} failed ({} ms)",
            report.passed, report.failed, report.duration_ms
        );

        let success = report.success();
        self.report = report;
        Ok(success)
    }

    /// Write the last report as JSON.
    pub fn write_report(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.report)?;
        std::fs::write(path, json)?;
        info!("Results written to: {}", path.display());
        Ok(())
    }

    async fn run_file(&self, loaded: LoadedFile) -> FileResult {
        debug!("Running {} test(s) from {}", loaded.cases.len(), loaded.path.display());

        let mut executor = match self.browsers.acquire().await {
            Ok(executor) => executor,
            Err(e) => {
                error!("✗ {} - {}", loaded.path.display(), e);
                return FileResult::failed(&loaded.path, &e);
            }
        };

        let result = self.run_cases(&loaded, executor.as_mut()).await;

        if let Err(e) = executor.release().await {
            warn!("Failed to release browser for {}: {}", loaded.path.display(), e);
        }
        result
    }

    async fn run_cases(&self, loaded: &LoadedFile, executor: &mut dyn ActionExecutor) -> FileResult {
        let mut result = FileResult::new(&loaded.path);

        if let Err(e) = executor
            .execute(&ActionInput::Navigate {
                url: self.config.base_url.clone(),
            })
            .await
        {
            warn!("Could not open {}: {}", self.config.base_url, e);
        }

        let mut setup_failure = None;
        for hook in &loaded.hooks.before_all {
            if let Err(e) = self.invoke(hook, executor, None).await {
                setup_failure = Some(format!("before all hook failed: {}", e));
                break;
            }
        }

        for case in &loaded.cases {
            let outcome = match &setup_failure {
                Some(reason) => self.skip_case(case, reason),
                None => self.run_case(case, loaded, executor).await,
            };
            if outcome.passed() {
                let cached = if outcome.from_cache { " [cached]" } else { "" };
                info!("✓ {} ({} ms){}", outcome.name, outcome.duration_ms, cached);
            } else {
                error!(
                    "✗ {} - {}",
                    outcome.name,
                    outcome.reason.as_deref().unwrap_or("unknown error")
                );
            }
            result.tests.push(outcome);
        }

        if setup_failure.is_none() {
            for hook in &loaded.hooks.after_all {
                if let Err(e) = self.invoke(hook, executor, None).await {
                    let message = format!("after all hook failed: {}", e);
                    error!("✗ {} - {}", loaded.path.display(), message);
                    result.error = Some(message);
                    break;
                }
            }
        }
        result
    }

    /// Outcome for a test that never ran because file setup failed
    fn skip_case(&self, case: &Arc<TestCase>, reason: &str) -> TestOutcome {
        let mut run = TestRun::create(case.clone());
        run.mark_failed(reason, None);
        TestOutcome::from_run(&run, 0)
    }

    async fn run_case(
        &self,
        case: &Arc<TestCase>,
        loaded: &LoadedFile,
        executor: &mut dyn ActionExecutor,
    ) -> TestOutcome {
        let start = Instant::now();
        let test = Some(case.as_ref());

        let mut before_failure = None;
        for hook in loaded.hooks.before_each.iter().chain(case.before.iter()) {
            if let Err(e) = self.invoke(hook, executor, test).await {
                before_failure = Some(format!("before hook failed: {}", e));
                break;
            }
        }

        let mut run = TestRun::create(case.clone());
        let mut store = CacheStore::new(self.cache_dir(), case.clone());

        match (run.mark_running(), before_failure) {
            (Err(e), _) => run.mark_failed(e.to_string(), None),
            (Ok(()), Some(reason)) => run.mark_failed(reason, None),
            (Ok(()), None) => {
                if let Err(e) = self.execute_run(&mut run, &mut store, executor).await {
                    run.mark_failed(e.to_string(), None);
                }
            }
        }

        let mut after_failures = Vec::new();
        for hook in case.after.iter().chain(loaded.hooks.after_each.iter()) {
            if let Err(e) = self.invoke(hook, executor, test).await {
                after_failures.push(format!("after hook failed: {}", e));
            }
        }
        if !after_failures.is_empty() {
            let primary = run.reason().unwrap_or_default().to_string();
            let mut parts = vec![primary];
            parts.extend(after_failures);
            let usage = run.token_usage();
            run.mark_failed(parts.join(" | "), Some(usage));
        }

        if let Err(e) = store.save_run(&run).await {
            warn!("Could not cache run {}: {}", run.run_id(), e);
        }
        if let Err(e) = store.apply_retention_policy().await {
            warn!("Cache retention failed for '{}': {}", case.name, e);
        }

        TestOutcome::from_run(&run, start.elapsed().as_millis() as u64)
    }

    /// Direct, cached or live execution of a running test.
    async fn execute_run(
        &self,
        run: &mut TestRun,
        store: &mut CacheStore,
        executor: &mut dyn ActionExecutor,
    ) -> EngineResult<()> {
        let case = run.test_case().clone();
        if case.direct_execution {
            return self.execute_direct(run, &case, executor).await;
        }

        if self.config.cache.enabled {
            match self.replay.execute(run, store, executor).await {
                Ok(()) => return self.verify(run, &case, executor).await,
                Err(EngineError::Cache(CacheError::NotFound { .. })) => {
                    debug!("No cached run for '{}'", case.name);
                }
                Err(EngineError::Cache(CacheError::Invalid { reason })) => {
                    warn!(
                        "Cached run for '{}' is stale ({}), running live",
                        case.name, reason
                    );
                    executor
                        .execute(&ActionInput::Navigate {
                            url: self.config.base_url.clone(),
                        })
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }

        self.execute_live(run, store, &case, executor).await
    }

    async fn execute_direct(
        &self,
        run: &mut TestRun,
        case: &TestCase,
        executor: &mut dyn ActionExecutor,
    ) -> EngineResult<()> {
        let Some(callback) = &case.callback else {
            run.mark_failed("direct test has no callback", None);
            return Ok(());
        };
        match self.invoke(callback, executor, Some(case)).await {
            Ok(()) => run.mark_passed("callback completed", None),
            Err(e) => {
                run.mark_failed(e.to_string(), None);
                Ok(())
            }
        }
    }

    async fn execute_live(
        &self,
        run: &mut TestRun,
        store: &CacheStore,
        case: &TestCase,
        executor: &mut dyn ActionExecutor,
    ) -> EngineResult<()> {
        let observation = executor.execute(&ActionInput::Screenshot).await?;
        let prompt = prompt::compose(case, &observation, &self.config.base_url);

        let verdict = {
            let mut session = DecisionSession::new(&mut *executor, &mut *run, Some(store));
            self.decider.run_action(&prompt, &mut session).await?
        };

        match verdict.status {
            VerdictStatus::Passed => {
                run.mark_passed(verdict.reason, Some(verdict.token_usage))?;
                self.verify(run, case, executor).await
            }
            VerdictStatus::Failed => {
                run.mark_failed(verdict.reason, Some(verdict.token_usage));
                Ok(())
            }
        }
    }

    /// Run the test's own and its expectations' callbacks after a pass.
    async fn verify(
        &self,
        run: &mut TestRun,
        case: &TestCase,
        executor: &mut dyn ActionExecutor,
    ) -> EngineResult<()> {
        let callbacks = case
            .callback
            .iter()
            .chain(case.expectations.iter().filter_map(|e| e.callback.as_ref()));
        for callback in callbacks {
            if let Err(e) = self.invoke(callback, executor, Some(case)).await {
                let usage = run.token_usage();
                run.mark_failed(e.to_string(), Some(usage));
                break;
            }
        }
        Ok(())
    }

    async fn invoke(
        &self,
        callback: &Arc<dyn TestCallback>,
        executor: &mut dyn ActionExecutor,
        test: Option<&TestCase>,
    ) -> Result<(), TestError> {
        let mut ctx = CallbackContext {
            executor,
            test,
            base_url: &self.config.base_url,
        };
        callback.call(&mut ctx).await
    }
}
