//! End-to-end runs of the orchestrator against in-memory browsers and deciders

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use intentest_engine::action::{ActionMetadata, Coordinate};
use intentest_engine::decider::DecisionSession;
use intentest_engine::{
    ActionDecider, ActionExecutor, ActionInput, ActionOutput, EngineConfig, EngineError,
    EngineResult, ExecutorFactory, RunStatus, TestRunner, TokenUsage, Verdict,
};

const BUTTON: Coordinate = Coordinate(40, 80);

#[derive(Default)]
struct PageState {
    url: String,
    fingerprints: HashMap<Coordinate, String>,
    executed: Vec<ActionInput>,
    launched: usize,
    released: usize,
}

/// Browser whose only state is the current URL and a fingerprint table
#[derive(Clone, Default)]
struct FakeBrowser(Arc<Mutex<PageState>>);

impl FakeBrowser {
    fn with_button(fingerprint: &str) -> Self {
        let browser = Self::default();
        browser.set_button(fingerprint);
        browser
    }

    fn set_button(&self, fingerprint: &str) {
        self.0
            .lock()
            .unwrap()
            .fingerprints
            .insert(BUTTON, fingerprint.to_string());
    }

    fn navigations(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .executed
            .iter()
            .filter_map(|a| match a {
                ActionInput::Navigate { url } => Some(url.clone()),
                _ => None,
            })
            .collect()
    }

    fn clicks(&self) -> usize {
        self.0
            .lock()
            .unwrap()
            .executed
            .iter()
            .filter(|a| matches!(a, ActionInput::LeftClick { .. }))
            .count()
    }
}

struct FakeExecutor(FakeBrowser);

#[async_trait]
impl ActionExecutor for FakeExecutor {
    async fn execute(&mut self, input: &ActionInput) -> EngineResult<ActionOutput> {
        let mut page = (self.0).0.lock().unwrap();
        page.executed.push(input.clone());
        if let ActionInput::Navigate { url } = input {
            page.url = url.clone();
        }
        let fingerprint = match input {
            ActionInput::Fingerprint { coordinate } => page.fingerprints.get(coordinate).cloned(),
            _ => None,
        };
        Ok(ActionOutput {
            output: format!("did {}", input.name()),
            metadata: ActionMetadata {
                url: Some(page.url.clone()),
                title: Some("Shop".to_string()),
                fingerprint,
            },
            image: None,
        })
    }

    async fn release(&mut self) -> EngineResult<()> {
        (self.0).0.lock().unwrap().released += 1;
        Ok(())
    }
}

#[async_trait]
impl ExecutorFactory for FakeBrowser {
    async fn acquire(&self) -> EngineResult<Box<dyn ActionExecutor>> {
        self.0.lock().unwrap().launched += 1;
        Ok(Box::new(FakeExecutor(self.clone())))
    }
}

/// Decider that hovers and clicks the button, then reports a verdict
struct ClickDecider {
    calls: Mutex<usize>,
    verdict: Verdict,
}

impl ClickDecider {
    fn passing() -> Self {
        Self {
            calls: Mutex::new(0),
            verdict: Verdict::passed("checkout button works", TokenUsage::new(120, 30)),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ActionDecider for ClickDecider {
    async fn run_action(
        &self,
        prompt: &str,
        session: &mut DecisionSession<'_>,
    ) -> EngineResult<Verdict> {
        *self.calls.lock().unwrap() += 1;
        assert!(prompt.contains("Test: \""));
        session.observe("look at the page").await?;
        session
            .perform("hover checkout", ActionInput::MouseMove { coordinate: BUTTON })
            .await?;
        session
            .perform("click checkout", ActionInput::LeftClick { coordinate: None })
            .await?;
        Ok(self.verdict.clone())
    }
}

fn project(files: &[(&str, &str)]) -> TempDir {
    let tmp = TempDir::new().unwrap();
    for (name, content) in files {
        let path = tmp.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    tmp
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.replay.settle_delay_ms = 0;
    config
}

fn runner(
    root: &Path,
    browser: &FakeBrowser,
    decider: &Arc<ClickDecider>,
    config: EngineConfig,
) -> TestRunner {
    TestRunner::new(config, Arc::new(browser.clone()), decider.clone()).with_root(root)
}

fn cache_entries(root: &Path) -> Vec<String> {
    let dir = root.join(".intentest/cache");
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| n.ends_with(".json"))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

const CHECKOUT: &str = r#"tests:
  - name: user can check out
    expect:
      - the order confirmation is shown
"#;

#[tokio::test]
async fn test_no_matching_files() {
    let tmp = project(&[]);
    let browser = FakeBrowser::default();
    let decider = Arc::new(ClickDecider::passing());
    let mut runner = runner(tmp.path(), &browser, &decider, config());

    let success = runner.execute("missing/**/*.test.yaml", None).await.unwrap();
    assert!(!success);
    assert!(runner
        .report()
        .discovery_error
        .as_deref()
        .unwrap()
        .contains("missing/**/*.test.yaml"));
    assert_eq!(browser.0.lock().unwrap().launched, 0);
}

#[tokio::test]
async fn test_live_run_is_cached_then_replayed() {
    let tmp = project(&[("shop/checkout.test.yaml", CHECKOUT)]);
    let browser = FakeBrowser::with_button("<div><button>Checkout</button></div>");
    let decider = Arc::new(ClickDecider::passing());

    let mut first = runner(tmp.path(), &browser, &decider, config());
    assert!(first.execute("shop", None).await.unwrap());
    assert_eq!(decider.calls(), 1);
    let outcome = &first.report().files[0].tests[0];
    assert!(!outcome.from_cache);
    assert_eq!(outcome.token_usage.total_tokens, 150);
    assert_eq!(cache_entries(tmp.path()).len(), 1);

    let mut second = runner(tmp.path(), &browser, &decider, config());
    assert!(second.execute("shop", None).await.unwrap());
    assert_eq!(decider.calls(), 1);
    let outcome = &second.report().files[0].tests[0];
    assert!(outcome.from_cache);
    assert_eq!(
        outcome.reason.as_deref(),
        Some("checkout button works (replayed from cache)")
    );
    assert_eq!(browser.clicks(), 2);
    // The replayed run is never written back
    assert_eq!(cache_entries(tmp.path()).len(), 1);

    let state = browser.0.lock().unwrap();
    assert_eq!(state.launched, 2);
    assert_eq!(state.released, 2);
}

#[tokio::test]
async fn test_every_spelling_of_a_file_shares_its_cache() {
    let tmp = project(&[("shop/checkout.test.yaml", CHECKOUT)]);
    let browser = FakeBrowser::with_button("<button>Checkout</button>");
    let decider = Arc::new(ClickDecider::passing());

    let mut first = runner(tmp.path(), &browser, &decider, config());
    assert!(first.execute("shop", None).await.unwrap());
    let identifier = first.report().files[0].tests[0].identifier.clone();

    let absolute = tmp.path().join("shop/checkout.test.yaml");
    let absolute_glob = tmp.path().join("shop/*.test.yaml");
    for pattern in [
        "./shop/checkout.test.yaml".to_string(),
        "shop/./checkout.test.yaml".to_string(),
        absolute.display().to_string(),
        absolute_glob.display().to_string(),
    ] {
        let mut again = runner(tmp.path(), &browser, &decider, config());
        assert!(again.execute(&pattern, None).await.unwrap(), "{}", pattern);
        let outcome = &again.report().files[0].tests[0];
        assert_eq!(outcome.identifier, identifier, "{}", pattern);
        assert!(outcome.from_cache, "{}", pattern);
    }

    assert_eq!(decider.calls(), 1);
    assert_eq!(cache_entries(tmp.path()).len(), 1);
}

#[tokio::test]
async fn test_replay_prunes_outdated_entries() {
    let tmp = project(&[("shop/checkout.test.yaml", CHECKOUT)]);
    let browser = FakeBrowser::with_button("<button>Checkout</button>");
    let decider = Arc::new(ClickDecider::passing());

    let mut first = runner(tmp.path(), &browser, &decider, config());
    assert!(first.execute("shop", None).await.unwrap());
    let identifier = first.report().files[0].tests[0].identifier.clone();

    let legacy_id = format!("legacy_{}", identifier);
    let legacy = serde_json::json!({
        "metadata": {
            "timestamp": 1,
            "version": "1",
            "status": "passed",
            "reason": "old schema",
            "tokenUsage": { "promptTokens": 0, "completionTokens": 0, "totalTokens": 0 },
            "runId": legacy_id,
            "executedFromCache": false,
        },
        "test": { "name": "user can check out", "filePath": "shop/checkout.test.yaml" },
        "data": { "steps": [] }
    });
    let legacy_path = tmp
        .path()
        .join(".intentest/cache")
        .join(format!("{}.json", legacy_id));
    std::fs::write(&legacy_path, legacy.to_string()).unwrap();
    assert_eq!(cache_entries(tmp.path()).len(), 2);

    let mut second = runner(tmp.path(), &browser, &decider, config());
    assert!(second.execute("shop", None).await.unwrap());
    assert!(second.report().files[0].tests[0].from_cache);
    assert!(!legacy_path.exists());
    assert_eq!(cache_entries(tmp.path()).len(), 1);
}

#[tokio::test]
async fn test_stale_cache_falls_back_to_live() {
    let tmp = project(&[("shop/checkout.test.yaml", CHECKOUT)]);
    let browser = FakeBrowser::with_button("<div><button>Checkout</button></div>");
    let decider = Arc::new(ClickDecider::passing());

    runner(tmp.path(), &browser, &decider, config())
        .execute("shop", None)
        .await
        .unwrap();

    browser.set_button("<div><button>Buy now</button></div>");
    let mut second = runner(tmp.path(), &browser, &decider, config());
    assert!(second.execute("shop", None).await.unwrap());
    assert_eq!(decider.calls(), 2);
    assert!(!second.report().files[0].tests[0].from_cache);

    // Opened once per file, then once more after the stale replay
    let base = config().base_url;
    assert_eq!(browser.navigations(), vec![base.clone(), base.clone(), base]);

    // Retention keeps only the newest live run
    assert_eq!(cache_entries(tmp.path()).len(), 1);
}

#[tokio::test]
async fn test_disabled_cache_always_runs_live() {
    let tmp = project(&[("shop/checkout.test.yaml", CHECKOUT)]);
    let browser = FakeBrowser::with_button("<button>Checkout</button>");
    let decider = Arc::new(ClickDecider::passing());
    let mut config = config();
    config.cache.enabled = false;

    for _ in 0..2 {
        runner(tmp.path(), &browser, &decider, config.clone())
            .execute("shop", None)
            .await
            .unwrap();
    }
    assert_eq!(decider.calls(), 2);
}

#[tokio::test]
async fn test_after_hook_failure_is_appended_to_reason() {
    let file = r#"after_each:
  - assertions:
      - url_contains: /order/confirmed
tests:
  - name: user can check out
"#;
    let tmp = project(&[("shop/checkout.test.yaml", file)]);
    let browser = FakeBrowser::with_button("<button>Checkout</button>");
    let decider = Arc::new(ClickDecider::passing());

    let mut runner = runner(tmp.path(), &browser, &decider, config());
    assert!(!runner.execute("shop", None).await.unwrap());

    let outcome = &runner.report().files[0].tests[0];
    assert_eq!(outcome.status, RunStatus::Failed);
    let reason = outcome.reason.as_deref().unwrap();
    assert!(reason.starts_with("checkout button works | after hook failed: "));
    assert!(reason.contains("/order/confirmed"));
}

#[tokio::test]
async fn test_direct_tests_skip_the_decider() {
    let file = r#"tests:
  - name: health page loads
    direct: true
    run:
      actions:
        - action: navigate
          url: http://localhost:3000/health
      assertions:
        - url_contains: /health
  - name: status page loads
    direct: true
    run:
      assertions:
        - title_contains: Status
"#;
    let tmp = project(&[("ops/health.test.yaml", file)]);
    let browser = FakeBrowser::default();
    let decider = Arc::new(ClickDecider::passing());

    let mut runner = runner(tmp.path(), &browser, &decider, config());
    assert!(!runner.execute("ops/health.test.yaml", None).await.unwrap());
    assert_eq!(decider.calls(), 0);

    let tests = &runner.report().files[0].tests;
    assert_eq!(tests[0].status, RunStatus::Passed);
    assert_eq!(tests[1].status, RunStatus::Failed);
    assert!(tests[1]
        .reason
        .as_deref()
        .unwrap()
        .contains("expected title to contain 'Status'"));
}

#[tokio::test]
async fn test_line_selects_a_single_test() {
    let file = r#"tests:
  - name: first
    direct: true
    run:
      actions: [{ action: wait, duration_ms: 0 }]
  - name: second
    direct: true
    run:
      actions: [{ action: wait, duration_ms: 0 }]
"#;
    let tmp = project(&[("a.test.yaml", file)]);
    let browser = FakeBrowser::default();
    let decider = Arc::new(ClickDecider::passing());

    let mut runner = runner(tmp.path(), &browser, &decider, config());
    assert!(runner.execute("a.test.yaml", Some(7)).await.unwrap());
    let tests = &runner.report().files[0].tests;
    assert_eq!(tests.len(), 1);
    assert_eq!(tests[0].name, "second");

    let err = runner.execute("a.test.yaml", Some(42)).await.unwrap_err();
    assert!(matches!(err, EngineError::Loader { .. }));
}

#[tokio::test]
async fn test_broken_file_does_not_stop_siblings() {
    let tmp = project(&[
        ("a/broken.test.yaml", "tests: [\n"),
        ("b/checkout.test.yaml", CHECKOUT),
    ]);
    let browser = FakeBrowser::with_button("<button>Checkout</button>");
    let decider = Arc::new(ClickDecider::passing());

    let mut runner = runner(tmp.path(), &browser, &decider, config());
    assert!(!runner.execute("**/*.test.yaml", None).await.unwrap());

    let report = runner.report();
    assert_eq!(report.files.len(), 2);
    assert!(report.files[0].error.is_some());
    assert!(report.files[1].passed());
    assert_eq!(report.passed, 1);
}

#[tokio::test]
async fn test_report_is_written_as_json() {
    let tmp = project(&[("shop/checkout.test.yaml", CHECKOUT)]);
    let browser = FakeBrowser::with_button("<button>Checkout</button>");
    let decider = Arc::new(ClickDecider::passing());

    let mut runner = runner(tmp.path(), &browser, &decider, config());
    runner.execute("shop", None).await.unwrap();

    let path = tmp.path().join("results/report.json");
    runner.write_report(&path).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["passed"], 1);
    assert_eq!(json["files"][0]["tests"][0]["status"], "passed");
}
