//! Playwright browser automation
//!
//! Each browser context is a long-lived Node.js process running a small
//! bridge script. The engine writes one JSON request per line to its stdin
//! and reads one JSON response per line from its stdout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tracing::{debug, info, warn};

use crate::action::{ActionExecutor, ActionInput, ActionOutput, ExecutorFactory};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub base_url: String,
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub node_binary: PathBuf,
    pub action_timeout: Duration,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl PlaywrightConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            browser: config.browser.browser,
            headless: config.browser.headless,
            viewport_width: config.browser.viewport_width,
            viewport_height: config.browser.viewport_height,
            node_binary: config.browser.node_binary.clone(),
            action_timeout: Duration::from_secs(config.browser.action_timeout_secs),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LaunchOptions<'a> {
    browser: &'a str,
    headless: bool,
    width: u32,
    height: u32,
    base_url: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    Execute { input: &'a ActionInput },
    Close,
}

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    id: u64,
    #[serde(flatten)]
    command: BridgeCommand<'a>,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Option<ActionOutput>,
    #[serde(default)]
    error: Option<String>,
}

/// One browser context driven through the Node.js bridge
pub struct PlaywrightExecutor {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    timeout: Duration,
    closed: bool,
    // Holds the bridge script for the lifetime of the process
    _workdir: tempfile::TempDir,
}

impl PlaywrightExecutor {
    /// Start the bridge and wait until the browser is up.
    pub async fn launch(config: &PlaywrightConfig) -> EngineResult<Self> {
        let workdir = tempfile::tempdir()?;
        let script_path = workdir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_SCRIPT)?;

        let options = serde_json::to_string(&LaunchOptions {
            browser: config.browser.as_str(),
            headless: config.headless,
            width: config.viewport_width,
            height: config.viewport_height,
            base_url: &config.base_url,
        })?;

        debug!(
            "Starting Playwright bridge: {} {}",
            config.node_binary.display(),
            script_path.display()
        );
        let mut child = TokioCommand::new(&config.node_binary)
            .arg(&script_path)
            .arg(options)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Playwright(format!(
                    "failed to start {}: {}",
                    config.node_binary.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Playwright("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Playwright("bridge stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[playwright] {}", line);
                }
            });
        }

        let mut executor = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
            timeout: config.action_timeout,
            closed: false,
            _workdir: workdir,
        };

        let startup = config.action_timeout.max(Duration::from_secs(30));
        tokio::time::timeout(startup, executor.wait_ready())
            .await
            .map_err(|_| EngineError::Timeout("Playwright bridge startup".to_string()))??;

        info!(
            "Browser ready ({}, headless: {})",
            config.browser.as_str(),
            config.headless
        );
        Ok(executor)
    }

    async fn next_response(&mut self) -> EngineResult<BridgeResponse> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Err(EngineError::Playwright(
                    "bridge exited unexpectedly".to_string(),
                ));
            };
            match serde_json::from_str::<BridgeResponse>(&line) {
                Ok(response) => return Ok(response),
                Err(_) => debug!("[playwright] {}", line),
            }
        }
    }

    async fn wait_ready(&mut self) -> EngineResult<()> {
        loop {
            let response = self.next_response().await?;
            if response.ready {
                return Ok(());
            }
            if let Some(error) = response.error {
                return Err(EngineError::Playwright(error));
            }
        }
    }

    async fn request(
        &mut self,
        command: BridgeCommand<'_>,
        limit: Duration,
    ) -> EngineResult<Option<ActionOutput>> {
        let id = self.next_id;
        self.next_id += 1;

        let mut line = serde_json::to_string(&BridgeRequest { id, command })?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let response = tokio::time::timeout(limit, async {
            loop {
                let response = self.next_response().await?;
                if response.id == Some(id) {
                    return Ok::<_, EngineError>(response);
                }
            }
        })
        .await
        .map_err(|_| EngineError::Timeout(format!("browser request {}", id)))??;

        if response.ok {
            Ok(response.result)
        } else {
            Err(EngineError::Executor(
                response
                    .error
                    .unwrap_or_else(|| "unknown browser error".to_string()),
            ))
        }
    }
}

#[async_trait]
impl ActionExecutor for PlaywrightExecutor {
    async fn execute(&mut self, input: &ActionInput) -> EngineResult<ActionOutput> {
        if self.closed {
            return Err(EngineError::Playwright("browser already closed".to_string()));
        }
        let limit = match input {
            ActionInput::Wait { duration_ms } => self.timeout + Duration::from_millis(*duration_ms),
            _ => self.timeout,
        };
        debug!("Executing action: {}", input.name());
        let output = self
            .request(BridgeCommand::Execute { input }, limit)
            .await?;
        Ok(output.unwrap_or_default())
    }

    async fn release(&mut self) -> EngineResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let timeout = self.timeout;
        if let Err(e) = self.request(BridgeCommand::Close, timeout).await {
            warn!("Browser did not close cleanly: {}", e);
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("Playwright bridge exited: {}", status);
            }
            Err(_) => {
                warn!("Playwright bridge still running, killing it");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Launches one Playwright browser per acquire
pub struct PlaywrightFactory {
    config: PlaywrightConfig,
}

impl PlaywrightFactory {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ExecutorFactory for PlaywrightFactory {
    async fn acquire(&self) -> EngineResult<Box<dyn ActionExecutor>> {
        let executor = PlaywrightExecutor::launch(&self.config).await?;
        Ok(Box::new(executor))
    }
}

const BRIDGE_SCRIPT: &str = r#"
const readline = require('readline');
const playwright = require(require.resolve('playwright', { paths: [process.cwd(), __dirname] }));

const options = JSON.parse(process.argv[2]);
const send = (message) => process.stdout.write(JSON.stringify(message) + '\n');

const KEPT_ATTRIBUTES = ['type', 'name', 'placeholder', 'aria-label', 'role', 'title', 'alt', 'd'];

function fingerprint([x, y, kept]) {
  const hit = document.elementFromPoint(x, y);
  if (!hit) return null;

  let deepest = hit;
  let maxDepth = 0;
  const visit = (node, depth) => {
    if (depth > maxDepth) {
      deepest = node;
      maxDepth = depth;
    }
    for (const child of node.children) visit(child, depth + 1);
  };
  visit(hit, 0);

  let root = deepest;
  for (let i = 0; i < 2 && root.parentElement; i++) root = root.parentElement;

  const clone = root.cloneNode(true);
  const strip = (node) => {
    for (const attr of Array.from(node.attributes)) {
      if (!kept.includes(attr.name)) node.removeAttribute(attr.name);
    }
    for (const child of node.children) strip(child);
  };
  strip(clone);
  return clone.outerHTML.replace(/\s+/g, ' ').trim();
}

(async () => {
  const engine = playwright[options.browser];
  const browser = await engine.launch({ headless: options.headless });
  const context = await browser.newContext({
    viewport: { width: options.width, height: options.height }
  });
  const page = await context.newPage();
  const pointer = { x: 0, y: 0 };

  const moveTo = async (coordinate) => {
    if (coordinate) {
      pointer.x = coordinate[0];
      pointer.y = coordinate[1];
    }
    await page.mouse.move(pointer.x, pointer.y);
  };

  const perform = async (input) => {
    const result = { output: '', metadata: {} };
    switch (input.action) {
      case 'screenshot': {
        const png = await page.screenshot({ type: 'png' });
        result.image = { media_type: 'image/png', data: png.toString('base64') };
        result.output = 'captured screenshot';
        break;
      }
      case 'mouse_move':
        await moveTo(input.coordinate);
        result.output = `moved to (${pointer.x}, ${pointer.y})`;
        break;
      case 'left_click':
        await moveTo(input.coordinate);
        await page.mouse.click(pointer.x, pointer.y);
        result.output = `clicked (${pointer.x}, ${pointer.y})`;
        break;
      case 'right_click':
        await moveTo(input.coordinate);
        await page.mouse.click(pointer.x, pointer.y, { button: 'right' });
        result.output = `right-clicked (${pointer.x}, ${pointer.y})`;
        break;
      case 'double_click':
        await moveTo(input.coordinate);
        await page.mouse.dblclick(pointer.x, pointer.y);
        result.output = `double-clicked (${pointer.x}, ${pointer.y})`;
        break;
      case 'left_click_drag':
        await moveTo(input.start);
        await page.mouse.down();
        await page.mouse.move(input.coordinate[0], input.coordinate[1], { steps: 10 });
        await page.mouse.up();
        pointer.x = input.coordinate[0];
        pointer.y = input.coordinate[1];
        result.output = `dragged to (${pointer.x}, ${pointer.y})`;
        break;
      case 'type':
        await page.keyboard.type(input.text);
        result.output = `typed ${input.text.length} characters`;
        break;
      case 'key':
        await page.keyboard.press(input.text);
        result.output = `pressed ${input.text}`;
        break;
      case 'scroll': {
        await moveTo(input.coordinate);
        const step = 100 * (input.amount || 3);
        const dx = input.direction === 'left' ? -step : input.direction === 'right' ? step : 0;
        const dy = input.direction === 'up' ? -step : input.direction === 'down' ? step : 0;
        await page.mouse.wheel(dx, dy);
        result.output = `scrolled ${input.direction}`;
        break;
      }
      case 'wait':
        await page.waitForTimeout(input.duration_ms);
        result.output = `waited ${input.duration_ms}ms`;
        break;
      case 'navigate': {
        const url = new URL(input.url, options.baseUrl).toString();
        await page.goto(url, { waitUntil: 'load' });
        result.output = `navigated to ${url}`;
        break;
      }
      case 'fingerprint': {
        const value = await page.evaluate(fingerprint, [input.coordinate[0], input.coordinate[1], KEPT_ATTRIBUTES]);
        if (value !== null) result.metadata.fingerprint = value;
        result.output = value === null ? 'no element' : 'fingerprinted';
        break;
      }
      default:
        throw new Error(`unsupported action: ${input.action}`);
    }
    result.metadata.url = page.url();
    result.metadata.title = await page.title();
    return result;
  };

  send({ ready: true });

  const lines = readline.createInterface({ input: process.stdin });
  for await (const line of lines) {
    if (!line.trim()) continue;
    let request;
    try {
      request = JSON.parse(line);
    } catch (error) {
      send({ ok: false, error: `malformed request: ${error.message}` });
      continue;
    }
    if (request.command === 'close') {
      await browser.close();
      send({ id: request.id, ok: true });
      process.exit(0);
    }
    try {
      send({ id: request.id, ok: true, result: await perform(request.input) });
    } catch (error) {
      send({ id: request.id, ok: false, error: error.message });
    }
  }
  await browser.close();
})().catch((error) => {
  send({ ok: false, error: error.message });
  process.exit(1);
});
"#;
