//! Action decider boundary
//!
//! The decider turns a natural-language prompt into actions. It drives the
//! browser through a [`DecisionSession`], which performs each action and
//! records it on the run so later runs can replay it.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::action::{ActionExecutor, ActionInput, ActionOutput};
use crate::cache::CacheStore;
use crate::config::DeciderConfig;
use crate::error::{EngineError, EngineResult};
use crate::test_run::{CacheStep, TestRun, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Passed,
    Failed,
}

/// Terminal answer of the decision loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub status: VerdictStatus,
    pub reason: String,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

impl Verdict {
    pub fn passed(reason: impl Into<String>, token_usage: TokenUsage) -> Self {
        Self {
            status: VerdictStatus::Passed,
            reason: reason.into(),
            token_usage,
        }
    }

    pub fn failed(reason: impl Into<String>, token_usage: TokenUsage) -> Self {
        Self {
            status: VerdictStatus::Failed,
            reason: reason.into(),
            token_usage,
        }
    }
}

/// Browser access handed to the decider for one run
pub struct DecisionSession<'a> {
    executor: &'a mut dyn ActionExecutor,
    run: &'a mut TestRun,
    artifacts: Option<&'a CacheStore>,
}

impl<'a> DecisionSession<'a> {
    pub fn new(
        executor: &'a mut dyn ActionExecutor,
        run: &'a mut TestRun,
        artifacts: Option<&'a CacheStore>,
    ) -> Self {
        Self {
            executor,
            run,
            artifacts,
        }
    }

    pub fn run(&self) -> &TestRun {
        &*self.run
    }

    /// Perform an action and append it to the run's step log.
    ///
    /// Pointer moves also record the fingerprint of their target so a replay
    /// can tell whether the page still looks the same.
    pub async fn perform(
        &mut self,
        reasoning: &str,
        input: ActionInput,
    ) -> EngineResult<ActionOutput> {
        let fingerprint = match input.pointer_target() {
            Some(target) => match self.executor.fingerprint_at(target).await {
                Ok(fp) => Some(fp),
                Err(e) => {
                    debug!("No fingerprint at {}: {}", target, e);
                    None
                }
            },
            None => None,
        };

        let output = self.executor.execute(&input).await?;

        let mut step = CacheStep::new(reasoning, input).with_result(output.output.clone());
        if let Some(fp) = fingerprint {
            step = step.with_fingerprint(fp);
        }
        let index = self.run.step_count();
        self.run.add_step(step);

        if let Some(image) = &output.image {
            if let Err(e) = save_image(self.artifacts, &*self.run, index, &image.data).await {
                warn!("Could not store screenshot for {}: {}", self.run.run_id(), e);
            }
        }
        Ok(output)
    }

    /// Capture the page as a recorded screenshot step.
    pub async fn observe(&mut self, reasoning: &str) -> EngineResult<ActionOutput> {
        self.perform(reasoning, ActionInput::Screenshot).await
    }
}

async fn save_image(
    artifacts: Option<&CacheStore>,
    run: &TestRun,
    index: usize,
    data: &str,
) -> EngineResult<()> {
    let Some(store) = artifacts else {
        return Ok(());
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| EngineError::Executor(format!("invalid image data: {}", e)))?;
    let dir = store.ensure_test_run_dir_path(run).await?;
    tokio::fs::write(dir.join(format!("step-{:03}.png", index)), bytes).await?;
    Ok(())
}

/// Chooses actions from a prompt until it can decide pass or fail.
#[async_trait]
pub trait ActionDecider: Send + Sync {
    async fn run_action(
        &self,
        prompt: &str,
        session: &mut DecisionSession<'_>,
    ) -> EngineResult<Verdict>;
}

/// One completed action, sent back to the agent as history
#[derive(Debug, Clone, Serialize)]
struct Turn {
    reasoning: String,
    action: ActionInput,
    output: String,
}

#[derive(Debug, Serialize)]
struct DecisionRequest<'a> {
    prompt: &'a str,
    history: &'a [Turn],
    observation: &'a ActionOutput,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum DecisionReply {
    Act {
        #[serde(default)]
        reasoning: String,
        action: ActionInput,
        #[serde(default)]
        usage: TokenUsage,
    },
    Verdict {
        status: VerdictStatus,
        reason: String,
        #[serde(default)]
        usage: TokenUsage,
    },
}

/// Decider backed by a remote agent speaking JSON over HTTP
pub struct HttpDecider {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
    max_iterations: usize,
}

impl HttpDecider {
    pub fn new(config: &DeciderConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: std::env::var(&config.api_key_env).ok(),
            max_iterations: config.max_iterations,
        })
    }

    async fn ask(
        &self,
        endpoint: &str,
        request: &DecisionRequest<'_>,
    ) -> EngineResult<DecisionReply> {
        let mut builder = self.client.post(endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Decider(format!(
                "agent returned {}: {}",
                status, body
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ActionDecider for HttpDecider {
    async fn run_action(
        &self,
        prompt: &str,
        session: &mut DecisionSession<'_>,
    ) -> EngineResult<Verdict> {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return Err(EngineError::Decider(
                "no decider endpoint configured (set [decider].endpoint)".to_string(),
            ));
        };

        let mut usage = TokenUsage::default();
        let mut history: Vec<Turn> = Vec::new();
        let mut observation = session.observe("Initial observation").await?;

        for iteration in 0..self.max_iterations {
            let request = DecisionRequest {
                prompt,
                history: &history,
                observation: &observation,
            };
            match self.ask(endpoint, &request).await? {
                DecisionReply::Act {
                    reasoning,
                    action,
                    usage: spent,
                } => {
                    usage.add(spent);
                    debug!("Iteration {}: {} ({})", iteration + 1, action.name(), reasoning);
                    let output = match session.perform(&reasoning, action.clone()).await {
                        Ok(output) => output,
                        Err(e) => ActionOutput {
                            output: format!("error: {}", e),
                            ..Default::default()
                        },
                    };
                    history.push(Turn {
                        reasoning,
                        action,
                        output: output.output.clone(),
                    });
                    observation = output;
                }
                DecisionReply::Verdict {
                    status,
                    reason,
                    usage: spent,
                } => {
                    usage.add(spent);
                    return Ok(Verdict {
                        status,
                        reason,
                        token_usage: usage,
                    });
                }
            }
        }

        Ok(Verdict::failed(
            format!(
                "No verdict after {} decision iterations",
                self.max_iterations
            ),
            usage,
        ))
    }
}
