//! Test run lifecycle
//!
//! A [`TestRun`] is one execution attempt of a [`TestCase`]:
//!
//! ```text
//! pending ──mark_running──▶ running ──mark_passed──▶ passed
//!    │                         │
//!    └────────mark_failed──────┴──────────────────▶ failed
//! ```
//!
//! `mark_failed` is accepted from every state so abort paths never need to
//! know how far a run got.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::action::ActionInput;
use crate::cache::CacheEntry;
use crate::error::{EngineError, EngineResult};
use crate::test_case::TestCase;

/// Schema version written into every cache entry.
pub const CACHE_VERSION: u32 = 2;

/// Tokens spent by the action decider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state; only terminal states carry a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Passed { reason: String },
    Failed { reason: String },
}

impl RunState {
    pub fn status(&self) -> RunStatus {
        match self {
            RunState::Pending => RunStatus::Pending,
            RunState::Running => RunStatus::Running,
            RunState::Passed { .. } => RunStatus::Passed,
            RunState::Failed { .. } => RunStatus::Failed,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            RunState::Passed { reason } | RunState::Failed { reason } => Some(reason),
            RunState::Pending | RunState::Running => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Passed { .. } | RunState::Failed { .. })
    }
}

fn default_action_kind() -> String {
    "tool_use".to_string()
}

/// The action a step performed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedAction {
    #[serde(rename = "type", default = "default_action_kind")]
    pub kind: String,
    pub name: String,
    pub input: ActionInput,
}

impl From<ActionInput> for RecordedAction {
    fn from(input: ActionInput) -> Self {
        Self {
            kind: default_action_kind(),
            name: input.name().to_string(),
            input,
        }
    }
}

/// Page state captured when a step was recorded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExtras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// One recorded action, in execution order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStep {
    #[serde(default)]
    pub reasoning: String,
    pub action: RecordedAction,
    pub timestamp: i64,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub extras: StepExtras,
}

impl CacheStep {
    pub fn new(reasoning: impl Into<String>, input: ActionInput) -> Self {
        Self {
            reasoning: reasoning.into(),
            action: input.into(),
            timestamp: Utc::now().timestamp_millis(),
            result: None,
            extras: StepExtras::default(),
        }
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.extras.fingerprint = Some(fingerprint.into());
        self
    }
}

/// One execution attempt of a test case
#[derive(Debug, Clone)]
pub struct TestRun {
    test_case: Arc<TestCase>,
    run_id: String,
    timestamp: i64,
    steps: Vec<CacheStep>,
    token_usage: TokenUsage,
    version: u32,
    executed_from_cache: bool,
    state: RunState,
}

/// `<timestamp with ':' and '.' replaced by '-'>_<identifier>`
pub fn run_id_for(created_at: DateTime<Utc>, identifier: &str) -> String {
    let stamp = created_at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{}_{}", stamp, identifier)
}

impl TestRun {
    /// Start a new pending run
    pub fn create(test_case: Arc<TestCase>) -> Self {
        Self::create_at(test_case, Utc::now())
    }

    pub fn create_at(test_case: Arc<TestCase>, created_at: DateTime<Utc>) -> Self {
        let run_id = run_id_for(created_at, &test_case.identifier);
        Self {
            test_case,
            run_id,
            timestamp: created_at.timestamp_millis(),
            steps: Vec::new(),
            token_usage: TokenUsage::default(),
            version: CACHE_VERSION,
            executed_from_cache: false,
            state: RunState::Pending,
        }
    }

    /// Rebuild a run from its on-disk entry
    pub fn from_cache(test_case: Arc<TestCase>, entry: CacheEntry) -> Self {
        let meta = entry.metadata;
        let reason = meta.reason.unwrap_or_default();
        let state = match meta.status {
            RunStatus::Pending => RunState::Pending,
            RunStatus::Running => RunState::Running,
            RunStatus::Passed => RunState::Passed { reason },
            RunStatus::Failed => RunState::Failed { reason },
        };
        Self {
            test_case,
            run_id: meta.run_id,
            timestamp: meta.timestamp,
            steps: entry.data.steps,
            token_usage: meta.token_usage,
            version: meta.version,
            executed_from_cache: meta.executed_from_cache,
            state,
        }
    }

    pub fn mark_running(&mut self) -> EngineResult<()> {
        if self.state != RunState::Pending {
            return Err(EngineError::invalid_transition(
                "can only start from pending state",
            ));
        }
        self.state = RunState::Running;
        Ok(())
    }

    /// `token_usage` replaces the running total when given.
    pub fn mark_passed(
        &mut self,
        reason: impl Into<String>,
        token_usage: Option<TokenUsage>,
    ) -> EngineResult<()> {
        if self.state != RunState::Running {
            return Err(EngineError::invalid_transition(
                "can only pass from running state",
            ));
        }
        self.state = RunState::Passed {
            reason: reason.into(),
        };
        if let Some(usage) = token_usage {
            self.token_usage = usage;
        }
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, token_usage: Option<TokenUsage>) {
        self.state = RunState::Failed {
            reason: reason.into(),
        };
        if let Some(usage) = token_usage {
            self.token_usage = usage;
        }
    }

    pub fn mark_passed_from_cache(&mut self, reason: impl Into<String>) -> EngineResult<()> {
        self.mark_passed(reason, None)?;
        self.executed_from_cache = true;
        Ok(())
    }

    pub fn add_step(&mut self, step: CacheStep) {
        self.steps.push(step);
    }

    /// Copy of the step log
    pub fn steps(&self) -> Vec<CacheStep> {
        self.steps.clone()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn test_case(&self) -> &Arc<TestCase> {
        &self.test_case
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Creation time, milliseconds since the epoch
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.token_usage
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn executed_from_cache(&self) -> bool {
        self.executed_from_cache
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn status(&self) -> RunStatus {
        self.state.status()
    }

    pub fn reason(&self) -> Option<&str> {
        self.state.reason()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Passed live on the current schema, so safe to replay.
    pub fn is_replay_candidate(&self) -> bool {
        self.version == CACHE_VERSION
            && self.status() == RunStatus::Passed
            && !self.executed_from_cache
    }
}
