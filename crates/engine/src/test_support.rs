//! In-memory collaborators for unit tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::action::{
    ActionExecutor, ActionInput, ActionMetadata, ActionOutput, Coordinate, ExecutorFactory,
};
use crate::error::{EngineError, EngineResult};

/// Shared view of everything a [`FakeExecutor`] was asked to do.
#[derive(Clone, Default)]
pub struct FakeBrowser {
    inner: Arc<Mutex<BrowserState>>,
}

#[derive(Default)]
struct BrowserState {
    executed: Vec<ActionInput>,
    fingerprints: HashMap<Coordinate, String>,
    failing: Option<&'static str>,
    url: String,
    acquired: usize,
    released: usize,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fingerprint(self, at: Coordinate, fingerprint: &str) -> Self {
        self.set_fingerprint(at, fingerprint);
        self
    }

    pub fn set_fingerprint(&self, at: Coordinate, fingerprint: &str) {
        self.inner
            .lock()
            .unwrap()
            .fingerprints
            .insert(at, fingerprint.to_string());
    }

    /// Make every action with this name fail.
    pub fn failing_on(self, action: &'static str) -> Self {
        self.inner.lock().unwrap().failing = Some(action);
        self
    }

    pub fn executed(&self) -> Vec<ActionInput> {
        self.inner.lock().unwrap().executed.clone()
    }

    /// Executed actions, minus observations.
    pub fn interactions(&self) -> Vec<ActionInput> {
        self.executed()
            .into_iter()
            .filter(|a| !a.is_observation())
            .collect()
    }

    pub fn acquired(&self) -> usize {
        self.inner.lock().unwrap().acquired
    }

    pub fn released(&self) -> usize {
        self.inner.lock().unwrap().released
    }

    pub fn executor(&self) -> FakeExecutor {
        FakeExecutor {
            browser: self.clone(),
        }
    }
}

pub struct FakeExecutor {
    browser: FakeBrowser,
}

#[async_trait]
impl ActionExecutor for FakeExecutor {
    async fn execute(&mut self, input: &ActionInput) -> EngineResult<ActionOutput> {
        let mut state = self.browser.inner.lock().unwrap();
        state.executed.push(input.clone());
        if state.failing == Some(input.name()) {
            return Err(EngineError::Executor(format!("{} failed", input.name())));
        }

        if let ActionInput::Navigate { url } = input {
            state.url = url.clone();
        }
        let fingerprint = match input {
            ActionInput::Fingerprint { coordinate } => state.fingerprints.get(coordinate).cloned(),
            _ => None,
        };
        Ok(ActionOutput {
            output: format!("did {}", input.name()),
            metadata: ActionMetadata {
                url: Some(state.url.clone()),
                title: Some("Fake Page".to_string()),
                fingerprint,
            },
            image: None,
        })
    }

    async fn release(&mut self) -> EngineResult<()> {
        self.browser.inner.lock().unwrap().released += 1;
        Ok(())
    }
}

#[async_trait]
impl ExecutorFactory for FakeBrowser {
    async fn acquire(&self) -> EngineResult<Box<dyn ActionExecutor>> {
        self.inner.lock().unwrap().acquired += 1;
        Ok(Box::new(self.executor()))
    }
}
