//! Cached replay with fingerprint validation
//!
//! Replays the newest live-passed run of a test instead of asking the
//! decider again. Every pointer move is checked against the fingerprint
//! recorded with it; the first mismatch or failed action abandons the whole
//! replay with [`CacheError::Invalid`].

use std::time::Duration;
use tracing::{debug, info};

use crate::action::ActionExecutor;
use crate::cache::CacheStore;
use crate::error::{CacheError, EngineError, EngineResult};
use crate::test_run::{CacheStep, TestRun};

/// Pause before each replayed step so the page can react.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1000);

pub struct CachedReplay {
    settle_delay: Duration,
}

impl Default for CachedReplay {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE_DELAY)
    }
}

impl CachedReplay {
    pub fn new(settle_delay: Duration) -> Self {
        Self { settle_delay }
    }

    /// Replay the cached steps for `run` and mark it passed from cache.
    ///
    /// The replayed run is never written back to `store`.
    pub async fn execute(
        &self,
        run: &mut TestRun,
        store: &mut CacheStore,
        executor: &mut dyn ActionExecutor,
    ) -> EngineResult<()> {
        let cached = store.latest_passed_run().await?.ok_or_else(|| CacheError::NotFound {
            identifier: store.identifier().to_string(),
        })?;

        let steps: Vec<CacheStep> = cached
            .steps()
            .into_iter()
            .filter(|s| !s.action.input.is_observation())
            .collect();
        if steps.is_empty() {
            return Err(EngineError::cache_invalid(format!(
                "run {} has no replayable steps",
                cached.run_id()
            )));
        }

        info!(
            "Replaying {} cached step(s) for '{}' from {}",
            steps.len(),
            run.test_case().name,
            cached.run_id()
        );

        for (index, step) in steps.iter().enumerate() {
            tokio::time::sleep(self.settle_delay).await;
            let input = &step.action.input;
            let position = index + 1;

            if let Some(target) = input.pointer_target() {
                let current = executor.fingerprint_at(target).await.map_err(|e| {
                    EngineError::cache_invalid(format!(
                        "step {}: cannot fingerprint element at {}: {}",
                        position, target, e
                    ))
                })?;
                if step.extras.fingerprint.as_deref() != Some(current.as_str()) {
                    debug!(
                        "Fingerprint mismatch at {}: recorded {:?}, found {:?}",
                        target, step.extras.fingerprint, current
                    );
                    return Err(EngineError::cache_invalid(format!(
                        "step {}: element at {} changed since it was recorded",
                        position, target
                    )));
                }
            }

            executor.execute(input).await.map_err(|e| {
                EngineError::cache_invalid(format!(
                    "step {} ({}) failed: {}",
                    position,
                    input.name(),
                    e
                ))
            })?;
        }

        let reason = cached.reason().unwrap_or("passed");
        run.mark_passed_from_cache(format!("{} (replayed from cache)", reason))?;
        Ok(())
    }
}
