//! Intentest test execution engine
//!
//! Runs natural-language browser tests. A live run hands the test's intent to
//! an action decider, which drives the browser and has every action recorded.
//! Passing runs are cached on disk so later runs can replay the recorded
//! actions instead of asking the decider again.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  TestRunner::execute(pattern, line)                         │
//! │    ├── TestDiscovery  -> test files                         │
//! │    ├── TestLoader     -> LoadedFile { cases, hooks }        │
//! │    └── per case:                                            │
//! │          TestRun (pending -> running -> passed | failed)    │
//! │            ├── direct:  TestCallback                        │
//! │            ├── cached:  CachedReplay + fingerprint checks   │
//! │            └── live:    ActionDecider + DecisionSession     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CacheStore                                                 │
//! │    ├── <run_id>.json      CacheEntry                        │
//! │    ├── <identifier>.lock  advisory writer lock              │
//! │    └── retention: keep newest passed (else newest) run      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod action;
pub mod cache;
pub mod config;
pub mod decider;
pub mod discovery;
pub mod error;
pub mod playwright;
pub mod prompt;
pub mod replay;
pub mod runner;
pub mod spec;
pub mod test_case;
pub mod test_run;

#[cfg(test)]
mod test_support;

pub use action::{ActionExecutor, ActionInput, ActionOutput, Coordinate, ExecutorFactory};
pub use cache::{CacheEntry, CacheStore};
pub use config::EngineConfig;
pub use decider::{ActionDecider, DecisionSession, HttpDecider, Verdict, VerdictStatus};
pub use error::{CacheError, EngineError, EngineResult, TestError};
pub use playwright::{PlaywrightConfig, PlaywrightFactory};
pub use runner::{RunReport, TestRunner};
pub use test_case::{Expectation, LoadedFile, TestCallback, TestCase, TestLoader};
pub use test_run::{CacheStep, RunStatus, TestRun, TokenUsage};
