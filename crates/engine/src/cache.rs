//! On-disk run history
//!
//! Layout of the cache directory:
//!
//! ```text
//! <cache_dir>/
//!   <run_id>.json        one CacheEntry per terminal run
//!   <run_id>/            artifacts captured during that run
//!   <identifier>.lock    advisory writer lock, one per test case
//! ```
//!
//! Several engine processes may share one directory. Writers take an
//! exclusive lock on the test's lock file and skip the save when another
//! process holds it.

use fs2::FileExt;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::test_case::TestCase;
use crate::test_run::{CacheStep, RunStatus, TestRun, TokenUsage, CACHE_VERSION};

/// Run-level fields of a cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub timestamp: i64,
    #[serde(deserialize_with = "deserialize_version")]
    pub version: u32,
    pub status: RunStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    pub run_id: String,
    #[serde(default)]
    pub executed_from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedTest {
    pub name: String,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheData {
    #[serde(default)]
    pub steps: Vec<CacheStep>,
}

/// Serialized form of a terminal run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub metadata: CacheMetadata,
    pub test: CachedTest,
    pub data: CacheData,
}

impl CacheEntry {
    pub fn from_run(run: &TestRun) -> Self {
        let test = run.test_case();
        Self {
            metadata: CacheMetadata {
                timestamp: run.timestamp(),
                version: run.version(),
                status: run.status(),
                reason: run.reason().map(str::to_string),
                token_usage: run.token_usage(),
                run_id: run.run_id().to_string(),
                executed_from_cache: run.executed_from_cache(),
            },
            test: CachedTest {
                name: test.name.clone(),
                file_path: test.file_path.clone(),
            },
            data: CacheData { steps: run.steps() },
        }
    }
}

/// Early entries stored the version as a string.
fn deserialize_version<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum VersionField {
        Number(u32),
        Text(String),
    }

    match VersionField::deserialize(deserializer)? {
        VersionField::Number(v) => Ok(v),
        VersionField::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid cache version '{}'", s))),
    }
}

/// Exclusive advisory lock, released on drop
struct CacheLock {
    file: File,
}

impl CacheLock {
    /// `Ok(None)` when another holder has the lock.
    fn try_acquire(path: &Path) -> EngineResult<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// What a retention pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    pub deleted: Vec<String>,
    pub kept: Option<String>,
}

/// Run history of a single test case
pub struct CacheStore {
    cache_dir: PathBuf,
    test_case: Arc<TestCase>,
    runs: Option<Vec<TestRun>>,
}

impl CacheStore {
    pub fn new(cache_dir: impl Into<PathBuf>, test_case: Arc<TestCase>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            test_case,
            runs: None,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn identifier(&self) -> &str {
        &self.test_case.identifier
    }

    pub fn entry_path(&self, run: &TestRun) -> PathBuf {
        self.cache_dir.join(format!("{}.json", run.run_id()))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.lock", self.identifier()))
    }

    pub fn run_dir_path(&self, run: &TestRun) -> PathBuf {
        self.cache_dir.join(run.run_id())
    }

    fn owns_entry(&self, path: &Path) -> bool {
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            return false;
        }
        let suffix = format!("_{}", self.identifier());
        path.file_stem()
            .map(|stem| stem.to_string_lossy().ends_with(&suffix))
            .unwrap_or(false)
    }

    async fn load_runs(&self) -> EngineResult<Vec<TestRun>> {
        let mut runs = Vec::new();
        if !self.cache_dir.exists() {
            return Ok(runs);
        }

        let mut entries = fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !self.owns_entry(&path) {
                continue;
            }

            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Skipping unreadable cache entry {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_str::<CacheEntry>(&content) {
                Ok(entry) => runs.push(TestRun::from_cache(self.test_case.clone(), entry)),
                Err(e) => warn!("Skipping corrupt cache entry {}: {}", path.display(), e),
            }
        }

        runs.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.run_id().cmp(b.run_id()))
        });
        debug!("Loaded {} cached run(s) for {}", runs.len(), self.identifier());
        Ok(runs)
    }

    /// All stored runs for this test, oldest first. Loaded once and memoized.
    pub async fn runs(&mut self) -> EngineResult<&[TestRun]> {
        if self.runs.is_none() {
            self.runs = Some(self.load_runs().await?);
        }
        Ok(self.runs.as_deref().unwrap_or_default())
    }

    /// Drop the memoized runs so the next read hits the disk.
    pub fn invalidate(&mut self) {
        self.runs = None;
    }

    /// Newest live-passed run on the current schema.
    pub async fn latest_passed_run(&mut self) -> EngineResult<Option<TestRun>> {
        let runs = self.runs().await?;
        Ok(runs
            .iter()
            .filter(|r| r.is_replay_candidate())
            .max_by(|a, b| {
                a.timestamp()
                    .cmp(&b.timestamp())
                    .then_with(|| a.run_id().cmp(b.run_id()))
            })
            .cloned())
    }

    /// Persist a terminal live run. Returns `false` when the save was skipped.
    pub async fn save_run(&mut self, run: &TestRun) -> EngineResult<bool> {
        if !run.is_terminal() {
            debug!("Not caching non-terminal run {}", run.run_id());
            return Ok(false);
        }
        if run.executed_from_cache() {
            debug!("Not caching replayed run {}", run.run_id());
            return Ok(false);
        }

        fs::create_dir_all(&self.cache_dir).await?;
        let Some(_lock) = CacheLock::try_acquire(&self.lock_path())? else {
            warn!(
                "Cache for '{}' is locked by another writer, skipping save",
                self.test_case.name
            );
            self.discard_artifacts(run).await;
            return Ok(false);
        };

        let entry = CacheEntry::from_run(run);
        let json = serde_json::to_string_pretty(&entry)?;

        // Write atomically via temp file
        let path = self.entry_path(run);
        let tmp_path = self.cache_dir.join(format!("{}.json.tmp", run.run_id()));
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &path).await?;
        debug!("Cached run {} ({} steps)", run.run_id(), run.step_count());

        if let Some(runs) = self.runs.as_mut() {
            runs.retain(|r| r.run_id() != run.run_id());
            runs.push(run.clone());
        }
        Ok(true)
    }

    /// Artifacts of a run without an entry are unreachable, so drop them.
    async fn discard_artifacts(&self, run: &TestRun) {
        let dir = self.run_dir_path(run);
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                debug!("Artifacts of {} not removed: {}", run.run_id(), e);
            }
        }
    }

    /// Remove a run's entry and artifacts. Missing files are fine.
    pub async fn delete_run(&mut self, run: &TestRun) {
        if let Err(e) = fs::remove_file(self.entry_path(run)).await {
            debug!("Cache entry {} not removed: {}", run.run_id(), e);
        }
        self.discard_artifacts(run).await;
        if let Some(runs) = self.runs.as_mut() {
            runs.retain(|r| r.run_id() != run.run_id());
        }
    }

    /// Prune history down to the single run worth keeping.
    ///
    /// Runs from other schema versions are always removed. Replayed runs are
    /// left alone. Of the remaining live runs, the newest passed one is kept,
    /// or the newest run of any status when none passed.
    pub async fn apply_retention_policy(&mut self) -> EngineResult<RetentionOutcome> {
        self.invalidate();
        let runs = self.runs().await?.to_vec();

        let mut doomed = Vec::new();
        let mut live = Vec::new();
        for run in runs {
            if run.version() != CACHE_VERSION {
                doomed.push(run);
            } else if !run.executed_from_cache() {
                live.push(run);
            }
        }

        let newest = |a: &&TestRun, b: &&TestRun| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.run_id().cmp(b.run_id()))
        };
        let keep = live
            .iter()
            .filter(|r| r.status() == RunStatus::Passed)
            .max_by(newest)
            .or_else(|| live.iter().max_by(newest))
            .map(|r| r.run_id().to_string());

        doomed.extend(
            live.into_iter()
                .filter(|r| Some(r.run_id()) != keep.as_deref()),
        );

        let mut outcome = RetentionOutcome {
            deleted: Vec::with_capacity(doomed.len()),
            kept: keep,
        };
        for run in &doomed {
            self.delete_run(run).await;
            outcome.deleted.push(run.run_id().to_string());
        }

        if !outcome.deleted.is_empty() {
            debug!(
                "Retention removed {} run(s) for '{}'",
                outcome.deleted.len(),
                self.test_case.name
            );
        }
        Ok(outcome)
    }

    /// Per-run directory for large artifacts, created on first use.
    pub async fn ensure_test_run_dir_path(&self, run: &TestRun) -> EngineResult<PathBuf> {
        let dir = self.run_dir_path(run);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Delete every entry, lock and artifact directory under `cache_dir`.
    pub async fn purge_all(cache_dir: &Path) -> EngineResult<usize> {
        if !cache_dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = fs::read_dir(cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => return Err(EngineError::Io(e)),
            }
        }
        info!("Purged {} cache item(s) from {}", removed, cache_dir.display());
        Ok(removed)
    }
}
