//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EngineResult;
use crate::playwright::Browser;

/// Engine configuration, usually read from `intentest.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where every test starts
    pub base_url: String,

    /// Glob used when no target is given
    pub test_pattern: String,

    pub cache: CacheConfig,
    pub browser: BrowserConfig,
    pub replay: ReplayConfig,
    pub decider: DeciderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            test_pattern: "**/*.test.yaml".to_string(),
            cache: CacheConfig::default(),
            browser: BrowserConfig::default(),
            replay: ReplayConfig::default(),
            decider: DeciderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Try cached replay before the live path
    pub enabled: bool,

    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".intentest/cache"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Node.js binary running the Playwright bridge
    pub node_binary: PathBuf,

    /// Per-action timeout
    pub action_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            node_binary: PathBuf::from("node"),
            action_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub settle_delay_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 1000,
        }
    }
}

impl ReplayConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeciderConfig {
    /// Agent endpoint; the live path fails without one
    pub endpoint: Option<String>,

    /// Environment variable holding the agent's bearer token
    pub api_key_env: String,

    pub max_iterations: usize,
    pub timeout_secs: u64,
}

impl Default for DeciderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: "INTENTEST_DECIDER_API_KEY".to_string(),
            max_iterations: 50,
            timeout_secs: 120,
        }
    }
}

impl EngineConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> EngineResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> EngineResult<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::load(&tmp.path().join("intentest.toml")).unwrap();
        assert!(config.cache.enabled);
        assert_eq!(config.replay.settle_delay(), Duration::from_secs(1));
        assert_eq!(config.browser.browser, Browser::Chromium);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = EngineConfig::from_toml(
            r#"
base_url = "http://127.0.0.1:8080"

[cache]
enabled = false

[browser]
browser = "firefox"
headless = false

[decider]
endpoint = "http://127.0.0.1:9000/decide"
"#,
        )
        .unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:8080");
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.dir, PathBuf::from(".intentest/cache"));
        assert_eq!(config.browser.browser, Browser::Firefox);
        assert_eq!(config.browser.viewport_width, 1280);
        assert_eq!(
            config.decider.endpoint.as_deref(),
            Some("http://127.0.0.1:9000/decide")
        );
        assert_eq!(config.decider.max_iterations, 50);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        assert!(EngineConfig::from_toml("cache = 3").is_err());
    }
}
