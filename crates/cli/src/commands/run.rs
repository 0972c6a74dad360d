//! Test execution command

use anyhow::Context;
use clap::Args;
use intentest_engine::{EngineConfig, HttpDecider, PlaywrightConfig, PlaywrightFactory, TestRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::output::{self, OutputFormat};

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Test file, directory or glob; `file:line` selects the test at that line
    pub target: Option<String>,

    /// Skip cached replay and always run live
    #[arg(long)]
    pub no_cache: bool,

    /// URL every test starts from
    #[arg(long, env = "INTENTEST_BASE_URL")]
    pub base_url: Option<String>,

    /// Run the browser headless (true/false)
    #[arg(long)]
    pub headless: Option<bool>,

    /// Write a JSON report to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Output format for the summary
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// Split `path:line` into its parts. Anything else is a plain pattern.
pub fn parse_target(target: &str) -> (String, Option<usize>) {
    if let Some((path, line)) = target.rsplit_once(':') {
        if !path.is_empty() {
            if let Ok(line) = line.parse::<usize>() {
                return (path.to_string(), Some(line));
            }
        }
    }
    (target.to_string(), None)
}

fn apply_overrides(config: &mut EngineConfig, args: &RunArgs) {
    if args.no_cache {
        config.cache.enabled = false;
    }
    if let Some(url) = &args.base_url {
        config.base_url = url.clone();
    }
    if let Some(headless) = args.headless {
        config.browser.headless = headless;
    }
}

/// Run the selected tests. Returns whether every test passed.
pub async fn execute(args: RunArgs, config_path: &Path) -> anyhow::Result<bool> {
    let mut config = EngineConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    apply_overrides(&mut config, &args);

    let (pattern, line) = match &args.target {
        Some(target) => parse_target(target),
        None => (config.test_pattern.clone(), None),
    };

    let browsers = Arc::new(PlaywrightFactory::new(PlaywrightConfig::from_engine(&config)));
    let decider = Arc::new(HttpDecider::new(&config.decider)?);
    let mut runner = TestRunner::new(config, browsers, decider);

    let success = runner.execute(&pattern, line).await?;

    if let Some(path) = &args.report {
        runner.write_report(path)?;
    }
    output::print_report(runner.report(), args.format);
    Ok(success)
}
