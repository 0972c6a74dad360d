//! Cache maintenance commands

use clap::Subcommand;
use intentest_engine::{CacheStore, EngineConfig};
use std::path::Path;
use tracing::info;

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Delete every cached run, lock file and artifact
    Clear,

    /// Print the cache directory
    Path,
}

pub async fn execute(cmd: CacheCommands, config_path: &Path) -> anyhow::Result<()> {
    let config = EngineConfig::load(config_path)?;
    let dir = &config.cache.dir;

    match cmd {
        CacheCommands::Clear => {
            let removed = CacheStore::purge_all(dir).await?;
            info!("Cleared cache at {}", dir.display());
            println!("✅ Removed {} cache item(s) from {}", removed, dir.display());
        }
        CacheCommands::Path => {
            println!("{}", dir.display());
        }
    }
    Ok(())
}
