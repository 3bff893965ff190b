//! `harvest cleanup`: prune old screenshots and reap leftover browsers.

use crate::cli::output;
use crate::config::HarvestConfig;
use crate::diagnostics::ScreenshotArchive;
use crate::renderer::reaper;
use anyhow::{Context, Result};
use serde_json::json;
use std::time::SystemTime;

pub async fn run() -> Result<()> {
    let config = HarvestConfig::from_env().context("loading configuration")?;

    let archive =
        ScreenshotArchive::new(config.screenshot_dir.clone(), config.screenshot_retention);
    let screenshots = archive
        .cleanup_expired(SystemTime::now())
        .with_context(|| format!("pruning {}", archive.dir().display()))?;

    let root = config.profile_root();
    let scan_root = root.clone();
    let killed = tokio::task::spawn_blocking(move || reaper::kill_processes_under(&scan_root))
        .await
        .unwrap_or(0);
    let profiles = reaper::remove_profiles(&root, None);

    if output::is_json() {
        output::print_json(&json!({
            "screenshots_removed": screenshots,
            "processes_killed": killed,
            "profiles_removed": profiles,
        }));
    } else if !output::is_quiet() {
        println!("Removed {screenshots} expired screenshot(s)");
        println!("Killed {killed} orphaned browser process(es)");
        println!("Removed {profiles} stale profile director(ies)");
    }
    Ok(())
}
