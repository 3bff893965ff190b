//! Background maintenance loop for long harvest runs.
//!
//! Prunes expired diagnostic screenshots on a fixed tick until the run's
//! shutdown signal fires.

use crate::diagnostics::ScreenshotArchive;
use crate::shutdown::ShutdownSignal;
use std::time::{Duration, SystemTime};

const DEFAULT_TICK_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub tick_every: Duration,
}

impl MaintenanceConfig {
    pub fn from_env() -> Self {
        Self {
            tick_every: Duration::from_secs(
                read_env_u64("HARVEST_MAINTENANCE_TICK_SECS", DEFAULT_TICK_SECS).max(1),
            ),
        }
    }
}

/// Spawn the retention loop. It stops when `shutdown` is triggered.
pub fn spawn(
    archive: ScreenshotArchive,
    cfg: MaintenanceConfig,
    shutdown: ShutdownSignal,
) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        tracing::info!(
            "maintenance loop started: tick={}s dir={}",
            cfg.tick_every.as_secs(),
            archive.dir().display()
        );
        let mut ticker = tokio::time::interval(cfg.tick_every);
        let mut removed_total = 0usize;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("maintenance loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    removed_total += run_retention(&archive);
                }
            }
        }
        removed_total
    })
}

/// One retention pass. Errors are logged, never raised.
pub fn run_retention(archive: &ScreenshotArchive) -> usize {
    match archive.cleanup_expired(SystemTime::now()) {
        Ok(0) => 0,
        Ok(removed) => {
            tracing::info!("maintenance removed {removed} expired screenshot(s)");
            removed
        }
        Err(e) => {
            tracing::warn!("maintenance screenshot cleanup failed: {e}");
            0
        }
    }
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}
