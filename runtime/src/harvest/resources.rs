//! Host resource pressure sampling.

use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSample {
    pub memory_used_pct: Option<f64>,
    pub disk_used_pct: Option<f64>,
}

impl ResourceSample {
    /// Whether either reading is above its limit.
    pub fn constrained(&self, memory_limit_pct: f64, disk_limit_pct: f64) -> bool {
        self.memory_used_pct.is_some_and(|m| m > memory_limit_pct)
            || self.disk_used_pct.is_some_and(|d| d > disk_limit_pct)
    }
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Reads memory and the usage of the disk holding `watch_path`.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    watch_path: PathBuf,
}

impl SystemProbe {
    pub fn new(watch_path: impl Into<PathBuf>) -> Self {
        Self {
            watch_path: watch_path.into(),
        }
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceSample {
        let mut sys = System::new();
        sys.refresh_memory();
        let memory_used_pct = percent_used(sys.total_memory(), sys.available_memory());

        let disks = Disks::new_with_refreshed_list();
        let disk_used_pct = disks
            .list()
            .iter()
            .filter(|d| self.watch_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .and_then(|d| percent_used(d.total_space(), d.available_space()));

        ResourceSample {
            memory_used_pct,
            disk_used_pct,
        }
    }
}

/// Fixed readings, for tests and dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub ResourceSample);

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> ResourceSample {
        self.0
    }
}

fn percent_used(total: u64, available: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(used as f64 * 100.0 / total as f64)
}

/// Existing ancestor of `path`, for probing disks before directories exist.
pub fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}
