//! Orphaned browser process cleanup.
//!
//! Every session launches with a profile directory under one root, so any
//! process whose command line mentions that root belongs to the harvester.
//! Reaping kills those processes and deletes their profile directories.

use std::ffi::OsString;
use std::path::Path;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, info, warn};

/// Whether a process command line references `root`.
pub fn command_references(cmd: &[OsString], root: &Path) -> bool {
    let needle = root.to_string_lossy();
    if needle.is_empty() {
        return false;
    }
    cmd.iter().any(|arg| arg.to_string_lossy().contains(needle.as_ref()))
}

/// Kill every process whose command line references `root`, except the
/// current process. Returns the number of processes signalled.
pub fn kill_processes_under(root: &Path) -> usize {
    let own_pid = std::process::id();
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
    );

    let mut killed = 0;
    for (pid, process) in sys.processes() {
        if pid.as_u32() == own_pid || !command_references(process.cmd(), root) {
            continue;
        }
        if process.kill() {
            debug!(
                "killed orphaned browser process pid={} name={}",
                pid,
                process.name().to_string_lossy()
            );
            killed += 1;
        }
    }
    if killed > 0 {
        info!("reaped {killed} orphaned browser process(es) under {}", root.display());
    }
    killed
}

/// Delete profile directories under `root`, sparing `keep`.
pub fn remove_profiles(root: &Path, keep: Option<&Path>) -> usize {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || keep.is_some_and(|k| k == path.as_path()) {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("failed to remove stale profile {}: {e}", path.display()),
        }
    }
    removed
}
