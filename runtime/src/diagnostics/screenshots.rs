//! Failure screenshots with bounded retention.

use crate::error::Result;
use crate::renderer::RenderContext;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("valid regex"))
}

#[derive(Debug, Clone)]
pub struct ScreenshotArchive {
    dir: PathBuf,
    retention: Duration,
}

impl ScreenshotArchive {
    pub fn new(dir: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{reason}_{entity}_{YYYYmmdd_HHMMSS}.png`, with unsafe characters
    /// collapsed to `_`.
    pub fn file_name(reason: &str, entity_id: &str, at: DateTime<Utc>) -> String {
        let re = unsafe_chars();
        format!(
            "{}_{}_{}.png",
            re.replace_all(reason, "_"),
            re.replace_all(entity_id, "_"),
            at.format("%Y%m%d_%H%M%S")
        )
    }

    /// Capture the current page. Failures are logged and swallowed.
    pub async fn capture(
        &self,
        context: &mut dyn RenderContext,
        reason: &str,
        entity_id: &str,
        at: DateTime<Utc>,
    ) -> Option<PathBuf> {
        let bytes = match context.screenshot().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("screenshot capture failed for {entity_id}: {e}");
                return None;
            }
        };
        let path = self.dir.join(Self::file_name(reason, entity_id, at));
        let written =
            std::fs::create_dir_all(&self.dir).and_then(|()| std::fs::write(&path, bytes));
        match written {
            Ok(()) => {
                info!("diagnostic screenshot saved: {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("failed to write screenshot {}: {e}", path.display());
                None
            }
        }
    }

    /// Delete `.png` artifacts last modified before `now - retention`.
    pub fn cleanup_expired(&self, now: SystemTime) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let cutoff = now.checked_sub(self.retention).unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified < cutoff {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("failed to remove {}: {e}", path.display()),
                }
            }
        }
        if removed > 0 {
            info!(
                "removed {removed} screenshot(s) older than {} day(s)",
                self.retention.as_secs() / 86_400
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_is_sanitized() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 14, 5, 9).unwrap();
        assert_eq!(
            ScreenshotArchive::file_name("form error", "12/34", at),
            "form_error_12_34_20250301_140509.png"
        );
    }

    #[test]
    fn cleanup_removes_only_expired_pngs() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ScreenshotArchive::new(dir.path(), Duration::from_secs(7 * 86_400));
        std::fs::write(dir.path().join("old.png"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        // Nothing is older than a week yet.
        assert_eq!(archive.cleanup_expired(SystemTime::now()).unwrap(), 0);

        let later = SystemTime::now() + Duration::from_secs(8 * 86_400);
        assert_eq!(archive.cleanup_expired(later).unwrap(), 1);
        assert!(!dir.path().join("old.png").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn cleanup_of_missing_dir_is_noop() {
        let archive = ScreenshotArchive::new("/nonexistent/harvest/shots", Duration::from_secs(1));
        assert_eq!(archive.cleanup_expired(SystemTime::now()).unwrap(), 0);
    }
}
