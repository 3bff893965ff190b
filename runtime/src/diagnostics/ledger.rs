//! JSONL run ledger, one line per finished task.
//!
//! Features:
//! - Append-only JSONL format for easy parsing
//! - Automatic rotation when the file exceeds `MAX_LEDGER_SIZE` (20MB)
//! - Rotated files named `.1`, `.2`, etc. (max 5 rotations)

use crate::error::{FailureKind, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Maximum ledger size before rotation (20 MB).
const MAX_LEDGER_SIZE: u64 = 20 * 1024 * 1024;

/// Maximum number of rotated ledgers to keep.
const MAX_ROTATIONS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: String,
    pub entity_id: String,
    pub date: String,
    /// `inserted`, `updated` or `failed`.
    pub outcome: String,
    pub kind: Option<FailureKind>,
    pub error: Option<String>,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl LedgerEntry {
    pub fn now(entity_id: &str, date: &str, outcome: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            entity_id: entity_id.to_string(),
            date: date.to_string(),
            outcome: outcome.to_string(),
            kind: None,
            error: None,
            attempts: 0,
            elapsed_ms: 0,
        }
    }
}

/// Append-only JSONL ledger with automatic rotation.
pub struct RunLedger {
    file: File,
    path: PathBuf,
    current_size: u64,
    max_size: u64,
}

impl RunLedger {
    /// Open or create the ledger file.
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_limit(path, MAX_LEDGER_SIZE)
    }

    pub fn with_limit(path: &Path, max_size: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            current_size,
            max_size,
        })
    }

    pub fn record(&mut self, entry: &LedgerEntry) -> Result<()> {
        if self.current_size >= self.max_size {
            self.rotate()?;
        }
        let json = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        writeln!(self.file, "{json}")?;
        self.current_size += json.len() as u64 + 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shift `ledger.jsonl` → `.1`, `.1` → `.2`, … and start a fresh file.
    fn rotate(&mut self) -> Result<()> {
        self.file.flush()?;
        for i in (1..MAX_ROTATIONS).rev() {
            let from = rotation_path(&self.path, i);
            if from.exists() {
                let _ = std::fs::rename(&from, rotation_path(&self.path, i + 1));
            }
        }
        let _ = std::fs::rename(&self.path, rotation_path(&self.path, 1));
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

fn rotation_path(base: &Path, index: u32) -> PathBuf {
    let name = format!(
        "{}.{index}",
        base.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("ledger.jsonl")
    );
    base.with_file_name(name)
}

/// Read every entry of a ledger file, skipping malformed lines.
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
