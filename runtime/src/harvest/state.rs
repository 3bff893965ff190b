//! Per-run orchestrator state and the end-of-run summary.

use crate::error::FailureKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Submitting,
    Extracting,
    Persisting,
    Done,
    Failed,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `next` is a legal successor.
    pub fn can_advance_to(self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Pending, Submitting)
                | (Submitting, Extracting)
                // Another window of the same task.
                | (Extracting, Submitting)
                | (Extracting, Persisting)
                | (Persisting, Done)
                | (Pending | Submitting | Extracting | Persisting, Failed)
        )
    }
}

/// Tracks one task through its states.
#[derive(Debug, Clone)]
pub struct ItemTracker {
    state: ItemState,
    history: Vec<ItemState>,
}

impl ItemTracker {
    pub fn new() -> Self {
        Self {
            state: ItemState::Pending,
            history: vec![ItemState::Pending],
        }
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn history(&self) -> &[ItemState] {
        &self.history
    }

    /// Move to `next`. Illegal transitions are ignored and reported as
    /// `false`.
    pub fn advance(&mut self, next: ItemState) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::debug!("ignoring item transition {:?} -> {next:?}", self.state);
            return false;
        }
        self.state = next;
        self.history.push(next);
        true
    }
}

impl Default for ItemTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters that live for exactly one run.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorState {
    /// Consecutive failed tasks, across tasks.
    pub consecutive_failures: u32,
    /// Tasks finished (either way) since the last health check.
    pub since_health_check: u32,
    /// Tasks finished since the last cookie/storage wipe.
    pub since_clear: u32,
    pub summary: RunSummary,
}

impl OrchestratorState {
    pub fn record_success(&mut self, outcome: &str) {
        self.consecutive_failures = 0;
        self.since_health_check += 1;
        self.since_clear += 1;
        self.summary.succeeded += 1;
        match outcome {
            "inserted" => self.summary.inserted += 1,
            "updated" => self.summary.updated += 1,
            _ => {}
        }
    }

    pub fn record_failure(&mut self, kind: FailureKind) {
        self.consecutive_failures += 1;
        self.since_health_check += 1;
        self.since_clear += 1;
        self.summary.failed += 1;
        *self.summary.failures.entry(kind).or_insert(0) += 1;
    }
}

/// End-of-run report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Tasks skipped because the run was interrupted.
    pub abandoned: usize,
    pub failures: BTreeMap<FailureKind, usize>,
    pub rotations: u32,
    pub circuit_trips: u32,
    pub pressure_pauses: u32,
    pub elapsed_ms: u64,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn failures_of(&self, kind: FailureKind) -> usize {
        self.failures.get(&kind).copied().unwrap_or(0)
    }

    /// Headline buckets plus any other non-empty category.
    pub fn breakdown(&self) -> Vec<(FailureKind, usize)> {
        let mut rows: Vec<(FailureKind, usize)> = FailureKind::HEADLINE
            .iter()
            .map(|k| (*k, self.failures_of(*k)))
            .collect();
        for (kind, count) in &self.failures {
            if !FailureKind::HEADLINE.contains(kind) && *count > 0 {
                rows.push((*kind, *count));
            }
        }
        rows
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Harvest summary")?;
        writeln!(f, "===============")?;
        writeln!(f, "planned:     {}", self.planned)?;
        writeln!(
            f,
            "succeeded:   {} ({} inserted, {} updated)",
            self.succeeded, self.inserted, self.updated
        )?;
        writeln!(f, "failed:      {}", self.failed)?;
        for (kind, count) in self.breakdown() {
            writeln!(f, "  {:<18} {count}", kind.as_str())?;
        }
        if self.abandoned > 0 {
            writeln!(f, "abandoned:   {}", self.abandoned)?;
        }
        writeln!(f, "rotations:   {}", self.rotations)?;
        writeln!(f, "breaker:     {} trip(s)", self.circuit_trips)?;
        write!(f, "elapsed:     {:.1}s", self.elapsed().as_secs_f64())?;
        if self.cancelled {
            write!(f, " (interrupted)")?;
        }
        Ok(())
    }
}
