//! Offline diagnosis artifacts: failure screenshots and the run ledger.

pub mod ledger;
pub mod screenshots;

pub use ledger::{LedgerEntry, RunLedger};
pub use screenshots::ScreenshotArchive;
