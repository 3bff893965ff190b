//! The harvesting pipeline: form submission, table extraction, retries and
//! the orchestrator that ties them to sessions and the store.

pub mod extract;
pub mod form;
pub mod orchestrator;
pub mod plan;
pub mod resources;
pub mod retry;
pub mod state;

pub use extract::{parse_report_table, Extraction};
pub use form::FormProtocol;
pub use orchestrator::Harvester;
pub use plan::{build_plan, PlanFilter};
pub use resources::{ResourceProbe, ResourceSample, StaticProbe, SystemProbe};
pub use retry::{Recovery, RetryOutcome, RetryPolicy};
pub use state::{ItemState, RunSummary};
