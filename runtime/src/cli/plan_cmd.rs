//! `harvest plan`: print the task list without touching a browser.

use crate::cli::output;
use crate::config::HarvestConfig;
use crate::harvest::plan::{build_plan, resolve_dates, PlanFilter};
use crate::model::HarvestTask;
use crate::store::{open_store, ProductivityStore};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Args;

/// Which entities and dates to harvest.
#[derive(Args, Debug, Clone, Default)]
pub struct PlanArgs {
    /// Single date to harvest (YYYY-MM-DD); defaults to yesterday
    #[arg(long, conflicts_with_all = ["from", "to"])]
    pub date: Option<NaiveDate>,
    /// First date of an inclusive range
    #[arg(long)]
    pub from: Option<NaiveDate>,
    /// Last date of an inclusive range
    #[arg(long, requires = "from")]
    pub to: Option<NaiveDate>,
    /// Restrict to these entity ids (repeatable)
    #[arg(long = "entity")]
    pub entities: Vec<String>,
    /// Only entities with an access record on the date
    #[arg(long)]
    pub only_accessed: bool,
}

impl PlanArgs {
    pub fn filter(&self) -> PlanFilter {
        PlanFilter {
            entity_ids: self.entities.clone(),
            only_accessed: self.only_accessed,
        }
    }

    pub async fn tasks(&self, store: &dyn ProductivityStore) -> Result<Vec<HarvestTask>> {
        let dates = resolve_dates(self.date, self.from, self.to)?;
        let tasks = build_plan(store, &dates, &self.filter())
            .await
            .context("enumerating entities")?;
        Ok(tasks)
    }
}

pub async fn run(args: &PlanArgs) -> Result<()> {
    let config = HarvestConfig::from_env().context("loading configuration")?;
    let store = open_store(&config)?;
    let tasks = args.tasks(store.as_ref()).await?;

    if output::is_json() {
        output::print_json(&tasks);
        return Ok(());
    }
    for task in &tasks {
        println!(
            "{}  {:<10}  {}",
            task.date, task.entity.entity_id, task.entity.name
        );
    }
    if !output::is_quiet() {
        println!();
        println!("{} task(s)", tasks.len());
    }
    Ok(())
}
