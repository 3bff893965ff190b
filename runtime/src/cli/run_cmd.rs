//! `harvest run`: the full pipeline against the real browser and store.

use crate::cli::output;
use crate::cli::plan_cmd::PlanArgs;
use crate::clock::TokioClock;
use crate::config::{HarvestConfig, NotFoundPolicy};
use crate::diagnostics::{RunLedger, ScreenshotArchive};
use crate::events::EventBus;
use crate::harvest::resources::{existing_ancestor, SystemProbe};
use crate::harvest::Harvester;
use crate::maintenance::{self, MaintenanceConfig};
use crate::model::WindowPlan;
use crate::renderer::chromium::ChromiumRenderer;
use crate::renderer::Renderer;
use crate::shutdown::ShutdownSignal;
use crate::store::{open_store, MemoryStore, ProductivityStore, ReconciliationSink};
use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[command(flatten)]
    pub plan: PlanArgs,
    /// Window plan: single, split, or OFFSET:counter,...;OFFSET:counter,...
    #[arg(long)]
    pub window_plan: Option<String>,
    /// What to do when an entity has no row: fail or empty
    #[arg(long)]
    pub not_found_policy: Option<String>,
    /// Show the browser window
    #[arg(long)]
    pub headed: bool,
    /// Drive the browser but keep results in memory
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut HarvestConfig) -> Result<()> {
        if let Some(plan) = &self.window_plan {
            config.window_plan = plan.parse::<WindowPlan>().context("--window-plan")?;
        }
        if let Some(policy) = &self.not_found_policy {
            config.not_found_policy = policy
                .parse::<NotFoundPolicy>()
                .context("--not-found-policy")?;
        }
        if self.headed {
            config.headless = false;
        }
        Ok(())
    }
}

pub async fn run(args: &RunArgs) -> Result<()> {
    let mut config = HarvestConfig::from_env().context("loading configuration")?;
    args.apply(&mut config)?;
    config.validate()?;

    // Setup failures abort before any browser work.
    let store = open_store(&config)?;
    store.ping().await.context("store is unreachable")?;
    let renderer = ChromiumRenderer::new(&config)?;
    renderer.preflight().await?;
    info!("browser: {}", renderer.executable().display());

    let tasks = args.plan.tasks(store.as_ref()).await?;
    if tasks.is_empty() {
        if !output::is_quiet() {
            println!("Nothing to harvest.");
        }
        return Ok(());
    }

    let sink_store: Arc<dyn ProductivityStore> = if args.dry_run {
        info!("dry run: results stay in memory");
        Arc::new(MemoryStore::new())
    } else {
        store.clone()
    };

    let archive =
        ScreenshotArchive::new(config.screenshot_dir.clone(), config.screenshot_retention);
    maintenance::run_retention(&archive);

    let shutdown = ShutdownSignal::new();
    let interrupt = shutdown.install_ctrl_c();
    let janitor = maintenance::spawn(archive, MaintenanceConfig::from_env(), shutdown.clone());

    let probe = SystemProbe::new(existing_ancestor(&config.state_dir));
    let ledger_path = config.ledger_path();
    let mut harvester = Harvester::new(
        config,
        Arc::new(renderer),
        ReconciliationSink::new(sink_store),
        Arc::new(TokioClock),
        Arc::new(EventBus::default()),
    )
    .with_probe(Arc::new(probe))
    .with_shutdown(shutdown.clone());
    match RunLedger::open(&ledger_path) {
        Ok(ledger) => harvester = harvester.with_ledger(ledger),
        Err(e) => warn!("run ledger disabled: {e}"),
    }

    let summary = harvester.run(&tasks).await;

    // Stops the maintenance loop.
    shutdown.trigger();
    interrupt.abort();
    if let Err(e) = janitor.await {
        warn!("maintenance loop ended abnormally: {e}");
    }

    if output::is_json() {
        output::print_json(&summary);
    } else if !output::is_quiet() || summary.failed > 0 {
        println!("{summary}");
    }
    Ok(())
}
