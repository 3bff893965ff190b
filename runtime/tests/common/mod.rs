//! Scripted browser for orchestrator tests.
//!
//! `ScriptedRenderer` hands out contexts that share one `World`: the form
//! values typed so far, a journal of every call, failure scripts and a
//! report function that renders the result table for the submitted query.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use harvest_runtime::config::{FormLayout, HarvestConfig};
use harvest_runtime::error::{HarvestError, Result};
use harvest_runtime::model::Entity;
use harvest_runtime::renderer::{ClearMode, Identity, Locator, RenderContext, Renderer};
use harvest_runtime::shutdown::ShutdownSignal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Launch(String),
    Navigate,
    Reload,
    Probe,
    DismissDialog,
    Type(String, String),
    Click(String),
    EnterFrame,
    ExitFrame,
    ClearState,
    Screenshot,
    Shutdown,
}

/// Scripted outcome of one navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Timeout,
    Connection,
}

impl Fault {
    fn error(self) -> HarvestError {
        match self {
            Self::Timeout => HarvestError::Timeout("navigation".into()),
            Self::Connection => HarvestError::Connection("socket closed".into()),
        }
    }
}

/// The parameters of one submitted report query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub entity_id: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

pub type ReportFn = Box<dyn Fn(&Query) -> Vec<Vec<String>> + Send + Sync>;

pub struct World {
    pub layout: FormLayout,
    pub journal: Vec<Call>,
    pub fields: HashMap<String, String>,
    pub missing: HashSet<String>,
    pub navigate_faults: VecDeque<Fault>,
    pub launch_failures: u32,
    pub probe_fails: bool,
    /// Render the result table inside an iframe instead of the document.
    pub framed: bool,
    pub in_frame: bool,
    pub rendered: Option<String>,
    pub report: ReportFn,
    pub queries: Vec<Query>,
    /// Trigger this signal when the given entity is submitted.
    pub interrupt_on: Option<(String, ShutdownSignal)>,
    /// Trigger this signal while the next launch is still in flight.
    pub interrupt_on_launch: Option<ShutdownSignal>,
    /// Reading the document fails while inside the report frame.
    pub frame_fault: bool,
    /// Scopes passed to `reap_orphans`.
    pub reaps: Vec<PathBuf>,
    pub live_contexts: usize,
}

#[derive(Clone)]
pub struct ScriptedRenderer {
    pub world: Arc<Mutex<World>>,
}

impl ScriptedRenderer {
    pub fn new(report: ReportFn) -> Self {
        Self {
            world: Arc::new(Mutex::new(World {
                layout: FormLayout::default(),
                journal: Vec::new(),
                fields: HashMap::new(),
                missing: HashSet::new(),
                navigate_faults: VecDeque::new(),
                launch_failures: 0,
                probe_fails: false,
                framed: false,
                in_frame: false,
                rendered: None,
                report,
                queries: Vec::new(),
                interrupt_on: None,
                interrupt_on_launch: None,
                frame_fault: false,
                reaps: Vec::new(),
                live_contexts: 0,
            })),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        f(&mut self.world.lock().unwrap())
    }

    pub fn journal(&self) -> Vec<Call> {
        self.with(|w| w.journal.clone())
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.with(|w| w.journal.iter().filter(|c| pred(c)).count())
    }

    pub fn launches(&self) -> usize {
        self.count(|c| matches!(c, Call::Launch(_)))
    }

    pub fn queries(&self) -> Vec<Query> {
        self.with(|w| w.queries.clone())
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn launch(&self, identity: &Identity) -> Result<Box<dyn RenderContext>> {
        let interrupt = {
            let mut w = self.world.lock().unwrap();
            if w.launch_failures > 0 {
                w.launch_failures -= 1;
                return Err(HarvestError::Launch("scripted launch failure".into()));
            }
            w.interrupt_on_launch.take()
        };
        if let Some(signal) = interrupt {
            signal.trigger();
            tokio::task::yield_now().await;
        }
        let mut w = self.world.lock().unwrap();
        w.journal.push(Call::Launch(identity.user_agent.clone()));
        w.live_contexts += 1;
        Ok(Box::new(ScriptedContext {
            world: self.world.clone(),
        }))
    }

    async fn reap_orphans(&self, scope: &Path) -> usize {
        self.with(|w| w.reaps.push(scope.to_path_buf()));
        0
    }
}

pub struct ScriptedContext {
    world: Arc<Mutex<World>>,
}

impl ScriptedContext {
    fn world(&self) -> std::sync::MutexGuard<'_, World> {
        self.world.lock().unwrap()
    }
}

fn parse_date(text: &str, format: &str) -> NaiveDate {
    NaiveDate::parse_from_str(text, format).unwrap_or_default()
}

fn render_table(rows: &[Vec<String>]) -> String {
    let mut html = String::from("<table><tr><th>CÓD.</th><th>NOME</th></tr>");
    for row in rows {
        html.push_str("<tr>");
        for cell in row {
            html.push_str(&format!("<td>{cell}</td>"));
        }
        html.push_str("</tr>");
    }
    html.push_str("</table>");
    html
}

#[async_trait]
impl RenderContext for ScriptedContext {
    async fn navigate(&mut self, _url: &str, _timeout: Duration) -> Result<()> {
        let mut w = self.world();
        w.journal.push(Call::Navigate);
        w.rendered = None;
        w.in_frame = false;
        match w.navigate_faults.pop_front() {
            Some(fault) => Err(fault.error()),
            None => Ok(()),
        }
    }

    async fn reload(&mut self, _timeout: Duration) -> Result<()> {
        self.world().journal.push(Call::Reload);
        Ok(())
    }

    async fn probe(&mut self) -> Result<()> {
        let mut w = self.world();
        w.journal.push(Call::Probe);
        if w.probe_fails {
            return Err(HarvestError::Connection("browser gone".into()));
        }
        Ok(())
    }

    async fn dismiss_dialog(&mut self) -> Result<bool> {
        self.world().journal.push(Call::DismissDialog);
        Ok(false)
    }

    async fn is_present(&mut self, locator: &Locator) -> Result<bool> {
        Ok(!self.world().missing.contains(locator.expression()))
    }

    async fn clear(&mut self, locator: &Locator, _mode: ClearMode) -> Result<()> {
        self.world()
            .fields
            .insert(locator.expression().to_string(), String::new());
        Ok(())
    }

    async fn type_text(&mut self, locator: &Locator, text: &str) -> Result<()> {
        let mut w = self.world();
        w.journal
            .push(Call::Type(locator.expression().to_string(), text.to_string()));
        w.fields
            .entry(locator.expression().to_string())
            .or_default()
            .push_str(text);
        Ok(())
    }

    async fn click(&mut self, locator: &Locator) -> Result<()> {
        let mut w = self.world();
        w.journal.push(Call::Click(locator.expression().to_string()));
        let query = {
            let world: &World = &w;
            let field = |xpath: &str| world.fields.get(xpath).cloned().unwrap_or_default();
            let format = &world.layout.date_format;
            Query {
                entity_id: field(&world.layout.entity_input),
                start: parse_date(&field(&world.layout.start_input), format),
                end: parse_date(&field(&world.layout.end_input), format),
            }
        };
        let rows = (w.report)(&query);
        w.rendered = Some(render_table(&rows));
        if let Some((entity, signal)) = &w.interrupt_on {
            if *entity == query.entity_id {
                signal.trigger();
            }
        }
        w.queries.push(query);
        Ok(())
    }

    async fn document_html(&mut self) -> Result<String> {
        let w = self.world();
        if w.in_frame && w.frame_fault {
            return Err(HarvestError::Connection("frame detached".into()));
        }
        let table = w.rendered.clone().unwrap_or_default();
        let html = match (w.framed, w.in_frame) {
            (false, _) | (true, true) => format!("<html><body>{table}</body></html>"),
            (true, false) => {
                "<html><body><iframe id='ReportViewerFrame'></iframe></body></html>".to_string()
            }
        };
        Ok(html)
    }

    async fn enter_frame(&mut self, marker: &str) -> Result<bool> {
        let mut w = self.world();
        w.journal.push(Call::EnterFrame);
        if w.framed && "ReportViewerFrame".contains(marker) {
            w.in_frame = true;
            return Ok(true);
        }
        Ok(false)
    }

    async fn exit_frame(&mut self) -> Result<()> {
        let mut w = self.world();
        w.journal.push(Call::ExitFrame);
        w.in_frame = false;
        Ok(())
    }

    async fn clear_state(&mut self) -> Result<()> {
        self.world().journal.push(Call::ClearState);
        Ok(())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        self.world().journal.push(Call::Screenshot);
        Ok(b"\x89PNG".to_vec())
    }

    async fn shutdown(self: Box<Self>) -> Result<()> {
        let mut w = self.world();
        w.journal.push(Call::Shutdown);
        w.live_contexts = w.live_contexts.saturating_sub(1);
        Ok(())
    }
}

/// A full report row: key, name, category, affiliation, then 13 counters.
pub fn row(entity_id: &str, name: &str, counters: [u64; 13]) -> Vec<String> {
    let mut cells = vec![
        entity_id.to_string(),
        name.to_string(),
        "CLINICA MEDICA".to_string(),
        "PJ".to_string(),
    ];
    cells.extend(counters.iter().map(|c| c.to_string()));
    cells
}

pub fn entity(id: &str, name: &str) -> Entity {
    Entity {
        cpf: Some(format!("cpf-{id}")),
        specialty: Some("CLINICA MEDICA".into()),
        ..Entity::new(id, name)
    }
}

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
}

/// Defaults with every delay zeroed and state kept under `state_dir`.
pub fn test_config(state_dir: &Path) -> HarvestConfig {
    let mut config = HarvestConfig {
        state_dir: state_dir.to_path_buf(),
        screenshot_dir: state_dir.join("screenshots"),
        ..HarvestConfig::default()
    }
    .without_delays();
    config.backoff.initial = Duration::from_secs(1);
    config.backoff.cap = Duration::from_secs(8);
    config.cooldown = Duration::from_secs(60);
    config.element_wait = Duration::from_secs(5);
    config.poll_interval = Duration::from_millis(500);
    config
}
