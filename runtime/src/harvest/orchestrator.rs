//! Resilience orchestrator: drives every task through session, form,
//! extractor and sink, and keeps the batch going when single tasks fail.
//!
//! Per task:
//!
//! 1. Open the circuit if too many tasks failed in a row (cooldown plus a
//!    forced rotation), rotate on the configured interval, wipe cookies.
//! 2. For each report window: submit and extract under the retry policy.
//! 3. Merge the windows, apply the not-found policy, upsert.
//! 4. Every few tasks, probe session health and host resource pressure.

use crate::clock::Clock;
use crate::config::{HarvestConfig, NotFoundPolicy};
use crate::diagnostics::{LedgerEntry, RunLedger, ScreenshotArchive};
use crate::error::{HarvestError, Result};
use crate::events::{EventBus, HarvestEvent, RotationReason};
use crate::harvest::extract::{extract, Extraction};
use crate::harvest::form::FormProtocol;
use crate::harvest::resources::{ResourceProbe, StaticProbe};
use crate::harvest::retry::{Recovery, RetryPolicy, RetryTarget};
use crate::harvest::state::{ItemState, ItemTracker, OrchestratorState, RunSummary};
use crate::model::{Counter, HarvestTask, ProductivityRecord, WorkItem};
use crate::renderer::Renderer;
use crate::session::SessionManager;
use crate::shutdown::ShutdownSignal;
use crate::store::{ReconciliationSink, UpsertOutcome};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One report window of one task, retried as a unit.
struct WindowAttempt<'a> {
    sessions: &'a mut SessionManager,
    form: &'a FormProtocol,
    events: &'a EventBus,
    tracker: &'a mut ItemTracker,
    item: &'a WorkItem,
    counters: &'a [Counter],
    frame_marker: &'a str,
    reload_timeout: Duration,
}

#[async_trait]
impl<'a> RetryTarget<Extraction> for WindowAttempt<'a> {
    async fn attempt(&mut self, attempt: u32) -> Result<Extraction> {
        let session = self.sessions.ensure().await?;
        let context = session.context();
        self.tracker.advance(ItemState::Submitting);
        self.form.submit(context, self.item, attempt).await?;
        self.tracker.advance(ItemState::Extracting);
        extract(context, &self.item.entity_id, self.counters, self.frame_marker).await
    }

    async fn recover(&mut self, recovery: Recovery, _attempt: u32) -> Result<()> {
        match recovery {
            Recovery::ReloadPage => {
                let Some(session) = self.sessions.current() else {
                    return Ok(());
                };
                let context = session.context();
                if let Ok(true) = context.dismiss_dialog().await {
                    debug!("dismissed dialog before reload");
                }
                context.reload(self.reload_timeout).await
            }
            Recovery::RotateSession => self.sessions.rotate(RotationReason::Retry).await,
            Recovery::Backoff | Recovery::Abort => Ok(()),
        }
    }

    fn on_failure(&mut self, err: &HarvestError, attempt: u32, recovery: Recovery) {
        self.events.emit(HarvestEvent::AttemptFailed {
            entity_id: self.item.entity_id.clone(),
            attempt,
            kind: err.kind(),
            recovery: recovery.as_str().to_string(),
        });
    }
}

/// Result of one task, before it is folded into the run state.
struct TaskReport {
    result: Result<UpsertOutcome>,
    attempts: u32,
}

pub struct Harvester {
    config: HarvestConfig,
    sessions: SessionManager,
    form: FormProtocol,
    retry: RetryPolicy,
    sink: ReconciliationSink,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    probe: Arc<dyn ResourceProbe>,
    ledger: Option<RunLedger>,
    shutdown: ShutdownSignal,
    screenshots: ScreenshotArchive,
    state: OrchestratorState,
    profile_scope: PathBuf,
}

impl Harvester {
    /// Sessions live under a run-private directory below the profile root,
    /// so concurrent harvesters never reap each other's browsers.
    pub fn new(
        config: HarvestConfig,
        renderer: Arc<dyn Renderer>,
        sink: ReconciliationSink,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        let scope = config
            .profile_root()
            .join(uuid::Uuid::new_v4().simple().to_string());
        let sessions = SessionManager::new(
            &config,
            scope.clone(),
            renderer,
            clock.clone(),
            events.clone(),
        );
        let form = FormProtocol::new(&config, clock.clone(), events.clone());
        let screenshots =
            ScreenshotArchive::new(config.screenshot_dir.clone(), config.screenshot_retention);
        Self {
            retry: RetryPolicy::new(&config.backoff),
            sessions,
            form,
            sink,
            clock,
            events,
            probe: Arc::new(StaticProbe::default()),
            ledger: None,
            shutdown: ShutdownSignal::new(),
            screenshots,
            state: OrchestratorState::default(),
            profile_scope: scope,
            config,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_ledger(mut self, ledger: RunLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Process `tasks` in order. Individual failures are counted, never
    /// raised; on cancellation the remaining tasks are abandoned. The live
    /// browser is torn down before this returns either way.
    pub async fn run(&mut self, tasks: &[HarvestTask]) -> RunSummary {
        let started = self.clock.now();
        self.state = OrchestratorState::default();
        self.state.summary.planned = tasks.len();
        self.events.emit(HarvestEvent::RunStarted {
            tasks: tasks.len(),
            timestamp: started.to_rfc3339(),
        });
        info!("harvest started: {} task(s)", tasks.len());

        let shutdown = self.shutdown.clone();
        for (index, task) in tasks.iter().enumerate() {
            let finished = if shutdown.is_triggered() {
                false
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => false,
                    _ = self.run_task(task) => true,
                }
            };
            if !finished {
                let abandoned = tasks.len() - index;
                warn!("run interrupted; abandoning {abandoned} task(s)");
                self.state.summary.abandoned = abandoned;
                self.state.summary.cancelled = true;
                break;
            }

            if index + 1 < tasks.len() {
                let pause = self.config.item_delay.sample();
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {}
                    _ = self.clock.sleep(pause) => {}
                }
            }
        }

        self.sessions.shutdown().await;
        self.sessions.reap_scope().await;
        // Only succeeds once every session directory is gone.
        let _ = std::fs::remove_dir(&self.profile_scope);

        let mut summary = self.state.summary.clone();
        summary.rotations = self.sessions.rotations();
        summary.elapsed_ms = elapsed_ms(self.clock.as_ref(), started);
        self.events.emit(HarvestEvent::RunFinished {
            succeeded: summary.succeeded,
            failed: summary.failed,
            elapsed_ms: summary.elapsed_ms,
        });
        info!(
            "harvest finished: {} succeeded, {} failed, {} abandoned",
            summary.succeeded, summary.failed, summary.abandoned
        );
        summary
    }

    async fn run_task(&mut self, task: &HarvestTask) {
        self.before_task().await;

        let started = self.clock.now();
        let mut tracker = ItemTracker::new();
        let report = self.harvest_task(task, &mut tracker).await;
        let elapsed = elapsed_ms(self.clock.as_ref(), started);
        let date = task.date.to_string();
        let entity_id = task.entity.entity_id.as_str();

        let mut entry;
        match &report.result {
            Ok(outcome) => {
                tracker.advance(ItemState::Done);
                info!(
                    "{entity_id} on {date}: {outcome} after {} attempt(s)",
                    report.attempts
                );
                self.state.record_success(outcome.as_str());
                self.events.emit(HarvestEvent::TaskCompleted {
                    entity_id: entity_id.to_string(),
                    date: date.clone(),
                    outcome: outcome.as_str().to_string(),
                });
                entry = LedgerEntry::now(entity_id, &date, outcome.as_str());
                if let Some(session) = self.sessions.current() {
                    session.completed += 1;
                }
            }
            Err(err) => {
                tracker.advance(ItemState::Failed);
                let kind = err.kind();
                error!(
                    entity = entity_id,
                    date = %date,
                    kind = %kind,
                    attempts = report.attempts,
                    states = ?tracker.history(),
                    "task failed: {err}"
                );
                if !matches!(err, HarvestError::NotFound { .. }) {
                    if let Some(session) = self.sessions.current() {
                        let reason = format!("failed_{kind}");
                        self.screenshots
                            .capture(session.context(), &reason, entity_id, self.clock.now())
                            .await;
                    }
                }
                self.state.record_failure(kind);
                self.events.emit(HarvestEvent::TaskFailed {
                    entity_id: entity_id.to_string(),
                    date: date.clone(),
                    kind,
                });
                entry = LedgerEntry::now(entity_id, &date, "failed");
                entry.kind = Some(kind);
                entry.error = Some(err.to_string());
            }
        }
        entry.attempts = report.attempts;
        entry.elapsed_ms = elapsed;
        if let Some(ledger) = self.ledger.as_mut() {
            if let Err(e) = ledger.record(&entry) {
                warn!("failed to append to run ledger: {e}");
            }
        }

        self.after_task().await;
    }

    /// Circuit breaker, interval rotation and state wipe.
    async fn before_task(&mut self) {
        let threshold = self.config.failure_threshold;
        if threshold > 0 && self.state.consecutive_failures >= threshold {
            let cooldown = self.config.cooldown;
            warn!(
                "{} consecutive failures; cooling down for {}s and rotating the session",
                self.state.consecutive_failures,
                cooldown.as_secs()
            );
            self.events.emit(HarvestEvent::CircuitOpened {
                consecutive_failures: self.state.consecutive_failures,
                cooldown_secs: cooldown.as_secs(),
            });
            self.clock.sleep(cooldown).await;
            if let Err(e) = self.sessions.rotate(RotationReason::CircuitBreaker).await {
                warn!("relaunch after cooldown failed: {e}");
            }
            self.state.consecutive_failures = 0;
            self.state.summary.circuit_trips += 1;
            self.state.since_clear = 0;
        }

        let interval = self.config.restart_interval;
        let due = self
            .sessions
            .current()
            .is_some_and(|s| interval > 0 && s.completed >= interval);
        if due {
            info!("session served {interval} task(s); rotating");
            if let Err(e) = self.sessions.rotate(RotationReason::Interval).await {
                warn!("interval rotation failed: {e}");
            }
            self.state.since_clear = 0;
        }

        let every = self.config.clear_state_every;
        if every > 0 && self.state.since_clear >= every {
            if let Err(e) = self.sessions.clear_current().await {
                warn!("failed to clear browser state: {e}");
            }
            self.state.since_clear = 0;
        }
    }

    /// Periodic session health and resource pressure check.
    async fn after_task(&mut self) {
        let interval = self.config.health_check_interval;
        if interval == 0 || self.state.since_health_check < interval {
            return;
        }
        self.state.since_health_check = 0;

        let healthy = if self.sessions.current().is_some() {
            self.sessions.check_current().await
        } else {
            true
        };
        let sample = self.probe.sample();
        let constrained =
            sample.constrained(self.config.memory_limit_pct, self.config.disk_limit_pct);
        self.events.emit(HarvestEvent::HealthChecked {
            healthy,
            memory_pct: sample.memory_used_pct,
            disk_pct: sample.disk_used_pct,
            constrained,
        });

        if !healthy {
            if let Err(e) = self.sessions.rotate(RotationReason::Unhealthy).await {
                warn!("replacing unhealthy session failed: {e}");
            }
            self.state.since_clear = 0;
        }
        if constrained {
            warn!(
                "host under pressure (memory {:?}%, disk {:?}%); pausing {}s",
                sample.memory_used_pct,
                sample.disk_used_pct,
                self.config.pressure_pause.as_secs()
            );
            self.state.summary.pressure_pauses += 1;
            self.clock.sleep(self.config.pressure_pause).await;
        }
    }

    async fn harvest_task(&mut self, task: &HarvestTask, tracker: &mut ItemTracker) -> TaskReport {
        let mut attempts = 0;
        let result = self.collect_and_persist(task, tracker, &mut attempts).await;
        TaskReport { result, attempts }
    }

    async fn collect_and_persist(
        &mut self,
        task: &HarvestTask,
        tracker: &mut ItemTracker,
        attempts: &mut u32,
    ) -> Result<UpsertOutcome> {
        let windows = self.config.window_plan.windows().to_vec();
        let mut merged: Option<ProductivityRecord> = None;

        for (i, window) in windows.iter().enumerate() {
            if i > 0 {
                self.clock.sleep(self.config.window_delay.sample()).await;
            }
            let item = task.work_item(window);
            let mut target = WindowAttempt {
                sessions: &mut self.sessions,
                form: &self.form,
                events: &self.events,
                tracker: &mut *tracker,
                item: &item,
                counters: &window.counters,
                frame_marker: &self.config.form.frame_marker,
                reload_timeout: self.config.page_load_timeout,
            };
            let outcome = self.retry.execute(self.clock.as_ref(), &mut target).await;
            *attempts += outcome.attempts();

            match outcome.into_result()? {
                Extraction::Found(record) => match merged.as_mut() {
                    Some(base) => base.absorb(&record, &window.counters),
                    None => {
                        let mut base = record;
                        for c in Counter::ALL {
                            base.counters.entry(c).or_insert(0);
                        }
                        merged = Some(base);
                    }
                },
                Extraction::NotFound => info!(
                    "{} has no row for {} → {}",
                    item.entity_id, item.period_start, item.period_end
                ),
            }
        }

        let record = match merged {
            Some(record) => record,
            None => match self.config.not_found_policy {
                NotFoundPolicy::Fail => {
                    return Err(HarvestError::NotFound {
                        entity_id: task.entity.entity_id.clone(),
                    })
                }
                NotFoundPolicy::Empty => {
                    info!(
                        "{} absent on {}; storing an empty record",
                        task.entity.entity_id, task.date
                    );
                    ProductivityRecord::empty_for(&task.entity)
                }
            },
        };

        tracker.advance(ItemState::Persisting);
        self.sink.upsert(&record, task.date).await
    }
}

fn elapsed_ms(clock: &dyn Clock, since: chrono::DateTime<chrono::Utc>) -> u64 {
    (clock.now() - since).num_milliseconds().max(0) as u64
}
