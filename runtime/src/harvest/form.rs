//! Report form interaction.
//!
//! One submission loads the report page, clears any leftover native dialog,
//! fills the entity and period inputs, clicks submit and waits out a
//! randomized settle delay (the report gives no completion signal). Every
//! element wait is bounded; a missing input is `FormFieldNotFound`, a
//! missing submit control after all locator strategies is
//! `SubmitControlNotFound`.

use crate::clock::{Clock, DelayBand};
use crate::config::{FormLayout, HarvestConfig};
use crate::diagnostics::ScreenshotArchive;
use crate::error::{HarvestError, Result};
use crate::events::{EventBus, HarvestEvent};
use crate::model::{FormField, WorkItem};
use crate::renderer::{ClearMode, Locator, RenderContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct FormProtocol {
    layout: FormLayout,
    report_url: String,
    page_load_timeout: Duration,
    element_wait: Duration,
    poll_interval: Duration,
    post_navigate_delay: DelayBand,
    field_delay: DelayBand,
    settle_delay: DelayBand,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    screenshots: ScreenshotArchive,
}

impl FormProtocol {
    pub fn new(config: &HarvestConfig, clock: Arc<dyn Clock>, events: Arc<EventBus>) -> Self {
        Self {
            layout: config.form.clone(),
            report_url: config.report_url.clone(),
            page_load_timeout: config.page_load_timeout,
            element_wait: config.element_wait,
            poll_interval: config.poll_interval,
            post_navigate_delay: config.post_navigate_delay,
            field_delay: config.field_delay,
            settle_delay: config.settle_delay,
            clock,
            events,
            screenshots: ScreenshotArchive::new(
                config.screenshot_dir.clone(),
                config.screenshot_retention,
            ),
        }
    }

    pub fn layout(&self) -> &FormLayout {
        &self.layout
    }

    /// Submit one query. On failure a screenshot is attempted before the
    /// error is returned.
    pub async fn submit(
        &self,
        context: &mut dyn RenderContext,
        item: &WorkItem,
        attempt: u32,
    ) -> Result<()> {
        let result = self.fill_and_submit(context, item, attempt).await;
        if let Err(err) = &result {
            warn!(
                "form submission for {} ({} → {}) failed: {err}",
                item.entity_id, item.period_start, item.period_end
            );
            let reason = format!("form_{}", err.kind());
            self.screenshots
                .capture(context, &reason, &item.entity_id, self.clock.now())
                .await;
        }
        result
    }

    async fn fill_and_submit(
        &self,
        context: &mut dyn RenderContext,
        item: &WorkItem,
        attempt: u32,
    ) -> Result<()> {
        context
            .navigate(&self.report_url, self.page_load_timeout)
            .await?;
        self.clock.sleep(self.post_navigate_delay.sample()).await;

        // 1. Leftover alert from a previous interaction.
        match context.dismiss_dialog().await {
            Ok(true) => debug!("dismissed leftover dialog"),
            Ok(false) => {}
            Err(e) => debug!("dialog check failed: {e}"),
        }

        // 2. Entity identifier.
        let entity_input = Locator::xpath(&self.layout.entity_input);
        self.wait_for_field(context, &entity_input, FormField::EntityId)
            .await?;
        context.clear(&entity_input, ClearMode::Plain).await?;
        context.type_text(&entity_input, &item.entity_id).await?;
        self.clock.sleep(self.field_delay.sample()).await;

        // 3-4. Period bounds. The date widget ignores a plain reset.
        let start = self.format_date(item.period_start);
        let end = self.format_date(item.period_end);
        for (field, xpath, value) in [
            (FormField::PeriodStart, &self.layout.start_input, &start),
            (FormField::PeriodEnd, &self.layout.end_input, &end),
        ] {
            let input = Locator::xpath(xpath);
            self.wait_for_field(context, &input, field).await?;
            context.clear(&input, ClearMode::SelectAllDelete).await?;
            context.type_text(&input, value).await?;
            self.clock.sleep(self.field_delay.sample()).await;
        }

        // 5. Submit control.
        let submit = self.locate_submit(context).await?;
        debug!("submit control located by {submit}");

        // 6. Click and let the report render.
        context.click(&submit).await?;
        info!(
            "submitted query for {} ({start} → {end}), attempt {attempt}",
            item.entity_id
        );
        self.events.emit(HarvestEvent::FormSubmitted {
            entity_id: item.entity_id.clone(),
            period_start: item.period_start.to_string(),
            period_end: item.period_end.to_string(),
            attempt,
        });
        self.clock.sleep(self.settle_delay.sample()).await;
        Ok(())
    }

    fn format_date(&self, date: chrono::NaiveDate) -> String {
        date.format(&self.layout.date_format).to_string()
    }

    fn submit_strategies(&self) -> [Locator; 3] {
        [
            Locator::xpath(&self.layout.submit_structural),
            Locator::xpath(&self.layout.submit_text),
            Locator::css(&self.layout.submit_generic),
        ]
    }

    /// Poll until `locator` matches or the element wait runs out.
    async fn wait_for_field(
        &self,
        context: &mut dyn RenderContext,
        locator: &Locator,
        field: FormField,
    ) -> Result<()> {
        let deadline = self.clock.now() + chrono_duration(self.element_wait);
        loop {
            if context.is_present(locator).await? {
                return Ok(());
            }
            if self.clock.now() >= deadline {
                return Err(HarvestError::FormFieldNotFound(field));
            }
            self.clock.sleep(self.poll_interval).await;
        }
    }

    /// Each poll round tries the strategies in order; the first one that
    /// matches wins.
    async fn locate_submit(&self, context: &mut dyn RenderContext) -> Result<Locator> {
        let strategies = self.submit_strategies();
        let deadline = self.clock.now() + chrono_duration(self.element_wait);
        loop {
            for locator in &strategies {
                if context.is_present(locator).await? {
                    return Ok(locator.clone());
                }
            }
            if self.clock.now() >= deadline {
                return Err(HarvestError::SubmitControlNotFound);
            }
            self.clock.sleep(self.poll_interval).await;
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}
