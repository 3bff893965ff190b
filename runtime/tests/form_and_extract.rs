//! Form protocol and extractor against the scripted browser.

mod common;

use common::{day, entity, row, test_config, Call, Query, ScriptedRenderer};
use harvest_runtime::clock::SimulatedClock;
use harvest_runtime::config::{FormLayout, HarvestConfig};
use harvest_runtime::error::HarvestError;
use harvest_runtime::events::{drain, EventBus, HarvestEvent};
use harvest_runtime::harvest::extract::extract;
use harvest_runtime::harvest::{Extraction, FormProtocol};
use harvest_runtime::model::{Counter, FormField, HarvestTask, WindowPlan, WorkItem};
use harvest_runtime::renderer::{Identity, RenderContext, Renderer};
use std::sync::Arc;
use std::time::Duration;

struct Bench {
    renderer: ScriptedRenderer,
    context: Box<dyn RenderContext>,
    form: FormProtocol,
    clock: SimulatedClock,
    bus: Arc<EventBus>,
    config: HarvestConfig,
    _dir: tempfile::TempDir,
}

async fn bench(report: common::ReportFn) -> Bench {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let renderer = ScriptedRenderer::new(report);
    let context = renderer
        .launch(&Identity {
            user_agent: "test-agent".into(),
            viewport: (1280, 720),
            profile_dir: dir.path().join("profile"),
        })
        .await
        .unwrap();
    let clock = SimulatedClock::new();
    let bus = Arc::new(EventBus::new(64));
    let form = FormProtocol::new(&config, Arc::new(clock.clone()), bus.clone());
    Bench {
        renderer,
        context,
        form,
        clock,
        bus,
        config,
        _dir: dir,
    }
}

fn item(id: &str, d: u32) -> WorkItem {
    HarvestTask::new(entity(id, "DR X"), day(d)).work_item(&WindowPlan::single().windows()[0])
}

fn one_row(id: &'static str) -> common::ReportFn {
    Box::new(move |_q: &Query| vec![row(id, "DR X", [2; 13])])
}

#[tokio::test]
async fn fills_entity_and_dates_in_report_format() {
    let mut b = bench(one_row("4411")).await;
    let mut events = b.bus.subscribe();

    b.form
        .submit(b.context.as_mut(), &item("4411", 7), 1)
        .await
        .unwrap();

    let layout = FormLayout::default();
    let typed: Vec<Call> = b
        .renderer
        .journal()
        .into_iter()
        .filter(|c| matches!(c, Call::Type(..)))
        .collect();
    assert_eq!(
        typed,
        vec![
            Call::Type(layout.entity_input.clone(), "4411".into()),
            Call::Type(layout.start_input.clone(), "03.07.2025".into()),
            Call::Type(layout.end_input.clone(), "03.07.2025".into()),
        ]
    );
    assert_eq!(
        b.renderer.queries(),
        vec![Query {
            entity_id: "4411".into(),
            start: day(7),
            end: day(7),
        }]
    );
    let submitted = drain(&mut events);
    assert!(matches!(
        submitted.as_slice(),
        [HarvestEvent::FormSubmitted { attempt: 1, .. }]
    ));
}

#[tokio::test]
async fn missing_period_input_fails_after_the_wait_with_a_screenshot() {
    let mut b = bench(one_row("4411")).await;
    let start = b.config.form.start_input.clone();
    b.renderer.with(|w| w.missing.insert(start));

    let err = b
        .form
        .submit(b.context.as_mut(), &item("4411", 7), 1)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HarvestError::FormFieldNotFound(FormField::PeriodStart)
    ));
    // Polled every 500ms for the 5s element wait.
    let polls = b
        .clock
        .sleeps()
        .iter()
        .filter(|d| **d == Duration::from_millis(500))
        .count();
    assert_eq!(polls, 10);
    assert_eq!(b.renderer.count(|c| *c == Call::Screenshot), 1);
    let shots: Vec<_> = std::fs::read_dir(&b.config.screenshot_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(shots.len(), 1);
    let name = shots[0].file_name().to_string_lossy().into_owned();
    assert!(name.starts_with("form_element_not_found_4411_"), "{name}");
    assert!(b.renderer.queries().is_empty());
}

#[tokio::test]
async fn submit_falls_back_to_the_generic_control() {
    let mut b = bench(one_row("4411")).await;
    let layout = b.config.form.clone();
    b.renderer.with(|w| {
        w.missing.insert(layout.submit_structural.clone());
        w.missing.insert(layout.submit_text.clone());
    });

    b.form
        .submit(b.context.as_mut(), &item("4411", 7), 1)
        .await
        .unwrap();

    let clicks: Vec<Call> = b
        .renderer
        .journal()
        .into_iter()
        .filter(|c| matches!(c, Call::Click(_)))
        .collect();
    assert_eq!(clicks, vec![Call::Click(layout.submit_generic)]);
}

#[tokio::test]
async fn no_submit_control_is_an_element_failure() {
    let mut b = bench(one_row("4411")).await;
    let layout = b.config.form.clone();
    b.renderer.with(|w| {
        w.missing.insert(layout.submit_structural.clone());
        w.missing.insert(layout.submit_text.clone());
        w.missing.insert(layout.submit_generic.clone());
    });

    let err = b
        .form
        .submit(b.context.as_mut(), &item("4411", 7), 1)
        .await
        .unwrap_err();

    assert!(matches!(err, HarvestError::SubmitControlNotFound));
    assert!(err.is_element_class());
    assert_eq!(b.renderer.count(|c| matches!(c, Call::Click(_))), 0);
}

#[tokio::test]
async fn extracts_from_the_main_document() {
    let mut b = bench(one_row("4411")).await;
    b.form
        .submit(b.context.as_mut(), &item("4411", 7), 1)
        .await
        .unwrap();

    let found = extract(b.context.as_mut(), "4411", &Counter::ALL, "Viewer")
        .await
        .unwrap();

    let Extraction::Found(record) = found else {
        panic!("expected a row");
    };
    assert_eq!(record.entity_id, "4411");
    assert_eq!(record.counter(Counter::Urgencia), 2);
    assert_eq!(b.renderer.count(|c| *c == Call::EnterFrame), 0);
}

#[tokio::test]
async fn falls_back_to_the_report_frame() {
    let mut b = bench(one_row("4411")).await;
    b.renderer.with(|w| w.framed = true);
    b.form
        .submit(b.context.as_mut(), &item("4411", 7), 1)
        .await
        .unwrap();

    let found = extract(b.context.as_mut(), "4411", &Counter::ALL, "Viewer")
        .await
        .unwrap();

    assert!(matches!(found, Extraction::Found(_)));
    assert_eq!(b.renderer.count(|c| *c == Call::EnterFrame), 1);
    assert_eq!(b.renderer.count(|c| *c == Call::ExitFrame), 1);
    assert!(!b.renderer.with(|w| w.in_frame));
}

#[tokio::test]
async fn absent_row_in_frame_is_not_found() {
    let mut b = bench(one_row("9999")).await;
    b.renderer.with(|w| w.framed = true);
    b.form
        .submit(b.context.as_mut(), &item("4411", 7), 1)
        .await
        .unwrap();

    let found = extract(b.context.as_mut(), "4411", &Counter::ALL, "Viewer")
        .await
        .unwrap();

    assert!(matches!(found, Extraction::NotFound));
    assert!(!b.renderer.with(|w| w.in_frame));
}

#[tokio::test]
async fn frame_error_still_restores_the_document() {
    let mut b = bench(one_row("4411")).await;
    b.renderer.with(|w| {
        w.framed = true;
        w.frame_fault = true;
    });
    b.form
        .submit(b.context.as_mut(), &item("4411", 7), 1)
        .await
        .unwrap();

    let err = extract(b.context.as_mut(), "4411", &Counter::ALL, "Viewer")
        .await
        .unwrap_err();

    assert!(matches!(err, HarvestError::Connection(_)));
    assert_eq!(b.renderer.count(|c| *c == Call::EnterFrame), 1);
    assert_eq!(b.renderer.count(|c| *c == Call::ExitFrame), 1);
    assert!(!b.renderer.with(|w| w.in_frame));
}
