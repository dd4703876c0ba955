//! Progress notifications observed through a live subscriber

mod support;

use askdb_pipeline::{
    BroadcastSink, FanoutSink, Orchestrator, Phase, ProgressEvent, ProgressSink, SessionEvent,
    SinkError,
};
use askdb_state::StageName;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use support::Scripted;
use tokio::sync::broadcast;

/// Receive until the terminal stage reports completion or an error
async fn collect_run(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for progress")
            .expect("broadcast closed");
        let terminal = matches!(
            received.event.stage,
            StageName::Interpret | StageName::HandleError
        ) && matches!(received.event.phase, Phase::Completed | Phase::Error);
        events.push(received);
        if terminal {
            return events;
        }
    }
}

fn starts(events: &[SessionEvent]) -> Vec<StageName> {
    events
        .iter()
        .filter(|e| e.event.phase == Phase::Starting)
        .map(|e| e.event.stage)
        .collect()
}

#[tokio::test]
async fn test_events_follow_stage_order() {
    let broadcast = BroadcastSink::new(64);
    let mut rx = broadcast.subscribe();
    let (_, collaborators) = Scripted::answering(90.0).into_collaborators();
    let orchestrator = Orchestrator::new(collaborators)
        .unwrap()
        .with_progress_sink(Arc::new(broadcast));

    let state = orchestrator.run("count rows in orders", Some("s-42")).await;
    assert!(state.final_response.is_some());

    let events = collect_run(&mut rx).await;
    assert!(events.iter().all(|e| e.session_id == "s-42"));
    assert_eq!(
        starts(&events),
        vec![
            StageName::SchemaLoad,
            StageName::Translate,
            StageName::Validate,
            StageName::Execute,
            StageName::Interpret,
        ]
    );

    // Each stage's events are contiguous: starting first, completed last
    let mut current: Option<StageName> = None;
    for e in &events {
        match e.event.phase {
            Phase::Starting => current = Some(e.event.stage),
            _ => assert_eq!(current, Some(e.event.stage), "event out of order: {:?}", e),
        }
    }

    let completed = events
        .iter()
        .find(|e| e.event.stage == StageName::Execute && e.event.phase == Phase::Completed)
        .unwrap();
    let payload = completed.event.payload.as_ref().unwrap();
    assert_eq!(payload["rowCount"], 1);
    assert_eq!(payload["success"], true);
}

#[tokio::test]
async fn test_failure_is_reported_with_error_phase() {
    let broadcast = BroadcastSink::new(64);
    let mut rx = broadcast.subscribe();
    let mut scripted = Scripted::answering(90.0);
    scripted.translation = None;
    let (_, collaborators) = scripted.into_collaborators();
    let orchestrator = Orchestrator::new(collaborators)
        .unwrap()
        .with_progress_sink(Arc::new(broadcast));

    orchestrator.run("count rows in orders", Some("s-err")).await;

    let events = collect_run(&mut rx).await;
    let translate_error = events
        .iter()
        .find(|e| e.event.stage == StageName::Translate && e.event.phase == Phase::Error)
        .expect("translate error event");
    assert!(translate_error.event.message.starts_with("Translate failed"));
    assert_eq!(
        starts(&events),
        vec![StageName::SchemaLoad, StageName::Translate, StageName::HandleError]
    );
    assert_eq!(events.last().unwrap().event.phase, Phase::Error);
}

#[tokio::test]
async fn test_flushed_delivery_has_every_event() {
    let broadcast = BroadcastSink::new(64);
    let mut rx = broadcast.subscribe();
    let (_, collaborators) = Scripted::answering(90.0).into_collaborators();
    let orchestrator = Orchestrator::new(collaborators)
        .unwrap()
        .with_progress_sink(Arc::new(broadcast));

    let (state, delivery) = orchestrator
        .run_tracked("count rows in orders", Some("s-flush"))
        .await;
    assert!(state.final_response.is_some());
    delivery.flushed().await;

    // Nothing left in flight: the whole run is already buffered
    let mut events = Vec::new();
    while let Ok(received) = rx.try_recv() {
        events.push(received);
    }
    assert_eq!(starts(&events).len(), 5);
    let last = &events.last().unwrap().event;
    assert_eq!((last.stage, last.phase), (StageName::Interpret, Phase::Completed));
}

#[test]
fn test_run_outside_tokio_runtime_answers_without_events() {
    let broadcast = BroadcastSink::new(64);
    let mut rx = broadcast.subscribe();
    let (_, collaborators) = Scripted::answering(90.0).into_collaborators();
    let orchestrator = Orchestrator::new(collaborators)
        .unwrap()
        .with_progress_sink(Arc::new(broadcast));

    let state = futures::executor::block_on(orchestrator.run("count rows in orders", Some("s-9")));

    assert_eq!(
        state.final_response.as_ref().map(|r| r.summary.as_str()),
        Some("There are 5 orders.")
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_no_session_means_no_events() {
    let broadcast = BroadcastSink::new(64);
    let mut rx = broadcast.subscribe();
    let (_, collaborators) = Scripted::answering(90.0).into_collaborators();
    let orchestrator = Orchestrator::new(collaborators)
        .unwrap()
        .with_progress_sink(Arc::new(broadcast));

    let state = orchestrator.run("count rows in orders", None).await;
    assert!(state.final_response.is_some());

    let received = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(received.is_err(), "unexpected event: {:?}", received);
}

struct FailingSink;

#[async_trait]
impl ProgressSink for FailingSink {
    async fn notify(&self, _session_id: &str, _event: ProgressEvent) -> Result<(), SinkError> {
        Err(SinkError::Closed)
    }
}

struct PanickingSink;

#[async_trait]
impl ProgressSink for PanickingSink {
    async fn notify(&self, _session_id: &str, event: ProgressEvent) -> Result<(), SinkError> {
        if event.stage == StageName::Validate {
            panic!("observer crashed");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_broken_sinks_do_not_change_the_run() {
    let (_, collaborators) = Scripted::answering(90.0).into_collaborators();
    let baseline = Orchestrator::new(collaborators.clone())
        .unwrap()
        .run("count rows in orders", Some("s-1"))
        .await;

    for sink in [
        Arc::new(FailingSink) as Arc<dyn ProgressSink>,
        Arc::new(PanickingSink) as Arc<dyn ProgressSink>,
    ] {
        let state = Orchestrator::new(collaborators.clone())
            .unwrap()
            .with_progress_sink(sink)
            .run("count rows in orders", Some("s-1"))
            .await;
        assert_eq!(state, baseline);
    }
}

#[tokio::test]
async fn test_panicking_sink_does_not_starve_later_events() {
    let broadcast = BroadcastSink::new(64);
    let mut rx = broadcast.subscribe();
    let fanout = FanoutSink::new()
        .with(Arc::new(broadcast))
        .with(Arc::new(PanickingSink));

    let (_, collaborators) = Scripted::answering(90.0).into_collaborators();
    let orchestrator = Orchestrator::new(collaborators)
        .unwrap()
        .with_progress_sink(Arc::new(fanout));

    orchestrator.run("count rows in orders", Some("s-7")).await;

    let events = collect_run(&mut rx).await;
    assert_eq!(events.last().unwrap().event.stage, StageName::Interpret);
}
