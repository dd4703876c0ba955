//! Prometheus metrics fed by pipeline progress events

use askdb_pipeline::{Phase, ProgressEvent, ProgressSink, SinkError};
use askdb_state::StageName;
use async_trait::async_trait;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::Mutex;
use chrono::{DateTime, Utc};

/// Counts stage events and times each stage from `starting` to its outcome
///
/// Durations come from the event timestamps, not from when events arrive.
pub struct MetricsSink {
    registry: Registry,
    events: IntCounterVec,
    durations: HistogramVec,
    started: Mutex<HashMap<(String, StageName), DateTime<Utc>>>,
}

impl MetricsSink {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let events = IntCounterVec::new(
            Opts::new("askdb_stage_events_total", "Pipeline progress events by stage and phase"),
            &["stage", "phase"],
        )?;
        let durations = HistogramVec::new(
            HistogramOpts::new("askdb_stage_duration_seconds", "Wall-clock time spent per stage")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["stage"],
        )?;

        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(durations.clone()))?;

        Ok(Self {
            registry,
            events,
            durations,
            started: Mutex::new(HashMap::new()),
        })
    }

    /// Text exposition format of every registered metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    fn phase_label(phase: Phase) -> &'static str {
        match phase {
            Phase::Starting => "starting",
            Phase::Processing => "processing",
            Phase::Completed => "completed",
            Phase::Error => "error",
        }
    }
}

#[async_trait]
impl ProgressSink for MetricsSink {
    async fn notify(&self, session_id: &str, event: ProgressEvent) -> Result<(), SinkError> {
        self.events
            .with_label_values(&[event.stage.as_str(), Self::phase_label(event.phase)])
            .inc();

        let key = (session_id.to_string(), event.stage);
        let mut started = self
            .started
            .lock()
            .map_err(|_| SinkError::Delivery("metrics state poisoned".to_string()))?;

        match event.phase {
            Phase::Starting => {
                started.insert(key, event.timestamp);
            }
            Phase::Completed | Phase::Error => {
                if let Some(at) = started.remove(&key) {
                    let elapsed = (event.timestamp - at).to_std().unwrap_or_default();
                    self.durations
                        .with_label_values(&[event.stage.as_str()])
                        .observe(elapsed.as_secs_f64());
                }
            }
            Phase::Processing => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_counted_and_timed() {
        let sink = MetricsSink::new().unwrap();

        for phase in [Phase::Starting, Phase::Processing, Phase::Completed] {
            sink.notify("s-1", ProgressEvent::new(StageName::Execute, phase, "x"))
                .await
                .unwrap();
        }
        sink.notify("s-1", ProgressEvent::new(StageName::Translate, Phase::Error, "x"))
            .await
            .unwrap();

        assert_eq!(
            sink.events.with_label_values(&["Execute", "completed"]).get(),
            1
        );
        assert_eq!(sink.events.with_label_values(&["Translate", "error"]).get(), 1);
        assert_eq!(
            sink.durations.with_label_values(&["Execute"]).get_sample_count(),
            1
        );
        // An error without a matching start is counted but not timed
        assert_eq!(
            sink.durations.with_label_values(&["Translate"]).get_sample_count(),
            0
        );

        let text = sink.render();
        assert!(text.contains("askdb_stage_events_total"));
        assert!(text.contains("askdb_stage_duration_seconds"));
    }

    #[tokio::test]
    async fn test_duration_is_measured_between_event_timestamps() {
        let sink = MetricsSink::new().unwrap();
        let started = Utc::now() - chrono::Duration::seconds(10);

        let mut starting = ProgressEvent::new(StageName::Interpret, Phase::Starting, "go");
        starting.timestamp = started;
        let mut completed = ProgressEvent::new(StageName::Interpret, Phase::Completed, "done");
        completed.timestamp = started + chrono::Duration::milliseconds(1500);

        // Delivered late and back to back; the recorded time is still 1.5s
        sink.notify("s-1", starting).await.unwrap();
        sink.notify("s-1", completed).await.unwrap();

        let histogram = sink.durations.with_label_values(&["Interpret"]);
        assert_eq!(histogram.get_sample_count(), 1);
        assert!((histogram.get_sample_sum() - 1.5).abs() < 1e-9);
    }
}
