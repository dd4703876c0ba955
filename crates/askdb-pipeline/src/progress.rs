//! Progress events and sinks
//!
//! Observers see stage transitions through a `ProgressSink`. Delivery is a
//! side channel: the orchestrator enqueues events on a per-run channel and a
//! forwarder task hands them to the sink in order, so a slow, failing or
//! panicking sink never holds up or changes a run.

use askdb_state::StageName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub stage: StageName,
    pub phase: Phase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(stage: StageName, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            stage,
            phase,
            message: message.into(),
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("progress sink closed")]
    Closed,

    #[error("progress delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn notify(&self, session_id: &str, event: ProgressEvent) -> Result<(), SinkError>;
}

/// Completion of one run's event delivery
///
/// The forwarder exits once every `ProgressHandle` of the run is dropped and
/// the queue is drained.
#[derive(Debug, Default)]
pub struct ProgressDelivery {
    forwarder: Option<JoinHandle<()>>,
}

impl ProgressDelivery {
    pub fn none() -> Self {
        Self { forwarder: None }
    }

    pub fn is_pending(&self) -> bool {
        self.forwarder.as_ref().is_some_and(|f| !f.is_finished())
    }

    /// Wait until every queued event has been handed to the sink
    pub async fn flushed(self) {
        let Some(forwarder) = self.forwarder else {
            return;
        };
        if let Err(e) = forwarder.await {
            tracing::warn!(error = %e, "Progress forwarder stopped abnormally");
        }
    }
}

/// Cloneable emitter handed to stages; a no-op when the run has no session
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressHandle {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start the forwarder task that drains this run's events into `sink`
    ///
    /// Outside a Tokio runtime there is nothing to run the forwarder on, so
    /// the handle comes back disabled.
    pub fn spawn(sink: Arc<dyn ProgressSink>, session_id: String) -> (Self, ProgressDelivery) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(session_id = %session_id, "No Tokio runtime; progress events disabled");
            return (Self::disabled(), ProgressDelivery::none());
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();

        let forwarder = runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let stage = event.stage;
                let phase = event.phase;
                let delivery = AssertUnwindSafe(sink.notify(&session_id, event)).catch_unwind();

                match delivery.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(
                            session_id = %session_id,
                            stage = %stage,
                            phase = ?phase,
                            error = %e,
                            "Progress sink rejected event"
                        );
                    }
                    Err(_) => {
                        tracing::warn!(
                            session_id = %session_id,
                            stage = %stage,
                            phase = ?phase,
                            "Progress sink panicked; event dropped"
                        );
                    }
                }
            }
        });

        (
            Self { tx: Some(tx) },
            ProgressDelivery {
                forwarder: Some(forwarder),
            },
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueue without waiting; a closed forwarder is ignored
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn processing(
        &self,
        stage: StageName,
        message: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let mut event = ProgressEvent::new(stage, Phase::Processing, message);
        event.payload = payload;
        self.emit(event);
    }
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl ProgressSink for TracingSink {
    async fn notify(&self, session_id: &str, event: ProgressEvent) -> Result<(), SinkError> {
        match event.phase {
            Phase::Error => tracing::warn!(
                session_id = %session_id,
                stage = %event.stage,
                payload = ?event.payload,
                "{}",
                event.message
            ),
            phase => tracing::info!(
                session_id = %session_id,
                stage = %event.stage,
                phase = ?phase,
                "{}",
                event.message
            ),
        }
        Ok(())
    }
}

/// Event addressed to one session, as seen by live subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: String,
    pub event: ProgressEvent,
}

/// Publishes events to any number of live subscribers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ProgressSink for BroadcastSink {
    async fn notify(&self, session_id: &str, event: ProgressEvent) -> Result<(), SinkError> {
        // No subscribers yet is fine; the event is simply unobserved
        let _ = self.tx.send(SessionEvent {
            session_id: session_id.to_string(),
            event,
        });
        Ok(())
    }
}

/// Delivers each event to every inner sink
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl ProgressSink for FanoutSink {
    async fn notify(&self, session_id: &str, event: ProgressEvent) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(session_id, event.clone()).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FailingSink;

    #[async_trait]
    impl ProgressSink for FailingSink {
        async fn notify(&self, _session_id: &str, _event: ProgressEvent) -> Result<(), SinkError> {
            Err(SinkError::Delivery("offline".into()))
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = ProgressEvent::new(StageName::Translate, Phase::Starting, "go")
            .with_payload(serde_json::json!({"k": 1}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "translate");
        assert_eq!(json["phase"], "starting");
        assert_eq!(json["payload"]["k"], 1);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_disabled_handle_drops_events() {
        let handle = ProgressHandle::disabled();
        assert!(!handle.is_enabled());
        handle.processing(StageName::Execute, "ignored", None);
    }

    #[test]
    fn test_spawn_outside_runtime_is_disabled() {
        let (handle, delivery) = ProgressHandle::spawn(Arc::new(TracingSink), "s-0".into());
        assert!(!handle.is_enabled());
        assert!(!delivery.is_pending());
        handle.emit(ProgressEvent::new(StageName::Execute, Phase::Starting, "ignored"));
    }

    #[tokio::test]
    async fn test_forwarder_preserves_order() {
        let broadcast = BroadcastSink::new(16);
        let mut rx = broadcast.subscribe();
        let (handle, forwarder) = ProgressHandle::spawn(Arc::new(broadcast), "s-1".into());

        for phase in [Phase::Starting, Phase::Processing, Phase::Completed] {
            handle.emit(ProgressEvent::new(StageName::Validate, phase, "step"));
        }
        drop(handle);
        forwarder.flushed().await;

        let mut phases = Vec::new();
        while let Ok(received) = rx.try_recv() {
            assert_eq!(received.session_id, "s-1");
            phases.push(received.event.phase);
        }
        assert_eq!(phases, vec![Phase::Starting, Phase::Processing, Phase::Completed]);
    }

    #[tokio::test]
    async fn test_fanout_reports_failure_after_delivering_to_all() {
        let broadcast = BroadcastSink::new(4);
        let mut rx = broadcast.subscribe();
        let fanout = FanoutSink::new()
            .with(Arc::new(FailingSink))
            .with(Arc::new(broadcast));

        let event = ProgressEvent::new(StageName::SchemaLoad, Phase::Starting, "load");
        assert!(fanout.notify("s-2", event).await.is_err());

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.event.stage, StageName::SchemaLoad);
    }
}
