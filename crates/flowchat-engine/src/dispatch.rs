//! Fire-and-forget telemetry delivery.
//!
//! The coordinator never awaits node-visit, message or end-session calls.
//! It queues them on a [`TelemetryOutbox`]; one [`TelemetryDispatcher`] per
//! conversation delivers them strictly in queue order. A failing call is
//! retried with backoff before the next call is attempted, and dropped with a
//! warning once retries run out. Delivery failures never reach the engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use flowchat_core::config::RetryConfig;
use flowchat_core::error::Result;
use flowchat_core::traits::TelemetryPort;
use flowchat_core::types::{Message, NodeVisit, SessionId};

/// One queued telemetry call.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryCall {
    NodeVisit(NodeVisit),
    Message(Message),
    EndSession(SessionId),
}

impl TelemetryCall {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryCall::NodeVisit(_) => "record_node_visit",
            TelemetryCall::Message(_) => "record_message",
            TelemetryCall::EndSession(_) => "end_session",
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            TelemetryCall::NodeVisit(v) => &v.session_id,
            TelemetryCall::Message(m) => &m.session_id,
            TelemetryCall::EndSession(id) => id,
        }
    }

    async fn deliver(&self, port: &dyn TelemetryPort) -> Result<()> {
        match self {
            TelemetryCall::NodeVisit(v) => port.record_node_visit(v.clone()).await,
            TelemetryCall::Message(m) => port.record_message(m.clone()).await,
            TelemetryCall::EndSession(id) => port.end_session(id.clone()).await,
        }
    }
}

/// Sending side of the telemetry queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TelemetryOutbox {
    tx: mpsc::UnboundedSender<TelemetryCall>,
}

impl TelemetryOutbox {
    /// A bare queue, for callers that consume the calls themselves.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TelemetryCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a call. Never blocks and never fails.
    pub fn send(&self, call: TelemetryCall) {
        if let Err(e) = self.tx.send(call) {
            debug!(call = e.0.name(), "Telemetry dispatcher gone, dropping call");
        }
    }
}

/// Delivers queued calls to a [`TelemetryPort`].
pub struct TelemetryDispatcher {
    port: Arc<dyn TelemetryPort>,
    retry: RetryConfig,
    rx: mpsc::UnboundedReceiver<TelemetryCall>,
}

/// Create a connected outbox and dispatcher.
pub fn telemetry_channel(
    port: Arc<dyn TelemetryPort>,
    retry: RetryConfig,
) -> (TelemetryOutbox, TelemetryDispatcher) {
    let (outbox, rx) = TelemetryOutbox::channel();
    (outbox, TelemetryDispatcher { port, retry, rx })
}

impl TelemetryDispatcher {
    /// Deliver calls until every outbox is dropped and the queue is drained.
    pub async fn run(mut self) {
        while let Some(call) = self.rx.recv().await {
            self.deliver(&call).await;
        }
        debug!(backend = self.port.name(), "Telemetry queue closed");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn deliver(&self, call: &TelemetryCall) {
        let max_retries = self.retry.max_retries;
        for attempt in 0..=max_retries {
            match call.deliver(self.port.as_ref()).await {
                Ok(()) => return,
                Err(e) if attempt < max_retries => {
                    let delay = calculate_backoff(attempt, &self.retry);
                    warn!(
                        call = call.name(),
                        session_id = %call.session_id(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Telemetry call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        call = call.name(),
                        session_id = %call.session_id(),
                        error = %e,
                        "Telemetry call dropped after retries"
                    );
                }
            }
        }
    }
}

/// Exponential backoff capped at `max_backoff_ms`, with 0.8x to 1.2x jitter.
fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let base = config
        .initial_backoff_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((base as f64 * jitter) as u64)
}
