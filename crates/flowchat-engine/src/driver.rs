//! Async driver: runs one coordinator on tokio time.
//!
//! The driver task owns the coordinator. Callers talk to it through a
//! [`ConversationHandle`]; pacing timers are a single `sleep_until` on the
//! coordinator's next deadline, so a reset or a response simply replaces the
//! deadline and stale timers never fire.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use flowchat_core::config::RetryConfig;
use flowchat_core::error::{FlowError, Result};
use flowchat_core::event::EventBus;
use flowchat_core::flow::Element;
use flowchat_core::traits::TelemetryPort;
use flowchat_core::types::{EngineEvent, Response, Session};

use crate::coordinator::{ConversationState, Coordinator, CoordinatorSettings, ResponseOutcome};
use crate::dispatch::telemetry_channel;
use crate::graph::FlowGraph;

const COMMAND_BUFFER: usize = 32;

/// Maps the coordinator's virtual clock onto tokio time.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    origin: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    pub fn instant_at(&self, offset: Duration) -> Instant {
        self.origin + offset
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a conversation.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub state: ConversationState,
    pub session: Option<Session>,
    /// The element awaiting a response, if any.
    pub awaiting: Option<Element>,
}

enum Command {
    Respond {
        response: Response,
        reply: oneshot::Sender<Result<ResponseOutcome>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Restart {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<ConversationSnapshot>,
    },
}

/// Caller side of a running conversation. Cheap to clone.
#[derive(Clone)]
pub struct ConversationHandle {
    tx: mpsc::Sender<Command>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl ConversationHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| FlowError::Closed)?;
        rx.await.map_err(|_| FlowError::Closed)
    }

    /// Answer the element the conversation is waiting on.
    pub async fn respond(&self, response: Response) -> Result<ResponseOutcome> {
        self.request(|reply| Command::Respond { response, reply }).await?
    }

    /// Abandon the conversation. It stays idle until `restart`.
    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Reset and start a fresh session.
    pub async fn restart(&self) -> Result<()> {
        self.request(|reply| Command::Restart { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<ConversationSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Stop the driver. Queued telemetry is still delivered.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct ConversationDriver {
    coordinator: Coordinator,
    rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    clock: SessionClock,
    telemetry_task: Option<JoinHandle<()>>,
}

impl ConversationDriver {
    /// Wrap an already wired coordinator.
    pub fn new(coordinator: Coordinator) -> (Self, ConversationHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = CancellationToken::new();
        let handle = ConversationHandle {
            tx,
            bus: Arc::clone(coordinator.event_bus()),
            cancel: cancel.clone(),
        };
        let driver = Self {
            coordinator,
            rx,
            cancel,
            clock: SessionClock::new(),
            telemetry_task: None,
        };
        (driver, handle)
    }

    /// Build a coordinator with its own telemetry dispatcher task.
    /// Must be called inside a tokio runtime.
    pub fn build(
        graph: Arc<FlowGraph>,
        telemetry: Arc<dyn TelemetryPort>,
        settings: CoordinatorSettings,
        retry: RetryConfig,
    ) -> (Self, ConversationHandle) {
        let (outbox, dispatcher) = telemetry_channel(Arc::clone(&telemetry), retry);
        let coordinator = Coordinator::new(graph, telemetry, outbox, settings);
        let (mut driver, handle) = Self::new(coordinator);
        driver.telemetry_task = Some(dispatcher.spawn());
        (driver, handle)
    }

    /// Stop the driver when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Start the conversation and serve commands until shutdown or until
    /// every handle is dropped.
    pub async fn run(mut self) {
        self.start(None).await;

        loop {
            let deadline = self
                .coordinator
                .next_deadline()
                .map(|d| self.clock.instant_at(d));
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(deadline) => {
                    self.coordinator.advance(self.clock.now());
                }
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let Some(reply) = self.handle(cmd) {
                        self.start(Some(reply)).await;
                    }
                }
            }
        }

        let ConversationDriver {
            coordinator,
            telemetry_task,
            ..
        } = self;
        info!(state = %coordinator.state(), "Conversation driver stopped");
        // Dropping the coordinator closes the outbox; wait for the backlog.
        drop(coordinator);
        if let Some(task) = telemetry_task {
            task.await.ok();
        }
    }

    /// Create the session while still serving commands. A reset while the
    /// backend is busy abandons the start; a restart begins another.
    async fn start(&mut self, mut reply: Option<oneshot::Sender<Result<()>>>) {
        'attempt: loop {
            let pending = match self.coordinator.begin_start() {
                Ok(p) => p,
                Err(e) => {
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Err(e));
                    }
                    return;
                }
            };
            let create = pending.resolve();
            tokio::pin!(create);

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    ticket = &mut create => {
                        let result = self.coordinator.complete_start(ticket, self.clock.now());
                        if let Some(reply) = reply.take() {
                            let _ = reply.send(result);
                        }
                        return;
                    }
                    cmd = self.rx.recv() => {
                        let Some(cmd) = cmd else { return };
                        if let Some(next) = self.handle(cmd) {
                            debug!("Restart requested while starting");
                            reply = Some(next);
                            continue 'attempt;
                        }
                        if *self.coordinator.state() != ConversationState::Starting {
                            debug!("Start abandoned by reset");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Serve one command. Returns the reply channel when a restart needs a
    /// fresh start; the coordinator has already been reset.
    fn handle(&mut self, cmd: Command) -> Option<oneshot::Sender<Result<()>>> {
        let now = self.clock.now();
        match cmd {
            Command::Respond { response, reply } => {
                let _ = reply.send(self.coordinator.respond(response, now));
            }
            Command::Reset { reply } => {
                self.coordinator.reset();
                let _ = reply.send(());
            }
            Command::Restart { reply } => {
                self.coordinator.reset();
                return Some(reply);
            }
            Command::Snapshot { reply } => {
                self.coordinator.advance(now);
                let _ = reply.send(ConversationSnapshot {
                    state: self.coordinator.state().clone(),
                    session: self.coordinator.session().cloned(),
                    awaiting: self.coordinator.current_element().cloned(),
                });
            }
        }
        None
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_core::types::EndReason;
    use flowchat_test_utils::{yes_no_flow, RecordingTelemetry};

    fn spawn_yes_no() -> (ConversationHandle, JoinHandle<()>, Arc<RecordingTelemetry>) {
        let port = Arc::new(RecordingTelemetry::new());
        let (driver, handle) = ConversationDriver::build(
            Arc::new(FlowGraph::new(yes_no_flow())),
            port.clone(),
            CoordinatorSettings::new("asst-1"),
            RetryConfig::none(),
        );
        (handle, driver.spawn(), port)
    }

    async fn wait_for_input(events: &mut broadcast::Receiver<EngineEvent>) -> Element {
        loop {
            if let EngineEvent::AwaitingInput { element, .. } = events.recv().await.unwrap() {
                return element;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reveals_follow_pacing() {
        let started = Instant::now();
        let (handle, task, port) = spawn_yes_no();
        let mut events = handle.subscribe();

        let mut revealed_hi = None;
        loop {
            match events.recv().await.unwrap() {
                EngineEvent::Revealed { element, .. } if element.id == "hi" => {
                    revealed_hi = Some(started.elapsed());
                }
                EngineEvent::AwaitingInput { element, .. } => {
                    assert_eq!(element.id, "q");
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(revealed_hi, Some(Duration::from_millis(500)));
        assert_eq!(started.elapsed(), Duration::from_millis(1600));

        let outcome = handle.respond(Response::text("YES")).await.unwrap();
        assert_eq!(outcome, ResponseOutcome::Advanced { node_id: "end".into() });
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ConversationState::Ended);

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(
            port.summary().await,
            vec![
                "createSession",
                "recordNodeVisit(interaction)",
                "recordMessage(bot,Hi)",
                "recordMessage(user,YES)",
                "recordNodeVisit(end)",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_while_awaiting_input_stops_everything() {
        let (handle, task, port) = spawn_yes_no();
        let mut events = handle.subscribe();
        wait_for_input(&mut events).await;

        handle.reset().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let mut after = vec![];
        while let Ok(e) = events.try_recv() {
            after.push(e.name());
        }
        assert_eq!(after, vec!["reset"]);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ConversationState::Uninitialized);
        assert!(snapshot.session.is_none());

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(port.summary().await.last().map(String::as_str), Some("endSession"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_end() {
        let (handle, task, port) = spawn_yes_no();
        let mut events = handle.subscribe();
        wait_for_input(&mut events).await;
        handle.respond(Response::choice("No")).await.unwrap();

        loop {
            if let EngineEvent::Ended { reason, .. } = events.recv().await.unwrap() {
                assert_eq!(reason, EndReason::Terminal { node_id: "end".into() });
                break;
            }
        }
        assert!(matches!(
            handle.respond(Response::choice("No")).await,
            Err(FlowError::SessionEnded)
        ));

        handle.restart().await.unwrap();
        let element = wait_for_input(&mut events).await;
        assert_eq!(element.id, "q");
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.session.unwrap().id.as_str(), "session-2");
        assert_eq!(snapshot.awaiting.map(|e| e.id), Some("q".to_string()));

        handle.shutdown();
        task.await.unwrap();
        let summary = port.summary().await;
        assert_eq!(summary.iter().filter(|s| *s == "createSession").count(), 2);
        assert_eq!(summary.iter().filter(|s| *s == "endSession").count(), 1);
    }

    #[tokio::test]
    async fn test_handle_after_shutdown_is_closed() {
        let (handle, task, _port) = spawn_yes_no();
        handle.shutdown();
        task.await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.respond(Response::text("yes")).await,
            Err(FlowError::Closed)
        ));
    }
}
