//! Session coordinator: the state machine of one conversation.
//!
//! The coordinator owns the current-node pointer and the session record. It
//! runs on a virtual clock: every method that can move the conversation
//! takes `now`, the time since an arbitrary origin, and the caller decides
//! when to call [`Coordinator::advance`] again via
//! [`Coordinator::next_deadline`]. The async driver maps this clock onto
//! tokio time; tests drive it by hand.
//!
//! States:
//!
//! ```text
//! Uninitialized --start--> Starting --session created--> AwaitingEntry(start)
//! AwaitingEntry(n) --enter--> Sequencing(n)
//! Sequencing(n) --input element revealed--> AwaitingInput(n, e)
//! Sequencing(n) --node complete--> AwaitingEntry(next) | Ended
//! AwaitingInput(n, e) --valid response--> AwaitingEntry(next) | AwaitingInput(n, e) | Ended
//! any --reset--> Uninitialized
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, error, info, warn};

use flowchat_core::config::{AppConfig, MessagesConfig, PacingConfig};
use flowchat_core::error::{FlowError, Result};
use flowchat_core::event::EventBus;
use flowchat_core::flow::{Element, ElementKind, Node};
use flowchat_core::traits::TelemetryPort;
use flowchat_core::types::{
    ContentType, EndReason, EngineEvent, Message, NodeVisit, Response, Sender, Session,
    SessionId, SessionStatus, UserInfo,
};

use crate::dispatch::{TelemetryCall, TelemetryOutbox};
use crate::graph::FlowGraph;
use crate::resolver::{resolve, Resolution};
use crate::sequencer::{SequenceRun, Sequencer, SequencerEvent, StepKind};
use crate::validator::validate_response;

/// Per-conversation settings.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub assistant_id: String,
    pub user_info: UserInfo,
    pub pacing: PacingConfig,
    pub messages: MessagesConfig,
}

impl CoordinatorSettings {
    pub fn new(assistant_id: impl Into<String>) -> Self {
        Self {
            assistant_id: assistant_id.into(),
            user_info: UserInfo::new(),
            pacing: PacingConfig::default(),
            messages: MessagesConfig::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            assistant_id: config.engine.assistant_id.clone(),
            user_info: UserInfo::new(),
            pacing: config.pacing.clone(),
            messages: config.messages.clone(),
        }
    }

    pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_user_info(mut self, user_info: UserInfo) -> Self {
        self.user_info = user_info;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationState {
    Uninitialized,
    /// Waiting for the telemetry backend to create the session.
    Starting,
    /// About to enter a node. Transient.
    AwaitingEntry(String),
    /// Revealing the elements of a node.
    Sequencing(String),
    AwaitingInput {
        node_id: String,
        element_id: String,
    },
    /// Terminal until `reset`.
    Ended,
}

impl ConversationState {
    pub fn name(&self) -> &'static str {
        match self {
            ConversationState::Uninitialized => "uninitialized",
            ConversationState::Starting => "starting",
            ConversationState::AwaitingEntry(_) => "awaiting_entry",
            ConversationState::Sequencing(_) => "sequencing",
            ConversationState::AwaitingInput { .. } => "awaiting_input",
            ConversationState::Ended => "ended",
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            ConversationState::AwaitingEntry(id) | ConversationState::Sequencing(id) => Some(id),
            ConversationState::AwaitingInput { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, ConversationState::Ended)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationState::AwaitingEntry(id) | ConversationState::Sequencing(id) => {
                write!(f, "{}({})", self.name(), id)
            }
            ConversationState::AwaitingInput {
                node_id,
                element_id,
            } => write!(f, "{}({}, {})", self.name(), node_id, element_id),
            _ => f.write_str(self.name()),
        }
    }
}

/// What a valid response led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Advanced { node_id: String },
    /// Re-prompted; still waiting on the same element.
    Unmatched,
    Ended,
}

/// Session creation in flight. Resolve it, then hand the ticket back to
/// [`Coordinator::complete_start`].
pub struct PendingStart {
    generation: u64,
    start_node_id: String,
    create: BoxFuture<'static, Result<SessionId>>,
}

impl PendingStart {
    pub fn start_node_id(&self) -> &str {
        &self.start_node_id
    }

    pub async fn resolve(self) -> StartTicket {
        StartTicket {
            generation: self.generation,
            start_node_id: self.start_node_id,
            result: self.create.await,
        }
    }
}

/// Outcome of session creation.
pub struct StartTicket {
    generation: u64,
    start_node_id: String,
    result: Result<SessionId>,
}

pub struct Coordinator {
    graph: Arc<FlowGraph>,
    telemetry: Arc<dyn TelemetryPort>,
    outbox: TelemetryOutbox,
    bus: Arc<EventBus>,
    sequencer: Sequencer,
    settings: CoordinatorSettings,
    state: ConversationState,
    session: Option<Session>,
    /// Wall-clock time matching `clock_origin`.
    epoch: DateTime<Utc>,
    /// Virtual time the session was created at.
    clock_origin: Duration,
    node_entered_at: Duration,
    run: Option<SequenceRun>,
    /// Bumped by `reset` so in-flight starts from before it are ignored.
    generation: u64,
    /// Nodes entered at `pass_instant` during the current call. A node
    /// entered twice at one instant is an unpaced auto-advance cycle.
    pass_instant: Option<Duration>,
    pass_entries: HashSet<String>,
}

impl Coordinator {
    pub fn new(
        graph: Arc<FlowGraph>,
        telemetry: Arc<dyn TelemetryPort>,
        outbox: TelemetryOutbox,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            graph,
            telemetry,
            outbox,
            bus: Arc::new(EventBus::default()),
            sequencer: Sequencer::new(settings.pacing.clone()),
            settings,
            state: ConversationState::Uninitialized,
            session: None,
            epoch: Utc::now(),
            clock_origin: Duration::ZERO,
            node_entered_at: Duration::ZERO,
            run: None,
            generation: 0,
            pass_instant: None,
            pass_entries: HashSet::new(),
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn graph(&self) -> &Arc<FlowGraph> {
        &self.graph
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// The element the conversation is waiting on.
    pub fn current_element(&self) -> Option<&Element> {
        match &self.state {
            ConversationState::AwaitingInput {
                node_id,
                element_id,
            } => self.graph.get_node(node_id).ok()?.element(element_id),
            _ => None,
        }
    }

    /// When `advance` next has work to do.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.run.as_ref().and_then(|r| r.next_due())
    }

    /// Validate the flow and begin creating a session.
    ///
    /// A flow without exactly one start node ends the conversation here,
    /// before the backend is contacted.
    pub fn begin_start(&mut self) -> Result<PendingStart> {
        if self.state != ConversationState::Uninitialized {
            return Err(FlowError::AlreadyStarted);
        }
        self.state = ConversationState::Starting;

        let start_node_id = match self.graph.find_start_node() {
            Ok(node) => node.id.clone(),
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        info!(assistant_id = %self.settings.assistant_id, start_node = %start_node_id, "Starting conversation");
        let port = Arc::clone(&self.telemetry);
        let assistant_id = self.settings.assistant_id.clone();
        let user_info = self.settings.user_info.clone();
        Ok(PendingStart {
            generation: self.generation,
            start_node_id,
            create: Box::pin(async move { port.create_session(assistant_id, user_info).await }),
        })
    }

    /// Finish a start begun with `begin_start`. Tickets from before a
    /// `reset` are ignored.
    pub fn complete_start(&mut self, ticket: StartTicket, now: Duration) -> Result<()> {
        if ticket.generation != self.generation || self.state != ConversationState::Starting {
            debug!(state = %self.state, "Discarding stale session start");
            return Ok(());
        }

        let session_id = match ticket.result {
            Ok(id) => id,
            Err(e) => {
                let e = match e {
                    FlowError::SessionCreate(_) => e,
                    other => FlowError::SessionCreate(other.to_string()),
                };
                self.fail(&e);
                return Err(e);
            }
        };

        self.epoch = Utc::now();
        self.clock_origin = now;
        self.node_entered_at = now;
        self.session = Some(Session::new(
            session_id.clone(),
            self.settings.assistant_id.clone(),
            self.epoch,
        ));
        info!(session_id = %session_id, "Session created");
        self.bus.publish(EngineEvent::SessionStarted {
            session_id,
            start_node_id: ticket.start_node_id.clone(),
        });

        // The start node's visit is implied by session creation.
        self.begin_pass();
        self.enter_node(&ticket.start_node_id, now, false);
        self.pump(now);
        Ok(())
    }

    /// Create the session and enter the start node.
    pub async fn start(&mut self, now: Duration) -> Result<()> {
        let pending = self.begin_start()?;
        let ticket = pending.resolve().await;
        self.complete_start(ticket, now)
    }

    /// Fire every sequencer step due at `now`.
    pub fn advance(&mut self, now: Duration) {
        self.begin_pass();
        self.pump(now);
    }

    /// Answer the element the conversation is waiting on.
    ///
    /// Invalid responses are rejected with `FlowError::InvalidInput` and
    /// change nothing. Unmatched responses re-prompt and keep waiting.
    pub fn respond(&mut self, response: Response, now: Duration) -> Result<ResponseOutcome> {
        self.pump(now);
        let (node_id, element_id) = match &self.state {
            ConversationState::AwaitingInput {
                node_id,
                element_id,
            } => (node_id.clone(), element_id.clone()),
            ConversationState::Ended => return Err(FlowError::SessionEnded),
            other => {
                return Err(FlowError::NotAwaitingInput {
                    state: other.name().to_string(),
                })
            }
        };

        let graph = Arc::clone(&self.graph);
        let node = graph.get_node(&node_id)?;
        let element = node
            .element(&element_id)
            .ok_or_else(|| FlowError::NodeNotFound(format!("{}/{}", node_id, element_id)))?;

        let response = match validate_response(element, response) {
            Ok(r) => r,
            Err(e) => {
                debug!(node_id = %node_id, element_id = %element_id, error = %e, "Response rejected");
                self.bus.publish(EngineEvent::InputRejected {
                    node_id,
                    element_id,
                    error: e.clone(),
                });
                return Err(e.into());
            }
        };

        let content = response.display_text();
        self.record_message(
            Sender::User,
            content.clone(),
            response.content_type(),
            &node_id,
            json!({ "elementId": element_id }),
            now,
        );
        self.bus.publish(EngineEvent::UserMessage {
            node_id: node_id.clone(),
            content,
        });

        match resolve(&graph, node, Some((element, &response))) {
            Resolution::Target(target) if graph.contains(&target) => {
                self.begin_pass();
                self.enter_node(&target, now, true);
                self.pump(now);
                Ok(ResponseOutcome::Advanced { node_id: target })
            }
            Resolution::Target(target) => {
                warn!(node_id = %node_id, target = %target, "Response leads to a missing node");
                self.bus.publish(EngineEvent::UnknownTarget {
                    node_id: node_id.clone(),
                    target,
                });
                self.reprompt(&node_id, now);
                Ok(ResponseOutcome::Unmatched)
            }
            Resolution::Terminal => {
                self.end(EndReason::Terminal { node_id }, now);
                Ok(ResponseOutcome::Ended)
            }
            Resolution::Unmatched => {
                self.reprompt(&node_id, now);
                Ok(ResponseOutcome::Unmatched)
            }
        }
    }

    /// Abandon the conversation and return to `Uninitialized`.
    ///
    /// Pending reveal steps are cancelled, an in-flight start is orphaned,
    /// and an existing session is ended at the backend.
    pub fn reset(&mut self) {
        self.cancel_run();
        self.generation += 1;
        let session_id = self.session.take().map(|s| s.id);
        if let Some(id) = &session_id {
            info!(session_id = %id, "Resetting conversation");
            self.outbox.send(TelemetryCall::EndSession(id.clone()));
        }
        self.state = ConversationState::Uninitialized;
        self.bus.publish(EngineEvent::Reset { session_id });
    }

    /// Reset, then start over.
    pub async fn restart(&mut self, now: Duration) -> Result<()> {
        self.reset();
        self.start(now).await
    }

    fn pump(&mut self, now: Duration) {
        while let Some(step) = self.run.as_mut().and_then(|r| r.fire_next(now)) {
            self.on_step(step);
        }
    }

    fn on_step(&mut self, step: SequencerEvent) {
        let graph = Arc::clone(&self.graph);
        let Some(node_id) = self.run.as_ref().map(|r| r.node_id().to_string()) else {
            return;
        };
        let Ok(node) = graph.get_node(&node_id) else {
            return;
        };
        let element = step.element_index.and_then(|i| node.elements.get(i));

        match (step.kind, element) {
            (StepKind::Revealing, Some(element)) => {
                self.bus.publish(EngineEvent::Revealing {
                    node_id,
                    element_id: element.id.clone(),
                });
            }
            (StepKind::Revealed, Some(element)) => {
                self.record_reveal(node, element, step.at);
                self.bus.publish(EngineEvent::Revealed {
                    node_id,
                    element: element.clone(),
                });
            }
            (StepKind::AwaitingInput, Some(element)) => {
                debug!(node_id = %node_id, element_id = %element.id, "Awaiting input");
                self.state = ConversationState::AwaitingInput {
                    node_id: node_id.clone(),
                    element_id: element.id.clone(),
                };
                self.bus.publish(EngineEvent::AwaitingInput {
                    node_id,
                    element: element.clone(),
                });
            }
            (StepKind::NodeComplete, _) => self.auto_advance(node, step.at),
            (kind, None) => {
                debug!(node_id = %node_id, step = ?kind, "Step without element, skipped");
            }
        }
    }

    fn auto_advance(&mut self, node: &Node, at: Duration) {
        match resolve(&self.graph, node, None) {
            Resolution::Target(target) if self.graph.contains(&target) => {
                self.enter_node(&target, at, true);
            }
            Resolution::Target(target) => {
                warn!(node_id = %node.id, target = %target, "Edge leads to a missing node");
                self.bus.publish(EngineEvent::UnknownTarget {
                    node_id: node.id.clone(),
                    target,
                });
                self.end(EndReason::DeadEnd { node_id: node.id.clone() }, at);
            }
            Resolution::Terminal => {
                self.end(EndReason::Terminal { node_id: node.id.clone() }, at);
            }
            Resolution::Unmatched => {
                warn!(node_id = %node.id, "Node has no way forward");
                self.end(EndReason::DeadEnd { node_id: node.id.clone() }, at);
            }
        }
    }

    fn enter_node(&mut self, node_id: &str, at: Duration, record_visit: bool) {
        self.cancel_run();
        if !self.note_entry(node_id, at) {
            warn!(node_id = %node_id, "Auto-advance cycle without pacing");
            self.end(EndReason::DeadEnd { node_id: node_id.to_string() }, at);
            return;
        }
        self.state = ConversationState::AwaitingEntry(node_id.to_string());

        let graph = Arc::clone(&self.graph);
        let node = match graph.get_node(node_id) {
            Ok(node) => node,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Cannot enter node");
                self.end(EndReason::DeadEnd { node_id: node_id.to_string() }, at);
                return;
            }
        };

        let timestamp = self.timestamp(at);
        let spent = at.saturating_sub(self.node_entered_at);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.current_node_id = Some(node.id.clone());
        session.last_node_entered_at = timestamp;
        let session_id = session.id.clone();
        self.node_entered_at = at;

        if record_visit {
            self.outbox.send(TelemetryCall::NodeVisit(NodeVisit {
                session_id,
                node_id: node.id.clone(),
                node_kind: node.kind,
                time_spent_on_previous_node_ms: spent.as_millis() as u64,
                timestamp,
            }));
        }

        info!(node_id = %node.id, kind = %node.kind, elements = node.elements.len(), "Entered node");
        self.bus.publish(EngineEvent::NodeEntered {
            node_id: node.id.clone(),
            kind: node.kind,
        });
        self.run = Some(self.sequencer.run(node, at));
        self.state = ConversationState::Sequencing(node.id.clone());
    }

    fn begin_pass(&mut self) {
        self.pass_instant = None;
        self.pass_entries.clear();
    }

    /// False when `node_id` was already entered at `at` in this pass.
    fn note_entry(&mut self, node_id: &str, at: Duration) -> bool {
        if self.pass_instant != Some(at) {
            self.pass_instant = Some(at);
            self.pass_entries.clear();
        }
        self.pass_entries.insert(node_id.to_string())
    }

    fn end(&mut self, reason: EndReason, at: Duration) {
        self.cancel_run();
        self.state = ConversationState::Ended;
        if let Some(session) = self.session.as_mut() {
            session.status = SessionStatus::Completed;
        }

        let message = match &reason {
            EndReason::DeadEnd { node_id } => {
                let text = self.settings.messages.dead_end.clone();
                self.record_message(
                    Sender::Bot,
                    text.clone(),
                    ContentType::Text,
                    node_id,
                    json!({ "deadEnd": true }),
                    at,
                );
                Some(text)
            }
            _ => None,
        };

        info!(reason = ?reason, "Conversation ended");
        self.bus.publish(EngineEvent::Ended { reason, message });
    }

    fn fail(&mut self, error: &FlowError) {
        let message = match error {
            FlowError::NoStartNode { .. } => self.settings.messages.no_start_node.clone(),
            _ => self.settings.messages.start_failed.clone(),
        };
        error!(error = %error, "Conversation could not start");
        self.cancel_run();
        self.state = ConversationState::Ended;
        self.bus.publish(EngineEvent::Fatal {
            error: error.to_string(),
            message,
        });
    }

    fn reprompt(&mut self, node_id: &str, at: Duration) {
        let message = self.settings.messages.unmatched.clone();
        self.record_message(
            Sender::Bot,
            message.clone(),
            ContentType::Text,
            node_id,
            json!({ "unmatched": true }),
            at,
        );
        self.bus.publish(EngineEvent::Unmatched {
            node_id: node_id.to_string(),
            message,
        });
    }

    /// Record a revealed element as a bot message. Empty non-media elements
    /// show nothing and are skipped.
    fn record_reveal(&self, node: &Node, element: &Element, at: Duration) {
        let is_media = matches!(element.kind, ElementKind::Media { .. });
        if element.content.trim().is_empty() && !is_media {
            return;
        }

        let mut metadata = json!({ "elementId": element.id });
        match &element.kind {
            ElementKind::Question { options } => {
                let texts: Vec<&str> = options.iter().map(|o| o.text.as_str()).collect();
                metadata["options"] = json!(texts);
            }
            ElementKind::Input { input_type, .. } => {
                metadata["inputType"] = json!(input_type.as_str());
            }
            ElementKind::Form { fields, .. } => {
                metadata["fields"] = serde_json::to_value(fields).unwrap_or_default();
            }
            ElementKind::Media { media_kind, url } => {
                metadata["mediaKind"] = json!(media_kind.as_str());
                metadata["mediaUrl"] = json!(url);
            }
            ElementKind::Text => {}
        }

        self.record_message(
            Sender::Bot,
            element.content.clone(),
            ContentType::for_element(element),
            &node.id,
            metadata,
            at,
        );
    }

    fn record_message(
        &self,
        sender: Sender,
        content: String,
        content_type: ContentType,
        node_id: &str,
        metadata: serde_json::Value,
        at: Duration,
    ) {
        let Some(session) = &self.session else {
            return;
        };
        self.outbox.send(TelemetryCall::Message(Message {
            session_id: session.id.clone(),
            sender,
            content,
            content_type,
            node_id: Some(node_id.to_string()),
            metadata,
            timestamp: self.timestamp(at),
        }));
    }

    fn cancel_run(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel();
        }
    }

    fn timestamp(&self, at: Duration) -> DateTime<Utc> {
        let elapsed = at.saturating_sub(self.clock_origin);
        self.epoch + chrono::Duration::milliseconds(elapsed.as_millis() as i64)
    }
}
