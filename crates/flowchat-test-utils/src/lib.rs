//! Telemetry mocks and flow fixtures shared by flowchat tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use flowchat_core::error::{FlowError, Result};
use flowchat_core::flow::{ChoiceOption, Edge, Element, FlowDocument, InputType, Node, NodeKind};
use flowchat_core::traits::TelemetryPort;
use flowchat_core::types::{Message, NodeVisit, SessionId, UserInfo};

/// One call received by a mock telemetry port.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
    CreateSession {
        assistant_id: String,
        session_id: SessionId,
    },
    NodeVisit(NodeVisit),
    Message(Message),
    EndSession(SessionId),
}

impl TelemetryRecord {
    /// Compact form for order assertions, e.g. `recordMessage(bot,Hi)`.
    pub fn summary(&self) -> String {
        match self {
            TelemetryRecord::CreateSession { .. } => "createSession".to_string(),
            TelemetryRecord::NodeVisit(v) => format!("recordNodeVisit({})", v.node_kind),
            TelemetryRecord::Message(m) => {
                format!("recordMessage({},{})", m.sender.as_str(), m.content)
            }
            TelemetryRecord::EndSession(_) => "endSession".to_string(),
        }
    }
}

/// Telemetry port that records every call in order. Session ids are
/// `session-1`, `session-2`, ... in creation order.
#[derive(Default)]
pub struct RecordingTelemetry {
    calls: Mutex<Vec<TelemetryRecord>>,
    sessions: AtomicUsize,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<TelemetryRecord> {
        self.calls.lock().await.clone()
    }

    pub async fn summary(&self) -> Vec<String> {
        self.calls.lock().await.iter().map(|c| c.summary()).collect()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                TelemetryRecord::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn node_visits(&self) -> Vec<NodeVisit> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                TelemetryRecord::NodeVisit(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    async fn push(&self, record: TelemetryRecord) {
        self.calls.lock().await.push(record);
    }
}

impl TelemetryPort for RecordingTelemetry {
    fn name(&self) -> &str {
        "recording"
    }

    fn create_session(
        &self,
        assistant_id: String,
        _user_info: UserInfo,
    ) -> BoxFuture<'_, Result<SessionId>> {
        Box::pin(async move {
            let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            let session_id = SessionId::from_str(&format!("session-{}", n));
            self.push(TelemetryRecord::CreateSession {
                assistant_id,
                session_id: session_id.clone(),
            })
            .await;
            Ok(session_id)
        })
    }

    fn record_node_visit(&self, visit: NodeVisit) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.push(TelemetryRecord::NodeVisit(visit)).await;
            Ok(())
        })
    }

    fn record_message(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.push(TelemetryRecord::Message(message)).await;
            Ok(())
        })
    }

    fn end_session(&self, session_id: SessionId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.push(TelemetryRecord::EndSession(session_id)).await;
            Ok(())
        })
    }
}

/// Telemetry port that fails on demand. Calls that succeed are forwarded to
/// an inner [`RecordingTelemetry`].
#[derive(Default)]
pub struct FailingTelemetry {
    reject_sessions: bool,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
    recorded: RecordingTelemetry,
}

impl FailingTelemetry {
    /// `create_session` always fails.
    pub fn rejecting_sessions() -> Self {
        Self {
            reject_sessions: true,
            ..Self::default()
        }
    }

    /// The first `n` record/end calls fail, later ones succeed.
    pub fn failing_first(n: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    /// Every record/end call fails.
    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn recorded(&self) -> &RecordingTelemetry {
        &self.recorded
    }

    /// Record/end attempts seen so far, failed or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl TelemetryPort for FailingTelemetry {
    fn name(&self) -> &str {
        "failing"
    }

    fn create_session(
        &self,
        assistant_id: String,
        user_info: UserInfo,
    ) -> BoxFuture<'_, Result<SessionId>> {
        if self.reject_sessions {
            return Box::pin(async { Err(FlowError::SessionCreate("backend unavailable".into())) });
        }
        self.recorded.create_session(assistant_id, user_info)
    }

    fn record_node_visit(&self, visit: NodeVisit) -> BoxFuture<'_, Result<()>> {
        if self.should_fail() {
            return Box::pin(async { Err(FlowError::Telemetry("injected failure".into())) });
        }
        self.recorded.record_node_visit(visit)
    }

    fn record_message(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        if self.should_fail() {
            return Box::pin(async { Err(FlowError::Telemetry("injected failure".into())) });
        }
        self.recorded.record_message(message)
    }

    fn end_session(&self, session_id: SessionId) -> BoxFuture<'_, Result<()>> {
        if self.should_fail() {
            return Box::pin(async { Err(FlowError::Telemetry("injected failure".into())) });
        }
        self.recorded.end_session(session_id)
    }
}

/// `Start -> Interaction[Text "Hi", Question(Yes -> End, No -> End)] -> End`.
/// The question has no prompt text of its own.
pub fn yes_no_flow() -> FlowDocument {
    FlowDocument::new(
        vec![
            Node::new("start", NodeKind::Start),
            Node::new("ask", NodeKind::Interaction).with_elements(vec![
                Element::text("hi", "Hi"),
                Element::question(
                    "q",
                    "",
                    vec![ChoiceOption::new("Yes").to("end"), ChoiceOption::new("No").to("end")],
                ),
            ]),
            Node::new("end", NodeKind::End),
        ],
        vec![Edge::new("e-start", "start", "ask")],
    )
}

/// A start node that asks for an email, then a thank-you end node.
pub fn email_capture_flow() -> FlowDocument {
    FlowDocument::new(
        vec![
            Node::new("start", NodeKind::Start).with_elements(vec![
                Element::text("welcome", "Welcome!"),
                Element::input("email", "What is your email?", InputType::Email),
            ]),
            Node::new("thanks", NodeKind::End)
                .with_element(Element::text("bye", "Thanks, we'll be in touch.")),
        ],
        vec![Edge::new("e1", "start", "thanks")],
    )
}

/// Write `doc` as JSON into a fresh temp dir. Keep the dir alive while the
/// file is used.
pub fn write_flow(doc: &FlowDocument) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("flow.json");
    let json = serde_json::to_string_pretty(doc).expect("serialize flow");
    std::fs::write(&path, json).expect("write flow");
    (dir, path)
}
