use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::flow::{Element, ElementKind, MediaKind, NodeKind};

/// Unique session identifier, assigned by the telemetry backend.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Free-form visitor details passed to `create_session`.
pub type UserInfo = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "abandoned" => Some(SessionStatus::Abandoned),
            _ => None,
        }
    }
}

/// One end-user's traversal of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub assistant_id: String,
    pub current_node_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_node_entered_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(id: SessionId, assistant_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            assistant_id: assistant_id.into(),
            current_node_id: None,
            started_at,
            last_node_entered_at: started_at,
            status: SessionStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Bot,
    User,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Bot => "bot",
            Sender::User => "user",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "bot" => Some(Sender::Bot),
            "user" => Some(Sender::User),
            _ => None,
        }
    }
}

/// Content type of a recorded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Form,
    Image,
    Video,
    Audio,
    File,
    QuickReply,
    Option,
}

impl ContentType {
    /// Content type of a bot message revealing `element`.
    pub fn for_element(element: &Element) -> Self {
        match &element.kind {
            ElementKind::Text | ElementKind::Input { .. } => ContentType::Text,
            ElementKind::Question { .. } => ContentType::Option,
            ElementKind::Form { .. } => ContentType::Form,
            ElementKind::Media { media_kind, .. } => match media_kind {
                MediaKind::Image => ContentType::Image,
                MediaKind::Video => ContentType::Video,
                MediaKind::Audio => ContentType::Audio,
                MediaKind::File => ContentType::File,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Form => "form",
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::Audio => "audio",
            ContentType::File => "file",
            ContentType::QuickReply => "quick_reply",
            ContentType::Option => "option",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "form" => ContentType::Form,
            "image" => ContentType::Image,
            "video" => ContentType::Video,
            "audio" => ContentType::Audio,
            "file" => ContentType::File,
            "quick_reply" => ContentType::QuickReply,
            "option" => ContentType::Option,
            _ => ContentType::Text,
        }
    }
}

/// Telemetry record of one message. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub session_id: SessionId,
    pub sender: Sender,
    pub content: String,
    pub content_type: ContentType,
    pub node_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Telemetry record of entering a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVisit {
    pub session_id: SessionId,
    pub node_id: String,
    pub node_kind: NodeKind,
    /// Time between entering the previous node and entering this one.
    pub time_spent_on_previous_node_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// A user's answer to the element the session is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Response {
    /// A clicked option. Matched exactly against option text.
    Choice(String),
    /// Typed text. Matched case-insensitively after trimming.
    Text(String),
    /// Submitted form values keyed by field name.
    Form(BTreeMap<String, String>),
}

impl Response {
    pub fn choice(text: impl Into<String>) -> Self {
        Response::Choice(text.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Response::Text(text.into())
    }

    /// Text recorded as the user message.
    pub fn display_text(&self) -> String {
        match self {
            Response::Choice(s) | Response::Text(s) => s.trim().to_string(),
            Response::Form(values) => serde_json::to_string(values).unwrap_or_default(),
        }
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            Response::Choice(_) => ContentType::QuickReply,
            Response::Text(_) => ContentType::Text,
            Response::Form(_) => ContentType::Form,
        }
    }
}

/// Why a conversation reached `Ended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EndReason {
    /// An end node finished with nowhere further to go.
    Terminal { node_id: String },
    /// An auto-advancing node had no usable outgoing edge.
    DeadEnd { node_id: String },
    /// The conversation could not start.
    Fatal,
}

/// Events broadcast by a conversation to its subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Session created and start node about to be entered.
    SessionStarted {
        session_id: SessionId,
        start_node_id: String,
    },
    NodeEntered {
        node_id: String,
        kind: NodeKind,
    },
    /// An element began its typing delay.
    Revealing {
        node_id: String,
        element_id: String,
    },
    /// An element is fully shown.
    Revealed {
        node_id: String,
        element: Element,
    },
    /// Sequencing halted on an element that needs a response.
    AwaitingInput {
        node_id: String,
        element: Element,
    },
    /// A valid response was accepted.
    UserMessage {
        node_id: String,
        content: String,
    },
    /// A response failed validation. Nothing advanced.
    InputRejected {
        node_id: String,
        element_id: String,
        error: ValidationError,
    },
    /// The response matched nothing; the bot re-prompts.
    Unmatched {
        node_id: String,
        message: String,
    },
    /// Resolution named a node that does not exist.
    UnknownTarget {
        node_id: String,
        target: String,
    },
    Ended {
        reason: EndReason,
        message: Option<String>,
    },
    /// Start failed. `message` is the text shown to the user.
    Fatal {
        error: String,
        message: String,
    },
    /// Conversation cleared back to `Uninitialized`.
    Reset {
        session_id: Option<SessionId>,
    },
}

impl EngineEvent {
    /// Short name used in transcripts.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::SessionStarted { .. } => "session_started",
            EngineEvent::NodeEntered { .. } => "node_entered",
            EngineEvent::Revealing { .. } => "revealing",
            EngineEvent::Revealed { .. } => "revealed",
            EngineEvent::AwaitingInput { .. } => "awaiting_input",
            EngineEvent::UserMessage { .. } => "user_message",
            EngineEvent::InputRejected { .. } => "input_rejected",
            EngineEvent::Unmatched { .. } => "unmatched",
            EngineEvent::UnknownTarget { .. } => "unknown_target",
            EngineEvent::Ended { .. } => "ended",
            EngineEvent::Fatal { .. } => "fatal",
            EngineEvent::Reset { .. } => "reset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ChoiceOption, InputType};

    #[test]
    fn test_content_type_for_element() {
        let q = Element::question("q", "Pick", vec![ChoiceOption::new("A")]);
        assert_eq!(ContentType::for_element(&q), ContentType::Option);
        let i = Element::input("i", "Email?", InputType::Email);
        assert_eq!(ContentType::for_element(&i), ContentType::Text);
        let v = Element::media("v", "", MediaKind::Video, "https://x/v.mp4");
        assert_eq!(ContentType::for_element(&v), ContentType::Video);
        assert_eq!(ContentType::parse("quick_reply"), ContentType::QuickReply);
    }

    #[test]
    fn test_response_display_text() {
        assert_eq!(Response::text("  yes ").display_text(), "yes");
        let mut values = BTreeMap::new();
        values.insert("name".to_string(), "Ada".to_string());
        assert_eq!(Response::Form(values).display_text(), r#"{"name":"Ada"}"#);
    }

    #[test]
    fn test_session_status_roundtrip_names() {
        for s in [SessionStatus::Active, SessionStatus::Completed, SessionStatus::Abandoned] {
            assert_eq!(SessionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SessionStatus::parse("bogus"), None);
    }
}
