//! Flow document model.
//!
//! A flow is the authored conversation: nodes holding ordered elements, and
//! edges between nodes. The document is produced by the visual editor and is
//! read-only for the engine. Deserialization is deliberately tolerant: the
//! editor nests node data under `data`, omits optional fields, and knows a
//! few element types the engine renders as their closest supported kind.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlowError, Result};

/// Prefix of source handles that bind an edge to one option of a question.
pub const OPTION_HANDLE_PREFIX: &str = "option-";

/// A complete flow as supplied by the editor or backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl FlowDocument {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            id: None,
            name: None,
            nodes,
            edges,
        }
    }

    /// Parse a flow from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| FlowError::FlowLoad(e.to_string()))
    }

    /// Load a flow from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowError::FlowLoad(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }
}

/// Role of a node in the conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    #[default]
    Interaction,
    Condition,
    Action,
    End,
}

impl NodeKind {
    /// Parse an editor node type. Accepts `start`, `startNode`, `END`, ...
    /// Unknown types are interaction nodes.
    pub fn parse(raw: &str) -> Self {
        let lower = raw.trim().to_ascii_lowercase();
        let name = lower.strip_suffix("node").unwrap_or(&lower);
        match name {
            "start" => NodeKind::Start,
            "condition" => NodeKind::Condition,
            "action" => NodeKind::Action,
            "end" => NodeKind::End,
            _ => NodeKind::Interaction,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Interaction => "interaction",
            NodeKind::Condition => "condition",
            NodeKind::Action => "action",
            NodeKind::End => "end",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub label: Option<String>,
    pub elements: Vec<Element>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            label: None,
            elements: vec![],
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    pub fn with_elements(mut self, elements: Vec<Element>) -> Self {
        self.elements = elements;
        self
    }

    /// Find an element of this node by id.
    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn is_start(&self) -> bool {
        self.kind == NodeKind::Start
    }

    pub fn is_end(&self) -> bool {
        self.kind == NodeKind::End
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(default, rename = "type", alias = "kind", skip_serializing_if = "Option::is_none")]
    node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default)]
    elements: Vec<Element>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<RawNodeData>,
}

#[derive(Clone, Serialize, Deserialize)]
struct RawNodeData {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    elements: Option<Vec<Element>>,
}

impl From<RawNode> for Node {
    fn from(raw: RawNode) -> Self {
        let data = raw.data;
        // The editor keeps the semantic type under `data.type`; the top-level
        // type is the canvas renderer name unless the document was flattened.
        let kind = data
            .as_ref()
            .and_then(|d| d.node_type.as_deref())
            .or(raw.node_type.as_deref())
            .map(NodeKind::parse)
            .unwrap_or_default();
        let label = raw
            .label
            .or_else(|| data.as_ref().and_then(|d| d.label.clone()));
        let elements = if raw.elements.is_empty() {
            data.and_then(|d| d.elements).unwrap_or_default()
        } else {
            raw.elements
        };
        Node {
            id: raw.id,
            kind,
            label,
            elements,
        }
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        RawNode {
            id: node.id,
            node_type: Some(node.kind.as_str().to_string()),
            label: node.label,
            elements: node.elements,
            data: None,
        }
    }
}

/// A connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "source", alias = "sourceNodeId")]
    pub source_node_id: String,
    #[serde(rename = "target", alias = "targetNodeId")]
    pub target_node_id: String,
    #[serde(default, rename = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl Edge {
    /// Create a generic node-to-node edge.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_node_id: source.into(),
            target_node_id: target.into(),
            source_handle: None,
        }
    }

    /// Create an edge bound to option `index` of element `element_id`.
    pub fn for_option(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        element_id: &str,
        index: usize,
    ) -> Self {
        Self {
            source_handle: Some(OptionHandle::new(element_id, index).to_string()),
            ..Self::new(id, source, target)
        }
    }

    /// The option this edge originates from, if it is option-bound.
    pub fn option_handle(&self) -> Option<OptionHandle> {
        self.source_handle.as_deref().and_then(OptionHandle::parse)
    }

    /// Whether this edge is a generic edge. Any `option-` handle binds the
    /// edge to an option, even one that does not decode.
    pub fn is_generic(&self) -> bool {
        !self
            .source_handle
            .as_deref()
            .is_some_and(|h| h.starts_with(OPTION_HANDLE_PREFIX))
    }
}

/// Decoded `option-{elementId}-{optionIndex}` source handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionHandle {
    pub element_id: String,
    pub option_index: usize,
}

impl OptionHandle {
    pub fn new(element_id: impl Into<String>, option_index: usize) -> Self {
        Self {
            element_id: element_id.into(),
            option_index,
        }
    }

    /// Parse a source handle. Element ids may themselves contain `-`, so the
    /// index is taken from the last segment.
    pub fn parse(handle: &str) -> Option<Self> {
        let rest = handle.strip_prefix(OPTION_HANDLE_PREFIX)?;
        let (element_id, index) = rest.rsplit_once('-')?;
        if element_id.is_empty() {
            return None;
        }
        let option_index = index.parse().ok()?;
        Some(Self::new(element_id, option_index))
    }
}

impl fmt::Display for OptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}-{}", OPTION_HANDLE_PREFIX, self.element_id, self.option_index)
    }
}

/// Whether an element waits for its predecessor's reveal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    After,
    Simultaneous,
}

impl DisplayMode {
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("simultaneous") {
            DisplayMode::Simultaneous
        } else {
            DisplayMode::After
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayMode::After => "after",
            DisplayMode::Simultaneous => "simultaneous",
        }
    }
}

/// Kind of free-text input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    Text,
    Email,
    Number,
}

impl InputType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "email" => InputType::Email,
            "number" => InputType::Number,
            _ => InputType::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::Text => "text",
            InputType::Email => "email",
            InputType::Number => "number",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

impl MediaKind {
    /// Map an editor element or media type to a media kind.
    pub fn parse(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        // mediaType may be a MIME type such as `image/png`.
        let head = lower.split('/').next().unwrap_or_default();
        match head {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            "file" | "document" | "application" => Some(MediaKind::File),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::File => "file",
        }
    }
}

/// One selectable choice of a question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceOption {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
}

impl ChoiceOption {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            text: text.into(),
            target_node_id: None,
        }
    }

    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target_node_id = Some(target.into());
        self
    }
}

/// Kind of a form field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Email,
    Number,
    Tel,
    Date,
    Select,
    Checkbox,
    Radio,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl FormField {
    pub fn new(name: impl Into<String>, label: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind,
            required: false,
            options: vec![],
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }
}

/// Per-kind data of an element.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    Text,
    Question {
        options: Vec<ChoiceOption>,
    },
    Input {
        input_type: InputType,
        /// Destination attached by the editor to a non-question element.
        target: Option<String>,
    },
    Form {
        fields: Vec<FormField>,
        description: Option<String>,
        target: Option<String>,
    },
    Media {
        media_kind: MediaKind,
        url: Option<String>,
    },
}

/// One unit of content within a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawElement", into = "RawElement")]
pub struct Element {
    pub id: String,
    pub content: String,
    pub display_mode: DisplayMode,
    pub kind: ElementKind,
}

impl Element {
    fn with_kind(id: impl Into<String>, content: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            display_mode: DisplayMode::After,
            kind,
        }
    }

    pub fn text(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_kind(id, content, ElementKind::Text)
    }

    pub fn question(
        id: impl Into<String>,
        content: impl Into<String>,
        options: Vec<ChoiceOption>,
    ) -> Self {
        Self::with_kind(id, content, ElementKind::Question { options })
    }

    pub fn input(id: impl Into<String>, content: impl Into<String>, input_type: InputType) -> Self {
        Self::with_kind(
            id,
            content,
            ElementKind::Input {
                input_type,
                target: None,
            },
        )
    }

    pub fn form(id: impl Into<String>, content: impl Into<String>, fields: Vec<FormField>) -> Self {
        Self::with_kind(
            id,
            content,
            ElementKind::Form {
                fields,
                description: None,
                target: None,
            },
        )
    }

    pub fn media(
        id: impl Into<String>,
        caption: impl Into<String>,
        media_kind: MediaKind,
        url: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            id,
            caption,
            ElementKind::Media {
                media_kind,
                url: Some(url.into()),
            },
        )
    }

    /// Reveal together with the preceding element.
    pub fn simultaneous(mut self) -> Self {
        self.display_mode = DisplayMode::Simultaneous;
        self
    }

    /// Attach an explicit destination to an input or form element.
    /// Has no effect on other kinds.
    pub fn with_target(mut self, node_id: impl Into<String>) -> Self {
        match &mut self.kind {
            ElementKind::Input { target, .. } | ElementKind::Form { target, .. } => {
                *target = Some(node_id.into());
            }
            _ => {}
        }
        self
    }

    /// Whether sequencing halts after this element until the user responds.
    pub fn requires_input(&self) -> bool {
        match &self.kind {
            ElementKind::Question { options } => !options.is_empty(),
            ElementKind::Input { .. } => true,
            ElementKind::Form { fields, .. } => !fields.is_empty(),
            ElementKind::Text | ElementKind::Media { .. } => false,
        }
    }

    /// Options of a question; empty for every other kind.
    pub fn options(&self) -> &[ChoiceOption] {
        match &self.kind {
            ElementKind::Question { options } => options,
            _ => &[],
        }
    }

    /// Explicit destination of an input or form element.
    pub fn explicit_target(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::Input { target, .. } | ElementKind::Form { target, .. } => {
                target.as_deref()
            }
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ElementKind::Text => "text",
            ElementKind::Question { .. } => "question",
            ElementKind::Input { .. } => "input",
            ElementKind::Form { .. } => "form",
            ElementKind::Media { media_kind, .. } => media_kind.as_str(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawElement {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    element_type: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    display_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<Vec<ChoiceOption>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    form_fields: Option<Vec<FormField>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    form_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl From<RawElement> for Element {
    fn from(raw: RawElement) -> Self {
        let mut options: Vec<ChoiceOption> = raw
            .options
            .unwrap_or_default()
            .into_iter()
            .map(|mut o| {
                o.target_node_id = non_empty(o.target_node_id);
                o
            })
            .collect();
        let first_target = options.first().and_then(|o| o.target_node_id.clone());

        let element_type = raw.element_type.trim().to_ascii_lowercase();
        let kind = match element_type.as_str() {
            "text" | "" => ElementKind::Text,
            "question" | "quick_replies" => ElementKind::Question {
                options: std::mem::take(&mut options),
            },
            "input" | "wait_input" => ElementKind::Input {
                input_type: raw
                    .input_type
                    .as_deref()
                    .map(InputType::parse)
                    .unwrap_or_default(),
                target: first_target,
            },
            "form" => {
                let mut fields = raw.form_fields.unwrap_or_default();
                for (i, field) in fields.iter_mut().enumerate() {
                    if field.name.trim().is_empty() {
                        field.name = if field.label.trim().is_empty() {
                            format!("field{}", i + 1)
                        } else {
                            field.label.clone()
                        };
                    }
                }
                ElementKind::Form {
                    fields,
                    description: non_empty(raw.form_description),
                    target: first_target,
                }
            }
            other => {
                let media_kind = MediaKind::parse(other)
                    .or_else(|| raw.media_type.as_deref().and_then(MediaKind::parse));
                match media_kind {
                    Some(media_kind) => ElementKind::Media {
                        media_kind,
                        url: non_empty(raw.media_url),
                    },
                    None => {
                        debug!(element_id = %raw.id, element_type = other, "Unsupported element type, rendering as text");
                        ElementKind::Text
                    }
                }
            }
        };

        Element {
            id: raw.id,
            content: raw.content.unwrap_or_default(),
            display_mode: raw
                .display_mode
                .as_deref()
                .map(DisplayMode::parse)
                .unwrap_or_default(),
            kind,
        }
    }
}

impl From<Element> for RawElement {
    fn from(element: Element) -> Self {
        let mut raw = RawElement {
            id: element.id,
            element_type: String::new(),
            content: Some(element.content),
            display_mode: Some(element.display_mode.as_str().to_string()),
            ..Default::default()
        };
        let target_option = |target: Option<String>| {
            target.map(|t| {
                vec![ChoiceOption {
                    id: "target".to_string(),
                    text: String::new(),
                    target_node_id: Some(t),
                }]
            })
        };
        match element.kind {
            ElementKind::Text => raw.element_type = "text".to_string(),
            ElementKind::Question { options } => {
                raw.element_type = "question".to_string();
                raw.options = Some(options);
            }
            ElementKind::Input { input_type, target } => {
                raw.element_type = "input".to_string();
                raw.input_type = Some(input_type.as_str().to_string());
                raw.options = target_option(target);
            }
            ElementKind::Form {
                fields,
                description,
                target,
            } => {
                raw.element_type = "form".to_string();
                raw.form_fields = Some(fields);
                raw.form_description = description;
                raw.options = target_option(target);
            }
            ElementKind::Media { media_kind, url } => {
                raw.element_type = media_kind.as_str().to_string();
                raw.media_url = url;
            }
        }
        raw
    }
}
