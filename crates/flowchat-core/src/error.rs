use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph errors
    #[error("No start node in flow (found {found} nodes of kind start)")]
    NoStartNode { found: usize },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Flow document could not be loaded: {0}")]
    FlowLoad(String),

    // Session errors
    #[error("Session could not be created: {0}")]
    SessionCreate(String),

    #[error("Session is not awaiting input (state: {state})")]
    NotAwaitingInput { state: String },

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session has ended")]
    SessionEnded,

    #[error("Conversation closed")]
    Closed,

    // Response errors
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    // Telemetry errors
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // HTTP errors
    #[error("HTTP request failed: {0}")]
    Http(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Whether this error ends the conversation before it can start.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FlowError::NoStartNode { .. } | FlowError::SessionCreate(_) | FlowError::FlowLoad(_)
        )
    }
}

/// Reasons a user response is rejected before it reaches the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("required")]
    Required,

    #[error("invalid email address")]
    Email,

    #[error("not a number")]
    Number,

    #[error("field '{field}' is required")]
    MissingField { field: String },

    #[error("field '{field}': {reason}")]
    Field { field: String, reason: String },

    #[error("'{value}' is not one of the options for '{field}'")]
    NotAnOption { field: String, value: String },

    #[error("expected {expected} response")]
    UnexpectedResponse { expected: &'static str },
}

pub type Result<T> = std::result::Result<T, FlowError>;
