pub mod coordinator;
pub mod dispatch;
pub mod driver;
pub mod graph;
pub mod resolver;
pub mod run_log;
pub mod sequencer;
pub mod session;
pub mod source;
pub mod validator;

pub use coordinator::{
    ConversationState, Coordinator, CoordinatorSettings, PendingStart, ResponseOutcome,
    StartTicket,
};
pub use dispatch::{telemetry_channel, TelemetryCall, TelemetryDispatcher, TelemetryOutbox};
pub use driver::{ConversationDriver, ConversationHandle, ConversationSnapshot, SessionClock};
pub use graph::{FlowGraph, GraphIssue, Severity};
pub use resolver::Resolution;
pub use run_log::TranscriptLogger;
pub use sequencer::{RevealPlan, Sequencer};
pub use session::SessionManager;
pub use source::FileFlowSource;
pub use validator::validate_response;
