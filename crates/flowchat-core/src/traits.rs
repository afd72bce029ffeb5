use futures::future::BoxFuture;

use crate::error::Result;
use crate::flow::FlowDocument;
use crate::types::*;

/// Telemetry port: where sessions, node visits and messages are reported.
///
/// Only `create_session` is awaited by the engine. The other calls are
/// fire-and-forget: the engine queues them in order and a dispatcher
/// delivers them, logging and dropping failures.
pub trait TelemetryPort: Send + Sync + 'static {
    /// Backend name for logs and `doctor`.
    fn name(&self) -> &str;

    /// Create a session and return its id.
    fn create_session(
        &self,
        assistant_id: String,
        user_info: UserInfo,
    ) -> BoxFuture<'_, Result<SessionId>>;

    /// Record that a session entered a node.
    fn record_node_visit(&self, visit: NodeVisit) -> BoxFuture<'_, Result<()>>;

    /// Append one message to a session's transcript.
    fn record_message(&self, message: Message) -> BoxFuture<'_, Result<()>>;

    /// Mark a session ended.
    fn end_session(&self, session_id: SessionId) -> BoxFuture<'_, Result<()>>;
}

/// Supplies the flow document for an assistant.
pub trait FlowSource: Send + Sync + 'static {
    fn load_flow(&self, assistant_id: &str) -> BoxFuture<'_, Result<FlowDocument>>;
}
