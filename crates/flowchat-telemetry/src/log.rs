use futures::future::BoxFuture;
use tracing::info;

use flowchat_core::error::Result;
use flowchat_core::traits::TelemetryPort;
use flowchat_core::types::{Message, NodeVisit, SessionId, UserInfo};

/// Telemetry that only writes tracing events. Session ids are fresh UUIDs.
#[derive(Default)]
pub struct LogTelemetry;

impl LogTelemetry {
    pub fn new() -> Self {
        Self
    }
}

impl TelemetryPort for LogTelemetry {
    fn name(&self) -> &str {
        "log"
    }

    fn create_session(
        &self,
        assistant_id: String,
        user_info: UserInfo,
    ) -> BoxFuture<'_, Result<SessionId>> {
        Box::pin(async move {
            let session_id = SessionId::new();
            info!(
                session_id = %session_id,
                assistant_id = %assistant_id,
                user_fields = user_info.len(),
                "telemetry: session created"
            );
            Ok(session_id)
        })
    }

    fn record_node_visit(&self, visit: NodeVisit) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(
                session_id = %visit.session_id,
                node_id = %visit.node_id,
                kind = %visit.node_kind,
                spent_ms = visit.time_spent_on_previous_node_ms,
                "telemetry: node visit"
            );
            Ok(())
        })
    }

    fn record_message(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(
                session_id = %message.session_id,
                sender = message.sender.as_str(),
                content_type = message.content_type.as_str(),
                node_id = message.node_id.as_deref().unwrap_or("-"),
                content = %message.content,
                "telemetry: message"
            );
            Ok(())
        })
    }

    fn end_session(&self, session_id: SessionId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(session_id = %session_id, "telemetry: session ended");
            Ok(())
        })
    }
}

/// Telemetry that discards everything.
#[derive(Default)]
pub struct NullTelemetry;

impl TelemetryPort for NullTelemetry {
    fn name(&self) -> &str {
        "none"
    }

    fn create_session(&self, _: String, _: UserInfo) -> BoxFuture<'_, Result<SessionId>> {
        Box::pin(async { Ok(SessionId::new()) })
    }

    fn record_node_visit(&self, _: NodeVisit) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn record_message(&self, _: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn end_session(&self, _: SessionId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sessions_get_distinct_ids() {
        let log = LogTelemetry::new();
        let a = log.create_session("asst".into(), UserInfo::new()).await.unwrap();
        let b = log.create_session("asst".into(), UserInfo::new()).await.unwrap();
        assert_ne!(a, b);
        assert!(log.end_session(a).await.is_ok());
    }
}
