use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use flowchat_core::config::{PacingConfig, RetryConfig};
use flowchat_core::error::FlowError;
use flowchat_core::traits::FlowSource;
use flowchat_core::types::{EngineEvent, Response, Sender, SessionStatus};
use flowchat_engine::{
    ConversationDriver, ConversationState, CoordinatorSettings, FileFlowSource, FlowGraph,
    ResponseOutcome,
};
use flowchat_telemetry::SqliteTelemetry;
use flowchat_test_utils::{email_capture_flow, write_flow};

/// Wait for the first event matching `pred`.
async fn wait_for(
    events: &mut broadcast::Receiver<EngineEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event bus open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within timeout")
}

#[tokio::test]
async fn test_email_capture_conversation_is_recorded() {
    let (_flow_dir, flow_path) = write_flow(&email_capture_flow());
    let doc = FileFlowSource::new(&flow_path)
        .load_flow("support-bot")
        .await
        .expect("load flow");
    let graph = Arc::new(FlowGraph::new(doc));

    let db_dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(SqliteTelemetry::open(&db_dir.path().join("flowchat.db")).expect("open db"));

    let settings = CoordinatorSettings::new("support-bot").with_pacing(PacingConfig::instant());
    let (driver, handle) =
        ConversationDriver::build(graph, store.clone(), settings, RetryConfig::none());
    let mut events = handle.subscribe();
    let task = driver.spawn();

    let awaiting = wait_for(&mut events, |e| matches!(e, EngineEvent::AwaitingInput { .. })).await;
    match awaiting {
        EngineEvent::AwaitingInput { node_id, element } => {
            assert_eq!(node_id, "start");
            assert_eq!(element.id, "email");
        }
        other => panic!("unexpected event {:?}", other),
    }

    let rejected = handle.respond(Response::text("not-an-email")).await;
    assert!(matches!(rejected, Err(FlowError::InvalidInput(_))));
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(matches!(snapshot.state, ConversationState::AwaitingInput { .. }));
    let session_id = snapshot.session.expect("session").id;

    let outcome = handle
        .respond(Response::text("  jane@example.com "))
        .await
        .expect("respond");
    assert_eq!(
        outcome,
        ResponseOutcome::Advanced {
            node_id: "thanks".into()
        }
    );
    wait_for(&mut events, |e| matches!(e, EngineEvent::Ended { .. })).await;
    assert!(handle.snapshot().await.expect("snapshot").state.is_ended());

    // Leaving ends the session at the backend.
    handle.reset().await.expect("reset");
    handle.shutdown();
    task.await.expect("driver task");

    let summary = store
        .get_session(&session_id)
        .expect("query")
        .expect("session recorded");
    assert_eq!(summary.session.assistant_id, "support-bot");
    assert_eq!(summary.session.status, SessionStatus::Completed);
    assert!(summary.ended_at.is_some());

    let messages = store.load_messages(&session_id).expect("messages");
    let user: Vec<&str> = messages
        .iter()
        .filter(|m| m.sender == Sender::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(user, vec!["jane@example.com"]);
    let last = messages.last().expect("messages recorded");
    assert_eq!(last.sender, Sender::Bot);
    assert_eq!(last.content, "Thanks, we'll be in touch.");

    let visits = store.load_node_visits(&session_id).expect("visits");
    assert!(visits.iter().any(|v| v.node_id == "thanks"));
}
