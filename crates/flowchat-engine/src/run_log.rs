use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowchat_core::event::EventBus;
use flowchat_core::types::EngineEvent;

/// JSONL transcript logger.
///
/// Subscribes to a conversation's EventBus and writes one JSON object per
/// line to `{log_dir}/{label}/{timestamp}.jsonl`. Lines are flushed as they
/// are written, so a crash loses at most the event in flight.
///
/// `level` controls verbosity: 1 = lifecycle, 2 = messages, 3 = reveal steps.
pub struct TranscriptLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single line of the transcript.
#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl TranscriptLogger {
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log in a background task. Subscribing before the
    /// task runs means no early event is missed.
    pub fn spawn(self, event_bus: &EventBus, label: &str, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        let label = label.to_string();
        tokio::spawn(async move { self.run(rx, &label, cancel).await })
    }

    /// Write entries until cancellation or until the bus closes.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<EngineEvent>,
        label: &str,
        cancel: CancellationToken,
    ) {
        let log_path = match self.open_path(label).await {
            Some(p) => p,
            None => return,
        };

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open transcript file");
                return;
            }
        };

        info!(path = %log_path.display(), "Transcript logging started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut session_id: Option<String> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Transcript logger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            match &event {
                                EngineEvent::SessionStarted { session_id: id, .. } => {
                                    session_id = Some(id.to_string());
                                }
                                EngineEvent::Reset { session_id: Some(id) } => {
                                    session_id = Some(id.to_string());
                                }
                                _ => {}
                            }

                            let entry = self.event_to_entry(session_id.as_deref(), &event);
                            if matches!(event, EngineEvent::Reset { .. }) {
                                session_id = None;
                            }
                            let Some(entry) = entry else { continue };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write transcript entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush transcript");
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "Transcript logger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, transcript logger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "Transcript logger finished");
    }

    async fn open_path(&self, label: &str) -> Option<PathBuf> {
        let dir = self.log_dir.join(sanitize_label(label));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(error = %e, dir = %dir.display(), "Failed to create transcript directory");
            return None;
        }
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%.3f").to_string();
        Some(dir.join(format!("{}.jsonl", timestamp)))
    }

    /// Convert an event to a transcript line, or `None` if the level filters it.
    fn event_to_entry(&self, session_id: Option<&str>, event: &EngineEvent) -> Option<LogEntry> {
        let (node_id, detail) = match event {
            // L1: lifecycle
            EngineEvent::SessionStarted { start_node_id, .. } => {
                (Some(start_node_id.clone()), None)
            }
            EngineEvent::Ended { reason, message } => (
                None,
                Some(serde_json::json!({ "reason": reason, "message": message })),
            ),
            EngineEvent::Fatal { error, message } => (
                None,
                Some(serde_json::json!({ "error": error, "message": message })),
            ),
            EngineEvent::Reset { .. } => (None, None),

            // L2: what the visitor saw and said
            EngineEvent::Revealed { node_id, element } if self.level >= 2 => (
                Some(node_id.clone()),
                Some(serde_json::json!({
                    "element_id": element.id,
                    "type": element.type_name(),
                    "content": truncate_str(&element.content, 500),
                })),
            ),
            EngineEvent::UserMessage { node_id, content } if self.level >= 2 => (
                Some(node_id.clone()),
                Some(serde_json::json!({ "content": truncate_str(content, 500) })),
            ),
            EngineEvent::Unmatched { node_id, message } if self.level >= 2 => (
                Some(node_id.clone()),
                Some(serde_json::json!({ "message": message })),
            ),
            EngineEvent::InputRejected {
                node_id,
                element_id,
                error,
            } if self.level >= 2 => (
                Some(node_id.clone()),
                Some(serde_json::json!({
                    "element_id": element_id,
                    "error": error.to_string(),
                })),
            ),
            EngineEvent::UnknownTarget { node_id, target } if self.level >= 2 => (
                Some(node_id.clone()),
                Some(serde_json::json!({ "target": target })),
            ),

            // L3: sequencing steps
            EngineEvent::NodeEntered { node_id, kind } if self.level >= 3 => (
                Some(node_id.clone()),
                Some(serde_json::json!({ "kind": kind.as_str() })),
            ),
            EngineEvent::Revealing {
                node_id,
                element_id,
            } if self.level >= 3 => (
                Some(node_id.clone()),
                Some(serde_json::json!({ "element_id": element_id })),
            ),
            EngineEvent::AwaitingInput { node_id, element } if self.level >= 3 => (
                Some(node_id.clone()),
                Some(serde_json::json!({ "element_id": element.id })),
            ),

            _ => return None,
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.map(str::to_string),
            event_type: event.name().to_string(),
            node_id,
            detail,
        })
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

/// Truncate on a char boundary.
fn truncate_str(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Transcript files under `log_dir/label`, oldest first.
pub fn list_transcripts(log_dir: &Path, label: &str) -> std::io::Result<Vec<PathBuf>> {
    let dir = log_dir.join(sanitize_label(label));
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_core::flow::{Element, NodeKind};
    use flowchat_core::types::{EndReason, SessionId};

    fn revealed() -> EngineEvent {
        EngineEvent::Revealed {
            node_id: "n1".into(),
            element: Element::text("t", "Hello"),
        }
    }

    fn entered() -> EngineEvent {
        EngineEvent::NodeEntered {
            node_id: "n1".into(),
            kind: NodeKind::Interaction,
        }
    }

    #[test]
    fn test_entry_skips_empty_fields() {
        let logger = TranscriptLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .event_to_entry(None, &EngineEvent::Reset { session_id: None })
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"reset\""));
        assert!(!json.contains("session_id"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let l1 = TranscriptLogger::new(PathBuf::from("/tmp"), 1);
        let ended = EngineEvent::Ended {
            reason: EndReason::Terminal { node_id: "end".into() },
            message: None,
        };
        assert!(l1.event_to_entry(Some("s"), &ended).is_some());
        assert!(l1.event_to_entry(Some("s"), &revealed()).is_none());
        assert!(l1.event_to_entry(Some("s"), &entered()).is_none());

        let l2 = TranscriptLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry(Some("s"), &revealed()).is_some());
        assert!(l2.event_to_entry(Some("s"), &entered()).is_none());

        let l3 = TranscriptLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry(Some("s"), &entered()).is_some());
    }

    #[test]
    fn test_truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "hé...");
        assert_eq!(truncate_str("short", 10), "short");
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("asst/1 x"), "asst_1_x");
        assert_eq!(sanitize_label(""), "default");
    }

    #[tokio::test]
    async fn test_writes_jsonl_until_bus_closes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let task = TranscriptLogger::new(dir.path().to_path_buf(), 2).spawn(
            &bus,
            "asst-1",
            CancellationToken::new(),
        );

        bus.publish(EngineEvent::SessionStarted {
            session_id: SessionId::from_str("s-42"),
            start_node_id: "start".into(),
        });
        bus.publish(entered());
        bus.publish(revealed());
        bus.publish(EngineEvent::Reset {
            session_id: Some(SessionId::from_str("s-42")),
        });
        bus.publish(EngineEvent::Reset { session_id: None });
        drop(bus);
        task.await.unwrap();

        let files = list_transcripts(dir.path(), "asst-1").unwrap();
        assert_eq!(files.len(), 1);
        let text = std::fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let types: Vec<&str> = lines.iter().map(|l| l["event_type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["session_started", "revealed", "reset", "reset"]);
        assert_eq!(lines[1]["session_id"], "s-42");
        assert_eq!(lines[1]["detail"]["content"], "Hello");
        assert_eq!(lines[2]["session_id"], "s-42");
        assert!(lines[3].get("session_id").is_none());
    }
}
