use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use flowchat_core::error::{FlowError, Result};
use flowchat_core::flow::NodeKind;
use flowchat_core::traits::TelemetryPort;
use flowchat_core::types::{
    ContentType, Message, NodeVisit, Sender, Session, SessionId, SessionStatus, UserInfo,
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        assistant_id TEXT NOT NULL,
        user_info TEXT NOT NULL,
        status TEXT NOT NULL,
        current_node_id TEXT,
        started_at TEXT NOT NULL,
        last_node_entered_at TEXT NOT NULL,
        ended_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_assistant
        ON sessions(assistant_id, started_at);

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        sender TEXT NOT NULL,
        content TEXT NOT NULL,
        content_type TEXT NOT NULL,
        node_id TEXT,
        metadata TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_session
        ON messages(session_id, id);

    CREATE TABLE IF NOT EXISTS node_visits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        node_kind TEXT NOT NULL,
        time_spent_ms INTEGER NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_node_visits_session
        ON node_visits(session_id, id);";

/// A stored session with its transcript size.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session: Session,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: usize,
}

/// SQLite-backed telemetry: sessions, their transcripts and node visits.
pub struct SqliteTelemetry {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> FlowError {
    FlowError::Database(e.to_string())
}

const SESSION_SELECT: &str = "SELECT s.id, s.assistant_id, s.status, s.current_node_id,
        s.started_at, s.last_node_entered_at, s.ended_at,
        (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
    FROM sessions s";

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionSummary> {
    let status: String = row.get(2)?;
    let started_at: String = row.get(4)?;
    let last_entered: String = row.get(5)?;
    let ended_at: Option<String> = row.get(6)?;
    let count: i64 = row.get(7)?;
    Ok(SessionSummary {
        session: Session {
            id: SessionId(row.get(0)?),
            assistant_id: row.get(1)?,
            current_node_id: row.get(3)?,
            started_at: parse_ts(&started_at),
            last_node_entered_at: parse_ts(&last_entered),
            status: SessionStatus::parse(&status).unwrap_or_default(),
        },
        ended_at: ended_at.as_deref().map(parse_ts),
        message_count: count.max(0) as usize,
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteTelemetry {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets transcript queries run while a conversation writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite telemetry opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }

    /// Most recent sessions first.
    pub fn list_sessions(
        &self,
        assistant_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE ?1 IS NULL OR s.assistant_id = ?1
                 ORDER BY s.started_at DESC, s.rowid DESC
                 LIMIT ?2",
                SESSION_SELECT
            ))
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![assistant_id, limit as i64], summary_from_row)
            .map_err(db_err)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.map_err(db_err)?);
        }
        Ok(sessions)
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionSummary>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{} WHERE s.id = ?1", SESSION_SELECT),
            params![session_id.as_str()],
            summary_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// A session's transcript in recording order.
    pub fn load_messages(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT sender, content, content_type, node_id, metadata, timestamp
                 FROM messages
                 WHERE session_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![session_id.as_str()], |row| {
                let sender: String = row.get(0)?;
                let content: String = row.get(1)?;
                let content_type: String = row.get(2)?;
                let node_id: Option<String> = row.get(3)?;
                let metadata: String = row.get(4)?;
                let ts: String = row.get(5)?;
                Ok((sender, content, content_type, node_id, metadata, ts))
            })
            .map_err(db_err)?;

        let mut messages = Vec::new();
        for row in rows {
            let (sender, content, content_type, node_id, metadata, ts) = row.map_err(db_err)?;
            messages.push(Message {
                session_id: session_id.clone(),
                sender: Sender::parse(&sender).unwrap_or(Sender::Bot),
                content,
                content_type: ContentType::parse(&content_type),
                node_id,
                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                timestamp: parse_ts(&ts),
            });
        }
        Ok(messages)
    }

    /// A session's node visits in recording order.
    pub fn load_node_visits(&self, session_id: &SessionId) -> Result<Vec<NodeVisit>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT node_id, node_kind, time_spent_ms, timestamp
                 FROM node_visits
                 WHERE session_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![session_id.as_str()], |row| {
                let node_id: String = row.get(0)?;
                let kind: String = row.get(1)?;
                let spent: i64 = row.get(2)?;
                let ts: String = row.get(3)?;
                Ok((node_id, kind, spent, ts))
            })
            .map_err(db_err)?;

        let mut visits = Vec::new();
        for row in rows {
            let (node_id, kind, spent, ts) = row.map_err(db_err)?;
            visits.push(NodeVisit {
                session_id: session_id.clone(),
                node_id,
                node_kind: NodeKind::parse(&kind),
                time_spent_on_previous_node_ms: spent.max(0) as u64,
                timestamp: parse_ts(&ts),
            });
        }
        Ok(visits)
    }
}

impl TelemetryPort for SqliteTelemetry {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn create_session(
        &self,
        assistant_id: String,
        user_info: UserInfo,
    ) -> BoxFuture<'_, Result<SessionId>> {
        Box::pin(async move {
            let session_id = SessionId::new();
            let now = Utc::now().to_rfc3339();
            let user_info = serde_json::to_string(&user_info)?;
            let conn = self
                .lock()
                .map_err(|e| FlowError::SessionCreate(e.to_string()))?;
            conn.execute(
                "INSERT INTO sessions
                    (id, assistant_id, user_info, status, started_at, last_node_entered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    session_id.as_str(),
                    assistant_id,
                    user_info,
                    SessionStatus::Active.as_str(),
                    now
                ],
            )
            .map_err(|e| FlowError::SessionCreate(e.to_string()))?;
            debug!(session_id = %session_id, assistant_id = %assistant_id, "Session stored");
            Ok(session_id)
        })
    }

    fn record_node_visit(&self, visit: NodeVisit) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let ts = visit.timestamp.to_rfc3339();
            let mut conn = self.lock()?;
            // Both statements or neither, so a retried call inserts once.
            let tx = conn.transaction().map_err(db_err)?;
            tx.execute(
                "INSERT INTO node_visits (session_id, node_id, node_kind, time_spent_ms, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    visit.session_id.as_str(),
                    visit.node_id,
                    visit.node_kind.as_str(),
                    visit.time_spent_on_previous_node_ms as i64,
                    ts
                ],
            )
            .map_err(db_err)?;
            tx.execute(
                "UPDATE sessions SET current_node_id = ?2, last_node_entered_at = ?3 WHERE id = ?1",
                params![visit.session_id.as_str(), visit.node_id, ts],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)
        })
    }

    fn record_message(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let metadata = serde_json::to_string(&message.metadata)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO messages
                    (session_id, sender, content, content_type, node_id, metadata, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.session_id.as_str(),
                    message.sender.as_str(),
                    message.content,
                    message.content_type.as_str(),
                    message.node_id,
                    metadata,
                    message.timestamp.to_rfc3339()
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn end_session(&self, session_id: SessionId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let updated = conn
                .execute(
                    "UPDATE sessions SET status = ?2, ended_at = COALESCE(ended_at, ?3) WHERE id = ?1",
                    params![
                        session_id.as_str(),
                        SessionStatus::Completed.as_str(),
                        Utc::now().to_rfc3339()
                    ],
                )
                .map_err(db_err)?;
            if updated == 0 {
                return Err(FlowError::Telemetry(format!("unknown session {}", session_id)));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(session_id: &SessionId, sender: Sender, content: &str) -> Message {
        Message {
            session_id: session_id.clone(),
            sender,
            content: content.to_string(),
            content_type: ContentType::Text,
            node_id: Some("ask".into()),
            metadata: json!({ "elementId": "hi" }),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_store_and_load_transcript() {
        let store = SqliteTelemetry::in_memory().unwrap();
        let sid = store
            .create_session("asst-1".into(), UserInfo::new())
            .await
            .unwrap();

        store.record_message(message(&sid, Sender::Bot, "Hi")).await.unwrap();
        store.record_message(message(&sid, Sender::User, "yes")).await.unwrap();

        let transcript = store.load_messages(&sid).unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].sender, Sender::Bot);
        assert_eq!(transcript[1].content, "yes");
        assert_eq!(transcript[0].metadata["elementId"], "hi");
    }

    #[tokio::test]
    async fn test_node_visit_moves_current_node() {
        let store = SqliteTelemetry::in_memory().unwrap();
        let sid = store
            .create_session("asst-1".into(), UserInfo::new())
            .await
            .unwrap();
        store
            .record_node_visit(NodeVisit {
                session_id: sid.clone(),
                node_id: "ask".into(),
                node_kind: NodeKind::Interaction,
                time_spent_on_previous_node_ms: 1200,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let visits = store.load_node_visits(&sid).unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].node_kind, NodeKind::Interaction);
        assert_eq!(visits[0].time_spent_on_previous_node_ms, 1200);

        let summary = store.get_session(&sid).unwrap().unwrap();
        assert_eq!(summary.session.current_node_id.as_deref(), Some("ask"));
        assert_eq!(summary.session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_failed_node_visit_leaves_no_row() {
        let store = SqliteTelemetry::in_memory().unwrap();
        let sid = store
            .create_session("asst-1".into(), UserInfo::new())
            .await
            .unwrap();
        store
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER block_update BEFORE UPDATE ON sessions
                 BEGIN SELECT RAISE(ABORT, 'sessions locked'); END;",
            )
            .unwrap();

        let visit = NodeVisit {
            session_id: sid.clone(),
            node_id: "ask".into(),
            node_kind: NodeKind::Interaction,
            time_spent_on_previous_node_ms: 0,
            timestamp: Utc::now(),
        };
        assert!(store.record_node_visit(visit.clone()).await.is_err());
        assert!(store.load_node_visits(&sid).unwrap().is_empty());

        store
            .lock()
            .unwrap()
            .execute_batch("DROP TRIGGER block_update;")
            .unwrap();
        store.record_node_visit(visit).await.unwrap();
        assert_eq!(store.load_node_visits(&sid).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_end_session_sets_status_once() {
        let store = SqliteTelemetry::in_memory().unwrap();
        let sid = store
            .create_session("asst-1".into(), UserInfo::new())
            .await
            .unwrap();
        store.end_session(sid.clone()).await.unwrap();
        let first = store.get_session(&sid).unwrap().unwrap();
        assert_eq!(first.session.status, SessionStatus::Completed);
        let ended_at = first.ended_at.unwrap();

        store.end_session(sid.clone()).await.unwrap();
        let second = store.get_session(&sid).unwrap().unwrap();
        assert_eq!(second.ended_at, Some(ended_at));

        assert!(store.end_session(SessionId::from_str("nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_sessions_filters_and_counts() {
        let store = SqliteTelemetry::in_memory().unwrap();
        let a = store.create_session("asst-a".into(), UserInfo::new()).await.unwrap();
        let _b = store.create_session("asst-b".into(), UserInfo::new()).await.unwrap();
        store.record_message(message(&a, Sender::Bot, "Hi")).await.unwrap();

        assert_eq!(store.list_sessions(None, 10).unwrap().len(), 2);
        let only_a = store.list_sessions(Some("asst-a"), 10).unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].session.id, a);
        assert_eq!(only_a[0].message_count, 1);
        assert_eq!(store.list_sessions(None, 1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_creates_file_with_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowchat.db");
        let store = SqliteTelemetry::open(&path).unwrap();
        store.create_session("asst".into(), UserInfo::new()).await.unwrap();
        assert!(path.exists());
    }
}
