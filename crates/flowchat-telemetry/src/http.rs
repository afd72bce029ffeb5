use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use urlencoding::encode;

use flowchat_core::error::{FlowError, Result};
use flowchat_core::flow::FlowDocument;
use flowchat_core::traits::{FlowSource, TelemetryPort};
use flowchat_core::types::{Message, NodeVisit, SessionId, UserInfo};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for the product backend's session API. Also serves flows.
pub struct HttpBackend {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    assistant_id: &'a str,
    user_info: &'a UserInfo,
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    #[serde(alias = "_id", alias = "sessionId")]
    id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageRequest<'a> {
    sender: &'a str,
    content: &'a str,
    content_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<&'a str>,
    metadata: &'a serde_json::Value,
    timestamp: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeViewedRequest<'a> {
    node_type: &'a str,
    time_spent_on_previous_node: u64,
    timestamp: String,
}

/// Flow endpoint payload: either the document itself or wrapped in `flow`.
#[derive(Deserialize)]
#[serde(untagged)]
enum FlowResponse {
    Wrapped { flow: FlowDocument },
    Bare(FlowDocument),
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FlowError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| FlowError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(FlowError::Http(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }
}

/// Route of the node-viewed call. Ids are chosen by the backend or the
/// editor and are escaped as path segments.
fn node_viewed_path(session_id: &str, node_id: &str) -> String {
    format!(
        "/api/sessions/{}/nodes/{}/viewed",
        encode(session_id),
        encode(node_id)
    )
}

impl TelemetryPort for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn create_session(
        &self,
        assistant_id: String,
        user_info: UserInfo,
    ) -> BoxFuture<'_, Result<SessionId>> {
        Box::pin(async move {
            let body = CreateSessionRequest {
                assistant_id: &assistant_id,
                user_info: &user_info,
            };
            let req = self.http.post(self.url("/api/sessions/")).json(&body);
            let response = self
                .send(req)
                .await
                .map_err(|e| FlowError::SessionCreate(e.to_string()))?;
            let created: CreateSessionResponse = response
                .json()
                .await
                .map_err(|e| FlowError::SessionCreate(format!("bad response: {}", e)))?;
            debug!(session_id = %created.id, "Backend session created");
            Ok(SessionId(created.id))
        })
    }

    fn record_node_visit(&self, visit: NodeVisit) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let path = node_viewed_path(visit.session_id.as_str(), &visit.node_id);
            let body = NodeViewedRequest {
                node_type: visit.node_kind.as_str(),
                time_spent_on_previous_node: visit.time_spent_on_previous_node_ms,
                timestamp: visit.timestamp.to_rfc3339(),
            };
            self.send(self.http.post(self.url(&path)).json(&body)).await?;
            Ok(())
        })
    }

    fn record_message(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let path = format!("/api/sessions/{}/messages", encode(message.session_id.as_str()));
            let body = MessageRequest {
                sender: message.sender.as_str(),
                content: &message.content,
                content_type: message.content_type.as_str(),
                node_id: message.node_id.as_deref(),
                metadata: &message.metadata,
                timestamp: message.timestamp.to_rfc3339(),
            };
            self.send(self.http.post(self.url(&path)).json(&body)).await?;
            Ok(())
        })
    }

    fn end_session(&self, session_id: SessionId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let path = format!("/api/sessions/{}/end", encode(session_id.as_str()));
            self.send(self.http.put(self.url(&path))).await?;
            Ok(())
        })
    }
}

impl FlowSource for HttpBackend {
    fn load_flow(&self, assistant_id: &str) -> BoxFuture<'_, Result<FlowDocument>> {
        let path = format!("/api/assistants/{}/flow", encode(assistant_id));
        Box::pin(async move {
            let response = self
                .send(self.http.get(self.url(&path)))
                .await
                .map_err(|e| FlowError::FlowLoad(e.to_string()))?;
            let text = response
                .text()
                .await
                .map_err(|e| FlowError::FlowLoad(e.to_string()))?;
            match serde_json::from_str::<FlowResponse>(&text) {
                Ok(FlowResponse::Wrapped { flow }) | Ok(FlowResponse::Bare(flow)) => Ok(flow),
                Err(e) => Err(FlowError::FlowLoad(e.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowchat_core::types::{ContentType, Sender};
    use serde_json::json;

    #[test]
    fn test_base_url_and_key_normalized() {
        let backend = HttpBackend::new("https://api.example.com/", Some(String::new())).unwrap();
        assert_eq!(backend.base_url(), "https://api.example.com");
        assert_eq!(backend.url("/api/sessions/"), "https://api.example.com/api/sessions/");
        assert!(backend.api_key.is_none());
    }

    #[test]
    fn test_path_segments_are_escaped() {
        assert_eq!(
            node_viewed_path("s-1", "node-1_a.b"),
            "/api/sessions/s-1/nodes/node-1_a.b/viewed"
        );
        assert_eq!(
            node_viewed_path("s 1", "a/b?c"),
            "/api/sessions/s%201/nodes/a%2Fb%3Fc/viewed"
        );
    }

    #[test]
    fn test_message_payload_shape() {
        let message = Message {
            session_id: SessionId::from_str("s1"),
            sender: Sender::User,
            content: "yes".into(),
            content_type: ContentType::QuickReply,
            node_id: Some("ask".into()),
            metadata: json!({ "elementId": "q" }),
            timestamp: Utc::now(),
        };
        let body = MessageRequest {
            sender: message.sender.as_str(),
            content: &message.content,
            content_type: message.content_type.as_str(),
            node_id: message.node_id.as_deref(),
            metadata: &message.metadata,
            timestamp: message.timestamp.to_rfc3339(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["sender"], "user");
        assert_eq!(value["contentType"], "quick_reply");
        assert_eq!(value["nodeId"], "ask");
        assert_eq!(value["metadata"]["elementId"], "q");
    }

    #[test]
    fn test_session_response_accepts_id_aliases() {
        let a: CreateSessionResponse = serde_json::from_str(r#"{"_id":"abc"}"#).unwrap();
        let b: CreateSessionResponse = serde_json::from_str(r#"{"sessionId":"def"}"#).unwrap();
        assert_eq!(a.id, "abc");
        assert_eq!(b.id, "def");
    }

    #[test]
    fn test_flow_response_wrapped_or_bare() {
        let bare = r#"{"nodes":[{"id":"s","type":"start"}],"edges":[]}"#;
        let wrapped = format!(r#"{{"flow":{}}}"#, bare);
        for text in [bare.to_string(), wrapped] {
            let doc = match serde_json::from_str::<FlowResponse>(&text).unwrap() {
                FlowResponse::Wrapped { flow } | FlowResponse::Bare(flow) => flow,
            };
            assert_eq!(doc.nodes.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_session_create_error() {
        let backend = HttpBackend::new("http://127.0.0.1:9", None).unwrap();
        let result = backend.create_session("asst".into(), UserInfo::new()).await;
        assert!(matches!(result, Err(FlowError::SessionCreate(_))));
    }
}
