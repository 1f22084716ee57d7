//! Call lifecycle endpoints.

use crate::{
    client::{Page, UltravoxClient, paging},
    error::ApiError,
};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

pub const DEFAULT_TEMPERATURE: f64 = 0.8;
pub const TEXT_OUTPUT_MEDIUM: &str = "MESSAGE_MEDIUM_TEXT";

/// Audio parameters for a call joined over a server WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerWebSocketMedium {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub client_buffer_size_ms: u32,
}

impl Default for ServerWebSocketMedium {
    fn default() -> Self {
        Self {
            input_sample_rate: 48_000,
            output_sample_rate: 48_000,
            client_buffer_size_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Medium {
    ServerWebSocket(ServerWebSocketMedium),
}

impl Default for Medium {
    fn default() -> Self {
        Medium::ServerWebSocket(ServerWebSocketMedium::default())
    }
}

/// Body of `POST calls`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallParams {
    pub system_prompt: String,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub selected_tools: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub initial_messages: Vec<Value>,
    pub initial_output_medium: String,
    pub medium: Medium,
    /// Additional top-level fields passed through unchanged.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CreateCallParams {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            temperature: DEFAULT_TEMPERATURE,
            voice: None,
            selected_tools: Vec::new(),
            initial_messages: Vec::new(),
            initial_output_medium: TEXT_OUTPUT_MEDIUM.to_string(),
            medium: Medium::default(),
            extra: Map::new(),
        }
    }
}

/// The part of a created call a realtime session needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: String,
    pub join_url: String,
}

/// A call as reported by `GET calls/{id}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub call_id: String,
    #[serde(default)]
    pub join_url: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub ended: Option<String>,
    #[serde(default)]
    pub end_reason: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Creates and tears down the calls a realtime session joins.
#[async_trait]
pub trait CallSessions: Send + Sync {
    async fn create_call_session(&self, params: CreateCallParams) -> Result<CallSession, ApiError>;

    async fn close_call_session(&self, call_id: &str) -> Result<(), ApiError>;
}

#[async_trait]
impl CallSessions for UltravoxClient {
    async fn create_call_session(&self, params: CreateCallParams) -> Result<CallSession, ApiError> {
        let call: CallSession = self
            .request(Method::POST, "calls", &[], Some(&params))
            .await?;
        info!(call_id = %call.call_id, "Created call");
        Ok(call)
    }

    async fn close_call_session(&self, call_id: &str) -> Result<(), ApiError> {
        self.send::<()>(Method::DELETE, &format!("calls/{call_id}"), &[], None)
            .await?;
        info!(%call_id, "Closed call");
        Ok(())
    }
}

impl UltravoxClient {
    pub async fn list_calls(&self, limit: u32, offset: u32) -> Result<Page<Call>, ApiError> {
        self.request::<(), _>(Method::GET, "calls", &paging(limit, offset), None)
            .await
    }

    pub async fn get_call(&self, call_id: &str) -> Result<Call, ApiError> {
        self.request::<(), _>(Method::GET, &format!("calls/{call_id}"), &[], None)
            .await
    }

    /// Messages exchanged during the call, oldest first.
    pub async fn get_call_messages(&self, call_id: &str) -> Result<Page<Value>, ApiError> {
        self.request::<(), _>(Method::GET, &format!("calls/{call_id}/messages"), &[], None)
            .await
    }

    /// Tools that were available to the call.
    pub async fn get_call_tools(&self, call_id: &str) -> Result<Page<Value>, ApiError> {
        self.request::<(), _>(Method::GET, &format!("calls/{call_id}/tools"), &[], None)
            .await
    }

    /// The call's audio recording, as served.
    pub async fn get_call_recording(&self, call_id: &str) -> Result<Vec<u8>, ApiError> {
        self.send::<()>(Method::GET, &format!("calls/{call_id}/recording"), &[], None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_server::serve_once;
    use serde_json::json;

    #[test]
    fn test_minimal_body_uses_websocket_text_defaults() {
        let body = serde_json::to_value(CreateCallParams::new("Be brief.")).unwrap();
        assert_eq!(
            body,
            json!({
                "systemPrompt": "Be brief.",
                "temperature": 0.8,
                "initialOutputMedium": "MESSAGE_MEDIUM_TEXT",
                "medium": {
                    "serverWebSocket": {
                        "inputSampleRate": 48000,
                        "outputSampleRate": 48000,
                        "clientBufferSizeMs": 30000,
                    }
                },
            })
        );
    }

    #[test]
    fn test_optional_fields_and_extras_are_passed_through() {
        let mut params = CreateCallParams::new("Hi");
        params.voice = Some("Mark".to_string());
        params.selected_tools = vec![json!({"toolName": "getSecretMenu"})];
        params.initial_messages = vec![json!({"role": "MESSAGE_ROLE_AGENT", "text": "Hello"})];
        params.extra.insert("maxDuration".to_string(), json!("600s"));

        let body = serde_json::to_value(&params).unwrap();
        assert_eq!(body["voice"], "Mark");
        assert_eq!(body["selectedTools"][0]["toolName"], "getSecretMenu");
        assert_eq!(body["initialMessages"][0]["text"], "Hello");
        assert_eq!(body["maxDuration"], "600s");
    }

    #[test]
    fn test_call_parses_and_keeps_unmodelled_fields() {
        let call: Call = serde_json::from_value(json!({
            "callId": "c-1",
            "created": "2024-05-01T10:00:00Z",
            "ended": null,
            "model": "fixie-ai/ultravox",
        }))
        .unwrap();
        assert_eq!(call.call_id, "c-1");
        assert_eq!(call.ended, None);
        assert_eq!(call.other["model"], "fixie-ai/ultravox");
    }

    #[tokio::test]
    async fn test_create_call_session_posts_body() {
        let (base_url, server) = serve_once(
            "201 Created",
            r#"{"callId":"c-42","joinUrl":"wss://voice.example/calls/c-42","created":"now"}"#,
        )
        .await;
        let client = UltravoxClient::with_base_url("key", &base_url).unwrap();

        let call = client
            .create_call_session(CreateCallParams::new("Be brief."))
            .await
            .unwrap();
        assert_eq!(
            call,
            CallSession {
                call_id: "c-42".to_string(),
                join_url: "wss://voice.example/calls/c-42".to_string(),
            }
        );

        let recorded = server.await.unwrap();
        assert_eq!(recorded.request_line(), "POST /api/calls HTTP/1.1");
        let body: Value = serde_json::from_str(&recorded.body).unwrap();
        assert_eq!(body["systemPrompt"], "Be brief.");
    }

    #[tokio::test]
    async fn test_close_call_session_accepts_empty_body() {
        let (base_url, server) = serve_once("204 No Content", "").await;
        let client = UltravoxClient::with_base_url("key", &base_url).unwrap();

        client.close_call_session("c-42").await.unwrap();
        let recorded = server.await.unwrap();
        assert_eq!(recorded.request_line(), "DELETE /api/calls/c-42 HTTP/1.1");
    }

    #[tokio::test]
    async fn test_list_calls_pages_through_calls() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"{"results":[{"callId":"c-1","endReason":"hangup"}],"next":"https://x/calls?offset=1","previous":null,"total":2}"#,
        )
        .await;
        let client = UltravoxClient::with_base_url("key", &base_url).unwrap();

        let page = client.list_calls(1, 0).await.unwrap();
        assert_eq!(page.results[0].call_id, "c-1");
        assert_eq!(page.results[0].end_reason.as_deref(), Some("hangup"));
        assert!(page.next.is_some());
        assert_eq!(page.total, Some(2));

        let recorded = server.await.unwrap();
        assert_eq!(
            recorded.request_line(),
            "GET /api/calls?limit=1&offset=0 HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn test_get_call_messages() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"{"results":[{"role":"MESSAGE_ROLE_AGENT","text":"Hi"}],"next":null}"#,
        )
        .await;
        let client = UltravoxClient::with_base_url("key", &base_url).unwrap();

        let page = client.get_call_messages("c-7").await.unwrap();
        assert_eq!(page.results[0]["text"], "Hi");
        assert_eq!(page.total, None);

        let recorded = server.await.unwrap();
        assert_eq!(
            recorded.request_line(),
            "GET /api/calls/c-7/messages HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn test_get_call_recording_returns_raw_body() {
        let (base_url, server) = serve_once("200 OK", "RIFF").await;
        let client = UltravoxClient::with_base_url("key", &base_url).unwrap();

        let audio = client.get_call_recording("c-7").await.unwrap();
        assert_eq!(audio, b"RIFF");

        let recorded = server.await.unwrap();
        assert_eq!(
            recorded.request_line(),
            "GET /api/calls/c-7/recording HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn test_missing_recording_surfaces_status() {
        let (base_url, _server) = serve_once("404 Not Found", r#"{"detail":"Not found."}"#).await;
        let client = UltravoxClient::with_base_url("key", &base_url).unwrap();

        let err = client.get_call_recording("c-8").await.unwrap_err();
        assert_eq!(err.status(), Some(reqwest::StatusCode::NOT_FOUND));
    }
}
