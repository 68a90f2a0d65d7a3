//! Client for the Gemini generateContent REST API.
//!
//! Covers the two call shapes the app needs: a plain request/reply call for
//! the CLI chat, and a server-sent-events stream for the web chat. Streamed
//! fragments are handed to the caller over an mpsc channel in arrival order.

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// One role-tagged unit of conversation content, in Gemini wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part::text(text)],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part::text(text)],
        }
    }

    /// The model's own record of a tool invocation.
    pub fn model_function_call(call: FunctionCall) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part {
                function_call: Some(call),
                ..Default::default()
            }],
        }
    }

    /// A tool result sent back so the model can continue generating.
    pub fn function_response(name: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part {
                function_response: Some(FunctionResponse {
                    name: name.into(),
                    response: serde_json::json!({ "content": result.into() }),
                }),
                ..Default::default()
            }],
        }
    }

    /// Concatenation of all text parts, in order.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect()
    }
}

/// A single part of a content. Exactly one field is expected to be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// A request from the model to execute a named local function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// The result of a local function, round-tripped back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: serde_json::Value,
}

/// Declared signature of a callable local function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub finish_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Text of the first candidate, empty when the reply carried none.
    pub fn first_text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.joined_text())
            .unwrap_or_default()
    }
}

/// One piece of a streamed response, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFragment {
    Text(String),
    FunctionCall(FunctionCall),
}

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("request to Gemini failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Gemini API error ({status}): {body}")]
    Api { status: StatusCode, body: String },
}

/// Thin handle over the Gemini REST endpoints. Cheap to clone.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    fn generate_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }

    /// Single request/reply call, used by the CLI chat and for tool-result
    /// continuations.
    pub async fn generate(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, GeminiError> {
        let response = self
            .http
            .post(self.generate_url())
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GeminiError::Api { status, body });
        }

        Ok(response.json::<GenerateContentResponse>().await?)
    }

    /// Streaming call. Fragments are sent into `tx` in arrival order; the
    /// receiver may stop consuming at any point (the remainder of the stream
    /// is then discarded, which is how the tool-call early break works).
    pub async fn stream_generate(
        &self,
        request: &GenerateContentRequest,
        tx: mpsc::Sender<StreamFragment>,
    ) -> Result<(), GeminiError> {
        let response = self
            .http
            .post(self.stream_url())
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GeminiError::Api { status, body });
        }

        let mut stream = response.bytes_stream();
        // SSE events can straddle chunk boundaries, so buffer until a full
        // line is available.
        let mut buf = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                for fragment in parse_sse_line(line.trim()) {
                    if tx.send(fragment).await.is_err() {
                        // Receiver stopped listening (tool call detected).
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

/// Parse one SSE line into zero or more fragments.
pub fn parse_sse_line(line: &str) -> Vec<StreamFragment> {
    let Some(data) = line.strip_prefix("data:") else {
        return Vec::new();
    };

    let chunk: GenerateContentResponse = match serde_json::from_str(data.trim()) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("Failed to parse SSE chunk: {} - Error: {}", data.trim(), e);
            return Vec::new();
        }
    };

    let Some(content) = chunk.candidates.into_iter().next().and_then(|c| c.content) else {
        return Vec::new();
    };

    content
        .parts
        .into_iter()
        .filter_map(|part| {
            if let Some(call) = part.function_call {
                Some(StreamFragment::FunctionCall(call))
            } else {
                part.text.map(StreamFragment::Text)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_in_gemini_wire_shape() {
        let request = GenerateContentRequest {
            contents: vec![Content::user_text("hi")],
            tools: Some(vec![Tool {
                function_declarations: vec![FunctionDeclaration {
                    name: "get_current_utc_time".to_string(),
                    description: "UTC time".to_string(),
                    parameters: serde_json::json!({"type": "OBJECT", "properties": {}}),
                }],
            }]),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(
            json["tools"][0]["functionDeclarations"][0]["name"],
            "get_current_utc_time"
        );
    }

    #[test]
    fn function_response_round_trip_shape() {
        let content = Content::function_response("get_current_utc_time", "2024-01-01 00:00:00 UTC");
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(
            json["parts"][0]["functionResponse"]["response"]["content"],
            "2024-01-01 00:00:00 UTC"
        );
    }

    #[test]
    fn parse_sse_line_extracts_text() {
        let line = r#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"Hello"}]}}]}"#;
        assert_eq!(
            parse_sse_line(line),
            vec![StreamFragment::Text("Hello".to_string())]
        );
    }

    #[test]
    fn parse_sse_line_extracts_function_call() {
        let line = r#"data: {"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"get_current_local_time","args":{"timezone_name":"Asia/Tokyo"}}}]}}]}"#;
        let fragments = parse_sse_line(line);
        match &fragments[..] {
            [StreamFragment::FunctionCall(call)] => {
                assert_eq!(call.name, "get_current_local_time");
                assert_eq!(call.args["timezone_name"], "Asia/Tokyo");
            }
            other => panic!("unexpected fragments: {other:?}"),
        }
    }

    #[test]
    fn parse_sse_line_ignores_non_data_lines_and_garbage() {
        assert!(parse_sse_line("").is_empty());
        assert!(parse_sse_line(": keep-alive").is_empty());
        assert!(parse_sse_line("data: not-json").is_empty());
    }

    #[test]
    fn first_text_concatenates_parts() {
        let response: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"a"},{"text":"b"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(response.first_text(), "ab");
    }
}
