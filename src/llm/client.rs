//! OpenAI-compatible chat completion client with tool calling support
//!
//! Works against any endpoint speaking the `/chat/completions` and
//! `/audio/speech` dialect (OpenAI, DeepSeek, Gaia nodes, local servers).

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::endpoints::{ApiEndpoint, EndpointKind, EndpointTable};
use crate::metrics::LLM_CALL_DURATION;

/// A message in a chat conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            ..Default::default()
        }
    }
}

// Assistant tool-call messages carry `"content": null`
fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

/// A tool call from the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

/// Function call details; `arguments` is a JSON document in a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// Tool definition for the model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub function: ToolFunction,
}

/// Function specification for a tool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Body of a text-to-speech call
#[derive(Debug, Clone, Serialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    pub voice: String,
    pub response_format: String,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no {kind:?} endpoint serves model {model}")]
    NoEndpoint { kind: EndpointKind, model: String },
    #[error("endpoint {endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("empty response from {0}")]
    EmptyResponse(String),
}

/// Anything that can answer chat completion and speech calls
///
/// The chat loop only sees this trait, so tests can script responses.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn chat_completion(
        &self,
        kind: EndpointKind,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError>;

    async fn text_to_speech(&self, request: &SpeechRequest) -> Result<Vec<u8>, LlmError>;
}

/// HTTP client resolving endpoints through an [`EndpointTable`]
#[derive(Clone)]
pub struct OpenAiClient {
    table: EndpointTable,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(table: EndpointTable) -> Self {
        Self {
            table,
            client: reqwest::Client::new(),
        }
    }

    fn pick(&self, kind: EndpointKind, model: &str) -> Result<ApiEndpoint, LlmError> {
        self.table
            .lookup(kind, model)
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::NoEndpoint {
                kind,
                model: model.to_string(),
            })
    }

    async fn post<T: Serialize>(
        &self,
        ep: &ApiEndpoint,
        body: &T,
    ) -> Result<reqwest::Response, LlmError> {
        let url = ep.endpoint_url();
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = ep.resolve_api_key().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(key);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                endpoint: ep.name.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiClient {
    async fn chat_completion(
        &self,
        kind: EndpointKind,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let ep = self.pick(kind, &request.model)?;
        info!(endpoint = %ep.name, model = %request.model, "Calling chat completion");

        let start = Instant::now();
        let text = self.post(&ep, request).await?.text().await?;
        LLM_CALL_DURATION
            .with_label_values(&[&request.model])
            .observe(start.elapsed().as_secs_f64());

        if text.is_empty() {
            return Err(LlmError::EmptyResponse(ep.name));
        }
        debug!(endpoint = %ep.name, bytes = text.len(), "Chat completion returned");
        Ok(serde_json::from_str(&text)?)
    }

    async fn text_to_speech(&self, request: &SpeechRequest) -> Result<Vec<u8>, LlmError> {
        let ep = self.pick(EndpointKind::TextToSpeech, &request.model)?;
        info!(endpoint = %ep.name, model = %request.model, voice = %request.voice, "Calling text to speech");
        let bytes = self.post(&ep, request).await?.bytes().await?;
        if bytes.is_empty() {
            return Err(LlmError::EmptyResponse(ep.name));
        }
        Ok(bytes.to_vec())
    }
}
