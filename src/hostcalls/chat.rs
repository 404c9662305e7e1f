//! Chat completion with tool calling
//!
//! Drives one conversation against the completion provider: send the
//! memory, run whatever tools the model asks for, feed the results back,
//! repeat until the model stops or the iteration bound is hit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use super::comm::{CommError, InvocationInfo};
use crate::llm::{
    ChatCompletionRequest, ChatMessage, CompletionProvider, EndpointKind, LlmError, Tool, ToolCall,
};
use crate::metrics::{CHAT_ITERATIONS, TOOL_CALLS};
use crate::tools::{decode_tool_name, ToolError, ToolId, ToolKind, ToolRegistry};
use crate::transport::Method;

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Tool results longer than this are shortened in the log only
const LOG_TRUNCATE: usize = 512;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Provider(#[from] LlmError),
    #[error("no choices found")]
    NoChoices,
    #[error("multiple choices found ({0})")]
    MultipleChoices(usize),
    #[error("index mismatch: {0}")]
    IndexMismatch(u32),
    #[error("unexpected content alongside tool calls")]
    UnexpectedContent,
    #[error("unexpected tool calls")]
    UnexpectedToolCalls,
    #[error("tools are not supported by this transform")]
    ToolsNotSupported,
    #[error("unexpected reason: {0}")]
    UnexpectedReason(String),
    #[error("max count reached after {0} iterations")]
    MaxIterations(usize),
    #[error("error unmarshalling tool call arguments: {0}")]
    Arguments(#[from] serde_json::Error),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Role/content pair as sent by the guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Reference to a tool the model may call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolRef {
    #[serde(rename = "type")]
    pub kind: ToolKind,
    pub id: ToolId,
}

/// `params` of a chat transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<InputMessage>,
    #[serde(default)]
    pub tools: Vec<ToolRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMetadata {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// One entry of the conversation memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub content: String,
    pub metadata: ChatMetadata,
}

impl ChatEntry {
    fn to_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.metadata.role.clone(),
            content: self.content.clone(),
            tool_call_id: self.metadata.tool_call_id.clone(),
            tool_calls: self.metadata.tool_calls.clone(),
        }
    }
}

/// Transform response body for chat transforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub messages: Vec<ChatEntry>,
}

/// Append-only conversation memory
#[derive(Debug, Clone, Default)]
pub struct ChatCompletionMemory {
    entries: Vec<ChatEntry>,
}

impl ChatCompletionMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ChatEntry) {
        self.entries.push(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    fn messages(&self) -> Vec<ChatMessage> {
        self.entries.iter().map(ChatEntry::to_message).collect()
    }

    /// Everything appended after the first `seed` entries
    pub fn into_entries_after(mut self, seed: usize) -> Vec<ChatEntry> {
        self.entries.split_off(seed.min(self.entries.len()))
    }
}

/// Body of a `tool.invoke` request sent to the task owning an internal tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvokeRequest {
    pub tool_id: ToolId,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvokeResponse {
    pub result: Value,
}

fn truncate_for_log(s: &str) -> String {
    if s.len() <= LOG_TRUNCATE {
        return s.to_string();
    }
    let mut end = LOG_TRUNCATE - 3;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

pub struct ChatLoop {
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<ToolRegistry>,
    max_iterations: usize,
}

impl ChatLoop {
    pub fn new(provider: Arc<dyn CompletionProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            provider,
            tools,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Run the conversation; returns the entries added after the seed
    pub async fn run(
        &self,
        inv: &InvocationInfo,
        request: ChatRequest,
        with_tools: bool,
    ) -> Result<Vec<ChatEntry>, ChatError> {
        let task_id = inv.task.id();
        if !with_tools && !request.tools.is_empty() {
            return Err(ChatError::ToolsNotSupported);
        }

        let span = info_span!("chat", task_id = %task_id, model = %request.model, with_tools);
        async {
            let mut memory = ChatCompletionMemory::new();
            for msg in &request.messages {
                memory.push(ChatEntry {
                    content: msg.content.clone(),
                    metadata: ChatMetadata {
                        role: msg.role.clone(),
                        ..Default::default()
                    },
                });
            }
            let seed = memory.len();

            let definitions = if with_tools {
                request
                    .tools
                    .iter()
                    .map(|t| self.tools.definition(&task_id, t.kind, t.id))
                    .collect::<Result<Vec<Tool>, _>>()?
            } else {
                Vec::new()
            };
            let kind = if with_tools {
                EndpointKind::ChatWithTools
            } else {
                EndpointKind::ChatOnly
            };

            info!(model = %request.model, tools = definitions.len(), "Starting chat completion");

            for iteration in 1..=self.max_iterations {
                let req = ChatCompletionRequest {
                    model: request.model.clone(),
                    messages: memory.messages(),
                    parallel_tool_calls: (!definitions.is_empty()).then_some(false),
                    tools: definitions.clone(),
                };

                let mut response = self
                    .provider
                    .chat_completion(kind, &req)
                    .instrument(info_span!("llm_call", iteration))
                    .await?;

                let choice = match response.choices.len() {
                    0 => return Err(ChatError::NoChoices),
                    1 => response.choices.remove(0),
                    n => return Err(ChatError::MultipleChoices(n)),
                };
                if choice.index != 0 {
                    return Err(ChatError::IndexMismatch(choice.index));
                }

                let reason = choice.finish_reason.clone().unwrap_or_default();
                let message = choice.message;

                if reason == "stop" || reason == "length" {
                    debug!(iteration, reason = %reason, "Chat completion finished");
                    memory.push(ChatEntry {
                        content: message.content,
                        metadata: ChatMetadata {
                            role: message.role,
                            reason: Some(reason),
                            ..Default::default()
                        },
                    });
                    CHAT_ITERATIONS.observe(iteration as f64);
                    return Ok(memory.into_entries_after(seed));
                }

                if reason == "tool_calls" || !message.tool_calls.is_empty() {
                    if !with_tools {
                        warn!("Unexpected tool calls");
                        return Err(ChatError::UnexpectedToolCalls);
                    }
                    if !message.content.is_empty() {
                        return Err(ChatError::UnexpectedContent);
                    }

                    let calls = message.tool_calls.clone();
                    memory.push(ChatEntry {
                        content: message.content,
                        metadata: ChatMetadata {
                            role: message.role,
                            tool_calls: message.tool_calls,
                            ..Default::default()
                        },
                    });

                    for call in calls {
                        let result = self.execute(inv, &call).await?;
                        info!(tool = %call.function.name, result = %truncate_for_log(&result), "Tool call response");
                        memory.push(ChatEntry {
                            content: result,
                            metadata: ChatMetadata {
                                role: "tool".to_string(),
                                tool_call_id: Some(call.id),
                                ..Default::default()
                            },
                        });
                    }
                    continue;
                }

                return Err(ChatError::UnexpectedReason(reason));
            }

            warn!(iterations = self.max_iterations, "Max iterations reached");
            CHAT_ITERATIONS.observe(self.max_iterations as f64);
            Err(ChatError::MaxIterations(self.max_iterations))
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, inv: &InvocationInfo, call: &ToolCall) -> Result<String, ChatError> {
        let args: Value = if call.function.arguments.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&call.function.arguments)?
        };
        let (kind, id) = decode_tool_name(&call.function.name)?;
        TOOL_CALLS.with_label_values(&[kind.as_str()]).inc();

        let result = match kind {
            ToolKind::Builtin => {
                let tool = self
                    .tools
                    .builtin(id)
                    .ok_or(ToolError::NotFound { kind, id })?;
                tool.call(args).await?
            }
            ToolKind::Internal => {
                let task_id = inv.task.id();
                if self.tools.internal(&task_id, id).is_none() {
                    return Err(ToolError::NotFound { kind, id }.into());
                }
                invoke_internal(inv, id, args).await?
            }
            ToolKind::Normal => self.tools.forward_normal(id, args).await?,
        };
        Ok(result)
    }
}

/// Ask the owning task to run one of its internal tools
async fn invoke_internal(inv: &InvocationInfo, id: ToolId, params: Value) -> Result<String, ToolError> {
    let body = serde_json::to_vec(&ToolInvokeRequest { tool_id: id, params })
        .map_err(|e| ToolError::Invoke(e.to_string()))?;
    let response = inv
        .comm
        .send_request(inv.task.as_ref(), Method::ToolInvoke, body)
        .await
        .map_err(|e: CommError| ToolError::Invoke(e.to_string()))?;
    let parsed: ToolInvokeResponse = serde_json::from_slice(&response.payload)
        .map_err(|e| ToolError::Invoke(format!("bad tool.invoke response: {}", e)))?;
    Ok(match parsed.result {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_for_log() {
        let short = "x".repeat(LOG_TRUNCATE);
        assert_eq!(truncate_for_log(&short), short);

        let long = "y".repeat(LOG_TRUNCATE + 1);
        let out = truncate_for_log(&long);
        assert_eq!(out.len(), LOG_TRUNCATE);
        assert!(out.ends_with("..."));

        // never splits a multi-byte character
        let wide = "é".repeat(LOG_TRUNCATE);
        assert!(truncate_for_log(&wide).ends_with("..."));
    }

    #[test]
    fn test_chat_request_parses_tool_refs() {
        let body = r#"{
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "what time is it"}],
            "tools": [{"type": "builtin", "id": 1}, {"type": "internal", "id": 0}]
        }"#;
        let req: ChatRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.tools[0], ToolRef { kind: ToolKind::Builtin, id: 1 });
        assert_eq!(req.tools[1].kind, ToolKind::Internal);
    }

    #[test]
    fn test_entry_metadata_skips_empty_fields() {
        let entry = ChatEntry {
            content: "hi".to_string(),
            metadata: ChatMetadata {
                role: "assistant".to_string(),
                reason: Some("stop".to_string()),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["metadata"]["reason"], "stop");
        assert!(json["metadata"].get("tool_calls").is_none());
        assert!(json["metadata"].get("tool_call_id").is_none());
    }

    #[test]
    fn test_memory_keeps_only_entries_after_seed() {
        let mut mem = ChatCompletionMemory::new();
        for i in 0..3 {
            mem.push(ChatEntry {
                content: i.to_string(),
                metadata: ChatMetadata::default(),
            });
        }
        let new = mem.into_entries_after(2);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].content, "2");
    }
}
