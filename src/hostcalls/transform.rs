//! `transform` and `transform.config`
//!
//! A transform request names the input/output types and operations it
//! needs; the registry picks the most specific entry that covers them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::chat::{ChatLoop, ChatRequest, ChatResponse};
use super::comm::InvocationInfo;
use super::dispatcher::{HostCallError, HostCallResult};
use crate::task::TaskVar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformType {
    Text,
    Image,
    Audio,
    Video,
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOperation {
    Llm,
    Tools,
    Embeddings,
    TextToSpeech,
    SpeechToText,
    TextToImage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    #[serde(default)]
    pub input_types: Vec<TransformType>,
    #[serde(default)]
    pub output_types: Vec<TransformType>,
    #[serde(default)]
    pub operations: Vec<TransformOperation>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformConfigRequest {
    #[serde(default)]
    pub reset: bool,
    #[serde(default)]
    pub test: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfigResponse {
    pub result: String,
}

#[async_trait]
pub trait TransformHandler: Send + Sync {
    async fn transform(&self, inv: InvocationInfo, params: Value) -> HostCallResult;
}

pub struct TransformEntry {
    pub name: String,
    pub input_types: Vec<TransformType>,
    pub output_types: Vec<TransformType>,
    pub operations: Vec<TransformOperation>,
    pub handler: Arc<dyn TransformHandler>,
}

impl TransformEntry {
    fn covers(&self, req: &TransformRequest) -> bool {
        is_subset(&req.input_types, &self.input_types)
            && is_subset(&req.output_types, &self.output_types)
            && is_subset(&req.operations, &self.operations)
    }

    fn no_larger_than(&self, other: &TransformEntry) -> bool {
        self.input_types.len() <= other.input_types.len()
            && self.output_types.len() <= other.output_types.len()
            && self.operations.len() <= other.operations.len()
    }
}

fn is_subset<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.iter().all(|x| b.contains(x))
}

#[derive(Default)]
pub struct TransformRegistry {
    entries: Vec<TransformEntry>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `chat_with_tools` and `chat`, both text to text
    pub fn with_chat(chat: Arc<ChatLoop>) -> Self {
        let mut reg = Self::new();
        reg.register(TransformEntry {
            name: "chat_with_tools".to_string(),
            input_types: vec![TransformType::Text],
            output_types: vec![TransformType::Text],
            operations: vec![TransformOperation::Llm, TransformOperation::Tools],
            handler: Arc::new(ChatTransform {
                chat: chat.clone(),
                with_tools: true,
            }),
        });
        reg.register(TransformEntry {
            name: "chat".to_string(),
            input_types: vec![TransformType::Text],
            output_types: vec![TransformType::Text],
            operations: vec![TransformOperation::Llm],
            handler: Arc::new(ChatTransform {
                chat,
                with_tools: false,
            }),
        });
        reg
    }

    pub fn register(&mut self, entry: TransformEntry) {
        self.entries.push(entry);
    }

    /// Later entries replace the current pick when they are no larger in
    /// every dimension.
    pub fn select(&self, req: &TransformRequest) -> Option<&TransformEntry> {
        let mut candidate: Option<&TransformEntry> = None;
        for entry in self.entries.iter().filter(|e| e.covers(req)) {
            candidate = match candidate {
                Some(current) if !entry.no_larger_than(current) => Some(current),
                _ => Some(entry),
            };
        }
        candidate
    }

    pub async fn transform(&self, inv: InvocationInfo, payload: &[u8]) -> HostCallResult {
        let req: TransformRequest = serde_json::from_slice(payload)?;
        let entry = self.select(&req).ok_or_else(|| {
            HostCallError::new(format!(
                "no transform for inputs {:?}, outputs {:?}, operations {:?}",
                req.input_types, req.output_types, req.operations
            ))
        })?;
        info!(transform = %entry.name, "Using transform");
        entry
            .handler
            .transform(inv, req.params)
            .await
            .map_err(|e| HostCallError::with_code(e.code, format!("error calling {}: {}", entry.name, e.message)))
    }
}

struct ChatTransform {
    chat: Arc<ChatLoop>,
    with_tools: bool,
}

#[async_trait]
impl TransformHandler for ChatTransform {
    async fn transform(&self, inv: InvocationInfo, params: Value) -> HostCallResult {
        let request: ChatRequest = serde_json::from_value(params)?;
        let messages = self
            .chat
            .run(&inv, request, self.with_tools)
            .await
            .map_err(|e| HostCallError::new(e.to_string()))?;
        debug!(messages = messages.len(), "Chat transform finished");
        Ok(serde_json::to_vec(&ChatResponse { messages })?)
    }
}

/// Store or clear the task's transform test value
pub fn transform_config(inv: &InvocationInfo, payload: &[u8]) -> HostCallResult {
    let req: TransformConfigRequest = serde_json::from_slice(payload)?;
    if req.reset {
        inv.task.set_var(TaskVar::TransformTest, None);
    } else if let Some(test) = req.test.filter(|t| !t.is_empty()) {
        inv.task.set_var(TaskVar::TransformTest, Some(Value::String(test)));
    }
    Ok(serde_json::to_vec(&TransformConfigResponse {
        result: "success".to_string(),
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl TransformHandler for Named {
        async fn transform(&self, _inv: InvocationInfo, _params: Value) -> HostCallResult {
            Ok(self.0.as_bytes().to_vec())
        }
    }

    fn entry(name: &'static str, ops: Vec<TransformOperation>) -> TransformEntry {
        TransformEntry {
            name: name.to_string(),
            input_types: vec![TransformType::Text],
            output_types: vec![TransformType::Text],
            operations: ops,
            handler: Arc::new(Named(name)),
        }
    }

    fn request(ops: Vec<TransformOperation>) -> TransformRequest {
        TransformRequest {
            input_types: vec![TransformType::Text],
            output_types: vec![TransformType::Text],
            operations: ops,
            params: Value::Null,
        }
    }

    fn registry() -> TransformRegistry {
        let mut reg = TransformRegistry::new();
        reg.register(entry(
            "chat_with_tools",
            vec![TransformOperation::Llm, TransformOperation::Tools],
        ));
        reg.register(entry("chat", vec![TransformOperation::Llm]));
        reg
    }

    #[test]
    fn test_most_specific_entry_wins() {
        let reg = registry();
        let picked = reg.select(&request(vec![TransformOperation::Llm])).unwrap();
        assert_eq!(picked.name, "chat");
    }

    #[test]
    fn test_only_covering_entry_is_picked() {
        let reg = registry();
        let picked = reg
            .select(&request(vec![TransformOperation::Llm, TransformOperation::Tools]))
            .unwrap();
        assert_eq!(picked.name, "chat_with_tools");
    }

    #[test]
    fn test_registration_order_does_not_change_pick() {
        let mut reg = TransformRegistry::new();
        reg.register(entry("chat", vec![TransformOperation::Llm]));
        reg.register(entry(
            "chat_with_tools",
            vec![TransformOperation::Llm, TransformOperation::Tools],
        ));
        let picked = reg.select(&request(vec![TransformOperation::Llm])).unwrap();
        assert_eq!(picked.name, "chat");
    }

    #[test]
    fn test_uncovered_request_has_no_pick() {
        let reg = registry();
        let mut req = request(vec![TransformOperation::TextToSpeech]);
        req.output_types = vec![TransformType::Audio];
        assert!(reg.select(&req).is_none());
    }

    #[test]
    fn test_request_json_shape() {
        let req: TransformRequest = serde_json::from_str(
            r#"{"input_types":["text"],"output_types":["text"],"operations":["llm","tools"],"params":{"model":"gpt-4o"}}"#,
        )
        .unwrap();
        assert_eq!(req.operations, vec![TransformOperation::Llm, TransformOperation::Tools]);
        assert_eq!(req.params["model"], "gpt-4o");
    }
}
