//! `tool.internal.create`, `tool.normal.create` and `tool.invoke`

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::chat::{ToolInvokeRequest, ToolInvokeResponse};
use super::comm::{CommunicationManager, InvocationInfo};
use super::custom::{CustomRequest, CustomResponse};
use super::dispatcher::{HostCallError, HostCallResult};
use crate::task::TaskId;
use crate::tools::{NormalToolForwarder, ToolError, ToolId, ToolKind, ToolRegistry, ToolSpec};
use crate::transport::Method;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalToolCreateResponse {
    pub tool_id: ToolId,
}

/// Register a tool the calling task implements itself
pub fn create_internal(tools: &ToolRegistry, inv: &InvocationInfo, payload: &[u8]) -> HostCallResult {
    let spec: ToolSpec = serde_json::from_slice(payload)?;
    if spec.name.is_empty() {
        return Err(HostCallError::new("tool name must not be empty"));
    }
    let tool_id = tools
        .register_internal(&inv.task.id(), spec)
        .map_err(|e| HostCallError::new(e.to_string()))?;
    Ok(serde_json::to_vec(&InternalToolCreateResponse { tool_id })?)
}

/// Offer a tool to every conversation on the host; calls come back to
/// the registering task as `custom` requests named after the tool
pub fn create_normal(tools: &ToolRegistry, inv: &InvocationInfo, payload: &[u8]) -> HostCallResult {
    let spec: ToolSpec = serde_json::from_slice(payload)?;
    if spec.name.is_empty() {
        return Err(HostCallError::new("tool name must not be empty"));
    }
    let tool_id = tools
        .register_normal(&inv.task.id(), spec)
        .map_err(|e| HostCallError::new(e.to_string()))?;
    Ok(serde_json::to_vec(&InternalToolCreateResponse { tool_id })?)
}

/// Sends normal tool calls to the owning task over its transport
pub struct TaskToolForwarder {
    comm: Arc<CommunicationManager>,
}

impl TaskToolForwarder {
    pub fn new(comm: Arc<CommunicationManager>) -> Self {
        Self { comm }
    }
}

#[async_trait]
impl NormalToolForwarder for TaskToolForwarder {
    async fn forward(&self, owner: &TaskId, name: &str, args: Value) -> Result<String, ToolError> {
        let task = self
            .comm
            .task(owner)
            .ok_or_else(|| ToolError::Invoke(format!("task {} serving {} is gone", owner, name)))?;
        let body = serde_json::to_vec(&CustomRequest::oneshot(name, args.to_string()))
            .map_err(|e| ToolError::Invoke(e.to_string()))?;
        debug!(task_id = %owner, tool = %name, "Forwarding normal tool call");
        let response = self
            .comm
            .send_request(task.as_ref(), Method::Custom, body)
            .await
            .map_err(|e| ToolError::Invoke(e.to_string()))?;
        if response.payload.is_empty() {
            return Ok(String::new());
        }
        let parsed: CustomResponse = serde_json::from_slice(&response.payload)
            .map_err(|e| ToolError::Invoke(format!("bad custom response: {}", e)))?;
        Ok(parsed.data)
    }
}

/// Run a builtin tool for the guest
pub async fn invoke_builtin(tools: &ToolRegistry, payload: &[u8]) -> HostCallResult {
    let req: ToolInvokeRequest = serde_json::from_slice(payload)?;
    let tool = tools.builtin(req.tool_id).ok_or_else(|| {
        let err = ToolError::NotFound {
            kind: ToolKind::Builtin,
            id: req.tool_id,
        };
        HostCallError::new(err.to_string())
    })?;
    let result = tool
        .call(req.params)
        .await
        .map_err(|e| HostCallError::new(e.to_string()))?;
    Ok(serde_json::to_vec(&ToolInvokeResponse {
        result: Value::String(result),
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::BUILTIN_DATETIME;

    #[tokio::test]
    async fn test_invoke_builtin_datetime() {
        let tools = ToolRegistry::with_builtins();
        let body = serde_json::to_vec(&ToolInvokeRequest {
            tool_id: BUILTIN_DATETIME,
            params: Value::Null,
        })
        .unwrap();
        let out = invoke_builtin(&tools, &body).await.unwrap();
        let resp: ToolInvokeResponse = serde_json::from_slice(&out).unwrap();
        let text = resp.result.as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(text).is_ok());
    }

    #[tokio::test]
    async fn test_invoke_unknown_builtin() {
        let tools = ToolRegistry::new();
        let err = invoke_builtin(&tools, br#"{"tool_id": 42}"#).await.unwrap_err();
        assert!(err.message.contains("42"));
    }
}
