//! Tool registry
//!
//! Three kinds of tools can be offered to a model:
//! - builtin: implemented by the host, shared by every task
//! - internal: declared by a task at runtime and executed by that task
//! - normal: registered by a task for every conversation on the host and
//!   forwarded by name to that task
//!
//! Tools are exposed to the model as `<kind letter>-<id>` so a tool call
//! can be routed back to the right table without a name lookup.

pub mod builtin;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::llm::{Tool, ToolFunction};
use crate::task::TaskId;

pub use builtin::{DatetimeTool, SleepTool, BUILTIN_DATETIME, BUILTIN_SLEEP};

pub type ToolId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Builtin,
    Internal,
    Normal,
}

impl ToolKind {
    pub fn prefix(&self) -> char {
        match self {
            ToolKind::Builtin => 'B',
            ToolKind::Internal => 'I',
            ToolKind::Normal => 'N',
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'B' => Some(ToolKind::Builtin),
            'I' => Some(ToolKind::Internal),
            'N' => Some(ToolKind::Normal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Builtin => "builtin",
            ToolKind::Internal => "internal",
            ToolKind::Normal => "normal",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid tool name {0:?}")]
    InvalidName(String),
    #[error("{kind} tool {id} not found")]
    NotFound { kind: ToolKind, id: ToolId },
    #[error("builtin tool {0} is already registered")]
    Duplicate(ToolId),
    #[error("too many internal tools for task {0}")]
    TooMany(TaskId),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("no forwarder configured for normal tool {0}")]
    NoForwarder(String),
    #[error("too many normal tools")]
    TooManyNormal,
    #[error("tool invocation failed: {0}")]
    Invoke(String),
}

/// One declared parameter of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParam {
    #[serde(rename = "type")]
    pub ptype: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl ToolParam {
    pub fn new(ptype: &str, description: &str, required: bool) -> Self {
        Self {
            ptype: ptype.to_string(),
            description: description.to_string(),
            required,
        }
    }
}

/// Name, description and parameters of a tool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: BTreeMap<String, ToolParam>,
}

impl ToolSpec {
    /// JSON schema for the model; strict object, required list sorted by name
    pub fn parameters_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .params
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    json!({ "type": p.ptype, "description": p.description }),
                )
            })
            .collect();
        let required: Vec<&String> = self
            .params
            .iter()
            .filter(|(_, p)| p.required)
            .map(|(name, _)| name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

/// A host-implemented tool
#[async_trait]
pub trait BuiltinTool: Send + Sync {
    fn id(&self) -> ToolId;
    fn spec(&self) -> ToolSpec;
    async fn call(&self, args: Value) -> Result<String, ToolError>;
}

/// Delivers normal tool calls to the task that registered them
#[async_trait]
pub trait NormalToolForwarder: Send + Sync {
    async fn forward(&self, owner: &TaskId, name: &str, args: Value) -> Result<String, ToolError>;
}

/// A normal tool and the task serving it; `owner` is cleared when that
/// task is released so ids stay positional
#[derive(Debug, Clone)]
struct NormalTool {
    spec: ToolSpec,
    owner: Option<TaskId>,
}

pub fn encode_tool_name(kind: ToolKind, id: ToolId) -> String {
    format!("{}-{}", kind.prefix(), id)
}

pub fn decode_tool_name(name: &str) -> Result<(ToolKind, ToolId), ToolError> {
    let invalid = || ToolError::InvalidName(name.to_string());
    let mut chars = name.chars();
    let kind = chars.next().and_then(ToolKind::from_prefix).ok_or_else(invalid)?;
    if chars.next() != Some('-') {
        return Err(invalid());
    }
    let digits = chars.as_str();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let id = digits.parse::<ToolId>().map_err(|_| invalid())?;
    Ok((kind, id))
}

#[derive(Default)]
pub struct ToolRegistry {
    builtin: RwLock<HashMap<ToolId, Arc<dyn BuiltinTool>>>,
    internal: RwLock<HashMap<TaskId, Vec<ToolSpec>>>,
    normal: RwLock<Vec<NormalTool>>,
    forwarder: Option<Arc<dyn NormalToolForwarder>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `datetime` and `sleep`
    pub fn with_builtins() -> Self {
        let reg = Self::new();
        // ids are fixed constants, they cannot collide
        let _ = reg.register_builtin(Arc::new(DatetimeTool));
        let _ = reg.register_builtin(Arc::new(SleepTool));
        reg
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn NormalToolForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn register_builtin(&self, tool: Arc<dyn BuiltinTool>) -> Result<(), ToolError> {
        let mut builtin = self.builtin.write().unwrap_or_else(|p| p.into_inner());
        let id = tool.id();
        if builtin.contains_key(&id) {
            return Err(ToolError::Duplicate(id));
        }
        builtin.insert(id, tool);
        Ok(())
    }

    pub fn builtin(&self, id: ToolId) -> Option<Arc<dyn BuiltinTool>> {
        self.builtin
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn builtin_ids(&self) -> Vec<ToolId> {
        let mut ids: Vec<ToolId> = self
            .builtin
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Ids are handed out in registration order, starting at 0
    pub fn register_internal(&self, task_id: &TaskId, spec: ToolSpec) -> Result<ToolId, ToolError> {
        let mut internal = self.internal.write().unwrap_or_else(|p| p.into_inner());
        let tools = internal.entry(task_id.clone()).or_default();
        let id = ToolId::try_from(tools.len()).map_err(|_| ToolError::TooMany(task_id.clone()))?;
        info!(task_id = %task_id, tool_id = id, name = %spec.name, "Registered internal tool");
        tools.push(spec);
        Ok(id)
    }

    pub fn internal(&self, task_id: &TaskId, id: ToolId) -> Option<ToolSpec> {
        self.internal
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_id)
            .and_then(|tools| tools.get(id as usize))
            .cloned()
    }

    pub fn internal_count(&self, task_id: &TaskId) -> usize {
        self.internal
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop everything a task registered
    pub fn clear_task(&self, task_id: &TaskId) {
        self.internal
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(task_id);
        for tool in self
            .normal
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .iter_mut()
            .filter(|t| t.owner.as_ref() == Some(task_id))
        {
            tool.owner = None;
        }
    }

    /// Ids are shared by every task and never reused
    pub fn register_normal(&self, owner: &TaskId, spec: ToolSpec) -> Result<ToolId, ToolError> {
        let mut normal = self.normal.write().unwrap_or_else(|p| p.into_inner());
        let id = ToolId::try_from(normal.len()).map_err(|_| ToolError::TooManyNormal)?;
        info!(task_id = %owner, tool_id = id, name = %spec.name, "Registered normal tool");
        normal.push(NormalTool {
            spec,
            owner: Some(owner.clone()),
        });
        Ok(id)
    }

    fn normal_entry(&self, id: ToolId) -> Option<(ToolSpec, TaskId)> {
        self.normal
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id as usize)
            .and_then(|t| t.owner.clone().map(|owner| (t.spec.clone(), owner)))
    }

    /// Spec of a normal tool whose owner is still around
    pub fn normal(&self, id: ToolId) -> Option<ToolSpec> {
        self.normal_entry(id).map(|(spec, _)| spec)
    }

    /// Tool definition as offered to the model
    pub fn definition(&self, task_id: &TaskId, kind: ToolKind, id: ToolId) -> Result<Tool, ToolError> {
        let spec = match kind {
            ToolKind::Builtin => self.builtin(id).map(|t| t.spec()),
            ToolKind::Internal => self.internal(task_id, id),
            ToolKind::Normal => self.normal(id),
        }
        .ok_or(ToolError::NotFound { kind, id })?;

        Ok(Tool {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: encode_tool_name(kind, id),
                description: spec.description.clone(),
                parameters: spec.parameters_schema(),
            },
        })
    }

    /// Hand a normal tool call to the forwarder
    pub async fn forward_normal(&self, id: ToolId, args: Value) -> Result<String, ToolError> {
        let (spec, owner) = self.normal_entry(id).ok_or(ToolError::NotFound {
            kind: ToolKind::Normal,
            id,
        })?;
        match &self.forwarder {
            Some(fwd) => fwd.forward(&owner, &spec.name, args).await,
            None => Err(ToolError::NoForwarder(spec.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_name_round_trip_for_registered_tools() {
        let reg = ToolRegistry::with_builtins();
        let task: TaskId = "t1".to_string();
        let internal = reg.register_internal(&task, ToolSpec::default()).unwrap();
        let normal = reg.register_normal(&task, ToolSpec::default()).unwrap();

        let mut all: Vec<(ToolKind, ToolId)> = reg
            .builtin_ids()
            .into_iter()
            .map(|id| (ToolKind::Builtin, id))
            .collect();
        all.push((ToolKind::Internal, internal));
        all.push((ToolKind::Normal, normal));
        all.push((ToolKind::Builtin, ToolId::MAX));

        for (kind, id) in all {
            let name = encode_tool_name(kind, id);
            assert_eq!(decode_tool_name(&name).unwrap(), (kind, id), "{}", name);
        }
    }

    #[test]
    fn test_malformed_names_are_rejected() {
        for name in ["", "B", "B-", "B1", "X-1", "B-abc", "B-65536", "b-1", "B--1", "B-+1"] {
            assert!(
                matches!(decode_tool_name(name), Err(ToolError::InvalidName(_))),
                "{:?} should not decode",
                name
            );
        }
    }

    #[test]
    fn test_internal_ids_are_per_task_and_positional() {
        let reg = ToolRegistry::new();
        let a: TaskId = "a".to_string();
        let b: TaskId = "b".to_string();
        assert_eq!(reg.register_internal(&a, ToolSpec::default()).unwrap(), 0);
        assert_eq!(reg.register_internal(&a, ToolSpec::default()).unwrap(), 1);
        assert_eq!(reg.register_internal(&b, ToolSpec::default()).unwrap(), 0);

        reg.clear_task(&a);
        assert_eq!(reg.internal_count(&a), 0);
        assert_eq!(reg.internal_count(&b), 1);
        assert!(reg.internal(&a, 0).is_none());
    }

    #[test]
    fn test_duplicate_builtin_is_rejected() {
        let reg = ToolRegistry::with_builtins();
        assert!(matches!(
            reg.register_builtin(Arc::new(DatetimeTool)),
            Err(ToolError::Duplicate(BUILTIN_DATETIME))
        ));
    }

    #[test]
    fn test_definition_schema_is_strict() {
        let reg = ToolRegistry::new();
        let task: TaskId = "t".to_string();
        let mut spec = ToolSpec {
            name: "lookup".to_string(),
            description: "find a contact".to_string(),
            params: BTreeMap::new(),
        };
        spec.params
            .insert("who".to_string(), ToolParam::new("string", "name", true));
        spec.params
            .insert("limit".to_string(), ToolParam::new("integer", "max rows", false));
        let id = reg.register_internal(&task, spec).unwrap();

        let def = reg.definition(&task, ToolKind::Internal, id).unwrap();
        assert_eq!(def.function.name, "I-0");
        let params = &def.function.parameters;
        assert_eq!(params["additionalProperties"], false);
        assert_eq!(params["required"], json!(["who"]));
        assert_eq!(params["properties"]["limit"]["type"], "integer");
    }

    #[tokio::test]
    async fn test_normal_tool_without_forwarder_fails() {
        let reg = ToolRegistry::new();
        let id = reg
            .register_normal(&"owner".to_string(), ToolSpec {
                name: "weather".to_string(),
                ..Default::default()
            })
            .unwrap();
        let err = reg.forward_normal(id, Value::Null).await.unwrap_err();
        assert!(matches!(err, ToolError::NoForwarder(name) if name == "weather"));
    }

    /// Records what it was asked to forward
    #[derive(Default)]
    struct RecordingForwarder {
        calls: std::sync::Mutex<Vec<(TaskId, String, Value)>>,
    }

    #[async_trait]
    impl NormalToolForwarder for RecordingForwarder {
        async fn forward(&self, owner: &TaskId, name: &str, args: Value) -> Result<String, ToolError> {
            self.calls
                .lock()
                .unwrap()
                .push((owner.clone(), name.to_string(), args));
            Ok(format!("{} done", name))
        }
    }

    #[tokio::test]
    async fn test_normal_tool_is_forwarded_to_its_owner() {
        let fwd = Arc::new(RecordingForwarder::default());
        let reg = ToolRegistry::new().with_forwarder(fwd.clone());
        let owner: TaskId = "server".to_string();
        let spec = ToolSpec {
            name: "weather".to_string(),
            ..Default::default()
        };
        let id = reg.register_normal(&owner, spec).unwrap();

        let out = reg.forward_normal(id, json!({"city": "Oslo"})).await.unwrap();
        assert_eq!(out, "weather done");
        let calls = fwd.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(owner.clone(), "weather".to_string(), json!({"city": "Oslo"}))]);

        // the owner going away retires the tool but keeps later ids stable
        reg.clear_task(&owner);
        assert!(reg.normal(id).is_none());
        assert!(matches!(
            reg.forward_normal(id, Value::Null).await,
            Err(ToolError::NotFound { kind: ToolKind::Normal, .. })
        ));
        let next = reg.register_normal(&"other".to_string(), ToolSpec::default()).unwrap();
        assert_eq!(next, id + 1);
    }
}
