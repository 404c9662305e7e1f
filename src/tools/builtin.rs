//! Host-implemented tools

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use super::{BuiltinTool, ToolError, ToolId, ToolParam, ToolSpec};

pub const BUILTIN_DATETIME: ToolId = 1;
pub const BUILTIN_SLEEP: ToolId = 2;

/// Longest sleep a model may ask for
const MAX_SLEEP_SECS: u64 = 300;

/// Current time as RFC3339
pub struct DatetimeTool;

#[async_trait]
impl BuiltinTool for DatetimeTool {
    fn id(&self) -> ToolId {
        BUILTIN_DATETIME
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "datetime".to_string(),
            description: "Get the current date and time".to_string(),
            params: BTreeMap::new(),
        }
    }

    async fn call(&self, _args: Value) -> Result<String, ToolError> {
        Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

pub struct SleepTool;

#[async_trait]
impl BuiltinTool for SleepTool {
    fn id(&self) -> ToolId {
        BUILTIN_SLEEP
    }

    fn spec(&self) -> ToolSpec {
        let mut params = BTreeMap::new();
        params.insert(
            "seconds".to_string(),
            ToolParam::new("integer", "How many seconds to sleep", true),
        );
        ToolSpec {
            name: "sleep".to_string(),
            description: "Sleep for a number of seconds".to_string(),
            params,
        }
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let secs = args
            .get("seconds")
            .and_then(Value::as_u64)
            .ok_or_else(|| ToolError::InvalidArguments("seconds must be a non-negative integer".into()))?;
        if secs > MAX_SLEEP_SECS {
            return Err(ToolError::InvalidArguments(format!(
                "seconds must be at most {}",
                MAX_SLEEP_SECS
            )));
        }
        tokio::time::sleep(Duration::from_secs(secs)).await;
        Ok(format!("slept for {} seconds", secs))
    }
}
