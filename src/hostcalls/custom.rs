//! Payloads of the `custom` method
//!
//! The host uses `custom` to run a workload's own entry points (the HTTP
//! front door calls `handle`) and to forward normal tool calls to the task
//! serving them. A request carries either a one-shot `params_str` or, for
//! bidirectional streaming, a pair of stream queue ids.

use serde::{Deserialize, Serialize};

/// Queue ids of a bidirectional stream, as seen from the workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamQueues {
    /// Host to workload
    pub input_queue: i64,
    /// Workload to host
    pub output_queue: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomRequest {
    pub method_str: String,
    #[serde(default)]
    pub params_str: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamQueues>,
}

impl CustomRequest {
    pub fn oneshot(method: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            method_str: method.into(),
            params_str: params.into(),
            stream: None,
        }
    }

    pub fn streaming(method: impl Into<String>, queues: StreamQueues) -> Self {
        Self {
            method_str: method.into(),
            params_str: String::new(),
            stream: Some(queues),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomResponse {
    #[serde(default)]
    pub data: String,
}
