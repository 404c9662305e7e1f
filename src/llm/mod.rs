//! Language model backends
//!
//! - `endpoints` - which OpenAI-compatible endpoint serves which model
//! - `client` - chat completion / speech HTTP client and the provider trait

pub mod client;
pub mod endpoints;

pub use client::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, CompletionProvider,
    FunctionCall, LlmError, OpenAiClient, SpeechRequest, Tool, ToolCall, ToolFunction,
};
pub use endpoints::{ApiEndpoint, EndpointKind, EndpointTable};
