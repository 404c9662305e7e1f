//! Shared fixtures: a scripted completion provider and an in-memory task
//! wired to a full host call stack.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use taskvisor::guest::GuestConnection;
use taskvisor::hostcalls::tools::TaskToolForwarder;
use taskvisor::hostcalls::{
    register_all, ChatLoop, CommunicationManager, HostCallDispatcher, HostContext, HostIo,
    InvocationInfo, TransformRegistry, VectorStoreRegistry,
};
use taskvisor::llm::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, CompletionProvider,
    EndpointKind, FunctionCall, LlmError, SpeechRequest, ToolCall,
};
use taskvisor::task::{MemoryTask, Task};
use taskvisor::tools::ToolRegistry;

/// Replays canned completions in order, then repeats `fallback` if set
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ChatCompletionResponse>>,
    fallback: Option<ChatCompletionResponse>,
    pub requests: Mutex<Vec<(EndpointKind, ChatCompletionRequest)>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ChatCompletionResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn repeating(response: ChatCompletionResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Default::default()
        }
    }

    pub fn push(&self, response: ChatCompletionResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, n: usize) -> (EndpointKind, ChatCompletionRequest) {
        self.requests.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn chat_completion(
        &self,
        kind: EndpointKind,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        self.requests.lock().unwrap().push((kind, request.clone()));
        let next = self.script.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| LlmError::EmptyResponse("script exhausted".to_string()))
    }

    async fn text_to_speech(&self, request: &SpeechRequest) -> Result<Vec<u8>, LlmError> {
        Ok(request.input.as_bytes().to_vec())
    }
}

fn single_choice(message: ChatMessage, reason: &str) -> ChatCompletionResponse {
    ChatCompletionResponse {
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: Some(reason.to_string()),
        }],
    }
}

pub fn stop(content: &str) -> ChatCompletionResponse {
    single_choice(ChatMessage::assistant(content), "stop")
}

pub fn tool_call(call_id: &str, name: &str, arguments: &str) -> ChatCompletionResponse {
    let message = ChatMessage {
        role: "assistant".to_string(),
        tool_calls: vec![ToolCall {
            id: call_id.to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }],
        ..Default::default()
    };
    single_choice(message, "tool_calls")
}

/// One in-memory task with its guest end, served by the full dispatcher
pub struct Harness {
    pub comm: Arc<CommunicationManager>,
    pub task: Arc<MemoryTask>,
    pub guest: Arc<GuestConnection>,
    pub ctx: Arc<HostContext>,
    pub chat: Arc<ChatLoop>,
    pub provider: Arc<ScriptedProvider>,
}

impl Harness {
    pub async fn start(provider: ScriptedProvider) -> Self {
        Self::start_with_timeout(provider, Duration::from_secs(5)).await
    }

    pub async fn start_with_timeout(provider: ScriptedProvider, timeout: Duration) -> Self {
        let provider = Arc::new(provider);
        let dyn_provider: Arc<dyn CompletionProvider> = provider.clone();

        let comm = CommunicationManager::new(timeout);
        let tools = Arc::new(
            ToolRegistry::with_builtins()
                .with_forwarder(Arc::new(TaskToolForwarder::new(comm.clone()))),
        );
        let chat = Arc::new(ChatLoop::new(dyn_provider.clone(), tools.clone()));
        let ctx = Arc::new(HostContext {
            tools,
            transforms: TransformRegistry::with_chat(chat.clone()),
            vectors: VectorStoreRegistry::new(),
            io: HostIo::with_console(dyn_provider, &b"typed line\n"[..], tokio::io::sink()),
        });

        let mut dispatcher = HostCallDispatcher::new();
        register_all(&mut dispatcher, ctx.clone()).unwrap();
        tokio::spawn(Arc::new(dispatcher).run(comm.clone()));

        let task = Arc::new(MemoryTask::new("harness"));
        comm.install(task.clone()).unwrap();
        task.start().await.unwrap();
        let guest = Arc::new(GuestConnection::from_stream(task.take_guest_stream().unwrap()));

        Self {
            comm,
            task,
            guest,
            ctx,
            chat,
            provider,
        }
    }

    pub fn invocation(&self) -> InvocationInfo {
        InvocationInfo {
            task: self.task.clone() as Arc<dyn Task>,
            comm: self.comm.clone(),
        }
    }
}
