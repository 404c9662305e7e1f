//! Tool-calling chat loop, driven end to end through the `transform` host
//! call or directly through `ChatLoop::run`.

mod common;

use common::{stop, tool_call, Harness, ScriptedProvider};
use serde_json::json;

use taskvisor::guest::GuestError;
use taskvisor::hostcalls::chat::{ChatRequest, ChatResponse, InputMessage, ToolInvokeRequest, ToolInvokeResponse, ToolRef};
use taskvisor::hostcalls::custom::{CustomRequest, CustomResponse};
use taskvisor::hostcalls::tools::InternalToolCreateResponse;
use taskvisor::hostcalls::ChatError;
use taskvisor::llm::EndpointKind;
use taskvisor::task::Task;
use taskvisor::tools::{ToolKind, BUILTIN_DATETIME};
use taskvisor::transport::Method;

fn chat_transform(tools: serde_json::Value) -> Vec<u8> {
    let operations = if tools.as_array().map_or(true, |t| t.is_empty()) {
        json!(["llm"])
    } else {
        json!(["llm", "tools"])
    };
    serde_json::to_vec(&json!({
        "input_types": ["text"],
        "output_types": ["text"],
        "operations": operations,
        "params": {
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "what time is it?"}],
            "tools": tools,
        }
    }))
    .unwrap()
}

fn ask(tools: Vec<ToolRef>) -> ChatRequest {
    ChatRequest {
        model: "gpt-4o".to_string(),
        messages: vec![InputMessage {
            role: "user".to_string(),
            content: "what time is it?".to_string(),
        }],
        tools,
    }
}

fn datetime() -> ToolRef {
    ToolRef {
        kind: ToolKind::Builtin,
        id: BUILTIN_DATETIME,
    }
}

#[tokio::test]
async fn test_datetime_round_trip_ends_with_stop_entry() {
    let h = Harness::start(ScriptedProvider::new(vec![
        tool_call("call_1", "B-1", "{}"),
        stop(""),
    ]))
    .await;

    let resp = h
        .guest
        .request(Method::Transform, chat_transform(json!([{"type": "builtin", "id": 1}])))
        .await
        .unwrap();
    let chat: ChatResponse = serde_json::from_slice(&resp.payload).unwrap();

    assert_eq!(chat.messages.len(), 3);
    let assistant = &chat.messages[0];
    assert_eq!(assistant.metadata.role, "assistant");
    assert_eq!(assistant.metadata.tool_calls[0].function.name, "B-1");

    let tool = &chat.messages[1];
    assert_eq!(tool.metadata.role, "tool");
    assert_eq!(tool.metadata.tool_call_id.as_deref(), Some("call_1"));
    assert!(chrono::DateTime::parse_from_rfc3339(&tool.content).is_ok());

    // the closing turn is kept even with no text
    let closing = &chat.messages[2];
    assert_eq!(closing.metadata.role, "assistant");
    assert_eq!(closing.metadata.reason.as_deref(), Some("stop"));
    assert!(closing.content.is_empty());

    // the model saw the tool and was told not to call tools in parallel
    let (kind, first) = h.provider.request(0);
    assert_eq!(kind, EndpointKind::ChatWithTools);
    assert_eq!(first.tools[0].function.name, "B-1");
    assert_eq!(first.parallel_tool_calls, Some(false));
    // and the second call carried the tool result back
    let (_, second) = h.provider.request(1);
    assert_eq!(second.messages.len(), 3);
    assert_eq!(second.messages[2].role, "tool");
}

#[tokio::test]
async fn test_rounds_of_tool_calls_then_stop() {
    let rounds = 3;
    let mut script: Vec<_> = (0..rounds)
        .map(|i| tool_call(&format!("call_{}", i), "B-1", ""))
        .collect();
    script.push(stop("done"));
    let h = Harness::start(ScriptedProvider::new(script)).await;

    let entries = h
        .chat
        .run(&h.invocation(), ask(vec![datetime()]), true)
        .await
        .unwrap();

    assert_eq!(entries.len(), rounds * 2 + 1);
    let last = entries.last().unwrap();
    assert_eq!(last.content, "done");
    assert_eq!(last.metadata.reason.as_deref(), Some("stop"));
    assert_eq!(h.provider.calls(), rounds + 1);
}

#[tokio::test]
async fn test_endless_tool_calls_hit_iteration_limit() {
    let h = Harness::start(ScriptedProvider::repeating(tool_call("call", "B-1", "{}"))).await;

    let err = h
        .chat
        .run(&h.invocation(), ask(vec![datetime()]), true)
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::MaxIterations(10)));
    assert_eq!(h.provider.calls(), 10);
}

#[tokio::test]
async fn test_tool_calls_without_tools_are_rejected() {
    let h = Harness::start(ScriptedProvider::new(vec![tool_call("call", "B-1", "{}")])).await;

    let err = h.chat.run(&h.invocation(), ask(Vec::new()), false).await.unwrap_err();
    assert!(matches!(err, ChatError::UnexpectedToolCalls));
    assert_eq!(h.provider.request(0).0, EndpointKind::ChatOnly);
}

#[tokio::test]
async fn test_unknown_tool_fails_the_transform() {
    let h = Harness::start(ScriptedProvider::new(vec![tool_call("call", "B-77", "{}")])).await;

    let err = h
        .guest
        .request(Method::Transform, chat_transform(json!([{"type": "builtin", "id": 1}])))
        .await
        .unwrap_err();
    match err {
        GuestError::Remote { code, message } => {
            assert_eq!(code, -1);
            assert!(message.starts_with("error calling chat_with_tools"), "{}", message);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_internal_tool_is_served_by_the_task() {
    let h = Harness::start(ScriptedProvider::default()).await;

    let spec = json!({
        "name": "lookup",
        "description": "Look a key up in the task's table",
        "params": {"key": {"type": "string", "description": "key", "required": true}}
    });
    let created = h
        .guest
        .request(Method::InternalToolCreate, serde_json::to_vec(&spec).unwrap())
        .await
        .unwrap();
    let InternalToolCreateResponse { tool_id } = serde_json::from_slice(&created.payload).unwrap();

    // script now that the id is known
    let name = format!("I-{}", tool_id);
    h.provider.push(tool_call("call_1", &name, r#"{"key":"color"}"#));
    h.provider.push(stop(""));

    let guest = h.guest.clone();
    let responder = tokio::spawn(async move {
        let req = guest.next_request().await.unwrap();
        assert_eq!(req.method(), Method::ToolInvoke);
        let invoke: ToolInvokeRequest = serde_json::from_slice(&req.payload).unwrap();
        let body = serde_json::to_vec(&ToolInvokeResponse {
            result: json!("blue"),
        })
        .unwrap();
        guest.respond(req.id, body).await.unwrap();
        invoke
    });

    let resp = h
        .guest
        .request(Method::Transform, chat_transform(json!([{"type": "internal", "id": tool_id}])))
        .await
        .unwrap();
    let chat: ChatResponse = serde_json::from_slice(&resp.payload).unwrap();

    let invoke = responder.await.unwrap();
    assert_eq!(invoke.tool_id, tool_id);
    assert_eq!(invoke.params, json!({"key": "color"}));
    assert_eq!(chat.messages.len(), 3);
    assert_eq!(chat.messages[1].content, "blue");

    let (_, first) = h.provider.request(0);
    assert_eq!(first.tools[0].function.parameters["required"], json!(["key"]));
}

#[tokio::test]
async fn test_normal_tool_is_forwarded_as_custom_call() {
    let h = Harness::start(ScriptedProvider::default()).await;

    let spec = json!({
        "name": "weather",
        "description": "Current weather for a city",
        "params": {"city": {"type": "string", "description": "city", "required": true}}
    });
    let created = h
        .guest
        .request(Method::NormalToolCreate, serde_json::to_vec(&spec).unwrap())
        .await
        .unwrap();
    let InternalToolCreateResponse { tool_id } = serde_json::from_slice(&created.payload).unwrap();
    assert_eq!(tool_id, 0);

    h.provider.push(tool_call("call_1", "N-0", r#"{"city":"Oslo"}"#));
    h.provider.push(stop(""));

    let guest = h.guest.clone();
    let responder = tokio::spawn(async move {
        let req = guest.next_request().await.unwrap();
        assert_eq!(req.method(), Method::Custom);
        let custom: CustomRequest = serde_json::from_slice(&req.payload).unwrap();
        let body = serde_json::to_vec(&CustomResponse {
            data: "sunny".to_string(),
        })
        .unwrap();
        guest.respond(req.id, body).await.unwrap();
        custom
    });

    let resp = h
        .guest
        .request(Method::Transform, chat_transform(json!([{"type": "normal", "id": tool_id}])))
        .await
        .unwrap();
    let chat: ChatResponse = serde_json::from_slice(&resp.payload).unwrap();

    let custom = responder.await.unwrap();
    assert_eq!(custom.method_str, "weather");
    assert!(!custom.is_streaming());
    let args: serde_json::Value = serde_json::from_str(&custom.params_str).unwrap();
    assert_eq!(args, json!({"city": "Oslo"}));
    assert_eq!(chat.messages.len(), 3);
    assert_eq!(chat.messages[1].content, "sunny");
    assert_eq!(chat.messages[2].metadata.reason.as_deref(), Some("stop"));

    // released owner takes its normal tools with it
    h.ctx.release_task(&h.task.id());
    assert!(h.ctx.tools.normal(tool_id).is_none());
}
