//! Minimal guest workload
//!
//! Connects back to the host (`SERVICE_ADDR`/`SECRET`, or frames on
//! stdin/stdout) and serves `custom` requests until told to terminate:
//!
//! - `chat`: sends the params as a user message through the `transform`
//!   host call and answers with the last reply
//! - `time`: same, with the builtin `datetime` tool offered to the model
//! - anything else: echoes the params back

use std::sync::Arc;

use tracing::{debug, info, warn};

use taskvisor::guest::{GuestConnection, GuestError};
use taskvisor::host::{CustomRequest, CustomResponse};
use taskvisor::hostcalls::chat::{ChatRequest, ChatResponse, InputMessage, ToolRef};
use taskvisor::hostcalls::dispatcher::{CODE_HANDLER_ERROR, CODE_METHOD_NOT_FOUND};
use taskvisor::hostcalls::transform::{TransformOperation, TransformRequest, TransformType};
use taskvisor::tools::{ToolKind, BUILTIN_DATETIME};
use taskvisor::transport::{Method, Signal, TransportRequest};

const ENV_MODEL: &str = "DUMMY_MODEL";
const DEFAULT_MODEL: &str = "gpt-4o";

async fn chat(
    conn: &GuestConnection,
    prompt: &str,
    with_datetime: bool,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let model = std::env::var(ENV_MODEL).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
    let (operations, tools) = if with_datetime {
        (
            vec![TransformOperation::Llm, TransformOperation::Tools],
            vec![ToolRef {
                kind: ToolKind::Builtin,
                id: BUILTIN_DATETIME,
            }],
        )
    } else {
        (vec![TransformOperation::Llm], Vec::new())
    };

    let params = ChatRequest {
        model,
        messages: vec![InputMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }],
        tools,
    };
    let req = TransformRequest {
        input_types: vec![TransformType::Text],
        output_types: vec![TransformType::Text],
        operations,
        params: serde_json::to_value(params)?,
    };

    let resp = conn
        .request(Method::Transform, serde_json::to_vec(&req)?)
        .await?;
    let chat: ChatResponse = serde_json::from_slice(&resp.payload)?;
    Ok(chat
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default())
}

async fn handle(conn: &GuestConnection, req: TransportRequest) -> Result<(), GuestError> {
    if req.method() != Method::Custom {
        return conn
            .respond_error(req.id, CODE_METHOD_NOT_FOUND, "method not found")
            .await;
    }
    let custom: CustomRequest = match serde_json::from_slice(&req.payload) {
        Ok(c) => c,
        Err(e) => return conn.respond_error(req.id, CODE_HANDLER_ERROR, e.to_string()).await,
    };
    info!(method = %custom.method_str, "Custom request");
    if custom.is_streaming() {
        return conn
            .respond_error(req.id, CODE_HANDLER_ERROR, "streaming custom calls are not supported")
            .await;
    }

    let data = match custom.method_str.as_str() {
        "chat" | "time" => {
            match chat(conn, &custom.params_str, custom.method_str == "time").await {
                Ok(text) => text,
                Err(e) => return conn.respond_error(req.id, CODE_HANDLER_ERROR, e.to_string()).await,
            }
        }
        _ => custom.params_str,
    };

    let body = serde_json::to_vec(&CustomResponse { data }).unwrap_or_default();
    conn.respond(req.id, body).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // stdout may carry frames, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let conn = Arc::new(GuestConnection::connect_from_env().await?);
    info!("Connected to host");

    loop {
        tokio::select! {
            req = conn.next_request() => match req {
                Some(req) => {
                    let conn = conn.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle(&conn, req).await {
                            warn!(error = %e, "Failed to answer request");
                        }
                    });
                }
                None => {
                    debug!("Host closed the connection");
                    break;
                }
            },
            sig = conn.next_signal() => match sig {
                Some(sig) if sig.method() == Signal::Terminate => {
                    info!("Terminate received");
                    break;
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    let _ = conn.close().await;
    Ok(())
}
