//! HTTP front door
//!
//! - `POST /` runs one workload. The workload comes from `Spear-Func-Id` or
//!   `Spear-Func-Name`, the backend from `Spear-Func-Type` (1 = container,
//!   2 = process). The body is passed to the workload as the params of its
//!   `handle` method. `Spear-Func-Async: true` returns without waiting for
//!   the task to exit. `Spear-Func-Stream: true` asks for a streamed
//!   exchange over task queues, which this host does not serve; such
//!   requests are refused before any task is created.
//! - `GET /health` answers `OK`.
//! - `GET /metrics` is the Prometheus text exposition.
//!
//! Failures are `500` with an `Error: ...` text body.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use thiserror::Error;
use tracing::{debug, error};

use crate::host::{Host, HostError, WorkloadCatalog, DEFAULT_CUSTOM_METHOD};
use crate::metrics;
use crate::task::TaskKind;

pub const HEADER_FUNC_ID: &str = "Spear-Func-Id";
pub const HEADER_FUNC_NAME: &str = "Spear-Func-Name";
pub const HEADER_FUNC_TYPE: &str = "Spear-Func-Type";
pub const HEADER_FUNC_ASYNC: &str = "Spear-Func-Async";
pub const HEADER_FUNC_STREAM: &str = "Spear-Func-Stream";

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("missing {0} header")]
    Missing(&'static str),
    #[error("error parsing {header} header: {value}")]
    Invalid { header: &'static str, value: String },
    #[error("no workload named {0}")]
    UnknownName(String),
    #[error("streaming requests are not supported")]
    StreamingUnsupported,
    #[error(transparent)]
    Host(#[from] HostError),
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        error!(error = %self, "Request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", self)).into_response()
    }
}

/// What a `POST /` asks for
#[derive(Debug, Clone, PartialEq)]
pub struct FuncRequest {
    pub id: i64,
    pub kind: TaskKind,
    pub is_async: bool,
    pub stream: bool,
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, RequestError> {
    match headers.get(name) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .map(|s| Some(s.trim()).filter(|s| !s.is_empty()))
            .map_err(|_| RequestError::Invalid {
                header: name,
                value: String::from_utf8_lossy(v.as_bytes()).into_owned(),
            }),
    }
}

/// Accepts the spellings Go's `strconv.ParseBool` does
fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

pub fn parse_func_request(
    headers: &HeaderMap,
    catalog: &WorkloadCatalog,
) -> Result<FuncRequest, RequestError> {
    let (id, default_kind) = match header(headers, HEADER_FUNC_ID)? {
        Some(raw) => {
            let id = raw.parse::<i64>().map_err(|_| RequestError::Invalid {
                header: HEADER_FUNC_ID,
                value: raw.to_string(),
            })?;
            (id, None)
        }
        None => {
            let name = header(headers, HEADER_FUNC_NAME)?
                .ok_or(RequestError::Missing(HEADER_FUNC_ID))?;
            let w = catalog
                .lookup_name(name)
                .ok_or_else(|| RequestError::UnknownName(name.to_string()))?;
            (w.id, Some(w.kind))
        }
    };

    let kind = match header(headers, HEADER_FUNC_TYPE)? {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .and_then(TaskKind::from_code)
            .ok_or_else(|| RequestError::Invalid {
                header: HEADER_FUNC_TYPE,
                value: raw.to_string(),
            })?,
        None => default_kind.ok_or(RequestError::Missing(HEADER_FUNC_TYPE))?,
    };

    let is_async = bool_header(headers, HEADER_FUNC_ASYNC)?;
    let stream = bool_header(headers, HEADER_FUNC_STREAM)?;

    Ok(FuncRequest {
        id,
        kind,
        is_async,
        stream,
    })
}

/// Absent means false
fn bool_header(headers: &HeaderMap, name: &'static str) -> Result<bool, RequestError> {
    match header(headers, name)? {
        Some(raw) => parse_bool(raw).ok_or_else(|| RequestError::Invalid {
            header: name,
            value: raw.to_string(),
        }),
        None => Ok(false),
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub host: Arc<Host>,
}

pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/", post(run_workload))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics_text() -> String {
    metrics::gather_text()
}

async fn run_workload(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: String,
) -> Result<String, RequestError> {
    let req = parse_func_request(&headers, state.host.catalog())?;
    debug!(
        id = req.id,
        kind = req.kind.as_str(),
        is_async = req.is_async,
        stream = req.stream,
        "Received request"
    );
    if req.stream {
        return Err(RequestError::StreamingUnsupported);
    }
    let out = state
        .host
        .execute(req.id, req.kind, !req.is_async, DEFAULT_CUSTOM_METHOD, &body)
        .await?;
    Ok(out)
}
