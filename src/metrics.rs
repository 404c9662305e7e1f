//! Prometheus metrics
//!
//! All metrics live in the default registry and are exposed in text format
//! at `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

lazy_static! {
    // ── Tasks ────────────────────────────────────────────────────────────
    pub static ref TASKS_CREATED: IntCounterVec = register_int_counter_vec!(
        "taskvisor_tasks_started_total",
        "Tasks started, by backend",
        &["backend"]
    )
    .unwrap();

    pub static ref TASKS_STOPPED: IntCounterVec = register_int_counter_vec!(
        "taskvisor_tasks_stopped_total",
        "Tasks that reached the stopped state, by backend",
        &["backend"]
    )
    .unwrap();

    // ── Host calls ───────────────────────────────────────────────────────
    pub static ref HOSTCALLS: IntCounterVec = register_int_counter_vec!(
        "taskvisor_hostcalls_total",
        "Host calls served, by method and outcome",
        &["method", "outcome"]
    )
    .unwrap();

    pub static ref HOSTCALL_DURATION: HistogramVec = register_histogram_vec!(
        "taskvisor_hostcall_duration_seconds",
        "Host call handler latency",
        &["method"]
    )
    .unwrap();

    // ── Correlation ──────────────────────────────────────────────────────
    pub static ref PENDING_REQUESTS: IntGauge = register_int_gauge!(
        "taskvisor_pending_requests",
        "Host-issued requests waiting for a response"
    )
    .unwrap();

    pub static ref RESPONSE_TIMEOUTS: IntCounter = register_int_counter!(
        "taskvisor_response_timeouts_total",
        "Host-issued requests that timed out"
    )
    .unwrap();

    pub static ref UNSOLICITED_RESPONSES: IntCounter = register_int_counter!(
        "taskvisor_unsolicited_responses_total",
        "Responses whose id matched no waiter"
    )
    .unwrap();

    // ── Chat loop ────────────────────────────────────────────────────────
    pub static ref CHAT_ITERATIONS: Histogram = register_histogram!(
        "taskvisor_chat_iterations",
        "Completion calls per chat transform",
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 10.0]
    )
    .unwrap();

    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "taskvisor_llm_call_duration_seconds",
        "Completion endpoint latency",
        &["model"]
    )
    .unwrap();

    pub static ref TOOL_CALLS: IntCounterVec = register_int_counter_vec!(
        "taskvisor_tool_calls_total",
        "Tool invocations from the chat loop, by tool kind",
        &["kind"]
    )
    .unwrap();
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
