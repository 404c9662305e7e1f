//! Host call dispatcher
//!
//! Consumes the communication manager's request queue and runs each request
//! on its own tokio task, so one slow handler never blocks the others.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

use super::comm::{CommunicationManager, IncomingRequest, InvocationInfo};
use crate::metrics::{HOSTCALLS, HOSTCALL_DURATION};
use crate::transport::Method;

/// Wire code for a request whose method has no handler
pub const CODE_METHOD_NOT_FOUND: i32 = 2;
/// Wire code for a handler failure that carries no code of its own
pub const CODE_HANDLER_ERROR: i32 = -1;

/// Failure reported back to the caller as an error response
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct HostCallError {
    pub code: i32,
    pub message: String,
}

impl HostCallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: CODE_HANDLER_ERROR,
            message: message.into(),
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found() -> Self {
        Self::with_code(CODE_METHOD_NOT_FOUND, "method not found")
    }
}

impl From<serde_json::Error> for HostCallError {
    fn from(e: serde_json::Error) -> Self {
        HostCallError::new(format!("invalid payload: {}", e))
    }
}

pub type HostCallResult = Result<Vec<u8>, HostCallError>;

#[async_trait]
pub trait HostCallHandler: Send + Sync {
    async fn call(&self, inv: InvocationInfo, payload: Vec<u8>) -> HostCallResult;
}

#[async_trait]
impl<F, Fut> HostCallHandler for F
where
    F: Fn(InvocationInfo, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = HostCallResult> + Send + 'static,
{
    async fn call(&self, inv: InvocationInfo, payload: Vec<u8>) -> HostCallResult {
        (self)(inv, payload).await
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("a handler for {0} is already registered")]
    Duplicate(Method),
    #[error("request queue already taken by another dispatcher")]
    QueueTaken,
}

#[derive(Default)]
pub struct HostCallDispatcher {
    handlers: HashMap<Method, Arc<dyn HostCallHandler>>,
}

impl HostCallDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, method: Method, handler: H) -> Result<(), DispatchError>
    where
        H: HostCallHandler + 'static,
    {
        if self.handlers.contains_key(&method) {
            return Err(DispatchError::Duplicate(method));
        }
        self.handlers.insert(method, Arc::new(handler));
        Ok(())
    }

    pub fn has_handler(&self, method: Method) -> bool {
        self.handlers.contains_key(&method)
    }

    /// Serve the manager's request queue until it closes
    pub async fn run(self: Arc<Self>, comm: Arc<CommunicationManager>) -> Result<(), DispatchError> {
        let mut requests = comm.take_requests().ok_or(DispatchError::QueueTaken)?;
        while let Some(incoming) = requests.recv().await {
            let this = self.clone();
            tokio::spawn(async move { this.dispatch(incoming).await });
        }
        debug!("Request queue closed, dispatcher exiting");
        Ok(())
    }

    /// Run one request and write its response
    pub async fn dispatch(&self, incoming: IncomingRequest) {
        let IncomingRequest { request, inv } = incoming;
        let method = request.method();
        let task_id = inv.task.id();
        let span = info_span!("hostcall", task_id = %task_id, id = request.id, method = %method);

        async {
            let start = Instant::now();
            let result = match self.handlers.get(&method) {
                Some(handler) => handler.call(inv.clone(), request.payload).await,
                None => Err(HostCallError::method_not_found()),
            };
            HOSTCALL_DURATION
                .with_label_values(&[method.as_str()])
                .observe(start.elapsed().as_secs_f64());

            let written = match result {
                Ok(payload) => {
                    HOSTCALLS.with_label_values(&[method.as_str(), "ok"]).inc();
                    inv.comm.send_response(inv.task.as_ref(), request.id, payload).await
                }
                Err(e) => {
                    warn!(code = e.code, error = %e.message, "Host call failed");
                    HOSTCALLS.with_label_values(&[method.as_str(), "error"]).inc();
                    inv.comm
                        .send_error_response(inv.task.as_ref(), request.id, e.code, e.message)
                        .await
                }
            };
            if let Err(e) = written {
                warn!(error = %e, "Failed to send host call response");
            }
        }
        .instrument(span)
        .await
    }
}
