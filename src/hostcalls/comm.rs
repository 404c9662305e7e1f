//! Communication manager
//!
//! Attaches to every task's outbound queue and routes what the guest sends:
//!
//! ```text
//!                         ┌──────────────────────────────────────────┐
//!  task A reader ──┐      │  Request  ─► request queue ─► dispatcher │
//!  task B reader ──┼─────►│  Response ─► pending table ─► waiter     │
//!  task C reader ──┘      │              (miss) ─► unsolicited queue │
//!                         │  Signal   ─► log                         │
//!                         └──────────────────────────────────────────┘
//! ```
//!
//! Host-issued requests register a waiter under `(task id, request id)`
//! before the frame is written, so a fast reply can never race past it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::metrics::{PENDING_REQUESTS, RESPONSE_TIMEOUTS, UNSOLICITED_RESPONSES};
use crate::task::{Task, TaskError, TaskId, TaskVar};
use crate::transport::{
    decode, encode, Envelope, Message, Method, Signal, TransportRequest, TransportResponse,
    TransportSignal,
};

/// Capacity of the request and unsolicited-response queues
pub const QUEUE_CAPACITY: usize = 1024;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum CommError {
    #[error("task {0} is not installed")]
    NotInstalled(TaskId),
    #[error("task {0} is already installed")]
    AlreadyInstalled(TaskId),
    #[error("transport of task {0} is closed")]
    Closed(TaskId),
    #[error("timed out after {timeout:?} waiting for response {id}")]
    Timeout { id: i64, timeout: Duration },
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl CommError {
    /// Timeouts leave the transport usable; the caller may try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommError::Timeout { .. })
    }
}

/// Who issued a request and how to answer it
#[derive(Clone)]
pub struct InvocationInfo {
    pub task: Arc<dyn Task>,
    pub comm: Arc<CommunicationManager>,
}

/// A guest-issued request waiting for the dispatcher
pub struct IncomingRequest {
    pub request: TransportRequest,
    pub inv: InvocationInfo,
}

/// A response no waiter claimed
#[derive(Debug, Clone)]
pub struct UnsolicitedResponse {
    pub task_id: TaskId,
    pub response: TransportResponse,
}

enum Reply {
    Once(oneshot::Sender<TransportResponse>),
    Callback(mpsc::UnboundedSender<TransportResponse>),
}

struct PendingRequest {
    reply: Reply,
    issued_at: Instant,
    /// Remove the entry on first delivery
    auto_clear: bool,
}

type PendingKey = (TaskId, i64);

struct Outbound {
    task: Arc<dyn Task>,
    /// `None` once the task's reader has exited
    tx: Option<mpsc::Sender<Message>>,
}

pub struct CommunicationManager {
    response_timeout: Duration,
    pending: RwLock<HashMap<PendingKey, PendingRequest>>,
    outbound: RwLock<HashMap<TaskId, Outbound>>,
    requests_tx: mpsc::Sender<IncomingRequest>,
    requests_rx: Mutex<Option<mpsc::Receiver<IncomingRequest>>>,
    unsolicited_tx: mpsc::Sender<UnsolicitedResponse>,
    unsolicited_rx: tokio::sync::Mutex<mpsc::Receiver<UnsolicitedResponse>>,
}

impl CommunicationManager {
    pub fn new(response_timeout: Duration) -> Arc<Self> {
        let (requests_tx, requests_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (unsolicited_tx, unsolicited_rx) = mpsc::channel(QUEUE_CAPACITY);
        Arc::new(Self {
            response_timeout,
            pending: RwLock::new(HashMap::new()),
            outbound: RwLock::new(HashMap::new()),
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            unsolicited_tx,
            unsolicited_rx: tokio::sync::Mutex::new(unsolicited_rx),
        })
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Hand the request queue to its single consumer
    pub fn take_requests(&self) -> Option<mpsc::Receiver<IncomingRequest>> {
        self.requests_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Attach to a task and start its reader
    pub fn install(self: &Arc<Self>, task: Arc<dyn Task>) -> Result<(), CommError> {
        let task_id = task.id();
        {
            let mut outbound = self.outbound.write().unwrap_or_else(|p| p.into_inner());
            if outbound.contains_key(&task_id) {
                return Err(CommError::AlreadyInstalled(task_id));
            }
            let channels = task.comm_channels()?;
            outbound.insert(
                task_id.clone(),
                Outbound {
                    task: task.clone(),
                    tx: Some(channels.to_task),
                },
            );

            let comm = self.clone();
            tokio::spawn(async move {
                comm.read_loop(task, channels.from_task).await;
            });
        }
        debug!(task_id = %task_id, "Communication manager installed");
        Ok(())
    }

    /// An installed task by id
    pub fn task(&self, task_id: &TaskId) -> Option<Arc<dyn Task>> {
        self.outbound
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_id)
            .map(|out| out.task.clone())
    }

    /// Forget a task entirely. Its transport is closed once no send is in
    /// flight.
    pub fn uninstall(&self, task_id: &TaskId) {
        self.outbound
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(task_id);
        self.drop_pending_for(task_id);
    }

    async fn read_loop(self: Arc<Self>, task: Arc<dyn Task>, mut from_task: mpsc::Receiver<Message>) {
        let task_id = task.id();
        while let Some(msg) = from_task.recv().await {
            let envelope = match decode(&msg) {
                Ok(env) => env,
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Undecodable envelope, closing reader");
                    break;
                }
            };

            match envelope {
                Envelope::Request(request) => {
                    debug!(task_id = %task_id, id = request.id, method = %request.method(), "Request from task");
                    let incoming = IncomingRequest {
                        request,
                        inv: InvocationInfo {
                            task: task.clone(),
                            comm: self.clone(),
                        },
                    };
                    if self.requests_tx.send(incoming).await.is_err() {
                        warn!(task_id = %task_id, "Request queue closed, closing reader");
                        break;
                    }
                }
                Envelope::Response(response) => {
                    if let Some(response) = self.deliver(&task_id, response) {
                        warn!(task_id = %task_id, id = response.id, "No callback for id");
                        UNSOLICITED_RESPONSES.inc();
                        let unsolicited = UnsolicitedResponse {
                            task_id: task_id.clone(),
                            response,
                        };
                        if self.unsolicited_tx.try_send(unsolicited).is_err() {
                            warn!(task_id = %task_id, "Unsolicited response queue full, dropping");
                        }
                    }
                }
                Envelope::Signal(signal) => match signal.method() {
                    Signal::Terminate => {
                        info!(task_id = %task_id, "Task requested termination");
                        task.set_var(TaskVar::TerminateRequested, Some(serde_json::Value::Bool(true)));
                    }
                    other => {
                        info!(task_id = %task_id, signal = ?other, "Signal from task");
                    }
                },
            }
        }

        debug!(task_id = %task_id, "Task reader exited");
        if let Some(out) = self
            .outbound
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(&task_id)
        {
            out.tx = None;
        }
        self.drop_pending_for(&task_id);
    }

    /// Route a response to its waiter; hands it back if nobody waits for it
    fn deliver(&self, task_id: &TaskId, response: TransportResponse) -> Option<TransportResponse> {
        let key = (task_id.clone(), response.id);
        let mut pending = self.pending.write().unwrap_or_else(|p| p.into_inner());

        let keep = match pending.get(&key) {
            None => return Some(response),
            Some(entry) => !entry.auto_clear && matches!(entry.reply, Reply::Callback(_)),
        };

        if keep {
            let receiver_gone = match pending.get(&key) {
                Some(PendingRequest {
                    reply: Reply::Callback(tx),
                    ..
                }) => tx.send(response).is_err(),
                _ => false,
            };
            if receiver_gone {
                pending.remove(&key);
            }
        } else if let Some(entry) = pending.remove(&key) {
            debug!(task_id = %task_id, id = response.id, elapsed_ms = entry.issued_at.elapsed().as_millis() as u64, "Response delivered");
            let delivered = match entry.reply {
                Reply::Once(tx) => tx.send(response).is_ok(),
                Reply::Callback(tx) => tx.send(response).is_ok(),
            };
            if !delivered {
                debug!(task_id = %task_id, "Waiter gone before its response arrived");
            }
        }
        PENDING_REQUESTS.set(pending.len() as i64);
        None
    }

    fn add_pending(&self, key: PendingKey, reply: Reply, auto_clear: bool) {
        let mut pending = self.pending.write().unwrap_or_else(|p| p.into_inner());
        pending.insert(
            key,
            PendingRequest {
                reply,
                issued_at: Instant::now(),
                auto_clear,
            },
        );
        PENDING_REQUESTS.set(pending.len() as i64);
    }

    fn remove_pending(&self, key: &PendingKey) {
        let mut pending = self.pending.write().unwrap_or_else(|p| p.into_inner());
        pending.remove(key);
        PENDING_REQUESTS.set(pending.len() as i64);
    }

    fn drop_pending_for(&self, task_id: &TaskId) {
        let mut pending = self.pending.write().unwrap_or_else(|p| p.into_inner());
        pending.retain(|(tid, _), _| tid != task_id);
        PENDING_REQUESTS.set(pending.len() as i64);
    }

    async fn write(&self, task_id: &TaskId, envelope: &Envelope) -> Result<(), CommError> {
        let tx = {
            let outbound = self.outbound.read().unwrap_or_else(|p| p.into_inner());
            match outbound.get(task_id) {
                None => return Err(CommError::NotInstalled(task_id.clone())),
                Some(Outbound { tx: None, .. }) => return Err(CommError::Closed(task_id.clone())),
                Some(Outbound { tx: Some(tx), .. }) => tx.clone(),
            }
        };
        tx.send(encode(envelope))
            .await
            .map_err(|_| CommError::Closed(task_id.clone()))
    }

    /// Issue a request with a caller-chosen id and return the waiter
    /// without blocking on the reply.
    pub async fn send_request_with_id(
        &self,
        task: &dyn Task,
        id: i64,
        method: Method,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<TransportResponse>, CommError> {
        let task_id = task.id();
        let key = (task_id.clone(), id);
        let (tx, rx) = oneshot::channel();
        self.add_pending(key.clone(), Reply::Once(tx), true);

        let envelope = Envelope::Request(TransportRequest::new(id, method, payload));
        if let Err(e) = self.write(&task_id, &envelope).await {
            self.remove_pending(&key);
            return Err(e);
        }
        debug!(task_id = %task_id, id, method = %method, "Request sent to task");
        Ok(rx)
    }

    /// Issue a request whose responses arrive on a channel
    ///
    /// With `auto_clear` the registration ends after the first response;
    /// otherwise it stays until [`clear_callback`](Self::clear_callback).
    pub async fn send_request_callback(
        &self,
        task: &dyn Task,
        method: Method,
        payload: Vec<u8>,
        auto_clear: bool,
    ) -> Result<(i64, mpsc::UnboundedReceiver<TransportResponse>), CommError> {
        let task_id = task.id();
        let id = task.next_request_id();
        let key = (task_id.clone(), id);
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_pending(key.clone(), Reply::Callback(tx), auto_clear);

        let envelope = Envelope::Request(TransportRequest::new(id, method, payload));
        if let Err(e) = self.write(&task_id, &envelope).await {
            self.remove_pending(&key);
            return Err(e);
        }
        Ok((id, rx))
    }

    pub fn clear_callback(&self, task_id: &TaskId, id: i64) {
        self.remove_pending(&(task_id.clone(), id));
    }

    /// Issue a request and block until its response or the default timeout
    pub async fn send_request(
        &self,
        task: &dyn Task,
        method: Method,
        payload: Vec<u8>,
    ) -> Result<TransportResponse, CommError> {
        self.send_request_timeout(task, method, payload, self.response_timeout)
            .await
    }

    pub async fn send_request_timeout(
        &self,
        task: &dyn Task,
        method: Method,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransportResponse, CommError> {
        let task_id = task.id();
        let id = task.next_request_id();
        let rx = self.send_request_with_id(task, id, method, payload).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) if response.is_ok() => Ok(response),
            Ok(Ok(response)) => Err(CommError::Remote {
                code: response.code,
                message: response.message,
            }),
            Ok(Err(_)) => Err(CommError::Closed(task_id)),
            Err(_) => {
                self.remove_pending(&(task_id.clone(), id));
                RESPONSE_TIMEOUTS.inc();
                warn!(task_id = %task_id, id, method = %method, "Request timed out");
                Err(CommError::Timeout { id, timeout })
            }
        }
    }

    pub async fn send_response(
        &self,
        task: &dyn Task,
        id: i64,
        payload: Vec<u8>,
    ) -> Result<(), CommError> {
        self.write(&task.id(), &Envelope::Response(TransportResponse::ok(id, payload)))
            .await
    }

    pub async fn send_error_response(
        &self,
        task: &dyn Task,
        id: i64,
        code: i32,
        message: impl Into<String>,
    ) -> Result<(), CommError> {
        self.write(
            &task.id(),
            &Envelope::Response(TransportResponse::error(id, code, message)),
        )
        .await
    }

    pub async fn send_signal(
        &self,
        task: &dyn Task,
        signal: Signal,
        payload: Vec<u8>,
    ) -> Result<(), CommError> {
        self.write(&task.id(), &Envelope::Signal(TransportSignal::new(signal, payload)))
            .await
    }

    /// Wait for the next response no waiter claimed
    pub async fn next_unsolicited_response(&self) -> Option<UnsolicitedResponse> {
        self.unsolicited_rx.lock().await.recv().await
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().map(|p| p.len()).unwrap_or(0)
    }
}
