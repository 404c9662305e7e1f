//! Task lifecycle and runtimes
//!
//! A [`Task`] is one running workload. Whatever the backend, it exposes the
//! same pair of message queues to the host:
//!
//! ```text
//!             to_task (host → guest)            ┌──────────────┐
//!  Host ─────────────────────────► writer pump ─►│              │
//!                                                │   workload   │
//!  Host ◄───────────────────────── reader pump ◄─│  (process /  │
//!             from_task (guest → host)           │  container)  │
//!                                                └──────────────┘
//! ```
//!
//! Status only moves forward: `Init → Running → Stopped`.

pub mod container;
pub mod docker;
pub mod handshake;
pub mod memory;
pub mod process;
pub mod pumps;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::transport::Message;

pub use container::ContainerTaskRuntime;
pub use handshake::SecretListener;
pub use memory::MemoryTask;
pub use process::ProcessTaskRuntime;

/// Capacity of each per-task message queue
pub const TASK_CHANNEL_CAPACITY: usize = 128;

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Init,
    Running,
    Stopped,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Init => write!(f, "init"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Workload backend. The numeric values are the ones used by the
/// `Spear-Func-Type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Container = 1,
    Process = 2,
}

impl TaskKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(TaskKind::Container),
            2 => Some(TaskKind::Process),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Container => "container",
            TaskKind::Process => "process",
        }
    }
}

/// How frames reach the workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Frames on the workload's stdin/stdout
    Stdio,
    /// Workload dials the runtime listener and authenticates with its secret
    #[default]
    Tcp,
}

/// Keys of the per-task variable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskVar {
    /// Set through `transform.config`
    TransformTest,
    /// Guest sent a Terminate signal
    TerminateRequested,
}

/// Everything a runtime needs to launch one workload
#[derive(Debug, Clone, Default)]
pub struct TaskConfig {
    pub name: String,
    /// Container image (container backend)
    pub image: String,
    /// Executable path (process backend)
    pub cmd: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task {0} has already been started")]
    AlreadyStarted(TaskId),
    #[error("communication channels of task {0} were already taken")]
    ChannelsTaken(TaskId),
    #[error("failed to spawn workload: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("container backend error: {0}")]
    Docker(#[from] docker::DockerError),
    #[error("invalid task config: {0}")]
    InvalidConfig(String),
    #[error("task runtime not available: {0}")]
    RuntimeUnavailable(String),
}

/// Both halves of a task's queues as seen by the host
pub struct CommChannels {
    pub to_task: mpsc::Sender<Message>,
    pub from_task: mpsc::Receiver<Message>,
}

/// The transport-side ends, handed to the pumps on start
pub struct TransportEnds {
    pub inbound: mpsc::Receiver<Message>,
    pub outbound: mpsc::Sender<Message>,
}

/// State shared by every backend: identity, status, request ids, variables
/// and the queue pair.
pub struct TaskState {
    id: TaskId,
    name: String,
    status: watch::Sender<TaskStatus>,
    exit_code: Mutex<Option<i32>>,
    next_request_id: AtomicI64,
    vars: Mutex<HashMap<TaskVar, serde_json::Value>>,
    /// Handed out with `from_task`; the writer pump sends the close frame
    /// once the holder drops it
    to_task: Mutex<Option<mpsc::Sender<Message>>>,
    from_task: Mutex<Option<mpsc::Receiver<Message>>>,
    transport: Mutex<Option<TransportEnds>>,
}

impl TaskState {
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        let (to_task, inbound) = mpsc::channel(TASK_CHANNEL_CAPACITY);
        let (outbound, from_task) = mpsc::channel(TASK_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(TaskStatus::Init);
        Self {
            id: id.into(),
            name: name.into(),
            status,
            exit_code: Mutex::new(None),
            next_request_id: AtomicI64::new(1),
            vars: Mutex::new(HashMap::new()),
            to_task: Mutex::new(Some(to_task)),
            from_task: Mutex::new(Some(from_task)),
            transport: Mutex::new(Some(TransportEnds { inbound, outbound })),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// Init → Running. Any other starting state is rejected.
    pub fn mark_running(&self) -> Result<(), TaskError> {
        let mut moved = false;
        self.status.send_if_modified(|s| {
            if *s == TaskStatus::Init {
                *s = TaskStatus::Running;
                moved = true;
            }
            moved
        });
        if moved {
            Ok(())
        } else {
            Err(TaskError::AlreadyStarted(self.id.clone()))
        }
    }

    /// Move to Stopped, recording the exit code if one is known.
    /// Drops any transport ends that were never handed to pumps so the
    /// host side sees its queues close.
    pub fn mark_stopped(&self, exit_code: Option<i32>) {
        if let Ok(mut code) = self.exit_code.lock() {
            if code.is_none() {
                *code = exit_code;
            }
        }
        if let Ok(mut ends) = self.transport.lock() {
            ends.take();
        }
        self.status.send_if_modified(|s| {
            if *s != TaskStatus::Stopped {
                *s = TaskStatus::Stopped;
                true
            } else {
                false
            }
        });
    }

    pub fn take_transport(&self) -> Option<TransportEnds> {
        self.transport.lock().ok().and_then(|mut t| t.take())
    }

    pub fn comm_channels(&self) -> Result<CommChannels, TaskError> {
        let taken = || TaskError::ChannelsTaken(self.id.clone());
        let mut to_task = self.to_task.lock().map_err(|_| taken())?;
        let mut from_task = self.from_task.lock().map_err(|_| taken())?;
        match (to_task.take(), from_task.take()) {
            (Some(to_task), Some(from_task)) => Ok(CommChannels { to_task, from_task }),
            _ => Err(taken()),
        }
    }

    pub fn next_request_id(&self) -> i64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_var(&self, key: TaskVar, value: Option<serde_json::Value>) {
        if let Ok(mut vars) = self.vars.lock() {
            match value {
                Some(v) => {
                    vars.insert(key, v);
                }
                None => {
                    vars.remove(&key);
                }
            }
        }
    }

    pub fn get_var(&self, key: TaskVar) -> Option<serde_json::Value> {
        self.vars.lock().ok().and_then(|vars| vars.get(&key).cloned())
    }

    /// Block until the task is stopped; returns the exit code if known
    pub async fn wait(&self) -> Option<i32> {
        let mut rx = self.status.subscribe();
        // the sender lives in self, so this only fails if self is gone
        let _ = rx.wait_for(|s| *s == TaskStatus::Stopped).await;
        self.exit_code.lock().ok().and_then(|c| *c)
    }
}

/// One workload instance
///
/// Backends embed a [`TaskState`] and implement `start`/`stop`; everything
/// else is provided.
#[async_trait]
pub trait Task: Send + Sync {
    fn state(&self) -> &TaskState;

    /// Launch the workload and its I/O pumps. On failure the task stays in `Init`.
    async fn start(&self) -> Result<(), TaskError>;

    /// Best-effort termination; safe to call after natural exit
    async fn stop(&self) -> Result<(), TaskError>;

    fn id(&self) -> TaskId {
        self.state().id().clone()
    }

    fn name(&self) -> &str {
        self.state().name()
    }

    fn status(&self) -> TaskStatus {
        self.state().status()
    }

    /// Take the host side of the queues. Only the first call succeeds, and
    /// dropping `to_task` closes the guest's transport.
    fn comm_channels(&self) -> Result<CommChannels, TaskError> {
        self.state().comm_channels()
    }

    async fn wait(&self) -> Option<i32> {
        self.state().wait().await
    }

    fn next_request_id(&self) -> i64 {
        self.state().next_request_id()
    }

    fn set_var(&self, key: TaskVar, value: Option<serde_json::Value>) {
        self.state().set_var(key, value)
    }

    fn get_var(&self, key: TaskVar) -> Option<serde_json::Value> {
        self.state().get_var(key)
    }
}

/// Factory and registry for one backend
#[async_trait]
pub trait TaskRuntime: Send + Sync {
    fn kind(&self) -> TaskKind;

    async fn create_task(&self, cfg: TaskConfig) -> Result<Arc<dyn Task>, TaskError>;

    /// Backend setup, e.g. binding the handshake listener
    async fn start(&self) -> Result<(), TaskError>;

    /// Stop every task this runtime created and release backend resources
    async fn stop(&self) -> Result<(), TaskError>;
}

/// Tasks tracked by a runtime, keyed by id
#[derive(Default)]
pub(crate) struct TaskTable {
    tasks: tokio::sync::Mutex<HashMap<TaskId, Arc<dyn Task>>>,
}

impl TaskTable {
    pub(crate) async fn insert(&self, task: Arc<dyn Task>) {
        self.tasks.lock().await.insert(task.id(), task);
    }

    pub(crate) async fn stop_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain().map(|(_, t)| t).collect();
        for task in tasks {
            if let Err(e) = task.stop().await {
                tracing::warn!(task_id = %task.id(), error = %e, "Failed to stop task");
            }
        }
    }

    /// Tasks not yet stopped
    pub(crate) async fn live(&self) -> usize {
        self.prune().await;
        self.tasks.lock().await.len()
    }

    /// Forget tasks that have already stopped
    pub(crate) async fn prune(&self) {
        self.tasks
            .lock()
            .await
            .retain(|_, t| t.status() != TaskStatus::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        let state = TaskState::new("t1", "demo");
        assert_eq!(state.status(), TaskStatus::Init);
        state.mark_running().unwrap();
        assert_eq!(state.status(), TaskStatus::Running);
        assert!(matches!(state.mark_running(), Err(TaskError::AlreadyStarted(_))));

        state.mark_stopped(Some(0));
        assert_eq!(state.status(), TaskStatus::Stopped);
        assert!(state.mark_running().is_err());
        assert_eq!(state.status(), TaskStatus::Stopped);
    }

    #[test]
    fn test_request_ids_increase() {
        let state = TaskState::new("t1", "demo");
        let a = state.next_request_id();
        let b = state.next_request_id();
        assert_eq!(a, 1);
        assert!(b > a);
    }

    #[test]
    fn test_comm_channels_taken_once() {
        let state = TaskState::new("t1", "demo");
        assert!(state.comm_channels().is_ok());
        assert!(matches!(state.comm_channels(), Err(TaskError::ChannelsTaken(_))));
    }

    #[test]
    fn test_vars_set_and_reset() {
        let state = TaskState::new("t1", "demo");
        assert!(state.get_var(TaskVar::TransformTest).is_none());
        state.set_var(TaskVar::TransformTest, Some(serde_json::json!("on")));
        assert_eq!(state.get_var(TaskVar::TransformTest), Some(serde_json::json!("on")));
        state.set_var(TaskVar::TransformTest, None);
        assert!(state.get_var(TaskVar::TransformTest).is_none());
    }

    #[tokio::test]
    async fn test_wait_returns_after_stop_for_every_waiter() {
        let state = Arc::new(TaskState::new("t1", "demo"));
        state.mark_running().unwrap();

        let w1 = tokio::spawn({
            let s = state.clone();
            async move { s.wait().await }
        });
        let w2 = tokio::spawn({
            let s = state.clone();
            async move { s.wait().await }
        });

        state.mark_stopped(Some(3));
        assert_eq!(w1.await.unwrap(), Some(3));
        assert_eq!(w2.await.unwrap(), Some(3));
        // waiting after the fact returns immediately
        assert_eq!(state.wait().await, Some(3));
    }

    #[test]
    fn test_task_kind_codes() {
        assert_eq!(TaskKind::from_code(1), Some(TaskKind::Container));
        assert_eq!(TaskKind::from_code(2), Some(TaskKind::Process));
        assert_eq!(TaskKind::from_code(3), None);
    }
}
