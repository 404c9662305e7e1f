//! Process backend
//!
//! Workloads run as child processes. Frames travel either over the child's
//! stdin/stdout or over a TCP connection the child opens to the runtime's
//! [`SecretListener`].

use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handshake::{SecretListener, ENV_SECRET, ENV_SERVICE_ADDR};
use super::pumps::{spawn_frame_pumps, spawn_log_lines};
use super::{
    Task, TaskConfig, TaskError, TaskKind, TaskRuntime, TaskState, TaskStatus, TaskTable,
    TransportMode,
};
use crate::metrics::{TASKS_CREATED, TASKS_STOPPED};

/// Listener ports are picked at random from `[base, base + span)`
pub const PROCESS_LISTEN_PORT_BASE: u16 = 9100;
pub const PROCESS_LISTEN_PORT_SPAN: u16 = 500;

/// Time a child gets to exit after SIGTERM before it is killed
pub const STOP_GRACE: Duration = Duration::from_secs(2);

pub struct ProcessTask {
    state: Arc<TaskState>,
    cfg: TaskConfig,
    mode: TransportMode,
    listener: Option<Arc<SecretListener>>,
    pid: AtomicU32,
}

impl ProcessTask {
    fn new(cfg: TaskConfig, mode: TransportMode, listener: Option<Arc<SecretListener>>) -> Self {
        let id = Uuid::now_v7().to_string();
        Self {
            state: Arc::new(TaskState::new(id, cfg.name.clone())),
            cfg,
            mode,
            listener,
            pid: AtomicU32::new(0),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cfg.cmd);
        cmd.args(&self.cfg.args)
            .envs(self.cfg.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match self.mode {
            TransportMode::Stdio => cmd.stdin(Stdio::piped()),
            TransportMode::Tcp => cmd.stdin(Stdio::null()),
        };
        cmd
    }
}

#[async_trait]
impl Task for ProcessTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn start(&self) -> Result<(), TaskError> {
        let id = self.state.id().clone();
        if self.state.status() != TaskStatus::Init {
            return Err(TaskError::AlreadyStarted(id));
        }

        let mut cmd = self.command();

        // The secret has to exist before the child can dial in
        let pending_conn = match (self.mode, &self.listener) {
            (TransportMode::Tcp, Some(listener)) => {
                let (secret, rx) = listener.register();
                cmd.env(ENV_SERVICE_ADDR, listener.local_addr().to_string())
                    .env(ENV_SECRET, secret.to_string());
                Some((secret, rx))
            }
            (TransportMode::Tcp, None) => {
                return Err(TaskError::RuntimeUnavailable(
                    "process runtime listener not started".to_string(),
                ))
            }
            (TransportMode::Stdio, _) => None,
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let (Some((secret, _)), Some(listener)) = (&pending_conn, &self.listener) {
                    listener.forget(*secret);
                }
                return Err(TaskError::Spawn(e));
            }
        };
        self.pid.store(child.id().unwrap_or(0), Ordering::SeqCst);

        let ends = self
            .state
            .take_transport()
            .ok_or_else(|| TaskError::AlreadyStarted(id.clone()))?;
        let name = self.state.name().to_string();

        if let Some(stderr) = child.stderr.take() {
            spawn_log_lines(name.clone(), "stderr", stderr);
        }

        match pending_conn {
            None => match (child.stdout.take(), child.stdin.take()) {
                (Some(stdout), Some(stdin)) => {
                    spawn_frame_pumps(id.clone(), stdout, stdin, ends);
                }
                _ => warn!(task_id = %id, "Child stdio not captured"),
            },
            Some((secret, rx)) => {
                if let Some(stdout) = child.stdout.take() {
                    spawn_log_lines(name.clone(), "stdout", stdout);
                }
                let listener = self.listener.clone();
                let state = self.state.clone();
                tokio::spawn(async move {
                    let conn_id = state.id().clone();
                    tokio::select! {
                        res = rx => match res {
                            Ok(stream) => {
                                info!(task_id = %conn_id, "Task connected");
                                let (reader, writer) = stream.into_split();
                                spawn_frame_pumps(conn_id, reader, writer, ends);
                                return;
                            }
                            Err(_) => debug!(task_id = %conn_id, "Handshake registration dropped"),
                        },
                        _ = state.wait() => {
                            debug!(task_id = %conn_id, "Task exited before connecting");
                        }
                    }
                    // dropping `ends` closes the host side of the queues
                    if let Some(listener) = listener {
                        listener.forget(secret);
                    }
                });
            }
        }

        self.state.mark_running()?;
        TASKS_CREATED.with_label_values(&[TaskKind::Process.as_str()]).inc();
        info!(task_id = %id, task = %name, cmd = %self.cfg.cmd, "Process task started");

        // Monitor owns the child until it exits
        let state = self.state.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(task_id = %state.id(), error = %e, "Failed to wait on child");
                    None
                }
            };
            info!(task_id = %state.id(), exit_code = ?code, "Process task exited");
            TASKS_STOPPED.with_label_values(&[TaskKind::Process.as_str()]).inc();
            state.mark_stopped(code);
        });

        Ok(())
    }

    async fn stop(&self) -> Result<(), TaskError> {
        match self.state.status() {
            TaskStatus::Init => {
                self.state.mark_stopped(None);
                Ok(())
            }
            TaskStatus::Stopped => Ok(()),
            TaskStatus::Running => {
                let pid = self.pid.load(Ordering::SeqCst);
                if pid == 0 {
                    return Ok(());
                }
                let task_id = self.state.id();
                let pid = Pid::from_raw(pid as i32);
                if let Err(e) = kill(pid, Signal::SIGTERM) {
                    // ESRCH: already gone
                    debug!(task_id = %task_id, error = %e, "SIGTERM not delivered");
                }
                if tokio::time::timeout(STOP_GRACE, self.state.wait()).await.is_ok() {
                    return Ok(());
                }

                warn!(task_id = %task_id, grace = ?STOP_GRACE, "Task ignored SIGTERM, killing it");
                if let Err(e) = kill(pid, Signal::SIGKILL) {
                    debug!(task_id = %task_id, error = %e, "SIGKILL not delivered");
                }
                // the monitor marks the task stopped once the child is reaped
                if tokio::time::timeout(STOP_GRACE, self.state.wait()).await.is_err() {
                    warn!(task_id = %task_id, "Task still running after SIGKILL");
                }
                Ok(())
            }
        }
    }
}

/// Creates [`ProcessTask`]s and owns the shared handshake listener
pub struct ProcessTaskRuntime {
    mode: TransportMode,
    listen_host: String,
    listener: OnceCell<Arc<SecretListener>>,
    tasks: TaskTable,
}

impl ProcessTaskRuntime {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            listen_host: "127.0.0.1".to_string(),
            listener: OnceCell::new(),
            tasks: TaskTable::default(),
        }
    }

    /// Tasks created by this runtime that have not stopped
    pub async fn live_tasks(&self) -> usize {
        self.tasks.live().await
    }

    /// Address children are told to dial, once the runtime is started
    pub fn service_addr(&self) -> Option<SocketAddr> {
        self.listener.get().map(|l| l.local_addr())
    }
}

#[async_trait]
impl TaskRuntime for ProcessTaskRuntime {
    fn kind(&self) -> TaskKind {
        TaskKind::Process
    }

    async fn create_task(&self, cfg: TaskConfig) -> Result<Arc<dyn Task>, TaskError> {
        if cfg.cmd.is_empty() {
            return Err(TaskError::InvalidConfig("process task needs a command".to_string()));
        }
        if self.mode == TransportMode::Tcp && self.listener.get().is_none() {
            self.start().await?;
        }
        self.tasks.prune().await;

        let task: Arc<dyn Task> = Arc::new(ProcessTask::new(
            cfg,
            self.mode,
            self.listener.get().cloned(),
        ));
        self.tasks.insert(task.clone()).await;
        debug!(task_id = %task.id(), task = %task.name(), "Process task created");
        Ok(task)
    }

    async fn start(&self) -> Result<(), TaskError> {
        if self.mode != TransportMode::Tcp {
            return Ok(());
        }
        self.listener
            .get_or_try_init(|| async {
                SecretListener::bind_in_range(
                    &self.listen_host,
                    PROCESS_LISTEN_PORT_BASE,
                    PROCESS_LISTEN_PORT_SPAN,
                )
                .await
                .map(Arc::new)
            })
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), TaskError> {
        self.tasks.stop_all().await;
        Ok(())
    }
}
