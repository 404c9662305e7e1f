//! Container backend
//!
//! ```text
//! create ─► attach stdin ─► start ─► follow logs ─┬─ stdout chunks ─► frame reader  (stdio mode)
//!                                                 │                   or host log   (tcp mode)
//!                                                 └─ stderr chunks ─► host log
//! ```
//!
//! In stdio mode outbound frames are written to the attached stdin stream.
//! In tcp mode the container dials the runtime listener through the
//! `host.docker.internal` alias, exactly like a process workload.

use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::BodyExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::docker::{ContainerSpec, DockerClient, DEFAULT_DOCKER_SOCKET};
use super::handshake::{SecretListener, ENV_SECRET, ENV_SERVICE_ADDR};
use super::pumps::spawn_frame_pumps;
use super::{
    Task, TaskConfig, TaskError, TaskKind, TaskRuntime, TaskState, TaskStatus, TaskTable,
    TransportMode,
};
use crate::metrics::{TASKS_CREATED, TASKS_STOPPED};
use crate::transport::demux::{LogDemuxer, StreamKind};

pub const CONTAINER_LISTEN_PORT_BASE: u16 = 8100;
pub const CONTAINER_LISTEN_PORT_SPAN: u16 = 500;

/// Seconds the engine waits before killing a stopping container
const STOP_GRACE_SECS: u32 = 5;

/// Settings shared by every container task of one runtime
#[derive(Debug, Clone)]
pub struct ContainerRuntimeConfig {
    pub socket_path: String,
    pub mode: TransportMode,
    /// Host name containers use to reach the runtime listener
    pub host_alias: String,
    /// Keep containers around after exit
    pub debug: bool,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_DOCKER_SOCKET.to_string(),
            mode: TransportMode::Tcp,
            host_alias: "host.docker.internal".to_string(),
            debug: false,
        }
    }
}

pub struct ContainerTask {
    state: Arc<TaskState>,
    docker: DockerClient,
    container_id: String,
    cfg: ContainerRuntimeConfig,
    /// Secret registered for tcp mode, waiting for the container to dial in
    pending_conn: Mutex<Option<(i64, tokio::sync::oneshot::Receiver<tokio::net::TcpStream>)>>,
    listener: Option<Arc<SecretListener>>,
}

#[async_trait]
impl Task for ContainerTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn start(&self) -> Result<(), TaskError> {
        let id = self.state.id().clone();
        if self.state.status() != TaskStatus::Init {
            return Err(TaskError::AlreadyStarted(id));
        }

        // stdin must be attached before start or early frames are lost
        let stdin = match self.cfg.mode {
            TransportMode::Stdio => Some(self.docker.attach_stdin(&self.container_id).await?),
            TransportMode::Tcp => None,
        };

        self.docker.start_container(&self.container_id).await?;
        let logs = self.docker.follow_logs(&self.container_id).await?;

        let ends = self
            .state
            .take_transport()
            .ok_or_else(|| TaskError::AlreadyStarted(id.clone()))?;
        let name = self.state.name().to_string();

        // Container stdout becomes the frame reader's input in stdio mode
        let (mut frame_sink, frame_source) = tokio::io::duplex(64 * 1024);
        let stdio = self.cfg.mode == TransportMode::Stdio;

        match (stdin, self.pending_conn.lock().await.take()) {
            (Some(stdin), _) => {
                spawn_frame_pumps(id.clone(), frame_source, stdin, ends);
            }
            (None, Some((secret, rx))) => {
                let state = self.state.clone();
                let listener = self.listener.clone();
                tokio::spawn(async move {
                    let conn_id = state.id().clone();
                    tokio::select! {
                        res = rx => if let Ok(stream) = res {
                            info!(task_id = %conn_id, "Container connected");
                            let (reader, writer) = stream.into_split();
                            spawn_frame_pumps(conn_id, reader, writer, ends);
                            return;
                        },
                        _ = state.wait() => {
                            debug!(task_id = %conn_id, "Container exited before connecting");
                        }
                    }
                    if let Some(listener) = listener {
                        listener.forget(secret);
                    }
                });
            }
            (None, None) => {
                return Err(TaskError::RuntimeUnavailable(
                    "container runtime listener not started".to_string(),
                ))
            }
        }

        let log_name = name.clone();
        tokio::spawn(async move {
            let mut body = logs;
            let mut demux = LogDemuxer::new();
            while let Some(frame) = body.frame().await {
                let data = match frame {
                    Ok(frame) => match frame.into_data() {
                        Ok(data) => data,
                        Err(_) => continue,
                    },
                    Err(e) => {
                        warn!(task = %log_name, error = %e, "Container log stream failed");
                        break;
                    }
                };
                let chunks = match demux.push(&data) {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        warn!(task = %log_name, error = %e, "Corrupt container log stream");
                        break;
                    }
                };
                for (stream, payload) in chunks {
                    match stream {
                        StreamKind::Stdout if stdio => {
                            if frame_sink.write_all(&payload).await.is_err() {
                                debug!(task = %log_name, "Frame reader gone");
                            }
                        }
                        _ => {
                            for line in String::from_utf8_lossy(&payload).lines() {
                                info!(task = %log_name, stream = ?stream, "{}", line);
                            }
                        }
                    }
                }
            }
            // dropping the sink gives the frame reader its EOF
        });

        self.state.mark_running()?;
        TASKS_CREATED.with_label_values(&[TaskKind::Container.as_str()]).inc();
        info!(task_id = %id, task = %name, "Container task started");

        let state = self.state.clone();
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        tokio::spawn(async move {
            let code = match docker.wait_container(&container_id).await {
                Ok(code) => Some(code as i32),
                Err(e) => {
                    warn!(task_id = %container_id, error = %e, "Failed to wait on container");
                    None
                }
            };
            info!(task_id = %container_id, exit_code = ?code, "Container task exited");
            TASKS_STOPPED.with_label_values(&[TaskKind::Container.as_str()]).inc();
            state.mark_stopped(code);
        });

        Ok(())
    }

    async fn stop(&self) -> Result<(), TaskError> {
        match self.state.status() {
            TaskStatus::Stopped => Ok(()),
            TaskStatus::Init => {
                self.state.mark_stopped(None);
                if let Some((secret, _)) = self.pending_conn.lock().await.take() {
                    if let Some(listener) = &self.listener {
                        listener.forget(secret);
                    }
                }
                if !self.cfg.debug {
                    self.docker.remove_container(&self.container_id).await?;
                }
                Ok(())
            }
            TaskStatus::Running => {
                if let Err(e) = self
                    .docker
                    .stop_container(&self.container_id, STOP_GRACE_SECS)
                    .await
                {
                    debug!(task_id = %self.container_id, error = %e, "Stop request failed");
                }
                Ok(())
            }
        }
    }
}

/// Creates [`ContainerTask`]s through the Docker Engine API
pub struct ContainerTaskRuntime {
    cfg: ContainerRuntimeConfig,
    docker: DockerClient,
    listener: OnceCell<Arc<SecretListener>>,
    tasks: TaskTable,
}

impl ContainerTaskRuntime {
    pub fn new(cfg: ContainerRuntimeConfig) -> Self {
        let docker = DockerClient::new(cfg.socket_path.clone());
        Self {
            cfg,
            docker,
            listener: OnceCell::new(),
            tasks: TaskTable::default(),
        }
    }

    /// Environment and host config for one container
    fn container_spec(&self, cfg: &TaskConfig, secret: Option<i64>) -> ContainerSpec {
        let mut spec = ContainerSpec::new(cfg.image.clone());
        spec.cmd = if cfg.cmd.is_empty() {
            Vec::new()
        } else {
            std::iter::once(cfg.cmd.clone())
                .chain(cfg.args.iter().cloned())
                .collect()
        };
        spec.env = cfg.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        spec.host_config.auto_remove = !self.cfg.debug;

        if let (Some(secret), Some(listener)) = (secret, self.listener.get()) {
            spec.env.push(format!(
                "{}={}:{}",
                ENV_SERVICE_ADDR,
                self.cfg.host_alias,
                listener.port()
            ));
            spec.env.push(format!("{}={}", ENV_SECRET, secret));
            spec.host_config
                .extra_hosts
                .push(format!("{}:host-gateway", self.cfg.host_alias));
        }
        spec
    }
}

#[async_trait]
impl TaskRuntime for ContainerTaskRuntime {
    fn kind(&self) -> TaskKind {
        TaskKind::Container
    }

    async fn create_task(&self, cfg: TaskConfig) -> Result<Arc<dyn Task>, TaskError> {
        if cfg.image.is_empty() {
            return Err(TaskError::InvalidConfig("container task needs an image".to_string()));
        }
        if self.cfg.mode == TransportMode::Tcp && self.listener.get().is_none() {
            self.start().await?;
        }
        self.tasks.prune().await;

        let registration = match (self.cfg.mode, self.listener.get()) {
            (TransportMode::Tcp, Some(listener)) => Some(listener.register()),
            _ => None,
        };
        let spec = self.container_spec(&cfg, registration.as_ref().map(|(s, _)| *s));

        let container_id = match self.docker.create_container(&cfg.name, &spec).await {
            Ok(id) => id,
            Err(e) => {
                if let (Some((secret, _)), Some(listener)) = (&registration, self.listener.get()) {
                    listener.forget(*secret);
                }
                return Err(e.into());
            }
        };
        debug!(task_id = %container_id, task = %cfg.name, image = %cfg.image, "Container created");

        let task: Arc<dyn Task> = Arc::new(ContainerTask {
            state: Arc::new(TaskState::new(container_id.clone(), cfg.name.clone())),
            docker: self.docker.clone(),
            container_id,
            cfg: self.cfg.clone(),
            pending_conn: Mutex::new(registration),
            listener: self.listener.get().cloned(),
        });
        self.tasks.insert(task.clone()).await;
        Ok(task)
    }

    async fn start(&self) -> Result<(), TaskError> {
        if self.cfg.mode != TransportMode::Tcp {
            return Ok(());
        }
        self.listener
            .get_or_try_init(|| async {
                SecretListener::bind_in_range(
                    "0.0.0.0",
                    CONTAINER_LISTEN_PORT_BASE,
                    CONTAINER_LISTEN_PORT_SPAN,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_spec_carries_service_addr_and_secret() {
        let rt = ContainerTaskRuntime::new(ContainerRuntimeConfig::default());
        rt.start().await.unwrap();
        let port = rt.listener.get().unwrap().port();

        let cfg = TaskConfig {
            name: "task-pydummy-1".to_string(),
            image: "pydummy:latest".to_string(),
            env: vec![("MODE".to_string(), "test".to_string())],
            ..Default::default()
        };
        let spec = rt.container_spec(&cfg, Some(99));

        assert!(spec.env.contains(&"MODE=test".to_string()));
        assert!(spec
            .env
            .contains(&format!("SERVICE_ADDR=host.docker.internal:{}", port)));
        assert!(spec.env.contains(&"SECRET=99".to_string()));
        assert!(spec.host_config.auto_remove);
        assert!(spec.cmd.is_empty());
    }

    #[tokio::test]
    async fn test_stdio_spec_has_no_bootstrap_env() {
        let rt = ContainerTaskRuntime::new(ContainerRuntimeConfig {
            mode: TransportMode::Stdio,
            debug: true,
            ..Default::default()
        });
        let cfg = TaskConfig {
            name: "t".to_string(),
            image: "img".to_string(),
            cmd: "python".to_string(),
            args: vec!["start.py".to_string()],
            ..Default::default()
        };
        let spec = rt.container_spec(&cfg, None);
        assert!(spec.env.is_empty());
        assert!(!spec.host_config.auto_remove);
        assert_eq!(spec.cmd, vec!["python".to_string(), "start.py".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_image_is_rejected_before_engine_call() {
        let rt = ContainerTaskRuntime::new(ContainerRuntimeConfig {
            socket_path: "/nonexistent/docker.sock".to_string(),
            ..Default::default()
        });
        let err = rt.create_task(TaskConfig::default()).await.err().unwrap();
        assert!(matches!(err, TaskError::InvalidConfig(_)));
    }
}
