//! Host orchestrator
//!
//! Wires the communication manager, the host call dispatcher and the task
//! runtimes together, and runs catalog workloads on demand:
//!
//! ```text
//! execute(id) ─► catalog ─► runtime.create_task ─► comm.install ─► start
//!                                                                    │
//!   result ◄─ CustomResponse.data ◄─ send_request(custom) ◄──────────┘
//!                                         │
//!                                  Terminate, wait/stop, release
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
pub use crate::hostcalls::custom::{CustomRequest, CustomResponse, StreamQueues};
use crate::hostcalls::tools::TaskToolForwarder;
use crate::hostcalls::{
    register_all, ChatLoop, CommError, CommunicationManager, DispatchError, HostCallDispatcher,
    HostContext, HostIo, TransformRegistry, VectorStoreRegistry,
};
use crate::llm::{CompletionProvider, OpenAiClient};
use crate::task::container::ContainerRuntimeConfig;
use crate::task::{
    ContainerTaskRuntime, ProcessTaskRuntime, Task, TaskConfig, TaskError, TaskKind, TaskRuntime,
};
use crate::tools::ToolRegistry;
use crate::transport::{Method, Signal};

/// Method name the HTTP front door passes to workloads
pub const DEFAULT_CUSTOM_METHOD: &str = "handle";

/// How long a stopping workload gets to exit on its own after Terminate
const EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid task id: {0}")]
    UnknownWorkload(i64),
    #[error("no workload named {0}")]
    UnknownName(String),
    #[error("invalid task type {actual} for workload {id} ({expected})")]
    KindMismatch {
        id: i64,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("executable {0} not found in search path")]
    ExecutableNotFound(String),
    #[error("no runtime for {0} tasks")]
    NoRuntime(&'static str),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("malformed custom response: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A runnable workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: i64,
    pub name: String,
    pub kind: TaskKind,
    /// Container image (container workloads)
    #[serde(default)]
    pub image: String,
    /// Executable looked up in the search path (process workloads)
    #[serde(default)]
    pub exec_name: String,
}

impl Workload {
    pub fn container(id: i64, name: &str, image: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: TaskKind::Container,
            image: image.to_string(),
            exec_name: String::new(),
        }
    }

    pub fn process(id: i64, name: &str, exec_name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: TaskKind::Process,
            image: String::new(),
            exec_name: exec_name.to_string(),
        }
    }
}

/// Workloads by id
#[derive(Debug, Clone, Default)]
pub struct WorkloadCatalog {
    workloads: BTreeMap<i64, Workload>,
}

impl WorkloadCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later entries replace earlier ones with the same id
    pub fn insert(&mut self, workload: Workload) {
        self.workloads.insert(workload.id, workload);
    }

    pub fn get(&self, id: i64) -> Option<&Workload> {
        self.workloads.get(&id)
    }

    pub fn lookup_name(&self, name: &str) -> Option<&Workload> {
        self.workloads.values().find(|w| w.name == name)
    }

    /// Ordered by id
    pub fn list(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.values()
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }
}

impl FromIterator<Workload> for WorkloadCatalog {
    fn from_iter<I: IntoIterator<Item = Workload>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for w in iter {
            catalog.insert(w);
        }
        catalog
    }
}

/// The stock demo workloads
pub fn default_catalog() -> WorkloadCatalog {
    [
        Workload::container(3, "gen_image", "gen_image:latest"),
        Workload::container(4, "pychat", "pychat:latest"),
        Workload::container(5, "pytools", "pytools:latest"),
        Workload::container(6, "pyconversation", "pyconversation:latest"),
        Workload::container(7, "pydummy", "pydummy:latest"),
        Workload::container(8, "pytest-functionality", "pytest-functionality:latest"),
        Workload::process(9, "dummy", "dummy_task"),
        Workload::process(11, "pytest-functionality-proc", "pytest-functionality.py"),
    ]
    .into_iter()
    .collect()
}

/// First `dir/name` that exists
pub fn resolve_executable(search_paths: &[PathBuf], name: &str) -> Option<PathBuf> {
    search_paths.iter().map(|dir| dir.join(name)).find(|p| {
        debug!(path = %p.display(), "Searching for executable");
        p.is_file()
    })
}

/// Stop a task that never ran; failures are only logged
async fn discard(task: &dyn Task) {
    if let Err(e) = task.stop().await {
        warn!(task_id = %task.id(), error = %e, "Failed to clean up task");
    }
}

fn task_name(workload: &str) -> String {
    format!("task-{}-{}", workload, rand::thread_rng().gen_range(0..10000))
}

pub struct Host {
    cfg: HostConfig,
    catalog: WorkloadCatalog,
    comm: Arc<CommunicationManager>,
    ctx: Arc<HostContext>,
    runtimes: HashMap<TaskKind, Arc<dyn TaskRuntime>>,
    dispatcher: JoinHandle<()>,
}

impl Host {
    /// Production wiring: OpenAI-compatible client, process and container
    /// runtimes, the stock catalog plus configured workloads
    pub fn new(cfg: HostConfig) -> Result<Arc<Self>, HostError> {
        let provider: Arc<dyn CompletionProvider> =
            Arc::new(OpenAiClient::new(cfg.endpoint_table()));

        let process: Arc<dyn TaskRuntime> = Arc::new(ProcessTaskRuntime::new(cfg.process_transport));
        let container: Arc<dyn TaskRuntime> =
            Arc::new(ContainerTaskRuntime::new(ContainerRuntimeConfig {
                socket_path: cfg.docker_socket.to_string_lossy().into_owned(),
                mode: cfg.container_transport,
                host_alias: cfg.container_host_alias.clone(),
                debug: cfg.debug,
            }));

        let mut catalog = default_catalog();
        for w in &cfg.workloads {
            catalog.insert(w.clone());
        }

        let io = HostIo::new(provider.clone());
        Self::from_parts(cfg, catalog, provider, io, vec![process, container])
    }

    /// Assemble a host from explicit parts; spawns the dispatcher
    pub fn from_parts(
        cfg: HostConfig,
        catalog: WorkloadCatalog,
        provider: Arc<dyn CompletionProvider>,
        io: HostIo,
        runtimes: Vec<Arc<dyn TaskRuntime>>,
    ) -> Result<Arc<Self>, HostError> {
        let comm = CommunicationManager::new(cfg.response_timeout());

        let tools = Arc::new(
            ToolRegistry::with_builtins()
                .with_forwarder(Arc::new(TaskToolForwarder::new(comm.clone()))),
        );
        let chat = Arc::new(
            ChatLoop::new(provider, tools.clone()).with_max_iterations(cfg.chat_max_iterations),
        );
        let ctx = Arc::new(HostContext {
            tools,
            transforms: TransformRegistry::with_chat(chat),
            vectors: VectorStoreRegistry::new(),
            io,
        });

        let mut dispatcher = HostCallDispatcher::new();
        register_all(&mut dispatcher, ctx.clone())?;
        let dispatcher = Arc::new(dispatcher);
        let run_comm = comm.clone();
        let dispatcher = tokio::spawn(async move {
            if let Err(e) = dispatcher.run(run_comm).await {
                error!(error = %e, "Host call dispatcher failed");
            }
        });

        let runtimes = runtimes.into_iter().map(|rt| (rt.kind(), rt)).collect();

        info!(workloads = catalog.len(), "Host initialized");
        Ok(Arc::new(Self {
            cfg,
            catalog,
            comm,
            ctx,
            runtimes,
            dispatcher,
        }))
    }

    pub fn catalog(&self) -> &WorkloadCatalog {
        &self.catalog
    }

    pub fn comm(&self) -> &Arc<CommunicationManager> {
        &self.comm
    }

    pub fn context(&self) -> &Arc<HostContext> {
        &self.ctx
    }

    fn task_config(&self, workload: &Workload) -> Result<TaskConfig, HostError> {
        let name = task_name(&workload.name);
        match workload.kind {
            TaskKind::Container => Ok(TaskConfig {
                name,
                image: workload.image.clone(),
                cmd: "/start".to_string(),
                ..Default::default()
            }),
            TaskKind::Process => {
                let cmd = resolve_executable(&self.cfg.search_paths, &workload.exec_name)
                    .ok_or_else(|| HostError::ExecutableNotFound(workload.exec_name.clone()))?;
                info!(exec = %cmd.display(), "Using executable");
                Ok(TaskConfig {
                    name,
                    cmd: cmd.to_string_lossy().into_owned(),
                    ..Default::default()
                })
            }
        }
    }

    /// Run workload `id` once
    ///
    /// Sends `method` with `data` as a `custom` request and returns the
    /// workload's answer. The task is told to terminate afterwards; with
    /// `wait` the call returns only once it has exited.
    pub async fn execute(
        &self,
        id: i64,
        kind: TaskKind,
        wait: bool,
        method: &str,
        data: &str,
    ) -> Result<String, HostError> {
        let workload = self.catalog.get(id).ok_or(HostError::UnknownWorkload(id))?;
        if workload.kind != kind {
            return Err(HostError::KindMismatch {
                id,
                expected: workload.kind.as_str(),
                actual: kind.as_str(),
            });
        }
        let runtime = self
            .runtimes
            .get(&kind)
            .ok_or(HostError::NoRuntime(kind.as_str()))?;

        let cfg = self.task_config(workload)?;
        let task = runtime.create_task(cfg).await?;
        if let Err(e) = self.comm.install(task.clone()) {
            discard(task.as_ref()).await;
            return Err(e.into());
        }
        info!(task_id = %task.id(), task = %task.name(), workload = %workload.name, "Running workload");

        let result = self.run_task(task.clone(), wait, method, data).await;
        self.release(task.as_ref());
        result
    }

    /// Same as [`execute`](Self::execute), looking the workload up by name
    pub async fn execute_by_name(
        &self,
        name: &str,
        wait: bool,
        method: &str,
        data: &str,
    ) -> Result<String, HostError> {
        let workload = self
            .catalog
            .lookup_name(name)
            .ok_or_else(|| HostError::UnknownName(name.to_string()))?;
        self.execute(workload.id, workload.kind, wait, method, data)
            .await
    }

    async fn run_task(
        &self,
        task: Arc<dyn Task>,
        wait: bool,
        method: &str,
        data: &str,
    ) -> Result<String, HostError> {
        if let Err(e) = task.start().await {
            // Init-state stop releases whatever create_task allocated
            discard(task.as_ref()).await;
            return Err(e.into());
        }

        let payload = serde_json::to_vec(&CustomRequest::oneshot(method, data))?;
        let outcome = self
            .comm
            .send_request(task.as_ref(), Method::Custom, payload)
            .await;

        if let Err(e) = self
            .comm
            .send_signal(task.as_ref(), Signal::Terminate, Vec::new())
            .await
        {
            debug!(task_id = %task.id(), error = %e, "Terminate signal not delivered");
        }

        if wait {
            if tokio::time::timeout(EXIT_GRACE, task.wait()).await.is_err() {
                warn!(task_id = %task.id(), "Task ignored terminate, stopping it");
            }
            task.stop().await?;
        } else {
            tokio::spawn(async move {
                let _ = tokio::time::timeout(EXIT_GRACE, task.wait()).await;
                if let Err(e) = task.stop().await {
                    warn!(task_id = %task.id(), error = %e, "Failed to stop task");
                }
            });
        }

        let response = outcome?;
        if response.payload.is_empty() {
            return Ok(String::new());
        }
        let resp: CustomResponse = serde_json::from_slice(&response.payload)?;
        Ok(resp.data)
    }

    fn release(&self, task: &dyn Task) {
        let task_id = task.id();
        self.comm.uninstall(&task_id);
        self.ctx.release_task(&task_id);
    }

    /// Stop every task of every runtime
    pub async fn shutdown(&self) {
        for (kind, rt) in &self.runtimes {
            if let Err(e) = rt.stop().await {
                warn!(kind = kind.as_str(), error = %e, "Failed to stop runtime");
            }
        }
        self.dispatcher.abort();
        info!("Host shut down");
    }
}
