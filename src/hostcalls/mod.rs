//! Host calls
//!
//! Everything a guest can ask the host to do, and the plumbing that gets
//! requests from a task's transport to a handler and back.
//!
//! - `comm` - per-task readers, request/response correlation
//! - `dispatcher` - method to handler table, runs handlers concurrently
//! - `chat` - chat completion loop with tool calling
//! - `transform` - picks a transform (chat, chat with tools) for a request
//! - `custom` - payloads of workload-defined `custom` calls
//! - `tools` - internal and normal tool registration, builtin tool invocation
//! - `vectorstore` - per-task in-memory vector collections
//! - `io` - console input, speech output, recording

pub mod chat;
pub mod comm;
pub mod custom;
pub mod dispatcher;
pub mod io;
pub mod tools;
pub mod transform;
pub mod vectorstore;

use std::sync::Arc;

use serde::Serialize;

pub use chat::{ChatError, ChatLoop};
pub use comm::{CommError, CommunicationManager, InvocationInfo, UnsolicitedResponse};
pub use dispatcher::{DispatchError, HostCallDispatcher, HostCallError, HostCallResult};
pub use io::HostIo;
pub use transform::TransformRegistry;
pub use vectorstore::VectorStoreRegistry;

use crate::task::TaskId;
use crate::tools::ToolRegistry;
use crate::transport::Method;
use vectorstore::{
    VectorStoreCreateRequest, VectorStoreError, VectorStoreIdRequest, VectorStoreInsertRequest,
    VectorStoreSearchRequest,
};

impl From<VectorStoreError> for HostCallError {
    fn from(e: VectorStoreError) -> Self {
        HostCallError::new(e.to_string())
    }
}

/// Shared state behind the host call handlers
pub struct HostContext {
    pub tools: Arc<ToolRegistry>,
    pub transforms: TransformRegistry,
    pub vectors: VectorStoreRegistry,
    pub io: HostIo,
}

impl HostContext {
    /// Release what a task registered while it ran
    pub fn release_task(&self, task_id: &TaskId) {
        self.tools.clear_task(task_id);
        self.vectors.clear_task(task_id);
    }
}

fn json<T: Serialize>(value: &T) -> HostCallResult {
    Ok(serde_json::to_vec(value)?)
}

/// Register every built-in host call; `custom` is left to the workload
pub fn register_all(
    dispatcher: &mut HostCallDispatcher,
    ctx: Arc<HostContext>,
) -> Result<(), DispatchError> {
    let c = ctx.clone();
    dispatcher.register(Method::Transform, move |inv: InvocationInfo, payload: Vec<u8>| {
        let c = c.clone();
        async move { c.transforms.transform(inv, &payload).await }
    })?;

    dispatcher.register(Method::TransformConfig, |inv: InvocationInfo, payload: Vec<u8>| async move {
        transform::transform_config(&inv, &payload)
    })?;

    let c = ctx.clone();
    dispatcher.register(Method::InternalToolCreate, move |inv: InvocationInfo, payload: Vec<u8>| {
        let c = c.clone();
        async move { tools::create_internal(&c.tools, &inv, &payload) }
    })?;

    let c = ctx.clone();
    dispatcher.register(Method::NormalToolCreate, move |inv: InvocationInfo, payload: Vec<u8>| {
        let c = c.clone();
        async move { tools::create_normal(&c.tools, &inv, &payload) }
    })?;

    let c = ctx.clone();
    dispatcher.register(Method::ToolInvoke, move |_inv: InvocationInfo, payload: Vec<u8>| {
        let c = c.clone();
        async move { tools::invoke_builtin(&c.tools, &payload).await }
    })?;

    let c = ctx.clone();
    dispatcher.register(Method::VecStoreCreate, move |inv: InvocationInfo, payload: Vec<u8>| {
        let c = c.clone();
        async move {
            let req: VectorStoreCreateRequest = serde_json::from_slice(&payload)?;
            let vid = c.vectors.create(&inv.task.id(), &req.name, req.dimensions)?;
            json(&VectorStoreIdRequest { vid })
        }
    })?;

    let c = ctx.clone();
    dispatcher.register(Method::VecStoreDelete, move |inv: InvocationInfo, payload: Vec<u8>| {
        let c = c.clone();
        async move {
            let req: VectorStoreIdRequest = serde_json::from_slice(&payload)?;
            c.vectors.delete(&inv.task.id(), req.vid)?;
            json(&req)
        }
    })?;

    let c = ctx.clone();
    dispatcher.register(Method::VecStoreInsert, move |inv: InvocationInfo, payload: Vec<u8>| {
        let c = c.clone();
        async move {
            let req: VectorStoreInsertRequest = serde_json::from_slice(&payload)?;
            let id = c.vectors.insert(&inv.task.id(), req.vid, req.vector, req.data)?;
            json(&serde_json::json!({ "vid": req.vid, "id": id }))
        }
    })?;

    let c = ctx.clone();
    dispatcher.register(Method::VecStoreQuery, move |inv: InvocationInfo, payload: Vec<u8>| {
        let c = c.clone();
        async move {
            let req: VectorStoreSearchRequest = serde_json::from_slice(&payload)?;
            let results = c.vectors.search(&inv.task.id(), req.vid, &req.vector, req.limit)?;
            json(&serde_json::json!({ "results": results }))
        }
    })?;

    let c = ctx.clone();
    dispatcher.register(Method::Input, move |_inv: InvocationInfo, payload: Vec<u8>| {
        let c = c.clone();
        async move { c.io.input(&payload).await }
    })?;

    let c = ctx.clone();
    dispatcher.register(Method::Speak, move |_inv: InvocationInfo, payload: Vec<u8>| {
        let c = c.clone();
        async move { c.io.speak(&payload).await }
    })?;

    dispatcher.register(Method::Record, move |_inv: InvocationInfo, payload: Vec<u8>| {
        let c = ctx.clone();
        async move { c.io.record(&payload).await }
    })?;

    Ok(())
}
