//! taskvisor - host supervisor for guest workloads
//!
//! Runs workloads as child processes or Docker containers, talks to them
//! over a length-framed envelope protocol, and serves the host calls they
//! make (LLM chat with tool calling, vector stores, console and speech I/O).
//!
//! # Modules
//!
//! - `transport` - framing, envelopes, container log demultiplexing
//! - `task` - the `Task` abstraction and its process, container and in-memory backends
//! - `hostcalls` - request/response correlation, dispatch, host call handlers
//! - `tools` - builtin, per-task internal and forwarded tools
//! - `llm` - OpenAI-compatible completion and speech client
//! - `guest` - the workload side of the connection
//! - `host` - workload catalog and the orchestrator tying it all together
//! - `server` - HTTP front door
//! - `config`, `metrics`, `tracing` - ambient plumbing
//!
//! # Quick Start
//!
//! ```ignore
//! use taskvisor::{config::HostConfig, host::Host};
//!
//! let host = Host::new(HostConfig::from_env()?)?;
//! let answer = host.execute_by_name("dummy", true, "handle", "hello").await?;
//! ```

pub mod config;
pub mod guest;
pub mod host;
pub mod hostcalls;
pub mod llm;
pub mod metrics;
pub mod server;
pub mod task;
pub mod tools;
pub mod tracing;
pub mod transport;

pub use host::{Host, HostError};
pub use task::{Task, TaskKind, TaskRuntime};
