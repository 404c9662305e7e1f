//! In-process task backed by a duplex pipe
//!
//! No OS resources: the "workload" is whatever code holds the guest end of
//! the pipe. The task counts as exited once the guest hangs up. Used to
//! drive the host stack in tests and in-process demos.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use uuid::Uuid;

use super::pumps::spawn_frame_pumps;
use super::{Task, TaskError, TaskState, TaskStatus};

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct MemoryTask {
    state: Arc<TaskState>,
    guest: Mutex<Option<DuplexStream>>,
}

impl MemoryTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(TaskState::new(Uuid::now_v7().to_string(), name)),
            guest: Mutex::new(None),
        }
    }

    /// Guest end of the pipe, available once after `start`
    pub fn take_guest_stream(&self) -> Option<DuplexStream> {
        self.guest.lock().ok().and_then(|mut g| g.take())
    }
}

#[async_trait]
impl Task for MemoryTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn start(&self) -> Result<(), TaskError> {
        let ends = self
            .state
            .take_transport()
            .ok_or_else(|| TaskError::AlreadyStarted(self.state.id().clone()))?;
        let (host_side, guest_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (reader, writer) = tokio::io::split(host_side);
        let reader_done = spawn_frame_pumps(self.state.id().clone(), reader, writer, ends);
        if let Ok(mut g) = self.guest.lock() {
            *g = Some(guest_side);
        }
        self.state.mark_running()?;

        // the guest hanging up is this backend's notion of exiting
        let state = self.state.clone();
        tokio::spawn(async move {
            let _ = reader_done.await;
            state.mark_stopped(Some(0));
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), TaskError> {
        if let Ok(mut g) = self.guest.lock() {
            g.take();
        }
        if self.state.status() != TaskStatus::Stopped {
            self.state.mark_stopped(Some(0));
        }
        Ok(())
    }
}
