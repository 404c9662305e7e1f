//! Byte-stream pumps shared by every backend
//!
//! The writer pump drains the task's inbound queue into framed writes; the
//! reader pump turns frames from the workload into outbound queue entries.
//! When the reader stops (close sentinel, EOF or error) it aborts the writer,
//! so further host sends to the task fail instead of queueing forever.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{TaskId, TransportEnds};
use crate::transport::{read_frame, write_close, write_frame};

/// Spawn the reader and writer pumps for one task
///
/// Returns the reader handle; it completes when the transport closes.
pub fn spawn_frame_pumps<R, W>(
    task_id: TaskId,
    mut reader: R,
    mut writer: W,
    ends: TransportEnds,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let TransportEnds {
        mut inbound,
        outbound,
    } = ends;

    let writer_id = task_id.clone();
    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &msg).await {
                warn!(task_id = %writer_id, error = %e, "Failed to write frame to task");
                return;
            }
        }
        // host side dropped its sender: tell the guest we are done
        let _ = write_close(&mut writer).await;
    });

    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if outbound.send(frame).await.is_err() {
                        debug!(task_id = %task_id, "Outbound queue closed, dropping reader");
                        break;
                    }
                }
                Ok(None) => {
                    debug!(task_id = %task_id, "Task closed its transport");
                    break;
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Failed to read frame from task");
                    break;
                }
            }
        }
        writer_handle.abort();
    })
}

/// Forward each line of a workload output stream to the log
pub fn spawn_log_lines<R>(task_name: String, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(task = %task_name, stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!(task = %task_name, stream, error = %e, "Failed to read task output");
                    break;
                }
            }
        }
    })
}
