//! Guest-side connection
//!
//! What a workload links against to talk to the host: dial `SERVICE_ADDR`,
//! prove itself with `SECRET`, then exchange framed envelopes. Falls back to
//! frames on stdin/stdout when no service address is given.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::task::handshake::{ENV_SECRET, ENV_SERVICE_ADDR};
use crate::transport::{
    decode, encode, read_frame, write_close, write_frame, Envelope, FrameError, Method, Signal,
    TransportRequest, TransportResponse, TransportSignal,
};

const EVENT_QUEUE_CAPACITY: usize = 128;

#[derive(Debug, Error)]
pub enum GuestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Frame(#[from] FrameError),
    #[error("host error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("connection to host closed")]
    Closed,
    #[error("invalid bootstrap environment: {0}")]
    InvalidEnv(String),
}

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<TransportResponse>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct GuestConnection {
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Pending,
    requests: tokio::sync::Mutex<mpsc::Receiver<TransportRequest>>,
    signals: tokio::sync::Mutex<mpsc::Receiver<TransportSignal>>,
    next_id: AtomicI64,
    reader: JoinHandle<()>,
}

impl GuestConnection {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (req_tx, req_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (sig_tx, sig_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let reader = tokio::spawn(read_loop(reader, pending.clone(), req_tx, sig_tx));

        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            requests: tokio::sync::Mutex::new(req_rx),
            signals: tokio::sync::Mutex::new(sig_rx),
            next_id: AtomicI64::new(1),
            reader,
        }
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::new(r, w)
    }

    /// Frames over this process's stdin/stdout
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Dial the host and present the secret
    pub async fn connect_tcp(addr: &str, secret: i64) -> Result<Self, GuestError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&secret.to_le_bytes()).await?;
        stream.flush().await?;
        let (r, w) = stream.into_split();
        Ok(Self::new(r, w))
    }

    /// Use `SERVICE_ADDR`/`SECRET` when present, stdio otherwise
    pub async fn connect_from_env() -> Result<Self, GuestError> {
        match std::env::var(ENV_SERVICE_ADDR) {
            Ok(addr) if !addr.is_empty() => {
                let secret = std::env::var(ENV_SECRET)
                    .map_err(|_| GuestError::InvalidEnv(format!("{} is not set", ENV_SECRET)))?
                    .parse::<i64>()
                    .map_err(|e| GuestError::InvalidEnv(format!("{}: {}", ENV_SECRET, e)))?;
                Self::connect_tcp(&addr, secret).await
            }
            _ => Ok(Self::stdio()),
        }
    }

    async fn write(&self, envelope: &Envelope) -> Result<(), GuestError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &encode(envelope)).await?;
        Ok(())
    }

    /// Issue a host call and wait for its response
    pub async fn request(
        &self,
        method: Method,
        payload: Vec<u8>,
    ) -> Result<TransportResponse, GuestError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        let envelope = Envelope::Request(TransportRequest::new(id, method, payload));
        if let Err(e) = self.write(&envelope).await {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(e);
        }

        let response = rx.await.map_err(|_| GuestError::Closed)?;
        if response.is_ok() {
            Ok(response)
        } else {
            Err(GuestError::Remote {
                code: response.code,
                message: response.message,
            })
        }
    }

    /// Next request from the host; `None` once the host hangs up
    pub async fn next_request(&self) -> Option<TransportRequest> {
        self.requests.lock().await.recv().await
    }

    pub async fn next_signal(&self) -> Option<TransportSignal> {
        self.signals.lock().await.recv().await
    }

    pub async fn respond(&self, id: i64, payload: Vec<u8>) -> Result<(), GuestError> {
        self.write(&Envelope::Response(TransportResponse::ok(id, payload)))
            .await
    }

    pub async fn respond_error(
        &self,
        id: i64,
        code: i32,
        message: impl Into<String>,
    ) -> Result<(), GuestError> {
        self.write(&Envelope::Response(TransportResponse::error(id, code, message)))
            .await
    }

    pub async fn signal(&self, signal: Signal) -> Result<(), GuestError> {
        self.write(&Envelope::Signal(TransportSignal::new(signal, Vec::new())))
            .await
    }

    /// Send the close sentinel
    pub async fn close(&self) -> Result<(), GuestError> {
        let mut writer = self.writer.lock().await;
        write_close(&mut *writer).await?;
        Ok(())
    }
}

impl Drop for GuestConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(
    mut reader: R,
    pending: Pending,
    requests: mpsc::Sender<TransportRequest>,
    signals: mpsc::Sender<TransportSignal>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read frame from host");
                break;
            }
        };
        match decode(&frame) {
            Ok(Envelope::Request(req)) => {
                if requests.send(req).await.is_err() {
                    break;
                }
            }
            Ok(Envelope::Response(resp)) => {
                let waiter = pending.lock().ok().and_then(|mut p| p.remove(&resp.id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => debug!(id = resp.id, "No callback for id"),
                }
            }
            Ok(Envelope::Signal(sig)) => {
                let _ = signals.send(sig).await;
            }
            Err(e) => {
                warn!(error = %e, "Undecodable envelope from host");
                break;
            }
        }
    }
    // fail everyone still waiting
    if let Ok(mut p) = pending.lock() {
        p.clear();
    }
}
