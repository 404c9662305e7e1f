//! Secret-authenticated TCP listener
//!
//! Each runtime owns one listener. A task registers a random secret before
//! its workload launches and hands the secret to the workload through the
//! `SECRET` environment variable. The workload dials `SERVICE_ADDR` and
//! writes the secret as 8 little-endian bytes; only then is the socket bound
//! to the task whose secret matches. Anything else is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a fresh connection has to present its secret
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable carrying the listener address to the workload
pub const ENV_SERVICE_ADDR: &str = "SERVICE_ADDR";
/// Environment variable carrying the decimal secret to the workload
pub const ENV_SECRET: &str = "SECRET";

type Waiters = Arc<Mutex<HashMap<i64, oneshot::Sender<TcpStream>>>>;

pub struct SecretListener {
    local_addr: SocketAddr,
    waiters: Waiters,
    accept_loop: JoinHandle<()>,
}

impl SecretListener {
    /// Bind to `addr` and start accepting connections
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));

        info!(addr = %local_addr, "Task listener bound");

        let accept_waiters = waiters.clone();
        let accept_loop = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let waiters = accept_waiters.clone();
                        tokio::spawn(async move {
                            authenticate(stream, peer, waiters).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Task listener accept failed");
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            waiters,
            accept_loop,
        })
    }

    /// Try random ports in `[base, base + span)` on `host`
    pub async fn bind_in_range(host: &str, base: u16, span: u16) -> std::io::Result<Self> {
        let mut last_err = None;
        for _ in 0..8 {
            let port = base + rand::thread_rng().gen_range(0..span.max(1));
            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            match Self::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    debug!(port, error = %e, "Port unavailable, retrying");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrInUse)))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Register a fresh secret; the receiver resolves with the matching socket
    pub fn register(&self) -> (i64, oneshot::Receiver<TcpStream>) {
        let (tx, rx) = oneshot::channel();
        let mut waiters = match self.waiters.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        let secret = loop {
            let candidate = rand::thread_rng().gen_range(1..i64::MAX);
            if !waiters.contains_key(&candidate) {
                break candidate;
            }
        };
        waiters.insert(secret, tx);
        (secret, rx)
    }

    /// Drop a registration that will never connect
    pub fn forget(&self, secret: i64) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.remove(&secret);
        }
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().map(|w| w.len()).unwrap_or(0)
    }
}

impl Drop for SecretListener {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn authenticate(mut stream: TcpStream, peer: SocketAddr, waiters: Waiters) {
    let mut buf = [0u8; 8];
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "Handshake read failed, dropping connection");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "Handshake timed out, dropping connection");
            return;
        }
    }

    let secret = i64::from_le_bytes(buf);
    let waiter = waiters.lock().ok().and_then(|mut w| w.remove(&secret));
    match waiter {
        Some(tx) => {
            debug!(peer = %peer, "Handshake accepted");
            if tx.send(stream).is_err() {
                warn!(peer = %peer, "Task gone before its connection arrived");
            }
        }
        None => {
            warn!(peer = %peer, "Unknown secret, dropping connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn local_listener() -> SecretListener {
        SecretListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_matching_secret_is_bound() {
        let listener = local_listener().await;
        let (secret, rx) = listener.register();

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client.write_all(&secret.to_le_bytes()).await.unwrap();

        let server_side = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("handshake should complete")
            .unwrap();
        assert_eq!(server_side.peer_addr().unwrap(), client.local_addr().unwrap());
        assert_eq!(listener.pending(), 0);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_never_bound() {
        let listener = local_listener().await;
        let (secret, mut rx) = listener.register();

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client.write_all(&secret.wrapping_add(1).to_le_bytes()).await.unwrap();

        // the server drops the socket, so our read sees EOF
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        assert!(rx.try_recv().is_err());
        assert_eq!(listener.pending(), 1);
    }

    #[tokio::test]
    async fn test_short_secret_is_dropped() {
        let listener = local_listener().await;
        let (_secret, mut rx) = listener.register();

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = [0u8; 1];
        let _ = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_secrets_are_unique_and_forgettable() {
        let listener = local_listener().await;
        let (a, _ra) = listener.register();
        let (b, _rb) = listener.register();
        assert_ne!(a, b);
        assert!(a > 0 && b > 0);
        listener.forget(a);
        assert_eq!(listener.pending(), 1);
    }
}
