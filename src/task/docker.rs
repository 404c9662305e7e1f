//! Docker Engine API client
//!
//! Talks to the engine's HTTP API over its Unix domain socket. Only the
//! handful of endpoints the container backend needs are covered; image pulls
//! are left to the operator.

use hyper::body::{Bytes, Incoming};
use hyper::StatusCode;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyperlocal::UnixConnector;
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use thiserror::Error;

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Engine API version prefix
const API_VERSION: &str = "/v1.43";

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("request to {endpoint} failed: {status} - {message}")]
    Api {
        endpoint: String,
        status: StatusCode,
        message: String,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("HTTP client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("attach did not upgrade the connection (status {0})")]
    NoUpgrade(StatusCode),
}

/// Subset of the container create body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSpec {
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub host_config: HostConfigSpec,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfigSpec {
    pub auto_remove: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            cmd: Vec::new(),
            env: Vec::new(),
            open_stdin: true,
            stdin_once: false,
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            tty: false,
            host_config: HostConfigSpec::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitResponse {
    status_code: i64,
}

/// Client for the Docker Engine control API
#[derive(Clone)]
pub struct DockerClient {
    client: HyperClient,
    socket_path: String,
}

impl DockerClient {
    /// Create a new engine client
    ///
    /// # Arguments
    /// * `socket_path` - Path to the engine's Unix socket
    pub fn new(socket_path: impl Into<String>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(UnixConnector);

        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    fn uri(&self, endpoint: &str) -> hyper::Uri {
        hyperlocal::Uri::new(&self.socket_path, &format!("{}{}", API_VERSION, endpoint)).into()
    }

    /// Send a request and return the raw response once the status is known
    async fn send(
        &self,
        method: hyper::Method,
        endpoint: &str,
        body: Option<String>,
    ) -> Result<hyper::Response<Incoming>, DockerError> {
        let mut builder = hyper::Request::builder().method(method).uri(self.uri(endpoint));
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let req = builder.body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let res = self.client.request(req).await?;
        let status = res.status();
        if !status.is_success() && status != StatusCode::NOT_MODIFIED {
            let body_bytes = res.into_body().collect().await?.to_bytes();
            return Err(DockerError::Api {
                endpoint: endpoint.to_string(),
                status,
                message: String::from_utf8_lossy(&body_bytes).trim().to_string(),
            });
        }
        Ok(res)
    }

    async fn send_json<T: Serialize>(
        &self,
        method: hyper::Method,
        endpoint: &str,
        body: &T,
    ) -> Result<Bytes, DockerError> {
        let json = serde_json::to_string(body)?;
        let res = self.send(method, endpoint, Some(json)).await?;
        Ok(res.into_body().collect().await?.to_bytes())
    }

    /// Create a container and return its id
    pub async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, DockerError> {
        let endpoint = format!("/containers/create?name={}", name);
        let bytes = self.send_json(hyper::Method::POST, &endpoint, spec).await?;
        let created: CreateResponse = serde_json::from_slice(&bytes)?;
        for warning in &created.warnings {
            tracing::warn!(container = %created.id, "{}", warning);
        }
        Ok(created.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.send(hyper::Method::POST, &format!("/containers/{}/start", id), None)
            .await?;
        Ok(())
    }

    /// Ask the engine to stop the container, killing it after `grace_secs`
    pub async fn stop_container(&self, id: &str, grace_secs: u32) -> Result<(), DockerError> {
        self.send(
            hyper::Method::POST,
            &format!("/containers/{}/stop?t={}", id, grace_secs),
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        self.send(
            hyper::Method::DELETE,
            &format!("/containers/{}?force=true", id),
            None,
        )
        .await?;
        Ok(())
    }

    /// Block until the container exits and return its status code
    pub async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let res = self
            .send(hyper::Method::POST, &format!("/containers/{}/wait", id), None)
            .await?;
        let bytes = res.into_body().collect().await?.to_bytes();
        let waited: WaitResponse = serde_json::from_slice(&bytes)?;
        Ok(waited.status_code)
    }

    /// Follow the multiplexed stdout/stderr stream
    pub async fn follow_logs(&self, id: &str) -> Result<Incoming, DockerError> {
        let res = self
            .send(
                hyper::Method::GET,
                &format!("/containers/{}/logs?follow=1&stdout=1&stderr=1", id),
                None,
            )
            .await?;
        Ok(res.into_body())
    }

    /// Attach to the container's stdin; the returned stream is write-only
    /// from our side.
    pub async fn attach_stdin(
        &self,
        id: &str,
    ) -> Result<TokioIo<hyper::upgrade::Upgraded>, DockerError> {
        let req = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(self.uri(&format!("/containers/{}/attach?stream=1&stdin=1", id)))
            .header("Connection", "Upgrade")
            .header("Upgrade", "tcp")
            .body(Full::new(Bytes::new()))?;

        let res = self.client.request(req).await?;
        if res.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(DockerError::NoUpgrade(res.status()));
        }
        let upgraded = hyper::upgrade::on(res).await?;
        Ok(TokioIo::new(upgraded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_serializes_engine_field_names() {
        let mut spec = ContainerSpec::new("pydummy:latest");
        spec.env.push("SECRET=1".to_string());
        spec.host_config.auto_remove = true;
        spec.host_config
            .extra_hosts
            .push("host.docker.internal:host-gateway".to_string());

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["Image"], "pydummy:latest");
        assert_eq!(json["OpenStdin"], true);
        assert_eq!(json["Tty"], false);
        assert_eq!(json["Env"][0], "SECRET=1");
        assert_eq!(json["HostConfig"]["AutoRemove"], true);
        assert_eq!(
            json["HostConfig"]["ExtraHosts"][0],
            "host.docker.internal:host-gateway"
        );
        assert!(json.get("Cmd").is_none());
    }

    #[test]
    fn test_wait_response_parses() {
        let waited: WaitResponse = serde_json::from_str(r#"{"StatusCode": 137}"#).unwrap();
        assert_eq!(waited.status_code, 137);
    }

    #[tokio::test]
    #[ignore = "requires a running Docker engine"]
    async fn test_create_missing_image_is_api_error() {
        let client = DockerClient::new(DEFAULT_DOCKER_SOCKET);
        let err = client
            .create_container("taskvisor-missing", &ContainerSpec::new("taskvisor/does-not-exist"))
            .await
            .unwrap_err();
        assert!(matches!(err, DockerError::Api { .. }));
    }
}
