//! Host configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables. Every field has a default so an empty file is valid.
//!
//! ```toml
//! listen_addr = "0.0.0.0:8080"
//! search_paths = ["/opt/workloads/bin"]
//! process_transport = "stdio"
//!
//! [[llm_endpoints]]
//! name = "local"
//! kind = "chat_with_tools"
//! model = "qwen"
//! base = "http://localhost:8000/v1"
//! url = "/chat/completions"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::host::Workload;
use crate::hostcalls::chat::DEFAULT_MAX_ITERATIONS;
use crate::llm::{ApiEndpoint, EndpointTable};
use crate::task::docker::DEFAULT_DOCKER_SOCKET;
use crate::task::TransportMode;

pub const ENV_LISTEN: &str = "TASKVISOR_LISTEN";
pub const ENV_SEARCH_PATH: &str = "TASKVISOR_SEARCH_PATH";
pub const ENV_RESPONSE_TIMEOUT: &str = "TASKVISOR_RESPONSE_TIMEOUT_SECS";
pub const ENV_DOCKER_SOCKET: &str = "TASKVISOR_DOCKER_SOCKET";
pub const ENV_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// HTTP front door
    pub listen_addr: String,
    /// Directories searched for process workload executables
    pub search_paths: Vec<PathBuf>,
    /// How long the host waits for a guest to answer a request
    pub response_timeout_secs: u64,
    /// Completion calls allowed per chat transform
    pub chat_max_iterations: usize,
    pub process_transport: TransportMode,
    pub container_transport: TransportMode,
    pub docker_socket: PathBuf,
    /// Hostname containers use to reach the host
    pub container_host_alias: String,
    /// Keep containers around after they exit
    pub debug: bool,
    pub otlp_endpoint: Option<String>,
    /// Checked before the built-in endpoint table
    pub llm_endpoints: Vec<ApiEndpoint>,
    /// Added to the stock catalog, replacing entries with the same id
    pub workloads: Vec<Workload>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            search_paths: vec![PathBuf::from(".")],
            response_timeout_secs: 300,
            chat_max_iterations: DEFAULT_MAX_ITERATIONS,
            process_transport: TransportMode::Tcp,
            container_transport: TransportMode::Tcp,
            docker_socket: PathBuf::from(DEFAULT_DOCKER_SOCKET),
            container_host_alias: "host.docker.internal".to_string(),
            debug: false,
            otlp_endpoint: None,
            llm_endpoints: Vec::new(),
            workloads: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn from_toml_str(s: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Defaults with environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// File if given, defaults otherwise, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|var| std::env::var(var).ok())?;
        Ok(cfg)
    }

    /// Apply overrides from a variable lookup; empty values are ignored
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.is_empty());

        if let Some(addr) = get(ENV_LISTEN) {
            self.listen_addr = addr;
        }
        if let Some(paths) = get(ENV_SEARCH_PATH) {
            self.search_paths = paths
                .split(':')
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(secs) = get(ENV_RESPONSE_TIMEOUT) {
            self.response_timeout_secs = secs.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_RESPONSE_TIMEOUT,
                value: secs.clone(),
            })?;
        }
        if let Some(sock) = get(ENV_DOCKER_SOCKET) {
            self.docker_socket = PathBuf::from(sock);
        }
        if let Some(endpoint) = get(ENV_OTLP_ENDPOINT) {
            self.otlp_endpoint = Some(endpoint);
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    /// Configured endpoints ahead of the built-in table, with the
    /// `OPENAI_API_BASE` override applied
    pub fn endpoint_table(&self) -> EndpointTable {
        let mut table = EndpointTable::default();
        table.prepend(self.llm_endpoints.clone());
        table.apply_env_overrides();
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_defaults() {
        let cfg = HostConfig::from_toml_str("", Path::new("empty.toml")).unwrap();
        assert_eq!(cfg.response_timeout_secs, 300);
        assert_eq!(cfg.chat_max_iterations, 10);
        assert_eq!(cfg.process_transport, TransportMode::Tcp);
        assert_eq!(cfg.container_host_alias, "host.docker.internal");
    }

    #[test]
    fn test_file_values_and_endpoints() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
listen_addr = "0.0.0.0:9000"
process_transport = "stdio"
debug = true

[[workloads]]
id = 20
name = "local-echo"
kind = "process"
exec_name = "echo"

[[llm_endpoints]]
name = "local"
kind = "chat_with_tools"
model = "qwen"
base = "http://localhost:8000/v1"
url = "/chat/completions"
"#
        )
        .unwrap();

        let cfg = HostConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9000");
        assert_eq!(cfg.process_transport, TransportMode::Stdio);
        assert!(cfg.debug);
        assert_eq!(cfg.llm_endpoints.len(), 1);
        assert_eq!(cfg.workloads[0].name, "local-echo");

        let table = cfg.endpoint_table();
        assert_eq!(table.all()[0].name, "local");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_LISTEN, "0.0.0.0:1234"),
            (ENV_SEARCH_PATH, "/a:/b::"),
            (ENV_RESPONSE_TIMEOUT, "7"),
            (ENV_DOCKER_SOCKET, ""),
        ]
        .into_iter()
        .collect();

        let mut cfg = HostConfig::default();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:1234");
        assert_eq!(cfg.search_paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(cfg.response_timeout(), Duration::from_secs(7));
        // empty values leave the default alone
        assert_eq!(cfg.docker_socket, PathBuf::from(DEFAULT_DOCKER_SOCKET));
    }

    #[test]
    fn test_bad_timeout_is_rejected() {
        let mut cfg = HostConfig::default();
        let err = cfg
            .apply_env(|k| (k == ENV_RESPONSE_TIMEOUT).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var, .. } if var == ENV_RESPONSE_TIMEOUT));
    }

    #[test]
    fn test_missing_file() {
        let err = HostConfig::from_toml_file(Path::new("/nonexistent/taskvisor.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
