use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// One forwarded service: localhost:local_port -> remote_host:remote_port
/// through the SSH gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ServiceSpec {
    pub fn inbound(&self) -> String {
        format!("localhost:{}", self.local_port)
    }

    pub fn outbound(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Formats as the `-L` argument: local_port:remote_host:remote_port
impl std::fmt::Display for ServiceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.local_port, self.remote_host, self.remote_port)
    }
}

/// The SSH gateway every tunnel goes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: String,
}

impl Default for RemoteEndpoint {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: String::new(),
            key_path: String::new(),
        }
    }
}

impl RemoteEndpoint {
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Key path with a leading `~/` expanded to the home directory.
    pub fn key_file(&self) -> PathBuf {
        if let Some(rest) = self.key_path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.key_path)
    }
}

impl std::fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// A program plus its arguments, ready to hand to a `ProcessRunner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Service the command belongs to; used to name its log file.
    pub label: String,
}

impl std::fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// `ssh -N -L` invocation that keeps one local forward open until it dies.
pub fn forward_command(endpoint: &RemoteEndpoint, spec: &ServiceSpec) -> ProcessCommand {
    ProcessCommand {
        program: "ssh".to_string(),
        args: vec![
            "-i".to_string(),
            endpoint.key_file().to_string_lossy().to_string(),
            "-N".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-L".to_string(),
            spec.to_string(),
            "-p".to_string(),
            endpoint.port.to_string(),
            endpoint.target(),
        ],
        label: spec.name.clone(),
    }
}

/// Non-interactive `ssh ... exit` used to decide whether the gateway is reachable.
pub fn probe_command(endpoint: &RemoteEndpoint, connect_timeout: Duration) -> ProcessCommand {
    ProcessCommand {
        program: "ssh".to_string(),
        args: vec![
            "-i".to_string(),
            endpoint.key_file().to_string_lossy().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            endpoint.port.to_string(),
            endpoint.target(),
            "exit".to_string(),
        ],
        label: "probe".to_string(),
    }
}

/// Current gateway identity, replaced wholesale on reconfiguration.
///
/// Readers get an `Arc` to an immutable value, so a spawn that is already
/// building its command keeps the endpoint it started with.
#[derive(Debug, Default)]
pub struct EndpointCell {
    current: RwLock<Arc<RemoteEndpoint>>,
}

impl EndpointCell {
    pub fn new(endpoint: RemoteEndpoint) -> Self {
        Self {
            current: RwLock::new(Arc::new(endpoint)),
        }
    }

    pub fn load(&self) -> Arc<RemoteEndpoint> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn store(&self, endpoint: RemoteEndpoint) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(endpoint);
    }
}
