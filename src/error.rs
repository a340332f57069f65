use thiserror::Error;

/// Failures a supervisor absorbs into its status and retries after backoff.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Exited { program: String, status: ExitStatus },
    #[error("failed to wait on pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        if let Some(code) = status.code() {
            ExitStatus::Code(code)
        } else if let Some(sig) = status.signal() {
            ExitStatus::Signal(sig)
        } else {
            ExitStatus::Unknown
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(c) => write!(f, "status {}", c),
            ExitStatus::Signal(s) => write!(f, "signal {}", s),
            ExitStatus::Unknown => write!(f, "unknown status"),
        }
    }
}

/// A configuration that must not reach the supervisors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("service name must not be empty")]
    EmptyName,
    #[error("duplicate service name '{0}'")]
    DuplicateName(String),
    #[error("service '{name}': {field} must be between 1 and 65535")]
    InvalidPort { name: String, field: &'static str },
    #[error("service '{0}': remote host must not be empty")]
    EmptyRemoteHost(String),
    #[error("SSH endpoint is incomplete: {0} is not set (run `devtun endpoint`)")]
    IncompleteEndpoint(&'static str),
}
