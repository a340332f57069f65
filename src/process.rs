use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{ExitStatus, TunnelError};
use crate::tunnel::ProcessCommand;

/// A running child the supervisor owns.
pub trait ProcessHandle: Send + Sync {
    fn id(&self) -> u32;
    /// Block until the process exits.
    fn wait(&self) -> Result<ExitStatus, TunnelError>;
    fn is_alive(&self) -> bool;
    /// Ask the process to exit; `wait` still has to reap it.
    fn terminate(&self);
}

/// Launches external commands.
pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, cmd: &ProcessCommand) -> Result<Arc<dyn ProcessHandle>, TunnelError>;
}

/// Directory where forwarding-process logs are stored.
pub fn log_dir() -> Result<PathBuf> {
    let dir = crate::config::state_dir()?.join("logs");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Path to the log file for a specific service.
pub fn log_file(name: &str) -> Result<PathBuf> {
    Ok(log_dir()?.join(format!("{}.log", name)))
}

/// Remove a service's log files (current and rotated).
pub fn cleanup_logs(name: &str) -> Result<()> {
    let log = log_file(name)?;
    let _ = fs::remove_file(&log);
    let mut log_old = log.clone();
    log_old.set_extension("log.old");
    let _ = fs::remove_file(&log_old);
    Ok(())
}

/// Check if a process with the given PID is running.
fn is_pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// If a log file exceeds max_bytes, rename it to .log.old (replacing any
/// previous .old file) so the new run starts with a fresh log.
pub fn rotate_log(path: &Path, max_bytes: u64) {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() > max_bytes {
            let mut old = path.to_path_buf();
            old.set_extension("log.old");
            let _ = fs::rename(path, old);
        }
    }
}

/// Format the time since `start` as a human-readable string like "2h 14m" or "3d 1h".
pub fn format_elapsed(start: SystemTime) -> String {
    let elapsed = SystemTime::now()
        .duration_since(start)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let days = elapsed / 86400;
    let hours = (elapsed % 86400) / 3600;
    let minutes = (elapsed % 3600) / 60;
    let seconds = elapsed % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Spawns real processes. Stderr of each child is appended to
/// `<log_dir>/<label>.log` when a log directory is configured.
pub struct SystemRunner {
    log_dir: Option<PathBuf>,
    max_log_bytes: u64,
}

impl SystemRunner {
    pub fn new(log_dir: Option<PathBuf>, max_log_bytes: u64) -> Self {
        Self {
            log_dir,
            max_log_bytes,
        }
    }

    fn stderr_for(&self, label: &str) -> Stdio {
        let Some(dir) = &self.log_dir else {
            return Stdio::null();
        };
        let path = dir.join(format!("{}.log", label));
        rotate_log(&path, self.max_log_bytes);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                log::warn!("cannot open {}: {}", path.display(), e);
                Stdio::null()
            }
        }
    }
}

impl ProcessRunner for SystemRunner {
    fn spawn(&self, cmd: &ProcessCommand) -> Result<Arc<dyn ProcessHandle>, TunnelError> {
        let child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(self.stderr_for(&cmd.label))
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

        Ok(Arc::new(SystemHandle {
            pid: child.id(),
            child: Mutex::new(child),
            exited: AtomicBool::new(false),
        }))
    }
}

/// Handle to a child started by `SystemRunner`.
///
/// `wait` holds the child lock for the whole lifetime of the process, so
/// `terminate` signals by pid instead of going through `Child::kill`.
pub struct SystemHandle {
    pid: u32,
    child: Mutex<Child>,
    exited: AtomicBool,
}

impl ProcessHandle for SystemHandle {
    fn id(&self) -> u32 {
        self.pid
    }

    fn wait(&self) -> Result<ExitStatus, TunnelError> {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let status = child.wait().map_err(|source| TunnelError::Wait {
            pid: self.pid,
            source,
        });
        self.exited.store(true, Ordering::SeqCst);
        Ok(status?.into())
    }

    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst) && is_pid_alive(self.pid)
    }

    fn terminate(&self) {
        if self.is_alive() {
            unsafe { libc::kill(self.pid as i32, libc::SIGTERM) };
        }
    }
}

/// Run a command to completion with a hard deadline. Returns `None` if the
/// deadline passed; the child is killed and reaped in that case.
pub fn run_with_timeout(cmd: &ProcessCommand, timeout: Duration) -> Result<Option<ExitStatus>> {
    let mut child = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {}", cmd.program))?;

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.into()));
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
