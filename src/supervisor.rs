//! Per-service tunnel supervision.
//!
//! Each `TunnelSupervisor` runs on its own thread and keeps one `ssh -N -L`
//! process alive for its service:
//!
//! ```text
//! Idle ──reachable──> Connecting ──spawned──> Running ──exit──> BackoffWaiting
//!  │                      └──spawn error──────────────────────> BackoffWaiting
//!  └──unreachable──────────────────────────────────────────────> BackoffWaiting
//! BackoffWaiting ──delay──> Idle
//! any ──shutdown──> Stopped
//! ```

use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::error::TunnelError;
use crate::monitor::Connectivity;
use crate::process::{ProcessHandle, ProcessRunner};
use crate::shutdown::Shutdown;
use crate::tunnel::{self, EndpointCell, ServiceSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Connecting,
    Running,
    Stopped,
    BackoffWaiting,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TunnelState::Idle => "idle",
            TunnelState::Connecting => "connecting",
            TunnelState::Running => "running",
            TunnelState::Stopped => "stopped",
            TunnelState::BackoffWaiting => "backoff",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub state: TunnelState,
    /// When `state` was entered.
    pub since: SystemTime,
    pub last_error: Option<String>,
    /// Pid of the forwarding process; set exactly when `state` is Running.
    pub pid: Option<u32>,
    /// Spawn attempts after the first one.
    pub restarts: u32,
}

impl TunnelStatus {
    fn idle() -> Self {
        Self {
            state: TunnelState::Idle,
            since: SystemTime::now(),
            last_error: None,
            pid: None,
            restarts: 0,
        }
    }
}

/// Everything supervisors share: where to connect, whether the gateway is
/// up, how to start processes, and when to stop.
pub struct SupervisorContext {
    pub endpoint: Arc<EndpointCell>,
    pub connectivity: Arc<Connectivity>,
    pub runner: Arc<dyn ProcessRunner>,
    pub shutdown: Arc<Shutdown>,
    pub backoff: Duration,
}

/// Status and process handle live under one lock so a reader can never
/// see Running without the handle that backs it.
struct Slot {
    status: TunnelStatus,
    handle: Option<Arc<dyn ProcessHandle>>,
    attempts: u32,
}

pub struct TunnelSupervisor {
    spec: ServiceSpec,
    ctx: Arc<SupervisorContext>,
    slot: Mutex<Slot>,
}

impl TunnelSupervisor {
    pub fn new(spec: ServiceSpec, ctx: Arc<SupervisorContext>) -> Self {
        Self {
            spec,
            ctx,
            slot: Mutex::new(Slot {
                status: TunnelStatus::idle(),
                handle: None,
                attempts: 0,
            }),
        }
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn status(&self) -> TunnelStatus {
        self.lock().status.clone()
    }

    /// Signal the current forwarding process, if any. The supervisor loop
    /// reaps it and decides what happens next.
    pub fn terminate(&self) {
        if let Some(handle) = &self.lock().handle {
            handle.terminate();
        }
    }

    /// Drive the state machine until shutdown. Blocks the calling thread.
    pub fn run(&self) {
        info!("supervising {} ({})", self.spec.name, self.spec);
        let mut state = TunnelState::Idle;
        while state != TunnelState::Stopped {
            if self.ctx.shutdown.is_raised() {
                break;
            }
            state = match state {
                TunnelState::Idle => self.evaluate(),
                TunnelState::Connecting => self.connect(),
                TunnelState::Running => self.watch(),
                TunnelState::BackoffWaiting => self.back_off(),
                TunnelState::Stopped => TunnelState::Stopped,
            };
        }
        self.stop();
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, slot: &mut Slot, state: TunnelState) {
        if slot.status.state != state {
            debug!("{}: {} -> {}", self.spec.name, slot.status.state, state);
        }
        slot.status.state = state;
        slot.status.since = SystemTime::now();
        slot.status.pid = match state {
            TunnelState::Running => slot.handle.as_ref().map(|h| h.id()),
            _ => None,
        };
    }

    fn evaluate(&self) -> TunnelState {
        let next = if self.ctx.connectivity.is_reachable() {
            TunnelState::Connecting
        } else {
            TunnelState::BackoffWaiting
        };
        let mut slot = self.lock();
        if next == TunnelState::Connecting {
            slot.attempts += 1;
            slot.status.restarts = slot.attempts - 1;
        }
        self.transition(&mut slot, next);
        next
    }

    fn connect(&self) -> TunnelState {
        let endpoint = self.ctx.endpoint.load();
        let cmd = tunnel::forward_command(&endpoint, &self.spec);
        debug!("{}: spawning {}", self.spec.name, cmd);

        match self.ctx.runner.spawn(&cmd) {
            Ok(handle) => {
                let pid = handle.id();
                let mut slot = self.lock();
                slot.handle = Some(handle);
                self.transition(&mut slot, TunnelState::Running);
                info!("{}: tunnel up via {} (pid {})", self.spec.name, endpoint, pid);
                TunnelState::Running
            }
            Err(e) => self.fail(e),
        }
    }

    fn watch(&self) -> TunnelState {
        let Some(handle) = self.lock().handle.clone() else {
            return TunnelState::BackoffWaiting;
        };
        // Shutdown may have been raised before the handle was published,
        // in which case nobody else will signal it.
        if self.ctx.shutdown.is_raised() {
            handle.terminate();
        }

        let result = handle.wait();

        if self.ctx.shutdown.is_raised() {
            let mut slot = self.lock();
            slot.handle = None;
            self.transition(&mut slot, TunnelState::Stopped);
            return TunnelState::Stopped;
        }

        let err = match result {
            Ok(status) => TunnelError::Exited {
                program: "ssh".to_string(),
                status,
            },
            Err(e) => e,
        };
        self.fail(err)
    }

    fn fail(&self, err: TunnelError) -> TunnelState {
        warn!("{}: {}; retrying in {:?}", self.spec.name, err, self.ctx.backoff);
        let mut slot = self.lock();
        slot.handle = None;
        slot.status.last_error = Some(err.to_string());
        self.transition(&mut slot, TunnelState::BackoffWaiting);
        TunnelState::BackoffWaiting
    }

    fn back_off(&self) -> TunnelState {
        if self.ctx.shutdown.sleep(self.ctx.backoff) {
            return TunnelState::Stopped;
        }
        let mut slot = self.lock();
        self.transition(&mut slot, TunnelState::Idle);
        TunnelState::Idle
    }

    fn stop(&self) {
        let handle = {
            let mut slot = self.lock();
            let handle = slot.handle.take();
            self.transition(&mut slot, TunnelState::Stopped);
            handle
        };
        if let Some(handle) = handle {
            handle.terminate();
            let _ = handle.wait();
        }
        info!("{}: supervisor stopped", self.spec.name);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ExitStatus;
    use crate::process::testing::FakeRunner;
    use crate::tunnel::{ProcessCommand, RemoteEndpoint};
    use std::sync::Condvar;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::{self, JoinHandle};
    use std::time::Instant;

    pub(crate) const BACKOFF: Duration = Duration::from_millis(30);

    pub(crate) fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    pub(crate) fn spec(name: &str, local_port: u16) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            local_port,
            remote_host: "10.0.0.5".to_string(),
            remote_port: 5432,
        }
    }

    pub(crate) fn endpoint(host: &str) -> RemoteEndpoint {
        RemoteEndpoint {
            host: host.to_string(),
            port: 22,
            user: "deploy".to_string(),
            key_path: "/keys/id".to_string(),
        }
    }

    struct Harness {
        runner: Arc<FakeRunner>,
        ctx: Arc<SupervisorContext>,
    }

    impl Harness {
        fn new(reachable: bool) -> Self {
            let runner = FakeRunner::new();
            let connectivity = Arc::new(Connectivity::new());
            connectivity.publish(reachable);
            let ctx = Arc::new(SupervisorContext {
                endpoint: Arc::new(EndpointCell::new(endpoint("gw.example.com"))),
                connectivity,
                runner: runner.clone(),
                shutdown: Arc::new(Shutdown::new()),
                backoff: BACKOFF,
            });
            Self { runner, ctx }
        }

        fn start(&self, name: &str) -> (Arc<TunnelSupervisor>, JoinHandle<()>) {
            let sup = Arc::new(TunnelSupervisor::new(spec(name, 15432), self.ctx.clone()));
            let thread = {
                let sup = sup.clone();
                thread::spawn(move || sup.run())
            };
            (sup, thread)
        }

        fn stop(&self, sup: &TunnelSupervisor, thread: JoinHandle<()>) {
            self.ctx.shutdown.raise();
            sup.terminate();
            thread.join().unwrap();
        }
    }

    #[test]
    fn new_supervisor_is_idle() {
        let h = Harness::new(true);
        let sup = TunnelSupervisor::new(spec("db", 15432), h.ctx.clone());
        let status = sup.status();
        assert_eq!(status.state, TunnelState::Idle);
        assert_eq!(status.pid, None);
        assert_eq!(status.last_error, None);
    }

    #[test]
    fn reaches_running_when_reachable() {
        let h = Harness::new(true);
        let (sup, thread) = h.start("db");

        assert!(wait_for(|| sup.status().state == TunnelState::Running));
        let status = sup.status();
        let handle = h.runner.latest("db").unwrap();
        assert_eq!(status.pid, Some(handle.id()));
        assert_eq!(h.runner.attempts("db"), 1);

        h.stop(&sup, thread);
    }

    #[test]
    fn never_spawns_while_unreachable() {
        let h = Harness::new(false);
        let (sup, thread) = h.start("db");

        assert!(wait_for(|| sup.status().state == TunnelState::BackoffWaiting));
        thread::sleep(BACKOFF * 5);
        assert_eq!(h.runner.attempts("db"), 0);
        assert_ne!(sup.status().state, TunnelState::Running);

        h.stop(&sup, thread);
    }

    #[test]
    fn spawn_failure_is_recorded_and_retried() {
        let h = Harness::new(true);
        h.runner.fail("db");
        let (sup, thread) = h.start("db");

        assert!(wait_for(|| h.runner.attempts("db") >= 3));
        let status = sup.status();
        assert_ne!(status.state, TunnelState::Running);
        assert!(status.last_error.unwrap().contains("failed to spawn"));

        h.runner.succeed("db");
        assert!(wait_for(|| sup.status().state == TunnelState::Running));
        assert!(sup.status().restarts >= 3);

        h.stop(&sup, thread);
    }

    #[test]
    fn exit_leads_to_backoff_then_restart() {
        let h = Harness::new(true);
        let (sup, thread) = h.start("db");
        assert!(wait_for(|| sup.status().state == TunnelState::Running));

        let exited_at = Instant::now();
        h.runner.latest("db").unwrap().exit(255);

        assert!(wait_for(|| h.runner.attempts("db") == 2));
        assert!(exited_at.elapsed() >= BACKOFF);
        assert!(wait_for(|| sup.status().state == TunnelState::Running));
        assert_eq!(
            sup.status().last_error.as_deref(),
            Some("ssh exited with status 255")
        );
        assert_eq!(h.runner.live("db"), 1);

        h.stop(&sup, thread);
    }

    #[test]
    fn clean_exit_is_also_restarted() {
        let h = Harness::new(true);
        let (sup, thread) = h.start("db");
        assert!(wait_for(|| sup.status().state == TunnelState::Running));

        h.runner.latest("db").unwrap().exit(0);

        assert!(wait_for(|| h.runner.attempts("db") == 2));
        h.stop(&sup, thread);
    }

    #[test]
    fn shutdown_terminates_running_process() {
        let h = Harness::new(true);
        let (sup, thread) = h.start("db");
        assert!(wait_for(|| sup.status().state == TunnelState::Running));

        h.stop(&sup, thread);

        let status = sup.status();
        assert_eq!(status.state, TunnelState::Stopped);
        assert_eq!(status.pid, None);
        assert_eq!(h.runner.live("db"), 0);
        assert_eq!(h.runner.attempts("db"), 1);
    }

    #[test]
    fn shutdown_interrupts_backoff() {
        let runner = FakeRunner::new();
        let ctx = Arc::new(SupervisorContext {
            endpoint: Arc::new(EndpointCell::new(endpoint("gw.example.com"))),
            connectivity: Arc::new(Connectivity::new()),
            runner: runner.clone(),
            shutdown: Arc::new(Shutdown::new()),
            backoff: Duration::from_secs(60),
        });
        let sup = Arc::new(TunnelSupervisor::new(spec("db", 15432), ctx.clone()));
        let thread = {
            let sup = sup.clone();
            thread::spawn(move || sup.run())
        };
        assert!(wait_for(|| sup.status().state == TunnelState::BackoffWaiting));

        let start = Instant::now();
        ctx.shutdown.raise();
        thread.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(sup.status().state, TunnelState::Stopped);
    }

    #[test]
    fn spawn_uses_endpoint_at_spawn_time() {
        let h = Harness::new(true);
        let (sup, thread) = h.start("db");
        assert!(wait_for(|| sup.status().state == TunnelState::Running));
        let first = h.runner.last_command("db").unwrap();
        assert_eq!(first.args.last().unwrap(), "deploy@gw.example.com");

        h.ctx.endpoint.store(endpoint("new-gw.example.com"));
        h.runner.latest("db").unwrap().exit(255);

        assert!(wait_for(|| h.runner.attempts("db") == 2));
        let second = h.runner.last_command("db").unwrap();
        assert_eq!(second.args.last().unwrap(), "deploy@new-gw.example.com");

        h.stop(&sup, thread);
    }

    /// Exits only once released, however long after SIGTERM that is.
    struct LingeringHandle {
        terminated: AtomicBool,
        released: Mutex<bool>,
        cv: Condvar,
    }

    impl LingeringHandle {
        fn release(&self) {
            *self.released.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    impl ProcessHandle for LingeringHandle {
        fn id(&self) -> u32 {
            4242
        }

        fn wait(&self) -> Result<ExitStatus, TunnelError> {
            let mut released = self.released.lock().unwrap();
            while !*released {
                released = self.cv.wait(released).unwrap();
            }
            Ok(ExitStatus::Signal(libc::SIGTERM))
        }

        fn is_alive(&self) -> bool {
            !*self.released.lock().unwrap()
        }

        fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    /// Raises shutdown from inside `spawn`, so the supervisor sees it right
    /// after entering Running.
    struct ShutdownOnSpawn {
        shutdown: Arc<Shutdown>,
        handle: Arc<LingeringHandle>,
    }

    impl ProcessRunner for ShutdownOnSpawn {
        fn spawn(&self, _cmd: &ProcessCommand) -> Result<Arc<dyn ProcessHandle>, TunnelError> {
            self.shutdown.raise();
            Ok(self.handle.clone())
        }
    }

    #[test]
    fn stopping_never_reports_running_without_handle() {
        let shutdown = Arc::new(Shutdown::new());
        let handle = Arc::new(LingeringHandle {
            terminated: AtomicBool::new(false),
            released: Mutex::new(false),
            cv: Condvar::new(),
        });
        let connectivity = Arc::new(Connectivity::new());
        connectivity.publish(true);
        let ctx = Arc::new(SupervisorContext {
            endpoint: Arc::new(EndpointCell::new(endpoint("gw.example.com"))),
            connectivity,
            runner: Arc::new(ShutdownOnSpawn {
                shutdown: shutdown.clone(),
                handle: handle.clone(),
            }),
            shutdown,
            backoff: BACKOFF,
        });
        let sup = Arc::new(TunnelSupervisor::new(spec("db", 15432), ctx));
        let thread = {
            let sup = sup.clone();
            thread::spawn(move || sup.run())
        };

        assert!(wait_for(|| handle.terminated.load(Ordering::SeqCst)));
        // The process is still exiting; the status must already say so.
        {
            let slot = sup.lock();
            assert_eq!(slot.status.state, TunnelState::Stopped);
            assert_eq!(slot.status.pid, None);
            assert!(slot.handle.is_none());
        }

        handle.release();
        thread.join().unwrap();
        assert_eq!(sup.status().state, TunnelState::Stopped);
    }

    #[test]
    fn running_always_carries_pid() {
        let h = Harness::new(true);
        let (sup, thread) = h.start("db");

        let deadline = Instant::now() + Duration::from_millis(500);
        let mut saw_running = false;
        while Instant::now() < deadline {
            let status = sup.status();
            assert_eq!(status.state == TunnelState::Running, status.pid.is_some());
            if status.state == TunnelState::Running {
                saw_running = true;
                if let Some(handle) = h.runner.latest("db") {
                    handle.exit(1);
                }
            }
            assert!(h.runner.live("db") <= 1);
        }
        assert!(saw_running);

        h.stop(&sup, thread);
    }
}
