//! Gateway reachability, probed on one thread and shared with every supervisor.

use log::{debug, info, warn};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::process;
use crate::shutdown::Shutdown;
use crate::tunnel::{self, EndpointCell, RemoteEndpoint};

/// Whether the gateway answered the most recent probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectivityState {
    pub reachable: bool,
    /// None until the first probe completes.
    pub last_checked: Option<SystemTime>,
}

/// Shared cell holding the current `ConnectivityState`. Both fields are
/// replaced together under one lock.
#[derive(Debug, Default)]
pub struct Connectivity {
    state: RwLock<ConnectivityState>,
}

impl Connectivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectivityState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_reachable(&self) -> bool {
        self.get().reachable
    }

    /// Record a probe result. Only the monitor writes here outside tests.
    /// Returns true if reachability changed.
    pub fn publish(&self, reachable: bool) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let changed = state.reachable != reachable || state.last_checked.is_none();
        *state = ConnectivityState {
            reachable,
            last_checked: Some(SystemTime::now()),
        };
        changed
    }
}

/// Answers "can we reach the gateway right now".
pub trait Probe: Send + Sync {
    fn probe(&self, endpoint: &RemoteEndpoint, timeout: Duration) -> bool;
}

/// Batch-mode `ssh user@host exit`, killed if it outlives the timeout.
pub struct SshProbe;

impl Probe for SshProbe {
    fn probe(&self, endpoint: &RemoteEndpoint, timeout: Duration) -> bool {
        let cmd = tunnel::probe_command(endpoint, timeout);
        match process::run_with_timeout(&cmd, timeout) {
            Ok(Some(status)) => {
                if !status.success() {
                    debug!("probe of {} exited with {}", endpoint, status);
                }
                status.success()
            }
            Ok(None) => {
                debug!("probe of {} timed out after {:?}", endpoint, timeout);
                false
            }
            Err(e) => {
                debug!("probe of {} failed: {:#}", endpoint, e);
                false
            }
        }
    }
}

pub struct ConnectivityMonitor {
    endpoint: Arc<EndpointCell>,
    connectivity: Arc<Connectivity>,
    probe: Arc<dyn Probe>,
    probe_timeout: Duration,
    poll_interval: Duration,
    shutdown: Arc<Shutdown>,
}

impl ConnectivityMonitor {
    pub fn new(
        endpoint: Arc<EndpointCell>,
        connectivity: Arc<Connectivity>,
        probe: Arc<dyn Probe>,
        probe_timeout: Duration,
        poll_interval: Duration,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            endpoint,
            connectivity,
            probe,
            probe_timeout,
            poll_interval,
            shutdown,
        }
    }

    /// Probe, publish, sleep; until shutdown is raised.
    pub fn start(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn run(&self) {
        info!(
            "connectivity monitor started (timeout {:?}, interval {:?})",
            self.probe_timeout, self.poll_interval
        );
        while !self.shutdown.is_raised() {
            let endpoint = self.endpoint.load();
            let reachable = self.probe.probe(&endpoint, self.probe_timeout);
            if self.connectivity.publish(reachable) {
                if reachable {
                    info!("gateway {} reachable", endpoint);
                } else {
                    warn!("gateway {} unreachable", endpoint);
                }
            }
            if self.shutdown.sleep(self.poll_interval) {
                break;
            }
        }
        debug!("connectivity monitor stopped");
    }
}
