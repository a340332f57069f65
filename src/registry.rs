use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::monitor::{ConnectivityMonitor, Probe};
use crate::snapshot::{StatusSnapshot, TunnelEntry};
use crate::supervisor::{SupervisorContext, TunnelStatus, TunnelSupervisor};
use crate::tunnel::{RemoteEndpoint, ServiceSpec};

/// Owns every running supervisor, keyed by service name.
pub struct SupervisorRegistry {
    ctx: Arc<SupervisorContext>,
    supervisors: RwLock<BTreeMap<String, Arc<TunnelSupervisor>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SupervisorRegistry {
    pub fn new(ctx: Arc<SupervisorContext>) -> Self {
        Self {
            ctx,
            supervisors: RwLock::new(BTreeMap::new()),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start the connectivity monitor on its own thread. Its thread is
    /// joined by `shutdown` along with the supervisors.
    pub fn start_monitor(&self, probe: Arc<dyn Probe>, probe_timeout: Duration, poll_interval: Duration) {
        let monitor = ConnectivityMonitor::new(
            self.ctx.endpoint.clone(),
            self.ctx.connectivity.clone(),
            probe,
            probe_timeout,
            poll_interval,
            self.ctx.shutdown.clone(),
        );
        let handle = monitor.start();
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Start a supervisor for every spec that does not have one yet.
    /// Returns the names that were started; already-running names are skipped.
    pub fn start_all(&self, specs: &[ServiceSpec]) -> Vec<String> {
        let mut started = Vec::new();
        let mut supervisors = self.supervisors.write().unwrap_or_else(|e| e.into_inner());
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());

        for spec in specs {
            if supervisors.contains_key(&spec.name) {
                debug!("{} already supervised, skipping", spec.name);
                continue;
            }
            let sup = Arc::new(TunnelSupervisor::new(spec.clone(), self.ctx.clone()));
            supervisors.insert(spec.name.clone(), sup.clone());
            threads.push(thread::spawn(move || sup.run()));
            started.push(spec.name.clone());
        }

        if !started.is_empty() {
            info!("started {} supervisor(s): {}", started.len(), started.join(", "));
        }
        started
    }

    pub fn get(&self, name: &str) -> Option<TunnelStatus> {
        self.supervisors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|s| s.status())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let connectivity = self.ctx.connectivity.get();
        let tunnels = self
            .supervisors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, sup)| {
                (
                    name.clone(),
                    TunnelEntry {
                        spec: sup.spec().clone(),
                        status: sup.status(),
                    },
                )
            })
            .collect();
        StatusSnapshot::new(connectivity, tunnels)
    }

    /// Swap in a new gateway. Running tunnels keep their connection; the
    /// next spawn of each supervisor uses the new endpoint.
    pub fn reconfigure(&self, endpoint: RemoteEndpoint) {
        info!("gateway reconfigured to {}", endpoint);
        self.ctx.endpoint.store(endpoint);
    }

    /// Stop the monitor and every supervisor, terminating live tunnels, and
    /// wait for all of their threads.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.ctx.shutdown.raise();
        for sup in self
            .supervisors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            sup.terminate();
        }
        let threads: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for t in threads {
            let _ = t.join();
        }
    }
}
