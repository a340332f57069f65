use std::collections::BTreeMap;

use crate::monitor::ConnectivityState;
use crate::supervisor::{TunnelState, TunnelStatus};
use crate::tunnel::ServiceSpec;

#[derive(Debug, Clone)]
pub struct TunnelEntry {
    pub spec: ServiceSpec,
    pub status: TunnelStatus,
}

/// Point-in-time view of the gateway and every tunnel, in name order.
/// Each entry was read atomically; entries were not all read at one instant.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub connectivity: ConnectivityState,
    tunnels: BTreeMap<String, TunnelEntry>,
}

impl StatusSnapshot {
    pub fn new(connectivity: ConnectivityState, tunnels: BTreeMap<String, TunnelEntry>) -> Self {
        Self {
            connectivity,
            tunnels,
        }
    }

    pub fn get(&self, name: &str) -> Option<&TunnelEntry> {
        self.tunnels.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TunnelEntry> {
        self.tunnels.values()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.iter()
            .filter(|t| t.status.state == TunnelState::Running)
            .count()
    }
}
