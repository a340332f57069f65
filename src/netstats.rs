use std::time::Duration;
use sysinfo::Networks;

/// Cumulative byte counters across all non-loopback interfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

impl NetCounters {
    /// Sum the interface totals currently known to `networks`.
    pub fn sample(networks: &mut Networks) -> Self {
        networks.refresh();
        Self::sum(
            networks
                .iter()
                .map(|(name, data)| (name.as_str(), data.total_received(), data.total_transmitted())),
        )
    }

    /// Fold per-interface `(name, received, transmitted)` totals, skipping
    /// loopback.
    fn sum<'a>(interfaces: impl IntoIterator<Item = (&'a str, u64, u64)>) -> Self {
        let mut total = Self::default();
        for (name, recv, sent) in interfaces {
            if is_loopback(name) {
                continue;
            }
            total.bytes_recv += recv;
            total.bytes_sent += sent;
        }
        total
    }
}

fn is_loopback(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0") || name.starts_with("Loopback")
}

/// Running throughput figures for the dashboard.
#[derive(Debug, Default)]
pub struct Throughput {
    prev: Option<NetCounters>,
    /// Bytes moved during the most recent interval.
    pub last: NetCounters,
    /// Bytes moved since the first sample.
    pub total: NetCounters,
}

impl Throughput {
    pub fn update(&mut self, now: NetCounters) {
        if let Some(prev) = self.prev {
            // Counters reset when an interface goes away; treat as zero.
            self.last = NetCounters {
                bytes_sent: now.bytes_sent.saturating_sub(prev.bytes_sent),
                bytes_recv: now.bytes_recv.saturating_sub(prev.bytes_recv),
            };
            self.total.bytes_sent += self.last.bytes_sent;
            self.total.bytes_recv += self.last.bytes_recv;
        }
        self.prev = Some(now);
    }

    /// The most recent interval's bytes scaled to a one-second rate.
    pub fn per_second(&self, interval: Duration) -> NetCounters {
        let secs = interval.as_secs_f64();
        if secs <= 0.0 {
            return self.last;
        }
        NetCounters {
            bytes_sent: (self.last.bytes_sent as f64 / secs) as u64,
            bytes_recv: (self.last.bytes_recv as f64 / secs) as u64,
        }
    }
}
