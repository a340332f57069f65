use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-way stop signal shared by the monitor and every supervisor.
/// All core sleeps go through `sleep`, so raising it wakes them at once.
#[derive(Debug, Default)]
pub struct Shutdown {
    raised: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        *self.raised.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.wake.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `dur` unless shutdown is raised first.
    /// Returns true if shutdown was raised.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let mut raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        while !*raised {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            raised = self
                .wake
                .wait_timeout(raised, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }
}
