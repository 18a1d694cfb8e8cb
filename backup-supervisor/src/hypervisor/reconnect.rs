//! Event re-subscription after a hypervisor reconnect.
//!
//! Event callbacks registered on a connection die with it. Components
//! register a resubscribe closure once; the connection owner replays them,
//! in registration order, every time it reconnects.

use super::HypervisorResult;
use parking_lot::Mutex;
use tracing::{info, warn};

type Resubscribe = Box<dyn Fn() -> HypervisorResult<()> + Send + Sync>;

#[derive(Default)]
pub struct ReconnectReplay {
    callbacks: Mutex<Vec<(String, Resubscribe)>>,
}

impl ReconnectReplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, resubscribe: F)
    where
        F: Fn() -> HypervisorResult<()> + Send + Sync + 'static,
    {
        self.callbacks.lock().push((name.into(), Box::new(resubscribe)));
    }

    /// Run every callback; a failing one is logged and the rest still run.
    /// Returns the number of failures.
    pub fn replay(&self) -> usize {
        let callbacks = self.callbacks.lock();
        let mut failures = 0;
        for (name, resubscribe) in callbacks.iter() {
            if let Err(e) = resubscribe() {
                warn!("Failed to re-register {} after reconnect: {}", name, e);
                failures += 1;
            }
        }
        info!(
            "Replayed {} event subscription(s) after reconnect ({} failed)",
            callbacks.len(),
            failures
        );
        failures
    }
}
