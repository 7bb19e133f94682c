//! Cancellation state shared between the operator and the worker
//!
//! Two flags, checked at different granularities:
//!
//! - **stop**: cooperative. The worker notices it after the current sample
//!   and between channels.
//! - **emergency**: immediate. Every instrument call made by the worker checks
//!   it while holding that instrument's lock, and no sample is delivered to a
//!   sink once it is set.
//!
//! Setting the emergency flag never waits on a sink. Sample delivery holds
//! an internal gate and re-checks the flag under it, so after
//! [`RunControl::trigger_emergency`] followed by
//! [`RunControl::await_delivery`] no further sample can reach the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct RunControl {
    stop_requested: AtomicBool,
    emergency: AtomicBool,
    gate: Mutex<()>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to stop at its next checkpoint
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Mark the run as emergency-stopped
    ///
    /// Returns immediately, even while a sample is being delivered. Implies a
    /// stop request.
    pub fn trigger_emergency(&self) {
        self.emergency.store(true, Ordering::SeqCst);
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Wait for a sample delivery in progress, if any, to complete
    ///
    /// Once the emergency flag is set, no delivery starts after this returns.
    pub fn await_delivery(&self) {
        drop(self.gate.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Whether the worker should stop at its next checkpoint
    pub fn is_cancelled(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    /// Run `deliver` unless an emergency stop has been triggered
    ///
    /// Returns whether `deliver` ran.
    pub fn deliver(&self, deliver: impl FnOnce()) -> bool {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.emergency.load(Ordering::SeqCst) {
            return false;
        }
        deliver();
        true
    }
}
