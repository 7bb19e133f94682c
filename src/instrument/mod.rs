//! Instrument capability interfaces
//!
//! The acquisition core only ever talks to hardware through the two traits in
//! this module. Everything about how commands reach an instrument (bus,
//! gateway, command syntax) lives in the implementations.
//!
//! # Components
//!
//! - [`VoltageSource`] - Programmable source meter (set voltage, read current)
//! - [`SwitchMatrix`] - Relay matrix routing the source to one SiPM at a time
//! - [`Bench`] - Shared handles to both, as owned by one acquisition run
//! - [`keithley`] - Drivers for the source meter and switching matrix
//! - [`sim`] - Simulated instruments for dry runs and tests
//!
//! # Sharing
//!
//! The instruments are held as `Arc<Mutex<dyn ...>>` so that an emergency stop
//! issued from the operator thread can reach the hardware while a run is in
//! progress. The worker only holds a lock for the duration of one instrument
//! call, never across a settling delay.

pub mod keithley;
pub mod sim;
pub mod transport;

pub use keithley::{Keithley2420, Keithley707};
pub use sim::{SimulatedMatrix, SimulatedSource, SiPmModel};
pub use transport::{TcpTransport, Transport};

use crate::error::Result;
use crate::types::Channel;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Programmable voltage source with current readback
///
/// Every call may fail with [`crate::IvError::InstrumentCommunication`].
/// Writes to an output that is already disabled must succeed.
#[cfg_attr(test, mockall::automock)]
pub trait VoltageSource: Send {
    /// Select the source voltage range
    fn set_voltage_range(&mut self, volts: f64) -> Result<()>;

    /// Program the output voltage
    fn set_output_voltage(&mut self, volts: f64) -> Result<()>;

    /// Program the current compliance limit
    fn set_compliance_micro_amps(&mut self, micro_amps: f64) -> Result<()>;

    /// Switch the output on or off
    fn enable_output(&mut self, enabled: bool) -> Result<()>;

    /// Take one current reading in amps
    fn read_current_amps(&mut self) -> Result<f64>;

    /// Whether the source is currently limited by compliance
    fn is_compliance_tripped(&mut self) -> Result<bool>;

    /// Voltage the instrument is actually programmed to
    fn read_set_voltage(&mut self) -> Result<f64>;
}

/// Relay switching matrix
#[cfg_attr(test, mockall::automock)]
pub trait SwitchMatrix: Send {
    /// Connect a channel's signal line
    fn close_channel(&mut self, channel: Channel) -> Result<()>;

    /// Disconnect a channel's signal line
    fn open_channel(&mut self, channel: Channel) -> Result<()>;

    /// Connect the bias line
    fn close_bias_path(&mut self) -> Result<()>;

    /// Open every relay
    fn open_all_paths(&mut self) -> Result<()>;
}

/// Shared handle to a voltage source
pub type SharedSource = Arc<Mutex<dyn VoltageSource>>;

/// Shared handle to a switch matrix
pub type SharedMatrix = Arc<Mutex<dyn SwitchMatrix>>;

/// Wrap a voltage source for use by the sequencer
pub fn share_source<S: VoltageSource + 'static>(source: S) -> SharedSource {
    Arc::new(Mutex::new(source))
}

/// Wrap a switch matrix for use by the sequencer
pub fn share_matrix<M: SwitchMatrix + 'static>(matrix: M) -> SharedMatrix {
    Arc::new(Mutex::new(matrix))
}

/// The pair of instruments one run drives
#[derive(Clone)]
pub struct Bench {
    source: SharedSource,
    matrix: SharedMatrix,
}

impl Bench {
    pub fn new(source: SharedSource, matrix: SharedMatrix) -> Self {
        Self { source, matrix }
    }

    /// Lock the source for one call
    ///
    /// A poisoned lock is recovered: a panic elsewhere must never prevent the
    /// hardware from being safed.
    pub fn source(&self) -> MutexGuard<'_, dyn VoltageSource + 'static> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the matrix for one call
    pub fn matrix(&self) -> MutexGuard<'_, dyn SwitchMatrix + 'static> {
        self.matrix.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Disable the output and open every relay
    ///
    /// Both commands are attempted even if the first fails; the first error
    /// is returned.
    pub fn safe_shutdown(&self) -> Result<()> {
        let output = self.source().enable_output(false);
        let relays = self.matrix().open_all_paths();
        if let Err(e) = &output {
            tracing::error!("Failed to disable source output: {}", e);
        }
        if let Err(e) = &relays {
            tracing::error!("Failed to open matrix relays: {}", e);
        }
        output.and(relays)
    }
}

impl std::fmt::Debug for Bench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bench").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IvError;

    #[test]
    fn test_safe_shutdown_attempts_both_on_failure() {
        let mut source = MockVoltageSource::new();
        source
            .expect_enable_output()
            .withf(|enabled| !*enabled)
            .times(1)
            .returning(|_| Err(IvError::instrument("source", "timeout")));

        let mut matrix = MockSwitchMatrix::new();
        matrix.expect_open_all_paths().times(1).returning(|| Ok(()));

        let bench = Bench::new(share_source(source), share_matrix(matrix));
        let result = bench.safe_shutdown();
        assert!(matches!(result, Err(IvError::InstrumentCommunication { .. })));
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let source = share_source(SimulatedSource::new());
        let matrix = share_matrix(SimulatedMatrix::new());
        let bench = Bench::new(source.clone(), matrix);

        let poisoner = source.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(source.is_poisoned());
        assert!(bench.source().enable_output(false).is_ok());
    }
}
