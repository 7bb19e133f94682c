//! Simulated bench instruments
//!
//! This module provides a source meter and a switching matrix that behave
//! like the real ones without any hardware attached. They are used for dry
//! runs (`matrix-iv --simulate`) and by the test suite.
//!
//! # Features
//!
//! - **SiPM model**: leakage below breakdown, quadratic rise above it
//! - **Compliance**: currents above the programmed limit are clamped and
//!   reported as tripped
//! - **Command log**: every call is recorded in a [`CommandLog`] that can be
//!   shared between both instruments to observe the global command order
//! - **Fault injection**: fail every call after a given count, force a
//!   compliance trip on a given check, add per-call latency
//!
//! # Example
//!
//! ```ignore
//! use matrix_iv::instrument::sim::{CommandLog, SimulatedMatrix, SimulatedSource};
//!
//! let log = CommandLog::new();
//! let source = SimulatedSource::new().with_log(log.clone());
//! let matrix = SimulatedMatrix::new().with_log(log.clone());
//! ```

use super::{SwitchMatrix, VoltageSource};
use crate::error::{IvError, Result};
use crate::types::Channel;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// One recorded instrument call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimCommand {
    SetRange(f64),
    SetVoltage(f64),
    SetCompliance(f64),
    Output(bool),
    ReadCurrent,
    QueryCompliance,
    ReadSetVoltage,
    CloseChannel(Channel),
    OpenChannel(Channel),
    CloseBias,
    OpenAll,
}

/// Shared, append-only record of simulated instrument calls
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    entries: Arc<Mutex<Vec<SimCommand>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, command: SimCommand) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
    }

    /// Copy of every call so far, in order
    pub fn snapshot(&self) -> Vec<SimCommand> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded calls matching a predicate
    pub fn count(&self, predicate: impl Fn(&SimCommand) -> bool) -> usize {
        self.snapshot().iter().filter(|c| predicate(c)).count()
    }

    /// Every voltage programmed into the source, in order
    pub fn set_voltages(&self) -> Vec<f64> {
        self.snapshot()
            .into_iter()
            .filter_map(|c| match c {
                SimCommand::SetVoltage(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    /// Channels closed on the matrix, in order
    pub fn closed_channels(&self) -> Vec<Channel> {
        self.snapshot()
            .into_iter()
            .filter_map(|c| match c {
                SimCommand::CloseChannel(ch) => Some(ch),
                _ => None,
            })
            .collect()
    }
}

/// Simple current-voltage model of a SiPM
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiPmModel {
    /// Breakdown voltage (V)
    pub breakdown_voltage: f64,
    /// Dark current below breakdown (A)
    pub leakage_amps: f64,
    /// Current gain above breakdown (A/V^2)
    pub gain: f64,
    /// Relative noise amplitude applied to each reading
    pub noise: f64,
}

impl Default for SiPmModel {
    fn default() -> Self {
        Self {
            breakdown_voltage: 33.0,
            leakage_amps: 5.0e-11,
            gain: 1.2e-7,
            noise: 0.01,
        }
    }
}

impl SiPmModel {
    /// Noise-free current at a bias voltage
    pub fn current_at(&self, volts: f64) -> f64 {
        let overvoltage = volts - self.breakdown_voltage;
        if overvoltage > 0.0 {
            self.leakage_amps + self.gain * overvoltage * overvoltage
        } else {
            self.leakage_amps * (volts.max(0.0) / self.breakdown_voltage)
        }
    }
}

/// Small deterministic noise source in [-1, 1]
fn noise_simple() -> f64 {
    thread_local! {
        static SEED: Cell<u64> = const { Cell::new(0x2545_F491_4F6C_DD1D) };
    }
    SEED.with(|seed| {
        let mut s = seed.get();
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        seed.set(s);
        (s as f64) / (u64::MAX as f64) * 2.0 - 1.0
    })
}

/// Shared fault-injection bookkeeping
#[derive(Debug, Default)]
struct Faults {
    calls: usize,
    fail_after: Option<usize>,
    latency: Duration,
}

impl Faults {
    fn check(&mut self, instrument: &str) -> Result<()> {
        self.calls += 1;
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        match self.fail_after {
            Some(limit) if self.calls > limit => Err(IvError::instrument(
                instrument,
                format!("simulated timeout on call {}", self.calls),
            )),
            _ => Ok(()),
        }
    }
}

/// Simulated source meter driving a [`SiPmModel`]
#[derive(Debug)]
pub struct SimulatedSource {
    model: SiPmModel,
    log: CommandLog,
    faults: Faults,
    range: f64,
    set_voltage: f64,
    compliance_amps: f64,
    output_on: bool,
    tripped: bool,
    compliance_checks: usize,
    forced_trips: BTreeSet<usize>,
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self {
            model: SiPmModel::default(),
            log: CommandLog::new(),
            faults: Faults::default(),
            range: 60.0,
            set_voltage: 0.0,
            compliance_amps: 105e-6,
            output_on: false,
            tripped: false,
            compliance_checks: 0,
            forced_trips: BTreeSet::new(),
        }
    }

    /// Record calls into a shared log
    pub fn with_log(mut self, log: CommandLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_model(mut self, model: SiPmModel) -> Self {
        self.model = model;
        self
    }

    /// Start with the output already programmed to a voltage
    pub fn with_initial_voltage(mut self, volts: f64) -> Self {
        self.set_voltage = volts;
        self
    }

    /// Report compliance on the given (1-based) compliance query
    pub fn with_compliance_trip_at(mut self, check: usize) -> Self {
        self.forced_trips.insert(check);
        self
    }

    /// Fail every call after the first `calls` calls
    pub fn failing_after(mut self, calls: usize) -> Self {
        self.faults.fail_after = Some(calls);
        self
    }

    /// Delay every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.faults.latency = latency;
        self
    }

    /// Command log handle
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    fn record(&mut self, command: SimCommand) -> Result<()> {
        self.log.push(command);
        self.faults.check("simulated source")
    }
}

impl VoltageSource for SimulatedSource {
    fn set_voltage_range(&mut self, volts: f64) -> Result<()> {
        self.record(SimCommand::SetRange(volts))?;
        self.range = volts.abs();
        Ok(())
    }

    fn set_output_voltage(&mut self, volts: f64) -> Result<()> {
        self.record(SimCommand::SetVoltage(volts))?;
        self.set_voltage = volts.clamp(-self.range, self.range);
        self.tripped = false;
        Ok(())
    }

    fn set_compliance_micro_amps(&mut self, micro_amps: f64) -> Result<()> {
        self.record(SimCommand::SetCompliance(micro_amps))?;
        self.compliance_amps = micro_amps * 1e-6;
        Ok(())
    }

    fn enable_output(&mut self, enabled: bool) -> Result<()> {
        self.record(SimCommand::Output(enabled))?;
        self.output_on = enabled;
        if !enabled {
            self.tripped = false;
        }
        Ok(())
    }

    fn read_current_amps(&mut self) -> Result<f64> {
        self.record(SimCommand::ReadCurrent)?;
        if !self.output_on {
            return Ok(0.0);
        }
        let ideal = self.model.current_at(self.set_voltage);
        let reading = ideal * (1.0 + self.model.noise * noise_simple());
        if reading >= self.compliance_amps {
            self.tripped = true;
            Ok(self.compliance_amps)
        } else {
            Ok(reading)
        }
    }

    fn is_compliance_tripped(&mut self) -> Result<bool> {
        self.record(SimCommand::QueryCompliance)?;
        self.compliance_checks += 1;
        Ok(self.tripped || self.forced_trips.contains(&self.compliance_checks))
    }

    fn read_set_voltage(&mut self) -> Result<f64> {
        self.record(SimCommand::ReadSetVoltage)?;
        Ok(self.set_voltage)
    }
}

/// Simulated switching matrix
#[derive(Debug, Default)]
pub struct SimulatedMatrix {
    log: CommandLog,
    faults: Faults,
    bias_closed: bool,
    closed: BTreeSet<Channel>,
}

impl SimulatedMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record calls into a shared log
    pub fn with_log(mut self, log: CommandLog) -> Self {
        self.log = log;
        self
    }

    /// Fail every call after the first `calls` calls
    pub fn failing_after(mut self, calls: usize) -> Self {
        self.faults.fail_after = Some(calls);
        self
    }

    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    /// Channels whose relays are currently closed
    pub fn closed_channels(&self) -> Vec<Channel> {
        self.closed.iter().copied().collect()
    }

    pub fn is_bias_closed(&self) -> bool {
        self.bias_closed
    }

    fn record(&mut self, command: SimCommand) -> Result<()> {
        self.log.push(command);
        self.faults.check("simulated matrix")
    }
}

impl SwitchMatrix for SimulatedMatrix {
    fn close_channel(&mut self, channel: Channel) -> Result<()> {
        self.record(SimCommand::CloseChannel(channel))?;
        self.closed.insert(channel);
        Ok(())
    }

    fn open_channel(&mut self, channel: Channel) -> Result<()> {
        self.record(SimCommand::OpenChannel(channel))?;
        self.closed.remove(&channel);
        Ok(())
    }

    fn close_bias_path(&mut self) -> Result<()> {
        self.record(SimCommand::CloseBias)?;
        self.bias_closed = true;
        Ok(())
    }

    fn open_all_paths(&mut self) -> Result<()> {
        self.record(SimCommand::OpenAll)?;
        self.closed.clear();
        self.bias_closed = false;
        Ok(())
    }
}
