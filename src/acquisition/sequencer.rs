//! Run lifecycle: start, stop, emergency stop
//!
//! The [`AcquisitionSequencer`] owns at most one run at a time. A run
//! executes on a dedicated worker thread so the caller stays responsive; the
//! caller talks to it through the sequencer's methods and receives results
//! through the [`ResultSink`] it handed over at start.
//!
//! ```text
//! Idle --start--> Running --stop/emergency--> Stopping --worker exits--> Idle
//!                    |                                                    ^
//!                    +-------------- last channel / fault ----------------+
//! ```
//!
//! # Run sequence
//!
//! 1. Program compliance and voltage range, close the bias path
//! 2. Optionally ramp to 0 V, then enable the output
//! 3. Measure each active channel in ascending order
//! 4. On completion: set 0 V and disable the output
//!
//! A cooperative stop leaves the hardware as it is; an emergency stop
//! disables the output and opens every relay from the calling thread.

use super::control::RunControl;
use super::measurement::{
    measure_channel, ramp_to_zero, Interrupt, MeasurementContext, Step, Timing,
    SOURCE_VOLTAGE_RANGE,
};
use super::sink::ResultSink;
use crate::config::RunConfiguration;
use crate::error::{IvError, Result};
use crate::instrument::{Bench, SharedMatrix, SharedSource};
use crate::profile::VoltageProfile;
use crate::types::{AbortReason, ChannelOutcome, ChannelResult, RunState, RunSummary};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// Handles the operator side keeps to reach a run in progress
#[derive(Debug, Clone)]
struct RunHandles {
    control: Arc<RunControl>,
    bench: Bench,
}

type Worker = JoinHandle<Result<RunSummary>>;

/// Drives acquisition runs on a worker thread
pub struct AcquisitionSequencer {
    timing: Timing,
    state: Arc<Mutex<RunState>>,
    /// Handles of the current or most recent run
    handles: Mutex<Option<RunHandles>>,
    worker: Mutex<Option<Worker>>,
}

impl Default for AcquisitionSequencer {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AcquisitionSequencer {
    pub fn new() -> Self {
        Self::with_timing(Timing::default())
    }

    /// Use custom delays (shorter ones for simulation and tests)
    pub fn with_timing(timing: Timing) -> Self {
        Self {
            timing,
            state: Arc::new(Mutex::new(RunState::Idle)),
            handles: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn state(&self) -> RunState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() != RunState::Idle
    }

    /// Start a run on a new worker thread
    ///
    /// The configuration is validated and the voltage profile generated
    /// before any hardware is touched. Fails with
    /// [`IvError::AlreadyRunning`] if a run is in progress; nothing changes
    /// in that case.
    pub fn start(
        &self,
        config: RunConfiguration,
        source: SharedSource,
        matrix: SharedMatrix,
        sink: Box<dyn ResultSink>,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != RunState::Idle {
            return Err(IvError::AlreadyRunning);
        }

        config.validate()?;
        let profile = VoltageProfile::generate(&config)?;

        // A previous worker may still be unwinding after setting Idle
        if let Some(previous) = lock(&self.worker).take() {
            match previous.join() {
                Ok(Err(e)) => tracing::warn!("Previous run ended with an unreported error: {}", e),
                Err(_) => tracing::error!("Previous acquisition worker panicked"),
                Ok(Ok(_)) => {}
            }
        }

        let handles = RunHandles {
            control: Arc::new(RunControl::new()),
            bench: Bench::new(source, matrix),
        };
        *lock(&self.handles) = Some(handles.clone());

        let run = Run {
            config,
            profile,
            timing: self.timing,
            control: handles.control,
            bench: handles.bench,
            sink,
        };
        let shared_state = self.state.clone();

        let worker = std::thread::Builder::new()
            .name("iv-acquisition".to_string())
            .spawn(move || {
                let _guard = WorkerGuard {
                    state: shared_state,
                    bench: run.bench.clone(),
                    control: run.control.clone(),
                };
                run.execute()
            })?;

        *state = RunState::Running;
        *lock(&self.worker) = Some(worker);
        tracing::info!("Acquisition started");
        Ok(())
    }

    /// Request a cooperative stop and wait for the worker to exit
    ///
    /// The worker finishes the sample in progress, then returns. The hardware
    /// is left as it is. Returns the run's summary, or `None` if there was no
    /// worker to wait for.
    pub fn stop(&self) -> Result<Option<RunSummary>> {
        self.request_stop();
        self.wait()
    }

    /// Flag a cooperative stop without waiting for the worker
    pub fn request_stop(&self) {
        if let Some(handles) = lock(&self.handles).as_ref() {
            handles.control.request_stop();
        }
        self.mark_stopping();
    }

    /// Wait for the current run to end without cancelling it
    pub fn wait(&self) -> Result<Option<RunSummary>> {
        let Some(worker) = lock(&self.worker).take() else {
            return Ok(None);
        };
        match worker.join() {
            Ok(result) => result.map(Some),
            Err(_) => Err(IvError::WorkerPanicked),
        }
    }

    /// Force the hardware into a safe state immediately
    ///
    /// Disables the source output and opens every matrix relay from the
    /// calling thread, without waiting for the worker. Once this returns the
    /// sink receives no further samples and the worker issues no further
    /// hardware commands. Safe to call at any time, including while idle, in
    /// which case the instruments of the most recent run are safed.
    pub fn emergency_stop(&self) -> Result<()> {
        let Some(handles) = lock(&self.handles).clone() else {
            tracing::warn!("Emergency stop requested but no instruments are attached");
            return Ok(());
        };

        tracing::warn!("EMERGENCY STOP");
        handles.control.trigger_emergency();
        self.mark_stopping();
        let safed = handles.bench.safe_shutdown();
        handles.control.await_delivery();
        safed
    }

    fn mark_stopping(&self) {
        let mut state = lock(&self.state);
        if *state == RunState::Running {
            *state = RunState::Stopping;
        }
    }
}

impl Drop for AcquisitionSequencer {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            if let Some(handles) = lock(&self.handles).as_ref() {
                handles.control.request_stop();
            }
            let _ = worker.join();
        }
    }
}

/// Returns the sequencer to Idle when the worker exits, however it exits
struct WorkerGuard {
    state: Arc<Mutex<RunState>>,
    bench: Bench,
    control: Arc<RunControl>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if std::thread::panicking() && !self.control.is_emergency() {
            tracing::error!("Acquisition worker panicked, safing hardware");
            let _ = self.bench.safe_shutdown();
        }
        *lock(&self.state) = RunState::Idle;
    }
}

/// Everything one run needs, moved onto the worker thread
struct Run {
    config: RunConfiguration,
    profile: VoltageProfile,
    timing: Timing,
    control: Arc<RunControl>,
    bench: Bench,
    sink: Box<dyn ResultSink>,
}

impl Run {
    fn execute(mut self) -> Result<RunSummary> {
        tracing::info!(
            "Acquisition worker started: {} channel(s), {} points each",
            self.config.active_channels.len(),
            self.profile.len()
        );

        let mut summary = RunSummary::begin();
        let ctx = MeasurementContext::new(&self.bench, &self.control, &self.timing);
        let result = sequence(
            &ctx,
            &self.config,
            &self.profile,
            self.sink.as_mut(),
            &mut summary.channels,
        );
        summary.finished_at = Utc::now();

        match result {
            Ok(true) => {
                tracing::info!("Acquisition finished ({} samples)", summary.total_samples());
                self.sink.on_run_finished();
                Ok(summary)
            }
            Ok(false) | Err(Interrupt::Emergency) => {
                let reason = if self.control.is_emergency() {
                    AbortReason::EmergencyStop
                } else {
                    AbortReason::Stopped
                };
                tracing::info!("Acquisition aborted: {}", reason);
                self.sink.on_run_aborted(&reason);
                summary.aborted = Some(reason);
                Ok(summary)
            }
            Err(Interrupt::Fault(e)) => {
                tracing::error!("Acquisition failed: {}", e);
                if !self.control.is_emergency() {
                    let _ = self.bench.safe_shutdown();
                }
                self.sink
                    .on_run_aborted(&AbortReason::InstrumentFault(e.to_string()));
                Err(e)
            }
        }
    }
}

fn sequence(
    ctx: &MeasurementContext<'_>,
    config: &RunConfiguration,
    profile: &VoltageProfile,
    sink: &mut dyn ResultSink,
    results: &mut Vec<ChannelResult>,
) -> Step<bool> {
    ctx.source(|s| s.set_compliance_micro_amps(config.compliance_limit_micro_amps))?;
    ctx.source(|s| s.set_voltage_range(SOURCE_VOLTAGE_RANGE))?;
    ctx.matrix(|m| m.close_bias_path())?;

    if config.check_zero_at_start {
        tracing::info!("Ramping source to 0 V before enabling output");
        ramp_to_zero(ctx, config.ramp_down_step_volts)?;
    }
    ctx.source(|s| s.enable_output(true))?;

    for channel in config.ordered_channels() {
        if ctx.control.is_cancelled() {
            return Ok(false);
        }

        let result = measure_channel(channel, profile, config, ctx, sink)?;
        let cancelled = result.outcome == ChannelOutcome::Cancelled;
        results.push(result);
        if cancelled {
            return Ok(false);
        }
    }

    ctx.source(|s| s.set_output_voltage(0.0))?;
    ctx.source(|s| s.enable_output(false))?;
    Ok(true)
}
