//! Per-channel measurement routine
//!
//! For one channel:
//!
//! 1. Close the channel relay
//! 2. For each voltage in the profile: set it, settle, take
//!    [`SAMPLES_PER_POINT`] current readings, optionally check compliance,
//!    deliver one averaged [`Sample`]
//! 3. Open the relay
//! 4. Optionally ramp the source back to 0 V
//!
//! Every instrument call goes through [`MeasurementContext`], which refuses
//! to touch the hardware once an emergency stop has been triggered. The call
//! is made while holding the instrument lock, so an emergency stop issued
//! concurrently always gets the last word on the hardware.

use super::control::RunControl;
use super::sink::ResultSink;
use crate::config::RunConfiguration;
use crate::error::{IvError, Result};
use crate::instrument::{Bench, SwitchMatrix, VoltageSource};
use crate::profile::VoltageProfile;
use crate::types::{Channel, ChannelOutcome, ChannelResult, Sample};
use std::time::Duration;

/// Current readings averaged into one sample
pub const SAMPLES_PER_POINT: usize = 6;

/// Settling time after each voltage change
pub const STABILIZATION_DELAY: Duration = Duration::from_millis(200);

/// Pause between ramp-down steps
pub const RAMP_STEP_INTERVAL: Duration = Duration::from_secs(1);

/// Source voltage range selected at run start (V)
pub const SOURCE_VOLTAGE_RANGE: f64 = 60.0;

/// Delays and sample counts used by a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub stabilization: Duration,
    pub ramp_step_interval: Duration,
    pub samples_per_point: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            stabilization: STABILIZATION_DELAY,
            ramp_step_interval: RAMP_STEP_INTERVAL,
            samples_per_point: SAMPLES_PER_POINT,
        }
    }
}

impl Timing {
    /// Same sample count, no delays (simulation and tests)
    pub fn instant() -> Self {
        Self {
            stabilization: Duration::ZERO,
            ramp_step_interval: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Why a step of the routine did not complete
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// The emergency flag was set; the hardware belongs to the emergency stop
    Emergency,
    Fault(IvError),
}

impl From<IvError> for Interrupt {
    fn from(e: IvError) -> Self {
        Interrupt::Fault(e)
    }
}

pub(crate) type Step<T> = std::result::Result<T, Interrupt>;

/// Hardware and cancellation state one run works with
pub struct MeasurementContext<'a> {
    pub bench: &'a Bench,
    pub control: &'a RunControl,
    pub timing: &'a Timing,
}

impl<'a> MeasurementContext<'a> {
    pub fn new(bench: &'a Bench, control: &'a RunControl, timing: &'a Timing) -> Self {
        Self {
            bench,
            control,
            timing,
        }
    }

    /// Make one source call, unless an emergency stop got there first
    pub(crate) fn source<R>(
        &self,
        call: impl FnOnce(&mut dyn VoltageSource) -> Result<R>,
    ) -> Step<R> {
        let mut source = self.bench.source();
        if self.control.is_emergency() {
            return Err(Interrupt::Emergency);
        }
        Ok(call(&mut *source)?)
    }

    /// Make one matrix call, unless an emergency stop got there first
    pub(crate) fn matrix<R>(
        &self,
        call: impl FnOnce(&mut dyn SwitchMatrix) -> Result<R>,
    ) -> Step<R> {
        let mut matrix = self.bench.matrix();
        if self.control.is_emergency() {
            return Err(Interrupt::Emergency);
        }
        Ok(call(&mut *matrix)?)
    }

    fn settle(&self) {
        pause(self.timing.stabilization);
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

/// Sweep one channel through the profile
///
/// Returns [`ChannelOutcome::Cancelled`] as soon as a stop is noticed after a
/// sample; in that case the relay is left as it is. Instrument failures are
/// returned as errors and nothing else is attempted on the hardware.
///
/// Once `on_channel_started` has been emitted, `on_channel_finished` always
/// follows, with [`ChannelOutcome::Cancelled`] if the sweep was interrupted
/// by an emergency stop or an instrument fault.
pub fn measure_channel(
    channel: Channel,
    profile: &VoltageProfile,
    config: &RunConfiguration,
    ctx: &MeasurementContext<'_>,
    sink: &mut dyn ResultSink,
) -> Result<ChannelResult> {
    let mut progress = SweepProgress::default();
    let swept = sweep_channel(channel, profile, config, ctx, sink, &mut progress);

    let outcome = match &swept {
        Ok(outcome) => *outcome,
        Err(_) => ChannelOutcome::Cancelled,
    };
    if progress.started {
        sink.on_channel_finished(channel, outcome);
    }

    match swept {
        Ok(_) | Err(Interrupt::Emergency) => Ok(ChannelResult {
            channel,
            outcome,
            samples: progress.samples,
        }),
        Err(Interrupt::Fault(e)) => Err(e),
    }
}

/// How far a sweep got before it returned
#[derive(Debug, Default)]
struct SweepProgress {
    started: bool,
    samples: usize,
}

fn sweep_channel(
    channel: Channel,
    profile: &VoltageProfile,
    config: &RunConfiguration,
    ctx: &MeasurementContext<'_>,
    sink: &mut dyn ResultSink,
    progress: &mut SweepProgress,
) -> Step<ChannelOutcome> {
    ctx.matrix(|m| m.close_channel(channel))?;
    tracing::info!("Measuring {} ({} points)", channel, profile.len());
    sink.on_channel_started(channel);
    progress.started = true;

    let mut outcome = ChannelOutcome::Completed;
    for voltage in profile.iter() {
        ctx.source(|s| s.set_output_voltage(voltage))?;
        ctx.settle();

        let mut readings = Vec::with_capacity(ctx.timing.samples_per_point);
        for _ in 0..ctx.timing.samples_per_point {
            readings.push(ctx.source(|s| s.read_current_amps())?);
        }
        let sample = Sample::from_readings(channel, voltage, &readings);

        if config.skip_on_compliance && ctx.source(|s| s.is_compliance_tripped())? {
            tracing::warn!(
                "{}: compliance reached at {:.2} V, skipping rest of sweep",
                channel,
                voltage
            );
            ctx.source(|s| s.set_output_voltage(0.0))?;
            ctx.settle();
            outcome = ChannelOutcome::ComplianceStop { voltage };
            break;
        }

        if !ctx.control.deliver(|| sink.on_sample(&sample)) {
            return Err(Interrupt::Emergency);
        }
        progress.samples += 1;
        tracing::debug!(
            "{} @ {:.2} V: {:.3e} A (+/- {:.1e})",
            channel,
            voltage,
            sample.mean_current,
            sample.current_spread
        );

        if ctx.control.is_cancelled() {
            tracing::info!("{}: stop requested", channel);
            return Ok(ChannelOutcome::Cancelled);
        }
    }

    ctx.matrix(|m| m.open_channel(channel))?;

    if config.ramp_down_enabled {
        ramp_to_zero(ctx, config.ramp_down_step_volts)?;
    }

    Ok(outcome)
}

/// Step the source down to 0 V
///
/// The programmed voltage is read back from the instrument before every
/// step; the source is never commanded below 0 V. Non-positive step sizes
/// are rejected by configuration validation before a run starts.
pub fn ramp_down(ctx: &MeasurementContext<'_>, step_volts: f64) -> Result<()> {
    match ramp_to_zero(ctx, step_volts) {
        Ok(()) | Err(Interrupt::Emergency) => Ok(()),
        Err(Interrupt::Fault(e)) => Err(e),
    }
}

pub(crate) fn ramp_to_zero(ctx: &MeasurementContext<'_>, step_volts: f64) -> Step<()> {
    if step_volts <= 0.0 || !step_volts.is_finite() {
        return Err(Interrupt::Fault(IvError::Config(format!(
            "ramp-down step must be positive, got {}",
            step_volts
        ))));
    }

    loop {
        let current = ctx.source(|s| s.read_set_voltage())?;
        if current <= 0.0 {
            return Ok(());
        }
        let next = (current - step_volts).max(0.0);
        tracing::debug!("Ramping down: {:.2} V -> {:.2} V", current, next);
        ctx.source(|s| s.set_output_voltage(next))?;
        pause(ctx.timing.ramp_step_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::sink::{event_channel, RunEvent};
    use crate::instrument::{share_matrix, share_source, MockSwitchMatrix, MockVoltageSource};
    use mockall::Sequence;
    use std::sync::{Arc, Mutex};

    fn channel(index: usize) -> Channel {
        Channel::new(index).unwrap()
    }

    fn config(skip_on_compliance: bool, ramp_down_enabled: bool) -> RunConfiguration {
        RunConfiguration {
            skip_on_compliance,
            ramp_down_enabled,
            ramp_down_step_volts: 5.0,
            ..RunConfiguration::default()
        }
    }

    fn matrix_expecting(channel: Channel) -> MockSwitchMatrix {
        let mut matrix = MockSwitchMatrix::new();
        let mut seq = Sequence::new();
        matrix
            .expect_close_channel()
            .withf(move |c| *c == channel)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        matrix
            .expect_open_channel()
            .withf(move |c| *c == channel)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        matrix
    }

    #[test]
    fn test_ramp_down_rereads_and_never_goes_negative() {
        let readback = Arc::new(Mutex::new(12.0));
        let commanded = Arc::new(Mutex::new(Vec::new()));

        let mut source = MockVoltageSource::new();
        let r = readback.clone();
        source
            .expect_read_set_voltage()
            .returning(move || Ok(*r.lock().unwrap()));
        let (r, c) = (readback.clone(), commanded.clone());
        source.expect_set_output_voltage().returning(move |v| {
            *r.lock().unwrap() = v;
            c.lock().unwrap().push(v);
            Ok(())
        });

        let bench = Bench::new(share_source(source), share_matrix(MockSwitchMatrix::new()));
        let control = RunControl::new();
        let timing = Timing::instant();
        let ctx = MeasurementContext::new(&bench, &control, &timing);

        ramp_down(&ctx, 5.0).unwrap();
        assert_eq!(*commanded.lock().unwrap(), vec![7.0, 2.0, 0.0]);
    }

    #[test]
    fn test_ramp_down_at_zero_is_noop() {
        let mut source = MockVoltageSource::new();
        source.expect_read_set_voltage().times(1).returning(|| Ok(0.0));
        source.expect_set_output_voltage().never();

        let bench = Bench::new(share_source(source), share_matrix(MockSwitchMatrix::new()));
        let control = RunControl::new();
        let timing = Timing::instant();
        let ctx = MeasurementContext::new(&bench, &control, &timing);

        assert!(ramp_down(&ctx, 5.0).is_ok());
    }

    #[test]
    fn test_compliance_on_fourth_sample_stops_channel() {
        let ch = channel(3);
        let profile = VoltageProfile::from_points((0..10).map(|i| 20.0 + i as f64).collect());

        let checks = Arc::new(Mutex::new(0usize));
        let mut source = MockVoltageSource::new();
        source.expect_set_output_voltage().returning(|_| Ok(()));
        source.expect_read_current_amps().returning(|| Ok(1e-9));
        let c = checks.clone();
        source.expect_is_compliance_tripped().returning(move || {
            let mut n = c.lock().unwrap();
            *n += 1;
            Ok(*n == 4)
        });

        let bench = Bench::new(share_source(source), share_matrix(matrix_expecting(ch)));
        let control = RunControl::new();
        let timing = Timing::instant();
        let ctx = MeasurementContext::new(&bench, &control, &timing);
        let (mut sink, events) = event_channel(64);

        let result = measure_channel(ch, &profile, &config(true, false), &ctx, &mut sink).unwrap();

        assert_eq!(result.outcome, ChannelOutcome::ComplianceStop { voltage: 23.0 });
        assert_eq!(result.samples, 3);
        let samples = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, RunEvent::Sample(_)))
            .count();
        assert_eq!(samples, 3);
    }

    #[test]
    fn test_compliance_not_queried_when_not_skipping() {
        let ch = channel(0);
        let profile = VoltageProfile::from_points(vec![20.0, 21.0]);

        let mut source = MockVoltageSource::new();
        source.expect_set_output_voltage().times(2).returning(|_| Ok(()));
        source
            .expect_read_current_amps()
            .times(2 * SAMPLES_PER_POINT)
            .returning(|| Ok(2e-9));
        source.expect_is_compliance_tripped().never();

        let bench = Bench::new(share_source(source), share_matrix(matrix_expecting(ch)));
        let control = RunControl::new();
        let timing = Timing::instant();
        let ctx = MeasurementContext::new(&bench, &control, &timing);
        let (mut sink, events) = event_channel(64);

        let result = measure_channel(ch, &profile, &config(false, false), &ctx, &mut sink).unwrap();
        assert_eq!(result.outcome, ChannelOutcome::Completed);

        let events = events.drain();
        assert_eq!(events.first(), Some(&RunEvent::ChannelStarted(ch)));
        match &events[1] {
            RunEvent::Sample(s) => {
                assert_eq!(s.voltage, 20.0);
                assert!((s.mean_current - 2e-9).abs() < 1e-18);
                assert_eq!(s.current_spread, 0.0);
            }
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_profile_still_switches_relay() {
        let ch = channel(7);
        let mut source = MockVoltageSource::new();
        source.expect_set_output_voltage().never();

        let bench = Bench::new(share_source(source), share_matrix(matrix_expecting(ch)));
        let control = RunControl::new();
        let timing = Timing::instant();
        let ctx = MeasurementContext::new(&bench, &control, &timing);
        let (mut sink, _events) = event_channel(8);

        let result = measure_channel(
            ch,
            &VoltageProfile::from_points(Vec::new()),
            &config(false, false),
            &ctx,
            &mut sink,
        )
        .unwrap();
        assert_eq!(result.outcome, ChannelOutcome::Completed);
        assert_eq!(result.samples, 0);
    }

    #[test]
    fn test_stop_after_sample_leaves_relay_closed() {
        let ch = channel(2);
        let profile = VoltageProfile::from_points(vec![20.0, 21.0, 22.0]);

        let mut source = MockVoltageSource::new();
        source.expect_set_output_voltage().times(1).returning(|_| Ok(()));
        source.expect_read_current_amps().returning(|| Ok(1e-9));

        let mut matrix = MockSwitchMatrix::new();
        matrix.expect_close_channel().times(1).returning(|_| Ok(()));
        matrix.expect_open_channel().never();

        let bench = Bench::new(share_source(source), share_matrix(matrix));
        let control = RunControl::new();
        control.request_stop();
        let timing = Timing::instant();
        let ctx = MeasurementContext::new(&bench, &control, &timing);
        let (mut sink, _events) = event_channel(8);

        let result = measure_channel(ch, &profile, &config(false, true), &ctx, &mut sink).unwrap();
        assert_eq!(result.outcome, ChannelOutcome::Cancelled);
        assert_eq!(result.samples, 1);
    }

    #[test]
    fn test_emergency_suppresses_hardware_calls() {
        let ch = channel(1);
        let mut matrix = MockSwitchMatrix::new();
        matrix.expect_close_channel().never();

        let bench = Bench::new(share_source(MockVoltageSource::new()), share_matrix(matrix));
        let control = RunControl::new();
        control.trigger_emergency();
        let timing = Timing::instant();
        let ctx = MeasurementContext::new(&bench, &control, &timing);
        let (mut sink, events) = event_channel(8);

        let result = measure_channel(
            ch,
            &VoltageProfile::from_points(vec![20.0]),
            &config(false, false),
            &ctx,
            &mut sink,
        )
        .unwrap();
        assert_eq!(result.outcome, ChannelOutcome::Cancelled);
        assert!(events.drain().is_empty());
    }

    #[test]
    fn test_read_failure_propagates() {
        let ch = channel(0);
        let mut source = MockVoltageSource::new();
        source.expect_set_output_voltage().returning(|_| Ok(()));
        source
            .expect_read_current_amps()
            .returning(|| Err(IvError::instrument("source", "timeout")));

        let mut matrix = MockSwitchMatrix::new();
        matrix.expect_close_channel().returning(|_| Ok(()));
        matrix.expect_open_channel().never();

        let bench = Bench::new(share_source(source), share_matrix(matrix));
        let control = RunControl::new();
        let timing = Timing::instant();
        let ctx = MeasurementContext::new(&bench, &control, &timing);
        let (mut sink, events) = event_channel(8);

        let result = measure_channel(
            ch,
            &VoltageProfile::from_points(vec![20.0]),
            &config(false, false),
            &ctx,
            &mut sink,
        );
        assert!(matches!(result, Err(IvError::InstrumentCommunication { .. })));

        // Started channels are always closed off for consumers
        assert_eq!(
            events.drain(),
            vec![
                RunEvent::ChannelStarted(ch),
                RunEvent::ChannelFinished {
                    channel: ch,
                    outcome: ChannelOutcome::Cancelled
                },
            ]
        );
    }

    #[test]
    fn test_ramp_after_channel_when_enabled() {
        let ch = channel(4);
        let voltage = Arc::new(Mutex::new(0.0));

        let mut source = MockVoltageSource::new();
        let v = voltage.clone();
        source.expect_set_output_voltage().returning(move |x| {
            *v.lock().unwrap() = x;
            Ok(())
        });
        let v = voltage.clone();
        source
            .expect_read_set_voltage()
            .returning(move || Ok(*v.lock().unwrap()));
        source.expect_read_current_amps().returning(|| Ok(1e-9));

        let bench = Bench::new(share_source(source), share_matrix(matrix_expecting(ch)));
        let control = RunControl::new();
        let timing = Timing::instant();
        let ctx = MeasurementContext::new(&bench, &control, &timing);
        let (mut sink, _events) = event_channel(16);

        measure_channel(
            ch,
            &VoltageProfile::from_points(vec![20.0, 21.0]),
            &config(false, true),
            &ctx,
            &mut sink,
        )
        .unwrap();
        assert_eq!(*voltage.lock().unwrap(), 0.0);
    }
}
