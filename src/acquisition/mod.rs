//! Acquisition core
//!
//! Everything that happens between "start" and the last sample: sweeping
//! each channel through the voltage profile, delivering samples to a sink,
//! and the run lifecycle around it.
//!
//! # Components
//!
//! - [`AcquisitionSequencer`] - Owns the worker thread and the run state
//! - [`measure_channel`] / [`ramp_down`] - The per-channel routine
//! - [`RunControl`] - Stop and emergency flags shared with the worker
//! - [`ResultSink`] - Where samples and lifecycle events go
//!
//! # Example
//!
//! ```ignore
//! use matrix_iv::acquisition::{event_channel, AcquisitionSequencer};
//! use matrix_iv::config::RunConfiguration;
//! use matrix_iv::instrument::{share_matrix, share_source, SimulatedMatrix, SimulatedSource};
//!
//! let sequencer = AcquisitionSequencer::new();
//! let (sink, events) = event_channel(1024);
//! sequencer.start(
//!     RunConfiguration::default(),
//!     share_source(SimulatedSource::new()),
//!     share_matrix(SimulatedMatrix::new()),
//!     Box::new(sink),
//! )?;
//!
//! for event in events.drain() {
//!     println!("{:?}", event);
//! }
//! let summary = sequencer.wait()?;
//! ```

pub mod control;
pub mod measurement;
pub mod sequencer;
pub mod sink;

pub use control::RunControl;
pub use measurement::{
    measure_channel, ramp_down, MeasurementContext, Timing, RAMP_STEP_INTERVAL,
    SAMPLES_PER_POINT, SOURCE_VOLTAGE_RANGE, STABILIZATION_DELAY,
};
pub use sequencer::AcquisitionSequencer;
pub use sink::{
    event_channel, EventReceiver, EventSink, FanoutSink, ResultSink, RunEvent,
    DEFAULT_EVENT_CAPACITY,
};
