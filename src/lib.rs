//! # matrix-iv: IV characterization of SiPM matrix boards
//!
//! Sweeps a bias voltage across each of the 16 SiPMs on a matrix board and
//! records the current drawn at every step. A source meter provides the bias
//! and reads the current; a relay switching matrix routes the bias to one
//! SiPM at a time.
//!
//! ## Architecture
//!
//! - **Instruments**: capability traits for the source and the matrix, with
//!   Keithley drivers and simulated implementations
//! - **Acquisition**: the per-channel sweep and the sequencer that runs it on
//!   a worker thread, with cooperative and emergency stop
//! - **Sinks**: samples and lifecycle events are pushed to a `ResultSink`;
//!   a crossbeam channel feeds a UI, a recorder writes the results file
//! - **Session**: results log and pass/fail diagnostics per channel
//!
//! ## Configuration
//!
//! The bench is described by a TOML file (see [`config::BenchConfig`]).
//! Results go to the configured output directory, or under the platform data
//! directory:
//!
//! - **Linux**: `~/.local/share/matrix-iv/data/`
//! - **macOS**: `~/Library/Application Support/matrix-iv/data/`
//! - **Windows**: `%APPDATA%\matrix-iv\data\`
//!
//! ## Example
//!
//! ```ignore
//! use matrix_iv::{
//!     acquisition::{AcquisitionSequencer, FanoutSink},
//!     config::BenchConfig,
//!     instrument::{share_matrix, share_source, SimulatedMatrix, SimulatedSource},
//!     session::{CurveCollector, RunRecorder},
//! };
//!
//! let bench = BenchConfig::load_or_default("bench.toml");
//! let collector = CurveCollector::new();
//! let sink = FanoutSink::new()
//!     .with(RunRecorder::create(bench.resolved_output_dir()?, &bench.matrix_name)?)
//!     .with(collector.clone());
//!
//! let sequencer = AcquisitionSequencer::new();
//! sequencer.start(
//!     bench.run_configuration()?,
//!     share_source(SimulatedSource::new()),
//!     share_matrix(SimulatedMatrix::new()),
//!     Box::new(sink),
//! )?;
//! let summary = sequencer.wait()?;
//!
//! for (channel, diagnosis) in collector.diagnose_all(&bench.diagnostics) {
//!     println!("{}: {}", channel, diagnosis);
//! }
//! ```

pub mod acquisition;
pub mod config;
pub mod error;
pub mod instrument;
pub mod profile;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use acquisition::{AcquisitionSequencer, ResultSink, RunEvent, Timing};
pub use config::{BenchConfig, RunConfiguration};
pub use error::{IvError, Result, ResultExt};
pub use instrument::{SwitchMatrix, VoltageSource};
pub use profile::VoltageProfile;
pub use types::{AbortReason, Channel, ChannelOutcome, RunState, RunSummary, Sample};
