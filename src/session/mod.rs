//! Run persistence and post-run analysis
//!
//! # Features
//!
//! - Record every sample to a tab-separated results file as it arrives
//! - Write a JSON report of the run when it ends
//! - Keep per-channel IV curves in memory and grade them against the
//!   configured diagnostic thresholds

pub mod diagnostics;
pub mod recorder;

pub use diagnostics::{diagnose, ChannelDiagnosis, CurveCollector};
pub use recorder::{results_file_name, RunRecorder, RunReport, RESULTS_HEADER};
