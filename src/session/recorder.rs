//! Results log for one run
//!
//! Writes every sample to a tab-separated text file as soon as it arrives,
//! and a JSON report next to it when the run ends.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::acquisition::ResultSink;
use crate::config::ensure_dir;
use crate::error::{IvError, Result, ResultExt};
use crate::types::{AbortReason, Channel, ChannelOutcome, ChannelResult, RunSummary, Sample};

/// Column header of the results file
pub const RESULTS_HEADER: &str = "SiPM IDX\tVoltage (V)\tCurrent (nA)\tSTD";

/// `<matrix name>_IV_<YYYYmmddHHMMSS>.txt`, spaces replaced by underscores
pub fn results_file_name(matrix_name: &str, timestamp: DateTime<Local>) -> String {
    format!(
        "{}_IV_{}.txt",
        matrix_name.trim().replace(' ', "_"),
        timestamp.format("%Y%m%d%H%M%S")
    )
}

/// One results-file line for a sample
pub fn format_sample_line(sample: &Sample) -> String {
    format!(
        "{}\t{:.1}\t{}\t{}",
        sample.channel.number(),
        sample.voltage,
        sample.mean_current * 1e9,
        sample.current_spread
    )
}

/// JSON report written when the run ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub matrix_name: String,
    pub results_file: PathBuf,
    pub summary: RunSummary,
}

impl RunReport {
    /// Load a report written by [`RunRecorder`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| IvError::Serialization(format!("Failed to parse run report: {}", e)))
    }
}

/// [`ResultSink`] persisting samples to disk
#[derive(Debug)]
pub struct RunRecorder {
    matrix_name: String,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    rows_written: u64,
    summary: RunSummary,
    channel_samples: usize,
}

impl RunRecorder {
    /// Create the results file in `dir` and write its header
    ///
    /// Failing here is reported to the caller, before any run starts.
    pub fn create(dir: impl AsRef<Path>, matrix_name: &str) -> Result<Self> {
        let path = dir
            .as_ref()
            .join(results_file_name(matrix_name, Local::now()));
        Self::create_at(path, matrix_name)
    }

    /// Create the results file at an explicit path
    pub fn create_at(path: impl Into<PathBuf>, matrix_name: &str) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }

        let file = File::create(&path)
            .map_err(IvError::from)
            .with_context(|| format!("Creating results file {:?}", path))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", RESULTS_HEADER)?;
        writer.flush()?;
        tracing::info!("Recording results to {:?}", path);

        Ok(Self {
            matrix_name: matrix_name.to_string(),
            path,
            writer: Some(writer),
            rows_written: 0,
            summary: RunSummary::begin(),
            channel_samples: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the JSON report goes
    pub fn report_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn write_line(&mut self, line: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = writeln!(writer, "{}", line).and_then(|_| writer.flush());
        match result {
            Ok(()) => self.rows_written += 1,
            Err(e) => {
                tracing::error!("Failed to write to {:?}, recording disabled: {}", self.path, e);
                self.writer = None;
            }
        }
    }

    fn finish(&mut self, aborted: Option<AbortReason>) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                tracing::error!("Failed to flush {:?}: {}", self.path, e);
            }
        }

        self.summary.finished_at = Utc::now();
        self.summary.aborted = aborted;
        let report = RunReport {
            matrix_name: self.matrix_name.clone(),
            results_file: self.path.clone(),
            summary: self.summary.clone(),
        };

        let report_path = self.report_path();
        let written = serde_json::to_string_pretty(&report)
            .map_err(|e| IvError::Serialization(e.to_string()))
            .and_then(|json| {
                std::fs::write(&report_path, json)
                    .map_err(IvError::from)
                    .context("Writing run report")
            });
        match written {
            Ok(()) => tracing::info!(
                "Recorded {} samples, report at {:?}",
                self.rows_written,
                report_path
            ),
            Err(e) => tracing::error!("Failed to write run report {:?}: {}", report_path, e),
        }
    }
}

impl ResultSink for RunRecorder {
    fn on_channel_started(&mut self, _channel: Channel) {
        self.channel_samples = 0;
    }

    fn on_sample(&mut self, sample: &Sample) {
        self.channel_samples += 1;
        let line = format_sample_line(sample);
        self.write_line(&line);
    }

    fn on_channel_finished(&mut self, channel: Channel, outcome: ChannelOutcome) {
        self.summary.channels.push(ChannelResult {
            channel,
            outcome,
            samples: self.channel_samples,
        });
    }

    fn on_run_finished(&mut self) {
        self.finish(None);
    }

    fn on_run_aborted(&mut self, reason: &AbortReason) {
        self.finish(Some(reason.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_results_file_name() {
        let ts = Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap();
        assert_eq!(
            results_file_name("CTA Matrix", ts),
            "CTA_Matrix_IV_20240307140509.txt"
        );
    }

    #[test]
    fn test_sample_line_format() {
        let sample = Sample {
            channel: Channel::new(0).unwrap(),
            voltage: 30.04,
            mean_current: 1.5e-8,
            current_spread: 2.5e-10,
        };
        let line = format_sample_line(&sample);
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields[0], "1");
        assert_eq!(fields[1], "30.0");
        assert!((fields[2].parse::<f64>().unwrap() - 15.0).abs() < 1e-9);
        assert_eq!(fields[3].parse::<f64>().unwrap(), 2.5e-10);
    }

    #[test]
    fn test_recorder_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.txt");
        let mut recorder = RunRecorder::create_at(&path, "Test").unwrap();
        let ch = Channel::new(2).unwrap();

        recorder.on_channel_started(ch);
        recorder.on_sample(&Sample::from_readings(ch, 20.0, &[1e-9]));
        recorder.on_sample(&Sample::from_readings(ch, 21.0, &[2e-9]));

        // Rows are on disk before the run ends
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], RESULTS_HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("3\t20.0\t"));

        recorder.on_channel_finished(ch, ChannelOutcome::Completed);
        recorder.on_run_aborted(&AbortReason::Stopped);

        let report = RunReport::load(recorder.report_path()).unwrap();
        assert_eq!(report.matrix_name, "Test");
        assert_eq!(report.summary.total_samples(), 2);
        assert_eq!(report.summary.aborted, Some(AbortReason::Stopped));
    }

    #[test]
    fn test_create_failure_names_results_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, "").unwrap();

        let err = RunRecorder::create_at(blocker.join("run.txt"), "Test").unwrap_err();
        assert!(err.to_string().starts_with("Creating results file"), "{}", err);
    }
}
