//! Configuration module for the IV bench
//!
//! This module handles:
//! - The bench configuration file (`BenchConfig`, TOML) holding everything the
//!   operator sets up before a run: instrument addresses, sweep parameters,
//!   active channels, diagnostic thresholds and the output directory
//! - The immutable per-run snapshot ([`RunConfiguration`]) and its validation
//! - The static channel-to-relay-path table ([`connection_map`])
//!
//! # Data Location
//!
//! When no output directory is configured, results are written under the
//! platform data directory:
//! - **Linux**: `~/.local/share/matrix-iv/data/`
//! - **macOS**: `~/Library/Application Support/matrix-iv/data/`
//! - **Windows**: `%APPDATA%\matrix-iv\data\`
//!
//! # Example
//!
//! ```ignore
//! use matrix_iv::config::BenchConfig;
//!
//! let bench = BenchConfig::load("bench.toml")?;
//! let run = bench.run_configuration()?;
//! ```

pub mod connection_map;

pub use connection_map::{bias_path, channel_path, BIAS_PATH, CONNECTION_MAP};

use crate::error::{IvError, Result};
use crate::types::Channel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "matrix-iv";

/// Default bench configuration filename
pub const BENCH_CONFIG_FILE: &str = "bench.toml";

/// Default source meter address (display only, see `InstrumentConfig`)
pub const DEFAULT_SOURCE_ADDRESS: &str = "GPIB0::11::INSTR";

/// Default switch matrix address
pub const DEFAULT_MATRIX_ADDRESS: &str = "GPIB0::16::INSTR";

/// Default instrument I/O timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

// ==================== Data Directory ====================

/// Get the default results directory
pub fn default_output_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID).join("data"))
}

/// Ensure a directory exists, creating it if needed
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| {
            IvError::Config(format!("Failed to create directory {:?}: {}", dir, e))
        })?;
    }
    Ok(())
}

// ==================== Run Configuration ====================

/// Immutable snapshot of the sweep parameters, taken at run start
///
/// Voltages are in volts, the compliance limit in microamps. Channels are
/// 0-based indices; the sequencer always measures them in ascending order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub voltage_step: f64,

    pub fine_scan_enabled: bool,
    pub fine_start: f64,
    pub fine_end: f64,
    pub fine_step: f64,

    pub compliance_limit_micro_amps: f64,
    /// Abandon the rest of a channel's sweep when the source trips compliance
    pub skip_on_compliance: bool,

    /// Ramp the source back to 0 V after each channel
    pub ramp_down_enabled: bool,
    pub ramp_down_step_volts: f64,

    /// Ramp the source to 0 V before enabling the output
    pub check_zero_at_start: bool,

    pub active_channels: Vec<Channel>,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        SweepSettings::default().to_run_configuration(Channel::all().collect())
    }
}

impl RunConfiguration {
    /// Check the voltage shape invariants
    ///
    /// These are the checks the profile generator relies on; violations are
    /// always [`IvError::InvalidRange`].
    pub fn validate_voltages(&self) -> Result<()> {
        let values = [
            ("min voltage", self.min_voltage),
            ("max voltage", self.max_voltage),
            ("voltage step", self.voltage_step),
        ];
        for (name, value) in values {
            if !value.is_finite() {
                return Err(IvError::InvalidRange(format!("{} is not finite", name)));
            }
        }
        if self.voltage_step <= 0.0 {
            return Err(IvError::InvalidRange(format!(
                "voltage step must be positive, got {}",
                self.voltage_step
            )));
        }
        if self.min_voltage > self.max_voltage {
            return Err(IvError::InvalidRange(format!(
                "min voltage {} V is above max voltage {} V",
                self.min_voltage, self.max_voltage
            )));
        }

        if self.fine_scan_enabled {
            let fine = [
                ("fine start", self.fine_start),
                ("fine end", self.fine_end),
                ("fine step", self.fine_step),
            ];
            for (name, value) in fine {
                if !value.is_finite() {
                    return Err(IvError::InvalidRange(format!("{} is not finite", name)));
                }
            }
            if self.fine_step <= 0.0 {
                return Err(IvError::InvalidRange(format!(
                    "fine step must be positive, got {}",
                    self.fine_step
                )));
            }
            if self.fine_start > self.fine_end {
                return Err(IvError::InvalidRange(format!(
                    "fine start {} V is above fine end {} V",
                    self.fine_start, self.fine_end
                )));
            }
            if self.fine_start < self.min_voltage || self.fine_start > self.max_voltage {
                return Err(IvError::InvalidRange(format!(
                    "fine start {} V outside [{}, {}] V",
                    self.fine_start, self.min_voltage, self.max_voltage
                )));
            }
            if self.fine_end > self.max_voltage {
                return Err(IvError::InvalidRange(format!(
                    "fine end {} V above max voltage {} V",
                    self.fine_end, self.max_voltage
                )));
            }
        }

        Ok(())
    }

    /// Full validation, run by the sequencer before touching hardware
    pub fn validate(&self) -> Result<()> {
        self.validate_voltages()?;

        if !(self.compliance_limit_micro_amps.is_finite() && self.compliance_limit_micro_amps > 0.0)
        {
            return Err(IvError::Config(format!(
                "compliance limit must be positive, got {} uA",
                self.compliance_limit_micro_amps
            )));
        }

        let ramp_needed = self.ramp_down_enabled || self.check_zero_at_start;
        if ramp_needed
            && !(self.ramp_down_step_volts.is_finite() && self.ramp_down_step_volts > 0.0)
        {
            return Err(IvError::Config(format!(
                "ramp-down step must be positive, got {} V",
                self.ramp_down_step_volts
            )));
        }

        Ok(())
    }

    /// Active channels, ascending and without duplicates
    pub fn ordered_channels(&self) -> Vec<Channel> {
        let mut channels = self.active_channels.clone();
        channels.sort_unstable();
        channels.dedup();
        channels
    }
}

// ==================== Sweep Settings ====================

/// Sweep parameters as stored in the bench configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub voltage_step: f64,
    pub fine_scan_enabled: bool,
    pub fine_start: f64,
    pub fine_end: f64,
    pub fine_step: f64,
    pub compliance_micro_amps: f64,
    pub skip_on_compliance: bool,
    pub ramp_down_enabled: bool,
    pub ramp_down_step_volts: f64,
    pub check_zero_at_start: bool,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            min_voltage: 20.0,
            max_voltage: 38.0,
            voltage_step: 1.0,
            fine_scan_enabled: false,
            fine_start: 30.0,
            fine_end: 35.0,
            fine_step: 0.1,
            compliance_micro_amps: 105.0,
            skip_on_compliance: false,
            ramp_down_enabled: false,
            ramp_down_step_volts: 5.0,
            check_zero_at_start: false,
        }
    }
}

impl SweepSettings {
    /// Combine with a channel selection into a run snapshot
    pub fn to_run_configuration(&self, active_channels: Vec<Channel>) -> RunConfiguration {
        RunConfiguration {
            min_voltage: self.min_voltage,
            max_voltage: self.max_voltage,
            voltage_step: self.voltage_step,
            fine_scan_enabled: self.fine_scan_enabled,
            fine_start: self.fine_start,
            fine_end: self.fine_end,
            fine_step: self.fine_step,
            compliance_limit_micro_amps: self.compliance_micro_amps,
            skip_on_compliance: self.skip_on_compliance,
            ramp_down_enabled: self.ramp_down_enabled,
            ramp_down_step_volts: self.ramp_down_step_volts,
            check_zero_at_start: self.check_zero_at_start,
            active_channels,
        }
    }
}

// ==================== Instrument Config ====================

/// Where the instruments live
///
/// Addresses are `host:port` of a LAN-to-GPIB gateway. VISA resource names
/// are kept for display in the log only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// VISA name of the source meter (informational)
    pub source_resource: String,
    /// Gateway address of the source meter
    pub source_address: String,
    /// VISA name of the switching matrix (informational)
    pub matrix_resource: String,
    /// Gateway address of the switching matrix
    pub matrix_address: String,
    /// I/O timeout per instrument call
    pub timeout_ms: u64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            source_resource: DEFAULT_SOURCE_ADDRESS.to_string(),
            source_address: "127.0.0.1:1234".to_string(),
            matrix_resource: DEFAULT_MATRIX_ADDRESS.to_string(),
            matrix_address: "127.0.0.1:1235".to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

// ==================== Diagnostics ====================

/// Thresholds used to grade each channel's IV curve
///
/// Currents are in nanoamps, voltages in volts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticThresholds {
    pub voltage_before_breakdown: f64,
    pub max_current_before_breakdown_na: f64,
    pub voltage_after_breakdown: f64,
    pub current_after_breakdown_low_na: f64,
    pub current_after_breakdown_high_na: f64,
}

impl Default for DiagnosticThresholds {
    fn default() -> Self {
        Self {
            voltage_before_breakdown: 30.0,
            max_current_before_breakdown_na: 25.0,
            voltage_after_breakdown: 38.0,
            current_after_breakdown_low_na: 1.0e3,
            current_after_breakdown_high_na: 1.0e4,
        }
    }
}

// ==================== Bench Config ====================

/// Complete bench configuration, stored as TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// File format version for future compatibility
    #[serde(default = "default_config_version")]
    pub version: u32,

    /// Name of the matrix under test, used in output filenames
    #[serde(default = "default_matrix_name")]
    pub matrix_name: String,

    /// Results directory (platform data directory if unset)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Active channels, 1-based as printed on the board
    #[serde(default = "default_channels")]
    pub channels: Vec<usize>,

    #[serde(default)]
    pub sweep: SweepSettings,

    #[serde(default)]
    pub instruments: InstrumentConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticThresholds,
}

fn default_config_version() -> u32 {
    1
}

fn default_matrix_name() -> String {
    "CTA Matrix".to_string()
}

fn default_channels() -> Vec<usize> {
    Channel::all().map(Channel::number).collect()
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            version: 1,
            matrix_name: default_matrix_name(),
            output_dir: None,
            channels: default_channels(),
            sweep: SweepSettings::default(),
            instruments: InstrumentConfig::default(),
            diagnostics: DiagnosticThresholds::default(),
        }
    }
}

impl BenchConfig {
    /// Load a bench configuration from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IvError::Config(format!("Failed to read bench config {:?}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            IvError::Config(format!("Failed to parse bench config {:?}: {}", path, e))
        })
    }

    /// Load a bench configuration, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load bench config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the bench configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| IvError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            IvError::Config(format!("Failed to write bench config {:?}: {}", path, e))
        })
    }

    /// Active channels as validated [`Channel`] values
    pub fn active_channels(&self) -> Result<Vec<Channel>> {
        self.channels
            .iter()
            .map(|&n| Channel::from_number(n))
            .collect()
    }

    /// Build and validate the run snapshot
    pub fn run_configuration(&self) -> Result<RunConfiguration> {
        let config = self.sweep.to_run_configuration(self.active_channels()?);
        config.validate()?;
        Ok(config)
    }

    /// Resolve the results directory
    pub fn resolved_output_dir(&self) -> Result<PathBuf> {
        match &self.output_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_output_dir().ok_or_else(|| {
                IvError::Config("Could not determine data directory".to_string())
            }),
        }
    }
}
