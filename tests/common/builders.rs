//! Test data builders for creating test objects

use matrix_iv::{Channel, RunConfiguration};

/// Builder for run configurations with a short coarse sweep
pub struct RunConfigBuilder {
    config: RunConfiguration,
}

impl RunConfigBuilder {
    /// 20-23 V in 1 V steps on channel 1, no compliance skip, no ramps
    pub fn new() -> Self {
        Self {
            config: RunConfiguration {
                min_voltage: 20.0,
                max_voltage: 23.0,
                voltage_step: 1.0,
                fine_scan_enabled: false,
                skip_on_compliance: false,
                ramp_down_enabled: false,
                check_zero_at_start: false,
                active_channels: vec![Channel::new(0).unwrap()],
                ..RunConfiguration::default()
            },
        }
    }

    pub fn voltages(mut self, min: f64, max: f64, step: f64) -> Self {
        self.config.min_voltage = min;
        self.config.max_voltage = max;
        self.config.voltage_step = step;
        self
    }

    pub fn fine_scan(mut self, start: f64, end: f64, step: f64) -> Self {
        self.config.fine_scan_enabled = true;
        self.config.fine_start = start;
        self.config.fine_end = end;
        self.config.fine_step = step;
        self
    }

    /// Active channels by 0-based index
    pub fn channels(mut self, indices: &[usize]) -> Self {
        self.config.active_channels = indices.iter().map(|&i| Channel::new(i).unwrap()).collect();
        self
    }

    pub fn skip_on_compliance(mut self, skip: bool) -> Self {
        self.config.skip_on_compliance = skip;
        self
    }

    pub fn ramp_down(mut self, step_volts: f64) -> Self {
        self.config.ramp_down_enabled = true;
        self.config.ramp_down_step_volts = step_volts;
        self
    }

    pub fn check_zero_at_start(mut self, step_volts: f64) -> Self {
        self.config.check_zero_at_start = true;
        self.config.ramp_down_step_volts = step_volts;
        self
    }

    pub fn build(self) -> RunConfiguration {
        self.config
    }
}

impl Default for RunConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
