//! Drivers for the bench instruments
//!
//! - [`Keithley2420`] - SourceMeter used as the bias supply and ammeter
//! - [`Keithley707`] - Switching matrix routing the bias to one SiPM
//!
//! Both are generic over a [`Transport`] so they can be driven over any
//! line-oriented link, and tested against a scripted one.

use super::transport::Transport;
use super::{SwitchMatrix, VoltageSource};
use crate::config::connection_map::{bias_path, channel_path};
use crate::error::{IvError, Result};
use crate::types::Channel;

/// Keithley 2420 SourceMeter
#[derive(Debug)]
pub struct Keithley2420<T: Transport> {
    transport: T,
}

impl<T: Transport> Keithley2420<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Instrument identification string (`*IDN?`)
    pub fn identify(&mut self) -> Result<String> {
        self.transport.query("*IDN?")
    }

    /// Release the underlying transport
    pub fn into_inner(self) -> T {
        self.transport
    }
}

/// Parse the `index`-th comma-separated field of a response as a float
fn parse_field(response: &str, index: usize, instrument: &str) -> Result<f64> {
    let field = response.split(',').nth(index).ok_or_else(|| {
        IvError::instrument(
            instrument,
            format!("response {:?} has no field {}", response, index),
        )
    })?;
    field.trim().parse::<f64>().map_err(|e| {
        IvError::instrument(
            instrument,
            format!("could not parse {:?} in {:?}: {}", field, response, e),
        )
    })
}

impl<T: Transport> VoltageSource for Keithley2420<T> {
    fn set_voltage_range(&mut self, volts: f64) -> Result<()> {
        self.transport.write(&format!(":SOUR:VOLT:RANG {}", volts))
    }

    fn set_output_voltage(&mut self, volts: f64) -> Result<()> {
        self.transport.write(&format!(":SOUR:VOLT {}", volts))
    }

    fn set_compliance_micro_amps(&mut self, micro_amps: f64) -> Result<()> {
        self.transport.write(&format!(":SENS:CURR:PROT {}E-6", micro_amps))
    }

    fn enable_output(&mut self, enabled: bool) -> Result<()> {
        self.transport
            .write(if enabled { "OUTP ON" } else { "OUTP OFF" })
    }

    fn read_current_amps(&mut self) -> Result<f64> {
        // Default format element order is VOLT,CURR,RES,TIME,STAT
        let response = self.transport.query("MEAS:CURR?")?;
        parse_field(&response, 1, "Keithley 2420")
    }

    fn is_compliance_tripped(&mut self) -> Result<bool> {
        let response = self.transport.query(":SENS:CURR:PROT:TRIP?")?;
        match response.trim().chars().next() {
            Some('1') => Ok(true),
            Some('0') => Ok(false),
            _ => Err(IvError::instrument(
                "Keithley 2420",
                format!("unexpected compliance response {:?}", response),
            )),
        }
    }

    fn read_set_voltage(&mut self) -> Result<f64> {
        let response = self.transport.query("SOUR:VOLT?")?;
        parse_field(&response, 0, "Keithley 2420")
    }
}

/// Keithley 707 switching matrix
#[derive(Debug)]
pub struct Keithley707<T: Transport> {
    transport: T,
}

impl<T: Transport> Keithley707<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Instrument identification string
    pub fn identify(&mut self) -> Result<String> {
        self.transport.query("*IDN?")
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

impl<T: Transport> SwitchMatrix for Keithley707<T> {
    fn close_channel(&mut self, channel: Channel) -> Result<()> {
        tracing::debug!("Connecting {}", channel);
        self.transport
            .write(&format!("Y3E0C{}X", channel_path(channel)))
    }

    fn open_channel(&mut self, channel: Channel) -> Result<()> {
        tracing::debug!("Disconnecting {}", channel);
        self.transport
            .write(&format!("Y3E0N{}X", channel_path(channel)))
    }

    fn close_bias_path(&mut self) -> Result<()> {
        tracing::debug!("Connecting bias");
        self.transport.write(&format!("Y2E0C{}X", bias_path()))
    }

    fn open_all_paths(&mut self) -> Result<()> {
        tracing::debug!("Opening all matrix relays");
        self.transport.write("Y2E0RX")
    }
}
