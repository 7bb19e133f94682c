//! Error handling for the IV bench
//!
//! This module defines the crate-wide error type and a Result alias. A
//! compliance trip has no variant here: it is a measurement outcome
//! ([`crate::types::ChannelOutcome::ComplianceStop`]), not a failure.

use thiserror::Error;

/// Main error type for bench operations
#[derive(Error, Debug)]
pub enum IvError {
    /// Malformed voltage configuration, detected before any hardware access
    #[error("Invalid voltage range: {0}")]
    InvalidRange(String),

    /// An instrument call failed (timeout, transport error, malformed response)
    #[error("Instrument communication error ({instrument}): {message}")]
    InstrumentCommunication {
        /// Which instrument the failing call was addressed to
        instrument: String,
        /// Transport or parse failure description
        message: String,
    },

    /// A run was requested while another one is in progress
    #[error("An acquisition run is already in progress")]
    AlreadyRunning,

    /// Errors related to configuration loading/saving or validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The acquisition worker terminated abnormally
    #[error("Acquisition worker panicked")]
    WorkerPanicked,

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<IvError>,
    },
}

impl IvError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        IvError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for an instrument communication failure
    pub fn instrument(instrument: impl Into<String>, message: impl Into<String>) -> Self {
        IvError::InstrumentCommunication {
            instrument: instrument.into(),
            message: message.into(),
        }
    }

    /// Whether this error (or the error it wraps) came from an instrument
    pub fn is_instrument_error(&self) -> bool {
        match self {
            IvError::InstrumentCommunication { .. } => true,
            IvError::WithContext { source, .. } => source.is_instrument_error(),
            _ => false,
        }
    }
}

/// Result type alias for bench operations
pub type Result<T> = std::result::Result<T, IvError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IvError::InvalidRange("min 10 V > max 5 V".to_string());
        assert_eq!(err.to_string(), "Invalid voltage range: min 10 V > max 5 V");
    }

    #[test]
    fn test_error_with_context() {
        let err = IvError::instrument("source", "timeout");
        let with_ctx = err.with_context("Setting output voltage");
        assert!(with_ctx.to_string().contains("Setting output voltage"));
        assert!(with_ctx.to_string().contains("timeout"));
    }

    #[test]
    fn test_instrument_error_detection() {
        let err = IvError::instrument("matrix", "no response").with_context("closing bias path");
        assert!(err.is_instrument_error());
        assert!(!IvError::AlreadyRunning.is_instrument_error());
    }

    #[test]
    fn test_result_ext_context() {
        let result: Result<()> = Err(IvError::Config("bad".to_string()));
        let err = result.context("Loading bench config").unwrap_err();
        assert!(err.to_string().starts_with("Loading bench config"));
    }
}
