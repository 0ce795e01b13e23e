//! Error handling for the XCP calibration client
//!
//! This module defines custom error types and a Result alias for use
//! throughout the crate. The taxonomy distinguishes transport-level faults
//! (retried only at frame level) from fatal protocol and setup errors.

use thiserror::Error;

/// Main error type for XCP client operations
#[derive(Error, Debug)]
pub enum XcpError {
    /// Transport-level errors on the serial link
    #[error("Link error: {0}")]
    Link(String),

    /// A command response did not arrive in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The slave answered a command with an error packet
    #[error("Slave error 0x{code:02X} ({name}) for command 0x{command:02X}")]
    Slave {
        /// XCP error code from the slave
        code: u8,
        /// Symbolic name of the error code
        name: &'static str,
        /// Command code the slave rejected
        command: u8,
    },

    /// The slave violates a protocol assumption (granularity mode,
    /// unsupported DAQ configuration type, short response, ...)
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The remote unit lacks a capability this client requires
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    /// The slave rejected a DAQ list/ODT/entry allocation during setup
    #[error("Measurement setup failed: {0}")]
    Setup(String),

    /// A signal's address or size violates the slave's addressing granularity
    #[error("Granularity error: {0}")]
    Granularity(String),

    /// A signal does not fit into one transmission slot
    #[error("Size error: {0}")]
    Size(String),

    /// An identifier does not match any parameter or signal in the database
    #[error("Not found: {0}")]
    NotFound(String),

    /// A physical value cannot be inverted through its encoding rule
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The operation is not allowed for this symbol kind (e.g. ASCII write)
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The operation is known but deliberately unimplemented (curve/map)
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Errors related to configuration or database loading
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<XcpError>,
    },
}

impl XcpError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        XcpError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True for errors that only affect a single sample and must not
    /// tear down an acquisition loop
    pub fn is_transient(&self) -> bool {
        matches!(self, XcpError::Link(_) | XcpError::Timeout(_))
    }
}

impl From<serialport::Error> for XcpError {
    fn from(err: serialport::Error) -> Self {
        XcpError::Link(err.to_string())
    }
}

impl From<serde_json::Error> for XcpError {
    fn from(err: serde_json::Error) -> Self {
        XcpError::Config(err.to_string())
    }
}

/// Result type alias for XCP client operations
pub type Result<T> = std::result::Result<T, XcpError>;

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
        let err = XcpError::NotFound("engine/RPM".to_string());
        assert_eq!(err.to_string(), "Not found: engine/RPM");
    }

    #[test]
    fn test_error_with_context() {
        let err = XcpError::Setup("ALLOC_DAQ rejected".to_string());
        let with_ctx = err.with_context("setup_measurement");
        assert!(with_ctx.to_string().contains("setup_measurement"));
    }

    #[test]
    fn test_slave_error_display() {
        let err = XcpError::Slave {
            code: 0x25,
            name: "ERR_ACCESS_LOCKED",
            command: 0xF4,
        };
        assert!(err.to_string().contains("0x25"));
        assert!(err.to_string().contains("ERR_ACCESS_LOCKED"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(XcpError::Link("read failed".into()).is_transient());
        assert!(XcpError::Timeout("no response".into()).is_transient());
        assert!(!XcpError::Setup("rejected".into()).is_transient());
    }
}
