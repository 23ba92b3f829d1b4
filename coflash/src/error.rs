//! Error types for coflash.

use std::io;
use thiserror::Error;

/// Result type for coflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for coflash operations.
///
/// `Io`, `Serial`, `Timeout` and `Protocol` mean a single request/response
/// exchange with the coprocessor did not complete.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No complete response arrived within the operation timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The response could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The bootloader reported a flash layout that cannot be used.
    #[error("Invalid flash geometry: {0}")]
    InvalidGeometry(String),

    /// The firmware image cannot be transferred.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// No serial device could be found.
    #[error("Device not found")]
    DeviceNotFound,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = Error::Timeout("no response to SYNC".into());
        assert_eq!(err.to_string(), "Timeout: no response to SYNC");

        let err = Error::InvalidGeometry("write size is zero".into());
        assert_eq!(err.to_string(), "Invalid flash geometry: write size is zero");
    }
}
