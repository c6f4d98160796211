use std::time::Duration;

use thiserror::Error;

use crate::session::ConnectionState;

/// A runtime permission the platform must grant before the radio may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Permission to scan for and connect to Bluetooth peers
    Radio,
    /// Proximity/location permission, required by some platforms for peer discovery
    Location,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::Radio => write!(f, "bluetooth"),
            Permission::Location => write!(f, "location"),
        }
    }
}

/// Coarse reason a scan strategy could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailure {
    /// The platform refused because another scan holds the radio
    AlreadyActive,
    /// The strategy is not available on this platform
    Unsupported,
    /// The adapter or its driver reported an error
    Adapter,
}

impl std::fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanFailure::AlreadyActive => write!(f, "scan already active"),
            ScanFailure::Unsupported => write!(f, "scan not supported"),
            ScanFailure::Adapter => write!(f, "adapter error"),
        }
    }
}

/// The error type for the `battmon` library.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("{0} permission not granted")]
    PermissionDenied(Permission),

    #[error("No bluetooth adapter available")]
    RadioUnavailable,

    #[error("Bluetooth is disabled")]
    RadioDisabled,

    #[error("Failed to start scan: {0}")]
    ScanStartFailed(ScanFailure),

    #[error("Device does not speak the battery monitor protocol: {0}")]
    ProtocolMismatch(String),

    #[error("Characteristic write failed: {0}")]
    WriteFailed(String),

    #[error("Enabling notifications failed: {0}")]
    DescriptorWriteFailed(String),

    #[error("Frame could not be decrypted")]
    DecryptFailed,

    #[error("Invalid frame length: expected 16 bytes, got {0}")]
    InvalidFrameLength(usize),

    #[error("Frame header mismatch")]
    InvalidHeader,

    #[error("Truncated frame: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Link disconnected")]
    LinkDisconnected,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Client has been disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::PermissionDenied(Permission::Location);
        assert_eq!(err.to_string(), "location permission not granted");

        let err = Error::InvalidFrameLength(15);
        assert_eq!(err.to_string(), "Invalid frame length: expected 16 bytes, got 15");

        let err = Error::InvalidState {
            operation: "connect",
            state: ConnectionState::Ready,
        };
        assert_eq!(err.to_string(), "Cannot connect while Ready");

        let err = Error::ScanStartFailed(ScanFailure::Adapter);
        assert_eq!(err.to_string(), "Failed to start scan: adapter error");
    }
}
