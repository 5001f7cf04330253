//! Protocol errors

use std::fmt;

use thiserror::Error;

/// An asynchronous transport failure raised after the port was opened.
///
/// These are not recoverable in place: the transport closes itself and the
/// hosting application decides whether to restart, alert or exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    /// Port the fault was raised on
    pub port: String,
    /// Description from the underlying serial stack
    pub message: String,
}

impl TransportFault {
    /// Create a fault for `port`
    pub fn new(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.port, self.message)
    }
}

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Port not open")]
    PortNotOpen,

    #[error("Failed to open {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Close failed: {0}")]
    CloseFailed(String),

    #[error("Failed to enumerate serial ports: {0}")]
    EnumerationFailed(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Fatal transport fault on {0}")]
    Fatal(TransportFault),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error means the transport can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Fatal(_))
    }
}
