//! Serial Protocol Communication
//!
//! Implements the IC box ASCII control protocol.
//!
//! Commands are sent as `@C...` strings followed by CR+LF. Responses are short
//! text replies terminated by a carriage return.

pub mod commands;
mod driver;
mod error;
pub mod response;
pub mod serial;
pub mod sim;
mod transport;

pub use commands::Command;
pub use driver::{ConnectionState, IcBox};
pub use error::{ProtocolError, TransportFault};
pub use serial::{list_ports, LineSettings, PortInfo, SystemSerial};
pub use sim::{SimulatedBackend, SimulatedDevice};
pub use transport::{FaultSender, SerialBackend, Transport};

/// Fixed baud rate of the IC box serial interface
pub const BAUD_RATE: u32 = 57600;

/// Default timeout for command responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Interval between reads while waiting for a response, in milliseconds
pub const POLL_INTERVAL_MS: u64 = 50;

/// Suffix appended to every outbound command
pub const COMMAND_SUFFIX: &str = "\r\n";

/// Character that terminates an inbound response
pub const RESPONSE_TERMINATOR: char = '\r';

/// Size of the read buffer used by the background reader
pub const READ_BUFFER_SIZE: usize = 1024;
