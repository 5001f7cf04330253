//! # IcBox Core Library
//!
//! Core functionality for driving IC box telephony interfaces.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial port discovery and the fixed 57600-8-N-1 line setup
//! - A carriage-return framed command/response driver
//! - The IC box command vocabulary (hook, dial, RX level/mode, id, events)
//! - A simulated device for tests and demo runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use icbox_core::protocol::IcBox;
//!
//! let mut icbox = IcBox::new();
//! icbox.open("/dev/ttyUSB0").await?;
//!
//! let level = icbox.get_rx_level().await?;
//! println!("RX level: {}", level);
//!
//! icbox.close().await?;
//! ```

pub mod config;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::DriverConfig;
    pub use crate::protocol::{
        ConnectionState, IcBox, PortInfo, ProtocolError, SerialBackend, SimulatedBackend,
        SimulatedDevice, SystemSerial, Transport, TransportFault,
    };
}

/// Library version, also reported by the `icbox` binary
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
