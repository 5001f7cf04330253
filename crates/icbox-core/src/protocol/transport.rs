//! Transport seam between the protocol driver and a serial line
//!
//! The driver only ever talks to a [`Transport`] obtained from a
//! [`SerialBackend`], so it runs the same way over real hardware
//! ([`super::SystemSerial`]) or the in-process simulator
//! ([`super::SimulatedBackend`]).

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{serial::LineSettings, PortInfo, ProtocolError, TransportFault};

/// Channel on which transports publish fatal faults
pub type FaultSender = broadcast::Sender<TransportFault>;

/// An open serial line
#[async_trait]
pub trait Transport: Send {
    /// Name of the port this transport was opened on
    fn port_name(&self) -> &str;

    /// Whether the line is open and has not faulted
    fn is_open(&self) -> bool;

    /// Write all of `data`, returning the number of bytes written
    async fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError>;

    /// Return everything received since the last call without waiting.
    ///
    /// An empty vector means nothing has arrived yet.
    fn read_available(&mut self) -> Result<Vec<u8>, ProtocolError>;

    /// Close the line. Returns `false` if it was already closed.
    async fn close(&mut self) -> Result<bool, ProtocolError>;
}

/// Source of serial ports and transports
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// List ports available on this backend
    async fn list_ports(&self) -> Result<Vec<PortInfo>, ProtocolError>;

    /// Open `port_name` with `settings`.
    ///
    /// Faults raised after the open succeeds are published on `faults`.
    async fn open(
        &self,
        port_name: &str,
        settings: &LineSettings,
        faults: FaultSender,
    ) -> Result<Box<dyn Transport>, ProtocolError>;
}

/// Item delivered from a reader to its transport
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Vec<u8>),
    Fault(TransportFault),
}

/// Receiving end of the chunk queue fed by a background reader
pub(crate) struct ChunkReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
    fault: Option<TransportFault>,
}

impl ChunkReceiver {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<Inbound>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx, fault: None })
    }

    /// Drain every queued chunk.
    ///
    /// Data queued ahead of a fault is still returned; the fault is reported
    /// once nothing else is left.
    pub(crate) fn drain(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        while self.fault.is_none() {
            match self.rx.try_recv() {
                Ok(Inbound::Data(chunk)) => out.extend_from_slice(&chunk),
                Ok(Inbound::Fault(fault)) => self.fault = Some(fault),
                Err(_) => break,
            }
        }

        match &self.fault {
            Some(fault) if out.is_empty() => Err(ProtocolError::Fatal(fault.clone())),
            _ => Ok(out),
        }
    }

    /// Drop anything still queued
    pub(crate) fn close(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}
