//! IC box protocol driver
//!
//! Handles the connection lifecycle and the command/response cycle with the
//! device.
//!
//! Every exchange writes a command, then polls the transport until a reply
//! terminator arrives or the timeout elapses. Methods that touch the line take
//! `&mut self`, so only one exchange can be in flight per driver. Hosts that
//! share a driver between tasks wrap it in an async mutex.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{
    commands::{self, Command},
    response,
    serial::LineSettings,
    FaultSender, PortInfo, ProtocolError, SerialBackend, SystemSerial, Transport,
    TransportFault,
};
use crate::config::DriverConfig;

/// Capacity of the fault broadcast channel
const FAULT_CHANNEL_CAPACITY: usize = 16;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Port open in progress
    Connecting,
    /// Connected and ready
    Connected,
}

/// Driver for a single IC box
pub struct IcBox {
    /// Where ports and transports come from
    backend: Arc<dyn SerialBackend>,
    /// The open line, if any
    connection: Option<Box<dyn Transport>>,
    /// Lifecycle state
    state: ConnectionState,
    /// Timing configuration
    config: DriverConfig,
    /// Fatal transport faults are published here
    faults: FaultSender,
}

impl Default for IcBox {
    fn default() -> Self {
        Self::new()
    }
}

impl IcBox {
    /// Driver over the host serial ports
    pub fn new() -> Self {
        Self::with_backend(SystemSerial)
    }

    /// Driver over a custom backend
    pub fn with_backend(backend: impl SerialBackend + 'static) -> Self {
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        Self {
            backend: Arc::new(backend),
            connection: None,
            state: ConnectionState::Disconnected,
            config: DriverConfig::default(),
            faults,
        }
    }

    /// Replace the timing configuration
    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Current timing configuration
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Get current connection state.
    ///
    /// A line that faulted after opening reports `Disconnected`.
    pub fn state(&self) -> ConnectionState {
        match self.state {
            ConnectionState::Connected if !self.is_connected() => ConnectionState::Disconnected,
            state => state,
        }
    }

    /// Whether a line is open and has not faulted
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_open())
    }

    /// Name of the port the current line was opened on
    pub fn port_name(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.port_name())
    }

    /// Receive fatal transport faults.
    ///
    /// A fault means the device was lost mid-session and cannot be recovered
    /// in place; the host decides whether to restart, alert or exit.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<TransportFault> {
        self.faults.subscribe()
    }

    /// List available serial ports
    pub async fn get_ports(&self) -> Result<Vec<PortInfo>, ProtocolError> {
        self.backend.list_ports().await
    }

    /// Open `port_name` with the fixed IC box line settings
    pub async fn open(&mut self, port_name: &str) -> Result<(), ProtocolError> {
        if self.is_connected() {
            return Err(ProtocolError::AlreadyConnected);
        }

        // Drop any line left behind by a fault
        self.connection = None;
        self.state = ConnectionState::Connecting;

        let opened = self
            .backend
            .open(port_name, &LineSettings::icbox(), self.faults.clone())
            .await;

        match opened {
            Ok(transport) => {
                self.connection = Some(transport);
                self.state = ConnectionState::Connected;
                tracing::info!(port = port_name, "connected");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                tracing::warn!(port = port_name, error = %e, "open failed");
                Err(e)
            }
        }
    }

    /// Close the line.
    ///
    /// Returns `true` if an open line was closed, `false` if there was nothing
    /// to close. The line is released even when closing reports an error.
    pub async fn close(&mut self) -> Result<bool, ProtocolError> {
        let Some(mut connection) = self.connection.take() else {
            return Ok(false);
        };
        self.state = ConnectionState::Disconnected;

        let closed = connection.close().await?;
        if closed {
            tracing::info!(port = connection.port_name(), "disconnected");
        }
        Ok(closed)
    }

    /// Send raw command text followed by CR+LF.
    ///
    /// Returns the number of bytes written, or `None` without touching the
    /// line when no connection exists.
    pub async fn send_command(&mut self, command: &str) -> Result<Option<usize>, ProtocolError> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(None);
        };

        tracing::debug!(command, "sending command");
        let written = connection.write(&commands::encode(command)).await?;
        Ok(Some(written))
    }

    /// Collect reply text until a carriage return arrives or `timeout` elapses.
    ///
    /// The terminator stays in the returned text. On timeout whatever arrived
    /// is returned, possibly nothing. Read errors end the wait early and also
    /// return the partial text.
    pub async fn receive(&mut self, timeout: Duration) -> Result<String, ProtocolError> {
        let poll_interval = self.config.poll_interval();
        let connection = match self.connection.as_mut() {
            Some(c) if c.is_open() => c,
            _ => return Err(ProtocolError::PortNotOpen),
        };

        let start = Instant::now();
        let mut text = String::new();

        loop {
            match connection.read_available() {
                Ok(bytes) => {
                    if !bytes.is_empty() {
                        tracing::trace!(chunk = %String::from_utf8_lossy(&bytes), "received");
                        text.push_str(&String::from_utf8_lossy(&bytes));
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "read failed, returning partial response");
                    break;
                }
            }

            if response::is_terminated(&text) {
                break;
            }

            tokio::time::sleep(poll_interval).await;
            if start.elapsed() >= timeout {
                tracing::debug!(
                    timeout_ms = timeout.as_millis() as u64,
                    "receive timed out"
                );
                break;
            }
        }

        tracing::debug!(response = ?text, elapsed_ms = start.elapsed().as_millis() as u64, "received");
        Ok(text)
    }

    /// Send `command` and wait for its reply.
    ///
    /// `None` means no exchange happened: the line is not open or nothing was
    /// written.
    async fn exchange(&mut self, command: &Command) -> Result<Option<String>, ProtocolError> {
        if !self.is_connected() {
            return Ok(None);
        }

        let written = self.send_command(&command.text()).await?;
        if !written.is_some_and(|n| n > 0) {
            return Ok(None);
        }

        let text = match self.receive(self.config.command_timeout()).await {
            Ok(text) => text,
            // The line faulted between the write and the first read
            Err(ProtocolError::PortNotOpen) => String::new(),
            Err(e) => return Err(e),
        };
        tracing::debug!(command = %command, response = ?text, "command response");
        Ok(Some(text))
    }

    async fn acknowledged(&mut self, command: Command) -> Result<bool, ProtocolError> {
        let text = self.exchange(&command).await?.unwrap_or_default();
        Ok(response::is_acknowledged(&text))
    }

    async fn numeric(&mut self, command: Command) -> Result<i64, ProtocolError> {
        let text = self.exchange(&command).await?.unwrap_or_default();
        Ok(response::parse_numeric(&text))
    }

    /// Firmware version text, unmodified
    pub async fn get_version_info(&mut self) -> Result<String, ProtocolError> {
        Ok(self
            .exchange(&Command::VersionInfo)
            .await?
            .unwrap_or_default())
    }

    /// Whether the line is on hook.
    ///
    /// Without an open line this reports `true`: the hook reply defaults to
    /// `"0"` when no exchange takes place.
    pub async fn get_on_hook(&mut self) -> Result<bool, ProtocolError> {
        let text = self
            .exchange(&Command::HookState)
            .await?
            .unwrap_or_else(|| response::HOOK_DEFAULT_REPLY.to_string());
        Ok(response::is_on_hook(&text))
    }

    /// Whether the device reports a live line connection
    pub async fn check_connection_status(&mut self) -> Result<bool, ProtocolError> {
        self.acknowledged(Command::ConnectionStatus).await
    }

    /// Dial `number`; `true` if the device accepted it
    pub async fn dial_number(&mut self, number: &str) -> Result<bool, ProtocolError> {
        self.acknowledged(Command::Dial(number.to_string())).await
    }

    /// Wait for device-initiated text such as a ring event.
    ///
    /// Nothing is sent. `None` uses the configured command timeout.
    pub async fn get_event(&mut self, timeout: Option<Duration>) -> Result<String, ProtocolError> {
        if !self.is_connected() {
            return Ok(String::new());
        }
        let timeout = timeout.unwrap_or_else(|| self.config.command_timeout());
        let text = self.receive(timeout).await?;
        tracing::debug!(response = ?text, "event");
        Ok(text)
    }

    /// Current RX level
    pub async fn get_rx_level(&mut self) -> Result<i64, ProtocolError> {
        self.numeric(Command::GetRxLevel).await
    }

    /// Set the RX level; `true` if the device accepted it
    pub async fn set_rx_level(&mut self, level: i32) -> Result<bool, ProtocolError> {
        self.acknowledged(Command::SetRxLevel(level)).await
    }

    /// Current RX mode
    pub async fn get_rx_mode(&mut self) -> Result<i64, ProtocolError> {
        self.numeric(Command::GetRxMode).await
    }

    /// Set the RX mode; `true` if the device accepted it
    pub async fn set_rx_mode(&mut self, mode: i32) -> Result<bool, ProtocolError> {
        self.acknowledged(Command::SetRxMode(mode)).await
    }

    /// Device id
    pub async fn get_id(&mut self) -> Result<i64, ProtocolError> {
        self.numeric(Command::GetId).await
    }

    /// Set the device id; `true` if the device accepted it
    pub async fn set_id(&mut self, id: &str) -> Result<bool, ProtocolError> {
        self.acknowledged(Command::SetId(id.to_string())).await
    }
}
