//! Simulated IC box
//!
//! An in-process [`SerialBackend`] for tests and demo runs without hardware.
//! The [`SimulatedDevice`] handle scripts replies, injects unsolicited bytes
//! (such as ring events) and injects transport failures.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use super::transport::{ChunkReceiver, Inbound};
use super::{
    serial::LineSettings, FaultSender, PortInfo, ProtocolError, SerialBackend, Transport,
    TransportFault, COMMAND_SUFFIX,
};

/// How a scripted reply is matched against a written command
#[derive(Debug, Clone, PartialEq, Eq)]
enum Match {
    Exact(String),
    Prefix(String),
}

#[derive(Debug, Clone)]
struct ScriptedReply {
    matcher: Match,
    reply: String,
    delay: Duration,
}

/// The currently open simulated line
struct Link {
    port: String,
    tx: mpsc::UnboundedSender<Inbound>,
    open: Arc<AtomicBool>,
    faults: FaultSender,
}

#[derive(Default)]
struct SimState {
    ports: Vec<PortInfo>,
    replies: Vec<ScriptedReply>,
    written: Vec<String>,
    enumeration_error: Option<String>,
    open_error: Option<String>,
    write_error: Option<String>,
    read_error: Option<String>,
    close_error: Option<String>,
    open_fault: Option<String>,
    link: Option<Link>,
}

impl Link {
    fn fault(&self, message: &str) {
        self.open.store(false, Ordering::SeqCst);
        let fault = TransportFault::new(self.port.clone(), message);
        tracing::error!(fault = %fault, "simulated transport fault");
        let _ = self.tx.send(Inbound::Fault(fault.clone()));
        let _ = self.faults.send(fault);
    }
}

impl SimState {
    fn find_reply(&self, command: &str) -> Option<ScriptedReply> {
        let exact = self
            .replies
            .iter()
            .find(|r| matches!(&r.matcher, Match::Exact(c) if c == command));
        let prefix = || {
            self.replies
                .iter()
                .filter_map(|r| match &r.matcher {
                    Match::Prefix(p) if command.starts_with(p.as_str()) => Some((p.len(), r)),
                    _ => None,
                })
                .max_by_key(|(len, _)| *len)
                .map(|(_, r)| r)
        };
        exact.or_else(prefix).cloned()
    }

    fn live_link(&self) -> Option<&Link> {
        self.link
            .as_ref()
            .filter(|link| link.open.load(Ordering::SeqCst))
    }
}

type Shared = Arc<Mutex<SimState>>;

fn lock(state: &Shared) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Backend that opens simulated IC box lines
#[derive(Clone, Default)]
pub struct SimulatedBackend {
    state: Shared,
}

impl SimulatedBackend {
    /// A backend with no ports listed and no scripted replies
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend scripted with plausible replies for demo runs
    pub fn demo() -> Self {
        let backend = Self::new();
        let device = backend.device();
        device.set_ports(vec![PortInfo::named("SIM0")]);
        device.reply_to("@CV", "ICBOX SIM 1.0\r");
        device.reply_to("@CG?", "0\r");
        device.reply_to("@CX", "F\r");
        device.reply_to("@CN?", "12\r");
        device.reply_to("@CM?", "1\r");
        device.reply_to("@CS?", "3\r");
        device.reply_to_prefix("@CI", "F\r");
        device.reply_to_prefix("@CN", "F\r");
        device.reply_to_prefix("@CM", "F\r");
        device.reply_to_prefix("@CS", "F\r");
        backend
    }

    /// Handle for scripting and inspecting the simulated device
    pub fn device(&self) -> SimulatedDevice {
        SimulatedDevice {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl SerialBackend for SimulatedBackend {
    async fn list_ports(&self) -> Result<Vec<PortInfo>, ProtocolError> {
        let state = lock(&self.state);
        if let Some(reason) = &state.enumeration_error {
            return Err(ProtocolError::EnumerationFailed(reason.clone()));
        }
        Ok(state.ports.clone())
    }

    async fn open(
        &self,
        port_name: &str,
        _settings: &LineSettings,
        faults: FaultSender,
    ) -> Result<Box<dyn Transport>, ProtocolError> {
        let mut state = lock(&self.state);
        let open_failed = |reason: &str| ProtocolError::OpenFailed {
            port: port_name.to_string(),
            reason: reason.to_string(),
        };

        if let Some(reason) = &state.open_error {
            return Err(open_failed(reason.as_str()));
        }
        if state.live_link().is_some() {
            return Err(open_failed("port is locked"));
        }

        let (tx, chunks) = ChunkReceiver::channel();
        let open = Arc::new(AtomicBool::new(true));
        let link = Link {
            port: port_name.to_string(),
            tx,
            open: Arc::clone(&open),
            faults,
        };
        if let Some(message) = &state.open_fault {
            link.fault(message);
        }
        state.link = Some(link);

        tracing::debug!(port = port_name, "simulated port opened");
        Ok(Box::new(SimTransport {
            port_name: port_name.to_string(),
            chunks,
            open,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Handle to the simulated device behind a [`SimulatedBackend`]
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Shared,
}

impl SimulatedDevice {
    /// Ports reported by `list_ports`
    pub fn set_ports(&self, ports: Vec<PortInfo>) {
        lock(&self.state).ports = ports;
    }

    /// Reply immediately when exactly `command` is written
    pub fn reply_to(&self, command: &str, reply: &str) {
        self.reply_after(command, reply, Duration::ZERO);
    }

    /// Reply after `delay` when exactly `command` is written
    pub fn reply_after(&self, command: &str, reply: &str, delay: Duration) {
        lock(&self.state).replies.push(ScriptedReply {
            matcher: Match::Exact(command.to_string()),
            reply: reply.to_string(),
            delay,
        });
    }

    /// Reply immediately to any command starting with `prefix`.
    ///
    /// Exact scripts win over prefixes, and longer prefixes win over shorter.
    pub fn reply_to_prefix(&self, prefix: &str, reply: &str) {
        lock(&self.state).replies.push(ScriptedReply {
            matcher: Match::Prefix(prefix.to_string()),
            reply: reply.to_string(),
            delay: Duration::ZERO,
        });
    }

    /// Forget all scripted replies
    pub fn clear_replies(&self) {
        lock(&self.state).replies.clear();
    }

    /// Deliver bytes to the open line as if the device sent them.
    ///
    /// Returns `false` when no line is open.
    pub fn inject(&self, bytes: impl AsRef<[u8]>) -> bool {
        let state = lock(&self.state);
        match state.live_link() {
            Some(link) => link
                .tx
                .send(Inbound::Data(bytes.as_ref().to_vec()))
                .is_ok(),
            None => false,
        }
    }

    /// Fail the open line as if the adapter was unplugged.
    ///
    /// Returns `false` when no line is open.
    pub fn raise_fault(&self, message: &str) -> bool {
        let state = lock(&self.state);
        let Some(link) = state.live_link() else {
            return false;
        };
        link.fault(message);
        true
    }

    /// Fault every line right after it opens, as if the adapter dropped
    /// out during the handshake
    pub fn fault_on_open(&self, message: &str) {
        lock(&self.state).open_fault = Some(message.to_string());
    }

    /// Make `list_ports` fail
    pub fn fail_enumeration(&self, reason: &str) {
        lock(&self.state).enumeration_error = Some(reason.to_string());
    }

    /// Make `open` fail
    pub fn fail_open(&self, reason: &str) {
        lock(&self.state).open_error = Some(reason.to_string());
    }

    /// Make writes fail
    pub fn fail_writes(&self, reason: &str) {
        lock(&self.state).write_error = Some(reason.to_string());
    }

    /// Make reads fail
    pub fn fail_reads(&self, reason: &str) {
        lock(&self.state).read_error = Some(reason.to_string());
    }

    /// Make close fail
    pub fn fail_close(&self, reason: &str) {
        lock(&self.state).close_error = Some(reason.to_string());
    }

    /// Clear every injected failure
    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.enumeration_error = None;
        state.open_error = None;
        state.write_error = None;
        state.read_error = None;
        state.close_error = None;
        state.open_fault = None;
    }

    /// Commands written so far, without the line suffix
    pub fn written(&self) -> Vec<String> {
        lock(&self.state).written.clone()
    }

    /// Whether a line is currently open
    pub fn is_open(&self) -> bool {
        lock(&self.state).live_link().is_some()
    }
}

struct SimTransport {
    port_name: String,
    chunks: ChunkReceiver,
    open: Arc<AtomicBool>,
    state: Shared,
}

impl SimTransport {
    fn deliver(&self, reply: ScriptedReply) {
        let state = lock(&self.state);
        let Some(link) = state.live_link() else {
            return;
        };
        let tx = link.tx.clone();
        let bytes = reply.reply.into_bytes();

        if reply.delay.is_zero() {
            let _ = tx.send(Inbound::Data(bytes));
        } else {
            let delay = reply.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Inbound::Data(bytes));
            });
        }
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::WriteFailed(format!(
                "{} is not open",
                self.port_name
            )));
        }

        let reply = {
            let mut state = lock(&self.state);
            if let Some(reason) = &state.write_error {
                return Err(ProtocolError::WriteFailed(reason.clone()));
            }
            let text = String::from_utf8_lossy(data);
            let command = text.strip_suffix(COMMAND_SUFFIX).unwrap_or(&text).to_string();
            let reply = state.find_reply(&command);
            state.written.push(command);
            reply
        };

        if let Some(reply) = reply {
            self.deliver(reply);
        }
        Ok(data.len())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, ProtocolError> {
        if let Some(reason) = &lock(&self.state).read_error {
            return Err(ProtocolError::IoError(std::io::Error::other(reason.clone())));
        }
        self.chunks.drain()
    }

    async fn close(&mut self) -> Result<bool, ProtocolError> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.close_error {
            return Err(ProtocolError::CloseFailed(reason.clone()));
        }

        let was_open = self.open.swap(false, Ordering::SeqCst);
        if state
            .link
            .as_ref()
            .is_some_and(|link| Arc::ptr_eq(&link.open, &self.open))
        {
            state.link = None;
        }
        self.chunks.close();
        Ok(was_open)
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    async fn open(backend: &SimulatedBackend) -> Box<dyn Transport> {
        let (faults, _) = broadcast::channel(4);
        backend
            .open("TEST", &LineSettings::icbox(), faults)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_scripted_reply() {
        let backend = SimulatedBackend::new();
        let device = backend.device();
        device.reply_to("@CV", "V1\r");

        let mut transport = open(&backend).await;
        assert_eq!(transport.write(b"@CV\r\n").await.unwrap(), 5);
        assert_eq!(transport.read_available().unwrap(), b"V1\r".to_vec());
        assert_eq!(device.written(), vec!["@CV".to_string()]);
    }

    #[tokio::test]
    async fn test_exact_reply_beats_prefix() {
        let backend = SimulatedBackend::new();
        let device = backend.device();
        device.reply_to_prefix("@CN", "F\r");
        device.reply_to("@CN?", "7\r");

        let mut transport = open(&backend).await;
        transport.write(b"@CN?\r\n").await.unwrap();
        assert_eq!(transport.read_available().unwrap(), b"7\r".to_vec());
        transport.write(b"@CN3\r\n").await.unwrap();
        assert_eq!(transport.read_available().unwrap(), b"F\r".to_vec());
    }

    #[tokio::test]
    async fn test_second_open_is_locked() {
        let backend = SimulatedBackend::new();
        let _first = open(&backend).await;
        let (faults, _) = broadcast::channel(4);
        let second = backend.open("TEST", &LineSettings::icbox(), faults).await;
        assert!(matches!(second, Err(ProtocolError::OpenFailed { .. })));
    }

    #[tokio::test]
    async fn test_close_releases_lock() {
        let backend = SimulatedBackend::new();
        let device = backend.device();
        let mut transport = open(&backend).await;
        assert!(device.is_open());

        assert!(transport.close().await.unwrap());
        assert!(!transport.close().await.unwrap());
        assert!(!device.is_open());
        assert!(!device.inject("late"));

        let _reopened = open(&backend).await;
        assert!(device.is_open());
    }

    #[tokio::test]
    async fn test_fault_is_published() {
        let backend = SimulatedBackend::new();
        let device = backend.device();
        let (faults, mut fault_rx) = broadcast::channel(4);
        let mut transport = backend
            .open("TEST", &LineSettings::icbox(), faults)
            .await
            .unwrap();

        assert!(device.raise_fault("unplugged"));
        assert!(!transport.is_open());
        assert!(transport.read_available().unwrap_err().is_fatal());
        assert!(transport.write(b"@CV\r\n").await.is_err());

        let fault = fault_rx.recv().await.unwrap();
        assert_eq!(fault, TransportFault::new("TEST", "unplugged"));
    }

    #[tokio::test]
    async fn test_fault_on_open() {
        let backend = SimulatedBackend::new();
        let device = backend.device();
        device.fault_on_open("handshake lost");

        let (faults, mut fault_rx) = broadcast::channel(4);
        let transport = backend
            .open("TEST", &LineSettings::icbox(), faults)
            .await
            .unwrap();
        assert!(!transport.is_open());
        assert!(!device.is_open());
        assert_eq!(
            fault_rx.recv().await.unwrap(),
            TransportFault::new("TEST", "handshake lost")
        );

        device.clear_failures();
        drop(transport);
        let reopened = open(&backend).await;
        assert!(reopened.is_open());
    }
}
