//! Serial port handling
//!
//! Provides host serial port access for the IC box: port discovery, the fixed
//! line setup and a [`Transport`] over an async serial stream.

use async_trait::async_trait;
use serialport::{DataBits, FlowControl, Parity, SerialPortInfo, SerialPortType, StopBits};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::transport::{ChunkReceiver, Inbound};
use super::{
    FaultSender, ProtocolError, SerialBackend, Transport, TransportFault, BAUD_RATE,
    READ_BUFFER_SIZE,
};

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port with a name and no USB details
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Line parameters used to open the IC box port.
///
/// The device only speaks 57600-8-N-1 without flow control, so there is no
/// public way to build other settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits per character
    pub data_bits: DataBits,
    /// Parity checking
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Flow control
    pub flow_control: FlowControl,
    /// Take an exclusive lock on the device node
    pub exclusive: bool,
    /// Read buffer size for the background reader
    pub buffer_size: usize,
}

impl LineSettings {
    /// The fixed IC box line settings
    pub fn icbox() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            exclusive: true,
            buffer_size: READ_BUFFER_SIZE,
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// De-duplicate by name and sort deterministically
fn collect_sorted(ports: impl IntoIterator<Item = PortInfo>) -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for p in ports {
        map.entry(p.name.clone()).or_insert(p);
    }
    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Result<Vec<PortInfo>, ProtocolError> {
    let found = serialport::available_ports()
        .map_err(|e| ProtocolError::EnumerationFailed(e.to_string()))?;

    #[allow(unused_mut)]
    let mut ports: Vec<PortInfo> = found.into_iter().map(PortInfo::from).collect();

    // Linux-only: USB serial adapters the API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    ports.push(PortInfo::named(format!("/dev/{}", fname)));
                }
            }
        }
    }

    Ok(collect_sorted(ports))
}

/// Open `name` as an async serial stream with `settings`
fn open_stream(name: &str, settings: &LineSettings) -> Result<SerialStream, ProtocolError> {
    let open_failed = |reason: String| ProtocolError::OpenFailed {
        port: name.to_string(),
        reason,
    };

    #[allow(unused_mut)]
    let mut stream = tokio_serial::new(name, settings.baud_rate)
        .data_bits(settings.data_bits)
        .parity(settings.parity)
        .stop_bits(settings.stop_bits)
        .flow_control(settings.flow_control)
        .open_native_async()
        .map_err(|e| open_failed(e.to_string()))?;

    #[cfg(unix)]
    stream
        .set_exclusive(settings.exclusive)
        .map_err(|e| open_failed(e.to_string()))?;

    Ok(stream)
}

/// Host serial ports via `serialport` / `tokio-serial`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerial;

#[async_trait]
impl SerialBackend for SystemSerial {
    async fn list_ports(&self) -> Result<Vec<PortInfo>, ProtocolError> {
        tokio::task::spawn_blocking(list_ports)
            .await
            .map_err(|e| ProtocolError::EnumerationFailed(e.to_string()))?
    }

    async fn open(
        &self,
        port_name: &str,
        settings: &LineSettings,
        faults: FaultSender,
    ) -> Result<Box<dyn Transport>, ProtocolError> {
        let stream = open_stream(port_name, settings)?;
        tracing::debug!(port = port_name, baud = settings.baud_rate, "serial port opened");
        Ok(Box::new(SerialTransport::spawn(
            port_name,
            stream,
            settings.buffer_size,
            faults,
        )))
    }
}

/// An open host serial port.
///
/// A background task reads the stream and queues chunks; the driver drains
/// them with [`Transport::read_available`]. The stream type defaults to the
/// host serial stream; any duplex byte stream works.
pub struct SerialTransport<S = SerialStream> {
    port_name: String,
    writer: Option<WriteHalf<S>>,
    chunks: ChunkReceiver,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl<S> SerialTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Start the background reader over `stream`
    pub fn spawn(port_name: &str, stream: S, buffer_size: usize, faults: FaultSender) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, chunks) = ChunkReceiver::channel();
        let open = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            port_name.to_string(),
            reader,
            buffer_size,
            tx,
            Arc::clone(&open),
            faults,
        ));

        Self {
            port_name: port_name.to_string(),
            writer: Some(writer),
            chunks,
            open,
            reader,
        }
    }
}

async fn read_loop<S: AsyncRead>(
    port_name: String,
    mut reader: ReadHalf<S>,
    buffer_size: usize,
    tx: mpsc::UnboundedSender<Inbound>,
    open: Arc<AtomicBool>,
    faults: FaultSender,
) {
    let mut buffer = vec![0u8; buffer_size.max(1)];

    let message = loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break "port closed by device".to_string(),
            Ok(n) => {
                tracing::trace!(
                    port = %port_name,
                    data = %String::from_utf8_lossy(&buffer[..n]),
                    "serial data"
                );
                if tx.send(Inbound::Data(buffer[..n].to_vec())).is_err() {
                    // Transport dropped
                    return;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => break e.to_string(),
        }
    };

    open.store(false, Ordering::SeqCst);
    let fault = TransportFault::new(port_name, message);
    tracing::error!(fault = %fault, "serial transport fault");
    let _ = tx.send(Inbound::Fault(fault.clone()));
    let _ = faults.send(fault);
}

#[async_trait]
impl<S> Transport for SerialTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        self.writer.is_some() && self.open.load(Ordering::SeqCst)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::WriteFailed(format!(
                "{} is not open",
                self.port_name
            )));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ProtocolError::WriteFailed("port is closed".to_string()))?;

        writer
            .write_all(data)
            .await
            .map_err(|e| ProtocolError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| ProtocolError::WriteFailed(e.to_string()))?;

        Ok(data.len())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.chunks.drain()
    }

    async fn close(&mut self) -> Result<bool, ProtocolError> {
        let was_open = self.is_open();
        let Some(mut writer) = self.writer.take() else {
            return Ok(false);
        };

        self.reader.abort();
        // The read half, and with it the OS handle and its exclusive lock,
        // is only released once the task has been dropped
        let _ = (&mut self.reader).await;
        self.open.store(false, Ordering::SeqCst);
        self.chunks.close();

        let shutdown = if was_open {
            writer.shutdown().await
        } else {
            Ok(())
        };
        drop(writer);
        shutdown.map_err(|e| ProtocolError::CloseFailed(e.to_string()))?;

        Ok(was_open)
    }
}

impl<S> Drop for SerialTransport<S> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
