//! Transports
//!
//! A [`Transport`] is an opened, bidirectional byte stream bound to one
//! physical port. Inbound bytes are either pushed to an attached listener
//! (the text-oriented adapter path) or queued for [`Transport::read_packet`]
//! (the binary protocol path).

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::{debug, info, warn};

use super::packet::{self, Packet, CRC_SIZE, HEADER_SIZE};
use super::{serial, ProtocolError};

/// Callback receiving raw inbound bytes in delivery order
pub type InboundListener = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Reader thread poll interval when no bytes are pending
const READER_POLL_MS: u64 = 10;

/// Bidirectional byte stream bound to one port.
///
/// `close()` is idempotent: the first call releases the device handle and
/// every later call is a no-op. Nothing is written or delivered after close.
pub trait Transport: Send + Sync {
    /// Name of the port this transport is bound to
    fn port_name(&self) -> &str;

    /// Write all bytes to the device
    fn write(&self, data: &[u8]) -> Result<(), ProtocolError>;

    /// Attach the callback that receives inbound bytes, replacing any previous one
    fn set_inbound_listener(&self, listener: InboundListener);

    /// Read one CRC-enveloped response packet and return its payload
    fn read_packet(&self, timeout: Duration) -> Result<Vec<u8>, ProtocolError>;

    /// Release the device handle
    fn close(&self);

    /// True once closed, or once the underlying device failed
    fn is_closed(&self) -> bool;
}

/// Opens transports by port name.
///
/// The detector uses this seam so probes can run against real serial ports or
/// simulated devices alike.
pub trait PortOpener: Send + Sync {
    /// Open `port_name` at `baud_rate`
    fn open(&self, port_name: &str, baud_rate: u32) -> Result<Arc<dyn Transport>, ProtocolError>;
}

/// Opens [`SerialTransport`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, port_name: &str, baud_rate: u32) -> Result<Arc<dyn Transport>, ProtocolError> {
        let transport: Arc<dyn Transport> = SerialTransport::open(port_name, baud_rate)?;
        Ok(transport)
    }
}

/// Queue of inbound bytes not claimed by a listener
#[derive(Default)]
pub struct IncomingBuffer {
    state: Mutex<IncomingState>,
    available: Condvar,
}

#[derive(Default)]
struct IncomingState {
    bytes: VecDeque<u8>,
    closed: bool,
}

impl IncomingBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and wake readers
    pub fn push(&self, data: &[u8]) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.bytes.extend(data.iter().copied());
        self.available.notify_all();
    }

    /// Drop queued bytes
    pub fn clear(&self) {
        lock(&self.state).bytes.clear();
    }

    /// Refuse further bytes and wake readers so they can give up
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.bytes.clear();
        self.available.notify_all();
    }

    /// Number of queued bytes
    pub fn len(&self) -> usize {
        lock(&self.state).bytes.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until `n` bytes are queued (or the deadline passes) and take them
    pub fn read_exact(&self, n: usize, deadline: Instant) -> Result<Vec<u8>, ProtocolError> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Err(ProtocolError::NotConnected);
            }
            if state.bytes.len() >= n {
                return Ok(state.bytes.drain(..n).collect());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ProtocolError::Timeout);
            }
            state = match self.available.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Read one `[len][payload][crc]` packet, returning the verified payload
    pub fn read_packet(&self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        let header = self.read_exact(HEADER_SIZE, deadline)?;
        let length = packet::payload_length(&header)?;
        let rest = self.read_exact(length + CRC_SIZE, deadline)?;

        let mut raw = header;
        raw.extend_from_slice(&rest);
        Ok(Packet::from_bytes(&raw)?.payload)
    }
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SerialShared {
    closed: AtomicBool,
    failed: AtomicBool,
    listener: Mutex<Option<InboundListener>>,
    incoming: IncomingBuffer,
}

impl SerialShared {
    fn deliver(&self, chunk: &[u8]) {
        let listener = lock(&self.listener);
        match listener.as_ref() {
            Some(callback) => callback(chunk),
            None => self.incoming.push(chunk),
        }
    }
}

/// Transport over a local serial port.
///
/// A dedicated reader thread polls the port and dispatches inbound chunks.
pub struct SerialTransport {
    name: String,
    port: Mutex<Option<Box<dyn SerialPort>>>,
    shared: Arc<SerialShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    /// Open `name` at `baud_rate` and start the reader thread
    pub fn open(name: &str, baud_rate: u32) -> Result<Arc<Self>, ProtocolError> {
        let port = serial::open_port(name, baud_rate)?;
        let reader_port = port
            .try_clone()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;

        let shared = Arc::new(SerialShared {
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            listener: Mutex::new(None),
            incoming: IncomingBuffer::new(),
        });

        let reader_shared = shared.clone();
        let thread_name = format!("serial-rx {}", name);
        let reader = thread::Builder::new()
            .name(thread_name)
            .spawn(move || reader_loop(reader_port, reader_shared))?;

        info!("Opened {} at {} baud", name, baud_rate);
        Ok(Arc::new(Self {
            name: name.to_string(),
            port: Mutex::new(Some(port)),
            shared,
            reader: Mutex::new(Some(reader)),
        }))
    }
}

fn reader_loop(mut port: Box<dyn SerialPort>, shared: Arc<SerialShared>) {
    let mut buffer = [0u8; 512];
    while !shared.closed.load(Ordering::Acquire) {
        let available = match port.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => {
                warn!("serial reader: bytes_to_read failed: {}", e);
                break;
            }
        };
        if available == 0 {
            thread::sleep(Duration::from_millis(READER_POLL_MS));
            continue;
        }

        let to_read = available.min(buffer.len());
        match port.read(&mut buffer[..to_read]) {
            Ok(0) => {
                debug!("serial reader: EOF");
                break;
            }
            Ok(n) => {
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                shared.deliver(&buffer[..n]);
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(e) => {
                warn!("serial reader: read failed: {}", e);
                break;
            }
        }
    }

    if !shared.closed.load(Ordering::Acquire) {
        shared.failed.store(true, Ordering::Release);
        shared.incoming.close();
    }
}

impl Transport for SerialTransport {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn write(&self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::NotConnected);
        }
        let mut guard = lock(&self.port);
        let port = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        port.write_all(data)
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        port.flush()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))
    }

    fn set_inbound_listener(&self, listener: InboundListener) {
        *lock(&self.shared.listener) = Some(listener);
    }

    fn read_packet(&self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::NotConnected);
        }
        self.shared.incoming.read_packet(timeout)
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing {}", self.name);
        self.shared.incoming.close();
        lock(&self.port).take();

        if let Some(handle) = lock(&self.reader).take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.shared.failed.load(Ordering::Acquire)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
