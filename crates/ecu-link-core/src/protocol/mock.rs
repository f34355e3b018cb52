//! Simulated transports
//!
//! In-memory devices for tests and dry runs: a scripted responder decides what
//! the "device" answers to each write. Ready-made responders simulate an
//! ELM327-class adapter and an ECU speaking the binary protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::packet::Packet;
use super::transport::{lock, IncomingBuffer, InboundListener, PortOpener, Transport};
use super::ProtocolError;

/// Decides the device's answer to one write; each returned chunk is delivered separately
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// In-memory transport driven by a [`Responder`]
pub struct MockTransport {
    name: String,
    responder: Mutex<Option<Responder>>,
    listener: Mutex<Option<InboundListener>>,
    incoming: IncomingBuffer,
    written: Mutex<Vec<u8>>,
    closed: AtomicBool,
    fail_writes: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockTransport {
    /// A device that never answers
    pub fn silent(name: &str) -> Self {
        Self::build(name, None)
    }

    /// A device answering through `responder`
    pub fn with_responder<F>(name: &str, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        Self::build(name, Some(Box::new(responder)))
    }

    /// A simulated ELM327 adapter, optionally with echo enabled at power-up
    pub fn elm327(name: &str, echo: bool) -> Self {
        Self::build(name, Some(Elm327Sim::new(echo).into_responder()))
    }

    /// An ECU answering the greeting with `status` followed by `signature`
    pub fn ecu(name: &str, status: u8, signature: &str) -> Self {
        let mut payload = vec![status];
        payload.extend_from_slice(signature.as_bytes());
        let response = Packet::new(payload).to_bytes();
        Self::with_responder(name, move |_| vec![response.clone()])
    }

    fn build(name: &str, responder: Option<Responder>) -> Self {
        Self {
            name: name.to_string(),
            responder: Mutex::new(responder),
            listener: Mutex::new(None),
            incoming: IncomingBuffer::new(),
            written: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Deliver unsolicited bytes as if the device had sent them
    pub fn inject(&self, data: &[u8]) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let listener = lock(&self.listener);
        match listener.as_ref() {
            Some(callback) => callback(data),
            None => self.incoming.push(data),
        }
    }

    /// Make every subsequent write fail with an I/O error
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Release);
    }

    /// Everything written so far
    pub fn written(&self) -> Vec<u8> {
        lock(&self.written).clone()
    }

    /// Written bytes split on `\r`, without empty entries
    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.written())
            .split('\r')
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// How many times `close()` was called
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }
}

impl Transport for MockTransport {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn write(&self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::NotConnected);
        }
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(ProtocolError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        lock(&self.written).extend_from_slice(data);

        let replies = match lock(&self.responder).as_mut() {
            Some(responder) => responder(data),
            None => Vec::new(),
        };
        for chunk in replies {
            self.inject(&chunk);
        }
        Ok(())
    }

    fn set_inbound_listener(&self, listener: InboundListener) {
        *lock(&self.listener) = Some(listener);
    }

    fn read_packet(&self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::NotConnected);
        }
        self.incoming.read_packet(timeout)
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::AcqRel);
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.incoming.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Line-oriented ELM327 simulator.
///
/// Buffers written text until `\r`, echoes when echo is on, and answers AT
/// commands the way the real chip does (`OK`, version banner, voltage)
/// followed by the `>` prompt. Hex lines are treated as ISO-TP frames: a
/// first frame is answered with a ClearToSend flow-control frame.
pub struct Elm327Sim {
    echo: bool,
    pending: String,
    /// Version reported by `ATZ`/`ATI`
    pub version: String,
    /// Text reported by `ATRV`
    pub voltage: String,
}

impl Elm327Sim {
    /// New simulator with power-up echo setting `echo`
    pub fn new(echo: bool) -> Self {
        Self {
            echo,
            pending: String::new(),
            version: "ELM327 v1.5".to_string(),
            voltage: "12.6V".to_string(),
        }
    }

    /// Wrap the simulator into a [`Responder`]
    pub fn into_responder(mut self) -> Responder {
        Box::new(move |data: &[u8]| self.feed(data))
    }

    /// Feed written bytes, returning the chunks the adapter would send back
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.pending.push_str(&String::from_utf8_lossy(data));
        let mut out = Vec::new();
        while let Some(pos) = self.pending.find('\r') {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim_end_matches('\r').to_string();
            if line.is_empty() {
                continue;
            }
            let mut reply = String::new();
            if self.echo {
                reply.push_str(&line);
                reply.push('\r');
            }
            reply.push_str(&self.answer(&line));
            reply.push_str("\r\r>");
            out.push(reply.into_bytes());
        }
        out
    }

    fn answer(&mut self, line: &str) -> String {
        let upper = line.to_ascii_uppercase();
        match upper.as_str() {
            "ATZ" => {
                self.echo = true;
                format!("\r{}", self.version)
            }
            "ATI" => self.version.clone(),
            "ATE0" => {
                self.echo = false;
                "OK".to_string()
            }
            "ATE1" => {
                self.echo = true;
                "OK".to_string()
            }
            "ATRV" => self.voltage.clone(),
            cmd if cmd.starts_with("AT") => "OK".to_string(),
            frame if frame.chars().all(|c| c.is_ascii_hexdigit()) => {
                if frame.starts_with('1') {
                    "300000".to_string()
                } else {
                    String::new()
                }
            }
            _ => "?".to_string(),
        }
    }
}

/// Opens [`MockTransport`]s from a registry of per-port factories
#[derive(Default)]
pub struct MockOpener {
    factories: HashMap<String, Box<dyn Fn() -> MockTransport + Send + Sync>>,
    opened: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockOpener {
    /// Empty registry; every port fails to open
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the device behind `port`
    pub fn add<F>(mut self, port: &str, factory: F) -> Self
    where
        F: Fn() -> MockTransport + Send + Sync + 'static,
    {
        self.factories.insert(port.to_string(), Box::new(factory));
        self
    }

    /// Every transport opened so far
    pub fn opened(&self) -> Vec<Arc<MockTransport>> {
        lock(&self.opened).clone()
    }

    /// The transports opened for `port`
    pub fn opened_for(&self, port: &str) -> Vec<Arc<MockTransport>> {
        self.opened()
            .into_iter()
            .filter(|t| t.port_name() == port)
            .collect()
    }
}

impl PortOpener for MockOpener {
    fn open(&self, port_name: &str, _baud_rate: u32) -> Result<Arc<dyn Transport>, ProtocolError> {
        let factory = self
            .factories
            .get(port_name)
            .ok_or_else(|| ProtocolError::PortNotFound(port_name.to_string()))?;
        let transport = Arc::new(factory());
        lock(&self.opened).push(transport.clone());
        let transport: Arc<dyn Transport> = transport;
        Ok(transport)
    }
}
