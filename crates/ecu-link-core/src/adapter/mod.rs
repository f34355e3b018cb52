//! OBD adapter tunneling
//!
//! ELM327-class adapters speak a line-based AT command set. After a reset
//! and a handful of configuration commands they pass raw CAN frames through,
//! which carry the ECU's serial stream as ISO-TP payloads.

pub mod isotp;
pub mod line;
pub mod matcher;
pub mod session;

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::AdapterConfig;
use crate::protocol::{PortOpener, ProtocolError, Transport};
use isotp::{FrameSink, IsoTpFrame, IsoTpReassembler, Reassembly};
use matcher::{Literal, RegexMatcher};

pub use isotp::{FlowControlPolicy, MAX_PAYLOAD_LEN};
pub use line::{LineBuffer, LineFramer};
pub use matcher::ResponseMatcher;
pub use session::CommandSession;

/// Adapter identity reported by [`AdapterSession::start`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Identification banner, e.g. `ELM327 v1.5`
    pub version: String,
    /// Supply voltage as reported by `ATRV`, without the unit
    pub voltage: Option<String>,
}

/// A configured adapter tunneling ISO-TP payloads to the ECU
pub struct AdapterSession {
    session: CommandSession,
    config: AdapterConfig,
    /// Received lines not yet consumed by `receive_payload`
    pending: VecDeque<String>,
}

impl AdapterSession {
    /// Attach to an open transport
    pub fn new(transport: Arc<dyn Transport>, config: AdapterConfig) -> Self {
        Self {
            session: CommandSession::new(transport),
            config,
            pending: VecDeque::new(),
        }
    }

    /// Open `port_name` at the adapter baud rate and attach to it
    pub fn open(
        opener: &dyn PortOpener,
        port_name: &str,
        config: AdapterConfig,
    ) -> Result<Self, ProtocolError> {
        let transport = opener.open(port_name, config.baud_rate)?;
        Ok(Self::new(transport, config))
    }

    /// Quick presence check: is an adapter answering on `port_name`?
    ///
    /// The port is always closed again before returning.
    pub fn check_connection(opener: &dyn PortOpener, port_name: &str, config: &AdapterConfig) -> bool {
        Self::check_connection_with(opener, port_name, config, |_, _| {})
    }

    /// Like [`check_connection`](Self::check_connection), handing the
    /// still-open transport and the adapter's banner to `on_found` before
    /// the port is closed.
    pub fn check_connection_with<F>(
        opener: &dyn PortOpener,
        port_name: &str,
        config: &AdapterConfig,
        on_found: F,
    ) -> bool
    where
        F: FnOnce(&dyn Transport, &str),
    {
        let mut adapter = match Self::open(opener, port_name, config.clone()) {
            Ok(adapter) => adapter,
            Err(e) => {
                debug!("{}: cannot open: {}", port_name, e);
                return false;
            }
        };
        let version = adapter.detect();
        if let Some(version) = &version {
            on_found(adapter.session.transport().as_ref(), version);
        }
        adapter.close();
        match version {
            Some(version) => {
                info!("{}: found {}", port_name, version);
                true
            }
            None => false,
        }
    }

    /// Name of the port the adapter is attached to
    pub fn port_name(&self) -> &str {
        self.session.transport().port_name()
    }

    /// Adapter settings in use
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// The underlying command session
    pub fn session(&mut self) -> &mut CommandSession {
        &mut self.session
    }

    /// Reset the adapter and read its identification banner
    pub fn detect(&mut self) -> Option<String> {
        self.try_detect().ok()
    }

    fn try_detect(&mut self) -> Result<String, ProtocolError> {
        self.session
            .try_send("ATZ", &RegexMatcher::elm_version(), self.config.detect_timeout())
    }

    /// Switch a detected adapter into CAN pass-through mode.
    ///
    /// Returns the supply voltage if the adapter reports one.
    pub fn configure(&mut self) -> Result<Option<String>, ProtocolError> {
        self.command("ATD")?;
        self.command("ATE0")?;
        self.session.set_echo_enabled(false);
        self.command(&format!("ATSP{}", self.config.protocol))?;
        self.command(&format!("ATCF {}", self.config.rx_id))?;
        self.command(&format!("ATCM {}", self.config.id_mask))?;
        self.command(&format!("ATSH {}", self.config.tx_id))?;
        // raw frames: no PCI bytes added or stripped by the adapter
        self.command("ATCAF0")?;

        let voltage = self.session.send(
            "ATRV",
            &RegexMatcher::voltage(),
            self.config.command_timeout(),
        );
        match &voltage {
            Some(v) => info!("{}: adapter voltage {}V", self.port_name(), v),
            None => warn!("{}: adapter did not report its voltage", self.port_name()),
        }
        Ok(voltage)
    }

    /// Detect and configure
    pub fn start(&mut self) -> Result<AdapterInfo, ProtocolError> {
        let version = self.try_detect()?;
        info!("{}: {}", self.port_name(), version);
        let voltage = self.configure()?;
        Ok(AdapterInfo { version, voltage })
    }

    fn command(&mut self, command: &str) -> Result<(), ProtocolError> {
        let timeout = self.config.command_timeout();
        match self.session.try_send(command, &Literal::ok(), timeout) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("{}: {} failed: {}", self.port_name(), command, e);
                Err(ProtocolError::AdapterCommand {
                    command: command.to_string(),
                })
            }
        }
    }

    /// Send one payload to the ECU as ISO-TP frames
    pub fn send_payload(&mut self, payload: &[u8]) -> Result<usize, ProtocolError> {
        self.session.discard_lines();
        let mut sink = AdapterSink {
            session: &self.session,
            timeout: self.config.command_timeout(),
        };
        isotp::segment_and_send(payload, &mut sink, self.config.flow_control)
    }

    /// Receive one payload from the ECU, granting flow control as needed.
    ///
    /// Lines that arrive after the payload completes are kept for the next call.
    pub fn receive_payload(&mut self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        let mut reassembler = IsoTpReassembler::new();
        loop {
            if self.pending.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(ProtocolError::Timeout);
                }
                let lines = self
                    .session
                    .wait_lines(remaining, self.config.command_timeout())?;
                self.pending.extend(lines);
            }
            while let Some(line) = self.pending.pop_front() {
                let frame = match IsoTpFrame::from_hex(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("{}: skipping {:?}: {}", self.port_name(), line, e);
                        continue;
                    }
                };
                debug!("isotp rx: {}", line);
                match reassembler.push(frame)? {
                    Reassembly::Complete(payload) => return Ok(payload),
                    Reassembly::NeedFlowControl => {
                        self.session
                            .write_line(&IsoTpFrame::clear_to_send().to_hex())?;
                    }
                    Reassembly::InProgress => {}
                }
            }
        }
    }

    /// Close the transport
    pub fn close(&self) {
        self.session.transport().close();
    }
}

struct AdapterSink<'a> {
    session: &'a CommandSession,
    timeout: Duration,
}

impl FrameSink for AdapterSink<'_> {
    fn send_line(&mut self, hex: &str) -> Result<(), ProtocolError> {
        self.session.write_line(hex)
    }

    fn receive_flow_control(&mut self) -> Result<Vec<String>, ProtocolError> {
        self.session.collect(self.timeout)
    }
}

/// Size of the [`AdapterStream`] output buffer; one full ISO-TP payload
pub const STREAM_BUFFER_SIZE: usize = MAX_PAYLOAD_LEN;

/// Buffered byte stream over an adapter session.
///
/// Written bytes are collected and sent as one ISO-TP payload on `flush`, or
/// as soon as the buffer fills up.
pub struct AdapterStream {
    adapter: AdapterSession,
    out: Vec<u8>,
}

impl AdapterStream {
    /// Wrap a started adapter
    pub fn new(adapter: AdapterSession) -> Self {
        Self {
            adapter,
            out: Vec::with_capacity(STREAM_BUFFER_SIZE),
        }
    }

    /// Bytes waiting for the next flush
    pub fn buffered(&self) -> usize {
        self.out.len()
    }

    /// Read one payload from the ECU
    pub fn read_payload(&mut self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        self.adapter.receive_payload(timeout)
    }

    /// The wrapped adapter
    pub fn adapter(&mut self) -> &mut AdapterSession {
        &mut self.adapter
    }

    /// Give back the adapter; unflushed bytes are dropped
    pub fn into_inner(self) -> AdapterSession {
        self.adapter
    }

    /// Send the buffered bytes; they stay buffered if the send fails
    fn send_buffer(&mut self) -> Result<(), ProtocolError> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.adapter.send_payload(&self.out)?;
        self.out.clear();
        Ok(())
    }
}

impl io::Write for AdapterStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.out.len() == STREAM_BUFFER_SIZE {
            self.send_buffer().map_err(io::Error::other)?;
        }
        let take = buf.len().min(STREAM_BUFFER_SIZE - self.out.len());
        self.out.extend_from_slice(&buf[..take]);
        if self.out.len() == STREAM_BUFFER_SIZE {
            // the bytes are accepted either way; a failed send is retried on the next write or flush
            if let Err(e) = self.send_buffer() {
                warn!("{}: sending full buffer failed: {}", self.adapter.port_name(), e);
            }
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffer().map_err(io::Error::other)
    }
}
