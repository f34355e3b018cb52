//! Serial Protocol Communication
//!
//! Transports, port enumeration, and the CRC-enveloped packet format of the
//! binary protocol.

mod error;
pub mod mock;
pub mod packet;
pub mod serial;
pub mod transport;

pub use error::ProtocolError;
pub use packet::Packet;
pub use serial::{list_port_names, list_ports, open_port, PortInfo};
pub use transport::{InboundListener, PortOpener, SerialOpener, SerialTransport, Transport};

/// Default baud rate for direct ECU communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for binary protocol responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Maximum packet size
pub const MAX_PACKET_SIZE: usize = 8192;

/// Status byte of a successful binary protocol response
pub const TS_RESPONSE_OK: u8 = 0x00;

/// Greeting command asking the ECU for its signature
pub const TS_HELLO_COMMAND: u8 = b'S';

/// Prefix every signature of the expected firmware starts with
pub const PROTOCOL_SIGNATURE_PREFIX: &str = "rusEFI";
