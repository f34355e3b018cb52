//! Packet encoding/decoding
//!
//! Implements the CRC envelope used by the binary protocol.
//!
//! Packet format:
//! - 2 bytes: Payload length (big-endian)
//! - N bytes: Payload (first payload byte is the command or the status code)
//! - 4 bytes: CRC32 (of payload only, NOT length+payload)

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;

use super::{ProtocolError, MAX_PACKET_SIZE};

/// Size of the length prefix
pub const HEADER_SIZE: usize = 2;

/// Size of the CRC trailer
pub const CRC_SIZE: usize = 4;

/// A protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet payload
    pub payload: Vec<u8>,
    /// CRC32 of the payload only
    pub crc: u32,
}

impl Packet {
    /// Create a new packet with the given payload
    pub fn new(payload: Vec<u8>) -> Self {
        let crc = calculate_crc(&payload);
        Self { payload, crc }
    }

    /// Create a packet carrying a single command byte
    pub fn command(cmd: u8) -> Self {
        Self::new(vec![cmd])
    }

    /// Decode a packet from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(ProtocolError::InvalidResponse);
        }

        let length = payload_length(&data[..HEADER_SIZE])?;

        if data.len() < HEADER_SIZE + length + CRC_SIZE {
            return Err(ProtocolError::InvalidResponse);
        }

        let payload = data[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        let received_crc =
            BigEndian::read_u32(&data[HEADER_SIZE + length..HEADER_SIZE + length + CRC_SIZE]);
        let expected_crc = calculate_crc(&payload);

        if received_crc != expected_crc {
            return Err(ProtocolError::CrcMismatch {
                expected: expected_crc,
                actual: received_crc,
            });
        }

        Ok(Self {
            payload,
            crc: received_crc,
        })
    }

    /// Encode the packet to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());

        let mut len_bytes = [0u8; HEADER_SIZE];
        BigEndian::write_u16(&mut len_bytes, self.payload.len() as u16);
        bytes.extend_from_slice(&len_bytes);

        bytes.extend_from_slice(&self.payload);

        let mut crc_bytes = [0u8; CRC_SIZE];
        BigEndian::write_u32(&mut crc_bytes, calculate_crc(&self.payload));
        bytes.extend_from_slice(&crc_bytes);

        bytes
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CRC_SIZE
    }

    /// Leading status byte of a response packet
    pub fn status(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Payload after the status byte
    pub fn body(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or(&[])
    }
}

/// Read and validate the 2-byte length prefix
pub fn payload_length(header: &[u8]) -> Result<usize, ProtocolError> {
    if header.len() < HEADER_SIZE {
        return Err(ProtocolError::InvalidResponse);
    }
    let length = BigEndian::read_u16(&header[..HEADER_SIZE]) as usize;
    if length > MAX_PACKET_SIZE {
        return Err(ProtocolError::BufferOverflow);
    }
    Ok(length)
}

/// CRC32 of the payload
fn calculate_crc(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}
