//! Protocol errors

use thiserror::Error;

/// Errors that can occur while probing, framing, or talking to a device
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Opening or configuring the port failed
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Nothing usable arrived in time
    #[error("Connection timeout")]
    Timeout,

    /// The transport was closed
    #[error("Transport is closed")]
    NotConnected,

    /// Response too short or malformed
    #[error("Invalid response from ECU")]
    InvalidResponse,

    /// Packet checksum did not verify
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// Checksum computed over the payload
        expected: u32,
        /// Checksum carried by the packet
        actual: u32,
    },

    /// Signature lacks the expected prefix
    #[error("Signature mismatch: expected prefix '{expected}', got '{actual}'")]
    SignatureMismatch {
        /// Required prefix
        expected: String,
        /// Signature received
        actual: String,
    },

    /// Non-OK status byte
    #[error("ECU returned error code: {0:#04x}")]
    EcuError(u8),

    /// Packet length beyond the protocol maximum
    #[error("Buffer overflow: packet too large")]
    BufferOverflow,

    /// Adapter answer rejected by the matcher
    #[error("Response did not match: {0:?}")]
    NoMatch(String),

    /// Adapter configuration command not acknowledged
    #[error("Adapter rejected command '{command}'")]
    AdapterCommand {
        /// The rejected command
        command: String,
    },

    /// Text that does not decode as a CAN frame
    #[error("Invalid ISO-TP frame: {0}")]
    InvalidFrame(String),

    /// Payload beyond the 12-bit ISO-TP length
    #[error("Payload of {0} bytes exceeds the ISO-TP limit of 4095")]
    PayloadTooLarge(usize),

    /// Receiver refused or garbled flow control
    #[error("Flow control not granted: {0}")]
    FlowControl(String),

    /// Consecutive frame with the wrong sequence number
    #[error("Consecutive frame out of sequence: expected {expected:#x}, got {actual:#x}")]
    SequenceMismatch {
        /// Sequence number due next
        expected: u8,
        /// Sequence number received
        actual: u8,
    },

    /// Frame that does not fit the transfer state
    #[error("Unexpected ISO-TP frame: {0}")]
    UnexpectedFrame(String),

    /// No such port
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Unreadable configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for errors that mean "nothing (usable) arrived in time".
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout)
    }

    /// True when a device answered, just not the way we expected.
    ///
    /// Distinct from timeouts and I/O failures: it proves something is
    /// attached to the port.
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(
            self,
            ProtocolError::EcuError(_)
                | ProtocolError::SignatureMismatch { .. }
                | ProtocolError::NoMatch(_)
                | ProtocolError::AdapterCommand { .. }
                | ProtocolError::CrcMismatch { .. }
                | ProtocolError::InvalidResponse
        )
    }

    /// True for ISO-TP reassembly desynchronization.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            ProtocolError::SequenceMismatch { .. } | ProtocolError::UnexpectedFrame(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ProtocolError::Timeout.is_timeout());
        assert!(!ProtocolError::Timeout.is_protocol_mismatch());
        assert!(ProtocolError::EcuError(0x80).is_protocol_mismatch());
        assert!(ProtocolError::SequenceMismatch {
            expected: 2,
            actual: 3
        }
        .is_desync());
        assert!(!ProtocolError::NotConnected.is_protocol_mismatch());
    }

    #[test]
    fn test_display() {
        let err = ProtocolError::EcuError(0x83);
        assert_eq!(err.to_string(), "ECU returned error code: 0x83");
    }
}
