//! Connection settings
//!
//! Every constant the detector and the adapter session use is a default here;
//! callers override fields directly or load a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::isotp::FlowControlPolicy;
use crate::protocol::{
    ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS, PROTOCOL_SIGNATURE_PREFIX,
    TS_HELLO_COMMAND, TS_RESPONSE_OK,
};

/// Baud rate of ELM327-class adapters
pub const ELM327_BAUD_RATE: u32 = 38400;

/// Timeout for the adapter reset/identification exchange
pub const ELM327_DETECT_TIMEOUT_MS: u64 = 2000;

/// Quiescence timeout for ordinary adapter commands
pub const ELM327_COMMAND_TIMEOUT_MS: u64 = 70;

/// Settings for talking to an OBD adapter in CAN tunneling mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Serial baud rate of the adapter
    pub baud_rate: u32,
    /// `ATSP` protocol number (6 = ISO 15765-4 CAN, 11 bit, 500 kbaud)
    pub protocol: u8,
    /// CAN ID the ECU transmits on (`ATCF`), hex
    pub rx_id: String,
    /// Receive filter mask (`ATCM`), hex
    pub id_mask: String,
    /// CAN ID we transmit on (`ATSH`), hex
    pub tx_id: String,
    /// Timeout of the reset/identification exchange
    pub detect_timeout_ms: u64,
    /// Quiescence timeout of every other command
    pub command_timeout_ms: u64,
    /// How a first frame's flow control answer is checked
    pub flow_control: FlowControlPolicy,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            baud_rate: ELM327_BAUD_RATE,
            protocol: 6,
            rx_id: "102".to_string(),
            id_mask: "FFF".to_string(),
            tx_id: "100".to_string(),
            detect_timeout_ms: ELM327_DETECT_TIMEOUT_MS,
            command_timeout_ms: ELM327_COMMAND_TIMEOUT_MS,
            flow_control: FlowControlPolicy::Relaxed,
        }
    }
}

impl AdapterConfig {
    /// [`detect_timeout_ms`](Self::detect_timeout_ms) as a `Duration`
    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.detect_timeout_ms)
    }

    /// [`command_timeout_ms`](Self::command_timeout_ms) as a `Duration`
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Settings for the binary protocol greeting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Serial baud rate for direct connections
    pub baud_rate: u32,
    /// Command byte of the greeting
    pub greeting: u8,
    /// Status byte of a successful response
    pub ok_code: u8,
    /// Text every valid signature starts with
    pub signature_prefix: String,
    /// Time allowed for the response packet
    pub timeout_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            greeting: TS_HELLO_COMMAND,
            ok_code: TS_RESPONSE_OK,
            signature_prefix: PROTOCOL_SIGNATURE_PREFIX.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl HandshakeConfig {
    /// [`timeout_ms`](Self::timeout_ms) as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings for a port race
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// How long `detect_port` waits for a winner
    pub deadline_ms: u64,
    /// Settings for [`DetectorMode::Adapter`](crate::detect::DetectorMode::Adapter) probes
    pub adapter: AdapterConfig,
    /// Settings for [`DetectorMode::BinaryProtocol`](crate::detect::DetectorMode::BinaryProtocol) probes
    pub handshake: HandshakeConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 5000,
            adapter: AdapterConfig::default(),
            handshake: HandshakeConfig::default(),
        }
    }
}

impl DetectorConfig {
    /// [`deadline_ms`](Self::deadline_ms) as a `Duration`
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Parse JSON; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json)
            .map_err(|e| ProtocolError::ConfigError(format!("invalid detector config: {}", e)))
    }

    /// Load a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Serialize as pretty JSON
    pub fn to_json_string(&self) -> Result<String, ProtocolError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("cannot serialize config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DetectorConfig::default();
        assert_eq!(config.adapter.baud_rate, 38400);
        assert_eq!(config.adapter.detect_timeout(), Duration::from_millis(2000));
        assert_eq!(config.adapter.command_timeout(), Duration::from_millis(70));
        assert_eq!(config.adapter.flow_control, FlowControlPolicy::Relaxed);
        assert_eq!(config.handshake.signature_prefix, "rusEFI");
        assert_eq!(config.handshake.ok_code, 0x00);
        assert_eq!(config.handshake.greeting, b'S');
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = DetectorConfig::from_json_str(
            r#"{ "deadline_ms": 1500, "adapter": { "tx_id": "7E0", "flow_control": "strict" } }"#,
        )
        .unwrap();
        assert_eq!(config.deadline(), Duration::from_millis(1500));
        assert_eq!(config.adapter.tx_id, "7E0");
        assert_eq!(config.adapter.rx_id, "102");
        assert_eq!(config.adapter.flow_control, FlowControlPolicy::Strict);
        assert_eq!(config.handshake, HandshakeConfig::default());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            DetectorConfig::from_json_str("{ nope"),
            Err(ProtocolError::ConfigError(_))
        ));
    }
}
