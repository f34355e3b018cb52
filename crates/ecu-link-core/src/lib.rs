//! # ecu-link core library
//!
//! Finds and opens the communication channel to an engine controller.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial transports with a CRC-enveloped binary packet format
//! - Concurrent port detection racing one probe per serial port
//! - The binary protocol greeting and signature check
//! - ELM327-class adapter sessions tunneling ISO-TP payloads over CAN
//!
//! ## Example
//!
//! ```rust,ignore
//! use ecu_link_core::prelude::*;
//!
//! let config = DetectorConfig::default();
//! match auto_detect(DetectorMode::BinaryProtocol, &config) {
//!     ProbeOutcome::Found(found) => println!("ECU on {}: {:?}", found.port, found.signature),
//!     ProbeOutcome::NotFound => println!("no ECU found"),
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod detect;
pub mod handshake;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::adapter::{
        AdapterInfo, AdapterSession, AdapterStream, CommandSession, FlowControlPolicy,
        ResponseMatcher,
    };
    pub use crate::config::{AdapterConfig, DetectorConfig, HandshakeConfig};
    pub use crate::detect::{
        auto_detect, detect_port, detect_port_async, DetectedPort, DetectorMode, FoundCallback,
        PortDetector, ProbeOutcome, ProbeState, Race,
    };
    pub use crate::handshake::HandshakeChecker;
    pub use crate::protocol::{PortOpener, ProtocolError, SerialOpener, Transport};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
