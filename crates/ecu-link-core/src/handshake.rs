//! Binary protocol greeting
//!
//! Proves that a port really hosts the expected firmware: the ECU must answer
//! the greeting with an OK status followed by a signature carrying the
//! firmware's prefix.

use tracing::{debug, info};

use crate::config::HandshakeConfig;
use crate::protocol::{Packet, PortOpener, ProtocolError, Transport};

/// Sends the greeting and validates the answer
#[derive(Debug, Clone, Default)]
pub struct HandshakeChecker {
    config: HandshakeConfig,
}

impl HandshakeChecker {
    /// Checker using `config`
    pub fn new(config: HandshakeConfig) -> Self {
        Self { config }
    }

    /// Greeting settings in use
    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// Signature of the ECU on `transport`, or `None` if it is not ours.
    ///
    /// The transport is left open.
    pub fn check(&self, transport: &dyn Transport) -> Option<String> {
        match self.try_check(transport) {
            Ok(signature) => Some(signature),
            Err(e) => {
                debug!("{}: handshake failed: {}", transport.port_name(), e);
                None
            }
        }
    }

    /// Like [`check`](Self::check), keeping the failure reason
    pub fn try_check(&self, transport: &dyn Transport) -> Result<String, ProtocolError> {
        let greeting = Packet::command(self.config.greeting);
        transport.write(&greeting.to_bytes())?;

        let payload = transport.read_packet(self.config.timeout())?;
        let signature = self.parse_response(&payload)?;
        info!("{}: signature {:?}", transport.port_name(), signature);
        Ok(signature)
    }

    /// Validate a greeting response payload (status byte + signature text)
    pub fn parse_response(&self, payload: &[u8]) -> Result<String, ProtocolError> {
        let (&status, text) = payload
            .split_first()
            .ok_or(ProtocolError::InvalidResponse)?;
        if status != self.config.ok_code {
            return Err(ProtocolError::EcuError(status));
        }

        let signature = String::from_utf8_lossy(text)
            .trim_end_matches('\0')
            .trim_end()
            .to_string();
        if !signature.starts_with(&self.config.signature_prefix) {
            return Err(ProtocolError::SignatureMismatch {
                expected: self.config.signature_prefix.clone(),
                actual: signature,
            });
        }
        Ok(signature)
    }

    /// Open `port_name`, greet the ECU and close the port again
    pub fn check_port(&self, opener: &dyn PortOpener, port_name: &str) -> Option<String> {
        self.check_port_with(opener, port_name, |_, _| {})
    }

    /// Like [`check_port`](Self::check_port), handing the still-open
    /// transport and the signature to `on_found` before the port is closed
    pub fn check_port_with<F>(
        &self,
        opener: &dyn PortOpener,
        port_name: &str,
        on_found: F,
    ) -> Option<String>
    where
        F: FnOnce(&dyn Transport, &str),
    {
        let transport = match opener.open(port_name, self.config.baud_rate) {
            Ok(transport) => transport,
            Err(e) => {
                debug!("{}: cannot open: {}", port_name, e);
                return None;
            }
        };
        let signature = self.check(transport.as_ref());
        if let Some(signature) = &signature {
            on_found(transport.as_ref(), signature);
        }
        transport.close();
        signature
    }
}
