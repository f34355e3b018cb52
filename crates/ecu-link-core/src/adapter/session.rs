//! Command/response session over the adapter's text channel

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::line::{LineBuffer, LINE_DELIMITER};
use super::matcher::ResponseMatcher;
use crate::protocol::{ProtocolError, Transport};

/// Sends one-line commands and collects the adapter's multi-line answers.
///
/// Commands are strictly sequential: every `send` clears the line buffer,
/// writes the command and waits for the answer before returning.
pub struct CommandSession {
    transport: Arc<dyn Transport>,
    lines: Arc<LineBuffer>,
    expect_echo: bool,
}

impl CommandSession {
    /// Attach a session to `transport`, installing the line framer as its inbound listener
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let lines = Arc::new(LineBuffer::new());
        let sink = lines.clone();
        transport.set_inbound_listener(Box::new(move |chunk: &[u8]| sink.on_data(chunk)));
        Self {
            transport,
            lines,
            expect_echo: true,
        }
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Whether the last matched response came after an echo of the command
    pub fn echo_enabled(&self) -> bool {
        self.expect_echo
    }

    /// Override the echo expectation (after switching echo off explicitly)
    pub fn set_echo_enabled(&mut self, echo: bool) {
        self.expect_echo = echo;
    }

    /// Send `command` and return the matched value, or `None` on any failure
    pub fn send(
        &mut self,
        command: &str,
        matcher: &dyn ResponseMatcher,
        timeout: Duration,
    ) -> Option<String> {
        match self.try_send(command, matcher, timeout) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("adapter command {:?} failed: {}", command, e);
                None
            }
        }
    }

    /// Send `command` and return the matched value, keeping the failure reason
    pub fn try_send(
        &mut self,
        command: &str,
        matcher: &dyn ResponseMatcher,
        timeout: Duration,
    ) -> Result<String, ProtocolError> {
        debug!("adapter cmd: {}", command);
        self.lines.clear();
        self.write_line(command)?;

        let lines = self.collect(timeout)?;
        let first = lines.first().ok_or(ProtocolError::Timeout)?;

        // The first line repeats the command when echo is on
        let echoed = first == command;
        let response = if echoed {
            lines.get(1).ok_or(ProtocolError::Timeout)?
        } else {
            first
        };

        match matcher.match_line(response) {
            Some(value) => {
                self.expect_echo = echoed;
                Ok(value)
            }
            None => Err(ProtocolError::NoMatch(response.clone())),
        }
    }

    /// Write `text` followed by the line delimiter, without waiting for an answer
    pub fn write_line(&self, text: &str) -> Result<(), ProtocolError> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(LINE_DELIMITER);
        self.transport.write(&bytes)
    }

    /// Wait for the line buffer to go quiet and take everything it collected
    pub fn collect(&self, timeout: Duration) -> Result<Vec<String>, ProtocolError> {
        let transport = self.transport.clone();
        if !self.lines.wait_quiescent(timeout, || transport.is_closed()) {
            return Err(ProtocolError::NotConnected);
        }
        Ok(self.lines.take_lines())
    }

    /// Wait up to `timeout` for the first line to arrive, then until the buffer goes quiet
    pub fn wait_lines(
        &self,
        timeout: Duration,
        quiet: Duration,
    ) -> Result<Vec<String>, ProtocolError> {
        let transport = self.transport.clone();
        if !self.lines.wait_for_line(timeout, || transport.is_closed()) {
            if self.transport.is_closed() {
                return Err(ProtocolError::NotConnected);
            }
            return Err(ProtocolError::Timeout);
        }
        self.collect(quiet)
    }

    /// Drop lines collected so far
    pub fn discard_lines(&self) {
        self.lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::matcher::{Literal, RegexMatcher};
    use crate::protocol::mock::MockTransport;

    const T: Duration = Duration::from_millis(30);

    fn session(transport: MockTransport) -> (Arc<MockTransport>, CommandSession) {
        let transport = Arc::new(transport);
        let session = CommandSession::new(transport.clone());
        (transport, session)
    }

    #[test]
    fn test_echo_and_no_echo_yield_same_value() {
        let (_, mut echoing) = session(MockTransport::elm327("COM1", true));
        let (_, mut quiet) = session(MockTransport::elm327("COM2", false));

        let a = echoing.send("ATRV", &RegexMatcher::voltage(), T);
        let b = quiet.send("ATRV", &RegexMatcher::voltage(), T);

        assert_eq!(a, Some("12.6".to_string()));
        assert_eq!(a, b);
        assert!(echoing.echo_enabled());
        assert!(!quiet.echo_enabled());
    }

    #[test]
    fn test_command_written_with_delimiter() {
        let (transport, mut session) = session(MockTransport::elm327("COM1", false));
        session.send("ATSP6", &Literal::ok(), T);
        assert_eq!(transport.written(), b"ATSP6\r".to_vec());
    }

    #[test]
    fn test_silent_device_is_none() {
        let (_, mut session) = session(MockTransport::silent("COM1"));
        assert_eq!(session.send("ATZ", &RegexMatcher::elm_version(), T), None);
        assert!(session
            .try_send("ATZ", &RegexMatcher::elm_version(), T)
            .unwrap_err()
            .is_timeout());
    }

    #[test]
    fn test_mismatch_is_none() {
        let (_, mut session) =
            session(MockTransport::with_responder("COM1", |_| vec![b"?\r>".to_vec()]));
        let err = session.try_send("ATXX", &Literal::ok(), T).unwrap_err();
        assert!(err.is_protocol_mismatch());
    }

    #[test]
    fn test_echo_without_response_is_none() {
        let (_, mut session) =
            session(MockTransport::with_responder("COM1", |data| vec![data.to_vec()]));
        assert_eq!(session.send("ATI", &Literal::new("ELM"), T), None);
    }

    #[test]
    fn test_write_failure_is_none() {
        let (transport, mut session) = session(MockTransport::elm327("COM1", false));
        transport.fail_writes();
        assert_eq!(session.send("ATZ", &RegexMatcher::elm_version(), T), None);
    }

    #[test]
    fn test_closed_transport_is_none() {
        let (transport, mut session) = session(MockTransport::elm327("COM1", false));
        transport.close();
        assert_eq!(session.send("ATZ", &RegexMatcher::elm_version(), T), None);
    }

    #[test]
    fn test_stale_lines_cleared_before_command() {
        let (transport, mut session) = session(MockTransport::elm327("COM1", false));
        transport.inject(b"STALE\r");
        assert_eq!(
            session.send("ATE0", &Literal::ok(), T),
            Some("OK".to_string())
        );
    }
}
