//! Line framing for the adapter's text channel
//!
//! The adapter terminates every line with `\r` and may print a `>` prompt in
//! front of the next response. [`LineFramer`] turns raw chunks into lines;
//! [`LineBuffer`] collects them for the command session under one lock.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::protocol::transport::lock;

const FAILURE_POLL: Duration = Duration::from_millis(20);

/// Line delimiter used in both directions
pub const LINE_DELIMITER: u8 = b'\r';

/// Prompt the adapter prints when it is ready for the next command
pub const CURSOR: char = '>';

/// Splits an inbound byte stream into lines, keeping partial lines across chunks
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    /// Create a framer with an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk, calling `emit` for every completed non-empty line
    pub fn push<F: FnMut(String)>(&mut self, chunk: &[u8], mut emit: F) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == LINE_DELIMITER) {
            self.partial.extend_from_slice(&rest[..pos]);
            let raw = std::mem::take(&mut self.partial);
            if let Some(line) = clean_line(&raw) {
                emit(line);
            }
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
    }

    /// Bytes received since the last delimiter
    pub fn partial(&self) -> &[u8] {
        &self.partial
    }
}

/// Strip line feeds and one leading cursor; `None` for lines left empty
fn clean_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_matches('\n');
    let text = text.strip_prefix(CURSOR).unwrap_or(text);
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[derive(Debug, Default)]
struct LineState {
    framer: LineFramer,
    lines: Vec<String>,
    generation: u64,
}

/// Completed lines of one transport, shared between the inbound callback
/// (single writer) and the command session (single reader).
#[derive(Debug, Default)]
pub struct LineBuffer {
    state: Mutex<LineState>,
    changed: Condvar,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed inbound bytes; wakes the reader once per completed line
    pub fn on_data(&self, chunk: &[u8]) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let lines = &mut state.lines;
        let generation = &mut state.generation;
        state.framer.push(chunk, |line| {
            tracing::trace!("adapter line: {:?}", line);
            lines.push(line);
            *generation += 1;
            self.changed.notify_all();
        });
    }

    /// Drop all completed lines
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.lines.clear();
        state.generation += 1;
        self.changed.notify_all();
    }

    /// Snapshot of the completed lines
    pub fn lines(&self) -> Vec<String> {
        lock(&self.state).lines.clone()
    }

    /// Take all completed lines, leaving the buffer empty
    pub fn take_lines(&self) -> Vec<String> {
        std::mem::take(&mut lock(&self.state).lines)
    }

    /// Number of completed lines
    pub fn len(&self) -> usize {
        lock(&self.state).lines.len()
    }

    /// True if no completed line is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until at least one completed line is waiting.
    ///
    /// Returns `false` on timeout or when `failed` reports a broken transport.
    pub fn wait_for_line<F: Fn() -> bool>(&self, timeout: Duration, failed: F) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while state.lines.is_empty() {
            let now = Instant::now();
            if failed() || now >= deadline {
                return false;
            }
            // bounded slices so a closed transport is noticed without a wake-up
            let slice = (deadline - now).min(FAILURE_POLL);
            state = match self.changed.wait_timeout(state, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Block until no new line arrived for one full `timeout`.
    ///
    /// Returns `false` if `failed` reports a broken transport while waiting.
    pub fn wait_quiescent<F: Fn() -> bool>(&self, timeout: Duration, failed: F) -> bool {
        let mut state = lock(&self.state);
        loop {
            if failed() {
                return false;
            }
            let seen = state.generation;
            let (guard, result) = match self
                .changed
                .wait_timeout_while(state, timeout, |s| s.generation == seen)
            {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = guard;
            if result.timed_out() {
                return !failed();
            }
        }
    }
}
