//! Sender: pacing engines for a loaded G-code job
//!
//! Two streaming protocols are implemented:
//!
//! - [`CharCountSender`] keeps a sliding window of bytes resident in the
//!   device's receive buffer (Grbl-family character counting). Lines are
//!   emitted while they fit; each `ok`/`error` retires the oldest
//!   in-flight line in FIFO order.
//! - [`LineSender`] emits one line at a time and waits for its
//!   acknowledgement (TinyG2 send-response, gated further by the
//!   controller's planner-queue reports).

use cncbridge_core::{CommandError, Result, SenderStatus};
use std::collections::VecDeque;

/// Split a G-code blob into sendable lines
///
/// Trailing whitespace is stripped; blank lines are dropped so the line
/// index corresponds one-to-one with device acknowledgements.
fn tokenize_program(gcode: &str) -> Vec<String> {
    gcode
        .lines()
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.trim().is_empty())
        .collect()
}

/// Character-counting job streamer (Grbl family)
///
/// `buffer_size` must be strictly less than the device's true receive
/// buffer so out-of-band realtime queries (`?`, `$G\n`) always fit.
#[derive(Debug)]
pub struct CharCountSender {
    name: String,
    gcode: String,
    lines: Vec<String>,
    sent: usize,
    received: usize,
    bytes_in_flight: usize,
    in_flight: VecDeque<usize>,
    buffer_size: usize,
    changed: bool,
}

impl CharCountSender {
    /// Create a sender with the given streaming window
    pub fn new(buffer_size: usize) -> Self {
        Self {
            name: String::new(),
            gcode: String::new(),
            lines: Vec::new(),
            sent: 0,
            received: 0,
            bytes_in_flight: 0,
            in_flight: VecDeque::new(),
            buffer_size,
            changed: false,
        }
    }

    /// Load a program, replacing any previous one
    pub fn load(&mut self, name: &str, gcode: &str) -> Result<()> {
        let lines = tokenize_program(gcode);
        if lines.is_empty() {
            return Err(CommandError::EmptyProgram {
                name: name.to_string(),
            }
            .into());
        }

        self.name = name.to_string();
        self.gcode = gcode.to_string();
        self.lines = lines;
        self.reset_progress();
        self.changed = true;
        Ok(())
    }

    /// Discard the loaded program and all progress
    pub fn unload(&mut self) {
        self.name.clear();
        self.gcode.clear();
        self.lines.clear();
        self.reset_progress();
        self.changed = true;
    }

    /// Reset progress without discarding the program
    pub fn rewind(&mut self) {
        self.reset_progress();
        self.changed = true;
    }

    fn reset_progress(&mut self) {
        self.sent = 0;
        self.received = 0;
        self.bytes_in_flight = 0;
        self.in_flight.clear();
    }

    /// Emit every unsent line that fits into the remaining window
    ///
    /// Each emitted line costs its length plus one byte for the
    /// terminating newline. Stops when the next line does not fit or the
    /// program is exhausted.
    pub fn next(&mut self) -> Vec<String> {
        let mut emitted = Vec::new();
        while self.sent < self.lines.len() {
            let line = &self.lines[self.sent];
            let cost = line.len() + 1;
            if self.bytes_in_flight + cost > self.buffer_size {
                break;
            }
            self.bytes_in_flight += cost;
            self.in_flight.push_back(cost);
            self.sent += 1;
            self.changed = true;
            emitted.push(line.clone());
        }
        emitted
    }

    /// Retire the oldest in-flight line on a device acknowledgement
    ///
    /// Acknowledgements correspond to in-flight lines in FIFO order; a
    /// spurious acknowledgement with nothing in flight is logged and
    /// dropped.
    pub fn ack(&mut self) {
        if self.received >= self.sent {
            tracing::warn!("acknowledgement with no line in flight, dropped");
            return;
        }
        let cost = self.in_flight.pop_front().unwrap_or(0);
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(cost);
        self.received += 1;
        self.changed = true;
    }

    /// Total lines in the loaded program
    pub fn total(&self) -> usize {
        self.lines.len()
    }

    /// Lines written to the device
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Lines acknowledged by the device
    pub fn received(&self) -> usize {
        self.received
    }

    /// Bytes currently resident in the device receive buffer
    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    /// The line at the given index, when loaded
    pub fn line_at(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(String::as_str)
    }

    /// True when every line of a loaded program has been acknowledged
    pub fn is_done(&self) -> bool {
        !self.lines.is_empty() && self.received == self.lines.len()
    }

    /// True when the sender state changed since the last peek
    pub fn peek(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// Snapshot for publication to clients
    pub fn status(&self) -> SenderStatus {
        SenderStatus {
            name: self.name.clone(),
            total: self.lines.len(),
            sent: self.sent,
            received: self.received,
        }
    }
}

/// Send-response job streamer (TinyG2)
///
/// At most one line is outstanding: `sent - received` is always 0 or 1.
/// The controller layers acknowledgement and planner-queue gating on top.
#[derive(Debug, Default)]
pub struct LineSender {
    name: String,
    gcode: String,
    lines: Vec<String>,
    sent: usize,
    received: usize,
    changed: bool,
}

impl LineSender {
    /// Create an empty sender
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a program, replacing any previous one
    pub fn load(&mut self, name: &str, gcode: &str) -> Result<()> {
        let lines = tokenize_program(gcode);
        if lines.is_empty() {
            return Err(CommandError::EmptyProgram {
                name: name.to_string(),
            }
            .into());
        }

        self.name = name.to_string();
        self.gcode = gcode.to_string();
        self.lines = lines;
        self.sent = 0;
        self.received = 0;
        self.changed = true;
        Ok(())
    }

    /// Discard the loaded program and all progress
    pub fn unload(&mut self) {
        self.name.clear();
        self.gcode.clear();
        self.lines.clear();
        self.sent = 0;
        self.received = 0;
        self.changed = true;
    }

    /// Reset progress without discarding the program
    pub fn rewind(&mut self) {
        self.sent = 0;
        self.received = 0;
        self.changed = true;
    }

    /// Emit the next line when the previous one has been acknowledged
    pub fn next(&mut self) -> Option<String> {
        if self.sent > self.received {
            return None;
        }
        let line = self.lines.get(self.sent)?.clone();
        self.sent += 1;
        self.changed = true;
        Some(line)
    }

    /// Retire the outstanding line
    pub fn ack(&mut self) {
        if self.received >= self.sent {
            tracing::warn!("acknowledgement with no line in flight, dropped");
            return;
        }
        self.received += 1;
        self.changed = true;
    }

    /// Total lines in the loaded program
    pub fn total(&self) -> usize {
        self.lines.len()
    }

    /// Lines written to the device
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Lines acknowledged by the device
    pub fn received(&self) -> usize {
        self.received
    }

    /// The line at the given index, when loaded
    pub fn line_at(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(String::as_str)
    }

    /// True when every line of a loaded program has been acknowledged
    pub fn is_done(&self) -> bool {
        !self.lines.is_empty() && self.received == self.lines.len()
    }

    /// True when the sender state changed since the last peek
    pub fn peek(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// Snapshot for publication to clients
    pub fn status(&self) -> SenderStatus {
        SenderStatus {
            name: self.name.clone(),
            total: self.lines.len(),
            sent: self.sent,
            received: self.received,
        }
    }
}
