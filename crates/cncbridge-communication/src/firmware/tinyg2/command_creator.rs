//! TinyG2 Command Creator
//!
//! Frames outbound traffic for the JSON protocol: numbered job lines,
//! wrapped interactive G-code, and configuration queries.

use serde_json::json;

/// Builds TinyG2 command strings and owns the per-run line number
#[derive(Debug, Default)]
pub struct CommandCreator {
    line_number: u32,
}

impl CommandCreator {
    /// Create a new command creator
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame a job line with the next line number: `N<k> <gcode>`
    pub fn create_gcode_command(&mut self, gcode: &str) -> String {
        self.line_number += 1;
        format!("N{} {}", self.line_number, gcode)
    }

    /// Wrap an interactive G-code line for the JSON channel
    pub fn wrap_gcode(&self, gcode: &str) -> String {
        json!({ "gc": gcode }).to_string()
    }

    /// Create a JSON query for a single key
    pub fn create_query(&self, key: &str) -> String {
        format!("{{\"{}\":null}}", key)
    }

    /// Reset the line number counter; called on every job start
    pub fn reset_line_number(&mut self) {
        self.line_number = 0;
    }

    /// The last line number handed out
    pub fn line_number(&self) -> u32 {
        self.line_number
    }
}
