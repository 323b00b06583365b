//! GRBL protocol constants

/// Receive buffer size GRBL advertises
pub const GRBL_RX_BUFFER_SIZE: usize = 127;

/// Streaming window used for character counting
///
/// Strictly less than the device buffer so the two out-of-band queries
/// (`?` and `$G\n`) always have head-room.
pub const STREAMING_BUFFER_SIZE: usize = 120;

/// Realtime status query (single byte, no newline)
pub const STATUS_QUERY: u8 = b'?';

/// Realtime cycle start / resume
pub const CYCLE_START: u8 = b'~';

/// Realtime feed hold
pub const FEED_HOLD: u8 = b'!';

/// Realtime soft reset (Ctrl-X)
pub const SOFT_RESET: u8 = 0x18;

/// Bytes the device interprets immediately, out-of-band of the line
/// protocol; written without newline termination.
pub const REALTIME_COMMANDS: [u8; 4] = [STATUS_QUERY, CYCLE_START, FEED_HOLD, SOFT_RESET];

/// Query timer tick
pub const QUERY_INTERVAL_MS: u64 = 250;

/// Minimum interval between `$G` parser-state polls
pub const PARSER_STATE_INTERVAL_MS: u64 = 500;

/// Settle time after opening the port before the version probe
pub const STARTUP_DELAY_MS: u64 = 500;

/// Settle time between the version probe and readiness
pub const VERSION_PROBE_SETTLE_MS: u64 = 50;

/// Delay between the hold and the soft reset in the stop sequence
pub const STOP_RESET_DELAY_MS: u64 = 50;

/// True when the data is a single realtime byte
pub fn is_realtime_command(data: &str) -> bool {
    let bytes = data.as_bytes();
    bytes.len() == 1 && REALTIME_COMMANDS.contains(&bytes[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_detection() {
        assert!(is_realtime_command("?"));
        assert!(is_realtime_command("!"));
        assert!(is_realtime_command("~"));
        assert!(is_realtime_command("\u{18}"));
        assert!(!is_realtime_command("$G"));
        assert!(!is_realtime_command("??"));
        assert!(!is_realtime_command(""));
    }
}
