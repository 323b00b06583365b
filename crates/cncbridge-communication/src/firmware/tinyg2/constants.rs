//! TinyG2 protocol constants

/// Feed hold
pub const FEED_HOLD: &str = "!";

/// Cycle start / resume
pub const CYCLE_START: &str = "~";

/// Feed hold plus queue flush, the stop/abort sequence
pub const FEED_HOLD_QUEUE_FLUSH: &str = "!%";

/// Kill the running job (Ctrl-D)
pub const KILL_JOB: &str = "\u{04}";

/// Soft reset (Ctrl-X)
pub const SOFT_RESET: &str = "\u{18}";

/// Realtime status request
pub const STATUS_REQUEST: &str = "?";

/// Clear an alarm; TinyG2 accepts the relaxed-JSON form
pub const CLEAR_ALARM: &str = "{clear:null}";

/// Run the homing cycle
pub const HOME_ALL: &str = "{home:1}";

/// Solicit a queue report after a command sequence
pub const QUEUE_REPORT_REQUEST: &str = "{\"qr\":\"\"}";

/// Force a queue report after a line with no planner motion
pub const QUEUE_REPORT_POLL: &str = "{\"qr\":null}";

/// Query timer tick
pub const QUERY_INTERVAL_MS: u64 = 250;

/// Delay before the post-stop cleanup writes
pub const STOP_CLEANUP_DELAY_MS: u64 = 250;

/// Default planner-queue low-water mark
///
/// The exact threshold is firmware dependent; it is exposed as a
/// tunable on the controller configuration.
pub const PLANNER_LOW_WATER_MARK: u32 = 4;

/// One step of the initialisation script
#[derive(Debug, Clone, Copy)]
pub struct InitCommand {
    /// The line to write
    pub cmd: &'static str,
    /// Pause before the next step, milliseconds
    pub pause_after_ms: u64,
}

/// Ordered initialisation script written after the port opens
///
/// Enables strict JSON mode, sets verbosities, configures the status
/// report, then requests the identification and baseline reports. The
/// controller is ready once the final step has settled.
pub const INIT_SCRIPT: &[InitCommand] = &[
    // Strict JSON mode
    InitCommand {
        cmd: "{\"js\":1}",
        pause_after_ms: 50,
    },
    // JSON verbosity: linenum + messages
    InitCommand {
        cmd: "{\"jv\":4}",
        pause_after_ms: 50,
    },
    // Queue report verbosity: single
    InitCommand {
        cmd: "{\"qv\":1}",
        pause_after_ms: 50,
    },
    // Status report verbosity: filtered
    InitCommand {
        cmd: "{\"sv\":1}",
        pause_after_ms: 50,
    },
    // Status report interval, milliseconds
    InitCommand {
        cmd: "{\"si\":100}",
        pause_after_ms: 50,
    },
    // Status report fields
    InitCommand {
        cmd: "{\"sr\":{\"line\":true,\"posx\":true,\"posy\":true,\"posz\":true,\"vel\":true,\"stat\":true}}",
        pause_after_ms: 50,
    },
    // Hardware platform
    InitCommand {
        cmd: "{\"hp\":null}",
        pause_after_ms: 50,
    },
    // Firmware build
    InitCommand {
        cmd: "{\"fb\":null}",
        pause_after_ms: 50,
    },
    // Motor timeout
    InitCommand {
        cmd: "{\"mt\":null}",
        pause_after_ms: 50,
    },
    // Planner queue depth
    InitCommand {
        cmd: "{\"qr\":null}",
        pause_after_ms: 50,
    },
    // Baseline status report
    InitCommand {
        cmd: "{\"sr\":null}",
        pause_after_ms: 50,
    },
    InitCommand {
        cmd: "?",
        pause_after_ms: 250,
    },
];
