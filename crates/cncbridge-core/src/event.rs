//! Client-facing events
//!
//! A controller fans a single stream of typed events out to every
//! subscribed client. The union below carries all event shapes; the wire
//! name (`serialport:read`, `sender:status`, ...) is derived per variant
//! so transports can expose the conventional names.

use crate::types::{ControllerType, MachineStateSnapshot};
use serde::{Deserialize, Serialize};

/// Snapshot of the feeder queue published at timer granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeederStatus {
    /// Lines waiting in the queue
    pub queued: usize,
    /// Whether a line is currently in flight
    pub pending: bool,
}

/// Snapshot of the sender (job stream) published at timer granularity
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SenderStatus {
    /// Name the program was loaded under (empty when nothing is loaded)
    pub name: String,
    /// Total lines in the program
    pub total: usize,
    /// Lines written to the device
    pub sent: usize,
    /// Lines acknowledged by the device
    pub received: usize,
}

/// Event delivered to subscribed clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientEvent {
    /// The serial port opened
    SerialOpen {
        /// Port name
        port: String,
    },
    /// The serial port closed (teardown or disconnect)
    SerialClose {
        /// Port name
        port: String,
    },
    /// Transport-level failure
    SerialError {
        /// Error description
        message: String,
    },
    /// A line received from the device, forwarded raw
    SerialRead {
        /// Raw line
        data: String,
    },
    /// Data written to the device on behalf of a client
    SerialWrite {
        /// Raw data
        data: String,
    },
    /// Feeder queue snapshot
    FeederStatus(FeederStatus),
    /// Job stream snapshot
    SenderStatus(SenderStatus),
    /// Machine-state snapshot for the active firmware
    MachineState {
        /// Firmware the snapshot belongs to
        firmware: ControllerType,
        /// The snapshot
        state: MachineStateSnapshot,
    },
}

impl ClientEvent {
    /// Conventional wire name for this event
    pub fn wire_name(&self) -> String {
        match self {
            Self::SerialOpen { .. } => "serialport:open".to_string(),
            Self::SerialClose { .. } => "serialport:close".to_string(),
            Self::SerialError { .. } => "serialport:error".to_string(),
            Self::SerialRead { .. } => "serialport:read".to_string(),
            Self::SerialWrite { .. } => "serialport:write".to_string(),
            Self::FeederStatus(_) => "feeder:status".to_string(),
            Self::SenderStatus(_) => "sender:status".to_string(),
            Self::MachineState { firmware, .. } => format!("{}:state", firmware),
        }
    }
}
