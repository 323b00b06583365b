//! Shared types for the streaming core
//!
//! Workflow state, firmware identification, and the machine-state
//! snapshots decoded from device status reports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Job-level workflow state of a controller
///
/// Distinct from the device's own motion state (e.g. Grbl `Run`/`Hold`):
/// this tracks what the *sender* is doing with the loaded program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    /// No job running
    #[default]
    Idle,
    /// A job is streaming
    Running,
    /// A job is loaded and mid-stream, but held
    Paused,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Supported CNC controller firmware families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControllerType {
    /// GRBL (default, most common)
    #[default]
    Grbl,
    /// Smoothieware (speaks a GRBL-compatible dialect)
    Smoothie,
    /// TinyG2 / g2core (JSON protocol)
    TinyG2,
}

impl fmt::Display for ControllerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grbl => write!(f, "Grbl"),
            Self::Smoothie => write!(f, "Smoothie"),
            Self::TinyG2 => write!(f, "TinyG2"),
        }
    }
}

/// A machine position in the three linear axes
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MachinePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl MachinePosition {
    /// Create a new position
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Planner/RX buffer occupancy from a Grbl status report (`Buf:` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerBuffer {
    /// Available planner blocks
    pub plan: u8,
    /// Available RX buffer bytes
    pub rx: u8,
}

/// Snapshot of a Grbl-family machine decoded from `<...>` status reports
///
/// Published to clients as a `Grbl:state` (or `Smoothie:state`) event
/// whenever it changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GrblMachineState {
    /// Device motion state (`Idle`, `Run`, `Hold`, `Alarm`, ...)
    pub active_state: String,
    /// Machine position
    pub machine_pos: MachinePosition,
    /// Work position
    pub work_pos: MachinePosition,
    /// Work coordinate offset, when reported
    pub work_coord_offset: Option<MachinePosition>,
    /// Current feed rate, when reported
    pub feed_rate: Option<f64>,
    /// Current spindle speed, when reported
    pub spindle_speed: Option<f64>,
    /// Buffer occupancy, when reported
    pub buffer: Option<PlannerBuffer>,
    /// Modal parser state from the last `$G` report
    pub parser_state: Option<String>,
}

impl GrblMachineState {
    /// True until the first status report has been decoded
    pub fn is_empty(&self) -> bool {
        self.active_state.is_empty()
    }
}

/// Snapshot of a TinyG2/g2core machine decoded from `sr` status reports
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TinyG2MachineState {
    /// Device machine state, mapped from the numeric `stat` field
    pub machine_state: String,
    /// Line number the device last reported executing
    pub line: Option<u32>,
    /// Work position
    pub work_pos: MachinePosition,
    /// Current velocity, when reported
    pub velocity: Option<f64>,
    /// Current feed rate, when reported
    pub feed_rate: Option<f64>,
}

impl TinyG2MachineState {
    /// True until the first status report has been decoded
    pub fn is_empty(&self) -> bool {
        self.machine_state.is_empty()
    }

    /// Map a TinyG2 `stat` code to its state name
    pub fn stat_name(stat: u8) -> &'static str {
        match stat {
            0 => "Init",
            1 => "Ready",
            2 => "Alarm",
            3 => "Stop",
            4 => "End",
            5 => "Run",
            6 => "Hold",
            7 => "Probe",
            8 => "Cycle",
            9 => "Homing",
            10 => "Jog",
            11 => "Interlock",
            12 => "Shutdown",
            13 => "Panic",
            _ => "Unknown",
        }
    }
}

/// A machine-state snapshot from either firmware family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MachineStateSnapshot {
    /// Grbl/Smoothieware snapshot
    Grbl(GrblMachineState),
    /// TinyG2 snapshot
    TinyG2(TinyG2MachineState),
}

impl MachineStateSnapshot {
    /// True until the first status report has been decoded
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Grbl(s) => s.is_empty(),
            Self::TinyG2(s) => s.is_empty(),
        }
    }
}
