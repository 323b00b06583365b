//! Firmware controllers for the supported CNC families
//!
//! Supported controllers:
//! - GRBL: character-counting streaming protocol (also drives Smoothieware,
//!   which speaks a GRBL-compatible dialect and is fingerprinted at runtime)
//! - TinyG2/g2core: JSON send-response protocol gated by planner queue reports

pub mod grbl;
pub mod tinyg2;

use crate::communication::ConnectionParams;
use crate::connection::{ClientHandle, ClientId};
use crate::file_service::{FileService, LocalFileService};
use crate::macros::{InMemoryMacroStore, MacroStore};
use crate::registry::ControllerRegistry;
use async_trait::async_trait;
use cncbridge_core::{
    ControllerType, FeederStatus, Result, SenderStatus, WorkflowState,
};
use std::sync::Arc;
use tokio::sync::oneshot;

pub use grbl::{GrblConfig, GrblController};
pub use tinyg2::{TinyG2Config, TinyG2Controller};

/// Command issued to a controller on behalf of a client
///
/// A single tagged union dispatched by each controller; `LoadMacro` and
/// `LoadFile` resolve their G-code and recurse as `Load`. Commands a
/// firmware does not support are rejected with a command error.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Load a program under a name
    Load {
        /// Program name (file name or macro name)
        name: String,
        /// The G-code body
        gcode: String,
    },
    /// Resolve a stored macro and load it
    LoadMacro {
        /// Macro id
        id: String,
    },
    /// Read a file and load it
    LoadFile {
        /// File path
        path: String,
    },
    /// Discard the loaded program
    Unload,
    /// Start (or restart) streaming the loaded program
    Start,
    /// Stop the job and reset the device
    Stop,
    /// Feed hold
    Pause,
    /// Cycle start / resume
    Resume,
    /// Soft-reset the device
    Reset,
    /// Clear an alarm lock
    Unlock,
    /// Run the homing cycle
    Homing,
    /// Toggle G-code check mode (Grbl only)
    Check,
    /// Queue an interactive G-code line through the feeder
    Gcode {
        /// The line to queue
        line: String,
    },
    /// Flush the planner queue (TinyG2 only)
    QueueFlush,
    /// Kill the current job immediately (TinyG2 only)
    KillJob,
}

impl Command {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::LoadMacro { .. } => "loadmacro",
            Self::LoadFile { .. } => "loadfile",
            Self::Unload => "unload",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Reset => "reset",
            Self::Unlock => "unlock",
            Self::Homing => "homing",
            Self::Check => "check",
            Self::Gcode { .. } => "gcode",
            Self::QueueFlush => "queueflush",
            Self::KillJob => "killjob",
        }
    }
}

/// External services a controller resolves commands against
#[derive(Clone)]
pub struct ControllerServices {
    /// Macro store backing `loadmacro`
    pub macros: Arc<dyn MacroStore>,
    /// File service backing `loadfile`
    pub files: Arc<dyn FileService>,
}

impl ControllerServices {
    /// Create services from explicit implementations
    pub fn new(macros: Arc<dyn MacroStore>, files: Arc<dyn FileService>) -> Self {
        Self { macros, files }
    }

    /// In-memory macros plus local file access
    pub fn local() -> Self {
        Self {
            macros: Arc::new(InMemoryMacroStore::new()),
            files: Arc::new(LocalFileService::new()),
        }
    }
}

impl Default for ControllerServices {
    fn default() -> Self {
        Self::local()
    }
}

/// A streaming controller bound to one serial port
///
/// All mutation funnels through the controller's single-threaded event
/// loop; the trait methods only exchange messages with it.
#[async_trait]
pub trait Controller: Send + Sync {
    /// The firmware family this controller drives
    fn controller_type(&self) -> ControllerType;

    /// The port this controller is bound to
    fn port(&self) -> &str;

    /// True until the controller has been closed
    fn is_open(&self) -> bool;

    /// True once startup initialisation has completed
    fn is_ready(&self) -> bool;

    /// Current job-level workflow state
    fn workflow_state(&self) -> WorkflowState;

    /// Snapshot of the job stream
    fn sender_status(&self) -> SenderStatus;

    /// Snapshot of the feeder queue
    fn feeder_status(&self) -> FeederStatus;

    /// Subscribe a client to this controller's events
    fn add_connection(&self, client: ClientHandle);

    /// Remove a subscribed client
    fn remove_connection(&self, id: ClientId);

    /// Dispatch a command, optionally on behalf of a client
    async fn command(&self, client: Option<ClientId>, command: Command) -> Result<()>;

    /// Write data directly to the device on behalf of a client
    async fn write(&self, client: Option<ClientId>, data: String) -> Result<()>;

    /// Tear the controller down; a second call is a logged no-op
    async fn close(&self);
}

/// Open a controller of the requested firmware family on a serial port
pub async fn open_controller(
    firmware: ControllerType,
    params: ConnectionParams,
    registry: Arc<ControllerRegistry>,
    services: ControllerServices,
) -> Result<Arc<dyn Controller>> {
    match firmware {
        ControllerType::Grbl | ControllerType::Smoothie => {
            let controller =
                GrblController::open(params, GrblConfig::default(), registry, services)?;
            Ok(controller as Arc<dyn Controller>)
        }
        ControllerType::TinyG2 => {
            let controller =
                TinyG2Controller::open(params, TinyG2Config::default(), registry, services)?;
            Ok(controller as Arc<dyn Controller>)
        }
    }
}

/// Message handled by a controller's event loop
pub(crate) enum ControllerMsg {
    /// Dispatch a command
    Command {
        client: Option<ClientId>,
        command: Command,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Direct write to the device
    Write {
        client: Option<ClientId>,
        data: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Subscribe a client
    AddConnection(ClientHandle),
    /// Unsubscribe a client
    RemoveConnection(ClientId),
    /// Tear down the loop
    Close { reply: oneshot::Sender<()> },
}

/// State the event loop mirrors out for the accessor methods
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedSnapshot {
    pub workflow: WorkflowState,
    pub ready: bool,
    pub firmware: ControllerType,
    pub feeder: FeederStatus,
    pub sender: SenderStatus,
}
