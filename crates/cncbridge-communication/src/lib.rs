//! # CNCBridge Communication
//!
//! The streaming core of CNCBridge: serial transport, the feeder/sender
//! pacing engines, the per-firmware controllers, and the client
//! connection multiplexer.
//!
//! Layering, leaf to root:
//! - `communication` - the serial link (`Communicator` trait, port enumeration)
//! - `feeder` / `sender` - pacing engines for interactive commands and jobs
//! - `connection` - fan-out of controller events to subscribed clients
//! - `firmware` - the Grbl/Smoothieware and TinyG2 controllers
//! - `registry` - the process-wide port-to-controller map

pub mod communication;
pub mod connection;
pub mod feeder;
pub mod file_service;
pub mod firmware;
pub mod macros;
pub mod registry;
pub mod sender;

pub use communication::{
    list_ports, Communicator, ConnectionParams, NoOpCommunicator, SerialCommunicator, SerialParity,
    SerialPortInfo,
};
pub use connection::{ClientHandle, ClientId, Connections};
pub use feeder::{FeedItem, Feeder};
pub use file_service::{FileService, LocalFileService, NoOpFileService};
pub use firmware::{open_controller, Command, Controller, ControllerServices};
pub use firmware::{
    grbl::{GrblConfig, GrblController},
    tinyg2::{TinyG2Config, TinyG2Controller},
};
pub use macros::{InMemoryMacroStore, JsonMacroStore, Macro, MacroStore};
pub use registry::ControllerRegistry;
pub use sender::{CharCountSender, LineSender};
