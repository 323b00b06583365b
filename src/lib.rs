//! # CNCBridge
//!
//! A multi-firmware G-code streaming controller core that bridges
//! interactive clients to CNC motion controllers over a serial link.
//!
//! ## Architecture
//!
//! CNCBridge is organized as a workspace with two library crates:
//!
//! 1. **cncbridge-core** - Types, errors, and client-facing events
//! 2. **cncbridge-communication** - Serial transport, feeder/sender
//!    streaming engines, the GRBL/Smoothieware and TinyG2 controllers,
//!    and the connection multiplexer
//!
//! ## Features
//!
//! - **Multi-Controller Support**: GRBL, Smoothieware, TinyG2/g2core
//! - **Two streaming protocols**: character counting (GRBL family) and
//!   acknowledgement plus planner-queue gating (TinyG2)
//! - **Feeder/sender duality**: interactive commands coexist with a
//!   paced job stream on one serial link
//! - **Multi-client fan-out**: every subscribed client sees the device
//!   conversation; echoes are correlated back to their origin

pub use cncbridge_communication::firmware;

pub use cncbridge_core::{
    ClientEvent, CommandError, ConnectionError, ControllerError, ControllerType, Error,
    FeederStatus, GrblMachineState, MachinePosition, MachineStateSnapshot, Result, SenderStatus,
    TinyG2MachineState, WorkflowState,
};

pub use cncbridge_communication::{
    list_ports, open_controller, ClientHandle, ClientId, Command, Communicator, ConnectionParams,
    Controller, ControllerRegistry, ControllerServices, GrblConfig, GrblController,
    InMemoryMacroStore, JsonMacroStore, LocalFileService, Macro, MacroStore, NoOpCommunicator,
    SerialCommunicator, SerialParity, SerialPortInfo, TinyG2Config, TinyG2Controller,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Console output
/// - RUST_LOG environment variable support
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
