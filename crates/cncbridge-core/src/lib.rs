//! # CNCBridge Core
//!
//! Core types, errors, and client-facing events for CNCBridge.
//! Provides the fundamental abstractions shared by the communication
//! layer and any embedding application:
//!
//! 1. **error** - thiserror-based error families and the unified `Error`/`Result`
//! 2. **types** - workflow state, firmware identification, machine-state snapshots
//! 3. **event** - the tagged event union delivered to subscribed clients

pub mod error;
pub mod event;
pub mod types;

pub use error::{CommandError, ConnectionError, ControllerError, Error, Result};

pub use event::{ClientEvent, FeederStatus, SenderStatus};

pub use types::{
    ControllerType, GrblMachineState, MachinePosition, MachineStateSnapshot, PlannerBuffer,
    TinyG2MachineState, WorkflowState,
};
