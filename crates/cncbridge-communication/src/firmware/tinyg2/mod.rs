//! TinyG2 / g2core firmware support
//!
//! TinyG2 speaks a line-framed JSON protocol. Job lines are numbered
//! (`N<k> ...`), acknowledged individually, and additionally gated by
//! planner queue reports so the planner never starves or overflows.

pub mod command_creator;
pub mod constants;
pub mod controller;
pub mod response_parser;

pub use command_creator::CommandCreator;
pub use controller::{TinyG2Config, TinyG2Controller};
pub use response_parser::{StatusFields, TinyG2Response, TinyG2ResponseParser};
