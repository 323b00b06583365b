//! GRBL / Smoothieware firmware support
//!
//! One controller drives both: Smoothieware speaks a GRBL-compatible
//! dialect and is fingerprinted at runtime by its reply to a `version`
//! probe sent shortly after the port opens.

pub mod constants;
pub mod controller;
pub mod error_decoder;
pub mod response_parser;

pub use controller::{GrblConfig, GrblController};
pub use response_parser::{GrblResponse, GrblResponseParser, StatusReport};
