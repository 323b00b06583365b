//! Error handling for CNCBridge
//!
//! Provides error types for the layers of the streaming core:
//! - Connection errors (serial transport)
//! - Command errors (client-issued commands that cannot be carried out)
//! - Controller errors (protocol/state machine violations)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Represents errors related to the serial link between the controller
/// and the device.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// Failed to open the port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Port is already open under another controller
    #[error("Port already in use: {port}")]
    PortInUse {
        /// The name of the port that is in use.
        port: String,
    },

    /// The transport is not connected
    #[error("Not connected")]
    NotConnected,

    /// The device disappeared mid-session
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Low-level I/O failure on the port
    #[error("I/O error: {reason}")]
    IoError {
        /// The reason for the I/O error.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },
}

/// Command error type
///
/// Represents client-issued commands the controller cannot carry out.
/// These are returned through the command reply where one was requested,
/// otherwise logged and discarded.
#[derive(Error, Debug, Clone)]
pub enum CommandError {
    /// A program was loaded with an empty or unparseable body
    #[error("Cannot load '{name}': program is empty")]
    EmptyProgram {
        /// The name the program was loaded under.
        name: String,
    },

    /// `loadmacro` referenced a macro id that does not exist
    #[error("Unknown macro: {id}")]
    UnknownMacro {
        /// The macro id that was not found.
        id: String,
    },

    /// `loadfile` could not read the file
    #[error("Failed to read {path}: {reason}")]
    FileRead {
        /// The path that could not be read.
        path: String,
        /// The reason the read failed.
        reason: String,
    },

    /// The command is not supported by the active firmware
    #[error("Command not supported by {firmware}: {command}")]
    Unsupported {
        /// The firmware that does not support the command.
        firmware: String,
        /// The command name.
        command: String,
    },

    /// The controller has been closed; no further commands are accepted
    #[error("Controller is closed")]
    ControllerClosed,
}

/// Controller error type
///
/// Protocol and state-machine violations. The controller itself treats
/// these defensively (log and drop); they surface as errors only at the
/// public API edge.
#[derive(Error, Debug, Clone)]
pub enum ControllerError {
    /// Operation requires an open, initialised controller
    #[error("Controller not ready")]
    NotReady,

    /// A controller is already registered for this port
    #[error("A controller is already open on {port}")]
    AlreadyOpen {
        /// The contested port name.
        port: String,
    },

    /// Generic controller error
    #[error("Controller error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// Main error type for CNCBridge
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Command error
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a command error
    pub fn is_command_error(&self) -> bool {
        matches!(self, Error::Command(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::from(CommandError::EmptyProgram {
            name: "job".to_string(),
        });
        assert_eq!(e.to_string(), "Cannot load 'job': program is empty");
        assert!(e.is_command_error());
    }

    #[test]
    fn test_connection_error_conversion() {
        let e: Error = ConnectionError::NotConnected.into();
        assert!(e.is_connection_error());
        assert!(!e.is_command_error());
    }

    #[test]
    fn test_other_helper() {
        let e = Error::other("boom");
        assert_eq!(e.to_string(), "boom");
    }
}
