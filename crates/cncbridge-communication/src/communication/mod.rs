//! Communication layer for the serial link to the device
//!
//! Provides a trait-based communication interface so the controllers can
//! be driven against a real serial port or a test double.

pub mod serial;

use cncbridge_core::{ConnectionError, Result};
use serde::{Deserialize, Serialize};

pub use serial::{list_ports, SerialPortInfo};

/// Connection parameters for establishing communication
///
/// Contains all information needed to open the serial link to a CNC
/// controller. Immutable once a controller has been opened with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,

    /// Baud rate (115200 typical for GRBL and g2core)
    pub baud_rate: u32,

    /// Read timeout in milliseconds (kept short so the IO loop can spin)
    pub timeout_ms: u64,

    /// Whether to use RTS/CTS flow control
    pub flow_control: bool,

    /// Number of data bits (typically 8)
    pub data_bits: u8,

    /// Number of stop bits (typically 1)
    pub stop_bits: u8,

    /// Parity setting
    pub parity: SerialParity,
}

/// Serial port parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            timeout_ms: 50,
            flow_control: false,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
        }
    }
}

impl ConnectionParams {
    /// Create connection parameters for the given port and baud rate
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Validate the connection parameters
    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(ConnectionError::InvalidParameters {
                reason: "Serial port name cannot be empty".to_string(),
            }
            .into());
        }
        if self.baud_rate == 0 {
            return Err(ConnectionError::InvalidParameters {
                reason: "Baud rate must be > 0".to_string(),
            }
            .into());
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConnectionError::InvalidParameters {
                reason: "Data bits must be 5-8".to_string(),
            }
            .into());
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(ConnectionError::InvalidParameters {
                reason: "Stop bits must be 1 or 2".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Abstract communicator trait for the device link
///
/// Controllers hold the link behind this trait so protocol logic can be
/// exercised against a scripted double in tests. `receive` is expected to
/// return quickly (the underlying port uses a short read timeout) and may
/// return an empty vector when no data is pending.
pub trait Communicator: Send {
    /// Open the link using the provided parameters
    fn connect(&mut self, params: &ConnectionParams) -> Result<()>;

    /// Close the link
    fn disconnect(&mut self) -> Result<()>;

    /// Check if the link is open
    fn is_connected(&self) -> bool;

    /// Send raw bytes to the device, returning the number of bytes written
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Receive pending bytes from the device (empty when none)
    fn receive(&mut self) -> Result<Vec<u8>>;

    /// Send a text command with newline termination
    fn send_command(&mut self, command: &str) -> Result<()> {
        self.send(command.as_bytes())?;
        self.send(b"\n")?;
        Ok(())
    }
}

/// No-op communicator for testing
pub struct NoOpCommunicator {
    connected: bool,
}

impl NoOpCommunicator {
    /// Create a new no-op communicator
    pub fn new() -> Self {
        Self { connected: false }
    }
}

impl Default for NoOpCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for NoOpCommunicator {
    fn connect(&mut self, params: &ConnectionParams) -> Result<()> {
        params.validate()?;
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        if !self.connected {
            return Err(ConnectionError::NotConnected.into());
        }
        Ok(data.len())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        if !self.connected {
            return Err(ConnectionError::NotConnected.into());
        }
        Ok(vec![])
    }
}

/// Serial/USB communicator for direct hardware connection
///
/// Full serial port communication using the serialport crate behind the
/// `Communicator` trait.
pub struct SerialCommunicator {
    port: Option<serial::RealSerialPort>,
    params: Option<ConnectionParams>,
}

impl SerialCommunicator {
    /// Create a new serial communicator
    pub fn new() -> Self {
        Self {
            port: None,
            params: None,
        }
    }
}

impl Default for SerialCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for SerialCommunicator {
    fn connect(&mut self, params: &ConnectionParams) -> Result<()> {
        params.validate()?;

        match serial::RealSerialPort::open(params) {
            Ok(port) => {
                self.port = Some(port);
                self.params = Some(params.clone());
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to connect to {}: {}", params.port, e);
                Err(e)
            }
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        self.port = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port.as_mut().ok_or(ConnectionError::NotConnected)?;
        port.write(data).map_err(|e| {
            tracing::error!("Send error: {}", e);
            ConnectionError::IoError {
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let port = self.port.as_mut().ok_or(ConnectionError::NotConnected)?;

        let mut buf = [0u8; 4096];
        match port.read(&mut buf) {
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) => {
                // Short read timeouts are the normal idle case
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                {
                    Ok(vec![])
                } else {
                    tracing::error!("Receive error: {}", e);
                    Err(ConnectionError::ConnectionLost {
                        reason: e.to_string(),
                    }
                    .into())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_default() {
        let p = ConnectionParams::default();
        assert_eq!(p.baud_rate, 115200);
        assert_eq!(p.data_bits, 8);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_params_validation() {
        let p = ConnectionParams::new("", 115200);
        assert!(p.validate().is_err());

        let p = ConnectionParams::new("/dev/ttyACM0", 0);
        assert!(p.validate().is_err());

        let mut p = ConnectionParams::new("/dev/ttyACM0", 115200);
        p.data_bits = 9;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_noop_communicator() {
        let mut c = NoOpCommunicator::new();
        assert!(!c.is_connected());
        assert!(c.send(b"x").is_err());

        c.connect(&ConnectionParams::new("/dev/ttyUSB0", 115200))
            .unwrap();
        assert!(c.is_connected());
        assert_eq!(c.send(b"abc").unwrap(), 3);
        assert!(c.receive().unwrap().is_empty());
    }
}
