//! Serial port handling
//!
//! Provides low-level serial port access for the pump controller.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

use super::{PumpError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Byte stream the protocol driver talks through.
///
/// Implemented for real serial ports and for the in-memory simulator.
pub trait PumpPort: Read + Write + Send {
    /// Number of bytes waiting in the input buffer
    fn bytes_to_read(&self) -> io::Result<u32>;

    /// Discard anything sitting in the input buffer
    fn clear_input(&mut self) -> io::Result<()>;
}

impl PumpPort for Box<dyn SerialPort> {
    fn bytes_to_read(&self) -> io::Result<u32> {
        SerialPort::bytes_to_read(&**self).map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Line settings used when opening a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Read and write timeout
    pub timeout: Duration,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Open a serial port configured for the pump firmware
pub fn open_port(name: &str, settings: &PortSettings) -> Result<Box<dyn SerialPort>, PumpError> {
    let mut port = serialport::new(name, settings.baud_rate)
        .timeout(settings.timeout)
        .open()
        .map_err(|e| PumpError::ConnectionError {
            path: name.to_string(),
            reason: e.to_string(),
        })?;

    configure_port(port.as_mut())?;
    Ok(port)
}

/// Configure a serial port as 8N1 without flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), PumpError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| PumpError::Serial(e.to_string()))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| PumpError::Serial(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| PumpError::Serial(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| PumpError::Serial(e.to_string()))?;
    Ok(())
}

/// Write a full line, mapping timeouts to [`PumpError::WriteTimeout`]
///
/// No flush: on serial ports flush() is tcdrain, which can block well past the
/// write timeout, and write_all already hands the bytes to the kernel.
pub(crate) fn write_line(port: &mut dyn PumpPort, line: &str) -> Result<(), PumpError> {
    match port.write_all(line.as_bytes()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(PumpError::WriteTimeout),
        Err(e) => Err(PumpError::Serial(format!("failed to send command: {}", e))),
    }
}
