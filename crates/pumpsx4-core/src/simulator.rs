//! Simulated pump controller
//!
//! An in-memory [`PumpPort`] that answers the line protocol the way the
//! PumpsX4 firmware does. Used by tests and by the CLI's simulate mode.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::protocol::{
    PumpPort, EXPECTED_DEVICE, EXPECTED_VERSION, MAX_PUMP_INDEX, PRIMARY_PUMP_COUNT,
};

/// Simulated PumpsX4 board.
///
/// Clones share state, so a test can keep one handle while the registry owns
/// another.
#[derive(Debug, Clone)]
pub struct SimulatedPump {
    state: Arc<Mutex<SimState>>,
}

#[derive(Debug)]
struct SimState {
    /// Bytes waiting for the host to read
    input: VecDeque<u8>,
    /// Written bytes not yet terminated by a newline
    partial: Vec<u8>,
    /// Every complete line received, without terminator
    written: Vec<String>,
    /// Reply to opcode 3
    identity_reply: String,
    /// Reply to opcode 9, identity reply if unset
    alive_reply: Option<String>,
    /// Swallow commands without answering
    silent: bool,
    /// Number of upcoming writes that fail with a timeout
    failing_writes: usize,
    /// Number of input clears requested by the host
    input_clears: usize,
    /// Total volume dispensed per pump (index 0 = pump 1)
    dispensed_ml: [f64; MAX_PUMP_INDEX as usize],
    /// Pump currently in calibration mode
    calibrating: Option<u8>,
}

impl Default for SimulatedPump {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPump {
    /// Healthy board reporting `PumpsX4` version `1.0`
    pub fn new() -> Self {
        let identity = format!(
            "{{\"device\":\"{}\",\"version\":\"{}\"}}",
            EXPECTED_DEVICE, EXPECTED_VERSION
        );
        Self {
            state: Arc::new(Mutex::new(SimState {
                input: VecDeque::new(),
                partial: Vec::new(),
                written: Vec::new(),
                identity_reply: identity,
                alive_reply: None,
                silent: false,
                failing_writes: 0,
                input_clears: 0,
                dispensed_ml: [0.0; MAX_PUMP_INDEX as usize],
                calibrating: None,
            })),
        }
    }

    /// Use `reply` as the answer to ping
    pub fn with_identity_reply(self, reply: &str) -> Self {
        self.state().identity_reply = reply.to_string();
        self
    }

    /// Start out not answering anything
    pub fn silent(self) -> Self {
        self.set_silent(true);
        self
    }

    /// Toggle answering commands
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Use `reply` as the answer to the liveness query
    pub fn set_alive_reply(&self, reply: &str) {
        self.state().alive_reply = Some(reply.to_string());
    }

    /// Make the next `count` writes fail with a timeout
    pub fn fail_next_writes(&self, count: usize) {
        self.state().failing_writes = count;
    }

    /// Put unsolicited bytes into the input buffer
    pub fn inject_input(&self, bytes: &[u8]) {
        self.state().input.extend(bytes.iter().copied());
    }

    /// Lines received so far
    pub fn written_lines(&self) -> Vec<String> {
        self.state().written.clone()
    }

    /// Forget received lines
    pub fn clear_written(&self) {
        self.state().written.clear();
    }

    /// How often the host cleared the input buffer
    pub fn input_clears(&self) -> usize {
        self.state().input_clears
    }

    /// Total volume dispensed by pump `pump` (1-based)
    pub fn dispensed_ml(&self, pump: u8) -> f64 {
        match pump {
            1..=MAX_PUMP_INDEX => self.state().dispensed_ml[pump as usize - 1],
            _ => 0.0,
        }
    }

    /// Pump in calibration mode, if any
    pub fn calibrating(&self) -> Option<u8> {
        self.state().calibrating
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock()
    }
}

impl SimState {
    fn handle_line(&mut self, line: &str) {
        self.written.push(line.to_string());

        let mut tokens = line.split_whitespace();
        let opcode = tokens.next().unwrap_or("");
        let pump = tokens.next().and_then(|t| t.parse::<u8>().ok());
        let amount = tokens.next().and_then(|t| t.parse::<f64>().ok());

        let reply = match opcode {
            "1" | "5" => {
                let offset = if opcode == "5" { PRIMARY_PUMP_COUNT } else { 0 };
                if let (Some(pump), Some(amount)) = (pump, amount) {
                    let index = pump as usize + offset as usize;
                    if (1..=MAX_PUMP_INDEX as usize).contains(&index) {
                        self.dispensed_ml[index - 1] += amount;
                    }
                }
                "---".to_string()
            }
            "2" | "6" => {
                self.calibrating = pump;
                "Calibration mode on".to_string()
            }
            "3" => self.identity_reply.clone(),
            "4" => "Stopped all pumps.".to_string(),
            "7" | "8" => {
                self.calibrating = None;
                "Calibration mode off".to_string()
            }
            "9" => self
                .alive_reply
                .clone()
                .unwrap_or_else(|| self.identity_reply.clone()),
            other => format!("Unknown function number: {}", other),
        };

        if !self.silent {
            self.input.extend(reply.bytes());
            self.input.extend(b"\r\n".iter().copied());
        }
    }
}

impl Read for SimulatedPump {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.input.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
        }
        let n = buf.len().min(state.input.len());
        for (slot, byte) in buf.iter_mut().zip(state.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedPump {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
        }

        for &byte in buf {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&state.partial).trim().to_string();
                state.partial.clear();
                state.handle_line(&line);
            } else {
                state.partial.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PumpPort for SimulatedPump {
    fn bytes_to_read(&self) -> io::Result<u32> {
        Ok(self.state().input.len() as u32)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = self.state();
        state.input.clear();
        state.input_clears += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn read_all(port: &mut SimulatedPump) -> String {
        let mut buf = [0u8; 128];
        let n = port.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn test_ping_answers_identity() {
        let mut port = SimulatedPump::new();
        port.write_all(b"3\n").unwrap();
        assert_eq!(read_all(&mut port), "{\"device\":\"PumpsX4\",\"version\":\"1.0\"}\r\n");
    }

    #[test]
    fn test_secondary_dispense_lands_on_pump_six() {
        let mut port = SimulatedPump::new();
        port.write_all(b"5 2 12.5\n").unwrap();
        assert_eq!(read_all(&mut port), "---\r\n");
        assert_eq!(port.dispensed_ml(6), 12.5);
        assert_eq!(port.dispensed_ml(2), 0.0);
    }

    #[test]
    fn test_partial_line_is_not_answered() {
        let mut port = SimulatedPump::new();
        port.write_all(b"4").unwrap();
        assert_eq!(port.bytes_to_read().unwrap(), 0);
        port.write_all(b"\n").unwrap();
        assert_eq!(read_all(&mut port), "Stopped all pumps.\r\n");
    }

    #[test]
    fn test_unknown_opcode() {
        let mut port = SimulatedPump::new();
        port.write_all(b"42\n").unwrap();
        assert_eq!(read_all(&mut port), "Unknown function number: 42\r\n");
    }

    #[test]
    fn test_calibration_tracking() {
        let mut port = SimulatedPump::new();
        port.write_all(b"6 5 300\n").unwrap();
        assert_eq!(port.calibrating(), Some(5));
        port.write_all(b"7\n8\n").unwrap();
        assert_eq!(port.calibrating(), None);
    }

    #[test]
    fn test_failing_write() {
        let mut port = SimulatedPump::new();
        port.fail_next_writes(1);
        let err = port.write_all(b"3\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(port.written_lines().is_empty());
        port.write_all(b"3\n").unwrap();
        assert_eq!(port.written_lines(), vec!["3".to_string()]);
    }
}
