//! Pump controller
//!
//! Drives one PumpsX4 board: identity handshake, locked command/response
//! exchanges and the pump-level operations built on them.

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{
    registry::{ConnectionRegistry, DeviceConnection},
    response::{is_expected_identity, parse_identity, Identity},
    serial::{write_line, PumpPort},
    Command, PumpError, DEFAULT_CALIBRATION_ML, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_TIMEOUT_MS,
};

/// Interval between input polls while waiting for a reply
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Timing knobs for a command/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolTiming {
    /// Pause between writing a command and the first input poll
    pub settle_delay_ms: u64,
    /// A reply is complete once no byte arrived for this long
    pub quiet_period_ms: u64,
    /// Upper bound on collecting a reply
    pub response_timeout_ms: u64,
    /// Upper bound on waiting for the device lock
    pub lock_timeout_ms: u64,
    /// Pause between the two calibration-stop opcodes
    pub calibration_stop_delay_ms: u64,
}

impl Default for ProtocolTiming {
    fn default() -> Self {
        Self {
            settle_delay_ms: 100,
            quiet_period_ms: 250,
            response_timeout_ms: DEFAULT_TIMEOUT_MS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            calibration_stop_delay_ms: 100,
        }
    }
}

impl ProtocolTiming {
    /// Default reply timeout as a [`Duration`]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Handshake succeeded; identity is known
    Ready,
    /// Opening the port or the handshake failed
    NotReady,
}

/// Driver for one PumpsX4 board
#[derive(Debug)]
pub struct PumpController {
    /// Device path
    path: String,
    /// Shared port, absent if opening failed
    connection: Option<Arc<DeviceConnection>>,
    /// Current state
    state: ControllerState,
    /// Identity from the handshake
    identity: Option<Identity>,
    /// Why the controller is not ready
    setup_error: Option<String>,
    /// Exchange timing
    timing: ProtocolTiming,
}

impl PumpController {
    /// Open (or reuse) the connection for `path` and run the identity handshake.
    ///
    /// Only the first controller on a connection pings the board; later ones
    /// reuse its identity. A failed handshake is not remembered.
    ///
    /// Never fails: any problem leaves the controller in
    /// [`ControllerState::NotReady`] with the cause in [`Self::setup_error`].
    pub fn new(registry: &ConnectionRegistry, path: &str, timing: ProtocolTiming) -> Self {
        let mut controller = Self {
            path: path.to_string(),
            connection: None,
            state: ControllerState::NotReady,
            identity: None,
            setup_error: None,
            timing,
        };

        let connection = match registry.get_or_open(path) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(path, "failed to open pump controller: {}", e);
                controller.setup_error = Some(e.to_string());
                return controller;
            }
        };
        controller.connection = Some(Arc::clone(&connection));

        let handshake = {
            let mut slot = connection.identity_slot();
            match slot.as_ref() {
                Some(identity) => {
                    tracing::debug!(path, "reusing handshake of shared connection");
                    Ok(identity.clone())
                }
                None => {
                    let result = controller.handshake();
                    if let Ok(identity) = &result {
                        *slot = Some(identity.clone());
                    }
                    result
                }
            }
        };

        match handshake {
            Ok(identity) => {
                tracing::info!(
                    path,
                    device = %identity.device,
                    version = %identity.version,
                    "pump controller ready"
                );
                controller.identity = Some(identity);
                controller.state = ControllerState::Ready;
            }
            Err(e) => {
                tracing::error!(path, "handshake failed: {}", e);
                controller.setup_error = Some(e.to_string());
            }
        }

        controller
    }

    /// Device path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current state
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Check if the handshake succeeded
    pub fn is_ready(&self) -> bool {
        self.state == ControllerState::Ready
    }

    /// Identity reported during the handshake
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Reason the controller is not ready
    pub fn setup_error(&self) -> Option<&str> {
        self.setup_error.as_deref()
    }

    /// Shared connection, if the port could be opened
    pub fn connection(&self) -> Option<&Arc<DeviceConnection>> {
        self.connection.as_ref()
    }

    /// Exchange timing
    pub fn timing(&self) -> &ProtocolTiming {
        &self.timing
    }

    fn handshake(&self) -> Result<Identity, PumpError> {
        let raw = self.exchange(&Command::Ping, self.timing.response_timeout(), false)?;
        tracing::debug!(path = %self.path, raw = %raw.trim_end(), "handshake reply");
        parse_identity(&raw)
    }

    fn ensure_ready(&self) -> Result<(), PumpError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(PumpError::NotReady(
                self.setup_error
                    .clone()
                    .unwrap_or_else(|| "handshake has not succeeded".to_string()),
            ))
        }
    }

    fn require_connection(&self) -> Result<&Arc<DeviceConnection>, PumpError> {
        self.connection.as_ref().ok_or_else(|| {
            PumpError::NotReady(
                self.setup_error
                    .clone()
                    .unwrap_or_else(|| format!("{} is not open", self.path)),
            )
        })
    }

    /// Send one command and collect the reply.
    ///
    /// Holds the device lock for the whole exchange. The reply is complete once
    /// the input has been quiet for the configured period, or when `timeout`
    /// runs out. An empty reply is [`PumpError::NoResponse`].
    pub fn send_command(&self, command: &Command, timeout: Duration) -> Result<String, PumpError> {
        self.ensure_ready()?;
        self.exchange(command, timeout, false)
    }

    fn exchange(
        &self,
        command: &Command,
        timeout: Duration,
        clear_input: bool,
    ) -> Result<String, PumpError> {
        let connection = self.require_connection()?;
        let path = connection.path();
        let opcode = command.opcode();

        let _lock = connection
            .lock()
            .acquire(self.timing.lock_timeout())
            .map_err(|e| {
                tracing::warn!(path, opcode, "not sending command: {}", e);
                e
            })?;
        let mut port = connection.port();

        if clear_input {
            port.clear_input()
                .map_err(|e| PumpError::Serial(format!("failed to clear input: {}", e)))?;
        }

        let line = command.to_line();
        tracing::debug!(path, opcode, line = %line.trim_end(), "sending command");

        let start = Instant::now();
        write_line(port.as_mut(), &line).map_err(|e| {
            tracing::error!(path, opcode, "write failed: {}", e);
            e
        })?;
        std::thread::sleep(self.timing.settle_delay());

        let response = read_response(port.as_mut(), start, timeout, self.timing.quiet_period())
            .map_err(|e| {
                tracing::error!(path, opcode, "read failed: {}", e);
                e
            })?;

        if response.is_empty() {
            tracing::warn!(path, opcode, "no response within {}ms", timeout.as_millis());
            return Err(PumpError::NoResponse {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        let text = String::from_utf8_lossy(&response).into_owned();
        tracing::debug!(
            path,
            opcode,
            bytes = response.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            response = %text.trim_end(),
            "received response"
        );
        Ok(text)
    }

    /// Dispense `amount_ml` on pump `pump` (1-6).
    ///
    /// Pumps 5 and 6 are addressed as 1 and 2 of the secondary opcode family.
    pub fn dispense(&self, pump: u8, amount_ml: f64) -> Result<String, PumpError> {
        self.ensure_ready()?;
        let command = Command::dispense(pump, amount_ml)?;
        tracing::info!(path = %self.path, pump, amount_ml, "dispensing");
        self.exchange(&command, self.timing.response_timeout(), false)
    }

    /// Start calibration on pump `pump` with a target volume (300 ml if `None`)
    pub fn set_calibration_mode(
        &self,
        pump: u8,
        amount_ml: Option<f64>,
    ) -> Result<String, PumpError> {
        self.ensure_ready()?;
        let amount_ml = amount_ml.unwrap_or(DEFAULT_CALIBRATION_ML);
        let command = Command::calibration_start(pump, amount_ml)?;
        tracing::info!(path = %self.path, pump, amount_ml, "starting calibration");
        self.exchange(&command, self.timing.response_timeout(), false)
    }

    /// Stop calibration with the two-phase opcode sequence.
    ///
    /// The firmware does not confirm either phase, so exchange failures are
    /// only logged. Errors only when the controller is not ready.
    pub fn stop_calibration_mode(&self) -> Result<(), PumpError> {
        self.ensure_ready()?;
        tracing::info!(path = %self.path, "stopping calibration");

        let timeout = self.timing.response_timeout();
        if let Err(e) = self.exchange(&Command::CalibrationStopPhase1, timeout, false) {
            tracing::warn!(path = %self.path, "calibration stop phase 1: {}", e);
        }
        std::thread::sleep(Duration::from_millis(self.timing.calibration_stop_delay_ms));
        if let Err(e) = self.exchange(&Command::CalibrationStopPhase2, timeout, false) {
            tracing::warn!(path = %self.path, "calibration stop phase 2: {}", e);
        }
        Ok(())
    }

    /// Ask the board for its identity JSON.
    ///
    /// A successful ping also switches the stirrer output on for about five
    /// seconds; operators use it as a physical confirmation.
    pub fn ping(&self) -> Result<String, PumpError> {
        self.send_command(&Command::Ping, self.timing.response_timeout())
    }

    /// Immediately stop all pumps
    pub fn reset_all(&self) -> Result<String, PumpError> {
        self.ensure_ready()?;
        tracing::info!(path = %self.path, "stopping all pumps");
        self.exchange(&Command::ResetAll, self.timing.response_timeout(), false)
    }

    /// Query liveness; true only if the board reports the expected identity.
    ///
    /// Stale input is discarded first. Every failure reads as "not alive", and
    /// a controller that is not ready does not touch the port.
    pub fn check_alive_status(&self) -> bool {
        if let Err(e) = self.ensure_ready() {
            tracing::warn!(path = %self.path, "liveness not queried: {}", e);
            return false;
        }

        let raw = match self.exchange(&Command::Liveness, self.timing.response_timeout(), true) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %self.path, "liveness query failed: {}", e);
                return false;
            }
        };

        match parse_identity(&raw) {
            Ok(identity) if is_expected_identity(&identity) => true,
            Ok(identity) => {
                tracing::warn!(
                    path = %self.path,
                    device = %identity.device,
                    version = %identity.version,
                    "unexpected identity in liveness reply"
                );
                false
            }
            Err(e) => {
                tracing::warn!(path = %self.path, "liveness reply: {}", e);
                false
            }
        }
    }
}

/// Drain the input until it has been quiet for `quiet` or `timeout` has passed since `start`.
fn read_response(
    port: &mut dyn PumpPort,
    start: Instant,
    timeout: Duration,
    quiet: Duration,
) -> Result<Vec<u8>, PumpError> {
    let mut response = Vec::new();
    let mut buffer = [0u8; 256];
    let mut last_data_time = Instant::now();

    loop {
        if start.elapsed() >= timeout {
            break;
        }

        let available = port
            .bytes_to_read()
            .map_err(|e| PumpError::Serial(e.to_string()))?;

        if available > 0 {
            let to_read = std::cmp::min(available as usize, buffer.len());
            match port.read(&mut buffer[..to_read]) {
                Ok(0) => break,
                Ok(n) => {
                    response.extend_from_slice(&buffer[..n]);
                    last_data_time = Instant::now();
                }
                Err(ref e)
                    if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(PumpError::Serial(e.to_string())),
            }
        } else if !response.is_empty() && last_data_time.elapsed() >= quiet {
            break;
        } else {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    Ok(response)
}
