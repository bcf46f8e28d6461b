//! Pump output
//!
//! Host-facing side of the driver. Wraps a [`PumpController`] behind the
//! operations a host exposes for an output (switching, emergency stop,
//! dispense and calibration actions) and reports results to the host's
//! telemetry and channel-state collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::PumpConfig;
use crate::protocol::{ConnectionRegistry, Identity, PumpController, PumpError};

/// Message returned when an output is used before it was set up
pub const NOT_SET_UP_MESSAGE: &str = concat!(
    "Error 101: Device not set up. ",
    "See https://kizniche.github.io/Mycodo/Error-Codes#error-101 for more info."
);

/// One dispensed volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// 0-based channel
    pub channel: usize,
    /// Volume in millilitres
    pub amount_ml: f64,
    /// When the dispense command was acknowledged
    pub timestamp: DateTime<Utc>,
}

/// Receives dispensed volumes
pub trait VolumeSink: Send + Sync {
    /// Record one dispense
    fn record(&self, record: &VolumeRecord);
}

/// Per-channel boolean state shown by the host
pub trait ChannelStateStore: Send + Sync {
    /// Current state of `channel`
    fn get(&self, channel: usize) -> bool;
    /// Update `channel`
    fn set(&self, channel: usize, on: bool);
}

/// Volume sink that keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryVolumeSink {
    records: Mutex<Vec<VolumeRecord>>,
}

impl MemoryVolumeSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Records received so far
    pub fn records(&self) -> Vec<VolumeRecord> {
        self.records.lock().clone()
    }

    /// Sum of recorded volumes for `channel`
    pub fn total_ml(&self, channel: usize) -> f64 {
        self.records
            .lock()
            .iter()
            .filter(|r| r.channel == channel)
            .map(|r| r.amount_ml)
            .sum()
    }
}

impl VolumeSink for MemoryVolumeSink {
    fn record(&self, record: &VolumeRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Channel states kept in memory; unknown channels read as off
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<usize, bool>>,
}

impl MemoryStateStore {
    /// All channels off
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelStateStore for MemoryStateStore {
    fn get(&self, channel: usize) -> bool {
        self.states.lock().get(&channel).copied().unwrap_or(false)
    }

    fn set(&self, channel: usize, on: bool) {
        self.states.lock().insert(channel, on);
    }
}

/// Requested output state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputState {
    /// Switch on
    On,
    /// Switch off
    Off,
}

/// Unit of a switch amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputType {
    /// Seconds
    #[serde(rename = "sec")]
    Seconds,
    /// Millilitres
    #[serde(rename = "vol")]
    Volume,
    /// Duty cycle
    #[serde(rename = "pwm")]
    Pwm,
}

/// Arguments of the host's action buttons
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ButtonArgs {
    /// Selected pump, as the host's select input reports it ("1".."6")
    pub pump_number: Option<String>,
    /// Amount in millilitres
    pub dispense_ml: Option<f64>,
}

impl ButtonArgs {
    /// Arguments for pump `pump` and `amount_ml`
    pub fn new(pump: u8, amount_ml: f64) -> Self {
        Self {
            pump_number: Some(pump.to_string()),
            dispense_ml: Some(amount_ml),
        }
    }

    fn validate(&self, channel_count: usize) -> Result<(u8, f64), PumpError> {
        let raw = self.pump_number.as_deref().ok_or_else(|| {
            PumpError::InvalidArgument("pump_number is required but not provided".into())
        })?;
        let pump: u8 = raw.trim().parse().map_err(|_| {
            PumpError::InvalidArgument(format!("pump_number does not represent a pump: '{}'", raw))
        })?;
        if pump == 0 || pump as usize > channel_count {
            return Err(PumpError::InvalidArgument(format!(
                "pump_number {} out of range 1-{}",
                pump, channel_count
            )));
        }

        let amount = self.dispense_ml.ok_or_else(|| {
            PumpError::InvalidArgument("dispense_ml is required but not provided".into())
        })?;
        if !amount.is_finite() || amount <= 0.0 {
            return Err(PumpError::InvalidArgument(format!(
                "dispense_ml must be positive, got {}",
                amount
            )));
        }

        Ok((pump, amount))
    }
}

/// A pump board exposed as a host output
pub struct PumpOutput {
    config: PumpConfig,
    controller: Option<PumpController>,
    sink: Arc<dyn VolumeSink>,
    states: Arc<dyn ChannelStateStore>,
}

impl PumpOutput {
    /// Set up the output from `config`.
    ///
    /// Fails only on invalid configuration, including a `lock` section that
    /// disagrees with the registry's. A missing device path or a board that
    /// does not answer the handshake leaves the output un-set-up.
    pub fn initialize(
        config: PumpConfig,
        registry: &ConnectionRegistry,
        sink: Arc<dyn VolumeSink>,
        states: Arc<dyn ChannelStateStore>,
    ) -> Result<Self, PumpError> {
        config.validate()?;
        if registry.lock_config() != &config.lock {
            return Err(PumpError::Config(format!(
                "lock settings {:?} do not match the connection registry's {:?}",
                config.lock,
                registry.lock_config()
            )));
        }

        let controller = match config.uart_location.as_deref() {
            Some(path) => {
                let controller = PumpController::new(registry, path, config.timing);
                match controller.identity() {
                    Some(identity) => tracing::info!(
                        path,
                        device = %identity.device,
                        version = %identity.version,
                        "output set up"
                    ),
                    None => tracing::error!(
                        path,
                        reason = controller.setup_error().unwrap_or("unknown"),
                        "output not set up"
                    ),
                }
                Some(controller)
            }
            None => {
                tracing::warn!("no uart_location configured, output not set up");
                None
            }
        };

        Ok(Self {
            config,
            controller,
            sink,
            states,
        })
    }

    /// Whether the output was set up successfully
    pub fn is_setup(&self) -> bool {
        self.controller
            .as_ref()
            .map(|c| c.is_ready())
            .unwrap_or(false)
    }

    /// Configuration the output was built from
    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    /// Underlying controller, if a device path was configured
    pub fn controller(&self) -> Option<&PumpController> {
        self.controller.as_ref()
    }

    /// Identity of the board
    pub fn identity(&self) -> Option<&Identity> {
        self.controller.as_ref().and_then(|c| c.identity())
    }

    fn ready_controller(&self) -> Result<&PumpController, PumpError> {
        match &self.controller {
            Some(controller) if controller.is_ready() => Ok(controller),
            _ => {
                tracing::error!("{}", NOT_SET_UP_MESSAGE);
                Err(PumpError::NotReady(NOT_SET_UP_MESSAGE.to_string()))
            }
        }
    }

    fn check_channel(&self, channel: usize) -> Result<(), PumpError> {
        if channel >= self.config.channel_count {
            return Err(PumpError::InvalidArgument(format!(
                "channel {} out of range 0-{}",
                channel,
                self.config.channel_count - 1
            )));
        }
        Ok(())
    }

    fn record_dispense(&self, pump: u8, amount_ml: f64) {
        let record = VolumeRecord {
            channel: pump as usize - 1,
            amount_ml,
            timestamp: Utc::now(),
        };
        tracing::debug!(channel = record.channel, amount_ml, "recording dispensed volume");
        self.sink.record(&record);
    }

    /// Switch a channel.
    ///
    /// Only volume dispenses are supported when switching on; the channel
    /// reads as on while the dispense command is in flight.
    pub fn output_switch(
        &self,
        state: OutputState,
        output_type: Option<OutputType>,
        amount: Option<f64>,
        channel: usize,
    ) -> Result<String, PumpError> {
        let controller = self.ready_controller()?;
        self.check_channel(channel)?;

        tracing::info!(?state, ?output_type, ?amount, channel, "output switch");

        match (state, output_type, amount) {
            (OutputState::On, Some(OutputType::Volume), Some(amount)) if amount > 0.0 => {
                let pump = channel as u8 + 1;
                self.states.set(channel, true);
                let result = controller.dispense(pump, amount);
                self.states.set(channel, false);

                let reply = result.map_err(|e| {
                    tracing::error!(
                        channel,
                        amount,
                        transient = e.is_transient(),
                        "dispense failed: {}",
                        e
                    );
                    e
                })?;
                self.record_dispense(pump, amount);
                Ok(reply)
            }
            (OutputState::Off, _, _) => {
                self.states.set(channel, false);
                Ok(String::new())
            }
            _ => Err(PumpError::InvalidArgument(format!(
                "unsupported switch: state={:?}, type={:?}, amount={:?}",
                state, output_type, amount
            ))),
        }
    }

    /// State of `channel`, `None` when the output is not set up
    pub fn is_on(&self, channel: usize) -> Option<bool> {
        if !self.is_setup() {
            return None;
        }
        Some(self.states.get(channel))
    }

    /// States of all channels, `None` when the output is not set up
    pub fn channel_states(&self) -> Option<Vec<bool>> {
        if !self.is_setup() {
            return None;
        }
        Some(
            (0..self.config.channel_count)
                .map(|channel| self.states.get(channel))
                .collect(),
        )
    }

    /// Emergency stop: halt every pump
    pub fn stop_all(&self) -> Result<String, PumpError> {
        let reply = self.ready_controller()?.reset_all()?;
        tracing::warn!("stopped all pumps");
        Ok(reply)
    }

    /// Ping the board; the stirrer output runs for about five seconds on success
    pub fn ping(&self) -> Result<String, PumpError> {
        self.ready_controller()?.ping()
    }

    /// Dispense action: validate arguments, dispense, record the volume
    pub fn dispense_amount(&self, args: &ButtonArgs) -> Result<String, PumpError> {
        let controller = self.ready_controller()?;
        let (pump, amount) = self.validate_args(args)?;

        let reply = controller.dispense(pump, amount)?;
        self.record_dispense(pump, amount);
        Ok(reply)
    }

    /// Start calibration on the selected pump with the selected target volume
    pub fn start_calibration(&self, args: &ButtonArgs) -> Result<String, PumpError> {
        let controller = self.ready_controller()?;
        let (pump, amount) = self.validate_args(args)?;
        controller.set_calibration_mode(pump, Some(amount))
    }

    /// Stop calibration
    pub fn stop_calibration(&self, args: &ButtonArgs) -> Result<(), PumpError> {
        let controller = self.ready_controller()?;
        self.validate_args(args)?;
        controller.stop_calibration_mode()
    }

    /// Run the liveness check and publish the result to every channel state
    pub fn refresh_alive(&self) -> bool {
        let alive = match &self.controller {
            Some(controller) if controller.is_ready() => controller.check_alive_status(),
            _ => false,
        };

        for channel in 0..self.config.channel_count {
            self.states.set(channel, alive);
        }
        tracing::debug!(alive, "liveness refreshed");
        alive
    }

    fn validate_args(&self, args: &ButtonArgs) -> Result<(u8, f64), PumpError> {
        args.validate(self.config.channel_count).map_err(|e| {
            tracing::error!("Invalid input parameters: {}", e);
            e
        })
    }
}

impl std::fmt::Debug for PumpOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpOutput")
            .field("config", &self.config)
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}
