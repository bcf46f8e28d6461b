//! Output configuration
//!
//! Loaded from JSON. Every field has a default, so `{}` is a valid (if
//! unconfigured) file.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::protocol::{ProtocolTiming, PumpError, MAX_PUMP_INDEX, PRIMARY_PUMP_COUNT};

pub use crate::protocol::{LockConfig, LockStrategy};

/// Configuration for one pump output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Serial device path, e.g. "/dev/ttyUSB0"; the output stays unconfigured without it
    pub uart_location: Option<String>,
    /// Number of pump channels on the board (4 or 6)
    pub channel_count: usize,
    /// Device lock settings
    pub lock: LockConfig,
    /// Exchange timing
    pub timing: ProtocolTiming,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            uart_location: None,
            channel_count: PRIMARY_PUMP_COUNT as usize,
            lock: LockConfig::default(),
            timing: ProtocolTiming::default(),
        }
    }
}

impl PumpConfig {
    /// Config for a device path with everything else defaulted
    pub fn for_device(path: impl Into<String>) -> Self {
        Self {
            uart_location: Some(path.into()),
            ..Self::default()
        }
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PumpError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| PumpError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::debug!(config = %path.display(), "loaded pump config");
        Ok(config)
    }

    /// Check values the driver cannot work with
    pub fn validate(&self) -> Result<(), PumpError> {
        if self.channel_count != PRIMARY_PUMP_COUNT as usize
            && self.channel_count != MAX_PUMP_INDEX as usize
        {
            return Err(PumpError::Config(format!(
                "channel_count must be {} or {}, got {}",
                PRIMARY_PUMP_COUNT, MAX_PUMP_INDEX, self.channel_count
            )));
        }

        if let Some(path) = &self.uart_location {
            if path.trim().is_empty() {
                return Err(PumpError::Config("uart_location is empty".to_string()));
            }
        }

        if self.timing.response_timeout_ms == 0 {
            return Err(PumpError::Config(
                "timing.response_timeout_ms must be positive".to_string(),
            ));
        }

        if self.timing.quiet_period_ms > self.timing.response_timeout_ms {
            tracing::warn!(
                quiet_period_ms = self.timing.quiet_period_ms,
                response_timeout_ms = self.timing.response_timeout_ms,
                "quiet period exceeds response timeout; replies end at the timeout"
            );
        }

        Ok(())
    }
}
