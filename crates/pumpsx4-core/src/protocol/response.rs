//! Identity replies
//!
//! Ping and liveness replies carry a small JSON object naming the firmware.

use serde::{Deserialize, Serialize};

use super::{PumpError, EXPECTED_DEVICE, EXPECTED_VERSION};

/// Firmware identity reported by ping and liveness replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Device name, "PumpsX4" on current firmware
    pub device: String,
    /// Firmware version string
    pub version: String,
}

/// Parse an identity object out of a raw reply.
///
/// Surrounding whitespace and line endings are ignored; anything else that is
/// not a JSON object with string `device` and `version` fields is rejected.
pub fn parse_identity(raw: &str) -> Result<Identity, PumpError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PumpError::MalformedResponse("empty reply".to_string()));
    }
    serde_json::from_str(trimmed)
        .map_err(|e| PumpError::MalformedResponse(format!("{}: {:?}", e, trimmed)))
}

/// Whether an identity belongs to the supported firmware
pub fn is_expected_identity(identity: &Identity) -> bool {
    identity.device == EXPECTED_DEVICE && identity.version == EXPECTED_VERSION
}
