//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the pump controller
#[derive(Error, Debug)]
pub enum PumpError {
    /// The device path could not be opened
    #[error("Cannot open {path}: {reason}")]
    ConnectionError {
        /// Device path
        path: String,
        /// Message from the serial layer
        reason: String,
    },

    /// Another holder kept the device lock past the wait budget
    #[error("Timed out after {waited_ms}ms waiting for lock on {path}")]
    LockTimeout {
        /// Device path
        path: String,
        /// How long acquisition waited
        waited_ms: u64,
    },

    /// Nothing arrived before the reply timeout
    #[error("No response received within {timeout_ms}ms")]
    NoResponse {
        /// Reply timeout that ran out
        timeout_ms: u64,
    },

    /// A reply could not be parsed
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Writing the command line timed out
    #[error("Timeout while sending command")]
    WriteTimeout,

    /// Any other serial transport failure
    #[error("Serial port error: {0}")]
    Serial(String),

    /// The controller never completed its handshake
    #[error("Device not set up: {0}")]
    NotReady(String),

    /// Pump index or amount out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lock file or config file I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PumpError {
    /// Whether a later call on the same controller may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PumpError::LockTimeout { .. }
                | PumpError::NoResponse { .. }
                | PumpError::WriteTimeout
                | PumpError::Serial(_)
                | PumpError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_display() {
        let err = PumpError::LockTimeout {
            path: "/dev/ttyUSB0".to_string(),
            waited_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 5000ms waiting for lock on /dev/ttyUSB0"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(PumpError::NoResponse { timeout_ms: 10 }.is_transient());
        assert!(PumpError::WriteTimeout.is_transient());
        assert!(!PumpError::NotReady("no identity".into()).is_transient());
        assert!(!PumpError::MalformedResponse("x".into()).is_transient());
    }
}
