//! Serial Protocol Communication
//!
//! Implements the PumpsX4 line protocol: a numeric opcode followed by
//! space-separated arguments, terminated by a newline.
//!
//! Structured replies (identity and liveness) are JSON objects; everything
//! else is an opaque acknowledgement line.

pub mod commands;
mod controller;
mod error;
pub mod lock;
mod registry;
mod response;
pub mod serial;

pub use commands::Command;
pub use controller::{ControllerState, ProtocolTiming, PumpController};
pub use error::PumpError;
pub use lock::{LockConfig, LockGuard, LockStrategy, NamedLock};
pub use registry::{ConnectionRegistry, DeviceConnection, PortOpener, SerialOpener};
pub use response::{is_expected_identity, parse_identity, Identity};
pub use serial::{open_port, PortSettings, PumpPort};

/// Fixed baud rate of the pump firmware
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Serial read/write timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum time to wait for the device lock in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

/// Device name reported by healthy firmware
pub const EXPECTED_DEVICE: &str = "PumpsX4";

/// Firmware version the liveness check accepts
pub const EXPECTED_VERSION: &str = "1.0";

/// Number of physical steppers addressed by the primary opcode family
pub const PRIMARY_PUMP_COUNT: u8 = 4;

/// Highest pump index accepted by the driver
pub const MAX_PUMP_INDEX: u8 = 6;

/// Default calibration target volume in millilitres
pub const DEFAULT_CALIBRATION_ML: f64 = 300.0;
