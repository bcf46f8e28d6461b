//! # PumpsX4 Core Library
//!
//! Core functionality for driving the PumpsX4 peristaltic pump controller.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Line-based serial protocol for the pump firmware
//! - One shared serial connection per device path
//! - Cross-process locking of the serial line
//! - Identity handshake and liveness checks
//! - A host-facing output facade with volume telemetry
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pumpsx4_core::prelude::*;
//!
//! let registry = Arc::new(ConnectionRegistry::new(SerialOpener));
//! let pumps = PumpController::new(&registry, "/dev/ttyUSB0", ProtocolTiming::default());
//!
//! if pumps.is_ready() {
//!     pumps.dispense(2, 12.5)?;
//! }
//! ```

pub mod config;
pub mod output;
pub mod protocol;
pub mod simulator;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{LockConfig, LockStrategy, PumpConfig};
    pub use crate::output::{
        ButtonArgs, ChannelStateStore, MemoryStateStore, MemoryVolumeSink, OutputState,
        OutputType, PumpOutput, VolumeRecord, VolumeSink,
    };
    pub use crate::protocol::{
        Command, ConnectionRegistry, ControllerState, DeviceConnection, Identity, NamedLock,
        PortOpener, ProtocolTiming, PumpController, PumpError, PumpPort, SerialOpener,
    };
    pub use crate::simulator::SimulatedPump;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
