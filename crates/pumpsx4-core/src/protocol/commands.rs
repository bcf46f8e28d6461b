//! Protocol commands
//!
//! Defines the commands understood by the PumpsX4 firmware.

use std::fmt;

use super::{PumpError, MAX_PUMP_INDEX, PRIMARY_PUMP_COUNT};

/// Protocol commands for pump communication
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Dispense on one of the first four steppers (opcode 1)
    Dispense {
        /// Pump index, 1-4
        pump: u8,
        /// Volume in millilitres
        amount_ml: f64,
    },

    /// Start calibration on one of the first four steppers (opcode 2)
    CalibrationStart {
        /// Pump index, 1-4
        pump: u8,
        /// Calibration target volume in millilitres
        amount_ml: f64,
    },

    /// Query identity (opcode 3)
    Ping,

    /// Stop all steppers immediately (opcode 4)
    ResetAll,

    /// Dispense on the secondary stepper pair (opcode 5)
    DispenseSecondary {
        /// Pump index renumbered to 1-2
        pump: u8,
        /// Volume in millilitres
        amount_ml: f64,
    },

    /// Start calibration on the secondary stepper pair (opcode 6)
    CalibrationStartSecondary {
        /// Pump index as selected by the caller (5-6)
        pump: u8,
        /// Calibration target volume in millilitres
        amount_ml: f64,
    },

    /// First phase of stopping calibration (opcode 7)
    CalibrationStopPhase1,

    /// Second phase of stopping calibration (opcode 8)
    CalibrationStopPhase2,

    /// Liveness query (opcode 9)
    Liveness,
}

impl Command {
    /// Build a dispense command for a 1-based pump index.
    ///
    /// Pumps 5 and 6 live on a second opcode family and are renumbered to 1 and 2.
    pub fn dispense(pump: u8, amount_ml: f64) -> Result<Self, PumpError> {
        validate_pump(pump)?;
        validate_amount(amount_ml)?;

        if pump <= PRIMARY_PUMP_COUNT {
            Ok(Command::Dispense { pump, amount_ml })
        } else {
            Ok(Command::DispenseSecondary {
                pump: pump - PRIMARY_PUMP_COUNT,
                amount_ml,
            })
        }
    }

    /// Build a calibration start command for a 1-based pump index.
    ///
    /// Unlike [`Command::dispense`], the secondary family receives the index unmodified.
    pub fn calibration_start(pump: u8, amount_ml: f64) -> Result<Self, PumpError> {
        validate_pump(pump)?;
        validate_amount(amount_ml)?;

        if pump <= PRIMARY_PUMP_COUNT {
            Ok(Command::CalibrationStart { pump, amount_ml })
        } else {
            Ok(Command::CalibrationStartSecondary { pump, amount_ml })
        }
    }

    /// Leading opcode of the wire line
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Dispense { .. } => 1,
            Command::CalibrationStart { .. } => 2,
            Command::Ping => 3,
            Command::ResetAll => 4,
            Command::DispenseSecondary { .. } => 5,
            Command::CalibrationStartSecondary { .. } => 6,
            Command::CalibrationStopPhase1 => 7,
            Command::CalibrationStopPhase2 => 8,
            Command::Liveness => 9,
        }
    }

    /// Encode as a newline-terminated wire line
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Command::Dispense { pump, amount_ml }
            | Command::CalibrationStart { pump, amount_ml }
            | Command::DispenseSecondary { pump, amount_ml }
            | Command::CalibrationStartSecondary { pump, amount_ml } => {
                write!(f, "{} {} {}", self.opcode(), pump, amount_ml)
            }
            _ => write!(f, "{}", self.opcode()),
        }
    }
}

fn validate_pump(pump: u8) -> Result<(), PumpError> {
    if pump == 0 || pump > MAX_PUMP_INDEX {
        return Err(PumpError::InvalidArgument(format!(
            "pump index {} out of range 1-{}",
            pump, MAX_PUMP_INDEX
        )));
    }
    Ok(())
}

fn validate_amount(amount_ml: f64) -> Result<(), PumpError> {
    if !amount_ml.is_finite() || amount_ml <= 0.0 {
        return Err(PumpError::InvalidArgument(format!(
            "amount must be a positive number of ml, got {}",
            amount_ml
        )));
    }
    Ok(())
}
