use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pumpsx4_core::prelude::*;
use pumpsx4_core::protocol::{PortSettings, DEFAULT_CALIBRATION_ML};

/// Device path used when simulating without a configured port
const SIMULATED_PATH: &str = "sim://pumpsx4";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial device, overrides uart_location from the config file
    #[arg(long)]
    port: Option<String>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Talk to an in-memory simulated board instead of a serial port
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the board identity (the stirrer output runs for ~5s)
    Ping,
    /// Check that the board answers with the expected identity
    Alive,
    /// Dispense a volume on one pump
    Dispense {
        /// Pump number, 1-6
        pump: u8,
        /// Volume in ml
        ml: f64,
    },
    /// Start calibration on one pump
    Calibrate {
        /// Pump number, 1-6
        pump: u8,
        /// Calibration target volume in ml
        #[arg(default_value_t = DEFAULT_CALIBRATION_ML)]
        ml: f64,
    },
    /// Stop calibration
    StopCalibration {
        /// Pump number that is calibrating
        pump: u8,
    },
    /// Stop all pumps immediately
    Reset,
    /// Print identity and channel states as JSON
    Status,
}

fn load_config(args: &Args) -> Result<PumpConfig> {
    let mut config = match &args.config {
        Some(path) => PumpConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PumpConfig::default(),
    };

    if let Some(port) = &args.port {
        config.uart_location = Some(port.clone());
    }

    if args.simulate {
        config.lock = LockConfig::process();
        if config.uart_location.is_none() {
            config.uart_location = Some(SIMULATED_PATH.to_string());
        }
    }

    config.validate()?;
    Ok(config)
}

fn build_registry(args: &Args, config: &PumpConfig) -> ConnectionRegistry {
    if args.simulate {
        let board = SimulatedPump::new();
        ConnectionRegistry::with_lock_config(
            move |_: &str, _: &PortSettings| -> Result<Box<dyn PumpPort>, PumpError> {
                Ok(Box::new(board.clone()))
            },
            config.lock.clone(),
        )
    } else {
        ConnectionRegistry::with_lock_config(SerialOpener, config.lock.clone())
    }
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let registry = build_registry(&args, &config);

    let sink = Arc::new(MemoryVolumeSink::new());
    let states = Arc::new(MemoryStateStore::new());
    let output = PumpOutput::initialize(config, &registry, sink.clone(), states)?;

    if !output.is_setup() {
        let reason = output
            .controller()
            .and_then(|c| c.setup_error())
            .unwrap_or("no serial device configured (use --port or --simulate)");
        bail!("pump controller not set up: {}", reason);
    }

    match args.command {
        Cmd::Ping => println!("{}", output.ping()?.trim_end()),
        Cmd::Alive => {
            let alive = output.refresh_alive();
            println!("{}", if alive { "alive" } else { "not alive" });
            if !alive {
                bail!("board did not report the expected identity");
            }
        }
        Cmd::Dispense { pump, ml } => {
            let reply = output.dispense_amount(&ButtonArgs::new(pump, ml))?;
            println!("{}", reply.trim_end());
            for record in sink.records() {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Cmd::Calibrate { pump, ml } => {
            let reply = output.start_calibration(&ButtonArgs::new(pump, ml))?;
            println!("{}", reply.trim_end());
        }
        Cmd::StopCalibration { pump } => {
            output.stop_calibration(&ButtonArgs::new(pump, DEFAULT_CALIBRATION_ML))?;
            println!("calibration stopped");
        }
        Cmd::Reset => println!("{}", output.stop_all()?.trim_end()),
        Cmd::Status => {
            let status = serde_json::json!({
                "port": output.config().uart_location,
                "identity": output.identity(),
                "channels": output.channel_states(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    info!(version = pumpsx4_core::VERSION, "pumpsx4 starting");
    run(args)
}
