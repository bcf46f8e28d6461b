use pretty_assertions::assert_eq;
use pumpsx4_core::protocol::{
    Command, ConnectionRegistry, ControllerState, LockConfig, PortSettings, ProtocolTiming,
    PumpController, PumpError, PumpPort,
};
use pumpsx4_core::simulator::SimulatedPump;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn fast_timing() -> ProtocolTiming {
    ProtocolTiming {
        settle_delay_ms: 1,
        quiet_period_ms: 20,
        response_timeout_ms: 300,
        lock_timeout_ms: 100,
        calibration_stop_delay_ms: 1,
    }
}

/// Registry whose every path opens a clone of `device`
fn simulated_registry(device: &SimulatedPump, lock: LockConfig) -> ConnectionRegistry {
    let device = device.clone();
    ConnectionRegistry::with_lock_config(
        move |_: &str, _: &PortSettings| -> Result<Box<dyn PumpPort>, PumpError> {
            Ok(Box::new(device.clone()))
        },
        lock,
    )
}

#[test]
fn test_controllers_share_connection_per_path() {
    let device = SimulatedPump::new();
    let registry = simulated_registry(&device, LockConfig::process());

    let a = PumpController::new(&registry, "/dev/ttyUSB0", fast_timing());
    let b = PumpController::new(&registry, "/dev/ttyUSB0", fast_timing());
    let c = PumpController::new(&registry, "/dev/ttyUSB1", fast_timing());

    assert!(Arc::ptr_eq(a.connection().unwrap(), b.connection().unwrap()));
    assert!(!Arc::ptr_eq(a.connection().unwrap(), c.connection().unwrap()));
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_end_to_end_healthy_device() {
    let device = SimulatedPump::new();
    let registry = simulated_registry(&device, LockConfig::process());
    let pumps = PumpController::new(&registry, "/dev/ttyUSB0", fast_timing());

    assert!(pumps.is_ready());
    assert!(pumps.check_alive_status());

    device.clear_written();
    pumps.dispense(6, 12.5).unwrap();
    assert_eq!(device.written_lines(), vec!["5 2 12.5".to_string()]);
    assert_eq!(device.dispensed_ml(6), 12.5);
}

#[test]
fn test_end_to_end_foreign_device_is_not_alive() {
    let device = SimulatedPump::new();
    device.set_alive_reply("{\"device\":\"Other\",\"version\":\"1.0\"}");
    let registry = simulated_registry(&device, LockConfig::process());
    let pumps = PumpController::new(&registry, "/dev/ttyUSB0", fast_timing());

    assert!(pumps.is_ready());
    assert!(!pumps.check_alive_status());
}

#[test]
fn test_dispense_opcode_for_every_pump() {
    let device = SimulatedPump::new();
    let registry = simulated_registry(&device, LockConfig::process());
    let pumps = PumpController::new(&registry, "/dev/ttyUSB0", fast_timing());

    for pump in 1..=6u8 {
        for amount in [0.5, 1.0, 99.75] {
            device.clear_written();
            pumps.dispense(pump, amount).unwrap();
            let expected = if pump < 5 {
                format!("1 {} {}", pump, amount)
            } else {
                format!("5 {} {}", pump - 4, amount)
            };
            assert_eq!(device.written_lines(), vec![expected]);
        }
    }
}

#[test]
fn test_lock_released_after_failed_write() {
    let device = SimulatedPump::new();
    let registry = simulated_registry(&device, LockConfig::process());
    let pumps = PumpController::new(&registry, "/dev/ttyUSB0", fast_timing());

    device.fail_next_writes(1);
    assert!(matches!(pumps.dispense(1, 5.0), Err(PumpError::WriteTimeout)));

    // Would hit LockTimeout if the failed exchange had kept the lock
    let reply = pumps.dispense(1, 5.0).unwrap();
    assert_eq!(reply.trim_end(), "---");
}

#[test]
fn test_lock_released_after_no_response() {
    let device = SimulatedPump::new();
    let registry = simulated_registry(&device, LockConfig::process());
    let pumps = PumpController::new(&registry, "/dev/ttyUSB0", fast_timing());

    device.set_silent(true);
    assert!(matches!(
        pumps.reset_all(),
        Err(PumpError::NoResponse { .. })
    ));

    device.set_silent(false);
    assert!(pumps.reset_all().is_ok());
}

#[test]
fn test_lock_timeout_skips_write() {
    let device = SimulatedPump::new();
    let registry = simulated_registry(&device, LockConfig::process());
    let pumps = PumpController::new(&registry, "/dev/ttyUSB0", fast_timing());
    device.clear_written();

    let connection = registry.get_or_open("/dev/ttyUSB0").unwrap();
    let held = connection.lock().acquire(Duration::from_millis(10)).unwrap();

    match pumps.dispense(2, 3.0) {
        Err(PumpError::LockTimeout { path, waited_ms }) => {
            assert_eq!(path, "/dev/ttyUSB0");
            assert_eq!(waited_ms, 100);
        }
        other => panic!("Expected LockTimeout, got {:?}", other),
    }
    assert!(device.written_lines().is_empty());
    assert!(!pumps.check_alive_status());

    drop(held);
    assert!(pumps.dispense(2, 3.0).is_ok());
    assert_eq!(pumps.state(), ControllerState::Ready);
}

#[cfg(unix)]
#[test]
fn test_file_lock_serializes_exchanges() {
    let lock_dir = TempDir::new().unwrap();
    let device = SimulatedPump::new();
    let registry = simulated_registry(&device, LockConfig::file(lock_dir.path()));
    let pumps = PumpController::new(&registry, "/dev/ttyACM0", fast_timing());
    assert!(pumps.is_ready());
    assert!(lock_dir
        .path()
        .join("PumpsX4_UART__dev_ttyACM0.lock")
        .exists());

    // A second handle on the same lock file stands in for another process
    let other_process = LockConfig::file(lock_dir.path()).lock_for("/dev/ttyACM0");
    let held = other_process.acquire(Duration::from_millis(10)).unwrap();
    assert!(matches!(
        pumps.reset_all(),
        Err(PumpError::LockTimeout { .. })
    ));

    drop(held);
    assert!(pumps.reset_all().is_ok());
}

#[test]
fn test_concurrent_channels_do_not_interleave() {
    let device = SimulatedPump::new();
    let registry = Arc::new(simulated_registry(&device, LockConfig::process()));
    let mut timing = fast_timing();
    timing.lock_timeout_ms = 5000;

    let handles: Vec<_> = (1..=4u8)
        .map(|pump| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let pumps = PumpController::new(&registry, "/dev/ttyUSB0", timing);
                for _ in 0..3 {
                    let reply = pumps.dispense(pump, 1.0).unwrap();
                    assert_eq!(reply.trim_end(), "---");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for pump in 1..=4u8 {
        assert_eq!(device.dispensed_ml(pump), 3.0);
    }
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_send_command_returns_raw_reply() {
    let device = SimulatedPump::new();
    let registry = simulated_registry(&device, LockConfig::process());
    let pumps = PumpController::new(&registry, "/dev/ttyUSB0", fast_timing());

    let raw = pumps
        .send_command(&Command::Ping, Duration::from_millis(300))
        .unwrap();
    assert_eq!(raw, "{\"device\":\"PumpsX4\",\"version\":\"1.0\"}\r\n");
}
