//! Connection registry
//!
//! Keeps exactly one open port per device path. Every controller addressing
//! the same path shares the same [`DeviceConnection`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::lock::{LockConfig, NamedLock};
use super::response::Identity;
use super::serial::{open_port, PortSettings, PumpPort};
use super::PumpError;

/// Opens the byte stream behind a device path
pub trait PortOpener: Send + Sync {
    /// Open `path` with the given line settings
    fn open(&self, path: &str, settings: &PortSettings) -> Result<Box<dyn PumpPort>, PumpError>;
}

/// Opens real serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, path: &str, settings: &PortSettings) -> Result<Box<dyn PumpPort>, PumpError> {
        let port = open_port(path, settings)?;
        Ok(Box::new(port))
    }
}

impl<F> PortOpener for F
where
    F: Fn(&str, &PortSettings) -> Result<Box<dyn PumpPort>, PumpError> + Send + Sync,
{
    fn open(&self, path: &str, settings: &PortSettings) -> Result<Box<dyn PumpPort>, PumpError> {
        self(path, settings)
    }
}

/// One open port plus the lock that serializes exchanges on it
pub struct DeviceConnection {
    path: String,
    port: Mutex<Box<dyn PumpPort>>,
    lock: NamedLock,
    /// Identity from the first successful handshake
    identity: Mutex<Option<Identity>>,
}

impl DeviceConnection {
    /// Device path this connection was opened from
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Lock guarding write/read exchanges
    pub fn lock(&self) -> &NamedLock {
        &self.lock
    }

    /// Exclusive access to the port. Callers must hold [`Self::lock`] first.
    pub(crate) fn port(&self) -> MutexGuard<'_, Box<dyn PumpPort>> {
        self.port.lock()
    }

    /// Handshake result shared by every controller on this connection.
    ///
    /// Held for the duration of a handshake so concurrent first openers ping once.
    pub(crate) fn identity_slot(&self) -> MutexGuard<'_, Option<Identity>> {
        self.identity.lock()
    }
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("path", &self.path)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

/// Registry of open connections keyed by device path
pub struct ConnectionRegistry {
    opener: Box<dyn PortOpener>,
    settings: PortSettings,
    lock_config: LockConfig,
    connections: Mutex<HashMap<String, Arc<DeviceConnection>>>,
}

impl ConnectionRegistry {
    /// Registry using file locks in the default lock directory
    pub fn new(opener: impl PortOpener + 'static) -> Self {
        Self::with_lock_config(opener, LockConfig::default())
    }

    /// Registry with an explicit lock configuration
    pub fn with_lock_config(opener: impl PortOpener + 'static, lock_config: LockConfig) -> Self {
        Self {
            opener: Box::new(opener),
            settings: PortSettings::default(),
            lock_config,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Lock configuration applied to new connections
    pub fn lock_config(&self) -> &LockConfig {
        &self.lock_config
    }

    /// Return the connection for `path`, opening it on first use.
    ///
    /// A failed open is not remembered; the next call tries again.
    pub fn get_or_open(&self, path: &str) -> Result<Arc<DeviceConnection>, PumpError> {
        let mut connections = self.connections.lock();

        if let Some(existing) = connections.get(path) {
            tracing::debug!(path, "reusing open connection");
            return Ok(Arc::clone(existing));
        }

        let port = self.opener.open(path, &self.settings).map_err(|e| {
            tracing::error!(path, "failed to open device: {}", e);
            e
        })?;

        tracing::info!(path, baud = self.settings.baud_rate, "opened device");
        let connection = Arc::new(DeviceConnection {
            path: path.to_string(),
            port: Mutex::new(port),
            lock: self.lock_config.lock_for(path),
            identity: Mutex::new(None),
        });
        connections.insert(path.to_string(), Arc::clone(&connection));
        Ok(connection)
    }

    /// Whether a connection for `path` is open
    pub fn contains(&self, path: &str) -> bool {
        self.connections.lock().contains_key(path)
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Whether no connection has been opened yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("settings", &self.settings)
            .field("lock_config", &self.lock_config)
            .field("open", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedPump;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_registry(opens: Arc<AtomicUsize>) -> ConnectionRegistry {
        ConnectionRegistry::with_lock_config(
            move |_path: &str, _settings: &PortSettings| -> Result<Box<dyn PumpPort>, PumpError> {
                opens.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(SimulatedPump::new()))
            },
            LockConfig::process(),
        )
    }

    #[test]
    fn test_same_path_shares_connection() {
        let opens = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(Arc::clone(&opens));

        let a = registry.get_or_open("/dev/ttyUSB0").unwrap();
        let b = registry.get_or_open("/dev/ttyUSB0").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_paths_get_distinct_connections() {
        let opens = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(Arc::clone(&opens));

        let a = registry.get_or_open("/dev/ttyUSB0").unwrap();
        let b = registry.get_or_open("/dev/ttyUSB1").unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.lock().name(), "/dev/ttyUSB0");
        assert_eq!(b.lock().name(), "/dev/ttyUSB1");
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_open_is_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let registry = ConnectionRegistry::with_lock_config(
            move |path: &str, _settings: &PortSettings| -> Result<Box<dyn PumpPort>, PumpError> {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(PumpError::ConnectionError {
                        path: path.to_string(),
                        reason: "Permission denied".to_string(),
                    })
                } else {
                    Ok(Box::new(SimulatedPump::new()))
                }
            },
            LockConfig::process(),
        );

        assert!(matches!(
            registry.get_or_open("/dev/ttyUSB0"),
            Err(PumpError::ConnectionError { .. })
        ));
        assert!(!registry.contains("/dev/ttyUSB0"));

        assert!(registry.get_or_open("/dev/ttyUSB0").is_ok());
        assert!(registry.contains("/dev/ttyUSB0"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_openers_open_once() {
        let opens = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(counting_registry(Arc::clone(&opens)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get_or_open("/dev/ttyACM0").map(|_| ()))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }
}
