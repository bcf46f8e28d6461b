//! Device locking
//!
//! Every write/read exchange with the pump runs under a named lock keyed by
//! device path. The default strategy is an advisory lock file so separate
//! processes sharing one serial line take turns; an in-process variant covers
//! single-process deployments.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::PumpError;

/// Interval between attempts on a contended lock file
const FILE_LOCK_POLL: Duration = Duration::from_millis(10);

/// Default directory for lock files
pub const DEFAULT_LOCK_DIR: &str = "/var/lock";

/// How device locks are implemented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    /// Advisory lock file, shared across processes
    #[default]
    File,
    /// In-process mutex, only valid when one process owns the port
    Process,
}

/// Lock configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock implementation
    pub strategy: LockStrategy,
    /// Directory holding lock files (file strategy only)
    pub dir: PathBuf,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            strategy: LockStrategy::File,
            dir: PathBuf::from(DEFAULT_LOCK_DIR),
        }
    }
}

impl LockConfig {
    /// In-process locking
    pub fn process() -> Self {
        Self {
            strategy: LockStrategy::Process,
            ..Self::default()
        }
    }

    /// Lock files under `dir`
    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self {
            strategy: LockStrategy::File,
            dir: dir.into(),
        }
    }

    /// Build the lock for one device path
    pub fn lock_for(&self, device_path: &str) -> NamedLock {
        match self.strategy {
            LockStrategy::File => NamedLock::file(&self.dir, device_path),
            LockStrategy::Process => NamedLock::process(device_path),
        }
    }
}

/// Lock file name for a device path ("/dev/ttyUSB0" -> "PumpsX4_UART__dev_ttyUSB0.lock")
pub fn lock_file_name(device_path: &str) -> String {
    format!("PumpsX4_UART_{}.lock", device_path.replace('/', "_"))
}

/// A named mutual-exclusion primitive with bounded-wait acquisition
#[derive(Debug)]
pub enum NamedLock {
    /// Advisory lock file
    File(FileLock),
    /// In-process mutex
    Process(ProcessLock),
}

impl NamedLock {
    /// Lock file for `device_path` inside `dir`
    pub fn file(dir: &Path, device_path: &str) -> Self {
        NamedLock::File(FileLock {
            name: device_path.to_string(),
            path: dir.join(lock_file_name(device_path)),
        })
    }

    /// In-process lock for `device_path`
    pub fn process(device_path: &str) -> Self {
        NamedLock::Process(ProcessLock {
            name: device_path.to_string(),
            mutex: Mutex::new(()),
        })
    }

    /// Device path this lock protects
    pub fn name(&self) -> &str {
        match self {
            NamedLock::File(lock) => &lock.name,
            NamedLock::Process(lock) => &lock.name,
        }
    }

    /// Acquire the lock, waiting at most `timeout`.
    ///
    /// The returned guard releases the lock when dropped.
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard<'_>, PumpError> {
        match self {
            NamedLock::File(lock) => lock.acquire(timeout),
            NamedLock::Process(lock) => lock.acquire(timeout),
        }
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct LockGuard<'a> {
    inner: GuardInner<'a>,
}

#[derive(Debug)]
enum GuardInner<'a> {
    File { file: File, path: PathBuf },
    Process(MutexGuard<'a, ()>),
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // The process variant unlocks when its mutex guard drops
        if let GuardInner::File { file, path } = &self.inner {
            if let Err(e) = file.unlock() {
                tracing::warn!(lock = %path.display(), "failed to release lock file: {}", e);
            }
        }
    }
}

/// Advisory lock file
#[derive(Debug)]
pub struct FileLock {
    name: String,
    path: PathBuf,
}

impl FileLock {
    fn acquire(&self, timeout: Duration) -> Result<LockGuard<'_>, PumpError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(file) = try_lock_file(&self.path)? {
                return Ok(LockGuard {
                    inner: GuardInner::File {
                        file,
                        path: self.path.clone(),
                    },
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PumpError::LockTimeout {
                    path: self.name.clone(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(FILE_LOCK_POLL.min(deadline - now));
        }
    }
}

/// Open the lock file and try to take an exclusive lock without blocking
fn try_lock_file(path: &Path) -> Result<Option<File>, PumpError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| {
            tracing::warn!(lock = %path.display(), "cannot open lock file: {}", e);
            PumpError::Io(e)
        })?;

    match file.try_lock() {
        Ok(()) => Ok(Some(file)),
        Err(TryLockError::WouldBlock) => Ok(None),
        Err(TryLockError::Error(e)) => Err(PumpError::Io(e)),
    }
}

/// In-process named lock
#[derive(Debug)]
pub struct ProcessLock {
    name: String,
    mutex: Mutex<()>,
}

impl ProcessLock {
    fn acquire(&self, timeout: Duration) -> Result<LockGuard<'_>, PumpError> {
        match self.mutex.try_lock_for(timeout) {
            Some(guard) => Ok(LockGuard {
                inner: GuardInner::Process(guard),
            }),
            None => Err(PumpError::LockTimeout {
                path: self.name.clone(),
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_lock_file_name() {
        assert_eq!(
            lock_file_name("/dev/ttyUSB0"),
            "PumpsX4_UART__dev_ttyUSB0.lock"
        );
    }

    #[test]
    fn test_process_lock_times_out_while_held() {
        let lock = NamedLock::process("/dev/ttyUSB0");
        let _guard = lock.acquire(Duration::from_millis(10)).unwrap();

        let start = Instant::now();
        let err = lock.acquire(Duration::from_millis(30)).unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(matches!(err, PumpError::LockTimeout { .. }));
    }

    #[test]
    fn test_process_lock_released_on_drop() {
        let lock = NamedLock::process("/dev/ttyUSB0");
        drop(lock.acquire(Duration::from_millis(10)).unwrap());
        assert!(lock.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_process_lock_hands_over_to_waiter() {
        let lock = Arc::new(NamedLock::process("/dev/ttyUSB0"));
        let guard = lock.acquire(Duration::from_millis(10)).unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || lock.acquire(Duration::from_secs(2)).map(|_| ()))
        };

        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_file_lock_contention() {
        let dir = TempDir::new().unwrap();
        let first = NamedLock::file(dir.path(), "/dev/ttyACM0");
        let second = NamedLock::file(dir.path(), "/dev/ttyACM0");

        let guard = first.acquire(Duration::from_millis(10)).unwrap();
        assert!(matches!(
            second.acquire(Duration::from_millis(30)),
            Err(PumpError::LockTimeout { .. })
        ));

        drop(guard);
        assert!(second.acquire(Duration::from_millis(30)).is_ok());
    }

    #[test]
    fn test_file_locks_for_different_devices_are_independent() {
        let dir = TempDir::new().unwrap();
        let a = NamedLock::file(dir.path(), "/dev/ttyACM0");
        let b = NamedLock::file(dir.path(), "/dev/ttyACM1");

        let _a = a.acquire(Duration::from_millis(10)).unwrap();
        assert!(b.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_file_lock_in_missing_dir_is_io_error() {
        let dir = TempDir::new().unwrap();
        let lock = NamedLock::file(&dir.path().join("missing"), "/dev/ttyACM0");
        assert!(matches!(
            lock.acquire(Duration::from_millis(10)),
            Err(PumpError::Io(_))
        ));
    }
}
