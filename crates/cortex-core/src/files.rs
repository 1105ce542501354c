//! Atomic JSON file operations with advisory locking.
//!
//! Every mutable state file in Cortex goes through these helpers. The
//! contract: saves are atomic to external observers (temp file + rename),
//! concurrent writers across processes serialize on an exclusive lock held
//! on a sibling `.lock` file, and corrupt files degrade to a default value
//! instead of propagating a parse error.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// Default bound on how long a caller waits for a lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// Retry cadence while waiting on a contended lock.
const LOCK_RETRY: Duration = Duration::from_millis(100);

/// Path of the sibling lock file for `path`.
fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    name.push_str(".lock");
    path.with_file_name(name)
}

/// An exclusive advisory lock on `<path>.lock`, released on drop.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Acquire the lock, waiting up to `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let lock = lock_path(path);
        if let Some(parent) = lock.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock)?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(_) if start.elapsed() < timeout => std::thread::sleep(LOCK_RETRY),
                Err(_) => {
                    return Err(CoreError::LockTimeout {
                        path: lock,
                        waited_ms: start.elapsed().as_millis() as u64,
                    })
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Load JSON from `path`, falling back to `default` when the file is
/// missing or corrupt. Decode errors are logged, never propagated.
pub fn load_json<T: DeserializeOwned>(path: &Path, default: T) -> T {
    if !path.exists() {
        return default;
    }
    let _lock = match FileLock::acquire(path, LOCK_TIMEOUT) {
        Ok(l) => l,
        Err(e) => {
            warn!(path = %path.display(), "lock timeout on load: {e}");
            return default;
        }
    };
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), "JSON decode error, using default: {e}");
                default
            }
        },
        Err(e) => {
            warn!(path = %path.display(), "read failed, using default: {e}");
            default
        }
    }
}

/// Atomically save `value` as pretty JSON: write a sibling temp file, then
/// rename over the target while holding the advisory lock.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)?;

    let _lock = FileLock::acquire(path, LOCK_TIMEOUT)?;

    let tmp = tempfile::Builder::new()
        .prefix(&format!(
            ".{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "state".to_string())
        ))
        .suffix(".tmp")
        .tempfile_in(&parent)?;
    serde_json::to_writer_pretty(tmp.as_file(), value)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CoreError::Io(e.error))?;

    debug!(path = %path.display(), "saved");
    Ok(())
}

/// Run a read-modify-write cycle under a single lock acquisition.
///
/// `f` receives the current value (or `default`) and returns the new value
/// to persist plus its own result. The write goes through the same
/// temp-then-rename path as [`save_json`].
pub fn locked_update<T, R, F>(path: &Path, default: T, f: F) -> Result<R>
where
    T: DeserializeOwned + Serialize,
    F: FnOnce(T) -> (T, R),
{
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)?;

    let _lock = FileLock::acquire(path, LOCK_TIMEOUT)?;

    let current: T = if path.exists() {
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), "JSON decode error in update, using default: {e}");
                default
            }),
            Err(_) => default,
        }
    } else {
        default
    };

    let (next, out) = f(current);

    let tmp = tempfile::Builder::new()
        .prefix(".update")
        .suffix(".tmp")
        .tempfile_in(&parent)?;
    serde_json::to_writer_pretty(tmp.as_file(), &next)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CoreError::Io(e.error))?;

    Ok(out)
}
