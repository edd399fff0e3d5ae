//! Per-artifact locks under `<tmp>`.
//!
//! Whoever holds `<tmp>/<key>.lock` exclusively is the only worker building
//! or fetching that key.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::run_lock::{LockMode, open_lock_file, try_lock};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct KeyLock {
  _file: File,
  path: PathBuf,
}

impl KeyLock {
  pub fn path_for(tmp: &Path, key: &str) -> PathBuf {
    tmp.join(format!("{key}.lock"))
  }

  /// Claim `key` without waiting. `Ok(None)` means another worker has it.
  pub fn try_acquire(tmp: &Path, key: &str) -> io::Result<Option<Self>> {
    let path = Self::path_for(tmp, key);
    let file = open_lock_file(&path)?;
    match try_lock(&file, LockMode::Exclusive) {
      Ok(()) => {
        debug!(key, "claimed");
        Ok(Some(KeyLock { _file: file, path }))
      }
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
      Err(err) => Err(err),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

/// Wait until the holder of `key` lets go, or `timeout` passes.
///
/// Returns whether the lock came free.
pub async fn wait_for_holder(tmp: &Path, key: &str, timeout: Duration) -> io::Result<bool> {
  let path = KeyLock::path_for(tmp, key);
  if !path.exists() {
    return Ok(true);
  }
  let file = open_lock_file(&path)?;
  let deadline = Instant::now() + timeout;
  loop {
    match try_lock(&file, LockMode::Shared) {
      Ok(()) => {
        debug!(key, "finished wait loop");
        return Ok(true);
      }
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        if Instant::now() >= deadline {
          warn!(key, timeout = ?timeout, "gave up waiting for another worker");
          return Ok(false);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
      }
      Err(err) => return Err(err),
    }
  }
}
