//! Process-lifetime lock on `<tmp>/lock`.
//!
//! The first instance of a run holds it exclusively while it does startup
//! housekeeping, then downgrades to shared. Later instances wait for a shared
//! lock, so they never start building while the store is being culled.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const LOCK_FILENAME: &str = "lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub pid: u32,
  pub started_at_unix: u64,
  pub instance: usize,
}

#[derive(Debug, Error)]
pub enum RunLockError {
  #[error("failed to open lock file {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to lock {path}: {source}")]
  Lock {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write lock metadata to {path}: {source}")]
  Metadata {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug)]
pub struct RunLock {
  file: File,
  path: PathBuf,
  exclusive: bool,
}

impl RunLock {
  /// Take the lock exclusively if nobody holds it, else wait for it shared.
  pub fn acquire(tmp: &Path, instance: usize) -> Result<Self, RunLockError> {
    let path = tmp.join(LOCK_FILENAME);
    let file = open_lock_file(&path).map_err(|source| RunLockError::Open {
      path: path.clone(),
      source,
    })?;
    let lock_err = |source| RunLockError::Lock {
      path: path.clone(),
      source,
    };

    match try_lock(&file, LockMode::Exclusive) {
      Ok(()) => {
        write_metadata(&file, instance).map_err(|source| RunLockError::Metadata {
          path: path.clone(),
          source,
        })?;
        debug!(path = %path.display(), "holding run lock exclusively");
        Ok(RunLock {
          file,
          path,
          exclusive: true,
        })
      }
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        info!(path = %path.display(), "another instance is running, waiting for shared lock");
        lock(&file, LockMode::Shared).map_err(lock_err)?;
        Ok(RunLock {
          file,
          path,
          exclusive: false,
        })
      }
      Err(err) => Err(lock_err(err)),
    }
  }

  /// Whether no other instance was running when this one started.
  pub fn is_exclusive(&self) -> bool {
    self.exclusive
  }

  /// Let waiting instances in.
  pub fn downgrade(&mut self) -> Result<(), RunLockError> {
    if !self.exclusive {
      return Ok(());
    }
    lock(&self.file, LockMode::Shared).map_err(|source| RunLockError::Lock {
      path: self.path.clone(),
      source,
    })?;
    self.exclusive = false;
    debug!(path = %self.path.display(), "run lock downgraded to shared");
    Ok(())
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

fn write_metadata(file: &File, instance: usize) -> io::Result<()> {
  let metadata = LockMetadata {
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    instance,
  };
  file.set_len(0)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata).map_err(io::Error::other)?;
  writer.flush()
}

pub(crate) fn open_lock_file(path: &Path) -> io::Result<File> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(false)
    .open(path)
}

/// Non-blocking; fails with `WouldBlock` when held elsewhere.
#[cfg(unix)]
pub(crate) fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(unix)]
fn lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::LockShared,
    LockMode::Exclusive => FlockOperation::LockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(not(unix))]
pub(crate) fn try_lock(_file: &File, _mode: LockMode) -> io::Result<()> {
  Err(io::Error::new(io::ErrorKind::Unsupported, "file locks need a unix host"))
}

#[cfg(not(unix))]
fn lock(_file: &File, _mode: LockMode) -> io::Result<()> {
  Err(io::Error::new(io::ErrorKind::Unsupported, "file locks need a unix host"))
}
