//! Content-addressed artifact store.
//!
//! Each key owns a directory under the artifacts root:
//!
//! ```text
//! <root>/<key>/<key>            archive
//! <root>/<key>/<key>.unpacked/  extracted tree, created on demand
//! <root>/<key>/<key>.md5        memoised archive checksum
//! ```
//!
//! Writers stage a complete entry in a dot-prefixed temporary directory next
//! to its final place and rename it in. Whoever loses a rename race discards
//! its copy.

pub mod archive;
pub mod cull;

use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use thiserror::Error;
use tracing::{debug, info};

use crate::util::fs::remove_path;
use crate::util::hash::{FileHashError, md5_file};
pub use archive::{ArchiveFormat, unpack_archive, write_archive};

const UNPACKED_SUFFIX: &str = ".unpacked";
const MD5_SUFFIX: &str = ".md5";

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("store I/O failed at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to archive {tree}: {source}")]
  Archive {
    tree: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to unpack {archive}: {source}")]
  Unpack {
    archive: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Checksum(#[from] FileHashError),

  #[error("only {free_gb:.2}GB free under {root} after eviction, need {min_gb}GB")]
  InsufficientSpace { root: PathBuf, free_gb: f64, min_gb: f64 },
}

impl StoreError {
  fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Store {
  root: PathBuf,
}

impl Store {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Store { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn entry_dir(&self, key: &str) -> PathBuf {
    self.root.join(key)
  }

  pub fn archive_path(&self, key: &str) -> PathBuf {
    self.entry_dir(key).join(key)
  }

  pub fn unpacked_path(&self, key: &str) -> PathBuf {
    self.entry_dir(key).join(format!("{key}{UNPACKED_SUFFIX}"))
  }

  pub fn contains(&self, key: &str) -> bool {
    self.archive_path(key).is_file()
  }

  /// The unpacked tree of `key`, extracting it first if needed.
  ///
  /// Returns `None` when the key is not stored. Every hit refreshes the
  /// entry's mtime so eviction prefers entries nobody has used lately.
  pub fn get(&self, key: &str) -> Result<Option<PathBuf>, StoreError> {
    let entry = self.entry_dir(key);
    if !self.contains(key) {
      return Ok(None);
    }
    filetime::set_file_mtime(&entry, FileTime::now()).map_err(StoreError::io(&entry))?;

    let unpacked = self.unpacked_path(key);
    if unpacked.is_dir() {
      return Ok(Some(unpacked));
    }

    let staging = tempfile::Builder::new()
      .prefix(".unpack-")
      .tempdir_in(&entry)
      .map_err(StoreError::io(&entry))?;
    let archive = self.archive_path(key);
    let extracted = staging.path().join("tree");
    unpack_archive(&archive, &extracted).map_err(|source| StoreError::Unpack {
      archive: archive.clone(),
      source,
    })?;

    match std::fs::rename(&extracted, &unpacked) {
      Ok(()) => debug!(key, "unpacked artifact"),
      Err(_) if unpacked.is_dir() => debug!(key, "lost unpack race"),
      Err(e) => return Err(StoreError::io(&unpacked)(e)),
    }
    Ok(Some(unpacked))
  }

  /// Archive `tree` as `key`.
  ///
  /// Returns `false` if another writer stored the key first.
  pub fn put(&self, key: &str, tree: &Path, format: ArchiveFormat) -> Result<bool, StoreError> {
    let staging = self.staging_dir(key)?;
    let archive = staging.path().join(key);
    write_archive(tree, &archive, format).map_err(|source| StoreError::Archive {
      tree: tree.to_path_buf(),
      source,
    })?;
    self.commit(key, staging)
  }

  /// Store an archive produced elsewhere, such as a remote download.
  pub fn put_archive(&self, key: &str, file: &Path) -> Result<bool, StoreError> {
    let staging = self.staging_dir(key)?;
    let archive = staging.path().join(key);
    if std::fs::rename(file, &archive).is_err() {
      std::fs::copy(file, &archive).map_err(StoreError::io(file))?;
    }
    self.commit(key, staging)
  }

  fn staging_dir(&self, key: &str) -> Result<tempfile::TempDir, StoreError> {
    std::fs::create_dir_all(&self.root).map_err(StoreError::io(&self.root))?;
    tempfile::Builder::new()
      .prefix(&format!(".{key}-"))
      .tempdir_in(&self.root)
      .map_err(StoreError::io(&self.root))
  }

  /// Unpack the staged archive beside it and rename the staging directory
  /// into place.
  fn commit(&self, key: &str, staging: tempfile::TempDir) -> Result<bool, StoreError> {
    let archive = staging.path().join(key);
    let unpacked = staging.path().join(format!("{key}{UNPACKED_SUFFIX}"));
    unpack_archive(&archive, &unpacked).map_err(|source| StoreError::Unpack {
      archive: archive.clone(),
      source,
    })?;

    let entry = self.entry_dir(key);
    let staged = staging.keep();
    match std::fs::rename(&staged, &entry) {
      Ok(()) => {
        let size = std::fs::metadata(self.archive_path(key)).map(|m| m.len()).unwrap_or(0);
        info!(key, size, "cached artifact");
        Ok(true)
      }
      Err(_) if self.contains(key) => {
        info!(key, "another worker cached this artifact first");
        remove_path(&staged).map_err(StoreError::io(&staged))?;
        Ok(false)
      }
      Err(e) => {
        if let Err(cleanup) = remove_path(&staged) {
          debug!(path = %staged.display(), error = %cleanup, "failed to remove staged artifact");
        }
        Err(StoreError::io(&entry)(e))
      }
    }
  }

  /// MD5 of the archive, computed once and kept beside it.
  pub fn checksum(&self, key: &str) -> Result<String, StoreError> {
    let memo = self.entry_dir(key).join(format!("{key}{MD5_SUFFIX}"));
    if let Ok(sum) = std::fs::read_to_string(&memo) {
      let sum = sum.trim();
      if !sum.is_empty() {
        return Ok(sum.to_string());
      }
    }
    let sum = md5_file(&self.archive_path(key))?;
    std::fs::write(&memo, &sum).map_err(StoreError::io(&memo))?;
    Ok(sum)
  }

  /// Build log path for `key`, one per worker instance.
  pub fn log_path(&self, key: &str, instance: Option<usize>) -> PathBuf {
    match instance {
      Some(i) if i > 0 => self.root.join(format!("{key}.build-log.{i}")),
      _ => self.root.join(format!("{key}.build-log")),
    }
  }
}
