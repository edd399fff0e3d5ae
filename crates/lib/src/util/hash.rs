//! Hashing helpers.
//!
//! - `hash_json()`: SHA-256 of a value's canonical JSON, used for cache keys
//! - `md5_file()`: MD5 of a file, used for artifact checksums

use std::fs;
use std::io::Read;
use std::path::Path;

use md5::Md5;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub type HashError = serde_json::Error;

/// Error during file hashing.
#[derive(Debug, thiserror::Error)]
pub enum FileHashError {
  #[error("failed to read file {path}: {source}")]
  ReadFile {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

/// Lowercase hex SHA-256 of the JSON encoding of `value`.
///
/// Objects must have sorted keys for the result to be stable, so callers
/// hash `BTreeMap`s or `serde_json::Value`s.
pub fn hash_json<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
  let serialized = serde_json::to_string(value)?;
  Ok(hash_bytes(serialized.as_bytes()))
}

/// Lowercase hex SHA-256 of `data`.
pub fn hash_bytes(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  format!("{:x}", hasher.finalize())
}

pub fn md5_file(path: &Path) -> Result<String, FileHashError> {
  digest_file::<Md5>(path)
}

pub fn md5_bytes(data: &[u8]) -> String {
  hex::encode(Md5::digest(data))
}

fn digest_file<D: Digest>(path: &Path) -> Result<String, FileHashError> {
  let read_err = |source| FileHashError::ReadFile {
    path: path.display().to_string(),
    source,
  };
  let mut file = fs::File::open(path).map_err(read_err)?;

  let mut hasher = D::new();
  let mut buffer = [0u8; 8192];
  loop {
    let bytes_read = file.read(&mut buffer).map_err(read_err)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(hex::encode(hasher.finalize()))
}
