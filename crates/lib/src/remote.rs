//! Client for a keyed binary artifact server (KBAS).
//!
//! `GET <url>/get/<key>` streams an archive; `POST <url>/upload` sends one as
//! multipart form data with the key, the upload password and its MD5.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

static KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._@-]*$").expect("valid regex"));

#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("request to {url} failed: {source}")]
  Http {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("failed to save download to {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("'{0}' is not a valid artifact key")]
  InvalidKey(String),
}

/// How the server answered an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
  /// 201
  Accepted,
  /// 405: stored already, with a different checksum.
  Mismatch,
  /// 777: stored already, with the same checksum.
  Reproduced,
  /// 401
  Unauthorized,
  /// 400
  BadKey,
  /// 500
  ServerError,
  Unexpected(u16),
}

impl UploadOutcome {
  pub fn from_status(status: u16) -> Self {
    match status {
      201 => UploadOutcome::Accepted,
      405 => UploadOutcome::Mismatch,
      777 => UploadOutcome::Reproduced,
      401 => UploadOutcome::Unauthorized,
      400 => UploadOutcome::BadKey,
      500 => UploadOutcome::ServerError,
      other => UploadOutcome::Unexpected(other),
    }
  }
}

/// Whether `key` may be sent to a server.
pub fn is_valid_key(key: &str) -> bool {
  KEY_PATTERN.is_match(key)
}

#[derive(Debug, Clone)]
pub struct KbasClient {
  base: String,
  password: String,
  http: reqwest::Client,
}

impl KbasClient {
  pub fn new(url: &str, password: &str) -> Self {
    let base = if url.ends_with('/') {
      url.to_string()
    } else {
      format!("{url}/")
    };
    let http = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .build()
      .unwrap_or_default();
    KbasClient {
      base,
      password: password.to_string(),
      http,
    }
  }

  pub fn url(&self) -> &str {
    &self.base
  }

  /// Download the archive for `key` into `dir`.
  ///
  /// `Ok(None)` means the server answered but does not have it; an `Err`
  /// means the server could not be reached.
  pub async fn fetch(&self, key: &str, dir: &Path) -> Result<Option<PathBuf>, RemoteError> {
    let url = format!("{}get/{}", self.base, key);
    debug!(key, url = %url, "trying remote artifact");
    let http_err = |source| RemoteError::Http {
      url: url.clone(),
      source,
    };

    let mut response = self.http.get(&url).send().await.map_err(http_err)?;
    if response.status() != StatusCode::OK {
      debug!(key, status = %response.status(), "remote does not have artifact");
      return Ok(None);
    }

    let io_err = |path: &Path| {
      let path = path.to_path_buf();
      move |source| RemoteError::Io { path, source }
    };
    tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
    let dest = dir.join(format!("{key}.download"));
    let mut file = tokio::fs::File::create(&dest).await.map_err(io_err(&dest))?;
    let mut size = 0usize;
    while let Some(chunk) = response.chunk().await.map_err(http_err)? {
      size += chunk.len();
      file.write_all(&chunk).await.map_err(io_err(&dest))?;
    }
    file.flush().await.map_err(io_err(&dest))?;

    info!(key, size, "downloaded artifact");
    Ok(Some(dest))
  }

  /// Upload `archive` as `key`.
  pub async fn upload(&self, key: &str, archive: &Path, checksum: &str) -> Result<UploadOutcome, RemoteError> {
    if !is_valid_key(key) {
      return Err(RemoteError::InvalidKey(key.to_string()));
    }
    let url = format!("{}upload", self.base);
    let bytes = tokio::fs::read(archive).await.map_err(|source| RemoteError::Io {
      path: archive.to_path_buf(),
      source,
    })?;

    let form = Form::new()
      .text("filename", key.to_string())
      .text("password", self.password.clone())
      .text("checksum", checksum.to_string())
      .part("file", Part::bytes(bytes).file_name(key.to_string()));

    let response = self
      .http
      .post(&url)
      .multipart(form)
      .send()
      .await
      .map_err(|source| RemoteError::Http { url: url.clone(), source })?;

    let outcome = UploadOutcome::from_status(response.status().as_u16());
    match outcome {
      UploadOutcome::Accepted => info!(key, url = %url, "uploaded artifact"),
      UploadOutcome::Reproduced => info!(key, checksum, "reproduced artifact"),
      UploadOutcome::Mismatch => warn!(key, checksum, "artifact server holds different content for this key"),
      other => warn!(key, outcome = ?other, "artifact server refused upload"),
    }
    Ok(outcome)
  }
}
