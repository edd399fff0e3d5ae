//! What one worker has done so far.

use std::collections::HashSet;
use std::time::{Duration, Instant};

/// A retry this soon after the previous one waits for the lock holder.
const RAPID_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct Progress {
  /// Components in the target's closure.
  pub total: usize,
  pub built: usize,
  pub fetched: usize,
  /// Uploads the remote already had with the same checksum.
  pub reproduced: usize,
  pub retries: usize,
  tried: HashSet<String>,
  last_retry: Option<(String, Instant)>,
}

impl Progress {
  pub fn new(total: usize) -> Self {
    Progress {
      total,
      ..Default::default()
    }
  }

  pub fn completed(&self) -> usize {
    self.built + self.fetched
  }

  /// Remember that `path` was attempted; false if it already was.
  pub fn mark_tried(&mut self, path: &str) -> bool {
    self.tried.insert(path.to_string())
  }

  pub fn was_tried(&self, path: &str) -> bool {
    self.tried.contains(path)
  }

  pub fn last_retry_was(&self, path: &str) -> bool {
    self.last_retry.as_ref().is_some_and(|(p, _)| p == path)
  }

  /// Record a retry on `path`. Returns whether the previous retry was less
  /// than a second ago.
  pub fn record_retry(&mut self, path: &str) -> bool {
    let now = Instant::now();
    let rapid = self
      .last_retry
      .as_ref()
      .is_some_and(|(_, at)| now.duration_since(*at) < RAPID_RETRY);
    self.last_retry = Some((path.to_string(), now));
    self.retries += 1;
    rapid
  }
}
