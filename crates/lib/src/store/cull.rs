//! Eviction of least recently used artifacts.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info};

use super::{Store, StoreError};
use crate::util::fs::remove_path;

const BYTES_PER_GB: f64 = 1_000_000_000.0;

/// Reports free space for the filesystem holding a path.
pub trait SpaceProbe {
  fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Space available to unprivileged users, from `statvfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statvfs;

impl SpaceProbe for Statvfs {
  #[cfg(unix)]
  fn free_bytes(&self, path: &Path) -> io::Result<u64> {
    let stat = rustix::fs::statvfs(path).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))?;
    Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
  }

  #[cfg(not(unix))]
  fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
    Ok(u64::MAX)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CullReport {
  pub removed: usize,
  pub free_bytes: u64,
}

/// Evict entries oldest first until `min_gb` is free.
///
/// The first pass only drops `.unpacked` trees, the second drops whole
/// entries. Keys in `live` are never touched.
///
/// # Errors
///
/// `InsufficientSpace` if both passes leave less than `min_gb` free.
pub fn cull<P: SpaceProbe>(
  store: &Store,
  min_gb: f64,
  live: &HashSet<String>,
  probe: &P,
) -> Result<CullReport, StoreError> {
  let root = store.root();
  let required = (min_gb * BYTES_PER_GB) as u64;
  let free = |probe: &P| probe.free_bytes(root).map_err(StoreError::io(root));

  let mut report = CullReport {
    removed: 0,
    free_bytes: free(probe)?,
  };
  if report.free_bytes >= required {
    debug!(free_gb = report.free_bytes as f64 / BYTES_PER_GB, "enough free space");
    return Ok(report);
  }

  let candidates = entries_by_age(root)?;
  for unpacked_only in [true, false] {
    for key in &candidates {
      if live.contains(key) {
        continue;
      }
      let victim = if unpacked_only {
        store.unpacked_path(key)
      } else {
        store.entry_dir(key)
      };
      if !victim.exists() {
        continue;
      }
      discard(root, &victim)?;
      report.removed += 1;

      report.free_bytes = free(probe)?;
      if report.free_bytes >= required {
        info!(removed = report.removed, root = %root.display(), "culled artifacts");
        return Ok(report);
      }
    }
  }

  Err(StoreError::InsufficientSpace {
    root: root.to_path_buf(),
    free_gb: report.free_bytes as f64 / BYTES_PER_GB,
    min_gb,
  })
}

/// Entry directories of the store, least recently modified first.
fn entries_by_age(root: &Path) -> Result<Vec<String>, StoreError> {
  let read = match std::fs::read_dir(root) {
    Ok(read) => read,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(StoreError::io(root)(e)),
  };

  let mut entries: Vec<(SystemTime, String)> = Vec::new();
  for entry in read {
    let entry = entry.map_err(StoreError::io(root))?;
    let name = entry.file_name().to_string_lossy().into_owned();
    if name.starts_with('.') {
      continue;
    }
    let Ok(metadata) = entry.metadata() else {
      continue;
    };
    if !metadata.is_dir() {
      continue;
    }
    entries.push((metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH), name));
  }
  entries.sort();
  Ok(entries.into_iter().map(|(_, name)| name).collect())
}

/// Move `victim` aside first so readers never see it half deleted.
fn discard(root: &Path, victim: &Path) -> Result<(), StoreError> {
  let graveyard = tempfile::Builder::new()
    .prefix(".cull-")
    .tempdir_in(root)
    .map_err(StoreError::io(root))?;
  let target: PathBuf = graveyard.path().join("to-delete");
  match std::fs::rename(victim, &target) {
    Ok(()) => {}
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(StoreError::io(victim)(e)),
  }
  debug!(path = %victim.display(), "evicted");
  remove_path(graveyard.path()).map_err(StoreError::io(graveyard.path()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::ArchiveFormat;
  use crate::util::fs::tree_size;
  use crate::util::testutil::write_file;
  use filetime::FileTime;
  use tempfile::TempDir;

  /// Pretends the filesystem holds `capacity` bytes in total.
  struct FixedCapacity(u64);

  impl SpaceProbe for FixedCapacity {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
      Ok(self.0.saturating_sub(tree_size(path)))
    }
  }

  fn store_with_entries(count: usize) -> (TempDir, Store, Vec<String>) {
    let temp = TempDir::new().unwrap();
    let store = Store::new(temp.path().join("artifacts"));
    let mut keys = Vec::new();
    for i in 0..count {
      let tree = temp.path().join(format!("tree{i}"));
      write_file(&tree, "data", &"x".repeat(4096 + i));
      let key = format!("c{i}.k");
      store.put(&key, &tree, ArchiveFormat::Tar).unwrap();
      filetime::set_file_mtime(store.entry_dir(&key), FileTime::from_unix_time(1_000 + i as i64, 0)).unwrap();
      keys.push(key);
    }
    (temp, store, keys)
  }

  #[test]
  fn nothing_happens_with_enough_space() {
    let (_temp, store, keys) = store_with_entries(3);
    let report = cull(&store, 0.0, &HashSet::new(), &Statvfs).unwrap();
    assert_eq!(report.removed, 0);
    assert!(keys.iter().all(|k| store.contains(k)));
  }

  #[test]
  fn evicts_oldest_and_spares_live_keys() {
    let (_temp, store, keys) = store_with_entries(20);
    let used = tree_size(store.root());
    let probe = FixedCapacity(used + used / 2);
    let live: HashSet<String> = [keys[0].clone(), keys[1].clone()].into();

    // want 75% of the current usage free
    let min_gb = (used as f64 * 0.75) / BYTES_PER_GB;
    let report = cull(&store, min_gb, &live, &probe).unwrap();

    assert!(report.free_bytes as f64 >= min_gb * BYTES_PER_GB);
    assert!(report.removed > 0);
    assert!(store.contains(&keys[0]) && store.contains(&keys[1]));
    assert!(store.unpacked_path(&keys[0]).is_dir());
    assert!(!store.unpacked_path(&keys[2]).exists());
  }

  #[test]
  fn unpacked_trees_go_before_archives() {
    let (_temp, store, keys) = store_with_entries(4);
    let used = tree_size(store.root());
    let unpacked: u64 = keys.iter().map(|k| tree_size(&store.unpacked_path(k))).sum();
    let probe = FixedCapacity(used);

    let min_gb = (unpacked as f64 * 0.9) / BYTES_PER_GB;
    cull(&store, min_gb, &HashSet::new(), &probe).unwrap();

    assert!(keys.iter().all(|k| store.contains(k)));
    assert!(!store.unpacked_path(&keys[0]).exists());
  }

  #[test]
  fn fails_when_live_keys_fill_the_disk() {
    let (_temp, store, keys) = store_with_entries(3);
    let used = tree_size(store.root());
    let live: HashSet<String> = keys.into_iter().collect();

    let err = cull(&store, (used as f64) / BYTES_PER_GB, &live, &FixedCapacity(used)).unwrap_err();
    assert!(matches!(err, StoreError::InsufficientSpace { .. }));
  }
}
