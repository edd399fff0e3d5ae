//! Filesystem helpers for staging artifacts into sandboxes.

use std::fs;
use std::io;
use std::path::Path;

use filetime::FileTime;
use tracing::trace;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
  Hardlink,
  Copy,
}

/// Populate `dst` with everything under `src`.
///
/// Directories are created, symlinks are recreated with the same target and
/// other entries are hardlinked or copied. A destination directory (or a
/// symlink to one) absorbs a source directory of the same name. Any other
/// pre-existing destination entry is replaced and reported as an overlap,
/// as a `/`-prefixed path relative to `dst`.
pub fn populate_tree(src: &Path, dst: &Path, mode: LinkMode) -> io::Result<Vec<String>> {
  fs::create_dir_all(dst)?;
  let mut overlaps = Vec::new();

  for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    let dest = dst.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() && dest.is_dir() {
      continue;
    }

    if let Ok(existing) = fs::symlink_metadata(&dest) {
      overlaps.push(format!("/{}", rel.to_string_lossy()));
      if existing.is_dir() {
        fs::remove_dir_all(&dest)?;
      } else {
        fs::remove_file(&dest)?;
      }
    }

    if file_type.is_dir() {
      fs::create_dir(&dest)?;
      fs::set_permissions(&dest, entry.metadata().map_err(io::Error::other)?.permissions())?;
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry.path())?;
      symlink(&target, &dest)?;
    } else if file_type.is_file() && mode == LinkMode::Copy {
      fs::copy(entry.path(), &dest)?;
    } else {
      fs::hard_link(entry.path(), &dest)?;
    }
    trace!(path = %rel.display(), "staged");
  }

  Ok(overlaps)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::windows::fs::symlink_file(target, link)
}

/// Set the modification and access time of `path` and everything below it,
/// without following symlinks.
pub fn set_mtime_recursive(path: &Path, secs: i64) -> io::Result<()> {
  let time = FileTime::from_unix_time(secs, 0);
  for entry in WalkDir::new(path) {
    let entry = entry.map_err(io::Error::other)?;
    filetime::set_symlink_file_times(entry.path(), time, time)?;
  }
  Ok(())
}

/// Names of the entries directly inside `dir`, sorted.
pub fn top_level_names(dir: &Path) -> io::Result<Vec<String>> {
  let mut names = fs::read_dir(dir)?
    .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
    .collect::<io::Result<Vec<_>>>()?;
  names.sort();
  Ok(names)
}

/// Remove a file or directory tree, treating a missing path as success.
pub fn remove_path(path: &Path) -> io::Result<()> {
  match fs::symlink_metadata(path) {
    Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
    Ok(_) => fs::remove_file(path),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

/// Total size in bytes of the regular files under `path`.
pub fn tree_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(Result::ok)
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

/// Copy the listed paths, relative to `src`, into `dst`.
///
/// Parent directories are created as needed. Existing files, symlinks and
/// device nodes at the destination are replaced and reported as overlaps.
pub fn copy_file_list(src: &Path, dst: &Path, files: &[String]) -> io::Result<Vec<String>> {
  let mut sorted: Vec<&String> = files.iter().collect();
  sorted.sort();
  sorted.dedup();
  let mut overlaps = Vec::new();

  for rel in sorted {
    let rel = rel.trim_start_matches('/');
    let from = src.join(rel);
    let to = dst.join(rel);
    if let Some(parent) = to.parent() {
      fs::create_dir_all(parent)?;
    }
    let metadata = fs::symlink_metadata(&from)?;
    let file_type = metadata.file_type();

    if file_type.is_dir() {
      if !to.exists() {
        fs::create_dir(&to)?;
      }
      if !to.is_dir() {
        return Err(io::Error::other(format!("{} exists and is not a directory", to.display())));
      }
      fs::set_permissions(&to, metadata.permissions())?;
      continue;
    }

    if fs::symlink_metadata(&to).is_ok() {
      overlaps.push(format!("/{rel}"));
      fs::remove_file(&to)?;
    }
    if file_type.is_symlink() {
      symlink(&fs::read_link(&from)?, &to)?;
    } else if file_type.is_file() {
      fs::copy(&from, &to)?;
    } else {
      copy_special(&from, &to, &metadata)?;
    }
  }

  Ok(overlaps)
}

#[cfg(unix)]
fn copy_special(from: &Path, to: &Path, metadata: &fs::Metadata) -> io::Result<()> {
  use std::os::unix::fs::MetadataExt;
  use rustix::fs::{CWD, FileType, Mode, mknodat};

  let file_type = FileType::from_raw_mode(metadata.mode());
  if !matches!(file_type, FileType::CharacterDevice | FileType::BlockDevice | FileType::Fifo) {
    return Err(io::Error::other(format!("cannot copy {}: unsupported file type", from.display())));
  }
  mknodat(CWD, to, file_type, Mode::from_raw_mode(metadata.mode() & 0o7777), metadata.rdev())
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(not(unix))]
fn copy_special(from: &Path, _to: &Path, _metadata: &fs::Metadata) -> io::Result<()> {
  Err(io::Error::other(format!("cannot copy {}: unsupported file type", from.display())))
}
