//! Deterministic artifact archives.
//!
//! Entries are written depth-first with every directory's children sorted by
//! name, owned by root, and stamped with [`MAGIC_TIMESTAMP`]. Gzip output
//! carries the same mtime and no file name, so identical trees give identical
//! bytes.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::consts::MAGIC_TIMESTAMP;
use crate::definitions::Kind;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
  /// gzip over tar; chunks and strata.
  Gzip,
  /// Plain tar; systems.
  Tar,
}

impl ArchiveFormat {
  pub fn for_kind(kind: Kind) -> Self {
    match kind {
      Kind::System => ArchiveFormat::Tar,
      _ => ArchiveFormat::Gzip,
    }
  }
}

/// Archive everything under `root` into `dest`.
pub fn write_archive(root: &Path, dest: &Path, format: ArchiveFormat) -> io::Result<()> {
  let file = BufWriter::new(File::create(dest)?);
  match format {
    ArchiveFormat::Gzip => {
      let encoder = GzBuilder::new()
        .mtime(MAGIC_TIMESTAMP as u32)
        .write(file, Compression::default());
      let encoder = append_tree(root, encoder)?;
      encoder.finish()?.flush()
    }
    ArchiveFormat::Tar => append_tree(root, file)?.flush(),
  }
}

fn append_tree<W: Write>(root: &Path, writer: W) -> io::Result<W> {
  let mut builder = Builder::new(writer);
  builder.follow_symlinks(false);

  for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let path = entry.path();
    let Ok(rel) = path.strip_prefix(root) else {
      continue;
    };
    let metadata = fs::symlink_metadata(path)?;
    let mut header = header_for(&metadata)?;
    let file_type = metadata.file_type();

    if file_type.is_dir() {
      header.set_entry_type(EntryType::Directory);
      header.set_size(0);
      builder.append_data(&mut header, rel, io::empty())?;
    } else if file_type.is_file() {
      header.set_entry_type(EntryType::Regular);
      header.set_size(metadata.len());
      builder.append_data(&mut header, rel, File::open(path)?)?;
    } else if file_type.is_symlink() {
      header.set_entry_type(EntryType::Symlink);
      header.set_size(0);
      builder.append_link(&mut header, rel, fs::read_link(path)?)?;
    } else if let Some(entry_type) = special_entry_type(&metadata) {
      header.set_entry_type(entry_type);
      header.set_size(0);
      set_device(&mut header, &metadata)?;
      builder.append_data(&mut header, rel, io::empty())?;
    }
  }

  builder.into_inner()
}

fn header_for(metadata: &fs::Metadata) -> io::Result<Header> {
  let mut header = Header::new_gnu();
  header.set_mtime(MAGIC_TIMESTAMP as u64);
  header.set_mode(mode_of(metadata));
  header.set_uid(0);
  header.set_gid(0);
  header.set_username("")?;
  header.set_groupname("")?;
  Ok(header)
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata) -> u32 {
  if metadata.is_dir() { 0o755 } else { 0o644 }
}

#[cfg(unix)]
fn special_entry_type(metadata: &fs::Metadata) -> Option<EntryType> {
  use std::os::unix::fs::FileTypeExt;
  let file_type = metadata.file_type();
  if file_type.is_char_device() {
    Some(EntryType::Char)
  } else if file_type.is_block_device() {
    Some(EntryType::Block)
  } else if file_type.is_fifo() {
    Some(EntryType::Fifo)
  } else {
    None
  }
}

#[cfg(not(unix))]
fn special_entry_type(_metadata: &fs::Metadata) -> Option<EntryType> {
  None
}

#[cfg(unix)]
fn set_device(header: &mut Header, metadata: &fs::Metadata) -> io::Result<()> {
  use std::os::unix::fs::MetadataExt;
  let dev = metadata.rdev();
  header.set_device_major(rustix::fs::major(dev))?;
  header.set_device_minor(rustix::fs::minor(dev))?;
  Ok(())
}

#[cfg(not(unix))]
fn set_device(_header: &mut Header, _metadata: &fs::Metadata) -> io::Result<()> {
  Ok(())
}

/// Extract `archive` into `dest`, detecting gzip by its magic bytes.
pub fn unpack_archive(archive: &Path, dest: &Path) -> io::Result<()> {
  let mut magic = [0u8; 2];
  let is_gzip = {
    let mut file = File::open(archive)?;
    file.read(&mut magic)? == 2 && magic == GZIP_MAGIC
  };

  fs::create_dir_all(dest)?;
  let file = BufReader::new(File::open(archive)?);
  if is_gzip {
    unpack_from(Archive::new(GzDecoder::new(file)), dest)
  } else {
    unpack_from(Archive::new(file), dest)
  }
}

fn unpack_from<R: Read>(mut archive: Archive<R>, dest: &Path) -> io::Result<()> {
  archive.set_preserve_permissions(true);
  archive.set_preserve_mtime(true);
  archive.set_overwrite(true);
  archive.unpack(dest)
}
