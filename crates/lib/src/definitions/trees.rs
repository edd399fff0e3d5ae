//! The `.trees` cache of resolved source trees.
//!
//! Stored as YAML under the artifacts root:
//!
//! ```yaml
//! chunks/gcc.def: [<ref>, <tree>, <cache-key>]
//! .checksum: <md5 of the definitions root listing>
//! ```

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;

use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

use crate::util::fs::top_level_names;
use crate::util::hash::md5_bytes;

const CHECKSUM_KEY: &str = ".checksum";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
  pub git_ref: String,
  pub tree: String,
  pub cache: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeCache {
  entries: BTreeMap<String, TreeEntry>,
  checksum: Option<String>,
}

impl TreeCache {
  pub fn new(checksum: Option<String>) -> Self {
    TreeCache {
      entries: BTreeMap::new(),
      checksum,
    }
  }

  /// Read `path`. A missing or malformed file yields an empty cache.
  pub fn read(path: &Path) -> Self {
    let text = match std::fs::read_to_string(path) {
      Ok(text) => text,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::default(),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "ignoring unreadable trees file");
        return Self::default();
      }
    };
    let mapping = match serde_yaml::from_str::<Value>(&text) {
      Ok(Value::Mapping(mapping)) => mapping,
      Ok(_) | Err(_) => {
        warn!(path = %path.display(), "ignoring malformed trees file");
        return Self::default();
      }
    };

    let mut cache = Self::default();
    for (key, value) in mapping {
      let Some(key) = key.as_str() else {
        continue;
      };
      if key == CHECKSUM_KEY {
        cache.checksum = value.as_str().map(str::to_string);
        continue;
      }
      let Value::Sequence(fields) = value else {
        continue;
      };
      let text = |i: usize| fields.get(i).and_then(Value::as_str).map(str::to_string);
      if let (Some(git_ref), Some(tree)) = (text(0), text(1)) {
        cache.entries.insert(
          key.to_string(),
          TreeEntry {
            git_ref,
            tree,
            cache: text(2),
          },
        );
      }
    }
    debug!(path = %path.display(), entries = cache.entries.len(), "read trees");
    cache
  }

  /// Write the cache to `path` via a temporary file and rename.
  pub fn save(&self, path: &Path) -> io::Result<()> {
    let mut mapping = Mapping::new();
    for (def_path, entry) in &self.entries {
      let cache = entry.cache.clone().map(Value::String).unwrap_or(Value::Null);
      mapping.insert(
        Value::String(def_path.clone()),
        Value::Sequence(vec![
          Value::String(entry.git_ref.clone()),
          Value::String(entry.tree.clone()),
          cache,
        ]),
      );
    }
    if let Some(checksum) = &self.checksum {
      mapping.insert(Value::String(CHECKSUM_KEY.to_string()), Value::String(checksum.clone()));
    }
    let text = serde_yaml::to_string(&mapping).map_err(io::Error::other)?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(text.as_bytes())?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
  }

  pub fn record(&mut self, path: &str, git_ref: &str, tree: &str, cache: Option<&str>) {
    self.entries.insert(
      path.to_string(),
      TreeEntry {
        git_ref: git_ref.to_string(),
        tree: tree.to_string(),
        cache: cache.map(str::to_string),
      },
    );
  }

  /// The recorded tree for `path`, if it was resolved from the same ref.
  pub fn tree_for(&self, path: &str, git_ref: &str) -> Option<&str> {
    self
      .entries
      .get(path)
      .filter(|entry| entry.git_ref == git_ref)
      .map(|entry| entry.tree.as_str())
  }

  pub fn checksum(&self) -> Option<&str> {
    self.checksum.as_deref()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// MD5 over the sorted top-level entry names of the definitions root.
pub fn listing_checksum(root: &Path) -> io::Result<String> {
  let names = top_level_names(root)?;
  Ok(md5_bytes(names.join("\n").as_bytes()))
}
