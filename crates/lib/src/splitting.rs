//! Split rules and `.meta` files.
//!
//! A chunk's installed files are divided into named sub-artifacts by ordered
//! regex rules, first match wins. A stratum divides its chunks' artifacts the
//! same way, by artifact name. Systems can then install a subset of a
//! stratum's artifacts.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::OverlapPolicy;
use crate::consts::METADATA_DIR;
use crate::defaults::Defaults;
use crate::definitions::{Artifacts, Definition, Kind};
use crate::util::fs::copy_file_list;

#[derive(Debug, Error)]
pub enum SplitError {
  #[error("invalid split rule for {artifact}: {source}")]
  Pattern {
    artifact: String,
    #[source]
    source: regex::Error,
  },

  #[error("split I/O failed at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("malformed metadata {path}: {source}")]
  Metadata {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("no metadata for {name} at {path}")]
  MissingMetadata { name: String, path: PathBuf },

  #[error("{component} overlaps earlier artifacts at {}", paths.join(", "))]
  Overlaps { component: String, paths: Vec<String> },
}

impl SplitError {
  fn io(path: &Path) -> impl FnOnce(io::Error) -> SplitError + '_ {
    move |source| SplitError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Contents of `baserock/<name>.meta`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cache: Option<String>,
  #[serde(default)]
  pub repo: Option<String>,
  #[serde(default, rename = "ref")]
  pub git_ref: Option<String>,
  #[serde(default)]
  pub products: Vec<Product>,
}

/// One sub-artifact: installed paths for chunks, chunk artifacts for strata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
  pub artifact: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub files: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub components: Option<Vec<String>>,
}

impl Product {
  fn members(&self) -> impl Iterator<Item = &String> {
    self.files.iter().chain(self.components.iter()).flatten()
  }
}

impl Metadata {
  pub fn read(path: &Path) -> Result<Self, SplitError> {
    let text = std::fs::read_to_string(path).map_err(SplitError::io(path))?;
    serde_yaml::from_str(&text).map_err(|source| SplitError::Metadata {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Read `<dir>/baserock/<name>.meta`.
  pub fn read_for(dir: &Path, name: &str) -> Result<Self, SplitError> {
    let path = meta_path(dir, name);
    if !path.is_file() {
      return Err(SplitError::MissingMetadata {
        name: name.to_string(),
        path,
      });
    }
    Self::read(&path)
  }

  /// Replace `path`. An existing file is unlinked first, since it may be a
  /// hardlink into the artifact store.
  pub fn write(&self, path: &Path) -> Result<(), SplitError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(SplitError::io(parent))?;
    }
    if path.symlink_metadata().is_ok() {
      std::fs::remove_file(path).map_err(SplitError::io(path))?;
    }
    let text = serde_yaml::to_string(self).map_err(|source| SplitError::Metadata {
      path: path.to_path_buf(),
      source,
    })?;
    std::fs::write(path, text).map_err(SplitError::io(path))
  }

  pub fn artifacts(&self) -> Vec<String> {
    self.products.iter().map(|p| p.artifact.clone()).collect()
  }
}

/// `<dir>/baserock/<name>.meta`
pub fn meta_path(dir: &Path, name: &str) -> PathBuf {
  dir.join(METADATA_DIR).join(format!("{name}.meta"))
}

/// What goes into every `.meta` besides the products.
#[derive(Debug, Clone, Default)]
pub struct MetaContext {
  pub artifact_version: Option<u32>,
  /// Where the definitions came from; recorded for strata.
  pub definitions_dir: String,
  pub definitions_ref: String,
}

impl MetaContext {
  fn version(&self) -> u32 {
    self.artifact_version.unwrap_or(0)
  }

  fn cache(&self, key: &str) -> Option<String> {
    (self.version() >= 1).then(|| key.to_string())
  }
}

/// Ordered, compiled split rules for one definition.
#[derive(Debug, Clone)]
pub struct SplitRules {
  rules: Vec<(String, Regex)>,
}

impl SplitRules {
  /// The definition's own `products` rules, then any default rule whose
  /// artifact is not defined yet. Artifact names starting with `-` are
  /// prefixed with the definition's name.
  pub fn compile(definition: &Definition, defaults: &Defaults) -> Result<Self, SplitError> {
    let mut rules: Vec<(String, Regex)> = Vec::new();
    let own = definition.products.iter().map(|rule| (rule, true));
    let inherited = defaults.split_rules(definition.kind).iter().map(|rule| (rule, false));

    for (rule, is_own) in own.chain(inherited) {
      let artifact = if rule.artifact.starts_with('-') {
        format!("{}{}", definition.name, rule.artifact)
      } else {
        rule.artifact.clone()
      };
      if rules.iter().any(|(name, _)| *name == artifact) {
        if is_own {
          debug!(artifact = %artifact, "ignoring repeated split rule");
        }
        continue;
      }
      let pattern = format!("^(?:{})$", rule.include.join("|"));
      let regex = Regex::new(&pattern).map_err(|source| SplitError::Pattern {
        artifact: artifact.clone(),
        source,
      })?;
      rules.push((artifact, regex));
    }
    Ok(SplitRules { rules })
  }

  /// The first artifact whose rule matches `subject`.
  pub fn classify(&self, subject: &str) -> Option<&str> {
    self
      .rules
      .iter()
      .find(|(_, regex)| regex.is_match(subject))
      .map(|(artifact, _)| artifact.as_str())
  }

  /// Like [`classify`](Self::classify), trying `dir` and `dir/` against
  /// each rule in turn.
  fn classify_dir(&self, dir: &str) -> Option<&str> {
    let slashed = format!("{dir}/");
    self
      .rules
      .iter()
      .find(|(_, regex)| regex.is_match(dir) || regex.is_match(&slashed))
      .map(|(artifact, _)| artifact.as_str())
  }

  pub fn artifacts(&self) -> impl Iterator<Item = &str> {
    self.rules.iter().map(|(artifact, _)| artifact.as_str())
  }

  fn empty_splits(&self) -> BTreeMap<String, BTreeSet<String>> {
    self.artifacts().map(|a| (a.to_string(), BTreeSet::new())).collect()
  }

  fn products(&self, mut splits: BTreeMap<String, BTreeSet<String>>, files: bool) -> Vec<Product> {
    self
      .artifacts()
      .map(|artifact| {
        let members: Vec<String> = splits.remove(artifact).unwrap_or_default().into_iter().collect();
        Product {
          artifact: artifact.to_string(),
          files: files.then(|| members.clone()),
          components: (!files).then_some(members),
        }
      })
      .collect()
  }
}

/// Assign every path under `install` to a sub-artifact.
///
/// Files go to the first matching rule and unmatched files are dropped.
/// Directories holding no assigned file are then matched as `path` or
/// `path/`.
pub fn split_chunk(install: &Path, rules: &SplitRules) -> Result<BTreeMap<String, BTreeSet<String>>, SplitError> {
  let mut splits = rules.empty_splits();
  let mut dirs = Vec::new();
  let mut assigned: Vec<String> = Vec::new();

  for entry in WalkDir::new(install).min_depth(1).contents_first(true).sort_by_file_name() {
    let entry = entry.map_err(|e| SplitError::Io {
      path: install.to_path_buf(),
      source: io::Error::other(e),
    })?;
    let Ok(rel) = entry.path().strip_prefix(install) else {
      continue;
    };
    let rel = rel.to_string_lossy().into_owned();
    if entry.file_type().is_dir() {
      dirs.push(rel);
      continue;
    }
    if let Some(artifact) = rules.classify(&rel) {
      splits.entry(artifact.to_string()).or_default().insert(rel.clone());
      assigned.push(rel);
    }
  }

  // children come before their parents
  for dir in dirs {
    let prefix = format!("{dir}/");
    if assigned.iter().any(|f| f.starts_with(&prefix)) {
      continue;
    }
    if let Some(artifact) = rules.classify_dir(&dir) {
      splits.entry(artifact.to_string()).or_default().insert(dir.clone());
      assigned.push(dir);
    }
  }

  Ok(splits)
}

/// Split a freshly built chunk and write its `.meta` into `metadata_dir`.
pub fn write_chunk_metadata(
  chunk: &Definition,
  key: &str,
  rules: &SplitRules,
  install: &Path,
  metadata_dir: &Path,
  ctx: &MetaContext,
) -> Result<Metadata, SplitError> {
  info!(component = %chunk.name, "splitting chunk");
  let splits = split_chunk(install, rules)?;
  let metadata = Metadata {
    cache: ctx.cache(key),
    repo: chunk.repo.clone(),
    git_ref: chunk.git_ref.clone(),
    products: rules.products(splits, true),
  };
  metadata.write(&metadata_dir.join(format!("{}.meta", chunk.name)))?;
  Ok(metadata)
}

/// A built member of a stratum.
#[derive(Debug, Clone)]
pub struct Member<'a> {
  pub definition: &'a Definition,
  /// Explicit chunk artifact to stratum artifact assignments.
  pub artifacts: &'a Artifacts,
  pub unpacked: PathBuf,
}

/// Write a stratum's `.meta` plus a split `.meta` for each member chunk.
pub fn write_stratum_metadata(
  stratum: &Definition,
  key: &str,
  rules: &SplitRules,
  members: &[Member<'_>],
  metadata_dir: &Path,
  ctx: &MetaContext,
) -> Result<Metadata, SplitError> {
  info!(component = %stratum.name, "splitting stratum");
  let mut splits = rules.empty_splits();

  for member in members.iter().filter(|m| !m.definition.is_bootstrap()) {
    let chunk = Metadata::read_for(&member.unpacked, &member.definition.name)?;
    let explicit: BTreeMap<String, String> = match member.artifacts {
      Artifacts::Map(map) => map.clone(),
      Artifacts::List(_) => BTreeMap::new(),
    };

    let mut kept = Vec::new();
    for product in chunk.products {
      let target = match explicit.get(&product.artifact) {
        Some(target) if splits.contains_key(target) => Some(target.clone()),
        Some(target) => {
          warn!(stratum = %stratum.name, artifact = %product.artifact, target = %target, "unknown stratum artifact");
          None
        }
        None => rules.classify(&product.artifact).map(str::to_string),
      };
      if let Some(target) = target {
        splits.entry(target).or_default().insert(product.artifact.clone());
        kept.push(product);
      }
    }

    let split = Metadata {
      cache: if ctx.version() >= 1 { chunk.cache } else { None },
      repo: chunk.repo,
      git_ref: chunk.git_ref,
      products: kept,
    };
    split.write(&metadata_dir.join(format!("{}.meta", member.definition.name)))?;
  }

  let (repo, git_ref) = if ctx.version() >= 2 {
    (Some(ctx.definitions_dir.clone()), Some(ctx.definitions_ref.clone()))
  } else {
    (None, None)
  };
  let metadata = Metadata {
    cache: ctx.cache(key),
    repo,
    git_ref,
    products: rules.products(splits, false),
  };
  metadata.write(&metadata_dir.join(format!("{}.meta", stratum.name)))?;
  Ok(metadata)
}

/// Copy the selected artifacts of a stratum into `root`.
///
/// The stratum's own `.meta` is read from `stratum_unpacked`; files come from
/// each member chunk's unpacked artifact. An empty `selected` takes every
/// artifact of the stratum. Trimmed `.meta` files for the stratum and each
/// contributing chunk land in `root/baserock`. Returns the paths that
/// overlapped.
pub fn install_stratum_artifacts(
  stratum: &Definition,
  stratum_unpacked: &Path,
  selected: &[String],
  members: &[Member<'_>],
  root: &Path,
) -> Result<Vec<String>, SplitError> {
  let metadata = Metadata::read_for(stratum_unpacked, &stratum.name)?;
  let selected: Vec<String> = if selected.is_empty() {
    metadata.artifacts()
  } else {
    selected.to_vec()
  };
  info!(stratum = %stratum.name, artifacts = ?selected, "installing stratum artifacts");

  let products: Vec<Product> = metadata
    .products
    .iter()
    .filter(|p| selected.contains(&p.artifact))
    .cloned()
    .collect();
  let to_keep: HashSet<&String> = products.iter().flat_map(Product::members).collect();

  let trimmed = Metadata {
    products: products.clone(),
    ..metadata.clone()
  };
  trimmed.write(&meta_path(root, &stratum.name))?;

  let mut overlaps = Vec::new();
  for member in members.iter().filter(|m| !m.definition.is_bootstrap()) {
    let name = &member.definition.name;
    let meta = Metadata::read_for(&member.unpacked, name)?;
    let kept: Vec<Product> = meta
      .products
      .iter()
      .filter(|p| to_keep.contains(&p.artifact))
      .cloned()
      .collect();
    if kept.is_empty() {
      continue;
    }

    let files: Vec<String> = kept.iter().flat_map(Product::members).cloned().collect();
    let trimmed = Metadata { products: kept, ..meta };
    trimmed.write(&meta_path(root, name))?;
    overlaps.extend(copy_file_list(&member.unpacked, root, &files).map_err(SplitError::io(&member.unpacked))?);
  }
  Ok(overlaps)
}

/// Artifacts `default-splits` selects from a stratum.
pub fn default_selection(stratum: &Definition, suffixes: &[String]) -> Vec<String> {
  if stratum.kind != Kind::Stratum {
    return Vec::new();
  }
  suffixes.iter().map(|s| format!("{}{}", stratum.name, s)).collect()
}

/// Remembers every overlapping path reported so far in this process.
#[derive(Debug, Default)]
pub struct OverlapTracker {
  policy: OverlapPolicy,
  seen: HashSet<String>,
  pending: Vec<String>,
}

impl OverlapTracker {
  pub fn new(policy: OverlapPolicy) -> Self {
    OverlapTracker {
      policy,
      ..Default::default()
    }
  }

  pub fn record(&mut self, paths: impl IntoIterator<Item = String>) {
    self.pending.extend(paths);
  }

  /// Report overlaps recorded since the last check.
  ///
  /// Each new path is looked up in the `.meta` files under `metadata_dir`
  /// to name the artifacts that also ship it.
  pub fn check(&mut self, component: &str, metadata_dir: &Path) -> Result<(), SplitError> {
    let pending: BTreeSet<String> = self.pending.drain(..).collect();
    let new: Vec<String> = pending.into_iter().filter(|p| !self.seen.contains(p)).collect();
    if new.is_empty() || self.policy == OverlapPolicy::Ignore {
      self.seen.extend(new);
      return Ok(());
    }

    let metas: Vec<(String, String)> = std::fs::read_dir(metadata_dir)
      .map(|read| {
        read
          .filter_map(Result::ok)
          .filter_map(|e| {
            let text = std::fs::read_to_string(e.path()).ok()?;
            Some((e.file_name().to_string_lossy().into_owned(), text))
          })
          .collect()
      })
      .unwrap_or_default();

    for path in &new {
      warn!(component, path = %path, "overlapping path");
      let needle = path.trim_start_matches('/');
      for (meta, text) in &metas {
        if text.lines().any(|line| line.contains(needle)) {
          warn!(meta = %meta, path = %needle, "overlap at");
        }
      }
    }
    self.seen.extend(new.iter().cloned());

    if self.policy == OverlapPolicy::Exit {
      return Err(SplitError::Overlaps {
        component: component.to_string(),
        paths: new,
      });
    }
    Ok(())
  }
}
