//! One invocation: load definitions, compute keys, then compose the target.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::assembly::{Assembler, AssemblyContext, AssemblyError, Composed};
use crate::cache_key::{KeyComputer, KeyError};
use crate::config::{Config, ConfigError, Mode};
use crate::consts::TREES_FILE;
use crate::definitions::graph::DependencyGraph;
use crate::definitions::trees::{TreeCache, listing_checksum};
use crate::definitions::{Definitions, DefinitionsError, LoadOptions};
use crate::repos::{Mirrors, describe_head};
use crate::run_lock::{RunLock, RunLockError};
use crate::store::cull::{Statvfs, cull};
use crate::store::{Store, StoreError};
use crate::util::fs::remove_path;

/// Files that mark the root of a definitions tree.
const ROOT_MARKERS: [&str; 3] = ["VERSION", "DEFAULTS", ".git"];
const UNVERSIONED: &str = "unversioned";

#[derive(Debug, Error)]
pub enum RunError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Definitions(#[from] DefinitionsError),

  #[error(transparent)]
  Keys(#[from] KeyError),

  #[error(transparent)]
  Assembly(#[from] AssemblyError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Lock(#[from] RunLockError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{target} cannot be built: a cache key is missing for it or a prerequisite")]
  Unbuildable { target: String },

  #[error("{target} is not built for {arch}")]
  WrongArch { target: String, arch: String },
}

impl RunError {
  fn io(path: &Path) -> impl FnOnce(std::io::Error) -> RunError + '_ {
    move |source| RunError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Counts and timing of a finished build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
  pub target: String,
  pub key: String,
  pub built: usize,
  pub fetched: usize,
  pub total: usize,
  pub retries: usize,
  pub elapsed: Duration,
}

/// What a run produced, depending on the mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
  /// `parse-only`: the target's dependency order.
  Order(Vec<String>),
  /// `keys-only`: `(path, key)` for everything the target needs.
  Keys(Vec<(String, String)>),
  Built(Summary),
}

/// Where the definitions live and which one to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  pub root: PathBuf,
  /// Relative to `root`.
  pub path: String,
}

impl Target {
  /// Locate the definitions root for `file`.
  ///
  /// The root is the nearest ancestor holding `VERSION`, `DEFAULTS` or
  /// `.git`, falling back to `cwd`.
  pub fn locate(file: &Path, cwd: &Path) -> Self {
    let absolute = if file.is_absolute() {
      file.to_path_buf()
    } else {
      cwd.join(file)
    };
    let absolute = dunce::canonicalize(&absolute).unwrap_or(absolute);

    let root = absolute
      .ancestors()
      .skip(1)
      .find(|dir| ROOT_MARKERS.iter().any(|marker| dir.join(marker).exists()))
      .map(Path::to_path_buf)
      .unwrap_or_else(|| dunce::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf()));

    let path = absolute
      .strip_prefix(&root)
      .map(|rel| rel.to_string_lossy().replace('\\', "/"))
      .unwrap_or_else(|_| file.to_string_lossy().into_owned());
    Target { root, path }
  }
}

/// HEAD of the definitions repository, or `unversioned`.
pub fn definitions_ref(root: &Path) -> String {
  describe_head(root).unwrap_or_else(|| UNVERSIONED.to_string())
}

/// Run `config` against the definition at `target`.
pub async fn run(config: &Config, target: &Target) -> Result<Outcome, RunError> {
  let started = Instant::now();
  let artifacts = config.artifacts();
  config.create_directories().map_err(RunError::io(&artifacts))?;

  let options = LoadOptions {
    artifact_version: config.artifact_version,
    schema_validation: config.schema_validation,
  };
  let mut definitions = Definitions::load(&target.root, options)?;
  let target_path = definitions.resolve_target(&target.path, config.artifact_version)?;

  if config.mode == Mode::ParseOnly {
    let order = DependencyGraph::for_target(&definitions, &target_path)?.build_order()?;
    info!(target = %target_path, components = order.len(), "parsed definitions");
    return Ok(Outcome::Order(order));
  }

  let trees_path = artifacts.join(TREES_FILE);
  let checksum = listing_checksum(&target.root).map_err(RunError::io(&target.root))?;
  let previous = TreeCache::read(&trees_path);
  if previous.checksum().is_some_and(|c| c != checksum) {
    warn!(path = %trees_path.display(), "definitions changed since the trees were recorded");
  }
  definitions.apply_trees(&previous);

  let mirrors = Mirrors::new(config);
  let keys = KeyComputer::new(&definitions, &mirrors, config).compute(&target_path).await?;
  if config.mode != Mode::NoBuild {
    let snapshot = keys.tree_snapshot(&definitions, Some(checksum));
    if let Err(e) = snapshot.save(&trees_path) {
      warn!(path = %trees_path.display(), error = %e, "failed to save trees");
    }
  }

  if config.mode == Mode::KeysOnly {
    let listing = keys.iter().map(|(path, key)| (path.to_string(), key.to_string())).collect();
    return Ok(Outcome::Keys(listing));
  }

  let instance = config.instance.unwrap_or(0);
  let mut run_lock = RunLock::acquire(&config.tmp(), instance)?;
  if run_lock.is_exclusive() {
    if config.cleanup {
      clean_tmp(&config.tmp())?;
    }
    let report = cull(&Store::new(&artifacts), config.min_gigabytes, &keys.live_keys(), &Statvfs)?;
    debug!(removed = report.removed, free_bytes = report.free_bytes, "startup cull");
    run_lock.downgrade()?;
  }

  let context = AssemblyContext {
    definitions_ref: definitions_ref(&target.root),
    instance: config.instance,
  };
  let mut assembler = Assembler::new(&definitions, &keys, config, context)?;
  let span = info_span!("run", target = %target_path);
  let key = async {
    loop {
      match assembler.compose(&target_path).await? {
        Composed::Key(key) => return Ok::<_, RunError>(key),
        Composed::Retry => continue,
        Composed::Unbuildable => {
          return Err(RunError::Unbuildable {
            target: target_path.clone(),
          });
        }
        Composed::Skipped => {
          return Err(RunError::WrongArch {
            target: target_path.clone(),
            arch: config.arch.clone().unwrap_or_default(),
          });
        }
      }
    }
  }
  .instrument(span)
  .await?;

  let progress = assembler.progress();
  Ok(Outcome::Built(Summary {
    target: target_path,
    key,
    built: progress.built,
    fetched: progress.fetched,
    total: progress.total,
    retries: progress.retries,
    elapsed: started.elapsed(),
  }))
}

/// Remove leftover sandboxes and downloads under `tmp`, keeping lock files.
fn clean_tmp(tmp: &Path) -> Result<(), RunError> {
  let entries = std::fs::read_dir(tmp).map_err(RunError::io(tmp))?;
  let mut removed = 0;
  for entry in entries.filter_map(Result::ok) {
    let path = entry.path();
    if !path.is_dir() {
      continue;
    }
    remove_path(&path).map_err(RunError::io(&path))?;
    removed += 1;
  }
  if removed > 0 {
    info!(removed, tmp = %tmp.display(), "removed stale sandboxes");
  }
  Ok(())
}
