//! Cache keys.
//!
//! A key is `<name>.<sha256>` over a JSON map of every input that can change
//! a build: the target architecture, the keys of all prerequisites, the
//! source tree, submodules, command lists and, depending on the artifact
//! version, the default build-system commands.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, Mode};
use crate::defaults::MANUAL;
use crate::definitions::trees::TreeCache;
use crate::definitions::graph::collect_systems;
use crate::definitions::{Definition, Definitions, DefinitionsError, Kind};
use crate::repos::{RepoError, TreeSource};
use crate::util::hash::hash_json;

const NO_BUILD: &str = "no-build";

#[derive(Debug, Error)]
pub enum KeyError {
  #[error("dependency cycle through {path}")]
  Cycle { path: String },

  #[error(transparent)]
  Definitions(#[from] DefinitionsError),

  #[error("failed to resolve the source tree of {path}: {source}")]
  Tree {
    path: String,
    #[source]
    source: RepoError,
  },

  #[error("failed to encode key factors of {path}: {source}")]
  Encode {
    path: String,
    #[source]
    source: serde_json::Error,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Visit {
  InProgress,
  /// `None` when the definition is filtered out by `arch`.
  Done(Option<String>),
}

/// Every key reachable from a target, plus the trees resolved on the way.
#[derive(Debug, Clone, Default)]
pub struct CacheKeys {
  keys: BTreeMap<String, Option<String>>,
  trees: HashMap<String, String>,
}

impl CacheKeys {
  /// Key of `path`; `None` when filtered out or never computed.
  pub fn get(&self, path: &str) -> Option<&str> {
    self.keys.get(path).and_then(|k| k.as_deref())
  }

  pub fn is_filtered(&self, path: &str) -> bool {
    matches!(self.keys.get(path), Some(None))
  }

  pub fn tree(&self, path: &str) -> Option<&str> {
    self.trees.get(path).map(String::as_str)
  }

  /// `(path, key)` pairs, filtered definitions excluded.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .keys
      .iter()
      .filter_map(|(path, key)| key.as_deref().map(|k| (path.as_str(), k)))
  }

  pub fn live_keys(&self) -> HashSet<String> {
    self.iter().map(|(_, key)| key.to_string()).collect()
  }

  pub fn len(&self) -> usize {
    self.keys.len()
  }

  pub fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }

  /// Tree cache contents for every definition with a known ref and tree.
  pub fn tree_snapshot(&self, definitions: &Definitions, checksum: Option<String>) -> TreeCache {
    let mut cache = TreeCache::new(checksum);
    for definition in definitions.iter() {
      let Some(git_ref) = definition.git_ref.as_deref() else {
        continue;
      };
      let tree = self.tree(&definition.path).or(definition.tree.as_deref());
      if let Some(tree) = tree {
        cache.record(&definition.path, git_ref, tree, self.get(&definition.path));
      }
    }
    cache
  }
}

/// Computes keys depth-first, resolving source trees through `T`.
pub struct KeyComputer<'a, T: TreeSource> {
  definitions: &'a Definitions,
  source: &'a T,
  arch: String,
  mode: Mode,
  artifact_version: Option<u32>,
  default_splits: Vec<String>,
  visits: HashMap<String, Visit>,
  trees: HashMap<String, String>,
}

impl<'a, T: TreeSource> KeyComputer<'a, T> {
  pub fn new(definitions: &'a Definitions, source: &'a T, config: &Config) -> Self {
    KeyComputer {
      definitions,
      source,
      arch: config.arch.clone().unwrap_or_default(),
      mode: config.mode,
      artifact_version: config.artifact_version,
      default_splits: config.default_splits.clone(),
      visits: HashMap::new(),
      trees: HashMap::new(),
    }
  }

  /// Compute the key of `target` and everything it depends on.
  pub async fn compute(mut self, target: &str) -> Result<CacheKeys, KeyError> {
    let key = self.key(target, "target").await?;
    info!(target, key = key.as_deref().unwrap_or("<filtered>"), "computed cache keys");

    let keys = self
      .visits
      .into_iter()
      .filter_map(|(path, visit)| match visit {
        Visit::Done(key) => Some((path, key)),
        Visit::InProgress => None,
      })
      .collect();
    Ok(CacheKeys {
      keys,
      trees: self.trees,
    })
  }

  async fn key(&mut self, path: &str, from: &str) -> Result<Option<String>, KeyError> {
    match self.visits.get(path) {
      Some(Visit::Done(key)) => return Ok(key.clone()),
      Some(Visit::InProgress) => return Err(KeyError::Cycle { path: path.to_string() }),
      None => {}
    }

    let definitions = self.definitions;
    let definition = definitions.require(path, from)?;
    if definition.arch.as_ref().is_some_and(|arch| *arch != self.arch) {
      debug!(path, arch = ?definition.arch, "filtered out by arch");
      self.visits.insert(path.to_string(), Visit::Done(None));
      return Ok(None);
    }

    self.visits.insert(path.to_string(), Visit::InProgress);

    let mut factors: BTreeMap<String, Value> = BTreeMap::new();
    for prerequisite in direct_prerequisites(definition) {
      let key = Box::pin(self.key(prerequisite, path)).await?;
      factors.insert(prerequisite.to_string(), key.map(Value::String).unwrap_or(Value::Bool(false)));
    }

    let hex = if matches!(self.mode, Mode::NoBuild | Mode::ParseOnly) {
      NO_BUILD.to_string()
    } else {
      if let Some(tree) = self.tree_of(definition).await? {
        factors.insert("tree".to_string(), Value::String(tree));
      }
      self.add_own_factors(definition, &mut factors)?;
      hash_json(&factors).map_err(|source| KeyError::Encode {
        path: path.to_string(),
        source,
      })?
    };

    let key = format!("{}.{}", definition.name, hex);
    debug!(path, key = %key, "cache key");
    self.visits.insert(path.to_string(), Visit::Done(Some(key.clone())));
    Ok(Some(key))
  }

  async fn tree_of(&mut self, definition: &Definition) -> Result<Option<String>, KeyError> {
    if let Some(tree) = &definition.tree {
      self.trees.insert(definition.path.clone(), tree.clone());
      return Ok(Some(tree.clone()));
    }
    if let Some(tree) = self.trees.get(&definition.path) {
      return Ok(Some(tree.clone()));
    }
    let (Some(repo), Some(git_ref)) = (&definition.repo, &definition.git_ref) else {
      return Ok(None);
    };

    let tree = self
      .source
      .resolve_tree(repo, git_ref)
      .await
      .map_err(|source| KeyError::Tree {
        path: definition.path.clone(),
        source,
      })?;
    self.trees.insert(definition.path.clone(), tree.clone());
    Ok(Some(tree))
  }

  fn add_own_factors(&self, definition: &Definition, factors: &mut BTreeMap<String, Value>) -> Result<(), KeyError> {
    let encode = |source| KeyError::Encode {
      path: definition.path.clone(),
      source,
    };

    factors.insert("arch".to_string(), Value::String(self.arch.clone()));

    if let Some(submodules) = &definition.submodules {
      factors.insert("submodules".to_string(), serde_json::to_value(submodules).map_err(encode)?);
    }

    for step in &self.definitions.defaults().build_steps {
      if let Some(commands) = definition.commands(step) {
        factors.insert(step.clone(), serde_json::to_value(commands).map_err(encode)?);
      }
    }

    if self.artifact_version.is_some_and(|v| v >= 6) && !definition.devices.is_empty() {
      factors.insert("devices".to_string(), serde_json::to_value(&definition.devices).map_err(encode)?);
    }

    if let Some(version) = self.artifact_version {
      factors.insert("artifact-version".to_string(), Value::from(version));
      let defaults = self.definitions.defaults();
      let build_systems = if version <= 2 {
        serde_json::to_value(&defaults.build_systems).map_err(encode)?
      } else {
        let name = definition.build_system.as_deref().unwrap_or(MANUAL);
        serde_json::to_value(defaults.build_system(name)).map_err(encode)?
      };
      factors.insert("default-build-systems".to_string(), build_systems);

      if version >= 2 && definition.kind == Kind::System && !self.default_splits.is_empty() {
        factors.insert(
          "default-splits".to_string(),
          serde_json::to_value(&self.default_splits).map_err(encode)?,
        );
      }
    }

    Ok(())
  }
}

/// Paths whose keys feed into the key of `definition`.
fn direct_prerequisites(definition: &Definition) -> Vec<&str> {
  let mut paths: Vec<&str> = definition.build_depends.iter().map(String::as_str).collect();
  paths.extend(definition.member_paths());
  if definition.kind == Kind::Cluster {
    collect_systems(&definition.systems, &mut paths);
  }
  paths
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::definitions::LoadOptions;
  use crate::util::testutil::write_file;
  use std::cell::RefCell;
  use std::future::Future;
  use tempfile::TempDir;

  /// Answers every lookup with a tree derived from the ref.
  #[derive(Default)]
  struct StubTrees {
    calls: RefCell<Vec<String>>,
  }

  impl TreeSource for StubTrees {
    fn resolve_tree(&self, repo: &str, git_ref: &str) -> impl Future<Output = Result<String, RepoError>> {
      self.calls.borrow_mut().push(format!("{repo}@{git_ref}"));
      let tree = format!("tree-of-{git_ref}");
      async move { Ok(tree) }
    }
  }

  const CHUNKS: &[(&str, &str)] = &[
    (
      "strata/s1.def",
      "name: s1\nkind: stratum\nchunks:\n- name: c1\n  morph: chunks/c1.def\n  repo: upstream:c1\n  ref: a1\n- name: c2\n  morph: chunks/c2.def\n  repo: upstream:c2\n  ref: b1\n",
    ),
    ("chunks/c1.def", "name: c1\ninstall-commands: [make install]\n"),
    ("chunks/c2.def", "name: c2\ninstall-commands: [make install]\n"),
  ];

  fn tree(files: &[(&str, &str)]) -> TempDir {
    let temp = TempDir::new().unwrap();
    for (path, content) in files {
      write_file(temp.path(), path, content);
    }
    temp
  }

  fn config(extra: &str) -> Config {
    Config::from_yaml(extra).unwrap().with_target("strata/s1.def", "x86_64")
  }

  async fn keys_for(root: &std::path::Path, config: &Config) -> CacheKeys {
    let defs = Definitions::load(root, LoadOptions::default()).unwrap();
    let stub = StubTrees::default();
    KeyComputer::new(&defs, &stub, config).compute("strata/s1.def").await.unwrap()
  }

  fn replace(root: &std::path::Path, rel: &str, from: &str, to: &str) {
    let path = root.join(rel);
    let text = std::fs::read_to_string(&path).unwrap().replace(from, to);
    std::fs::write(path, text).unwrap();
  }

  #[tokio::test]
  async fn keys_are_deterministic_and_named() {
    let temp = tree(CHUNKS);
    let first = keys_for(temp.path(), &config("")).await;
    let second = keys_for(temp.path(), &config("")).await;

    let key = first.get("strata/s1.def").unwrap();
    assert!(key.starts_with("s1."));
    assert_eq!(key.len(), "s1.".len() + 64);
    assert_eq!(first.live_keys(), second.live_keys());
    assert_eq!(first.tree("chunks/c1.def"), Some("tree-of-a1"));
  }

  #[tokio::test]
  async fn new_ref_changes_only_dependents() {
    let temp = tree(CHUNKS);
    let before = keys_for(temp.path(), &config("")).await;
    replace(temp.path(), "strata/s1.def", "ref: b1", "ref: b2");
    let after = keys_for(temp.path(), &config("")).await;

    assert_eq!(before.get("chunks/c1.def"), after.get("chunks/c1.def"));
    assert_ne!(before.get("chunks/c2.def"), after.get("chunks/c2.def"));
    assert_ne!(before.get("strata/s1.def"), after.get("strata/s1.def"));
  }

  #[tokio::test]
  async fn build_depends_edit_changes_dependent_and_parent() {
    let temp = tree(CHUNKS);
    let before = keys_for(temp.path(), &config("")).await;
    replace(
      temp.path(),
      "strata/s1.def",
      "  repo: upstream:c2\n",
      "  repo: upstream:c2\n  build-depends: [c1]\n",
    );
    let after = keys_for(temp.path(), &config("")).await;

    assert_eq!(before.get("chunks/c1.def"), after.get("chunks/c1.def"));
    assert_ne!(before.get("chunks/c2.def"), after.get("chunks/c2.def"));
    assert_ne!(before.get("strata/s1.def"), after.get("strata/s1.def"));
  }

  #[tokio::test]
  async fn commands_count_but_descriptions_do_not() {
    let temp = tree(CHUNKS);
    let before = keys_for(temp.path(), &config("")).await;

    replace(temp.path(), "chunks/c1.def", "name: c1\n", "name: c1\ndescription: the c1 library\n");
    let described = keys_for(temp.path(), &config("")).await;
    assert_eq!(before.get("chunks/c1.def"), described.get("chunks/c1.def"));

    replace(temp.path(), "chunks/c1.def", "make install", "make install-strip");
    let edited = keys_for(temp.path(), &config("")).await;
    assert_ne!(before.get("chunks/c1.def"), edited.get("chunks/c1.def"));
  }

  #[tokio::test]
  async fn arch_mismatch_is_filtered() {
    let temp = tree(CHUNKS);
    replace(temp.path(), "chunks/c2.def", "name: c2\n", "name: c2\narch: armv7lhf\n");

    let keys = keys_for(temp.path(), &config("")).await;
    assert!(keys.is_filtered("chunks/c2.def"));
    assert_eq!(keys.get("chunks/c2.def"), None);
    assert!(keys.get("strata/s1.def").is_some());
    assert!(!keys.live_keys().iter().any(|k| k.starts_with("c2.")));
  }

  #[tokio::test]
  async fn cycles_are_fatal() {
    let temp = tree(&[
      ("strata/s1.def", "name: s1\nkind: stratum\nbuild-depends: [strata/s2.def]\n"),
      ("strata/s2.def", "name: s2\nkind: stratum\nbuild-depends: [strata/s1.def]\n"),
    ]);
    let defs = Definitions::load(temp.path(), LoadOptions::default()).unwrap();
    let stub = StubTrees::default();

    let err = KeyComputer::new(&defs, &stub, &config(""))
      .compute("strata/s1.def")
      .await
      .unwrap_err();
    assert!(matches!(err, KeyError::Cycle { .. }));
  }

  #[tokio::test]
  async fn nested_subsystems_feed_the_cluster_key() {
    let temp = tree(CHUNKS);
    for (path, content) in [
      ("cl.def", "name: cl\nkind: cluster\nsystems:\n- morph: sys.def\n  subsystems:\n  - morph: sub.def\n"),
      ("sys.def", "name: sys\nkind: system\narch: x86_64\ncontents: [strata/s1.def]\n"),
      ("sub.def", "name: sub\nkind: system\narch: x86_64\ncontents: [strata/s2.def]\n"),
      (
        "strata/s2.def",
        "name: s2\nkind: stratum\nchunks:\n- name: c3\n  repo: upstream:c3\n  ref: c1\n  build-system: manual\n",
      ),
    ] {
      write_file(temp.path(), path, content);
    }
    let keys = |root: std::path::PathBuf| async move {
      let defs = Definitions::load(&root, LoadOptions::default()).unwrap();
      let stub = StubTrees::default();
      KeyComputer::new(&defs, &stub, &config("")).compute("cl.def").await.unwrap()
    };

    let before = keys(temp.path().to_path_buf()).await;
    assert!(before.get("sub.def").is_some());
    replace(temp.path(), "strata/s2.def", "ref: c1", "ref: c2");
    let after = keys(temp.path().to_path_buf()).await;

    assert_eq!(before.get("sys.def"), after.get("sys.def"));
    assert_ne!(before.get("sub.def"), after.get("sub.def"));
    assert_ne!(before.get("cl.def"), after.get("cl.def"));
  }

  #[tokio::test]
  async fn no_build_mode_skips_tree_lookups() {
    let temp = tree(CHUNKS);
    let defs = Definitions::load(temp.path(), LoadOptions::default()).unwrap();
    let stub = StubTrees::default();

    let keys = KeyComputer::new(&defs, &stub, &config("mode: no-build\n"))
      .compute("strata/s1.def")
      .await
      .unwrap();
    assert_eq!(keys.get("chunks/c1.def"), Some("c1.no-build"));
    assert!(stub.calls.borrow().is_empty());
  }

  #[tokio::test]
  async fn artifact_version_selects_build_system_factor() {
    let temp = tree(CHUNKS);
    let v1 = keys_for(temp.path(), &config("artifact-version: 1\n")).await;
    let v3 = keys_for(temp.path(), &config("artifact-version: 3\n")).await;
    let unset = keys_for(temp.path(), &config("")).await;

    assert_ne!(v1.get("chunks/c1.def"), v3.get("chunks/c1.def"));
    assert_ne!(unset.get("chunks/c1.def"), v3.get("chunks/c1.def"));

    replace(temp.path(), "chunks/c1.def", "name: c1\n", "name: c1\nbuild-system: cmake\n");
    let v3_cmake = keys_for(temp.path(), &config("artifact-version: 3\n")).await;
    assert_ne!(v3.get("chunks/c1.def"), v3_cmake.get("chunks/c1.def"));
  }

  #[tokio::test]
  async fn version_two_hashes_the_whole_build_system_table() {
    let temp = tree(CHUNKS);
    let table = include_str!("defaults/defaults.yaml");
    write_file(temp.path(), "DEFAULTS", table);
    let before = keys_for(temp.path(), &config("artifact-version: 2\n")).await;

    replace(temp.path(), "DEFAULTS", "-DCMAKE_INSTALL_LIBDIR=lib", "-DCMAKE_INSTALL_LIBDIR=lib64");
    let after = keys_for(temp.path(), &config("artifact-version: 2\n")).await;
    assert_ne!(before.get("chunks/c1.def"), after.get("chunks/c1.def"));

    let v3_before = {
      write_file(temp.path(), "DEFAULTS", table);
      keys_for(temp.path(), &config("artifact-version: 3\n")).await
    };
    replace(temp.path(), "DEFAULTS", "-DCMAKE_INSTALL_LIBDIR=lib", "-DCMAKE_INSTALL_LIBDIR=lib64");
    let v3_after = keys_for(temp.path(), &config("artifact-version: 3\n")).await;
    assert_eq!(v3_before.get("chunks/c1.def"), v3_after.get("chunks/c1.def"));
  }

  #[tokio::test]
  async fn known_trees_skip_resolution() {
    let temp = tree(CHUNKS);
    let mut defs = Definitions::load(temp.path(), LoadOptions::default()).unwrap();
    let mut cache = TreeCache::default();
    cache.record("chunks/c1.def", "a1", "recorded", None);
    defs.apply_trees(&cache);

    let stub = StubTrees::default();
    let keys = KeyComputer::new(&defs, &stub, &config(""))
      .compute("strata/s1.def")
      .await
      .unwrap();
    assert_eq!(keys.tree("chunks/c1.def"), Some("recorded"));
    assert_eq!(*stub.calls.borrow(), vec!["upstream:c2@b1".to_string()]);

    let snapshot = keys.tree_snapshot(&defs, None);
    assert_eq!(snapshot.tree_for("chunks/c2.def", "b1"), Some("tree-of-b1"));
  }
}
