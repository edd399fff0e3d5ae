//! Loading and normalising the definitions tree.
//!
//! Every `.def` and `.morph` file below the root is parsed, its legacy keys
//! rewritten, and every nested component hoisted into a flat table keyed by
//! path. The result is converted into typed [`Definition`]s once and not
//! changed afterwards.

pub mod graph;
pub mod schema;
pub mod trees;
mod types;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::SchemaValidation;
use crate::defaults::{Defaults, DefaultsError};

pub use types::{
  Artifacts, BuildMode, ClusterSystem, Command, ContentRef, Definition, Device, Kind, SplitRule, Submodule,
};

use trees::TreeCache;

const EXTENSIONS: [&str; 2] = ["def", "morph"];

#[derive(Debug, Error)]
pub enum DefinitionsError {
  #[error("failed to scan definitions: {0}")]
  Walk(#[from] walkdir::Error),

  #[error("{path} failed validation: {problems}")]
  Schema { path: String, problems: String },

  #[error("definition in {context} has neither path nor name")]
  Anonymous { context: String },

  #[error("{name} contains itself")]
  ContainsItself { name: String },

  #[error("{path}: {message}")]
  Malformed { path: String, message: String },

  #[error("{path} is not a valid definition: {source}")]
  Invalid {
    path: String,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("no definition found for target '{0}'")]
  UnknownTarget(String),

  #[error("{from} refers to {path}, which is not defined")]
  UnknownReference { from: String, path: String },

  #[error("dependency cycle through {path}")]
  Cycle { path: String },

  #[error(transparent)]
  Defaults(#[from] DefaultsError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
  pub artifact_version: Option<u32>,
  pub schema_validation: SchemaValidation,
}

/// The normalised definitions of one tree.
#[derive(Debug)]
pub struct Definitions {
  root: PathBuf,
  defaults: Defaults,
  data: BTreeMap<String, Definition>,
}

impl Definitions {
  /// Walk `root`, normalise every definition and index them by path.
  ///
  /// Unreadable or unparsable files are logged and dropped. Structural
  /// errors in readable files are fatal.
  pub fn load(root: &Path, options: LoadOptions) -> Result<Self, DefinitionsError> {
    let defaults = Defaults::load(root)?;
    let mut loader = Loader {
      options,
      root,
      data: BTreeMap::new(),
    };

    let walker = WalkDir::new(root)
      .sort_by_file_name()
      .into_iter()
      .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
      let entry = entry?;
      if !entry.file_type().is_file() || !has_definition_extension(entry.path()) {
        continue;
      }
      let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
      let rel = rel.to_string_lossy().replace('\\', "/");
      let Some(mut mapping) = read_mapping(entry.path()) else {
        continue;
      };

      schema::check(&rel, &mapping, options.schema_validation)?;
      mapping.insert(key("path"), Value::String(loader.demorph(&rel)));
      loader.fix_keys(&mut mapping, &rel)?;
      loader.tidy_and_insert(mapping)?;
    }

    let mut data = BTreeMap::new();
    for (path, mapping) in loader.data {
      let definition =
        Definition::from_mapping(mapping, &defaults.build_steps).map_err(|source| DefinitionsError::Invalid {
          path: path.clone(),
          source,
        })?;
      data.insert(path, definition);
    }

    info!(count = data.len(), root = %root.display(), "loaded definitions");
    Ok(Definitions {
      root: root.to_path_buf(),
      defaults,
      data,
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn defaults(&self) -> &Defaults {
    &self.defaults
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn get(&self, path: &str) -> Option<&Definition> {
    self.data.get(path)
  }

  /// Look up `path`, reporting `from` as the referrer when it is missing.
  pub fn require(&self, path: &str, from: &str) -> Result<&Definition, DefinitionsError> {
    self.data.get(path).ok_or_else(|| DefinitionsError::UnknownReference {
      from: from.to_string(),
      path: path.to_string(),
    })
  }

  pub fn iter(&self) -> impl Iterator<Item = &Definition> {
    self.data.values()
  }

  /// Canonical path of the definition the user asked for, by path or name.
  pub fn resolve_target(&self, target: &str, artifact_version: Option<u32>) -> Result<String, DefinitionsError> {
    let target = target.trim_start_matches("./");
    let candidate = demorph(target, artifact_version);
    if self.data.contains_key(&candidate) {
      return Ok(candidate);
    }
    if self.data.contains_key(target) {
      return Ok(target.to_string());
    }

    let as_name = target.replace('/', "-");
    self
      .data
      .values()
      .find(|d| d.name == target || d.name == as_name)
      .map(|d| d.path.clone())
      .ok_or_else(|| DefinitionsError::UnknownTarget(target.to_string()))
  }

  /// Fill `tree` from a previous run wherever the recorded ref still matches.
  pub fn apply_trees(&mut self, cache: &TreeCache) -> usize {
    let mut filled = 0;
    for definition in self.data.values_mut() {
      if definition.tree.is_some() {
        continue;
      }
      let Some(git_ref) = definition.git_ref.as_deref() else {
        continue;
      };
      if let Some(tree) = cache.tree_for(&definition.path, git_ref) {
        definition.tree = Some(tree.to_string());
        filled += 1;
      }
    }
    debug!(filled, "backfilled trees");
    filled
  }
}

fn has_definition_extension(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .is_some_and(|e| EXTENSIONS.contains(&e))
}

fn read_mapping(path: &Path) -> Option<Mapping> {
  let text = match std::fs::read_to_string(path) {
    Ok(text) => text,
    Err(e) => {
      warn!(path = %path.display(), error = %e, "skipping unreadable definition");
      return None;
    }
  };
  match serde_yaml::from_str::<Value>(&text) {
    Ok(Value::Mapping(mapping)) => Some(mapping),
    Ok(_) => {
      warn!(path = %path.display(), "skipping definition that is not a mapping");
      None
    }
    Err(e) => {
      warn!(path = %path.display(), error = %e, "skipping unparsable definition");
      None
    }
  }
}

fn key(name: &str) -> Value {
  Value::String(name.to_string())
}

fn string_field(mapping: &Mapping, name: &str) -> Option<String> {
  mapping.get(name).and_then(Value::as_str).map(str::to_string)
}

/// Strip a legacy `.morph` suffix once the artifact version asks for it.
pub fn demorph(path: &str, artifact_version: Option<u32>) -> String {
  match (artifact_version, path.strip_suffix(".morph")) {
    (Some(v), Some(stem)) if v >= 4 => stem.to_string(),
    _ => path.to_string(),
  }
}

struct Loader<'a> {
  options: LoadOptions,
  root: &'a Path,
  data: BTreeMap<String, Mapping>,
}

impl Loader<'_> {
  fn demorph(&self, path: &str) -> String {
    demorph(path, self.options.artifact_version)
  }

  /// Rewrite `morph` into `path`, default `path` and `name`, and recurse into
  /// cluster systems.
  fn fix_keys(&self, item: &mut Mapping, context: &str) -> Result<(), DefinitionsError> {
    let morph = item.remove("morph").and_then(|v| v.as_str().map(str::to_string));
    if let Some(morph) = &morph
      && !self.root.join(morph).is_file()
    {
      warn!(morph = %morph, context, "definition file not found");
    }

    if string_field(item, "path").is_none() {
      let path = morph
        .or_else(|| string_field(item, "name"))
        .ok_or_else(|| DefinitionsError::Anonymous {
          context: context.to_string(),
        })?;
      item.insert(key("path"), Value::String(self.demorph(&path)));
    }

    let name = string_field(item, "name")
      .or_else(|| string_field(item, "path"))
      .unwrap_or_default()
      .replace('/', "-");
    item.insert(key("name"), Value::String(name));

    for field in ["systems", "subsystems"] {
      if let Some(Value::Sequence(systems)) = item.get_mut(field) {
        for system in systems.iter_mut() {
          if let Value::Mapping(system) = system {
            self.fix_keys(system, context)?;
          }
        }
      }
    }
    Ok(())
  }

  /// Resolve a `build-depends` entry to a path, inserting inline definitions.
  fn dependency_path(&mut self, dep: Value, parent: &str) -> Result<String, DefinitionsError> {
    match dep {
      Value::String(path) => Ok(self.demorph(&path)),
      Value::Mapping(mut inline) => {
        self.fix_keys(&mut inline, parent)?;
        self.insert(inline)
      }
      other => Err(DefinitionsError::Malformed {
        path: parent.to_string(),
        message: format!("build-depends entry {other:?} is neither a path nor a mapping"),
      }),
    }
  }

  /// Normalise the members of `item`, hoist them into the table and insert
  /// `item` itself. Returns the path of `item`.
  fn tidy_and_insert(&mut self, mut item: Mapping) -> Result<String, DefinitionsError> {
    let parent_path = string_field(&item, "path").unwrap_or_default();
    let parent_name = string_field(&item, "name").unwrap_or_default();

    let mut parent_deps = Vec::new();
    if let Some(deps) = item.remove("build-depends") {
      let Value::Sequence(deps) = deps else {
        return Err(DefinitionsError::Malformed {
          path: parent_path,
          message: "build-depends is not a list".to_string(),
        });
      };
      for dep in deps {
        parent_deps.push(self.dependency_path(dep, &parent_path)?);
      }
      item.insert(key("build-depends"), to_sequence(&parent_deps));
    }

    let members = take_members(&mut item, &parent_path)?;
    if members.is_empty() {
      return self.insert(item);
    }

    let mut lookup: HashMap<String, String> = HashMap::new();
    let mut contents: Vec<(String, Value)> = Vec::new();

    for member in members {
      let (path, artifacts) = match member {
        Value::String(name) => {
          let path = lookup.get(&name).cloned().unwrap_or_else(|| self.demorph(&name));
          (path, Value::Sequence(Vec::new()))
        }
        Value::Mapping(component) => match wrapped_reference(&component) {
          Some((path, artifacts)) => (self.demorph(&path), artifacts),
          None => self.hoist_component(component, &parent_name, &parent_path, &parent_deps, &mut lookup)?,
        },
        other => {
          return Err(DefinitionsError::Malformed {
            path: parent_path,
            message: format!("contents entry {other:?} is neither a name nor a mapping"),
          });
        }
      };

      if let Some((_, seen)) = contents.iter().find(|(p, _)| *p == path) {
        if *seen != artifacts {
          warn!(parent = %parent_path, member = %path, "member listed twice with different artifacts, keeping the first");
        } else {
          warn!(parent = %parent_path, member = %path, "member listed twice");
        }
        continue;
      }
      contents.push((path, artifacts));
    }

    let contents = contents
      .into_iter()
      .map(|(path, artifacts)| {
        let mut entry = Mapping::new();
        entry.insert(key("path"), Value::String(path));
        entry.insert(key("artifacts"), artifacts);
        Value::Mapping(entry)
      })
      .collect();
    item.insert(key("contents"), Value::Sequence(contents));
    self.insert(item)
  }

  /// Normalise one inline member of `parent_path` and add it to the table.
  ///
  /// String `build-depends` entries name earlier siblings first and fall back
  /// to paths. The parent's own dependencies come first.
  fn hoist_component(
    &mut self,
    mut component: Mapping,
    parent_name: &str,
    parent_path: &str,
    parent_deps: &[String],
    lookup: &mut HashMap<String, String>,
  ) -> Result<(String, Value), DefinitionsError> {
    self.fix_keys(&mut component, parent_path)?;
    let name = string_field(&component, "name").unwrap_or_default();
    let path = string_field(&component, "path").unwrap_or_default();
    if name == parent_name {
      return Err(DefinitionsError::ContainsItself { name });
    }
    lookup.insert(name, path);

    let mut deps = parent_deps.to_vec();
    if let Some(own) = component.remove("build-depends") {
      let Value::Sequence(own) = own else {
        return Err(DefinitionsError::Malformed {
          path: parent_path.to_string(),
          message: "build-depends is not a list".to_string(),
        });
      };
      for dep in own {
        let dep_path = match dep {
          Value::String(sibling) => match lookup.get(&sibling) {
            Some(path) => path.clone(),
            None => {
              let path = self.demorph(&sibling);
              lookup.insert(sibling, path.clone());
              path
            }
          },
          other => self.dependency_path(other, parent_path)?,
        };
        deps.push(dep_path);
      }
    }
    if !deps.is_empty() {
      component.insert(key("build-depends"), to_sequence(&deps));
    }

    let artifacts = component.remove("artifacts").unwrap_or(Value::Sequence(Vec::new()));
    let path = if has_members(&component) {
      self.tidy_and_insert(component)?
    } else {
      self.insert(component)?
    };
    Ok((path, artifacts))
  }

  /// Add `new` to the table, merging with an existing entry of the same path.
  fn insert(&mut self, new: Mapping) -> Result<String, DefinitionsError> {
    let path = string_field(&new, "path").ok_or_else(|| DefinitionsError::Anonymous {
      context: "insert".to_string(),
    })?;

    let Some(existing) = self.data.get_mut(&path) else {
      self.data.insert(path.clone(), new);
      return Ok(path);
    };

    let ref_key = key("ref");
    if existing.get(&ref_key).is_none() || new.get(&ref_key).is_none() {
      for (field, value) in new {
        if field.as_str() != Some("name") {
          existing.insert(field, value);
        }
      }
    } else {
      for (field, value) in &new {
        if existing.get(field).is_some_and(|current| current != value) {
          warn!(
            path = %path,
            field = field.as_str().unwrap_or("?"),
            "conflicting definitions, keeping the first"
          );
        }
      }
    }
    Ok(path)
  }
}

fn to_sequence(paths: &[String]) -> Value {
  Value::Sequence(paths.iter().cloned().map(Value::String).collect())
}

/// `{path: [artifact, ..]}`, the compact form of a member reference.
fn wrapped_reference(item: &Mapping) -> Option<(String, Value)> {
  if item.len() != 1 {
    return None;
  }
  let (key, value) = item.iter().next()?;
  let path = key.as_str().filter(|k| !["name", "morph", "path"].contains(k))?;
  matches!(value, Value::Sequence(_)).then(|| (path.to_string(), value.clone()))
}

fn has_members(item: &Mapping) -> bool {
  ["contents", "chunks", "strata"].iter().any(|k| item.contains_key(*k))
}

/// Concatenate `contents`, `chunks` and `strata`, in that order.
fn take_members(item: &mut Mapping, path: &str) -> Result<Vec<Value>, DefinitionsError> {
  let mut members = Vec::new();
  for field in ["contents", "chunks", "strata"] {
    match item.remove(field) {
      None | Some(Value::Null) => {}
      Some(Value::Sequence(entries)) => members.extend(entries),
      Some(_) => {
        return Err(DefinitionsError::Malformed {
          path: path.to_string(),
          message: format!("{field} is not a list"),
        });
      }
    }
  }
  Ok(members)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::write_file;
  use tempfile::TempDir;
  use tracing_test::traced_test;

  fn load(root: &Path) -> Definitions {
    Definitions::load(root, LoadOptions::default()).unwrap()
  }

  mod fix_keys {
    use super::*;

    #[test]
    fn names_default_from_paths() {
      let temp = TempDir::new().unwrap();
      write_file(temp.path(), "chunks/core/gcc.def", "kind: chunk\n");

      let defs = load(temp.path());
      let gcc = defs.get("chunks/core/gcc.def").unwrap();
      assert_eq!(gcc.name, "chunks-core-gcc.def");
    }

    #[test]
    fn explicit_names_win() {
      let temp = TempDir::new().unwrap();
      write_file(temp.path(), "chunks/gcc.def", "name: gcc\nkind: chunk\n");

      let defs = load(temp.path());
      assert_eq!(defs.get("chunks/gcc.def").unwrap().name, "gcc");
    }

    #[test]
    fn morph_suffix_is_stripped_for_new_artifact_versions() {
      let temp = TempDir::new().unwrap();
      write_file(temp.path(), "strata/core.morph", "name: core\nkind: stratum\n");

      let options = LoadOptions {
        artifact_version: Some(4),
        ..Default::default()
      };
      let defs = Definitions::load(temp.path(), options).unwrap();
      assert!(defs.get("strata/core").is_some());
      assert!(defs.get("strata/core.morph").is_none());
    }

    #[test]
    fn git_directories_are_skipped() {
      let temp = TempDir::new().unwrap();
      write_file(temp.path(), ".git/hooks/x.def", "name: x\n");
      write_file(temp.path(), "a.def", "name: a\n");

      let defs = load(temp.path());
      assert_eq!(defs.len(), 1);
    }
  }

  mod contents {
    use super::*;

    const STRATUM: &str = "\
name: core
kind: stratum
build-depends: [strata/base.def]
chunks:
- name: c1
  repo: upstream:c1
  ref: a
- name: c2
  repo: upstream:c2
  ref: b
  build-depends: [c1]
  artifacts: {c2-bins: core-runtime}
";

    #[test]
    fn members_are_hoisted_and_inherit_build_depends() {
      let temp = TempDir::new().unwrap();
      write_file(temp.path(), "strata/base.def", "name: base\nkind: stratum\n");
      write_file(temp.path(), "strata/core.def", STRATUM);

      let defs = load(temp.path());
      let core = defs.get("strata/core.def").unwrap();
      assert_eq!(core.member_paths().collect::<Vec<_>>(), vec!["c1", "c2"]);
      assert!(matches!(core.contents[1].artifacts, Artifacts::Map(_)));

      let c1 = defs.get("c1").unwrap();
      assert_eq!(c1.build_depends, vec!["strata/base.def"]);
      let c2 = defs.get("c2").unwrap();
      assert_eq!(c2.build_depends, vec!["strata/base.def", "c1"]);
    }

    #[test]
    fn chunks_and_strata_are_concatenated() {
      let temp = TempDir::new().unwrap();
      write_file(
        temp.path(),
        "systems/s.def",
        "name: s\nkind: system\ncontents: [a.def]\nstrata:\n- morph: b.def\n",
      );
      write_file(temp.path(), "a.def", "name: a\nkind: stratum\n");
      write_file(temp.path(), "b.def", "name: b\nkind: stratum\n");

      let defs = load(temp.path());
      let system = defs.get("systems/s.def").unwrap();
      assert_eq!(system.member_paths().collect::<Vec<_>>(), vec!["a.def", "b.def"]);
    }

    #[test]
    #[traced_test]
    fn duplicate_members_are_dropped_with_a_warning() {
      let temp = TempDir::new().unwrap();
      write_file(
        temp.path(),
        "s.def",
        "name: s\nkind: stratum\nchunks:\n- name: x\n  ref: a\n- name: x\n  ref: a\n",
      );

      let defs = load(temp.path());
      assert_eq!(defs.get("s.def").unwrap().contents.len(), 1);
      assert!(logs_contain("member listed twice"));
    }

    #[test]
    fn component_named_like_its_parent_is_rejected() {
      let temp = TempDir::new().unwrap();
      write_file(temp.path(), "s.def", "name: s\nkind: stratum\nchunks:\n- name: s\n");

      let err = Definitions::load(temp.path(), LoadOptions::default()).unwrap_err();
      assert!(matches!(err, DefinitionsError::ContainsItself { .. }));
    }
  }

  mod insert {
    use super::*;

    #[test]
    fn reference_without_ref_merges_into_full_definition() {
      let temp = TempDir::new().unwrap();
      write_file(
        temp.path(),
        "strata/s.def",
        "name: s\nkind: stratum\nchunks:\n- name: gcc\n  morph: chunks/gcc.def\n  repo: upstream:gcc\n  ref: abc\n",
      );
      write_file(
        temp.path(),
        "chunks/gcc.def",
        "name: gcc\nkind: chunk\nconfigure-commands: [./configure]\n",
      );

      let defs = load(temp.path());
      let gcc = defs.get("chunks/gcc.def").unwrap();
      assert_eq!(gcc.git_ref.as_deref(), Some("abc"));
      assert_eq!(gcc.commands("configure-commands").unwrap().len(), 1);
    }

    #[test]
    #[traced_test]
    fn conflicting_full_definitions_keep_the_first() {
      let temp = TempDir::new().unwrap();
      write_file(
        temp.path(),
        "a.def",
        "name: a\nkind: stratum\nchunks:\n- name: x\n  repo: r\n  ref: one\n",
      );
      write_file(
        temp.path(),
        "b.def",
        "name: b\nkind: stratum\nchunks:\n- name: x\n  repo: r\n  ref: two\n",
      );

      let defs = load(temp.path());
      assert_eq!(defs.get("x").unwrap().git_ref.as_deref(), Some("one"));
      assert!(logs_contain("conflicting definitions"));
    }
  }

  mod target {
    use super::*;

    #[test]
    fn resolves_by_path_or_name() {
      let temp = TempDir::new().unwrap();
      write_file(temp.path(), "systems/base-system.def", "name: base-system\nkind: system\n");

      let defs = load(temp.path());
      assert_eq!(
        defs.resolve_target("./systems/base-system.def", None).unwrap(),
        "systems/base-system.def"
      );
      assert_eq!(defs.resolve_target("base-system", None).unwrap(), "systems/base-system.def");
      assert!(matches!(
        defs.resolve_target("nope", None),
        Err(DefinitionsError::UnknownTarget(_))
      ));
    }
  }

  #[test]
  #[traced_test]
  fn unparsable_files_are_dropped() {
    let temp = TempDir::new().unwrap();
    write_file(temp.path(), "bad.def", "name: [unclosed\n");
    write_file(temp.path(), "list.def", "- a\n- b\n");
    write_file(temp.path(), "good.def", "name: good\n");

    let defs = load(temp.path());
    assert_eq!(defs.len(), 1);
    assert!(logs_contain("skipping unparsable definition"));
  }

  #[test]
  fn bool_commands_become_strings() {
    let temp = TempDir::new().unwrap();
    write_file(temp.path(), "x.def", "name: x\ninstall-commands: [true]\n");

    let defs = load(temp.path());
    let commands = defs.get("x.def").unwrap().commands("install-commands").unwrap();
    assert_eq!(commands[0].0, "true");
  }
}
