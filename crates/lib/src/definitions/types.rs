//! Typed definition records.
//!
//! Definitions start life as loosely shaped YAML. Once normalised they are
//! converted into [`Definition`], which is immutable for the rest of the run.
//! Keys that are not understood travel along in [`Definition::extra`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
  #[default]
  Chunk,
  Stratum,
  System,
  Cluster,
}

impl Kind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Chunk => "chunk",
      Self::Stratum => "stratum",
      Self::System => "system",
      Self::Cluster => "cluster",
    }
  }
}

impl fmt::Display for Kind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// Whether a build sees only its sandbox or the host filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
  #[default]
  Staging,
  Bootstrap,
}

/// A single shell command from a command list.
///
/// YAML lets authors write bare `true`/`false`; those become the shell
/// builtins of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawCommand", into = "String")]
pub struct Command(pub String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCommand {
  Text(String),
  Flag(bool),
  Number(i64),
}

impl From<RawCommand> for Command {
  fn from(raw: RawCommand) -> Self {
    match raw {
      RawCommand::Text(text) => Command(text),
      RawCommand::Flag(flag) => Command(flag.to_string()),
      RawCommand::Number(n) => Command(n.to_string()),
    }
  }
}

impl From<Command> for String {
  fn from(command: Command) -> Self {
    command.0
  }
}

impl fmt::Display for Command {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// An ordered split rule: files matching any `include` pattern belong to `artifact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRule {
  pub artifact: String,
  #[serde(default)]
  pub include: Vec<String>,
}

/// A device node created in the install tree after the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
  pub filename: String,
  #[serde(rename = "type")]
  pub node_type: String,
  pub major: u32,
  pub minor: u32,
  /// Octal permission bits, e.g. `"0666"`.
  pub permissions: String,
  #[serde(default)]
  pub uid: u32,
  #[serde(default)]
  pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submodule {
  #[serde(default)]
  pub url: Option<String>,
  #[serde(flatten)]
  pub extra: BTreeMap<String, serde_json::Value>,
}

/// Which sub-artifacts of a member are selected.
///
/// Systems list stratum artifact names; strata may map chunk artifacts onto
/// stratum artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Artifacts {
  List(Vec<String>),
  Map(BTreeMap<String, String>),
}

impl Default for Artifacts {
  fn default() -> Self {
    Artifacts::List(Vec::new())
  }
}

impl Artifacts {
  pub fn names(&self) -> Vec<String> {
    match self {
      Artifacts::List(names) => names.clone(),
      Artifacts::Map(map) => map.keys().cloned().collect(),
    }
  }

  pub fn is_empty(&self) -> bool {
    match self {
      Artifacts::List(names) => names.is_empty(),
      Artifacts::Map(map) => map.is_empty(),
    }
  }
}

/// A member of a stratum or system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
  pub path: String,
  #[serde(default, skip_serializing_if = "Artifacts::is_empty")]
  pub artifacts: Artifacts,
}

/// A system deployed by a cluster, with its nested subsystems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSystem {
  pub path: String,
  #[serde(default)]
  pub subsystems: Vec<ClusterSystem>,
  #[serde(flatten)]
  pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// A normalised definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
  pub path: String,
  pub name: String,
  pub kind: Kind,
  pub description: Option<String>,
  pub repo: Option<String>,
  pub git_ref: Option<String>,
  pub tree: Option<String>,
  pub arch: Option<String>,
  pub build_depends: Vec<String>,
  pub contents: Vec<ContentRef>,
  pub build_system: Option<String>,
  pub build_mode: BuildMode,
  pub prefix: Option<String>,
  pub max_jobs: Option<u32>,
  pub products: Vec<SplitRule>,
  /// Command lists keyed by build-step name, as written in the definition.
  pub steps: BTreeMap<String, Vec<Command>>,
  pub devices: Vec<Device>,
  pub submodules: Option<BTreeMap<String, Submodule>>,
  /// `product -> name -> commands`
  pub system_integration: BTreeMap<String, BTreeMap<String, Vec<Command>>>,
  pub systems: Vec<ClusterSystem>,
  pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawDefinition {
  path: String,
  name: String,
  #[serde(default)]
  kind: Kind,
  #[serde(default)]
  description: Option<String>,
  #[serde(default)]
  repo: Option<String>,
  #[serde(default, rename = "ref")]
  git_ref: Option<String>,
  #[serde(default)]
  tree: Option<String>,
  #[serde(default)]
  arch: Option<String>,
  #[serde(default)]
  build_depends: Vec<String>,
  #[serde(default)]
  contents: Vec<ContentRef>,
  #[serde(default)]
  build_system: Option<String>,
  #[serde(default)]
  build_mode: BuildMode,
  #[serde(default)]
  prefix: Option<String>,
  #[serde(default)]
  max_jobs: Option<u32>,
  #[serde(default)]
  products: Vec<SplitRule>,
  #[serde(default)]
  devices: Vec<Device>,
  #[serde(default)]
  submodules: Option<BTreeMap<String, Submodule>>,
  #[serde(default)]
  system_integration: BTreeMap<String, BTreeMap<String, Vec<Command>>>,
  #[serde(default)]
  systems: Vec<ClusterSystem>,
  #[serde(flatten)]
  rest: BTreeMap<String, Value>,
}

impl Definition {
  /// Convert a normalised mapping, pulling out command lists for `build_steps`.
  pub fn from_mapping(mapping: Mapping, build_steps: &[String]) -> Result<Self, serde_yaml::Error> {
    let raw: RawDefinition = serde_yaml::from_value(Value::Mapping(mapping))?;

    let mut steps = BTreeMap::new();
    let mut extra = BTreeMap::new();
    for (key, value) in raw.rest {
      if build_steps.contains(&key) {
        let commands: Vec<Command> = serde_yaml::from_value(value)?;
        steps.insert(key, commands);
      } else {
        extra.insert(key, value);
      }
    }

    Ok(Definition {
      path: raw.path,
      name: raw.name,
      kind: raw.kind,
      description: raw.description,
      repo: raw.repo,
      git_ref: raw.git_ref,
      tree: raw.tree,
      arch: raw.arch,
      build_depends: raw.build_depends,
      contents: raw.contents,
      build_system: raw.build_system,
      build_mode: raw.build_mode,
      prefix: raw.prefix,
      max_jobs: raw.max_jobs,
      products: raw.products,
      steps,
      devices: raw.devices,
      submodules: raw.submodules,
      system_integration: raw.system_integration,
      systems: raw.systems,
      extra,
    })
  }

  pub fn is_bootstrap(&self) -> bool {
    self.build_mode == BuildMode::Bootstrap
  }

  /// Commands the definition sets for `step`, if any.
  pub fn commands(&self, step: &str) -> Option<&[Command]> {
    self.steps.get(step).map(Vec::as_slice)
  }

  pub fn member_paths(&self) -> impl Iterator<Item = &str> {
    self.contents.iter().map(|c| c.path.as_str())
  }
}
