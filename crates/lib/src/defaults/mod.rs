//! Build-step names, build-system command tables and split rules.
//!
//! A bundled table is compiled in; a `DEFAULTS` file at the root of the
//! definitions tree replaces it wholesale.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::definitions::{Command, Kind, SplitRule};

const BUNDLED_DEFAULTS: &str = include_str!("defaults.yaml");
pub const DEFAULTS_FILENAME: &str = "DEFAULTS";
pub const MANUAL: &str = "manual";

#[derive(Debug, Error)]
pub enum DefaultsError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {origin}: {source}")]
  Parse {
    origin: String,
    #[source]
    source: serde_yaml::Error,
  },
}

/// Commands for each build step, plus the filenames that select this system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildSystem {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub indicators: Vec<String>,
  #[serde(flatten)]
  pub commands: BTreeMap<String, Vec<Command>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitRules {
  #[serde(default)]
  pub chunk: Vec<SplitRule>,
  #[serde(default)]
  pub stratum: Vec<SplitRule>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Defaults {
  #[serde(default)]
  pub build_steps: Vec<String>,
  #[serde(default)]
  pub build_systems: IndexMap<String, BuildSystem>,
  #[serde(default)]
  pub split_rules: SplitRules,
}

impl Defaults {
  pub fn bundled() -> Result<Self, DefaultsError> {
    Self::parse(BUNDLED_DEFAULTS, "bundled DEFAULTS")
  }

  /// Use `<root>/DEFAULTS` when present, the bundled table when it is missing
  /// or lists no build steps.
  pub fn load(definitions_root: &Path) -> Result<Self, DefaultsError> {
    let path = definitions_root.join(DEFAULTS_FILENAME);
    if !path.is_file() {
      return Self::bundled();
    }
    debug!(path = %path.display(), "loading defaults");
    let text = std::fs::read_to_string(&path).map_err(|source| DefaultsError::Read {
      path: path.clone(),
      source,
    })?;
    if text.trim().is_empty() {
      debug!(path = %path.display(), "empty defaults file, using bundled table");
      return Self::bundled();
    }
    let defaults = Self::parse(&text, &path.display().to_string())?;
    if defaults.build_steps.is_empty() {
      debug!(path = %path.display(), "defaults file has no build steps, using bundled table");
      return Self::bundled();
    }
    Ok(defaults)
  }

  fn parse(text: &str, origin: &str) -> Result<Self, DefaultsError> {
    serde_yaml::from_str(text).map_err(|source| DefaultsError::Parse {
      origin: origin.to_string(),
      source,
    })
  }

  pub fn build_system(&self, name: &str) -> Option<&BuildSystem> {
    self.build_systems.get(name)
  }

  /// Command list `build_system` provides for `step`.
  pub fn commands(&self, build_system: &str, step: &str) -> Option<&[Command]> {
    self
      .build_systems
      .get(build_system)
      .and_then(|bs| bs.commands.get(step))
      .map(Vec::as_slice)
  }

  pub fn split_rules(&self, kind: Kind) -> &[SplitRule] {
    match kind {
      Kind::Chunk => &self.split_rules.chunk,
      Kind::Stratum => &self.split_rules.stratum,
      Kind::System | Kind::Cluster => &[],
    }
  }

  /// Pick a build system from the top-level file names of a checkout.
  ///
  /// Exact indicator names are tried across every system before `*.ext`
  /// patterns, so `configure` beats a stray `foo.pro`.
  pub fn detect_build_system(&self, files: &[String]) -> &str {
    for (name, bs) in &self.build_systems {
      let exact = bs
        .indicators
        .iter()
        .filter(|i| !i.starts_with('*'))
        .any(|i| files.iter().any(|f| f == i));
      if exact {
        return name;
      }
    }

    for (name, bs) in &self.build_systems {
      let by_suffix = bs
        .indicators
        .iter()
        .filter_map(|i| i.strip_prefix('*'))
        .any(|suffix| files.iter().any(|f| f.ends_with(suffix)));
      if by_suffix {
        return name;
      }
    }

    MANUAL
  }
}
