//! Run configuration.
//!
//! A [`Config`] is assembled from layers, later layers winning:
//!
//! 1. the `ybd.conf` bundled with the crate
//! 2. `ybd.conf` in the working directory
//! 3. `YBD_*` environment variables
//! 4. the target and architecture given on the command line
//!
//! Top-level keys replace each other; entries of `directories` are merged one
//! by one. Once [`Config::finalize`] has run the value is never mutated again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::debug;

use crate::arch::{Arch, UnknownArch};
use crate::definitions::Kind;

const BUNDLED_CONFIG: &str = include_str!("../ybd.conf");
const CONFIG_FILENAME: &str = "ybd.conf";
const ENV_PREFIX: &str = "YBD_";
const DEFAULT_BASE: &str = "/src";

/// Logical directories every run needs, each defaulting to `<base>/<name>`.
pub const DIRECTORY_NAMES: [&str; 6] = ["base", "gits", "tmp", "artifacts", "ccache_dir", "staging"];

#[derive(Debug, Error)]
pub enum ConfigError {
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

  #[error("{origin} is not a mapping")]
  NotAMapping { origin: String },

  #[error("invalid configuration: {0}")]
  Invalid(#[source] serde_yaml::Error),

  #[error("no target architecture given")]
  MissingArch,

  #[error(transparent)]
  UnknownArch(#[from] UnknownArch),

  #[error("no target definition given")]
  MissingTarget,
}

/// What a run does once definitions are loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
  #[default]
  Normal,
  /// Assemble everything but skip build commands; artifacts are empty.
  NoBuild,
  /// Load and validate definitions, print the build order, then stop.
  ParseOnly,
  /// Compute and print every cache key, then stop.
  KeysOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaValidation {
  #[default]
  Off,
  Warn,
  Strict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
  #[default]
  Ignore,
  Warn,
  Exit,
}

/// How sandboxed commands are isolated from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Isolation {
  /// Fresh mount and network namespaces, chroot into the sandbox.
  #[default]
  Namespaces,
  /// Run directly on the host inside the sandbox's build directory.
  Host,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
  #[serde(default)]
  pub arch: Option<String>,
  #[serde(default)]
  pub target: Option<String>,

  #[serde(default)]
  pub kbas_url: Option<String>,
  #[serde(default = "default_kbas_password")]
  pub kbas_password: String,
  #[serde(default = "default_kbas_upload")]
  pub kbas_upload: Vec<Kind>,

  #[serde(default)]
  pub tree_server: Option<String>,
  #[serde(default)]
  pub tar_url: Option<String>,

  #[serde(default)]
  pub max_jobs: Option<usize>,
  #[serde(default)]
  pub instances: Option<usize>,
  #[serde(default)]
  pub instance: Option<usize>,

  #[serde(default)]
  pub mode: Mode,
  #[serde(default)]
  pub directories: BTreeMap<String, PathBuf>,
  #[serde(default = "default_min_gigabytes")]
  pub min_gigabytes: f64,
  #[serde(default)]
  pub schema_validation: SchemaValidation,
  #[serde(default)]
  pub artifact_version: Option<u32>,
  #[serde(default)]
  pub no_ccache: bool,
  #[serde(default)]
  pub no_distcc: bool,
  #[serde(default)]
  pub check_overlaps: OverlapPolicy,
  #[serde(default)]
  pub reproduce: bool,

  #[serde(default)]
  pub aliases: BTreeMap<String, String>,
  #[serde(default = "default_base_path")]
  pub base_path: Vec<String>,
  #[serde(default)]
  pub default_splits: Vec<String>,
  #[serde(default = "default_retry_timeout")]
  pub retry_timeout: u64,
  #[serde(default)]
  pub isolation: Isolation,
  #[serde(default)]
  pub cleanup: bool,
}

fn default_kbas_password() -> String {
  "insecure".to_string()
}

fn default_kbas_upload() -> Vec<Kind> {
  vec![Kind::Chunk]
}

fn default_min_gigabytes() -> f64 {
  10.0
}

fn default_base_path() -> Vec<String> {
  ["/usr/bin", "/bin", "/usr/sbin", "/sbin"].iter().map(|s| s.to_string()).collect()
}

fn default_retry_timeout() -> u64 {
  60
}

impl Config {
  /// Load the bundled, working-directory and environment layers.
  ///
  /// The result still needs [`Config::with_target`] and [`Config::finalize`].
  pub fn load(cwd: &Path) -> Result<Self, ConfigError> {
    let mut merged = parse_layer(BUNDLED_CONFIG, "bundled ybd.conf")?;

    let local = cwd.join(CONFIG_FILENAME);
    if local.is_file() {
      let text = std::fs::read_to_string(&local).map_err(|source| ConfigError::Read {
        path: local.clone(),
        source,
      })?;
      debug!(path = %local.display(), "loading configuration");
      merge(&mut merged, parse_layer(&text, &local.display().to_string())?);
    }

    merge(&mut merged, env_layer(std::env::vars()));
    Self::from_mapping(merged)
  }

  /// Build a configuration from the bundled defaults plus a YAML overlay.
  pub fn from_yaml(overlay: &str) -> Result<Self, ConfigError> {
    let mut merged = parse_layer(BUNDLED_CONFIG, "bundled ybd.conf")?;
    merge(&mut merged, parse_layer(overlay, "overlay")?);
    Self::from_mapping(merged)
  }

  fn from_mapping(mapping: Mapping) -> Result<Self, ConfigError> {
    serde_yaml::from_value(Value::Mapping(mapping)).map_err(ConfigError::Invalid)
  }

  /// Apply the command-line target and architecture.
  pub fn with_target(mut self, target: impl Into<String>, arch: impl Into<String>) -> Self {
    self.target = Some(target.into());
    self.arch = Some(arch.into());
    self
  }

  /// Validate the architecture and fill every derived default.
  pub fn finalize(mut self) -> Result<Self, ConfigError> {
    let arch = self.arch.as_deref().ok_or(ConfigError::MissingArch)?;
    arch.parse::<Arch>()?;

    let base = self
      .directories
      .get("base")
      .cloned()
      .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE));
    for name in DIRECTORY_NAMES {
      self
        .directories
        .entry(name.to_string())
        .or_insert_with(|| base.join(name));
    }

    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    if self.instances.is_none() && cpus >= 10 {
      let instances = 1 + cpus / 10;
      self.instances = Some(instances);
      self.max_jobs.get_or_insert(cpus / instances);
    }
    self.max_jobs.get_or_insert(cpus);
    self.instances.get_or_insert(1);

    Ok(self)
  }

  /// The validated target architecture.
  pub fn arch(&self) -> Result<Arch, ConfigError> {
    Ok(self.arch.as_deref().ok_or(ConfigError::MissingArch)?.parse()?)
  }

  pub fn target(&self) -> Result<&str, ConfigError> {
    self.target.as_deref().ok_or(ConfigError::MissingTarget)
  }

  /// Path for one of [`DIRECTORY_NAMES`].
  pub fn directory(&self, name: &str) -> PathBuf {
    self.directories.get(name).cloned().unwrap_or_else(|| {
      self
        .directories
        .get("base")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE))
        .join(name)
    })
  }

  pub fn gits(&self) -> PathBuf {
    self.directory("gits")
  }

  pub fn tmp(&self) -> PathBuf {
    self.directory("tmp")
  }

  pub fn artifacts(&self) -> PathBuf {
    self.directory("artifacts")
  }

  pub fn ccache_dir(&self) -> PathBuf {
    self.directory("ccache_dir")
  }

  pub fn staging(&self) -> PathBuf {
    self.directory("staging")
  }

  pub fn max_jobs(&self) -> usize {
    self.max_jobs.unwrap_or(1)
  }

  pub fn instances(&self) -> usize {
    self.instances.unwrap_or(1)
  }

  /// A remote password other than the placeholder enables uploads.
  pub fn can_upload(&self) -> bool {
    self.kbas_url.is_some() && self.kbas_password != "insecure"
  }

  /// Create every configured directory.
  pub fn create_directories(&self) -> std::io::Result<()> {
    for name in DIRECTORY_NAMES {
      std::fs::create_dir_all(self.directory(name))?;
    }
    Ok(())
  }
}

fn parse_layer(text: &str, origin: &str) -> Result<Mapping, ConfigError> {
  let value: Value = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
    origin: origin.to_string(),
    source,
  })?;
  match value {
    Value::Mapping(mapping) => Ok(mapping),
    Value::Null => Ok(Mapping::new()),
    _ => Err(ConfigError::NotAMapping {
      origin: origin.to_string(),
    }),
  }
}

/// Turn `YBD_*` variables into a configuration layer.
///
/// `YBD_KBAS_URL=http://x` becomes `kbas-url: http://x`; names of
/// [`DIRECTORY_NAMES`] land inside `directories`. Values are parsed as YAML
/// scalars so numbers and booleans keep their types.
fn env_layer<I>(vars: I) -> Mapping
where
  I: IntoIterator<Item = (String, String)>,
{
  let mut layer = Mapping::new();
  let mut directories = Mapping::new();

  for (key, raw) in vars {
    let Some(name) = key.strip_prefix(ENV_PREFIX) else {
      continue;
    };
    let name = name.to_lowercase();
    let value = serde_yaml::from_str::<Value>(&raw)
      .ok()
      .filter(|v| !matches!(v, Value::Mapping(_) | Value::Sequence(_)))
      .unwrap_or(Value::String(raw));

    if DIRECTORY_NAMES.contains(&name.as_str()) {
      directories.insert(Value::String(name), value);
    } else {
      layer.insert(Value::String(name.replace('_', "-")), value);
    }
  }

  if !directories.is_empty() {
    layer.insert(Value::String("directories".to_string()), Value::Mapping(directories));
  }
  layer
}

fn merge(base: &mut Mapping, overlay: Mapping) {
  for (key, value) in overlay {
    let is_directories = key.as_str() == Some("directories");
    match value {
      Value::Mapping(entries) if is_directories => {
        let target = base
          .entry(key)
          .or_insert_with(|| Value::Mapping(Mapping::new()));
        if let Value::Mapping(existing) = target {
          existing.extend(entries);
        } else {
          *target = Value::Mapping(entries);
        }
      }
      value => {
        base.insert(key, value);
      }
    }
  }
}
