//! Environment for sandboxed build commands.
//!
//! Nothing is inherited from the calling process.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::arch::Arch;
use crate::config::{Config, ConfigError, Isolation};
use crate::consts::BUILD_USER;
use crate::definitions::Definition;

use super::Sandbox;

const DEFAULT_PREFIX: &str = "/usr";
const CCACHE_BIN: &str = "/usr/lib/ccache";
const CCACHE_MOUNT: &str = "/tmp/ccache";
const CCACHE_EXTRAFILES: [&str; 3] = ["binutils", "eglibc", "gcc"];

pub type Env = BTreeMap<String, String>;

/// Per-run inputs shared by every build environment.
#[derive(Debug, Clone)]
pub struct EnvContext {
  pub arch: Arch,
  pub max_jobs: usize,
  pub base_path: Vec<String>,
  pub ccache: bool,
  pub distcc: bool,
  pub isolation: Isolation,
  pub definitions_ref: String,
  pub program_ref: String,
}

impl EnvContext {
  pub fn new(config: &Config, definitions_ref: &str) -> Result<Self, ConfigError> {
    Ok(EnvContext {
      arch: config.arch()?,
      max_jobs: config.max_jobs(),
      base_path: config.base_path.clone(),
      ccache: !config.no_ccache,
      distcc: !config.no_distcc,
      isolation: config.isolation,
      definitions_ref: definitions_ref.to_string(),
      program_ref: env!("CARGO_PKG_VERSION").to_string(),
    })
  }

  /// Whether paths are given as seen from the host rather than from inside
  /// a chroot.
  pub fn host_paths(&self, definition: &Definition) -> bool {
    definition.is_bootstrap() || self.isolation == Isolation::Host
  }

  /// Environment for building `definition` in `sandbox`.
  ///
  /// `dependency_prefixes` are the prefixes of its build-depends, in order.
  pub fn for_build(
    &self,
    definition: &Definition,
    dependency_prefixes: &[String],
    sandbox: &Sandbox,
    source_date_epoch: Option<i64>,
  ) -> Env {
    let mut env = Env::new();

    let mut extra_path: Vec<String> = Vec::new();
    for prefix in dependency_prefixes.iter().filter(|p| !p.is_empty()) {
      let bin = format!("{}/bin", prefix.trim_end_matches('/'));
      if !extra_path.contains(&bin) {
        extra_path.push(bin);
      }
    }
    if self.ccache {
      extra_path.push(CCACHE_BIN.to_string());
      env.insert("CCACHE_DIR".into(), CCACHE_MOUNT.into());
      let extrafiles: Vec<String> = CCACHE_EXTRAFILES
        .iter()
        .map(|name| format!("/baserock/{name}.meta"))
        .filter(|meta| sandbox.root().join(meta.trim_start_matches('/')).is_file())
        .collect();
      env.insert("CCACHE_EXTRAFILES".into(), extrafiles.join(":"));
      if self.distcc {
        env.insert("CCACHE_PREFIX".into(), "distcc".into());
      }
    }

    let install = sandbox.install_dir();
    let path: Vec<String> = if self.host_paths(definition) {
      env.insert("DESTDIR".into(), install.display().to_string());
      extra_path
        .iter()
        .map(|p| normalize(&sandbox.root().join(p.trim_start_matches('/'))).display().to_string())
        .chain(self.base_path.iter().cloned())
        .collect()
    } else {
      let basename = install.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
      env.insert("DESTDIR".into(), format!("/{basename}"));
      extra_path.into_iter().chain(self.base_path.iter().cloned()).collect()
    };
    env.insert("PATH".into(), path.join(":"));

    let prefix = definition.prefix.as_deref().filter(|p| !p.is_empty()).unwrap_or(DEFAULT_PREFIX);
    env.insert("PREFIX".into(), prefix.to_string());
    let jobs = definition.max_jobs.map(|j| j as usize).unwrap_or(self.max_jobs);
    env.insert("MAKEFLAGS".into(), format!("-j{jobs}"));

    env.insert("TERM".into(), "dumb".into());
    env.insert("SHELL".into(), "/bin/sh".into());
    for var in ["USER", "USERNAME", "LOGNAME"] {
      env.insert(var.into(), BUILD_USER.into());
    }
    env.insert("LC_ALL".into(), "C".into());
    env.insert("HOME".into(), "/tmp".into());
    env.insert("TZ".into(), "UTC".into());

    env.insert("TARGET".into(), self.arch.target());
    env.insert("TARGET_STAGE1".into(), self.arch.target_stage1());
    env.insert("MORPH_ARCH".into(), self.arch.as_str().into());
    env.insert("DEFINITIONS_REF".into(), self.definitions_ref.clone());
    env.insert("PROGRAM_REF".into(), self.program_ref.clone());
    if let Some(epoch) = source_date_epoch {
      env.insert("SOURCE_DATE_EPOCH".into(), epoch.to_string());
    }

    env
  }
}

/// Copy of `env` for steps that must not run in parallel.
pub fn without_makeflags(env: &Env) -> Env {
  let mut env = env.clone();
  env.remove("MAKEFLAGS");
  env
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        out.pop();
      }
      other => out.push(other.as_os_str()),
    }
  }
  out
}
