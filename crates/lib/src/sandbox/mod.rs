//! Isolated build directories and command execution.
//!
//! A sandbox is a fresh directory under `<tmp>` holding the component's build
//! and install trees next to everything installed for it. Commands run with
//! a rebuilt environment and their output goes to the component's build log.

pub mod env;
pub mod mounts;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::Isolation;
use crate::consts::{LOG_TAIL_LINES, METADATA_DIR};
use crate::definitions::Device;
use crate::util::fs::{LinkMode, populate_tree, remove_path};
pub use env::{Env, EnvContext, without_makeflags};
pub use mounts::MountPlan;

#[derive(Debug, Error)]
pub enum SandboxError {
  #[error("sandbox I/O failed at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to start '{command}': {source}")]
  Spawn {
    command: String,
    #[source]
    source: io::Error,
  },

  #[error("{component} failed running '{command}'; sandbox preserved at {}, log at {}", sandbox.display(), log.display())]
  CommandFailed {
    component: String,
    command: String,
    sandbox: PathBuf,
    log: PathBuf,
  },

  #[error("cannot create device node {path}: {message}")]
  Device { path: PathBuf, message: String },

  #[error("ldconfig failed in {}", sandbox.display())]
  Ldconfig { sandbox: PathBuf },
}

impl SandboxError {
  fn io(path: &Path) -> impl FnOnce(io::Error) -> SandboxError + '_ {
    move |source| SandboxError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// How commands are isolated from the host.
#[derive(Debug, Clone)]
pub struct ExecSpec {
  pub isolation: Isolation,
  /// Bootstrap builds see the host root instead of a chroot.
  pub bootstrap: bool,
  /// Host directory shared at `/tmp/ccache`.
  pub ccache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
  root: PathBuf,
  name: String,
}

impl Sandbox {
  /// Create `<tmp>/<random>` with the build, install and tmp directories for
  /// `name`.
  pub fn create(tmp: &Path, name: &str) -> Result<SandboxGuard, SandboxError> {
    std::fs::create_dir_all(tmp).map_err(SandboxError::io(tmp))?;
    let root = tempfile::Builder::new()
      .tempdir_in(tmp)
      .map_err(SandboxError::io(tmp))?
      .keep();
    let sandbox = Sandbox {
      root,
      name: name.to_string(),
    };
    for dir in [sandbox.build_dir(), sandbox.metadata_dir(), sandbox.root.join("tmp")] {
      std::fs::create_dir_all(&dir).map_err(SandboxError::io(&dir))?;
    }
    debug!(name, sandbox = %sandbox.root.display(), "created sandbox");
    Ok(SandboxGuard { sandbox, remove: false })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn build_dir(&self) -> PathBuf {
    self.root.join(format!("{}.build", self.name))
  }

  pub fn install_dir(&self) -> PathBuf {
    self.root.join(format!("{}.inst", self.name))
  }

  /// `baserock/` inside the install tree.
  pub fn metadata_dir(&self) -> PathBuf {
    self.install_dir().join(METADATA_DIR)
  }

  /// Whether an artifact for `name` is already installed in the sandbox.
  pub fn has_installed(&self, name: &str) -> bool {
    self.root.join(METADATA_DIR).join(format!("{name}.meta")).is_file()
  }

  /// Link or copy an unpacked artifact into the sandbox root.
  ///
  /// Returns every path that already existed.
  pub fn install(&self, unpacked: &Path, mode: LinkMode) -> Result<Vec<String>, SandboxError> {
    populate_tree(unpacked, &self.root, mode).map_err(SandboxError::io(unpacked))
  }

  /// Refresh `etc/ld.so.cache` if the sandbox has a linker configuration.
  pub async fn ldconfig(&self) -> Result<(), SandboxError> {
    if !self.root.join("etc/ld.so.conf").is_file() {
      debug!(sandbox = %self.root.display(), "no ld.so.conf, skipping ldconfig");
      return Ok(());
    }
    let path = std::env::var("PATH").unwrap_or_default();
    let status = Command::new("ldconfig")
      .arg("-r")
      .arg(&self.root)
      .env("PATH", format!("{path}:/sbin:/usr/sbin:/usr/local/sbin"))
      .status()
      .await
      .map_err(|source| SandboxError::Spawn {
        command: "ldconfig".to_string(),
        source,
      })?;
    if !status.success() {
      return Err(SandboxError::Ldconfig {
        sandbox: self.root.clone(),
      });
    }
    Ok(())
  }

  /// Run `command` with `env`, appending its output to `log`.
  ///
  /// # Errors
  ///
  /// `CommandFailed` on a non-zero exit, after the tail of the log has been
  /// reported.
  pub async fn run(&self, command: &str, env: &Env, spec: &ExecSpec, log: &BuildLog) -> Result<(), SandboxError> {
    log.command_header(command, env).map_err(SandboxError::io(log.path()))?;
    let (stdout, stderr) = log.stdio().map_err(SandboxError::io(log.path()))?;

    let mut cmd = match (spec.isolation, spec.bootstrap) {
      (Isolation::Host, _) => {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
      }
      (Isolation::Namespaces, true) => {
        let mut cmd = Command::new("unshare");
        cmd.args(["--mount", "--net", "--", "sh", "-c", command]);
        cmd
      }
      (Isolation::Namespaces, false) => {
        let plan = MountPlan::new(&self.root, &self.name, spec.ccache_dir.as_deref());
        let script = plan.script(command, &format!("/{}.build", self.name));
        let mut cmd = Command::new("unshare");
        cmd.args(["--mount", "--net", "--", "sh", "-c", &script]);
        cmd
      }
    };
    cmd
      .current_dir(self.build_dir())
      .env_clear()
      .envs(env)
      .stdin(Stdio::null())
      .stdout(stdout)
      .stderr(stderr);

    debug!(component = %self.name, command, "running");
    let status = cmd.status().await.map_err(|source| SandboxError::Spawn {
      command: command.to_string(),
      source,
    })?;
    if status.success() {
      return Ok(());
    }

    for line in log.tail(LOG_TAIL_LINES) {
      error!("{line}");
    }
    error!(component = %self.name, command, status = %status, log = %log.path().display(), "command failed");
    Err(SandboxError::CommandFailed {
      component: self.name.clone(),
      command: command.to_string(),
      sandbox: self.root.clone(),
      log: log.path().to_path_buf(),
    })
  }
}

/// Owns a sandbox for the duration of one component's assembly.
///
/// Dropping the guard leaves the sandbox on disk for diagnosis unless
/// [`SandboxGuard::release`] was called.
pub struct SandboxGuard {
  sandbox: Sandbox,
  remove: bool,
}

impl SandboxGuard {
  pub fn sandbox(&self) -> &Sandbox {
    &self.sandbox
  }

  /// The work succeeded or will be retried: delete the sandbox.
  pub fn release(mut self) {
    self.remove = true;
  }
}

impl Deref for SandboxGuard {
  type Target = Sandbox;

  fn deref(&self) -> &Sandbox {
    &self.sandbox
  }
}

impl Drop for SandboxGuard {
  fn drop(&mut self) {
    if self.remove {
      if let Err(e) = remove_path(&self.sandbox.root) {
        warn!(sandbox = %self.sandbox.root.display(), error = %e, "failed to remove sandbox");
      }
    } else {
      info!(sandbox = %self.sandbox.root.display(), "sandbox preserved");
    }
  }
}

/// Append-only log of one component's build commands.
#[derive(Debug, Clone)]
pub struct BuildLog {
  path: PathBuf,
}

impl BuildLog {
  /// Start a fresh log at `path`.
  pub fn create(path: &Path) -> io::Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    File::create(path)?;
    Ok(BuildLog {
      path: path.to_path_buf(),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn open(&self) -> io::Result<File> {
    OpenOptions::new().append(true).create(true).open(&self.path)
  }

  pub fn append(&self, text: &str) -> io::Result<()> {
    let mut file = self.open()?;
    file.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
      file.write_all(b"\n")?;
    }
    Ok(())
  }

  fn command_header(&self, command: &str, env: &BTreeMap<String, String>) -> io::Result<()> {
    let mut header = format!("# # {command}\n");
    for (key, value) in env {
      header.push_str(&format!("# {key}={value}\n"));
    }
    self.append(&header)
  }

  fn stdio(&self) -> io::Result<(Stdio, Stdio)> {
    let out = self.open()?;
    let err = out.try_clone()?;
    Ok((Stdio::from(out), Stdio::from(err)))
  }

  pub fn finish(&self, elapsed: Duration) -> io::Result<()> {
    let elapsed = Duration::from_secs(elapsed.as_secs());
    self.append(&format!("Elapsed_time: {}", humantime::format_duration(elapsed)))
  }

  /// The last `n` lines of the log.
  pub fn tail(&self, n: usize) -> Vec<String> {
    let Ok(file) = File::open(&self.path) else {
      return Vec::new();
    };
    let lines: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
  }
}

/// Create the device nodes `devices` describes under `install`.
#[cfg(unix)]
pub fn create_devices(install: &Path, devices: &[Device]) -> Result<(), SandboxError> {
  use rustix::fs::{CWD, FileType, Mode, makedev, mknodat};

  for device in devices {
    let path = install.join(device.filename.trim_start_matches('/'));
    let device_err = |message: String| SandboxError::Device {
      path: path.clone(),
      message,
    };
    let file_type = match device.node_type.as_str() {
      "c" => FileType::CharacterDevice,
      "b" => FileType::BlockDevice,
      other => return Err(device_err(format!("unrecognized device type '{other}'"))),
    };
    let bits = u32::from_str_radix(&device.permissions, 8)
      .map_err(|e| device_err(format!("bad permissions '{}': {e}", device.permissions)))?;

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(SandboxError::io(parent))?;
    }
    info!(path = %path.display(), major = device.major, minor = device.minor, "creating device node");
    mknodat(
      CWD,
      &path,
      file_type,
      Mode::from_raw_mode(bits & 0o777),
      makedev(device.major, device.minor),
    )
    .map_err(|e| device_err(e.to_string()))?;
    std::os::unix::fs::chown(&path, Some(device.uid), Some(device.gid)).map_err(SandboxError::io(&path))?;
  }
  Ok(())
}

#[cfg(not(unix))]
pub fn create_devices(install: &Path, devices: &[Device]) -> Result<(), SandboxError> {
  match devices.first() {
    None => Ok(()),
    Some(device) => Err(SandboxError::Device {
      path: install.join(&device.filename),
      message: "device nodes are only supported on unix".to_string(),
    }),
  }
}
