//! Mount layout of a chrooted sandbox, rendered as a shell script that runs
//! inside a fresh mount namespace.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
  /// A filesystem type mounted from nothing, e.g. `proc` or `tmpfs`.
  Fs(&'static str),
  /// A host path bind-mounted into the sandbox.
  Bind(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
  pub source: MountSource,
  /// Relative to the sandbox root.
  pub target: String,
}

/// Everything is read-only except `writable`; `mounts` are added on top.
#[derive(Debug, Clone)]
pub struct MountPlan {
  root: PathBuf,
  writable: Vec<String>,
  mounts: Vec<Mount>,
}

impl MountPlan {
  /// Layout for building `name` in `root`, optionally sharing a compiler
  /// cache directory from the host.
  pub fn new(root: &Path, name: &str, ccache: Option<&Path>) -> Self {
    let writable = vec![
      format!("{name}.build"),
      format!("{name}.inst"),
      "dev".to_string(),
      "proc".to_string(),
      "tmp".to_string(),
    ];
    let mut mounts = vec![
      Mount {
        source: MountSource::Fs("proc"),
        target: "proc".to_string(),
      },
      Mount {
        source: MountSource::Fs("tmpfs"),
        target: "dev/shm".to_string(),
      },
    ];
    if let Some(ccache) = ccache {
      mounts.push(Mount {
        source: MountSource::Bind(ccache.to_path_buf()),
        target: "tmp/ccache".to_string(),
      });
    }
    MountPlan {
      root: root.to_path_buf(),
      writable,
      mounts,
    }
  }

  pub fn writable(&self) -> &[String] {
    &self.writable
  }

  pub fn mounts(&self) -> &[Mount] {
    &self.mounts
  }

  /// Script that sets up the mounts, then runs `command` under `sh -c` in
  /// `workdir` (a path inside the chroot).
  pub fn script(&self, command: &str, workdir: &str) -> String {
    let root = self.root.display().to_string();
    let at = |rel: &str| shell_quote(&format!("{root}/{rel}"));
    let mut script = String::from("set -e\nmount --make-rprivate /\n");

    for rel in self.writable.iter().chain(self.mounts.iter().map(|m| &m.target)) {
      let _ = writeln!(script, "mkdir -p {}", at(rel));
    }

    let root_q = shell_quote(&root);
    let _ = writeln!(script, "mount --bind {root_q} {root_q}");
    let _ = writeln!(script, "mount -o remount,bind,ro {root_q}");
    for rel in &self.writable {
      let _ = writeln!(script, "mount --bind {0} {0}", at(rel));
    }
    for mount in &self.mounts {
      match &mount.source {
        MountSource::Fs(fs) => {
          let _ = writeln!(script, "mount -t {fs} none {}", at(&mount.target));
        }
        MountSource::Bind(host) => {
          let _ = writeln!(
            script,
            "mount --bind {} {}",
            shell_quote(&host.display().to_string()),
            at(&mount.target)
          );
        }
      }
    }

    let inner = format!("cd {} && {}", shell_quote(workdir), command);
    let _ = writeln!(script, "exec chroot {root_q} /bin/sh -c {}", shell_quote(&inner));
    script
  }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
  format!("'{}'", s.replace('\'', r"'\''"))
}
