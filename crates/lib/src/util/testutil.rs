//! Test fixtures for ybd-lib.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Write `content` to `root/rel`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, content: &str) {
  let path = root.join(rel);
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).unwrap();
  }
  std::fs::write(path, content).unwrap();
}

/// Configuration rooted at `base`, running commands directly on the host.
pub fn host_config(base: &Path) -> crate::config::Config {
  let yaml = format!(
    "directories:\n  base: {}\nisolation: host\nno-ccache: true\nmin-gigabytes: 0\ninstances: 1\nmax-jobs: 1\n",
    base.display()
  );
  crate::config::Config::from_yaml(&yaml)
    .unwrap()
    .with_target("target.def", "x86_64")
    .finalize()
    .unwrap()
}

/// A throwaway git repository with a `master` branch.
pub struct GitRepo {
  path: PathBuf,
}

impl GitRepo {
  pub fn init(path: &Path, files: &[(&str, &str)]) -> Self {
    std::fs::create_dir_all(path).unwrap();
    let repo = GitRepo {
      path: path.to_path_buf(),
    };
    repo.git(&["init", "-q", "-b", "master"]);
    repo.git(&["config", "user.email", "builder@example.com"]);
    repo.git(&["config", "user.name", "Builder"]);
    repo.commit(files);
    repo
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn url(&self) -> String {
    self.path.display().to_string()
  }

  /// Write `files`, commit them and return the new commit id.
  pub fn commit(&self, files: &[(&str, &str)]) -> String {
    for (rel, content) in files {
      write_file(&self.path, rel, content);
    }
    self.git(&["add", "-A"]);
    self.git(&["commit", "-q", "--allow-empty", "-m", "update"]);
    self.rev_parse("HEAD")
  }

  pub fn tree(&self, git_ref: &str) -> String {
    self.rev_parse(&format!("{git_ref}^{{tree}}"))
  }

  pub fn rev_parse(&self, spec: &str) -> String {
    self.git(&["rev-parse", spec]).trim().to_string()
  }

  fn git(&self, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(&self.path).output().unwrap();
    assert!(
      output.status.success(),
      "git {:?} failed: {}",
      args,
      String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
  }
}
