//! Shared helpers for whole-build tests.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use ybd_lib::config::Config;
use ybd_lib::run::{Outcome, Summary, Target, run};

pub fn write_file(root: &Path, rel: &str, content: &str) {
  let path = root.join(rel);
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).unwrap();
  }
  std::fs::write(path, content).unwrap();
}

/// A definitions tree and a working base directory.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    write_file(&temp.path().join("defs"), "VERSION", "version: 7\n");
    TestEnv { temp }
  }

  pub fn defs(&self) -> PathBuf {
    self.temp.path().join("defs")
  }

  pub fn base(&self) -> PathBuf {
    self.temp.path().join("base")
  }

  pub fn define(&self, rel: &str, content: &str) {
    write_file(&self.defs(), rel, content);
  }

  /// Host-isolated configuration plus `extra` YAML.
  pub fn config(&self, extra: &str) -> Config {
    let yaml = format!(
      "directories:\n  base: {}\nisolation: host\nno-ccache: true\nmin-gigabytes: 0\ninstances: 1\nmax-jobs: 1\n{extra}",
      self.base().display()
    );
    Config::from_yaml(&yaml)
      .unwrap()
      .with_target("unused", "x86_64")
      .finalize()
      .unwrap()
  }

  pub fn target(&self, path: &str) -> Target {
    Target {
      root: self.defs(),
      path: path.to_string(),
    }
  }

  pub async fn build(&self, config: &Config, path: &str) -> Summary {
    match run(config, &self.target(path)).await.unwrap() {
      Outcome::Built(summary) => summary,
      other => panic!("expected a build, got {other:?}"),
    }
  }

  pub async fn keys(&self, path: &str) -> Vec<(String, String)> {
    match run(&self.config("mode: keys-only\n"), &self.target(path)).await.unwrap() {
      Outcome::Keys(keys) => keys,
      other => panic!("expected keys, got {other:?}"),
    }
  }

  pub async fn key_of(&self, target: &str, path: &str) -> String {
    self
      .keys(target)
      .await
      .into_iter()
      .find(|(p, _)| p == path)
      .map(|(_, key)| key)
      .unwrap_or_else(|| panic!("no key for {path}"))
  }
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

  pub fn url(&self) -> String {
    format!("file://{}", self.path.display())
  }

  pub fn commit(&self, files: &[(&str, &str)]) {
    for (rel, content) in files {
      write_file(&self.path, rel, content);
    }
    self.git(&["add", "-A"]);
    self.git(&["commit", "-q", "--allow-empty", "-m", "update"]);
  }

  fn git(&self, args: &[&str]) {
    let output = Command::new("git").args(args).current_dir(&self.path).output().unwrap();
    assert!(
      output.status.success(),
      "git {:?} failed: {}",
      args,
      String::from_utf8_lossy(&output.stderr)
    );
  }
}

/// A chunk that installs its checkout's README under `/usr/share/doc/<name>`.
pub fn doc_chunk(name: &str) -> String {
  format!(
    "name: {name}\nbuild-system: manual\ninstall-commands:\n- mkdir -p \"$DESTDIR/usr/share/doc/{name}\"\n- cp README \"$DESTDIR/usr/share/doc/{name}/README\"\n"
  )
}
