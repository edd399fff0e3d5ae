//! Local git mirrors and source checkouts.
//!
//! Mirrors live at `<gits>/<sanitised-url>/` as bare `--mirror` clones.
//! Transport goes through the `git` binary; object lookups go through gix.

pub mod url;

use std::collections::BTreeMap;
use std::future::Future;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::consts::MAGIC_TIMESTAMP;
use crate::definitions::Submodule;
use crate::util::fs::{remove_path, set_mtime_recursive};

const TREE_SERVER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RepoError {
  #[error("repository path {0} is not a directory")]
  NotADirectory(PathBuf),

  #[error("failed to run `{command}`: {source}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },

  #[error("`{command}` failed: {stderr}")]
  GitFailed { command: String, stderr: String },

  #[error("failed to read repository {path}: {source}")]
  Git {
    path: PathBuf,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("ref '{git_ref}' not found in {repo}")]
  UnresolvedRef { repo: String, git_ref: String },

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to download mirror tarball {url}: {source}")]
  Tarball {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
}

impl RepoError {
  fn io(path: &Path) -> impl FnOnce(std::io::Error) -> RepoError + '_ {
    move |source| RepoError::Io {
      path: path.to_path_buf(),
      source,
    }
  }

  fn git(path: &Path) -> impl FnOnce(Box<dyn std::error::Error + Send + Sync>) -> RepoError + '_ {
    move |source| RepoError::Git {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Something that can name the git tree a repo/ref pair points at.
pub trait TreeSource {
  fn resolve_tree(&self, repo: &str, git_ref: &str) -> impl Future<Output = Result<String, RepoError>>;
}

#[derive(Deserialize)]
struct TreeServerReply {
  tree: String,
}

/// Access to the mirror directory and the optional remote helpers.
#[derive(Debug, Clone)]
pub struct Mirrors {
  gits: PathBuf,
  staging: PathBuf,
  aliases: BTreeMap<String, String>,
  tree_server: Option<String>,
  tar_url: Option<String>,
  http: reqwest::Client,
}

impl Mirrors {
  pub fn new(config: &Config) -> Self {
    let http = reqwest::Client::builder()
      .timeout(TREE_SERVER_TIMEOUT)
      .build()
      .unwrap_or_default();
    Mirrors {
      gits: config.gits(),
      staging: config.staging(),
      aliases: config.aliases.clone(),
      tree_server: config.tree_server.clone(),
      tar_url: config.tar_url.clone(),
      http,
    }
  }

  /// The fetchable URL for `repo` after alias expansion.
  pub fn url(&self, repo: &str) -> String {
    url::expand(repo, &self.aliases)
  }

  pub fn mirror_dir(&self, repo: &str) -> PathBuf {
    self.gits.join(url::sanitise(&self.url(repo)))
  }

  /// Resolve `git_ref` of `repo` to a tree id.
  ///
  /// Local repositories are read directly. Otherwise the tree server is
  /// asked first; a miss falls through to the local mirror, which is
  /// created or fetched as needed.
  pub async fn tree(&self, repo: &str, git_ref: &str) -> Result<String, RepoError> {
    if let Some(path) = url::local_path(repo) {
      if !path.is_dir() {
        return Err(RepoError::NotADirectory(path));
      }
      return rev_parse(&path, &format!("{git_ref}^{{tree}}"))?.ok_or_else(|| RepoError::UnresolvedRef {
        repo: repo.to_string(),
        git_ref: git_ref.to_string(),
      });
    }

    if let Some(tree) = self.tree_from_server(repo, git_ref).await {
      return Ok(tree);
    }

    let mirror = self.ensure_ref(repo, git_ref).await?;
    rev_parse(&mirror, &format!("{git_ref}^{{tree}}"))?.ok_or_else(|| RepoError::UnresolvedRef {
      repo: repo.to_string(),
      git_ref: git_ref.to_string(),
    })
  }

  async fn tree_from_server(&self, repo: &str, git_ref: &str) -> Option<String> {
    let server = self.tree_server.as_deref()?;
    let response = self
      .http
      .get(server)
      .query(&[("repo", repo), ("ref", git_ref)])
      .send()
      .await
      .and_then(|r| r.error_for_status());
    match response {
      Ok(response) => match response.json::<TreeServerReply>().await {
        Ok(reply) => {
          debug!(repo, git_ref, tree = %reply.tree, "tree from tree server");
          Some(reply.tree)
        }
        Err(e) => {
          debug!(repo, git_ref, error = %e, "unexpected tree server reply");
          None
        }
      },
      Err(e) => {
        debug!(repo, git_ref, error = %e, "tree server miss");
        None
      }
    }
  }

  /// Make sure a mirror of `repo` exists and contains `git_ref`.
  ///
  /// Returns the directory to clone from.
  pub async fn ensure_ref(&self, repo: &str, git_ref: &str) -> Result<PathBuf, RepoError> {
    if let Some(path) = url::local_path(repo) {
      return Ok(path);
    }

    let url = self.url(repo);
    let mirror = self.mirror_dir(repo);
    if !mirror.join("HEAD").is_file() {
      self.create_mirror(&url, &mirror).await?;
    }

    if rev_parse(&mirror, &format!("{git_ref}^{{commit}}"))?.is_some() {
      return Ok(mirror);
    }

    info!(repo = %url, git_ref, "ref missing from mirror, fetching");
    git(&["fetch", &url, "+refs/*:refs/*", "--prune"], Some(&mirror)).await?;
    if rev_parse(&mirror, &format!("{git_ref}^{{commit}}"))?.is_none() {
      return Err(RepoError::UnresolvedRef {
        repo: url,
        git_ref: git_ref.to_string(),
      });
    }
    Ok(mirror)
  }

  async fn create_mirror(&self, url: &str, mirror: &Path) -> Result<(), RepoError> {
    std::fs::create_dir_all(&self.gits).map_err(RepoError::io(&self.gits))?;
    let staging = tempfile::Builder::new()
      .prefix(".mirror-")
      .tempdir_in(&self.gits)
      .map_err(RepoError::io(&self.gits))?;
    let tmp = staging.path().join("repo");

    let seeded = match &self.tar_url {
      Some(tar_url) => match self.seed_from_tarball(tar_url, url, &tmp).await {
        Ok(()) => true,
        Err(e) => {
          warn!(repo = %url, error = %e, "mirror tarball unavailable, cloning");
          remove_path(&tmp).map_err(RepoError::io(&tmp))?;
          false
        }
      },
      None => false,
    };

    if !seeded {
      info!(repo = %url, "cloning mirror");
      let tmp_arg = tmp.to_string_lossy().into_owned();
      git(&["clone", "--mirror", "-n", url, &tmp_arg], None).await?;
    }

    match std::fs::rename(&tmp, mirror) {
      Ok(()) => Ok(()),
      Err(_) if mirror.join("HEAD").is_file() => {
        debug!(repo = %url, "another worker created the mirror");
        Ok(())
      }
      Err(e) => Err(RepoError::Io {
        path: mirror.to_path_buf(),
        source: e,
      }),
    }
  }

  async fn seed_from_tarball(&self, tar_url: &str, url: &str, dest: &Path) -> Result<(), RepoError> {
    let tarball_url = format!("{}/{}.tar", tar_url.trim_end_matches('/'), url::sanitise(url));
    let tarball_err = |source: Box<dyn std::error::Error + Send + Sync>| RepoError::Tarball {
      url: tarball_url.clone(),
      source,
    };

    let bytes = self
      .http
      .get(&tarball_url)
      .timeout(Duration::from_secs(600))
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| tarball_err(Box::new(e)))?
      .bytes()
      .await
      .map_err(|e| tarball_err(Box::new(e)))?;

    std::fs::create_dir_all(&self.staging).map_err(RepoError::io(&self.staging))?;
    let mut tarball = tempfile::tempfile_in(&self.staging).map_err(RepoError::io(&self.staging))?;
    tarball
      .write_all(&bytes)
      .and_then(|()| tarball.seek(SeekFrom::Start(0)).map(|_| ()))
      .map_err(RepoError::io(&self.staging))?;

    std::fs::create_dir_all(dest).map_err(RepoError::io(dest))?;
    tar::Archive::new(tarball)
      .unpack(dest)
      .map_err(|e| tarball_err(Box::new(e)))?;

    git(&["config", "remote.origin.url", url], Some(dest)).await?;
    git(&["config", "remote.origin.mirror", "true"], Some(dest)).await?;
    git(&["config", "remote.origin.fetch", "+refs/*:refs/*"], Some(dest)).await?;
    git(&["fetch", "origin", "--prune"], Some(dest)).await?;
    info!(repo = %url, tarball = %tarball_url, "seeded mirror from tarball");
    Ok(())
  }

  /// Clone `repo` at `git_ref` into `dest`, with submodules, and stamp every
  /// file with the magic timestamp.
  pub async fn checkout(
    &self,
    repo: &str,
    git_ref: &str,
    dest: &Path,
    overrides: Option<&BTreeMap<String, Submodule>>,
  ) -> Result<(), RepoError> {
    self.checkout_tree(repo, git_ref, dest, overrides).await?;
    set_mtime_recursive(dest, MAGIC_TIMESTAMP).map_err(RepoError::io(dest))
  }

  async fn checkout_tree(
    &self,
    repo: &str,
    git_ref: &str,
    dest: &Path,
    overrides: Option<&BTreeMap<String, Submodule>>,
  ) -> Result<(), RepoError> {
    let source = self.ensure_ref(repo, git_ref).await?;
    debug!(repo, git_ref, dest = %dest.display(), "checking out");

    std::fs::create_dir_all(dest).map_err(RepoError::io(dest))?;
    let source_arg = source.to_string_lossy().into_owned();
    git(&["clone", "--no-hardlinks", "-n", &source_arg, "."], Some(dest)).await?;
    git(&["checkout", "--force", git_ref], Some(dest)).await?;

    for submodule in submodules(dest).await? {
      let url = overrides
        .and_then(|o| o.get(&submodule.name).or_else(|| o.get(&submodule.path)))
        .and_then(|s| s.url.clone())
        .unwrap_or(submodule.url);

      let listing = git(&["ls-tree", git_ref, &submodule.path], Some(dest)).await?;
      let Some(commit) = pinned_commit(&listing) else {
        warn!(submodule = %submodule.path, "submodule is not pinned in the tree, skipping");
        continue;
      };

      info!(submodule = %submodule.path, url = %url, commit = %commit, "checking out submodule");
      let sub_dest = dest.join(&submodule.path);
      remove_path(&sub_dest).map_err(RepoError::io(&sub_dest))?;
      Box::pin(self.checkout_tree(&url, &commit, &sub_dest, None)).await?;
    }
    Ok(())
  }
}

impl TreeSource for Mirrors {
  fn resolve_tree(&self, repo: &str, git_ref: &str) -> impl Future<Output = Result<String, RepoError>> {
    self.tree(repo, git_ref)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GitSubmodule {
  name: String,
  path: String,
  url: String,
}

/// Submodules declared in `<checkout>/.gitmodules`.
async fn submodules(checkout: &Path) -> Result<Vec<GitSubmodule>, RepoError> {
  if !checkout.join(".gitmodules").is_file() {
    return Ok(Vec::new());
  }
  let listing = git(
    &["config", "-f", ".gitmodules", "--get-regexp", r"^submodule\..*\.(path|url)$"],
    Some(checkout),
  )
  .await?;
  Ok(parse_gitmodules(&listing))
}

fn parse_gitmodules(listing: &str) -> Vec<GitSubmodule> {
  let mut found: BTreeMap<String, (Option<String>, Option<String>)> = BTreeMap::new();
  for line in listing.lines() {
    let Some((key, value)) = line.split_once(' ') else {
      continue;
    };
    let Some(rest) = key.strip_prefix("submodule.") else {
      continue;
    };
    if let Some(name) = rest.strip_suffix(".path") {
      found.entry(name.to_string()).or_default().0 = Some(value.to_string());
    } else if let Some(name) = rest.strip_suffix(".url") {
      found.entry(name.to_string()).or_default().1 = Some(value.to_string());
    }
  }
  found
    .into_iter()
    .filter_map(|(name, entry)| match entry {
      (Some(path), Some(url)) => Some(GitSubmodule { name, path, url }),
      _ => None,
    })
    .collect()
}

/// The commit id from a `git ls-tree` line for a gitlink entry.
fn pinned_commit(listing: &str) -> Option<String> {
  let line = listing.lines().next()?;
  let (meta, _path) = line.split_once('\t')?;
  let mut fields = meta.split_whitespace();
  let _mode = fields.next()?;
  (fields.next()? == "commit").then_some(())?;
  fields.next().map(str::to_string)
}

/// Resolve `spec` in the repository at `path`; `None` when it does not exist.
fn rev_parse(path: &Path, spec: &str) -> Result<Option<String>, RepoError> {
  let repo = gix::open(path).map_err(|e| RepoError::git(path)(Box::new(e)))?;
  Ok(repo.rev_parse_single(spec).ok().map(|id| id.to_string()))
}

/// Committer time of `HEAD` in a checkout, in seconds since the epoch.
pub fn source_date_epoch(checkout: &Path) -> Result<i64, RepoError> {
  let repo = gix::open(checkout).map_err(|e| RepoError::git(checkout)(Box::new(e)))?;
  let commit = repo.head_commit().map_err(|e| RepoError::git(checkout)(Box::new(e)))?;
  let time = commit.time().map_err(|e| RepoError::git(checkout)(Box::new(e)))?;
  Ok(time.seconds)
}

/// The `HEAD` commit of the repository containing `path`, if any.
pub fn describe_head(path: &Path) -> Option<String> {
  let repo = gix::discover(path).ok()?;
  repo.head_id().ok().map(|id| id.to_string())
}

async fn git(args: &[&str], cwd: Option<&Path>) -> Result<String, RepoError> {
  let command = format!("git {}", args.join(" "));
  let mut cmd = Command::new("git");
  cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
  if let Some(cwd) = cwd {
    cmd.current_dir(cwd);
  }
  debug!(command = %command, "running");

  let output = cmd.output().await.map_err(|source| RepoError::Spawn {
    command: command.clone(),
    source,
  })?;
  if !output.status.success() {
    return Err(RepoError::GitFailed {
      command,
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
