//! Composing components: make sure an artifact exists for a definition and
//! everything it needs, building whatever is missing.
//!
//! Each worker process runs its own [`Assembler`]. Workers share nothing but
//! the filesystem, so every build or fetch happens under a per-key lock and a
//! worker that loses the race gets [`Composed::Retry`] back.

pub mod lock;
pub mod state;

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::cache_key::CacheKeys;
use crate::config::{Config, ConfigError, Mode};
use crate::consts::METADATA_DIR;
use crate::defaults::MANUAL;
use crate::definitions::{Command, Definition, Definitions, DefinitionsError, Kind, graph};
use crate::remote::{KbasClient, UploadOutcome};
use crate::repos::{Mirrors, RepoError, source_date_epoch};
use crate::sandbox::{BuildLog, EnvContext, ExecSpec, Sandbox, SandboxError, create_devices, without_makeflags};
use crate::splitting::{
  Member, MetaContext, OverlapTracker, SplitError, SplitRules, default_selection, install_stratum_artifacts,
  write_chunk_metadata, write_stratum_metadata,
};
use crate::store::{ArchiveFormat, Store, StoreError};
use crate::util::fs::{LinkMode, populate_tree, remove_path, top_level_names};

pub use lock::KeyLock;
pub use state::Progress;

/// Steps that keep `MAKEFLAGS`; every other step runs serially.
const PARALLEL_STEPS: [&str; 3] = ["pre-build-commands", "build-commands", "post-build-commands"];
const INSTALL_STEP: &str = "install-commands";

#[derive(Debug, Error)]
pub enum AssemblyError {
  #[error(transparent)]
  Definitions(#[from] DefinitionsError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("failed to get the source of {component}: {source}")]
  Source {
    component: String,
    #[source]
    source: RepoError,
  },

  #[error(transparent)]
  Sandbox(#[from] SandboxError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Split(#[from] SplitError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("{component} has a repo but no ref")]
  MissingRef { component: String },

  #[error("{component} uses the manual build system but has no install-commands")]
  NoInstallCommands { component: String },

  #[error("no artifact for {component} ({key}) in the store")]
  MissingArtifact { component: String, key: String },
}

impl AssemblyError {
  fn io(path: &Path) -> impl FnOnce(io::Error) -> AssemblyError + '_ {
    move |source| AssemblyError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Outcome of composing one definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Composed {
  /// The artifact is in the local store.
  Key(String),
  /// No key could be computed for it or one of its prerequisites.
  Unbuildable,
  /// Not built for this architecture.
  Skipped,
  /// Another worker holds a lock this one needs; compose again from the top.
  Retry,
}

enum Fetch {
  Hit,
  Miss,
  Contended,
}

/// Fields needed from the run to assemble components.
#[derive(Debug, Clone)]
pub struct AssemblyContext {
  pub definitions_ref: String,
  pub instance: Option<usize>,
}

pub struct Assembler<'a> {
  definitions: &'a Definitions,
  keys: &'a CacheKeys,
  config: &'a Config,
  store: Store,
  mirrors: Mirrors,
  remote: Option<KbasClient>,
  env: EnvContext,
  meta: MetaContext,
  overlaps: OverlapTracker,
  progress: Progress,
  instance: Option<usize>,
}

impl<'a> Assembler<'a> {
  pub fn new(
    definitions: &'a Definitions,
    keys: &'a CacheKeys,
    config: &'a Config,
    context: AssemblyContext,
  ) -> Result<Self, AssemblyError> {
    let remote = config
      .kbas_url
      .as_deref()
      .map(|url| KbasClient::new(url, &config.kbas_password));
    Ok(Assembler {
      definitions,
      keys,
      config,
      store: Store::new(config.artifacts()),
      mirrors: Mirrors::new(config),
      remote,
      env: EnvContext::new(config, &context.definitions_ref)?,
      meta: MetaContext {
        artifact_version: config.artifact_version,
        definitions_dir: definitions.root().display().to_string(),
        definitions_ref: context.definitions_ref,
      },
      overlaps: OverlapTracker::new(config.check_overlaps),
      progress: Progress::new(keys.len()),
      instance: context.instance,
    })
  }

  pub fn progress(&self) -> &Progress {
    &self.progress
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  /// Make sure an artifact for `path` is in the local store.
  pub async fn compose(&mut self, path: &str) -> Result<Composed, AssemblyError> {
    let definitions = self.definitions;
    let definition = definitions.require(path, path)?;
    let span = info_span!("compose", component = %definition.name);
    self.compose_definition(definition).instrument(span).await
  }

  async fn compose_definition(&mut self, definition: &'a Definition) -> Result<Composed, AssemblyError> {
    let path = definition.path.as_str();
    let Some(key) = self.keys.get(path).map(str::to_string) else {
      if self.keys.is_filtered(path) {
        debug!(arch = ?definition.arch, "not built for this architecture");
        return Ok(Composed::Skipped);
      }
      self.progress.mark_tried(path);
      warn!("no cache key");
      return Ok(Composed::Unbuildable);
    };

    if self.store.contains(&key) {
      return Ok(Composed::Key(key));
    }

    match self.fetch_remote(definition, &key).await? {
      Fetch::Hit => return Ok(Composed::Key(key)),
      Fetch::Contended => return Ok(Composed::Retry),
      Fetch::Miss => {}
    }

    let mut children = self.composition_order(definition)?;
    if self.config.instances() > 1 {
      children.shuffle(&mut rand::thread_rng());
    }
    for child in &children {
      match Box::pin(self.compose(child)).await? {
        Composed::Retry => return Ok(Composed::Retry),
        Composed::Unbuildable => {
          warn!(dependency = %child, "cannot compose a prerequisite");
          return Ok(Composed::Unbuildable);
        }
        Composed::Key(_) | Composed::Skipped => {}
      }
    }

    let tmp = self.config.tmp();
    let Some(lock) = KeyLock::try_acquire(&tmp, &key).map_err(AssemblyError::io(&tmp))? else {
      self.contended(path, &key).await?;
      return Ok(Composed::Retry);
    };
    if self.store.contains(&key) {
      return Ok(Composed::Key(key));
    }

    let sandbox = Sandbox::create(&tmp, &definition.name)?;
    self.assemble(definition, &key, &sandbox).await?;
    sandbox.release();
    drop(lock);

    info!(
      key = %key,
      completed = self.progress.completed(),
      total = self.progress.total,
      "component ready"
    );
    Ok(Composed::Key(key))
  }

  /// Another worker holds `key`. Back-to-back retries wait for it.
  async fn contended(&mut self, path: &str, key: &str) -> Result<(), AssemblyError> {
    info!(key, "another worker is on this component, will retry");
    if self.progress.record_retry(path) {
      let tmp = self.config.tmp();
      let timeout = Duration::from_secs(self.config.retry_timeout);
      lock::wait_for_holder(&tmp, key, timeout)
        .await
        .map_err(AssemblyError::io(&tmp))?;
    }
    Ok(())
  }

  async fn fetch_remote(&mut self, definition: &Definition, key: &str) -> Result<Fetch, AssemblyError> {
    let path = definition.path.as_str();
    let Some(remote) = self.remote.clone() else {
      return Ok(Fetch::Miss);
    };
    if self.config.reproduce
      || !self.config.kbas_upload.contains(&definition.kind)
      || self.progress.was_tried(path)
      || self.progress.last_retry_was(path)
    {
      return Ok(Fetch::Miss);
    }

    let tmp = self.config.tmp();
    let Some(_lock) = KeyLock::try_acquire(&tmp, key).map_err(AssemblyError::io(&tmp))? else {
      self.contended(path, key).await?;
      return Ok(Fetch::Contended);
    };
    self.progress.mark_tried(path);
    if self.store.contains(key) {
      return Ok(Fetch::Hit);
    }

    let staging = tempfile::Builder::new()
      .prefix(".fetch-")
      .tempdir_in(&tmp)
      .map_err(AssemblyError::io(&tmp))?;
    let downloaded = match remote.fetch(key, staging.path()).await {
      Ok(Some(file)) => file,
      Ok(None) => return Ok(Fetch::Miss),
      Err(e) => {
        warn!(error = %e, "artifact server unreachable, carrying on without it");
        self.remote = None;
        return Ok(Fetch::Miss);
      }
    };

    match self.store.put_archive(key, &downloaded) {
      Ok(_) => {
        self.progress.fetched += 1;
        info!(key, "fetched from artifact server");
        Ok(Fetch::Hit)
      }
      Err(e @ StoreError::Unpack { .. }) => {
        warn!(error = %e, "discarding unusable download");
        Ok(Fetch::Miss)
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Everything that must be composed before `definition` can be assembled,
  /// in install order.
  fn composition_order(&self, definition: &'a Definition) -> Result<Vec<String>, AssemblyError> {
    let mut order = match definition.kind {
      Kind::Chunk => self.dependency_plan(definition)?,
      _ => self.contents_plan(definition)?,
    };
    for path in graph::prerequisites(definition) {
      if !order.iter().any(|p| p == path) {
        order.push(path.to_string());
      }
    }
    Ok(order)
  }

  /// Build-depends of a chunk, recursively, in install order.
  ///
  /// Indirect dependencies are only included when they share the chunk's
  /// build mode, which keeps bootstrap tools out of staged builds.
  fn dependency_plan(&self, chunk: &'a Definition) -> Result<Vec<String>, AssemblyError> {
    let mut plan = Vec::new();
    let mut expanded = HashSet::new();
    self.plan_dependencies(chunk, &chunk.build_depends, &mut plan, &mut expanded)?;
    Ok(plan)
  }

  fn plan_dependencies(
    &self,
    chunk: &'a Definition,
    paths: &[String],
    plan: &mut Vec<String>,
    expanded: &mut HashSet<String>,
  ) -> Result<(), AssemblyError> {
    for path in paths {
      let dependency = self.definitions.require(path, &chunk.path)?;
      if expanded.insert(path.clone()) {
        self.plan_dependencies(chunk, &dependency.build_depends, plan, expanded)?;
      }
      let wanted = chunk.build_depends.contains(path) || dependency.build_mode == chunk.build_mode;
      if wanted && !plan.contains(path) {
        let members: Vec<String> = dependency.member_paths().map(str::to_string).collect();
        self.plan_dependencies(chunk, &members, plan, expanded)?;
        plan.push(path.clone());
      }
    }
    Ok(())
  }

  /// Contents of a stratum or system, members before the composite holding
  /// them.
  fn contents_plan(&self, definition: &'a Definition) -> Result<Vec<String>, AssemblyError> {
    fn walk<'d>(
      definitions: &'d Definitions,
      definition: &'d Definition,
      plan: &mut Vec<String>,
    ) -> Result<(), DefinitionsError> {
      for path in definition.member_paths() {
        if plan.iter().any(|p| p == path) {
          continue;
        }
        let member = definitions.require(path, &definition.path)?;
        walk(definitions, member, plan)?;
        plan.push(path.to_string());
      }
      Ok(())
    }

    let mut plan = Vec::new();
    walk(self.definitions, definition, &mut plan)?;
    Ok(plan)
  }

  /// Fill the sandbox, build and cache the artifact.
  async fn assemble(&mut self, definition: &'a Definition, key: &str, sandbox: &Sandbox) -> Result<(), AssemblyError> {
    let started = Instant::now();
    let log_path = self.store.log_path(key, self.instance);
    let log = BuildLog::create(&log_path).map_err(AssemblyError::io(&log_path))?;
    info!(key, sandbox = %sandbox.root().display(), "assembling");

    match definition.kind {
      Kind::Chunk => {
        let plan = self.dependency_plan(definition)?;
        self.install_paths(definition, &plan, sandbox, LinkMode::Hardlink)?;
      }
      Kind::Stratum => {
        let plan = self.contents_plan(definition)?;
        self.install_paths(definition, &plan, sandbox, LinkMode::Hardlink)?;
      }
      Kind::System => self.install_system_contents(definition, sandbox)?,
      Kind::Cluster => {}
    }
    self.overlaps.check(&definition.name, &sandbox.root().join(METADATA_DIR))?;

    if self.config.mode == Mode::NoBuild {
      self.store.put(key, &sandbox.install_dir(), ArchiveFormat::Gzip)?;
      return Ok(());
    }

    match definition.kind {
      Kind::Chunk => self.build_chunk(definition, key, sandbox, &log).await?,
      Kind::Stratum => self.build_stratum(definition, key, sandbox)?,
      Kind::System => self.build_system(definition, key, sandbox, &log).await?,
      Kind::Cluster => {
        self.store.put(key, &sandbox.install_dir(), ArchiveFormat::Gzip)?;
      }
    }

    log.finish(started.elapsed()).map_err(AssemblyError::io(log.path()))?;
    self.progress.built += 1;
    self.upload(definition, key).await?;
    Ok(())
  }

  /// Install the artifacts of `paths` into the sandbox root, skipping any
  /// whose metadata is already there.
  fn install_paths(
    &mut self,
    definition: &Definition,
    paths: &[String],
    sandbox: &Sandbox,
    mode: LinkMode,
  ) -> Result<(), AssemblyError> {
    for path in paths {
      let item = self.definitions.require(path, &definition.path)?;
      if sandbox.has_installed(&item.name) {
        debug!(item = %item.name, "already installed");
        continue;
      }
      if definition.kind != Kind::Chunk && item.is_bootstrap() {
        continue;
      }
      let Some(unpacked) = self.unpacked(item)? else {
        continue;
      };
      debug!(item = %item.name, "installing");
      let overlaps = sandbox.install(&unpacked, mode)?;
      self.record_overlaps(overlaps);
    }
    Ok(())
  }

  fn install_system_contents(&mut self, system: &'a Definition, sandbox: &Sandbox) -> Result<(), AssemblyError> {
    for content in &system.contents {
      let stratum = self.definitions.require(&content.path, &system.path)?;
      let selected = if content.artifacts.is_empty() {
        default_selection(stratum, &self.config.default_splits)
      } else {
        content.artifacts.names()
      };

      if selected.is_empty() && content.artifacts.is_empty() {
        let mut plan = self.contents_plan(stratum)?;
        plan.push(content.path.clone());
        self.install_paths(system, &plan, sandbox, LinkMode::Copy)?;
        continue;
      }

      let Some(stratum_unpacked) = self.unpacked(stratum)? else {
        continue;
      };
      let members = self.members(stratum)?;
      let overlaps = install_stratum_artifacts(stratum, &stratum_unpacked, &selected, &members, sandbox.root())?;
      self.record_overlaps(overlaps);
    }
    Ok(())
  }

  fn record_overlaps(&mut self, overlaps: Vec<String>) {
    let metadata_prefix = format!("/{METADATA_DIR}/");
    self
      .overlaps
      .record(overlaps.into_iter().filter(|p| !p.starts_with(&metadata_prefix)));
  }

  /// The unpacked artifact of `item`; `None` when it is not built for this
  /// architecture.
  fn unpacked(&self, item: &Definition) -> Result<Option<PathBuf>, AssemblyError> {
    let Some(key) = self.keys.get(&item.path) else {
      return Ok(None);
    };
    match self.store.get(key)? {
      Some(unpacked) => Ok(Some(unpacked)),
      None => Err(AssemblyError::MissingArtifact {
        component: item.name.clone(),
        key: key.to_string(),
      }),
    }
  }

  /// Built members of a stratum, for splitting.
  fn members(&self, stratum: &'a Definition) -> Result<Vec<Member<'a>>, AssemblyError> {
    let mut members = Vec::new();
    for content in &stratum.contents {
      let definition = self.definitions.require(&content.path, &stratum.path)?;
      if definition.is_bootstrap() {
        continue;
      }
      let Some(unpacked) = self.unpacked(definition)? else {
        continue;
      };
      members.push(Member {
        definition,
        artifacts: &content.artifacts,
        unpacked,
      });
    }
    Ok(members)
  }

  async fn build_chunk(
    &mut self,
    chunk: &Definition,
    key: &str,
    sandbox: &Sandbox,
    log: &BuildLog,
  ) -> Result<(), AssemblyError> {
    sandbox.ldconfig().await?;

    let build_dir = sandbox.build_dir();
    let mut epoch = None;
    if let Some(repo) = chunk.repo.as_deref() {
      let Some(git_ref) = chunk.git_ref.as_deref() else {
        return Err(AssemblyError::MissingRef {
          component: chunk.name.clone(),
        });
      };
      let source_err = |source| AssemblyError::Source {
        component: chunk.name.clone(),
        source,
      };
      remove_path(&build_dir).map_err(AssemblyError::io(&build_dir))?;
      self
        .mirrors
        .checkout(repo, git_ref, &build_dir, chunk.submodules.as_ref())
        .await
        .map_err(source_err)?;
      epoch = source_date_epoch(&build_dir)
        .inspect_err(|e| warn!(error = %e, "no SOURCE_DATE_EPOCH for checkout"))
        .ok();
    }

    let steps = self.chunk_commands(chunk, &build_dir)?;
    let prefixes = self.dependency_prefixes(chunk)?;
    let env = self.env.for_build(chunk, &prefixes, sandbox, epoch);
    let serial_env = without_makeflags(&env);
    let spec = self.exec_spec(chunk);
    if let Some(ccache) = &spec.ccache_dir {
      std::fs::create_dir_all(ccache).map_err(AssemblyError::io(ccache))?;
    }

    for (step, commands) in &steps {
      if commands.is_empty() {
        continue;
      }
      info!(step = %step, commands = commands.len(), "running");
      let env = if PARALLEL_STEPS.contains(&step.as_str()) {
        &env
      } else {
        &serial_env
      };
      for command in commands {
        sandbox.run(&command.0, env, &spec, log).await?;
      }
    }

    if !chunk.devices.is_empty() {
      create_devices(&sandbox.install_dir(), &chunk.devices)?;
    }

    let rules = SplitRules::compile(chunk, self.definitions.defaults())?;
    write_chunk_metadata(
      chunk,
      key,
      &rules,
      &sandbox.install_dir(),
      &sandbox.metadata_dir(),
      &self.meta,
    )?;
    self.store.put(key, &sandbox.install_dir(), ArchiveFormat::for_kind(chunk.kind))?;
    Ok(())
  }

  fn build_stratum(&mut self, stratum: &'a Definition, key: &str, sandbox: &Sandbox) -> Result<(), AssemblyError> {
    let members = self.members(stratum)?;
    let rules = SplitRules::compile(stratum, self.definitions.defaults())?;
    write_stratum_metadata(stratum, key, &rules, &members, &sandbox.metadata_dir(), &self.meta)?;
    self.store.put(key, &sandbox.install_dir(), ArchiveFormat::for_kind(stratum.kind))?;
    Ok(())
  }

  /// Run the gathered system-integration commands, then archive the whole
  /// sandbox root.
  async fn build_system(
    &mut self,
    system: &'a Definition,
    key: &str,
    sandbox: &Sandbox,
    log: &BuildLog,
  ) -> Result<(), AssemblyError> {
    let commands = self.integration_commands(system)?;
    if !commands.is_empty() {
      let env = without_makeflags(&self.env.for_build(system, &[], sandbox, None));
      let spec = self.exec_spec(system);
      info!(commands = commands.len(), "running system integration");
      for command in &commands {
        sandbox.run(&command.0, &env, &spec, log).await?;
      }
    }

    let install = sandbox.install_dir();
    let overlaps = populate_tree(&install, sandbox.root(), LinkMode::Hardlink).map_err(AssemblyError::io(&install))?;
    self.record_overlaps(overlaps);
    for dir in [sandbox.build_dir(), install] {
      remove_path(&dir).map_err(AssemblyError::io(&dir))?;
    }
    self.overlaps.check(&system.name, &sandbox.root().join(METADATA_DIR))?;
    self.store.put(key, sandbox.root(), ArchiveFormat::for_kind(system.kind))?;
    Ok(())
  }

  fn exec_spec(&self, definition: &Definition) -> ExecSpec {
    ExecSpec {
      isolation: self.config.isolation,
      bootstrap: definition.is_bootstrap(),
      ccache_dir: (!self.config.no_ccache).then(|| self.config.ccache_dir().join(&definition.name)),
    }
  }

  /// Prefix of every direct build-depend, `/usr` unless set.
  fn dependency_prefixes(&self, chunk: &Definition) -> Result<Vec<String>, AssemblyError> {
    chunk
      .build_depends
      .iter()
      .map(|path| {
        let dependency = self.definitions.require(path, &chunk.path)?;
        Ok(dependency.prefix.clone().unwrap_or_else(|| "/usr".to_string()))
      })
      .collect()
  }

  /// The command list for each build step, in order.
  ///
  /// Steps the chunk leaves unset come from its build system, which is
  /// detected from the checkout when the chunk does not name one.
  pub fn chunk_commands(&self, chunk: &Definition, checkout: &Path) -> Result<Vec<(String, Vec<Command>)>, AssemblyError> {
    let defaults = self.definitions.defaults();
    let build_system = match chunk.build_system.as_deref() {
      Some(name) => name.to_string(),
      None => {
        let files = if checkout.is_dir() {
          top_level_names(checkout).map_err(AssemblyError::io(checkout))?
        } else {
          Vec::new()
        };
        let detected = defaults.detect_build_system(&files).to_string();
        if detected == MANUAL && chunk.commands(INSTALL_STEP).is_none_or(<[Command]>::is_empty) {
          return Err(AssemblyError::NoInstallCommands {
            component: chunk.name.clone(),
          });
        }
        debug!(build_system = %detected, "detected build system");
        detected
      }
    };

    Ok(
      defaults
        .build_steps
        .iter()
        .map(|step| {
          let commands = chunk
            .commands(step)
            .or_else(|| defaults.commands(&build_system, step))
            .unwrap_or_default()
            .to_vec();
          (step.clone(), commands)
        })
        .collect(),
    )
  }

  /// `system-integration` commands of everything the system contains,
  /// ordered by `<name>-<product>`.
  pub fn integration_commands(&self, system: &Definition) -> Result<Vec<Command>, AssemblyError> {
    fn gather(
      definitions: &Definitions,
      definition: &Definition,
      out: &mut BTreeMap<String, Vec<Command>>,
    ) -> Result<(), DefinitionsError> {
      for (product, blocks) in &definition.system_integration {
        for (name, commands) in blocks {
          out.insert(format!("{name}-{product}"), commands.clone());
        }
      }
      for path in definition.member_paths() {
        let member = definitions.require(path, &definition.path)?;
        gather(definitions, member, out)?;
      }
      Ok(())
    }

    let mut blocks = BTreeMap::new();
    gather(self.definitions, system, &mut blocks)?;
    Ok(blocks.into_values().flatten().collect())
  }

  async fn upload(&mut self, definition: &Definition, key: &str) -> Result<(), AssemblyError> {
    let Some(remote) = self.remote.clone() else {
      return Ok(());
    };
    if !self.config.can_upload() || !self.config.kbas_upload.contains(&definition.kind) {
      return Ok(());
    }

    let checksum = self.store.checksum(key)?;
    match remote.upload(key, &self.store.archive_path(key), &checksum).await {
      Ok(UploadOutcome::Reproduced) => self.progress.reproduced += 1,
      Ok(UploadOutcome::Mismatch) if self.config.reproduce && definition.kind == Kind::Stratum => {
        error!(key, "reproduction failed: the artifact server has a different artifact for this key");
      }
      Ok(_) => {}
      Err(e) => warn!(key, error = %e, "upload failed"),
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache_key::KeyComputer;
  use crate::definitions::LoadOptions;
  use crate::repos::TreeSource;
  use crate::util::testutil::{host_config, write_file};
  use tempfile::TempDir;

  struct NoTrees;

  impl TreeSource for NoTrees {
    async fn resolve_tree(&self, repo: &str, git_ref: &str) -> Result<String, RepoError> {
      Err(RepoError::UnresolvedRef {
        repo: repo.to_string(),
        git_ref: git_ref.to_string(),
      })
    }
  }

  struct Fixture {
    temp: TempDir,
    definitions: Definitions,
    config: Config,
  }

  impl Fixture {
    fn new(files: &[(&str, &str)]) -> Self {
      let temp = TempDir::new().unwrap();
      let defs = temp.path().join("defs");
      for (path, content) in files {
        write_file(&defs, path, content);
      }
      let definitions = Definitions::load(&defs, LoadOptions::default()).unwrap();
      let config = host_config(&temp.path().join("base"));
      config.create_directories().unwrap();
      Fixture {
        temp,
        definitions,
        config,
      }
    }

    async fn keys(&self, target: &str) -> CacheKeys {
      KeyComputer::new(&self.definitions, &NoTrees, &self.config)
        .compute(target)
        .await
        .unwrap()
    }

    fn context(&self) -> AssemblyContext {
      AssemblyContext {
        definitions_ref: "unversioned".into(),
        instance: None,
      }
    }
  }

  const LEAF: &str = "name: leaf\ninstall-commands:\n- mkdir -p \"$DESTDIR/usr/bin\"\n- echo hi > \"$DESTDIR/usr/bin/leaf\"\n";

  #[tokio::test]
  async fn builds_a_leaf_chunk() {
    let fixture = Fixture::new(&[("leaf.def", LEAF)]);
    let keys = fixture.keys("leaf.def").await;
    let mut assembler = Assembler::new(&fixture.definitions, &keys, &fixture.config, fixture.context()).unwrap();

    let composed = assembler.compose("leaf.def").await.unwrap();
    let key = keys.get("leaf.def").unwrap().to_string();
    assert_eq!(composed, Composed::Key(key.clone()));
    assert_eq!(assembler.progress().built, 1);

    let unpacked = assembler.store().get(&key).unwrap().unwrap();
    assert_eq!(std::fs::read_to_string(unpacked.join("usr/bin/leaf")).unwrap(), "hi\n");
    let meta = crate::splitting::Metadata::read_for(&unpacked, "leaf").unwrap();
    let bins = meta.products.iter().find(|p| p.artifact == "leaf-bins").unwrap();
    assert_eq!(bins.files, Some(vec!["usr/bin/leaf".to_string()]));

    let log = std::fs::read_to_string(assembler.store().log_path(&key, None)).unwrap();
    assert!(log.contains("# # mkdir -p"));
    assert!(log.contains("Elapsed_time:"));

    // a second compose is a cache hit
    assert_eq!(assembler.compose("leaf.def").await.unwrap(), Composed::Key(key));
    assert_eq!(assembler.progress().built, 1);
  }

  #[tokio::test]
  async fn dependencies_are_installed_before_building() {
    let fixture = Fixture::new(&[
      ("leaf.def", LEAF),
      (
        "user.def",
        "name: user\nbuild-depends: [leaf.def]\ninstall-commands:\n- mkdir -p \"$DESTDIR/usr/share\"\n- cp ../usr/bin/leaf \"$DESTDIR/usr/share/copied\"\n",
      ),
    ]);
    let keys = fixture.keys("user.def").await;
    let mut assembler = Assembler::new(&fixture.definitions, &keys, &fixture.config, fixture.context()).unwrap();

    let composed = assembler.compose("user.def").await.unwrap();
    let Composed::Key(key) = composed else {
      panic!("expected a key, got {composed:?}");
    };
    assert_eq!(assembler.progress().built, 2);
    let unpacked = assembler.store().get(&key).unwrap().unwrap();
    assert_eq!(std::fs::read_to_string(unpacked.join("usr/share/copied")).unwrap(), "hi\n");
    // the dependency's files are not part of this artifact
    assert!(!unpacked.join("usr/bin/leaf").exists());
  }

  #[tokio::test]
  async fn failure_preserves_the_sandbox() {
    let fixture = Fixture::new(&[("bad.def", "name: bad\ninstall-commands:\n- exit 3\n")]);
    let keys = fixture.keys("bad.def").await;
    let mut assembler = Assembler::new(&fixture.definitions, &keys, &fixture.config, fixture.context()).unwrap();

    let err = assembler.compose("bad.def").await.unwrap_err();
    let AssemblyError::Sandbox(SandboxError::CommandFailed { sandbox, .. }) = err else {
      panic!("unexpected error: {err}");
    };
    assert!(sandbox.join("bad.build").is_dir());
    assert!(!assembler.store().contains(keys.get("bad.def").unwrap()));
  }

  #[tokio::test]
  async fn manual_chunk_without_install_commands_fails() {
    let fixture = Fixture::new(&[("empty.def", "name: empty\n")]);
    let keys = fixture.keys("empty.def").await;
    let mut assembler = Assembler::new(&fixture.definitions, &keys, &fixture.config, fixture.context()).unwrap();

    let err = assembler.compose("empty.def").await.unwrap_err();
    assert!(matches!(err, AssemblyError::NoInstallCommands { .. }));
  }

  #[tokio::test]
  async fn held_lock_means_retry() {
    let fixture = Fixture::new(&[("leaf.def", LEAF)]);
    let keys = fixture.keys("leaf.def").await;
    let key = keys.get("leaf.def").unwrap();
    let _held = KeyLock::try_acquire(&fixture.config.tmp(), key).unwrap().unwrap();
    let mut assembler = Assembler::new(&fixture.definitions, &keys, &fixture.config, fixture.context()).unwrap();

    assert_eq!(assembler.compose("leaf.def").await.unwrap(), Composed::Retry);
    assert_eq!(assembler.progress().retries, 1);
    assert_eq!(assembler.progress().built, 0);
  }

  #[tokio::test]
  async fn strata_carry_split_metadata_only() {
    let fixture = Fixture::new(&[
      ("leaf.def", LEAF),
      ("s.def", "name: core\nkind: stratum\ncontents:\n- leaf.def\n"),
    ]);
    let keys = fixture.keys("s.def").await;
    let mut assembler = Assembler::new(&fixture.definitions, &keys, &fixture.config, fixture.context()).unwrap();

    let Composed::Key(key) = assembler.compose("s.def").await.unwrap() else {
      panic!("stratum did not compose");
    };
    let unpacked = assembler.store().get(&key).unwrap().unwrap();
    assert!(unpacked.join("baserock/core.meta").is_file());
    assert!(unpacked.join("baserock/leaf.meta").is_file());
    assert!(!unpacked.join("usr").exists());
  }

  mod commands {
    use super::*;

    #[tokio::test]
    async fn unset_steps_come_from_the_build_system() {
      let fixture = Fixture::new(&[(
        "c.def",
        "name: c\nbuild-system: autotools\nbuild-commands:\n- make -C src\n",
      )]);
      let keys = fixture.keys("c.def").await;
      let assembler = Assembler::new(&fixture.definitions, &keys, &fixture.config, fixture.context()).unwrap();
      let chunk = fixture.definitions.get("c.def").unwrap();

      let steps = assembler.chunk_commands(chunk, Path::new("/nonexistent")).unwrap();
      let find = |name: &str| &steps.iter().find(|(s, _)| s == name).unwrap().1;
      assert_eq!(steps.len(), 15);
      assert_eq!(find("build-commands")[0].0, "make -C src");
      assert_eq!(find("install-commands")[0].0, "make DESTDIR=\"$DESTDIR\" install");
    }

    #[tokio::test]
    async fn build_system_is_detected_from_the_checkout() {
      let fixture = Fixture::new(&[("c.def", "name: c\n")]);
      let keys = fixture.keys("c.def").await;
      let assembler = Assembler::new(&fixture.definitions, &keys, &fixture.config, fixture.context()).unwrap();
      let chunk = fixture.definitions.get("c.def").unwrap();
      let checkout = fixture.temp.path().join("checkout");
      write_file(&checkout, "CMakeLists.txt", "");

      let steps = assembler.chunk_commands(chunk, &checkout).unwrap();
      let configure = &steps.iter().find(|(s, _)| s == "configure-commands").unwrap().1;
      assert!(configure[0].0.starts_with("cmake"));
    }

    #[tokio::test]
    async fn integration_commands_are_ordered_by_name_then_product() {
      let fixture = Fixture::new(&[
        (
          "a.def",
          "name: a\ninstall-commands: [true]\nsystem-integration:\n  a-misc:\n    02-later:\n    - echo later\n",
        ),
        (
          "b.def",
          "name: b\ninstall-commands: [true]\nsystem-integration:\n  b-misc:\n    01-first:\n    - echo first\n",
        ),
        ("s.def", "name: s\nkind: stratum\ncontents: [a.def, b.def]\n"),
        ("sys.def", "name: sys\nkind: system\narch: x86_64\ncontents: [s.def]\n"),
      ]);
      let keys = fixture.keys("sys.def").await;
      let assembler = Assembler::new(&fixture.definitions, &keys, &fixture.config, fixture.context()).unwrap();
      let system = fixture.definitions.get("sys.def").unwrap();

      let commands = assembler.integration_commands(system).unwrap();
      let text: Vec<&str> = commands.iter().map(|c| c.0.as_str()).collect();
      assert_eq!(text, ["echo first", "echo later"]);
    }
  }
}
