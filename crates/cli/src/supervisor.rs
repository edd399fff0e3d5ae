//! Extra build instances.
//!
//! Instances share nothing but the filesystem: the supervisor relaunches its
//! own executable with the same arguments and `YBD_INSTANCE=<i>`, runs
//! instance 0 itself, then waits for the rest.

use std::process::{Child, Command};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use ybd_lib::config::{Config, Mode};

const INSTANCE_VAR: &str = "YBD_INSTANCE";

/// Only building modes fan out.
pub fn wants_workers(config: &Config) -> bool {
  config.instances() > 1 && matches!(config.mode, Mode::Normal | Mode::NoBuild)
}

pub struct Workers {
  children: Vec<(usize, Child)>,
}

impl Workers {
  pub fn none() -> Self {
    Workers { children: Vec::new() }
  }

  /// Launch instances `1..count`.
  pub fn spawn(count: usize) -> Result<Self> {
    let exe = std::env::current_exe().context("Failed to locate the ybd executable")?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();

    let mut children = Vec::with_capacity(count.saturating_sub(1));
    for instance in 1..count {
      let child = Command::new(&exe)
        .args(&args)
        .env(INSTANCE_VAR, instance.to_string())
        .spawn()
        .with_context(|| format!("Failed to launch instance {instance}"))?;
      info!(instance, pid = child.id(), "started instance");
      children.push((instance, child));
    }
    Ok(Workers { children })
  }

  /// Wait for every instance; fails if any of them failed.
  pub fn wait(self) -> Result<()> {
    let mut failed = Vec::new();
    for (instance, mut child) in self.children {
      match child.wait() {
        Ok(status) if status.success() => {}
        Ok(status) => {
          warn!(instance, %status, "instance failed");
          failed.push(instance);
        }
        Err(e) => {
          warn!(instance, error = %e, "failed to wait for instance");
          failed.push(instance);
        }
      }
    }
    if !failed.is_empty() {
      let list: Vec<_> = failed.iter().map(ToString::to_string).collect();
      bail!("instance(s) {} failed", list.join(", "));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(yaml: &str) -> Config {
    Config::from_yaml(yaml)
      .unwrap()
      .with_target("t.def", "x86_64")
      .finalize()
      .unwrap()
  }

  #[test]
  fn single_instance_runs_alone() {
    assert!(!wants_workers(&config("instances: 1\n")));
  }

  #[test]
  fn building_modes_fan_out() {
    assert!(wants_workers(&config("instances: 3\n")));
    assert!(wants_workers(&config("instances: 3\nmode: no-build\n")));
  }

  #[test]
  fn listing_modes_stay_single() {
    assert!(!wants_workers(&config("instances: 3\nmode: keys-only\n")));
    assert!(!wants_workers(&config("instances: 3\nmode: parse-only\n")));
  }

  #[test]
  fn no_workers_wait_succeeds() {
    assert!(Workers::none().wait().is_ok());
  }
}
