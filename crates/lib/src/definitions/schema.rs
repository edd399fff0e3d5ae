//! Structural validation of definition files.

use serde_yaml::{Mapping, Value};
use tracing::warn;

use super::DefinitionsError;
use crate::config::SchemaValidation;

const COMMON_KEYS: &[&str] = &["name", "kind", "description", "morph", "path", "arch", "build-depends"];

const CHUNK_KEYS: &[&str] = &[
  "repo",
  "ref",
  "sha",
  "unpetrify-ref",
  "tree",
  "build-system",
  "build-mode",
  "prefix",
  "max-jobs",
  "products",
  "devices",
  "submodules",
  "system-integration",
  "artifacts",
];

const STRATUM_KEYS: &[&str] = &["chunks", "contents", "products"];
const SYSTEM_KEYS: &[&str] = &["strata", "contents", "configuration-extensions"];
const CLUSTER_KEYS: &[&str] = &["systems"];

const LIST_KEYS: &[&str] = &[
  "build-depends",
  "chunks",
  "strata",
  "contents",
  "products",
  "devices",
  "systems",
];

/// Validate a top-level definition file according to `mode`.
///
/// In `warn` mode problems are logged; in `strict` mode they are fatal.
pub fn check(path: &str, mapping: &Mapping, mode: SchemaValidation) -> Result<(), DefinitionsError> {
  if mode == SchemaValidation::Off {
    return Ok(());
  }

  let problems = problems(mapping);
  if problems.is_empty() {
    return Ok(());
  }

  let problems = problems.join("; ");
  match mode {
    SchemaValidation::Strict => Err(DefinitionsError::Schema {
      path: path.to_string(),
      problems,
    }),
    _ => {
      warn!(path, problems = %problems, "definition failed validation");
      Ok(())
    }
  }
}

fn problems(mapping: &Mapping) -> Vec<String> {
  let mut problems = Vec::new();

  let kind = match mapping.get("kind") {
    None => "chunk",
    Some(Value::String(kind)) => kind.as_str(),
    Some(other) => {
      problems.push(format!("kind must be a string, found {other:?}"));
      return problems;
    }
  };
  let kind_keys = match kind {
    "chunk" => CHUNK_KEYS,
    "stratum" => STRATUM_KEYS,
    "system" => SYSTEM_KEYS,
    "cluster" => CLUSTER_KEYS,
    other => {
      problems.push(format!("unknown kind '{other}'"));
      return problems;
    }
  };

  if let Some(name) = mapping.get("name")
    && !name.is_string()
  {
    problems.push("name must be a string".to_string());
  }

  for (key, value) in mapping {
    let Some(key) = key.as_str() else {
      problems.push(format!("non-string key {key:?}"));
      continue;
    };

    let is_commands = key.ends_with("-commands");
    if !(COMMON_KEYS.contains(&key) || kind_keys.contains(&key) || (kind == "chunk" && is_commands)) {
      problems.push(format!("unexpected key '{key}' for a {kind}"));
    }
    if (is_commands || LIST_KEYS.contains(&key)) && !matches!(value, Value::Sequence(_) | Value::Null) {
      problems.push(format!("{key} must be a list"));
    }
  }

  problems
}

#[cfg(test)]
mod tests {
  use super::*;
  use tracing_test::traced_test;

  fn mapping(yaml: &str) -> Mapping {
    serde_yaml::from_str(yaml).unwrap()
  }

  #[test]
  fn valid_chunk_passes() {
    let m = mapping("name: x\nrepo: r\nref: a\nbuild-system: cmake\ninstall-commands: [make]\n");
    assert!(problems(&m).is_empty());
  }

  #[test]
  fn reports_unknown_kind() {
    let m = mapping("name: x\nkind: widget\n");
    assert_eq!(problems(&m), vec!["unknown kind 'widget'"]);
  }

  #[test]
  fn reports_misplaced_and_mistyped_keys() {
    let m = mapping("name: s\nkind: stratum\nrepo: r\nchunks: c\n");
    let found = problems(&m);
    assert!(found.contains(&"unexpected key 'repo' for a stratum".to_string()));
    assert!(found.contains(&"chunks must be a list".to_string()));
  }

  #[test]
  fn strict_mode_fails() {
    let m = mapping("name: x\nkind: widget\n");
    let err = check("x.def", &m, SchemaValidation::Strict).unwrap_err();
    assert!(matches!(err, DefinitionsError::Schema { .. }));
  }

  #[test]
  #[traced_test]
  fn warn_mode_logs() {
    let m = mapping("name: x\nkind: widget\n");
    check("x.def", &m, SchemaValidation::Warn).unwrap();
    assert!(logs_contain("definition failed validation"));
  }

  #[test]
  fn off_mode_skips() {
    let m = mapping("kind: widget\n");
    check("x.def", &m, SchemaValidation::Off).unwrap();
  }
}
