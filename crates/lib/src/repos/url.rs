//! Repository URL handling.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Apply the first matching alias prefix; `http*` URLs gain a `.git` suffix.
pub fn expand(repo: &str, aliases: &BTreeMap<String, String>) -> String {
  let mut url = aliases
    .iter()
    .find_map(|(alias, target)| repo.strip_prefix(alias.as_str()).map(|rest| format!("{target}{rest}")))
    .unwrap_or_else(|| repo.to_string());
  if url.starts_with("http") && !url.ends_with(".git") {
    url.push_str(".git");
  }
  url
}

/// Mirror directory name for `url`: every character outside
/// `[A-Za-z0-9_%]` becomes `_`, including the dot of a `.git` suffix.
pub fn sanitise(url: &str) -> String {
  url
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '%' { c } else { '_' })
    .collect()
}

/// The repository directory when `repo` names a local path.
pub fn local_path(repo: &str) -> Option<PathBuf> {
  if let Some(path) = repo.strip_prefix("file://") {
    return Some(PathBuf::from(path));
  }
  repo.starts_with('/').then(|| PathBuf::from(repo))
}
