//! Dependency graph of a target and everything it reaches.
//!
//! Edges run from a prerequisite to the definition that needs it, covering
//! `build-depends`, `contents` and the systems of a cluster.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::{ClusterSystem, Definition, Definitions, DefinitionsError};

pub struct DependencyGraph {
  graph: DiGraph<String, ()>,
  nodes: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
  /// Collect `target` and its transitive prerequisites.
  ///
  /// # Errors
  ///
  /// `UnknownReference` if any reachable definition names a path that was
  /// never loaded, `Cycle` if the prerequisites are not acyclic.
  pub fn for_target(definitions: &Definitions, target: &str) -> Result<Self, DefinitionsError> {
    let mut graph = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();

    let root = definitions.require(target, "target")?;
    nodes.insert(root.path.clone(), graph.add_node(root.path.clone()));
    let mut pending = vec![root];

    while let Some(definition) = pending.pop() {
      let dependent = nodes[&definition.path];
      for prerequisite in prerequisites(definition) {
        let found = definitions.require(prerequisite, &definition.path)?;
        let idx = match nodes.get(&found.path) {
          Some(&idx) => idx,
          None => {
            let idx = graph.add_node(found.path.clone());
            nodes.insert(found.path.clone(), idx);
            pending.push(found);
            idx
          }
        };
        graph.update_edge(idx, dependent, ());
      }
    }

    let dag = Self { graph, nodes };
    dag.build_order()?;
    Ok(dag)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Paths with every prerequisite before the definitions that need it.
  pub fn build_order(&self) -> Result<Vec<String>, DefinitionsError> {
    let sorted = toposort(&self.graph, None).map_err(|cycle| DefinitionsError::Cycle {
      path: self.graph[cycle.node_id()].clone(),
    })?;
    Ok(sorted.into_iter().map(|idx| self.graph[idx].clone()).collect())
  }
}

/// Every path `definition` needs before it can be assembled.
pub fn prerequisites(definition: &Definition) -> Vec<&str> {
  let mut paths: Vec<&str> = definition.build_depends.iter().map(String::as_str).collect();
  paths.extend(definition.member_paths());
  collect_systems(&definition.systems, &mut paths);
  paths
}

pub(crate) fn collect_systems<'a>(systems: &'a [ClusterSystem], out: &mut Vec<&'a str>) {
  for system in systems {
    out.push(&system.path);
    collect_systems(&system.subsystems, out);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::definitions::LoadOptions;
  use crate::util::testutil::write_file;
  use tempfile::TempDir;

  fn load(files: &[(&str, &str)]) -> (TempDir, Definitions) {
    let temp = TempDir::new().unwrap();
    for (path, content) in files {
      write_file(temp.path(), path, content);
    }
    let defs = Definitions::load(temp.path(), LoadOptions::default()).unwrap();
    (temp, defs)
  }

  #[test]
  fn orders_prerequisites_first() {
    let (_temp, defs) = load(&[
      ("a.def", "name: a\nbuild-depends: [b.def]\n"),
      ("b.def", "name: b\nbuild-depends: [c.def]\n"),
      ("c.def", "name: c\n"),
      ("unrelated.def", "name: u\n"),
    ]);

    let graph = DependencyGraph::for_target(&defs, "a.def").unwrap();
    assert_eq!(graph.build_order().unwrap(), vec!["c.def", "b.def", "a.def"]);
    assert_eq!(graph.len(), 3);
  }

  #[test]
  fn cycles_are_fatal() {
    let (_temp, defs) = load(&[
      ("a.def", "name: a\nbuild-depends: [b.def]\n"),
      ("b.def", "name: b\nbuild-depends: [a.def]\n"),
    ]);

    let err = DependencyGraph::for_target(&defs, "a.def").err().unwrap();
    assert!(matches!(err, DefinitionsError::Cycle { .. }));
  }

  #[test]
  fn dangling_references_are_fatal() {
    let (_temp, defs) = load(&[("a.def", "name: a\nbuild-depends: [missing.def]\n")]);

    let err = DependencyGraph::for_target(&defs, "a.def").err().unwrap();
    assert!(matches!(err, DefinitionsError::UnknownReference { .. }));
  }

  #[test]
  fn cluster_systems_are_prerequisites() {
    let (_temp, defs) = load(&[
      (
        "c.def",
        "name: c\nkind: cluster\nsystems:\n- morph: s.def\n  subsystems:\n  - morph: t.def\n",
      ),
      ("s.def", "name: s\nkind: system\n"),
      ("t.def", "name: t\nkind: system\n"),
    ]);

    let graph = DependencyGraph::for_target(&defs, "c.def").unwrap();
    assert_eq!(graph.len(), 3);
    assert_eq!(graph.build_order().unwrap().last().map(String::as_str), Some("c.def"));
  }
}
