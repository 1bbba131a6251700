use crate::manifest::Manifest;
use std::collections::{HashMap, HashSet};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DagError {
    #[error("step '{0}' is listed as a dependency but is not defined")]
    StepNotFound(String),

    #[error("step '{0}' is declared more than once")]
    StepExists(String),

    #[error("dependency from '{0}' to '{1}' would create a cycle")]
    EdgeCreatesCycle(String, String),

    #[error("unknown step '{0}' in requested step selection")]
    UnknownSelection(String),
}

#[derive(Debug, Default)]
struct Node {
    /// Steps that must run after this one.
    edges: Vec<String>,
}

/// A dependency graph over step names. Edges run from prerequisite to
/// dependent; inserting an edge that would close a cycle is refused.
#[derive(Debug, Default)]
pub struct Dag {
    nodes: HashMap<String, Node>,
    /// Declaration order, used as the tie break between ready steps.
    order: Vec<String>,
}

impl Dag {
    pub fn new() -> Self {
        Dag::default()
    }

    pub fn add_node(&mut self, id: &str) -> Result<(), DagError> {
        if self.nodes.contains_key(id) {
            return Err(DagError::StepExists(id.to_string()));
        }
        self.nodes.insert(id.to_string(), Node::default());
        self.order.push(id.to_string());
        Ok(())
    }

    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), DagError> {
        if !self.nodes.contains_key(from) {
            return Err(DagError::StepNotFound(from.to_string()));
        }
        if !self.nodes.contains_key(to) {
            return Err(DagError::StepNotFound(to.to_string()));
        }

        if self.is_cyclic(from, to) {
            return Err(DagError::EdgeCreatesCycle(from.to_string(), to.to_string()));
        }

        let node = self.nodes.get_mut(from).unwrap();
        if !node.edges.iter().any(|edge| edge == to) {
            node.edges.push(to.to_string());
        }

        Ok(())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Check whether connecting node1 -> node2 would become cyclical by
    /// looking for node1 among everything reachable from node2.
    fn is_cyclic(&self, node1: &str, node2: &str) -> bool {
        if node1 == node2 {
            return true;
        }

        let Some(node) = self.nodes.get(node2) else {
            return false;
        };

        for edge in &node.edges {
            if node1 == edge || self.is_cyclic(node1, edge) {
                return true;
            }
        }

        false
    }

    /// Produce a total order honoring every edge. Between ready steps the
    /// declaration order decides, so the result is stable for a given
    /// manifest.
    pub fn topological_order(&self) -> Vec<String> {
        let mut indegree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|name| (name.as_str(), 0))
            .collect();

        for node in self.nodes.values() {
            for edge in &node.edges {
                *indegree.get_mut(edge.as_str()).unwrap() += 1;
            }
        }

        let mut sorted = Vec::with_capacity(self.order.len());
        let mut remaining: Vec<&String> = self.order.iter().collect();

        while !remaining.is_empty() {
            // The declaration-ordered scan makes the tie break implicit.
            let position = remaining
                .iter()
                .position(|name| indegree[name.as_str()] == 0)
                .expect("edge insertion refuses cycles, a ready node always exists");

            let name = remaining.remove(position);
            for edge in &self.nodes[name.as_str()].edges {
                *indegree.get_mut(edge.as_str()).unwrap() -= 1;
            }
            sorted.push(name.clone());
        }

        sorted
    }
}

/// Build the step graph for a manifest: explicit `depends` edges plus
/// implicit edges from image references, then emit the execution order,
/// optionally restricted to a user selected subset.
pub fn execution_order(
    manifest: &Manifest,
    selection: &[String],
) -> Result<Vec<String>, DagError> {
    let mut dag = Dag::new();

    for name in manifest.steps.keys() {
        dag.add_node(name)?;
    }

    // Explicit dependencies. Version gating happened at manifest validation.
    for (name, step) in manifest.steps.iter() {
        if let Some(depends) = &step.depends {
            for dependency in depends {
                if !dag.exists(dependency) {
                    return Err(DagError::StepNotFound(dependency.clone()));
                }
                dag.add_edge(dependency, name)?;
            }
        }
    }

    // Implicit dependencies: a step consuming an image that an earlier
    // declared step commits or pushes runs after its producer.
    let mut producers: HashMap<String, (usize, String)> = HashMap::new();
    for (position, (name, step)) in manifest.steps.iter().enumerate() {
        for repo in step.produced_repositories() {
            producers
                .entry(repo.to_string())
                .or_insert((position, name.clone()));
        }
    }

    for (position, (name, step)) in manifest.steps.iter().enumerate() {
        for image in step.referenced_images() {
            let repo = strip_tag(&image);
            if let Some((producer_position, producer)) = producers.get(repo) {
                if producer != name && *producer_position < position {
                    dag.add_edge(producer, name)?;
                }
            }
        }
    }

    let order = dag.topological_order();

    if selection.is_empty() {
        return Ok(order);
    }

    for name in selection {
        if !dag.exists(name) {
            return Err(DagError::UnknownSelection(name.clone()));
        }
    }

    // Keep only the selected steps. Unselected steps and anything only
    // reachable through them simply fall out of the schedule.
    let selected: HashSet<&str> = selection.iter().map(|s| s.as_str()).collect();
    Ok(order
        .into_iter()
        .filter(|name| selected.contains(name.as_str()))
        .collect())
}

fn strip_tag(image: &str) -> &str {
    match image.rfind(':') {
        Some(index) if !image[index + 1..].contains('/') => &image[..index],
        _ => image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    fn manifest(yaml: &str) -> Manifest {
        Manifest::from_str(yaml).unwrap()
    }

    #[test]
    fn declaration_order_without_edges() {
        let manifest = manifest(
            r#"
steps:
  c: {run: {image: busybox, cmd: "true"}}
  a: {run: {image: busybox, cmd: "true"}}
  b: {run: {image: busybox, cmd: "true"}}
"#,
        );
        let order = execution_order(&manifest, &[]).unwrap();
        assert_eq!(order, ["c", "a", "b"]);
    }

    #[test]
    fn depends_edges_are_honored() {
        let manifest = manifest(
            r#"
version: 2.0
steps:
  b:
    depends: [a, c]
    run: {image: busybox, cmd: "true"}
  a: {run: {image: busybox, cmd: "true"}}
  c: {run: {image: busybox, cmd: "true"}}
"#,
        );
        let order = execution_order(&manifest, &[]).unwrap();
        let pos =
            |name: &str| order.iter().position(|step| step == name).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("c") < pos("b"));
    }

    #[test]
    fn cycle_is_refused_naming_a_step() {
        let manifest = manifest(
            r#"
version: 2.0
steps:
  a:
    depends: [b]
    run: {image: busybox, cmd: "true"}
  b:
    depends: [a]
    run: {image: busybox, cmd: "true"}
"#,
        );
        let err = execution_order(&manifest, &[]).unwrap_err();
        match err {
            DagError::EdgeCreatesCycle(from, to) => {
                assert!([from.as_str(), to.as_str()].contains(&"a"));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn missing_depends_target_is_fatal() {
        let manifest = manifest(
            r#"
version: 2.0
steps:
  a:
    depends: [ghost]
    run: {image: busybox, cmd: "true"}
"#,
        );
        let err = execution_order(&manifest, &[]).unwrap_err();
        assert_eq!(err, DagError::StepNotFound("ghost".to_string()));
    }

    #[test]
    fn implicit_edge_from_committed_image() {
        let manifest = manifest(
            r#"
steps:
  tester:
    run:
      image: myorg/base-test
      cmd: make test
  base:
    build:
      dockerfile: |
        FROM scratch
    commit: myorg/base-test
"#,
        );
        // "base" is declared after "tester", so the reference looks forward
        // in the file and no edge is added; order stays declaration order.
        let order = execution_order(&manifest, &[]).unwrap();
        assert_eq!(order, ["tester", "base"]);

        let manifest = manifest_reordered();
        let order = execution_order(&manifest, &[]).unwrap();
        assert_eq!(order, ["base", "tester"]);
    }

    fn manifest_reordered() -> Manifest {
        manifest(
            r#"
steps:
  base:
    build:
      dockerfile: |
        FROM scratch
    commit: myorg/base-test
  tester:
    run:
      image: myorg/base-test:latest
      cmd: make test
"#,
        )
    }

    #[test]
    fn subset_preserves_order_and_prunes() {
        let manifest = manifest(
            r#"
version: 2.0
steps:
  a: {run: {image: busybox, cmd: "true"}}
  b:
    depends: [a]
    run: {image: busybox, cmd: "true"}
  c: {run: {image: busybox, cmd: "true"}}
"#,
        );

        let order =
            execution_order(&manifest, &["c".to_string(), "a".to_string()]).unwrap();
        assert_eq!(order, ["a", "c"]);

        let err = execution_order(&manifest, &["nope".to_string()]).unwrap_err();
        assert_eq!(err, DagError::UnknownSelection("nope".to_string()));
    }

    #[test]
    fn diamond_order_is_stable() {
        let manifest = manifest(
            r#"
version: 2.0
steps:
  root: {run: {image: busybox, cmd: "true"}}
  left:
    depends: [root]
    run: {image: busybox, cmd: "true"}
  right:
    depends: [root]
    run: {image: busybox, cmd: "true"}
  join:
    depends: [left, right]
    run: {image: busybox, cmd: "true"}
"#,
        );
        let order = execution_order(&manifest, &[]).unwrap();
        assert_eq!(order, ["root", "left", "right", "join"]);
    }

    #[test]
    fn strip_tag_handles_registries() {
        assert_eq!(strip_tag("myorg/app:stable"), "myorg/app");
        assert_eq!(strip_tag("myorg/app"), "myorg/app");
        assert_eq!(
            strip_tag("registry.example.com:5000/myorg/app"),
            "registry.example.com:5000/myorg/app"
        );
    }
}
