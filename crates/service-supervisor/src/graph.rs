//! Dependency graph over services
//!
//! Edges are declared on the dependent (`dependencies: [name[:HARD|SOFT]]`)
//! and rebuilt from scratch whenever any `dependencies` leaf changes; readers
//! never observe a half-built graph. The ordered traversal places every
//! dependency before its dependents, with ties broken by name for
//! determinism.

use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Edge semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Dependent cannot run unless the dependency is running or finished;
    /// dependency failures restart the dependent
    Hard,
    /// Start-order hint only; failures do not propagate
    Soft,
}

/// One declared dependency edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    /// The dependency's service name
    pub name: String,
    /// Edge semantics
    pub kind: DependencyKind,
}

impl DependencySpec {
    /// Parse a `name[:HARD|SOFT]` declaration; the kind defaults to HARD
    pub fn parse(text: &str) -> Result<Self> {
        match text.split_once(':') {
            None => Ok(Self {
                name: text.to_string(),
                kind: DependencyKind::Hard,
            }),
            Some((name, "HARD")) => Ok(Self {
                name: name.to_string(),
                kind: DependencyKind::Hard,
            }),
            Some((name, "SOFT")) => Ok(Self {
                name: name.to_string(),
                kind: DependencyKind::Soft,
            }),
            Some((_, kind)) => Err(Error::Config(format!(
                "unknown dependency kind '{}' in '{}'",
                kind, text
            ))),
        }
    }
}

/// Immutable dependency graph over a set of services
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// dependent -> declared dependencies
    edges: BTreeMap<String, Vec<DependencySpec>>,
    /// every service name that appears as a node
    nodes: BTreeSet<String>,
}

impl DependencyGraph {
    /// Build a graph from each service's declared dependencies
    pub fn new(adjacency: BTreeMap<String, Vec<DependencySpec>>) -> Self {
        let mut nodes: BTreeSet<String> = adjacency.keys().cloned().collect();
        for deps in adjacency.values() {
            for dep in deps {
                nodes.insert(dep.name.clone());
            }
        }
        Self {
            edges: adjacency,
            nodes,
        }
    }

    /// All node names
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    /// Declared dependencies of a service
    pub fn dependencies_of(&self, name: &str) -> &[DependencySpec] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Services that depend on `name`, with the edge kind
    pub fn dependents_of(&self, name: &str) -> Vec<(String, DependencyKind)> {
        self.edges
            .iter()
            .filter_map(|(dependent, deps)| {
                deps.iter()
                    .find(|d| d.name == name)
                    .map(|d| (dependent.clone(), d.kind))
            })
            .collect()
    }

    /// Find a dependency cycle, if any, as a path of service names
    ///
    /// Iterative DFS with an explicit stack; the returned path starts and
    /// ends at the same service.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<&str, Color> =
            self.nodes.iter().map(|n| (n.as_str(), Color::White)).collect();

        for start in &self.nodes {
            if color[start.as_str()] != Color::White {
                continue;
            }

            // Stack of (node, next-dependency-index); path mirrors the gray chain.
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            let mut path: Vec<&str> = vec![start.as_str()];
            color.insert(start.as_str(), Color::Gray);

            while let Some((node, index)) = stack.last().copied() {
                let deps = self.dependencies_of(node);
                if index < deps.len() {
                    if let Some(last) = stack.last_mut() {
                        last.1 += 1;
                    }
                    let next = deps[index].name.as_str();
                    match color.get(next).copied().unwrap_or(Color::Black) {
                        Color::Gray => {
                            let mut cycle: Vec<String> = path
                                .iter()
                                .skip_while(|n| **n != next)
                                .map(|n| n.to_string())
                                .collect();
                            cycle.push(next.to_string());
                            return Some(cycle);
                        }
                        Color::White => {
                            color.insert(next, Color::Gray);
                            stack.push((next, 0));
                            path.push(next);
                        }
                        Color::Black => {}
                    }
                } else {
                    color.insert(node, Color::Black);
                    stack.pop();
                    path.pop();
                }
            }
        }
        None
    }

    /// Execution order: every dependency before its dependents
    ///
    /// Ties broken by service name ascending. Startup walks the result
    /// forward; shutdown walks it in reverse. Fails with
    /// [`Error::CyclicDependency`] when the graph has a cycle.
    pub fn ordered_services(&self) -> Result<Vec<String>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(Error::CyclicDependency(cycle.join(" -> ")));
        }

        // Kahn's algorithm with a sorted ready set for determinism.
        let mut blocking: HashMap<&str, HashSet<&str>> = HashMap::new();
        for node in &self.nodes {
            let deps: HashSet<&str> = self
                .dependencies_of(node)
                .iter()
                .filter(|d| self.nodes.contains(&d.name))
                .map(|d| d.name.as_str())
                .collect();
            blocking.insert(node.as_str(), deps);
        }

        let mut ready: BTreeSet<&str> = blocking
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.iter().next().copied() {
            ready.remove(node);
            order.push(node.to_string());

            for (dependent, deps) in blocking.iter_mut() {
                if deps.remove(node) && deps.is_empty() {
                    ready.insert(*dependent);
                }
            }
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        let adjacency = edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| DependencySpec::parse(d).unwrap()).collect(),
                )
            })
            .collect();
        DependencyGraph::new(adjacency)
    }

    #[test]
    fn test_parse_dependency_spec() {
        assert_eq!(
            DependencySpec::parse("svcA").unwrap(),
            DependencySpec {
                name: "svcA".to_string(),
                kind: DependencyKind::Hard
            }
        );
        assert_eq!(
            DependencySpec::parse("svcB:SOFT").unwrap().kind,
            DependencyKind::Soft
        );
        assert_eq!(
            DependencySpec::parse("svcB:HARD").unwrap().kind,
            DependencyKind::Hard
        );
        assert!(DependencySpec::parse("svcB:WEIRD").is_err());
    }

    #[test]
    fn test_ordered_services_respects_edges() {
        let g = graph(&[
            ("main", &["svcA", "svcB:SOFT"]),
            ("svcA", &["svcB"]),
            ("svcB", &[]),
        ]);
        let order = g.ordered_services().unwrap();
        assert_eq!(order, vec!["svcB", "svcA", "main"]);
    }

    #[test]
    fn test_ordered_services_name_tiebreak() {
        let g = graph(&[("zeta", &[]), ("alpha", &[]), ("mid", &[])]);
        assert_eq!(g.ordered_services().unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_undeclared_dependency_becomes_node() {
        let g = graph(&[("main", &["ghost"])]);
        let order = g.ordered_services().unwrap();
        assert_eq!(order, vec!["ghost", "main"]);
    }

    #[test]
    fn test_cycle_detection() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let cycle = g.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.len() == 4);

        match g.ordered_services() {
            Err(Error::CyclicDependency(text)) => {
                assert!(text.contains("->"));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_cycle() {
        let g = graph(&[("a", &["a"])]);
        assert!(g.find_cycle().is_some());
    }

    #[test]
    fn test_dependents_of() {
        let g = graph(&[("main", &["svcA:SOFT"]), ("svcA", &["svcB"]), ("svcB", &[])]);
        let dependents = g.dependents_of("svcA");
        assert_eq!(dependents, vec![("main".to_string(), DependencyKind::Soft)]);
        assert_eq!(g.dependents_of("svcB").len(), 1);
        assert!(g.dependents_of("main").is_empty());
    }
}
