//! The unit dependency graph.
//!
//! Built from partial-parse results during discovery. Nodes are units,
//! an edge u → v means "u depends on v". Both traversal polarities are
//! cheap because petgraph keeps forward and reverse adjacency; every
//! iteration order is tie-broken lexicographically on the unit path so
//! scheduling traces are deterministic at parallelism 1.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::config::PartialConfig;
use crate::error::{StratusError, StratusResult};

/// Execution polarity for a command class.
///
/// Create/update commands run dependencies first; destroy commands run
/// dependents first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Forward,
    Reverse,
}

impl Polarity {
    /// Polarity for an external subcommand.
    pub fn for_command(command: &str) -> Self {
        match command {
            "destroy" => Self::Reverse,
            _ => Self::Forward,
        }
    }
}

/// One unit in the graph.
#[derive(Debug, Clone)]
pub struct UnitNode {
    pub unit_dir: PathBuf,
    pub config_path: PathBuf,
    pub partial: PartialConfig,
}

impl UnitNode {
    /// Unit identifier used in logs and reports: the path relative to the
    /// run root, or the absolute path for units outside it.
    pub fn display_name(&self, run_root: &Path) -> String {
        self.unit_dir
            .strip_prefix(run_root)
            .unwrap_or(&self.unit_dir)
            .display()
            .to_string()
    }
}

/// The DAG over discovered units.
#[derive(Debug)]
pub struct UnitGraph {
    graph: DiGraph<usize, ()>,
    nodes: Vec<UnitNode>,
    index: BTreeMap<PathBuf, NodeIndex>,
}

impl UnitGraph {
    /// Builds the graph from partial parses, merging duplicate edges and
    /// rejecting cycles and dangling dependency paths.
    pub fn build(partials: Vec<PartialConfig>) -> StratusResult<Self> {
        let mut graph = DiGraph::new();
        let mut nodes = Vec::new();
        let mut index = BTreeMap::new();

        for partial in partials {
            let node = UnitNode {
                unit_dir: partial.unit_dir.clone(),
                config_path: partial.config_path.clone(),
                partial,
            };
            let idx = graph.add_node(nodes.len());
            index.insert(node.unit_dir.clone(), idx);
            nodes.push(node);
        }

        for (dir, &idx) in &index {
            let deps = nodes[graph[idx]].partial.dependency_paths.clone();
            for dep in deps {
                let dep_idx = index.get(&dep).copied().ok_or_else(|| {
                    StratusError::eval(
                        nodes[graph[idx]].config_path.clone(),
                        format!(
                            "dependency path {} of unit {} does not resolve to a unit",
                            dep.display(),
                            dir.display()
                        ),
                    )
                })?;
                if idx != dep_idx && graph.find_edge(idx, dep_idx).is_none() {
                    graph.add_edge(idx, dep_idx, ());
                }
            }
        }

        let built = Self {
            graph,
            nodes,
            index,
        };
        built.check_acyclic()?;
        Ok(built)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: NodeIndex) -> &UnitNode {
        &self.nodes[self.graph[idx]]
    }

    pub fn index_of(&self, unit_dir: &Path) -> Option<NodeIndex> {
        self.index.get(unit_dir).copied()
    }

    /// All nodes in lexicographic unit-path order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &UnitNode)> + '_ {
        self.index.values().map(move |&idx| (idx, self.node(idx)))
    }

    /// Units this unit depends on.
    pub fn dependencies_of(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.sorted_neighbors(idx, Direction::Outgoing)
    }

    /// Units depending on this unit.
    pub fn dependents_of(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.sorted_neighbors(idx, Direction::Incoming)
    }

    /// Predecessors per polarity: the units that must reach a terminal
    /// state before `idx` may start.
    pub fn predecessors(&self, idx: NodeIndex, polarity: Polarity) -> Vec<NodeIndex> {
        match polarity {
            Polarity::Forward => self.dependencies_of(idx),
            Polarity::Reverse => self.dependents_of(idx),
        }
    }

    /// Successors per polarity: the units unblocked when `idx` terminates.
    pub fn successors(&self, idx: NodeIndex, polarity: Polarity) -> Vec<NodeIndex> {
        match polarity {
            Polarity::Forward => self.dependents_of(idx),
            Polarity::Reverse => self.dependencies_of(idx),
        }
    }

    /// Units from `scope` whose predecessors (within `scope`) are all in
    /// `complete`, excluding units already in `complete` or `started`.
    /// Results are in lexicographic order.
    pub fn ready_set(
        &self,
        polarity: Polarity,
        scope: &BTreeSet<NodeIndex>,
        complete: &BTreeSet<NodeIndex>,
        started: &BTreeSet<NodeIndex>,
    ) -> Vec<NodeIndex> {
        let mut ready: Vec<NodeIndex> = scope
            .iter()
            .copied()
            .filter(|idx| !complete.contains(idx) && !started.contains(idx))
            .filter(|&idx| {
                self.predecessors(idx, polarity)
                    .iter()
                    .filter(|p| scope.contains(p))
                    .all(|p| complete.contains(p))
            })
            .collect();
        ready.sort_by(|a, b| self.node(*a).unit_dir.cmp(&self.node(*b).unit_dir));
        ready
    }

    /// Deterministic topological order for the polarity: Kahn's algorithm
    /// with a lexicographic ready set.
    pub fn topo_order(&self, polarity: Polarity) -> Vec<NodeIndex> {
        let scope: BTreeSet<NodeIndex> = self.graph.node_indices().collect();
        self.topo_order_scoped(polarity, &scope)
    }

    /// Topological order restricted to `scope`.
    pub fn topo_order_scoped(
        &self,
        polarity: Polarity,
        scope: &BTreeSet<NodeIndex>,
    ) -> Vec<NodeIndex> {
        let mut complete = BTreeSet::new();
        let mut order = Vec::with_capacity(scope.len());
        while complete.len() < scope.len() {
            let ready = self.ready_set(polarity, scope, &complete, &BTreeSet::new());
            if ready.is_empty() {
                break;
            }
            for idx in ready {
                order.push(idx);
                complete.insert(idx);
            }
        }
        order
    }

    /// Expands `seeds` with every transitive dependency (Forward) or
    /// dependent (Reverse).
    pub fn transitive_closure(
        &self,
        seeds: &BTreeSet<NodeIndex>,
        polarity: Polarity,
    ) -> BTreeSet<NodeIndex> {
        let mut out = seeds.clone();
        let mut queue: VecDeque<NodeIndex> = seeds.iter().copied().collect();
        while let Some(idx) = queue.pop_front() {
            for next in self.predecessors(idx, polarity) {
                if out.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        out
    }

    /// DOT rendering for `dag graph`.
    pub fn to_dot(&self, run_root: &Path) -> String {
        let mut out = String::from("digraph {\n");
        for (_, node) in self.nodes() {
            out.push_str(&format!("\t\"{}\" ;\n", node.display_name(run_root)));
        }
        for edge in self.graph.edge_indices() {
            if let Some((from, to)) = self.graph.edge_endpoints(edge) {
                out.push_str(&format!(
                    "\t\"{}\" -> \"{}\";\n",
                    self.node(from).display_name(run_root),
                    self.node(to).display_name(run_root)
                ));
            }
        }
        out.push_str("}\n");
        out
    }

    fn sorted_neighbors(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> =
            self.graph.neighbors_directed(idx, direction).collect();
        neighbors.sort_by(|a, b| self.node(*a).unit_dir.cmp(&self.node(*b).unit_dir));
        neighbors
    }

    /// Rejects cycles, reporting every unit on the first cycle found.
    fn check_acyclic(&self) -> StratusResult<()> {
        for scc in petgraph::algo::tarjan_scc(&self.graph) {
            let cyclic = scc.len() > 1
                || (scc.len() == 1 && self.graph.find_edge(scc[0], scc[0]).is_some());
            if cyclic {
                let mut chain: Vec<String> = scc
                    .iter()
                    .map(|&idx| self.node(idx).unit_dir.display().to_string())
                    .collect();
                chain.sort();
                let first = chain.first().cloned();
                chain.extend(first);
                return Err(StratusError::Cycle { chain });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn partial(dir: &str, deps: &[&str]) -> PartialConfig {
        PartialConfig {
            config_path: PathBuf::from(format!("{dir}/terragrunt.hcl")),
            unit_dir: PathBuf::from(dir),
            dependency_paths: deps.iter().map(PathBuf::from).collect(),
            include_paths: Vec::new(),
            source: None,
            exclude: None,
        }
    }

    fn chain_graph() -> UnitGraph {
        // c -> b -> a
        UnitGraph::build(vec![
            partial("/repo/a", &[]),
            partial("/repo/b", &["/repo/a"]),
            partial("/repo/c", &["/repo/b"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_forward_topo_order() {
        let graph = chain_graph();
        let order: Vec<String> = graph
            .topo_order(Polarity::Forward)
            .into_iter()
            .map(|i| graph.node(i).unit_dir.display().to_string())
            .collect();
        assert_eq!(order, vec!["/repo/a", "/repo/b", "/repo/c"]);
    }

    #[test]
    fn test_reverse_topo_order() {
        let graph = chain_graph();
        let order: Vec<String> = graph
            .topo_order(Polarity::Reverse)
            .into_iter()
            .map(|i| graph.node(i).unit_dir.display().to_string())
            .collect();
        assert_eq!(order, vec!["/repo/c", "/repo/b", "/repo/a"]);
    }

    #[test]
    fn test_cycle_detection_reports_members() {
        let err = UnitGraph::build(vec![
            partial("/repo/a", &["/repo/b"]),
            partial("/repo/b", &["/repo/a"]),
        ])
        .unwrap_err();
        match err {
            StratusError::Cycle { chain } => {
                assert!(chain.contains(&"/repo/a".to_string()));
                assert!(chain.contains(&"/repo/b".to_string()));
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let err = UnitGraph::build(vec![partial("/repo/a", &["/repo/missing"])]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigEval);
    }

    #[test]
    fn test_duplicate_edges_merged() {
        let mut p = partial("/repo/b", &["/repo/a"]);
        p.dependency_paths.insert(PathBuf::from("/repo/a"));
        let graph = UnitGraph::build(vec![partial("/repo/a", &[]), p]).unwrap();
        let b = graph.index_of(Path::new("/repo/b")).unwrap();
        assert_eq!(graph.dependencies_of(b).len(), 1);
    }

    #[test]
    fn test_ready_set_respects_predecessors() {
        let graph = chain_graph();
        let scope: BTreeSet<_> = graph.nodes().map(|(i, _)| i).collect();
        let a = graph.index_of(Path::new("/repo/a")).unwrap();
        let b = graph.index_of(Path::new("/repo/b")).unwrap();

        let ready = graph.ready_set(
            Polarity::Forward,
            &scope,
            &BTreeSet::new(),
            &BTreeSet::new(),
        );
        assert_eq!(ready, vec![a]);

        let mut complete = BTreeSet::new();
        complete.insert(a);
        let ready = graph.ready_set(Polarity::Forward, &scope, &complete, &BTreeSet::new());
        assert_eq!(ready, vec![b]);
    }

    #[test]
    fn test_transitive_closure() {
        let graph = chain_graph();
        let c = graph.index_of(Path::new("/repo/c")).unwrap();
        let mut seeds = BTreeSet::new();
        seeds.insert(c);
        let closure = graph.transitive_closure(&seeds, Polarity::Forward);
        assert_eq!(closure.len(), 3);
    }
}
