//! The run queue.
//!
//! Selects and orders the units a command will touch: the discovered units
//! in scope, expanded with transitive external dependencies (unless
//! `--queue-exclude-external`), minus units removed by their `exclude`
//! blocks. Excluded units never run hooks and never produce outputs; their
//! edges count as satisfied.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use petgraph::graph::NodeIndex;
use tracing::{debug, warn};

use crate::config::{ConfigLoader, PartialConfig};
use crate::discovery;
use crate::error::StratusResult;
use crate::graph::{Polarity, UnitGraph};

#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// The command the queue is built for.
    pub command: String,
    /// Build the queue as if this command were running instead; used by
    /// dry-run discovery commands.
    pub construct_as: Option<String>,
    /// `--queue-exclude-external`: do not pull in units outside the
    /// working-directory scope.
    pub exclude_external: bool,
}

impl QueueOptions {
    /// The command used for ordering and `exclude` evaluation.
    pub fn effective_command(&self) -> &str {
        self.construct_as.as_deref().unwrap_or(&self.command)
    }
}

/// The ordered set of units selected for one command invocation.
pub struct RunQueue {
    pub graph: UnitGraph,
    pub polarity: Polarity,
    /// Units that will run.
    pub scope: BTreeSet<NodeIndex>,
    /// Units pulled in from outside the working-directory scope.
    pub external: BTreeSet<NodeIndex>,
    /// Units removed by their `exclude` block.
    pub excluded: BTreeSet<NodeIndex>,
}

impl RunQueue {
    /// Builds the queue from the discovered units.
    pub fn build(
        discovered: Vec<PartialConfig>,
        opts: &QueueOptions,
        loader: &Arc<ConfigLoader>,
    ) -> StratusResult<Self> {
        let command = opts.effective_command().to_string();
        let polarity = Polarity::for_command(&command);

        let mut units: BTreeMap<PathBuf, PartialConfig> = discovered
            .into_iter()
            .map(|p| (p.unit_dir.clone(), p))
            .collect();
        let in_scope: BTreeSet<PathBuf> = units.keys().cloned().collect();

        // Pull in transitive external dependencies unless excluded. Destroy
        // runs expand dependents instead, and every discoverable dependent
        // is already in scope, so their out-of-scope dependency edges are
        // dropped rather than followed.
        let mut external_dirs = BTreeSet::new();
        if !opts.exclude_external && polarity == Polarity::Forward {
            let mut pending: VecDeque<PathBuf> = units
                .values()
                .flat_map(|p| p.dependency_paths.iter().cloned())
                .collect();
            while let Some(dep) = pending.pop_front() {
                if units.contains_key(&dep) {
                    continue;
                }
                match discovery::discover_single(&dep, loader) {
                    Ok(partial) => {
                        debug!("pulled in external dependency {}", dep.display());
                        pending.extend(partial.dependency_paths.iter().cloned());
                        external_dirs.insert(dep.clone());
                        units.insert(dep, partial);
                    }
                    Err(e) => {
                        // The DAG build reports the dangling edge.
                        warn!("cannot parse external dependency {}: {e}", dep.display());
                    }
                }
            }
        } else {
            // Drop edges pointing outside the scope.
            for partial in units.values_mut() {
                partial
                    .dependency_paths
                    .retain(|dep| in_scope.contains(dep));
            }
        }

        let graph = UnitGraph::build(units.into_values().collect())?;

        let external: BTreeSet<NodeIndex> = external_dirs
            .iter()
            .filter_map(|dir| graph.index_of(dir))
            .collect();

        // Command-level `exclude` evaluation. Directly excluded units stay
        // out regardless; dependencies swept up by exclude_dependencies are
        // put back when a surviving unit still needs them.
        let mut direct = BTreeSet::new();
        let mut swept = BTreeSet::new();
        for (idx, node) in graph.nodes() {
            if let Some(exclude) = &node.partial.exclude {
                if exclude.applies_to(&command) {
                    debug!("unit {} excluded for {command}", node.unit_dir.display());
                    direct.insert(idx);
                    if exclude.exclude_dependencies {
                        let mut seeds = BTreeSet::new();
                        seeds.insert(idx);
                        swept.extend(
                            graph
                                .transitive_closure(&seeds, Polarity::Forward)
                                .into_iter()
                                .filter(|dep| *dep != idx),
                        );
                    }
                }
            }
        }
        swept.retain(|idx| !direct.contains(idx));

        let keep: BTreeSet<NodeIndex> = graph
            .nodes()
            .map(|(idx, _)| idx)
            .filter(|idx| !direct.contains(idx) && !swept.contains(idx))
            .collect();
        let required = graph.transitive_closure(&keep, Polarity::Forward);
        swept.retain(|idx| !required.contains(idx));

        let mut excluded = direct;
        excluded.extend(swept);
        let scope: BTreeSet<NodeIndex> = graph
            .nodes()
            .map(|(idx, _)| idx)
            .filter(|idx| !excluded.contains(idx))
            .collect();

        Ok(Self {
            graph,
            polarity,
            scope,
            external,
            excluded,
        })
    }

    /// Deterministic execution order for the queue's polarity.
    pub fn run_order(&self) -> Vec<NodeIndex> {
        self.graph.topo_order_scoped(self.polarity, &self.scope)
    }

    pub fn len(&self) -> usize {
        self.scope.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scope.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadOptions, SentinelOutputs};
    use std::fs;
    use std::path::Path;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
    }

    fn loader(root: &Path) -> Arc<ConfigLoader> {
        let mut opts = LoadOptions::new(root);
        opts.command = "plan".to_string();
        ConfigLoader::new(opts, Arc::new(SentinelOutputs))
    }

    fn discover_all(root: &Path) -> Vec<PartialConfig> {
        let opts = discovery::DiscoveryOptions {
            working_dir: root.to_path_buf(),
            ..Default::default()
        };
        discovery::discover_units(&opts, &loader(root))
            .unwrap()
            .units
    }

    #[test]
    fn test_chain_order_forward_and_reverse() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a/terragrunt.hcl", "");
        write(
            tmp.path(),
            "b/terragrunt.hcl",
            "dependencies {\n  paths = [\"../a\"]\n}\n",
        );
        write(
            tmp.path(),
            "c/terragrunt.hcl",
            "dependencies {\n  paths = [\"../b\"]\n}\n",
        );

        let opts = QueueOptions {
            command: "apply".to_string(),
            ..Default::default()
        };
        let queue = RunQueue::build(discover_all(tmp.path()), &opts, &loader(tmp.path())).unwrap();
        let order: Vec<String> = queue
            .run_order()
            .into_iter()
            .map(|i| queue.graph.node(i).display_name(tmp.path()))
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        let opts = QueueOptions {
            command: "destroy".to_string(),
            ..Default::default()
        };
        let queue = RunQueue::build(discover_all(tmp.path()), &opts, &loader(tmp.path())).unwrap();
        let order: Vec<String> = queue
            .run_order()
            .into_iter()
            .map(|i| queue.graph.node(i).display_name(tmp.path()))
            .collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_external_dependency_pulled_in() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "shared/vpc/terragrunt.hcl", "");
        write(
            tmp.path(),
            "live/app/terragrunt.hcl",
            "dependencies {\n  paths = [\"../../shared/vpc\"]\n}\n",
        );

        // Discovery scoped to live/ only.
        let live = tmp.path().join("live");
        let discovered = {
            let opts = discovery::DiscoveryOptions {
                working_dir: live.clone(),
                ..Default::default()
            };
            discovery::discover_units(&opts, &loader(&live)).unwrap().units
        };

        let opts = QueueOptions {
            command: "apply".to_string(),
            ..Default::default()
        };
        let queue = RunQueue::build(discovered.clone(), &opts, &loader(&live)).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.external.len(), 1);

        let opts = QueueOptions {
            command: "apply".to_string(),
            exclude_external: true,
            ..Default::default()
        };
        let queue = RunQueue::build(discovered, &opts, &loader(&live)).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_exclude_block_removes_unit() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a/terragrunt.hcl", "");
        write(
            tmp.path(),
            "b/terragrunt.hcl",
            r#"
exclude {
  if      = true
  actions = ["plan"]
}
"#,
        );

        let opts = QueueOptions {
            command: "plan".to_string(),
            ..Default::default()
        };
        let queue = RunQueue::build(discover_all(tmp.path()), &opts, &loader(tmp.path())).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.excluded.len(), 1);

        // A command outside the exclude's actions keeps the unit.
        let opts = QueueOptions {
            command: "apply".to_string(),
            ..Default::default()
        };
        let queue = RunQueue::build(discover_all(tmp.path()), &opts, &loader(tmp.path())).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_construct_as_mode() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "a/terragrunt.hcl",
            r#"
exclude {
  if      = true
  actions = ["destroy"]
}
"#,
        );

        let opts = QueueOptions {
            command: "output".to_string(),
            construct_as: Some("destroy".to_string()),
            ..Default::default()
        };
        let queue = RunQueue::build(discover_all(tmp.path()), &opts, &loader(tmp.path())).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.polarity, Polarity::Reverse);
    }
}
