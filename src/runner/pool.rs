//! Bounded-parallel execution over the run queue.
//!
//! The pool dispatches units as their predecessors reach a terminal
//! unblocking state, capped by a semaphore. A failed unit blocks its
//! dependents (unless `--queue-ignore-errors`), while independent branches
//! keep running; units that never become dispatchable end the run as
//! `cancelled`. The final report lists every unit in topological order
//! regardless of how execution interleaved.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use petgraph::graph::NodeIndex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::auth::AuthResolver;
use crate::error::StratusResult;
use crate::fetch::SourceFetcher;
use crate::outmux::OutMux;
use crate::queue::RunQueue;
use crate::report::{Reporter, RunReport, UnitReport, UnitState};

use super::unit::{RunOptions, UnitOutcome, UnitRunner};

#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    /// Maximum concurrent units. `None` means no limit.
    pub max_parallel: Option<usize>,
    /// `--queue-ignore-errors`: failed units still unblock dependents.
    pub ignore_errors: bool,
}

/// Executes a run queue.
pub struct RunnerPool {
    opts: PoolOptions,
    run_opts: Arc<RunOptions>,
    mux: Arc<OutMux>,
    fetcher: Arc<SourceFetcher>,
    auth: Arc<AuthResolver>,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
}

impl RunnerPool {
    pub fn new(
        opts: PoolOptions,
        run_opts: Arc<RunOptions>,
        mux: Arc<OutMux>,
        fetcher: Arc<SourceFetcher>,
        auth: Arc<AuthResolver>,
        reporter: Arc<dyn Reporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            opts,
            run_opts,
            mux,
            fetcher,
            auth,
            reporter,
            cancel,
        }
    }

    pub async fn run(&self, queue: &RunQueue) -> RunReport {
        let start = Instant::now();
        let run_root = self.run_opts.working_dir.clone();

        let mut states: HashMap<NodeIndex, UnitState> = HashMap::new();
        let mut errors: HashMap<NodeIndex, (String, String)> = HashMap::new();

        // Excluded units are terminal from the start and unblock their
        // dependents.
        let mut unblocking: BTreeSet<NodeIndex> = queue.excluded.clone();
        for &idx in &queue.excluded {
            states.insert(idx, UnitState::Excluded);
        }

        let permits = self
            .opts
            .max_parallel
            .unwrap_or(Semaphore::MAX_PERMITS)
            .min(Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(permits));

        self.reporter.on_queue_built(queue.len()).await;

        let mut started: BTreeSet<NodeIndex> = BTreeSet::new();
        let mut join_set: JoinSet<(NodeIndex, StratusResult<UnitOutcome>)> = JoinSet::new();

        loop {
            if !self.cancel.is_cancelled() {
                let ready =
                    queue
                        .graph
                        .ready_set(queue.polarity, &queue.scope, &unblocking, &started);
                for idx in ready {
                    started.insert(idx);
                    states.insert(idx, UnitState::Running);
                    let node = queue.graph.node(idx);
                    let name = node.display_name(&run_root);
                    debug!("dispatching {name}");
                    self.reporter.on_unit_start(&name).await;

                    let config_path = node.config_path.clone();
                    let semaphore = semaphore.clone();
                    let run_opts = self.run_opts.clone();
                    let mux = self.mux.clone();
                    let fetcher = self.fetcher.clone();
                    let auth = self.auth.clone();
                    let cancel = self.cancel.clone();
                    join_set.spawn(async move {
                        let permit = semaphore.acquire_owned().await.ok();
                        if permit.is_none() || cancel.is_cancelled() {
                            return (idx, Err(crate::error::StratusError::Cancelled));
                        }
                        let runner =
                            UnitRunner::new(&config_path, run_opts, mux, fetcher, auth, cancel);
                        (idx, runner.run().await)
                    });
                }
            }

            let joined = match join_set.join_next().await {
                Some(joined) => joined,
                // Nothing in flight and nothing became ready: every
                // remaining unit is permanently blocked.
                None => break,
            };

            match joined {
                Ok((idx, result)) => {
                    let name = queue.graph.node(idx).display_name(&run_root);
                    let state = match result {
                        Ok(UnitOutcome::Succeeded) => {
                            unblocking.insert(idx);
                            UnitState::Succeeded
                        }
                        Ok(UnitOutcome::Excluded) => {
                            unblocking.insert(idx);
                            UnitState::Excluded
                        }
                        Err(e) if e.kind() == crate::error::ErrorKind::Cancelled => {
                            UnitState::Cancelled
                        }
                        Err(e) => {
                            if e.kind().is_fatal() {
                                self.cancel.cancel();
                            }
                            if self.opts.ignore_errors {
                                unblocking.insert(idx);
                            }
                            errors.insert(idx, (e.kind().as_str().to_string(), e.to_string()));
                            UnitState::Failed
                        }
                    };
                    states.insert(idx, state);
                    self.reporter.on_unit_complete(&name, state).await;
                }
                Err(e) => {
                    error!("unit task failed to join: {e}");
                }
            }
        }

        // Units that never got dispatched (blocked by a failure, or the
        // run was cancelled) are terminal as cancelled.
        for &idx in &queue.scope {
            let entry = states.entry(idx).or_insert(UnitState::Cancelled);
            if !entry.is_terminal() {
                *entry = UnitState::Cancelled;
            }
        }

        let mut all: BTreeSet<NodeIndex> = queue.scope.clone();
        all.extend(queue.excluded.iter().copied());
        let entries = queue
            .graph
            .topo_order_scoped(queue.polarity, &all)
            .into_iter()
            .map(|idx| UnitReport {
                name: queue.graph.node(idx).display_name(&run_root),
                state: states.get(&idx).copied().unwrap_or(UnitState::Cancelled),
                error: errors.remove(&idx),
            })
            .collect();

        let report = RunReport {
            entries,
            duration: start.elapsed(),
        };
        self.reporter.on_run_complete(&report).await;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLoader, LoadOptions, SentinelOutputs};
    use crate::discovery::{discover_units, DiscoveryOptions};
    use crate::outmux::LogFormat;
    use crate::queue::QueueOptions;
    use crate::report::NullReporter;
    use std::fs;
    use std::path::Path;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
    }

    fn build_queue(root: &Path, command: &str) -> RunQueue {
        let mut load_opts = LoadOptions::new(root);
        load_opts.command = command.to_string();
        let loader = ConfigLoader::new(load_opts, Arc::new(SentinelOutputs));
        let discovered = discover_units(
            &DiscoveryOptions {
                working_dir: root.to_path_buf(),
                ..Default::default()
            },
            &loader,
        )
        .unwrap();
        RunQueue::build(
            discovered.units,
            &QueueOptions {
                command: command.to_string(),
                ..Default::default()
            },
            &loader,
        )
        .unwrap()
    }

    fn pool(root: &Path, command: &str, max_parallel: Option<usize>, ignore: bool) -> RunnerPool {
        let mut run_opts = RunOptions::new(root, command);
        // `true` stands in for the IaC binary: every invocation succeeds.
        run_opts.tf_path = "true".to_string();
        run_opts.non_interactive = true;
        RunnerPool::new(
            PoolOptions {
                max_parallel,
                ignore_errors: ignore,
            },
            Arc::new(run_opts),
            Arc::new(OutMux::with_sink(
                LogFormat::Bare,
                root,
                Box::new(std::io::sink()),
            )),
            Arc::new(SourceFetcher::new(&root.join(".terragrunt-cache"))),
            Arc::new(AuthResolver::new()),
            Arc::new(NullReporter),
            CancellationToken::new(),
        )
    }

    fn chain(root: &Path) {
        write(root, "a/terragrunt.hcl", "");
        write(
            root,
            "b/terragrunt.hcl",
            "dependencies {\n  paths = [\"../a\"]\n}\n",
        );
        write(
            root,
            "c/terragrunt.hcl",
            "dependencies {\n  paths = [\"../b\"]\n}\n",
        );
    }

    #[tokio::test]
    async fn test_chain_runs_in_order_and_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        chain(tmp.path());
        let queue = build_queue(tmp.path(), "apply");
        let report = pool(tmp.path(), "apply", Some(1), false).run(&queue).await;

        assert!(report.success());
        let names: Vec<&str> = report.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(report
            .entries
            .iter()
            .all(|e| e.state == UnitState::Succeeded));
    }

    #[tokio::test]
    async fn test_destroy_reports_reverse_order() {
        let tmp = tempfile::tempdir().unwrap();
        chain(tmp.path());
        let queue = build_queue(tmp.path(), "destroy");
        let report = pool(tmp.path(), "destroy", Some(1), false).run(&queue).await;

        let names: Vec<&str> = report.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_failed_unit_cancels_dependents_only() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a/terragrunt.hcl", "");
        // b fails via a failing before-hook; c depends on b, d is
        // independent.
        write(
            tmp.path(),
            "b/terragrunt.hcl",
            r#"
dependencies {
  paths = ["../a"]
}

terraform {
  before_hook "boom" {
    commands = ["apply"]
    execute  = ["false"]
  }
}
"#,
        );
        write(
            tmp.path(),
            "c/terragrunt.hcl",
            "dependencies {\n  paths = [\"../b\"]\n}\n",
        );
        write(tmp.path(), "d/terragrunt.hcl", "");

        let queue = build_queue(tmp.path(), "apply");
        let report = pool(tmp.path(), "apply", Some(1), false).run(&queue).await;

        let state_of = |name: &str| {
            report
                .entries
                .iter()
                .find(|e| e.name == name)
                .map(|e| e.state)
                .unwrap()
        };
        assert_eq!(state_of("a"), UnitState::Succeeded);
        assert_eq!(state_of("b"), UnitState::Failed);
        assert_eq!(state_of("c"), UnitState::Cancelled);
        assert_eq!(state_of("d"), UnitState::Succeeded);
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_ignore_errors_dispatches_dependents() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "b/terragrunt.hcl",
            r#"
terraform {
  before_hook "boom" {
    commands = ["apply"]
    execute  = ["false"]
  }
}
"#,
        );
        write(
            tmp.path(),
            "c/terragrunt.hcl",
            "dependencies {\n  paths = [\"../b\"]\n}\n",
        );

        let queue = build_queue(tmp.path(), "apply");
        let report = pool(tmp.path(), "apply", Some(1), true).run(&queue).await;

        let state_of = |name: &str| {
            report
                .entries
                .iter()
                .find(|e| e.name == name)
                .map(|e| e.state)
                .unwrap()
        };
        assert_eq!(state_of("b"), UnitState::Failed);
        assert_eq!(state_of("c"), UnitState::Succeeded);
    }

    #[tokio::test]
    async fn test_excluded_units_unblock_dependents() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "a/terragrunt.hcl",
            r#"
exclude {
  if      = true
  actions = ["apply"]
}
"#,
        );
        write(
            tmp.path(),
            "b/terragrunt.hcl",
            "dependencies {\n  paths = [\"../a\"]\n}\n",
        );

        let queue = build_queue(tmp.path(), "apply");
        let report = pool(tmp.path(), "apply", None, false).run(&queue).await;

        let state_of = |name: &str| {
            report
                .entries
                .iter()
                .find(|e| e.name == name)
                .map(|e| e.state)
                .unwrap()
        };
        assert_eq!(state_of("a"), UnitState::Excluded);
        assert_eq!(state_of("b"), UnitState::Succeeded);
        assert!(report.success());
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_dispatches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        chain(tmp.path());
        let queue = build_queue(tmp.path(), "apply");

        let runner_pool = pool(tmp.path(), "apply", None, false);
        runner_pool.cancel.cancel();
        let report = runner_pool.run(&queue).await;

        assert!(report
            .entries
            .iter()
            .all(|e| e.state == UnitState::Cancelled));
    }
}
