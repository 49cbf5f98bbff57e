//! Run reporting.
//!
//! Reporters receive events as units start and finish; the final report
//! lists every unit in topological order with its terminal state, no
//! matter how execution interleaved.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use console::style;

/// Terminal (and transient) states of a unit in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Excluded,
    Cancelled,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether this terminal state unblocks dependents.
    pub fn unblocks_dependents(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Excluded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Excluded => "excluded",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One unit's line in the end-of-run summary.
#[derive(Debug, Clone)]
pub struct UnitReport {
    /// Unit identifier: path relative to the run root.
    pub name: String,
    pub state: UnitState,
    /// Error kind and one-line summary for failed units.
    pub error: Option<(String, String)>,
}

/// Aggregated result of an entire run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Entries in deterministic topological order.
    pub entries: Vec<UnitReport>,
    pub duration: Duration,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.entries
            .iter()
            .all(|e| !matches!(e.state, UnitState::Failed | UnitState::Cancelled))
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn count(&self, state: UnitState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }
}

/// Receives run events. All methods have empty defaults so reporters
/// implement only what they need.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn on_queue_built(&self, _total: usize) {}
    async fn on_unit_start(&self, _name: &str) {}
    async fn on_unit_complete(&self, _name: &str, _state: UnitState) {}
    async fn on_run_complete(&self, _report: &RunReport) {}
}

/// A reporter that does nothing. Used in tests.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {}

/// Console reporter with a progress bar and a styled summary.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn styled_state(state: UnitState) -> console::StyledObject<&'static str> {
        match state {
            UnitState::Succeeded => style("ok      ").green(),
            UnitState::Failed => style("failed  ").red().bold(),
            UnitState::Excluded => style("excluded").yellow(),
            UnitState::Cancelled => style("aborted ").red(),
            UnitState::Pending | UnitState::Running => style("...     ").dim(),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_queue_built(&self, total: usize) {
        let pb = indicatif::ProgressBar::new(total as u64);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
                .unwrap()
                .progress_chars("#>-"),
        );
        *self.progress.lock().unwrap() = Some(pb);
    }

    async fn on_unit_start(&self, name: &str) {
        if self.verbose {
            if let Some(pb) = self.progress.lock().unwrap().as_ref() {
                pb.println(format!("running {name}"));
            }
        }
    }

    async fn on_unit_complete(&self, name: &str, state: UnitState) {
        if let Some(pb) = self.progress.lock().unwrap().as_ref() {
            pb.inc(1);
            if self.verbose || state != UnitState::Succeeded {
                pb.println(format!("{} {name}", Self::styled_state(state)));
            }
        }
    }

    async fn on_run_complete(&self, report: &RunReport) {
        if let Some(pb) = self.progress.lock().unwrap().take() {
            pb.finish_and_clear();
        }
        println!();
        for entry in &report.entries {
            println!("{} {}", Self::styled_state(entry.state), entry.name);
            if let Some((kind, message)) = &entry.error {
                println!("         {kind}: {message}");
            }
        }
        println!(
            "\n{} succeeded, {} failed, {} excluded, {} cancelled in {:.1?}",
            report.count(UnitState::Succeeded),
            report.count(UnitState::Failed),
            report.count(UnitState::Excluded),
            report.count(UnitState::Cancelled),
            report.duration
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, state: UnitState) -> UnitReport {
        UnitReport {
            name: name.to_string(),
            state,
            error: None,
        }
    }

    #[test]
    fn test_success_and_exit_code() {
        let report = RunReport {
            entries: vec![
                entry("a", UnitState::Succeeded),
                entry("b", UnitState::Excluded),
            ],
            duration: Duration::from_secs(1),
        };
        assert!(report.success());
        assert_eq!(report.exit_code(), 0);

        let report = RunReport {
            entries: vec![
                entry("a", UnitState::Succeeded),
                entry("b", UnitState::Failed),
                entry("c", UnitState::Cancelled),
            ],
            duration: Duration::from_secs(1),
        };
        assert!(!report.success());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.count(UnitState::Cancelled), 1);
    }

    #[test]
    fn test_unblocking_states() {
        assert!(UnitState::Succeeded.unblocks_dependents());
        assert!(UnitState::Excluded.unblocks_dependents());
        assert!(!UnitState::Failed.unblocks_dependents());
        assert!(!UnitState::Cancelled.unblocks_dependents());
    }
}
