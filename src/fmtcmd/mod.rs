//! `hclfmt`: canonical formatting of configuration files.
//!
//! Formatting parses each file and re-emits it in canonical form, which
//! makes the operation idempotent: formatting an already-formatted file is
//! a no-op. `--check` reports files that would change without touching
//! them; `--diff` prints a line diff instead of rewriting.

use std::path::{Path, PathBuf};

use console::style;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{StratusError, StratusResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FmtMode {
    /// Rewrite files in place.
    #[default]
    Write,
    /// Report files needing formatting; exit non-zero if any.
    Check,
    /// Print a diff for files needing formatting.
    Diff,
}

/// Result of one formatting run.
#[derive(Debug, Default)]
pub struct FmtOutcome {
    /// Files whose canonical form differs from their contents.
    pub changed: Vec<PathBuf>,
    /// Files that failed to parse.
    pub errors: Vec<(PathBuf, String)>,
}

impl FmtOutcome {
    pub fn clean(&self) -> bool {
        self.changed.is_empty() && self.errors.is_empty()
    }
}

/// Formats one file, or every `.hcl` file under the working directory.
pub fn run_fmt(working_dir: &Path, file: Option<&Path>, mode: FmtMode) -> StratusResult<FmtOutcome> {
    let files = match file {
        Some(file) => vec![file.to_path_buf()],
        None => collect_hcl_files(working_dir),
    };

    let mut outcome = FmtOutcome::default();
    for path in files {
        let original = std::fs::read_to_string(&path)?;
        let canonical = match format_str(&original) {
            Ok(canonical) => canonical,
            Err(e) => {
                outcome.errors.push((path, e));
                continue;
            }
        };
        if canonical == original {
            continue;
        }
        match mode {
            FmtMode::Write => {
                debug!("rewriting {}", path.display());
                std::fs::write(&path, &canonical)?;
            }
            FmtMode::Check => {}
            FmtMode::Diff => print_diff(&path, &original, &canonical),
        }
        outcome.changed.push(path);
    }
    Ok(outcome)
}

/// Canonical form of an HCL document.
pub fn format_str(input: &str) -> Result<String, String> {
    let body = hcl::parse(input).map_err(|e| e.to_string())?;
    hcl::format::to_string(&body).map_err(|e| e.to_string())
}

fn collect_hcl_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && e.file_name().to_str().is_some_and(|n| n.starts_with('.')))
        });
    for entry in walker.flatten() {
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "hcl")
        {
            files.push(entry.path().to_path_buf());
        }
    }
    files
}

/// Minimal line diff: removed lines prefixed `-`, added lines `+`.
fn print_diff(path: &Path, original: &str, canonical: &str) {
    println!("--- {}", path.display());
    let old: Vec<&str> = original.lines().collect();
    let new: Vec<&str> = canonical.lines().collect();
    let mut o = 0;
    let mut n = 0;
    while o < old.len() || n < new.len() {
        match (old.get(o), new.get(n)) {
            (Some(a), Some(b)) if a == b => {
                o += 1;
                n += 1;
            }
            (Some(a), Some(b)) => {
                // Resync on the next matching line of either side.
                if new[n..].contains(a) {
                    println!("{}", style(format!("+{b}")).green());
                    n += 1;
                } else {
                    println!("{}", style(format!("-{a}")).red());
                    o += 1;
                }
            }
            (Some(a), None) => {
                println!("{}", style(format!("-{a}")).red());
                o += 1;
            }
            (None, Some(b)) => {
                println!("{}", style(format!("+{b}")).green());
                n += 1;
            }
            (None, None) => break,
        }
    }
}

/// Check mode maps dirty trees to a failing exit.
pub fn check_failed(outcome: &FmtOutcome) -> StratusResult<()> {
    if outcome.errors.is_empty() && outcome.changed.is_empty() {
        return Ok(());
    }
    let mut parts: Vec<String> = outcome
        .changed
        .iter()
        .map(|p| format!("{} needs formatting", p.display()))
        .collect();
    parts.extend(
        outcome
            .errors
            .iter()
            .map(|(p, e)| format!("{}: {e}", p.display())),
    );
    Err(StratusError::ConfigParse {
        path: PathBuf::from("hclfmt"),
        message: parts.join("; "),
    })
}
