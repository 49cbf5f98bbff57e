//! Evaluation frames.
//!
//! A frame captures everything context-dependent functions need: where the
//! unit lives, where the run was started, which file is currently being
//! evaluated, and which external command the run is executing.

use std::path::{Path, PathBuf};

/// The evaluation context for one configuration file.
///
/// Frames are cheap to clone; the loader derives a new frame for each
/// included file, keeping `unit_dir` anchored at the original unit so
/// functions like `path_relative_to_include()` resolve relative to the
/// unit even when written in a parent file.
#[derive(Debug, Clone)]
pub struct EvalFrame {
    /// Canonical path of the unit's own configuration file.
    pub config_path: PathBuf,

    /// Directory containing the unit's configuration file.
    pub unit_dir: PathBuf,

    /// Directory the run was started from (the run root).
    pub working_dir: PathBuf,

    /// Directory of the outermost included file, when an `include` chain is
    /// in scope. `None` while evaluating a unit with no includes.
    pub include_dir: Option<PathBuf>,

    /// The external subcommand being run (`plan`, `apply`, ...). Empty
    /// during the discovery pass.
    pub command: String,

    /// Path of the external IaC binary (`tofu` or `terraform`).
    pub tf_path: String,
}

impl EvalFrame {
    /// Creates a frame for a unit configuration file.
    pub fn for_unit(config_path: &Path, working_dir: &Path) -> Self {
        let unit_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_path: config_path.to_path_buf(),
            unit_dir,
            working_dir: working_dir.to_path_buf(),
            include_dir: None,
            command: String::new(),
            tf_path: "tofu".to_string(),
        }
    }

    /// Derives the frame used while evaluating an included file.
    ///
    /// The unit directory stays anchored at the original unit; only the
    /// include directory moves to the included file's location.
    pub fn for_include(&self, included_path: &Path) -> Self {
        let mut frame = self.clone();
        frame.include_dir = included_path.parent().map(Path::to_path_buf);
        frame
    }

    /// Sets the command the run is executing.
    pub fn with_command(mut self, command: &str) -> Self {
        self.command = command.to_string();
        self
    }

    /// Sets the IaC binary path.
    pub fn with_tf_path(mut self, tf_path: &str) -> Self {
        self.tf_path = tf_path.to_string();
        self
    }

    /// Relative path from the include directory down to the unit directory.
    ///
    /// This is the value of `path_relative_to_include()`: for a root config
    /// at `/repo/terragrunt.hcl` included from `/repo/stage/mysql`, the
    /// result is `stage/mysql`.
    pub fn path_relative_to_include(&self) -> Option<PathBuf> {
        let include_dir = self.include_dir.as_ref()?;
        relative_path(include_dir, &self.unit_dir)
    }

    /// Relative path from the unit directory up to the include directory,
    /// the inverse of [`path_relative_to_include`](Self::path_relative_to_include).
    pub fn path_relative_from_include(&self) -> Option<PathBuf> {
        let include_dir = self.include_dir.as_ref()?;
        relative_path(&self.unit_dir, include_dir)
    }
}

/// Computes `to` relative to `from` for absolute paths, using `..` segments
/// where the paths diverge.
pub fn relative_path(from: &Path, to: &Path) -> Option<PathBuf> {
    let from_parts: Vec<_> = from.components().collect();
    let to_parts: Vec<_> = to.components().collect();

    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from_parts.len() {
        rel.push("..");
    }
    for part in &to_parts[common..] {
        rel.push(part);
    }

    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    Some(rel)
}
