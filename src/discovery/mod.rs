//! Unit discovery.
//!
//! Walks the working directory looking for unit markers (`terragrunt.hcl`,
//! `terragrunt.hcl.json`), expands stack blueprints it encounters, and
//! partial-parses each unit so the DAG can be built without fetching any
//! dependency outputs.
//!
//! Hidden directories are skipped, with one exception: `.terragrunt-stack`
//! trees hold generated units and are walked. A repo-wide exclusions file
//! (`.terragrunt-excludes`) and the `--queue-exclude-dir` /
//! `--queue-include-dir` flags filter the discovered set.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{normalize_path, ConfigLoader, PartialConfig};
use crate::error::{StratusError, StratusResult};
use crate::stack;

/// Unit marker filenames, in preference order.
pub const UNIT_MARKERS: &[&str] = &["terragrunt.hcl", "terragrunt.hcl.json"];

/// Stack blueprint marker.
pub const STACK_MARKER: &str = "terragrunt.stack.hcl";

/// Per-repo exclusions file: one path pattern per line, `#` comments.
pub const EXCLUDES_FILE: &str = ".terragrunt-excludes";

#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    pub working_dir: PathBuf,
    /// `--queue-exclude-dir` patterns.
    pub exclude_dirs: Vec<String>,
    /// `--queue-include-dir` patterns.
    pub include_dirs: Vec<String>,
    /// `--queue-strict-include`: only units matching an include pattern.
    pub strict_include: bool,
}

/// The result of a discovery pass: partial parses plus the per-unit
/// failures collected along the way so they can be reported together.
pub struct Discovered {
    pub units: Vec<PartialConfig>,
    pub failures: Vec<(PathBuf, StratusError)>,
}

/// Walks the tree, expands stacks, and partial-parses every unit found.
pub fn discover_units(
    opts: &DiscoveryOptions,
    loader: &Arc<ConfigLoader>,
) -> StratusResult<Discovered> {
    let root = normalize_path(&opts.working_dir);

    // Stack blueprints expand before the walk sees their generated trees.
    for stack_file in find_stack_files(&root) {
        debug!("expanding stack {}", stack_file.display());
        stack::expand_stack_file(&stack_file)?;
    }

    let excludes = load_excludes_file(&root);

    let mut units = Vec::new();
    let mut failures = Vec::new();
    for config_path in find_unit_files(&root) {
        let unit_dir = config_path.parent().unwrap_or(&root);
        let rel = unit_dir.strip_prefix(&root).unwrap_or(unit_dir);

        if excludes.iter().any(|p| path_matches(p, rel)) {
            debug!("unit {} excluded by {}", rel.display(), EXCLUDES_FILE);
            continue;
        }
        if opts.exclude_dirs.iter().any(|p| path_matches(p, rel)) {
            debug!("unit {} excluded by flag", rel.display());
            continue;
        }
        if opts.strict_include
            && !opts.include_dirs.iter().any(|p| path_matches(p, rel))
        {
            continue;
        }

        match loader.partial(&config_path) {
            Ok(partial) => units.push(partial),
            Err(e) => {
                warn!("failed to parse {}: {e}", config_path.display());
                failures.push((config_path, e));
            }
        }
    }

    Ok(Discovered { units, failures })
}

/// Partial-parses a single unit outside the main walk. Used when the run
/// queue pulls in external dependencies.
pub fn discover_single(
    unit_dir: &Path,
    loader: &Arc<ConfigLoader>,
) -> StratusResult<PartialConfig> {
    let config_path = unit_config_file(unit_dir).ok_or_else(|| {
        StratusError::parse(
            unit_dir,
            format!("no {} found", UNIT_MARKERS.join(" or ")),
        )
    })?;
    loader.partial(&config_path)
}

/// Returns the unit marker file inside `dir`, if any.
pub fn unit_config_file(dir: &Path) -> Option<PathBuf> {
    UNIT_MARKERS
        .iter()
        .map(|m| dir.join(m))
        .find(|p| p.is_file())
}

fn find_unit_files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        // The root entry itself is never skipped, whatever its name.
        .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e.path(), e.file_type().is_dir()));
    for entry in walker.flatten() {
        if entry.file_type().is_file()
            && UNIT_MARKERS
                .iter()
                .any(|m| entry.file_name().to_string_lossy() == *m)
        {
            found.push(normalize_path(entry.path()));
        }
    }
    found
}

fn find_stack_files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e.path(), e.file_type().is_dir()));
    for entry in walker.flatten() {
        if entry.file_type().is_file() && entry.file_name().to_string_lossy() == STACK_MARKER {
            found.push(normalize_path(entry.path()));
        }
    }
    found
}

/// Hidden directories are skipped except for generated stack trees.
fn is_skipped_dir(path: &Path, is_dir: bool) -> bool {
    if !is_dir {
        return false;
    }
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.starts_with('.') && name != stack::STACK_DIR,
        None => false,
    }
}

fn load_excludes_file(root: &Path) -> Vec<String> {
    let path = root.join(EXCLUDES_FILE);
    match std::fs::read_to_string(&path) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Matches a path pattern against a relative unit directory. Patterns
/// support `*` (one segment) and `**` (any depth); a bare directory
/// pattern matches itself and everything under it.
pub fn path_matches(pattern: &str, rel: &Path) -> bool {
    let rel = rel.to_string_lossy();
    let rel = rel.trim_start_matches("./");
    let pattern = pattern.trim_end_matches('/');

    if !pattern.contains('*') {
        return rel == pattern || rel.starts_with(&format!("{pattern}/"));
    }

    let mut regex = String::from("^");
    let mut rest = pattern;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix("**") {
            regex.push_str(".*");
            rest = tail.strip_prefix('/').unwrap_or(tail);
        } else if let Some(tail) = rest.strip_prefix('*') {
            regex.push_str("[^/]*");
            rest = tail;
        } else {
            let ch = rest.chars().next().unwrap();
            regex.push_str(&regex::escape(&ch.to_string()));
            rest = &rest[ch.len_utf8()..];
        }
    }
    regex.push('$');
    regex::Regex::new(&regex)
        .map(|re| re.is_match(rel))
        .unwrap_or(false)
}
