//! Unit execution.
//!
//! [`pool::RunnerPool`] walks the run queue with bounded parallelism and
//! hands each ready unit to a [`unit::UnitRunner`], which materialises the
//! workspace, generates files, assembles the environment, invokes the
//! external binary, and applies the unit's retry/ignore policy.

pub mod classify;
pub mod outputs;
pub mod pool;
pub mod unit;

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub use outputs::OutputResolver;
pub use pool::{PoolOptions, RunnerPool};
pub use unit::{RunOptions, UnitOutcome, UnitRunner};

/// Computes the unit's scratch workspace.
///
/// Units without a module source run in place. Units with one get a
/// directory keyed on a hash of the unit path and source descriptor, under
/// the unit's own `.terragrunt-cache` or the `TERRAGRUNT_DOWNLOAD`
/// override; two units never share a workspace either way.
pub fn scratch_dir(unit_dir: &Path, source: Option<&str>, download_dir: Option<&Path>) -> PathBuf {
    let source = match source {
        Some(source) => source,
        None => return unit_dir.to_path_buf(),
    };

    let mut hasher = Sha256::new();
    hasher.update(unit_dir.to_string_lossy().as_bytes());
    hasher.update([0]);
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    let hash: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();

    let root = download_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| unit_dir.join(".terragrunt-cache"));

    // Last meaningful path segment of the source keeps the directory
    // recognisable next to the hash.
    let module = source
        .split('?')
        .next()
        .unwrap_or(source)
        .rsplit('/')
        .find(|seg| !seg.is_empty())
        .unwrap_or("module")
        .trim_end_matches(".git")
        .to_string();

    root.join(hash).join(module)
}
