//! Dependency output resolution.
//!
//! When the loader evaluates a `dependency` block during the runner pass,
//! this resolver fetches the dependency's outputs by invoking the IaC
//! binary in the dependency's workspace. Missing state falls back to the
//! binding's mocked outputs when the current command allows it; otherwise
//! the unit fails. Real and mocked outputs combine per the binding's merge
//! strategy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use hcl::{Map, Value};
use tracing::debug;

use crate::config::{
    ConfigLoader, DependencyBinding, DependencyOutputs, LoadOptions, MergeStrategy,
    SentinelOutputs,
};
use crate::error::{StratusError, StratusResult};
use crate::eval::{json_to_value, merge_deep, merge_shallow};

use super::scratch_dir;

/// Fetches dependency outputs from state, with per-dependency caching so
/// a shared dependency is only queried once per run.
pub struct OutputResolver {
    working_dir: PathBuf,
    tf_path: String,
    download_dir: Option<PathBuf>,
    cache: Mutex<HashMap<PathBuf, Option<Value>>>,
}

impl OutputResolver {
    pub fn new(working_dir: &Path, tf_path: &str, download_dir: Option<&Path>) -> Arc<Self> {
        Arc::new(Self {
            working_dir: working_dir.to_path_buf(),
            tf_path: tf_path.to_string(),
            download_dir: download_dir.map(Path::to_path_buf),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Reads a unit's outputs from its workspace state. `Ok(None)` means
    /// the unit has no state yet. Also serves `stack output` aggregation.
    pub fn unit_outputs(&self, dep_dir: &Path) -> StratusResult<Option<Value>> {
        self.real_outputs(dep_dir)
    }

    /// Reads the dependency's outputs from its workspace state.
    /// `Ok(None)` means the dependency has no state yet.
    fn real_outputs(&self, dep_dir: &Path) -> StratusResult<Option<Value>> {
        if let Some(hit) = self.cache.lock().unwrap().get(dep_dir) {
            return Ok(hit.clone());
        }

        let loader = ConfigLoader::new(
            LoadOptions::new(&self.working_dir),
            Arc::new(SentinelOutputs),
        );
        let partial = crate::discovery::discover_single(dep_dir, &loader)?;
        let workspace = match &partial.source {
            Some(source) => scratch_dir(dep_dir, Some(source), self.download_dir.as_deref()),
            None => dep_dir.to_path_buf(),
        };

        let fetched = if workspace.is_dir() {
            self.read_output_json(dep_dir, &workspace)?
        } else {
            debug!(
                "dependency {} has no workspace at {}",
                dep_dir.display(),
                workspace.display()
            );
            None
        };

        self.cache
            .lock()
            .unwrap()
            .insert(dep_dir.to_path_buf(), fetched.clone());
        Ok(fetched)
    }

    fn read_output_json(&self, dep_dir: &Path, workspace: &Path) -> StratusResult<Option<Value>> {
        let output = std::process::Command::new(&self.tf_path)
            .args(["output", "-json"])
            .current_dir(workspace)
            .output()
            .map_err(|e| StratusError::DependencyOutput {
                dependency: dep_dir.display().to_string(),
                message: format!("failed to spawn {}: {e}", self.tf_path),
            })?;

        if !output.status.success() {
            return Err(StratusError::DependencyOutput {
                dependency: dep_dir.display().to_string(),
                message: format!(
                    "{} output -json exited with {}: {}",
                    self.tf_path,
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            StratusError::DependencyOutput {
                dependency: dep_dir.display().to_string(),
                message: format!("invalid output JSON: {e}"),
            }
        })?;

        let object = match parsed.as_object() {
            Some(map) if !map.is_empty() => map.clone(),
            // No outputs recorded: indistinguishable from no state for our
            // purposes.
            _ => return Ok(None),
        };

        // `output -json` wraps each output in {value, type, sensitive}.
        let mut values = Map::new();
        for (name, entry) in object {
            let value = entry.get("value").unwrap_or(&entry);
            values.insert(name, json_to_value(value));
        }
        Ok(Some(Value::Object(values)))
    }
}

impl DependencyOutputs for OutputResolver {
    fn outputs(&self, binding: &DependencyBinding, command: &str) -> StratusResult<Value> {
        let mocks = binding
            .mock_outputs
            .clone()
            .unwrap_or(Value::Object(Map::new()));

        if binding.skip_outputs {
            return Ok(mocks);
        }

        match self.real_outputs(&binding.config_path) {
            Ok(Some(real)) => Ok(apply_merge_strategy(
                binding.merge_strategy,
                &mocks,
                &real,
            )),
            Ok(None) => {
                if binding.mocks_allowed_for(command) {
                    debug!(
                        "dependency {} has no outputs, using mocks for {command}",
                        binding.name
                    );
                    Ok(mocks)
                } else {
                    Err(StratusError::DependencyOutput {
                        dependency: binding.name.clone(),
                        message: format!(
                            "{} has no outputs and mocks are not allowed for {command}",
                            binding.config_path.display()
                        ),
                    })
                }
            }
            Err(e) => {
                if binding.mocks_allowed_for(command) {
                    debug!("dependency {} unreadable ({e}), using mocks", binding.name);
                    Ok(mocks)
                } else {
                    Err(e)
                }
            }
        }
    }
}

/// Combines mocked and real outputs; real values win.
fn apply_merge_strategy(strategy: MergeStrategy, mocks: &Value, real: &Value) -> Value {
    match strategy {
        MergeStrategy::NoMerge => real.clone(),
        MergeStrategy::Shallow => merge_shallow(mocks, real),
        MergeStrategy::Deep => merge_deep(mocks, real, false),
        MergeStrategy::DeepAppend => merge_deep(mocks, real, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::value_to_json;

    fn binding(mocks: Option<serde_json::Value>) -> DependencyBinding {
        DependencyBinding {
            name: "vpc".to_string(),
            config_path: PathBuf::from("/repo/vpc"),
            mock_outputs: mocks.map(|j| json_to_value(&j)),
            mock_outputs_allowed_commands: Some(vec!["plan".to_string()]),
            skip_outputs: false,
            merge_strategy: MergeStrategy::NoMerge,
        }
    }

    #[test]
    fn test_skip_outputs_uses_mocks_directly() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = OutputResolver::new(tmp.path(), "tofu", None);
        let mut b = binding(Some(serde_json::json!({"vpc_id": "mock"})));
        b.skip_outputs = true;
        // skip_outputs never touches the dependency, so the missing unit
        // directory does not matter.
        let outputs = resolver.outputs(&b, "apply").unwrap();
        assert_eq!(value_to_json(&outputs), serde_json::json!({"vpc_id": "mock"}));
    }

    #[test]
    fn test_missing_state_with_allowed_command_uses_mocks() {
        let tmp = tempfile::tempdir().unwrap();
        let dep = tmp.path().join("vpc");
        std::fs::create_dir_all(&dep).unwrap();
        std::fs::write(dep.join("terragrunt.hcl"), "").unwrap();

        let resolver = OutputResolver::new(tmp.path(), "false", None);
        let mut b = binding(Some(serde_json::json!({"private_subnets": ["mock-subnet"]})));
        b.config_path = dep.clone();

        let outputs = resolver.outputs(&b, "plan").unwrap();
        assert_eq!(
            value_to_json(&outputs),
            serde_json::json!({"private_subnets": ["mock-subnet"]})
        );

        let err = resolver.outputs(&b, "apply").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DependencyOutput);
    }

    #[test]
    fn test_merge_strategies() {
        let mocks = json_to_value(&serde_json::json!({"a": "mock", "nested": {"x": 1}}));
        let real = json_to_value(&serde_json::json!({"b": "real", "nested": {"y": 2}}));

        let merged = apply_merge_strategy(MergeStrategy::NoMerge, &mocks, &real);
        assert_eq!(
            value_to_json(&merged),
            serde_json::json!({"b": "real", "nested": {"y": 2}})
        );

        let merged = apply_merge_strategy(MergeStrategy::Shallow, &mocks, &real);
        assert_eq!(
            value_to_json(&merged),
            serde_json::json!({"a": "mock", "b": "real", "nested": {"y": 2}})
        );

        let merged = apply_merge_strategy(MergeStrategy::Deep, &mocks, &real);
        assert_eq!(
            value_to_json(&merged),
            serde_json::json!({"a": "mock", "b": "real", "nested": {"x": 1, "y": 2}})
        );
    }
}
