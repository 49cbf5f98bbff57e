//! Include merge semantics.
//!
//! After a unit's own file has been evaluated, the effective config of each
//! included file is merged into the result. Three modes exist:
//!
//! - `merge = false` (default): the include contributes attributes only
//!   where the child has not set them; block collections are replaced
//!   wholesale.
//! - `merge = true`: shallow merge. Mappings union at the top level, the
//!   child wins on conflict; block collections union by name.
//! - `merge = "deep"`: deep merge. Mappings merge recursively, lists
//!   append, hook/retry/ignore collections concatenate with the child's
//!   entries last.

use crate::eval::merge_deep;
use hcl::{Map, Value};

use super::schema::UnitConfig;

/// Merge mode of an `include` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    #[default]
    NoMerge,
    Shallow,
    Deep,
}

impl MergeMode {
    /// Parses the `merge` attribute value: `false`/`true` or a mode name.
    pub fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(false) => Some(Self::NoMerge),
            Value::Bool(true) => Some(Self::Shallow),
            Value::String(s) => match s.as_str() {
                "no_merge" => Some(Self::NoMerge),
                "shallow" => Some(Self::Shallow),
                "deep" => Some(Self::Deep),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Merges `included` (the parent) into `child` per `mode`. The child is the
/// base: whatever it sets explicitly survives the merge.
pub fn merge_included(child: &mut UnitConfig, included: UnitConfig, mode: MergeMode) {
    match mode {
        MergeMode::NoMerge => merge_no_merge(child, included),
        MergeMode::Shallow => merge_shallow_mode(child, included),
        MergeMode::Deep => merge_deep_mode(child, included),
    }
}

fn merge_no_merge(child: &mut UnitConfig, included: UnitConfig) {
    if child.terraform.source.is_none() {
        child.terraform.source = included.terraform.source;
    }
    if child.terraform.extra_arguments.is_empty() {
        child.terraform.extra_arguments = included.terraform.extra_arguments;
    }
    child.terraform.copy_terraform_lock_file |= included.terraform.copy_terraform_lock_file;

    if child.inputs.is_empty() {
        child.inputs = included.inputs;
    }
    if child.remote_state.is_none() {
        child.remote_state = included.remote_state;
    }
    if child.generate.is_empty() {
        child.generate = included.generate;
    }
    if child.dependencies.is_empty() {
        child.dependencies = included.dependencies;
    }
    if child.dependency_bindings.is_empty() {
        child.dependency_bindings = included.dependency_bindings;
    }
    if child.before_hooks.is_empty() {
        child.before_hooks = included.before_hooks;
    }
    if child.after_hooks.is_empty() {
        child.after_hooks = included.after_hooks;
    }
    if child.error_hooks.is_empty() {
        child.error_hooks = included.error_hooks;
    }
    if child.retries.is_empty() {
        child.retries = included.retries;
    }
    if child.ignores.is_empty() {
        child.ignores = included.ignores;
    }
    if child.exclude.is_none() {
        child.exclude = included.exclude;
    }
    if child.feature_flags.is_empty() {
        child.feature_flags = included.feature_flags;
    }
    if child.iam_assume.is_none() {
        child.iam_assume = included.iam_assume;
    }
    if child.auth_provider_cmd.is_none() {
        child.auth_provider_cmd = included.auth_provider_cmd;
    }
    if child.terraform_version_constraint.is_none() {
        child.terraform_version_constraint = included.terraform_version_constraint;
    }
    if child.terragrunt_version_constraint.is_none() {
        child.terragrunt_version_constraint = included.terragrunt_version_constraint;
    }
    if child.catalog_urls.is_empty() {
        child.catalog_urls = included.catalog_urls;
    }
}

fn merge_shallow_mode(child: &mut UnitConfig, included: UnitConfig) {
    child.inputs = union_map(included.inputs, std::mem::take(&mut child.inputs));
    child.feature_flags = union_map(included.feature_flags, std::mem::take(&mut child.feature_flags));

    if child.terraform.source.is_none() {
        child.terraform.source = included.terraform.source;
    }
    child.terraform.copy_terraform_lock_file |= included.terraform.copy_terraform_lock_file;
    child.terraform.extra_arguments = union_by_name(
        included.terraform.extra_arguments,
        std::mem::take(&mut child.terraform.extra_arguments),
        |e| e.name.clone(),
    );

    if child.remote_state.is_none() {
        child.remote_state = included.remote_state;
    }
    child.generate = union_by_name(
        included.generate,
        std::mem::take(&mut child.generate),
        |g| g.name.clone(),
    );

    child.dependencies.extend(included.dependencies);
    child.dependency_bindings = union_by_name(
        included.dependency_bindings,
        std::mem::take(&mut child.dependency_bindings),
        |b| b.name.clone(),
    );

    child.before_hooks = union_by_name(
        included.before_hooks,
        std::mem::take(&mut child.before_hooks),
        |h| h.name.clone(),
    );
    child.after_hooks = union_by_name(
        included.after_hooks,
        std::mem::take(&mut child.after_hooks),
        |h| h.name.clone(),
    );
    child.error_hooks = union_by_name(
        included.error_hooks,
        std::mem::take(&mut child.error_hooks),
        |h| h.name.clone(),
    );
    child.retries = union_by_name(included.retries, std::mem::take(&mut child.retries), |r| {
        r.name.clone()
    });
    child.ignores = union_by_name(included.ignores, std::mem::take(&mut child.ignores), |i| {
        i.name.clone()
    });

    if child.exclude.is_none() {
        child.exclude = included.exclude;
    }
    if child.iam_assume.is_none() {
        child.iam_assume = included.iam_assume;
    }
    if child.auth_provider_cmd.is_none() {
        child.auth_provider_cmd = included.auth_provider_cmd;
    }
    if child.terraform_version_constraint.is_none() {
        child.terraform_version_constraint = included.terraform_version_constraint;
    }
    if child.terragrunt_version_constraint.is_none() {
        child.terragrunt_version_constraint = included.terragrunt_version_constraint;
    }
    let mut urls = included.catalog_urls;
    urls.extend(std::mem::take(&mut child.catalog_urls));
    urls.dedup();
    child.catalog_urls = urls;
}

fn merge_deep_mode(child: &mut UnitConfig, included: UnitConfig) {
    let merged_inputs = merge_deep(
        &Value::Object(included.inputs),
        &Value::Object(child.inputs.clone()),
        true,
    );
    if let Value::Object(map) = merged_inputs {
        child.inputs = map;
    }

    let merged_flags = merge_deep(
        &Value::Object(included.feature_flags),
        &Value::Object(child.feature_flags.clone()),
        true,
    );
    if let Value::Object(map) = merged_flags {
        child.feature_flags = map;
    }

    if child.terraform.source.is_none() {
        child.terraform.source = included.terraform.source;
    }
    child.terraform.copy_terraform_lock_file |= included.terraform.copy_terraform_lock_file;
    let mut extra = included.terraform.extra_arguments;
    extra.extend(std::mem::take(&mut child.terraform.extra_arguments));
    child.terraform.extra_arguments = extra;

    child.remote_state = match (included.remote_state, child.remote_state.take()) {
        (Some(inc), Some(mut own)) => {
            let merged = merge_deep(
                &Value::Object(inc.config),
                &Value::Object(own.config.clone()),
                false,
            );
            if let Value::Object(map) = merged {
                own.config = map;
            }
            Some(own)
        }
        (inc, own) => own.or(inc),
    };

    child.generate = union_by_name(
        included.generate,
        std::mem::take(&mut child.generate),
        |g| g.name.clone(),
    );

    child.dependencies.extend(included.dependencies);
    child.dependency_bindings = union_by_name(
        included.dependency_bindings,
        std::mem::take(&mut child.dependency_bindings),
        |b| b.name.clone(),
    );

    // Deep mode appends: parent hooks run before the child's own.
    let mut before = included.before_hooks;
    before.extend(std::mem::take(&mut child.before_hooks));
    child.before_hooks = before;
    let mut after = included.after_hooks;
    after.extend(std::mem::take(&mut child.after_hooks));
    child.after_hooks = after;
    let mut error = included.error_hooks;
    error.extend(std::mem::take(&mut child.error_hooks));
    child.error_hooks = error;

    let mut retries = included.retries;
    retries.extend(std::mem::take(&mut child.retries));
    child.retries = retries;
    let mut ignores = included.ignores;
    ignores.extend(std::mem::take(&mut child.ignores));
    child.ignores = ignores;

    if child.exclude.is_none() {
        child.exclude = included.exclude;
    }
    if child.iam_assume.is_none() {
        child.iam_assume = included.iam_assume;
    }
    if child.auth_provider_cmd.is_none() {
        child.auth_provider_cmd = included.auth_provider_cmd;
    }
    if child.terraform_version_constraint.is_none() {
        child.terraform_version_constraint = included.terraform_version_constraint;
    }
    if child.terragrunt_version_constraint.is_none() {
        child.terragrunt_version_constraint = included.terragrunt_version_constraint;
    }
    let mut urls = included.catalog_urls;
    urls.extend(std::mem::take(&mut child.catalog_urls));
    urls.dedup();
    child.catalog_urls = urls;
}

/// Union of two maps where entries of `winner` replace entries of `base`.
fn union_map(base: Map<String, Value>, winner: Map<String, Value>) -> Map<String, Value> {
    let mut out = base;
    for (k, v) in winner {
        out.insert(k, v);
    }
    out
}

/// Union of two named collections: base entries first, winner entries
/// replace same-named base entries in place, new winner entries append.
fn union_by_name<T, F>(base: Vec<T>, winner: Vec<T>, name: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let mut out = base;
    for item in winner {
        let key = name(&item);
        match out.iter().position(|existing| name(existing) == key) {
            Some(idx) => out[idx] = item,
            None => out.push(item),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::json_to_value;
    use std::path::Path;

    fn config_with_inputs(json: serde_json::Value) -> UnitConfig {
        let mut config = UnitConfig::new(Path::new("/repo/app/terragrunt.hcl"));
        if let Value::Object(map) = json_to_value(&json) {
            config.inputs = map;
        }
        config
    }

    #[test]
    fn test_merge_mode_parse() {
        assert_eq!(
            MergeMode::parse(&Value::Bool(false)),
            Some(MergeMode::NoMerge)
        );
        assert_eq!(
            MergeMode::parse(&Value::Bool(true)),
            Some(MergeMode::Shallow)
        );
        assert_eq!(
            MergeMode::parse(&Value::String("deep".into())),
            Some(MergeMode::Deep)
        );
        assert_eq!(MergeMode::parse(&Value::Null), None);
    }

    #[test]
    fn test_no_merge_child_wins_wholesale() {
        let mut child = config_with_inputs(serde_json::json!({"a": 1}));
        let included = config_with_inputs(serde_json::json!({"a": 2, "b": 3}));
        merge_included(&mut child, included, MergeMode::NoMerge);
        // Child set inputs, so the include contributes nothing to them.
        assert_eq!(
            crate::eval::value_to_json(&Value::Object(child.inputs)),
            serde_json::json!({"a": 1})
        );
    }

    #[test]
    fn test_no_merge_fills_gaps() {
        let mut child = config_with_inputs(serde_json::json!({}));
        let mut included = config_with_inputs(serde_json::json!({"b": 3}));
        included.terraform.source = Some("git::https://example.com/mod.git".into());
        merge_included(&mut child, included, MergeMode::NoMerge);
        assert_eq!(
            child.terraform.source.as_deref(),
            Some("git::https://example.com/mod.git")
        );
        assert_eq!(
            crate::eval::value_to_json(&Value::Object(child.inputs)),
            serde_json::json!({"b": 3})
        );
    }

    #[test]
    fn test_shallow_merge_unions_top_level() {
        let mut child = config_with_inputs(serde_json::json!({"a": 1, "nested": {"x": 1}}));
        let included =
            config_with_inputs(serde_json::json!({"a": 2, "b": 3, "nested": {"y": 2}}));
        merge_included(&mut child, included, MergeMode::Shallow);
        assert_eq!(
            crate::eval::value_to_json(&Value::Object(child.inputs)),
            serde_json::json!({"a": 1, "b": 3, "nested": {"x": 1}})
        );
    }

    #[test]
    fn test_deep_merge_recurses_and_appends() {
        let mut child =
            config_with_inputs(serde_json::json!({"nested": {"x": 1}, "list": [2]}));
        let included =
            config_with_inputs(serde_json::json!({"nested": {"y": 2}, "list": [1]}));
        merge_included(&mut child, included, MergeMode::Deep);
        assert_eq!(
            crate::eval::value_to_json(&Value::Object(child.inputs)),
            serde_json::json!({"nested": {"x": 1, "y": 2}, "list": [1, 2]})
        );
    }
}
