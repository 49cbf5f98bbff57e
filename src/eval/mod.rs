//! HCL expression evaluation.
//!
//! This module owns the typed value universe and the builtin function
//! catalogue used when resolving `terragrunt.hcl` files. Evaluation is
//! performed with [`hcl::eval::Context`]; the orchestrator contributes:
//!
//! - **Frames** ([`EvalFrame`]): the per-file evaluation context that
//!   context-dependent functions (`get_terragrunt_dir`,
//!   `path_relative_to_include`, ...) read from.
//! - **Builtins** ([`functions::register_builtins`]): the fixed function
//!   catalogue that forms part of the external configuration contract.
//! - **The sentinel**: a marker value standing in for dependency outputs
//!   that have not been fetched during the discovery pass. Blocks that do
//!   not need real outputs tolerate it; `inputs` and `generate` reject it.
//!
//! Evaluation is side-effect-deterministic within one config load: effectful
//! functions (`run_cmd`, `sops_decrypt_file`) are memoised on their argument
//! tuple and working directory.

pub mod frame;
pub mod functions;

pub use frame::EvalFrame;

use hcl::{Map, Number, Value};

use crate::error::{StratusError, StratusResult};

/// Key identifying the sentinel object injected for unfetched outputs.
const SENTINEL_KEY: &str = "__stratus_unresolved_outputs__";

/// Returns the sentinel value used for dependency outputs during the
/// discovery pass.
pub fn sentinel() -> Value {
    let mut map = Map::new();
    map.insert(SENTINEL_KEY.to_string(), Value::Bool(true));
    Value::Object(map)
}

/// Returns true if the value is, or contains, the discovery-pass sentinel.
pub fn contains_sentinel(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key(SENTINEL_KEY) || map.values().any(contains_sentinel)
        }
        Value::Array(items) => items.iter().any(contains_sentinel),
        _ => false,
    }
}

/// Converts an HCL value to a JSON value.
///
/// Used when serialising inputs to `TF_VAR_*` environment variables and when
/// merging real state outputs (JSON) with mocked outputs (HCL).
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::from_str(&n.to_string())
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
    }
}

/// Converts a JSON value to an HCL value.
pub fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Number(Number::from(i))
            } else if let Some(u) = n.as_u64() {
                Value::Number(Number::from(u))
            } else {
                n.as_f64()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}

/// Converts a YAML value to an HCL value. Non-string mapping keys are
/// stringified.
pub fn yaml_to_value(value: &serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Number(Number::from(i))
            } else {
                n.as_f64()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        serde_yaml::Value::String(s) => Value::String(s.clone()),
        serde_yaml::Value::Sequence(items) => {
            Value::Array(items.iter().map(yaml_to_value).collect())
        }
        serde_yaml::Value::Mapping(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let key = match k {
                        serde_yaml::Value::String(s) => s.clone(),
                        other => serde_yaml::to_string(other)
                            .unwrap_or_default()
                            .trim()
                            .to_string(),
                    };
                    (key, yaml_to_value(v))
                })
                .collect(),
        ),
        serde_yaml::Value::Tagged(tagged) => yaml_to_value(&tagged.value),
    }
}

/// Converts an HCL value to a YAML value.
pub fn value_to_yaml(value: &Value) -> serde_yaml::Value {
    serde_yaml::to_value(value_to_json(value)).unwrap_or(serde_yaml::Value::Null)
}

/// Converts a value into a literal HCL expression, for re-emitting
/// evaluated values into generated configuration files.
pub fn value_to_expression(value: &Value) -> hcl::expr::Expression {
    use hcl::expr::{Expression, Object, ObjectKey};
    match value {
        Value::Null => Expression::Null,
        Value::Bool(b) => Expression::Bool(*b),
        Value::Number(n) => Expression::Number(n.clone()),
        Value::String(s) => Expression::String(s.clone()),
        Value::Array(items) => Expression::Array(items.iter().map(value_to_expression).collect()),
        Value::Object(map) => {
            let mut obj = Object::new();
            for (k, v) in map {
                obj.insert(
                    ObjectKey::Expression(Expression::String(k.clone())),
                    value_to_expression(v),
                );
            }
            Expression::Object(obj)
        }
    }
}

/// Shallow merge: keys of `overlay` win over keys of `base`.
pub fn merge_shallow(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            let mut out = b.clone();
            for (k, v) in o {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        _ => overlay.clone(),
    }
}

/// Deep merge: objects merge recursively; `append_lists` controls whether
/// arrays concatenate or the overlay replaces the base.
pub fn merge_deep(base: &Value, overlay: &Value, append_lists: bool) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            let mut out = b.clone();
            for (k, v) in o {
                match out.get(k) {
                    Some(existing) => {
                        let merged = merge_deep(existing, v, append_lists);
                        out.insert(k.clone(), merged);
                    }
                    None => {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(out)
        }
        (Value::Array(b), Value::Array(o)) if append_lists => {
            let mut out = b.clone();
            out.extend(o.iter().cloned());
            Value::Array(out)
        }
        _ => overlay.clone(),
    }
}

/// Extracts a string, failing with a [`ConfigEvalError`] otherwise.
pub fn expect_string(
    value: &Value,
    path: &std::path::Path,
    what: &str,
) -> StratusResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(StratusError::eval(
            path,
            format!("{what} must be a string, got {other}"),
        )),
    }
}

/// Extracts a boolean, failing with a [`ConfigEvalError`] otherwise.
pub fn expect_bool(value: &Value, path: &std::path::Path, what: &str) -> StratusResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(StratusError::eval(
            path,
            format!("{what} must be a bool, got {other}"),
        )),
    }
}

/// Extracts a list of strings.
pub fn expect_string_list(
    value: &Value,
    path: &std::path::Path,
    what: &str,
) -> StratusResult<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| expect_string(item, path, what))
            .collect(),
        other => Err(StratusError::eval(
            path,
            format!("{what} must be a list of strings, got {other}"),
        )),
    }
}
