//! Stack blueprint expansion.
//!
//! A `terragrunt.stack.hcl` file declares `unit` and `stack` blocks, each
//! naming a source, a relative target path, and a `values` mapping. The
//! expander materialises them under a sibling `.terragrunt-stack/`
//! directory: unit sources must carry a `terragrunt.hcl`, stack sources a
//! `terragrunt.stack.hcl`, and generated stacks are expanded recursively.
//!
//! Expansion is idempotent: re-expanding the same inputs produces
//! byte-identical files, and deleting `.terragrunt-stack/` before
//! regenerating yields the same tree.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use hcl::eval::{Context, Evaluate};
use hcl::expr::Expression;
use hcl::structure::{Attribute, Body};
use hcl::{Map, Value};
use tracing::{debug, info};

use crate::config::normalize_path;
use crate::error::{StratusError, StratusResult};
use crate::eval::functions::{enter_frame, register_builtins, EffectCache, FrameState};
use crate::eval::{value_to_expression, EvalFrame};
use crate::fetch::{copy_tree, parse_source, SourceFetcher};

/// Directory generated units and stacks land in.
pub const STACK_DIR: &str = ".terragrunt-stack";

/// File the expander writes a block's `values` mapping to; generated
/// configs read it back through the `values` variable.
pub const VALUES_FILE: &str = "terragrunt.values.hcl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Unit,
    Stack,
}

#[derive(Debug)]
struct StackEntry {
    kind: EntryKind,
    name: String,
    source: String,
    path: PathBuf,
    values: Map<String, Value>,
}

/// Expands one stack file, recursing into generated stacks.
pub fn expand_stack_file(stack_file: &Path) -> StratusResult<()> {
    let stack_file = normalize_path(stack_file);
    let cache_root = stack_file
        .parent()
        .map(|d| d.join(".terragrunt-cache"))
        .unwrap_or_else(|| PathBuf::from(".terragrunt-cache"));
    let fetcher = SourceFetcher::new(&cache_root);
    let mut visited = BTreeSet::new();
    expand_inner(&stack_file, &fetcher, &mut visited)
}

fn expand_inner(
    stack_file: &Path,
    fetcher: &SourceFetcher,
    visited: &mut BTreeSet<PathBuf>,
) -> StratusResult<()> {
    if !visited.insert(stack_file.to_path_buf()) {
        let mut chain: Vec<String> = visited.iter().map(|p| p.display().to_string()).collect();
        chain.push(stack_file.display().to_string());
        return Err(StratusError::Cycle { chain });
    }

    let stack_dir = stack_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let entries = parse_stack_file(stack_file)?;
    let target_root = stack_dir.join(STACK_DIR);

    for entry in entries {
        let target = target_root.join(&entry.path);
        debug!(
            "materialising {} {:?} at {}",
            match entry.kind {
                EntryKind::Unit => "unit",
                EntryKind::Stack => "stack",
            },
            entry.name,
            target.display()
        );

        let source = parse_source(&entry.source, &stack_dir)?;
        let fetched = fetcher.fetch(&source)?;

        let marker = match entry.kind {
            EntryKind::Unit => crate::discovery::UNIT_MARKERS[0],
            EntryKind::Stack => crate::discovery::STACK_MARKER,
        };
        if !fetched.join(marker).is_file() {
            return Err(StratusError::SourceFetch {
                source_desc: entry.source.clone(),
                message: format!("source of {:?} does not contain {marker}", entry.name),
            });
        }

        copy_tree(&fetched, &target)?;

        if !entry.values.is_empty() {
            let values_path = target.join(VALUES_FILE);
            std::fs::write(&values_path, render_values(&entry.values))?;
        }

        if entry.kind == EntryKind::Stack {
            expand_inner(&normalize_path(&target.join(crate::discovery::STACK_MARKER)), fetcher, visited)?;
        }
    }

    info!("expanded {}", stack_file.display());
    Ok(())
}

fn parse_stack_file(stack_file: &Path) -> StratusResult<Vec<StackEntry>> {
    let text = std::fs::read_to_string(stack_file)
        .map_err(|e| StratusError::parse(stack_file, format!("cannot read file: {e}")))?;
    let body =
        hcl::parse(&text).map_err(|e| StratusError::parse(stack_file, e.to_string()))?;

    let frame = Arc::new(EvalFrame::for_unit(
        stack_file,
        stack_file.parent().unwrap_or(Path::new(".")),
    ));
    let cache = EffectCache::new();
    let _guard = enter_frame(FrameState {
        frame: frame.clone(),
        cache: cache.clone(),
        read_config: None,
    });
    let locals = eval_stack_locals(stack_file, &body)?;

    let mut entries = Vec::new();
    for block in body.blocks() {
        let kind = match block.identifier() {
            "unit" => EntryKind::Unit,
            "stack" => EntryKind::Stack,
            "locals" => continue,
            other => {
                return Err(StratusError::parse(
                    stack_file,
                    format!("unknown block type {other:?} in stack file"),
                ))
            }
        };
        let name = block
            .labels()
            .first()
            .map(|l| l.as_str().to_string())
            .ok_or_else(|| StratusError::parse(stack_file, "unit/stack block needs a name"))?;

        let mut ctx = Context::new();
        register_builtins(&mut ctx);
        ctx.declare_var("local", Value::Object(locals.clone()));

        let eval = |key: &str| -> StratusResult<Option<Value>> {
            match block.body().attributes().find(|a| a.key() == key) {
                Some(attr) => attr
                    .expr()
                    .evaluate(&ctx)
                    .map(Some)
                    .map_err(|e| StratusError::eval(stack_file, e.to_string())),
                None => Ok(None),
            }
        };

        let source = match eval("source")? {
            Some(Value::String(s)) => s,
            _ => {
                return Err(StratusError::parse(
                    stack_file,
                    format!("block {name:?} needs a string source"),
                ))
            }
        };
        let path = match eval("path")? {
            Some(Value::String(s)) => PathBuf::from(s),
            _ => {
                return Err(StratusError::parse(
                    stack_file,
                    format!("block {name:?} needs a string path"),
                ))
            }
        };
        validate_stack_path(stack_file, &path)?;
        let values = match eval("values")? {
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(StratusError::eval(
                    stack_file,
                    format!("values of {name:?} must be an object, got {other}"),
                ))
            }
            None => Map::new(),
        };

        entries.push(StackEntry {
            kind,
            name,
            source,
            path,
            values,
        });
    }
    Ok(entries)
}

/// Fixed-point evaluation of stack-file locals; the caller has already
/// installed the evaluation frame.
fn eval_stack_locals(stack_file: &Path, body: &Body) -> StratusResult<Map<String, Value>> {
    let mut pending: Vec<(String, &Expression)> = body
        .blocks()
        .filter(|b| b.identifier() == "locals")
        .flat_map(|b| b.body().attributes())
        .map(|a| (a.key().to_string(), a.expr()))
        .collect();

    let mut locals = Map::new();
    while !pending.is_empty() {
        let mut progressed = false;
        let mut still_pending = Vec::new();
        for (key, expr) in pending {
            let mut ctx = Context::new();
            register_builtins(&mut ctx);
            ctx.declare_var("local", Value::Object(locals.clone()));
            match expr.evaluate(&ctx) {
                Ok(value) => {
                    locals.insert(key, value);
                    progressed = true;
                }
                Err(_) => still_pending.push((key, expr)),
            }
        }
        pending = still_pending;
        if !progressed {
            let names: Vec<_> = pending.iter().map(|(k, _)| k.as_str()).collect();
            return Err(StratusError::eval(
                stack_file,
                format!("cannot evaluate stack locals {}", names.join(", ")),
            ));
        }
    }
    Ok(locals)
}

/// Target paths must stay inside the stack's own directory.
fn validate_stack_path(stack_file: &Path, path: &Path) -> StratusResult<()> {
    if path.is_absolute() {
        return Err(StratusError::eval(
            stack_file,
            format!("stack path {} must be relative", path.display()),
        ));
    }
    let mut depth: i32 = 0;
    for part in path.components() {
        match part {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return Err(StratusError::eval(
                stack_file,
                format!("stack path {} escapes the stack directory", path.display()),
            ));
        }
    }
    Ok(())
}

/// Renders a values mapping as a deterministic HCL document.
fn render_values(values: &Map<String, Value>) -> String {
    let mut builder = Body::builder();
    for (key, value) in values {
        builder = builder.add_attribute(Attribute::new(key.as_str(), value_to_expression(value)));
    }
    let body = builder.build();
    hcl::format::to_string(&body).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
    }

    fn two_unit_stack(root: &Path) {
        write(root, "templates/vpc/terragrunt.hcl", "# vpc template\n");
        write(root, "templates/database/terragrunt.hcl", "# db template\n");
        write(
            root,
            "live/terragrunt.stack.hcl",
            r#"
unit "vpc" {
  source = "../templates/vpc"
  path   = "vpc"
  values = {
    cidr = "10.0.0.0/16"
  }
}

unit "database" {
  source = "../templates/database"
  path   = "database"
}
"#,
        );
    }

    #[test]
    fn test_expand_two_units() {
        let tmp = tempfile::tempdir().unwrap();
        two_unit_stack(tmp.path());
        let stack_file = tmp.path().join("live/terragrunt.stack.hcl");
        expand_stack_file(&stack_file).unwrap();

        let generated = tmp.path().join("live/.terragrunt-stack");
        assert!(generated.join("vpc/terragrunt.hcl").is_file());
        assert!(generated.join("database/terragrunt.hcl").is_file());
        assert!(generated.join("vpc").join(VALUES_FILE).is_file());
        assert!(!generated.join("database").join(VALUES_FILE).exists());
    }

    #[test]
    fn test_expansion_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        two_unit_stack(tmp.path());
        let stack_file = tmp.path().join("live/terragrunt.stack.hcl");
        let values_file = tmp
            .path()
            .join("live/.terragrunt-stack/vpc")
            .join(VALUES_FILE);

        expand_stack_file(&stack_file).unwrap();
        let first = fs::read(&values_file).unwrap();

        // Re-expansion over the existing tree.
        expand_stack_file(&stack_file).unwrap();
        assert_eq!(fs::read(&values_file).unwrap(), first);

        // Regeneration from scratch.
        fs::remove_dir_all(tmp.path().join("live/.terragrunt-stack")).unwrap();
        expand_stack_file(&stack_file).unwrap();
        assert_eq!(fs::read(&values_file).unwrap(), first);
    }

    #[test]
    fn test_nested_stack_expansion() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "templates/app/terragrunt.hcl", "");
        write(
            tmp.path(),
            "stacks/services/terragrunt.stack.hcl",
            r#"
unit "app" {
  source = "../../templates/app"
  path   = "app"
}
"#,
        );
        write(
            tmp.path(),
            "live/terragrunt.stack.hcl",
            r#"
stack "services" {
  source = "../stacks/services"
  path   = "services"
}
"#,
        );
        let stack_file = tmp.path().join("live/terragrunt.stack.hcl");
        expand_stack_file(&stack_file).unwrap();

        assert!(tmp
            .path()
            .join("live/.terragrunt-stack/services/.terragrunt-stack/app/terragrunt.hcl")
            .is_file());
    }

    #[test]
    fn test_path_escape_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "templates/vpc/terragrunt.hcl", "");
        write(
            tmp.path(),
            "live/terragrunt.stack.hcl",
            r#"
unit "vpc" {
  source = "../templates/vpc"
  path   = "../../evil"
}
"#,
        );
        let err =
            expand_stack_file(&tmp.path().join("live/terragrunt.stack.hcl")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigEval);
    }

    #[test]
    fn test_missing_source_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "live/terragrunt.stack.hcl",
            r#"
unit "vpc" {
  source = "../templates/vpc"
  path   = "vpc"
}
"#,
        );
        let err =
            expand_stack_file(&tmp.path().join("live/terragrunt.stack.hcl")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SourceFetch);
    }
}
