//! The builtin function catalogue.
//!
//! Function names and semantics are part of the external configuration
//! contract. Three classes exist:
//!
//! 1. Pure expression functions (`merge`, `contains`, the encode/decode
//!    family, `formatdate`).
//! 2. Context functions whose value depends on the evaluation frame
//!    (`get_terragrunt_dir`, `path_relative_to_include`, `get_env`, ...).
//! 3. Effectful functions that spawn processes or read secret material
//!    (`run_cmd`, `sops_decrypt_file`). These are memoised per argument
//!    tuple so a config load observes one deterministic result.
//!
//! `hcl::eval::FuncDef` dispatches through plain function pointers, so the
//! evaluation frame travels through a thread-local stack instead of
//! captured state: callers install a [`FrameState`] with [`enter_frame`]
//! for the duration of an evaluation, and nested loads (through
//! `read_terragrunt_config`) push their own frame on top.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use hcl::eval::{Context, FuncArgs, FuncDef, ParamType};
use hcl::Value;
use tracing::debug;

use super::frame::EvalFrame;
use super::{json_to_value, value_to_json, value_to_yaml, yaml_to_value};

/// Callback used by `read_terragrunt_config` to load another file through
/// the config loader (which owns cycle detection and memoisation).
pub type ReadConfigFn = Arc<dyn Fn(&Path) -> Result<Value, String> + Send + Sync>;

/// Memoisation cache for effectful functions, shared across one config load.
#[derive(Default)]
pub struct EffectCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl EffectCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn get_or_insert_with<F>(&self, key: &str, produce: F) -> Result<Value, String>
    where
        F: FnOnce() -> Result<Value, String>,
    {
        let mut entries = self.entries.lock().unwrap();
        if let Some(hit) = entries.get(key) {
            return Ok(hit.clone());
        }
        let value = produce()?;
        entries.insert(key.to_string(), value.clone());
        Ok(value)
    }
}

/// Everything a builtin needs from its call site.
#[derive(Clone)]
pub struct FrameState {
    pub frame: Arc<EvalFrame>,
    pub cache: Arc<EffectCache>,
    pub read_config: Option<ReadConfigFn>,
}

thread_local! {
    static FRAMES: RefCell<Vec<FrameState>> = const { RefCell::new(Vec::new()) };
}

/// Installs `state` as the active frame until the guard drops. Nested
/// guards stack, so re-entrant loads restore the outer frame on return.
pub fn enter_frame(state: FrameState) -> FrameGuard {
    FRAMES.with(|frames| frames.borrow_mut().push(state));
    FrameGuard { _private: () }
}

pub struct FrameGuard {
    _private: (),
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

fn current() -> Result<FrameState, String> {
    FRAMES.with(|frames| {
        frames
            .borrow()
            .last()
            .cloned()
            .ok_or_else(|| "no evaluation frame installed".to_string())
    })
}

/// Commands for which the external binary reads `TF_VAR_*` variables.
pub const COMMANDS_THAT_NEED_VARS: &[&str] = &[
    "apply", "console", "destroy", "import", "plan", "push", "refresh", "validate",
];

/// Registers every builtin on the evaluation context.
pub fn register_builtins(ctx: &mut Context<'_>) {
    // Context functions.
    ctx.declare_func("get_terragrunt_dir", FuncDef::builder().build(get_terragrunt_dir));
    ctx.declare_func(
        "get_parent_terragrunt_dir",
        FuncDef::builder().build(get_parent_terragrunt_dir),
    );
    ctx.declare_func(
        "path_relative_to_include",
        FuncDef::builder().build(path_relative_to_include),
    );
    ctx.declare_func(
        "path_relative_from_include",
        FuncDef::builder().build(path_relative_from_include),
    );
    ctx.declare_func("get_working_dir", FuncDef::builder().build(get_working_dir));
    ctx.declare_func("get_repo_root", FuncDef::builder().build(get_repo_root));
    ctx.declare_func(
        "find_in_parent_folders",
        FuncDef::builder()
            .variadic_param(ParamType::String)
            .build(find_in_parent_folders),
    );
    ctx.declare_func(
        "get_terraform_command",
        FuncDef::builder().build(get_terraform_command),
    );
    ctx.declare_func(
        "get_env",
        FuncDef::builder()
            .param(ParamType::String)
            .variadic_param(ParamType::String)
            .build(get_env),
    );
    ctx.declare_func("get_platform", FuncDef::builder().build(get_platform));
    ctx.declare_func(
        "get_terraform_commands_that_need_vars",
        FuncDef::builder().build(get_terraform_commands_that_need_vars),
    );
    ctx.declare_func(
        "mark_as_read",
        FuncDef::builder().param(ParamType::String).build(mark_as_read),
    );

    // Pure functions.
    ctx.declare_func(
        "jsondecode",
        FuncDef::builder().param(ParamType::String).build(jsondecode),
    );
    ctx.declare_func(
        "jsonencode",
        FuncDef::builder().param(ParamType::Any).build(jsonencode),
    );
    ctx.declare_func(
        "yamldecode",
        FuncDef::builder().param(ParamType::String).build(yamldecode),
    );
    ctx.declare_func(
        "yamlencode",
        FuncDef::builder().param(ParamType::Any).build(yamlencode),
    );
    ctx.declare_func(
        "tomldecode",
        FuncDef::builder().param(ParamType::String).build(tomldecode),
    );
    ctx.declare_func(
        "tomlencode",
        FuncDef::builder().param(ParamType::Any).build(tomlencode),
    );
    ctx.declare_func(
        "merge",
        FuncDef::builder().variadic_param(ParamType::Any).build(merge),
    );
    ctx.declare_func(
        "contains",
        FuncDef::builder()
            .param(ParamType::Array(Box::new(ParamType::Any)))
            .param(ParamType::Any)
            .build(contains),
    );
    ctx.declare_func("timestamp", FuncDef::builder().build(timestamp));
    ctx.declare_func(
        "formatdate",
        FuncDef::builder()
            .param(ParamType::String)
            .param(ParamType::String)
            .build(formatdate),
    );

    // Effectful functions.
    ctx.declare_func(
        "run_cmd",
        FuncDef::builder()
            .variadic_param(ParamType::String)
            .build(run_cmd),
    );
    ctx.declare_func(
        "sops_decrypt_file",
        FuncDef::builder()
            .param(ParamType::String)
            .build(sops_decrypt_file),
    );
    ctx.declare_func(
        "read_terragrunt_config",
        FuncDef::builder()
            .param(ParamType::String)
            .build(read_terragrunt_config),
    );
}

fn get_terragrunt_dir(_: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    Ok(path_value(&state.frame.unit_dir))
}

fn get_parent_terragrunt_dir(_: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    match &state.frame.include_dir {
        Some(dir) => Ok(path_value(dir)),
        None => Err("get_parent_terragrunt_dir() called outside an include chain".to_string()),
    }
}

fn path_relative_to_include(_: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    state
        .frame
        .path_relative_to_include()
        .map(|p| path_value(&p))
        .ok_or_else(|| "path_relative_to_include() called outside an include chain".to_string())
}

fn path_relative_from_include(_: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    state
        .frame
        .path_relative_from_include()
        .map(|p| path_value(&p))
        .ok_or_else(|| "path_relative_from_include() called outside an include chain".to_string())
}

fn get_working_dir(_: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    Ok(path_value(&state.frame.working_dir))
}

fn get_repo_root(_: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    find_upwards(&state.frame.unit_dir, ".git")
        .map(|p| path_value(&p))
        .ok_or_else(|| {
            format!(
                "no .git directory above {}",
                state.frame.unit_dir.display()
            )
        })
}

fn find_in_parent_folders(args: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    let name = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or("terragrunt.hcl");
    let mut dir = state.frame.unit_dir.parent().map(Path::to_path_buf);
    while let Some(current_dir) = dir {
        let candidate = current_dir.join(name);
        if candidate.exists() {
            return Ok(path_value(&candidate));
        }
        dir = current_dir.parent().map(Path::to_path_buf);
    }
    // Second argument is a fallback returned instead of failing.
    match args.get(1).and_then(Value::as_str) {
        Some(fallback) => Ok(Value::String(fallback.to_string())),
        None => Err(format!(
            "{} not found in any parent of {}",
            name,
            state.frame.unit_dir.display()
        )),
    }
}

fn get_terraform_command(_: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    Ok(Value::String(state.frame.command.clone()))
}

fn get_env(args: FuncArgs) -> Result<Value, String> {
    let name = args[0].as_str().unwrap_or_default();
    match std::env::var(name) {
        Ok(value) => Ok(Value::String(value)),
        Err(_) => match args.get(1).and_then(Value::as_str) {
            Some(default) => Ok(Value::String(default.to_string())),
            None => Err(format!("environment variable {name} is not set")),
        },
    }
}

fn get_platform(_: FuncArgs) -> Result<Value, String> {
    Ok(Value::String(std::env::consts::OS.to_string()))
}

fn get_terraform_commands_that_need_vars(_: FuncArgs) -> Result<Value, String> {
    Ok(Value::Array(
        COMMANDS_THAT_NEED_VARS
            .iter()
            .map(|c| Value::String(c.to_string()))
            .collect(),
    ))
}

/// Validates that the file exists and returns its path unchanged; units
/// use it to declare a file as a config input without parsing it.
fn mark_as_read(args: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    let path = resolve_relative(&state.frame.unit_dir, args[0].as_str().unwrap_or_default());
    if !path.exists() {
        return Err(format!("mark_as_read: {} does not exist", path.display()));
    }
    Ok(path_value(&path))
}

fn jsondecode(args: FuncArgs) -> Result<Value, String> {
    let text = args[0].as_str().unwrap_or_default();
    let json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("jsondecode: {e}"))?;
    Ok(json_to_value(&json))
}

fn jsonencode(args: FuncArgs) -> Result<Value, String> {
    serde_json::to_string(&value_to_json(&args[0]))
        .map(Value::String)
        .map_err(|e| format!("jsonencode: {e}"))
}

fn yamldecode(args: FuncArgs) -> Result<Value, String> {
    let text = args[0].as_str().unwrap_or_default();
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| format!("yamldecode: {e}"))?;
    Ok(yaml_to_value(&yaml))
}

fn yamlencode(args: FuncArgs) -> Result<Value, String> {
    serde_yaml::to_string(&value_to_yaml(&args[0]))
        .map(Value::String)
        .map_err(|e| format!("yamlencode: {e}"))
}

fn tomldecode(args: FuncArgs) -> Result<Value, String> {
    let text = args[0].as_str().unwrap_or_default();
    let parsed: toml::Value = toml::from_str(text).map_err(|e| format!("tomldecode: {e}"))?;
    let json = serde_json::to_value(parsed).map_err(|e| format!("tomldecode: {e}"))?;
    Ok(json_to_value(&json))
}

fn tomlencode(args: FuncArgs) -> Result<Value, String> {
    let json = value_to_json(&args[0]);
    let toml_value: toml::Value =
        serde_json::from_value(json).map_err(|e| format!("tomlencode: {e}"))?;
    toml::to_string(&toml_value)
        .map(Value::String)
        .map_err(|e| format!("tomlencode: {e}"))
}

fn merge(args: FuncArgs) -> Result<Value, String> {
    let mut out = hcl::Map::new();
    for arg in args.iter() {
        match arg {
            Value::Object(map) => out.extend(map.clone()),
            Value::Null => {}
            other => return Err(format!("merge: expected objects, got {other}")),
        }
    }
    Ok(Value::Object(out))
}

fn contains(args: FuncArgs) -> Result<Value, String> {
    let found = match &args[0] {
        Value::Array(items) => items.contains(&args[1]),
        _ => false,
    };
    Ok(Value::Bool(found))
}

fn timestamp(_: FuncArgs) -> Result<Value, String> {
    Ok(Value::String(
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    ))
}

fn formatdate(args: FuncArgs) -> Result<Value, String> {
    let spec = args[0].as_str().unwrap_or_default();
    let ts = args[1].as_str().unwrap_or_default();
    let parsed =
        chrono::DateTime::parse_from_rfc3339(ts).map_err(|e| format!("formatdate: {e}"))?;
    Ok(Value::String(
        parsed.format(&date_spec_to_strftime(spec)).to_string(),
    ))
}

fn run_cmd(args: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    let mut words: Vec<&str> = args.iter().filter_map(Value::as_str).collect();
    let quiet = words.first() == Some(&"--terragrunt-quiet");
    if quiet {
        words.remove(0);
    }
    let (prog, rest) = words
        .split_first()
        .ok_or_else(|| "run_cmd: no command given".to_string())?;

    let key = format!(
        "run_cmd:{}:{}",
        state.frame.unit_dir.display(),
        words.join("\u{1f}")
    );
    let prog = prog.to_string();
    let rest: Vec<String> = rest.iter().map(|s| s.to_string()).collect();
    let dir = state.frame.unit_dir.clone();
    state.cache.get_or_insert_with(&key, move || {
        let output = std::process::Command::new(&prog)
            .args(&rest)
            .current_dir(&dir)
            .output()
            .map_err(|e| format!("run_cmd: failed to spawn {prog}: {e}"))?;
        if !output.status.success() {
            return Err(format!(
                "run_cmd: {prog} exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !quiet {
            debug!("run_cmd {prog}: {}", stdout.trim_end());
        }
        Ok(Value::String(stdout.trim_end().to_string()))
    })
}

fn sops_decrypt_file(args: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    let path = resolve_relative(&state.frame.unit_dir, args[0].as_str().unwrap_or_default());
    let key = format!("sops:{}", path.display());
    state.cache.get_or_insert_with(&key, || {
        let output = std::process::Command::new("sops")
            .arg("-d")
            .arg(&path)
            .output()
            .map_err(|e| format!("sops_decrypt_file: failed to spawn sops: {e}"))?;
        if !output.status.success() {
            return Err(format!(
                "sops_decrypt_file: sops exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(Value::String(
            String::from_utf8_lossy(&output.stdout).to_string(),
        ))
    })
}

fn read_terragrunt_config(args: FuncArgs) -> Result<Value, String> {
    let state = current()?;
    let read = state
        .read_config
        .as_ref()
        .ok_or_else(|| "read_terragrunt_config is not available here".to_string())?;
    read(&PathBuf::from(args[0].as_str().unwrap_or_default()))
}

/// Translates the `YYYY-MM-DD`-style format spec into a strftime pattern.
fn date_spec_to_strftime(spec: &str) -> String {
    // Longest tokens first so YYYY is not consumed as two YYs.
    const TOKENS: &[(&str, &str)] = &[
        ("YYYY", "%Y"),
        ("YY", "%y"),
        ("MMM", "%b"),
        ("MM", "%m"),
        ("DD", "%d"),
        ("hh", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("ZZZ", "%Z"),
        ("Z", "%z"),
    ];
    let mut out = String::new();
    let mut rest = spec;
    'outer: while !rest.is_empty() {
        for (token, strftime) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(strftime);
                rest = tail;
                continue 'outer;
            }
        }
        let ch = rest.chars().next().unwrap();
        if ch == '%' {
            out.push_str("%%");
        } else {
            out.push(ch);
        }
        rest = &rest[ch.len_utf8()..];
    }
    out
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

fn resolve_relative(base: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        base.join(p)
    }
}

/// Walks up from `start` looking for a directory entry named `marker`.
fn find_upwards(start: &Path, marker: &str) -> Option<PathBuf> {
    let mut dir = Some(start.to_path_buf());
    while let Some(current) = dir {
        if current.join(marker).exists() {
            return Some(current);
        }
        dir = current.parent().map(Path::to_path_buf);
    }
    None
}
