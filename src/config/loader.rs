//! The config loader.
//!
//! Produces the effective configuration for one unit by executing a fixed
//! evaluation order. The order is part of the external contract because
//! users encode assumptions about it:
//!
//! 1. Parse the unit's own file (HCL or JSON variant).
//! 2. Evaluate `include` blocks and recursively load included files
//!    (cycle-detected).
//! 3. Evaluate `locals`, which may reference exposed includes and earlier
//!    locals.
//! 4. Evaluate the authentication attributes.
//! 5. Evaluate the `dependencies` block.
//! 6. Evaluate `dependency` blocks, fetching outputs through the
//!    [`DependencyOutputs`] resolver.
//! 7. Evaluate all remaining blocks.
//! 8. Merge each include's effective config into the result.
//!
//! Later-parsed scopes may reference earlier-parsed scopes, never the
//! reverse. The discovery pass runs the loader with the sentinel resolver
//! so dependency outputs are never fetched while the DAG is being built.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hcl::eval::{Context, Evaluate};
use hcl::expr::Expression;
use hcl::structure::{Block, Body};
use hcl::{Map, Value};
use tracing::debug;

use crate::error::{StratusError, StratusResult};
use crate::eval::functions::{
    enter_frame, register_builtins, EffectCache, FrameState, ReadConfigFn,
};
use crate::eval::{contains_sentinel, sentinel, EvalFrame};

use super::include::{merge_included, MergeMode};
use super::json::json_to_body;
use super::schema::{
    DependencyBinding, ExcludeSpec, ExtraArguments, GenerateBlock, Hook, IamAssume, IgnoreSpec,
    MergeStrategy, OnExists, PartialConfig, RemoteState, RemoteStateGenerate, RetrySpec,
    UnitConfig,
};

/// Blocks the configuration surface accepts. Anything else is a parse error.
const KNOWN_BLOCKS: &[&str] = &[
    "include",
    "locals",
    "dependency",
    "dependencies",
    "terraform",
    "remote_state",
    "generate",
    "errors",
    "exclude",
    "feature",
    "catalog",
];

/// Top-level attributes the configuration surface accepts.
const KNOWN_ATTRIBUTES: &[&str] = &[
    "inputs",
    "iam_role",
    "iam_assume_role_duration",
    "iam_assume_role_session_name",
    "iam_web_identity_token",
    "auth_provider_cmd",
    "terraform_version_constraint",
    "terragrunt_version_constraint",
];

/// Options shared by every load performed in one run.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// The run root.
    pub working_dir: PathBuf,
    /// The external subcommand being run. Empty during discovery.
    pub command: String,
    /// Path of the external IaC binary.
    pub tf_path: String,
    /// Feature-flag overrides from `--feature` / `TERRAGRUNT_FEATURE`.
    pub feature_overrides: Map<String, Value>,
}

impl LoadOptions {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            command: String::new(),
            tf_path: "tofu".to_string(),
            feature_overrides: Map::new(),
        }
    }
}

/// Resolves the outputs of a named dependency when step 6 needs them.
///
/// The runner installs a resolver that shells out to the IaC binary; the
/// discovery pass installs [`SentinelOutputs`] so no state is touched while
/// the DAG is being built.
pub trait DependencyOutputs: Send + Sync {
    fn outputs(&self, binding: &DependencyBinding, command: &str) -> StratusResult<Value>;
}

/// Resolver for the discovery pass: every dependency's outputs evaluate to
/// the sentinel, which is tolerated by blocks that do not need real values.
pub struct SentinelOutputs;

impl DependencyOutputs for SentinelOutputs {
    fn outputs(&self, _binding: &DependencyBinding, _command: &str) -> StratusResult<Value> {
        Ok(sentinel())
    }
}

/// Loads effective configurations, memoising reads within one run.
pub struct ConfigLoader {
    opts: LoadOptions,
    resolver: Arc<dyn DependencyOutputs>,
    effect_cache: Arc<EffectCache>,
    /// Include/read chain for cycle detection. Loading is single-threaded
    /// per unit; the lock only guards re-entry from builtin callbacks.
    visiting: Mutex<Vec<PathBuf>>,
    /// Memoised `read_terragrunt_config` results.
    read_cache: Mutex<HashMap<PathBuf, Value>>,
}

struct Loaded {
    config: UnitConfig,
    include_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    pub fn new(opts: LoadOptions, resolver: Arc<dyn DependencyOutputs>) -> Arc<Self> {
        Arc::new(Self {
            opts,
            resolver,
            effect_cache: EffectCache::new(),
            visiting: Mutex::new(Vec::new()),
            read_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Loads the full effective config for a unit. Dependency outputs are
    /// fetched through the resolver installed at construction.
    pub fn load(self: &Arc<Self>, config_path: &Path) -> StratusResult<UnitConfig> {
        let path = normalize_path(&absolute(config_path, &self.opts.working_dir));
        let frame = Arc::new(self.unit_frame(&path));
        let loaded = self.load_file(&path, frame, false)?;
        Ok(loaded.config)
    }

    /// Full load with sentinel outputs and lenient handling of blocks that
    /// would need real values. Used by commands that read `remote_state`
    /// or `catalog` without running the unit.
    pub fn load_tolerant(self: &Arc<Self>, config_path: &Path) -> StratusResult<UnitConfig> {
        let path = normalize_path(&absolute(config_path, &self.opts.working_dir));
        let frame = Arc::new(self.unit_frame(&path));
        self.load_lenient(&path, frame).map(|loaded| loaded.config)
    }

    /// Discovery-pass parse: same evaluation order, sentinel outputs, and
    /// lenient handling of blocks that would need real outputs.
    pub fn partial(self: &Arc<Self>, config_path: &Path) -> StratusResult<PartialConfig> {
        let path = normalize_path(&absolute(config_path, &self.opts.working_dir));
        let frame = Arc::new(self.unit_frame(&path));
        let loaded = self.load_lenient(&path, frame)?;
        Ok(PartialConfig {
            config_path: loaded.config.config_path.clone(),
            unit_dir: loaded.config.unit_dir.clone(),
            dependency_paths: loaded.config.dependency_paths(),
            include_paths: loaded.include_paths,
            source: loaded.config.terraform.source.clone(),
            exclude: loaded.config.exclude.clone(),
        })
    }

    fn unit_frame(&self, path: &Path) -> EvalFrame {
        EvalFrame::for_unit(path, &self.opts.working_dir)
            .with_command(&self.opts.command)
            .with_tf_path(&self.opts.tf_path)
    }

    fn load_lenient(self: &Arc<Self>, path: &Path, frame: Arc<EvalFrame>) -> StratusResult<Loaded> {
        // Sentinel resolver regardless of what the runner installed.
        let discovery = Arc::new(Self {
            opts: self.opts.clone(),
            resolver: Arc::new(SentinelOutputs),
            effect_cache: self.effect_cache.clone(),
            visiting: Mutex::new(Vec::new()),
            read_cache: Mutex::new(HashMap::new()),
        });
        discovery.load_file(path, frame, true)
    }

    fn load_file(
        self: &Arc<Self>,
        config_path: &Path,
        frame: Arc<EvalFrame>,
        lenient: bool,
    ) -> StratusResult<Loaded> {
        {
            let mut visiting = self.visiting.lock().unwrap();
            if visiting.contains(&config_path.to_path_buf()) {
                let mut chain: Vec<String> =
                    visiting.iter().map(|p| p.display().to_string()).collect();
                chain.push(config_path.display().to_string());
                return Err(StratusError::Cycle { chain });
            }
            visiting.push(config_path.to_path_buf());
        }
        let result = self.load_file_inner(config_path, frame, lenient);
        self.visiting.lock().unwrap().pop();
        result
    }

    fn load_file_inner(
        self: &Arc<Self>,
        config_path: &Path,
        frame: Arc<EvalFrame>,
        lenient: bool,
    ) -> StratusResult<Loaded> {
        debug!("loading {}", config_path.display());
        let text = std::fs::read_to_string(config_path)
            .map_err(|e| StratusError::parse(config_path, format!("cannot read file: {e}")))?;

        let body = if config_path.extension().is_some_and(|ext| ext == "json") {
            let doc: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| StratusError::parse(config_path, e.to_string()))?;
            json_to_body(&doc).map_err(|e| StratusError::parse(config_path, e))?
        } else {
            hcl::parse(&text).map_err(|e| StratusError::parse(config_path, e.to_string()))?
        };

        self.check_catalogue(config_path, &body)?;

        let file_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut config = UnitConfig::new(config_path);

        // Stack-generated units find their values mapping next to the
        // config file; it is in scope for every later step.
        let values = self.load_values_file(&file_dir, &frame)?;

        // Step 2: includes.
        let includes = self.eval_includes(config_path, &file_dir, &body, &frame, lenient)?;
        let include_paths: Vec<PathBuf> = includes.iter().map(|i| i.path.clone()).collect();
        let mut exposed = Map::new();
        for include in &includes {
            if include.expose && !include.name.is_empty() {
                exposed.insert(include.name.clone(), include.config.expose_value());
            }
        }
        let include_value = Value::Object(exposed);

        // Step 3: locals.
        config.locals = self.eval_locals(config_path, &body, &frame, &include_value, &values)?;

        let scope = Scope {
            include: include_value,
            locals: Value::Object(config.locals.clone()),
            dependency: Value::Null,
            feature: Value::Null,
            values: values.clone(),
        };

        // Step 4: authentication attributes.
        self.eval_auth(config_path, &body, &frame, &scope, &mut config)?;

        // Step 5: the order-only `dependencies` block.
        for block in blocks(&body, "dependencies") {
            let ctx = self.context(&scope);
            if let Some(expr) = attr_expr(block, "paths") {
                let value = self.eval_expr(config_path, expr, &ctx, &frame, "dependencies")?;
                for entry in crate::eval::expect_string_list(&value, config_path, "paths")? {
                    config
                        .dependencies
                        .insert(normalize_path(&absolute(Path::new(&entry), &file_dir)));
                }
            }
        }

        // Step 6: `dependency` blocks, resolving outputs on demand.
        let mut dependency_values = Map::new();
        for block in blocks(&body, "dependency") {
            let binding =
                self.eval_dependency_block(config_path, &file_dir, block, &frame, &scope)?;
            let outputs = self.resolver.outputs(&binding, &self.opts.command)?;
            let mut entry = Map::new();
            entry.insert("outputs".to_string(), outputs);
            dependency_values.insert(binding.name.clone(), Value::Object(entry));
            config.dependency_bindings.push(binding);
        }

        let scope = Scope {
            dependency: Value::Object(dependency_values),
            ..scope
        };

        // Step 7: feature flags first, then everything else.
        self.eval_features(config_path, &body, &frame, &scope, &mut config)?;
        let scope = Scope {
            feature: Value::Object(config.feature_flags.clone()),
            ..scope
        };

        self.eval_terraform(config_path, &file_dir, &body, &frame, &scope, &mut config)?;
        self.eval_remote_state(config_path, &body, &frame, &scope, &mut config)?;
        self.eval_generate(config_path, &body, &frame, &scope, &mut config, lenient)?;
        self.eval_errors(config_path, &body, &frame, &scope, &mut config)?;
        self.eval_exclude(config_path, &body, &frame, &scope, &mut config)?;
        self.eval_catalog(config_path, &body, &frame, &scope, &mut config)?;
        self.eval_top_attrs(config_path, &body, &frame, &scope, &mut config, lenient)?;

        // Step 8: merge includes in declaration order. Only one remote_state
        // survives: merge_included keeps the child's when both set one.
        for include in includes {
            merge_included(&mut config, include.config, include.merge);
        }

        Ok(Loaded {
            config,
            include_paths,
        })
    }

    fn check_catalogue(&self, path: &Path, body: &Body) -> StratusResult<()> {
        for block in body.blocks() {
            if !KNOWN_BLOCKS.contains(&block.identifier()) {
                return Err(StratusError::parse(
                    path,
                    format!("unknown block type {:?}", block.identifier()),
                ));
            }
        }
        for attr in body.attributes() {
            if !KNOWN_ATTRIBUTES.contains(&attr.key()) {
                return Err(StratusError::parse(
                    path,
                    format!("unknown attribute {:?}", attr.key()),
                ));
            }
        }
        Ok(())
    }

    /// Reads `terragrunt.values.hcl` when the stack expander left one next
    /// to the config file.
    fn load_values_file(
        self: &Arc<Self>,
        file_dir: &Path,
        frame: &Arc<EvalFrame>,
    ) -> StratusResult<Value> {
        let path = file_dir.join(crate::stack::VALUES_FILE);
        if !path.is_file() {
            return Ok(Value::Null);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| StratusError::parse(&path, format!("cannot read file: {e}")))?;
        let body = hcl::parse(&text).map_err(|e| StratusError::parse(&path, e.to_string()))?;
        let ctx = self.context(&Scope::empty());
        let mut values = Map::new();
        for attr in body.attributes() {
            let value = self.eval_expr(&path, attr.expr(), &ctx, frame, "values")?;
            values.insert(attr.key().to_string(), value);
        }
        Ok(Value::Object(values))
    }

    fn eval_includes(
        self: &Arc<Self>,
        config_path: &Path,
        file_dir: &Path,
        body: &Body,
        frame: &Arc<EvalFrame>,
        lenient: bool,
    ) -> StratusResult<Vec<Include>> {
        let mut includes = Vec::new();
        for block in blocks(body, "include") {
            let name = block
                .labels()
                .first()
                .map(|l| l.as_str().to_string())
                .unwrap_or_default();

            // Only functions are in scope for the include path; locals are
            // evaluated later and may themselves reference the include.
            let ctx = self.context(&Scope::empty());
            let path_expr = attr_expr(block, "path").ok_or_else(|| {
                StratusError::parse(config_path, "include block has no path attribute")
            })?;
            let path_value = self.eval_expr(config_path, path_expr, &ctx, frame, "include")?;
            let rel = crate::eval::expect_string(&path_value, config_path, "include.path")?;
            let included_path = normalize_path(&absolute(Path::new(&rel), file_dir));

            let expose = match attr_expr(block, "expose") {
                Some(expr) => {
                    let v = self.eval_expr(config_path, expr, &ctx, frame, "include")?;
                    crate::eval::expect_bool(&v, config_path, "include.expose")?
                }
                None => false,
            };
            let merge =
                match attr_expr(block, "merge_strategy").or_else(|| attr_expr(block, "merge")) {
                    Some(expr) => {
                        let v = self.eval_expr(config_path, expr, &ctx, frame, "include")?;
                        MergeMode::parse(&v).ok_or_else(|| {
                            StratusError::eval(config_path, format!("invalid merge mode {v}"))
                        })?
                    }
                    None => MergeMode::NoMerge,
                };

            let included_frame = Arc::new(frame.for_include(&included_path));
            let loaded = self.load_file(&included_path, included_frame, lenient)?;

            includes.push(Include {
                name,
                path: included_path,
                expose,
                merge,
                config: loaded.config,
            });
        }
        Ok(includes)
    }

    /// Evaluates `locals` with a fixed-point loop so attributes may
    /// reference earlier siblings in any declaration order.
    fn eval_locals(
        self: &Arc<Self>,
        config_path: &Path,
        body: &Body,
        frame: &Arc<EvalFrame>,
        include_value: &Value,
        values: &Value,
    ) -> StratusResult<Map<String, Value>> {
        let mut pending: Vec<(String, &Expression)> = Vec::new();
        for block in blocks(body, "locals") {
            for attr in block.body().attributes() {
                pending.push((attr.key().to_string(), attr.expr()));
            }
        }

        let mut locals = Map::new();
        let mut last_err = None;
        while !pending.is_empty() {
            let mut progressed = false;
            let mut still_pending = Vec::new();
            for (key, expr) in pending {
                let scope = Scope {
                    include: include_value.clone(),
                    locals: Value::Object(locals.clone()),
                    dependency: Value::Null,
                    feature: Value::Null,
                    values: values.clone(),
                };
                let ctx = self.context(&scope);
                match self.eval_expr(config_path, expr, &ctx, frame, "locals") {
                    Ok(value) => {
                        locals.insert(key, value);
                        progressed = true;
                    }
                    Err(e) => {
                        last_err = Some(e.to_string());
                        still_pending.push((key, expr));
                    }
                }
            }
            pending = still_pending;
            if !progressed {
                let names: Vec<_> = pending.iter().map(|(k, _)| k.as_str()).collect();
                return Err(scope_error(
                    config_path,
                    "locals",
                    &format!(
                        "cannot evaluate locals {}: {}",
                        names.join(", "),
                        last_err.unwrap_or_default()
                    ),
                ));
            }
        }
        Ok(locals)
    }

    fn eval_auth(
        self: &Arc<Self>,
        config_path: &Path,
        body: &Body,
        frame: &Arc<EvalFrame>,
        scope: &Scope,
        config: &mut UnitConfig,
    ) -> StratusResult<()> {
        let ctx = self.context(scope);
        let mut role_arn = None;
        let mut session_name = None;
        let mut duration = None;
        let mut token = None;

        for attr in body.attributes() {
            match attr.key() {
                "iam_role" => {
                    let v = self.eval_expr(config_path, attr.expr(), &ctx, frame, "iam_role")?;
                    role_arn = Some(crate::eval::expect_string(&v, config_path, "iam_role")?);
                }
                "iam_assume_role_session_name" => {
                    let v = self.eval_expr(config_path, attr.expr(), &ctx, frame, "iam_role")?;
                    session_name = Some(crate::eval::expect_string(
                        &v,
                        config_path,
                        "iam_assume_role_session_name",
                    )?);
                }
                "iam_assume_role_duration" => {
                    let v = self.eval_expr(config_path, attr.expr(), &ctx, frame, "iam_role")?;
                    duration = number_as_u64(&v);
                }
                "iam_web_identity_token" => {
                    let v = self.eval_expr(config_path, attr.expr(), &ctx, frame, "iam_role")?;
                    token = Some(crate::eval::expect_string(
                        &v,
                        config_path,
                        "iam_web_identity_token",
                    )?);
                }
                _ => {}
            }
        }

        // Environment overrides win over config attributes.
        if let Ok(env_role) = std::env::var("TERRAGRUNT_IAM_ROLE") {
            if !env_role.is_empty() {
                role_arn = Some(env_role);
            }
        }
        if let Ok(env_token) = std::env::var("TERRAGRUNT_IAM_WEB_IDENTITY_TOKEN") {
            if !env_token.is_empty() {
                token = Some(env_token);
            }
        }

        if let Some(role_arn) = role_arn {
            config.iam_assume = Some(IamAssume {
                role_arn,
                session_name,
                duration_secs: duration,
                web_identity_token: token,
            });
        }
        Ok(())
    }

    fn eval_dependency_block(
        self: &Arc<Self>,
        config_path: &Path,
        file_dir: &Path,
        block: &Block,
        frame: &Arc<EvalFrame>,
        scope: &Scope,
    ) -> StratusResult<DependencyBinding> {
        let name = block
            .labels()
            .first()
            .map(|l| l.as_str().to_string())
            .ok_or_else(|| StratusError::parse(config_path, "dependency block needs a name"))?;
        let ctx = self.context(scope);

        let path_expr = attr_expr(block, "config_path").ok_or_else(|| {
            StratusError::parse(
                config_path,
                format!("dependency {name:?} has no config_path"),
            )
        })?;
        let path_value = self.eval_expr(config_path, path_expr, &ctx, frame, "dependency")?;
        let rel = crate::eval::expect_string(&path_value, config_path, "config_path")?;
        let dep_dir = normalize_path(&absolute(Path::new(&rel), file_dir));

        let mock_outputs = match attr_expr(block, "mock_outputs") {
            Some(expr) => Some(self.eval_expr(config_path, expr, &ctx, frame, "dependency")?),
            None => None,
        };
        let mock_outputs_allowed_commands =
            match attr_expr(block, "mock_outputs_allowed_commands") {
                Some(expr) => {
                    let v = self.eval_expr(config_path, expr, &ctx, frame, "dependency")?;
                    Some(crate::eval::expect_string_list(
                        &v,
                        config_path,
                        "mock_outputs_allowed_commands",
                    )?)
                }
                None => None,
            };
        let skip_outputs = match attr_expr(block, "skip_outputs") {
            Some(expr) => {
                let v = self.eval_expr(config_path, expr, &ctx, frame, "dependency")?;
                crate::eval::expect_bool(&v, config_path, "skip_outputs")?
            }
            None => false,
        };
        let merge_strategy = match attr_expr(block, "mock_outputs_merge_strategy_with_state") {
            Some(expr) => {
                let v = self.eval_expr(config_path, expr, &ctx, frame, "dependency")?;
                let s = crate::eval::expect_string(
                    &v,
                    config_path,
                    "mock_outputs_merge_strategy_with_state",
                )?;
                MergeStrategy::parse(&s).ok_or_else(|| {
                    StratusError::eval(config_path, format!("invalid merge strategy {s:?}"))
                })?
            }
            None => MergeStrategy::NoMerge,
        };

        Ok(DependencyBinding {
            name,
            config_path: dep_dir,
            mock_outputs,
            mock_outputs_allowed_commands,
            skip_outputs,
            merge_strategy,
        })
    }

    fn eval_features(
        self: &Arc<Self>,
        config_path: &Path,
        body: &Body,
        frame: &Arc<EvalFrame>,
        scope: &Scope,
        config: &mut UnitConfig,
    ) -> StratusResult<()> {
        for block in blocks(body, "feature") {
            let name = block
                .labels()
                .first()
                .map(|l| l.as_str().to_string())
                .ok_or_else(|| StratusError::parse(config_path, "feature block needs a name"))?;
            let ctx = self.context(scope);
            let default = match attr_expr(block, "default") {
                Some(expr) => self.eval_expr(config_path, expr, &ctx, frame, "feature")?,
                None => Value::Null,
            };
            let value = self
                .opts
                .feature_overrides
                .get(&name)
                .cloned()
                .unwrap_or(default);
            config.feature_flags.insert(name, value);
        }
        Ok(())
    }

    fn eval_terraform(
        self: &Arc<Self>,
        config_path: &Path,
        file_dir: &Path,
        body: &Body,
        frame: &Arc<EvalFrame>,
        scope: &Scope,
        config: &mut UnitConfig,
    ) -> StratusResult<()> {
        for block in blocks(body, "terraform") {
            let ctx = self.context(scope);
            if let Some(expr) = attr_expr(block, "source") {
                let v = self.eval_expr(config_path, expr, &ctx, frame, "terraform")?;
                config.terraform.source =
                    Some(crate::eval::expect_string(&v, config_path, "source")?);
            }
            if let Some(expr) = attr_expr(block, "copy_terraform_lock_file") {
                let v = self.eval_expr(config_path, expr, &ctx, frame, "terraform")?;
                config.terraform.copy_terraform_lock_file =
                    crate::eval::expect_bool(&v, config_path, "copy_terraform_lock_file")?;
            }

            for hook_kind in ["before_hook", "after_hook", "error_hook"] {
                for hook_block in blocks(block.body(), hook_kind) {
                    let hook =
                        self.eval_hook(config_path, file_dir, hook_block, &ctx, frame)?;
                    match hook_kind {
                        "before_hook" => config.before_hooks.push(hook),
                        "after_hook" => config.after_hooks.push(hook),
                        _ => config.error_hooks.push(hook),
                    }
                }
            }

            for extra in blocks(block.body(), "extra_arguments") {
                let parsed =
                    self.eval_extra_arguments(config_path, file_dir, extra, &ctx, frame)?;
                config.terraform.extra_arguments.push(parsed);
            }
        }
        Ok(())
    }

    fn eval_hook(
        self: &Arc<Self>,
        config_path: &Path,
        file_dir: &Path,
        block: &Block,
        ctx: &Context<'_>,
        frame: &Arc<EvalFrame>,
    ) -> StratusResult<Hook> {
        let name = block
            .labels()
            .first()
            .map(|l| l.as_str().to_string())
            .ok_or_else(|| StratusError::parse(config_path, "hook block needs a name"))?;
        let commands = match attr_expr(block, "commands") {
            Some(expr) => crate::eval::expect_string_list(
                &self.eval_expr(config_path, expr, ctx, frame, "terraform")?,
                config_path,
                "commands",
            )?,
            None => Vec::new(),
        };
        let execute = match attr_expr(block, "execute") {
            Some(expr) => crate::eval::expect_string_list(
                &self.eval_expr(config_path, expr, ctx, frame, "terraform")?,
                config_path,
                "execute",
            )?,
            None => Vec::new(),
        };
        if execute.is_empty() {
            return Err(StratusError::parse(
                config_path,
                format!("hook {name:?} has an empty execute list"),
            ));
        }
        let working_dir = match attr_expr(block, "working_dir") {
            Some(expr) => {
                let v = self.eval_expr(config_path, expr, ctx, frame, "terraform")?;
                let s = crate::eval::expect_string(&v, config_path, "working_dir")?;
                Some(normalize_path(&absolute(Path::new(&s), file_dir)))
            }
            None => None,
        };
        let suppress_failure = match attr_expr(block, "suppress_failure") {
            Some(expr) => crate::eval::expect_bool(
                &self.eval_expr(config_path, expr, ctx, frame, "terraform")?,
                config_path,
                "suppress_failure",
            )?,
            None => false,
        };
        Ok(Hook {
            name,
            commands,
            execute,
            working_dir,
            suppress_failure,
        })
    }

    fn eval_extra_arguments(
        self: &Arc<Self>,
        config_path: &Path,
        file_dir: &Path,
        block: &Block,
        ctx: &Context<'_>,
        frame: &Arc<EvalFrame>,
    ) -> StratusResult<ExtraArguments> {
        let name = block
            .labels()
            .first()
            .map(|l| l.as_str().to_string())
            .ok_or_else(|| StratusError::parse(config_path, "extra_arguments block needs a name"))?;
        let commands = match attr_expr(block, "commands") {
            Some(expr) => crate::eval::expect_string_list(
                &self.eval_expr(config_path, expr, ctx, frame, "terraform")?,
                config_path,
                "commands",
            )?,
            None => Vec::new(),
        };
        let arguments = match attr_expr(block, "arguments") {
            Some(expr) => crate::eval::expect_string_list(
                &self.eval_expr(config_path, expr, ctx, frame, "terraform")?,
                config_path,
                "arguments",
            )?,
            None => Vec::new(),
        };
        let env_vars = match attr_expr(block, "env_vars") {
            Some(expr) => match self.eval_expr(config_path, expr, ctx, frame, "terraform")? {
                Value::Object(map) => map,
                other => {
                    return Err(StratusError::eval(
                        config_path,
                        format!("env_vars must be an object, got {other}"),
                    ))
                }
            },
            None => Map::new(),
        };
        let var_files = |key: &str| -> StratusResult<Vec<PathBuf>> {
            match attr_expr(block, key) {
                Some(expr) => {
                    let list = crate::eval::expect_string_list(
                        &self.eval_expr(config_path, expr, ctx, frame, "terraform")?,
                        config_path,
                        key,
                    )?;
                    Ok(list
                        .into_iter()
                        .map(|s| normalize_path(&absolute(Path::new(&s), file_dir)))
                        .collect())
                }
                None => Ok(Vec::new()),
            }
        };
        let required_var_files = var_files("required_var_files")?;
        let optional_var_files = var_files("optional_var_files")?;
        Ok(ExtraArguments {
            name,
            commands,
            arguments,
            env_vars,
            required_var_files,
            optional_var_files,
        })
    }

    fn eval_remote_state(
        self: &Arc<Self>,
        config_path: &Path,
        body: &Body,
        frame: &Arc<EvalFrame>,
        scope: &Scope,
        config: &mut UnitConfig,
    ) -> StratusResult<()> {
        let mut seen = false;
        for block in blocks(body, "remote_state") {
            if seen {
                return Err(StratusError::parse(
                    config_path,
                    "only one remote_state block is allowed",
                ));
            }
            seen = true;
            let ctx = self.context(scope);
            let backend = match attr_expr(block, "backend") {
                Some(expr) => crate::eval::expect_string(
                    &self.eval_expr(config_path, expr, &ctx, frame, "remote_state")?,
                    config_path,
                    "backend",
                )?,
                None => {
                    return Err(StratusError::parse(
                        config_path,
                        "remote_state block has no backend",
                    ))
                }
            };
            let rs_config = match attr_expr(block, "config") {
                Some(expr) => {
                    match self.eval_expr(config_path, expr, &ctx, frame, "remote_state")? {
                        Value::Object(map) => map,
                        other => {
                            return Err(StratusError::eval(
                                config_path,
                                format!("remote_state.config must be an object, got {other}"),
                            ))
                        }
                    }
                }
                None => Map::new(),
            };
            let generate = match attr_expr(block, "generate") {
                Some(expr) => {
                    let v = self.eval_expr(config_path, expr, &ctx, frame, "remote_state")?;
                    Some(self.parse_remote_state_generate(config_path, &v)?)
                }
                None => None,
            };
            let disable_init = match attr_expr(block, "disable_init") {
                Some(expr) => crate::eval::expect_bool(
                    &self.eval_expr(config_path, expr, &ctx, frame, "remote_state")?,
                    config_path,
                    "disable_init",
                )?,
                None => false,
            };
            config.remote_state = Some(RemoteState {
                backend,
                generate,
                config: rs_config,
                disable_init,
            });
        }
        Ok(())
    }

    fn parse_remote_state_generate(
        &self,
        config_path: &Path,
        value: &Value,
    ) -> StratusResult<RemoteStateGenerate> {
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(StratusError::eval(
                    config_path,
                    format!("remote_state.generate must be an object, got {other}"),
                ))
            }
        };
        let path = map
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StratusError::eval(config_path, "remote_state.generate needs a path"))?;
        let if_exists = map
            .get("if_exists")
            .and_then(|v| v.as_str())
            .map(|s| {
                OnExists::parse(s).ok_or_else(|| {
                    StratusError::eval(config_path, format!("invalid if_exists {s:?}"))
                })
            })
            .transpose()?
            .unwrap_or(OnExists::OverwriteIfManaged);
        let path = PathBuf::from(path);
        validate_generate_target(config_path, &path)?;
        Ok(RemoteStateGenerate { path, if_exists })
    }

    fn eval_generate(
        self: &Arc<Self>,
        config_path: &Path,
        body: &Body,
        frame: &Arc<EvalFrame>,
        scope: &Scope,
        config: &mut UnitConfig,
        lenient: bool,
    ) -> StratusResult<()> {
        for block in blocks(body, "generate") {
            let name = block
                .labels()
                .first()
                .map(|l| l.as_str().to_string())
                .ok_or_else(|| StratusError::parse(config_path, "generate block needs a name"))?;
            let ctx = self.context(scope);
            let path = match attr_expr(block, "path") {
                Some(expr) => crate::eval::expect_string(
                    &self.eval_expr(config_path, expr, &ctx, frame, "generate")?,
                    config_path,
                    "path",
                )?,
                None => {
                    return Err(StratusError::parse(
                        config_path,
                        format!("generate {name:?} has no path"),
                    ))
                }
            };
            let contents = match attr_expr(block, "contents") {
                Some(expr) => {
                    let v = self.eval_expr(config_path, expr, &ctx, frame, "generate")?;
                    if contains_sentinel(&v) {
                        if lenient {
                            continue;
                        }
                        return Err(scope_error(
                            config_path,
                            "generate",
                            "generate contents reference dependency outputs that are not \
                             available in this pass",
                        ));
                    }
                    crate::eval::expect_string(&v, config_path, "contents")?
                }
                None => String::new(),
            };
            let if_exists = match attr_expr(block, "if_exists") {
                Some(expr) => {
                    let s = crate::eval::expect_string(
                        &self.eval_expr(config_path, expr, &ctx, frame, "generate")?,
                        config_path,
                        "if_exists",
                    )?;
                    OnExists::parse(&s).ok_or_else(|| {
                        StratusError::eval(config_path, format!("invalid if_exists {s:?}"))
                    })?
                }
                None => OnExists::Error,
            };
            let disable_signature = match attr_expr(block, "disable_signature") {
                Some(expr) => crate::eval::expect_bool(
                    &self.eval_expr(config_path, expr, &ctx, frame, "generate")?,
                    config_path,
                    "disable_signature",
                )?,
                None => false,
            };
            let path = PathBuf::from(path);
            validate_generate_target(config_path, &path)?;
            config.generate.push(GenerateBlock {
                name,
                path,
                contents,
                if_exists,
                disable_signature,
            });
        }
        Ok(())
    }

    fn eval_errors(
        self: &Arc<Self>,
        config_path: &Path,
        body: &Body,
        frame: &Arc<EvalFrame>,
        scope: &Scope,
        config: &mut UnitConfig,
    ) -> StratusResult<()> {
        for block in blocks(body, "errors") {
            let ctx = self.context(scope);
            for retry in blocks(block.body(), "retry") {
                let name = retry
                    .labels()
                    .first()
                    .map(|l| l.as_str().to_string())
                    .ok_or_else(|| StratusError::parse(config_path, "retry block needs a name"))?;
                let retryable_errors = match attr_expr(retry, "retryable_errors") {
                    Some(expr) => crate::eval::expect_string_list(
                        &self.eval_expr(config_path, expr, &ctx, frame, "errors")?,
                        config_path,
                        "retryable_errors",
                    )?,
                    None => Vec::new(),
                };
                let max_attempts = match attr_expr(retry, "max_attempts") {
                    Some(expr) => {
                        number_as_u64(&self.eval_expr(config_path, expr, &ctx, frame, "errors")?)
                            .unwrap_or(1) as u32
                    }
                    None => 3,
                };
                let sleep = match attr_expr(retry, "sleep_interval_sec") {
                    Some(expr) => {
                        number_as_u64(&self.eval_expr(config_path, expr, &ctx, frame, "errors")?)
                            .unwrap_or(0)
                    }
                    None => 5,
                };
                config.retries.push(RetrySpec {
                    name,
                    retryable_errors,
                    max_attempts,
                    sleep_interval: Duration::from_secs(sleep),
                });
            }
            for ignore in blocks(block.body(), "ignore") {
                let name = ignore
                    .labels()
                    .first()
                    .map(|l| l.as_str().to_string())
                    .ok_or_else(|| StratusError::parse(config_path, "ignore block needs a name"))?;
                let ignorable_errors = match attr_expr(ignore, "ignorable_errors") {
                    Some(expr) => crate::eval::expect_string_list(
                        &self.eval_expr(config_path, expr, &ctx, frame, "errors")?,
                        config_path,
                        "ignorable_errors",
                    )?,
                    None => Vec::new(),
                };
                let message = match attr_expr(ignore, "message") {
                    Some(expr) => Some(crate::eval::expect_string(
                        &self.eval_expr(config_path, expr, &ctx, frame, "errors")?,
                        config_path,
                        "message",
                    )?),
                    None => None,
                };
                let signals = match attr_expr(ignore, "signals") {
                    Some(expr) => match self.eval_expr(config_path, expr, &ctx, frame, "errors")? {
                        Value::Object(map) => map,
                        other => {
                            return Err(StratusError::eval(
                                config_path,
                                format!("signals must be an object, got {other}"),
                            ))
                        }
                    },
                    None => Map::new(),
                };
                config.ignores.push(IgnoreSpec {
                    name,
                    ignorable_errors,
                    message,
                    signals,
                });
            }
        }
        Ok(())
    }

    fn eval_exclude(
        self: &Arc<Self>,
        config_path: &Path,
        body: &Body,
        frame: &Arc<EvalFrame>,
        scope: &Scope,
        config: &mut UnitConfig,
    ) -> StratusResult<()> {
        for block in blocks(body, "exclude") {
            let ctx = self.context(scope);
            let condition = match attr_expr(block, "if") {
                Some(expr) => {
                    let v = self.eval_expr(config_path, expr, &ctx, frame, "exclude")?;
                    if contains_sentinel(&v) {
                        // Cannot be decided during discovery; the runner
                        // re-evaluates with real outputs.
                        continue;
                    }
                    crate::eval::expect_bool(&v, config_path, "exclude.if")?
                }
                None => false,
            };
            let actions = match attr_expr(block, "actions") {
                Some(expr) => crate::eval::expect_string_list(
                    &self.eval_expr(config_path, expr, &ctx, frame, "exclude")?,
                    config_path,
                    "actions",
                )?,
                None => vec!["all".to_string()],
            };
            let exclude_dependencies = match attr_expr(block, "exclude_dependencies") {
                Some(expr) => crate::eval::expect_bool(
                    &self.eval_expr(config_path, expr, &ctx, frame, "exclude")?,
                    config_path,
                    "exclude_dependencies",
                )?,
                None => false,
            };
            config.exclude = Some(ExcludeSpec {
                condition,
                actions,
                exclude_dependencies,
            });
        }
        Ok(())
    }

    fn eval_catalog(
        self: &Arc<Self>,
        config_path: &Path,
        body: &Body,
        frame: &Arc<EvalFrame>,
        scope: &Scope,
        config: &mut UnitConfig,
    ) -> StratusResult<()> {
        for block in blocks(body, "catalog") {
            let ctx = self.context(scope);
            if let Some(expr) = attr_expr(block, "urls") {
                let urls = crate::eval::expect_string_list(
                    &self.eval_expr(config_path, expr, &ctx, frame, "catalog")?,
                    config_path,
                    "urls",
                )?;
                config.catalog_urls.extend(urls);
            }
        }
        Ok(())
    }

    fn eval_top_attrs(
        self: &Arc<Self>,
        config_path: &Path,
        body: &Body,
        frame: &Arc<EvalFrame>,
        scope: &Scope,
        config: &mut UnitConfig,
        lenient: bool,
    ) -> StratusResult<()> {
        let ctx = self.context(scope);
        for attr in body.attributes() {
            match attr.key() {
                "inputs" => {
                    let v = self.eval_expr(config_path, attr.expr(), &ctx, frame, "inputs")?;
                    if contains_sentinel(&v) {
                        if lenient {
                            continue;
                        }
                        return Err(scope_error(
                            config_path,
                            "inputs",
                            "inputs reference dependency outputs that are not available in \
                             this pass",
                        ));
                    }
                    match v {
                        Value::Object(map) => config.inputs = map,
                        other => {
                            return Err(StratusError::eval(
                                config_path,
                                format!("inputs must be an object, got {other}"),
                            ))
                        }
                    }
                }
                "auth_provider_cmd" => {
                    let v = self.eval_expr(config_path, attr.expr(), &ctx, frame, "auth")?;
                    config.auth_provider_cmd = Some(crate::eval::expect_string(
                        &v,
                        config_path,
                        "auth_provider_cmd",
                    )?);
                }
                "terraform_version_constraint" => {
                    let v = self.eval_expr(config_path, attr.expr(), &ctx, frame, "version")?;
                    config.terraform_version_constraint = Some(crate::eval::expect_string(
                        &v,
                        config_path,
                        "terraform_version_constraint",
                    )?);
                }
                "terragrunt_version_constraint" => {
                    let v = self.eval_expr(config_path, attr.expr(), &ctx, frame, "version")?;
                    config.terragrunt_version_constraint = Some(crate::eval::expect_string(
                        &v,
                        config_path,
                        "terragrunt_version_constraint",
                    )?);
                }
                _ => {}
            }
        }
        if let Ok(cmd) = std::env::var("TERRAGRUNT_AUTH_PROVIDER_CMD") {
            if !cmd.is_empty() {
                config.auth_provider_cmd = Some(cmd);
            }
        }
        Ok(())
    }

    /// Builds an evaluation context with the builtins and whatever scope
    /// variables have been produced so far.
    fn context(self: &Arc<Self>, scope: &Scope) -> Context<'static> {
        let mut ctx = Context::new();
        register_builtins(&mut ctx);
        if !matches!(scope.include, Value::Null) {
            ctx.declare_var("include", scope.include.clone());
        }
        if !matches!(scope.locals, Value::Null) {
            ctx.declare_var("local", scope.locals.clone());
        }
        if !matches!(scope.dependency, Value::Null) {
            ctx.declare_var("dependency", scope.dependency.clone());
        }
        if !matches!(scope.feature, Value::Null) {
            ctx.declare_var("feature", scope.feature.clone());
        }
        if !matches!(scope.values, Value::Null) {
            ctx.declare_var("values", scope.values.clone());
        }
        ctx
    }

    /// The `read_terragrunt_config` builtin: loads another file through this
    /// loader so cycle detection and memoisation apply.
    fn read_config_fn(self: &Arc<Self>, file_dir: &Path) -> ReadConfigFn {
        let loader = self.clone();
        let base = file_dir.to_path_buf();
        Arc::new(move |path: &Path| {
            let resolved = normalize_path(&absolute(path, &base));
            if let Some(hit) = loader.read_cache.lock().unwrap().get(&resolved) {
                return Ok(hit.clone());
            }
            let frame = Arc::new(loader.unit_frame(&resolved));
            let loaded = loader
                .load_file(&resolved, frame, true)
                .map_err(|e| e.to_string())?;
            let value = loaded.config.expose_value();
            loader
                .read_cache
                .lock()
                .unwrap()
                .insert(resolved, value.clone());
            Ok(value)
        })
    }

    /// Evaluates one expression with the frame installed for the builtins.
    fn eval_expr(
        self: &Arc<Self>,
        config_path: &Path,
        expr: &Expression,
        ctx: &Context<'_>,
        frame: &Arc<EvalFrame>,
        scope_name: &str,
    ) -> StratusResult<Value> {
        let file_dir = config_path.parent().unwrap_or(Path::new("."));
        let _guard = enter_frame(FrameState {
            frame: frame.clone(),
            cache: self.effect_cache.clone(),
            read_config: Some(self.read_config_fn(file_dir)),
        });
        expr.evaluate(ctx).map_err(|e| {
            let message = e.to_string();
            // Referencing a scope that is evaluated later surfaces as an
            // undefined variable; name the offending pair.
            for later in ["dependency", "feature"] {
                if (message.contains("undefined") || message.contains("unknown"))
                    && message.contains(later)
                    && scope_name != later
                {
                    return scope_error(
                        config_path,
                        scope_name,
                        &format!("scope `{scope_name}` may not reference scope `{later}`"),
                    );
                }
            }
            StratusError::eval(config_path, message)
        })
    }
}

/// Scope variables accumulated over the evaluation order.
#[derive(Clone)]
struct Scope {
    include: Value,
    locals: Value,
    dependency: Value,
    feature: Value,
    values: Value,
}

impl Scope {
    fn empty() -> Self {
        Self {
            include: Value::Null,
            locals: Value::Null,
            dependency: Value::Null,
            feature: Value::Null,
            values: Value::Null,
        }
    }
}

struct Include {
    name: String,
    path: PathBuf,
    expose: bool,
    merge: MergeMode,
    config: UnitConfig,
}

fn scope_error(path: &Path, scope: &str, message: &str) -> StratusError {
    StratusError::eval(path, format!("[{scope}] {message}"))
}

fn blocks<'b>(body: &'b Body, ident: &'b str) -> impl Iterator<Item = &'b Block> {
    body.blocks().filter(move |b| b.identifier() == ident)
}

fn attr_expr<'b>(block: &'b Block, key: &str) -> Option<&'b Expression> {
    block
        .body()
        .attributes()
        .find(|a| a.key() == key)
        .map(|a| a.expr())
}

fn number_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        _ => None,
    }
}

/// Generate targets must stay inside the scratch workspace.
fn validate_generate_target(config_path: &Path, target: &Path) -> StratusResult<()> {
    if target.is_absolute() {
        return Err(StratusError::eval(
            config_path,
            format!("generate path {} must be relative", target.display()),
        ));
    }
    let mut depth: i32 = 0;
    for part in target.components() {
        match part {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return Err(StratusError::eval(
                config_path,
                format!("generate path {} escapes the workspace", target.display()),
            ));
        }
    }
    Ok(())
}

/// Makes `path` absolute relative to `base` without touching the filesystem.
pub fn absolute(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Lexically normalises a path, collapsing `.` and `..` segments.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for part in path.components() {
        match part {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, rel: &str, contents: &str) -> PathBuf {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    fn loader_for(dir: &Path) -> Arc<ConfigLoader> {
        let mut opts = LoadOptions::new(dir);
        opts.command = "plan".to_string();
        ConfigLoader::new(opts, Arc::new(SentinelOutputs))
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_path(Path::new("/a/..")), PathBuf::from("/"));
    }

    #[test]
    fn test_load_simple_unit() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl",
            r#"
terraform {
  source = "../modules/app"
}

locals {
  env    = "dev"
  region = "eu-west-1"
  name   = "${local.env}-app"
}

inputs = {
  name   = local.name
  region = local.region
}
"#,
        );
        let loader = loader_for(tmp.path());
        let config = loader.load(&path).unwrap();

        assert_eq!(config.terraform.source.as_deref(), Some("../modules/app"));
        assert_eq!(
            config.inputs.get("name"),
            Some(&Value::String("dev-app".to_string()))
        );
    }

    #[test]
    fn test_dependencies_and_dependency_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "vpc/terragrunt.hcl", "");
        write(tmp.path(), "db/terragrunt.hcl", "");
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl",
            r#"
dependencies {
  paths = ["../db"]
}

dependency "vpc" {
  config_path  = "../vpc"
  skip_outputs = true
  mock_outputs = { vpc_id = "mock-vpc" }
}
"#,
        );
        let loader = loader_for(tmp.path());
        let config = loader.load(&path).unwrap();

        let deps = config.dependency_paths();
        assert!(deps.contains(&normalize_path(&tmp.path().join("db"))));
        assert!(deps.contains(&normalize_path(&tmp.path().join("vpc"))));
        assert_eq!(config.dependency_bindings.len(), 1);
        assert!(config.dependency_bindings[0].skip_outputs);
    }

    #[test]
    fn test_include_merge_and_relative_key() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "terragrunt.hcl",
            r#"
remote_state {
  backend = "s3"
  config = {
    bucket = "my-terraform-state"
    key    = "${path_relative_to_include()}/terraform.tfstate"
  }
}
"#,
        );
        let path = write(
            tmp.path(),
            "stage/mysql/terragrunt.hcl",
            r#"
include "root" {
  path = find_in_parent_folders()
}
"#,
        );
        let loader = loader_for(tmp.path());
        let config = loader.load(&path).unwrap();

        let remote_state = config.remote_state.expect("remote_state inherited");
        assert_eq!(remote_state.backend, "s3");
        assert_eq!(
            remote_state.config.get("key"),
            Some(&Value::String("stage/mysql/terraform.tfstate".to_string()))
        );
    }

    #[test]
    fn test_include_expose() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "root.hcl",
            r#"
locals {
  env = "prod"
}
"#,
        );
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl",
            r#"
include "root" {
  path   = "../root.hcl"
  expose = true
}

inputs = {
  env = include.root.locals.env
}
"#,
        );
        let loader = loader_for(tmp.path());
        let config = loader.load(&path).unwrap();
        assert_eq!(
            config.inputs.get("env"),
            Some(&Value::String("prod".to_string()))
        );
    }

    #[test]
    fn test_read_terragrunt_config_function() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "shared/common.hcl",
            r#"
locals {
  team = "platform"
}
"#,
        );
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl",
            r#"
locals {
  common = read_terragrunt_config("../shared/common.hcl")
}

inputs = {
  team = local.common.locals.team
}
"#,
        );
        let loader = loader_for(tmp.path());
        let config = loader.load(&path).unwrap();
        assert_eq!(
            config.inputs.get("team"),
            Some(&Value::String("platform".to_string()))
        );
    }

    #[test]
    fn test_self_include_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl",
            r#"
include {
  path = "terragrunt.hcl"
}
"#,
        );
        let loader = loader_for(tmp.path());
        let err = loader.load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cycle);
    }

    #[test]
    fn test_two_file_include_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "a/terragrunt.hcl",
            "include {\n  path = \"../b/terragrunt.hcl\"\n}\n",
        );
        let path = write(
            tmp.path(),
            "b/terragrunt.hcl",
            "include {\n  path = \"../a/terragrunt.hcl\"\n}\n",
        );
        let loader = loader_for(tmp.path());
        let err = loader.load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cycle);
    }

    #[test]
    fn test_unknown_block_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "app/terragrunt.hcl", "mystery {\n  x = 1\n}\n");
        let loader = loader_for(tmp.path());
        let err = loader.load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigParse);
    }

    #[test]
    fn test_inputs_reject_sentinel_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "vpc/terragrunt.hcl", "");
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl",
            r#"
dependency "vpc" {
  config_path = "../vpc"
}

inputs = {
  vpc_id = dependency.vpc.outputs.vpc_id
}
"#,
        );
        // Full load with the sentinel resolver stands in for a pass that
        // must not read state; inputs must reject the sentinel.
        let loader = loader_for(tmp.path());
        let err = loader.load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigEval);

        // The partial parse tolerates it and still records the edge.
        let partial = loader.partial(&path).unwrap();
        assert!(partial
            .dependency_paths
            .contains(&normalize_path(&tmp.path().join("vpc"))));
    }

    #[test]
    fn test_locals_may_not_reference_dependency_scope() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl",
            r#"
locals {
  vpc_id = dependency.vpc.outputs.vpc_id
}
"#,
        );
        let loader = loader_for(tmp.path());
        let err = loader.load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigEval);
        assert!(err.to_string().contains("locals"));
    }

    #[test]
    fn test_generate_path_escape_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl",
            r#"
generate "evil" {
  path     = "../../outside.tf"
  contents = ""
}
"#,
        );
        let loader = loader_for(tmp.path());
        let err = loader.load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigEval);
    }

    #[test]
    fn test_feature_flag_override() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl",
            r#"
feature "new_runner" {
  default = false
}

inputs = {
  use_new_runner = feature.new_runner
}
"#,
        );
        let mut opts = LoadOptions::new(tmp.path());
        opts.command = "plan".to_string();
        opts.feature_overrides
            .insert("new_runner".to_string(), Value::Bool(true));
        let loader = ConfigLoader::new(opts, Arc::new(SentinelOutputs));
        let config = loader.load(&path).unwrap();
        assert_eq!(
            config.inputs.get("use_new_runner"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_errors_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl",
            r#"
errors {
  retry "net" {
    retryable_errors   = [".*transient network issue.*"]
    max_attempts       = 3
    sleep_interval_sec = 1
  }

  ignore "safe" {
    ignorable_errors = [".*safe warning.*", "!.*do not ignore.*"]
    message          = "ignoring"
    signals = {
      alert_team = false
    }
  }
}
"#,
        );
        let loader = loader_for(tmp.path());
        let config = loader.load(&path).unwrap();

        assert_eq!(config.retries.len(), 1);
        assert_eq!(config.retries[0].max_attempts, 3);
        assert_eq!(config.retries[0].sleep_interval, Duration::from_secs(1));
        assert_eq!(config.ignores.len(), 1);
        assert_eq!(
            config.ignores[0].signals.get("alert_team"),
            Some(&Value::Bool(false))
        );
    }

    #[test]
    fn test_values_file_in_scope() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "vpc/terragrunt.values.hcl",
            "cidr = \"10.0.0.0/16\"\n",
        );
        let path = write(
            tmp.path(),
            "vpc/terragrunt.hcl",
            "inputs = {\n  cidr = values.cidr\n}\n",
        );
        let loader = loader_for(tmp.path());
        let config = loader.load(&path).unwrap();
        assert_eq!(
            config.inputs.get("cidr"),
            Some(&Value::String("10.0.0.0/16".to_string()))
        );
    }

    #[test]
    fn test_loading_twice_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl",
            r#"
locals {
  build_id = run_cmd("--terragrunt-quiet", "sh", "-c", "echo $$")
}

inputs = {
  build_id = local.build_id
  region   = "eu-west-1"
}
"#,
        );
        let loader = loader_for(tmp.path());
        let first = loader.load(&path).unwrap();
        let second = loader.load(&path).unwrap();
        assert_eq!(first.inputs, second.inputs);
    }

    #[test]
    fn test_json_variant() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "app/terragrunt.hcl.json",
            r#"{
  "terraform": {"source": "../modules/app"},
  "inputs": {"name": "from-json"}
}"#,
        );
        let loader = loader_for(tmp.path());
        let config = loader.load(&path).unwrap();
        assert_eq!(config.terraform.source.as_deref(), Some("../modules/app"));
        assert_eq!(
            config.inputs.get("name"),
            Some(&Value::String("from-json".to_string()))
        );
    }
}
