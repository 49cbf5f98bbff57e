//! Effective configuration types.
//!
//! [`UnitConfig`] is the fully resolved configuration of one unit after all
//! includes and expressions have been evaluated. [`PartialConfig`] is the
//! cut-down result of the discovery pass: just enough to seed the DAG
//! without touching dependency outputs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hcl::{Map, Value};

/// First line written into every file produced by a `generate` block.
///
/// `overwrite_if_managed` only replaces files whose first line carries this
/// signature, so hand-written files are never clobbered.
pub const GENERATED_SIGNATURE: &str =
    "# Generated by stratus. Sig: W29yaWdpbmFsbHkgZ2VuZXJhdGVkXQ==";

/// Policy applied when a `generate` target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnExists {
    Skip,
    Overwrite,
    OverwriteIfManaged,
    Error,
}

impl OnExists {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "skip" => Some(Self::Skip),
            "overwrite" => Some(Self::Overwrite),
            "overwrite_if_managed" | "overwrite_terragrunt" => Some(Self::OverwriteIfManaged),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One file-generation directive.
#[derive(Debug, Clone)]
pub struct GenerateBlock {
    pub name: String,
    /// Target path, relative to the scratch workspace and non-escaping.
    pub path: PathBuf,
    pub contents: String,
    pub if_exists: OnExists,
    /// When set, the signature header is omitted from the generated file.
    pub disable_signature: bool,
}

/// The `remote_state` backend descriptor.
#[derive(Debug, Clone)]
pub struct RemoteState {
    pub backend: String,
    pub generate: Option<RemoteStateGenerate>,
    pub config: Map<String, Value>,
    pub disable_init: bool,
}

/// Generation directive attached to `remote_state`.
#[derive(Debug, Clone)]
pub struct RemoteStateGenerate {
    pub path: PathBuf,
    pub if_exists: OnExists,
}

/// A before/after/error hook.
#[derive(Debug, Clone)]
pub struct Hook {
    pub name: String,
    /// Commands that trigger the hook (`plan`, `apply`, ...).
    pub commands: Vec<String>,
    /// Program and arguments to execute.
    pub execute: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// When true, a failing hook is logged and does not abort the run.
    pub suppress_failure: bool,
}

impl Hook {
    pub fn matches(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }
}

/// A retry spec from `errors { retry "name" { ... } }`.
#[derive(Debug, Clone)]
pub struct RetrySpec {
    pub name: String,
    /// Regexes matched against the failed attempt's stderr.
    pub retryable_errors: Vec<String>,
    pub max_attempts: u32,
    pub sleep_interval: Duration,
}

/// An ignore spec from `errors { ignore "name" { ... } }`.
#[derive(Debug, Clone)]
pub struct IgnoreSpec {
    pub name: String,
    /// Regex allow-list; entries prefixed with `!` form the deny-list.
    pub ignorable_errors: Vec<String>,
    pub message: Option<String>,
    /// Written verbatim to `error-signals.json` when the ignore fires.
    pub signals: Map<String, Value>,
}

/// The `exclude` block predicate.
#[derive(Debug, Clone)]
pub struct ExcludeSpec {
    pub condition: bool,
    pub actions: Vec<String>,
    pub exclude_dependencies: bool,
}

impl ExcludeSpec {
    /// Whether the unit is excluded for the given command.
    pub fn applies_to(&self, command: &str) -> bool {
        self.condition
            && self
                .actions
                .iter()
                .any(|a| a == command || a == "all" || a == "*")
    }
}

/// How mocked outputs combine with real state outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Real outputs when present, else mocks (when allowed).
    #[default]
    NoMerge,
    /// Top-level union, real outputs win.
    Shallow,
    /// Recursive object merge, real outputs win; lists replaced.
    Deep,
    /// Recursive object merge with list append.
    DeepAppend,
}

impl MergeStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "no_merge" | "none" => Some(Self::NoMerge),
            "shallow" | "shallow_merge" => Some(Self::Shallow),
            "deep" | "deep_merge" => Some(Self::Deep),
            "deep_append" | "deep_merge_append" => Some(Self::DeepAppend),
            _ => None,
        }
    }
}

/// A named `dependency` block.
#[derive(Debug, Clone)]
pub struct DependencyBinding {
    pub name: String,
    /// Absolute path of the dependency's unit directory.
    pub config_path: PathBuf,
    pub mock_outputs: Option<Value>,
    /// Commands for which mocks may substitute missing state. `None` means
    /// mocks apply to any command, provided `mock_outputs` is set.
    pub mock_outputs_allowed_commands: Option<Vec<String>>,
    pub skip_outputs: bool,
    pub merge_strategy: MergeStrategy,
}

impl DependencyBinding {
    /// Whether mocked outputs may stand in for missing state when running
    /// `command`.
    pub fn mocks_allowed_for(&self, command: &str) -> bool {
        if self.mock_outputs.is_none() {
            return false;
        }
        match &self.mock_outputs_allowed_commands {
            None => true,
            Some(commands) => commands.iter().any(|c| c == command),
        }
    }
}

/// Role-assumption descriptor from the `iam_*` attributes.
#[derive(Debug, Clone)]
pub struct IamAssume {
    pub role_arn: String,
    pub session_name: Option<String>,
    pub duration_secs: Option<u64>,
    pub web_identity_token: Option<String>,
}

/// One `extra_arguments` block inside `terraform`.
#[derive(Debug, Clone)]
pub struct ExtraArguments {
    pub name: String,
    pub commands: Vec<String>,
    pub arguments: Vec<String>,
    pub env_vars: Map<String, Value>,
    pub required_var_files: Vec<PathBuf>,
    pub optional_var_files: Vec<PathBuf>,
}

/// The `terraform` block.
#[derive(Debug, Clone, Default)]
pub struct TerraformBlock {
    pub source: Option<String>,
    pub extra_arguments: Vec<ExtraArguments>,
    pub copy_terraform_lock_file: bool,
}

/// Fully resolved configuration for one unit.
#[derive(Debug, Clone)]
pub struct UnitConfig {
    /// Canonical path of the unit's configuration file.
    pub config_path: PathBuf,
    /// Directory containing the configuration file.
    pub unit_dir: PathBuf,

    pub terraform: TerraformBlock,
    pub inputs: Map<String, Value>,
    pub locals: Map<String, Value>,
    pub remote_state: Option<RemoteState>,
    pub generate: Vec<GenerateBlock>,

    /// Order-only dependency edges from the `dependencies` block.
    pub dependencies: BTreeSet<PathBuf>,
    /// Named dependencies with output wiring.
    pub dependency_bindings: Vec<DependencyBinding>,

    pub before_hooks: Vec<Hook>,
    pub after_hooks: Vec<Hook>,
    pub error_hooks: Vec<Hook>,

    pub retries: Vec<RetrySpec>,
    pub ignores: Vec<IgnoreSpec>,
    pub exclude: Option<ExcludeSpec>,
    pub feature_flags: Map<String, Value>,

    pub iam_assume: Option<IamAssume>,
    pub auth_provider_cmd: Option<String>,

    pub terraform_version_constraint: Option<String>,
    pub terragrunt_version_constraint: Option<String>,

    pub catalog_urls: Vec<String>,
}

impl UnitConfig {
    pub fn new(config_path: &Path) -> Self {
        let unit_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_path: config_path.to_path_buf(),
            unit_dir,
            terraform: TerraformBlock::default(),
            inputs: Map::new(),
            locals: Map::new(),
            remote_state: None,
            generate: Vec::new(),
            dependencies: BTreeSet::new(),
            dependency_bindings: Vec::new(),
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            error_hooks: Vec::new(),
            retries: Vec::new(),
            ignores: Vec::new(),
            exclude: None,
            feature_flags: Map::new(),
            iam_assume: None,
            auth_provider_cmd: None,
            terraform_version_constraint: None,
            terragrunt_version_constraint: None,
            catalog_urls: Vec::new(),
        }
    }

    /// All dependency unit directories: order-only edges plus the
    /// directories of named dependency bindings.
    pub fn dependency_paths(&self) -> BTreeSet<PathBuf> {
        let mut paths = self.dependencies.clone();
        paths.extend(
            self.dependency_bindings
                .iter()
                .map(|b| b.config_path.clone()),
        );
        paths
    }

    /// The value exposed to child configs via `include.<name>` when the
    /// include block sets `expose = true`.
    pub fn expose_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("locals".to_string(), Value::Object(self.locals.clone()));
        map.insert("inputs".to_string(), Value::Object(self.inputs.clone()));
        let mut terraform = Map::new();
        if let Some(source) = &self.terraform.source {
            terraform.insert("source".to_string(), Value::String(source.clone()));
        }
        map.insert("terraform".to_string(), Value::Object(terraform));
        if let Some(remote_state) = &self.remote_state {
            let mut rs = Map::new();
            rs.insert(
                "backend".to_string(),
                Value::String(remote_state.backend.clone()),
            );
            rs.insert(
                "config".to_string(),
                Value::Object(remote_state.config.clone()),
            );
            map.insert("remote_state".to_string(), Value::Object(rs));
        }
        Value::Object(map)
    }
}

/// Result of the discovery-pass partial parse: dependency edges, include
/// paths and the module source, nothing that needs dependency outputs.
#[derive(Debug, Clone)]
pub struct PartialConfig {
    pub config_path: PathBuf,
    pub unit_dir: PathBuf,
    /// Unit directories this unit depends on.
    pub dependency_paths: BTreeSet<PathBuf>,
    pub include_paths: Vec<PathBuf>,
    pub source: Option<String>,
    /// Exclude predicate when it could be evaluated without outputs.
    pub exclude: Option<ExcludeSpec>,
}
