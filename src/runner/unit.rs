//! The per-unit runner.
//!
//! Executes one unit through the fixed sequence: load the effective config
//! (resolving dependency outputs), materialise the scratch workspace,
//! apply `generate` blocks, assemble the environment, run before-hooks,
//! invoke the external binary with retry/ignore classification, then run
//! after- or error-hooks and report the terminal state.
//!
//! Configuration loading, source fetching and credential resolution are
//! blocking; they run on the blocking pool. The invocation itself streams
//! child output through the mux and reacts to the cancellation token,
//! giving the child a grace window before the forced kill.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hcl::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::AuthResolver;
use crate::backend::adapter_for;
use crate::config::{
    ConfigLoader, GenerateBlock, Hook, LoadOptions, OnExists, RemoteState, UnitConfig,
    GENERATED_SIGNATURE,
};
use crate::error::{StratusError, StratusResult};
use crate::eval::{json_to_value, value_to_expression, value_to_json};
use crate::fetch::{copy_tree, parse_source, SourceFetcher};
use crate::outmux::{OutMux, StreamName};

use super::outputs::OutputResolver;
use super::scratch_dir;
use super::classify::{classify, Classification};

/// File recording the fetched source's cache key, so an unchanged source
/// skips re-materialisation.
const SOURCE_STAMP: &str = ".stratus-source";

/// File recording the backend config the workspace was last initialised
/// with.
const BACKEND_RECORD: &str = ".stratus-backend.json";

/// Signals file written when an ignore spec fires.
const SIGNALS_FILE: &str = "error-signals.json";

/// Run-level options shared by every unit in one invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// The run root.
    pub working_dir: PathBuf,
    /// External subcommand (`plan`, `apply`, ...).
    pub command: String,
    /// Arguments following the subcommand.
    pub args: Vec<String>,
    /// Path of the external IaC binary.
    pub tf_path: String,
    /// `TERRAGRUNT_DOWNLOAD`: overrides the scratch root.
    pub download_dir: Option<PathBuf>,
    /// Feature-flag overrides.
    pub feature_overrides: Map<String, Value>,
    /// Suppress interactive prompts.
    pub non_interactive: bool,
    /// Grace window between cancellation and the forced kill.
    pub grace: Duration,
    /// `TG_OUT_DIR`: mirrored hierarchy for binary plan files.
    pub out_dir: Option<PathBuf>,
    /// `TG_JSON_OUT_DIR`: mirrored hierarchy for JSON plan files.
    pub json_out_dir: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(working_dir: &Path, command: &str) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            command: command.to_string(),
            args: Vec::new(),
            tf_path: "tofu".to_string(),
            download_dir: None,
            feature_overrides: Map::new(),
            non_interactive: false,
            grace: Duration::from_secs(10),
            out_dir: None,
            json_out_dir: None,
        }
    }
}

/// How a unit's run ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Succeeded,
    /// The unit's `exclude` predicate removed it at runner stage.
    Excluded,
}

struct Prepared {
    config: UnitConfig,
    workspace: PathBuf,
    env: Vec<(String, String)>,
    needs_init: bool,
    excluded: bool,
}

struct ProcessOutcome {
    code: i32,
    stderr: String,
}

/// Runs one unit to a terminal state.
pub struct UnitRunner {
    unit_dir: PathBuf,
    config_path: PathBuf,
    opts: Arc<RunOptions>,
    mux: Arc<OutMux>,
    fetcher: Arc<SourceFetcher>,
    auth: Arc<AuthResolver>,
    cancel: CancellationToken,
}

impl UnitRunner {
    pub fn new(
        config_path: &Path,
        opts: Arc<RunOptions>,
        mux: Arc<OutMux>,
        fetcher: Arc<SourceFetcher>,
        auth: Arc<AuthResolver>,
        cancel: CancellationToken,
    ) -> Self {
        let unit_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            unit_dir,
            config_path: config_path.to_path_buf(),
            opts,
            mux,
            fetcher,
            auth,
            cancel,
        }
    }

    pub async fn run(&self) -> StratusResult<UnitOutcome> {
        let config_path = self.config_path.clone();
        let unit_dir = self.unit_dir.clone();
        let opts = self.opts.clone();
        let fetcher = self.fetcher.clone();
        let auth = self.auth.clone();

        let prepared =
            tokio::task::spawn_blocking(move || prepare(&config_path, &unit_dir, opts, fetcher, auth))
                .await
                .map_err(|e| StratusError::Io(std::io::Error::other(e)))??;

        if prepared.excluded {
            return Ok(UnitOutcome::Excluded);
        }
        if self.cancel.is_cancelled() {
            return Err(StratusError::Cancelled);
        }
        self.execute(prepared).await
    }

    async fn execute(&self, prepared: Prepared) -> StratusResult<UnitOutcome> {
        let Prepared {
            config,
            workspace,
            env,
            needs_init,
            ..
        } = prepared;

        self.run_hooks(&config.before_hooks, &workspace, &env).await?;

        let result = self
            .invoke_with_retries(&config, &workspace, &env, needs_init)
            .await;

        match result {
            Ok(()) => {
                self.run_hooks(&config.after_hooks, &workspace, &env).await?;
                self.copy_lock_file(&config, &workspace);
                Ok(UnitOutcome::Succeeded)
            }
            Err(e) => {
                // Error-hook failures are logged, never masking the
                // original error.
                for hook in config
                    .error_hooks
                    .iter()
                    .filter(|h| h.matches(&self.opts.command))
                {
                    if let Err(hook_err) = self.run_hook(hook, &workspace, &env).await {
                        warn!("error hook {:?} failed: {hook_err}", hook.name);
                    }
                }
                Err(e)
            }
        }
    }

    async fn invoke_with_retries(
        &self,
        config: &UnitConfig,
        workspace: &Path,
        env: &[(String, String)],
        needs_init: bool,
    ) -> StratusResult<()> {
        if needs_init && self.opts.command != "init" {
            debug!("auto-init for {}", self.unit_dir.display());
            let outcome = self
                .run_streamed(&self.opts.tf_path, &["init".to_string()], workspace, env)
                .await?;
            if outcome.code != 0 {
                return Err(StratusError::ExternalCommand {
                    program: format!("{} init", self.opts.tf_path),
                    code: outcome.code,
                    stderr: tail(&outcome.stderr),
                });
            }
            self.record_backend(config, workspace);
        }

        let (args, plan_file) = self.command_args(config, workspace)?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self
                .run_streamed(&self.opts.tf_path, &args, workspace, env)
                .await?;

            if outcome.code == 0 {
                if let Some(plan_file) = &plan_file {
                    self.write_json_plan(plan_file, workspace, env).await?;
                }
                return Ok(());
            }

            match classify(&outcome.stderr, attempt, &config.retries, &config.ignores) {
                Classification::Retry(spec) => {
                    warn!(
                        "{}: attempt {attempt} matched retry {:?}, sleeping {:?}",
                        self.unit_dir.display(),
                        spec.name,
                        spec.sleep_interval
                    );
                    tokio::time::sleep(spec.sleep_interval).await;
                }
                Classification::Ignore(spec) => {
                    warn!(
                        "{}: ignoring failure per {:?}{}",
                        self.unit_dir.display(),
                        spec.name,
                        spec.message
                            .as_deref()
                            .map(|m| format!(": {m}"))
                            .unwrap_or_default()
                    );
                    let signals = serde_json::to_string_pretty(&value_to_json(&Value::Object(
                        spec.signals.clone(),
                    )))
                    .unwrap_or_else(|_| "{}".to_string());
                    std::fs::write(workspace.join(SIGNALS_FILE), signals)?;
                    return Ok(());
                }
                Classification::Fail => {
                    return Err(StratusError::ExternalCommand {
                        program: format!("{} {}", self.opts.tf_path, self.opts.command),
                        code: outcome.code,
                        stderr: tail(&outcome.stderr),
                    })
                }
            }
        }
    }

    /// Builds the argument vector: subcommand, caller args, matching
    /// extra_arguments, var files, and the plan artifact flag.
    fn command_args(
        &self,
        config: &UnitConfig,
        workspace: &Path,
    ) -> StratusResult<(Vec<String>, Option<PathBuf>)> {
        let command = &self.opts.command;
        let mut args = vec![command.clone()];
        args.extend(self.opts.args.iter().cloned());

        for extra in &config.terraform.extra_arguments {
            if !extra.commands.iter().any(|c| c == command) {
                continue;
            }
            args.extend(extra.arguments.iter().cloned());
            for file in &extra.required_var_files {
                if !file.is_file() {
                    return Err(StratusError::eval(
                        &config.config_path,
                        format!("required var file {} does not exist", file.display()),
                    ));
                }
                args.push(format!("-var-file={}", file.display()));
            }
            for file in &extra.optional_var_files {
                if file.is_file() {
                    args.push(format!("-var-file={}", file.display()));
                }
            }
        }

        let mut plan_file = None;
        if command == "plan" {
            let rel = self
                .unit_dir
                .strip_prefix(&self.opts.working_dir)
                .unwrap_or(&self.unit_dir);
            let binary_plan = match (&self.opts.out_dir, &self.opts.json_out_dir) {
                (Some(out_dir), _) => Some(out_dir.join(rel).join("tfplan.tfplan")),
                (None, Some(_)) => Some(workspace.join("tfplan.tfplan")),
                (None, None) => None,
            };
            if let Some(path) = binary_plan {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                args.push(format!("-out={}", path.display()));
                plan_file = Some(path);
            }
        }
        Ok((args, plan_file))
    }

    /// Renders the plan as JSON into the mirrored `TG_JSON_OUT_DIR` tree.
    async fn write_json_plan(
        &self,
        plan_file: &Path,
        workspace: &Path,
        env: &[(String, String)],
    ) -> StratusResult<()> {
        let json_out_dir = match &self.opts.json_out_dir {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let rel = self
            .unit_dir
            .strip_prefix(&self.opts.working_dir)
            .unwrap_or(&self.unit_dir);
        let target = json_out_dir.join(rel).join("tfplan.json");
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut cmd = tokio::process::Command::new(&self.opts.tf_path);
        cmd.arg("show")
            .arg("-json")
            .arg(plan_file)
            .current_dir(workspace)
            .envs(env.iter().cloned());
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(StratusError::ExternalCommand {
                program: format!("{} show", self.opts.tf_path),
                code: output.status.code().unwrap_or(-1),
                stderr: tail(&String::from_utf8_lossy(&output.stderr)),
            });
        }
        std::fs::write(&target, &output.stdout)?;
        Ok(())
    }

    async fn run_hooks(
        &self,
        hooks: &[Hook],
        workspace: &Path,
        env: &[(String, String)],
    ) -> StratusResult<()> {
        for hook in hooks.iter().filter(|h| h.matches(&self.opts.command)) {
            if let Err(e) = self.run_hook(hook, workspace, env).await {
                if hook.suppress_failure {
                    warn!("hook {:?} failed (suppressed): {e}", hook.name);
                } else {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn run_hook(
        &self,
        hook: &Hook,
        workspace: &Path,
        env: &[(String, String)],
    ) -> StratusResult<()> {
        debug!("running hook {:?}", hook.name);
        let cwd = hook
            .working_dir
            .clone()
            .unwrap_or_else(|| workspace.to_path_buf());
        let (program, args) = match hook.execute.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };
        let outcome = self.run_streamed(program, args, &cwd, env).await?;
        if outcome.code != 0 {
            return Err(StratusError::ExternalCommand {
                program: program.clone(),
                code: outcome.code,
                stderr: tail(&outcome.stderr),
            });
        }
        Ok(())
    }

    /// Spawns a child, streams its output through the mux, and waits.
    /// On cancellation the child gets the grace window to exit before the
    /// forced kill.
    async fn run_streamed(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env: &[(String, String)],
    ) -> StratusResult<ProcessOutcome> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .envs(env.iter().cloned())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if self.opts.non_interactive {
            cmd.stdin(std::process::Stdio::null());
            cmd.env("TF_INPUT", "false");
        }
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| StratusError::ExternalCommand {
            program: program.to_string(),
            code: -1,
            stderr: format!("failed to spawn: {e}"),
        })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                return Err(StratusError::ExternalCommand {
                    program: program.to_string(),
                    code: -1,
                    stderr: "child output not captured".to_string(),
                })
            }
        };
        let stdout_lines = LinesStream::new(BufReader::new(stdout).lines())
            .map(|line| (StreamName::Stdout, line.unwrap_or_default()));
        let stderr_lines = LinesStream::new(BufReader::new(stderr).lines())
            .map(|line| (StreamName::Stderr, line.unwrap_or_default()));
        let mut merged = futures::stream::select(stdout_lines, stderr_lines);

        let mut stderr_buf = String::new();
        let mut cancelled = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                }
                line = merged.next() => match line {
                    Some((stream, text)) => {
                        if stream == StreamName::Stderr {
                            stderr_buf.push_str(&text);
                            stderr_buf.push('\n');
                        }
                        self.mux.emit(&self.unit_dir, stream, &text);
                    }
                    None => break,
                }
            }
            if cancelled {
                break;
            }
        }

        if cancelled {
            match tokio::time::timeout(self.opts.grace, child.wait()).await {
                Ok(_) => debug!("{program} exited within the grace window"),
                Err(_) => {
                    warn!("{program} ignored cancellation, killing");
                    let _ = child.kill().await;
                }
            }
            return Err(StratusError::Cancelled);
        }

        let status = child.wait().await?;
        Ok(ProcessOutcome {
            code: status.code().unwrap_or(-1),
            stderr: stderr_buf,
        })
    }

    fn copy_lock_file(&self, config: &UnitConfig, workspace: &Path) {
        if !config.terraform.copy_terraform_lock_file || workspace == self.unit_dir {
            return;
        }
        let lock = workspace.join(".terraform.lock.hcl");
        if lock.is_file() {
            if let Err(e) = std::fs::copy(&lock, self.unit_dir.join(".terraform.lock.hcl")) {
                warn!("cannot copy lock file back to unit: {e}");
            }
        }
    }

    fn record_backend(&self, config: &UnitConfig, workspace: &Path) {
        if let Some(remote_state) = &config.remote_state {
            let record = serde_json::json!({
                "backend": remote_state.backend,
                "config": value_to_json(&Value::Object(remote_state.config.clone())),
            });
            let _ = std::fs::write(
                workspace.join(BACKEND_RECORD),
                serde_json::to_string_pretty(&record).unwrap_or_default(),
            );
        }
    }
}

/// Blocking preparation: config load, workspace materialisation, generate
/// blocks, environment assembly.
fn prepare(
    config_path: &Path,
    unit_dir: &Path,
    opts: Arc<RunOptions>,
    fetcher: Arc<SourceFetcher>,
    auth: Arc<AuthResolver>,
) -> StratusResult<Prepared> {
    let resolver = OutputResolver::new(
        &opts.working_dir,
        &opts.tf_path,
        opts.download_dir.as_deref(),
    );
    let mut load_opts = LoadOptions::new(&opts.working_dir);
    load_opts.command = opts.command.clone();
    load_opts.tf_path = opts.tf_path.clone();
    load_opts.feature_overrides = opts.feature_overrides.clone();
    let loader = ConfigLoader::new(load_opts, resolver);
    let config = loader.load(config_path)?;

    // The discovery pass could not always decide the exclude predicate;
    // re-check with real outputs in scope.
    if let Some(exclude) = &config.exclude {
        if exclude.applies_to(&opts.command) {
            return Ok(Prepared {
                config,
                workspace: PathBuf::new(),
                env: Vec::new(),
                needs_init: false,
                excluded: true,
            });
        }
    }

    let workspace = scratch_dir(
        unit_dir,
        config.terraform.source.as_deref(),
        opts.download_dir.as_deref(),
    );

    if let Some(source_str) = &config.terraform.source {
        let source = parse_source(source_str, unit_dir)?;
        let stamp = workspace.join(SOURCE_STAMP);
        let cached_key = std::fs::read_to_string(&stamp).unwrap_or_default();
        if cached_key != source.cache_key() || !workspace.is_dir() {
            let fetched = fetcher.fetch(&source)?;
            std::fs::create_dir_all(&workspace)?;
            copy_tree(&fetched, &workspace)?;
            std::fs::write(&stamp, source.cache_key())?;
        } else {
            debug!("workspace for {} is current", unit_dir.display());
        }
    }

    for block in &config.generate {
        apply_generate(&workspace, block)?;
    }
    if let Some(remote_state) = &config.remote_state {
        if let Some(generate) = &remote_state.generate {
            let block = backend_generate_block(remote_state, generate);
            apply_generate(&workspace, &block)?;
        }
    }

    let mut env: Vec<(String, String)> = Vec::new();
    for (name, value) in &config.inputs {
        env.push((format!("TF_VAR_{name}"), serialize_input(value)));
    }
    for extra in &config.terraform.extra_arguments {
        if extra.commands.iter().any(|c| c == &opts.command) {
            for (key, value) in &extra.env_vars {
                env.push((key.clone(), serialize_input(value)));
            }
        }
    }
    env.extend(auth.resolve(&config)?);

    let needs_init = compute_needs_init(&workspace, &config);

    Ok(Prepared {
        config,
        workspace,
        env,
        needs_init,
        excluded: false,
    })
}

/// Inputs become `TF_VAR_<name>`: strings pass through, everything else is
/// JSON-encoded so the binary parses the right type.
fn serialize_input(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(&value_to_json(other)).unwrap_or_default(),
    }
}

/// Applies one generate directive under the workspace.
fn apply_generate(workspace: &Path, block: &GenerateBlock) -> StratusResult<()> {
    let target = workspace.join(&block.path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if target.exists() {
        match block.if_exists {
            OnExists::Skip => {
                debug!("generate {:?}: target exists, skipping", block.name);
                return Ok(());
            }
            OnExists::Error => {
                return Err(StratusError::GenerateConflict { target });
            }
            OnExists::OverwriteIfManaged => {
                let first_line = std::fs::read_to_string(&target)
                    .unwrap_or_default()
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                if first_line != GENERATED_SIGNATURE {
                    return Err(StratusError::GenerateConflict { target });
                }
            }
            OnExists::Overwrite => {}
        }
    }

    let contents = if block.disable_signature {
        block.contents.clone()
    } else {
        format!("{GENERATED_SIGNATURE}\n{}", block.contents)
    };
    std::fs::write(&target, contents)?;
    Ok(())
}

/// Renders `remote_state` into a generate directive carrying a
/// `terraform { backend "<kind>" { ... } }` file.
fn backend_generate_block(
    remote_state: &RemoteState,
    generate: &crate::config::RemoteStateGenerate,
) -> GenerateBlock {
    use hcl::structure::{Attribute, Block, Body};

    let mut backend = Block::builder("backend").add_label(remote_state.backend.as_str());
    for (key, value) in &remote_state.config {
        backend = backend.add_attribute(Attribute::new(key.as_str(), value_to_expression(value)));
    }
    let body = Body::builder()
        .add_block(Block::builder("terraform").add_block(backend.build()).build())
        .build();

    GenerateBlock {
        name: "remote_state".to_string(),
        path: generate.path.clone(),
        contents: hcl::format::to_string(&body).unwrap_or_default(),
        if_exists: generate.if_exists,
        disable_signature: false,
    }
}

fn compute_needs_init(workspace: &Path, config: &UnitConfig) -> bool {
    match &config.remote_state {
        Some(remote_state) => {
            if remote_state.disable_init {
                return false;
            }
            if !workspace.join(".terraform").is_dir() {
                return true;
            }
            let existing = std::fs::read_to_string(workspace.join(BACKEND_RECORD))
                .ok()
                .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
                .and_then(|json| {
                    json.get("config")
                        .map(|c| match json_to_value(c) {
                            Value::Object(map) => map,
                            _ => Map::new(),
                        })
                });
            match adapter_for(&remote_state.backend) {
                Some(adapter) => adapter.needs_init(&remote_state.config, existing.as_ref()),
                None => existing.as_ref() != Some(&remote_state.config),
            }
        }
        None => !workspace.join(".terraform").is_dir(),
    }
}

fn tail(stderr: &str) -> String {
    const MAX: usize = 2048;
    if stderr.len() <= MAX {
        stderr.trim_end().to_string()
    } else {
        let cut = stderr.len() - MAX;
        let cut = stderr
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= cut)
            .unwrap_or(cut);
        format!("...{}", stderr[cut..].trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_input_types() {
        assert_eq!(serialize_input(&Value::String("plain".into())), "plain");
        assert_eq!(
            serialize_input(&json_to_value(&serde_json::json!(["a", "b"]))),
            r#"["a","b"]"#
        );
        assert_eq!(
            serialize_input(&json_to_value(&serde_json::json!({"n": 3}))),
            r#"{"n":3}"#
        );
        assert_eq!(serialize_input(&Value::Bool(true)), "true");
    }

    #[test]
    fn test_apply_generate_policies() {
        let tmp = tempfile::tempdir().unwrap();
        let block = |if_exists| GenerateBlock {
            name: "provider".to_string(),
            path: PathBuf::from("provider.tf"),
            contents: "provider \"aws\" {}\n".to_string(),
            if_exists,
            disable_signature: false,
        };

        // First write carries the signature.
        apply_generate(tmp.path(), &block(OnExists::Error)).unwrap();
        let written = std::fs::read_to_string(tmp.path().join("provider.tf")).unwrap();
        assert!(written.starts_with(GENERATED_SIGNATURE));

        // Error policy refuses a second write.
        let err = apply_generate(tmp.path(), &block(OnExists::Error)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::GenerateConflict);

        // Managed overwrite succeeds because the file carries the marker.
        apply_generate(tmp.path(), &block(OnExists::OverwriteIfManaged)).unwrap();

        // A hand-written file is protected from managed overwrite.
        std::fs::write(tmp.path().join("provider.tf"), "# mine\n").unwrap();
        let err =
            apply_generate(tmp.path(), &block(OnExists::OverwriteIfManaged)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::GenerateConflict);

        // Skip leaves it alone; overwrite clobbers it.
        apply_generate(tmp.path(), &block(OnExists::Skip)).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("provider.tf")).unwrap(),
            "# mine\n"
        );
        apply_generate(tmp.path(), &block(OnExists::Overwrite)).unwrap();
        assert!(std::fs::read_to_string(tmp.path().join("provider.tf"))
            .unwrap()
            .starts_with(GENERATED_SIGNATURE));
    }

    #[test]
    fn test_backend_generate_block_renders_backend() {
        let mut config = Map::new();
        config.insert(
            "bucket".to_string(),
            Value::String("my-terraform-state".to_string()),
        );
        config.insert(
            "key".to_string(),
            Value::String("stage/mysql/terraform.tfstate".to_string()),
        );
        let remote_state = RemoteState {
            backend: "s3".to_string(),
            generate: None,
            config,
            disable_init: false,
        };
        let generate = crate::config::RemoteStateGenerate {
            path: PathBuf::from("backend.tf"),
            if_exists: OnExists::OverwriteIfManaged,
        };

        let block = backend_generate_block(&remote_state, &generate);
        assert!(block.contents.contains("backend \"s3\""));
        assert!(block
            .contents
            .contains("key = \"stage/mysql/terraform.tfstate\""));
    }

    #[test]
    fn test_needs_init_transitions() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = UnitConfig::new(&tmp.path().join("terragrunt.hcl"));

        // No .terraform directory yet.
        assert!(compute_needs_init(tmp.path(), &config));
        std::fs::create_dir_all(tmp.path().join(".terraform")).unwrap();
        assert!(!compute_needs_init(tmp.path(), &config));

        // A remote_state without a recorded init needs one.
        let mut rs_config = Map::new();
        rs_config.insert("path".to_string(), Value::String("x.tfstate".to_string()));
        config.remote_state = Some(RemoteState {
            backend: "local".to_string(),
            generate: None,
            config: rs_config.clone(),
            disable_init: false,
        });
        assert!(compute_needs_init(tmp.path(), &config));

        // Matching record means no init.
        let record = serde_json::json!({
            "backend": "local",
            "config": {"path": "x.tfstate"},
        });
        std::fs::write(
            tmp.path().join(BACKEND_RECORD),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();
        assert!(!compute_needs_init(tmp.path(), &config));

        // Changed backend config triggers re-init.
        config.remote_state.as_mut().unwrap().config.insert(
            "path".to_string(),
            Value::String("moved.tfstate".to_string()),
        );
        assert!(compute_needs_init(tmp.path(), &config));
    }

    #[test]
    fn test_tail_truncates_long_stderr() {
        let long = "x".repeat(5000);
        let tailed = tail(&long);
        assert!(tailed.len() <= 2051);
        assert!(tailed.starts_with("..."));
        assert_eq!(tail("short"), "short");
    }
}
