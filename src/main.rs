//! stratus CLI - Terragrunt-compatible orchestrator for OpenTofu/Terraform.

use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use stratus::auth::AuthResolver;
use stratus::backend::{adapter_for, BackendOptions};
use stratus::config::{
    normalize_path, ConfigLoader, LoadOptions, PartialConfig, SentinelOutputs,
};
use stratus::discovery::{self, discover_units, DiscoveryOptions, STACK_MARKER};
use stratus::error::StratusError;
use stratus::eval::value_to_json;
use stratus::fetch::SourceFetcher;
use stratus::fmtcmd::{self, FmtMode};
use stratus::graph::{Polarity, UnitGraph};
use stratus::outmux::{LogFormat, OutMux};
use stratus::queue::{QueueOptions, RunQueue};
use stratus::report::{ConsoleReporter, Reporter};
use stratus::runner::{OutputResolver, PoolOptions, RunOptions, RunnerPool};
use stratus::stack;

#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "Terragrunt-compatible orchestrator for OpenTofu/Terraform", long_about = None)]
#[command(version)]
struct Cli {
    /// Working directory
    #[arg(long, default_value = ".")]
    working_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Output format for unit logs (key-value, pretty, bare)
    #[arg(long)]
    log_format: Option<String>,

    /// Path of the OpenTofu/Terraform binary
    #[arg(long)]
    tf_path: Option<String>,

    /// Suppress interactive prompts
    #[arg(long)]
    non_interactive: bool,

    /// Maximum number of units running concurrently
    #[arg(long)]
    parallelism: Option<usize>,

    /// Keep dispatching dependents of failed units
    #[arg(long)]
    queue_ignore_errors: bool,

    /// Exclude units under matching directories
    #[arg(long = "queue-exclude-dir")]
    queue_exclude_dir: Vec<String>,

    /// Restrict the queue to matching directories (with --queue-strict-include)
    #[arg(long = "queue-include-dir")]
    queue_include_dir: Vec<String>,

    /// Only include units matched by --queue-include-dir
    #[arg(long)]
    queue_strict_include: bool,

    /// Do not pull in dependencies outside the working directory
    #[arg(long)]
    queue_exclude_external: bool,

    /// Seconds a child gets to exit after cancellation before being killed
    #[arg(long, default_value_t = 10)]
    grace_period: u64,

    /// Feature-flag override, name=value (repeatable)
    #[arg(long)]
    feature: Vec<String>,

    /// Verbose run reporting
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command across many units
    Run {
        /// Every unit under the working directory
        #[arg(long)]
        all: bool,

        /// The current unit plus its transitive dependents
        #[arg(long)]
        graph: bool,

        /// The command and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        cmd: Vec<String>,
    },

    /// Expand and operate on stack blueprints
    Stack {
        #[command(subcommand)]
        command: StackCommands,
    },

    /// Inspect the dependency graph
    Dag {
        #[command(subcommand)]
        command: DagCommands,
    },

    /// Remote-state backend operations
    Backend {
        #[command(subcommand)]
        command: BackendCommands,
    },

    /// Format configuration files
    Hclfmt {
        /// Report files that need formatting without rewriting them
        #[arg(long)]
        check: bool,

        /// Print diffs instead of rewriting
        #[arg(long)]
        diff: bool,

        /// Format a single file
        file: Option<PathBuf>,
    },

    /// Module cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Any other command runs on the single unit in the working directory
    #[command(external_subcommand)]
    Tf(Vec<String>),
}

#[derive(Subcommand)]
enum StackCommands {
    /// Expand terragrunt.stack.hcl into generated units
    Generate,
    /// Expand, then run a command across the generated units
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        cmd: Vec<String>,
    },
    /// Aggregate outputs of every generated unit as JSON
    Output,
}

#[derive(Subcommand)]
enum DagCommands {
    /// Print the unit DAG in DOT format
    Graph,
}

#[derive(Subcommand)]
enum BackendCommands {
    /// Provision the unit's remote-state backend
    Bootstrap,
    /// Delete the unit's remote state
    Delete {
        #[arg(long)]
        force: bool,
    },
    /// Move state between two units' backends
    Migrate {
        src: PathBuf,
        dst: PathBuf,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Remove every cached module checkout
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("TG_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    if let Ok(experiments) = std::env::var("TG_EXPERIMENT") {
        debug!("experiments enabled: {experiments}");
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let working_dir = normalize_path(&std::path::absolute(&cli.working_dir)?);
    let exit = dispatch(&cli, &working_dir, cancel).await?;
    std::process::exit(exit);
}

async fn dispatch(cli: &Cli, working_dir: &Path, cancel: CancellationToken) -> Result<i32> {
    match &cli.command {
        Commands::Run { all, graph, cmd } => {
            let (command, args) = split_command(cmd)?;
            if *graph {
                run_graph_scope(cli, working_dir, &command, &args, cancel).await
            } else if *all {
                let discovered = discover_scoped(cli, working_dir, &command)?;
                run_queue(cli, working_dir, discovered, &command, &args, cancel).await
            } else {
                run_single(cli, working_dir, &command, &args, cancel).await
            }
        }
        Commands::Tf(cmd) => {
            let (command, args) = split_command(cmd)?;
            run_single(cli, working_dir, &command, &args, cancel).await
        }
        Commands::Stack { command } => run_stack(cli, working_dir, command, cancel).await,
        Commands::Dag { command } => match command {
            DagCommands::Graph => {
                let discovered = discover_scoped(cli, working_dir, "")?;
                let loader = make_loader(cli, working_dir, "");
                let opts = QueueOptions {
                    command: String::new(),
                    construct_as: None,
                    exclude_external: cli.queue_exclude_external,
                };
                let queue = blocking(|| RunQueue::build(discovered, &opts, &loader))?;
                print!("{}", queue.graph.to_dot(working_dir));
                Ok(0)
            }
        },
        Commands::Backend { command } => run_backend(cli, working_dir, command).await,
        Commands::Hclfmt { check, diff, file } => {
            let mode = if *check {
                FmtMode::Check
            } else if *diff {
                FmtMode::Diff
            } else {
                FmtMode::Write
            };
            let outcome = fmtcmd::run_fmt(working_dir, file.as_deref(), mode)?;
            for path in &outcome.changed {
                println!("{}", path.display());
            }
            for (path, error) in &outcome.errors {
                eprintln!("{}: {error}", path.display());
            }
            if *check {
                fmtcmd::check_failed(&outcome)?;
            }
            Ok(if outcome.errors.is_empty() { 0 } else { 1 })
        }
        Commands::Cache { command } => match command {
            CacheCommands::Clear => {
                clear_caches(working_dir)?;
                Ok(0)
            }
        },
    }
}

/// Runs one unit: the working directory's own config, or the file named by
/// `TERRAGRUNT_CONFIG`.
async fn run_single(
    cli: &Cli,
    working_dir: &Path,
    command: &str,
    args: &[String],
    cancel: CancellationToken,
) -> Result<i32> {
    let config_path = match std::env::var("TERRAGRUNT_CONFIG") {
        Ok(path) if !path.is_empty() => normalize_path(&working_dir.join(path)),
        _ => discovery::unit_config_file(working_dir)
            .ok_or_else(|| anyhow!("no terragrunt.hcl in {}", working_dir.display()))?,
    };
    let loader = make_loader(cli, working_dir, command);
    let partial = blocking(|| loader.partial(&config_path))
        .with_context(|| format!("failed to parse {}", config_path.display()))?;

    // A single-unit run resolves dependency outputs but never runs the
    // dependencies themselves.
    let opts = QueueOptions {
        command: command.to_string(),
        construct_as: None,
        exclude_external: true,
    };
    let queue = blocking(|| RunQueue::build(vec![partial], &opts, &loader))?;
    execute_queue(cli, working_dir, &queue, command, args, cancel).await
}

/// `run --all`: every discovered unit.
async fn run_queue(
    cli: &Cli,
    working_dir: &Path,
    discovered: Vec<PartialConfig>,
    command: &str,
    args: &[String],
    cancel: CancellationToken,
) -> Result<i32> {
    let loader = make_loader(cli, working_dir, command);
    let opts = QueueOptions {
        command: command.to_string(),
        construct_as: None,
        exclude_external: cli.queue_exclude_external,
    };
    let queue = blocking(|| RunQueue::build(discovered, &opts, &loader))?;
    execute_queue(cli, working_dir, &queue, command, args, cancel).await
}

/// `run --graph`: the working directory's unit plus its transitive
/// dependents (and whatever those need), discovered from the repo root.
async fn run_graph_scope(
    cli: &Cli,
    working_dir: &Path,
    command: &str,
    args: &[String],
    cancel: CancellationToken,
) -> Result<i32> {
    let root = repo_root(working_dir);
    let partials = discover_scoped(cli, &root, command)?;
    let graph = UnitGraph::build(partials.clone())?;
    let seed = graph
        .index_of(working_dir)
        .ok_or_else(|| anyhow!("{} is not a unit", working_dir.display()))?;

    let mut seeds = BTreeSet::new();
    seeds.insert(seed);
    let dependents = graph.transitive_closure(&seeds, Polarity::Reverse);
    let needed = graph.transitive_closure(&dependents, Polarity::Forward);
    let keep: BTreeSet<PathBuf> = needed
        .iter()
        .map(|&idx| graph.node(idx).unit_dir.clone())
        .collect();

    let scoped: Vec<PartialConfig> = partials
        .into_iter()
        .filter(|p| keep.contains(&p.unit_dir))
        .collect();
    run_queue(cli, working_dir, scoped, command, args, cancel).await
}

async fn run_stack(
    cli: &Cli,
    working_dir: &Path,
    command: &StackCommands,
    cancel: CancellationToken,
) -> Result<i32> {
    let stack_file = working_dir.join(STACK_MARKER);
    if !stack_file.is_file() {
        bail!("no {STACK_MARKER} in {}", working_dir.display());
    }
    blocking(|| stack::expand_stack_file(&stack_file))?;
    let stack_dir = working_dir.join(stack::STACK_DIR);

    match command {
        StackCommands::Generate => {
            info!("generated {}", stack_dir.display());
            Ok(0)
        }
        StackCommands::Run { cmd } => {
            let (command, args) = split_command(cmd)?;
            let loader = make_loader(cli, working_dir, &command);
            let discovered = blocking(|| {
                discover_units(
                    &DiscoveryOptions {
                        working_dir: stack_dir,
                        exclude_dirs: cli.queue_exclude_dir.clone(),
                        include_dirs: cli.queue_include_dir.clone(),
                        strict_include: cli.queue_strict_include,
                    },
                    &loader,
                )
            })?;
            report_discovery_failures(&discovered.failures)?;
            run_queue(cli, working_dir, discovered.units, &command, &args, cancel).await
        }
        StackCommands::Output => {
            let loader = make_loader(cli, working_dir, "output");
            let discovered = blocking(|| {
                discover_units(
                    &DiscoveryOptions {
                        working_dir: stack_dir.clone(),
                        ..Default::default()
                    },
                    &loader,
                )
            })?;
            report_discovery_failures(&discovered.failures)?;

            let resolver = OutputResolver::new(
                working_dir,
                &tf_path(cli),
                download_dir().as_deref(),
            );
            let mut aggregated = serde_json::Map::new();
            for unit in &discovered.units {
                let name = unit
                    .unit_dir
                    .strip_prefix(&stack_dir)
                    .unwrap_or(&unit.unit_dir)
                    .display()
                    .to_string();
                let outputs = blocking(|| resolver.unit_outputs(&unit.unit_dir))?
                    .map(|v| value_to_json(&v))
                    .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                aggregated.insert(name, outputs);
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::Value::Object(aggregated))?
            );
            Ok(0)
        }
    }
}

async fn run_backend(cli: &Cli, working_dir: &Path, command: &BackendCommands) -> Result<i32> {
    let opts = BackendOptions {
        non_interactive: cli.non_interactive,
        working_dir: working_dir.to_path_buf(),
    };
    let load = |dir: &Path| -> Result<(String, hcl::Map<String, hcl::Value>)> {
        let config_path = discovery::unit_config_file(dir)
            .ok_or_else(|| anyhow!("no terragrunt.hcl in {}", dir.display()))?;
        let loader = make_loader(cli, working_dir, "");
        let config = blocking(|| loader.load_tolerant(&config_path))?;
        let remote_state = config
            .remote_state
            .ok_or_else(|| anyhow!("{} has no remote_state block", dir.display()))?;
        Ok((remote_state.backend, remote_state.config))
    };
    let adapter = |kind: &str| {
        adapter_for(kind)
            .ok_or_else(|| anyhow!("no backend adapter registered for {kind:?}"))
    };

    match command {
        BackendCommands::Bootstrap => {
            let (kind, config) = load(working_dir)?;
            adapter(&kind)?.bootstrap(&config, &opts).await?;
        }
        BackendCommands::Delete { force } => {
            let (kind, config) = load(working_dir)?;
            if !force && !confirm(cli, "Delete remote state?")? {
                return Ok(1);
            }
            adapter(&kind)?.delete(&config, *force, &opts).await?;
        }
        BackendCommands::Migrate { src, dst } => {
            let (src_kind, src_config) = load(&normalize_path(&working_dir.join(src)))?;
            let (dst_kind, dst_config) = load(&normalize_path(&working_dir.join(dst)))?;
            if src_kind != dst_kind {
                bail!("cannot migrate between backend kinds {src_kind:?} and {dst_kind:?}");
            }
            adapter(&src_kind)?
                .migrate(&src_config, &dst_config, &opts)
                .await?;
        }
    }
    Ok(0)
}

/// Builds the queue's execution machinery and runs it to a report.
async fn execute_queue(
    cli: &Cli,
    working_dir: &Path,
    queue: &RunQueue,
    command: &str,
    args: &[String],
    cancel: CancellationToken,
) -> Result<i32> {
    if command == "destroy" && !confirm(cli, "Destroy all units in the queue?")? {
        return Ok(1);
    }
    info!("{} unit(s) queued for {command}", queue.len());

    let mut run_opts = RunOptions::new(working_dir, command);
    run_opts.args = args.to_vec();
    run_opts.tf_path = tf_path(cli);
    run_opts.download_dir = download_dir();
    run_opts.feature_overrides = feature_overrides(cli);
    run_opts.non_interactive = cli.non_interactive;
    run_opts.grace = Duration::from_secs(cli.grace_period);
    run_opts.out_dir = env_dir("TG_OUT_DIR");
    run_opts.json_out_dir = env_dir("TG_JSON_OUT_DIR");

    let format = cli
        .log_format
        .clone()
        .or_else(|| std::env::var("TG_LOG_FORMAT").ok())
        .and_then(|s| LogFormat::parse(&s))
        .unwrap_or_default();

    let reporter: Arc<dyn Reporter> = Arc::new(ConsoleReporter::new(cli.verbose));
    let pool = RunnerPool::new(
        PoolOptions {
            max_parallel: cli.parallelism,
            ignore_errors: cli.queue_ignore_errors,
        },
        Arc::new(run_opts),
        Arc::new(OutMux::new(format, working_dir)),
        Arc::new(SourceFetcher::new(&working_dir.join(".terragrunt-cache"))),
        Arc::new(AuthResolver::new()),
        reporter,
        cancel,
    );

    let report = pool.run(queue).await;
    Ok(report.exit_code())
}

fn discover_scoped(cli: &Cli, working_dir: &Path, command: &str) -> Result<Vec<PartialConfig>> {
    let loader = make_loader(cli, working_dir, command);
    let discovered = blocking(|| {
        discover_units(
            &DiscoveryOptions {
                working_dir: working_dir.to_path_buf(),
                exclude_dirs: cli.queue_exclude_dir.clone(),
                include_dirs: cli.queue_include_dir.clone(),
                strict_include: cli.queue_strict_include,
            },
            &loader,
        )
    })?;
    report_discovery_failures(&discovered.failures)?;
    Ok(discovered.units)
}

/// Discovery and config loading spawn child processes and may hit the
/// registry; keep them off the async workers.
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    tokio::task::block_in_place(f)
}

fn report_discovery_failures(failures: &[(PathBuf, StratusError)]) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    for (path, error) in failures {
        eprintln!("{}: {}: {error}", path.display(), error.kind().as_str());
    }
    bail!("{} unit(s) failed to parse", failures.len());
}

fn make_loader(cli: &Cli, working_dir: &Path, command: &str) -> Arc<ConfigLoader> {
    let mut opts = LoadOptions::new(working_dir);
    opts.command = command.to_string();
    opts.tf_path = tf_path(cli);
    opts.feature_overrides = feature_overrides(cli);
    ConfigLoader::new(opts, Arc::new(SentinelOutputs))
}

fn split_command(cmd: &[String]) -> Result<(String, Vec<String>)> {
    match cmd.split_first() {
        Some((command, args)) => Ok((command.clone(), args.to_vec())),
        None => bail!("no command given"),
    }
}

fn tf_path(cli: &Cli) -> String {
    cli.tf_path
        .clone()
        .or_else(|| std::env::var("TERRAGRUNT_TFPATH").ok())
        .unwrap_or_else(|| "tofu".to_string())
}

fn download_dir() -> Option<PathBuf> {
    env_dir("TERRAGRUNT_DOWNLOAD")
}

fn env_dir(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| PathBuf::from(shellexpand::tilde(&s).into_owned()))
}

/// Flag overrides: `--feature name=value` plus `TERRAGRUNT_FEATURE` as a
/// comma-separated list. Values parse as bool or number, else string.
fn feature_overrides(cli: &Cli) -> hcl::Map<String, hcl::Value> {
    let mut overrides = hcl::Map::new();
    let env_features = std::env::var("TERRAGRUNT_FEATURE").unwrap_or_default();
    let all = env_features
        .split(',')
        .map(str::to_string)
        .chain(cli.feature.iter().cloned());
    for entry in all {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('=') {
            Some((name, raw)) => {
                overrides.insert(name.to_string(), parse_flag_value(raw));
            }
            None => {
                overrides.insert(entry.to_string(), hcl::Value::Bool(true));
            }
        }
    }
    overrides
}

fn parse_flag_value(raw: &str) -> hcl::Value {
    match raw {
        "true" => hcl::Value::Bool(true),
        "false" => hcl::Value::Bool(false),
        _ => raw
            .parse::<i64>()
            .map(|n| hcl::Value::Number(n.into()))
            .unwrap_or_else(|_| hcl::Value::String(raw.to_string())),
    }
}

fn repo_root(working_dir: &Path) -> PathBuf {
    let mut dir = Some(working_dir.to_path_buf());
    while let Some(current) = dir {
        if current.join(".git").exists() {
            return current;
        }
        dir = current.parent().map(Path::to_path_buf);
    }
    working_dir.to_path_buf()
}

fn clear_caches(working_dir: &Path) -> Result<()> {
    let mut caches: Vec<PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(working_dir).into_iter().flatten() {
        if entry.file_type().is_dir() && entry.file_name() == ".terragrunt-cache" {
            let path = entry.path().to_path_buf();
            if !caches.iter().any(|c| path.starts_with(c)) {
                caches.push(path);
            }
        }
    }
    for cache in &caches {
        std::fs::remove_dir_all(cache)
            .with_context(|| format!("removing {}", cache.display()))?;
    }
    info!("removed {} cache directories", caches.len());
    Ok(())
}

fn confirm(cli: &Cli, prompt: &str) -> Result<bool> {
    if cli.non_interactive {
        return Ok(true);
    }
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
