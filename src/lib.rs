//! # stratus
//!
//! A Terragrunt-compatible orchestrator for OpenTofu/Terraform. Stratus
//! discovers infrastructure units (`terragrunt.hcl` files), resolves their
//! configuration, wires dependency outputs into inputs, and executes an
//! external IaC binary across the dependency graph with bounded
//! parallelism.
//!
//! ## Architecture
//!
//! The crate is organised around the path a run takes:
//!
//! - [`discovery`] walks the working directory, expands [`stack`]
//!   blueprints, and partial-parses each unit.
//! - [`config`] turns a unit's file plus its `include` chain into one
//!   effective configuration, evaluating expressions with [`eval`].
//! - [`graph`] builds the unit DAG; [`queue`] selects and orders the units
//!   a command will touch.
//! - [`runner`] executes the queue: a bounded pool walks the DAG and a
//!   per-unit runner materialises the workspace, fetches sources through
//!   [`fetch`], generates backend/provider glue, resolves credentials via
//!   [`auth`], and streams child output through [`outmux`].
//! - [`backend`] holds the remote-state adapter contract; [`fmtcmd`]
//!   implements `hclfmt`; [`report`] renders the end-of-run summary.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use stratus::config::{ConfigLoader, LoadOptions, SentinelOutputs};
//! use stratus::discovery::{discover_units, DiscoveryOptions};
//! use stratus::queue::{QueueOptions, RunQueue};
//!
//! fn main() -> anyhow::Result<()> {
//!     let root = Path::new(".");
//!     let mut load_opts = LoadOptions::new(root);
//!     load_opts.command = "plan".to_string();
//!     let loader = ConfigLoader::new(load_opts, Arc::new(SentinelOutputs));
//!
//!     let discovered = discover_units(
//!         &DiscoveryOptions {
//!             working_dir: root.to_path_buf(),
//!             ..Default::default()
//!         },
//!         &loader,
//!     )?;
//!     let queue = RunQueue::build(
//!         discovered.units,
//!         &QueueOptions {
//!             command: "plan".to_string(),
//!             ..Default::default()
//!         },
//!         &loader,
//!     )?;
//!     for idx in queue.run_order() {
//!         println!("{}", queue.graph.node(idx).unit_dir.display());
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod backend;
pub mod config;
pub mod discovery;
pub mod error;
pub mod eval;
pub mod fetch;
pub mod fmtcmd;
pub mod graph;
pub mod outmux;
pub mod queue;
pub mod report;
pub mod runner;
pub mod stack;

// Re-export the types most embedders need.

pub use config::{ConfigLoader, LoadOptions, UnitConfig};
pub use error::{ErrorKind, StratusError, StratusResult};
pub use graph::{Polarity, UnitGraph};
pub use queue::RunQueue;
pub use report::{Reporter, RunReport, UnitState};
pub use runner::{RunOptions, RunnerPool, UnitRunner};
