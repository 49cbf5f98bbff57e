//! End-to-end scenarios driving the compiled binary against a stub IaC
//! binary (a shell script standing in for tofu/terraform).

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use assert_cmd::Command;
use predicates::prelude::*;

struct Fixture {
    root: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    /// Installs a stub IaC binary and returns its path.
    fn stub_tf(&self, script_body: &str) -> PathBuf {
        let path = self.path().join("bin/tofu");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("#!/bin/sh\n{script_body}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn cmd(&self, tf: &Path) -> Command {
        let mut cmd = Command::cargo_bin("stratus").unwrap();
        cmd.env("TERRAGRUNT_TFPATH", tf)
            .env("LOG", self.path().join("invocations.log"))
            .env("CNT", self.path().join("attempts"))
            .env_remove("TG_LOG_FORMAT")
            .env_remove("TG_OUT_DIR")
            .env_remove("TG_JSON_OUT_DIR");
        cmd
    }

    fn log_lines(&self) -> Vec<String> {
        fs::read_to_string(self.path().join("invocations.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Stub that records `<cwd> <subcommand>` per invocation and succeeds.
const RECORDING_STUB: &str = r#"
if [ "$1" = "output" ]; then echo '{}'; exit 0; fi
echo "$(pwd) $1" >> "$LOG"
exit 0
"#;

fn chain(fx: &Fixture) {
    fx.write("live/a/terragrunt.hcl", "");
    fx.write(
        "live/b/terragrunt.hcl",
        "dependencies {\n  paths = [\"../a\"]\n}\n",
    );
    fx.write(
        "live/c/terragrunt.hcl",
        "dependencies {\n  paths = [\"../b\"]\n}\n",
    );
}

fn apply_order(fx: &Fixture, command: &str) -> Vec<String> {
    fx.log_lines()
        .into_iter()
        .filter(|l| l.ends_with(&format!(" {command}")))
        .map(|l| {
            let dir = l.rsplit_once(' ').unwrap().0;
            Path::new(dir)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

#[test]
fn apply_runs_chain_in_dependency_order() {
    let fx = Fixture::new();
    chain(&fx);
    let tf = fx.stub_tf(RECORDING_STUB);

    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live"))
        .args(["--parallelism", "1", "--non-interactive", "run", "--all", "apply"])
        .assert()
        .success();

    assert_eq!(apply_order(&fx, "apply"), vec!["a", "b", "c"]);
}

#[test]
fn destroy_runs_chain_in_reverse_order() {
    let fx = Fixture::new();
    chain(&fx);
    let tf = fx.stub_tf(RECORDING_STUB);

    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live"))
        .args([
            "--parallelism",
            "1",
            "--non-interactive",
            "run",
            "--all",
            "destroy",
        ])
        .assert()
        .success();

    assert_eq!(apply_order(&fx, "destroy"), vec!["c", "b", "a"]);
}

#[test]
fn mock_outputs_allow_plan_but_not_apply() {
    let fx = Fixture::new();
    fx.write("live/vpc/terragrunt.hcl", "");
    fx.write(
        "live/ec2/terragrunt.hcl",
        r#"
dependency "vpc" {
  config_path = "../vpc"

  mock_outputs = {
    private_subnets = ["mock-subnet"]
  }

  mock_outputs_allowed_commands = ["plan"]
}

inputs = {
  subnet = dependency.vpc.outputs.private_subnets[0]
}
"#,
    );
    // `output -json` reports no state; other commands record their inputs.
    let tf = fx.stub_tf(
        r#"
if [ "$1" = "output" ]; then echo '{}'; exit 0; fi
echo "subnet=$TF_VAR_subnet cmd=$1" >> "$LOG"
exit 0
"#,
    );

    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live/ec2"))
        .args(["--non-interactive", "plan"])
        .assert()
        .success();
    assert!(fx
        .log_lines()
        .iter()
        .any(|l| l.contains("subnet=mock-subnet cmd=plan")));

    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live/ec2"))
        .args(["--non-interactive", "apply"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("DependencyOutputError"));
}

#[test]
fn remote_state_key_uses_path_relative_to_include() {
    let fx = Fixture::new();
    fx.write(
        "live/terragrunt.hcl",
        r#"
remote_state {
  backend = "s3"

  generate = {
    path      = "backend.tf"
    if_exists = "overwrite_if_managed"
  }

  config = {
    bucket = "my-terraform-state"
    key    = "${path_relative_to_include()}/terraform.tfstate"
    region = "eu-west-1"
  }
}
"#,
    );
    fx.write(
        "live/stage/mysql/terragrunt.hcl",
        r#"
include "root" {
  path = find_in_parent_folders()
}
"#,
    );
    let tf = fx.stub_tf(RECORDING_STUB);

    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live/stage/mysql"))
        .args(["--non-interactive", "plan"])
        .assert()
        .success();

    // The unit has no module source, so its workspace is the unit
    // directory itself.
    let backend = fs::read_to_string(fx.path().join("live/stage/mysql/backend.tf")).unwrap();
    assert!(backend.contains("backend \"s3\""));
    assert!(backend.contains("key = \"stage/mysql/terraform.tfstate\""));
}

#[test]
fn retries_rerun_until_attempts_exhausted() {
    let fx = Fixture::new();
    fx.write(
        "live/app/terragrunt.hcl",
        r#"
errors {
  retry "net" {
    retryable_errors   = [".*transient network issue.*"]
    max_attempts       = 3
    sleep_interval_sec = 1
  }
}
"#,
    );
    // Fails twice with a retryable message, then succeeds.
    let tf = fx.stub_tf(
        r#"
if [ "$1" = "output" ]; then echo '{}'; exit 0; fi
if [ "$1" = "init" ]; then exit 0; fi
n=$(cat "$CNT" 2>/dev/null || echo 0)
n=$((n+1))
echo $n > "$CNT"
if [ "$n" -lt 3 ]; then
  echo "Error: transient network issue" >&2
  exit 1
fi
exit 0
"#,
    );

    let started = Instant::now();
    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live/app"))
        .args(["--non-interactive", "apply"])
        .assert()
        .success();

    let attempts: u32 = fs::read_to_string(fx.path().join("attempts"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(attempts, 3);
    // Two one-second sleeps separate the three attempts.
    assert!(started.elapsed().as_secs_f64() >= 2.0);
}

#[test]
fn ignore_overrides_failure_and_writes_signals() {
    let fx = Fixture::new();
    let config = r#"
errors {
  ignore "safe" {
    ignorable_errors = [".*safe warning.*", "!.*do not ignore.*"]
    message          = "ignoring"

    signals = {
      alert_team = false
    }
  }
}
"#;
    fx.write("live/app/terragrunt.hcl", config);
    let tf = fx.stub_tf(
        r#"
if [ "$1" = "output" ]; then echo '{}'; exit 0; fi
if [ "$1" = "init" ]; then exit 0; fi
echo "Error: $STUB_STDERR" >&2
exit 1
"#,
    );

    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live/app"))
        .args(["--non-interactive", "apply"])
        .env("STUB_STDERR", "safe warning")
        .assert()
        .success();

    let signals: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(fx.path().join("live/app/error-signals.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(signals, serde_json::json!({"alert_team": false}));

    // The deny pattern turns the same failure into a real one.
    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live/app"))
        .args(["--non-interactive", "apply"])
        .env("STUB_STDERR", "do not ignore safe warning")
        .assert()
        .failure();
}

#[test]
fn stack_generate_is_idempotent() {
    let fx = Fixture::new();
    fx.write("templates/vpc/terragrunt.hcl", "# vpc unit\n");
    fx.write("templates/database/terragrunt.hcl", "# database unit\n");
    fx.write(
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
    let tf = fx.stub_tf(RECORDING_STUB);

    let generate = |fx: &Fixture| {
        fx.cmd(&tf)
            .arg("--working-dir")
            .arg(fx.path().join("live"))
            .args(["stack", "generate"])
            .assert()
            .success();
    };

    generate(&fx);
    let stack_dir = fx.path().join("live/.terragrunt-stack");
    assert!(stack_dir.join("vpc/terragrunt.hcl").is_file());
    assert!(stack_dir.join("database/terragrunt.hcl").is_file());
    let first = fs::read(stack_dir.join("vpc/terragrunt.values.hcl")).unwrap();

    fs::remove_dir_all(&stack_dir).unwrap();
    generate(&fx);
    assert_eq!(
        fs::read(stack_dir.join("vpc/terragrunt.values.hcl")).unwrap(),
        first
    );
    assert_eq!(
        fs::read_to_string(stack_dir.join("database/terragrunt.hcl")).unwrap(),
        "# database unit\n"
    );
}

#[test]
fn excluded_unit_runs_no_hooks_and_is_reported() {
    let fx = Fixture::new();
    fx.write(
        "live/skipped/terragrunt.hcl",
        r#"
exclude {
  if      = true
  actions = ["plan"]
}

terraform {
  before_hook "tripwire" {
    commands = ["plan"]
    execute  = ["sh", "-c", "echo hook-ran >> \"$LOG\""]
  }
}
"#,
    );
    fx.write("live/kept/terragrunt.hcl", "");
    let tf = fx.stub_tf(RECORDING_STUB);

    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live"))
        .args(["--non-interactive", "run", "--all", "plan"])
        .assert()
        .success()
        .stdout(predicate::str::contains("excluded"));

    assert!(!fx.log_lines().iter().any(|l| l.contains("hook-ran")));
    assert_eq!(apply_order(&fx, "plan"), vec!["kept"]);
}

#[test]
fn dag_graph_prints_dot() {
    let fx = Fixture::new();
    chain(&fx);
    let tf = fx.stub_tf(RECORDING_STUB);

    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live"))
        .args(["dag", "graph"])
        .assert()
        .success()
        .stdout(predicate::str::contains("digraph"))
        .stdout(predicate::str::contains("\"b\" -> \"a\""))
        .stdout(predicate::str::contains("\"c\" -> \"b\""));
}

#[test]
fn hclfmt_check_flags_unformatted_files() {
    let fx = Fixture::new();
    fx.write("live/app/terragrunt.hcl", "inputs={a=1}\n");
    let tf = fx.stub_tf(RECORDING_STUB);

    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live"))
        .args(["hclfmt", "--check"])
        .assert()
        .failure();

    // Write mode fixes it; check then passes.
    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live"))
        .args(["hclfmt"])
        .assert()
        .success();
    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live"))
        .args(["hclfmt", "--check"])
        .assert()
        .success();
}

#[test]
fn backend_bootstrap_and_migrate_local_state() {
    let fx = Fixture::new();
    fx.write(
        "live/app/terragrunt.hcl",
        r#"
remote_state {
  backend = "local"

  config = {
    path = "state/app.tfstate"
  }
}
"#,
    );
    fx.write(
        "live/app2/terragrunt.hcl",
        r#"
remote_state {
  backend = "local"

  config = {
    path = "state/app2.tfstate"
  }
}
"#,
    );
    let tf = fx.stub_tf(RECORDING_STUB);

    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live/app"))
        .args(["--non-interactive", "backend", "bootstrap"])
        .assert()
        .success();

    // Seed a state file, then migrate it into app2's backend config.
    fs::create_dir_all(fx.path().join("live/app/state")).unwrap();
    fs::write(fx.path().join("live/app/state/app.tfstate"), "{}").unwrap();

    fx.cmd(&tf)
        .arg("--working-dir")
        .arg(fx.path().join("live/app"))
        .args(["--non-interactive", "backend", "migrate", ".", "../app2"])
        .assert()
        .success();
    assert!(fx.path().join("live/app/state/app2.tfstate").is_file());
}
