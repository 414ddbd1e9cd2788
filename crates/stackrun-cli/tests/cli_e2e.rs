//! End-to-end tests driving the `stackrun` binary against fixture
//! stacks, with a shell script standing in for the engine.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct StackFixture {
    td: TempDir,
    engine: PathBuf,
    log: PathBuf,
}

impl StackFixture {
    fn new() -> Self {
        let td = TempDir::new().expect("tempdir");
        let engine = install_fake_engine(td.path());
        let log = td.path().join("engine.log");
        Self { td, engine, log }
    }

    fn root(&self) -> PathBuf {
        self.td.path().join("stack")
    }

    fn write_unit(&self, name: &str, config: &str) -> PathBuf {
        let dir = self.root().join(name);
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("terragrunt.hcl"), config).expect("write config");
        std::fs::write(dir.join("main.tf"), "# engine code\n").expect("write tf");
        // Pre-seed init artifacts so auto-init does not dominate logs.
        std::fs::create_dir_all(dir.join(".terraform")).expect("mkdir");
        std::fs::write(dir.join(".terraform.lock.hcl"), "# lock\n").expect("write lock");
        dir
    }

    fn cmd(&self, args: &[&str]) -> Command {
        let mut cmd = Command::cargo_bin("stackrun").expect("binary");
        cmd.args(args)
            .env("TG_TF_PATH", &self.engine)
            .env("TG_NON_INTERACTIVE", "1")
            .env("ENGINE_LOG", &self.log)
            .env_remove("TG_LOG");
        cmd
    }

    fn log_content(&self) -> String {
        std::fs::read_to_string(&self.log).unwrap_or_default()
    }
}

fn install_fake_engine(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-engine");
    std::fs::write(
        &path,
        r#"#!/usr/bin/env sh
echo "run: $(basename $PWD) $1" >> "$ENGINE_LOG"
case "$1" in
  version) echo "Terraform v1.7.0" ;;
  output) echo '{}' ;;
esac
if [ -f "$PWD/fail-marker" ]; then
  echo "deliberate failure" >&2
  exit 1
fi
if [ -n "$ENGINE_RETRY_DIR" ] && [ "$(basename $PWD)" = "$ENGINE_RETRY_UNIT" ]; then
  n=$(cat "$ENGINE_RETRY_DIR/count" 2>/dev/null || echo 0)
  n=$((n+1))
  echo $n > "$ENGINE_RETRY_DIR/count"
  if [ "$n" -lt 3 ]; then
    echo "temporary network error" >&2
    exit 1
  fi
fi
exit 0
"#,
    )
    .expect("write engine");
    let mut perms = std::fs::metadata(&path).expect("meta").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

#[test]
fn linear_chain_plans_in_dependency_order() {
    let fx = StackFixture::new();
    fx.write_unit("c", "inputs = {}\n");
    fx.write_unit("b", "dependencies {\n  paths = [\"../c\"]\n}\n");
    fx.write_unit("a", "dependencies {\n  paths = [\"../b\"]\n}\n");

    fx.cmd(&[
        "run",
        "--all",
        "--working-dir",
    ])
    .arg(fx.root())
    .args(["--", "plan"])
    .assert()
    .success()
    .stdout(predicate::str::contains("succeeded: 3"));

    let log = fx.log_content();
    let pos = |needle: &str| log.find(needle).unwrap_or_else(|| panic!("missing {needle}"));
    assert!(pos("run: c plan") < pos("run: b plan"));
    assert!(pos("run: b plan") < pos("run: a plan"));
}

#[test]
fn failed_dependency_causes_early_exit() {
    let fx = StackFixture::new();
    let b_dir = fx.write_unit("b", "inputs = {}\n");
    fx.write_unit("c", "inputs = {}\n");
    fx.write_unit(
        "a",
        "dependencies {\n  paths = [\"../b\", \"../c\"]\n}\n",
    );
    std::fs::write(b_dir.join("fail-marker"), "1").expect("write");

    fx.cmd(&["run", "--all", "--summary-per-unit", "--working-dir"])
        .arg(fx.root())
        .args(["--", "plan"])
        .assert()
        .code(1)
        .stdout(
            predicate::str::contains("failed: 1")
                .and(predicate::str::contains("succeeded: 1"))
                .and(predicate::str::contains("early exits: 1")),
        )
        .stderr(predicate::str::contains("b:"));

    let log = fx.log_content();
    assert!(log.contains("run: b plan"));
    assert!(log.contains("run: c plan"));
    assert!(!log.contains("run: a plan"));
}

#[test]
fn retry_recovers_from_transient_errors() {
    let fx = StackFixture::new();
    fx.write_unit(
        "flaky",
        r#"
retryable_errors         = ["temporary network error"]
retry_max_attempts       = 3
retry_sleep_interval_sec = 0
"#,
    );
    let retry_dir = fx.td.path().join("retry-state");
    std::fs::create_dir_all(&retry_dir).expect("mkdir");

    fx.cmd(&["run", "--all", "--working-dir"])
        .arg(fx.root())
        .args(["--", "plan"])
        .env("ENGINE_RETRY_DIR", &retry_dir)
        .env("ENGINE_RETRY_UNIT", "flaky")
        .assert()
        .success()
        .stdout(predicate::str::contains("succeeded: 1"));

    assert_eq!(fx.log_content().matches("run: flaky plan").count(), 3);
}

#[test]
fn dependency_cycle_is_rejected_before_any_engine_run() {
    let fx = StackFixture::new();
    fx.write_unit("a", "dependencies {\n  paths = [\"../b\"]\n}\n");
    fx.write_unit("b", "dependencies {\n  paths = [\"../a\"]\n}\n");

    fx.cmd(&["run", "--all", "--working-dir"])
        .arg(fx.root())
        .args(["--", "plan"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("dependency cycle detected"));

    assert!(fx.log_content().is_empty());
}

#[test]
fn prevent_destroy_blocks_destroy_only() {
    let fx = StackFixture::new();
    let dir = fx.write_unit("protected", "prevent_destroy = true\n");

    fx.cmd(&["run", "--working-dir"])
        .arg(&dir)
        .args(["--", "destroy"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("prevent_destroy"));
    assert!(!fx.log_content().contains("destroy"));

    fx.cmd(&["run", "--working-dir"])
        .arg(&dir)
        .args(["--", "plan"])
        .assert()
        .success();
    assert!(fx.log_content().contains("run: protected plan"));
}

#[test]
fn graph_emits_sorted_dot_edges() {
    let fx = StackFixture::new();
    fx.write_unit("c", "inputs = {}\n");
    fx.write_unit("b", "dependencies {\n  paths = [\"../c\"]\n}\n");
    fx.write_unit("a", "dependencies {\n  paths = [\"../b\"]\n}\n");

    fx.cmd(&["graph", "--working-dir"])
        .arg(fx.root())
        .assert()
        .success()
        .stdout(predicate::eq(
            "digraph G {\n  \"a\" -> \"b\";\n  \"b\" -> \"c\";\n}\n",
        ));
}

#[test]
fn unknown_engine_command_is_rejected_with_flavor() {
    let fx = StackFixture::new();
    fx.write_unit("only", "inputs = {}\n");

    fx.cmd(&["run", "--working-dir"])
        .arg(fx.root().join("only"))
        .args(["--", "deploy"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not a recognized Terraform command"));

    // Validation can be disabled; the engine then sees the command.
    fx.cmd(&["run", "--disable-command-validation", "--working-dir"])
        .arg(fx.root().join("only"))
        .args(["--", "deploy"])
        .assert()
        .success();
    assert!(fx.log_content().contains("run: only deploy"));
}

#[test]
fn all_denylist_blocks_import() {
    let fx = StackFixture::new();
    fx.write_unit("only", "inputs = {}\n");

    fx.cmd(&["run", "--all", "--working-dir"])
        .arg(fx.root())
        .args(["--", "import", "aws_thing.x", "id-123"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("must not run across all units"));
    assert!(fx.log_content().is_empty());
}

#[test]
fn report_file_is_written_with_csv_header() {
    let fx = StackFixture::new();
    fx.write_unit("only", "inputs = {}\n");
    let report = fx.td.path().join("report.csv");

    fx.cmd(&["run", "--all", "--report-file"])
        .arg(&report)
        .arg("--working-dir")
        .arg(fx.root())
        .args(["--", "plan"])
        .assert()
        .success();

    let content = std::fs::read_to_string(&report).expect("report");
    assert!(content.starts_with("unit,state,started_at,ended_at,duration_ms,cause"));
    assert!(content.contains("succeeded"));
}

#[test]
fn json_forwarding_suppresses_summary() {
    let fx = StackFixture::new();
    fx.write_unit("only", "inputs = {}\n");

    fx.cmd(&["run", "--all", "--working-dir"])
        .arg(fx.root())
        .args(["--", "plan", "-json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run summary").not());
}

#[test]
fn hcl_validate_reports_broken_configs() {
    let fx = StackFixture::new();
    fx.write_unit("good", "inputs = {}\n");
    let bad = fx.root().join("bad");
    std::fs::create_dir_all(&bad).expect("mkdir");
    std::fs::write(bad.join("terragrunt.hcl"), "inputs = {\n").expect("write");

    fx.cmd(&["hcl", "validate", "--working-dir"])
        .arg(fx.root())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to parse"));
}

#[test]
fn hcl_fmt_check_lists_unformatted_files() {
    let fx = StackFixture::new();
    let dir = fx.root().join("messy");
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(dir.join("terragrunt.hcl"), "inputs = {}   \n\n\n\n").expect("write");

    fx.cmd(&["hcl", "fmt", "--check", "--working-dir"])
        .arg(fx.root())
        .assert()
        .code(1)
        .stdout(predicate::str::contains("messy"));

    // Without --check the file is rewritten in place.
    fx.cmd(&["hcl", "fmt", "--working-dir"])
        .arg(fx.root())
        .assert()
        .success();
    let content = std::fs::read_to_string(dir.join("terragrunt.hcl")).expect("read");
    assert_eq!(content, "inputs = {}\n");

    fx.cmd(&["hcl", "fmt", "--check", "--working-dir"])
        .arg(fx.root())
        .assert()
        .success();
}

#[test]
fn info_print_emits_context_facts() {
    let fx = StackFixture::new();
    let dir = fx.write_unit("app", "inputs = {}\n");

    let output = fx
        .cmd(&["info", "print", "--working-dir"])
        .arg(&dir)
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    assert!(parsed["working_dir"].as_str().unwrap().ends_with("app"));
    assert!(
        parsed["config_path"]
            .as_str()
            .unwrap()
            .ends_with("terragrunt.hcl")
    );
    assert!(
        parsed["download_dir"]
            .as_str()
            .unwrap()
            .ends_with(".terragrunt-cache")
    );
}

#[test]
fn info_strict_list_shows_controls() {
    let fx = StackFixture::new();
    fx.cmd(&["info", "strict", "list"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("deprecated-flag-names")
                .and(predicate::str::contains("inactive").not()),
        );

    fx.cmd(&["info", "strict", "list", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(inactive)"));
}

#[test]
fn render_json_shows_resolved_inputs() {
    let fx = StackFixture::new();
    let dir = fx.write_unit(
        "app",
        r#"
locals {
  region = "eu-west-1"
}

inputs = {
  region = local.region
}
"#,
    );

    let output = fx
        .cmd(&["render", "--json", "--working-dir"])
        .arg(&dir)
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    assert_eq!(parsed["inputs"]["region"], "eu-west-1");
}

#[test]
fn version_flag_prints_and_exits() {
    Command::cargo_bin("stackrun")
        .expect("binary")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("stackrun"));
}
