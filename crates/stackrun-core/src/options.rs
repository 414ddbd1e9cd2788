//! Run options and the per-unit run context.
//!
//! [`RunOptions`] is the immutable flag bag assembled once per
//! invocation. [`RunContext`] carries the parts that mutate per unit:
//! working directory, config path, engine argv, and a private
//! environment map. Cloning a context for a unit deep-copies those and
//! shares everything else read-only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use stackrun_config::IamRole;
use stackrun_retry::CancelToken;
use stackrun_types::{DetailedExitCode, ReportFormat};

use crate::locks::PathLocks;

/// Ceiling for the default worker-pool size.
const DEFAULT_PARALLELISM_CAP: usize = 8;

/// Default download-cache directory name under each unit.
pub const DEFAULT_DOWNLOAD_DIR: &str = ".terragrunt-cache";

/// All flags recognized by the orchestrator core.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Root (or single-unit) working directory.
    pub working_dir: PathBuf,
    /// Explicit config file path; discovered from `working_dir` if unset.
    pub config_path: Option<PathBuf>,
    /// Engine binary override; auto-detected when unset.
    pub engine_binary: Option<String>,
    /// Engine argv forwarded after `--`; first token is the subcommand.
    pub engine_args: Vec<String>,
    /// Fan out over the whole stack.
    pub all_units: bool,
    /// Run the current unit plus its transitive dependents.
    pub graph: bool,
    /// Discovery root for graph mode; defaults to the enclosing git
    /// repository root, else the working directory.
    pub graph_root: Option<PathBuf>,
    pub parallelism: Option<usize>,
    pub no_auto_init: bool,
    pub no_auto_retry: bool,
    pub no_auto_approve: bool,
    pub non_interactive: bool,
    pub source: Option<String>,
    pub source_update: bool,
    /// Prefix substitutions applied to source URLs before download.
    pub source_map: BTreeMap<String, String>,
    pub download_dir: Option<PathBuf>,
    pub ignore_dependency_errors: bool,
    pub ignore_dependency_order: bool,
    pub queue_exclude_external: bool,
    pub queue_include_external: bool,
    pub queue_exclude_dirs: Vec<String>,
    pub queue_include_dirs: Vec<String>,
    pub queue_strict_include: bool,
    pub queue_excludes_file: Option<PathBuf>,
    pub queue_include_units_reading: Vec<PathBuf>,
    pub units_that_include: Vec<PathBuf>,
    pub fail_fast: bool,
    pub summary_disable: bool,
    pub summary_per_unit: bool,
    pub report_file: Option<PathBuf>,
    pub report_format: Option<ReportFormat>,
    pub report_schema_file: Option<PathBuf>,
    pub no_destroy_dependencies_check: bool,
    pub disable_command_validation: bool,
    pub use_partial_parse_config_cache: bool,
    pub inputs_debug: bool,
    pub tf_forward_stdout: bool,
    pub feature_flags: BTreeMap<String, String>,
    /// CLI-level assume-role override; wins over unit config.
    pub iam_role: Option<IamRole>,
    pub disable_color: bool,
    /// Legacy behavior: export null inputs as empty env vars instead of
    /// writing the ephemeral null-vars file.
    pub legacy_null_inputs: bool,
    /// Read dependency outputs from the state file instead of invoking
    /// the engine's `output`.
    pub dependency_fetch_output_from_state: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            config_path: None,
            engine_binary: None,
            engine_args: Vec::new(),
            all_units: false,
            graph: false,
            graph_root: None,
            parallelism: None,
            no_auto_init: false,
            no_auto_retry: false,
            no_auto_approve: false,
            non_interactive: false,
            source: None,
            source_update: false,
            source_map: BTreeMap::new(),
            download_dir: None,
            ignore_dependency_errors: false,
            ignore_dependency_order: false,
            queue_exclude_external: false,
            queue_include_external: false,
            queue_exclude_dirs: Vec::new(),
            queue_include_dirs: Vec::new(),
            queue_strict_include: false,
            queue_excludes_file: None,
            queue_include_units_reading: Vec::new(),
            units_that_include: Vec::new(),
            fail_fast: false,
            summary_disable: false,
            summary_per_unit: false,
            report_file: None,
            report_format: None,
            report_schema_file: None,
            no_destroy_dependencies_check: false,
            disable_command_validation: false,
            use_partial_parse_config_cache: false,
            inputs_debug: false,
            tf_forward_stdout: false,
            feature_flags: BTreeMap::new(),
            iam_role: None,
            disable_color: false,
            legacy_null_inputs: false,
            dependency_fetch_output_from_state: false,
        }
    }
}

impl RunOptions {
    /// The engine subcommand, i.e. the first forwarded token.
    pub fn engine_command(&self) -> Option<&str> {
        self.engine_args.first().map(String::as_str)
    }

    /// Engine args after the subcommand.
    pub fn engine_extra_args(&self) -> &[String] {
        if self.engine_args.is_empty() {
            &[]
        } else {
            &self.engine_args[1..]
        }
    }

    /// Worker-pool size: `max(1, parallelism ?? min(cpus, 8))`.
    pub fn worker_count(&self) -> usize {
        let default = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(DEFAULT_PARALLELISM_CAP);
        self.parallelism.unwrap_or(default).max(1)
    }

    /// The engine binary to run, honoring the override chain: explicit
    /// flag, then `terraform` on PATH, then `tofu`.
    pub fn resolve_engine_binary(&self) -> String {
        if let Some(binary) = &self.engine_binary {
            return binary.clone();
        }
        if stackrun_process::program_exists("terraform") {
            return "terraform".to_string();
        }
        if stackrun_process::program_exists("tofu") {
            return "tofu".to_string();
        }
        "terraform".to_string()
    }
}

/// Per-run state threaded into every operation.
///
/// One context exists per run; each worker clones it per unit. The env
/// map is private to the clone, so credential injection for one unit
/// never leaks into a sibling.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Shared, read-only options.
    pub opts: Arc<RunOptions>,
    /// Working directory of the current unit.
    pub working_dir: PathBuf,
    /// Config file of the current unit.
    pub config_path: PathBuf,
    /// Engine binary for the current unit (config may override).
    pub engine_binary: String,
    /// Private environment overlay for engine and hook children.
    pub env: BTreeMap<String, String>,
    /// Run-wide cancellation signal.
    pub cancel: CancelToken,
    /// Detailed exit code of the current unit's engine attempts.
    pub detailed_exit: Arc<Mutex<DetailedExitCode>>,
    /// Per-download-dir generation locks, shared run-wide.
    pub dir_locks: PathLocks,
}

impl RunContext {
    /// Build the root context for a run.
    pub fn new(opts: RunOptions) -> Self {
        let engine_binary = opts.resolve_engine_binary();
        let working_dir = opts.working_dir.clone();
        let config_path = opts
            .config_path
            .clone()
            .unwrap_or_else(|| stackrun_config::config_path(&working_dir));
        Self {
            opts: Arc::new(opts),
            working_dir,
            config_path,
            engine_binary,
            env: BTreeMap::new(),
            cancel: CancelToken::new(),
            detailed_exit: Arc::new(Mutex::new(DetailedExitCode::Clean)),
            dir_locks: PathLocks::new(),
        }
    }

    /// Clone the context for one unit: fresh env overlay, fresh
    /// detailed-exit slot, shared options and cancel token.
    pub fn clone_for_unit(&self, unit_dir: &Path, config_path: &Path) -> Self {
        Self {
            opts: Arc::clone(&self.opts),
            working_dir: unit_dir.to_path_buf(),
            config_path: config_path.to_path_buf(),
            engine_binary: self.engine_binary.clone(),
            env: self.env.clone(),
            cancel: self.cancel.clone(),
            detailed_exit: Arc::new(Mutex::new(DetailedExitCode::Clean)),
            dir_locks: self.dir_locks.clone(),
        }
    }

    /// Record an engine exit code for the current unit.
    pub fn record_exit(&self, code: DetailedExitCode) {
        *self.detailed_exit.lock().expect("exit lock poisoned") = code;
    }

    /// Reset the recorded exit code ahead of a retry attempt, so a
    /// later success is not masked by an earlier failure.
    pub fn reset_exit(&self) {
        self.record_exit(DetailedExitCode::Clean);
    }

    /// The unit's recorded exit code.
    pub fn exit_code(&self) -> DetailedExitCode {
        *self.detailed_exit.lock().expect("exit lock poisoned")
    }

    /// Download directory for a unit: config override, flag override,
    /// then `.terragrunt-cache` under the unit.
    pub fn download_dir_for(&self, unit_dir: &Path, config_override: Option<&Path>) -> PathBuf {
        if let Some(dir) = config_override {
            return dir.to_path_buf();
        }
        if let Some(dir) = &self.opts.download_dir {
            return dir.clone();
        }
        unit_dir.join(DEFAULT_DOWNLOAD_DIR)
    }
}
