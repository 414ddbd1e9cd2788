//! Shared domain types for the stackrun orchestrator.
//!
//! This crate holds the vocabulary every other stackrun crate speaks:
//! engine command classification tables, the per-unit run-state machine,
//! report entries, detailed exit codes, and the typed error kinds that
//! cross crate boundaries.
//!
//! # Example
//!
//! ```
//! use stackrun_types::{RunState, DetailedExitCode};
//!
//! let state = RunState::Succeeded;
//! assert!(state.is_terminal());
//!
//! let code = DetailedExitCode::Clean.merge(DetailedExitCode::ChangesPresent);
//! assert_eq!(code.as_i32(), 2);
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod command;

pub use command::{
    CONFIG_FILENAME, READ_CONFIG_PHASE, all_denylist_reason, changes_provider_lock,
    init_not_required, is_known_command, needs_confirmation,
};

/// Scheduling state of one unit during a run.
///
/// Terminal states are sticky: once a unit reaches one, the queue runner
/// never transitions it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Discovered, waiting for dependencies to finish.
    Pending,
    /// All dependencies finished; eligible for a worker.
    Ready,
    /// A worker is executing the unit right now.
    Running,
    /// The unit's engine command finished with success.
    Succeeded,
    /// The unit's engine command (or pipeline) failed.
    Failed,
    /// A dependency failed, so the unit never ran.
    EarlyExit,
    /// The unit's config set `skip = true`.
    Skipped,
    /// A queue filter removed the unit before scheduling.
    Excluded,
}

impl RunState {
    /// Whether this state ends the unit's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded
                | RunState::Failed
                | RunState::EarlyExit
                | RunState::Skipped
                | RunState::Excluded
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Ready => "ready",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::EarlyExit => "early_exit",
            RunState::Skipped => "skipped",
            RunState::Excluded => "excluded",
        };
        write!(f, "{s}")
    }
}

/// Exit-code convention forwarded from the engine.
///
/// Engines report `2` for a plan with pending changes when asked for
/// detailed exit codes. Across a whole run the process exit code is the
/// maximum of the per-unit codes under the precedence `0 < 2 < 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailedExitCode {
    /// Exit code 0.
    #[default]
    Clean,
    /// Exit code 2: plan succeeded and found a diff.
    ChangesPresent,
    /// Exit code 1: something failed.
    Error,
}

impl DetailedExitCode {
    /// The numeric code handed to the OS.
    pub fn as_i32(&self) -> i32 {
        match self {
            DetailedExitCode::Clean => 0,
            DetailedExitCode::ChangesPresent => 2,
            DetailedExitCode::Error => 1,
        }
    }

    /// Classify a raw engine exit code.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => DetailedExitCode::Clean,
            2 => DetailedExitCode::ChangesPresent,
            _ => DetailedExitCode::Error,
        }
    }

    /// Combine two codes under the `0 < 2 < 1` precedence.
    pub fn merge(self, other: Self) -> Self {
        fn rank(c: DetailedExitCode) -> u8 {
            match c {
                DetailedExitCode::Clean => 0,
                DetailedExitCode::ChangesPresent => 1,
                DetailedExitCode::Error => 2,
            }
        }
        if rank(other) > rank(self) { other } else { self }
    }
}

/// Phase at which a hook runs around the engine invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    Before,
    After,
    Error,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Before => write!(f, "before"),
            HookPhase::After => write!(f, "after"),
            HookPhase::Error => write!(f, "error"),
        }
    }
}

/// Output format for the run report file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Csv,
    Json,
}

impl std::str::FromStr for ReportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(ReportFormat::Csv),
            "json" => Ok(ReportFormat::Json),
            other => Err(Error::UnknownReportFormat {
                format: other.to_string(),
            }),
        }
    }
}

/// One unit's outcome inside the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    /// Canonical working-directory path of the unit.
    pub unit: PathBuf,
    /// Terminal state the unit ended in.
    pub state: RunState,
    /// When the worker picked the unit up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the unit reached its terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Error summary, skip reason, or failing-ancestor path.
    pub cause: Option<String>,
}

impl ReportEntry {
    /// Wall-clock duration in milliseconds, when both timestamps exist.
    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => {
                (end - start).num_milliseconds().max(0) as u64
            }
            _ => 0,
        }
    }
}

/// Terminal-state counts rendered by the human summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunTotals {
    pub succeeded: usize,
    pub failed: usize,
    pub early_exits: usize,
    pub skipped: usize,
    pub excluded: usize,
    /// Units whose plan reported pending changes (engine exit code 2).
    pub with_changes: usize,
}

impl RunTotals {
    /// Total units that reached a terminal state.
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.early_exits + self.skipped + self.excluded
    }
}

/// A set of engine subcommands, as hook and extra-args blocks declare them.
pub type CommandSet = BTreeSet<String>;

/// Errors crossing stackrun crate boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing engine command; pass one after `--`, e.g. `stackrun run -- plan`")]
    MissingCommand,

    #[error(
        "'{command}' is not a recognized {engine} command; \
         use --disable-command-validation to forward it anyway"
    )]
    WrongEngineCommand { command: String, engine: String },

    #[error("'{command}' must not run across all units: {reason}")]
    DisallowedAllCommand { command: String, reason: String },

    #[error("config file not found at {}", .path.display())]
    MissingConfig { path: PathBuf },

    #[error(
        "failed to parse {}{}: {message}",
        .file.display(),
        .range.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
    )]
    ParseError {
        file: PathBuf,
        range: Option<String>,
        message: String,
    },

    #[error("include cycle detected at {}", .path.display())]
    CycleInIncludes { path: PathBuf },

    #[error(
        "dependency cycle detected: {}",
        .chain.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" -> ")
    )]
    DependencyCycle { chain: Vec<PathBuf> },

    #[error(
        "dependency {} lives outside the discovery root; \
         pass --queue-include-external to run it or --queue-exclude-external to assume it applied",
        .path.display()
    )]
    ExternalDependencyRejected { path: PathBuf },

    #[error(
        "remote state declares backend \"{backend_type}\" but no matching backend block exists in {}",
        .dir.display()
    )]
    BackendNotDefined { backend_type: String, dir: PathBuf },

    #[error(
        "no engine configuration files (.tf, .tofu, .tf.json, .tofu.json) found in {}",
        .dir.display()
    )]
    NoEngineFilesFound { dir: PathBuf },

    #[error("engine exited with code {exit_code}: {stderr_excerpt}")]
    EngineInvocationFailed {
        exit_code: i32,
        stderr_excerpt: String,
    },

    #[error("engine command failed after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("{phase} hook '{name}' failed: {message}")]
    HookFailed {
        name: String,
        phase: HookPhase,
        message: String,
    },

    #[error("unit sets prevent_destroy = true; refusing to destroy {}", .path.display())]
    ModuleIsProtected { path: PathBuf },

    #[error("run cancelled: {cause}")]
    Cancelled { cause: String },

    #[error("aborted at user request")]
    UserDeclined,

    #[error("--all and --graph are mutually exclusive")]
    AllGraphFlagsError,

    #[error("unknown report format '{format}' (expected csv or json)")]
    UnknownReportFormat { format: String },
}
