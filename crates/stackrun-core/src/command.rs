//! Command dispatch.
//!
//! Validates the forwarded engine subcommand, decides between
//! single-unit and stack-wide execution, threads the one-time
//! confirmation prompts, and assembles discovery, DAG construction,
//! filtering, and the queue run into one entry point.

use std::io::IsTerminal;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;

use stackrun_types::{
    CONFIG_FILENAME, DetailedExitCode, Error, ReportEntry, ReportFormat, RunState,
    all_denylist_reason, is_known_command, needs_confirmation,
};

use crate::dag::{ExternalPolicy, QueueFilters, Stack};
use crate::discover::discover_units;
use crate::driver::{Collaborators, EngineOutputs, UnitDriver};
use crate::engine::SharedReporter;
use crate::options::{RunContext, RunOptions};
use crate::queue::{UnitRunner, run_queue};
use crate::report::{Report, should_skip_summary};

/// Asks the user a yes/no question. The CLI backs this with stdin;
/// tests script it.
pub trait Prompter: Sync {
    fn confirm(&self, message: &str) -> Result<bool>;
}

/// Prompter that accepts everything (non-interactive acceptance).
pub struct AcceptAll;

impl Prompter for AcceptAll {
    fn confirm(&self, _message: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Aggregate result of a dispatched run.
#[derive(Debug)]
pub struct RunResult {
    /// Max-merged detailed exit code.
    pub exit: DetailedExitCode,
    /// Rendered human summary, when one should be printed.
    pub summary: Option<String>,
    /// First failing unit, as (label, error), for the top-level error.
    pub first_failure: Option<(String, String)>,
    /// The user declined a confirmation prompt; exit cleanly.
    pub declined: bool,
}

impl RunResult {
    fn declined() -> Self {
        Self {
            exit: DetailedExitCode::Clean,
            summary: None,
            first_failure: None,
            declined: true,
        }
    }
}

/// The engine family, for error wording.
pub fn engine_flavor(binary: &str) -> &'static str {
    let name = Path::new(binary)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| binary.to_string());
    if name.contains("tofu") {
        "OpenTofu"
    } else {
        "Terraform"
    }
}

/// Flag and subcommand validation shared by every run variant.
pub fn validate(opts: &RunOptions, engine_binary: &str) -> Result<(), Error> {
    let Some(command) = opts.engine_command() else {
        return Err(Error::MissingCommand);
    };

    if opts.all_units && opts.graph {
        return Err(Error::AllGraphFlagsError);
    }

    if opts.all_units {
        if let Some(reason) = all_denylist_reason(command) {
            return Err(Error::DisallowedAllCommand {
                command: command.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    if !opts.disable_command_validation && !is_known_command(command) {
        return Err(Error::WrongEngineCommand {
            command: command.to_string(),
            engine: engine_flavor(engine_binary).to_string(),
        });
    }

    Ok(())
}

/// Dispatch a `run` invocation.
pub fn run(
    opts: RunOptions,
    collaborators: Collaborators<'_>,
    reporter: &SharedReporter,
    prompter: &dyn Prompter,
) -> Result<RunResult> {
    let ctx = RunContext::new(opts);
    validate(&ctx.opts, &ctx.engine_binary)?;

    if ctx.opts.all_units || ctx.opts.graph {
        run_stack(&ctx, collaborators, reporter, prompter)
    } else {
        run_single(&ctx, collaborators, reporter, prompter)
    }
}

fn run_single(
    ctx: &RunContext,
    collaborators: Collaborators<'_>,
    reporter: &SharedReporter,
    prompter: &dyn Prompter,
) -> Result<RunResult> {
    let command = ctx.opts.engine_command().unwrap_or_default().to_string();

    let config_path = if ctx.config_path.is_file() {
        ctx.config_path.clone()
    } else {
        stackrun_config::find_config_upwards(&ctx.working_dir).ok_or_else(|| {
            Error::MissingConfig {
                path: ctx.config_path.clone(),
            }
        })?
    };
    let unit_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ctx.working_dir.clone());

    let unit = crate::dag::Unit {
        dir: unit_dir.canonicalize().unwrap_or(unit_dir),
        config_path: config_path.clone(),
        dependencies: Vec::new(),
        included_files: Vec::new(),
        external: false,
    };

    if needs_confirmation(&command) && !ctx.opts.non_interactive {
        let message = confirmation_message(&command, 1);
        if !prompter.confirm(&message)? {
            return Ok(RunResult::declined());
        }
    }

    let report = Report::new();
    let driver = UnitDriver {
        collaborators,
        reporter: reporter.clone(),
        stack: None,
        prompter,
    };

    let unit_ctx = ctx.clone_for_unit(&unit.dir, &unit.config_path);
    let started_at = Utc::now();
    let outcome = driver.run_unit(&unit, &unit_ctx);
    let ended_at = Utc::now();
    let unit_exit = unit_ctx.exit_code();

    report.add(ReportEntry {
        unit: unit.dir.clone(),
        state: outcome.state,
        started_at: Some(started_at),
        ended_at: Some(ended_at),
        cause: outcome.error.clone(),
    });
    if unit_exit == DetailedExitCode::ChangesPresent {
        report.note_changes();
    }

    let mut exit = unit_exit;
    let mut first_failure = None;
    if outcome.state == RunState::Failed {
        exit = exit.merge(DetailedExitCode::Error);
        first_failure = Some((
            unit.dir.display().to_string(),
            outcome.error.unwrap_or_else(|| "unit failed".to_string()),
        ));
    }

    finish_run(ctx, &report, exit, first_failure)
}

fn run_stack(
    ctx: &RunContext,
    collaborators: Collaborators<'_>,
    reporter: &SharedReporter,
    prompter: &dyn Prompter,
) -> Result<RunResult> {
    let command = ctx.opts.engine_command().unwrap_or_default().to_string();

    // Graph mode anchors at the working directory but discovers the
    // dependents from a wider root.
    let root = if ctx.opts.graph {
        ctx.opts
            .graph_root
            .clone()
            .unwrap_or_else(|| default_graph_root(&ctx.working_dir))
    } else {
        ctx.working_dir.clone()
    };

    let mut stack = build_stack(ctx, &root, prompter)?;

    let mut reading_files = ctx.opts.units_that_include.clone();
    reading_files.extend(ctx.opts.queue_include_units_reading.iter().cloned());
    let filters = QueueFilters::compile(
        &ctx.opts.queue_exclude_dirs,
        &ctx.opts.queue_include_dirs,
        ctx.opts.queue_strict_include,
        ctx.opts.queue_excludes_file.as_deref(),
        &reading_files,
    )?;
    stack.apply_filters(&filters)?;

    if ctx.opts.graph {
        stack.restrict_to_dependents(&ctx.working_dir)?;
    }

    if stack.is_empty() && stack.excluded().is_empty() {
        reporter
            .lock()
            .expect("reporter poisoned")
            .warn("no units found under the working directory");
    }

    // One prompt for the whole run, never one per unit.
    if needs_confirmation(&command) && !ctx.opts.non_interactive {
        let message = confirmation_message(&command, stack.len());
        if !prompter.confirm(&message)? {
            return Ok(RunResult::declined());
        }
    }

    let report = Report::new();
    for excluded in stack.excluded() {
        report.add(ReportEntry {
            unit: excluded.dir.clone(),
            state: RunState::Excluded,
            started_at: None,
            ended_at: None,
            cause: Some(excluded.reason.clone()),
        });
    }

    let driver = UnitDriver {
        collaborators,
        reporter: reporter.clone(),
        stack: Some(&stack),
        prompter,
    };
    let outcome = run_queue(&stack, ctx, &driver, &report, reporter);

    finish_run(ctx, &report, outcome.exit, outcome.first_failure)
}

/// The enclosing git repository root, else the directory itself.
fn default_graph_root(working_dir: &Path) -> std::path::PathBuf {
    let mut current = working_dir;
    loop {
        if current.join(".git").exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return working_dir.to_path_buf(),
        }
    }
}

/// Build the stack, prompting about external dependencies when neither
/// flag decided their fate up front.
fn build_stack(ctx: &RunContext, root: &Path, prompter: &dyn Prompter) -> Result<Stack> {
    let discovered = discover_units(root, CONFIG_FILENAME)?;

    let policy = if ctx.opts.queue_include_external {
        ExternalPolicy::Include
    } else if ctx.opts.queue_exclude_external {
        ExternalPolicy::Exclude
    } else {
        ExternalPolicy::Reject
    };

    match Stack::build(root, &discovered, CONFIG_FILENAME, policy) {
        Ok(stack) => Ok(stack),
        Err(err) => {
            let rejected = err
                .downcast_ref::<Error>()
                .and_then(|e| match e {
                    Error::ExternalDependencyRejected { path } => Some(path.clone()),
                    _ => None,
                });
            let Some(path) = rejected else {
                return Err(err);
            };
            if ctx.opts.non_interactive {
                return Err(err);
            }
            let include = prompter.confirm(&format!(
                "{} is outside the working directory. Run it as part of this stack?",
                path.display()
            ))?;
            let policy = if include {
                ExternalPolicy::Include
            } else {
                ExternalPolicy::Exclude
            };
            Stack::build(root, &discovered, CONFIG_FILENAME, policy)
        }
    }
}

fn finish_run(
    ctx: &RunContext,
    report: &Report,
    exit: DetailedExitCode,
    first_failure: Option<(String, String)>,
) -> Result<RunResult> {
    if let Some(path) = &ctx.opts.report_file {
        let format = ctx.opts.report_format.unwrap_or(ReportFormat::Csv);
        report.write_files(
            Some(path),
            format,
            ctx.opts.report_schema_file.as_deref(),
        )?;
    } else if let Some(schema) = &ctx.opts.report_schema_file {
        report.write_files(None, ReportFormat::Csv, Some(schema))?;
    }

    let summary = if ctx.opts.summary_disable
        || should_skip_summary(ctx.opts.engine_command(), ctx.opts.engine_extra_args())
    {
        None
    } else {
        let color = !ctx.opts.disable_color && std::io::stdout().is_terminal();
        Some(report.render_human(ctx.opts.summary_per_unit, color))
    };

    Ok(RunResult {
        exit,
        summary,
        first_failure,
        declined: false,
    })
}

/// Build the stack for the `graph` subcommand and render DOT.
pub fn render_graph_dot(opts: &RunOptions, prompter: &dyn Prompter) -> Result<String> {
    let ctx = RunContext::new(opts.clone());
    let root = ctx.working_dir.clone();
    let stack = build_stack(&ctx, &root, prompter)?;
    Ok(stack.render_dot())
}

/// Fully evaluate the current unit's config (for `render` and
/// `info print`).
pub fn resolve_full_config(ctx: &RunContext) -> Result<stackrun_config::LoadedConfig> {
    let config_path = if ctx.config_path.is_file() {
        ctx.config_path.clone()
    } else {
        stackrun_config::find_config_upwards(&ctx.working_dir).ok_or_else(|| {
            Error::MissingConfig {
                path: ctx.config_path.clone(),
            }
        })?
    };
    let resolver = EngineOutputs::new(ctx);
    let loaded = match ctx.opts.engine_command() {
        Some(command) => stackrun_config::load(
            &config_path,
            &stackrun_config::LoadOptions::for_command(&resolver, command),
        )?,
        None => stackrun_config::load(
            &config_path,
            &stackrun_config::LoadOptions::new(&resolver),
        )?,
    };
    Ok(loaded)
}

fn confirmation_message(command: &str, unit_count: usize) -> String {
    let noun = if unit_count == 1 { "unit" } else { "units" };
    match command {
        "destroy" => format!(
            "WARNING: destroy will delete the infrastructure of {unit_count} {noun}. \
             There is no undo. Continue?"
        ),
        "apply" => format!("apply will change the infrastructure of {unit_count} {noun}. Continue?"),
        _ => format!("{command} will modify state across {unit_count} {noun}. Continue?"),
    }
}
