use std::collections::BTreeMap;
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use stackrun_core::creds::ExecCredentialSource;
use stackrun_core::driver::Collaborators;
use stackrun_core::engine::{Reporter, shared_reporter};
use stackrun_core::source::LocalFetcher;
use stackrun_core::{Prompter, RunContext, RunOptions};
use stackrun_types::ReportFormat;

#[derive(Parser, Debug)]
#[command(name = "stackrun", version)]
#[command(about = "DAG-ordered orchestration of Terraform-compatible engines across stacks of units")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an engine command in the current unit, or across the whole
    /// stack with --all.
    Run(RunArgs),
    /// Emit the stack's dependency graph in DOT format.
    Graph(GraphArgs),
    /// Format or validate unit configuration files.
    Hcl(HclArgs),
    /// Inspect the resolved run context and strict controls.
    Info(InfoArgs),
    /// Render the fully evaluated configuration of the current unit.
    Render(RenderArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Fan the command out over every unit under the working directory.
    #[arg(long)]
    all: bool,

    /// Run the current unit plus all units that depend on it.
    #[arg(long)]
    graph: bool,

    /// Discovery root for --graph (default: the enclosing git root).
    #[arg(long)]
    graph_root: Option<PathBuf>,

    /// Root (or unit) working directory.
    #[arg(long, default_value = ".")]
    working_dir: PathBuf,

    /// Explicit config file path.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Engine binary to invoke (default: terraform, then tofu).
    #[arg(long)]
    tf_path: Option<String>,

    /// Max units executing concurrently.
    #[arg(long)]
    parallelism: Option<usize>,

    #[arg(long)]
    no_auto_init: bool,

    #[arg(long)]
    no_auto_retry: bool,

    #[arg(long)]
    no_auto_approve: bool,

    /// Never prompt; assume safe defaults and fail where a prompt
    /// would be required.
    #[arg(long)]
    non_interactive: bool,

    /// Override the unit's source URL.
    #[arg(long)]
    source: Option<String>,

    /// Re-download sources even when cached.
    #[arg(long)]
    source_update: bool,

    /// Source prefix substitution, as ORIGINAL=REPLACEMENT (repeatable).
    #[arg(long = "source-map")]
    source_map: Vec<String>,

    /// Download cache directory.
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Run dependents even when a dependency failed.
    #[arg(long)]
    queue_ignore_errors: bool,

    /// Ignore dependency ordering entirely.
    #[arg(long)]
    queue_ignore_dag_order: bool,

    /// Assume external dependencies are already applied.
    #[arg(long)]
    queue_exclude_external: bool,

    /// Schedule external dependencies as part of the run.
    #[arg(long)]
    queue_include_external: bool,

    /// Exclude units matching this glob (repeatable).
    #[arg(long = "queue-exclude-dir")]
    queue_exclude_dir: Vec<String>,

    /// Include units matching this glob (repeatable).
    #[arg(long = "queue-include-dir")]
    queue_include_dir: Vec<String>,

    /// With --queue-include-dir, run only the matches, not their
    /// dependencies.
    #[arg(long)]
    queue_strict_include: bool,

    /// File listing unit paths to exclude, one per line.
    #[arg(long)]
    queue_excludes_file: Option<PathBuf>,

    /// Run only units whose config reads this file (repeatable).
    #[arg(long = "queue-include-units-reading")]
    queue_include_units_reading: Vec<PathBuf>,

    /// Run only units whose config includes this file (repeatable).
    #[arg(long = "units-that-include")]
    units_that_include: Vec<PathBuf>,

    /// Cancel everything on the first failure.
    #[arg(long)]
    fail_fast: bool,

    #[arg(long)]
    summary_disable: bool,

    #[arg(long)]
    summary_per_unit: bool,

    /// Write the run report to this file.
    #[arg(long)]
    report_file: Option<PathBuf>,

    /// Report format: csv or json.
    #[arg(long)]
    report_format: Option<String>,

    /// Write a JSON Schema describing the JSON report form.
    #[arg(long)]
    report_schema_file: Option<PathBuf>,

    #[arg(long)]
    no_destroy_dependencies_check: bool,

    /// Forward unknown engine subcommands instead of rejecting them.
    #[arg(long)]
    disable_command_validation: bool,

    #[arg(long)]
    use_partial_parse_config_cache: bool,

    /// Write a tfvars snapshot of the resolved inputs per unit.
    #[arg(long)]
    inputs_debug: bool,

    /// Mirror engine stdout onto the terminal.
    #[arg(long)]
    tf_forward_stdout: bool,

    /// Feature toggle, as NAME=VALUE (repeatable).
    #[arg(long = "feature")]
    feature: Vec<String>,

    /// Assume this role before running the engine (wins over config).
    #[arg(long)]
    iam_assume_role: Option<String>,

    #[arg(long)]
    iam_assume_role_session_name: Option<String>,

    #[arg(long)]
    iam_assume_role_duration: Option<u64>,

    /// External command printing a JSON env map of credentials.
    #[arg(long)]
    auth_provider_cmd: Option<String>,

    #[arg(long)]
    no_color: bool,

    /// Export null inputs as env vars instead of the null-vars file.
    #[arg(long)]
    legacy_null_inputs: bool,

    /// Read dependency outputs from state files instead of running the
    /// engine's output command.
    #[arg(long)]
    dependency_fetch_output_from_state: bool,

    /// Engine subcommand and arguments, after `--`.
    #[arg(last = true)]
    engine_args: Vec<String>,
}

#[derive(Args, Debug)]
struct GraphArgs {
    #[arg(long, default_value = ".")]
    working_dir: PathBuf,

    /// Write the DOT text to a file instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Schedule external dependencies as part of the graph.
    #[arg(long)]
    queue_include_external: bool,
}

#[derive(Args, Debug)]
struct HclArgs {
    #[command(subcommand)]
    cmd: HclCommands,
}

#[derive(Subcommand, Debug)]
enum HclCommands {
    /// Normalize whitespace of every unit config under the root.
    Fmt {
        #[arg(long, default_value = ".")]
        working_dir: PathBuf,

        /// Report files needing formatting without rewriting them.
        #[arg(long)]
        check: bool,
    },
    /// Parse every unit config and report errors.
    Validate {
        #[arg(long, default_value = ".")]
        working_dir: PathBuf,

        /// Also evaluate each unit's inputs.
        #[arg(long)]
        inputs: bool,
    },
}

#[derive(Args, Debug)]
struct InfoArgs {
    #[command(subcommand)]
    cmd: InfoCommands,
}

#[derive(Subcommand, Debug)]
enum InfoCommands {
    /// Print resolved run-context facts as JSON.
    Print {
        #[arg(long, default_value = ".")]
        working_dir: PathBuf,
    },
    /// Strict-mode controls.
    Strict {
        #[command(subcommand)]
        cmd: StrictCommands,
    },
}

#[derive(Subcommand, Debug)]
enum StrictCommands {
    /// List strict controls (active ones by default).
    List {
        /// Include controls that are not active yet.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[arg(long, default_value = ".")]
    working_dir: PathBuf,

    /// Render JSON instead of HCL.
    #[arg(long)]
    json: bool,

    /// Write the rendered config next to the source config.
    #[arg(long)]
    write: bool,

    /// Write the rendered config to this path.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Strict controls: (name, active).
const STRICT_CONTROLS: &[(&str, bool)] = &[
    ("deprecated-flag-names", true),
    ("root-config-in-repo-root", true),
    ("require-explicit-bootstrap", false),
    ("skip-dependencies-inputs", false),
];

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn confirm(&self, message: &str) -> Result<bool> {
        eprint!("{message} [y/N] ");
        std::io::stderr().flush().ok();
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read confirmation")?;
        let answer = line.trim().to_ascii_lowercase();
        Ok(answer == "y" || answer == "yes")
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[error] {err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("TG_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.cmd {
        Commands::Run(args) => run_command(args),
        Commands::Graph(args) => graph_command(args),
        Commands::Hcl(args) => match args.cmd {
            HclCommands::Fmt { working_dir, check } => hcl_fmt(&working_dir, check),
            HclCommands::Validate {
                working_dir,
                inputs,
            } => hcl_validate(&working_dir, inputs),
        },
        Commands::Info(args) => match args.cmd {
            InfoCommands::Print { working_dir } => info_print(&working_dir),
            InfoCommands::Strict {
                cmd: StrictCommands::List { all },
            } => strict_list(all),
        },
        Commands::Render(args) => render_command(args),
    }
}

fn run_command(args: RunArgs) -> Result<ExitCode> {
    let env = |name: &str| std::env::var(name).ok();
    let opts = build_options(&args, &env)?;

    let credentials = args.auth_provider_cmd.as_ref().map(|cmd| {
        ExecCredentialSource {
            command: shell_words(cmd),
        }
    });
    static FETCHER: LocalFetcher = LocalFetcher;
    let collaborators = Collaborators {
        fetcher: &FETCHER,
        credentials: credentials
            .as_ref()
            .map(|c| c as &dyn stackrun_core::creds::CredentialSource),
        assume_role: None,
    };

    let reporter = shared_reporter(CliReporter);
    let result = stackrun_core::run(opts, collaborators, &reporter, &StdinPrompter)?;

    if result.declined {
        eprintln!("[info] aborted at user request");
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(summary) = &result.summary {
        print!("{summary}");
    }
    if let Some((unit, error)) = &result.first_failure {
        eprintln!("[error] {unit}: {error}");
    }
    Ok(ExitCode::from(result.exit.as_i32() as u8))
}

fn graph_command(args: GraphArgs) -> Result<ExitCode> {
    let opts = RunOptions {
        working_dir: args.working_dir,
        queue_include_external: args.queue_include_external,
        // External units stay out of the graph unless asked for.
        queue_exclude_external: !args.queue_include_external,
        ..RunOptions::default()
    };
    let dot = stackrun_core::command::render_graph_dot(&opts, &stackrun_core::AcceptAll)?;
    match args.output {
        Some(path) => std::fs::write(&path, dot)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => print!("{dot}"),
    }
    Ok(ExitCode::SUCCESS)
}

fn hcl_fmt(working_dir: &std::path::Path, check: bool) -> Result<ExitCode> {
    let units = stackrun_core::discover::discover_units(working_dir, stackrun_types::CONFIG_FILENAME)?;
    let mut dirty = Vec::new();
    for unit in &units {
        let content = std::fs::read_to_string(&unit.config_path)
            .with_context(|| format!("failed to read {}", unit.config_path.display()))?;
        let formatted = normalize_hcl(&content);
        if formatted != content {
            if check {
                dirty.push(unit.config_path.clone());
            } else {
                std::fs::write(&unit.config_path, formatted)
                    .with_context(|| format!("failed to write {}", unit.config_path.display()))?;
            }
        }
    }
    if check && !dirty.is_empty() {
        for path in &dirty {
            println!("{}", path.display());
        }
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

fn hcl_validate(working_dir: &std::path::Path, inputs: bool) -> Result<ExitCode> {
    let units = stackrun_core::discover::discover_units(working_dir, stackrun_types::CONFIG_FILENAME)?;
    let mut failures = 0usize;
    for unit in &units {
        let result = if inputs {
            stackrun_config::load(
                &unit.config_path,
                &stackrun_config::LoadOptions::new(&stackrun_config::EmptyOutputs),
            )
            .map(|_| ())
        } else {
            stackrun_config::load_graph_info(&unit.config_path).map(|_| ())
        };
        if let Err(err) = result {
            failures += 1;
            eprintln!("[error] {err}");
        }
    }
    if failures > 0 {
        eprintln!("[error] {failures} of {} units failed validation", units.len());
        return Ok(ExitCode::from(1));
    }
    println!("{} units validated", units.len());
    Ok(ExitCode::SUCCESS)
}

fn info_print(working_dir: &std::path::Path) -> Result<ExitCode> {
    let opts = RunOptions {
        working_dir: working_dir.to_path_buf(),
        ..RunOptions::default()
    };
    let ctx = RunContext::new(opts);
    let config_path = stackrun_config::find_config_upwards(&ctx.working_dir);
    let download_dir = ctx.download_dir_for(&ctx.working_dir, None);

    let facts = serde_json::json!({
        "working_dir": ctx.working_dir,
        "config_path": config_path,
        "download_dir": download_dir,
        "engine_binary": ctx.engine_binary,
    });
    println!("{}", serde_json::to_string_pretty(&facts)?);
    Ok(ExitCode::SUCCESS)
}

fn strict_list(all: bool) -> Result<ExitCode> {
    for (name, active) in STRICT_CONTROLS {
        if *active {
            println!("{name}");
        } else if all {
            println!("{name} (inactive)");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn render_command(args: RenderArgs) -> Result<ExitCode> {
    let opts = RunOptions {
        working_dir: args.working_dir.clone(),
        ..RunOptions::default()
    };
    let ctx = RunContext::new(opts);
    let loaded = stackrun_core::command::resolve_full_config(&ctx)?;

    let rendered = if args.json {
        serde_json::to_string_pretty(&loaded.config)?
    } else {
        hcl::to_string(&loaded.config).context("failed to render config as HCL")?
    };

    if args.write || args.out.is_some() {
        let default_name = if args.json {
            "terragrunt.rendered.json"
        } else {
            "terragrunt.rendered.hcl"
        };
        let path = args.out.unwrap_or_else(|| {
            loaded
                .config_path
                .parent()
                .map(|p| p.join(default_name))
                .unwrap_or_else(|| PathBuf::from(default_name))
        });
        std::fs::write(&path, rendered)
            .with_context(|| format!("failed to write {}", path.display()))?;
    } else {
        println!("{rendered}");
    }
    Ok(ExitCode::SUCCESS)
}

/// Build [`RunOptions`] from flags, falling back to the `TG_*` env
/// namespace and then the legacy `TERRAGRUNT_*` one per option.
fn build_options(args: &RunArgs, env: &dyn Fn(&str) -> Option<String>) -> Result<RunOptions> {
    let lookup = |name: &str| -> Option<String> {
        env(&format!("TG_{name}")).or_else(|| env(&format!("TERRAGRUNT_{name}")))
    };
    let flag = |set: bool, name: &str| set || lookup(name).map(|v| truthy(&v)).unwrap_or(false);
    let list = |cli: &[String], name: &str| -> Vec<String> {
        if !cli.is_empty() {
            return cli.to_vec();
        }
        lookup(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let path_list = |cli: &[PathBuf], name: &str| -> Vec<PathBuf> {
        if !cli.is_empty() {
            return cli.to_vec();
        }
        list(&[], name).into_iter().map(PathBuf::from).collect()
    };

    let report_format = match args
        .report_format
        .clone()
        .or_else(|| lookup("REPORT_FORMAT"))
    {
        Some(raw) => Some(raw.parse::<ReportFormat>()?),
        None => None,
    };

    let iam_role = args
        .iam_assume_role
        .clone()
        .or_else(|| lookup("IAM_ASSUME_ROLE"))
        .map(|role_arn| stackrun_config::IamRole {
            role_arn,
            session_name: args
                .iam_assume_role_session_name
                .clone()
                .or_else(|| lookup("IAM_ASSUME_ROLE_SESSION_NAME")),
            duration_secs: args.iam_assume_role_duration.or_else(|| {
                lookup("IAM_ASSUME_ROLE_DURATION").and_then(|v| v.parse().ok())
            }),
        });

    let parallelism = match args.parallelism {
        Some(n) => Some(n),
        None => match lookup("PARALLELISM") {
            Some(raw) => Some(raw.parse().context("invalid TG_PARALLELISM")?),
            None => None,
        },
    };

    let non_interactive = flag(args.non_interactive, "NON_INTERACTIVE")
        || !std::io::stdin().is_terminal();

    Ok(RunOptions {
        working_dir: args.working_dir.clone(),
        config_path: args
            .config
            .clone()
            .or_else(|| lookup("CONFIG").map(PathBuf::from)),
        engine_binary: args.tf_path.clone().or_else(|| lookup("TF_PATH")),
        engine_args: args.engine_args.clone(),
        all_units: args.all,
        graph: args.graph,
        graph_root: args
            .graph_root
            .clone()
            .or_else(|| lookup("GRAPH_ROOT").map(PathBuf::from)),
        parallelism,
        no_auto_init: flag(args.no_auto_init, "NO_AUTO_INIT"),
        no_auto_retry: flag(args.no_auto_retry, "NO_AUTO_RETRY"),
        no_auto_approve: flag(args.no_auto_approve, "NO_AUTO_APPROVE"),
        non_interactive,
        source: args.source.clone().or_else(|| lookup("SOURCE")),
        source_update: flag(args.source_update, "SOURCE_UPDATE"),
        source_map: parse_pairs(&list(&args.source_map, "SOURCE_MAP"))?,
        download_dir: args
            .download_dir
            .clone()
            .or_else(|| lookup("DOWNLOAD_DIR").map(PathBuf::from)),
        ignore_dependency_errors: flag(args.queue_ignore_errors, "QUEUE_IGNORE_ERRORS"),
        ignore_dependency_order: flag(args.queue_ignore_dag_order, "QUEUE_IGNORE_DAG_ORDER"),
        queue_exclude_external: flag(args.queue_exclude_external, "QUEUE_EXCLUDE_EXTERNAL"),
        queue_include_external: flag(args.queue_include_external, "QUEUE_INCLUDE_EXTERNAL"),
        queue_exclude_dirs: list(&args.queue_exclude_dir, "QUEUE_EXCLUDE_DIR"),
        queue_include_dirs: list(&args.queue_include_dir, "QUEUE_INCLUDE_DIR"),
        queue_strict_include: flag(args.queue_strict_include, "QUEUE_STRICT_INCLUDE"),
        queue_excludes_file: args
            .queue_excludes_file
            .clone()
            .or_else(|| lookup("QUEUE_EXCLUDES_FILE").map(PathBuf::from)),
        queue_include_units_reading: path_list(
            &args.queue_include_units_reading,
            "QUEUE_INCLUDE_UNITS_READING",
        ),
        units_that_include: path_list(&args.units_that_include, "UNITS_THAT_INCLUDE"),
        fail_fast: flag(args.fail_fast, "FAIL_FAST"),
        summary_disable: flag(args.summary_disable, "SUMMARY_DISABLE"),
        summary_per_unit: flag(args.summary_per_unit, "SUMMARY_PER_UNIT"),
        report_file: args
            .report_file
            .clone()
            .or_else(|| lookup("REPORT_FILE").map(PathBuf::from)),
        report_format,
        report_schema_file: args
            .report_schema_file
            .clone()
            .or_else(|| lookup("REPORT_SCHEMA_FILE").map(PathBuf::from)),
        no_destroy_dependencies_check: flag(
            args.no_destroy_dependencies_check,
            "NO_DESTROY_DEPENDENCIES_CHECK",
        ),
        disable_command_validation: flag(
            args.disable_command_validation,
            "DISABLE_COMMAND_VALIDATION",
        ),
        use_partial_parse_config_cache: flag(
            args.use_partial_parse_config_cache,
            "USE_PARTIAL_PARSE_CONFIG_CACHE",
        ),
        inputs_debug: flag(args.inputs_debug, "INPUTS_DEBUG"),
        tf_forward_stdout: flag(args.tf_forward_stdout, "TF_FORWARD_STDOUT"),
        feature_flags: parse_pairs(&list(&args.feature, "FEATURE"))?,
        iam_role,
        disable_color: flag(args.no_color, "NO_COLOR"),
        legacy_null_inputs: flag(args.legacy_null_inputs, "LEGACY_NULL_INPUTS"),
        dependency_fetch_output_from_state: flag(
            args.dependency_fetch_output_from_state,
            "DEPENDENCY_FETCH_OUTPUT_FROM_STATE",
        ),
    })
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_pairs(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for item in raw {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got '{item}'"))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Minimal shell-style splitting for the credential command line.
fn shell_words(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Whitespace normalization: trailing spaces stripped, runs of blank
/// lines collapsed, exactly one trailing newline.
fn normalize_hcl(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut blank_run = 0usize;
    for line in content.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    while out.ends_with("\n\n") {
        out.pop();
    }
    if out.is_empty() {
        out.push('\n');
    }
    out
}
