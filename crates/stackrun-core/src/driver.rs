//! The per-unit execution pipeline.
//!
//! For one unit the driver performs, in order: the version fast path,
//! credential injection, version-constraint checking, the full config
//! parse, the read-config hook replay, skip handling, role merging,
//! config-derived overrides, source resolution, code generation, the
//! engine-files check, the destroy dependent check, extra-args and
//! var-file merging, input export, init (explicit or automatic),
//! destroy protection, the hook envelope around the engine invocation,
//! and the provider lock-file copy-back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value as Json;

use stackrun_config::{DependencyOutputsResolver, LoadOptions, PartialConfig, UnitConfig};
use stackrun_process::ProcessRequest;
use stackrun_retry::{CompiledRetryPolicy, RetryPolicy};
use stackrun_types::{Error, HookPhase, READ_CONFIG_PHASE, changes_provider_lock, init_not_required};

use crate::command::Prompter;
use crate::creds::CredentialSource;
use crate::dag::{Stack, Unit};
use crate::engine::{self, SharedReporter};
use crate::generate;
use crate::hooks;
use crate::options::RunContext;
use crate::queue::{UnitOutcome, UnitRunner};
use crate::source::{Fetcher, LocalFetcher, apply_source_map};
use crate::version;

/// Inputs snapshot written when `--inputs-debug` is set.
pub const DEBUG_INPUTS_FILE: &str = "terragrunt-debug.tfvars.json";

/// Ephemeral carrier for explicit null inputs; removed at unit end.
pub const NULL_VARS_FILE: &str = ".terragrunt-null-vars.auto.tfvars.json";

/// Provider lock file copied back after init-like commands.
pub const LOCK_FILE: &str = ".terraform.lock.hcl";

/// External collaborators the pipeline consumes via interfaces.
pub struct Collaborators<'a> {
    pub fetcher: &'a dyn Fetcher,
    /// External-command credential provider (runs before config parse).
    pub credentials: Option<&'a dyn CredentialSource>,
    /// Assumed-role credential provider (runs after role merging).
    pub assume_role: Option<&'a dyn CredentialSource>,
}

impl Collaborators<'static> {
    pub fn local() -> Self {
        static FETCHER: LocalFetcher = LocalFetcher;
        Self {
            fetcher: &FETCHER,
            credentials: None,
            assume_role: None,
        }
    }
}

/// Drives one unit end to end; implements [`UnitRunner`] for the queue.
pub struct UnitDriver<'a> {
    pub collaborators: Collaborators<'a>,
    pub reporter: SharedReporter,
    /// The surrounding stack, for the destroy dependent check.
    pub stack: Option<&'a Stack>,
    pub prompter: &'a dyn Prompter,
}

impl UnitRunner for UnitDriver<'_> {
    fn run_unit(&self, unit: &Unit, ctx: &RunContext) -> UnitOutcome {
        match self.run_pipeline(unit, ctx) {
            Ok(outcome) => outcome,
            Err(err) => UnitOutcome::failed(format!("{err:#}")),
        }
    }
}

impl UnitDriver<'_> {
    fn run_pipeline(&self, unit: &Unit, ctx: &RunContext) -> Result<UnitOutcome> {
        let mut ctx = ctx.clone();
        let command = ctx
            .opts
            .engine_command()
            .ok_or(Error::MissingCommand)?
            .to_string();

        // Version questions use the partial parse and skip the rest of
        // the pipeline entirely.
        if command == "version" {
            return self.run_version_fast_path(&mut ctx);
        }

        // Credentials may influence the config itself, so they merge
        // before the full parse.
        if let Some(provider) = self.collaborators.credentials {
            let injected = provider
                .credentials(&ctx)
                .context("external credential provider failed")?;
            ctx.env.extend(injected);
        }

        let partial = load_partial_cached(&ctx, &ctx.config_path)?;
        if let Some(binary) = &partial.terraform_binary {
            ctx.engine_binary = binary.clone();
        }
        if let Some(constraint) = &partial.terraform_version_constraint {
            version::check_version_constraint(&ctx.engine_binary, constraint)?;
        }

        let resolver = EngineOutputs { ctx: &ctx };
        let loaded = stackrun_config::load(
            &ctx.config_path,
            &LoadOptions::for_command(&resolver, &command),
        )?;
        let config = loaded.config;

        // Read-config replay: after hooks subscribed to the synthetic
        // phase observe the parsed config before anything runs.
        hooks::run_hooks(
            HookPhase::After,
            &config,
            &ctx,
            READ_CONFIG_PHASE,
            &[],
            &self.reporter,
        )?;

        if config.is_skipped() {
            self.reporter
                .lock()
                .expect("reporter poisoned")
                .info(&format!("{}: skip = true", unit.dir.display()));
            return Ok(UnitOutcome::skipped());
        }

        // CLI role wins over config role.
        let role = ctx.opts.iam_role.clone().or_else(|| config.iam_role.clone());
        if role.is_some() {
            if let Some(provider) = self.collaborators.assume_role {
                let injected = provider
                    .credentials(&ctx)
                    .context("assume-role provider failed")?;
                ctx.env.extend(injected);
            }
        }

        if let Some(binary) = &config.terraform_binary {
            ctx.engine_binary = binary.clone();
        }
        let policy = build_retry_policy(&config)?;

        let working_dir = self.resolve_working_dir(unit, &ctx, &config)?;
        ctx.working_dir = working_dir.clone();

        generate::generate(&working_dir, &config, &ctx.dir_locks)?;
        if ctx.opts.inputs_debug {
            write_debug_inputs(&working_dir, &config)?;
        }

        if !generate::has_engine_files(&working_dir) {
            return Err(Error::NoEngineFilesFound { dir: working_dir }.into());
        }

        if command == "destroy" {
            self.check_dependent_units(unit, &ctx)?;
        }

        let mut args = compose_args(&command, &config, &ctx, &working_dir)?;
        for extra in config
            .terraform
            .extra_arguments
            .iter()
            .filter(|e| e.applies_to(&command))
        {
            if let Some(env_vars) = &extra.env_vars {
                ctx.env
                    .extend(env_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        let null_vars = export_inputs(&mut ctx, &config, &working_dir)?;

        if command == "init" {
            append_backend_args(&mut args, &config);
        } else if needs_init(&working_dir, &config, &command)? {
            if ctx.opts.no_auto_init {
                self.reporter.lock().expect("reporter poisoned").warn(&format!(
                    "{}: init is required but auto-init is disabled; the engine will likely fail",
                    working_dir.display()
                ));
            } else {
                self.run_auto_init(&ctx, &working_dir, &config, &policy)?;
            }
        }

        if command == "destroy" && config.is_protected() {
            remove_null_vars(&working_dir, &null_vars);
            return Err(Error::ModuleIsProtected {
                path: unit.dir.clone(),
            }
            .into());
        }

        let result = self.run_action_with_hooks(&ctx, &working_dir, &config, &command, &args, &policy);
        remove_null_vars(&working_dir, &null_vars);
        let action_errors = match result {
            Ok(()) => Vec::new(),
            Err(errors) => errors,
        };

        // Lock-file propagation happens only on clean init-like runs.
        let mut copy_error = None;
        if action_errors.is_empty()
            && changes_provider_lock(&command, ctx.opts.engine_extra_args())
            && config.terraform.copy_lock_file()
            && working_dir != unit.dir
        {
            if let Err(err) = copy_lock_file(&working_dir, &unit.dir) {
                copy_error = Some(format!("{err:#}"));
            }
        }

        match (action_errors.is_empty(), copy_error) {
            (true, None) => Ok(UnitOutcome::succeeded()),
            (true, Some(copy)) => Ok(UnitOutcome::failed(copy)),
            (false, copy) => {
                let mut joined = action_errors.join("; ");
                if let Some(copy) = copy {
                    joined.push_str("; ");
                    joined.push_str(&copy);
                }
                Ok(UnitOutcome::failed(joined))
            }
        }
    }

    fn run_version_fast_path(&self, ctx: &mut RunContext) -> Result<UnitOutcome> {
        if let Ok(partial) = load_partial_cached(ctx, &ctx.config_path) {
            if let Some(binary) = partial.terraform_binary {
                ctx.engine_binary = binary;
            }
        }
        let policy = RetryPolicy {
            max_attempts: 1,
            sleep_interval: Duration::ZERO,
            retryable_errors: Vec::new(),
        }
        .compile()
        .expect("static policy");
        let args: Vec<String> = ctx.opts.engine_args.clone();
        let invocation = engine::invoke(ctx, &ctx.working_dir, &args, &policy, &self.reporter)?;
        if invocation.success() {
            Ok(UnitOutcome::succeeded())
        } else {
            Ok(UnitOutcome::failed(invocation.into_error().to_string()))
        }
    }

    fn resolve_working_dir(
        &self,
        unit: &Unit,
        ctx: &RunContext,
        config: &UnitConfig,
    ) -> Result<PathBuf> {
        let source = ctx
            .opts
            .source
            .clone()
            .or_else(|| config.terraform.source.clone());
        let Some(source) = source else {
            return Ok(unit.dir.clone());
        };

        let mapped = apply_source_map(&ctx.opts.source_map, &source);
        let download_dir = ctx.download_dir_for(&unit.dir, config.download_dir.as_deref());
        let resolved = crate::source::resolve(
            &mapped,
            &download_dir,
            ctx.opts.source_update,
            self.collaborators.fetcher,
            &ctx.dir_locks,
        )?;
        tracing::debug!(
            unit = %unit.dir.display(),
            source = %mapped,
            dir = %resolved.display(),
            "resolved source"
        );
        Ok(resolved)
    }

    fn check_dependent_units(&self, unit: &Unit, ctx: &RunContext) -> Result<()> {
        if ctx.opts.no_destroy_dependencies_check {
            return Ok(());
        }
        let Some(stack) = self.stack else {
            return Ok(());
        };
        let dependents = stack.dependents_of_dir(&unit.dir);
        if dependents.is_empty() {
            return Ok(());
        }

        let listing = dependents
            .iter()
            .map(|d| format!("  - {}", d.display()))
            .collect::<Vec<_>>()
            .join("\n");
        let message = format!(
            "{} is a dependency of other units:\n{listing}\nDestroy it anyway?",
            unit.dir.display()
        );

        if ctx.opts.non_interactive {
            anyhow::bail!(
                "refusing to destroy {}: other units depend on it:\n{listing}",
                unit.dir.display()
            );
        }
        if !self.prompter.confirm(&message)? {
            return Err(Error::UserDeclined.into());
        }
        Ok(())
    }

    fn run_auto_init(
        &self,
        ctx: &RunContext,
        working_dir: &Path,
        config: &UnitConfig,
        policy: &CompiledRetryPolicy,
    ) -> Result<()> {
        self.reporter
            .lock()
            .expect("reporter poisoned")
            .info(&format!("{}: running init before the requested command", working_dir.display()));

        let mut args = vec!["init".to_string()];
        append_backend_args(&mut args, config);
        let invocation = engine::invoke(ctx, working_dir, &args, policy, &self.reporter)?;
        if !invocation.success() {
            return Err(invocation.into_error().into());
        }
        Ok(())
    }

    /// Before hooks, then the engine, then after hooks (always), then
    /// error hooks when anything failed. A before-hook failure skips
    /// the engine but still runs the after and error phases.
    fn run_action_with_hooks(
        &self,
        ctx: &RunContext,
        working_dir: &Path,
        config: &UnitConfig,
        command: &str,
        args: &[String],
        policy: &CompiledRetryPolicy,
    ) -> Result<(), Vec<String>> {
        let mut errors: Vec<String> = Vec::new();

        let before =
            hooks::run_hooks(HookPhase::Before, config, ctx, command, &[], &self.reporter);
        let before_failed = before.is_err();
        if let Err(err) = before {
            errors.push(format!("{err:#}"));
        }

        if !before_failed {
            match engine::invoke(ctx, working_dir, args, policy, &self.reporter) {
                Ok(invocation) if invocation.success() => {}
                Ok(invocation) => {
                    let combined = invocation.result.combined_output();
                    if let Some(rule) = matching_ignore_rule(config, &combined) {
                        self.reporter.lock().expect("reporter poisoned").warn(&format!(
                            "{}: ignoring engine failure per errors.ignore \"{}\"{}",
                            working_dir.display(),
                            rule.name,
                            rule.message
                                .as_ref()
                                .map(|m| format!(": {m}"))
                                .unwrap_or_default()
                        ));
                        ctx.reset_exit();
                    } else {
                        errors.push(invocation.into_error().to_string());
                    }
                }
                Err(err) => errors.push(format!("{err:#}")),
            }
        }

        if let Err(err) =
            hooks::run_hooks(HookPhase::After, config, ctx, command, &errors, &self.reporter)
        {
            errors.push(format!("{err:#}"));
        }

        if !errors.is_empty() {
            if let Err(err) =
                hooks::run_hooks(HookPhase::Error, config, ctx, command, &errors, &self.reporter)
            {
                errors.push(format!("{err:#}"));
            }
            return Err(errors);
        }
        Ok(())
    }
}

/// Resolves `dependency.*.outputs` by shelling out to the engine (or by
/// reading the state file when configured).
pub(crate) struct EngineOutputs<'a> {
    ctx: &'a RunContext,
}

impl<'a> EngineOutputs<'a> {
    pub(crate) fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }
}

impl DependencyOutputsResolver for EngineOutputs<'_> {
    fn fetch_outputs(&self, dependency_dir: &Path) -> Result<Json> {
        if self.ctx.opts.dependency_fetch_output_from_state {
            return outputs_from_state(dependency_dir);
        }

        let request = ProcessRequest::new(
            &self.ctx.engine_binary,
            ["output", "-json"],
        )
        .in_dir(dependency_dir)
        .with_env(&self.ctx.env);
        let result = stackrun_process::run(&request)
            .with_context(|| format!("failed to run output in {}", dependency_dir.display()))?;
        if !result.success() {
            anyhow::bail!(
                "output exited with code {} in {}: {}",
                result.exit_code,
                dependency_dir.display(),
                result.stderr_excerpt(200)
            );
        }
        parse_output_values(&result.stdout)
    }
}

/// `output -json` prints `{name: {value, type, sensitive}}`; flatten to
/// `{name: value}`. An empty state prints `{}`, which stays an empty
/// map rather than an error.
fn parse_output_values(stdout: &str) -> Result<Json> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Json::Object(serde_json::Map::new()));
    }
    let parsed: Json =
        serde_json::from_str(trimmed).context("engine output -json printed invalid JSON")?;
    let Json::Object(map) = parsed else {
        anyhow::bail!("engine output -json did not print an object");
    };
    let mut flattened = serde_json::Map::with_capacity(map.len());
    for (name, entry) in map {
        let value = entry.get("value").cloned().unwrap_or(entry);
        flattened.insert(name, value);
    }
    Ok(Json::Object(flattened))
}

fn outputs_from_state(dependency_dir: &Path) -> Result<Json> {
    let state_path = dependency_dir.join("terraform.tfstate");
    if !state_path.is_file() {
        return Ok(Json::Object(serde_json::Map::new()));
    }
    let content = std::fs::read_to_string(&state_path)
        .with_context(|| format!("failed to read {}", state_path.display()))?;
    let state: Json = serde_json::from_str(&content)
        .with_context(|| format!("invalid state file {}", state_path.display()))?;
    let outputs = state
        .get("outputs")
        .cloned()
        .unwrap_or(Json::Object(serde_json::Map::new()));
    let Json::Object(map) = outputs else {
        return Ok(Json::Object(serde_json::Map::new()));
    };
    let mut flattened = serde_json::Map::with_capacity(map.len());
    for (name, entry) in map {
        let value = entry.get("value").cloned().unwrap_or(entry);
        flattened.insert(name, value);
    }
    Ok(Json::Object(flattened))
}

/// Partial-parse results are immutable per file within one process, so
/// an opt-in process-wide cache skips repeated parses of shared
/// included files across hundreds of units.
fn load_partial_cached(
    ctx: &RunContext,
    path: &Path,
) -> Result<PartialConfig, stackrun_types::Error> {
    if !ctx.opts.use_partial_parse_config_cache {
        return stackrun_config::load_partial(path);
    }

    static CACHE: OnceLock<Mutex<BTreeMap<PathBuf, PartialConfig>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(BTreeMap::new()));
    if let Some(hit) = cache.lock().expect("partial cache poisoned").get(path) {
        return Ok(hit.clone());
    }
    let parsed = stackrun_config::load_partial(path)?;
    cache
        .lock()
        .expect("partial cache poisoned")
        .insert(path.to_path_buf(), parsed.clone());
    Ok(parsed)
}

fn build_retry_policy(config: &UnitConfig) -> Result<CompiledRetryPolicy> {
    let mut policy = RetryPolicy::default();
    if let Some(patterns) = &config.retryable_errors {
        policy.retryable_errors = patterns.clone();
    }
    if let Some(errors) = &config.errors {
        for rule in &errors.retry {
            policy
                .retryable_errors
                .extend(rule.retryable_errors.iter().cloned());
            if let Some(attempts) = rule.max_attempts {
                policy.max_attempts = attempts;
            }
            if let Some(sleep) = rule.sleep_interval_sec {
                policy.sleep_interval = Duration::from_secs(sleep);
            }
        }
    }
    if let Some(attempts) = config.retry_max_attempts {
        policy.max_attempts = attempts;
    }
    if let Some(sleep) = config.retry_sleep_interval_sec {
        policy.sleep_interval = Duration::from_secs(sleep);
    }
    policy.compile().map_err(Into::into)
}

fn matching_ignore_rule<'a>(
    config: &'a UnitConfig,
    output: &str,
) -> Option<&'a stackrun_config::IgnoreRule> {
    let errors = config.errors.as_ref()?;
    for rule in &errors.ignore {
        for pattern in &rule.ignorable_errors {
            if let Ok(regex) = regex::Regex::new(pattern) {
                if regex.is_match(output) {
                    return Some(rule);
                }
            }
        }
    }
    None
}

/// Argv for the engine: subcommand, config-declared extra arguments,
/// var files, auto-approve for fan-out applies, then the user's args.
fn compose_args(
    command: &str,
    config: &UnitConfig,
    ctx: &RunContext,
    working_dir: &Path,
) -> Result<Vec<String>> {
    let mut args = vec![command.to_string()];

    // A saved plan fixes all variables; var files would be rejected.
    let user_args = ctx.opts.engine_extra_args();
    let saved_plan = command == "apply"
        && user_args
            .first()
            .map(|arg| !arg.starts_with('-') && working_dir.join(arg).exists())
            .unwrap_or(false);

    for extra in config
        .terraform
        .extra_arguments
        .iter()
        .filter(|e| e.applies_to(command))
    {
        if let Some(arguments) = &extra.arguments {
            args.extend(arguments.iter().cloned());
        }
        if !saved_plan {
            for file in &extra.required_var_files {
                args.push(format!("-var-file={}", file.display()));
            }
            for file in &extra.optional_var_files {
                let resolved = if file.is_absolute() {
                    file.clone()
                } else {
                    working_dir.join(file)
                };
                if resolved.exists() {
                    args.push(format!("-var-file={}", file.display()));
                }
            }
        }
    }

    if matches!(command, "apply" | "destroy")
        && ctx.opts.all_units
        && !ctx.opts.no_auto_approve
        && !user_args.iter().any(|a| a == "-auto-approve")
    {
        args.push("-input=false".to_string());
        args.push("-auto-approve".to_string());
    }

    args.extend(user_args.iter().cloned());
    Ok(args)
}

fn append_backend_args(args: &mut Vec<String>, config: &UnitConfig) {
    let Some(remote_state) = &config.remote_state else {
        return;
    };
    if remote_state.disable_init {
        return;
    }
    for (key, value) in &remote_state.config {
        let rendered = match value {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        };
        args.push(format!("-backend-config={key}={rendered}"));
    }
}

/// Export inputs as `TF_VAR_*`. Null inputs are carried through the
/// ephemeral null-vars file instead, unless legacy mode exports them
/// directly. Returns the null keys for cleanup.
fn export_inputs(
    ctx: &mut RunContext,
    config: &UnitConfig,
    working_dir: &Path,
) -> Result<Vec<String>> {
    let mut null_keys = Vec::new();
    let mut null_object = serde_json::Map::new();

    for (key, value) in &config.inputs {
        match value {
            Json::Null if !ctx.opts.legacy_null_inputs => {
                null_keys.push(key.clone());
                null_object.insert(key.clone(), Json::Null);
            }
            Json::String(s) => {
                ctx.env.insert(format!("TF_VAR_{key}"), s.clone());
            }
            other => {
                let encoded =
                    serde_json::to_string(other).context("failed to encode input value")?;
                ctx.env.insert(format!("TF_VAR_{key}"), encoded);
            }
        }
    }

    if !null_object.is_empty() {
        let path = working_dir.join(NULL_VARS_FILE);
        let content = serde_json::to_string_pretty(&Json::Object(null_object))
            .context("failed to encode null inputs")?;
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(null_keys)
}

fn remove_null_vars(working_dir: &Path, null_keys: &[String]) {
    if !null_keys.is_empty() {
        let _ = std::fs::remove_file(working_dir.join(NULL_VARS_FILE));
    }
}

fn write_debug_inputs(working_dir: &Path, config: &UnitConfig) -> Result<()> {
    let path = working_dir.join(DEBUG_INPUTS_FILE);
    let content = serde_json::to_string_pretty(&Json::Object(config.inputs.clone()))
        .context("failed to encode debug inputs")?;
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Auto-init heuristic: anything missing that `init` would create.
fn needs_init(working_dir: &Path, config: &UnitConfig, command: &str) -> Result<bool> {
    if init_not_required(command) {
        return Ok(false);
    }
    let dot_terraform = working_dir.join(".terraform");
    if !dot_terraform.is_dir() {
        return Ok(true);
    }
    if !working_dir.join(LOCK_FILE).is_file() {
        return Ok(true);
    }
    if generate::references_modules(working_dir)? && !dot_terraform.join("modules").is_dir() {
        return Ok(true);
    }
    if config.remote_state.is_some() && !dot_terraform.join("terraform.tfstate").is_file() {
        return Ok(true);
    }
    Ok(false)
}

fn copy_lock_file(working_dir: &Path, unit_dir: &Path) -> Result<()> {
    let source = working_dir.join(LOCK_FILE);
    if !source.is_file() {
        return Ok(());
    }
    let dest = unit_dir.join(LOCK_FILE);
    std::fs::copy(&source, &dest).with_context(|| {
        format!(
            "failed to copy lock file from {} to {}",
            source.display(),
            dest.display()
        )
    })?;
    tracing::debug!(from = %source.display(), to = %dest.display(), "copied provider lock file");
    Ok(())
}
