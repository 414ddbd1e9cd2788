//! Unit configuration loading for stackrun.
//!
//! A unit is a working directory holding engine code plus one
//! `terragrunt.hcl` describing how to run it. This crate parses that file
//! into a typed [`UnitConfig`]: includes are merged child-over-parent
//! (lists concatenate in declaration order), `locals` are resolved, and
//! `dependency` blocks surface their outputs through a caller-provided
//! [`DependencyOutputsResolver`] so `${dependency.<name>.outputs.*}`
//! references inside `inputs` take real values.
//!
//! A partial-parse mode reads only the version-related attributes and
//! `feature` blocks, for paths that must not evaluate the full config.
//!
//! # Example
//!
//! ```ignore
//! use stackrun_config::{LoadOptions, EmptyOutputs, load};
//!
//! let loaded = load(path, &LoadOptions::new(&EmptyOutputs))?;
//! if loaded.config.is_skipped() {
//!     return Ok(());
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use stackrun_types::Error;

pub mod interp;

pub use stackrun_types::CONFIG_FILENAME;

/// Config file path for a unit directory.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILENAME)
}

/// Walk up from `start_dir` looking for a unit config file.
pub fn find_config_upwards(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;
    loop {
        let candidate = config_path(current);
        if candidate.is_file() {
            return Some(candidate);
        }
        current = current.parent()?;
    }
}

/// Resolves the outputs of an already-applied dependency unit.
///
/// The orchestrator's engine-backed implementation runs `output -json` in
/// the dependency's directory; tests plug in fixed maps.
pub trait DependencyOutputsResolver {
    /// Return the dependency's outputs as a JSON object. An empty state
    /// yields an empty object, not an error.
    fn fetch_outputs(&self, dependency_dir: &Path) -> anyhow::Result<Json>;
}

/// Resolver that knows no outputs; every dependency resolves to `{}`.
pub struct EmptyOutputs;

impl DependencyOutputsResolver for EmptyOutputs {
    fn fetch_outputs(&self, _dependency_dir: &Path) -> anyhow::Result<Json> {
        Ok(Json::Object(serde_json::Map::new()))
    }
}

/// Options threaded through a full config load.
pub struct LoadOptions<'a> {
    /// Dependency outputs source.
    pub resolver: &'a dyn DependencyOutputsResolver,
    /// Engine subcommand of the current run; gates mock-output use.
    pub engine_command: Option<&'a str>,
}

impl<'a> LoadOptions<'a> {
    pub fn new(resolver: &'a dyn DependencyOutputsResolver) -> Self {
        Self {
            resolver,
            engine_command: None,
        }
    }

    pub fn for_command(resolver: &'a dyn DependencyOutputsResolver, command: &'a str) -> Self {
        Self {
            resolver,
            engine_command: Some(command),
        }
    }
}

/// Policy for a generated file that already exists on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    /// Replace whatever is there.
    Overwrite,
    /// Replace only files carrying the orchestrator's generation marker.
    #[default]
    OverwriteTerragrunt,
    /// Leave the existing file alone.
    Skip,
    /// Fail the unit.
    Error,
}

/// A hook attached to the before or after phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    /// Label of the hook block.
    #[serde(default)]
    pub name: String,
    /// Engine subcommands (or the read-config phase) the hook applies to.
    pub commands: Vec<String>,
    /// Argv to execute.
    pub execute: Vec<String>,
    /// Working directory; defaults to the unit's working dir.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// For after hooks: run even when the action failed.
    #[serde(default)]
    pub run_on_error: bool,
    /// Swallow the hook's stdout instead of forwarding it.
    #[serde(default)]
    pub suppress_stdout: bool,
}

impl Hook {
    pub fn applies_to(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }
}

/// A hook attached to the error phase, gated by error matchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHook {
    #[serde(default)]
    pub name: String,
    pub commands: Vec<String>,
    pub execute: Vec<String>,
    /// Regexes matched against accumulated error text; any match fires.
    #[serde(default)]
    pub on_errors: Vec<String>,
    #[serde(default)]
    pub suppress_stdout: bool,
}

impl ErrorHook {
    pub fn applies_to(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }
}

/// Extra CLI arguments and env for specific engine subcommands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraArgs {
    #[serde(default)]
    pub name: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub arguments: Option<Vec<String>>,
    #[serde(default)]
    pub required_var_files: Vec<PathBuf>,
    #[serde(default)]
    pub optional_var_files: Vec<PathBuf>,
    #[serde(default)]
    pub env_vars: Option<BTreeMap<String, String>>,
}

impl ExtraArgs {
    pub fn applies_to(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }
}

/// Backend-file descriptor inside a `remote_state` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStateGenerate {
    pub path: PathBuf,
    #[serde(default)]
    pub if_exists: IfExists,
}

/// The unit's `remote_state` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteState {
    /// Backend type, e.g. `s3` or `gcs`.
    pub backend: String,
    #[serde(default)]
    pub config: serde_json::Map<String, Json>,
    #[serde(default)]
    pub generate: Option<RemoteStateGenerate>,
    /// Skip backend bootstrap during `init`.
    #[serde(default)]
    pub disable_init: bool,
}

/// One `generate` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateBlock {
    #[serde(default)]
    pub name: String,
    pub path: PathBuf,
    pub contents: String,
    #[serde(default)]
    pub if_exists: IfExists,
}

/// The unit's `terraform` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerraformBlock {
    pub source: Option<String>,
    pub extra_arguments: Vec<ExtraArgs>,
    pub before_hooks: Vec<Hook>,
    pub after_hooks: Vec<Hook>,
    pub error_hooks: Vec<ErrorHook>,
    pub copy_terraform_lock_file: Option<bool>,
}

impl TerraformBlock {
    /// Lock-file copy-back defaults on.
    pub fn copy_lock_file(&self) -> bool {
        self.copy_terraform_lock_file.unwrap_or(true)
    }
}

/// Assume-role options merged from config attributes and CLI overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IamRole {
    pub role_arn: String,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

/// A `feature` block: a named toggle with a default value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub default: Json,
}

/// A retry rule inside the `errors` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRule {
    #[serde(default)]
    pub name: String,
    pub retryable_errors: Vec<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub sleep_interval_sec: Option<u64>,
}

/// An ignore rule inside the `errors` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnoreRule {
    #[serde(default)]
    pub name: String,
    pub ignorable_errors: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// The unit's `errors` policy block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorsPolicy {
    pub retry: Vec<RetryRule>,
    pub ignore: Vec<IgnoreRule>,
}

/// A `dependency "name"` block, with its output-mocking controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyBlock {
    pub name: String,
    /// Absolute path to the dependency's unit directory.
    pub config_path: PathBuf,
    #[serde(default)]
    pub skip_outputs: bool,
    #[serde(default)]
    pub mock_outputs: Option<Json>,
    /// When set, mocks substitute only for these engine subcommands;
    /// unset means mocks may substitute for any command.
    #[serde(default)]
    pub mock_outputs_allowed_terraform_commands: Option<Vec<String>>,
}

impl DependencyBlock {
    /// Whether mock outputs may stand in for real ones under `command`.
    pub fn mocks_allowed(&self, command: Option<&str>) -> bool {
        if self.mock_outputs.is_none() {
            return false;
        }
        match (&self.mock_outputs_allowed_terraform_commands, command) {
            (None, _) => true,
            (Some(allowed), Some(cmd)) => allowed.iter().any(|c| c == cmd),
            (Some(_), None) => false,
        }
    }
}

/// Fully merged configuration of one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitConfig {
    pub inputs: serde_json::Map<String, Json>,
    /// Absolute dependency unit paths, in declaration order.
    pub dependencies: Vec<PathBuf>,
    pub terraform: TerraformBlock,
    pub remote_state: Option<RemoteState>,
    pub generate: Vec<GenerateBlock>,
    pub skip: Option<bool>,
    pub prevent_destroy: Option<bool>,
    pub iam_role: Option<IamRole>,
    pub retryable_errors: Option<Vec<String>>,
    pub retry_max_attempts: Option<u32>,
    pub retry_sleep_interval_sec: Option<u64>,
    pub terraform_binary: Option<String>,
    pub download_dir: Option<PathBuf>,
    pub terraform_version_constraint: Option<String>,
    pub features: Vec<Feature>,
    pub errors: Option<ErrorsPolicy>,
}

impl UnitConfig {
    pub fn is_skipped(&self) -> bool {
        self.skip.unwrap_or(false)
    }

    pub fn is_protected(&self) -> bool {
        self.prevent_destroy.unwrap_or(false)
    }

    /// Merge `child` over `self`: scalars override, lists concatenate in
    /// declaration order, inputs merge per key with the child winning.
    pub fn merge(mut self, child: UnitConfig) -> UnitConfig {
        for (key, value) in child.inputs {
            self.inputs.insert(key, value);
        }
        for dep in child.dependencies {
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }

        self.terraform.source = child.terraform.source.or(self.terraform.source);
        self.terraform
            .extra_arguments
            .extend(child.terraform.extra_arguments);
        self.terraform.before_hooks.extend(child.terraform.before_hooks);
        self.terraform.after_hooks.extend(child.terraform.after_hooks);
        self.terraform.error_hooks.extend(child.terraform.error_hooks);
        self.terraform.copy_terraform_lock_file = child
            .terraform
            .copy_terraform_lock_file
            .or(self.terraform.copy_terraform_lock_file);

        self.remote_state = child.remote_state.or(self.remote_state);

        // Generate blocks override per name, appended otherwise.
        for block in child.generate {
            match self.generate.iter_mut().find(|g| g.name == block.name) {
                Some(existing) => *existing = block,
                None => self.generate.push(block),
            }
        }

        self.skip = child.skip.or(self.skip);
        self.prevent_destroy = child.prevent_destroy.or(self.prevent_destroy);
        self.iam_role = child.iam_role.or(self.iam_role);
        self.retryable_errors = match (self.retryable_errors.take(), child.retryable_errors) {
            (Some(mut parent), Some(ours)) => {
                parent.extend(ours);
                Some(parent)
            }
            (parent, ours) => ours.or(parent),
        };
        self.retry_max_attempts = child.retry_max_attempts.or(self.retry_max_attempts);
        self.retry_sleep_interval_sec = child
            .retry_sleep_interval_sec
            .or(self.retry_sleep_interval_sec);
        self.terraform_binary = child.terraform_binary.or(self.terraform_binary);
        self.download_dir = child.download_dir.or(self.download_dir);
        self.terraform_version_constraint = child
            .terraform_version_constraint
            .or(self.terraform_version_constraint);
        for feature in child.features {
            match self.features.iter_mut().find(|f| f.name == feature.name) {
                Some(existing) => *existing = feature,
                None => self.features.push(feature),
            }
        }
        self.errors = match (self.errors.take(), child.errors) {
            (Some(mut parent), Some(ours)) => {
                parent.retry.extend(ours.retry);
                parent.ignore.extend(ours.ignore);
                Some(parent)
            }
            (parent, ours) => ours.or(parent),
        };

        self
    }
}

/// A loaded config plus the provenance the filters need.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: UnitConfig,
    /// Canonical path of the unit's own config file.
    pub config_path: PathBuf,
    /// Canonical paths of every file pulled in through `include`.
    pub included_files: Vec<PathBuf>,
    /// The unit's `dependency` blocks, in declaration order.
    pub dependency_blocks: Vec<DependencyBlock>,
}

/// Result of the partial parse: version and feature facts only.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub terraform_binary: Option<String>,
    pub terraform_version_constraint: Option<String>,
    pub features: Vec<Feature>,
}

// Raw deserialization targets. Unevaluated expressions come back as
// `${...}` strings and are resolved afterwards through `interp`.

#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    locals: Option<hcl::Value>,
    #[serde(default)]
    include: Option<hcl::Value>,
    #[serde(default)]
    dependency: Option<hcl::Value>,
    #[serde(default)]
    dependencies: Option<RawDependencies>,
    #[serde(default)]
    terraform: Option<RawTerraform>,
    #[serde(default)]
    remote_state: Option<hcl::Value>,
    #[serde(default)]
    generate: Option<hcl::Value>,
    #[serde(default)]
    inputs: Option<hcl::Value>,
    #[serde(default)]
    skip: Option<bool>,
    #[serde(default)]
    prevent_destroy: Option<bool>,
    #[serde(default)]
    iam_role: Option<String>,
    #[serde(default)]
    iam_assume_role_session_name: Option<String>,
    #[serde(default)]
    iam_assume_role_duration: Option<u64>,
    #[serde(default)]
    retryable_errors: Option<Vec<String>>,
    #[serde(default)]
    retry_max_attempts: Option<u32>,
    #[serde(default)]
    retry_sleep_interval_sec: Option<u64>,
    #[serde(default)]
    terraform_binary: Option<String>,
    #[serde(default)]
    download_dir: Option<String>,
    #[serde(default)]
    terraform_version_constraint: Option<String>,
    #[serde(default)]
    feature: Option<hcl::Value>,
    #[serde(default)]
    errors: Option<RawErrors>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawTerraform {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    extra_arguments: Option<hcl::Value>,
    #[serde(default)]
    before_hook: Option<hcl::Value>,
    #[serde(default)]
    after_hook: Option<hcl::Value>,
    #[serde(default)]
    error_hook: Option<hcl::Value>,
    #[serde(default)]
    copy_terraform_lock_file: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawDependencies {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawErrors {
    #[serde(default)]
    retry: Option<hcl::Value>,
    #[serde(default)]
    ignore: Option<hcl::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawPartial {
    #[serde(default)]
    terraform_binary: Option<String>,
    #[serde(default)]
    terraform_version_constraint: Option<String>,
    #[serde(default)]
    feature: Option<hcl::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawDependency {
    config_path: String,
    #[serde(default)]
    skip_outputs: bool,
    #[serde(default)]
    mock_outputs: Option<Json>,
    #[serde(default)]
    mock_outputs_allowed_terraform_commands: Option<Vec<String>>,
}

/// Load and fully resolve the unit config at `path`.
pub fn load(path: &Path, opts: &LoadOptions<'_>) -> Result<LoadedConfig, Error> {
    let mut stack = Vec::new();
    load_file(path, opts, &mut stack)
}

/// Dependency edges and include provenance of one unit, without
/// resolving dependency outputs.
///
/// Graph construction happens before any unit has run, so it must not
/// trigger engine invocations. This walk reads only what the DAG and
/// the queue filters need.
#[derive(Debug, Clone, Default)]
pub struct GraphInfo {
    /// Absolute dependency unit paths, in declaration order.
    pub dependencies: Vec<PathBuf>,
    /// Canonical paths of every file pulled in through `include`.
    pub included_files: Vec<PathBuf>,
}

/// Collect [`GraphInfo`] for the config at `path`.
pub fn load_graph_info(path: &Path) -> Result<GraphInfo, Error> {
    let mut stack = Vec::new();
    load_graph_info_inner(path, &mut stack)
}

fn load_graph_info_inner(path: &Path, stack: &mut Vec<PathBuf>) -> Result<GraphInfo, Error> {
    let file = existing_config(path)?;
    if stack.contains(&file) {
        return Err(Error::CycleInIncludes { path: file });
    }
    stack.push(file.clone());

    let result = (|| {
        let unit_dir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let content = read_config(&file)?;
        let raw: RawConfig = hcl::from_str(&content).map_err(|e| parse_error(&file, e))?;

        let locals = resolve_locals(&file, raw.locals.as_ref())?;
        let locals_scope = serde_json::json!({ "local": locals });

        let mut info = GraphInfo::default();
        for include_path in include_paths(&file, &unit_dir, raw.include.as_ref(), &locals_scope)? {
            let parent = load_graph_info_inner(&include_path, stack)?;
            let canonical = existing_config(&include_path)?;
            info.included_files.push(canonical);
            info.included_files.extend(parent.included_files);
            for dep in parent.dependencies {
                if !info.dependencies.contains(&dep) {
                    info.dependencies.push(dep);
                }
            }
        }

        for block in dependency_blocks(&file, &unit_dir, raw.dependency.as_ref(), &locals_scope)? {
            if !info.dependencies.contains(&block.config_path) {
                info.dependencies.push(block.config_path);
            }
        }
        if let Some(extra) = &raw.dependencies {
            for path in &extra.paths {
                let dep = join_normalized(&unit_dir, Path::new(path));
                if !info.dependencies.contains(&dep) {
                    info.dependencies.push(dep);
                }
            }
        }

        Ok(info)
    })();

    stack.pop();
    result
}

/// Partial parse: version constraint, engine binary, and feature blocks.
///
/// Nothing else in the file is evaluated, so a config whose full load
/// would need dependency outputs still answers version questions.
pub fn load_partial(path: &Path) -> Result<PartialConfig, Error> {
    let file = existing_config(path)?;
    let content = read_config(&file)?;
    let raw: RawPartial = hcl::from_str(&content).map_err(|e| parse_error(&file, e))?;

    let features = match raw.feature {
        Some(value) => feature_blocks(&file, &value)?,
        None => Vec::new(),
    };

    Ok(PartialConfig {
        terraform_binary: raw.terraform_binary,
        terraform_version_constraint: raw.terraform_version_constraint,
        features,
    })
}

fn load_file(
    path: &Path,
    opts: &LoadOptions<'_>,
    stack: &mut Vec<PathBuf>,
) -> Result<LoadedConfig, Error> {
    let file = existing_config(path)?;
    if stack.contains(&file) {
        return Err(Error::CycleInIncludes { path: file });
    }
    stack.push(file.clone());

    let result = load_file_inner(&file, opts, stack);
    stack.pop();
    result
}

fn load_file_inner(
    file: &Path,
    opts: &LoadOptions<'_>,
    stack: &mut Vec<PathBuf>,
) -> Result<LoadedConfig, Error> {
    let unit_dir = file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let content = read_config(file)?;
    let raw: RawConfig = hcl::from_str(&content).map_err(|e| parse_error(file, e))?;

    // Locals resolve first; they may reference each other but nothing
    // else, so a bounded fixpoint pass settles them.
    let locals = resolve_locals(file, raw.locals.as_ref())?;
    let locals_scope = serde_json::json!({ "local": locals.clone() });

    // Includes are parsed with the child's locals in scope for their
    // paths, then loaded as standalone configs and merged parent-first.
    let mut included_files = Vec::new();
    let mut merged = UnitConfig::default();
    for include_path in include_paths(file, &unit_dir, raw.include.as_ref(), &locals_scope)? {
        let parent = load_file(&include_path, opts, stack)?;
        included_files.push(parent.config_path.clone());
        included_files.extend(parent.included_files.clone());
        merged = merged.merge(parent.config);
    }

    // Dependency blocks: declaration order matters both for the edge
    // list and for scope construction.
    let dependency_blocks = dependency_blocks(file, &unit_dir, raw.dependency.as_ref(), &locals_scope)?;
    let dependency_scope = resolve_dependency_outputs(file, &dependency_blocks, opts)?;

    let scope = serde_json::json!({
        "local": locals,
        "dependency": dependency_scope,
    });

    let own = build_config(file, &unit_dir, &raw, &dependency_blocks, &scope)?;
    let config = merged.merge(own);

    Ok(LoadedConfig {
        config,
        config_path: file.to_path_buf(),
        included_files,
        dependency_blocks,
    })
}

fn existing_config(path: &Path) -> Result<PathBuf, Error> {
    if !path.is_file() {
        return Err(Error::MissingConfig {
            path: path.to_path_buf(),
        });
    }
    path.canonicalize().map_err(|_| Error::MissingConfig {
        path: path.to_path_buf(),
    })
}

fn read_config(file: &Path) -> Result<String, Error> {
    std::fs::read_to_string(file).map_err(|e| Error::ParseError {
        file: file.to_path_buf(),
        range: None,
        message: format!("failed to read file: {e}"),
    })
}

fn parse_error(file: &Path, err: hcl::Error) -> Error {
    Error::ParseError {
        file: file.to_path_buf(),
        range: None,
        message: err.to_string(),
    }
}

fn interp_error(file: &Path, err: interp::UnresolvedReference) -> Error {
    Error::ParseError {
        file: file.to_path_buf(),
        range: None,
        message: err.to_string(),
    }
}

fn to_json(file: &Path, value: &hcl::Value) -> Result<Json, Error> {
    serde_json::to_value(value).map_err(|e| Error::ParseError {
        file: file.to_path_buf(),
        range: None,
        message: format!("invalid value: {e}"),
    })
}

fn resolve_locals(file: &Path, locals: Option<&hcl::Value>) -> Result<Json, Error> {
    let Some(locals) = locals else {
        return Ok(Json::Object(serde_json::Map::new()));
    };
    let mut current = to_json(file, locals)?;
    if !current.is_object() {
        return Err(Error::ParseError {
            file: file.to_path_buf(),
            range: None,
            message: "locals must be a block of named values".to_string(),
        });
    }

    // Locals may chain through each other; a handful of passes settles
    // any non-cyclic chain.
    for _ in 0..8 {
        if !interp::references_root(&current, "local") {
            break;
        }
        let scope = serde_json::json!({ "local": current.clone() });
        current = interp::resolve_value(&current, &scope).map_err(|e| interp_error(file, e))?;
    }

    if interp::references_root(&current, "local") {
        return Err(Error::ParseError {
            file: file.to_path_buf(),
            range: None,
            message: "locals reference each other cyclically".to_string(),
        });
    }

    Ok(current)
}

fn include_paths(
    file: &Path,
    unit_dir: &Path,
    include: Option<&hcl::Value>,
    locals_scope: &Json,
) -> Result<Vec<PathBuf>, Error> {
    let Some(include) = include else {
        return Ok(Vec::new());
    };
    let value = to_json(file, include)?;
    let Json::Object(map) = &value else {
        return Err(Error::ParseError {
            file: file.to_path_buf(),
            range: None,
            message: "include must be a block".to_string(),
        });
    };

    // A single unlabeled block carries `path` directly; labeled blocks
    // nest one object per label.
    let blocks: Vec<&Json> = if map.contains_key("path") {
        vec![&value]
    } else {
        map.values().collect()
    };

    let mut paths = Vec::with_capacity(blocks.len());
    for block in blocks {
        let raw_path = block.get("path").and_then(Json::as_str).ok_or_else(|| {
            Error::ParseError {
                file: file.to_path_buf(),
                range: None,
                message: "include block requires a string `path`".to_string(),
            }
        })?;
        let resolved = interp::resolve_value(&Json::String(raw_path.to_string()), locals_scope)
            .map_err(|e| interp_error(file, e))?;
        let path_text = resolved.as_str().map(str::to_string).unwrap_or_else(|| {
            raw_path.to_string()
        });
        paths.push(join_normalized(unit_dir, Path::new(&path_text)));
    }
    Ok(paths)
}

fn dependency_blocks(
    file: &Path,
    unit_dir: &Path,
    dependency: Option<&hcl::Value>,
    locals_scope: &Json,
) -> Result<Vec<DependencyBlock>, Error> {
    let Some(dependency) = dependency else {
        return Ok(Vec::new());
    };
    let value = to_json(file, dependency)?;
    let Json::Object(map) = value else {
        return Err(Error::ParseError {
            file: file.to_path_buf(),
            range: None,
            message: "dependency must be a labeled block".to_string(),
        });
    };

    let mut blocks = Vec::with_capacity(map.len());
    for (name, body) in map {
        let raw: RawDependency =
            serde_json::from_value(body).map_err(|e| Error::ParseError {
                file: file.to_path_buf(),
                range: None,
                message: format!("invalid dependency \"{name}\" block: {e}"),
            })?;
        let resolved =
            interp::resolve_value(&Json::String(raw.config_path.clone()), locals_scope)
                .map_err(|e| interp_error(file, e))?;
        let path_text = resolved
            .as_str()
            .map(str::to_string)
            .unwrap_or(raw.config_path);
        let mock_outputs = match raw.mock_outputs {
            Some(mocks) => Some(
                interp::resolve_value(&mocks, locals_scope).map_err(|e| interp_error(file, e))?,
            ),
            None => None,
        };
        blocks.push(DependencyBlock {
            name,
            config_path: join_normalized(unit_dir, Path::new(&path_text)),
            skip_outputs: raw.skip_outputs,
            mock_outputs,
            mock_outputs_allowed_terraform_commands: raw
                .mock_outputs_allowed_terraform_commands,
        });
    }
    Ok(blocks)
}

fn resolve_dependency_outputs(
    file: &Path,
    blocks: &[DependencyBlock],
    opts: &LoadOptions<'_>,
) -> Result<Json, Error> {
    let mut scope = serde_json::Map::with_capacity(blocks.len());
    for block in blocks {
        let outputs = if block.skip_outputs {
            Json::Object(serde_json::Map::new())
        } else {
            match opts.resolver.fetch_outputs(&block.config_path) {
                Ok(outputs) => outputs,
                Err(_) if block.mocks_allowed(opts.engine_command) => {
                    block.mock_outputs.clone().unwrap_or(Json::Null)
                }
                Err(err) => {
                    return Err(Error::ParseError {
                        file: file.to_path_buf(),
                        range: None,
                        message: format!(
                            "failed to resolve outputs of dependency \"{}\" ({}): {err:#}",
                            block.name,
                            block.config_path.display()
                        ),
                    });
                }
            }
        };
        scope.insert(
            block.name.clone(),
            serde_json::json!({ "outputs": outputs }),
        );
    }
    Ok(Json::Object(scope))
}

fn build_config(
    file: &Path,
    unit_dir: &Path,
    raw: &RawConfig,
    dependency_blocks: &[DependencyBlock],
    scope: &Json,
) -> Result<UnitConfig, Error> {
    let inputs = match &raw.inputs {
        Some(value) => {
            let json = to_json(file, value)?;
            let resolved =
                interp::resolve_value(&json, scope).map_err(|e| interp_error(file, e))?;
            match resolved {
                Json::Object(map) => map,
                _ => {
                    return Err(Error::ParseError {
                        file: file.to_path_buf(),
                        range: None,
                        message: "inputs must be a map".to_string(),
                    });
                }
            }
        }
        None => serde_json::Map::new(),
    };

    let mut dependencies: Vec<PathBuf> = dependency_blocks
        .iter()
        .map(|b| b.config_path.clone())
        .collect();
    if let Some(extra) = &raw.dependencies {
        for path in &extra.paths {
            let dep = join_normalized(unit_dir, Path::new(path));
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }
    }

    let terraform = match &raw.terraform {
        Some(tf) => terraform_block(file, tf, scope)?,
        None => TerraformBlock::default(),
    };

    let remote_state = match &raw.remote_state {
        Some(value) => {
            let json = to_json(file, value)?;
            let resolved =
                interp::resolve_value(&json, scope).map_err(|e| interp_error(file, e))?;
            Some(
                serde_json::from_value::<RemoteState>(resolved).map_err(|e| Error::ParseError {
                    file: file.to_path_buf(),
                    range: None,
                    message: format!("invalid remote_state block: {e}"),
                })?,
            )
        }
        None => None,
    };

    let generate = match &raw.generate {
        Some(value) => {
            let json = to_json(file, value)?;
            let resolved =
                interp::resolve_value(&json, scope).map_err(|e| interp_error(file, e))?;
            labeled_into::<GenerateBlock>(file, "generate", resolved)?
        }
        None => Vec::new(),
    };

    let iam_role = raw.iam_role.as_ref().map(|arn| IamRole {
        role_arn: arn.clone(),
        session_name: raw.iam_assume_role_session_name.clone(),
        duration_secs: raw.iam_assume_role_duration,
    });

    let features = match &raw.feature {
        Some(value) => feature_blocks(file, value)?,
        None => Vec::new(),
    };

    let errors = match &raw.errors {
        Some(raw_errors) => Some(ErrorsPolicy {
            retry: match &raw_errors.retry {
                Some(value) => labeled_into::<RetryRule>(file, "errors.retry", to_json(file, value)?)?,
                None => Vec::new(),
            },
            ignore: match &raw_errors.ignore {
                Some(value) => {
                    labeled_into::<IgnoreRule>(file, "errors.ignore", to_json(file, value)?)?
                }
                None => Vec::new(),
            },
        }),
        None => None,
    };

    Ok(UnitConfig {
        inputs,
        dependencies,
        terraform,
        remote_state,
        generate,
        skip: raw.skip,
        prevent_destroy: raw.prevent_destroy,
        iam_role,
        retryable_errors: raw.retryable_errors.clone(),
        retry_max_attempts: raw.retry_max_attempts,
        retry_sleep_interval_sec: raw.retry_sleep_interval_sec,
        terraform_binary: raw.terraform_binary.clone(),
        download_dir: raw
            .download_dir
            .as_ref()
            .map(|d| join_normalized(unit_dir, Path::new(d))),
        terraform_version_constraint: raw.terraform_version_constraint.clone(),
        features,
        errors,
    })
}

fn terraform_block(
    file: &Path,
    raw: &RawTerraform,
    scope: &Json,
) -> Result<TerraformBlock, Error> {
    let source = match &raw.source {
        Some(source) => {
            let resolved = interp::resolve_value(&Json::String(source.clone()), scope)
                .map_err(|e| interp_error(file, e))?;
            Some(resolved.as_str().map(str::to_string).unwrap_or_else(|| source.clone()))
        }
        None => None,
    };

    let extra_arguments = labeled_field::<ExtraArgs>(file, "extra_arguments", &raw.extra_arguments, scope)?;
    let before_hooks = labeled_field::<Hook>(file, "before_hook", &raw.before_hook, scope)?;
    let after_hooks = labeled_field::<Hook>(file, "after_hook", &raw.after_hook, scope)?;
    let error_hooks = labeled_field::<ErrorHook>(file, "error_hook", &raw.error_hook, scope)?;

    Ok(TerraformBlock {
        source,
        extra_arguments,
        before_hooks,
        after_hooks,
        error_hooks,
        copy_terraform_lock_file: raw.copy_terraform_lock_file,
    })
}

fn labeled_field<T: NamedBlock>(
    file: &Path,
    kind: &str,
    value: &Option<hcl::Value>,
    scope: &Json,
) -> Result<Vec<T>, Error> {
    match value {
        Some(value) => {
            let json = to_json(file, value)?;
            let resolved =
                interp::resolve_value(&json, scope).map_err(|e| interp_error(file, e))?;
            labeled_into::<T>(file, kind, resolved)
        }
        None => Ok(Vec::new()),
    }
}

/// Blocks carrying their HCL label as a `name` field.
trait NamedBlock: serde::de::DeserializeOwned {
    fn set_name(&mut self, name: String);
}

macro_rules! named_block {
    ($ty:ty) => {
        impl NamedBlock for $ty {
            fn set_name(&mut self, name: String) {
                self.name = name;
            }
        }
    };
}

named_block!(Hook);
named_block!(ErrorHook);
named_block!(ExtraArgs);
named_block!(GenerateBlock);
named_block!(RetryRule);
named_block!(IgnoreRule);

fn labeled_into<T: NamedBlock>(file: &Path, kind: &str, value: Json) -> Result<Vec<T>, Error> {
    let Json::Object(map) = value else {
        return Err(Error::ParseError {
            file: file.to_path_buf(),
            range: None,
            message: format!("{kind} must be a labeled block"),
        });
    };
    let mut out = Vec::with_capacity(map.len());
    for (label, body) in map {
        let mut block: T = serde_json::from_value(body).map_err(|e| Error::ParseError {
            file: file.to_path_buf(),
            range: None,
            message: format!("invalid {kind} \"{label}\" block: {e}"),
        })?;
        block.set_name(label);
        out.push(block);
    }
    Ok(out)
}

fn feature_blocks(file: &Path, value: &hcl::Value) -> Result<Vec<Feature>, Error> {
    let json = to_json(file, value)?;
    let Json::Object(map) = json else {
        return Err(Error::ParseError {
            file: file.to_path_buf(),
            range: None,
            message: "feature must be a labeled block".to_string(),
        });
    };
    let mut features = Vec::with_capacity(map.len());
    for (name, body) in map {
        let default = body.get("default").cloned().unwrap_or(Json::Null);
        features.push(Feature { name, default });
    }
    Ok(features)
}

/// Join `relative` onto `base` and collapse `.`/`..` components without
/// touching the filesystem, so external dependency paths normalize even
/// when they do not exist yet.
pub fn join_normalized(base: &Path, relative: &Path) -> PathBuf {
    let joined = if relative.is_absolute() {
        relative.to_path_buf()
    } else {
        base.join(relative)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(Component::ParentDir);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}
