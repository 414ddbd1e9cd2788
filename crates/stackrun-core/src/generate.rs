//! Code generation into a unit's working directory.
//!
//! Two kinds of files are written before the engine runs: the files of
//! `generate` blocks, and the backend configuration derived from a
//! `remote_state` block's `generate` descriptor. When remote state is
//! declared without a generate descriptor, the working directory must
//! already contain a matching `backend` block.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde_json::Value as Json;

use stackrun_config::{GenerateBlock, IfExists, RemoteState, UnitConfig};
use stackrun_types::Error;

use crate::locks::PathLocks;

/// First line of every file this orchestrator generates. The
/// `overwrite_terragrunt` policy only replaces files carrying it.
pub const GENERATED_MARKER: &str =
    "# Generated by stackrun. Manual edits will be lost on the next run.";

/// Extensions holding engine code.
const ENGINE_EXTENSIONS: &[&str] = &["tf", "tofu"];
const ENGINE_JSON_SUFFIXES: &[&str] = &[".tf.json", ".tofu.json"];

/// Write all generated files for `config` into `working_dir`.
///
/// The per-directory lock serializes generation against hooks running
/// in the same directory.
pub fn generate(working_dir: &Path, config: &UnitConfig, locks: &PathLocks) -> Result<()> {
    locks.with_lock(working_dir, || {
        for block in &config.generate {
            write_generate_block(working_dir, block)?;
        }
        if let Some(remote_state) = &config.remote_state {
            generate_backend(working_dir, remote_state)?;
        }
        Ok(())
    })
}

fn write_generate_block(working_dir: &Path, block: &GenerateBlock) -> Result<()> {
    let path = if block.path.is_absolute() {
        block.path.clone()
    } else {
        working_dir.join(&block.path)
    };
    let contents = format!("{GENERATED_MARKER}\n{}", block.contents);
    write_with_policy(&path, &contents, block.if_exists, &block.name)
}

fn generate_backend(working_dir: &Path, remote_state: &RemoteState) -> Result<()> {
    match &remote_state.generate {
        Some(descriptor) => {
            let path = if descriptor.path.is_absolute() {
                descriptor.path.clone()
            } else {
                working_dir.join(&descriptor.path)
            };
            let contents = format!(
                "{GENERATED_MARKER}\n{}",
                render_backend_hcl(&remote_state.backend, &remote_state.config)
            );
            write_with_policy(&path, &contents, descriptor.if_exists, "backend")
        }
        None => {
            if backend_defined(working_dir, &remote_state.backend)? {
                Ok(())
            } else {
                Err(Error::BackendNotDefined {
                    backend_type: remote_state.backend.clone(),
                    dir: working_dir.to_path_buf(),
                }
                .into())
            }
        }
    }
}

fn write_with_policy(path: &Path, contents: &str, policy: IfExists, name: &str) -> Result<()> {
    if path.exists() {
        match policy {
            IfExists::Overwrite => {}
            IfExists::OverwriteTerragrunt => {
                let existing = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                if !existing.starts_with(GENERATED_MARKER) {
                    bail!(
                        "generate block \"{name}\" refuses to overwrite {}: \
                         the file was not generated by this tool",
                        path.display()
                    );
                }
            }
            IfExists::Skip => {
                tracing::debug!(path = %path.display(), "generate: leaving existing file");
                return Ok(());
            }
            IfExists::Error => {
                bail!(
                    "generate block \"{name}\" failed: {} already exists",
                    path.display()
                );
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

/// Render a `terraform { backend "<type>" { ... } }` file body.
pub fn render_backend_hcl(backend: &str, config: &serde_json::Map<String, Json>) -> String {
    let mut out = String::new();
    out.push_str("terraform {\n");
    out.push_str(&format!("  backend \"{backend}\" {{\n"));
    for (key, value) in config {
        out.push_str(&format!("    {key} = {}\n", hcl_literal(value, 4)));
    }
    out.push_str("  }\n");
    out.push_str("}\n");
    out
}

fn hcl_literal(value: &Json, indent: usize) -> String {
    match value {
        Json::Null => "null".to_string(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        Json::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\"")),
        Json::Array(items) => {
            let rendered: Vec<String> =
                items.iter().map(|item| hcl_literal(item, indent)).collect();
            format!("[{}]", rendered.join(", "))
        }
        Json::Object(map) => {
            let pad = " ".repeat(indent + 2);
            let close = " ".repeat(indent);
            let mut body = String::from("{\n");
            for (key, item) in map {
                body.push_str(&format!("{pad}{key} = {}\n", hcl_literal(item, indent + 2)));
            }
            body.push_str(&format!("{close}}}"));
            body
        }
    }
}

/// Whether any engine file in `dir` declares a `backend "<type>"`.
pub fn backend_defined(dir: &Path, backend_type: &str) -> Result<bool> {
    static BLOCK_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = BLOCK_PATTERN.get_or_init(|| {
        Regex::new(r#"backend\s+"(?P<kind>[^"]+)"\s*\{"#).expect("static pattern")
    });

    for path in engine_files(dir)? {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        if ENGINE_JSON_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            if json_declares_backend(&content, backend_type) {
                return Ok(true);
            }
            continue;
        }

        if pattern
            .captures_iter(&content)
            .any(|caps| &caps["kind"] == backend_type)
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn json_declares_backend(content: &str, backend_type: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Json>(content) else {
        return false;
    };
    let terraform = value.get("terraform");
    let blocks: Vec<&Json> = match terraform {
        Some(Json::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
        None => return false,
    };
    blocks.iter().any(|block| {
        block
            .get("backend")
            .map(|backend| backend.get(backend_type).is_some())
            .unwrap_or(false)
    })
}

/// Engine configuration files directly inside `dir`.
pub fn engine_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(files),
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let is_engine = ENGINE_JSON_SUFFIXES.iter().any(|s| name.ends_with(s))
            || path
                .extension()
                .map(|e| ENGINE_EXTENSIONS.contains(&e.to_string_lossy().as_ref()))
                .unwrap_or(false);
        if is_engine {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Whether `dir` holds any engine code at all.
pub fn has_engine_files(dir: &Path) -> bool {
    engine_files(dir).map(|f| !f.is_empty()).unwrap_or(false)
}

/// Whether the engine code in `dir` references modules, which forces an
/// init to populate the module cache.
pub fn references_modules(dir: &Path) -> Result<bool> {
    static MODULE_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = MODULE_PATTERN
        .get_or_init(|| Regex::new(r#"(?m)^\s*module\s+"[^"]+"\s*\{"#).expect("static pattern"));

    for path in engine_files(dir)? {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if pattern.is_match(&content) {
            return Ok(true);
        }
    }
    Ok(false)
}
