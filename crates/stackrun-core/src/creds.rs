//! Credential sources.
//!
//! Credential acquisition is a collaborator: anything that can produce
//! an env-var map works. The exec source shells out to a user command
//! whose stdout is a JSON document of the form `{"envs": {"K": "V"}}`
//! (a bare object of string pairs is also accepted).

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde_json::Value as Json;

use stackrun_process::ProcessRequest;

use crate::options::RunContext;

/// Produces environment entries to inject before a unit runs.
pub trait CredentialSource: Sync {
    fn credentials(&self, ctx: &RunContext) -> Result<BTreeMap<String, String>>;
}

/// Runs an external command and parses its stdout as an env map.
pub struct ExecCredentialSource {
    /// Argv of the provider command.
    pub command: Vec<String>,
}

impl CredentialSource for ExecCredentialSource {
    fn credentials(&self, ctx: &RunContext) -> Result<BTreeMap<String, String>> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("credential command is empty");
        };

        let request = ProcessRequest::new(program, args.iter().cloned())
            .in_dir(&ctx.working_dir)
            .with_env(&ctx.env);
        let result = stackrun_process::run(&request)
            .with_context(|| format!("failed to run credential command: {program}"))?;
        if !result.success() {
            bail!(
                "credential command exited with code {}: {}",
                result.exit_code,
                result.stderr_excerpt(200)
            );
        }

        parse_env_map(&result.stdout)
    }
}

/// Parse `{"envs": {..}}` or a bare string map.
pub fn parse_env_map(stdout: &str) -> Result<BTreeMap<String, String>> {
    let value: Json = serde_json::from_str(stdout.trim())
        .context("credential command did not print valid JSON")?;

    let object = match &value {
        Json::Object(map) if map.contains_key("envs") => match &map["envs"] {
            Json::Object(envs) => envs,
            _ => bail!("credential JSON field \"envs\" must be an object"),
        },
        Json::Object(map) => map,
        _ => bail!("credential JSON must be an object"),
    };

    let mut envs = BTreeMap::new();
    for (key, value) in object {
        match value {
            Json::String(s) => {
                envs.insert(key.clone(), s.clone());
            }
            Json::Object(_) | Json::Array(_) => {
                // Provider metadata blocks ride alongside envs; skip them.
                continue;
            }
            other => {
                envs.insert(key.clone(), other.to_string());
            }
        }
    }
    Ok(envs)
}
