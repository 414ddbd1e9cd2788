//! Hook execution around the engine invocation.
//!
//! Hooks are user-declared child processes attached to a unit's config.
//! Within a phase they run sequentially in declaration order; a failing
//! hook does not stop later hooks in the phase unless fail-fast is set.
//! Error hooks fire only when a prior error matches one of their
//! matchers. Hook processes share the unit's per-directory lock with
//! code generation.

use anyhow::{Result, bail};
use regex::Regex;

use stackrun_config::UnitConfig;
use stackrun_process::ProcessRequest;
use stackrun_types::{Error, HookPhase};

use crate::engine::SharedReporter;
use crate::options::RunContext;

/// Run the hooks of `phase` whose command set includes `command`.
///
/// `prior_errors` carries the accumulated error text of the unit so
/// far; the error phase consults it, the other phases ignore it.
pub fn run_hooks(
    phase: HookPhase,
    config: &UnitConfig,
    ctx: &RunContext,
    command: &str,
    prior_errors: &[String],
    reporter: &SharedReporter,
) -> Result<()> {
    let mut failures: Vec<Error> = Vec::new();

    match phase {
        HookPhase::Before | HookPhase::After => {
            let hooks = if phase == HookPhase::Before {
                &config.terraform.before_hooks
            } else {
                &config.terraform.after_hooks
            };
            for hook in hooks.iter().filter(|h| h.applies_to(command)) {
                // After the action failed, only hooks that opted in run.
                if phase == HookPhase::After && !prior_errors.is_empty() && !hook.run_on_error {
                    continue;
                }
                let outcome = execute_hook(
                    ctx,
                    &hook.name,
                    phase,
                    &hook.execute,
                    hook.working_dir.as_deref(),
                    hook.suppress_stdout,
                    reporter,
                );
                if let Err(err) = outcome {
                    failures.push(err);
                    if ctx.opts.fail_fast {
                        break;
                    }
                }
            }
        }
        HookPhase::Error => {
            for hook in config
                .terraform
                .error_hooks
                .iter()
                .filter(|h| h.applies_to(command))
            {
                if !matches_any_error(&hook.on_errors, prior_errors)? {
                    continue;
                }
                let outcome = execute_hook(
                    ctx,
                    &hook.name,
                    phase,
                    &hook.execute,
                    None,
                    hook.suppress_stdout,
                    reporter,
                );
                if let Err(err) = outcome {
                    failures.push(err);
                    if ctx.opts.fail_fast {
                        break;
                    }
                }
            }
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    let joined = failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    bail!("{joined}")
}

/// Empty matcher list means the hook fires on any error.
fn matches_any_error(matchers: &[String], prior_errors: &[String]) -> Result<bool> {
    if prior_errors.is_empty() {
        return Ok(false);
    }
    if matchers.is_empty() {
        return Ok(true);
    }
    for pattern in matchers {
        let regex = Regex::new(pattern)
            .map_err(|e| anyhow::anyhow!("invalid error hook pattern '{pattern}': {e}"))?;
        if prior_errors.iter().any(|err| regex.is_match(err)) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn execute_hook(
    ctx: &RunContext,
    name: &str,
    phase: HookPhase,
    execute: &[String],
    working_dir: Option<&std::path::Path>,
    suppress_stdout: bool,
    reporter: &SharedReporter,
) -> Result<(), Error> {
    let Some((program, args)) = execute.split_first() else {
        return Err(Error::HookFailed {
            name: name.to_string(),
            phase,
            message: "hook has an empty execute list".to_string(),
        });
    };

    let dir = working_dir.unwrap_or(&ctx.working_dir).to_path_buf();

    reporter
        .lock()
        .expect("reporter poisoned")
        .info(&format!("running {phase} hook '{name}'"));

    let request = ProcessRequest {
        program: program.clone(),
        args: args.to_vec(),
        working_dir: Some(dir.clone()),
        env: ctx.env.clone(),
        forward_stdout: !suppress_stdout,
        timeout: None,
    };

    let result = ctx.dir_locks.with_lock(&dir, || {
        stackrun_process::run_with_stop(&request, &|| ctx.cancel.is_cancelled())
    });

    match result {
        Ok(result) if result.success() => Ok(()),
        Ok(result) if result.interrupted => Err(Error::HookFailed {
            name: name.to_string(),
            phase,
            message: "cancelled".to_string(),
        }),
        Ok(result) => Err(Error::HookFailed {
            name: name.to_string(),
            phase,
            message: format!(
                "exit code {}: {}",
                result.exit_code,
                result.stderr_excerpt(200)
            ),
        }),
        Err(err) => Err(Error::HookFailed {
            name: name.to_string(),
            phase,
            message: format!("{err:#}"),
        }),
    }
}

/// Internal phase marker applied to the synthetic read-config replay.
pub fn hook_phase_is_read_config(command: &str) -> bool {
    command == stackrun_types::READ_CONFIG_PHASE
}
