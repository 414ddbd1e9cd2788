//! Engine invocation with retries.
//!
//! Composes the final argv, runs the engine through the process layer,
//! classifies failures against the unit's retryable-error patterns, and
//! sleeps between attempts through the cancellable token so a fail-fast
//! cancellation interrupts a waiting retry immediately.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use stackrun_process::{ProcessRequest, ProcessResult};
use stackrun_retry::CompiledRetryPolicy;
use stackrun_types::{DetailedExitCode, Error};

use crate::options::RunContext;

/// Progress sink threaded through the engine and queue.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter handle shared across worker threads.
pub type SharedReporter = Arc<Mutex<dyn Reporter + Send>>;

/// Wrap a reporter for sharing across workers.
pub fn shared_reporter<R: Reporter + Send + 'static>(reporter: R) -> SharedReporter {
    Arc::new(Mutex::new(reporter))
}

/// Outcome of an engine invocation, after retries.
#[derive(Debug)]
pub struct EngineInvocation {
    /// Attempts actually made (1 on first-try success).
    pub attempts: u32,
    /// Result of the final attempt.
    pub result: ProcessResult,
    /// The final failure matched a retryable pattern but the attempt
    /// budget ran out.
    pub retries_exhausted: bool,
}

impl EngineInvocation {
    pub fn success(&self) -> bool {
        self.result.success()
    }

    /// Map a failed invocation to its typed error.
    pub fn into_error(self) -> Error {
        if self.retries_exhausted {
            Error::MaxRetriesExceeded {
                attempts: self.attempts,
            }
        } else {
            Error::EngineInvocationFailed {
                exit_code: self.result.exit_code,
                stderr_excerpt: self.result.stderr_excerpt(400),
            }
        }
    }
}

/// Run the engine in `working_dir` with `args`, retrying per `policy`.
pub fn invoke(
    ctx: &RunContext,
    working_dir: &Path,
    args: &[String],
    policy: &CompiledRetryPolicy,
    reporter: &SharedReporter,
) -> Result<EngineInvocation> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        if let Some(cause) = ctx.cancel.cause() {
            return Err(Error::Cancelled { cause }.into());
        }

        // A failed earlier attempt must not mask this one's outcome.
        ctx.reset_exit();

        let request = ProcessRequest {
            program: ctx.engine_binary.clone(),
            args: args.to_vec(),
            working_dir: Some(working_dir.to_path_buf()),
            env: ctx.env.clone(),
            forward_stdout: ctx.opts.tf_forward_stdout,
            timeout: None,
        };

        tracing::debug!(
            attempt,
            max = policy.max_attempts,
            command = %request.display(),
            "invoking engine"
        );

        let result = stackrun_process::run_with_stop(&request, &|| ctx.cancel.is_cancelled())?;

        if result.interrupted {
            let cause = ctx
                .cancel
                .cause()
                .unwrap_or_else(|| "run cancelled".to_string());
            return Err(Error::Cancelled { cause }.into());
        }

        ctx.record_exit(DetailedExitCode::from_exit_code(result.exit_code));

        if result.success() {
            // Without raw forwarding, captured engine output still
            // reaches the user through the progress channel.
            if !ctx.opts.tf_forward_stdout && !result.stdout.trim().is_empty() {
                reporter
                    .lock()
                    .expect("reporter poisoned")
                    .info(result.stdout.trim_end());
            }
            return Ok(EngineInvocation {
                attempts: attempt,
                result,
                retries_exhausted: false,
            });
        }

        let retryable =
            !ctx.opts.no_auto_retry && policy.is_retryable(&result.combined_output());

        if !retryable {
            return Ok(EngineInvocation {
                attempts: attempt,
                result,
                retries_exhausted: false,
            });
        }

        if attempt >= policy.max_attempts {
            return Ok(EngineInvocation {
                attempts: attempt,
                result,
                retries_exhausted: true,
            });
        }

        reporter.lock().expect("reporter poisoned").warn(&format!(
            "{}: transient failure (exit {}), retrying in {} ({}/{})",
            working_dir.display(),
            result.exit_code,
            humantime::format_duration(policy.sleep_interval),
            attempt,
            policy.max_attempts,
        ));

        if let Err(cause) = ctx.cancel.sleep(policy.sleep_interval) {
            return Err(Error::Cancelled { cause }.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RunOptions;
    use crate::testutil::TestReporter;
    use std::time::Duration;
    use stackrun_retry::RetryPolicy;
    use tempfile::tempdir;

    fn sh_ctx(script_dir: &Path) -> RunContext {
        // A shell stands in for the engine binary; args select behavior.
        let mut ctx = RunContext::new(RunOptions {
            working_dir: script_dir.to_path_buf(),
            ..RunOptions::default()
        });
        ctx.engine_binary = "sh".to_string();
        ctx
    }

    fn policy(patterns: &[&str], attempts: u32) -> CompiledRetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            sleep_interval: Duration::from_millis(10),
            retryable_errors: patterns.iter().map(|s| s.to_string()).collect(),
        }
        .compile()
        .expect("compile")
    }

    fn args(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn success_on_first_attempt() {
        let td = tempdir().expect("tempdir");
        let ctx = sh_ctx(td.path());
        let reporter = shared_reporter(TestReporter::default());

        let invocation = invoke(
            &ctx,
            td.path(),
            &args("echo done"),
            &policy(&["transient"], 3),
            &reporter,
        )
        .expect("invoke");

        assert!(invocation.success());
        assert_eq!(invocation.attempts, 1);
        assert_eq!(ctx.exit_code(), DetailedExitCode::Clean);
    }

    #[test]
    fn retries_until_success() {
        let td = tempdir().expect("tempdir");
        let marker = td.path().join("attempts");
        let ctx = sh_ctx(td.path());
        let reporter = shared_reporter(TestReporter::default());

        // First two attempts print a transient error; the third succeeds.
        let script = format!(
            "n=$(cat {m} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {m}; \
             if [ $n -lt 3 ]; then echo 'temporary network error' >&2; exit 1; fi",
            m = marker.display()
        );

        let invocation = invoke(
            &ctx,
            td.path(),
            &args(&script),
            &policy(&["temporary network error"], 3),
            &reporter,
        )
        .expect("invoke");

        assert!(invocation.success());
        assert_eq!(invocation.attempts, 3);
        assert_eq!(
            std::fs::read_to_string(&marker).expect("read").trim(),
            "3"
        );
        assert_eq!(ctx.exit_code(), DetailedExitCode::Clean);
    }

    #[test]
    fn non_retryable_failure_stops_immediately() {
        let td = tempdir().expect("tempdir");
        let ctx = sh_ctx(td.path());
        let reporter = shared_reporter(TestReporter::default());

        let invocation = invoke(
            &ctx,
            td.path(),
            &args("echo 'invalid resource' >&2; exit 1"),
            &policy(&["transient"], 5),
            &reporter,
        )
        .expect("invoke");

        assert!(!invocation.success());
        assert_eq!(invocation.attempts, 1);
        assert!(!invocation.retries_exhausted);
        let err = invocation.into_error();
        assert!(matches!(err, Error::EngineInvocationFailed { exit_code: 1, .. }));
    }

    #[test]
    fn exhausted_retries_map_to_max_retries_error() {
        let td = tempdir().expect("tempdir");
        let ctx = sh_ctx(td.path());
        let reporter = shared_reporter(TestReporter::default());

        let invocation = invoke(
            &ctx,
            td.path(),
            &args("echo 'temporary glitch' >&2; exit 1"),
            &policy(&["temporary glitch"], 2),
            &reporter,
        )
        .expect("invoke");

        assert!(!invocation.success());
        assert_eq!(invocation.attempts, 2);
        assert!(invocation.retries_exhausted);
        assert!(matches!(
            invocation.into_error(),
            Error::MaxRetriesExceeded { attempts: 2 }
        ));
    }

    #[test]
    fn no_auto_retry_disables_the_loop() {
        let td = tempdir().expect("tempdir");
        let mut ctx = sh_ctx(td.path());
        ctx.opts = Arc::new(RunOptions {
            no_auto_retry: true,
            ..(*ctx.opts).clone()
        });
        let reporter = shared_reporter(TestReporter::default());

        let invocation = invoke(
            &ctx,
            td.path(),
            &args("echo 'temporary glitch' >&2; exit 1"),
            &policy(&["temporary glitch"], 5),
            &reporter,
        )
        .expect("invoke");

        assert_eq!(invocation.attempts, 1);
        assert!(!invocation.retries_exhausted);
    }

    #[test]
    fn detailed_exit_code_two_is_preserved() {
        let td = tempdir().expect("tempdir");
        let ctx = sh_ctx(td.path());
        let reporter = shared_reporter(TestReporter::default());

        let invocation = invoke(
            &ctx,
            td.path(),
            &args("exit 2"),
            &policy(&[], 1),
            &reporter,
        )
        .expect("invoke");

        assert!(!invocation.success());
        assert_eq!(ctx.exit_code(), DetailedExitCode::ChangesPresent);
    }

    #[test]
    fn cancellation_interrupts_retry_sleep() {
        let td = tempdir().expect("tempdir");
        let ctx = sh_ctx(td.path());
        let reporter = shared_reporter(TestReporter::default());

        let slow_policy = RetryPolicy {
            max_attempts: 3,
            sleep_interval: Duration::from_secs(30),
            retryable_errors: vec!["flaky".to_string()],
        }
        .compile()
        .expect("compile");

        let cancel = ctx.cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel.cancel("operator interrupt");
        });

        let started = std::time::Instant::now();
        let err = invoke(
            &ctx,
            td.path(),
            &args("echo flaky >&2; exit 1"),
            &slow_policy,
            &reporter,
        )
        .expect_err("cancelled");
        canceller.join().expect("join");

        assert!(started.elapsed() < Duration::from_secs(10));
        let typed = err.downcast::<Error>().expect("typed");
        assert!(matches!(typed, Error::Cancelled { .. }));
    }
}
