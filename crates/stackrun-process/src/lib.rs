//! Child-process execution for stackrun.
//!
//! Every engine invocation and every hook runs through this crate. It
//! captures output, threads an environment map and working directory into
//! the child, and supports a poll-based wait so callers can observe
//! cancellation or a deadline while the child runs.
//!
//! # Example
//!
//! ```ignore
//! use stackrun_process::{ProcessRequest, run};
//!
//! let result = run(&ProcessRequest::new("terraform", ["version"]))?;
//! assert!(result.success());
//! ```

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Poll interval while waiting on a child with a deadline or stop check.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Everything needed to launch one child process.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    /// Program to execute (resolved against PATH by the OS).
    pub program: String,
    /// Arguments, already tokenized.
    pub args: Vec<String>,
    /// Working directory for the child; inherits ours when `None`.
    pub working_dir: Option<PathBuf>,
    /// Extra environment entries layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Mirror child stdout onto our stdout while also capturing it.
    pub forward_stdout: bool,
    /// Kill the child once this much wall-clock time passes.
    pub timeout: Option<Duration>,
}

impl ProcessRequest {
    /// Build a request with defaults for everything but program and args.
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: BTreeMap::new(),
            forward_stdout: false,
            timeout: None,
        }
    }

    /// Set the child's working directory.
    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }

    /// Layer environment entries over the inherited environment.
    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// One-line rendering for error messages and logs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured outcome of one child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    /// Exit code; -1 when the child was killed or reported no code.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Whether execution exceeded the request's timeout.
    pub timed_out: bool,
    /// Whether the wait loop was interrupted by the caller's stop check.
    pub interrupted: bool,
    /// Total wall-clock duration.
    pub duration: Duration,
}

impl ProcessResult {
    /// Whether the child exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.interrupted
    }

    /// Combined output for pattern matching against retryable errors.
    pub fn combined_output(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    /// A trimmed excerpt of stderr for error summaries.
    pub fn stderr_excerpt(&self, max_len: usize) -> String {
        let trimmed = self.stderr.trim();
        if trimmed.len() <= max_len {
            return trimmed.to_string();
        }
        let mut cut = max_len;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &trimmed[..cut])
    }
}

/// Run a request to completion without a stop check.
pub fn run(request: &ProcessRequest) -> Result<ProcessResult> {
    run_with_stop(request, &|| false)
}

/// Run a request, polling `should_stop` while the child executes.
///
/// When `should_stop` returns true the child is killed, its exit awaited,
/// and the result comes back with `interrupted = true`. The await matters:
/// a killed engine must release its state and lock files before the worker
/// reports a terminal state.
pub fn run_with_stop(
    request: &ProcessRequest,
    should_stop: &dyn Fn() -> bool,
) -> Result<ProcessResult> {
    let start = Instant::now();

    let mut command = Command::new(&request.program);
    command.args(&request.args);
    if let Some(dir) = &request.working_dir {
        command.current_dir(dir);
    }
    for (key, value) in &request.env {
        command.env(key, value);
    }
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn: {}", request.display()))?;

    let deadline = request.timeout.map(|t| start + t);

    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll: {}", request.display()))?
        {
            Some(status) => {
                let stdout = read_pipe(child.stdout.take());
                if request.forward_stdout && !stdout.is_empty() {
                    print!("{stdout}");
                }
                return Ok(ProcessResult {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr: read_pipe(child.stderr.take()),
                    timed_out: false,
                    interrupted: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if should_stop() {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(ProcessResult {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr: read_pipe(child.stderr.take()),
                        timed_out: false,
                        interrupted: true,
                        duration: start.elapsed(),
                    });
                }

                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();

                        let mut stderr = read_pipe(child.stderr.take());
                        stderr.push_str(&format!(
                            "\n{} timed out after {}",
                            request.program,
                            humantime::format_duration(request.timeout.unwrap_or_default())
                        ));

                        return Ok(ProcessResult {
                            exit_code: -1,
                            stdout: read_pipe(child.stdout.take()),
                            stderr,
                            timed_out: true,
                            interrupted: false,
                            duration: start.elapsed(),
                        });
                    }
                }

                std::thread::sleep(WAIT_POLL);
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

/// Check if a program exists on PATH.
pub fn program_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Full path to a program on PATH, if any.
pub fn which_program(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessRequest {
        ProcessRequest::new("sh", ["-c", script])
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let result = run(&sh("echo hello")).expect("run");
        assert!(result.success());
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn captures_stderr_on_failure() {
        let result = run(&sh("echo boom >&2; exit 3")).expect("run");
        assert!(!result.success());
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr.trim(), "boom");
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let request = ProcessRequest::new("definitely-not-a-real-binary-xyz", Vec::<String>::new());
        assert!(run(&request).is_err());
    }

    #[test]
    fn env_entries_reach_the_child() {
        let mut env = BTreeMap::new();
        env.insert("STACKRUN_TEST_VAR".to_string(), "42".to_string());
        let result = run(&sh("echo $STACKRUN_TEST_VAR").with_env(&env)).expect("run");
        assert_eq!(result.stdout.trim(), "42");
    }

    #[test]
    fn working_dir_is_honored() {
        let td = tempfile::tempdir().expect("tempdir");
        let canonical = td.path().canonicalize().expect("canonicalize");
        let result = run(&sh("pwd").in_dir(&canonical)).expect("run");
        assert_eq!(result.stdout.trim(), canonical.to_string_lossy());
    }

    #[test]
    fn timeout_kills_the_child() {
        let mut request = sh("sleep 5");
        request.timeout = Some(Duration::from_millis(150));
        let result = run(&request).expect("run");
        assert!(result.timed_out);
        assert!(!result.success());
        assert!(result.stderr.contains("timed out"));
        assert!(result.duration < Duration::from_secs(5));
    }

    #[test]
    fn stop_check_interrupts_the_child() {
        let request = sh("sleep 5");
        let started = Instant::now();
        let result =
            run_with_stop(&request, &|| started.elapsed() > Duration::from_millis(120))
                .expect("run");
        assert!(result.interrupted);
        assert!(!result.success());
        assert!(result.duration < Duration::from_secs(5));
    }

    #[test]
    fn combined_output_joins_streams() {
        let result = ProcessResult {
            exit_code: 1,
            stdout: "out line".to_string(),
            stderr: "err line".to_string(),
            timed_out: false,
            interrupted: false,
            duration: Duration::ZERO,
        };
        let combined = result.combined_output();
        assert!(combined.contains("out line"));
        assert!(combined.contains("err line"));
    }

    #[test]
    fn stderr_excerpt_truncates() {
        let result = ProcessResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "x".repeat(500),
            timed_out: false,
            interrupted: false,
            duration: Duration::ZERO,
        };
        let excerpt = result.stderr_excerpt(100);
        assert_eq!(excerpt.len(), 103);
        assert!(excerpt.ends_with("..."));
    }

    #[test]
    fn request_display_includes_args() {
        let request = ProcessRequest::new("terraform", ["plan", "-detailed-exitcode"]);
        assert_eq!(request.display(), "terraform plan -detailed-exitcode");
    }

    #[test]
    fn program_exists_for_sh() {
        assert!(program_exists("sh"));
        assert!(!program_exists("this-command-does-not-exist-xyz123"));
    }

    #[test]
    fn process_result_serialization() {
        let result = ProcessResult {
            exit_code: 0,
            stdout: "ok".to_string(),
            stderr: String::new(),
            timed_out: false,
            interrupted: false,
            duration: Duration::from_millis(5),
        };
        let json = serde_json::to_string(&result).expect("serialize");
        assert!(json.contains("\"exit_code\":0"));
        assert!(json.contains("\"stdout\":\"ok\""));
    }
}
