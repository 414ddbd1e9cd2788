//! Concurrent, dependency-ordered execution of a stack.
//!
//! A pool of worker threads drains a ready queue under one mutex. An
//! edge (u -> v) guarantees v reaches a terminal state before u starts;
//! nothing else is ordered. Failures cascade to dependents as
//! `EarlyExit` unless dependency errors are ignored, and fail-fast
//! cancels the shared run context on the first failure.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use chrono::Utc;

use stackrun_types::{DetailedExitCode, ReportEntry, RunState};

use crate::dag::{Stack, Unit};
use crate::engine::SharedReporter;
use crate::options::RunContext;
use crate::report::Report;

/// Terminal result of one unit, as produced by the unit driver.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    /// `Succeeded`, `Failed`, or `Skipped`.
    pub state: RunState,
    /// Error summary for failed units.
    pub error: Option<String>,
}

impl UnitOutcome {
    pub fn succeeded() -> Self {
        Self {
            state: RunState::Succeeded,
            error: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            state: RunState::Skipped,
            error: None,
        }
    }

    pub fn failed(error: String) -> Self {
        Self {
            state: RunState::Failed,
            error: Some(error),
        }
    }
}

/// Executes one unit inside a worker.
pub trait UnitRunner: Sync {
    fn run_unit(&self, unit: &Unit, ctx: &RunContext) -> UnitOutcome;
}

/// Aggregate result of a queue run.
#[derive(Debug)]
pub struct QueueOutcome {
    /// Max-merged detailed exit code across units.
    pub exit: DetailedExitCode,
    /// The first failure observed, as (unit label, error).
    pub first_failure: Option<(String, String)>,
}

struct Sched {
    states: Vec<RunState>,
    indegree: Vec<usize>,
    ready: VecDeque<usize>,
    running: usize,
    exit: DetailedExitCode,
    first_failure: Option<(String, String)>,
    drained: bool,
}

/// Run every unit of `stack` through `runner` with the configured
/// worker-pool size.
pub fn run_queue(
    stack: &Stack,
    ctx: &RunContext,
    runner: &dyn UnitRunner,
    report: &Report,
    reporter: &SharedReporter,
) -> QueueOutcome {
    let n = stack.len();
    if n == 0 {
        return QueueOutcome {
            exit: DetailedExitCode::Clean,
            first_failure: None,
        };
    }

    let mut indegree = vec![0usize; n];
    if !ctx.opts.ignore_dependency_order {
        for (i, degree) in indegree.iter_mut().enumerate() {
            *degree = stack.deps_of(i).len();
        }
    }

    // Arena order is canonical-path order, which seeds the FIFO queue
    // deterministically.
    let ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();

    let sched = Mutex::new(Sched {
        states: vec![RunState::Pending; n],
        indegree,
        ready,
        running: 0,
        exit: DetailedExitCode::Clean,
        first_failure: None,
        drained: false,
    });
    let condvar = Condvar::new();

    {
        let mut guard = sched.lock().expect("scheduler poisoned");
        for &i in guard.ready.clone().iter() {
            guard.states[i] = RunState::Ready;
        }
    }

    let workers = ctx.opts.worker_count().min(n);
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| worker_loop(stack, ctx, runner, report, reporter, &sched, &condvar));
        }
    });

    let guard = sched.lock().expect("scheduler poisoned");
    QueueOutcome {
        exit: guard.exit,
        first_failure: guard.first_failure.clone(),
    }
}

fn worker_loop(
    stack: &Stack,
    ctx: &RunContext,
    runner: &dyn UnitRunner,
    report: &Report,
    reporter: &SharedReporter,
    sched: &Mutex<Sched>,
    condvar: &Condvar,
) {
    let mut guard = sched.lock().expect("scheduler poisoned");
    loop {
        if ctx.cancel.is_cancelled() && !guard.drained {
            drain_on_cancel(stack, ctx, report, &mut guard);
            condvar.notify_all();
        }

        if let Some(i) = guard.ready.pop_front() {
            guard.states[i] = RunState::Running;
            guard.running += 1;
            drop(guard);

            let unit = stack.unit(i);
            let unit_ctx = ctx.clone_for_unit(&unit.dir, &unit.config_path);
            let started_at = Utc::now();
            reporter
                .lock()
                .expect("reporter poisoned")
                .info(&format!("{}: running", stack.label(&unit.dir)));
            let outcome = runner.run_unit(unit, &unit_ctx);
            let ended_at = Utc::now();
            let unit_exit = unit_ctx.exit_code();

            guard = sched.lock().expect("scheduler poisoned");
            guard.running -= 1;
            finish_unit(
                stack, ctx, report, reporter, &mut guard, i, outcome, started_at, ended_at,
                unit_exit,
            );
            condvar.notify_all();
        } else if guard.running == 0 {
            // Nothing ready and nothing in flight: every reachable unit
            // is terminal.
            condvar.notify_all();
            return;
        } else {
            guard = condvar.wait(guard).expect("scheduler poisoned");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn finish_unit(
    stack: &Stack,
    ctx: &RunContext,
    report: &Report,
    reporter: &SharedReporter,
    sched: &mut Sched,
    i: usize,
    outcome: UnitOutcome,
    started_at: chrono::DateTime<Utc>,
    ended_at: chrono::DateTime<Utc>,
    unit_exit: DetailedExitCode,
) {
    let unit = stack.unit(i);
    let label = stack.label(&unit.dir);

    sched.states[i] = outcome.state;
    sched.exit = sched.exit.merge(unit_exit);
    if unit_exit == DetailedExitCode::ChangesPresent {
        report.note_changes();
    }

    report.add(ReportEntry {
        unit: unit.dir.clone(),
        state: outcome.state,
        started_at: Some(started_at),
        ended_at: Some(ended_at),
        cause: outcome.error.clone(),
    });

    match outcome.state {
        RunState::Failed => {
            sched.exit = sched.exit.merge(DetailedExitCode::Error);
            let error = outcome
                .error
                .clone()
                .unwrap_or_else(|| "unit failed".to_string());
            reporter
                .lock()
                .expect("reporter poisoned")
                .error(&format!("{label}: {error}"));
            if sched.first_failure.is_none() {
                sched.first_failure = Some((label.clone(), error.clone()));
            }

            if ctx.opts.fail_fast {
                ctx.cancel.cancel(&format!("fail fast: unit {label} failed"));
            }

            if ctx.opts.ignore_dependency_errors {
                release_dependents(stack, sched, i);
            } else {
                cascade_early_exit(stack, report, sched, i, &label);
            }
        }
        _ => {
            reporter
                .lock()
                .expect("reporter poisoned")
                .info(&format!("{label}: {}", outcome.state));
            release_dependents(stack, sched, i);
        }
    }
}

/// Decrement dependents' in-degrees; newly free units become ready.
fn release_dependents(stack: &Stack, sched: &mut Sched, i: usize) {
    for &dependent in stack.dependents_of(i) {
        if sched.states[dependent] != RunState::Pending {
            continue;
        }
        let degree = &mut sched.indegree[dependent];
        *degree = degree.saturating_sub(1);
        if *degree == 0 {
            sched.states[dependent] = RunState::Ready;
            sched.ready.push_back(dependent);
        }
    }
}

/// Transition every (transitive) dependent still pending to EarlyExit,
/// with the cause naming the originally failing unit.
fn cascade_early_exit(
    stack: &Stack,
    report: &Report,
    sched: &mut Sched,
    failed: usize,
    cause_label: &str,
) {
    let mut queue = vec![failed];
    while let Some(i) = queue.pop() {
        for &dependent in stack.dependents_of(i) {
            if sched.states[dependent] != RunState::Pending {
                continue;
            }
            sched.states[dependent] = RunState::EarlyExit;
            report.add(ReportEntry {
                unit: stack.unit(dependent).dir.clone(),
                state: RunState::EarlyExit,
                started_at: None,
                ended_at: None,
                cause: Some(cause_label.to_string()),
            });
            queue.push(dependent);
        }
    }
}

/// On cancellation, everything not yet running exits early.
fn drain_on_cancel(stack: &Stack, ctx: &RunContext, report: &Report, sched: &mut Sched) {
    let cause = ctx
        .cancel
        .cause()
        .unwrap_or_else(|| "run cancelled".to_string());
    for i in 0..sched.states.len() {
        if matches!(sched.states[i], RunState::Pending | RunState::Ready) {
            sched.states[i] = RunState::EarlyExit;
            report.add(ReportEntry {
                unit: stack.unit(i).dir.clone(),
                state: RunState::EarlyExit,
                started_at: None,
                ended_at: None,
                cause: Some(cause.clone()),
            });
        }
    }
    sched.ready.clear();
    sched.drained = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::ExternalPolicy;
    use crate::discover::discover_units;
    use crate::engine::shared_reporter;
    use crate::options::RunOptions;
    use crate::testutil::TestReporter;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    fn write_unit(dir: &Path, content: &str) {
        std::fs::create_dir_all(dir).expect("mkdir");
        std::fs::write(dir.join("terragrunt.hcl"), content).expect("write");
    }

    /// a -> b -> c chain.
    fn chain_stack(root: &Path) -> Stack {
        write_unit(&root.join("c"), "inputs = {}\n");
        write_unit(&root.join("b"), "dependencies {\n  paths = [\"../c\"]\n}\n");
        write_unit(&root.join("a"), "dependencies {\n  paths = [\"../b\"]\n}\n");
        let discovered = discover_units(root, "terragrunt.hcl").expect("discover");
        Stack::build(root, &discovered, "terragrunt.hcl", ExternalPolicy::Reject).expect("stack")
    }

    /// a depends on both b and c; b and c are independent.
    fn diamond_stack(root: &Path) -> Stack {
        write_unit(&root.join("b"), "inputs = {}\n");
        write_unit(&root.join("c"), "inputs = {}\n");
        write_unit(
            &root.join("a"),
            "dependencies {\n  paths = [\"../b\", \"../c\"]\n}\n",
        );
        let discovered = discover_units(root, "terragrunt.hcl").expect("discover");
        Stack::build(root, &discovered, "terragrunt.hcl", ExternalPolicy::Reject).expect("stack")
    }

    struct ScriptedRunner {
        /// unit basename -> outcome to return.
        outcomes: BTreeMap<String, UnitOutcome>,
        /// execution order log of unit basenames.
        log: StdMutex<Vec<String>>,
        delay: Duration,
        concurrent: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(outcomes: BTreeMap<String, UnitOutcome>) -> Self {
            Self {
                outcomes,
                log: StdMutex::new(Vec::new()),
                delay: Duration::from_millis(20),
                concurrent: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().expect("log").clone()
        }
    }

    impl UnitRunner for ScriptedRunner {
        fn run_unit(&self, unit: &Unit, _ctx: &RunContext) -> UnitOutcome {
            let name = unit
                .dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.log.lock().expect("log").push(name.clone());
            std::thread::sleep(self.delay);
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.outcomes
                .get(&name)
                .cloned()
                .unwrap_or_else(UnitOutcome::succeeded)
        }
    }

    fn ctx_with(opts: RunOptions) -> RunContext {
        RunContext::new(opts)
    }

    #[test]
    fn linear_chain_runs_suffix_first() {
        let td = tempdir().expect("tempdir");
        let stack = chain_stack(td.path());
        let ctx = ctx_with(RunOptions {
            parallelism: Some(4),
            ..RunOptions::default()
        });
        let runner = ScriptedRunner::new(BTreeMap::new());
        let report = Report::new();

        let outcome = run_queue(
            &stack,
            &ctx,
            &runner,
            &report,
            &shared_reporter(TestReporter::default()),
        );

        assert_eq!(runner.log(), vec!["c", "b", "a"]);
        assert_eq!(outcome.exit, DetailedExitCode::Clean);
        assert!(outcome.first_failure.is_none());

        let totals = report.totals();
        assert_eq!(totals.succeeded, 3);
        assert_eq!(totals.total(), 3);
    }

    #[test]
    fn dependency_end_precedes_dependent_start() {
        let td = tempdir().expect("tempdir");
        let stack = chain_stack(td.path());
        let ctx = ctx_with(RunOptions {
            parallelism: Some(4),
            ..RunOptions::default()
        });
        let runner = ScriptedRunner::new(BTreeMap::new());
        let report = Report::new();
        run_queue(
            &stack,
            &ctx,
            &runner,
            &report,
            &shared_reporter(TestReporter::default()),
        );

        let entries = report.finalize();
        let find = |suffix: &str| {
            entries
                .iter()
                .find(|e| e.unit.ends_with(suffix))
                .expect("entry")
                .clone()
        };
        let a = find("a");
        let b = find("b");
        let c = find("c");
        assert!(c.ended_at.unwrap() <= b.started_at.unwrap());
        assert!(b.ended_at.unwrap() <= a.started_at.unwrap());
    }

    #[test]
    fn failure_cascades_to_dependents() {
        let td = tempdir().expect("tempdir");
        // a -> b, a -> c; b fails.
        let stack = diamond_stack(td.path());
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            "b".to_string(),
            UnitOutcome::failed("engine exited with code 1".to_string()),
        );
        let runner = ScriptedRunner::new(outcomes);
        let ctx = ctx_with(RunOptions {
            parallelism: Some(4),
            ..RunOptions::default()
        });
        let report = Report::new();

        let outcome = run_queue(
            &stack,
            &ctx,
            &runner,
            &report,
            &shared_reporter(TestReporter::default()),
        );

        let entries = report.finalize();
        let state_of = |suffix: &str| {
            entries
                .iter()
                .find(|e| e.unit.ends_with(suffix))
                .expect("entry")
                .state
        };
        assert_eq!(state_of("b"), RunState::Failed);
        assert_eq!(state_of("c"), RunState::Succeeded);
        assert_eq!(state_of("a"), RunState::EarlyExit);

        let a_entry = entries.iter().find(|e| e.unit.ends_with("a")).unwrap();
        assert_eq!(a_entry.cause.as_deref(), Some("b"));

        assert_eq!(outcome.exit, DetailedExitCode::Error);
        let (failed_label, error) = outcome.first_failure.expect("failure");
        assert_eq!(failed_label, "b");
        assert!(error.contains("exit"));
    }

    #[test]
    fn ignore_dependency_errors_lets_dependents_run() {
        let td = tempdir().expect("tempdir");
        let stack = chain_stack(td.path());
        let mut outcomes = BTreeMap::new();
        outcomes.insert("c".to_string(), UnitOutcome::failed("boom".to_string()));
        let runner = ScriptedRunner::new(outcomes);
        let ctx = ctx_with(RunOptions {
            ignore_dependency_errors: true,
            parallelism: Some(2),
            ..RunOptions::default()
        });
        let report = Report::new();

        run_queue(
            &stack,
            &ctx,
            &runner,
            &report,
            &shared_reporter(TestReporter::default()),
        );

        assert_eq!(runner.log(), vec!["c", "b", "a"]);
        let totals = report.totals();
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.succeeded, 2);
        assert_eq!(totals.early_exits, 0);
    }

    #[test]
    fn parallelism_bound_is_respected() {
        let td = tempdir().expect("tempdir");
        // Six independent units.
        for name in ["u1", "u2", "u3", "u4", "u5", "u6"] {
            write_unit(&td.path().join(name), "inputs = {}\n");
        }
        let discovered = discover_units(td.path(), "terragrunt.hcl").expect("discover");
        let stack =
            Stack::build(td.path(), &discovered, "terragrunt.hcl", ExternalPolicy::Reject)
                .expect("stack");

        let runner = ScriptedRunner::new(BTreeMap::new());
        let ctx = ctx_with(RunOptions {
            parallelism: Some(2),
            ..RunOptions::default()
        });
        let report = Report::new();
        run_queue(
            &stack,
            &ctx,
            &runner,
            &report,
            &shared_reporter(TestReporter::default()),
        );

        assert_eq!(report.totals().succeeded, 6);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn independent_units_do_run_concurrently() {
        let td = tempdir().expect("tempdir");
        for name in ["u1", "u2", "u3", "u4"] {
            write_unit(&td.path().join(name), "inputs = {}\n");
        }
        let discovered = discover_units(td.path(), "terragrunt.hcl").expect("discover");
        let stack =
            Stack::build(td.path(), &discovered, "terragrunt.hcl", ExternalPolicy::Reject)
                .expect("stack");

        let mut runner = ScriptedRunner::new(BTreeMap::new());
        runner.delay = Duration::from_millis(80);
        let ctx = ctx_with(RunOptions {
            parallelism: Some(4),
            ..RunOptions::default()
        });
        let report = Report::new();
        run_queue(
            &stack,
            &ctx,
            &runner,
            &report,
            &shared_reporter(TestReporter::default()),
        );

        assert!(runner.peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn fail_fast_cancels_pending_units() {
        let td = tempdir().expect("tempdir");
        let stack = chain_stack(td.path());
        let mut outcomes = BTreeMap::new();
        outcomes.insert("c".to_string(), UnitOutcome::failed("boom".to_string()));
        let runner = ScriptedRunner::new(outcomes);
        let ctx = ctx_with(RunOptions {
            fail_fast: true,
            parallelism: Some(2),
            ..RunOptions::default()
        });
        let report = Report::new();

        run_queue(
            &stack,
            &ctx,
            &runner,
            &report,
            &shared_reporter(TestReporter::default()),
        );

        // Only c ever ran; b and a exited early.
        assert_eq!(runner.log(), vec!["c"]);
        let totals = report.totals();
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.early_exits, 2);
        assert!(ctx.cancel.is_cancelled());
    }

    #[test]
    fn skipped_units_do_not_block_dependents() {
        let td = tempdir().expect("tempdir");
        let stack = chain_stack(td.path());
        let mut outcomes = BTreeMap::new();
        outcomes.insert("c".to_string(), UnitOutcome::skipped());
        let runner = ScriptedRunner::new(outcomes);
        let ctx = ctx_with(RunOptions {
            parallelism: Some(2),
            ..RunOptions::default()
        });
        let report = Report::new();

        run_queue(
            &stack,
            &ctx,
            &runner,
            &report,
            &shared_reporter(TestReporter::default()),
        );

        assert_eq!(runner.log(), vec!["c", "b", "a"]);
        let totals = report.totals();
        assert_eq!(totals.skipped, 1);
        assert_eq!(totals.succeeded, 2);
    }

    #[test]
    fn changes_present_exit_code_propagates() {
        let td = tempdir().expect("tempdir");
        write_unit(&td.path().join("only"), "inputs = {}\n");
        let discovered = discover_units(td.path(), "terragrunt.hcl").expect("discover");
        let stack =
            Stack::build(td.path(), &discovered, "terragrunt.hcl", ExternalPolicy::Reject)
                .expect("stack");

        struct ChangesRunner;
        impl UnitRunner for ChangesRunner {
            fn run_unit(&self, _unit: &Unit, ctx: &RunContext) -> UnitOutcome {
                ctx.record_exit(DetailedExitCode::ChangesPresent);
                UnitOutcome::succeeded()
            }
        }

        let ctx = ctx_with(RunOptions::default());
        let report = Report::new();
        let outcome = run_queue(
            &stack,
            &ctx,
            &ChangesRunner,
            &report,
            &shared_reporter(TestReporter::default()),
        );

        assert_eq!(outcome.exit, DetailedExitCode::ChangesPresent);
        assert_eq!(report.totals().with_changes, 1);
    }

    #[test]
    fn empty_stack_is_a_clean_run() {
        let td = tempdir().expect("tempdir");
        write_unit(&td.path().join("only"), "inputs = {}\n");
        let discovered = discover_units(td.path(), "terragrunt.hcl").expect("discover");
        let mut stack =
            Stack::build(td.path(), &discovered, "terragrunt.hcl", ExternalPolicy::Reject)
                .expect("stack");
        let filters = crate::dag::QueueFilters::compile(
            &["only".to_string()],
            &[],
            false,
            None,
            &[],
        )
        .expect("filters");
        stack.apply_filters(&filters).expect("apply");

        let ctx = ctx_with(RunOptions::default());
        let report = Report::new();
        let outcome = run_queue(
            &stack,
            &ctx,
            &ScriptedRunner::new(BTreeMap::new()),
            &report,
            &shared_reporter(TestReporter::default()),
        );
        assert_eq!(outcome.exit, DetailedExitCode::Clean);
    }
}
