//! # stackrun-core
//!
//! The engine room of the `stackrun` CLI: a command orchestrator that
//! fans an IaC engine command (plan, apply, destroy, ...) out over a
//! stack of interdependent units, in dependency order, with bounded
//! parallelism.
//!
//! ## Pipeline
//!
//! A `run --all` flows through: discovery ([`discover`]) finds every
//! unit under the root; [`dag`] builds the dependency graph, applies
//! the queue filters, and rejects cycles; [`queue`] drains the graph
//! with a worker pool; each worker hands its unit to [`driver`], which
//! loads configuration, resolves the source, generates code, runs the
//! hook envelope around the engine invocation ([`engine`]), and copies
//! lock files back; [`report`] collects the outcomes and renders the
//! summary.
//!
//! ## Key types
//!
//! - `RunOptions` / `RunContext` ([`options`]) — the per-run flag bag
//!   and the per-unit execution context cloned from it
//! - `Stack` ([`dag`]) — the immutable unit arena with index-based
//!   edges
//! - `UnitDriver` ([`driver`]) — the per-unit state machine
//! - `Report` ([`report`]) — thread-safe outcome collection and
//!   rendering (human, CSV, JSON)
//!
//! ## Collaborators
//!
//! Source fetching, credential acquisition, and user prompts are
//! consumed through traits (`Fetcher`, `CredentialSource`,
//! `Prompter`), so embedders and tests swap them freely.

/// Flag and subcommand validation, single-vs-stack dispatch.
pub mod command;
/// Credential sources producing env-var maps.
pub mod creds;
/// Stack construction: arena, edges, filters, cycles, DOT.
pub mod dag;
/// Unit discovery under a root directory.
pub mod discover;
/// The per-unit execution pipeline.
pub mod driver;
/// Engine invocation with retries and cancellation.
pub mod engine;
/// Generated files: generate blocks and backend configuration.
pub mod generate;
/// Before/after/error hook execution.
pub mod hooks;
/// Per-directory mutual exclusion.
pub mod locks;
/// Run options and per-unit contexts.
pub mod options;
/// Worker-pool scheduling over the stack.
pub mod queue;
/// Outcome collection and rendering.
pub mod report;
/// Source resolution into the download cache.
pub mod source;
/// Engine version probing and constraint checks.
pub mod version;

#[cfg(test)]
pub(crate) mod testutil;

pub use command::{AcceptAll, Prompter, RunResult, engine_flavor, run};
pub use dag::{ExternalPolicy, QueueFilters, Stack, Unit};
pub use driver::{Collaborators, UnitDriver};
pub use engine::{Reporter, SharedReporter, shared_reporter};
pub use options::{RunContext, RunOptions};
pub use queue::{UnitOutcome, UnitRunner};
pub use report::Report;
