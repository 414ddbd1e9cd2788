//! Engine subcommand classification tables.
//!
//! The orchestrator never interprets engine behavior; it only needs to know
//! which subcommands exist, which skip auto-init, which mutate the provider
//! lock file, which require a confirmation prompt, and which are forbidden
//! under `--all`.

/// Default unit configuration filename.
pub const CONFIG_FILENAME: &str = "terragrunt.hcl";

/// Synthetic hook phase fired after a unit's config has been parsed.
///
/// Hooks listing this value in their `commands` set run once per unit right
/// after the full config parse, before any engine invocation.
pub const READ_CONFIG_PHASE: &str = "terragrunt-read-config";

/// Subcommands understood by Terraform-compatible engines.
const KNOWN_COMMANDS: &[&str] = &[
    "apply",
    "console",
    "destroy",
    "fmt",
    "force-unlock",
    "get",
    "graph",
    "import",
    "init",
    "login",
    "logout",
    "metadata",
    "output",
    "plan",
    "providers",
    "refresh",
    "show",
    "state",
    "taint",
    "test",
    "untaint",
    "validate",
    "version",
    "workspace",
];

/// Subcommands that work against no local state and skip auto-init.
const INIT_NOT_REQUIRED: &[&str] = &["version", "fmt", "graph-dependencies", "info"];

/// Subcommands that mutate infrastructure or state and get one confirmation
/// prompt per run when attached to a terminal.
const NEEDS_CONFIRMATION: &[&str] = &["apply", "destroy", "state"];

/// Subcommands that must never fan out over the whole stack, with the
/// rationale surfaced in the error message.
const ALL_DENYLIST: &[(&str, &str)] = &[
    (
        "import",
        "import targets a single resource address; running it across every unit would import the same resource many times",
    ),
    (
        "taint",
        "taint targets a single resource address and is meaningless applied stack-wide",
    ),
    (
        "untaint",
        "untaint targets a single resource address and is meaningless applied stack-wide",
    ),
    (
        "console",
        "console is interactive; dozens of concurrent consoles would fight over the terminal",
    ),
    (
        "force-unlock",
        "force-unlock takes a per-state lock id; fanning out would unlock states indiscriminately",
    ),
];

/// Whether `command` is in the known engine subcommand table.
pub fn is_known_command(command: &str) -> bool {
    KNOWN_COMMANDS.contains(&command)
}

/// Whether `command` can run without a prior `init`.
pub fn init_not_required(command: &str) -> bool {
    INIT_NOT_REQUIRED.contains(&command)
}

/// Whether a run of `command` with `args` can rewrite the provider lock
/// file. True for `init` and for `providers lock`.
pub fn changes_provider_lock(command: &str, args: &[String]) -> bool {
    match command {
        "init" => true,
        "providers" => args.first().map(String::as_str) == Some("lock"),
        _ => false,
    }
}

/// Whether `command` prompts once before workers start (interactive runs).
pub fn needs_confirmation(command: &str) -> bool {
    NEEDS_CONFIRMATION.contains(&command)
}

/// The denylist rationale when `command` is forbidden under `--all`.
pub fn all_denylist_reason(command: &str) -> Option<&'static str> {
    ALL_DENYLIST
        .iter()
        .find(|(cmd, _)| *cmd == command)
        .map(|(_, reason)| *reason)
}
