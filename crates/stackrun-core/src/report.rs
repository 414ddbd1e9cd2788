//! Run report: collection and rendering.
//!
//! Workers append entries as units reach terminal states; finalization
//! deduplicates (last write wins per unit), and the result renders as a
//! human summary, CSV, or JSON, with an optional JSON Schema file
//! describing the JSON form.

use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use serde_json::json;

use stackrun_types::{ReportEntry, ReportFormat, RunState, RunTotals};

/// CSV header of the report file.
pub const CSV_HEADER: &str = "unit,state,started_at,ended_at,duration_ms,cause";

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

/// Thread-safe collector of per-unit outcomes.
#[derive(Debug)]
pub struct Report {
    entries: Mutex<Vec<ReportEntry>>,
    changes: Mutex<usize>,
    started: Instant,
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

impl Report {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            changes: Mutex::new(0),
            started: Instant::now(),
        }
    }

    /// Append one entry; later entries for the same unit replace
    /// earlier ones at finalization.
    pub fn add(&self, entry: ReportEntry) {
        self.entries.lock().expect("report poisoned").push(entry);
    }

    /// Record that a unit's plan reported pending changes.
    pub fn note_changes(&self) {
        *self.changes.lock().expect("report poisoned") += 1;
    }

    /// Deduplicated entries, sorted by unit path.
    pub fn finalize(&self) -> Vec<ReportEntry> {
        let entries = self.entries.lock().expect("report poisoned");
        let mut by_unit: Vec<ReportEntry> = Vec::new();
        for entry in entries.iter() {
            match by_unit.iter_mut().find(|e| e.unit == entry.unit) {
                Some(existing) => *existing = entry.clone(),
                None => by_unit.push(entry.clone()),
            }
        }
        by_unit.sort_by(|a, b| a.unit.cmp(&b.unit));
        by_unit
    }

    /// Terminal-state counts over the finalized entries.
    pub fn totals(&self) -> RunTotals {
        let mut totals = RunTotals {
            with_changes: *self.changes.lock().expect("report poisoned"),
            ..RunTotals::default()
        };
        for entry in self.finalize() {
            match entry.state {
                RunState::Succeeded => totals.succeeded += 1,
                RunState::Failed => totals.failed += 1,
                RunState::EarlyExit => totals.early_exits += 1,
                RunState::Skipped => totals.skipped += 1,
                RunState::Excluded => totals.excluded += 1,
                _ => {}
            }
        }
        totals
    }

    /// Human-readable run summary.
    pub fn render_human(&self, per_unit: bool, color: bool) -> String {
        let totals = self.totals();
        let entries = self.finalize();
        let elapsed = humantime::format_duration(round_to_millis(self.started.elapsed()));

        let paint = |code: &str, text: String| {
            if color {
                format!("{code}{text}{RESET}")
            } else {
                text
            }
        };

        let mut out = String::new();
        out.push_str(&format!(
            "Run summary: {} units in {elapsed}\n",
            totals.total()
        ));
        if totals.succeeded > 0 {
            out.push_str(&paint(GREEN, format!("  succeeded: {}\n", totals.succeeded)));
        }
        if totals.with_changes > 0 {
            out.push_str(&paint(
                YELLOW,
                format!("  with changes pending: {}\n", totals.with_changes),
            ));
        }
        if totals.failed > 0 {
            out.push_str(&paint(RED, format!("  failed: {}\n", totals.failed)));
        }
        if totals.early_exits > 0 {
            out.push_str(&paint(RED, format!("  early exits: {}\n", totals.early_exits)));
        }
        if totals.skipped > 0 {
            out.push_str(&format!("  skipped: {}\n", totals.skipped));
        }
        if totals.excluded > 0 {
            out.push_str(&format!("  excluded: {}\n", totals.excluded));
        }

        if per_unit {
            out.push('\n');
            for entry in &entries {
                let line = format!(
                    "  {} {} ({}ms){}\n",
                    entry.state,
                    entry.unit.display(),
                    entry.duration_ms(),
                    entry
                        .cause
                        .as_ref()
                        .map(|c| format!(": {c}"))
                        .unwrap_or_default()
                );
                match entry.state {
                    RunState::Succeeded => out.push_str(&paint(GREEN, line)),
                    RunState::Failed | RunState::EarlyExit => out.push_str(&paint(RED, line)),
                    _ => out.push_str(&line),
                }
            }
        }
        out
    }

    /// CSV rendering with the fixed header.
    pub fn render_csv(&self) -> String {
        let mut out = String::from(CSV_HEADER);
        out.push('\n');
        for entry in self.finalize() {
            let row = [
                csv_field(&entry.unit.display().to_string()),
                csv_field(&entry.state.to_string()),
                csv_field(&entry.started_at.map(rfc3339_nanos).unwrap_or_default()),
                csv_field(&entry.ended_at.map(rfc3339_nanos).unwrap_or_default()),
                entry.duration_ms().to_string(),
                csv_field(entry.cause.as_deref().unwrap_or("")),
            ];
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    /// JSON rendering: a top-level array of entry objects.
    pub fn render_json(&self) -> Result<String> {
        let entries: Vec<serde_json::Value> = self
            .finalize()
            .iter()
            .map(|entry| {
                json!({
                    "unit": entry.unit.display().to_string(),
                    "state": entry.state,
                    "started_at": entry.started_at.map(rfc3339_nanos),
                    "ended_at": entry.ended_at.map(rfc3339_nanos),
                    "duration_ms": entry.duration_ms(),
                    "cause": entry.cause.clone(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&entries).context("failed to serialize report")
    }

    /// Write the report (and optionally its schema) to disk.
    pub fn write_files(
        &self,
        report_file: Option<&Path>,
        format: ReportFormat,
        schema_file: Option<&Path>,
    ) -> Result<()> {
        if let Some(path) = report_file {
            let content = match format {
                ReportFormat::Csv => self.render_csv(),
                ReportFormat::Json => self.render_json()?,
            };
            std::fs::write(path, content)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
        }
        if let Some(path) = schema_file {
            let schema = serde_json::to_string_pretty(&report_schema())
                .context("failed to serialize report schema")?;
            std::fs::write(path, schema)
                .with_context(|| format!("failed to write schema to {}", path.display()))?;
        }
        Ok(())
    }
}

/// JSON Schema describing the JSON report form.
pub fn report_schema() -> serde_json::Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Run report",
        "type": "array",
        "items": {
            "type": "object",
            "required": ["unit", "state", "duration_ms"],
            "properties": {
                "unit": {"type": "string"},
                "state": {
                    "type": "string",
                    "enum": [
                        "succeeded",
                        "failed",
                        "early_exit",
                        "skipped",
                        "excluded"
                    ]
                },
                "started_at": {"type": ["string", "null"], "format": "date-time"},
                "ended_at": {"type": ["string", "null"], "format": "date-time"},
                "duration_ms": {"type": "integer", "minimum": 0},
                "cause": {"type": ["string", "null"]}
            }
        }
    })
}

/// Summary suppression: `output` runs and `-json` forwards are consumed
/// programmatically, so no human summary is printed.
pub fn should_skip_summary(command: Option<&str>, extra_args: &[String]) -> bool {
    if command == Some("output") {
        return true;
    }
    extra_args.iter().any(|arg| arg == "-json" || arg == "--json")
}

fn rfc3339_nanos(dt: chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn round_to_millis(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(d.as_millis() as u64)
}
