//! Engine version probing and constraint checks.
//!
//! The reported version of each engine binary is cached process-wide,
//! keyed by binary path, so a stack of hundreds of units probes each
//! binary exactly once.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result, bail};
use semver::{Version, VersionReq};

use stackrun_process::ProcessRequest;

fn cache() -> &'static Mutex<BTreeMap<String, Version>> {
    static CACHE: OnceLock<Mutex<BTreeMap<String, Version>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// The engine's reported semantic version, cached per binary path.
pub fn engine_version(binary: &str) -> Result<Version> {
    if let Some(version) = cache().lock().expect("version cache poisoned").get(binary) {
        return Ok(version.clone());
    }

    let result = stackrun_process::run(&ProcessRequest::new(binary, ["version"]))
        .with_context(|| format!("failed to run {binary} version"))?;
    if !result.success() {
        bail!(
            "{binary} version exited with code {}: {}",
            result.exit_code,
            result.stderr_excerpt(200)
        );
    }

    let version = parse_version_output(&result.stdout)
        .with_context(|| format!("could not parse version from {binary} output"))?;

    cache()
        .lock()
        .expect("version cache poisoned")
        .insert(binary.to_string(), version.clone());
    Ok(version)
}

/// Fail unless the binary's version satisfies `constraint`.
pub fn check_version_constraint(binary: &str, constraint: &str) -> Result<()> {
    let req = VersionReq::parse(constraint)
        .with_context(|| format!("invalid terraform_version_constraint: {constraint}"))?;
    let version = engine_version(binary)?;
    if !req.matches(&version) {
        bail!(
            "{binary} version {version} does not satisfy the required constraint {constraint}"
        );
    }
    Ok(())
}

/// Extract the semantic version from `terraform version` style output,
/// e.g. `Terraform v1.7.5` or `OpenTofu v1.6.2`.
pub fn parse_version_output(output: &str) -> Result<Version> {
    let first_line = output.lines().next().unwrap_or_default();
    let token = first_line
        .split_whitespace()
        .find(|word| word.starts_with('v') || word.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .context("no version token in output")?;
    let cleaned = token.trim_start_matches('v');
    Version::parse(cleaned).with_context(|| format!("not a semantic version: {token}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_terraform_banner() {
        let version = parse_version_output("Terraform v1.7.5\non linux_amd64").expect("parse");
        assert_eq!(version, Version::new(1, 7, 5));
    }

    #[test]
    fn parses_tofu_banner() {
        let version = parse_version_output("OpenTofu v1.6.2").expect("parse");
        assert_eq!(version, Version::new(1, 6, 2));
    }

    #[test]
    fn parses_bare_version() {
        let version = parse_version_output("1.5.0").expect("parse");
        assert_eq!(version, Version::new(1, 5, 0));
    }

    #[test]
    fn rejects_versionless_output() {
        assert!(parse_version_output("no digits here").is_err());
        assert!(parse_version_output("").is_err());
    }

    #[test]
    fn constraint_matching() {
        let req = VersionReq::parse(">= 1.5, < 2.0").expect("req");
        assert!(req.matches(&Version::new(1, 7, 5)));
        assert!(!req.matches(&Version::new(2, 1, 0)));
    }

    #[test]
    fn missing_binary_errors() {
        let err = engine_version("definitely-not-an-engine-xyz").expect_err("must fail");
        assert!(format!("{err:#}").contains("definitely-not-an-engine-xyz"));
    }

    #[test]
    fn cache_returns_same_version_for_same_binary() {
        // `sh` is not an engine; prime the cache manually to observe
        // the hit path without depending on an installed engine.
        cache()
            .lock()
            .expect("lock")
            .insert("fake-engine".to_string(), Version::new(9, 9, 9));
        let version = engine_version("fake-engine").expect("cached");
        assert_eq!(version, Version::new(9, 9, 9));
    }
}
