//! Interpolation resolution for unit configurations.
//!
//! The HCL parser hands back unevaluated expressions as `${...}` strings.
//! This module resolves the traversals the orchestrator itself must
//! thread through a config: `local.*` references and
//! `dependency.<name>.outputs.*` references. Expressions rooted anywhere
//! else (engine functions, unknown variables) pass through untouched so
//! the engine or the user sees them verbatim.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as Json;

/// Roots the orchestrator resolves; failures on these are hard errors.
const RESOLVED_ROOTS: &[&str] = &["local", "dependency"];

fn interp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static pattern"))
}

/// An interpolation that references a resolved root but cannot be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedReference {
    pub expression: String,
}

impl std::fmt::Display for UnresolvedReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unresolved reference ${{{}}}", self.expression)
    }
}

/// Resolve every `${...}` occurrence in `value` against `scope`.
///
/// A string that is exactly one interpolation takes the referenced
/// value's type; interpolations embedded in larger strings render as
/// text. Arrays and objects are resolved recursively.
pub fn resolve_value(value: &Json, scope: &Json) -> Result<Json, UnresolvedReference> {
    match value {
        Json::String(s) => resolve_string(s, scope),
        Json::Array(items) => {
            let resolved = items
                .iter()
                .map(|item| resolve_value(item, scope))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Json::Array(resolved))
        }
        Json::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, scope)?);
            }
            Ok(Json::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Whether `value` still contains an interpolation rooted at `root`.
pub fn references_root(value: &Json, root: &str) -> bool {
    match value {
        Json::String(s) => interp_pattern().captures_iter(s).any(|caps| {
            let expr = caps[1].trim();
            expr == root || expr.starts_with(&format!("{root}."))
        }),
        Json::Array(items) => items.iter().any(|item| references_root(item, root)),
        Json::Object(map) => map.values().any(|item| references_root(item, root)),
        _ => false,
    }
}

fn resolve_string(s: &str, scope: &Json) -> Result<Json, UnresolvedReference> {
    let pattern = interp_pattern();

    // Whole-string interpolation keeps the referenced value's type.
    if let Some(caps) = pattern.captures(s) {
        if caps.get(0).map(|m| m.as_str()) == Some(s) {
            let expr = caps[1].trim();
            return match lookup(expr, scope) {
                Lookup::Found(value) => Ok(value),
                Lookup::Missing => Err(UnresolvedReference {
                    expression: expr.to_string(),
                }),
                Lookup::Foreign => Ok(Json::String(s.to_string())),
            };
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    let mut error: Option<UnresolvedReference> = None;

    for caps in pattern.captures_iter(s) {
        let whole = caps.get(0).expect("match exists");
        let expr = caps[1].trim();
        out.push_str(&s[last..whole.start()]);
        match lookup(expr, scope) {
            Lookup::Found(value) => out.push_str(&render_inline(&value)),
            Lookup::Missing => {
                error.get_or_insert(UnresolvedReference {
                    expression: expr.to_string(),
                });
            }
            Lookup::Foreign => out.push_str(whole.as_str()),
        }
        last = whole.end();
    }

    if let Some(err) = error {
        return Err(err);
    }

    out.push_str(&s[last..]);
    Ok(Json::String(out))
}

enum Lookup {
    /// A resolved-root traversal that exists in scope.
    Found(Json),
    /// A resolved-root traversal with no value behind it.
    Missing,
    /// A traversal rooted outside the orchestrator's scope.
    Foreign,
}

fn lookup(expr: &str, scope: &Json) -> Lookup {
    let mut segments = expr.split('.');
    let Some(root) = segments.next() else {
        return Lookup::Foreign;
    };
    // Function calls and operators are not traversals.
    if !RESOLVED_ROOTS.contains(&root) || expr.contains('(') || expr.contains(' ') {
        return Lookup::Foreign;
    }

    let mut current = match scope.get(root) {
        Some(value) => value,
        None => return Lookup::Missing,
    };
    for segment in segments {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Lookup::Missing,
        }
    }
    Lookup::Found(current.clone())
}

fn render_inline(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Json {
        json!({
            "local": {
                "region": "eu-west-1",
                "count": 3,
                "tags": {"team": "platform"},
            },
            "dependency": {
                "vpc": {"outputs": {"vpc_id": "vpc-123", "cidrs": ["10.0.0.0/16"]}},
            },
        })
    }

    #[test]
    fn whole_string_interpolation_keeps_type() {
        let resolved = resolve_value(&json!("${local.count}"), &scope()).expect("resolve");
        assert_eq!(resolved, json!(3));
    }

    #[test]
    fn embedded_interpolation_renders_text() {
        let resolved =
            resolve_value(&json!("bucket-${local.region}-${local.count}"), &scope())
                .expect("resolve");
        assert_eq!(resolved, json!("bucket-eu-west-1-3"));
    }

    #[test]
    fn dependency_outputs_resolve() {
        let resolved =
            resolve_value(&json!("${dependency.vpc.outputs.vpc_id}"), &scope()).expect("resolve");
        assert_eq!(resolved, json!("vpc-123"));
    }

    #[test]
    fn non_string_array_values_resolve() {
        let resolved = resolve_value(
            &json!({"subnet_cidrs": "${dependency.vpc.outputs.cidrs}", "n": 1}),
            &scope(),
        )
        .expect("resolve");
        assert_eq!(resolved, json!({"subnet_cidrs": ["10.0.0.0/16"], "n": 1}));
    }

    #[test]
    fn missing_local_is_an_error() {
        let err = resolve_value(&json!("${local.nope}"), &scope()).expect_err("must fail");
        assert_eq!(err.expression, "local.nope");
        assert!(err.to_string().contains("local.nope"));
    }

    #[test]
    fn missing_dependency_is_an_error() {
        let err = resolve_value(&json!("${dependency.db.outputs.url}"), &scope())
            .expect_err("must fail");
        assert_eq!(err.expression, "dependency.db.outputs.url");
    }

    #[test]
    fn foreign_roots_pass_through() {
        let value = json!("${var.something}");
        assert_eq!(resolve_value(&value, &scope()).expect("resolve"), value);
        let call = json!("${find_in_parent_folders()}");
        assert_eq!(resolve_value(&call, &scope()).expect("resolve"), call);
    }

    #[test]
    fn objects_render_inline_as_json() {
        let resolved =
            resolve_value(&json!("tags: ${local.tags}"), &scope()).expect("resolve");
        assert_eq!(resolved, json!("tags: {\"team\":\"platform\"}"));
    }

    #[test]
    fn references_root_detects_pending_work() {
        assert!(references_root(&json!("${local.region}"), "local"));
        assert!(references_root(
            &json!({"a": ["${dependency.vpc.outputs.vpc_id}"]}),
            "dependency"
        ));
        assert!(!references_root(&json!("${var.x}"), "local"));
        assert!(!references_root(&json!(42), "local"));
    }

    #[test]
    fn plain_values_are_untouched() {
        for value in [json!(null), json!(true), json!(7), json!("plain")] {
            assert_eq!(resolve_value(&value, &scope()).expect("resolve"), value);
        }
    }
}
