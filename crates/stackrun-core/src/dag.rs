//! Stack construction: units, dependency edges, filters, cycles.
//!
//! Units live in an arena indexed by canonical working-directory path;
//! edges are stored as indices, never as pointers between units. The
//! builder applies the queue filters before scheduling ever starts and
//! rejects cyclic stacks with the offending chain.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

use stackrun_types::Error;

use crate::discover::DiscoveredUnit;

/// How to treat a dependency that lives outside the discovery root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalPolicy {
    /// Load and schedule the external unit like any other.
    Include,
    /// Assume the external unit is already applied; drop the edge.
    Exclude,
    /// Refuse to build the stack.
    Reject,
}

/// One unit of the stack.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Canonical working directory; the unit's identity.
    pub dir: PathBuf,
    /// The unit's config file.
    pub config_path: PathBuf,
    /// Dependency working directories, in declaration order.
    pub dependencies: Vec<PathBuf>,
    /// Files the unit's config graph reads (include chain).
    pub included_files: Vec<PathBuf>,
    /// The unit lives outside the discovery root.
    pub external: bool,
}

/// A unit removed before scheduling, with the reason.
#[derive(Debug, Clone)]
pub struct ExcludedUnit {
    pub dir: PathBuf,
    pub reason: String,
}

/// The immutable dependency graph of one run.
#[derive(Debug, Clone)]
pub struct Stack {
    root: PathBuf,
    units: Vec<Unit>,
    index: BTreeMap<PathBuf, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    excluded: Vec<ExcludedUnit>,
}

impl Stack {
    /// Build a stack from discovered units.
    ///
    /// `config_filename` locates the config of external dependency
    /// units when the policy includes them.
    pub fn build(
        root: &Path,
        discovered: &[DiscoveredUnit],
        config_filename: &str,
        external_policy: ExternalPolicy,
    ) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("stack root does not exist: {}", root.display()))?;

        let mut units: Vec<Unit> = Vec::new();
        let mut index: BTreeMap<PathBuf, usize> = BTreeMap::new();

        for discovered_unit in discovered {
            if index.contains_key(&discovered_unit.dir) {
                continue;
            }
            let info = stackrun_config::load_graph_info(&discovered_unit.config_path)
                .map_err(anyhow::Error::from)?;
            index.insert(discovered_unit.dir.clone(), units.len());
            units.push(Unit {
                dir: discovered_unit.dir.clone(),
                config_path: discovered_unit.config_path.clone(),
                dependencies: normalize_deps(info.dependencies),
                included_files: info.included_files,
                external: false,
            });
        }

        // External dependencies surface while walking edges; including
        // them can surface further externals, so drain a work queue.
        let mut cursor = 0;
        while cursor < units.len() {
            let deps = units[cursor].dependencies.clone();
            for dep in deps {
                if index.contains_key(&dep) {
                    continue;
                }
                match external_policy {
                    ExternalPolicy::Reject => {
                        return Err(Error::ExternalDependencyRejected { path: dep }.into());
                    }
                    ExternalPolicy::Exclude => {
                        tracing::debug!(
                            dep = %dep.display(),
                            "assuming external dependency is already applied"
                        );
                    }
                    ExternalPolicy::Include => {
                        let config_path = dep.join(config_filename);
                        let info = stackrun_config::load_graph_info(&config_path)
                            .map_err(anyhow::Error::from)?;
                        let canonical_dir =
                            dep.canonicalize().unwrap_or_else(|_| dep.clone());
                        index.insert(dep.clone(), units.len());
                        if canonical_dir != dep {
                            index.insert(canonical_dir.clone(), units.len());
                        }
                        units.push(Unit {
                            dir: canonical_dir,
                            config_path,
                            dependencies: normalize_deps(info.dependencies),
                            included_files: info.included_files,
                            external: true,
                        });
                    }
                }
            }
            cursor += 1;
        }

        let mut stack = Self {
            root,
            units,
            index,
            deps: Vec::new(),
            dependents: Vec::new(),
            excluded: Vec::new(),
        };
        stack.rebuild_edges();
        stack.detect_cycles()?;
        Ok(stack)
    }

    fn rebuild_edges(&mut self) {
        self.deps = vec![Vec::new(); self.units.len()];
        self.dependents = vec![Vec::new(); self.units.len()];
        for (i, unit) in self.units.iter().enumerate() {
            for dep in &unit.dependencies {
                if let Some(&j) = self.index.get(dep) {
                    if i != j && !self.deps[i].contains(&j) {
                        self.deps[i].push(j);
                        self.dependents[j].push(i);
                    }
                }
            }
        }
    }

    /// Three-color DFS; reports the first cycle found as a path chain.
    fn detect_cycles(&self) -> Result<(), Error> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let mut color = vec![WHITE; self.units.len()];
        let mut parent: Vec<Option<usize>> = vec![None; self.units.len()];

        for start in 0..self.units.len() {
            if color[start] != WHITE {
                continue;
            }
            // Iterative DFS keeps deep stacks off the call stack.
            let mut stack = vec![(start, 0usize)];
            color[start] = GRAY;
            while let Some((node, edge)) = stack.last().copied() {
                if edge < self.deps[node].len() {
                    stack.last_mut().expect("stack is non-empty").1 += 1;
                    let next = self.deps[node][edge];
                    match color[next] {
                        WHITE => {
                            color[next] = GRAY;
                            parent[next] = Some(node);
                            stack.push((next, 0));
                        }
                        GRAY => {
                            // Walk parents back from `node` to `next`.
                            let mut chain = vec![self.units[next].dir.clone()];
                            let mut current = node;
                            loop {
                                chain.push(self.units[current].dir.clone());
                                if current == next {
                                    break;
                                }
                                match parent[current] {
                                    Some(p) => current = p,
                                    None => break,
                                }
                            }
                            chain.reverse();
                            return Err(Error::DependencyCycle { chain });
                        }
                        _ => {}
                    }
                } else {
                    color[node] = BLACK;
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    /// Apply the queue filters, removing units before scheduling.
    pub fn apply_filters(&mut self, filters: &QueueFilters) -> Result<()> {
        let mut keep = vec![true; self.units.len()];
        let mut reasons: Vec<Option<String>> = vec![None; self.units.len()];

        if let Some(excludes) = &filters.exclude_dirs {
            for (i, unit) in self.units.iter().enumerate() {
                if excludes.is_match(self.label(&unit.dir)) {
                    keep[i] = false;
                    reasons[i] = Some("matched --queue-exclude-dir".to_string());
                }
            }
        }

        for exclude_path in &filters.exclude_paths {
            let full = stackrun_config::join_normalized(&self.root, exclude_path);
            if let Some(&i) = self.index.get(&full) {
                keep[i] = false;
                reasons[i] = Some("listed in the excludes file".to_string());
            }
        }

        if let Some(includes) = &filters.include_dirs {
            let mut wanted = vec![false; self.units.len()];
            for (i, unit) in self.units.iter().enumerate() {
                if includes.is_match(self.label(&unit.dir)) {
                    wanted[i] = true;
                }
            }
            if !filters.strict_include {
                // Non-strict include pulls in transitive dependencies.
                let mut queue: Vec<usize> =
                    (0..self.units.len()).filter(|&i| wanted[i]).collect();
                while let Some(i) = queue.pop() {
                    for &dep in &self.deps[i] {
                        if !wanted[dep] {
                            wanted[dep] = true;
                            queue.push(dep);
                        }
                    }
                }
            }
            for i in 0..self.units.len() {
                if !wanted[i] && keep[i] {
                    keep[i] = false;
                    reasons[i] = Some("not selected by --queue-include-dir".to_string());
                }
            }
        }

        if !filters.reading_files.is_empty() {
            let targets: Vec<PathBuf> = filters
                .reading_files
                .iter()
                .map(|f| {
                    let full = stackrun_config::join_normalized(&self.root, f);
                    full.canonicalize().unwrap_or(full)
                })
                .collect();
            for (i, unit) in self.units.iter().enumerate() {
                let reads_any = unit
                    .included_files
                    .iter()
                    .any(|read| targets.iter().any(|t| t == read));
                if !reads_any && keep[i] {
                    keep[i] = false;
                    reasons[i] = Some("does not read any of the given files".to_string());
                }
            }
        }

        self.retain(&keep, &reasons);
        Ok(())
    }

    /// Restrict the stack to the unit at `current_dir` plus all its
    /// transitive dependents (graph mode).
    pub fn restrict_to_dependents(&mut self, current_dir: &Path) -> Result<()> {
        let canonical = current_dir
            .canonicalize()
            .unwrap_or_else(|_| current_dir.to_path_buf());
        let Some(&start) = self.index.get(&canonical) else {
            anyhow::bail!(
                "no unit found at {} to anchor the graph run",
                canonical.display()
            );
        };

        let mut wanted = vec![false; self.units.len()];
        wanted[start] = true;
        let mut queue = vec![start];
        while let Some(i) = queue.pop() {
            for &dependent in &self.dependents[i] {
                if !wanted[dependent] {
                    wanted[dependent] = true;
                    queue.push(dependent);
                }
            }
        }

        let reasons: Vec<Option<String>> = wanted
            .iter()
            .map(|&w| {
                if w {
                    None
                } else {
                    Some("outside the current unit's dependent graph".to_string())
                }
            })
            .collect();
        self.retain(&wanted, &reasons);
        Ok(())
    }

    fn retain(&mut self, keep: &[bool], reasons: &[Option<String>]) {
        let mut new_units = Vec::new();
        let mut new_index = BTreeMap::new();

        for (i, unit) in self.units.iter().enumerate() {
            if keep[i] {
                new_index.insert(unit.dir.clone(), new_units.len());
                new_units.push(unit.clone());
            } else {
                self.excluded.push(ExcludedUnit {
                    dir: unit.dir.clone(),
                    reason: reasons[i]
                        .clone()
                        .unwrap_or_else(|| "filtered".to_string()),
                });
            }
        }

        self.units = new_units;
        self.index = new_index;
        self.rebuild_edges();
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn unit(&self, i: usize) -> &Unit {
        &self.units[i]
    }

    pub fn excluded(&self) -> &[ExcludedUnit] {
        &self.excluded
    }

    /// Indices of `i`'s dependencies.
    pub fn deps_of(&self, i: usize) -> &[usize] {
        &self.deps[i]
    }

    /// Indices of units depending on `i`.
    pub fn dependents_of(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }

    /// Units whose dependency list contains `dir` (destroy check).
    pub fn dependents_of_dir(&self, dir: &Path) -> Vec<PathBuf> {
        match self.index.get(dir) {
            Some(&i) => self.dependents[i]
                .iter()
                .map(|&d| self.units[d].dir.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Display label for a unit path: relative to the root when inside.
    pub fn label(&self, dir: &Path) -> String {
        match dir.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.to_string_lossy().to_string(),
            Err(_) => dir.to_string_lossy().to_string(),
        }
    }

    /// Render the DAG in DOT form, edges sorted for determinism.
    pub fn render_dot(&self) -> String {
        let mut edges: Vec<(String, String)> = Vec::new();
        for (i, unit) in self.units.iter().enumerate() {
            for &dep in &self.deps[i] {
                edges.push((self.label(&unit.dir), self.label(&self.units[dep].dir)));
            }
        }
        edges.sort();

        let mut out = String::from("digraph G {\n");
        for (from, to) in edges {
            out.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
        }
        out.push_str("}\n");
        out
    }
}

/// Pre-compiled queue filters.
#[derive(Debug, Default)]
pub struct QueueFilters {
    pub exclude_dirs: Option<GlobSet>,
    pub include_dirs: Option<GlobSet>,
    pub strict_include: bool,
    /// Paths (relative to root) from the excludes file.
    pub exclude_paths: Vec<PathBuf>,
    /// Units must read one of these files to stay in the queue.
    pub reading_files: Vec<PathBuf>,
}

impl QueueFilters {
    /// Compile filters from the raw option lists.
    pub fn compile(
        exclude_globs: &[String],
        include_globs: &[String],
        strict_include: bool,
        excludes_file: Option<&Path>,
        reading_files: &[PathBuf],
    ) -> Result<Self> {
        let exclude_dirs = build_globset(exclude_globs)
            .context("invalid --queue-exclude-dir pattern")?;
        let include_dirs = build_globset(include_globs)
            .context("invalid --queue-include-dir pattern")?;

        let mut exclude_paths = Vec::new();
        if let Some(file) = excludes_file {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("failed to read excludes file {}", file.display()))?;
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    exclude_paths.push(PathBuf::from(line));
                }
            }
        }

        Ok(Self {
            exclude_dirs,
            include_dirs,
            strict_include,
            exclude_paths,
            reading_files: reading_files.to_vec(),
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

fn normalize_deps(deps: Vec<PathBuf>) -> Vec<PathBuf> {
    deps.into_iter()
        .map(|dep| dep.canonicalize().unwrap_or(dep))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::discover_units;
    use tempfile::tempdir;

    fn write_unit(dir: &Path, content: &str) {
        std::fs::create_dir_all(dir).expect("mkdir");
        std::fs::write(dir.join("terragrunt.hcl"), content).expect("write");
    }

    fn chain_stack(root: &Path) -> Stack {
        // a depends on b depends on c
        write_unit(&root.join("c"), "inputs = {}\n");
        write_unit(
            &root.join("b"),
            "dependencies {\n  paths = [\"../c\"]\n}\n",
        );
        write_unit(
            &root.join("a"),
            "dependencies {\n  paths = [\"../b\"]\n}\n",
        );
        let discovered = discover_units(root, "terragrunt.hcl").expect("discover");
        Stack::build(root, &discovered, "terragrunt.hcl", ExternalPolicy::Reject)
            .expect("stack")
    }

    #[test]
    fn builds_linear_chain() {
        let td = tempdir().expect("tempdir");
        let stack = chain_stack(td.path());
        assert_eq!(stack.len(), 3);

        let a = stack
            .units()
            .iter()
            .position(|u| u.dir.ends_with("a"))
            .expect("a");
        let b = stack
            .units()
            .iter()
            .position(|u| u.dir.ends_with("b"))
            .expect("b");
        let c = stack
            .units()
            .iter()
            .position(|u| u.dir.ends_with("c"))
            .expect("c");

        assert_eq!(stack.deps_of(a), &[b]);
        assert_eq!(stack.deps_of(b), &[c]);
        assert!(stack.deps_of(c).is_empty());
        assert_eq!(stack.dependents_of(c), &[b]);
    }

    #[test]
    fn detects_cycles_with_chain() {
        let td = tempdir().expect("tempdir");
        write_unit(
            &td.path().join("a"),
            "dependencies {\n  paths = [\"../b\"]\n}\n",
        );
        write_unit(
            &td.path().join("b"),
            "dependencies {\n  paths = [\"../a\"]\n}\n",
        );
        let discovered = discover_units(td.path(), "terragrunt.hcl").expect("discover");
        let err = Stack::build(td.path(), &discovered, "terragrunt.hcl", ExternalPolicy::Reject)
            .expect_err("cycle");
        let typed = err.downcast::<Error>().expect("typed");
        match typed {
            Error::DependencyCycle { chain } => {
                assert!(chain.len() >= 3);
                assert_eq!(chain.first(), chain.last());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn external_dependency_policies() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join("stack");
        write_unit(&td.path().join("outside"), "inputs = {}\n");
        write_unit(
            &root.join("app"),
            "dependencies {\n  paths = [\"../../outside\"]\n}\n",
        );
        let discovered = discover_units(&root, "terragrunt.hcl").expect("discover");

        let err = Stack::build(&root, &discovered, "terragrunt.hcl", ExternalPolicy::Reject)
            .expect_err("reject");
        assert!(matches!(
            err.downcast::<Error>().expect("typed"),
            Error::ExternalDependencyRejected { .. }
        ));

        let excluded =
            Stack::build(&root, &discovered, "terragrunt.hcl", ExternalPolicy::Exclude)
                .expect("exclude");
        assert_eq!(excluded.len(), 1);
        assert!(excluded.deps_of(0).is_empty());

        let included =
            Stack::build(&root, &discovered, "terragrunt.hcl", ExternalPolicy::Include)
                .expect("include");
        assert_eq!(included.len(), 2);
        let external = included
            .units()
            .iter()
            .find(|u| u.external)
            .expect("external unit");
        assert!(external.dir.ends_with("outside"));
    }

    #[test]
    fn exclude_dir_filter_drops_units() {
        let td = tempdir().expect("tempdir");
        let mut stack = chain_stack(td.path());
        let filters = QueueFilters::compile(
            &["b".to_string()],
            &[],
            false,
            None,
            &[],
        )
        .expect("filters");
        stack.apply_filters(&filters).expect("apply");

        assert_eq!(stack.len(), 2);
        assert_eq!(stack.excluded().len(), 1);
        assert!(stack.excluded()[0].dir.ends_with("b"));
        // a's edge to the excluded b is dropped.
        let a = stack
            .units()
            .iter()
            .position(|u| u.dir.ends_with("a"))
            .expect("a");
        assert!(stack.deps_of(a).is_empty());
    }

    #[test]
    fn strict_include_keeps_only_matches() {
        let td = tempdir().expect("tempdir");
        let mut stack = chain_stack(td.path());
        let filters =
            QueueFilters::compile(&[], &["a".to_string()], true, None, &[]).expect("filters");
        stack.apply_filters(&filters).expect("apply");

        assert_eq!(stack.len(), 1);
        assert!(stack.units()[0].dir.ends_with("a"));
        assert_eq!(stack.excluded().len(), 2);
    }

    #[test]
    fn non_strict_include_pulls_dependencies() {
        let td = tempdir().expect("tempdir");
        let mut stack = chain_stack(td.path());
        let filters =
            QueueFilters::compile(&[], &["a".to_string()], false, None, &[]).expect("filters");
        stack.apply_filters(&filters).expect("apply");

        // a plus its transitive deps b and c.
        assert_eq!(stack.len(), 3);
    }

    #[test]
    fn excludes_file_lines_are_respected() {
        let td = tempdir().expect("tempdir");
        let mut stack = chain_stack(td.path());
        let excludes = td.path().join("excludes.txt");
        std::fs::write(&excludes, "# comment\nc\n\n").expect("write");
        let filters =
            QueueFilters::compile(&[], &[], false, Some(&excludes), &[]).expect("filters");
        stack.apply_filters(&filters).expect("apply");

        assert_eq!(stack.len(), 2);
        assert!(stack.excluded()[0].dir.ends_with("c"));
    }

    #[test]
    fn reading_files_filter() {
        let td = tempdir().expect("tempdir");
        std::fs::write(td.path().join("common.hcl"), "inputs = {}\n").expect("write");
        write_unit(
            &td.path().join("reader"),
            "include \"root\" {\n  path = \"../common.hcl\"\n}\n",
        );
        write_unit(&td.path().join("other"), "inputs = {}\n");

        // The include target must itself parse as a config; common.hcl
        // above is one. Discovery only picks terragrunt.hcl files, so
        // common.hcl is not a unit.
        let discovered = discover_units(td.path(), "terragrunt.hcl").expect("discover");
        let mut stack =
            Stack::build(td.path(), &discovered, "terragrunt.hcl", ExternalPolicy::Reject)
                .expect("stack");

        let filters = QueueFilters::compile(
            &[],
            &[],
            false,
            None,
            &[PathBuf::from("common.hcl")],
        )
        .expect("filters");
        stack.apply_filters(&filters).expect("apply");

        assert_eq!(stack.len(), 1);
        assert!(stack.units()[0].dir.ends_with("reader"));
    }

    #[test]
    fn graph_mode_keeps_dependents() {
        let td = tempdir().expect("tempdir");
        let mut stack = chain_stack(td.path());
        // Anchor at b: keep b and its dependent a, drop c.
        stack
            .restrict_to_dependents(&td.path().join("b"))
            .expect("restrict");

        assert_eq!(stack.len(), 2);
        let dirs: Vec<String> = stack
            .units()
            .iter()
            .map(|u| u.dir.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(dirs.contains(&"a".to_string()));
        assert!(dirs.contains(&"b".to_string()));
    }

    #[test]
    fn dot_output_is_sorted_and_complete() {
        let td = tempdir().expect("tempdir");
        let stack = chain_stack(td.path());
        let dot = stack.render_dot();
        assert!(dot.starts_with("digraph G {\n"));
        assert!(dot.ends_with("}\n"));

        let a_b = dot.find("\"a\" -> \"b\";").expect("a->b");
        let b_c = dot.find("\"b\" -> \"c\";").expect("b->c");
        assert!(a_b < b_c);
    }

    #[test]
    fn dependents_of_dir_for_destroy_check() {
        let td = tempdir().expect("tempdir");
        let stack = chain_stack(td.path());
        let c_dir = td.path().join("c").canonicalize().expect("canonicalize");
        let dependents = stack.dependents_of_dir(&c_dir);
        assert_eq!(dependents.len(), 1);
        assert!(dependents[0].ends_with("b"));
    }
}
