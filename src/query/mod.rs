//! Query and search engine over the in-memory indexes.
//!
//! Matching policy: a pattern that is syntactically a plain identifier goes
//! through the FTS-backed exact path. Anything else is compiled as a regex
//! and scanned against the name indexes, always: `.*Mgr$` is a regex even
//! though FTS could prefix-match part of it. Regex scans stop at a
//! configurable result ceiling.

use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use crate::config::QueryConfig;
use crate::error::{QueryError, QueryResult};
use crate::indexing::memory::SymbolIndexes;
use crate::store::SymbolStore;
use crate::symbol::{Symbol, SymbolKind};

/// How a search pattern is interpreted.
enum MatchPolicy {
    Identifier(String),
    Pattern(Regex),
}

fn is_plain_identifier(pattern: &str) -> bool {
    !pattern.is_empty()
        && pattern
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && pattern.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn compile_policy(pattern: &str) -> QueryResult<MatchPolicy> {
    if is_plain_identifier(pattern) {
        return Ok(MatchPolicy::Identifier(pattern.to_string()));
    }
    Regex::new(pattern)
        .map(MatchPolicy::Pattern)
        .map_err(|e| QueryError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

/// One function search hit, with its parameter types split out and, when
/// aliasing applies, their canonical forms.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionMatch {
    #[serde(flatten)]
    pub symbol: Symbol,
    pub param_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_types_canonical: Option<Vec<String>>,
}

/// A node in a recursive base/derived hierarchy tree.
#[derive(Debug, Clone, Serialize)]
pub struct HierarchyNode {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub children: Vec<HierarchyNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassInfo {
    #[serde(flatten)]
    pub symbol: Symbol,
    pub base_classes: Vec<HierarchyNode>,
    pub derived_classes: Vec<HierarchyNode>,
    pub methods: Vec<Symbol>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassHierarchy {
    pub name: String,
    pub bases: Vec<HierarchyNode>,
    pub derived: Vec<HierarchyNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallSiteInfo {
    pub caller: String,
    pub target: String,
    pub caller_usr: String,
    pub callee_usr: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// ±2 lines of source around the call, read on demand.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallPath {
    pub usrs: Vec<String>,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStatistics {
    pub total_call_sites: u64,
    pub distinct_edges: u64,
    pub top_callers: Vec<(String, u64)>,
    pub top_callees: Vec<(String, u64)>,
}

/// Answer for the deferred cross-reference feature.
#[derive(Debug, Clone, Serialize)]
pub struct CrossReferences {
    pub references: Vec<serde_json::Value>,
    pub note: String,
}

pub struct QueryEngine<'a> {
    indexes: &'a SymbolIndexes,
    store: Option<&'a SymbolStore>,
    config: &'a QueryConfig,
}

impl<'a> QueryEngine<'a> {
    pub fn new(
        indexes: &'a SymbolIndexes,
        store: Option<&'a SymbolStore>,
        config: &'a QueryConfig,
    ) -> Self {
        Self {
            indexes,
            store,
            config,
        }
    }

    // ---- search ---------------------------------------------------------

    /// Classes, structs, templates, and specializations matching `pattern`.
    ///
    /// An identifier naming a class template aggregates the whole family:
    /// primary, full, and partial specializations.
    pub fn search_classes(
        &self,
        pattern: &str,
        project_only: bool,
        kind_filter: Option<SymbolKind>,
    ) -> QueryResult<Vec<Symbol>> {
        let mut hits = self.search_kind(pattern, project_only, SymbolKind::is_class_like)?;

        // Pull in the template family of every primary that matched.
        let mut family = Vec::new();
        for symbol in &hits {
            if symbol.kind == SymbolKind::ClassTemplate {
                for spec in self.indexes.specializations_of(&symbol.usr) {
                    family.push(spec.clone());
                }
            }
            if let Some(primary_usr) = &symbol.primary_template_usr {
                if let Some(primary) = self.indexes.get_by_usr(primary_usr) {
                    family.push(primary.clone());
                }
            }
        }
        hits.extend(family);

        let mut hits = dedup_by_usr(hits);
        if let Some(kind) = kind_filter {
            hits.retain(|s| s.kind == kind);
        }
        if project_only {
            hits.retain(|s| s.is_project);
        }
        sort_symbols(&mut hits);
        Ok(hits)
    }

    /// Functions, methods, and function templates matching `pattern`.
    pub fn search_functions(
        &self,
        pattern: &str,
        class_name: Option<&str>,
        param_type: Option<&str>,
        project_only: bool,
    ) -> QueryResult<Vec<FunctionMatch>> {
        let mut hits = self.search_kind(pattern, project_only, SymbolKind::is_function_like)?;

        if let Some(class_name) = class_name {
            hits.retain(|s| {
                s.parent_class == class_name
                    || s.parent_class.ends_with(&format!("::{class_name}"))
            });
        }

        // Alias-aware parameter matching: canonicalize the requested type,
        // then accept any textual variant sharing that canonical form.
        let variants = param_type.map(|t| self.type_variants(t));
        let mut matches = Vec::new();
        for symbol in hits {
            let param_types = param_types_from_signature(symbol.signature.as_deref());
            if let Some((canonical, variants)) = &variants {
                let hit = param_types
                    .iter()
                    .any(|p| variants.contains(&strip_type_decorations(p)));
                if !hit {
                    continue;
                }
                let canonical_params: Vec<String> = param_types
                    .iter()
                    .map(|p| {
                        let bare = strip_type_decorations(p);
                        if variants.contains(&bare) {
                            canonical.clone()
                        } else {
                            self.indexes
                                .canonical_for_alias(&bare)
                                .unwrap_or(&bare)
                                .to_string()
                        }
                    })
                    .collect();
                matches.push(FunctionMatch {
                    symbol,
                    param_types,
                    param_types_canonical: Some(canonical_params),
                });
            } else {
                matches.push(FunctionMatch {
                    symbol,
                    param_types,
                    param_types_canonical: None,
                });
            }
        }
        matches.sort_by(|a, b| {
            (&a.symbol.qualified_name, &a.symbol.file, a.symbol.start_line)
                .cmp(&(&b.symbol.qualified_name, &b.symbol.file, b.symbol.start_line))
        });
        Ok(matches)
    }

    /// All symbols of any kind matching `pattern`.
    pub fn search_symbols(
        &self,
        pattern: &str,
        kind_filter: Option<SymbolKind>,
        project_only: bool,
    ) -> QueryResult<Vec<Symbol>> {
        let mut hits = self.search_kind(pattern, project_only, |_| true)?;
        if let Some(kind) = kind_filter {
            hits.retain(|s| s.kind == kind);
        }
        sort_symbols(&mut hits);
        Ok(hits)
    }

    fn search_kind(
        &self,
        pattern: &str,
        project_only: bool,
        kind_ok: impl Fn(&SymbolKind) -> bool,
    ) -> QueryResult<Vec<Symbol>> {
        let policy = compile_policy(pattern)?;
        let mut hits: Vec<Symbol> = Vec::new();

        match policy {
            MatchPolicy::Identifier(name) => {
                // Hot path via the name buckets; the FTS table gives the
                // same answer from a cold store without the memory index.
                for symbol in self.indexes.classes_named(&name) {
                    hits.push(symbol.clone());
                }
                for symbol in self.indexes.functions_named(&name) {
                    hits.push(symbol.clone());
                }
                for symbol in self.indexes.symbols_with_qualified_name(&name) {
                    hits.push(symbol.clone());
                }
                if hits.is_empty() {
                    if let Some(store) = self.store {
                        if let Ok(stored) =
                            store.search_symbols_fts(&name, false, None, project_only, 256)
                        {
                            hits.extend(stored);
                        }
                    }
                }
            }
            MatchPolicy::Pattern(regex) => {
                for symbol in self.indexes.iter_symbols() {
                    if hits.len() >= self.config.max_results {
                        break;
                    }
                    if regex.is_match(&symbol.name) || regex.is_match(&symbol.qualified_name) {
                        hits.push(symbol.clone());
                    }
                }
            }
        }

        hits.retain(|s| kind_ok(&s.kind));
        if project_only {
            hits.retain(|s| s.is_project);
        }
        Ok(dedup_by_usr(hits))
    }

    /// The canonical form of `ty` plus every textual variant that resolves
    /// to it: the written name, its canonical type, and all sibling aliases.
    fn type_variants(&self, ty: &str) -> (String, HashSet<String>) {
        let bare = strip_type_decorations(ty);
        let canonical = self
            .indexes
            .canonical_for_alias(&bare)
            .unwrap_or(&bare)
            .to_string();
        let mut variants: HashSet<String> = HashSet::new();
        variants.insert(bare);
        variants.insert(canonical.clone());
        for alias in self.indexes.aliases_for_canonical(&canonical) {
            variants.insert(alias.clone());
        }
        (canonical, variants)
    }

    // ---- class and function info ---------------------------------------

    pub fn get_class_info(&self, name: &str) -> QueryResult<Option<ClassInfo>> {
        let candidates = self.search_classes(name, false, None)?;
        let Some(symbol) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let mut visited = HashSet::new();
        let base_classes = self.base_tree(&symbol, &mut visited, 0);
        let mut visited = HashSet::new();
        let derived_classes = self.derived_tree(&symbol.name, &symbol.qualified_name, &mut visited, 0);
        let methods = self
            .indexes
            .methods_of_class(&symbol.qualified_name)
            .into_iter()
            .cloned()
            .collect();

        Ok(Some(ClassInfo {
            symbol,
            base_classes,
            derived_classes,
            methods,
        }))
    }

    pub fn get_function_info(&self, name: &str) -> QueryResult<Vec<FunctionMatch>> {
        let mut overloads = self.search_functions(name, None, None, false)?;
        for m in &mut overloads {
            // Info responses always resolve parameter aliases.
            let canonical: Vec<String> = m
                .param_types
                .iter()
                .map(|p| {
                    let bare = strip_type_decorations(p);
                    self.indexes
                        .canonical_for_alias(&bare)
                        .unwrap_or(&bare)
                        .to_string()
                })
                .collect();
            m.param_types_canonical = Some(canonical);
        }
        Ok(overloads)
    }

    fn base_tree(&self, symbol: &Symbol, visited: &mut HashSet<String>, depth: usize) -> Vec<HierarchyNode> {
        if depth >= self.config.max_depth || !visited.insert(symbol.usr.clone()) {
            return Vec::new();
        }
        let mut bases = symbol.base_classes.clone();
        bases.sort();
        bases
            .into_iter()
            .map(|base| {
                let resolved = self.resolve_class(&base);
                let children = resolved
                    .map(|s| self.base_tree(s, visited, depth + 1))
                    .unwrap_or_default();
                HierarchyNode {
                    name: base,
                    file: resolved.map(|s| s.file.clone()),
                    line: resolved.map(|s| s.start_line),
                    children,
                }
            })
            .collect()
    }

    fn derived_tree(
        &self,
        short_name: &str,
        qualified: &str,
        visited: &mut HashSet<String>,
        depth: usize,
    ) -> Vec<HierarchyNode> {
        if depth >= self.config.max_depth || !visited.insert(qualified.to_string()) {
            return Vec::new();
        }
        // Derived links are recorded under the normalized base name, which
        // may be either the short or the qualified spelling.
        let mut derived: Vec<String> = self
            .indexes
            .derived_of(short_name)
            .iter()
            .chain(self.indexes.derived_of(qualified))
            .cloned()
            .collect();
        derived.sort();
        derived.dedup();

        derived
            .into_iter()
            .map(|name| {
                let resolved = self.resolve_class(&name);
                let children = resolved
                    .map(|s| self.derived_tree(&s.name, &s.qualified_name, visited, depth + 1))
                    .unwrap_or_default();
                HierarchyNode {
                    name,
                    file: resolved.map(|s| s.file.clone()),
                    line: resolved.map(|s| s.start_line),
                    children,
                }
            })
            .collect()
    }

    fn resolve_class(&self, name: &str) -> Option<&Symbol> {
        let short = name.rsplit("::").next().unwrap_or(name);
        self.indexes
            .symbols_with_qualified_name(name)
            .into_iter()
            .chain(self.indexes.classes_named(short))
            .find(|s| s.kind.is_class_like())
    }

    pub fn get_class_hierarchy(&self, name: &str) -> QueryResult<Option<ClassHierarchy>> {
        let candidates = self.search_classes(name, false, None)?;
        let Some(symbol) = candidates.into_iter().next() else {
            return Ok(None);
        };
        let mut visited = HashSet::new();
        let bases = self.base_tree(&symbol, &mut visited, 0);
        let mut visited = HashSet::new();
        let derived = self.derived_tree(&symbol.name, &symbol.qualified_name, &mut visited, 0);
        Ok(Some(ClassHierarchy {
            name: symbol.qualified_name,
            bases,
            derived,
        }))
    }

    // ---- call graph -----------------------------------------------------

    /// Call sites whose callee matches `function`, ordered by location.
    pub fn find_callers(&self, function: &str) -> QueryResult<Vec<CallSiteInfo>> {
        let targets = self.function_usrs(function)?;
        let mut out = Vec::new();
        for usr in &targets {
            for site in self.indexes.resolved_calls_to(usr) {
                out.push(self.call_site_info(site));
            }
        }
        sort_call_sites(&mut out);
        Ok(out)
    }

    /// Call sites inside `caller`, ordered by location.
    pub fn get_call_sites(&self, caller: &str) -> QueryResult<Vec<CallSiteInfo>> {
        let callers = self.function_usrs(caller)?;
        let mut out = Vec::new();
        for usr in &callers {
            for site in self.indexes.resolved_calls_from(usr) {
                out.push(self.call_site_info(site));
            }
        }
        sort_call_sites(&mut out);
        Ok(out)
    }

    fn call_site_info(&self, site: &crate::symbol::CallSite) -> CallSiteInfo {
        let caller = self
            .indexes
            .get_by_usr(&site.caller_usr)
            .map(|s| s.qualified_name.clone())
            .unwrap_or_else(|| site.caller_usr.clone());
        let target = self
            .indexes
            .get_by_usr(&site.callee_usr)
            .map(|s| s.qualified_name.clone())
            .unwrap_or_else(|| site.callee_usr.clone());
        CallSiteInfo {
            caller,
            target,
            caller_usr: site.caller_usr.clone(),
            callee_usr: site.callee_usr.clone(),
            file: site.file.clone(),
            line: site.line,
            column: site.column,
            context: read_context(Path::new(&site.file), site.line),
        }
    }

    /// All shortest call paths from `from` to `to`, bounded by `max_depth`.
    ///
    /// BFS layers guarantee minimal length; ties are reported in
    /// lexicographic USR order. A path never revisits a node.
    pub fn get_call_path(
        &self,
        from: &str,
        to: &str,
        max_depth: usize,
    ) -> QueryResult<Vec<CallPath>> {
        let sources = self.function_usrs(from)?;
        let targets: HashSet<String> = self.function_usrs(to)?.into_iter().collect();
        if sources.is_empty() || targets.is_empty() {
            return Ok(Vec::new());
        }
        let depth_cap = max_depth.min(self.config.max_depth);

        // Adjacency from resolved call sites only: dangling edges never
        // appear in paths.
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for site in self.indexes.iter_resolved_call_sites() {
            let nexts = adjacency.entry(&site.caller_usr).or_default();
            if !nexts.contains(&site.callee_usr.as_str()) {
                nexts.push(&site.callee_usr);
            }
        }
        for nexts in adjacency.values_mut() {
            nexts.sort();
        }

        let mut paths = Vec::new();
        for source in &sources {
            if targets.contains(source) {
                paths.push(vec![source.clone()]);
            }
        }
        if paths.is_empty() && depth_cap > 0 {
            paths = shortest_paths(&adjacency, &sources, &targets, depth_cap);
        }

        paths.sort();
        paths.dedup();
        Ok(paths
            .into_iter()
            .map(|usrs| {
                let names = usrs
                    .iter()
                    .map(|usr| {
                        self.indexes
                            .get_by_usr(usr)
                            .map(|s| s.qualified_name.clone())
                            .unwrap_or_else(|| usr.clone())
                    })
                    .collect();
                CallPath { usrs, names }
            })
            .collect())
    }

    pub fn get_call_statistics(&self) -> CallStatistics {
        let mut per_caller: HashMap<&str, u64> = HashMap::new();
        let mut per_callee: HashMap<&str, u64> = HashMap::new();
        let mut edges: HashSet<(&str, &str)> = HashSet::new();
        let mut total = 0u64;
        for site in self.indexes.iter_resolved_call_sites() {
            total += 1;
            *per_caller.entry(&site.caller_usr).or_default() += 1;
            *per_callee.entry(&site.callee_usr).or_default() += 1;
            edges.insert((&site.caller_usr, &site.callee_usr));
        }

        let name_of = |usr: &str| {
            self.indexes
                .get_by_usr(usr)
                .map(|s| s.qualified_name.clone())
                .unwrap_or_else(|| usr.to_string())
        };
        let top = |map: HashMap<&str, u64>| {
            let mut entries: Vec<(String, u64)> =
                map.into_iter().map(|(usr, n)| (name_of(usr), n)).collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            entries.truncate(10);
            entries
        };

        CallStatistics {
            total_call_sites: total,
            distinct_edges: edges.len() as u64,
            top_callers: top(per_caller),
            top_callees: top(per_callee),
        }
    }

    // ---- files ----------------------------------------------------------

    /// Regex scan over the symbols of one file.
    pub fn find_in_file(&self, file: &str, pattern: &str) -> QueryResult<Vec<Symbol>> {
        let regex = match compile_policy(pattern)? {
            MatchPolicy::Pattern(regex) => regex,
            MatchPolicy::Identifier(name) => {
                return Ok(self
                    .indexes
                    .symbols_in_file(file)
                    .into_iter()
                    .filter(|s| s.name == name || s.qualified_name == name)
                    .cloned()
                    .collect());
            }
        };
        Ok(self
            .indexes
            .symbols_in_file(file)
            .into_iter()
            .filter(|s| regex.is_match(&s.name) || regex.is_match(&s.qualified_name))
            .cloned()
            .collect())
    }

    /// Union of: defining files, declaring headers, and files with call
    /// sites targeting the symbol. Absolute, deduplicated, sorted.
    pub fn get_files_containing_symbol(
        &self,
        name: &str,
        kind_filter: Option<SymbolKind>,
        project_only: bool,
    ) -> QueryResult<Vec<String>> {
        let mut symbols = self.search_symbols(name, kind_filter, project_only)?;
        if symbols.is_empty() {
            // Call sites can reference symbols by name even when filters
            // exclude them; resolve unfiltered for the edge lookup.
            symbols = self.search_symbols(name, None, false)?;
        }

        let mut files: HashSet<String> = HashSet::new();
        for symbol in &symbols {
            files.insert(symbol.file.clone());
            if let Some(header) = &symbol.header_file {
                files.insert(header.clone());
            }
            for site in self.indexes.resolved_calls_to(&symbol.usr) {
                files.insert(site.file.clone());
            }
        }
        let mut files: Vec<String> = files.into_iter().collect();
        files.sort();
        Ok(files)
    }

    /// Deferred feature: explicit `@see`/`@ref` cross-references are not
    /// extracted in this version.
    pub fn get_cross_references(&self, _name: &str) -> CrossReferences {
        CrossReferences {
            references: Vec::new(),
            note: "cross-reference extraction is deprecated and returns no results".to_string(),
        }
    }

    fn function_usrs(&self, name: &str) -> QueryResult<Vec<String>> {
        let mut usrs: Vec<String> = self
            .search_kind(name, false, SymbolKind::is_function_like)?
            .into_iter()
            .map(|s| s.usr)
            .collect();
        usrs.sort();
        usrs.dedup();
        Ok(usrs)
    }
}

/// All shortest paths from any source to any target within `depth_cap`.
fn shortest_paths(
    adjacency: &HashMap<&str, Vec<&str>>,
    sources: &[String],
    targets: &HashSet<String>,
    depth_cap: usize,
) -> Vec<Vec<String>> {
    // Multi-source BFS recording every minimal-depth parent.
    let mut depth: HashMap<String, usize> = HashMap::new();
    let mut parents: HashMap<String, Vec<String>> = HashMap::new();
    let mut queue = VecDeque::new();
    for source in sources {
        if depth.insert(source.clone(), 0).is_none() {
            queue.push_back(source.clone());
        }
    }

    let mut found_depth: Option<usize> = None;
    while let Some(node) = queue.pop_front() {
        let d = depth[&node];
        if let Some(found) = found_depth {
            if d >= found {
                continue;
            }
        }
        if d >= depth_cap {
            continue;
        }
        let Some(nexts) = adjacency.get(node.as_str()) else {
            continue;
        };
        for next in nexts {
            let next_depth = d + 1;
            match depth.get(*next) {
                None => {
                    depth.insert(next.to_string(), next_depth);
                    parents.insert(next.to_string(), vec![node.clone()]);
                    if targets.contains(*next) {
                        found_depth = Some(next_depth);
                    }
                    queue.push_back(next.to_string());
                }
                Some(&existing) if existing == next_depth => {
                    parents.entry(next.to_string()).or_default().push(node.clone());
                }
                Some(_) => {}
            }
        }
    }

    let Some(found) = found_depth else {
        return Vec::new();
    };
    let mut paths = Vec::new();
    for target in targets {
        if depth.get(target) == Some(&found) {
            let mut suffix = vec![target.clone()];
            collect_paths(target, &parents, &mut suffix, &mut paths);
        }
    }
    paths
}

fn collect_paths(
    node: &str,
    parents: &HashMap<String, Vec<String>>,
    suffix: &mut Vec<String>,
    out: &mut Vec<Vec<String>>,
) {
    match parents.get(node) {
        None => {
            // Reached a source.
            let mut path = suffix.clone();
            path.reverse();
            out.push(path);
        }
        Some(preds) => {
            for pred in preds {
                suffix.push(pred.clone());
                collect_paths(pred, parents, suffix, out);
                suffix.pop();
            }
        }
    }
}

fn dedup_by_usr(symbols: Vec<Symbol>) -> Vec<Symbol> {
    let mut seen = HashSet::new();
    symbols
        .into_iter()
        .filter(|s| seen.insert(s.usr.clone()))
        .collect()
}

fn sort_symbols(symbols: &mut [Symbol]) {
    symbols.sort_by(|a, b| {
        (&a.qualified_name, &a.file, a.start_line).cmp(&(&b.qualified_name, &b.file, b.start_line))
    });
}

fn sort_call_sites(sites: &mut [CallSiteInfo]) {
    sites.sort_by(|a, b| (&a.file, a.line, a.column).cmp(&(&b.file, b.line, b.column)));
}

/// Parameter type list from a function type spelling like
/// `void (const Real &, int)`. Splits on top-level commas only.
pub fn param_types_from_signature(signature: Option<&str>) -> Vec<String> {
    let Some(signature) = signature else {
        return Vec::new();
    };
    let Some(open) = signature.find('(') else {
        return Vec::new();
    };
    let Some(close) = signature.rfind(')') else {
        return Vec::new();
    };
    if close <= open + 1 {
        return Vec::new();
    }
    let inner = &signature[open + 1..close];

    let mut params = Vec::new();
    let mut current = String::new();
    let mut angle = 0i32;
    let mut paren = 0i32;
    for c in inner.chars() {
        match c {
            '<' => angle += 1,
            '>' => angle -= 1,
            '(' => paren += 1,
            ')' => paren -= 1,
            ',' if angle == 0 && paren == 0 => {
                let p = current.trim().to_string();
                if !p.is_empty() {
                    params.push(p);
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    let p = current.trim().to_string();
    if !p.is_empty() && p != "void" {
        params.push(p);
    }
    params
}

/// Strip cv-qualifiers, references, and pointers down to the bare type name.
pub fn strip_type_decorations(ty: &str) -> String {
    ty.replace(['&', '*'], " ")
        .split_whitespace()
        .filter(|word| !matches!(*word, "const" | "volatile" | "struct" | "class"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Read ±2 lines of context around `line` (1-based) from `file`.
fn read_context(file: &Path, line: u32) -> Option<String> {
    let text = std::fs::read_to_string(file).ok()?;
    let lines: Vec<&str> = text.lines().collect();
    let target = line.checked_sub(1)? as usize;
    if target >= lines.len() {
        return None;
    }
    let start = target.saturating_sub(2);
    let end = (target + 3).min(lines.len());
    Some(lines[start..end].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{AliasKind, CallSite, TypeAlias};

    fn config() -> QueryConfig {
        QueryConfig::default()
    }

    fn def(usr: &str, name: &str, kind: SymbolKind, file: &str, line: u32) -> Symbol {
        let mut s = Symbol::new(usr, name, kind, file, line, 1);
        s.end_line = line + 3;
        s.is_definition = true;
        s
    }

    fn call(caller: &str, callee: &str, file: &str, line: u32, column: u32) -> CallSite {
        CallSite {
            caller_usr: caller.into(),
            callee_usr: callee.into(),
            file: file.into(),
            line,
            column,
        }
    }

    fn alias(name: &str, target: &str, canonical: &str) -> TypeAlias {
        TypeAlias {
            alias_name: name.into(),
            qualified_name: name.into(),
            target_type: target.into(),
            canonical_type: canonical.into(),
            namespace: String::new(),
            alias_kind: AliasKind::Using,
            is_template_alias: false,
            file: "/p/alias.h".into(),
            line: 1,
            column: 1,
        }
    }

    #[test]
    fn identifier_vs_regex_policy() {
        assert!(is_plain_identifier("WidgetManager"));
        assert!(is_plain_identifier("_internal"));
        assert!(!is_plain_identifier(".*Mgr$"));
        assert!(!is_plain_identifier("ns::Name"));
        assert!(!is_plain_identifier(""));
        assert!(!is_plain_identifier("9lives"));
    }

    #[test]
    fn invalid_regex_is_query_error() {
        let indexes = SymbolIndexes::new();
        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);
        let err = engine.search_classes("[unclosed", false, None).unwrap_err();
        assert!(matches!(err, QueryError::InvalidPattern { .. }));
    }

    #[test]
    fn regex_dot_matches_all_and_anchored_empty_matches_none() {
        let mut indexes = SymbolIndexes::new();
        indexes.insert_symbol(def("c:@S@A", "A", SymbolKind::Class, "/p/a.h", 1));
        indexes.insert_symbol(def("c:@S@B", "B", SymbolKind::Class, "/p/b.h", 1));
        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);

        assert_eq!(engine.search_classes(".", false, None).unwrap().len(), 2);
        assert!(engine.search_classes("^$", false, None).unwrap().is_empty());
    }

    #[test]
    fn unknown_symbol_is_empty_not_error() {
        let indexes = SymbolIndexes::new();
        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);
        assert!(engine.search_classes("Nope", false, None).unwrap().is_empty());
        assert!(engine.find_callers("nope").unwrap().is_empty());
        assert!(engine.get_class_info("Nope").unwrap().is_none());
    }

    #[test]
    fn template_family_aggregates() {
        let mut indexes = SymbolIndexes::new();
        let mut primary = def("c:@ST>1#T@Vec", "Vec", SymbolKind::ClassTemplate, "/p/v.h", 1);
        primary.is_template = true;
        indexes.insert_symbol(primary);
        let mut full = def("c:@S@Vec>#I", "Vec", SymbolKind::Class, "/p/v.h", 10);
        full.primary_template_usr = Some("c:@ST>1#T@Vec".into());
        full.template_kind = crate::symbol::TemplateKind::FullSpecialization;
        indexes.insert_symbol(full);
        let mut partial = def(
            "c:@SP>1#T@Vec>#t0.0#*",
            "Vec",
            SymbolKind::PartialSpecialization,
            "/p/v.h",
            20,
        );
        partial.primary_template_usr = Some("c:@ST>1#T@Vec".into());
        indexes.insert_symbol(partial);

        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);
        let family = engine.search_classes("Vec", false, None).unwrap();
        assert_eq!(family.len(), 3);
    }

    #[test]
    fn alias_expansion_matches_all_variants() {
        let mut indexes = SymbolIndexes::new();
        indexes.insert_alias(alias("A", "Real", "Real"));
        indexes.insert_alias(alias("B", "A", "Real"));

        let mut f_a = def("c:@F@fA#", "fA", SymbolKind::Function, "/p/f.cpp", 1);
        f_a.signature = Some("void (A)".into());
        let mut f_b = def("c:@F@fB#", "fB", SymbolKind::Function, "/p/f.cpp", 5);
        f_b.signature = Some("void (B)".into());
        let mut f_r = def("c:@F@fR#", "fR", SymbolKind::Function, "/p/f.cpp", 9);
        f_r.signature = Some("void (Real)".into());
        let mut f_x = def("c:@F@fX#", "fX", SymbolKind::Function, "/p/f.cpp", 13);
        f_x.signature = Some("void (int)".into());
        for f in [f_a, f_b, f_r, f_x] {
            indexes.insert_symbol(f);
        }

        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);
        let hits = engine
            .search_functions(".*", None, Some("Real"), false)
            .unwrap();
        let names: Vec<&str> = hits.iter().map(|m| m.symbol.name.as_str()).collect();
        assert_eq!(names, vec!["fA", "fB", "fR"]);
        for hit in &hits {
            assert_eq!(
                hit.param_types_canonical.as_deref(),
                Some(&["Real".to_string()][..])
            );
        }
    }

    #[test]
    fn callers_ordered_with_distinct_locations() {
        let mut indexes = SymbolIndexes::new();
        indexes.insert_symbol(def("c:@F@f#", "f", SymbolKind::Function, "/p/a.cpp", 1));
        indexes.insert_symbol(def("c:@F@v#", "v", SymbolKind::Function, "/p/b.cpp", 1));
        indexes.insert_call_site(call("c:@F@f#", "c:@F@v#", "/p/a.cpp", 3, 5));
        indexes.insert_call_site(call("c:@F@f#", "c:@F@v#", "/p/a.cpp", 2, 9));

        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);
        let callers = engine.find_callers("v").unwrap();
        assert_eq!(callers.len(), 2);
        assert_eq!((callers[0].line, callers[0].column), (2, 9));
        assert_eq!((callers[1].line, callers[1].column), (3, 5));
        assert!(callers.iter().all(|c| c.caller == "f"));
    }

    #[test]
    fn call_path_zero_depth_only_self() {
        let mut indexes = SymbolIndexes::new();
        indexes.insert_symbol(def("c:@F@a#", "a", SymbolKind::Function, "/p/a.cpp", 1));
        indexes.insert_symbol(def("c:@F@b#", "b", SymbolKind::Function, "/p/b.cpp", 1));
        indexes.insert_call_site(call("c:@F@a#", "c:@F@b#", "/p/a.cpp", 2, 1));

        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);
        let self_path = engine.get_call_path("a", "a", 0).unwrap();
        assert_eq!(self_path.len(), 1);
        assert_eq!(self_path[0].usrs, vec!["c:@F@a#".to_string()]);
        assert!(engine.get_call_path("a", "b", 0).unwrap().is_empty());
    }

    #[test]
    fn call_path_finds_all_shortest_paths() {
        let mut indexes = SymbolIndexes::new();
        for (usr, name) in [
            ("c:@F@a#", "a"),
            ("c:@F@b#", "b"),
            ("c:@F@c#", "c"),
            ("c:@F@d#", "d"),
        ] {
            indexes.insert_symbol(def(usr, name, SymbolKind::Function, "/p/x.cpp", 1));
        }
        // a -> b -> d and a -> c -> d, both length 2; plus a longer detour.
        indexes.insert_call_site(call("c:@F@a#", "c:@F@b#", "/p/x.cpp", 1, 1));
        indexes.insert_call_site(call("c:@F@a#", "c:@F@c#", "/p/x.cpp", 2, 1));
        indexes.insert_call_site(call("c:@F@b#", "c:@F@d#", "/p/x.cpp", 3, 1));
        indexes.insert_call_site(call("c:@F@c#", "c:@F@d#", "/p/x.cpp", 4, 1));
        indexes.insert_call_site(call("c:@F@b#", "c:@F@c#", "/p/x.cpp", 5, 1));

        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);
        let paths = engine.get_call_path("a", "d", 5).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].usrs, vec!["c:@F@a#", "c:@F@b#", "c:@F@d#"]);
        assert_eq!(paths[1].usrs, vec!["c:@F@a#", "c:@F@c#", "c:@F@d#"]);
    }

    #[test]
    fn call_path_cycles_terminate() {
        let mut indexes = SymbolIndexes::new();
        for (usr, name) in [("c:@F@a#", "a"), ("c:@F@b#", "b")] {
            indexes.insert_symbol(def(usr, name, SymbolKind::Function, "/p/x.cpp", 1));
        }
        indexes.insert_call_site(call("c:@F@a#", "c:@F@b#", "/p/x.cpp", 1, 1));
        indexes.insert_call_site(call("c:@F@b#", "c:@F@a#", "/p/x.cpp", 2, 1));

        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);
        let paths = engine.get_call_path("a", "b", 10).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(engine.get_call_path("a", "missing", 10).unwrap().is_empty());
    }

    #[test]
    fn class_info_collects_methods_and_hierarchy() {
        let mut indexes = SymbolIndexes::new();
        indexes.insert_symbol(def("c:@S@Base", "Base", SymbolKind::Class, "/p/base.h", 1));
        let mut mid = def("c:@S@Mid", "Mid", SymbolKind::Class, "/p/mid.h", 1);
        mid.base_classes = vec!["Base".into()];
        indexes.insert_symbol(mid);
        let mut leaf = def("c:@S@Leaf", "Leaf", SymbolKind::Class, "/p/leaf.h", 1);
        leaf.base_classes = vec!["Mid".into()];
        indexes.insert_symbol(leaf);
        let mut method = def("c:@S@Mid@F@go#", "go", SymbolKind::Method, "/p/mid.h", 2);
        method.parent_class = "Mid".into();
        indexes.insert_symbol(method);

        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);
        let info = engine.get_class_info("Mid").unwrap().unwrap();
        assert_eq!(info.methods.len(), 1);
        assert_eq!(info.methods[0].name, "go");
        assert_eq!(info.base_classes.len(), 1);
        assert_eq!(info.base_classes[0].name, "Base");
        assert_eq!(info.derived_classes.len(), 1);
        assert_eq!(info.derived_classes[0].name, "Leaf");

        let hierarchy = engine.get_class_hierarchy("Leaf").unwrap().unwrap();
        assert_eq!(hierarchy.bases[0].name, "Mid");
        assert_eq!(hierarchy.bases[0].children[0].name, "Base");
    }

    #[test]
    fn files_containing_symbol_union() {
        let mut indexes = SymbolIndexes::new();
        let mut widget = def("c:@S@W", "W", SymbolKind::Class, "/p/w.cpp", 1);
        widget.header_file = Some("/p/w.h".into());
        indexes.insert_symbol(widget);
        indexes.insert_symbol(def("c:@F@make#", "make", SymbolKind::Function, "/p/make.cpp", 1));
        indexes.insert_call_site(call("c:@F@make#", "c:@S@W", "/p/make.cpp", 2, 1));

        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);
        let files = engine.get_files_containing_symbol("W", None, false).unwrap();
        assert_eq!(
            files,
            vec![
                "/p/make.cpp".to_string(),
                "/p/w.cpp".to_string(),
                "/p/w.h".to_string()
            ]
        );
    }

    #[test]
    fn signature_param_parsing() {
        assert_eq!(
            param_types_from_signature(Some("void (const Real &, int)")),
            vec!["const Real &", "int"]
        );
        assert_eq!(
            param_types_from_signature(Some("void (std::map<int, float>, T)")),
            vec!["std::map<int, float>", "T"]
        );
        assert!(param_types_from_signature(Some("void ()")).is_empty());
        assert!(param_types_from_signature(None).is_empty());
    }

    #[test]
    fn type_decoration_stripping() {
        assert_eq!(strip_type_decorations("const Real &"), "Real");
        assert_eq!(strip_type_decorations("Real *"), "Real");
        assert_eq!(strip_type_decorations("const struct Real"), "Real");
        assert_eq!(strip_type_decorations("std::vector<int>"), "std::vector<int>");
    }

    #[test]
    fn cross_references_deprecated() {
        let indexes = SymbolIndexes::new();
        let cfg = config();
        let engine = QueryEngine::new(&indexes, None, &cfg);
        let refs = engine.get_cross_references("anything");
        assert!(refs.references.is_empty());
        assert!(refs.note.contains("deprecated"));
    }

    #[test]
    fn result_ceiling_caps_regex_scans() {
        let mut indexes = SymbolIndexes::new();
        for i in 0..50 {
            indexes.insert_symbol(def(
                &format!("c:@S@K{i}"),
                &format!("K{i}"),
                SymbolKind::Class,
                "/p/k.h",
                i + 1,
            ));
        }
        let mut cfg = config();
        cfg.max_results = 10;
        let engine = QueryEngine::new(&indexes, None, &cfg);
        let hits = engine.search_classes("K.*", false, None).unwrap();
        assert_eq!(hits.len(), 10);
    }
}
