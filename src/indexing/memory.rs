//! In-memory indexes over the extracted symbols.
//!
//! Symbols live in a flat arena and reference each other by USR, never by
//! pointer; every map stores arena offsets. Traversals use explicit visited
//! sets, so forward-declaration loops and specialization chains cannot hang
//! a query.

use std::collections::HashMap;

use crate::symbol::{CallSite, Symbol, TypeAlias};

/// The coordinator-owned in-memory view of the project.
#[derive(Default)]
pub struct SymbolIndexes {
    arena: Vec<Option<Symbol>>,
    by_usr: HashMap<String, usize>,
    classes_by_name: HashMap<String, Vec<usize>>,
    functions_by_name: HashMap<String, Vec<usize>>,
    by_qualified: HashMap<String, Vec<usize>>,
    by_file: HashMap<String, Vec<usize>>,
    methods_by_class: HashMap<String, Vec<usize>>,
    /// base class name -> qualified names of classes deriving from it.
    derived_by_base: HashMap<String, Vec<String>>,
    /// primary template USR -> specialization arena offsets.
    specializations_by_primary: HashMap<String, Vec<usize>>,

    call_sites: Vec<CallSite>,
    calls_out: HashMap<String, Vec<usize>>,
    calls_in: HashMap<String, Vec<usize>>,

    aliases: Vec<TypeAlias>,
    alias_to_canonical: HashMap<String, String>,
    canonical_to_aliases: HashMap<String, Vec<String>>,
}

impl SymbolIndexes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol_count(&self) -> usize {
        self.by_usr.len()
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    pub fn call_site_count(&self) -> usize {
        self.call_sites.len()
    }

    pub fn get_by_usr(&self, usr: &str) -> Option<&Symbol> {
        self.by_usr
            .get(usr)
            .and_then(|&idx| self.arena[idx].as_ref())
    }

    pub fn iter_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.arena.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn iter_aliases(&self) -> impl Iterator<Item = &TypeAlias> {
        self.aliases.iter()
    }

    /// Insert one symbol, merging by USR with the definition-wins rule.
    ///
    /// The merge is commutative and associative over sightings of the same
    /// USR, so the final state does not depend on worker completion order.
    pub fn insert_symbol(&mut self, incoming: Symbol) {
        if let Some(&idx) = self.by_usr.get(&incoming.usr) {
            let existing = self.arena[idx]
                .take()
                .expect("by_usr points at a live arena slot");
            self.unlink(idx, &existing);
            let merged = merge_symbols(existing, incoming);
            self.arena[idx] = Some(merged);
            self.link(idx);
            return;
        }

        let idx = self.arena.len();
        self.arena.push(Some(incoming));
        self.link(idx);
    }

    fn link(&mut self, idx: usize) {
        let symbol = self.arena[idx].as_ref().expect("linking a live slot");
        self.by_usr.insert(symbol.usr.clone(), idx);
        if symbol.kind.is_class_like() {
            self.classes_by_name
                .entry(symbol.name.clone())
                .or_default()
                .push(idx);
        }
        if symbol.kind.is_function_like() {
            self.functions_by_name
                .entry(symbol.name.clone())
                .or_default()
                .push(idx);
        }
        self.by_qualified
            .entry(symbol.qualified_name.clone())
            .or_default()
            .push(idx);
        self.by_file
            .entry(symbol.file.clone())
            .or_default()
            .push(idx);
        if !symbol.parent_class.is_empty() {
            self.methods_by_class
                .entry(symbol.parent_class.clone())
                .or_default()
                .push(idx);
        }
        for base in &symbol.base_classes {
            let derived = self.derived_by_base.entry(base.clone()).or_default();
            if !derived.contains(&symbol.qualified_name) {
                derived.push(symbol.qualified_name.clone());
                derived.sort();
            }
        }
        if let Some(primary) = &symbol.primary_template_usr {
            if !primary.is_empty() {
                self.specializations_by_primary
                    .entry(primary.clone())
                    .or_default()
                    .push(idx);
            }
        }
    }

    fn unlink(&mut self, idx: usize, symbol: &Symbol) {
        self.by_usr.remove(&symbol.usr);
        remove_idx(&mut self.classes_by_name, &symbol.name, idx);
        remove_idx(&mut self.functions_by_name, &symbol.name, idx);
        remove_idx(&mut self.by_qualified, &symbol.qualified_name, idx);
        remove_idx(&mut self.by_file, &symbol.file, idx);
        if !symbol.parent_class.is_empty() {
            remove_idx(&mut self.methods_by_class, &symbol.parent_class, idx);
        }
        for base in &symbol.base_classes {
            if let Some(derived) = self.derived_by_base.get_mut(base) {
                derived.retain(|d| d != &symbol.qualified_name);
                if derived.is_empty() {
                    self.derived_by_base.remove(base);
                }
            }
        }
        if let Some(primary) = &symbol.primary_template_usr {
            remove_idx(&mut self.specializations_by_primary, primary, idx);
        }
    }

    pub fn insert_call_site(&mut self, site: CallSite) {
        // One edge per (caller, callee, location).
        let duplicate = self
            .calls_out
            .get(&site.caller_usr)
            .is_some_and(|idxs| idxs.iter().any(|&i| self.call_sites[i] == site));
        if duplicate {
            return;
        }
        let idx = self.call_sites.len();
        self.calls_out
            .entry(site.caller_usr.clone())
            .or_default()
            .push(idx);
        self.calls_in
            .entry(site.callee_usr.clone())
            .or_default()
            .push(idx);
        if let Some(&callee_idx) = self.by_usr.get(&site.callee_usr) {
            if let Some(callee) = self.arena[callee_idx].as_mut() {
                if !callee.called_by.contains(&site.caller_usr) {
                    callee.called_by.push(site.caller_usr.clone());
                }
            }
        }
        self.call_sites.push(site);
    }

    pub fn insert_alias(&mut self, alias: TypeAlias) {
        self.alias_to_canonical
            .insert(alias.alias_name.clone(), alias.canonical_type.clone());
        if alias.qualified_name != alias.alias_name {
            self.alias_to_canonical
                .insert(alias.qualified_name.clone(), alias.canonical_type.clone());
        }
        let names = self
            .canonical_to_aliases
            .entry(alias.canonical_type.clone())
            .or_default();
        if !names.contains(&alias.alias_name) {
            names.push(alias.alias_name.clone());
            names.sort();
        }
        self.aliases.push(alias);
    }

    /// Drop everything owned by one file before re-inserting its new state.
    pub fn remove_file(&mut self, file: &str) {
        let idxs: Vec<usize> = self.by_file.get(file).cloned().unwrap_or_default();
        for idx in idxs {
            if let Some(symbol) = self.arena[idx].take() {
                self.unlink(idx, &symbol);
            }
        }

        // Call sites are owned by the file their source coordinates live in.
        let keep: Vec<CallSite> = self
            .call_sites
            .iter()
            .filter(|s| s.file != file)
            .cloned()
            .collect();
        self.call_sites.clear();
        self.calls_out.clear();
        self.calls_in.clear();
        for site in keep {
            self.insert_call_site(site);
        }

        let keep: Vec<TypeAlias> = self
            .aliases
            .iter()
            .filter(|a| a.file != file)
            .cloned()
            .collect();
        self.aliases.clear();
        self.alias_to_canonical.clear();
        self.canonical_to_aliases.clear();
        for alias in keep {
            self.insert_alias(alias);
        }
    }

    // ---- query-side accessors ------------------------------------------

    pub fn classes_named(&self, name: &str) -> Vec<&Symbol> {
        self.collect(self.classes_by_name.get(name))
    }

    pub fn functions_named(&self, name: &str) -> Vec<&Symbol> {
        self.collect(self.functions_by_name.get(name))
    }

    pub fn symbols_with_qualified_name(&self, qualified: &str) -> Vec<&Symbol> {
        self.collect(self.by_qualified.get(qualified))
    }

    pub fn symbols_in_file(&self, file: &str) -> Vec<&Symbol> {
        let mut out = self.collect(self.by_file.get(file));
        out.sort_by_key(|s| (s.start_line, s.column));
        out
    }

    pub fn methods_of_class(&self, qualified_class: &str) -> Vec<&Symbol> {
        let mut out = self.collect(self.methods_by_class.get(qualified_class));
        out.sort_by(|a, b| (&a.file, a.start_line).cmp(&(&b.file, b.start_line)));
        out
    }

    pub fn derived_of(&self, class_name: &str) -> &[String] {
        self.derived_by_base
            .get(class_name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn specializations_of(&self, primary_usr: &str) -> Vec<&Symbol> {
        self.collect(self.specializations_by_primary.get(primary_usr))
    }

    /// Outgoing call sites with both endpoints present in the symbol set.
    pub fn resolved_calls_from(&self, caller_usr: &str) -> Vec<&CallSite> {
        self.resolved_sites(self.calls_out.get(caller_usr))
    }

    /// Incoming call sites with both endpoints present in the symbol set.
    pub fn resolved_calls_to(&self, callee_usr: &str) -> Vec<&CallSite> {
        self.resolved_sites(self.calls_in.get(callee_usr))
    }

    pub fn iter_resolved_call_sites(&self) -> impl Iterator<Item = &CallSite> {
        self.call_sites
            .iter()
            .filter(|s| self.by_usr.contains_key(&s.caller_usr) && self.by_usr.contains_key(&s.callee_usr))
    }

    pub fn canonical_for_alias(&self, name: &str) -> Option<&str> {
        self.alias_to_canonical.get(name).map(String::as_str)
    }

    pub fn aliases_for_canonical(&self, canonical: &str) -> &[String] {
        self.canonical_to_aliases
            .get(canonical)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn collect(&self, idxs: Option<&Vec<usize>>) -> Vec<&Symbol> {
        idxs.map(|idxs| {
            idxs.iter()
                .filter_map(|&i| self.arena[i].as_ref())
                .collect()
        })
        .unwrap_or_default()
    }

    fn resolved_sites(&self, idxs: Option<&Vec<usize>>) -> Vec<&CallSite> {
        let mut out: Vec<&CallSite> = idxs
            .map(|idxs| {
                idxs.iter()
                    .map(|&i| &self.call_sites[i])
                    .filter(|s| {
                        self.by_usr.contains_key(&s.caller_usr)
                            && self.by_usr.contains_key(&s.callee_usr)
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| (&a.file, a.line, a.column).cmp(&(&b.file, b.line, b.column)));
        out
    }
}

fn remove_idx(map: &mut HashMap<String, Vec<usize>>, key: &str, idx: usize) {
    if let Some(v) = map.get_mut(key) {
        v.retain(|&i| i != idx);
        if v.is_empty() {
            map.remove(key);
        }
    }
}

/// A candidate declaration location for the `header_*` fields.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeaderLoc {
    file: String,
    line: u32,
    start_line: u32,
    end_line: u32,
}

fn header_loc_of(symbol: &Symbol) -> Option<HeaderLoc> {
    match (&symbol.header_file, symbol.header_line) {
        (Some(file), Some(line)) => Some(HeaderLoc {
            file: file.clone(),
            line,
            start_line: symbol.header_start_line.unwrap_or(line),
            end_line: symbol.header_end_line.unwrap_or(line),
        }),
        _ => None,
    }
}

/// Definition-wins merge of two sightings of the same USR.
///
/// The resolved location comes from the extremal sighting: definition over
/// declaration, then larger span, then location order. The `header_*`
/// fields hold the least declaration location ever seen; definitions never
/// contribute one. Both rules are minima over the sighting set, so the
/// result is independent of arrival order.
pub fn merge_symbols(a: Symbol, b: Symbol) -> Symbol {
    debug_assert_eq!(a.usr, b.usr);
    let (mut winner, loser) = pick_winner(a, b);

    let mut candidates: Vec<HeaderLoc> = Vec::new();
    candidates.extend(header_loc_of(&winner));
    candidates.extend(header_loc_of(&loser));
    if !loser.is_definition {
        candidates.push(HeaderLoc {
            file: loser.file.clone(),
            line: loser.line,
            start_line: loser.start_line,
            end_line: loser.end_line,
        });
    }
    candidates.retain(|c| c.file != winner.file || c.start_line != winner.start_line);
    if let Some(best) = candidates.into_iter().min() {
        winner.header_file = Some(best.file);
        winner.header_line = Some(best.line);
        winner.header_start_line = Some(best.start_line);
        winner.header_end_line = Some(best.end_line);
    }

    if winner.brief.is_none() {
        winner.brief = loser.brief;
    }
    if winner.doc_comment.is_none() {
        winner.doc_comment = loser.doc_comment;
    }
    if winner.signature.is_none() {
        winner.signature = loser.signature;
    }
    if winner.base_classes.is_empty() {
        winner.base_classes = loser.base_classes;
    }
    if winner.template_parameters.is_empty() {
        winner.template_parameters = loser.template_parameters;
    }
    if winner.primary_template_usr.is_none() {
        winner.primary_template_usr = loser.primary_template_usr;
    }
    for call in loser.calls {
        if !winner.calls.contains(&call) {
            winner.calls.push(call);
        }
    }
    for caller in loser.called_by {
        if !winner.called_by.contains(&caller) {
            winner.called_by.push(caller);
        }
    }
    winner.is_project = winner.is_project || loser.is_project;
    winner
}

fn pick_winner(a: Symbol, b: Symbol) -> (Symbol, Symbol) {
    match (a.is_definition, b.is_definition) {
        (true, false) => (a, b),
        (false, true) => (b, a),
        _ => {
            let a_key = (std::cmp::Reverse(a.span()), a.file.clone(), a.start_line, a.column);
            let b_key = (std::cmp::Reverse(b.span()), b.file.clone(), b.start_line, b.column);
            if a_key <= b_key { (a, b) } else { (b, a) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolKind;

    fn decl(usr: &str, name: &str, file: &str, line: u32) -> Symbol {
        Symbol::new(usr, name, SymbolKind::Class, file, line, 1)
    }

    fn def(usr: &str, name: &str, file: &str, start: u32, end: u32) -> Symbol {
        let mut s = Symbol::new(usr, name, SymbolKind::Class, file, start, 1);
        s.end_line = end;
        s.is_definition = true;
        s
    }

    #[test]
    fn definition_wins_over_declaration() {
        let mut idx = SymbolIndexes::new();
        idx.insert_symbol(decl("c:@S@Foo", "Foo", "/p/fwd.h", 1));
        idx.insert_symbol(def("c:@S@Foo", "Foo", "/p/foo.h", 1, 3));

        assert_eq!(idx.symbol_count(), 1);
        let foo = idx.get_by_usr("c:@S@Foo").unwrap();
        assert_eq!(foo.file, "/p/foo.h");
        assert_eq!(foo.end_line, 3);
        assert_eq!(foo.header_file.as_deref(), Some("/p/fwd.h"));
        assert_eq!(foo.header_line, Some(1));
    }

    #[test]
    fn merge_is_order_independent() {
        let mut a_first = SymbolIndexes::new();
        a_first.insert_symbol(decl("c:@S@Foo", "Foo", "/p/fwd.h", 1));
        a_first.insert_symbol(def("c:@S@Foo", "Foo", "/p/foo.h", 1, 3));

        let mut b_first = SymbolIndexes::new();
        b_first.insert_symbol(def("c:@S@Foo", "Foo", "/p/foo.h", 1, 3));
        b_first.insert_symbol(decl("c:@S@Foo", "Foo", "/p/fwd.h", 1));

        assert_eq!(
            a_first.get_by_usr("c:@S@Foo").unwrap(),
            b_first.get_by_usr("c:@S@Foo").unwrap()
        );
    }

    #[test]
    fn merge_keeps_docs_from_either_side() {
        let mut declared = decl("c:@F@run#", "run", "/p/run.h", 2);
        declared.brief = Some("Runs the thing.".into());
        let defined = def("c:@F@run#", "run", "/p/run.cpp", 10, 20);

        let mut idx = SymbolIndexes::new();
        idx.insert_symbol(declared);
        idx.insert_symbol(defined);
        let merged = idx.get_by_usr("c:@F@run#").unwrap();
        assert_eq!(merged.file, "/p/run.cpp");
        assert_eq!(merged.brief.as_deref(), Some("Runs the thing."));
    }

    #[test]
    fn dangling_edges_filtered_until_resolved() {
        let mut idx = SymbolIndexes::new();
        idx.insert_symbol(def("c:@F@caller#", "caller", "/p/a.cpp", 1, 5));
        idx.insert_call_site(CallSite {
            caller_usr: "c:@F@caller#".into(),
            callee_usr: "c:@F@callee#".into(),
            file: "/p/a.cpp".into(),
            line: 2,
            column: 3,
        });

        assert!(idx.resolved_calls_from("c:@F@caller#").is_empty());

        idx.insert_symbol(def("c:@F@callee#", "callee", "/p/b.cpp", 1, 4));
        let calls = idx.resolved_calls_from("c:@F@caller#");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].callee_usr, "c:@F@callee#");
        assert_eq!(idx.resolved_calls_to("c:@F@callee#").len(), 1);
    }

    #[test]
    fn duplicate_call_sites_collapse_but_distinct_locations_stay() {
        let mut idx = SymbolIndexes::new();
        let site = CallSite {
            caller_usr: "c:@F@f#".into(),
            callee_usr: "c:@F@v#".into(),
            file: "/p/a.cpp".into(),
            line: 2,
            column: 3,
        };
        idx.insert_call_site(site.clone());
        idx.insert_call_site(site.clone());
        let mut second = site;
        second.line = 4;
        idx.insert_call_site(second);
        assert_eq!(idx.call_site_count(), 2);
    }

    #[test]
    fn remove_file_clears_everything_it_owned() {
        let mut idx = SymbolIndexes::new();
        idx.insert_symbol(def("c:@S@A", "A", "/p/a.cpp", 1, 5));
        idx.insert_symbol(def("c:@S@B", "B", "/p/b.cpp", 1, 5));
        idx.insert_call_site(CallSite {
            caller_usr: "c:@S@A".into(),
            callee_usr: "c:@S@B".into(),
            file: "/p/a.cpp".into(),
            line: 2,
            column: 1,
        });
        idx.insert_alias(TypeAlias {
            alias_name: "AA".into(),
            qualified_name: "AA".into(),
            target_type: "A".into(),
            canonical_type: "A".into(),
            namespace: String::new(),
            alias_kind: crate::symbol::AliasKind::Using,
            is_template_alias: false,
            file: "/p/a.cpp".into(),
            line: 9,
            column: 1,
        });

        idx.remove_file("/p/a.cpp");
        assert!(idx.get_by_usr("c:@S@A").is_none());
        assert!(idx.get_by_usr("c:@S@B").is_some());
        assert_eq!(idx.call_site_count(), 0);
        assert_eq!(idx.alias_count(), 0);
        assert!(idx.canonical_for_alias("AA").is_none());
    }

    #[test]
    fn alias_maps_are_bidirectional() {
        let mut idx = SymbolIndexes::new();
        for (name, canonical) in [("A", "Real"), ("B", "Real")] {
            idx.insert_alias(TypeAlias {
                alias_name: name.into(),
                qualified_name: name.into(),
                target_type: "Real".into(),
                canonical_type: canonical.into(),
                namespace: String::new(),
                alias_kind: crate::symbol::AliasKind::Using,
                is_template_alias: false,
                file: "/p/a.cpp".into(),
                line: 1,
                column: 1,
            });
        }
        assert_eq!(idx.canonical_for_alias("A"), Some("Real"));
        assert_eq!(idx.aliases_for_canonical("Real"), &["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn hierarchy_maps_track_derived() {
        let mut idx = SymbolIndexes::new();
        let mut derived = def("c:@S@D", "D", "/p/d.h", 1, 3);
        derived.base_classes = vec!["Base".into()];
        idx.insert_symbol(def("c:@S@Base", "Base", "/p/base.h", 1, 3));
        idx.insert_symbol(derived);
        assert_eq!(idx.derived_of("Base"), &["D".to_string()]);

        idx.remove_file("/p/d.h");
        assert!(idx.derived_of("Base").is_empty());
    }

    #[test]
    fn specialization_back_index() {
        let mut idx = SymbolIndexes::new();
        let mut primary = def("c:@ST>1#T@Vec", "Vec", "/p/v.h", 1, 5);
        primary.kind = SymbolKind::ClassTemplate;
        let mut spec = def("c:@S@Vec>#I", "Vec", "/p/v.h", 7, 9);
        spec.primary_template_usr = Some("c:@ST>1#T@Vec".into());
        idx.insert_symbol(primary);
        idx.insert_symbol(spec);
        let specs = idx.specializations_of("c:@ST>1#T@Vec");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].usr, "c:@S@Vec>#I");
    }
}
