//! Property-based tests for the invariants the rest of the system leans on:
//! USR uniqueness in the store, order-independent merging, and the
//! documentation length bounds.

use clangmap::indexing::memory::SymbolIndexes;
use clangmap::store::SymbolStore;
use clangmap::symbol::{
    BRIEF_MAX_CHARS, DOC_MAX_CHARS, Symbol, SymbolKind, truncate_brief, truncate_doc,
};
use proptest::prelude::*;
use proptest::strategy::ValueTree;
use tempfile::TempDir;

fn arb_symbol() -> impl Strategy<Value = Symbol> {
    (
        0..8u32,          // usr pool, small to force collisions
        0..4u32,          // file pool
        1..100u32,        // start line
        0..20u32,         // span
        any::<bool>(),    // is_definition
        any::<bool>(),    // has brief
    )
        .prop_map(|(usr, file, start, span, is_definition, has_brief)| {
            let mut s = Symbol::new(
                format!("c:@S@S{usr}"),
                format!("S{usr}"),
                SymbolKind::Class,
                format!("/p/f{file}.cpp"),
                start,
                1,
            );
            s.end_line = start + span;
            s.is_definition = is_definition && span > 0;
            if has_brief {
                s.brief = Some(format!("brief for S{usr}"));
            }
            s
        })
}

proptest! {
    /// Brief and doc lengths are bounded, truncation ends in `...` and
    /// lands exactly on the limit.
    #[test]
    fn doc_length_bounds(text in ".{0,6000}") {
        let brief = truncate_brief(&text);
        prop_assert!(brief.chars().count() <= BRIEF_MAX_CHARS);

        let doc = truncate_doc(&text);
        let doc_chars = doc.chars().count();
        prop_assert!(doc_chars <= DOC_MAX_CHARS);
        if text.chars().count() > DOC_MAX_CHARS {
            prop_assert_eq!(doc_chars, DOC_MAX_CHARS);
            prop_assert!(doc.ends_with("..."));
        } else {
            prop_assert_eq!(doc.as_str(), text.as_str());
        }
    }

    /// Merging any sequence of sightings yields the same resolved symbol
    /// regardless of arrival order (worker completion order independence).
    #[test]
    fn merge_is_order_independent(symbols in proptest::collection::vec(arb_symbol(), 1..12)) {
        let mut forward = SymbolIndexes::new();
        for s in symbols.clone() {
            forward.insert_symbol(s);
        }

        let mut reversed = SymbolIndexes::new();
        for s in symbols.iter().rev().cloned() {
            reversed.insert_symbol(s);
        }

        prop_assert_eq!(forward.symbol_count(), reversed.symbol_count());
        for symbol in forward.iter_symbols() {
            let other = reversed.get_by_usr(&symbol.usr);
            prop_assert!(other.is_some());
            let other = other.unwrap();
            prop_assert_eq!(&symbol.file, &other.file);
            prop_assert_eq!(symbol.start_line, other.start_line);
            prop_assert_eq!(symbol.end_line, other.end_line);
            prop_assert_eq!(symbol.is_definition, other.is_definition);
        }
    }

    /// A definition always beats a declaration for the resolved
    /// location, and the declaration's location survives in header fields.
    #[test]
    fn definition_wins(start in 1..50u32, span in 1..10u32, decl_line in 1..50u32) {
        let mut definition = Symbol::new("c:@S@X", "X", SymbolKind::Class, "/p/x.cpp", start, 1);
        definition.end_line = start + span;
        definition.is_definition = true;
        let declaration = Symbol::new("c:@S@X", "X", SymbolKind::Class, "/p/x.h", decl_line, 1);

        let mut indexes = SymbolIndexes::new();
        indexes.insert_symbol(declaration);
        indexes.insert_symbol(definition);

        let resolved = indexes.get_by_usr("c:@S@X").unwrap();
        prop_assert_eq!(resolved.file.as_str(), "/p/x.cpp");
        prop_assert!(resolved.span() >= span);
        prop_assert_eq!(resolved.header_file.as_deref(), Some("/p/x.h"));
        prop_assert_eq!(resolved.header_line, Some(decl_line));
    }
}

/// However many times symbols are rewritten, `usr` stays unique in the
/// store.
#[test]
fn store_usr_uniqueness_under_rewrites() {
    let temp = TempDir::new().unwrap();
    let mut store = SymbolStore::open(temp.path()).unwrap();

    let mut runner = proptest::test_runner::TestRunner::deterministic();
    let strategy = proptest::collection::vec(arb_symbol(), 1..20);
    for _ in 0..32 {
        let batch = strategy.new_tree(&mut runner).unwrap().current();
        store.save_symbols_batch(&batch).unwrap();
    }

    let all = store.load_all_symbols().unwrap();
    let mut usrs: Vec<&str> = all.iter().map(|s| s.usr.as_str()).collect();
    let before = usrs.len();
    usrs.sort();
    usrs.dedup();
    assert_eq!(before, usrs.len(), "duplicate USRs in the store");
}
