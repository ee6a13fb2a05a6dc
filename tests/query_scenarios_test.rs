//! End-to-end scenarios over the coordinator, store, and query engine,
//! driven by pre-extracted records (no libclang required).

use clangmap::config::Settings;
use clangmap::indexing::{ProjectIndexer, hash_file};
use clangmap::query::QueryEngine;
use clangmap::symbol::{
    AliasKind, AnalyzerState, CallSite, FileRecord, Symbol, SymbolKind, TemplateKind, TypeAlias,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Project {
    _temp: TempDir,
    root: std::path::PathBuf,
    settings: Arc<Settings>,
}

fn project() -> Project {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("proj");
    std::fs::create_dir_all(&root).unwrap();
    let mut settings = Settings::default();
    settings.cache_root = temp.path().join("cache");
    Project {
        root: root.canonicalize().unwrap(),
        _temp: temp,
        settings: Arc::new(settings),
    }
}

fn open(p: &Project) -> ProjectIndexer {
    ProjectIndexer::open(&p.root, p.settings.clone()).unwrap()
}

fn decl(usr: &str, name: &str, kind: SymbolKind, file: &Path, line: u32) -> Symbol {
    Symbol::new(usr, name, kind, file.to_string_lossy(), line, 1)
}

fn def(usr: &str, name: &str, kind: SymbolKind, file: &Path, start: u32, end: u32) -> Symbol {
    let mut s = decl(usr, name, kind, file, start);
    s.end_line = end;
    s.is_definition = true;
    s
}

fn record(file: &Path, symbols: Vec<Symbol>) -> FileRecord {
    FileRecord {
        file: file.to_string_lossy().into_owned(),
        file_hash: hash_file(file).unwrap_or_else(|_| "missing".into()),
        compile_args_hash: "args".into(),
        symbols,
        ..Default::default()
    }
}

#[test]
fn forward_declaration_then_definition_resolves_to_one_symbol() {
    let p = project();
    let fwd = p.root.join("fwd.h");
    let foo = p.root.join("foo.h");
    std::fs::write(&fwd, "class Foo;\n").unwrap();
    std::fs::write(&foo, "class Foo {\n  void m();\n};\n").unwrap();

    let mut indexer = open(&p);
    indexer
        .apply_records(vec![
            record(&fwd, vec![decl("c:@S@Foo", "Foo", SymbolKind::Class, &fwd, 1)]),
            record(&foo, vec![def("c:@S@Foo", "Foo", SymbolKind::Class, &foo, 1, 3)]),
        ])
        .unwrap();

    let cfg = indexer.settings().query.clone();
    let engine = QueryEngine::new(indexer.indexes(), Some(indexer.store()), &cfg);
    let hits = engine.search_classes("Foo", false, None).unwrap();
    assert_eq!(hits.len(), 1);
    let foo_sym = &hits[0];
    assert_eq!(foo_sym.file, foo.to_string_lossy());
    assert_eq!(foo_sym.start_line, 1);
    assert_eq!(foo_sym.end_line, 3);
    assert_eq!(foo_sym.header_file.as_deref(), Some(&*fwd.to_string_lossy()));
    assert_eq!(foo_sym.header_line, Some(1));
}

#[test]
fn alias_chain_unifies_param_type_search() {
    let p = project();
    let file = p.root.join("alias.cpp");
    std::fs::write(&file, "// aliases\n").unwrap();

    let aliases = vec![
        TypeAlias {
            alias_name: "A".into(),
            qualified_name: "A".into(),
            target_type: "Real".into(),
            canonical_type: "Real".into(),
            namespace: String::new(),
            alias_kind: AliasKind::Using,
            is_template_alias: false,
            file: file.to_string_lossy().into_owned(),
            line: 2,
            column: 1,
        },
        TypeAlias {
            alias_name: "B".into(),
            qualified_name: "B".into(),
            target_type: "A".into(),
            canonical_type: "Real".into(),
            namespace: String::new(),
            alias_kind: AliasKind::Using,
            is_template_alias: false,
            file: file.to_string_lossy().into_owned(),
            line: 3,
            column: 1,
        },
    ];

    let mut symbols = vec![def("c:@S@Real", "Real", SymbolKind::Class, &file, 1, 1)];
    for (i, (name, ty)) in [("fA", "A"), ("fB", "B"), ("fR", "Real")].into_iter().enumerate() {
        let mut f = def(
            &format!("c:@F@{name}#"),
            name,
            SymbolKind::Function,
            &file,
            5 + i as u32,
            5 + i as u32,
        );
        f.signature = Some(format!("void ({ty})"));
        symbols.push(f);
    }

    let mut rec = record(&file, symbols);
    rec.aliases = aliases;

    let mut indexer = open(&p);
    indexer.apply_records(vec![rec]).unwrap();

    let cfg = indexer.settings().query.clone();
    let engine = QueryEngine::new(indexer.indexes(), Some(indexer.store()), &cfg);
    let hits = engine
        .search_functions("f.*", None, Some("Real"), false)
        .unwrap();
    let names: Vec<&str> = hits.iter().map(|m| m.symbol.name.as_str()).collect();
    assert_eq!(names, vec!["fA", "fB", "fR"]);
    for hit in &hits {
        assert_eq!(
            hit.param_types_canonical.as_deref(),
            Some(&["Real".to_string()][..])
        );
    }

    // The store answers the same canonicalization questions cold.
    assert_eq!(
        indexer.store().get_canonical_for_alias("B").unwrap().as_deref(),
        Some("Real")
    );
    assert_eq!(indexer.store().get_aliases_for_canonical("Real").unwrap().len(), 2);
}

#[test]
fn function_template_specialization_links_to_primary() {
    let p = project();
    let file = p.root.join("templ.cpp");
    std::fs::write(&file, "// templates\n").unwrap();

    let mut primary = def(
        "c:@FT@>1#Tf#t0.0#v#",
        "f",
        SymbolKind::FunctionTemplate,
        &file,
        1,
        2,
    );
    primary.is_template = true;

    let mut spec = def("c:@F@f<#I>#I#v#", "f", SymbolKind::Function, &file, 4, 5);
    spec.is_template = true;
    spec.template_kind = TemplateKind::FullSpecialization;
    spec.primary_template_usr = Some("c:@FT@>1#Tf#t0.0#v#".into());

    let mut indexer = open(&p);
    indexer
        .apply_records(vec![record(&file, vec![primary, spec])])
        .unwrap();

    let cfg = indexer.settings().query.clone();
    let engine = QueryEngine::new(indexer.indexes(), Some(indexer.store()), &cfg);
    let hits = engine.search_functions("f", None, None, false).unwrap();
    assert_eq!(hits.len(), 2);

    let spec_hit = hits
        .iter()
        .find(|m| m.symbol.template_kind == TemplateKind::FullSpecialization)
        .unwrap();
    let primary_hit = hits
        .iter()
        .find(|m| m.symbol.template_kind == TemplateKind::Primary)
        .unwrap();
    assert_eq!(
        spec_hit.symbol.primary_template_usr.as_deref(),
        Some(primary_hit.symbol.usr.as_str())
    );
}

#[test]
fn repeated_calls_keep_distinct_sites() {
    let p = project();
    let file = p.root.join("calls.cpp");
    std::fs::write(&file, "void v();\nbool c();\nvoid t();\nvoid f() {\n  v(); t();\n  if (c()) { v(); }\n}\n").unwrap();

    let mut f = def("c:@F@f#", "f", SymbolKind::Function, &file, 4, 7);
    f.calls = vec!["c:@F@v#".into(), "c:@F@t#".into(), "c:@F@c#".into()];
    let symbols = vec![
        def("c:@F@v#", "v", SymbolKind::Function, &file, 1, 1),
        def("c:@F@c#", "c", SymbolKind::Function, &file, 2, 2),
        def("c:@F@t#", "t", SymbolKind::Function, &file, 3, 3),
        f,
    ];
    let mut rec = record(&file, symbols);
    let call = |callee: &str, line: u32, column: u32| CallSite {
        caller_usr: "c:@F@f#".into(),
        callee_usr: callee.into(),
        file: file.to_string_lossy().into_owned(),
        line,
        column,
    };
    rec.call_sites = vec![
        call("c:@F@v#", 5, 3),
        call("c:@F@t#", 5, 8),
        call("c:@F@c#", 6, 7),
        call("c:@F@v#", 6, 14),
    ];

    let mut indexer = open(&p);
    indexer.apply_records(vec![rec]).unwrap();

    let cfg = indexer.settings().query.clone();
    let engine = QueryEngine::new(indexer.indexes(), Some(indexer.store()), &cfg);
    let callers = engine.find_callers("v").unwrap();
    assert_eq!(callers.len(), 2);
    assert_eq!((callers[0].line, callers[0].column), (5, 3));
    assert_eq!((callers[1].line, callers[1].column), (6, 14));
    assert!(callers.iter().all(|c| c.caller == "f"));
    // Context is read from the real file on demand.
    assert!(callers[0].context.as_deref().unwrap().contains("v(); t();"));
}

#[test]
fn reindexing_a_file_replaces_its_symbols() {
    let p = project();
    let file = p.root.join("w.cpp");
    std::fs::write(&file, "struct W { void old_name(); };\n").unwrap();

    let mut indexer = open(&p);
    let mut method = def("c:@S@W@F@old_name#", "old_name", SymbolKind::Method, &file, 1, 1);
    method.parent_class = "W".into();
    indexer
        .apply_records(vec![record(
            &file,
            vec![def("c:@S@W", "W", SymbolKind::Struct, &file, 1, 1), method],
        )])
        .unwrap();

    // Rename the method and re-apply the file's record.
    std::fs::write(&file, "struct W { void new_name(); };\n").unwrap();
    let mut method = def("c:@S@W@F@new_name#", "new_name", SymbolKind::Method, &file, 1, 1);
    method.parent_class = "W".into();
    indexer
        .apply_records(vec![record(
            &file,
            vec![def("c:@S@W", "W", SymbolKind::Struct, &file, 1, 1), method],
        )])
        .unwrap();

    let cfg = indexer.settings().query.clone();
    let engine = QueryEngine::new(indexer.indexes(), Some(indexer.store()), &cfg);
    assert!(engine.search_functions("old_name", None, None, false).unwrap().is_empty());
    assert_eq!(engine.search_functions("new_name", None, None, false).unwrap().len(), 1);

    let meta = indexer
        .store()
        .file_metadata(&file.to_string_lossy())
        .unwrap()
        .unwrap();
    assert_eq!(meta.file_hash, hash_file(&file).unwrap());
}

#[test]
fn cache_round_trips_across_restart() {
    let p = project();
    let file = p.root.join("persist.cpp");
    std::fs::write(&file, "class Kept {};\n").unwrap();

    {
        let mut indexer = open(&p);
        indexer
            .apply_records(vec![record(
                &file,
                vec![def("c:@S@Kept", "Kept", SymbolKind::Class, &file, 1, 1)],
            )])
            .unwrap();
    }

    // A fresh coordinator reloads the same symbol set from the cache.
    let indexer = open(&p);
    assert_eq!(indexer.indexes().symbol_count(), 1);
    let cfg = indexer.settings().query.clone();
    let engine = QueryEngine::new(indexer.indexes(), Some(indexer.store()), &cfg);
    assert_eq!(engine.search_classes("Kept", false, None).unwrap().len(), 1);
}

#[test]
fn empty_project_indexes_quickly_and_answers_empty() {
    let p = project();
    let start = std::time::Instant::now();
    let mut indexer = open(&p);
    let outcome = indexer.index_all(false).unwrap();
    assert!(start.elapsed() < std::time::Duration::from_secs(1));
    assert_eq!(outcome.scanned, 0);
    assert_eq!(indexer.status_handle().state(), AnalyzerState::Indexed);

    let cfg = indexer.settings().query.clone();
    let engine = QueryEngine::new(indexer.indexes(), Some(indexer.store()), &cfg);
    assert!(engine.search_classes(".", false, None).unwrap().is_empty());
}

/// A worker that acknowledges every job with an empty record. Keeps pool
/// mechanics real without needing libclang in the test environment.
#[cfg(unix)]
fn stub_worker() -> clangmap::indexing::WorkerCommand {
    clangmap::indexing::WorkerCommand {
        program: "/bin/sh".into(),
        args: vec![
            "-c".into(),
            concat!(
                r#"while read line; do "#,
                r#"id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/'); "#,
                r#"printf '{"id":%s,"record":{"file":"","file_hash":"","compile_args_hash":"","symbols":[],"aliases":[],"call_sites":[],"headers":[],"errors":[]}}\n' "$id"; "#,
                r#"done"#
            )
            .to_string(),
        ],
    }
}

#[test]
#[cfg(unix)]
fn refresh_drops_removed_files() {
    let p = project();
    let keep = p.root.join("keep.cpp");
    let gone = p.root.join("gone.cpp");
    std::fs::write(&keep, "class Keep {};\n").unwrap();
    std::fs::write(&gone, "class Gone {};\n").unwrap();

    let mut indexer = open(&p);
    indexer.set_worker_command(stub_worker());
    indexer
        .apply_records(vec![
            record(&keep, vec![def("c:@S@Keep", "Keep", SymbolKind::Class, &keep, 1, 1)]),
            record(&gone, vec![def("c:@S@Gone", "Gone", SymbolKind::Class, &gone, 1, 1)]),
        ])
        .unwrap();

    std::fs::remove_file(&gone).unwrap();
    let outcome = indexer.refresh(false).unwrap();
    assert_eq!(outcome.removed, 1);

    assert!(indexer.indexes().get_by_usr("c:@S@Gone").is_none());
    assert!(indexer.store().load_symbol_by_usr("c:@S@Gone").unwrap().is_none());
    assert!(indexer.store().file_metadata(&gone.to_string_lossy()).unwrap().is_none());
    assert!(indexer.indexes().get_by_usr("c:@S@Keep").is_some());
    assert_eq!(indexer.status_handle().state(), AnalyzerState::Indexed);
}

#[test]
#[cfg(unix)]
fn unchanged_files_hit_the_cache() {
    let p = project();
    let file = p.root.join("hit.cpp");
    std::fs::write(&file, "class Hit {};\n").unwrap();

    let mut indexer = open(&p);
    indexer.set_worker_command(stub_worker());

    // First run parses (stub worker), writing metadata with real hashes.
    let first = indexer.index_all(false).unwrap();
    assert_eq!(first.indexed, 1);
    assert_eq!(first.cache_hits, 0);

    // Unchanged content and args: pure cache hit, no parsing.
    let second = indexer.index_all(false).unwrap();
    assert_eq!(second.indexed, 0);
    assert_eq!(second.cache_hits, 1);

    // Touching the content invalidates exactly that file.
    std::fs::write(&file, "class Hit { int x; };\n").unwrap();
    let third = indexer.index_all(false).unwrap();
    assert_eq!(third.indexed, 1);
    assert_eq!(third.cache_hits, 0);
}
