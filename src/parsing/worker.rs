//! Per-file parser worker: drive libclang over one translation unit and
//! build the file's symbol, alias, and call-site records.
//!
//! The walk dispatches on cursor kind: class-like declarations recurse into
//! their members, function-like definitions get a nested `CallExpr` sweep,
//! aliases capture their underlying and canonical types. Extraction is
//! best-effort throughout; a TU that fails to parse still yields a record
//! carrying its diagnostics.

use clang::{Accessibility, Clang, Entity, EntityKind, EntityVisitResult, Index};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::indexing::file_info::{hash_file, utc_timestamp};
use crate::indexing::protocol::{self, WorkerJob, WorkerReply};
use crate::store::SymbolStore;
use crate::symbol::{
    Access, AliasKind, CallSite, FileRecord, HeaderClaim, ParseErrorRecord, Symbol, SymbolKind,
    TemplateKind, TemplateParamKind, TemplateParameter, TypeAlias, normalize_base_class,
    truncate_brief, truncate_doc,
};

/// Cap on stored diagnostics per file; a hopeless TU can produce thousands.
const MAX_DIAGNOSTICS: usize = 20;

/// Entry point of the `clangmap worker` subcommand.
///
/// Reads jobs from stdin, writes replies to stdout, exits on EOF. A missing
/// libclang is not fatal: every job is answered with an error record so the
/// coordinator can account for the files.
pub fn run_worker_stdio() -> i32 {
    let mut stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();

    let clang = match Clang::new() {
        Ok(clang) => Some(clang),
        Err(e) => {
            warn!("libclang unavailable: {e}");
            None
        }
    };
    // Full AST: nothing excluded for PCH, diagnostics collected by us.
    let index = clang.as_ref().map(|c| Index::new(c, false, false));
    let mut store_cache: Option<(String, Option<SymbolStore>)> = None;

    loop {
        let job: WorkerJob = match protocol::read_message(&mut stdin) {
            Ok(Some(job)) => job,
            Ok(None) => return 0,
            Err(e) => {
                // A desynced job stream cannot be resynchronized; let the
                // pool respawn us.
                warn!("worker protocol error: {e}");
                return 2;
            }
        };

        let store = store_for(&mut store_cache, job.cache_dir.as_deref());
        let record = match &index {
            Some(index) => process_job(index, store, &job),
            None => unavailable_record(&job),
        };

        let reply = WorkerReply { id: job.id, record };
        if protocol::write_message(&mut stdout, &reply).is_err() {
            return 1;
        }
    }
}

/// One cached read-only store handle per cache directory.
fn store_for<'a>(
    cache: &'a mut Option<(String, Option<SymbolStore>)>,
    cache_dir: Option<&str>,
) -> Option<&'a SymbolStore> {
    let dir = cache_dir?;
    let stale = cache.as_ref().is_none_or(|(cached, _)| cached != dir);
    if stale {
        let store = SymbolStore::open_read_only(Path::new(dir)).ok();
        *cache = Some((dir.to_string(), store));
    }
    cache.as_ref().and_then(|(_, store)| store.as_ref())
}

fn unavailable_record(job: &WorkerJob) -> FileRecord {
    let mut record = empty_record(job);
    record.errors.push(ParseErrorRecord {
        file_path: job.file.clone(),
        error_kind: "parser_unavailable".to_string(),
        message: "libclang could not be loaded; set LIBCLANG_PATH".to_string(),
        stack: None,
        file_hash: job.file_hash.clone(),
        compile_args_hash: job.compile_args_hash.clone(),
        retry_count: 0,
        timestamp: utc_timestamp(),
    });
    record
}

fn empty_record(job: &WorkerJob) -> FileRecord {
    FileRecord {
        file: job.file.clone(),
        file_hash: job.file_hash.clone(),
        compile_args_hash: job.compile_args_hash.clone(),
        ..Default::default()
    }
}

/// Parse one translation unit and extract its record.
pub fn process_job(index: &Index, store: Option<&SymbolStore>, job: &WorkerJob) -> FileRecord {
    let mut record = empty_record(job);
    let args: Vec<&str> = job.args.iter().map(String::as_str).collect();

    let tu = match index
        .parser(&job.file)
        .arguments(&args)
        .detailed_preprocessing_record(true)
        .parse()
    {
        Ok(tu) => tu,
        Err(e) => {
            record.errors.push(ParseErrorRecord {
                file_path: job.file.clone(),
                error_kind: "parse_failure".to_string(),
                message: format!("{e:?}"),
                stack: None,
                file_hash: job.file_hash.clone(),
                compile_args_hash: job.compile_args_hash.clone(),
                retry_count: 0,
                timestamp: utc_timestamp(),
            });
            return record;
        }
    };

    for diagnostic in tu.get_diagnostics().iter().take(MAX_DIAGNOSTICS) {
        use clang::diagnostic::Severity;
        if matches!(diagnostic.get_severity(), Severity::Error | Severity::Fatal) {
            record.errors.push(ParseErrorRecord {
                file_path: job.file.clone(),
                error_kind: "diagnostic".to_string(),
                message: diagnostic.get_text(),
                stack: None,
                file_hash: job.file_hash.clone(),
                compile_args_hash: job.compile_args_hash.clone(),
                retry_count: 0,
                timestamp: utc_timestamp(),
            });
        }
    }

    let mut ctx = ExtractContext {
        job,
        store,
        record,
        header_decisions: HashMap::new(),
        tu_file: PathBuf::from(&job.file),
    };
    walk_children(tu.get_entity(), &mut ctx);
    debug!(
        "extracted {} symbols, {} aliases, {} call sites from {}",
        ctx.record.symbols.len(),
        ctx.record.aliases.len(),
        ctx.record.call_sites.len(),
        job.file
    );
    ctx.record
}

struct ExtractContext<'a> {
    job: &'a WorkerJob,
    store: Option<&'a SymbolStore>,
    record: FileRecord,
    /// Memoized per-header decision: extract here, or already claimed.
    header_decisions: HashMap<PathBuf, HeaderDecision>,
    tu_file: PathBuf,
}

#[derive(Clone, Copy)]
struct HeaderDecision {
    extract: bool,
    is_project: bool,
}

/// Resolved location of a cursor we decided to extract.
struct Site {
    file: String,
    line: u32,
    column: u32,
    is_project: bool,
}

fn walk_children(entity: Entity, ctx: &mut ExtractContext) {
    for child in entity.get_children() {
        visit(child, ctx);
    }
}

fn visit(entity: Entity, ctx: &mut ExtractContext) {
    match entity.get_kind() {
        EntityKind::Namespace | EntityKind::LinkageSpec | EntityKind::UnexposedDecl => {
            walk_children(entity, ctx);
        }
        EntityKind::ClassDecl | EntityKind::StructDecl => {
            if let Some(site) = extraction_site(entity, ctx) {
                extract_class(entity, site, ctx);
            }
            walk_children(entity, ctx);
        }
        EntityKind::ClassTemplate | EntityKind::ClassTemplatePartialSpecialization => {
            if let Some(site) = extraction_site(entity, ctx) {
                extract_class(entity, site, ctx);
            }
            walk_children(entity, ctx);
        }
        EntityKind::FunctionDecl
        | EntityKind::Method
        | EntityKind::Constructor
        | EntityKind::Destructor
        | EntityKind::ConversionFunction
        | EntityKind::FunctionTemplate => {
            if let Some(site) = extraction_site(entity, ctx) {
                extract_function(entity, site, ctx);
            }
        }
        EntityKind::TypeAliasDecl | EntityKind::TypedefDecl => {
            if let Some(site) = extraction_site(entity, ctx) {
                extract_alias(entity, site, ctx);
            }
        }
        _ => {}
    }
}

/// Decide whether this cursor's location belongs to our extraction scope:
/// the TU file itself, or an include not yet claimed by another source file.
fn extraction_site(entity: Entity, ctx: &mut ExtractContext) -> Option<Site> {
    let location = entity.get_location()?;
    if location.is_in_system_header() {
        return None;
    }
    let spot = location.get_file_location();
    let file = spot.file?.get_path();

    if file == ctx.tu_file {
        return Some(Site {
            file: path_str(&file),
            line: spot.line,
            column: spot.column,
            is_project: ctx.job.is_project,
        });
    }

    let decision = header_decision(&file, ctx);
    if !decision.extract {
        return None;
    }
    Some(Site {
        file: path_str(&file),
        line: spot.line,
        column: spot.column,
        is_project: decision.is_project,
    })
}

fn header_decision(header: &Path, ctx: &mut ExtractContext) -> HeaderDecision {
    if let Some(decision) = ctx.header_decisions.get(header) {
        return *decision;
    }

    let header_str = path_str(header);
    let header_hash = hash_file(header).unwrap_or_default();
    let claimed = ctx
        .store
        .map(|store| {
            store
                .is_header_claimed(&header_str, &header_hash, &ctx.job.compile_args_hash)
                .unwrap_or(false)
        })
        .unwrap_or(false);

    let decision = HeaderDecision {
        extract: !claimed,
        is_project: classify_header(header, ctx.job),
    };
    if decision.extract {
        ctx.record.headers.push(HeaderClaim {
            header_path: header_str,
            processed_by: ctx.job.file.clone(),
            file_hash: header_hash,
            compile_args_hash: ctx.job.compile_args_hash.clone(),
        });
    }
    ctx.header_decisions.insert(header.to_path_buf(), decision);
    decision
}

fn classify_header(header: &Path, job: &WorkerJob) -> bool {
    let Ok(relative) = header.strip_prefix(&job.project_root) else {
        return false;
    };
    let relative = relative.to_string_lossy().replace('\\', "/");
    !job
        .dependency_roots
        .iter()
        .any(|root| relative.starts_with(&format!("{root}/")) || relative == *root)
}

fn extract_class(entity: Entity, site: Site, ctx: &mut ExtractContext) {
    let Some(name) = entity.get_name() else {
        // Anonymous structs carry no stable identity worth indexing.
        return;
    };
    let Some(usr) = entity.get_usr() else { return };

    let kind = match entity.get_kind() {
        EntityKind::StructDecl => SymbolKind::Struct,
        EntityKind::ClassTemplate => SymbolKind::ClassTemplate,
        EntityKind::ClassTemplatePartialSpecialization => SymbolKind::PartialSpecialization,
        _ => SymbolKind::Class,
    };

    let mut symbol = base_symbol(entity, &usr.0, &name, kind, &site);

    for child in entity.get_children() {
        if child.get_kind() == EntityKind::BaseSpecifier {
            if let Some(base_type) = child.get_type() {
                let base = normalize_base_class(&base_type.get_display_name());
                if !base.is_empty() && !symbol.base_classes.contains(&base) {
                    symbol.base_classes.push(base);
                }
            }
        }
    }

    apply_template_metadata(entity, &mut symbol);
    ctx.record.symbols.push(symbol);
}

fn extract_function(entity: Entity, site: Site, ctx: &mut ExtractContext) {
    let Some(name) = entity.get_name() else { return };
    let Some(usr) = entity.get_usr() else { return };

    let kind = match entity.get_kind() {
        EntityKind::FunctionDecl => SymbolKind::Function,
        EntityKind::FunctionTemplate => SymbolKind::FunctionTemplate,
        _ => SymbolKind::Method,
    };

    let mut symbol = base_symbol(entity, &usr.0, &name, kind, &site);
    apply_template_metadata(entity, &mut symbol);

    if symbol.is_definition {
        let (sites, callees) = collect_call_sites(entity, &symbol.usr, ctx);
        symbol.calls = callees;
        ctx.record.call_sites.extend(sites);
    }

    ctx.record.symbols.push(symbol);
}

fn extract_alias(entity: Entity, site: Site, ctx: &mut ExtractContext) {
    let Some(name) = entity.get_name() else { return };
    let Some(underlying) = entity.get_typedef_underlying_type() else {
        return;
    };

    let (namespace, _) = scope_of(entity);
    let qualified_name = qualify(&namespace, &name);
    let alias_kind = if entity.get_kind() == EntityKind::TypeAliasDecl {
        AliasKind::Using
    } else {
        AliasKind::Typedef
    };

    ctx.record.aliases.push(TypeAlias {
        alias_name: name,
        qualified_name,
        target_type: normalize_base_class(&underlying.get_display_name()),
        // The canonical type resolves alias chains in one step.
        canonical_type: normalize_base_class(
            &underlying.get_canonical_type().get_display_name(),
        ),
        namespace,
        alias_kind,
        is_template_alias: false,
        file: site.file,
        line: site.line,
        column: site.column,
    });
}

fn base_symbol(entity: Entity, usr: &str, name: &str, kind: SymbolKind, site: &Site) -> Symbol {
    let mut symbol = Symbol::new(usr, name, kind, site.file.clone(), site.line, site.column);
    symbol.is_project = site.is_project;
    symbol.is_definition = entity.is_definition();

    if let Some(range) = entity.get_range() {
        symbol.start_line = range.get_start().get_file_location().line;
        symbol.end_line = range.get_end().get_file_location().line;
    }

    let (namespace, parent_class) = scope_of(entity);
    let display = entity.get_display_name().unwrap_or_else(|| name.to_string());
    symbol.qualified_name = match &parent_class {
        Some(parent) => format!("{parent}::{display}"),
        None => qualify(&namespace, &display),
    };
    symbol.namespace = namespace;
    symbol.parent_class = parent_class.unwrap_or_default();

    symbol.access = match entity.get_accessibility() {
        Some(Accessibility::Private) => Access::Private,
        Some(Accessibility::Protected) => Access::Protected,
        _ => Access::Public,
    };

    symbol.signature = entity.get_type().map(|t| t.get_display_name());

    let raw_comment = entity.get_comment();
    symbol.brief = entity
        .get_comment_brief()
        .filter(|b| !b.trim().is_empty())
        .or_else(|| raw_comment.as_deref().and_then(first_comment_line))
        .map(|b| truncate_brief(&b));
    symbol.doc_comment = raw_comment.map(|c| truncate_doc(&c));

    symbol
}

fn apply_template_metadata(entity: Entity, symbol: &mut Symbol) {
    symbol.template_parameters = template_parameters(entity);
    let is_template_decl = matches!(
        entity.get_kind(),
        EntityKind::ClassTemplate
            | EntityKind::ClassTemplatePartialSpecialization
            | EntityKind::FunctionTemplate
    );

    // A specialization appears as a plain declaration whose specialized
    // template is reachable through the cursor API; the USR keeps a `>#`
    // marker as a secondary signal.
    let primary = entity
        .get_template()
        .and_then(|t| t.get_usr())
        .map(|usr| usr.0);
    match (primary, entity.get_kind()) {
        (primary, EntityKind::ClassTemplatePartialSpecialization) => {
            symbol.is_template = true;
            symbol.template_kind = TemplateKind::PartialSpecialization;
            symbol.primary_template_usr = primary;
        }
        (Some(primary), _) => {
            symbol.is_template = true;
            symbol.template_kind = TemplateKind::FullSpecialization;
            symbol.primary_template_usr = Some(primary);
        }
        (None, _) if is_template_decl => {
            symbol.is_template = true;
            symbol.template_kind = TemplateKind::Primary;
        }
        (None, _) if symbol.usr.contains(">#") => {
            symbol.is_template = true;
            symbol.template_kind = TemplateKind::FullSpecialization;
        }
        _ => {}
    }
}

fn template_parameters(entity: Entity) -> Vec<TemplateParameter> {
    entity
        .get_children()
        .into_iter()
        .filter_map(|child| {
            let kind = match child.get_kind() {
                EntityKind::TemplateTypeParameter => TemplateParamKind::Type,
                EntityKind::NonTypeTemplateParameter => TemplateParamKind::NonType,
                EntityKind::TemplateTemplateParameter => TemplateParamKind::Template,
                _ => return None,
            };
            Some(TemplateParameter {
                name: child.get_name().unwrap_or_default(),
                kind,
                is_variadic: parameter_is_variadic(child),
            })
        })
        .collect()
}

/// Parameter packs have no dedicated cursor API; the ellipsis token in the
/// parameter's extent is the reliable signal.
fn parameter_is_variadic(entity: Entity) -> bool {
    entity
        .get_range()
        .map(|range| {
            range
                .tokenize()
                .iter()
                .any(|token| token.get_spelling() == "...")
        })
        .unwrap_or(false)
}

fn collect_call_sites(
    entity: Entity,
    caller_usr: &str,
    ctx: &ExtractContext,
) -> (Vec<CallSite>, Vec<String>) {
    let mut sites = Vec::new();
    let mut callees = Vec::new();

    entity.visit_children(|node, _parent| {
        if node.get_kind() == EntityKind::CallExpr {
            if let Some(site) = call_site_for(node, caller_usr, ctx) {
                if !callees.contains(&site.callee_usr) {
                    callees.push(site.callee_usr.clone());
                }
                sites.push(site);
            }
        }
        EntityVisitResult::Recurse
    });

    (sites, callees)
}

fn call_site_for(node: Entity, caller_usr: &str, ctx: &ExtractContext) -> Option<CallSite> {
    let callee = node.get_reference()?;
    let callee_usr = callee.get_usr()?;
    let location = node.get_location()?.get_file_location();
    let file = location.file?.get_path();
    // Calls belong to the file their coordinates live in; a claimed header's
    // calls were already recorded by the claiming TU.
    if file != ctx.tu_file
        && !ctx
            .header_decisions
            .get(&file)
            .map(|d| d.extract)
            .unwrap_or(false)
    {
        return None;
    }
    Some(CallSite {
        caller_usr: caller_usr.to_string(),
        callee_usr: callee_usr.0,
        file: path_str(&file),
        line: location.line,
        column: location.column,
    })
}

fn scope_of(entity: Entity) -> (String, Option<String>) {
    let mut namespaces = Vec::new();
    let mut classes = Vec::new();
    let mut current = entity.get_semantic_parent();
    while let Some(parent) = current {
        match parent.get_kind() {
            EntityKind::Namespace => {
                if let Some(name) = parent.get_name() {
                    namespaces.push(name);
                }
            }
            EntityKind::ClassDecl
            | EntityKind::StructDecl
            | EntityKind::ClassTemplate
            | EntityKind::ClassTemplatePartialSpecialization => {
                if let Some(name) = parent.get_name() {
                    classes.push(name);
                }
            }
            _ => {}
        }
        current = parent.get_semantic_parent();
    }
    namespaces.reverse();
    classes.reverse();

    let namespace = namespaces.join("::");
    let parent_class = if classes.is_empty() {
        None
    } else {
        let mut parts = namespaces;
        parts.extend(classes);
        Some(parts.join("::"))
    };
    (namespace, parent_class)
}

fn qualify(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}::{name}")
    }
}

/// First non-empty line of a raw comment, stripped of comment markers.
/// Used when the parser has no dedicated brief for a declaration.
fn first_comment_line(raw: &str) -> Option<String> {
    raw.lines()
        .map(strip_comment_markers)
        .find(|line| !line.is_empty())
}

fn strip_comment_markers(line: &str) -> String {
    let mut text = line.trim();
    for prefix in ["/**", "/*!", "/*", "///", "//!", "//"] {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest;
            break;
        }
    }
    text = text.trim_end_matches("*/").trim();
    text.trim_start_matches('*').trim().to_string()
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_markers_stripped() {
        assert_eq!(strip_comment_markers("/// A widget."), "A widget.");
        assert_eq!(strip_comment_markers("//! Module doc"), "Module doc");
        assert_eq!(strip_comment_markers(" * Continued line"), "Continued line");
        assert_eq!(strip_comment_markers("/** Boxed brief */"), "Boxed brief");
        assert_eq!(strip_comment_markers("plain"), "plain");
    }

    #[test]
    fn first_comment_line_skips_decoration() {
        let raw = "/**\n *\n * Computes the thing.\n * More detail.\n */";
        assert_eq!(
            first_comment_line(raw).as_deref(),
            Some("Computes the thing.")
        );
        assert_eq!(first_comment_line("/**\n*\n*/"), None);
    }

    #[test]
    fn qualify_handles_empty_namespace() {
        assert_eq!(qualify("", "Foo"), "Foo");
        assert_eq!(qualify("a::b", "Foo"), "a::b::Foo");
    }

    #[test]
    fn header_classification_uses_roots() {
        let job = WorkerJob {
            id: 1,
            file: "/proj/a.cpp".into(),
            args: vec![],
            is_project: true,
            file_hash: String::new(),
            compile_args_hash: String::new(),
            project_root: "/proj".into(),
            dependency_roots: vec!["vcpkg_installed".into()],
            cache_dir: None,
        };
        assert!(classify_header(Path::new("/proj/include/a.h"), &job));
        assert!(!classify_header(
            Path::new("/proj/vcpkg_installed/x64/include/fmt/core.h"),
            &job
        ));
        assert!(!classify_header(Path::new("/usr/include/vector"), &job));
    }
}
