//! Data model for extracted C++ entities.
//!
//! Everything the parser workers produce and the store persists lives here:
//! symbols, type aliases, call sites, per-file records, and the progress and
//! state types the coordinator publishes.

use serde::{Deserialize, Serialize};

/// Maximum length of a brief description, in characters.
pub const BRIEF_MAX_CHARS: usize = 200;

/// Maximum length of a full documentation comment, in characters.
pub const DOC_MAX_CHARS: usize = 4000;

/// Kind of an extracted C++ symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Struct,
    Function,
    Method,
    ClassTemplate,
    PartialSpecialization,
    FunctionTemplate,
    Using,
    Typedef,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Struct => "struct",
            Self::Function => "function",
            Self::Method => "method",
            Self::ClassTemplate => "class_template",
            Self::PartialSpecialization => "partial_specialization",
            Self::FunctionTemplate => "function_template",
            Self::Using => "using",
            Self::Typedef => "typedef",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "class" => Some(Self::Class),
            "struct" => Some(Self::Struct),
            "function" => Some(Self::Function),
            "method" => Some(Self::Method),
            "class_template" => Some(Self::ClassTemplate),
            "partial_specialization" => Some(Self::PartialSpecialization),
            "function_template" => Some(Self::FunctionTemplate),
            "using" => Some(Self::Using),
            "typedef" => Some(Self::Typedef),
            _ => None,
        }
    }

    /// True for the kinds `search_classes` aggregates over.
    pub fn is_class_like(&self) -> bool {
        matches!(
            self,
            Self::Class | Self::Struct | Self::ClassTemplate | Self::PartialSpecialization
        )
    }

    /// True for the kinds `search_functions` aggregates over.
    pub fn is_function_like(&self) -> bool {
        matches!(self, Self::Function | Self::Method | Self::FunctionTemplate)
    }
}

/// C++ access level of a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    #[default]
    Public,
    Private,
    Protected,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Protected => "protected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            "protected" => Some(Self::Protected),
            _ => None,
        }
    }
}

/// Kind of one template parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateParamKind {
    Type,
    NonType,
    Template,
}

/// One parameter of a template declaration, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateParameter {
    pub name: String,
    pub kind: TemplateParamKind,
    #[serde(default)]
    pub is_variadic: bool,
}

/// Relation of a template symbol to its primary declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    #[default]
    Primary,
    FullSpecialization,
    PartialSpecialization,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::FullSpecialization => "full_specialization",
            Self::PartialSpecialization => "partial_specialization",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Self::Primary),
            "full_specialization" => Some(Self::FullSpecialization),
            "partial_specialization" => Some(Self::PartialSpecialization),
            _ => None,
        }
    }
}

/// One extracted declaration or definition.
///
/// Identity is the USR; location fields disambiguate multiple sightings of
/// the same USR until the definition-wins merge resolves them to one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub usr: String,
    pub name: String,
    pub qualified_name: String,
    pub kind: SymbolKind,
    /// Absolute path of the file holding the resolved (definition) location.
    pub file: String,
    pub line: u32,
    pub column: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub is_project: bool,
    pub namespace: String,
    pub access: Access,
    /// Qualified name of the owning class for methods, empty otherwise.
    pub parent_class: String,
    /// Normalized base-class names, declaration order.
    pub base_classes: Vec<String>,
    pub start_line: u32,
    pub end_line: u32,
    /// Declaration location when a separate declaration was seen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_start_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_end_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_comment: Option<String>,
    pub is_template: bool,
    pub template_parameters: Vec<TemplateParameter>,
    pub template_kind: TemplateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_template_usr: Option<String>,
    /// Whether the resolved location is a definition (has a body).
    #[serde(default)]
    pub is_definition: bool,
    /// USRs of symbols this symbol calls.
    #[serde(default)]
    pub calls: Vec<String>,
    /// USRs of symbols calling this symbol. Filled during merge.
    #[serde(default)]
    pub called_by: Vec<String>,
}

impl Symbol {
    /// Minimal constructor; extraction fills the rest field by field.
    pub fn new(
        usr: impl Into<String>,
        name: impl Into<String>,
        kind: SymbolKind,
        file: impl Into<String>,
        line: u32,
        column: u32,
    ) -> Self {
        let name = name.into();
        Self {
            usr: usr.into(),
            qualified_name: name.clone(),
            name,
            kind,
            file: file.into(),
            line,
            column,
            signature: None,
            is_project: true,
            namespace: String::new(),
            access: Access::Public,
            parent_class: String::new(),
            base_classes: Vec::new(),
            start_line: line,
            end_line: line,
            header_file: None,
            header_line: None,
            header_start_line: None,
            header_end_line: None,
            brief: None,
            doc_comment: None,
            is_template: false,
            template_parameters: Vec::new(),
            template_kind: TemplateKind::Primary,
            primary_template_usr: None,
            is_definition: false,
            calls: Vec::new(),
            called_by: Vec::new(),
        }
    }

    /// Line span of the resolved location.
    pub fn span(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line)
    }
}

/// Kind of a type alias declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasKind {
    Using,
    Typedef,
}

impl AliasKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Using => "using",
            Self::Typedef => "typedef",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "using" => Some(Self::Using),
            "typedef" => Some(Self::Typedef),
            _ => None,
        }
    }
}

/// A `using X = Y;` or `typedef Y X;` declaration.
///
/// `canonical_type` is the parser's fully resolved type, so chains like
/// `A -> B -> Real` collapse to `Real` without any work on our side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeAlias {
    pub alias_name: String,
    pub qualified_name: String,
    pub target_type: String,
    pub canonical_type: String,
    pub namespace: String,
    pub alias_kind: AliasKind,
    /// Reserved; the extractor never sets this in the current version.
    #[serde(default)]
    pub is_template_alias: bool,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// A directed call edge with source coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    pub caller_usr: String,
    pub callee_usr: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// Metadata recorded per successfully indexed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub file_hash: String,
    pub compile_args_hash: String,
    pub indexed_at: u64,
    pub symbol_count: u64,
}

/// Records which source file first processed a header, and under which
/// compile-args hash. Prevents re-extracting an unchanged header from every
/// translation unit that includes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderClaim {
    pub header_path: String,
    pub processed_by: String,
    pub file_hash: String,
    pub compile_args_hash: String,
}

/// A recorded parse failure or diagnostic for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseErrorRecord {
    pub file_path: String,
    pub error_kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub file_hash: String,
    pub compile_args_hash: String,
    #[serde(default)]
    pub retry_count: u32,
    pub timestamp: u64,
}

/// Everything one worker extracted from one translation unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file: String,
    pub file_hash: String,
    pub compile_args_hash: String,
    pub symbols: Vec<Symbol>,
    pub aliases: Vec<TypeAlias>,
    pub call_sites: Vec<CallSite>,
    /// Headers this worker extracted symbols from, to be claimed at flush.
    pub headers: Vec<HeaderClaim>,
    pub errors: Vec<ParseErrorRecord>,
}

/// Snapshot of indexing progress, readable at any time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total_files: u64,
    pub indexed_files: u64,
    pub failed_files: u64,
    pub cache_hits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    pub start_time: u64,
}

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerState {
    #[default]
    Uninitialized,
    LoadingCache,
    ReadyFromCache,
    Indexing,
    Indexed,
    Error,
}

impl AnalyzerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::LoadingCache => "loading_cache",
            Self::ReadyFromCache => "ready_from_cache",
            Self::Indexing => "indexing",
            Self::Indexed => "indexed",
            Self::Error => "error",
        }
    }
}

/// Truncate a brief description to [`BRIEF_MAX_CHARS`] characters.
///
/// When truncation happens, the final three characters are `...` and the
/// result is exactly the maximum length.
pub fn truncate_brief(text: &str) -> String {
    truncate_with_ellipsis(text, BRIEF_MAX_CHARS)
}

/// Truncate a documentation comment to [`DOC_MAX_CHARS`] characters.
pub fn truncate_doc(text: &str) -> String {
    truncate_with_ellipsis(text, DOC_MAX_CHARS)
}

fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars - 3).collect();
    out.push_str("...");
    out
}

/// Normalize a base-class name: strip elaborated `class `/`struct ` keywords
/// and collapse whitespace runs.
pub fn normalize_base_class(name: &str) -> String {
    let trimmed = name.trim();
    let stripped = trimmed
        .strip_prefix("class ")
        .or_else(|| trimmed.strip_prefix("struct "))
        .unwrap_or(trimmed);
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_kind_round_trip() {
        for kind in [
            SymbolKind::Class,
            SymbolKind::Struct,
            SymbolKind::Function,
            SymbolKind::Method,
            SymbolKind::ClassTemplate,
            SymbolKind::PartialSpecialization,
            SymbolKind::FunctionTemplate,
            SymbolKind::Using,
            SymbolKind::Typedef,
        ] {
            assert_eq!(SymbolKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SymbolKind::parse("enum"), None);
    }

    #[test]
    fn brief_within_limit_untouched() {
        let text = "Short brief.";
        assert_eq!(truncate_brief(text), text);
    }

    #[test]
    fn brief_truncated_to_exact_length() {
        let text = "x".repeat(500);
        let out = truncate_brief(&text);
        assert_eq!(out.chars().count(), BRIEF_MAX_CHARS);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn doc_truncated_to_exact_length() {
        let text = "y".repeat(DOC_MAX_CHARS + 1);
        let out = truncate_doc(&text);
        assert_eq!(out.chars().count(), DOC_MAX_CHARS);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn doc_at_limit_untouched() {
        let text = "z".repeat(DOC_MAX_CHARS);
        assert_eq!(truncate_doc(&text), text);
    }

    #[test]
    fn base_class_normalization() {
        assert_eq!(normalize_base_class("class Base"), "Base");
        assert_eq!(normalize_base_class("struct  ns::Base"), "ns::Base");
        assert_eq!(normalize_base_class("  Base<int,  float> "), "Base<int, float>");
        assert_eq!(normalize_base_class("Base"), "Base");
    }

    #[test]
    fn symbol_new_defaults() {
        let s = Symbol::new("c:@S@Foo", "Foo", SymbolKind::Class, "/p/foo.h", 3, 7);
        assert_eq!(s.qualified_name, "Foo");
        assert_eq!(s.start_line, 3);
        assert_eq!(s.end_line, 3);
        assert!(!s.is_definition);
        assert!(s.parent_class.is_empty());
        assert_eq!(s.template_kind, TemplateKind::Primary);
    }

    #[test]
    fn analyzer_state_tags() {
        assert_eq!(AnalyzerState::ReadyFromCache.as_str(), "ready_from_cache");
        assert_eq!(AnalyzerState::default(), AnalyzerState::Uninitialized);
    }
}
