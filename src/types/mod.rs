//! Core data model for crawled projects and their symbol indexes.
//!
//! Everything here serializes with serde; a [`Project`] is the unit of
//! caching and is written as one JSON document per normalized name.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Owner assigned to symbols that belong to Python itself (builtins and the
/// standard library) rather than to any crawled project.
pub const STDLIB_PROJECT: &str = "__std__";

/// A registry package identifier.
///
/// Identity is case- and separator-insensitive: two names are equal iff
/// lower-casing and collapsing runs of `-`, `_`, `.` into a single `-`
/// produce the same string. The raw spelling is kept for display and
/// serialization; the cache, symbol table, and dependency graph all key on
/// the normalized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectName(String);

impl ProjectName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical form: lowercase, runs of `-`/`_`/`.` collapsed to `-`.
    pub fn normalized(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        let mut prev_sep = false;
        for ch in self.0.chars() {
            if matches!(ch, '-' | '_' | '.') {
                if !prev_sep {
                    out.push('-');
                }
                prev_sep = true;
            } else {
                out.extend(ch.to_lowercase());
                prev_sep = false;
            }
        }
        out
    }

    pub fn stdlib() -> Self {
        Self(STDLIB_PROJECT.to_string())
    }
}

impl PartialEq for ProjectName {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for ProjectName {}

impl Hash for ProjectName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl PartialOrd for ProjectName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProjectName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().cmp(&other.normalized())
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProjectName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Dotted fully-qualified symbol path, e.g. `pkg.mod.Class.method`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FQName(String);

impl FQName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The leading dotted component (`pkg` for `pkg.mod.Class`).
    pub fn head(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// The trailing component (`Class` for `pkg.mod.Class`).
    pub fn last(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or("")
    }

    pub fn join(&self, segment: &str) -> FQName {
        if self.0.is_empty() {
            FQName::new(segment)
        } else {
            FQName::new(format!("{}.{segment}", self.0))
        }
    }
}

impl fmt::Display for FQName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FQName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FQName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Python standard-library top-level module names recognized by the
/// symbol-table fallback. Sorted for binary search.
const STDLIB_MODULES: &[&str] = &[
    "abc", "argparse", "array", "ast", "asyncio", "base64", "bisect",
    "builtins", "calendar", "collections", "concurrent", "configparser",
    "contextlib", "contextvars", "copy", "csv", "ctypes", "dataclasses",
    "datetime", "decimal", "difflib", "dis", "email", "enum", "errno",
    "fnmatch", "fractions", "functools", "gc", "getpass", "glob", "gzip",
    "hashlib", "heapq", "hmac", "html", "http", "importlib", "inspect",
    "io", "ipaddress", "itertools", "json", "keyword", "linecache",
    "locale", "logging", "math", "mimetypes", "multiprocessing", "numbers",
    "operator", "os", "pathlib", "pickle", "platform", "pprint", "queue",
    "random", "re", "secrets", "select", "shlex", "shutil", "signal",
    "site", "socket", "sqlite3", "ssl", "stat", "statistics", "string",
    "struct", "subprocess", "sys", "sysconfig", "tarfile", "tempfile",
    "textwrap", "threading", "time", "timeit", "token", "tokenize",
    "traceback", "types", "typing", "unicodedata", "unittest", "urllib",
    "uuid", "venv", "warnings", "weakref", "xml", "zipfile", "zlib",
    "zoneinfo",
];

pub fn is_stdlib_module(name: &str) -> bool {
    STDLIB_MODULES.binary_search(&name).is_ok()
}

/// Cross-project symbol table: fully-qualified name to owning project.
///
/// A lookup miss falls back to the synthetic standard-library owner when
/// the leading dotted component names a known built-in module.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: HashMap<FQName, ProjectName>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fqname: FQName, project: ProjectName) {
        self.symbols.insert(fqname, project);
    }

    pub fn lookup(&self, fqname: &FQName) -> Option<ProjectName> {
        if let Some(project) = self.symbols.get(fqname) {
            return Some(project.clone());
        }
        if is_stdlib_module(fqname.head()) {
            return Some(ProjectName::stdlib());
        }
        None
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Free-form documentation text attached to a declaration.
pub type Documentation = String;

/// A symbol reference annotated with its owning project, if known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XRef {
    pub fqname: FQName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectName>,
}

impl XRef {
    pub fn new(fqname: FQName, project: Option<ProjectName>) -> Self {
        Self { fqname, project }
    }
}

/// A resolved (or deliberately unresolved, "dumb") type annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Type {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xref: Option<XRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Type>>,
}

impl Type {
    pub fn new(name: impl Into<String>, xref: XRef) -> Self {
        Self {
            name: name.into(),
            xref: Some(xref),
            params: None,
        }
    }

    /// An unresolved type: the rendered source text with no reference.
    pub fn dumb(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            xref: None,
            params: None,
        }
    }

    pub fn with_params(mut self, params: Vec<Type>) -> Self {
        self.params = Some(params);
        self
    }

    /// Dumb types are propagated as-is, never resolved further.
    pub fn is_dumb(&self) -> bool {
        self.xref.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<Type>,
    #[serde(default)]
    pub has_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: FQName,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<Type>,
    #[serde(default)]
    pub documentation: Vec<Documentation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: FQName,
    pub asynchronous: bool,
    pub params: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<Type>,
    #[serde(default)]
    pub documentation: Vec<Documentation>,
}

/// Instance variables are intentionally not modeled; only what is statically
/// visible in the class body is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub name: FQName,
    pub bases: Vec<String>,
    pub methods: Vec<Function>,
    pub class_variables: Vec<Variable>,
    pub inner_classes: Vec<Class>,
    #[serde(default)]
    pub documentation: Vec<Documentation>,
}

/// A name visible from outside its module, either re-exported via `__all__`
/// or imported at package scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Export {
    pub name: FQName,
    pub xref: XRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: FQName,
    #[serde(default)]
    pub documentation: Vec<Documentation>,
    pub functions: Vec<Function>,
    pub variables: Vec<Variable>,
    pub classes: Vec<Class>,
    pub exports: Vec<Export>,
}

impl Module {
    pub fn empty(name: FQName) -> Self {
        Self {
            name,
            documentation: Vec::new(),
            functions: Vec::new(),
            variables: Vec::new(),
            classes: Vec::new(),
            exports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub name: ProjectName,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifiers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Unix timestamp of the chosen artifact's upload; 0 when unknown.
    #[serde(default)]
    pub upload_time: i64,
}

/// The unit of caching: created once per resolved name, persisted as one
/// JSON document, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: ProjectName,
    pub metadata: ProjectMetadata,
    #[serde(default)]
    pub documentation: Vec<Documentation>,
    pub modules: Vec<Module>,
}

/// Summary manifest derived from the cache contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub generated_at: i64,
    /// At most five projects, newest upload first.
    pub latest_projects: Vec<ProjectMetadata>,
    /// At most five projects, most depended-upon first.
    pub top_projects: Vec<ProjectMetadata>,
    /// Every known project name, sorted by normalized form.
    pub all_project_names: Vec<ProjectName>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn project_name_case_insensitive() {
        assert_eq!(ProjectName::from("Foo"), ProjectName::from("foo"));
    }

    #[test]
    fn project_name_separator_insensitive() {
        assert_eq!(
            ProjectName::from("zope.interface"),
            ProjectName::from("Zope-Interface")
        );
        assert_eq!(ProjectName::from("foo__bar"), ProjectName::from("Foo-.bar"));
        assert_ne!(ProjectName::from("foo-bar"), ProjectName::from("foobar"));
    }

    #[test]
    fn project_name_spellings_share_a_map_slot() {
        let mut map = HashMap::new();
        map.insert(ProjectName::from("Zope.Interface"), 1);
        map.insert(ProjectName::from("zope-interface"), 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&ProjectName::from("ZOPE_INTERFACE")], 2);
    }

    #[test]
    fn fqname_components() {
        let name = FQName::from("pkg.mod.Class.method");
        assert_eq!(name.head(), "pkg");
        assert_eq!(name.last(), "method");
        assert_eq!(name.join("x").as_str(), "pkg.mod.Class.method.x");
        assert_eq!(FQName::from("").join("x").as_str(), "x");
    }

    #[test]
    fn symbol_table_stdlib_fallback() {
        let mut table = SymbolTable::new();
        table.insert(FQName::from("foo.Foo"), ProjectName::from("foooid"));

        assert_eq!(
            table.lookup(&FQName::from("foo.Foo")),
            Some(ProjectName::from("foooid"))
        );
        assert_eq!(
            table.lookup(&FQName::from("typing.Callable")),
            Some(ProjectName::stdlib())
        );
        assert_eq!(table.lookup(&FQName::from("unknown.thing")), None);
    }

    #[test]
    fn stdlib_module_list_is_sorted() {
        let mut sorted = STDLIB_MODULES.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STDLIB_MODULES);
    }

    #[test]
    fn xref_roundtrip() {
        for project in [None, Some(ProjectName::from("alpha"))] {
            let xref = XRef::new(FQName::from("foo.bar.Foo"), project);
            let json = serde_json::to_string(&xref).unwrap();
            let back: XRef = serde_json::from_str(&json).unwrap();
            assert_eq!(back, xref);
        }
    }

    #[test]
    fn type_roundtrip() {
        let inner = Type::new("foo", XRef::new(FQName::from("foo"), None));
        let ty = Type::new(
            "bar",
            XRef::new(FQName::from("b.bar"), Some(ProjectName::from("b"))),
        )
        .with_params(vec![inner]);
        let json = serde_json::to_string(&ty).unwrap();
        let back: Type = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ty);
    }

    #[test]
    fn export_roundtrip() {
        let export = Export {
            name: FQName::from("a"),
            xref: XRef::new(FQName::from("dep.a"), Some(ProjectName::from("dep"))),
        };
        let json = serde_json::to_string(&export).unwrap();
        let back: Export = serde_json::from_str(&json).unwrap();
        assert_eq!(back, export);
    }
}
