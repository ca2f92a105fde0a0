//! Scope-aware static indexer: turns one parsed Python file into a
//! [`Module`] of typed declarations, docs, and exports.
//!
//! Each class body is indexed in a child scope that inherits a *copy* of the
//! parent's lexical alias table, so bindings introduced inside a class never
//! leak upward. Function bodies are only scanned far enough to harvest a
//! docstring.

use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, error};
use tree_sitter::{Node, Parser};

use crate::indexing::annotation::{self, Bindings};
use crate::indexing::docs;
use crate::types::{
    Class, Documentation, Export, FQName, Function, Module, Parameter, SymbolTable, Type,
    Variable, XRef,
};

// Node kinds from the tree-sitter-python grammar.
const NODE_COMMENT: &str = "comment";
const NODE_CLASS_DEFINITION: &str = "class_definition";
const NODE_FUNCTION_DEFINITION: &str = "function_definition";
const NODE_DECORATED_DEFINITION: &str = "decorated_definition";
const NODE_IMPORT_STATEMENT: &str = "import_statement";
const NODE_IMPORT_FROM_STATEMENT: &str = "import_from_statement";
const NODE_FUTURE_IMPORT_STATEMENT: &str = "future_import_statement";
const NODE_EXPRESSION_STATEMENT: &str = "expression_statement";
const NODE_ASSIGNMENT: &str = "assignment";
const NODE_AUGMENTED_ASSIGNMENT: &str = "augmented_assignment";
const NODE_IDENTIFIER: &str = "identifier";
const NODE_ATTRIBUTE: &str = "attribute";
const NODE_DOTTED_NAME: &str = "dotted_name";
const NODE_ALIASED_IMPORT: &str = "aliased_import";
const NODE_WILDCARD_IMPORT: &str = "wildcard_import";
const NODE_RELATIVE_IMPORT: &str = "relative_import";
const NODE_IMPORT_PREFIX: &str = "import_prefix";
const NODE_STRING: &str = "string";
const NODE_CONCATENATED_STRING: &str = "concatenated_string";
const NODE_LIST: &str = "list";
const NODE_TUPLE: &str = "tuple";
const NODE_ASYNC: &str = "async";
const NODE_TYPED_PARAMETER: &str = "typed_parameter";
const NODE_DEFAULT_PARAMETER: &str = "default_parameter";
const NODE_TYPED_DEFAULT_PARAMETER: &str = "typed_default_parameter";
const NODE_LIST_SPLAT_PATTERN: &str = "list_splat_pattern";
const NODE_DICTIONARY_SPLAT_PATTERN: &str = "dictionary_splat_pattern";

const DUNDER_ALL: &str = "__all__";

/// Index one file on disk. The module name is derived from the path relative
/// to `base_dir`; `__init__.py` represents the containing package.
///
/// Parse failures are non-fatal: the result is an empty module whose
/// documentation describes the failure.
pub fn index_file(base_dir: &Path, path: &Path, symbols: &SymbolTable) -> Module {
    let relative = path.strip_prefix(base_dir).unwrap_or(path);
    let mut parts: Vec<String> = relative
        .with_extension("")
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let mut is_pkg = false;
    if parts.last().is_some_and(|last| last == "__init__") {
        parts.pop();
        is_pkg = true;
    }
    let name = FQName::new(parts.join("."));

    let code = match std::fs::read_to_string(path) {
        Ok(code) => code,
        Err(e) => {
            return failed_module(name, relative, &e.to_string());
        }
    };
    match index_source(name.clone(), is_pkg, &code, symbols) {
        Some(module) => module,
        None => failed_module(name, relative, "syntax errors"),
    }
}

fn failed_module(name: FQName, relative: &Path, cause: &str) -> Module {
    let err = format!("Failed to index {} due to {cause}", relative.display());
    error!("{err}");
    let mut module = Module::empty(name);
    module.documentation.push(err);
    module
}

/// Index already-loaded source text as the module `name`. Returns `None`
/// when the file does not parse.
pub fn index_source(
    name: FQName,
    is_pkg: bool,
    code: &str,
    symbols: &SymbolTable,
) -> Option<Module> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .ok()?;
    let tree = parser.parse(code, None)?;
    let root = tree.root_node();
    if root.has_error() {
        return None;
    }

    let mut indexer = SourceIndexer {
        code,
        is_pkg,
        scope: name.clone(),
        bindings: Bindings::new(),
        symbols,
        functions: Vec::new(),
        variables: Vec::new(),
        classes: Vec::new(),
        documentation: Vec::new(),
        exports: Vec::new(),
        dunder_all: None,
    };
    indexer.index_module(root);

    Some(Module {
        name,
        documentation: indexer.documentation,
        functions: indexer.functions,
        variables: indexer.variables,
        classes: indexer.classes,
        exports: indexer.exports,
    })
}

struct SourceIndexer<'a> {
    code: &'a str,
    is_pkg: bool,
    scope: FQName,
    bindings: Bindings,
    symbols: &'a SymbolTable,
    functions: Vec<Function>,
    variables: Vec<Variable>,
    classes: Vec<Class>,
    documentation: Vec<Documentation>,
    exports: Vec<Export>,
    dunder_all: Option<Vec<String>>,
}

impl<'a> SourceIndexer<'a> {
    fn text(&self, node: Node) -> &'a str {
        &self.code[node.byte_range()]
    }

    fn scoped(&self, name: &str) -> FQName {
        self.scope.join(name)
    }

    /// The dotted rendering of an identifier or attribute chain; `None` for
    /// anything else.
    fn dotted_name(&self, node: Node) -> Option<String> {
        match node.kind() {
            NODE_IDENTIFIER => Some(self.text(node).to_string()),
            NODE_ATTRIBUTE => {
                let base = self.dotted_name(node.child_by_field_name("object")?)?;
                let attr = self.text(node.child_by_field_name("attribute")?);
                Some(format!("{base}.{attr}"))
            }
            _ => None,
        }
    }

    fn index_module(&mut self, root: Node) {
        self.documentation.extend(body_docstring(root, self.code));
        self.documentation.extend(header_comments(root, self.code));
        self.index_body(root);
        self.gather_exports();
    }

    fn index_body(&mut self, body: Node) {
        let mut cursor = body.walk();
        for statement in body.named_children(&mut cursor) {
            self.index_statement(statement, statement);
        }
    }

    /// `comment_anchor` is where leading comments attach; for decorated
    /// definitions that is the outer `decorated_definition` node.
    fn index_statement(&mut self, statement: Node, comment_anchor: Node) {
        match statement.kind() {
            NODE_IMPORT_STATEMENT => self.handle_import(statement),
            NODE_IMPORT_FROM_STATEMENT => self.handle_import_from(statement),
            NODE_FUTURE_IMPORT_STATEMENT => {}
            NODE_CLASS_DEFINITION => self.handle_class(statement, comment_anchor),
            NODE_FUNCTION_DEFINITION => self.handle_function(statement, comment_anchor),
            NODE_DECORATED_DEFINITION => {
                if let Some(definition) = statement.child_by_field_name("definition") {
                    self.index_statement(definition, statement);
                }
            }
            NODE_EXPRESSION_STATEMENT => {
                let mut cursor = statement.walk();
                for expr in statement.named_children(&mut cursor) {
                    match expr.kind() {
                        NODE_ASSIGNMENT => self.handle_assignment(expr),
                        NODE_AUGMENTED_ASSIGNMENT => self.handle_augmented_assignment(expr),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    /// `import X` / `import X as Y`: only the alias introduces a new lexical
    /// name; a plain import binds the dotted path to itself.
    fn handle_import(&mut self, node: Node) {
        let mut cursor = node.walk();
        for item in node.named_children(&mut cursor) {
            match item.kind() {
                NODE_DOTTED_NAME => {
                    let name = self.text(item).to_string();
                    self.bindings.insert(name.clone(), FQName::new(name));
                }
                NODE_ALIASED_IMPORT => {
                    let (Some(name), Some(alias)) = (
                        item.child_by_field_name("name"),
                        item.child_by_field_name("alias"),
                    ) else {
                        continue;
                    };
                    self.bindings.insert(
                        self.text(alias).to_string(),
                        FQName::new(self.text(name)),
                    );
                }
                _ => {}
            }
        }
    }

    /// `from M import X [as Y]`; leading dots resolve against this module's
    /// own fully-qualified name. `import *` is not resolved into aliases.
    fn handle_import_from(&mut self, node: Node) {
        let Some(module_node) = node.child_by_field_name("module_name") else {
            return;
        };
        let from_mod = match module_node.kind() {
            NODE_DOTTED_NAME => self.text(module_node).to_string(),
            NODE_RELATIVE_IMPORT => {
                let mut dots = 0;
                let mut suffix = None;
                let mut cursor = module_node.walk();
                for child in module_node.children(&mut cursor) {
                    match child.kind() {
                        NODE_IMPORT_PREFIX => dots = self.text(child).len(),
                        NODE_DOTTED_NAME => suffix = Some(self.text(child).to_string()),
                        _ => {}
                    }
                }
                let mut base = self.scope.as_str().to_string();
                for _ in 1..dots {
                    base = base
                        .rsplit_once('.')
                        .map(|(head, _)| head.to_string())
                        .unwrap_or_default();
                }
                match suffix {
                    Some(suffix) if base.is_empty() => suffix,
                    Some(suffix) => format!("{base}.{suffix}"),
                    None => base,
                }
            }
            _ => return,
        };

        let mut cursor = node.walk();
        for item in node.children_by_field_name("name", &mut cursor) {
            if item.kind() == NODE_WILDCARD_IMPORT {
                return;
            }
            let (name, target) = match item.kind() {
                NODE_DOTTED_NAME | NODE_IDENTIFIER => {
                    let name = self.text(item).to_string();
                    (name.clone(), name)
                }
                NODE_ALIASED_IMPORT => {
                    let (Some(name), Some(alias)) = (
                        item.child_by_field_name("name"),
                        item.child_by_field_name("alias"),
                    ) else {
                        continue;
                    };
                    (self.text(name).to_string(), self.text(alias).to_string())
                }
                _ => continue,
            };
            let source = FQName::new(format!("{from_mod}.{name}"));
            self.bindings.insert(target.clone(), source.clone());
            // Names imported at package scope are implicit exports unless
            // __all__ overrides them later.
            if self.is_pkg {
                self.exports.push(Export {
                    name: self.scoped(&target),
                    xref: XRef::new(source.clone(), self.symbols.lookup(&source)),
                });
            }
        }
    }

    fn handle_class(&mut self, node: Node, comment_anchor: Node) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let unqualified = self.text(name_node).to_string();
        let my_name = self.scoped(&unqualified);
        self.bindings.insert(unqualified, my_name.clone());

        let mut bases = Vec::new();
        if let Some(superclasses) = node.child_by_field_name("superclasses") {
            let mut cursor = superclasses.walk();
            for arg in superclasses.named_children(&mut cursor) {
                if let Some(base) = self.dotted_name(arg) {
                    bases.push(base);
                }
            }
        }

        let mut documentation = Vec::new();
        let comments = docs::leading_comments(comment_anchor, self.code);
        let mut inner = SourceIndexer {
            code: self.code,
            is_pkg: false,
            scope: my_name.clone(),
            bindings: self.bindings.clone(),
            symbols: self.symbols,
            functions: Vec::new(),
            variables: Vec::new(),
            classes: Vec::new(),
            documentation: Vec::new(),
            exports: Vec::new(),
            dunder_all: None,
        };
        if let Some(body) = node.child_by_field_name("body") {
            documentation.extend(body_docstring(body, self.code));
            inner.index_body(body);
        }
        documentation.extend(comments);

        self.classes.push(Class {
            name: my_name,
            bases,
            methods: inner.functions,
            class_variables: inner.variables,
            inner_classes: inner.classes,
            documentation,
        });
    }

    /// The body is scanned only for its docstring, not for nested
    /// declarations.
    fn handle_function(&mut self, node: Node, comment_anchor: Node) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let my_name = self.scoped(self.text(name_node));
        let asynchronous = node
            .child(0)
            .is_some_and(|first| first.kind() == NODE_ASYNC);
        let returns = node
            .child_by_field_name("return_type")
            .map(|n| self.resolve_type(n));

        let mut params = Vec::new();
        if let Some(parameters) = node.child_by_field_name("parameters") {
            let mut cursor = parameters.walk();
            for param in parameters.named_children(&mut cursor) {
                if let Some(param) = self.extract_parameter(param) {
                    params.push(param);
                }
            }
        }

        let mut documentation = Vec::new();
        if let Some(body) = node.child_by_field_name("body") {
            documentation.extend(body_docstring(body, self.code));
        }
        documentation.extend(docs::leading_comments(comment_anchor, self.code));

        self.functions.push(Function {
            name: my_name,
            asynchronous,
            params,
            returns,
            documentation,
        });
    }

    fn extract_parameter(&self, node: Node) -> Option<Parameter> {
        match node.kind() {
            NODE_IDENTIFIER => Some(Parameter {
                name: self.text(node).to_string(),
                ty: None,
                has_default: false,
            }),
            NODE_LIST_SPLAT_PATTERN | NODE_DICTIONARY_SPLAT_PATTERN => {
                Some(Parameter {
                    name: self.splat_name(node)?,
                    ty: None,
                    has_default: false,
                })
            }
            NODE_TYPED_PARAMETER => {
                let inner = node.named_child(0)?;
                let name = match inner.kind() {
                    NODE_IDENTIFIER => self.text(inner).to_string(),
                    NODE_LIST_SPLAT_PATTERN | NODE_DICTIONARY_SPLAT_PATTERN => {
                        self.splat_name(inner)?
                    }
                    _ => return None,
                };
                let ty = node
                    .child_by_field_name("type")
                    .map(|n| self.resolve_type(n));
                Some(Parameter {
                    name,
                    ty,
                    has_default: false,
                })
            }
            NODE_DEFAULT_PARAMETER | NODE_TYPED_DEFAULT_PARAMETER => {
                let name_node = node.child_by_field_name("name")?;
                if name_node.kind() != NODE_IDENTIFIER {
                    return None;
                }
                let ty = node
                    .child_by_field_name("type")
                    .map(|n| self.resolve_type(n));
                // Only the presence of the default is recorded, not its
                // value.
                Some(Parameter {
                    name: self.text(name_node).to_string(),
                    ty,
                    has_default: node.child_by_field_name("value").is_some(),
                })
            }
            // Positional-only / keyword-only separators and anything
            // exotic.
            _ => None,
        }
    }

    fn splat_name(&self, node: Node) -> Option<String> {
        let inner = node.named_child(0)?;
        let stars = if node.kind() == NODE_DICTIONARY_SPLAT_PATTERN {
            "**"
        } else {
            "*"
        };
        Some(format!("{stars}{}", self.text(inner)))
    }

    fn resolve_type(&self, node: Node) -> Type {
        annotation::resolve(node, self.code, &self.bindings, self.symbols)
    }

    /// Single-target assignment to an unqualified or dotted name. Multi
    /// target and destructuring forms are unsupported and skipped.
    fn handle_assignment(&mut self, node: Node) {
        let Some(left) = node.child_by_field_name("left") else {
            return;
        };
        // Chained assignment (`a = b = ...`) counts as multi-target.
        if node
            .child_by_field_name("right")
            .is_some_and(|right| right.kind() == NODE_ASSIGNMENT)
        {
            return;
        }
        let annotation = node.child_by_field_name("type");

        if annotation.is_some() {
            // Annotated assignment only supports a plain name target.
            if left.kind() != NODE_IDENTIFIER {
                return;
            }
        }
        let Some(name) = self.dotted_name(left) else {
            debug!("Skipping unsupported assignment target");
            return;
        };
        if name == DUNDER_ALL {
            self.dunder_all = self
                .gather_string_list(node.child_by_field_name("right"))
                .or(self.dunder_all.take());
            return;
        }

        self.variables.push(Variable {
            name: self.scoped(&name),
            ty: annotation.map(|n| self.resolve_type(n)),
            documentation: Vec::new(),
        });
    }

    /// `__all__ += [...]` extends the export list; other augmented
    /// assignments are ignored.
    fn handle_augmented_assignment(&mut self, node: Node) {
        let Some(left) = node.child_by_field_name("left") else {
            return;
        };
        if self.text(left) != DUNDER_ALL {
            return;
        }
        if let Some(more) = self.gather_string_list(node.child_by_field_name("right")) {
            self.dunder_all.get_or_insert_with(Vec::new).extend(more);
        }
    }

    fn gather_string_list(&self, node: Option<Node>) -> Option<Vec<String>> {
        let node = node?;
        if !matches!(node.kind(), NODE_LIST | NODE_TUPLE) {
            return None;
        }
        let mut names = Vec::new();
        let mut cursor = node.walk();
        for element in node.named_children(&mut cursor) {
            if matches!(element.kind(), NODE_STRING | NODE_CONCATENATED_STRING) {
                if let Some(value) = docs::string_value(element, self.code) {
                    names.push(value);
                }
            }
        }
        Some(names)
    }

    /// An explicit `__all__` replaces any implicit re-exports gathered from
    /// package-scope imports.
    fn gather_exports(&mut self) {
        let Some(all) = self.dunder_all.take() else {
            return;
        };
        self.exports.clear();
        for name in all {
            let fqname = self
                .bindings
                .get(&name)
                .cloned()
                .unwrap_or_else(|| self.scoped(&name));
            self.exports.push(Export {
                name: self.scoped(&name),
                xref: XRef::new(fqname.clone(), self.symbols.lookup(&fqname)),
            });
        }
    }
}

/// The docstring of a module or an indented block: the first statement, if
/// it is a bare string literal, cleaned up like `inspect.cleandoc`.
fn body_docstring(body: Node, code: &str) -> Option<Documentation> {
    let mut cursor = body.walk();
    let first = body
        .named_children(&mut cursor)
        .find(|n| n.kind() != NODE_COMMENT)?;
    if first.kind() != NODE_EXPRESSION_STATEMENT {
        return None;
    }
    let expr = first.named_child(0)?;
    if !matches!(expr.kind(), NODE_STRING | NODE_CONCATENATED_STRING) {
        return None;
    }
    docs::string_value(expr, code).map(|text| docs::cleandoc(&text))
}

/// `#` comments at the very top of a file, before the first statement.
fn header_comments(root: Node, code: &str) -> Vec<Documentation> {
    let mut comments = Vec::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        if child.kind() == NODE_COMMENT {
            comments.push(docs::comment_text(child, code));
        } else {
            break;
        }
    }
    comments
}
