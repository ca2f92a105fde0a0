//! Resolves a single type-annotation expression to a [`Type`].
//!
//! A bare name goes through the lexical alias table first, then the builtin
//! namespace, and finally the cross-project symbol table. Anything the
//! resolver does not understand degrades to an unresolved ("dumb") type
//! carrying the rendered source text.

use std::collections::HashMap;
use tracing::warn;
use tree_sitter::{Node, Parser};

use crate::indexing::docs;
use crate::types::{FQName, ProjectName, SymbolTable, Type, XRef};

/// Lexical aliases visible at the point of the annotation.
pub type Bindings = HashMap<String, FQName>;

// Node kinds from the tree-sitter-python grammar.
const NODE_IDENTIFIER: &str = "identifier";
const NODE_ATTRIBUTE: &str = "attribute";
const NODE_SUBSCRIPT: &str = "subscript";
const NODE_STRING: &str = "string";
const NODE_ELLIPSIS: &str = "ellipsis";
const NODE_LIST: &str = "list";
const NODE_NONE: &str = "none";
const NODE_TRUE: &str = "true";
const NODE_FALSE: &str = "false";
const NODE_EXPRESSION_STATEMENT: &str = "expression_statement";
const NODE_TYPE: &str = "type";

/// Builtin callables commonly used in annotations. Sorted for binary search.
const BUILTIN_CALLABLES: &[&str] = &[
    "BaseException", "Exception", "bool", "bytearray", "bytes", "complex",
    "dict", "enumerate", "filter", "float", "frozenset", "int", "list",
    "map", "memoryview", "object", "property", "range", "set", "slice",
    "str", "super", "tuple", "type", "zip",
];

fn is_builtin_callable(name: &str) -> bool {
    BUILTIN_CALLABLES.binary_search(&name).is_ok()
}

/// Resolve an annotation expression node to a [`Type`].
pub fn resolve(node: Node, code: &str, bindings: &Bindings, symbols: &SymbolTable) -> Type {
    AnnotationResolver {
        code,
        bindings,
        symbols,
    }
    .resolve_node(node)
}

/// Resolve annotation source text, used for string-literal forward
/// references. Unparsable text yields an unresolved type.
pub fn resolve_source(source: &str, bindings: &Bindings, symbols: &SymbolTable) -> Type {
    let mut parser = Parser::new();
    if parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .is_err()
    {
        return Type::dumb(source);
    }
    let Some(tree) = parser.parse(source, None) else {
        warn!("Found unparseable annotation: '{source}'");
        return Type::dumb(source);
    };
    let root = tree.root_node();
    let expr = root
        .named_child(0)
        .filter(|n| n.kind() == NODE_EXPRESSION_STATEMENT)
        .and_then(|n| n.named_child(0));
    match expr {
        Some(expr) if !root.has_error() => resolve(expr, source, bindings, symbols),
        _ => {
            warn!("Found unparseable annotation: '{source}'");
            Type::dumb(source)
        }
    }
}

struct AnnotationResolver<'a> {
    code: &'a str,
    bindings: &'a Bindings,
    symbols: &'a SymbolTable,
}

impl AnnotationResolver<'_> {
    fn text(&self, node: Node) -> &str {
        &self.code[node.byte_range()]
    }

    fn dumb(&self, node: Node) -> Type {
        let code = self.text(node);
        warn!("Found unparseable annotation: '{code}'");
        Type::dumb(code)
    }

    fn resolve_node(&self, node: Node) -> Type {
        match node.kind() {
            // The grammar wraps annotation positions (return types,
            // parameter and assignment annotations) in a `type` node.
            NODE_TYPE => match node.named_child(0) {
                Some(inner) => self.resolve_node(inner),
                None => self.dumb(node),
            },
            NODE_IDENTIFIER => self.resolve_name(node),
            NODE_ATTRIBUTE => self.resolve_attribute(node),
            NODE_SUBSCRIPT => self.resolve_subscript(node),
            NODE_STRING => self.resolve_forward_ref(node),
            // Accepted without a warning: used inside Callable[...] and as
            // a default-value marker.
            NODE_ELLIPSIS => Type::dumb(self.text(node)),
            NODE_NONE | NODE_TRUE | NODE_FALSE => {
                let name = self.text(node);
                Type::new(
                    name,
                    XRef::new(FQName::new(name), Some(ProjectName::stdlib())),
                )
            }
            _ => self.dumb(node),
        }
    }

    fn resolve_name(&self, node: Node) -> Type {
        let name = self.text(node);
        if let Some(fqname) = self.bindings.get(name) {
            return Type::new(
                name,
                XRef::new(fqname.clone(), self.symbols.lookup(fqname)),
            );
        }
        if is_builtin_callable(name) {
            return Type::new(
                name,
                XRef::new(FQName::new(name), Some(ProjectName::stdlib())),
            );
        }
        let fqname = FQName::new(name);
        let project = self.symbols.lookup(&fqname);
        Type::new(name, XRef::new(fqname, project))
    }

    fn resolve_attribute(&self, node: Node) -> Type {
        let (Some(object), Some(attr)) = (
            node.child_by_field_name("object"),
            node.child_by_field_name("attribute"),
        ) else {
            return self.dumb(node);
        };
        let base = self.resolve_node(object);
        let attr = self.text(attr);
        let display = format!("{}.{attr}", base.name);
        match base.xref {
            None => Type::dumb(display),
            Some(xref) => {
                let fqname = xref.fqname.join(attr);
                let project = self.symbols.lookup(&fqname).or(xref.project);
                Type::new(display, XRef::new(fqname, project))
            }
        }
    }

    fn resolve_subscript(&self, node: Node) -> Type {
        let Some(value) = node.child_by_field_name("value") else {
            return self.dumb(node);
        };
        let base = self.resolve_node(value);
        // An unresolved base poisons the whole expression; the arguments
        // are not even looked at.
        if base.is_dumb() {
            return base;
        }

        let mut cursor = node.walk();
        let slices: Vec<Node> = node
            .children_by_field_name("subscript", &mut cursor)
            .collect();

        let generic = base
            .xref
            .as_ref()
            .map(|xref| xref.fqname.last().to_string())
            .unwrap_or_default();
        let params = match generic.as_str() {
            // Literal arguments are values, not types: captured verbatim.
            "Literal" => slices
                .iter()
                .map(|n| Type::dumb(self.text(*n)))
                .collect(),
            "Callable" => self.callable_params(&slices, node),
            _ => slices.iter().map(|n| self.resolve_node(*n)).collect(),
        };
        base.with_params(params)
    }

    /// `Callable[...]` expects exactly two slots: an argument list (`...`
    /// or a list of argument types) and a return type.
    fn callable_params(&self, slices: &[Node], node: Node) -> Vec<Type> {
        if slices.len() != 2 {
            warn!(
                "Malformed Callable annotation: '{}'",
                self.text(node)
            );
            return slices.iter().map(|n| self.dumb(*n)).collect();
        }
        let args = match slices[0].kind() {
            NODE_LIST => {
                let mut cursor = slices[0].walk();
                let elements = slices[0]
                    .named_children(&mut cursor)
                    .map(|n| self.resolve_node(n))
                    .collect();
                Type {
                    name: String::new(),
                    xref: None,
                    params: Some(elements),
                }
            }
            NODE_ELLIPSIS => Type::dumb(self.text(slices[0])),
            _ => self.dumb(slices[0]),
        };
        vec![args, self.resolve_node(slices[1])]
    }

    fn resolve_forward_ref(&self, node: Node) -> Type {
        match docs::string_value(node, self.code) {
            Some(source) => resolve_source(&source, self.bindings, self.symbols),
            None => self.dumb(node),
        }
    }
}
