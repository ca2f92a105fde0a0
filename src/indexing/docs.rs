//! Documentation text handling: docstring cleanup, `#` comments, string
//! literal evaluation, and project-description normalization.
//!
//! RST-to-Markdown conversion itself is an external collaborator; this
//! module only detects RST so the caller can log it.

use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;
use tree_sitter::Node;

use crate::types::Documentation;

const NODE_STRING: &str = "string";
const NODE_STRING_CONTENT: &str = "string_content";
const NODE_ESCAPE_SEQUENCE: &str = "escape_sequence";
const NODE_CONCATENATED_STRING: &str = "concatenated_string";

/// References, literal blocks, definitions, and inline literals.
const RST_ROLE: &str =
    r"(:[a-zA-Z]+:`)|(::\n)|((^|\n)\.\. )|([^`]``[^`]+``[^`])";

fn rst_role() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(RST_ROLE).expect("RST_ROLE pattern is valid"))
}

pub fn is_rst(src: &str) -> bool {
    rst_role().is_match(src)
}

/// Normalize a registry-provided project description for display.
pub fn describe(src: &str) -> Documentation {
    let text = cleandoc(src);
    if is_rst(&text) {
        debug!("description looks like RST; leaving conversion to the renderer");
    }
    text
}

/// Equivalent of Python's `inspect.cleandoc`: strip leading whitespace from
/// the first line, remove the common indentation of the remaining lines, and
/// drop leading/trailing blank lines.
pub fn cleandoc(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let margin = lines
        .iter()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut cleaned: Vec<String> = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if i == 0 {
            cleaned.push(line.trim().to_string());
        } else {
            let cut = margin.min(line.len() - line.trim_start().len());
            cleaned.push(line[cut..].trim_end().to_string());
        }
    }

    while cleaned.first().is_some_and(|line| line.is_empty()) {
        cleaned.remove(0);
    }
    while cleaned.last().is_some_and(|line| line.is_empty()) {
        cleaned.pop();
    }
    cleaned.join("\n")
}

/// The text of a `# comment` node, without the hash and surrounding space.
pub fn comment_text(node: Node, code: &str) -> Documentation {
    let raw = &code[node.byte_range()];
    raw.strip_prefix('#').unwrap_or(raw).trim_start().to_string()
}

/// Comments on the lines immediately preceding `node`, top to bottom.
pub fn leading_comments(node: Node, code: &str) -> Vec<Documentation> {
    let mut comments = Vec::new();
    let mut current = node.prev_sibling();
    while let Some(sibling) = current {
        if sibling.kind() != "comment" {
            break;
        }
        comments.push(comment_text(sibling, code));
        current = sibling.prev_sibling();
    }
    comments.reverse();
    comments
}

/// The evaluated text of a string (or implicitly concatenated string)
/// literal node. Escape sequences are kept verbatim.
pub fn string_value(node: Node, code: &str) -> Option<String> {
    match node.kind() {
        NODE_STRING => {
            let mut out = String::new();
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                match child.kind() {
                    NODE_STRING_CONTENT | NODE_ESCAPE_SEQUENCE => {
                        out.push_str(&code[child.byte_range()]);
                    }
                    _ => {}
                }
            }
            Some(out)
        }
        NODE_CONCATENATED_STRING => {
            let mut out = String::new();
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                out.push_str(&string_value(child, code)?);
            }
            Some(out)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleandoc_strips_common_margin() {
        let text = "Summary line.\n\n        Details here,\n        indented.\n";
        assert_eq!(cleandoc(text), "Summary line.\n\nDetails here,\nindented.");
    }

    #[test]
    fn cleandoc_handles_single_line() {
        assert_eq!(cleandoc("   hello   "), "hello");
        assert_eq!(cleandoc(""), "");
    }

    #[test]
    fn detects_rst_roles() {
        assert!(is_rst("See :func:`foo` for details"));
        assert!(is_rst("Example::\nfoo"));
        assert!(is_rst("\n.. note:: careful"));
        assert!(!is_rst("# Plain markdown\n\nNothing to see."));
    }
}
