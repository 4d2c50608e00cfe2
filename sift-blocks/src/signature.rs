// Structural signatures: a typed view of a syntax subtree that ignores layout.
//
// The signature keeps node kinds, field labels, identifier/literal text and
// every anonymous token, and drops whitespace and comments. Nested function
// bodies collapse to `Signature::NestedBody`, so a block's signature only
// changes when code owned by that block changes.

use std::fmt;
use std::fmt::Write as _;

use tree_sitter::Node;

/// Tagged intermediate representation of one syntax subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    /// Interior node with its children, labelled by grammar field when present.
    Node {
        kind: &'static str,
        children: Vec<Field>,
    },
    /// Named leaf (identifier, literal, string content) with its source text.
    Leaf { kind: &'static str, text: String },
    /// Anonymous token such as a keyword or operator.
    Token(&'static str),
    /// Body of a nested function, tracked by that function's own block.
    NestedBody,
}

/// A child slot of a [`Signature::Node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: Option<&'static str>,
    pub value: Signature,
}

impl Signature {
    /// Build the signature of `node`. Every `function_definition` below (or at)
    /// `node` has its `body` replaced by [`Signature::NestedBody`].
    pub fn of(node: Node<'_>, source: &str) -> Self {
        SignatureBuilder::new(source).visit(node)
    }

    /// Render to the canonical text that block checksums are computed from.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node { kind, children } => {
                f.write_str(kind)?;
                f.write_char('(')?;
                for (i, field) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_char(' ')?;
                    }
                    if let Some(name) = field.name {
                        write!(f, "{name}=")?;
                    }
                    write!(f, "{}", field.value)?;
                }
                f.write_char(')')
            }
            Self::Leaf { kind, text } => write!(f, "{kind}:{text:?}"),
            Self::Token(kind) => write!(f, "'{kind}'"),
            Self::NestedBody => f.write_str("<nested body>"),
        }
    }
}

// ── Visitor ────────────────────────────────────────────────────────

struct SignatureBuilder<'a> {
    source: &'a str,
}

impl<'a> SignatureBuilder<'a> {
    fn new(source: &'a str) -> Self {
        Self { source }
    }

    fn text(&self, node: Node<'_>) -> &'a str {
        self.source.get(node.byte_range()).unwrap_or_default()
    }

    fn visit(&self, node: Node<'_>) -> Signature {
        if node.child_count() == 0 {
            return if node.is_named() {
                Signature::Leaf {
                    kind: node.kind(),
                    text: self.text(node).to_string(),
                }
            } else {
                Signature::Token(node.kind())
            };
        }
        // String content around escape sequences is not a child node.
        if self.has_uncovered_text(node) {
            return Signature::Leaf {
                kind: node.kind(),
                text: self.text(node).to_string(),
            };
        }

        let collapses_body = node.kind() == "function_definition";
        let mut children = Vec::with_capacity(node.child_count());
        let mut cursor = node.walk();
        if cursor.goto_first_child() {
            loop {
                let child = cursor.node();
                if !child.is_extra() {
                    let name = cursor.field_name();
                    let value = if collapses_body && name == Some("body") {
                        Signature::NestedBody
                    } else {
                        self.visit(child)
                    };
                    children.push(Field { name, value });
                }
                if !cursor.goto_next_sibling() {
                    break;
                }
            }
        }

        Signature::Node {
            kind: node.kind(),
            children,
        }
    }
}

impl SignatureBuilder<'_> {
    /// Whether `node` spans non-whitespace text that none of its children do.
    fn has_uncovered_text(&self, node: Node<'_>) -> bool {
        let gap = |start: usize, end: usize| {
            self.source
                .get(start..end)
                .is_some_and(|text| !text.trim().is_empty())
        };
        let mut offset = node.start_byte();
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if gap(offset, child.start_byte()) {
                return true;
            }
            offset = child.end_byte();
        }
        gap(offset, node.end_byte())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> tree_sitter::Tree {
        let mut parser = tree_sitter::Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .unwrap();
        parser.parse(source, None).unwrap()
    }

    fn nested_bodies(sig: &Signature) -> usize {
        match sig {
            Signature::NestedBody => 1,
            Signature::Node { children, .. } => {
                children.iter().map(|f| nested_bodies(&f.value)).sum()
            }
            Signature::Leaf { .. } | Signature::Token(_) => 0,
        }
    }

    fn module_signature(source: &str) -> String {
        let tree = parse(source);
        Signature::of(tree.root_node(), source).render()
    }

    #[test]
    fn layout_and_comments_are_ignored() {
        let a = module_signature("x = foo(1, 2)\n");
        let b = module_signature("x   =   foo( 1,\n   2 )  # call foo\n");
        assert_eq!(a, b);
    }

    #[test]
    fn identifier_change_is_visible() {
        let a = module_signature("x = foo(1)\n");
        let b = module_signature("x = bar(1)\n");
        assert_ne!(a, b);
    }

    #[test]
    fn operator_change_is_visible() {
        let a = module_signature("y = a + b\n");
        let b = module_signature("y = a - b\n");
        assert_ne!(a, b);
    }

    #[test]
    fn nested_function_body_is_collapsed() {
        let a = module_signature("def f(a):\n    return a + 1\n");
        let b = module_signature("def f(a):\n    print('changed')\n    return a * 2\n");
        assert_eq!(a, b, "body edits must not reach the enclosing signature");
        assert!(a.contains("<nested body>"));
    }

    #[test]
    fn function_header_change_is_visible() {
        let a = module_signature("def f(a):\n    return a\n");
        let b = module_signature("def f(a, b):\n    return a\n");
        let c = module_signature("def g(a):\n    return a\n");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn methods_collapse_inside_class() {
        let source = "class A:\n    x = 1\n    def m(self):\n        return 1\n    def n(self):\n        return 2\n";
        let tree = parse(source);
        let sig = Signature::of(tree.root_node(), source);
        assert_eq!(nested_bodies(&sig), 2);
    }

    #[test]
    fn string_content_is_visible() {
        let a = module_signature("print(\"a\")\n");
        let b = module_signature("print(\"b\")\n");
        assert_ne!(a, b);
    }

    #[test]
    fn string_text_around_escapes_is_visible() {
        let a = module_signature("print(\"hello\\n\")\n");
        let b = module_signature("print(\"goodbye\\n\")\n");
        assert_ne!(a, b);
        assert!(a.contains("hello"));
    }

    #[test]
    fn slice_bounds_are_visible() {
        let a = module_signature("y = x[1:]\n");
        let b = module_signature("y = x[:1]\n");
        assert_ne!(a, b);
    }

    #[test]
    fn relative_import_depth_is_visible() {
        let a = module_signature("from . import m\n");
        let b = module_signature("from .. import m\n");
        assert_ne!(a, b);
    }

    #[test]
    fn attribute_and_call_shapes_differ() {
        let a = module_signature("a.b(c)\n");
        let b = module_signature("a(b.c)\n");
        assert_ne!(a, b);
    }
}
