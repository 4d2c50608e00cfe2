// Python block decomposition.
//
// A parsed Python file becomes one module block plus one block per function or
// method. A function block starts at the first statement of its body and ends
// on the line before the next statement of the enclosing statement list (the
// enclosing list's own end for the last statement, end of file at top level).

use tree_sitter::{Node, Parser, Tree};

use crate::block::Block;
use crate::signature::Signature;
use crate::{BlockError, Result};

/// Name given to the module-level block.
pub const MODULE_BLOCK_NAME: &str = "<module>";

/// Parse `source` with the Python grammar.
///
/// Returns `Ok(None)` when the tree contains syntax errors; callers fall back
/// to a whole-file block in that case.
pub fn parse_tree(source: &str) -> Result<Option<Tree>> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| BlockError::TreeSitter(e.to_string()))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| BlockError::TreeSitter("parser returned no tree".to_string()))?;
    if tree.root_node().has_error() {
        return Ok(None);
    }
    Ok(Some(tree))
}

/// Decompose a parsed Python module into blocks, module block first.
pub fn module_blocks(tree: &Tree, source: &str, line_count: usize) -> Vec<Block> {
    if line_count == 0 {
        return Vec::new();
    }

    let root = tree.root_node();
    let start = statements(root).first().map_or(1, |stmt| line_of(*stmt));
    let module_block = Block::new(
        start,
        line_count,
        MODULE_BLOCK_NAME,
        Signature::of(root, source).render(),
    );

    let mut blocks = vec![module_block];
    let mut context: Vec<String> = Vec::new();
    collect_functions(root, source, line_count, &mut context, &mut blocks);
    blocks
}

/// Walk `node`, emitting a block for each function definition found.
///
/// `end` is the last line the current node may claim.
fn collect_functions(
    node: Node<'_>,
    source: &str,
    end: usize,
    context: &mut Vec<String>,
    blocks: &mut Vec<Block>,
) {
    match node.kind() {
        "module" | "block" => {
            let stmts = statements(node);
            for (i, stmt) in stmts.iter().enumerate() {
                let stmt_end = stmts
                    .get(i + 1)
                    .map_or(end, |next| line_of(*next).saturating_sub(1));
                collect_functions(*stmt, source, stmt_end, context, blocks);
            }
        }
        "function_definition" => {
            let name = node
                .child_by_field_name("name")
                .and_then(|n| source.get(n.byte_range()))
                .unwrap_or("<lambda>")
                .to_string();
            let Some(body) = node.child_by_field_name("body") else {
                return;
            };
            let start = statements(body)
                .first()
                .map_or_else(|| line_of(body), |stmt| line_of(*stmt));

            context.push(name);
            blocks.push(Block::new(
                start,
                end.max(start),
                context.join("."),
                Signature::of(body, source).render(),
            ));
            collect_functions(body, source, end, context, blocks);
            context.pop();
        }
        "class_definition" => {
            let name = node
                .child_by_field_name("name")
                .and_then(|n| source.get(n.byte_range()))
                .unwrap_or_default()
                .to_string();
            context.push(name);
            if let Some(body) = node.child_by_field_name("body") {
                collect_functions(body, source, end, context, blocks);
            }
            context.pop();
        }
        _ => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                if !child.is_extra() {
                    collect_functions(child, source, end, context, blocks);
                }
            }
        }
    }
}

/// Statement children of a statement list, skipping comments.
fn statements(list: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = list.walk();
    list.named_children(&mut cursor)
        .filter(|child| !child.is_extra())
        .collect()
}

/// 1-based line of a node's first byte.
fn line_of(node: Node<'_>) -> usize {
    node.start_position().row + 1
}
