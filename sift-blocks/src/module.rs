// Parsed modules and fingerprint creation.

use std::collections::HashSet;
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::block::{Block, Fingerprint};
use crate::{SourceKind, python};

/// Name given to the single block of a raw-text file.
pub const FILE_BLOCK_NAME: &str = "<file>";

/// One source file, decomposed into blocks on first access.
#[derive(Debug)]
pub struct Module {
    source: String,
    kind: SourceKind,
    blocks: OnceLock<Vec<Block>>,
    checksums: OnceLock<HashSet<i32>>,
}

impl Module {
    pub fn parse(source: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            source: source.into(),
            kind,
            blocks: OnceLock::new(),
            checksums: OnceLock::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Blocks of this module, module block first for Python sources.
    pub fn blocks(&self) -> &[Block] {
        self.blocks.get_or_init(|| self.decompose())
    }

    /// Block checksums in block order.
    pub fn checksums(&self) -> Vec<i32> {
        self.blocks().iter().map(Block::checksum).collect()
    }

    /// Whether every checksum of `fingerprint` still exists in this module.
    pub fn matches(&self, fingerprint: &Fingerprint) -> bool {
        let known = self
            .checksums
            .get_or_init(|| self.blocks().iter().map(Block::checksum).collect());
        fingerprint.checksums().iter().all(|c| known.contains(c))
    }

    fn decompose(&self) -> Vec<Block> {
        let line_count = self.source.lines().count();
        if line_count == 0 {
            return Vec::new();
        }

        if self.kind == SourceKind::Python {
            match python::parse_tree(&self.source) {
                Ok(Some(tree)) => {
                    let blocks = python::module_blocks(&tree, &self.source, line_count);
                    debug!(blocks = blocks.len(), lines = line_count, "Decomposed module");
                    return blocks;
                }
                Ok(None) => {
                    debug!(lines = line_count, "Syntax errors, using whole-file block");
                }
                Err(e) => {
                    warn!(error = %e, "Parser unavailable, using whole-file block");
                }
            }
        }

        vec![Block::new(1, line_count, FILE_BLOCK_NAME, self.source.clone())]
    }
}

/// Checksums of the blocks of `module` that contain at least one covered line.
///
/// Blocks are visited in start order and the covered lines in ascending order;
/// a single forward pointer skips lines that precede each block.
pub fn create_fingerprint(module: &Module, covered: impl IntoIterator<Item = usize>) -> Fingerprint {
    let mut lines: Vec<usize> = covered.into_iter().collect();
    lines.sort_unstable();
    lines.dedup();

    let mut blocks: Vec<&Block> = module.blocks().iter().collect();
    blocks.sort_by_key(|b| b.start);

    let mut checksums = Vec::new();
    let mut i = 0;
    for block in blocks {
        while i < lines.len() && lines[i] < block.start {
            i += 1;
        }
        if i == lines.len() {
            break;
        }
        if lines[i] <= block.end {
            checksums.push(block.checksum());
        }
    }
    Fingerprint::new(checksums)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const TWO_FUNCTIONS: &str = "\
def f(a):
    x = a + 1
    return x

def g(b):
    y = b * 2
    return y
";

    fn python(source: &str) -> Module {
        Module::parse(source, SourceKind::Python)
    }

    #[test]
    fn empty_file_has_no_blocks() {
        let module = python("");
        assert!(module.blocks().is_empty());
        assert!(create_fingerprint(&module, [1, 2]).is_empty());
    }

    #[test]
    fn empty_coverage_matches_anything() {
        let fp = create_fingerprint(&python(TWO_FUNCTIONS), []);
        assert!(fp.is_empty());
        assert!(python("completely = 'different'\n").matches(&fp));
    }

    #[test]
    fn def_lines_select_only_module_block() {
        let module = python(TWO_FUNCTIONS);
        let fp = create_fingerprint(&module, [1, 5]);
        assert_eq!(fp.checksums(), &[module.blocks()[0].checksum()]);
    }

    #[test]
    fn body_line_selects_module_and_function() {
        let module = python(TWO_FUNCTIONS);
        let fp = create_fingerprint(&module, [1, 2, 3, 5]);
        assert_eq!(fp.len(), 2);
        assert_eq!(fp.checksums()[1], module.blocks()[1].checksum());
    }

    #[test]
    fn editing_other_function_keeps_fingerprint() {
        let fp = create_fingerprint(&python(TWO_FUNCTIONS), [1, 2, 3, 5]);
        let edited = TWO_FUNCTIONS.replace("b * 2", "b * 3");
        assert!(python(&edited).matches(&fp));
    }

    #[test]
    fn editing_covered_function_breaks_fingerprint() {
        let fp = create_fingerprint(&python(TWO_FUNCTIONS), [1, 2, 3, 5]);
        let edited = TWO_FUNCTIONS.replace("a + 1", "a + 2");
        assert!(!python(&edited).matches(&fp));
    }

    #[test]
    fn renaming_unexecuted_function_breaks_module_block() {
        let fp = create_fingerprint(&python(TWO_FUNCTIONS), [1, 5]);
        let renamed = TWO_FUNCTIONS.replace("def g(b)", "def h(b)");
        assert!(!python(&renamed).matches(&fp));
    }

    #[test]
    fn editing_covered_escaped_string_breaks_fingerprint() {
        let source = "def greet():\n    print(\"hello\\n\")\n";
        let fp = create_fingerprint(&python(source), [1, 2]);
        let edited = source.replace("hello", "goodbye");
        assert!(!python(&edited).matches(&fp));
    }

    #[test]
    fn editing_covered_slice_bounds_breaks_fingerprint() {
        let source = "def head(x):\n    return x[1:]\n";
        let fp = create_fingerprint(&python(source), [1, 2]);
        let edited = source.replace("x[1:]", "x[:1]");
        assert!(!python(&edited).matches(&fp));
    }

    #[test]
    fn whitespace_and_comments_keep_fingerprint() {
        let fp = create_fingerprint(&python(TWO_FUNCTIONS), [1, 2, 3, 5]);
        let reformatted = TWO_FUNCTIONS.replace("x = a + 1", "x  =  a+1  # bump");
        assert!(python(&reformatted).matches(&fp));
    }

    #[test]
    fn syntax_error_falls_back_to_whole_file() {
        let module = python("def broken(:\n    pass\n");
        assert_eq!(module.blocks().len(), 1);
        let block = &module.blocks()[0];
        assert_eq!((block.start, block.end), (1, 2));
        assert_eq!(block.name, FILE_BLOCK_NAME);
        assert_eq!(block.code, module.source());
    }

    #[test]
    fn text_files_are_one_raw_block() {
        let doc = "This is a doctest\n>>> 1 + 1\n2\n";
        let module = Module::parse(doc, SourceKind::Text);
        assert_eq!(module.blocks().len(), 1);
        let fp = create_fingerprint(&module, [2]);
        assert!(module.matches(&fp));
        let changed = Module::parse(doc.replace('2', "3"), SourceKind::Text);
        assert!(!changed.matches(&fp));
    }

    #[test]
    fn duplicate_and_unsorted_lines_are_tolerated() {
        let module = python(TWO_FUNCTIONS);
        let a = create_fingerprint(&module, [6, 2, 2, 1]);
        let b = create_fingerprint(&module, [1, 2, 6]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    fn line_sets() -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(0usize..12, 0..10)
    }

    proptest! {
        #[test]
        fn fingerprint_matches_its_own_module(lines in line_sets()) {
            let module = python(TWO_FUNCTIONS);
            let fp = create_fingerprint(&module, lines);
            prop_assert!(module.matches(&fp));
        }

        #[test]
        fn narrowing_coverage_narrows_fingerprint(a in line_sets(), b in line_sets()) {
            let module = python(TWO_FUNCTIONS);
            let narrow = create_fingerprint(&module, a.clone());
            let wide = create_fingerprint(&module, a.into_iter().chain(b));
            prop_assert!(narrow.checksums().iter().all(|c| wide.checksums().contains(c)));
        }

        #[test]
        fn edits_outside_covered_blocks_are_invisible(lines in prop::collection::vec(2usize..4, 0..4)) {
            let fp = create_fingerprint(&python(TWO_FUNCTIONS), lines.into_iter().chain([1]));
            let edited = TWO_FUNCTIONS.replace("return y", "return y + 1");
            prop_assert!(python(&edited).matches(&fp));
        }

        #[test]
        fn deleting_a_covered_block_invalidates(extra in line_sets()) {
            let fp = create_fingerprint(&python(TWO_FUNCTIONS), extra.into_iter().chain([6]));
            let without_g = "def f(a):\n    x = a + 1\n    return x\n";
            prop_assert!(!python(without_g).matches(&fp));
        }
    }
}
