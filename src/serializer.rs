//! Serializers turning a tree into test-case text.

use crate::rule::{NodeId, Tree};

pub type SerializerFn = fn(&Tree, NodeId) -> String;

/// Concatenates tokens separated by single spaces.
pub fn simple_space_serializer(tree: &Tree, root: NodeId) -> String {
    let mut out = String::new();
    for token in tree.tokens(root) {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(token);
    }
    out
}

/// Concatenates tokens without separators.
pub fn no_space_serializer(tree: &Tree, root: NodeId) -> String {
    tree.tokens(root).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Node, RuleSize};

    #[test]
    fn space_and_no_space() {
        let (mut t, root) = Tree::with_root(Node::unparser("S"));
        for src in ["foo", "bar"] {
            let leaf = t.add(Node::Unlexer {
                name: String::new(),
                src: src.to_string(),
                size: RuleSize::new(1, 1),
                immutable: false,
            });
            t.add_child(root, leaf);
        }
        assert_eq!(simple_space_serializer(&t, root), "foo bar");
        assert_eq!(no_space_serializer(&t, root), "foobar");
    }
}
