//! Tree codecs: conversion between trees and byte buffers.

use crate::rule::{Node, NodeId, RuleSize, Tree};
use serde::{Deserialize, Serialize};

/// Encode/decode contract. Decoding untrusted bytes reports failure as
/// `None`; buffer encoding reports overflow as 0.
pub trait TreeCodec {
    fn encode(&self, tree: &Tree, root: NodeId) -> Vec<u8>;

    fn encode_into(&self, tree: &Tree, root: NodeId, buf: &mut [u8]) -> usize {
        let bytes = self.encode(tree, root);
        if bytes.len() > buf.len() {
            return 0;
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        bytes.len()
    }

    fn decode(&self, data: &[u8]) -> Option<Tree>;
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// JSON wire form. Unbounded quantifier `stop` travels as `-1`.
#[derive(Serialize, Deserialize)]
#[serde(tag = "t")]
enum WireNode {
    #[serde(rename = "l")]
    Unlexer {
        n: String,
        s: String,
        z: (i32, i32),
        #[serde(default, skip_serializing_if = "is_false")]
        im: bool,
    },
    #[serde(rename = "p")]
    Unparser { n: String, c: Vec<WireNode> },
    #[serde(rename = "a")]
    Alternative { ai: i32, i: i32, c: Vec<WireNode> },
    #[serde(rename = "q")]
    Quantifier { i: i32, b: i32, e: i32, c: Vec<WireNode> },
    #[serde(rename = "qd")]
    Quantified { c: Vec<WireNode> },
}

/// JSON tree codec round-tripping every field of every variant.
pub struct JsonTreeCodec;

impl JsonTreeCodec {
    fn to_wire(tree: &Tree, id: NodeId) -> WireNode {
        let children = |tree: &Tree, id: NodeId| -> Vec<WireNode> {
            tree.children(id).iter().map(|&kid| Self::to_wire(tree, kid)).collect()
        };
        match tree.node(id) {
            Node::Unlexer { name, src, size, immutable } => WireNode::Unlexer {
                n: name.clone(),
                s: src.clone(),
                z: (size.depth, size.tokens),
                im: *immutable,
            },
            Node::Unparser { name } => {
                WireNode::Unparser { n: name.clone(), c: children(tree, id) }
            }
            Node::Alternative { alt_idx, idx } => {
                WireNode::Alternative { ai: *alt_idx, i: *idx, c: children(tree, id) }
            }
            Node::Quantifier { idx, start, stop } => WireNode::Quantifier {
                i: *idx,
                b: *start,
                e: if *stop == i32::MAX { -1 } else { *stop },
                c: children(tree, id),
            },
            Node::Quantified => WireNode::Quantified { c: children(tree, id) },
        }
    }

    fn from_wire(tree: &mut Tree, wire: WireNode) -> NodeId {
        let (node, kids) = match wire {
            WireNode::Unlexer { n, s, z, im } => (
                Node::Unlexer {
                    name: n,
                    src: s,
                    size: RuleSize::new(z.0, z.1),
                    immutable: im,
                },
                Vec::new(),
            ),
            WireNode::Unparser { n, c } => (Node::Unparser { name: n }, c),
            WireNode::Alternative { ai, i, c } => {
                (Node::Alternative { alt_idx: ai, idx: i }, c)
            }
            WireNode::Quantifier { i, b, e, c } => (
                Node::Quantifier { idx: i, start: b, stop: if e == -1 { i32::MAX } else { e } },
                c,
            ),
            WireNode::Quantified { c } => (Node::Quantified, c),
        };
        let id = tree.add(node);
        for kid in kids {
            let kid_id = Self::from_wire(tree, kid);
            tree.add_child(id, kid_id);
        }
        id
    }
}

impl TreeCodec for JsonTreeCodec {
    fn encode(&self, tree: &Tree, root: NodeId) -> Vec<u8> {
        serde_json::to_vec(&Self::to_wire(tree, root)).expect("tree serialization cannot fail")
    }

    fn decode(&self, data: &[u8]) -> Option<Tree> {
        let wire: WireNode = serde_json::from_slice(data).ok()?;
        let mut tree = Tree::new();
        let root = Self::from_wire(&mut tree, wire);
        tree.set_root(root);
        Some(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::ROOT_NAME;

    fn sample() -> (Tree, NodeId) {
        let (mut t, root) = Tree::with_root(Node::unparser(ROOT_NAME));
        let s = t.add(Node::unparser("S"));
        t.add_child(root, s);
        let alt = t.add(Node::Alternative { alt_idx: 1, idx: 2 });
        t.add_child(s, alt);
        let q = t.add(Node::Quantifier { idx: 0, start: 1, stop: i32::MAX });
        t.add_child(alt, q);
        let qd = t.add(Node::Quantified);
        t.add_child(q, qd);
        let leaf = t.add(Node::Unlexer {
            name: "A".to_string(),
            src: "payload".to_string(),
            size: RuleSize::new(2, 3),
            immutable: true,
        });
        t.add_child(qd, leaf);
        (t, root)
    }

    #[test]
    fn round_trip_preserves_structure_and_tokens() {
        let (tree, root) = sample();
        let codec = JsonTreeCodec;
        let bytes = codec.encode(&tree, root);
        let back = codec.decode(&bytes).expect("decode");
        assert!(tree.equal(root, &back, back.root()));
        assert!(tree.equal_tokens(root, &back, back.root()));
    }

    #[test]
    fn unbounded_stop_uses_sentinel() {
        let (tree, root) = sample();
        let codec = JsonTreeCodec;
        let text = String::from_utf8(codec.encode(&tree, root)).unwrap();
        assert!(text.contains("\"e\":-1"), "wire form: {}", text);
        let back = codec.decode(text.as_bytes()).unwrap();
        let s = back.children(back.root())[0];
        let alt = back.children(s)[0];
        let q = back.children(alt)[0];
        match back.node(q) {
            Node::Quantifier { stop, .. } => assert_eq!(*stop, i32::MAX),
            _ => panic!("expected quantifier"),
        }
    }

    #[test]
    fn garbage_decodes_to_none() {
        let codec = JsonTreeCodec;
        assert!(codec.decode(b"not a tree").is_none());
        assert!(codec.decode(b"{\"t\":\"x\"}").is_none());
    }

    #[test]
    fn encode_into_reports_overflow() {
        let (tree, root) = sample();
        let codec = JsonTreeCodec;
        let full = codec.encode(&tree, root);
        let mut big = vec![0u8; full.len()];
        assert_eq!(codec.encode_into(&tree, root, &mut big), full.len());
        let mut small = vec![0u8; full.len() - 1];
        assert_eq!(codec.encode_into(&tree, root, &mut small), 0);
    }
}
