//! On-demand indices over a derivation tree: nodes bucketed by
//! `(rule name, kind, index)` keys plus per-node size information.

use crate::rule::{Node, NodeId, Tree, INVALID_NAME, ROOT_NAME};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum NodeKind {
    Rule,
    Quantifier,
    Quantified,
    Alternative,
}

/// Index key; totally ordered by `(name, kind, idx)`. Rule nodes are
/// keyed by name alone, structural nodes carry the alternation or
/// quantifier index (quantified nodes borrow their parent quantifier's).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeKey {
    pub name: String,
    pub kind: NodeKind,
    pub idx: i32,
}

impl NodeKey {
    pub fn rule(name: &str) -> Self {
        Self { name: name.to_string(), kind: NodeKind::Rule, idx: 0 }
    }

    pub fn new(name: &str, kind: NodeKind, idx: i32) -> Self {
        Self { name: name.to_string(), kind, idx }
    }
}

/// Per-node placement and size: unparser-rule nesting level from the
/// root, and the depth/tokens measures computed from actual subtree
/// contents (unlexer leaves contribute their stored size).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NodeInfo {
    pub level: i32,
    pub depth: i32,
    pub tokens: i32,
}

/// Indices over one tree, built in a single traversal.
///
/// `rules_by_name` holds mutable unlexer rules and unparser rules
/// (excluding the `<ROOT>` sentinel and `<INVALID>` marker),
/// `alts_by_name`/`quants_by_name` the structural nodes, and
/// `nodes_by_name` their union including quantified nodes.
pub struct Annotations {
    rules: BTreeMap<NodeKey, Vec<NodeId>>,
    alts: BTreeMap<NodeKey, Vec<NodeId>>,
    quants: BTreeMap<NodeKey, Vec<NodeId>>,
    nodes: BTreeMap<NodeKey, Vec<NodeId>>,
    info: FxHashMap<NodeId, NodeInfo>,
}

impl Annotations {
    pub fn new(tree: &Tree) -> Self {
        let mut annot = Annotations {
            rules: BTreeMap::new(),
            alts: BTreeMap::new(),
            quants: BTreeMap::new(),
            nodes: BTreeMap::new(),
            info: FxHashMap::default(),
        };
        let root = tree.root();
        if root.is_null() {
            return annot;
        }

        enum Frame<'a> {
            Enter(NodeId, i32, Option<&'a str>),
            Exit(NodeId, i32, usize),
        }

        let mut stack = vec![Frame::Enter(root, 0, None)];
        let mut results: Vec<(i32, i32)> = Vec::new();

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(id, level, rule_name) => {
                    annot.classify(tree, root, id, rule_name);

                    let node = tree.node(id);
                    if let Node::Unlexer { size, .. } = node {
                        annot.info.insert(id, NodeInfo { level, depth: size.depth, tokens: size.tokens });
                        results.push((size.depth, size.tokens));
                        continue;
                    }

                    let child_rule_name = match node {
                        Node::Unparser { name } => {
                            if !name.is_empty() && name != INVALID_NAME {
                                Some(name.as_str())
                            } else {
                                None
                            }
                        }
                        _ => rule_name,
                    };
                    let child_level = if node.is_unparser() { level + 1 } else { level };

                    let children = tree.children(id);
                    stack.push(Frame::Exit(id, level, children.len()));
                    for &kid in children.iter() {
                        stack.push(Frame::Enter(kid, child_level, child_rule_name));
                    }
                }
                Frame::Exit(id, level, nchildren) => {
                    let mut depth = 0;
                    let mut tokens = 0;
                    for _ in 0..nchildren {
                        let (d, t) = results.pop().expect("traversal result underflow");
                        depth = depth.max(d);
                        tokens += t;
                    }
                    if tree.node(id).is_unparser() {
                        depth += 1;
                    }
                    annot.info.insert(id, NodeInfo { level, depth, tokens });
                    results.push((depth, tokens));
                }
            }
        }
        annot
    }

    fn classify(&mut self, tree: &Tree, root: NodeId, id: NodeId, rule_name: Option<&str>) {
        match tree.node(id) {
            Node::Unlexer { name, immutable, .. } => {
                if !immutable && id != root && Self::named(name) {
                    let key = NodeKey::rule(name);
                    self.rules.entry(key.clone()).or_default().push(id);
                    self.nodes.entry(key).or_default().push(id);
                }
            }
            Node::Unparser { name } => {
                if id != root && Self::named(name) {
                    let key = NodeKey::rule(name);
                    self.rules.entry(key.clone()).or_default().push(id);
                    self.nodes.entry(key).or_default().push(id);
                }
            }
            Node::Alternative { alt_idx, .. } => {
                if let Some(rule) = rule_name {
                    let key = NodeKey::new(rule, NodeKind::Alternative, *alt_idx);
                    self.alts.entry(key.clone()).or_default().push(id);
                    self.nodes.entry(key).or_default().push(id);
                }
            }
            Node::Quantifier { idx, .. } => {
                if let Some(rule) = rule_name {
                    let key = NodeKey::new(rule, NodeKind::Quantifier, *idx);
                    self.quants.entry(key.clone()).or_default().push(id);
                    self.nodes.entry(key).or_default().push(id);
                }
            }
            Node::Quantified => {
                let parent = tree.parent(id);
                if let (Some(rule), false) = (rule_name, parent.is_null()) {
                    if let Node::Quantifier { idx, .. } = tree.node(parent) {
                        let key = NodeKey::new(rule, NodeKind::Quantified, *idx);
                        self.nodes.entry(key).or_default().push(id);
                    }
                }
            }
        }
    }

    fn named(name: &str) -> bool {
        !name.is_empty() && name != INVALID_NAME && name != ROOT_NAME
    }

    pub fn rules_by_name(&self) -> &BTreeMap<NodeKey, Vec<NodeId>> {
        &self.rules
    }

    pub fn alts_by_name(&self) -> &BTreeMap<NodeKey, Vec<NodeId>> {
        &self.alts
    }

    pub fn quants_by_name(&self) -> &BTreeMap<NodeKey, Vec<NodeId>> {
        &self.quants
    }

    pub fn nodes_by_name(&self) -> &BTreeMap<NodeKey, Vec<NodeId>> {
        &self.nodes
    }

    /// All rule nodes, flattened in key order.
    pub fn rules(&self) -> Vec<NodeId> {
        self.rules.values().flatten().copied().collect()
    }

    pub fn info(&self, id: NodeId) -> NodeInfo {
        *self.info.get(&id).expect("node without info record")
    }
}
