//! Individuals and the structural subtree store used as a donor pool.

use crate::annot::{Annotations, NodeKey};
use crate::rule::{Node, NodeId, RuleSize, Tree, ROOT_NAME};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// A root-anchored tree paired with its lazily built annotation indices.
/// Any mutable access to the tree drops the cached indices.
pub struct Individual {
    tree: Tree,
    annot: Option<Annotations>,
}

impl Individual {
    pub fn new(tree: Tree) -> Self {
        assert!(!tree.root().is_null(), "individual requires a rooted tree");
        Self { tree, annot: None }
    }

    /// Wraps a bare tree under a fresh `<ROOT>` sentinel so that
    /// root-level mutations need no special case.
    pub fn from_bare(mut tree: Tree) -> Self {
        let old_root = tree.root();
        let wrap = tree.add(Node::unparser(ROOT_NAME));
        tree.set_root(wrap);
        if !old_root.is_null() {
            tree.add_child(wrap, old_root);
        }
        Self::new(tree)
    }

    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        self.annot = None;
        &mut self.tree
    }

    pub fn annotations(&mut self) -> &Annotations {
        if self.annot.is_none() {
            self.annot = Some(Annotations::new(&self.tree));
        }
        self.annot.as_ref().unwrap()
    }

    /// Tree and annotations together, for callers that need to read both.
    pub fn annotated(&mut self) -> (&Tree, &Annotations) {
        if self.annot.is_none() {
            self.annot = Some(Annotations::new(&self.tree));
        }
        (&self.tree, self.annot.as_ref().unwrap())
    }

    pub fn into_tree(self) -> Tree {
        self.tree
    }
}

/// Donor source for recombination and pool-backed mutation.
pub trait Population {
    fn empty(&self) -> bool;
    fn add_individual(&mut self, tree: &Tree, path: Option<&str>);
    fn select_individual(&mut self, recipient: Option<&Individual>) -> Option<Individual>;
}

struct RuleData {
    size: RuleSize,
    refcount: u32,
}

/// Structural deduplication store of subtrees keyed by content hash.
///
/// Interned subtrees form a DAG inside a private arena: identical
/// subtrees are stored once and reference-counted. Selection hands out
/// deep clones, never live store nodes, and biases toward rarer
/// subtrees by weighting candidates with the inverse of their refcount.
pub struct SubtreePopulation {
    arena: Tree,
    data: FxHashMap<NodeId, RuleData>,
    by_hash: FxHashMap<u64, NodeId>,
    by_name: BTreeMap<NodeKey, Vec<NodeId>>,
    nodes: Vec<NodeId>,
    rng: SmallRng,
}

impl SubtreePopulation {
    pub fn new() -> Self {
        Self::with_rng(SmallRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(SmallRng::seed_from_u64(seed))
    }

    fn with_rng(rng: SmallRng) -> Self {
        Self {
            arena: Tree::new(),
            data: FxHashMap::default(),
            by_hash: FxHashMap::default(),
            by_name: BTreeMap::new(),
            nodes: Vec::new(),
            rng,
        }
    }

    /// Bottom-up 64-bit content hashes over one subtree. The encoding
    /// mixes the variant tag, the variant fields, and the children's
    /// hashes between open/comma/close markers.
    fn hash_subtree(tree: &Tree, root: NodeId) -> FxHashMap<NodeId, u64> {
        enum Frame {
            Enter(NodeId),
            Exit(NodeId, usize),
        }

        let mut hashes = FxHashMap::default();
        let mut stack = vec![Frame::Enter(root)];
        let mut results: Vec<u64> = Vec::new();

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(id) => {
                    let children = tree.children(id);
                    stack.push(Frame::Exit(id, children.len()));
                    for &kid in children.iter() {
                        stack.push(Frame::Enter(kid));
                    }
                }
                Frame::Exit(id, nchildren) => {
                    let mut h = FxHasher::default();
                    match tree.node(id) {
                        Node::Unlexer { name, src, size, immutable } => {
                            h.write_u8(b'l');
                            name.hash(&mut h);
                            src.hash(&mut h);
                            h.write_i32(size.depth);
                            h.write_i32(size.tokens);
                            h.write_u8(*immutable as u8);
                        }
                        Node::Unparser { name } => {
                            h.write_u8(b'p');
                            name.hash(&mut h);
                        }
                        Node::Alternative { alt_idx, idx } => {
                            h.write_u8(b'a');
                            h.write_i32(*alt_idx);
                            h.write_i32(*idx);
                        }
                        Node::Quantifier { idx, start, stop } => {
                            h.write_u8(b'q');
                            h.write_i32(*idx);
                            h.write_i32(*start);
                            h.write_i32(if *stop == i32::MAX { -1 } else { *stop });
                        }
                        Node::Quantified => h.write_u8(b'd'),
                    }
                    if !tree.node(id).is_unlexer() {
                        h.write_u8(b'(');
                        // child hashes were pushed left to right
                        let first = results.len() - nchildren;
                        for &child_hash in &results[first..] {
                            h.write_u64(child_hash);
                            h.write_u8(b',');
                        }
                        results.truncate(first);
                        h.write_u8(b')');
                    }
                    let digest = h.finish();
                    hashes.insert(id, digest);
                    results.push(digest);
                }
            }
        }
        hashes
    }

    fn bump_refcounts(&mut self, canon: NodeId) {
        let mut seen = FxHashSet::default();
        let mut worklist = vec![canon];
        while let Some(id) = worklist.pop() {
            if !seen.insert(id) {
                continue;
            }
            self.data.get_mut(&id).expect("unknown canonical node").refcount += 1;
            worklist.extend(self.arena.children(id));
        }
    }

    fn intern(
        &mut self,
        src: &Tree,
        id: NodeId,
        hashes: &FxHashMap<NodeId, u64>,
        keys: &FxHashMap<NodeId, NodeKey>,
        annot: &Annotations,
    ) -> NodeId {
        let hash = hashes[&id];
        if let Some(&canon) = self.by_hash.get(&hash) {
            self.bump_refcounts(canon);
            return canon;
        }

        let node = self.arena.add(src.node(id).clone());
        let info = annot.info(id);
        self.data.insert(node, RuleData { size: RuleSize::new(info.depth, info.tokens), refcount: 1 });
        self.by_hash.insert(hash, node);
        self.nodes.push(node);
        if let Some(key) = keys.get(&id) {
            self.by_name.entry(key.clone()).or_default().push(node);
        }

        let kids: Vec<NodeId> = src.children(id).to_vec();
        let mut canon_children = Vec::with_capacity(kids.len());
        for kid in kids {
            canon_children.push(self.intern(src, kid, hashes, keys, annot));
        }
        // the store is a DAG: children may be shared, so the arrays are
        // assembled without parent-link maintenance
        self.arena.set_children_raw(node, &canon_children);
        node
    }

    fn clone_out(&self, node: NodeId) -> Individual {
        let mut tree = Tree::new();
        let root = tree.graft(&self.arena, node);
        tree.set_root(root);
        Individual::new(tree)
    }

    /// Picks a subtree of the given key whose recorded size fits under
    /// `(max_depth, max_tokens)`, weighted by inverse refcount. When no
    /// candidate fits both axes, falls back to any candidate fitting the
    /// token budget alone.
    pub fn select_by_type(
        &mut self,
        key: &NodeKey,
        max_depth: i32,
        max_tokens: i32,
    ) -> Option<Individual> {
        let bucket = self.by_name.get(key)?;

        let mut total = 0.0;
        for &node in bucket {
            let data = &self.data[&node];
            if data.size.depth <= max_depth && data.size.tokens <= max_tokens {
                total += 1.0 / data.refcount as f64;
            }
        }
        if total > 0.0 {
            let r = self.rng.gen::<f64>() * total;
            let mut acc = 0.0;
            for &node in bucket {
                let data = &self.data[&node];
                if data.size.depth > max_depth || data.size.tokens > max_tokens {
                    continue;
                }
                acc += 1.0 / data.refcount as f64;
                if acc >= r {
                    return Some(self.clone_out(node));
                }
            }
        }

        let fallback = bucket.iter().copied().find(|n| self.data[n].size.tokens <= max_tokens);
        fallback.map(|n| self.clone_out(n))
    }
}

impl Default for SubtreePopulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Population for SubtreePopulation {
    fn empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn add_individual(&mut self, tree: &Tree, _path: Option<&str>) {
        let root = tree.root();
        if root.is_null() {
            return;
        }
        let hashes = Self::hash_subtree(tree, root);
        let annot = Annotations::new(tree);
        let mut keys = FxHashMap::default();
        for (key, ids) in annot.nodes_by_name() {
            for &id in ids {
                keys.insert(id, key.clone());
            }
        }
        self.intern(tree, root, &hashes, &keys, &annot);
    }

    fn select_individual(&mut self, _recipient: Option<&Individual>) -> Option<Individual> {
        if self.nodes.is_empty() {
            return None;
        }
        let node = self.nodes[self.rng.gen_range(0..self.nodes.len())];
        Some(self.clone_out(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // <ROOT> ( S ( A:'a' B:<b> ) ) with a variable second leaf
    fn sample(second: &str) -> Tree {
        let (mut t, root) = Tree::with_root(Node::unparser(ROOT_NAME));
        let s = t.add(Node::unparser("S"));
        t.add_child(root, s);
        let a = t.add(Node::Unlexer {
            name: "A".to_string(),
            src: "a".to_string(),
            size: RuleSize::new(1, 1),
            immutable: false,
        });
        t.add_child(s, a);
        let b = t.add(Node::Unlexer {
            name: "B".to_string(),
            src: second.to_string(),
            size: RuleSize::new(1, 1),
            immutable: false,
        });
        t.add_child(s, b);
        t
    }

    #[test]
    fn interning_deduplicates_and_counts() {
        let mut pop = SubtreePopulation::seeded(1);
        let t = sample("b");
        pop.add_individual(&t, None);
        let before = pop.nodes.len();
        pop.add_individual(&t, None);
        // identical content interns onto the same canonical nodes
        assert_eq!(pop.nodes.len(), before);
        let root_data = &pop.data[pop.by_name.get(&NodeKey::rule("S")).unwrap().first().unwrap()];
        assert_eq!(root_data.refcount, 2);
    }

    #[test]
    fn insertion_order_does_not_change_canonical_hashes() {
        let t1 = sample("b");
        let t2 = sample("c");

        let mut p1 = SubtreePopulation::seeded(1);
        p1.add_individual(&t1, None);
        p1.add_individual(&t2, None);

        let mut p2 = SubtreePopulation::seeded(2);
        p2.add_individual(&t2, None);
        p2.add_individual(&t1, None);

        let h1: FxHashSet<u64> = p1.by_hash.keys().copied().collect();
        let h2: FxHashSet<u64> = p2.by_hash.keys().copied().collect();
        assert_eq!(h1, h2);
        assert_eq!(
            p1.by_name.keys().collect::<Vec<_>>(),
            p2.by_name.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn select_returns_fresh_clone_under_budget() {
        let mut pop = SubtreePopulation::seeded(3);
        let t = sample("b");
        pop.add_individual(&t, None);

        let key = NodeKey::rule("S");
        let indiv = pop.select_by_type(&key, 10, 10).expect("candidate expected");
        // cloned, not the interned node itself
        assert!(indiv.tree().equal_tokens(indiv.root(), &t, t.children(t.root())[0]));

        // depth too small but token fallback applies
        let indiv = pop.select_by_type(&key, 0, 10);
        assert!(indiv.is_some());

        // token budget kills the fallback too
        assert!(pop.select_by_type(&key, 0, 0).is_none());
    }

    #[test]
    fn unknown_key_yields_nothing() {
        let mut pop = SubtreePopulation::seeded(4);
        assert!(pop.empty());
        assert!(pop.select_by_type(&NodeKey::rule("nope"), 5, 5).is_none());
    }
}
