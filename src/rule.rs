//! Derivation trees: arena storage, node variants, subtree surgery.

use smallvec::SmallVec;
use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Name of the synthetic sentinel node anchoring every individual.
pub const ROOT_NAME: &str = "<ROOT>";
/// Marker name for rules that failed to resolve during preprocessing.
pub const INVALID_NAME: &str = "<INVALID>";

/// Two-axis size measure used as the budget currency everywhere:
/// rule nesting depth and produced token count.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug)]
pub struct RuleSize {
    pub depth: i32,
    pub tokens: i32,
}

impl RuleSize {
    pub const MAX: RuleSize = RuleSize { depth: i32::MAX, tokens: i32::MAX };

    pub const fn new(depth: i32, tokens: i32) -> Self {
        Self { depth, tokens }
    }
}

impl Add for RuleSize {
    type Output = RuleSize;
    fn add(self, rhs: RuleSize) -> RuleSize {
        RuleSize::new(self.depth + rhs.depth, self.tokens + rhs.tokens)
    }
}

impl AddAssign for RuleSize {
    fn add_assign(&mut self, rhs: RuleSize) {
        self.depth += rhs.depth;
        self.tokens += rhs.tokens;
    }
}

impl Sub for RuleSize {
    type Output = RuleSize;
    fn sub(self, rhs: RuleSize) -> RuleSize {
        RuleSize::new(self.depth - rhs.depth, self.tokens - rhs.tokens)
    }
}

impl SubAssign for RuleSize {
    fn sub_assign(&mut self, rhs: RuleSize) {
        self.depth -= rhs.depth;
        self.tokens -= rhs.tokens;
    }
}

// Componentwise partial order: sizes with mixed axes are incomparable.
impl PartialOrd for RuleSize {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let d = self.depth.cmp(&other.depth);
        let t = self.tokens.cmp(&other.tokens);
        if d == t {
            Some(d)
        } else if d == Ordering::Equal {
            Some(t)
        } else if t == Ordering::Equal {
            Some(d)
        } else {
            None
        }
    }
}

/// Handle into a [`Tree`] arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const NULL: NodeId = NodeId(u32::MAX);

    pub fn is_null(self) -> bool {
        self == NodeId::NULL
    }
}

/// Tagged node variants of a derivation tree.
///
/// `Unlexer` nodes are the leaves carrying produced text; the other four
/// variants are parents. Quantifier `stop` uses `i32::MAX` for an unbounded
/// repetition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Unlexer { name: String, src: String, size: RuleSize, immutable: bool },
    Unparser { name: String },
    Alternative { alt_idx: i32, idx: i32 },
    Quantifier { idx: i32, start: i32, stop: i32 },
    Quantified,
}

impl Node {
    pub fn unlexer(name: &str, immutable: bool) -> Node {
        Node::Unlexer { name: name.to_string(), src: String::new(), size: RuleSize::default(), immutable }
    }

    pub fn unparser(name: &str) -> Node {
        Node::Unparser { name: name.to_string() }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Unlexer { name, .. } | Node::Unparser { name, .. } => name,
            _ => "",
        }
    }

    pub fn is_unlexer(&self) -> bool {
        matches!(self, Node::Unlexer { .. })
    }

    pub fn is_unparser(&self) -> bool {
        matches!(self, Node::Unparser { .. })
    }

    pub fn is_quantifier(&self) -> bool {
        matches!(self, Node::Quantifier { .. })
    }

    pub fn is_quantified(&self) -> bool {
        matches!(self, Node::Quantified)
    }

    pub fn is_alternative(&self) -> bool {
        matches!(self, Node::Alternative { .. })
    }
}

struct Slot {
    node: Node,
    parent: NodeId,
    children: SmallVec<[NodeId; 4]>,
}

/// Arena owning every node of one derivation tree.
///
/// Parent/child edges are [`NodeId`] handles into the arena; freeing a
/// subtree recycles its slots through a free list, and dropping the tree
/// drops all nodes at once. A node without a parent is either the tree
/// root or a detached subtree still owned by the arena.
pub struct Tree {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    root: NodeId,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Tree {
    fn clone(&self) -> Self {
        let mut copy = Tree::new();
        if !self.root.is_null() {
            let root = copy.graft(self, self.root);
            copy.root = root;
        }
        copy
    }
}

impl Tree {
    pub fn new() -> Self {
        Tree { slots: Vec::new(), free: Vec::new(), root: NodeId::NULL }
    }

    pub fn with_root(node: Node) -> (Self, NodeId) {
        let mut tree = Tree::new();
        let id = tree.add(node);
        tree.root = id;
        (tree, id)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn set_root(&mut self, id: NodeId) {
        assert!(self.parent(id).is_null(), "root must not have a parent");
        self.root = id;
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: NodeId) -> &Slot {
        self.slots[id.0 as usize].as_ref().expect("stale node id")
    }

    fn slot_mut(&mut self, id: NodeId) -> &mut Slot {
        self.slots[id.0 as usize].as_mut().expect("stale node id")
    }

    /// Adds a detached node and returns its handle.
    pub fn add(&mut self, node: Node) -> NodeId {
        let slot = Slot { node, parent: NodeId::NULL, children: SmallVec::new() };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                NodeId(idx)
            }
            None => {
                self.slots.push(Some(slot));
                NodeId(self.slots.len() as u32 - 1)
            }
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.slot(id).node
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.slot_mut(id).node
    }

    pub fn parent(&self, id: NodeId) -> NodeId {
        self.slot(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.slot(id).children
    }

    pub fn child_count(&self, id: NodeId) -> usize {
        self.slot(id).children.len()
    }

    fn child_pos(&self, parent: NodeId, child: NodeId) -> usize {
        self.slot(parent)
            .children
            .iter()
            .position(|&c| c == child)
            .expect("node not among its parent's children")
    }

    /// Detaches `child` from wherever it is and appends it under `parent`.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        assert!(!self.node(parent).is_unlexer(), "unlexer nodes have no children");
        self.detach(child);
        self.slot_mut(parent).children.push(child);
        self.slot_mut(child).parent = parent;
    }

    /// Detaches `child` and inserts it at position `idx` under `parent`.
    pub fn insert_child(&mut self, parent: NodeId, idx: usize, child: NodeId) {
        assert!(!self.node(parent).is_unlexer(), "unlexer nodes have no children");
        self.detach(child);
        self.slot_mut(parent).children.insert(idx, child);
        self.slot_mut(child).parent = parent;
    }

    /// Removes `id` from its parent's child list; no-op for parentless nodes.
    pub fn detach(&mut self, id: NodeId) {
        let parent = self.slot(id).parent;
        if parent.is_null() {
            return;
        }
        let pos = self.child_pos(parent, id);
        self.slot_mut(parent).children.remove(pos);
        self.slot_mut(id).parent = NodeId::NULL;
    }

    /// Puts `new` in `old`'s place under `old`'s parent and detaches `old`.
    /// A parentless `old` (a root) is left untouched.
    pub fn replace(&mut self, old: NodeId, new: NodeId) -> NodeId {
        self.detach(new);
        let parent = self.slot(old).parent;
        if !parent.is_null() && old != new {
            let pos = self.child_pos(parent, old);
            self.slot_mut(parent).children[pos] = new;
            self.slot_mut(new).parent = parent;
            self.slot_mut(old).parent = NodeId::NULL;
        }
        new
    }

    /// Detaches `id` and returns its whole subtree to the free list.
    pub fn free_subtree(&mut self, id: NodeId) {
        self.detach(id);
        if self.root == id {
            self.root = NodeId::NULL;
        }
        let mut worklist = vec![id];
        while let Some(n) = worklist.pop() {
            let slot = self.slots[n.0 as usize].take().expect("stale node id");
            worklist.extend(slot.children);
            self.free.push(n.0);
        }
    }

    /// Deep-copies a subtree within the arena; the copy is detached.
    pub fn duplicate(&mut self, id: NodeId) -> NodeId {
        let node = self.node(id).clone();
        let copy = self.add(node);
        let mut worklist = vec![(id, copy)];
        while let Some((src, dst)) = worklist.pop() {
            let kids: SmallVec<[NodeId; 4]> = self.slot(src).children.clone();
            for kid in kids {
                let node = self.node(kid).clone();
                let kid_copy = self.add(node);
                self.add_child(dst, kid_copy);
                worklist.push((kid, kid_copy));
            }
        }
        copy
    }

    /// Deep-copies a subtree out of another arena; the copy is detached.
    pub fn graft(&mut self, src: &Tree, src_id: NodeId) -> NodeId {
        let copy = self.add(src.node(src_id).clone());
        let mut worklist = vec![(src_id, copy)];
        while let Some((from, to)) = worklist.pop() {
            for &kid in src.children(from) {
                let kid_copy = self.add(src.node(kid).clone());
                self.add_child(to, kid_copy);
                worklist.push((kid, kid_copy));
            }
        }
        copy
    }

    /// Swaps two disjoint subtrees in place.
    pub fn swap_subtrees(&mut self, a: NodeId, b: NodeId) {
        assert_ne!(a, b);
        let pa = self.parent(a);
        let pb = self.parent(b);
        assert!(!pa.is_null() && !pb.is_null(), "swapped nodes must have parents");
        let ia = self.child_pos(pa, a);
        let ib = self.child_pos(pb, b);
        self.slot_mut(pa).children[ia] = b;
        self.slot_mut(pb).children[ib] = a;
        self.slot_mut(a).parent = pb;
        self.slot_mut(b).parent = pa;
    }

    /// Overwrites the raw child array of `id` without maintaining the
    /// children's parent links. Low-level surgery for the trimmer, which
    /// splices units out for one serialization and restores the saved
    /// array afterwards.
    pub fn set_children_raw(&mut self, id: NodeId, children: &[NodeId]) {
        self.slot_mut(id).children = SmallVec::from_slice(children);
    }

    /// Name of the nearest named ancestor-or-self.
    pub fn rule_name(&self, id: NodeId) -> &str {
        let mut cur = id;
        while !cur.is_null() {
            let name = self.node(cur).name();
            if !name.is_empty() {
                return name;
            }
            cur = self.parent(cur);
        }
        ""
    }

    /// Left-to-right iteration over the non-empty unlexer sources of a
    /// subtree.
    pub fn tokens(&self, id: NodeId) -> Tokens<'_> {
        Tokens { tree: self, worklist: vec![id] }
    }

    /// Variant-aware structural equality of two subtrees.
    pub fn equal(&self, a: NodeId, other: &Tree, b: NodeId) -> bool {
        let mut worklist = vec![(a, b)];
        while let Some((x, y)) = worklist.pop() {
            if self.node(x) != other.node(y) {
                return false;
            }
            let cx = self.children(x);
            let cy = other.children(y);
            if cx.len() != cy.len() {
                return false;
            }
            worklist.extend(cx.iter().copied().zip(cy.iter().copied()));
        }
        true
    }

    /// Whether two subtrees produce the same token sequence.
    pub fn equal_tokens(&self, a: NodeId, other: &Tree, b: NodeId) -> bool {
        let mut it1 = self.tokens(a);
        let mut it2 = other.tokens(b);
        loop {
            match (it1.next(), it2.next()) {
                (None, None) => return true,
                (Some(x), Some(y)) if x == y => {}
                _ => return false,
            }
        }
    }

    /// Indented one-node-per-line rendering, for logs and test failures.
    pub fn dump(&self, id: NodeId) -> String {
        let mut out = String::new();
        let mut worklist = vec![(id, 0usize)];
        while let Some((cur, level)) = worklist.pop() {
            for _ in 0..level {
                out.push_str("|  ");
            }
            match self.node(cur) {
                Node::Unlexer { name, src, immutable, .. } => {
                    out.push_str(name);
                    if !name.is_empty() {
                        out.push(':');
                    }
                    out.push('\'');
                    out.push_str(src);
                    out.push('\'');
                    if *immutable {
                        out.push_str(" (immutable)");
                    }
                }
                Node::Unparser { name } => out.push_str(name),
                Node::Alternative { alt_idx, idx } => {
                    out.push_str(&format!("alt:[{}/{}]", alt_idx, idx));
                }
                Node::Quantifier { idx, .. } => {
                    out.push_str(&format!("quant:[{}]", idx));
                }
                Node::Quantified => out.push_str("quantified"),
            }
            out.push('\n');
            for &kid in self.children(cur).iter().rev() {
                worklist.push((kid, level + 1));
            }
        }
        out
    }
}

pub struct Tokens<'a> {
    tree: &'a Tree,
    worklist: Vec<NodeId>,
}

impl<'a> Iterator for Tokens<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let tree = self.tree;
        while let Some(id) = self.worklist.pop() {
            match tree.node(id) {
                Node::Unlexer { src, .. } => {
                    if !src.is_empty() {
                        return Some(src.as_str());
                    }
                }
                _ => {
                    self.worklist.extend(tree.children(id).iter().rev());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tree: &mut Tree, name: &str, src: &str) -> NodeId {
        tree.add(Node::Unlexer {
            name: name.to_string(),
            src: src.to_string(),
            size: RuleSize::new(1, 1),
            immutable: false,
        })
    }

    #[test]
    fn size_partial_order() {
        assert!(RuleSize::new(1, 2) <= RuleSize::new(1, 2));
        assert!(RuleSize::new(1, 2) <= RuleSize::new(2, 2));
        assert!(RuleSize::new(1, 2) < RuleSize::new(2, 3));
        // mixed axes are incomparable
        let a = RuleSize::new(1, 5);
        let b = RuleSize::new(2, 3);
        assert!(!(a <= b) && !(b <= a));
        assert!(RuleSize::new(3, 3) <= RuleSize::MAX);
    }

    #[test]
    fn size_arithmetic() {
        let a = RuleSize::new(1, 2) + RuleSize::new(3, 4);
        assert_eq!(a, RuleSize::new(4, 6));
        assert_eq!(a - RuleSize::new(3, 4), RuleSize::new(1, 2));
    }

    #[test]
    fn parent_consistency() {
        let (mut t, root) = Tree::with_root(Node::unparser("S"));
        let a = leaf(&mut t, "A", "a");
        let b = leaf(&mut t, "B", "b");
        t.add_child(root, a);
        t.insert_child(root, 0, b);
        assert_eq!(t.children(root), &[b, a]);
        assert_eq!(t.parent(a), root);
        assert_eq!(t.parent(b), root);

        t.detach(b);
        assert_eq!(t.children(root), &[a]);
        assert!(t.parent(b).is_null());
    }

    #[test]
    fn reparenting_detaches_first() {
        let (mut t, root) = Tree::with_root(Node::unparser("S"));
        let inner = t.add(Node::unparser("T"));
        t.add_child(root, inner);
        let a = leaf(&mut t, "A", "a");
        t.add_child(root, a);
        // moving a under inner must remove it from root's children
        t.add_child(inner, a);
        assert_eq!(t.children(root), &[inner]);
        assert_eq!(t.children(inner), &[a]);
        assert_eq!(t.parent(a), inner);
    }

    #[test]
    fn replace_swaps_position() {
        let (mut t, root) = Tree::with_root(Node::unparser("S"));
        let a = leaf(&mut t, "A", "a");
        let b = leaf(&mut t, "B", "b");
        let c = leaf(&mut t, "C", "c");
        t.add_child(root, a);
        t.add_child(root, b);
        t.replace(a, c);
        assert_eq!(t.children(root), &[c, b]);
        assert!(t.parent(a).is_null());
        t.free_subtree(a);
    }

    #[test]
    fn duplicate_is_structurally_equal() {
        let (mut t, root) = Tree::with_root(Node::unparser("S"));
        let q = t.add(Node::Quantifier { idx: 0, start: 0, stop: i32::MAX });
        t.add_child(root, q);
        let qd = t.add(Node::Quantified);
        t.add_child(q, qd);
        let a = leaf(&mut t, "A", "a");
        t.add_child(qd, a);

        let copy = t.duplicate(root);
        assert!(t.parent(copy).is_null());
        assert!(t.equal(root, &t, copy));
        assert!(t.equal_tokens(root, &t, copy));
    }

    #[test]
    fn graft_between_trees() {
        let (mut t1, root1) = Tree::with_root(Node::unparser("S"));
        let a = leaf(&mut t1, "A", "a");
        t1.add_child(root1, a);

        let (mut t2, root2) = Tree::with_root(Node::unparser("S"));
        let copy = t2.graft(&t1, root1);
        t2.add_child(root2, copy);
        assert!(t2.equal(copy, &t1, root1));
    }

    #[test]
    fn token_iteration_order() {
        let (mut t, root) = Tree::with_root(Node::unparser("S"));
        let a = leaf(&mut t, "A", "a");
        let empty = leaf(&mut t, "E", "");
        let b = leaf(&mut t, "B", "b");
        t.add_child(root, a);
        t.add_child(root, empty);
        t.add_child(root, b);
        let toks: Vec<&str> = t.tokens(root).collect();
        assert_eq!(toks, vec!["a", "b"]);
    }

    #[test]
    fn free_recycles_slots() {
        let (mut t, root) = Tree::with_root(Node::unparser("S"));
        let a = leaf(&mut t, "A", "a");
        t.add_child(root, a);
        let before = t.len();
        t.free_subtree(a);
        assert_eq!(t.len(), before - 1);
        let b = leaf(&mut t, "B", "b");
        t.add_child(root, b);
        assert_eq!(t.len(), before);
    }

    #[test]
    fn swap_subtrees_in_place() {
        let (mut t, root) = Tree::with_root(Node::unparser("S"));
        let x = t.add(Node::unparser("X"));
        let y = t.add(Node::unparser("Y"));
        t.add_child(root, x);
        t.add_child(root, y);
        let a = leaf(&mut t, "A", "a");
        let b = leaf(&mut t, "B", "b");
        t.add_child(x, a);
        t.add_child(y, b);

        t.swap_subtrees(a, b);
        assert_eq!(t.children(x), &[b]);
        assert_eq!(t.children(y), &[a]);
        assert_eq!(t.parent(a), y);
        assert_eq!(t.parent(b), x);
    }

    #[test]
    fn rule_name_walks_up() {
        let (mut t, root) = Tree::with_root(Node::unparser("S"));
        let q = t.add(Node::Quantifier { idx: 0, start: 0, stop: 3 });
        t.add_child(root, q);
        let qd = t.add(Node::Quantified);
        t.add_child(q, qd);
        assert_eq!(t.rule_name(qd), "S");
        assert_eq!(t.rule_name(root), "S");
    }
}
