//! Reducers in the style of AFL-like trimmers: a minimizing
//! delta-debugging core over configurations of units, a content-caching
//! wrapper, and the tree-level driver that shrinks a failing derivation
//! tree by dropping quantified nodes.

use crate::codec::TreeCodec;
use crate::rule::{NodeId, Tree};
use log::trace;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

/// Minimizing delta debugging over configurations (sets of units).
///
/// Links between units add hierarchy: when `a` is linked to `b` and `c`,
/// removing `a` from a candidate also removes `b` and `c`. A
/// configuration cache prevents repeated tests of already seen
/// candidates.
pub struct ConfigTrimmer<T: Copy + Ord + Hash> {
    config: BTreeSet<T>,
    links: BTreeMap<T, BTreeSet<T>>,
    subsets: Vec<BTreeSet<T>>,
    i: usize,
    next_config: BTreeSet<T>,
    cache: FxHashSet<BTreeSet<T>>,
}

impl<T: Copy + Ord + Hash> Default for ConfigTrimmer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Ord + Hash> ConfigTrimmer<T> {
    pub fn new() -> Self {
        Self {
            config: BTreeSet::new(),
            links: BTreeMap::new(),
            subsets: Vec::new(),
            i: 0,
            next_config: BTreeSet::new(),
            cache: FxHashSet::default(),
        }
    }

    /// Starts a new reduction. Returns false when the configuration
    /// cannot be trimmed at all (fewer than two units).
    pub fn init(&mut self, config: BTreeSet<T>, links: BTreeMap<T, BTreeSet<T>>) -> bool {
        self.subsets.clear();
        self.subsets.push(config.clone());
        self.config = config;
        self.links = links;
        self.cache.clear();
        self.next()
    }

    /// The candidate to test next. Only valid between a successful
    /// `init`/`post` and the following `post`.
    pub fn trim(&self) -> &BTreeSet<T> {
        &self.next_config
    }

    /// Feeds back the oracle verdict for the last candidate. Returns
    /// true when no further candidates remain.
    pub fn post(&mut self, success: bool) -> bool {
        if success {
            // evict cache entries at least as big as the accepted
            // candidate; they can no longer reappear as subsets
            let size = self.next_config.len();
            self.cache.retain(|c| c.len() < size);
            self.config = self.next_config.clone();
            self.subsets.clear();
            self.subsets.push(self.config.clone());
        } else {
            self.cache.insert(self.next_config.clone());
            self.i += 1;
        }
        !self.next()
    }

    fn next(&mut self) -> bool {
        let size = self.config.len();
        if size < 2 {
            return false;
        }
        let mut n = self.subsets.len();
        if n < 2 {
            n = self.split();
        }
        loop {
            if self.i < 2 * n {
                if self.i < n {
                    self.next_config = self.subsets[self.i].clone();
                } else {
                    let j = self.i - n;
                    self.next_config.clear();
                    for (k, subset) in self.subsets.iter().enumerate() {
                        if k != j {
                            self.next_config.extend(subset.iter().copied());
                        }
                    }
                }
                self.unlink();
                if !self.cache.contains(&self.next_config) {
                    return true;
                }
                self.i += 1;
            } else if n < size {
                n = self.split();
            } else {
                return false;
            }
        }
    }

    // re-split the configuration into twice as many round-robin subsets
    fn split(&mut self) -> usize {
        let size = self.config.len();
        let n = size.min(self.subsets.len() * 2);
        self.subsets = vec![BTreeSet::new(); n];
        let mut d = 0;
        let mut j = 0;
        for &c in &self.config {
            self.subsets[j].insert(c);
            d += n;
            if d >= size {
                d -= size;
                j += 1;
            }
        }
        self.i = 0;
        n
    }

    // remove units transitively linked to units absent from the candidate
    fn unlink(&mut self) {
        let mut worklist: Vec<T> = self
            .links
            .keys()
            .copied()
            .filter(|unit| !self.next_config.contains(unit))
            .collect();
        while let Some(unit) = worklist.pop() {
            if let Some(linked) = self.links.get(&unit) {
                for &l in linked {
                    let erased = self.next_config.remove(&l);
                    if erased && self.links.contains_key(&l) {
                        worklist.push(l);
                    }
                }
            }
        }
    }
}

/// Hash of serialized content used by the content cache.
pub fn fx_bytes_hash(data: &[u8]) -> u64 {
    let mut h = FxHasher::default();
    h.write(data);
    h.finish()
}

pub type ContentHasherFn = fn(&[u8]) -> u64;
pub type SerializeFn<'a, T> = dyn FnMut(&BTreeSet<T>) -> Vec<u8> + 'a;

/// Content-caching wrapper over [`ConfigTrimmer`]: a candidate whose
/// serialized form has already been tested is skipped even when the
/// configuration itself is new.
pub struct ContentTrimmer<T: Copy + Ord + Hash> {
    trimmer: ConfigTrimmer<T>,
    hasher: ContentHasherFn,
    next_content: Vec<u8>,
    content_cache: FxHashMap<u64, usize>,
}

impl<T: Copy + Ord + Hash> ContentTrimmer<T> {
    pub fn new(hasher: ContentHasherFn) -> Self {
        Self {
            trimmer: ConfigTrimmer::new(),
            hasher,
            next_content: Vec::new(),
            content_cache: FxHashMap::default(),
        }
    }

    pub fn init(
        &mut self,
        config: BTreeSet<T>,
        links: BTreeMap<T, BTreeSet<T>>,
        serialize: &mut SerializeFn<'_, T>,
    ) -> bool {
        if !self.trimmer.init(config, links) {
            return false;
        }
        self.content_cache.clear();
        self.advance(serialize)
    }

    /// Serialized form of the candidate to test next.
    pub fn trim(&self) -> &[u8] {
        &self.next_content
    }

    /// The candidate configuration behind [`Self::trim`].
    pub fn recall(&self) -> &BTreeSet<T> {
        self.trimmer.trim()
    }

    /// Feeds back the oracle verdict. Returns true when reduction is
    /// complete.
    pub fn post(&mut self, success: bool, serialize: &mut SerializeFn<'_, T>) -> bool {
        let size = self.next_content.len();
        if success {
            // shrunk outputs can no longer produce the evicted sizes
            self.content_cache.retain(|_, s| *s <= size);
        } else {
            self.content_cache.insert((self.hasher)(&self.next_content), size);
        }
        if self.trimmer.post(success) {
            return true;
        }
        !self.advance(serialize)
    }

    fn advance(&mut self, serialize: &mut SerializeFn<'_, T>) -> bool {
        loop {
            self.next_content = serialize(self.trimmer.trim());
            if !self.content_cache.contains_key(&(self.hasher)(&self.next_content)) {
                return true;
            }
            if self.trimmer.post(false) {
                return false;
            }
        }
    }
}

/// Tree-level trimmer: reduces a derivation tree by removing quantified
/// nodes, presenting encoded candidates to an external oracle.
///
/// Candidates are serialized by temporarily splicing the removed units
/// out of their parents' child arrays and restoring the saved arrays
/// afterwards; the tree itself is only mutated at [`Self::commit`].
pub struct TreeTrimmer {
    trimmer: ContentTrimmer<NodeId>,
    init_config: BTreeSet<NodeId>,
    succ_config: BTreeSet<NodeId>,
    saved_children: BTreeMap<NodeId, Vec<NodeId>>,
    step: usize,
    max_steps: usize,
    done: bool,
}

impl TreeTrimmer {
    pub fn new(max_steps: usize) -> Self {
        Self {
            trimmer: ContentTrimmer::new(fx_bytes_hash),
            init_config: BTreeSet::new(),
            succ_config: BTreeSet::new(),
            saved_children: BTreeMap::new(),
            step: 0,
            max_steps,
            done: false,
        }
    }

    /// Collects the trimmable units of the tree and computes the first
    /// candidate. Returns false when there is nothing to trim.
    pub fn init(&mut self, tree: &mut Tree, codec: &dyn TreeCodec) -> bool {
        let mut init_config = BTreeSet::new();
        let mut links: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        let mut saved_children: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();

        // quantified nodes, the ancestor-descendant relationships among
        // them, and the original child vectors of their parents
        let mut stack = vec![(tree.root(), NodeId::NULL)];
        while let Some((id, ancestor)) = stack.pop() {
            let mut ancestor = ancestor;
            if tree.node(id).is_quantified() {
                init_config.insert(id);
                if !ancestor.is_null() {
                    links.entry(ancestor).or_default().insert(id);
                }
                ancestor = id;
                let parent = tree.parent(id);
                saved_children.entry(parent).or_insert_with(|| tree.children(parent).to_vec());
            }
            for &kid in tree.children(id) {
                stack.push((kid, ancestor));
            }
        }

        self.succ_config = init_config.clone();
        self.init_config = init_config;
        self.saved_children = saved_children;
        self.step = 1;

        let config = self.init_config.clone();
        let init_config = &self.init_config;
        let saved_children = &self.saved_children;
        let mut serialize =
            |cfg: &BTreeSet<NodeId>| serialize_candidate(tree, codec, init_config, saved_children, cfg);
        let ok = self.trimmer.init(config, links, &mut serialize);
        self.done = !ok;
        ok
    }

    /// Encoded candidate to present to the oracle.
    pub fn current(&self) -> &[u8] {
        self.trimmer.trim()
    }

    /// Units surviving in the current candidate.
    pub fn config(&self) -> &BTreeSet<NodeId> {
        self.trimmer.recall()
    }

    /// Number of candidates presented so far.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Feeds back the oracle verdict; returns true when trimming is
    /// finished (exhausted or step cap hit). Call [`Self::commit`] then.
    pub fn post(&mut self, tree: &mut Tree, codec: &dyn TreeCodec, success: bool) -> bool {
        assert!(!self.done, "post called after completion");
        if success {
            self.succ_config = self.trimmer.recall().clone();
        }
        let done = if self.step >= self.max_steps {
            trace!("trim step limit reached after {} candidates", self.step);
            true
        } else {
            let init_config = &self.init_config;
            let saved_children = &self.saved_children;
            let mut serialize = |cfg: &BTreeSet<NodeId>| {
                serialize_candidate(tree, codec, init_config, saved_children, cfg)
            };
            let done = self.trimmer.post(success, &mut serialize);
            if !done {
                self.step += 1;
            }
            done
        };
        self.done = done;
        done
    }

    /// Converts the final surviving configuration into real deletions:
    /// first detach every removed unit, then free them, so sibling
    /// references never dangle.
    pub fn commit(&self, tree: &mut Tree) {
        let removed: Vec<NodeId> =
            self.init_config.difference(&self.succ_config).copied().collect();
        for &node in &removed {
            tree.detach(node);
        }
        for &node in &removed {
            tree.free_subtree(node);
        }
    }
}

fn serialize_candidate(
    tree: &mut Tree,
    codec: &dyn TreeCodec,
    init_config: &BTreeSet<NodeId>,
    saved_children: &BTreeMap<NodeId, Vec<NodeId>>,
    config: &BTreeSet<NodeId>,
) -> Vec<u8> {
    // splice removed units out; their parent back-pointers are left
    // stale for the duration of the encode and the saved arrays undo
    // everything afterwards
    let mut touched: BTreeSet<NodeId> = BTreeSet::new();
    for &unit in init_config.difference(config) {
        let parent = tree.parent(unit);
        let kept: Vec<NodeId> =
            tree.children(parent).iter().copied().filter(|&c| c != unit).collect();
        tree.set_children_raw(parent, &kept);
        touched.insert(parent);
    }
    let bytes = codec.encode(tree, tree.root());
    for parent in touched {
        tree.set_children_raw(parent, &saved_children[&parent]);
    }
    bytes
}
