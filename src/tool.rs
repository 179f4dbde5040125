//! The mutation/recombination engine: registries of named tree
//! transformations over individuals, the creator retry loop, and the
//! memoization set suppressing recently seen outputs.

use crate::annot::{NodeInfo, NodeKey, NodeKind};
use crate::generator::GeneratorFactory;
use crate::population::{Individual, Population, SubtreePopulation};
use crate::rule::{Node, NodeId, RuleSize, Tree};
use crate::serializer::{simple_space_serializer, SerializerFn};
use log::{error, trace};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::collections::{BTreeMap, VecDeque};
use std::hash::Hasher;

/// Post-processing hook applied to every produced tree.
pub type TransformerFn = fn(&mut Tree);
/// External byte-level mutator driving `libfuzzer_mutate`.
pub type ByteMutatorFn = fn(&mut Vec<u8>);

/// What a creator produced: an in-place mutation of the recipient
/// individual, or a brand-new tree.
enum Created {
    Mutated,
    Fresh(Tree),
}

type CreatorFn = fn(&mut Tool, Option<&mut Individual>, Option<&mut Individual>) -> Option<Created>;
type CreatorMap = BTreeMap<&'static str, CreatorFn>;

/// Construction-time switches of the engine.
pub struct ToolOptions {
    /// Start rule; empty falls back to the grammar default.
    pub rule: String,
    pub limit: RuleSize,
    pub generate: bool,
    pub mutate: bool,
    pub recombine: bool,
    /// Also register creators that may violate grammar structure.
    pub unrestricted: bool,
    /// Non-empty: only creators named here are registered.
    pub allowlist: FxHashSet<String>,
    pub blocklist: FxHashSet<String>,
    pub transformers: Vec<TransformerFn>,
    pub serializer: SerializerFn,
    /// Capacity of the serialized-test memo; 0 disables memoization.
    pub memo_size: usize,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            rule: String::new(),
            limit: RuleSize::MAX,
            generate: true,
            mutate: true,
            recombine: true,
            unrestricted: true,
            allowlist: FxHashSet::default(),
            blocklist: FxHashSet::default(),
            transformers: Vec::new(),
            serializer: simple_space_serializer,
            memo_size: 0,
        }
    }
}

/// Mutation/recombination engine over derivation trees.
///
/// Creators are sampled uniformly; one that cannot find an eligible site
/// returns nothing and is dropped from the working set for the current
/// call. When every creator fails, the recipient is returned unchanged.
pub struct Tool {
    factory: GeneratorFactory,
    pub rule: String,
    pub limit: RuleSize,
    unrestricted: bool,
    allowlist: FxHashSet<String>,
    blocklist: FxHashSet<String>,
    enable_generation: bool,
    enable_mutation: bool,
    enable_recombination: bool,
    generators: CreatorMap,
    mutators: CreatorMap,
    recombiners: CreatorMap,
    transformers: Vec<TransformerFn>,
    pub serializer: SerializerFn,
    /// Name of the creator invoked most recently.
    pub last_mutator: &'static str,
    memo: FxHashSet<u64>,
    memo_order: VecDeque<u64>,
    memo_size: usize,
    pub population: Option<SubtreePopulation>,
    byte_mutator: Option<ByteMutatorFn>,
    pub rng: SmallRng,
}

impl Tool {
    pub fn new(factory: GeneratorFactory, options: ToolOptions) -> Self {
        let mut tool = Self {
            factory,
            rule: options.rule,
            limit: options.limit,
            unrestricted: options.unrestricted,
            allowlist: options.allowlist,
            blocklist: options.blocklist,
            enable_generation: options.generate,
            enable_mutation: options.mutate,
            enable_recombination: options.recombine,
            generators: CreatorMap::new(),
            mutators: CreatorMap::new(),
            recombiners: CreatorMap::new(),
            transformers: options.transformers,
            serializer: options.serializer,
            last_mutator: "",
            memo: FxHashSet::default(),
            memo_order: VecDeque::new(),
            memo_size: options.memo_size,
            population: None,
            byte_mutator: None,
            rng: SmallRng::from_entropy(),
        };
        if options.generate {
            tool.allow_generator("generate", c_generate);
        }
        if options.mutate {
            tool.allow_mutator("regenerate_rule", c_regenerate_rule);
            tool.allow_mutator("delete_quantified", c_delete_quantified);
            tool.allow_mutator("replicate_quantified", c_replicate_quantified);
            tool.allow_mutator("shuffle_quantifieds", c_shuffle_quantifieds);
            tool.allow_mutator("hoist_rule", c_hoist_rule);
            tool.allow_mutator("swap_local_nodes", c_swap_local_nodes);
            tool.allow_mutator("insert_local_node", c_insert_local_node);
            if options.unrestricted {
                tool.allow_mutator("unrestricted_delete", c_unrestricted_delete);
                tool.allow_mutator("unrestricted_hoist_rule", c_unrestricted_hoist_rule);
            }
        }
        if options.recombine {
            tool.allow_recombiner("replace_node", c_replace_node);
            tool.allow_recombiner("insert_quantified", c_insert_quantified);
        }
        tool
    }

    /// Attaches a structural population and registers the pool-backed
    /// creators.
    pub fn with_population(mut self, population: SubtreePopulation) -> Self {
        self.population = Some(population);
        self.allow_mutator("replace_from_pool", c_replace_from_pool);
        self.allow_mutator("insert_quantified_from_pool", c_insert_quantified_from_pool);
        self
    }

    /// Attaches an external byte mutator and registers the lexer-level
    /// creator (unrestricted engines only: the result may be
    /// ungrammatical).
    pub fn with_byte_mutator(mut self, mutator: ByteMutatorFn) -> Self {
        self.byte_mutator = Some(mutator);
        if self.unrestricted {
            self.allow_mutator("libfuzzer_mutate", c_libfuzzer_mutate);
        }
        self
    }

    fn allowed(&self, name: &str) -> bool {
        (self.allowlist.is_empty() || self.allowlist.contains(name))
            && !self.blocklist.contains(name)
    }

    fn allow_generator(&mut self, name: &'static str, f: CreatorFn) {
        if self.allowed(name) {
            self.generators.insert(name, f);
        }
    }

    fn allow_mutator(&mut self, name: &'static str, f: CreatorFn) {
        if self.allowed(name) {
            self.mutators.insert(name, f);
        }
    }

    fn allow_recombiner(&mut self, name: &'static str, f: CreatorFn) {
        if self.allowed(name) {
            self.recombiners.insert(name, f);
        }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }

    pub fn factory(&self) -> &GeneratorFactory {
        &self.factory
    }

    /// Memoizes a serialized test. Returns false when the byte sequence
    /// was already seen within the memo window; eviction is FIFO.
    pub fn memoize_test(&mut self, bytes: &[u8]) -> bool {
        if self.memo_size == 0 {
            return true;
        }
        let mut h = FxHasher::default();
        h.write(bytes);
        let digest = h.finish();
        if !self.memo.insert(digest) {
            return false;
        }
        self.memo_order.push_back(digest);
        if self.memo.len() > self.memo_size {
            if let Some(oldest) = self.memo_order.pop_front() {
                self.memo.remove(&oldest);
            }
        }
        true
    }

    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }

    /// Instantiates a new tree for `rule_name` (empty: the configured or
    /// grammar-default start rule), budgeted at `limit - reserve`.
    /// Returns nothing for unknown rule names.
    pub fn generate(&mut self, rule_name: &str, reserve: RuleSize) -> Option<Tree> {
        let mut gen = self.factory.new_generator(self.limit - reserve);
        let rule: &str = if !rule_name.is_empty() {
            rule_name
        } else if !self.rule.is_empty() {
            &self.rule
        } else {
            self.factory.default_rule()
        };
        let Some(f) = gen.rule_fn(rule) else {
            error!("rule {} not found", rule);
            return None;
        };
        trace!("[generate] {}", rule);
        let root = f(&mut gen, None);
        Some(gen.into_tree(root))
    }

    // Uniformly samples creators from a working copy until one succeeds;
    // failed creators are dropped for this call. Some(tree) is a fresh
    // result, None means the recipient holds it (mutated or unchanged).
    fn create_tree(
        &mut self,
        creators: &CreatorMap,
        mut i1: Option<&mut Individual>,
        mut i2: Option<&mut Individual>,
    ) -> Option<Tree> {
        let mut working: Vec<(&'static str, CreatorFn)> =
            creators.iter().map(|(name, f)| (*name, *f)).collect();
        while !working.is_empty() {
            let pick = self.rng.gen_range(0..working.len());
            let (name, f) = working[pick];
            self.last_mutator = name;
            match f(self, i1.as_deref_mut(), i2.as_deref_mut()) {
                Some(Created::Fresh(tree)) => return Some(tree),
                Some(Created::Mutated) => return None,
                None => {
                    working.swap_remove(pick);
                }
            }
        }
        None
    }

    fn apply_transformers(&self, individual: &mut Individual) {
        if self.transformers.is_empty() {
            return;
        }
        let tree = individual.tree_mut();
        for transformer in &self.transformers {
            transformer(tree);
        }
    }

    /// Mutates the individual in place. An empty shell (a `<ROOT>`
    /// without content, or a childless start rule) is regenerated from
    /// the grammar instead.
    pub fn mutate(&mut self, individual: &mut Individual) {
        let root = individual.root();
        enum Regen {
            Attach,
            Replace(NodeId, String),
            No,
        }
        let regen = {
            let tree = individual.tree();
            if tree.child_count(root) == 0 {
                Regen::Attach
            } else {
                let real_root = tree.children(root)[0];
                if tree.node(real_root).is_unparser() && tree.child_count(real_root) == 0 {
                    Regen::Replace(real_root, tree.node(real_root).name().to_string())
                } else {
                    Regen::No
                }
            }
        };
        match regen {
            Regen::Attach => {
                self.last_mutator = "generate";
                if let Some(fresh) = self.generate("", RuleSize::default()) {
                    let tree = individual.tree_mut();
                    let grafted = tree.graft(&fresh, fresh.root());
                    tree.add_child(root, grafted);
                }
            }
            Regen::Replace(real_root, name) => {
                self.last_mutator = "generate";
                if let Some(fresh) = self.generate(&name, RuleSize::default()) {
                    let tree = individual.tree_mut();
                    let grafted = tree.graft(&fresh, fresh.root());
                    tree.replace(real_root, grafted);
                    tree.free_subtree(real_root);
                }
            }
            Regen::No => {
                let creators = self.mutators.clone();
                if let Some(tree) = self.create_tree(&creators, Some(individual), None) {
                    *individual = Individual::new(tree);
                }
                self.apply_transformers(individual);
            }
        }
    }

    /// Recombines donor material into the recipient in place.
    pub fn recombine(&mut self, recipient: &mut Individual, donor: &mut Individual) {
        let creators = self.recombiners.clone();
        if let Some(tree) = self.create_tree(&creators, Some(recipient), Some(donor)) {
            *recipient = Individual::new(tree);
        }
        self.apply_transformers(recipient);
    }

    /// Combined draw over every enabled creator family, selecting
    /// individuals from the population when one is attached.
    pub fn create(&mut self) -> Option<Individual> {
        let (mut i1, mut i2) = match &mut self.population {
            Some(pop) if !pop.empty() => {
                (pop.select_individual(None), pop.select_individual(None))
            }
            _ => (None, None),
        };

        let mut creators = CreatorMap::new();
        if self.enable_generation {
            creators.extend(self.generators.iter().map(|(n, f)| (*n, *f)));
        }
        if i1.is_some() {
            if self.enable_mutation {
                creators.extend(self.mutators.iter().map(|(n, f)| (*n, *f)));
            }
            if self.enable_recombination {
                creators.extend(self.recombiners.iter().map(|(n, f)| (*n, *f)));
            }
        }
        if creators.is_empty() {
            return None;
        }

        let fresh = self.create_tree(&creators, i1.as_mut(), i2.as_mut());
        let mut result = match fresh {
            Some(tree) => Some(Individual::from_bare(tree)),
            None => i1,
        };
        if let Some(individual) = &mut result {
            self.apply_transformers(individual);
        }
        result
    }

    /// Interns a tree into the attached population.
    pub fn save_tree(&mut self, tree: &Tree) {
        if let Some(pop) = &mut self.population {
            pop.add_individual(tree, None);
        }
    }
}

fn is_ancestor(tree: &Tree, ancestor: NodeId, node: NodeId) -> bool {
    let mut cur = tree.parent(node);
    while !cur.is_null() {
        if cur == ancestor {
            return true;
        }
        cur = tree.parent(cur);
    }
    false
}

fn c_generate(
    tool: &mut Tool,
    _i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    tool.generate("", RuleSize::default()).map(Created::Fresh)
}

fn c_regenerate_rule(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    let root = individual.root();

    let (root_tokens, options) = {
        let annot = individual.annotations();
        let root_tokens = annot.info(root).tokens;
        let mut options: Vec<(NodeId, NodeInfo)> = Vec::new();
        for (key, nodes) in annot.rules_by_name() {
            let Some(rule_size) = tool.factory.rule_size(&key.name) else {
                error!("{} not found among rule sizes", key.name);
                continue;
            };
            for &node in nodes {
                let info = annot.info(node);
                if info.level + rule_size.depth < tool.limit.depth
                    && root_tokens - info.tokens + rule_size.tokens < tool.limit.tokens
                {
                    options.push((node, info));
                }
            }
        }
        (root_tokens, options)
    };

    if options.is_empty() {
        trace!("regenerate_rule failed");
        return None;
    }
    let (node, info) = *options.choose(&mut tool.rng).unwrap();
    let name = individual.tree().node(node).name().to_string();
    trace!("[regenerate_rule] {}", name);
    let reserve = RuleSize::new(info.level, root_tokens - info.tokens);
    let fresh = tool.generate(&name, reserve)?;
    let tree = individual.tree_mut();
    let grafted = tree.graft(&fresh, fresh.root());
    tree.replace(node, grafted);
    tree.free_subtree(node);
    Some(Created::Mutated)
}

fn c_replace_node(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    i2: Option<&mut Individual>,
) -> Option<Created> {
    let recipient = i1?;
    let donor = i2?;
    let recipient_root = recipient.root();

    let (recipient_root_tokens, mut recipient_options) = {
        let (tree, annot) = recipient.annotated();
        let root_tokens = annot.info(recipient_root).tokens;
        let options: Vec<(NodeKey, NodeId, NodeInfo)> = annot
            .nodes_by_name()
            .iter()
            .flat_map(|(key, nodes)| nodes.iter().map(move |&n| (key.clone(), n, annot.info(n))))
            .filter(|(_, n, _)| !tree.parent(*n).is_null())
            .collect();
        (root_tokens, options)
    };
    let donor_lookup: BTreeMap<NodeKey, Vec<(NodeId, NodeInfo)>> = {
        let (_, annot) = donor.annotated();
        annot
            .nodes_by_name()
            .iter()
            .map(|(key, nodes)| {
                (key.clone(), nodes.iter().map(|&n| (n, annot.info(n))).collect())
            })
            .collect()
    };

    recipient_options.retain(|(key, _, _)| donor_lookup.contains_key(key));
    recipient_options.shuffle(&mut tool.rng);
    for (key, recipient_node, recipient_info) in recipient_options {
        let mut donor_options = donor_lookup[&key].clone();
        donor_options.shuffle(&mut tool.rng);
        for (donor_node, donor_info) in donor_options {
            // the output tree must not exceed either budget axis
            if recipient_info.level + donor_info.depth <= tool.limit.depth
                && recipient_root_tokens - recipient_info.tokens + donor_info.tokens
                    < tool.limit.tokens
            {
                trace!("[replace_node] {} {}", key.name, key.idx);
                let tree = recipient.tree_mut();
                let grafted = tree.graft(donor.tree(), donor_node);
                tree.replace(recipient_node, grafted);
                tree.free_subtree(recipient_node);
                return Some(Created::Mutated);
            }
        }
    }
    trace!("replace_node failed");
    None
}

fn c_insert_quantified(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    i2: Option<&mut Individual>,
) -> Option<Created> {
    let recipient = i1?;
    let donor = i2?;
    let recipient_root = recipient.root();

    let (recipient_root_tokens, mut recipient_options) = {
        let (tree, annot) = recipient.annotated();
        let root_tokens = annot.info(recipient_root).tokens;
        let mut options: Vec<(NodeKey, NodeId, i32)> = Vec::new();
        for (key, nodes) in annot.quants_by_name() {
            for &node in nodes {
                if let Node::Quantifier { stop, .. } = tree.node(node) {
                    if (tree.child_count(node) as i32) < *stop {
                        options.push((key.clone(), node, annot.info(node).level));
                    }
                }
            }
        }
        (root_tokens, options)
    };
    let donor_children: BTreeMap<NodeKey, Vec<(NodeId, NodeInfo)>> = {
        let (tree, annot) = donor.annotated();
        let mut map: BTreeMap<NodeKey, Vec<(NodeId, NodeInfo)>> = BTreeMap::new();
        for (key, quantifiers) in annot.quants_by_name() {
            let entry = map.entry(key.clone()).or_default();
            for &q in quantifiers {
                for &child in tree.children(q) {
                    entry.push((child, annot.info(child)));
                }
            }
        }
        map
    };

    recipient_options
        .retain(|(key, _, _)| donor_children.get(key).is_some_and(|v| !v.is_empty()));
    recipient_options.shuffle(&mut tool.rng);
    for (key, recipient_node, recipient_level) in recipient_options {
        let mut options = donor_children[&key].clone();
        options.shuffle(&mut tool.rng);
        for (donor_node, donor_info) in options {
            if recipient_level + donor_info.depth <= tool.limit.depth
                && recipient_root_tokens + donor_info.tokens < tool.limit.tokens
            {
                let tree = recipient.tree_mut();
                let count = tree.child_count(recipient_node);
                let pos = if count > 0 { tool.rng.gen_range(0..count) } else { 0 };
                let grafted = tree.graft(donor.tree(), donor_node);
                tree.insert_child(recipient_node, pos, grafted);
                trace!("[insert_quantified]");
                return Some(Created::Mutated);
            }
        }
    }
    trace!("insert_quantified failed");
    None
}

fn c_delete_quantified(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    let options: Vec<NodeId> = {
        let (tree, annot) = individual.annotated();
        let mut options = Vec::new();
        for nodes in annot.quants_by_name().values() {
            for &q in nodes {
                if let Node::Quantifier { start, .. } = tree.node(q) {
                    if (tree.child_count(q) as i32) > *start {
                        options.extend(tree.children(q));
                    }
                }
            }
        }
        options
    };
    if options.is_empty() {
        trace!("delete_quantified failed");
        return None;
    }
    let node = *options.choose(&mut tool.rng).unwrap();
    individual.tree_mut().free_subtree(node);
    trace!("[delete_quantified]");
    Some(Created::Mutated)
}

fn c_replicate_quantified(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    let (root_tokens, options) = {
        let (tree, annot) = individual.annotated();
        let root_tokens = annot.info(tree.root()).tokens;
        let mut options: Vec<(NodeId, i32)> = Vec::new();
        for nodes in annot.quants_by_name().values() {
            for &q in nodes {
                if let Node::Quantifier { stop, .. } = tree.node(q) {
                    if *stop > tree.child_count(q) as i32 {
                        for &child in tree.children(q) {
                            let tokens = annot.info(child).tokens;
                            if tokens > 0 && root_tokens + tokens <= tool.limit.tokens {
                                options.push((child, tokens));
                            }
                        }
                    }
                }
            }
        }
        (root_tokens, options)
    };
    if options.is_empty() {
        trace!("replicate_quantified failed");
        return None;
    }
    let (node, node_tokens) = *options.choose(&mut tool.rng).unwrap();
    let max_repeat = if tool.limit.tokens != RuleSize::MAX.tokens {
        (tool.limit.tokens - root_tokens) / node_tokens
    } else {
        1
    };
    let repeat = if max_repeat > 1 { tool.rng.gen_range(1..=max_repeat) } else { 1 };
    let parent = individual.tree().parent(node);
    for _ in 0..repeat {
        let tree = individual.tree_mut();
        let copy = tree.duplicate(node);
        let pos = tool.rng.gen_range(0..tree.child_count(parent));
        tree.insert_child(parent, pos, copy);
    }
    trace!("[replicate_quantified]");
    Some(Created::Mutated)
}

fn c_shuffle_quantifieds(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    let options: Vec<NodeId> = {
        let (tree, annot) = individual.annotated();
        annot
            .quants_by_name()
            .values()
            .flatten()
            .copied()
            .filter(|&q| tree.child_count(q) > 1)
            .collect()
    };
    if options.is_empty() {
        trace!("shuffle_quantifieds failed");
        return None;
    }
    let node = *options.choose(&mut tool.rng).unwrap();
    let tree = individual.tree_mut();
    let mut kids: Vec<NodeId> = tree.children(node).to_vec();
    kids.shuffle(&mut tool.rng);
    // same child set in a new order, parent links unaffected
    tree.set_children_raw(node, &kids);
    trace!("[shuffle_quantifieds]");
    Some(Created::Mutated)
}

fn c_hoist_rule(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    let root = individual.root();
    let mut rules = individual.annotations().rules();
    rules.shuffle(&mut tool.rng);
    for node in rules {
        let found = {
            let tree = individual.tree();
            let name = tree.node(node).name();
            let mut parent = tree.parent(node);
            let mut found = NodeId::NULL;
            while !parent.is_null() {
                if parent != root && tree.node(parent).name() == name {
                    found = parent;
                    break;
                }
                parent = tree.parent(parent);
            }
            found
        };
        if !found.is_null() {
            trace!("[hoist_rule] {}", individual.tree().node(found).name());
            let tree = individual.tree_mut();
            tree.detach(node);
            tree.replace(found, node);
            tree.free_subtree(found);
            return Some(Created::Mutated);
        }
    }
    trace!("hoist_rule failed");
    None
}

fn c_swap_local_nodes(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    let (mut buckets, infos) = {
        let (_, annot) = individual.annotated();
        let mut buckets: Vec<Vec<NodeId>> = Vec::new();
        for map in [annot.rules_by_name(), annot.quants_by_name(), annot.alts_by_name()] {
            for nodes in map.values() {
                if nodes.len() > 1 {
                    buckets.push(nodes.clone());
                }
            }
        }
        let infos: FxHashMap<NodeId, NodeInfo> =
            buckets.iter().flatten().map(|&n| (n, annot.info(n))).collect();
        (buckets, infos)
    };
    if buckets.is_empty() {
        return None;
    }

    buckets.shuffle(&mut tool.rng);
    for mut bucket in buckets {
        bucket.shuffle(&mut tool.rng);
        for i in 0..bucket.len().saturating_sub(1) {
            let first = bucket[i];
            let first_info = infos[&first];
            for &second in &bucket[i + 1..] {
                let second_info = infos[&second];
                // both orientations must fit under the depth limit
                if first_info.level + second_info.depth > tool.limit.depth
                    || second_info.level + first_info.depth > tool.limit.depth
                {
                    continue;
                }
                let tree = individual.tree();
                // identical subtrees would swap into a no-op
                if tree.equal_tokens(first, tree, second) {
                    continue;
                }
                // the two subtrees must be disjoint in either direction
                if is_ancestor(tree, first, second) || is_ancestor(tree, second, first) {
                    continue;
                }
                individual.tree_mut().swap_subtrees(first, second);
                trace!("[swap_local_nodes]");
                return Some(Created::Mutated);
            }
        }
    }
    trace!("swap_local_nodes failed");
    None
}

fn c_insert_local_node(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    let (root_tokens, mut buckets, infos, stops) = {
        let (tree, annot) = individual.annotated();
        let root_tokens = annot.info(tree.root()).tokens;
        let mut buckets: Vec<Vec<NodeId>> = Vec::new();
        for nodes in annot.quants_by_name().values() {
            if nodes.len() > 1 {
                buckets.push(nodes.clone());
            }
        }
        let mut infos: FxHashMap<NodeId, NodeInfo> = FxHashMap::default();
        let mut stops: FxHashMap<NodeId, i32> = FxHashMap::default();
        for &q in buckets.iter().flatten() {
            infos.insert(q, annot.info(q));
            if let Node::Quantifier { stop, .. } = tree.node(q) {
                stops.insert(q, *stop);
            }
            for &child in tree.children(q) {
                infos.insert(child, annot.info(child));
            }
        }
        (root_tokens, buckets, infos, stops)
    };
    if buckets.is_empty() {
        return None;
    }

    buckets.shuffle(&mut tool.rng);
    for mut bucket in buckets {
        bucket.shuffle(&mut tool.rng);
        for i in 0..bucket.len().saturating_sub(1) {
            let recipient = bucket[i];
            if individual.tree().child_count(recipient) as i32 >= stops[&recipient] {
                continue;
            }
            let recipient_level = infos[&recipient].level;
            for &donor_quantifier in &bucket[i + 1..] {
                let donor_nodes: Vec<NodeId> =
                    individual.tree().children(donor_quantifier).to_vec();
                for donor_node in donor_nodes {
                    let donor_info = infos[&donor_node];
                    if recipient_level + donor_info.depth <= tool.limit.depth
                        && root_tokens + donor_info.tokens <= tool.limit.tokens
                    {
                        let tree = individual.tree_mut();
                        let copy = tree.duplicate(donor_node);
                        let count = tree.child_count(recipient);
                        let pos = if count > 0 { tool.rng.gen_range(0..count) } else { 0 };
                        tree.insert_child(recipient, pos, copy);
                        trace!("[insert_local_node]");
                        return Some(Created::Mutated);
                    }
                }
            }
        }
    }
    trace!("insert_local_node failed");
    None
}

fn c_unrestricted_delete(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    let options = individual.annotations().rules();
    if options.is_empty() {
        trace!("unrestricted_delete failed");
        return None;
    }
    let node = *options.choose(&mut tool.rng).unwrap();
    trace!("[unrestricted_delete] {}", individual.tree().node(node).name());
    individual.tree_mut().free_subtree(node);
    Some(Created::Mutated)
}

fn c_unrestricted_hoist_rule(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    let root = individual.root();
    let mut rules = individual.annotations().rules();
    rules.shuffle(&mut tool.rng);
    for node in rules {
        let options: Vec<NodeId> = {
            let tree = individual.tree();
            let mut options = Vec::new();
            let mut parent = tree.parent(node);
            while !parent.is_null() && parent != root {
                if tree.node(parent).is_unparser()
                    && tree.child_count(parent) > 1
                    && !tree.equal_tokens(node, tree, parent)
                {
                    options.push(parent);
                }
                parent = tree.parent(parent);
            }
            options
        };
        if !options.is_empty() {
            let hoist_parent = *options.choose(&mut tool.rng).unwrap();
            trace!(
                "[unrestricted_hoist_rule] {}",
                individual.tree().node(hoist_parent).name()
            );
            let tree = individual.tree_mut();
            tree.detach(node);
            tree.replace(hoist_parent, node);
            tree.free_subtree(hoist_parent);
            return Some(Created::Mutated);
        }
    }
    trace!("unrestricted_hoist_rule failed");
    None
}

fn c_libfuzzer_mutate(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    let mutator = tool.byte_mutator?;
    let options: Vec<NodeId> = {
        let (tree, annot) = individual.annotated();
        annot
            .rules_by_name()
            .values()
            .flatten()
            .copied()
            .filter(|&n| tree.node(n).is_unlexer())
            .collect()
    };
    if options.is_empty() {
        trace!("libfuzzer_mutate failed");
        return None;
    }
    let node = *options.choose(&mut tool.rng).unwrap();
    let tree = individual.tree_mut();
    if let Node::Unlexer { name, src, .. } = tree.node_mut(node) {
        trace!("[libfuzzer_mutate] {}", name);
        let mut bytes = src.as_bytes().to_vec();
        bytes.reserve(50);
        mutator(&mut bytes);
        *src = String::from_utf8_lossy(&bytes).into_owned();
    }
    Some(Created::Mutated)
}

fn c_replace_from_pool(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    tool.population.as_ref()?;
    let (root_tokens, mut options) = {
        let (tree, annot) = individual.annotated();
        let root_tokens = annot.info(tree.root()).tokens;
        let options: Vec<(NodeKey, NodeId, NodeInfo)> = annot
            .nodes_by_name()
            .iter()
            .flat_map(|(key, nodes)| nodes.iter().map(move |&n| (key.clone(), n, annot.info(n))))
            .filter(|(_, n, _)| !tree.parent(*n).is_null())
            .collect();
        (root_tokens, options)
    };
    options.shuffle(&mut tool.rng);
    for (key, node, info) in options {
        let donor = {
            let pop = tool.population.as_mut().unwrap();
            pop.select_by_type(
                &key,
                tool.limit.depth - info.level,
                tool.limit.tokens - (root_tokens - info.tokens),
            )
        };
        let Some(donor) = donor else {
            trace!("{} not found in tree pool", key.name);
            continue;
        };
        trace!("[replace_from_pool] {}", key.name);
        let tree = individual.tree_mut();
        let grafted = tree.graft(donor.tree(), donor.root());
        tree.replace(node, grafted);
        tree.free_subtree(node);
        return Some(Created::Mutated);
    }
    trace!("replace_from_pool failed");
    None
}

fn c_insert_quantified_from_pool(
    tool: &mut Tool,
    i1: Option<&mut Individual>,
    _i2: Option<&mut Individual>,
) -> Option<Created> {
    let individual = i1?;
    tool.population.as_ref()?;
    let (root_tokens, mut options) = {
        let (tree, annot) = individual.annotated();
        let root_tokens = annot.info(tree.root()).tokens;
        let mut options: Vec<(NodeKey, NodeId, i32)> = Vec::new();
        for (key, nodes) in annot.quants_by_name() {
            for &node in nodes {
                if let Node::Quantifier { stop, .. } = tree.node(node) {
                    if (tree.child_count(node) as i32) < *stop {
                        options.push((key.clone(), node, annot.info(node).level));
                    }
                }
            }
        }
        (root_tokens, options)
    };
    options.shuffle(&mut tool.rng);
    for (key, node, level) in options {
        // donors are quantified occurrences of the same quantifier key
        let quantified_key = NodeKey::new(&key.name, NodeKind::Quantified, key.idx);
        let donor = {
            let pop = tool.population.as_mut().unwrap();
            pop.select_by_type(
                &quantified_key,
                tool.limit.depth - level,
                tool.limit.tokens - root_tokens,
            )
        };
        let Some(donor) = donor else {
            trace!("{} not found in tree pool", key.name);
            continue;
        };
        let tree = individual.tree_mut();
        let count = tree.child_count(node);
        let pos = if count > 0 { tool.rng.gen_range(0..count) } else { 0 };
        let grafted = tree.graft(donor.tree(), donor.root());
        tree.insert_child(node, pos, grafted);
        trace!("[insert_quantified_from_pool]");
        return Some(Created::Mutated);
    }
    trace!("insert_quantified_from_pool failed");
    None
}
