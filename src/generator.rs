//! Generation-time machinery: the per-invocation generator, its scoped
//! context stack, and the grammar/factory contract provided by upstream
//! grammar preprocessing.

use crate::model::{DefaultModel, Model, WeightedModel};
use crate::rule::{Node, NodeId, RuleSize, Tree};
use crate::weights::{AltMap, QuantMap};
use log::warn;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Probability driven into `Model::quantify` when no table overrides it.
pub const DEFAULT_QUANT_PROB: f64 = 0.5;

/// Observer of rule entries and exits. Enter events fire in listener
/// registration order, exit events in reverse.
pub trait Listener {
    fn enter_rule(&mut self, _tree: &Tree, _node: NodeId) {}
    fn exit_rule(&mut self, _tree: &Tree, _node: NodeId) {}
}

/// Rule-production callback emitted by grammar preprocessing.
pub type RuleFn = fn(&mut Generator, Option<NodeId>) -> NodeId;

/// Static description of a preprocessed grammar: rule-production
/// callbacks plus the minimum-size tables computed upstream.
pub struct Grammar {
    pub default_rule: &'static str,
    pub rule_fns: FxHashMap<&'static str, RuleFn>,
    pub rule_sizes: FxHashMap<&'static str, RuleSize>,
    pub alt_sizes: FxHashMap<(&'static str, usize), Vec<RuleSize>>,
    pub quant_sizes: FxHashMap<(&'static str, usize), RuleSize>,
}

impl Grammar {
    pub fn new(default_rule: &'static str) -> Self {
        Self {
            default_rule,
            rule_fns: FxHashMap::default(),
            rule_sizes: FxHashMap::default(),
            alt_sizes: FxHashMap::default(),
            quant_sizes: FxHashMap::default(),
        }
    }

    pub fn rule(mut self, name: &'static str, size: RuleSize, f: RuleFn) -> Self {
        self.rule_fns.insert(name, f);
        self.rule_sizes.insert(name, size);
        self
    }
}

type ListenerCtor = fn() -> Box<dyn Listener>;

/// Binds a grammar to per-invocation generators, optionally wrapping the
/// default model with externally loaded weight tables and attaching
/// listeners.
pub struct GeneratorFactory {
    grammar: Arc<Grammar>,
    alts: AltMap,
    quants: QuantMap,
    listeners: Vec<ListenerCtor>,
}

impl GeneratorFactory {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        Self { grammar, alts: AltMap::default(), quants: QuantMap::default(), listeners: Vec::new() }
    }

    pub fn with_weights(mut self, alts: AltMap, quants: QuantMap) -> Self {
        self.alts = alts;
        self.quants = quants;
        self
    }

    pub fn with_listener(mut self, ctor: ListenerCtor) -> Self {
        self.listeners.push(ctor);
        self
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    pub fn default_rule(&self) -> &'static str {
        self.grammar.default_rule
    }

    pub fn rule_size(&self, name: &str) -> Option<RuleSize> {
        self.grammar.rule_sizes.get(name).copied()
    }

    pub fn new_generator(&self, limit: RuleSize) -> Generator {
        let model: Box<dyn Model> = if self.alts.is_empty() && self.quants.is_empty() {
            Box::new(DefaultModel::new())
        } else {
            Box::new(WeightedModel::new(
                Box::new(DefaultModel::new()),
                self.alts.clone(),
                self.quants.clone(),
            ))
        };
        let listeners = self.listeners.iter().map(|ctor| ctor()).collect();
        Generator::new(self.grammar.clone(), model, listeners, limit)
    }
}

/// Open rule scope handed back to [`Generator::exit_rule`].
pub struct RuleCtx {
    pub node: NodeId,
    unlexer: bool,
    sub_lexer: bool,
    saved_name: String,
    start_depth: i32,
}

/// Open alternation scope handed back to [`Generator::exit_alternation`].
pub struct AltCtx {
    /// Index of the chosen branch.
    pub choice: usize,
    /// The alternative node recording the choice (the rule node itself
    /// inside lexer rules).
    pub node: NodeId,
    reserve: i32,
    saved_limit: RuleSize,
}

/// Open quantifier scope driving [`Generator::quant_next`].
pub struct QuantCtx {
    pub node: NodeId,
    rule_node: NodeId,
    idx: usize,
    start: i32,
    stop: i32,
    min_size: RuleSize,
    reserve: i32,
    cnt: i32,
    lexer: bool,
}

/// Per-invocation generation state: the tree under construction, the
/// accumulated size, the hard limit, the model and the listeners.
///
/// Generation never fails: when no alternative fits the budget the limit
/// is raised for the scope of the offending alternation (with a warning)
/// so that some tree is always produced.
pub struct Generator {
    grammar: Arc<Grammar>,
    pub model: Box<dyn Model>,
    listeners: Vec<Box<dyn Listener>>,
    pub size: RuleSize,
    pub limit: RuleSize,
    tree: Tree,
}

impl Generator {
    pub fn new(
        grammar: Arc<Grammar>,
        model: Box<dyn Model>,
        listeners: Vec<Box<dyn Listener>>,
        limit: RuleSize,
    ) -> Self {
        Self { grammar, model, listeners, size: RuleSize::default(), limit, tree: Tree::new() }
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    pub fn rule_fn(&self, name: &str) -> Option<RuleFn> {
        self.grammar.rule_fns.get(name).copied()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    /// Finishes generation, returning the built tree rooted at `root`.
    pub fn into_tree(mut self, root: NodeId) -> Tree {
        self.tree.set_root(root);
        self.tree
    }

    fn fire_enter(&mut self, node: NodeId) {
        for listener in self.listeners.iter_mut() {
            listener.enter_rule(&self.tree, node);
        }
    }

    fn fire_exit(&mut self, node: NodeId) {
        for listener in self.listeners.iter_mut().rev() {
            listener.exit_rule(&self.tree, node);
        }
    }

    /// Opens an unparser rule scope.
    pub fn unparser_rule(&mut self, name: &str, parent: Option<NodeId>) -> RuleCtx {
        let node = self.tree.add(Node::unparser(name));
        if let Some(p) = parent {
            self.tree.add_child(p, node);
        }
        self.size.depth += 1;
        self.fire_enter(node);
        RuleCtx { node, unlexer: false, sub_lexer: false, saved_name: String::new(), start_depth: 0 }
    }

    /// Opens an unlexer rule scope. When the parent is itself an unlexer
    /// node this is a sub-rule: no new node is created, the parent is
    /// temporarily renamed to the sub-rule and restored on exit. The
    /// node's stored depth records the deepest nesting observed between
    /// entry and exit.
    pub fn unlexer_rule(&mut self, name: &str, parent: Option<NodeId>, immutable: bool) -> RuleCtx {
        let parent_is_unlexer = parent.map_or(false, |p| self.tree.node(p).is_unlexer());
        let (node, sub_lexer, saved_name, start_depth);
        if parent_is_unlexer {
            let p = parent.unwrap();
            saved_name = match self.tree.node_mut(p) {
                Node::Unlexer { name: n, .. } => std::mem::replace(n, name.to_string()),
                _ => unreachable!(),
            };
            node = p;
            sub_lexer = true;
            start_depth = 0;
        } else {
            node = self.tree.add(Node::unlexer(name, immutable));
            if let Some(p) = parent {
                self.tree.add_child(p, node);
            }
            saved_name = String::new();
            sub_lexer = false;
            start_depth = self.size.depth;
        }

        self.size.depth += 1;
        self.fire_enter(node);

        self.size.tokens += 1;
        let depth = self.size.depth;
        if let Node::Unlexer { size, .. } = self.tree.node_mut(node) {
            size.tokens += 1;
            if depth > size.depth {
                size.depth = depth;
            }
        }
        RuleCtx { node, unlexer: true, sub_lexer, saved_name, start_depth }
    }

    /// Closes a rule scope opened by `unparser_rule` or `unlexer_rule`.
    pub fn exit_rule(&mut self, ctx: RuleCtx) {
        self.fire_exit(ctx.node);
        self.size.depth -= 1;
        if ctx.unlexer {
            if ctx.start_depth > 0 {
                if let Node::Unlexer { size, .. } = self.tree.node_mut(ctx.node) {
                    size.depth -= ctx.start_depth;
                }
            }
            if ctx.sub_lexer {
                if let Node::Unlexer { name, .. } = self.tree.node_mut(ctx.node) {
                    *name = ctx.saved_name;
                }
            }
        }
    }

    /// Appends produced text to the open unlexer node.
    pub fn push_src(&mut self, ctx: &RuleCtx, s: &str) {
        match self.tree.node_mut(ctx.node) {
            Node::Unlexer { src, .. } => src.push_str(s),
            _ => panic!("push_src outside an unlexer rule"),
        }
    }

    /// Appends an anonymous literal token under an unparser node.
    pub fn lexeme(&mut self, parent: NodeId, src: &str) -> NodeId {
        let size = if src.is_empty() { RuleSize::default() } else { RuleSize::new(1, 1) };
        if !src.is_empty() {
            self.size.tokens += 1;
        }
        let node = self.tree.add(Node::Unlexer {
            name: String::new(),
            src: src.to_string(),
            size,
            immutable: false,
        });
        self.tree.add_child(parent, node);
        node
    }

    /// Opens an alternation: reserves lookahead tokens, masks the branch
    /// weights by feasibility, relaxes the limit when nothing fits, asks
    /// the model to choose, and records the choice in an alternative node
    /// (inside unparser rules).
    pub fn alternation(
        &mut self,
        rule: &RuleCtx,
        parent: NodeId,
        idx: usize,
        min_sizes: &[RuleSize],
        reserve: i32,
        conditions: &[f64],
    ) -> AltCtx {
        let saved_limit = self.limit;
        self.size.tokens += reserve;

        let mut weights: Vec<f64> = (0..conditions.len())
            .map(|i| if self.size + min_sizes[i] <= self.limit { conditions[i] } else { 0.0 })
            .collect();
        if weights.iter().sum::<f64>() == 0.0 {
            // no branch fits: relax the limit toward the smallest
            // positive-condition minimum (depth first, then tokens)
            let mut min_size = RuleSize::MAX;
            for (i, &cond) in conditions.iter().enumerate() {
                if cond > 0.0
                    && (min_sizes[i].depth < min_size.depth
                        || (min_sizes[i].depth == min_size.depth
                            && min_sizes[i].tokens < min_size.tokens))
                {
                    min_size = min_sizes[i];
                }
            }
            let new_limit = self.size + min_size;
            if new_limit.depth > self.limit.depth {
                warn!(
                    "max_depth must be temporarily updated from {} to {}",
                    self.limit.depth, new_limit.depth
                );
                self.limit.depth = new_limit.depth;
            }
            if new_limit.tokens > self.limit.tokens {
                warn!(
                    "max_tokens must be temporarily updated from {} to {}",
                    self.limit.tokens, new_limit.tokens
                );
                self.limit.tokens = new_limit.tokens;
            }
            for (i, w) in weights.iter_mut().enumerate() {
                *w = if self.size + min_sizes[i] <= self.limit { conditions[i] } else { 0.0 };
            }
        }

        let choice = self.model.choice(&self.tree, rule.node, idx, &weights);
        let node = if !rule.unlexer {
            let alt =
                self.tree.add(Node::Alternative { alt_idx: idx as i32, idx: choice as i32 });
            self.tree.add_child(parent, alt);
            alt
        } else {
            parent
        };
        AltCtx { choice, node, reserve, saved_limit }
    }

    /// Closes an alternation scope, releasing the reserve and restoring
    /// the limit snapshot taken at entry.
    pub fn exit_alternation(&mut self, ctx: AltCtx) {
        self.limit = ctx.saved_limit;
        self.size.tokens -= ctx.reserve;
    }

    /// Opens a quantifier scope.
    #[allow(clippy::too_many_arguments)]
    pub fn quantifier(
        &mut self,
        rule: &RuleCtx,
        parent: NodeId,
        idx: usize,
        start: i32,
        stop: i32,
        min_size: RuleSize,
        reserve: i32,
    ) -> QuantCtx {
        self.size.tokens += reserve;
        let node = if !rule.unlexer {
            let q = self.tree.add(Node::Quantifier { idx: idx as i32, start, stop });
            self.tree.add_child(parent, q);
            q
        } else {
            parent
        };
        QuantCtx {
            node,
            rule_node: rule.node,
            idx,
            start,
            stop,
            min_size,
            reserve,
            cnt: 0,
            lexer: rule.unlexer,
        }
    }

    /// Decides whether one more repetition of the quantifier happens:
    /// mandatory below `start`, forbidden at `stop` or over budget,
    /// otherwise up to the model.
    pub fn quant_next(&mut self, ctx: &mut QuantCtx) -> bool {
        if ctx.cnt < ctx.start {
            ctx.cnt += 1;
            return true;
        }
        if ctx.cnt < ctx.stop
            && self.size + ctx.min_size <= self.limit
            && self.model.quantify(
                &self.tree,
                ctx.rule_node,
                ctx.idx,
                ctx.cnt,
                ctx.start,
                ctx.stop,
                DEFAULT_QUANT_PROB,
            )
        {
            ctx.cnt += 1;
            return true;
        }
        false
    }

    /// Opens one quantified repetition under the quantifier.
    pub fn quantified(&mut self, ctx: &QuantCtx) -> NodeId {
        if ctx.lexer {
            return ctx.node;
        }
        let qd = self.tree.add(Node::Quantified);
        self.tree.add_child(ctx.node, qd);
        qd
    }

    /// Closes a quantifier scope, releasing the reserve.
    pub fn exit_quantifier(&mut self, ctx: QuantCtx) {
        self.size.tokens -= ctx.reserve;
    }
}

/// Expands inclusive-start/exclusive-end code-point ranges into the
/// character set consulted by `Model::charset`.
pub fn charset(ranges: &[(u32, u32)]) -> Vec<char> {
    let mut chars = Vec::new();
    for &(start, end) in ranges {
        for cp in start..end {
            if let Some(c) = char::from_u32(cp) {
                chars.push(c);
            }
        }
    }
    chars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_grammar() -> Arc<Grammar> {
        Arc::new(Grammar::new("start"))
    }

    fn generator(limit: RuleSize) -> Generator {
        Generator::new(empty_grammar(), Box::new(DefaultModel::seeded(1)), Vec::new(), limit)
    }

    #[test]
    fn unparser_rule_tracks_depth() {
        let mut gen = generator(RuleSize::MAX);
        let outer = gen.unparser_rule("a", None);
        assert_eq!(gen.size.depth, 1);
        let inner = gen.unparser_rule("b", Some(outer.node));
        assert_eq!(gen.size.depth, 2);
        let (outer_node, inner_node) = (outer.node, inner.node);
        gen.exit_rule(inner);
        gen.exit_rule(outer);
        assert_eq!(gen.size.depth, 0);
        assert_eq!(gen.tree().parent(inner_node), outer_node);
        assert_eq!(gen.tree().children(outer_node), &[inner_node]);
    }

    #[test]
    fn unlexer_sub_rule_renames_and_restores() {
        let mut gen = generator(RuleSize::MAX);
        let rule = gen.unparser_rule("r", None);
        let outer = gen.unlexer_rule("Tok", Some(rule.node), false);
        gen.push_src(&outer, "x");
        let inner = gen.unlexer_rule("Sub", Some(outer.node), false);
        assert_eq!(gen.tree().node(inner.node).name(), "Sub");
        gen.push_src(&inner, "y");
        let tok = inner.node;
        gen.exit_rule(inner);
        assert_eq!(gen.tree().node(tok).name(), "Tok");
        gen.exit_rule(outer);
        // one node carries the concatenated text of rule and sub-rule
        match gen.tree().node(tok) {
            Node::Unlexer { src, size, .. } => {
                assert_eq!(src, "xy");
                assert_eq!(size.tokens, 2);
            }
            _ => panic!("expected unlexer node"),
        }
        assert_eq!(gen.size.tokens, 2);
    }

    #[test]
    fn unlexer_depth_is_relative() {
        let mut gen = generator(RuleSize::MAX);
        let rule = gen.unparser_rule("r", None);
        let tok_ctx = gen.unlexer_rule("Tok", Some(rule.node), false);
        let sub = gen.unlexer_rule("Sub", Some(tok_ctx.node), false);
        let tok = tok_ctx.node;
        gen.exit_rule(sub);
        gen.exit_rule(tok_ctx);
        match gen.tree().node(tok) {
            // entered at depth 1, deepest nesting two levels below
            Node::Unlexer { size, .. } => assert_eq!(size.depth, 2),
            _ => panic!("expected unlexer node"),
        }
        gen.exit_rule(rule);
    }

    #[test]
    fn lexeme_counts_tokens() {
        let mut gen = generator(RuleSize::MAX);
        let rule = gen.unparser_rule("r", None);
        gen.lexeme(rule.node, "kw");
        gen.lexeme(rule.node, "");
        assert_eq!(gen.size.tokens, 1);
        assert_eq!(gen.tree().child_count(rule.node), 2);
    }

    #[test]
    fn charset_expands_ranges() {
        let chars = charset(&[(97, 100), (48, 50)]);
        assert_eq!(chars, vec!['a', 'b', 'c', '0', '1']);
    }

    #[test]
    fn listener_order_is_fifo_enter_lifo_exit() {
        use std::cell::RefCell;
        use std::rc::Rc;

        struct Tag {
            id: u32,
            log: Rc<RefCell<Vec<(u32, bool)>>>,
        }
        impl Listener for Tag {
            fn enter_rule(&mut self, _t: &Tree, _n: NodeId) {
                self.log.borrow_mut().push((self.id, true));
            }
            fn exit_rule(&mut self, _t: &Tree, _n: NodeId) {
                self.log.borrow_mut().push((self.id, false));
            }
        }

        let log = Rc::new(RefCell::new(Vec::new()));
        let listeners: Vec<Box<dyn Listener>> = vec![
            Box::new(Tag { id: 1, log: log.clone() }),
            Box::new(Tag { id: 2, log: log.clone() }),
        ];
        let mut gen = Generator::new(
            empty_grammar(),
            Box::new(DefaultModel::seeded(1)),
            listeners,
            RuleSize::MAX,
        );
        let rule = gen.unparser_rule("r", None);
        gen.exit_rule(rule);
        assert_eq!(*log.borrow(), vec![(1, true), (2, true), (2, false), (1, false)]);
    }
}
