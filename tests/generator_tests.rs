use grammut::generator::{Generator, Grammar};
use grammut::model::Model;
use grammut::rule::{Node, NodeId, RuleSize, Tree};
use std::sync::Arc;

struct EagerModel;

impl Model for EagerModel {
    fn choice(&mut self, _tree: &Tree, _node: NodeId, _idx: usize, weights: &[f64]) -> usize {
        weights
            .iter()
            .position(|&w| w > 0.0)
            .unwrap_or(weights.len() - 1)
    }

    fn quantify(
        &mut self,
        _tree: &Tree,
        _node: NodeId,
        _idx: usize,
        _cnt: i32,
        _start: i32,
        _stop: i32,
        _prob: f64,
    ) -> bool {
        true
    }

    fn charset(&mut self, _tree: &Tree, _node: NodeId, _idx: usize, chars: &[char]) -> char {
        chars[0]
    }
}

// S -> 'a'+
fn rule_plus(gen: &mut Generator, parent: Option<NodeId>) -> NodeId {
    let rule = gen.unparser_rule("S", parent);
    let mut quant = gen.quantifier(&rule, rule.node, 0, 1, i32::MAX, RuleSize::new(0, 1), 0);
    while gen.quant_next(&mut quant) {
        let quantified = gen.quantified(&quant);
        gen.lexeme(quantified, "a");
    }
    gen.exit_quantifier(quant);
    let node = rule.node;
    gen.exit_rule(rule);
    node
}

fn generator(limit: RuleSize) -> Generator {
    let grammar = Arc::new(Grammar::new("S").rule("S", RuleSize::new(1, 1), rule_plus));
    Generator::new(grammar, Box::new(EagerModel), Vec::new(), limit)
}

#[test]
fn generation_respects_token_limit() {
    // an always-continue quantifier stops exactly at the token budget
    let mut gen = generator(RuleSize::new(10, 3));
    let root = rule_plus(&mut gen, None);
    let tree = gen.into_tree(root);
    assert_eq!(tree.tokens(tree.root()).count(), 3);
    assert!(tree.tokens(tree.root()).all(|t| t == "a"));
}

#[test]
fn infeasible_alternation_relaxes_limit_to_min_branch() {
    let mut gen = generator(RuleSize::new(2, 2));
    let rule = gen.unparser_rule("r", None);
    assert_eq!(gen.size, RuleSize::new(1, 0));

    let alt = gen.alternation(
        &rule,
        rule.node,
        0,
        &[RuleSize::new(2, 10), RuleSize::new(2, 1)],
        0,
        &[1.0, 1.0],
    );
    // neither branch fits (1+2 > 2 on depth): the limit is raised by the
    // smaller minimum and the cheap branch is the only one admitted
    assert_eq!(alt.choice, 1);
    assert_eq!(gen.limit.depth, 3);
    match gen.tree().node(alt.node) {
        Node::Alternative { alt_idx, idx } => {
            assert_eq!(*alt_idx, 0);
            assert_eq!(*idx, 1);
        }
        _ => panic!("expected an alternative node"),
    }

    gen.exit_alternation(alt);
    // the relaxation is scoped to the alternation
    assert_eq!(gen.limit, RuleSize::new(2, 2));
    gen.exit_rule(rule);
}

#[test]
fn quantifier_start_is_mandatory_even_over_budget() {
    // a zero-token budget still admits the mandatory first repetition
    let mut gen = generator(RuleSize::new(10, 0));
    let root = rule_plus(&mut gen, None);
    let tree = gen.into_tree(root);
    assert_eq!(tree.tokens(tree.root()).count(), 1);
}
