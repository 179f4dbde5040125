use grammut::codec::{JsonTreeCodec, TreeCodec};
use grammut::fuzz::FuzzerTool;
use grammut::generator::{Generator, GeneratorFactory, Grammar};
use grammut::population::{Individual, Population, SubtreePopulation};
use grammut::rule::{Node, NodeId, RuleSize, Tree, ROOT_NAME};
use grammut::tool::{Tool, ToolOptions};
use rustc_hash::FxHashSet;
use std::sync::Arc;

// start -> 'x' 'y'
fn rule_start(gen: &mut Generator, parent: Option<NodeId>) -> NodeId {
    let rule = gen.unparser_rule("start", parent);
    gen.lexeme(rule.node, "x");
    gen.lexeme(rule.node, "y");
    let node = rule.node;
    gen.exit_rule(rule);
    node
}

fn grammar() -> Arc<Grammar> {
    Arc::new(Grammar::new("start").rule("start", RuleSize::new(1, 2), rule_start))
}

fn fuzzer(memo_size: usize) -> FuzzerTool {
    let tool = Tool::new(
        GeneratorFactory::new(grammar()),
        ToolOptions { memo_size, ..Default::default() },
    );
    FuzzerTool::new(tool, Box::new(JsonTreeCodec))
}

#[test]
fn undecodable_input_regenerates_start_rule() {
    let mut fuzzer = fuzzer(0);
    let out = fuzzer.mutate_case(b"garbage", 1 << 16, 7).expect("mutation output");
    let tree = JsonTreeCodec.decode(&out).expect("output decodes");
    assert_eq!(tree.node(tree.root()).name(), ROOT_NAME);
    let tokens: Vec<&str> = tree.tokens(tree.root()).collect();
    assert_eq!(tokens, vec!["x", "y"]);
}

#[test]
fn memoized_results_are_rejected() {
    let mut fuzzer = fuzzer(8);
    let first = fuzzer.mutate_case(b"garbage", 1 << 16, 7);
    assert!(first.is_some());
    // same input and seed produce the same bytes, which the memo blocks
    let second = fuzzer.mutate_case(b"garbage", 1 << 16, 7);
    assert!(second.is_none());
}

#[test]
fn oversized_encodings_are_dropped() {
    let mut fuzzer = fuzzer(0);
    assert!(fuzzer.mutate_case(b"garbage", 4, 7).is_none());
}

#[test]
fn one_input_serializes_tokens() {
    let mut fuzzer = fuzzer(0);
    let out = fuzzer.mutate_case(b"garbage", 1 << 16, 7).unwrap();
    assert_eq!(fuzzer.one_input(&out).as_deref(), Some("x y"));
    assert!(fuzzer.one_input(b"junk").is_none());
}

#[test]
fn generate_case_yields_serialized_test() {
    let mut fuzzer = fuzzer(0);
    assert_eq!(fuzzer.generate_case(3).as_deref(), Some("x y"));
}

#[test]
fn crossover_requires_common_material() {
    let mut fuzzer = fuzzer(0);
    let seed_case = fuzzer.mutate_case(b"garbage", 1 << 16, 7).unwrap();
    // recombining two identical trees finds common keys but no budget
    // violation; the result must still be a decodable <ROOT> tree
    let out = fuzzer.crossover_case(&seed_case, &seed_case, 1 << 16, 11).unwrap();
    let tree = JsonTreeCodec.decode(&out).unwrap();
    assert_eq!(tree.node(tree.root()).name(), ROOT_NAME);
}

fn leaf(tree: &mut Tree, parent: NodeId, name: &str, src: &str) {
    let node = tree.add(Node::Unlexer {
        name: name.to_string(),
        src: src.to_string(),
        size: RuleSize::new(1, 1),
        immutable: false,
    });
    tree.add_child(parent, node);
}

#[test]
fn pool_backed_replacement_draws_from_population() {
    // population holds an S variant with token 'pool'
    let mut population = SubtreePopulation::seeded(5);
    let (mut dt, droot) = Tree::with_root(Node::unparser(ROOT_NAME));
    let ds = dt.add(Node::unparser("S"));
    dt.add_child(droot, ds);
    leaf(&mut dt, ds, "A", "pool");
    population.add_individual(&dt, None);

    let mut allowlist = FxHashSet::default();
    allowlist.insert("replace_from_pool".to_string());
    let tool = Tool::new(
        GeneratorFactory::new(grammar()),
        ToolOptions { allowlist, ..Default::default() },
    )
    .with_population(population);

    let (mut rt, rroot) = Tree::with_root(Node::unparser(ROOT_NAME));
    let rs = rt.add(Node::unparser("S"));
    rt.add_child(rroot, rs);
    leaf(&mut rt, rs, "B", "orig");
    let mut individual = Individual::new(rt);

    let mut tool = tool;
    tool.reseed(9);
    tool.mutate(&mut individual);

    let tokens: Vec<&str> = individual.tree().tokens(individual.root()).collect();
    assert_eq!(tokens, vec!["pool"]);
}

#[test]
fn libfuzzer_mutate_rewrites_lexer_content() {
    fn upper(bytes: &mut Vec<u8>) {
        for b in bytes.iter_mut() {
            *b = b.to_ascii_uppercase();
        }
    }

    let mut allowlist = FxHashSet::default();
    allowlist.insert("libfuzzer_mutate".to_string());
    let mut tool = Tool::new(
        GeneratorFactory::new(grammar()),
        ToolOptions { allowlist, ..Default::default() },
    )
    .with_byte_mutator(upper);
    tool.reseed(1);

    let (mut t, root) = Tree::with_root(Node::unparser(ROOT_NAME));
    let s = t.add(Node::unparser("S"));
    t.add_child(root, s);
    leaf(&mut t, s, "A", "abc");
    let mut individual = Individual::new(t);

    tool.mutate(&mut individual);
    let tokens: Vec<&str> = individual.tree().tokens(individual.root()).collect();
    assert_eq!(tokens, vec!["ABC"]);
}
