use grammut::codec::{JsonTreeCodec, TreeCodec};
use grammut::population::Individual;
use grammut::rule::{Node, NodeId, RuleSize, Tree, ROOT_NAME};
use grammut::trim::TreeTrimmer;
use rustc_hash::FxHashSet;

fn leaf(tree: &mut Tree, parent: NodeId, src: &str) {
    let node = tree.add(Node::Unlexer {
        name: "A".to_string(),
        src: src.to_string(),
        size: RuleSize::new(1, 1),
        immutable: false,
    });
    tree.add_child(parent, node);
}

// <ROOT> ( S ( Q[ qd(src) ... ] ) )
fn quantified_tree(srcs: &[&str]) -> (Individual, NodeId) {
    let (mut t, root) = Tree::with_root(Node::unparser(ROOT_NAME));
    let s = t.add(Node::unparser("S"));
    t.add_child(root, s);
    let q = t.add(Node::Quantifier { idx: 0, start: 0, stop: i32::MAX });
    t.add_child(s, q);
    for src in srcs {
        let qd = t.add(Node::Quantified);
        t.add_child(q, qd);
        leaf(&mut t, qd, src);
    }
    (Individual::new(t), q)
}

fn candidate_tokens(codec: &JsonTreeCodec, bytes: &[u8]) -> Vec<String> {
    let tree = codec.decode(bytes).expect("candidate must decode");
    tree.tokens(tree.root()).map(str::to_string).collect()
}

#[test]
fn trimmer_converges_to_required_unit() {
    let codec = JsonTreeCodec;
    let (mut individual, q) = quantified_tree(&["a", "b", "c", "d"]);
    let mut trimmer = TreeTrimmer::new(200);
    assert!(trimmer.init(individual.tree_mut(), &codec));

    let mut presented: Vec<Vec<u8>> = Vec::new();
    loop {
        let bytes = trimmer.current().to_vec();
        presented.push(bytes.clone());
        // the oracle reproduces only while token "a" survives
        let success = candidate_tokens(&codec, &bytes).iter().any(|t| t == "a");
        if trimmer.post(individual.tree_mut(), &codec, success) {
            break;
        }
    }
    trimmer.commit(individual.tree_mut());

    let tokens: Vec<&str> = individual.tree().tokens(individual.root()).collect();
    assert_eq!(tokens, vec!["a"]);
    assert_eq!(individual.tree().child_count(q), 1);

    // the tree is intact after all the in-place serialization splices
    let reencoded = codec.encode(individual.tree(), individual.root());
    assert!(codec.decode(&reencoded).is_some());

    // no serialized candidate was presented twice
    let unique: FxHashSet<&Vec<u8>> = presented.iter().collect();
    assert_eq!(unique.len(), presented.len());
}

#[test]
fn nested_quantifieds_are_linked_and_commit_safely() {
    // outer quantified holds an inner quantifier with its own quantified
    let (mut t, root) = Tree::with_root(Node::unparser(ROOT_NAME));
    let s = t.add(Node::unparser("S"));
    t.add_child(root, s);
    let q0 = t.add(Node::Quantifier { idx: 0, start: 0, stop: i32::MAX });
    t.add_child(s, q0);
    let outer = t.add(Node::Quantified);
    t.add_child(q0, outer);
    leaf(&mut t, outer, "a");
    let q1 = t.add(Node::Quantifier { idx: 1, start: 0, stop: i32::MAX });
    t.add_child(outer, q1);
    let inner = t.add(Node::Quantified);
    t.add_child(q1, inner);
    leaf(&mut t, inner, "b");
    let mut individual = Individual::new(t);

    let codec = JsonTreeCodec;
    let mut trimmer = TreeTrimmer::new(200);
    assert!(trimmer.init(individual.tree_mut(), &codec));
    loop {
        // every candidate reproduces: trimming drives to the minimum
        if trimmer.post(individual.tree_mut(), &codec, true) {
            break;
        }
    }
    trimmer.commit(individual.tree_mut());

    // the inner unit went away with its subtree; no double free
    let tokens: Vec<&str> = individual.tree().tokens(individual.root()).collect();
    assert_eq!(tokens, vec!["a"]);
    assert_eq!(individual.tree().child_count(q1), 0);
}

#[test]
fn step_cap_stops_the_session() {
    let codec = JsonTreeCodec;
    let (mut individual, _) = quantified_tree(&["a", "b", "c", "d", "e", "f"]);
    let mut trimmer = TreeTrimmer::new(2);
    assert!(trimmer.init(individual.tree_mut(), &codec));
    let mut steps = 0;
    loop {
        steps += 1;
        if trimmer.post(individual.tree_mut(), &codec, false) {
            break;
        }
    }
    assert!(steps <= 2, "step cap exceeded: {}", steps);
    // nothing succeeded: commit must keep the tree whole
    trimmer.commit(individual.tree_mut());
    assert_eq!(individual.tree().tokens(individual.root()).count(), 6);
}

#[test]
fn single_unit_cannot_be_trimmed() {
    let codec = JsonTreeCodec;
    let (mut individual, _) = quantified_tree(&["a"]);
    let mut trimmer = TreeTrimmer::new(200);
    assert!(!trimmer.init(individual.tree_mut(), &codec));
}
