//! In-process fuzzer adapter: per-case byte surfaces over the engine
//! (mutate, crossover, blackbox generate, input serialization) and the
//! trim session. FFI symbol glue belongs to the hosting harness.

use crate::codec::TreeCodec;
use crate::population::Individual;
use crate::rule::{Node, RuleSize, Tree, ROOT_NAME};
use crate::tool::Tool;
use crate::trim::TreeTrimmer;
use log::{debug, warn};

/// Default cap on trim candidates per session.
pub const DEFAULT_TRIM_STEPS: usize = 200;

/// Byte-level adapter pairing the engine with a tree codec.
pub struct FuzzerTool {
    pub tool: Tool,
    codec: Box<dyn TreeCodec>,
    trimmer: Option<TreeTrimmer>,
}

impl FuzzerTool {
    pub fn new(tool: Tool, codec: Box<dyn TreeCodec>) -> Self {
        Self { tool, codec, trimmer: None }
    }

    pub fn codec(&self) -> &dyn TreeCodec {
        &*self.codec
    }

    /// Decodes an input into a `<ROOT>`-anchored individual. An
    /// unrecognized payload yields an empty shell of the start rule,
    /// which mutation then regenerates from the grammar.
    pub fn decode(&self, data: &[u8]) -> Individual {
        if let Some(tree) = self.codec.decode(data) {
            if tree.node(tree.root()).name() == ROOT_NAME {
                return Individual::new(tree);
            }
            return Individual::from_bare(tree);
        }
        warn!("decode of {} byte input failed", data.len());
        let rule = if self.tool.rule.is_empty() {
            self.tool.factory().default_rule().to_string()
        } else {
            self.tool.rule.clone()
        };
        let (tree, _) = Tree::with_root(Node::unparser(&rule));
        Individual::from_bare(tree)
    }

    pub fn encode(&self, individual: &Individual) -> Vec<u8> {
        self.codec.encode(individual.tree(), individual.root())
    }

    /// Per-case mutate: decode, mutate, encode. Rejects results that
    /// exceed the caller's size cap or that the memo has seen recently.
    pub fn mutate_case(&mut self, data: &[u8], max_size: usize, seed: u64) -> Option<Vec<u8>> {
        self.tool.reseed(seed);
        let mut individual = self.decode(data);
        self.tool.mutate(&mut individual);
        self.finish_case(&individual, max_size, "mutation")
    }

    /// Per-case crossover of two encoded inputs; same rejection rules as
    /// [`Self::mutate_case`].
    pub fn crossover_case(
        &mut self,
        recipient: &[u8],
        donor: &[u8],
        max_size: usize,
        seed: u64,
    ) -> Option<Vec<u8>> {
        self.tool.reseed(seed);
        let mut recipient = self.decode(recipient);
        let mut donor = self.decode(donor);
        self.tool.recombine(&mut recipient, &mut donor);
        self.finish_case(&recipient, max_size, "crossover")
    }

    fn finish_case(
        &mut self,
        individual: &Individual,
        max_size: usize,
        what: &str,
    ) -> Option<Vec<u8>> {
        let bytes = self.encode(individual);
        if bytes.len() > max_size {
            warn!("{} failed, result could not be encoded within {} bytes", what, max_size);
            return None;
        }
        if !self.tool.memoize_test(&bytes) {
            debug!(
                "{} attempt: already generated among the last {} unique test cases",
                what,
                self.tool.memo_len()
            );
            return None;
        }
        Some(bytes)
    }

    /// Blackbox generation: a freshly generated test case serialized to
    /// the text the target consumes.
    pub fn generate_case(&mut self, seed: u64) -> Option<String> {
        self.tool.reseed(seed);
        let tree = self.tool.generate("", RuleSize::default())?;
        Some((self.tool.serializer)(&tree, tree.root()))
    }

    /// Serializes an encoded input without mutating it.
    pub fn one_input(&self, data: &[u8]) -> Option<String> {
        let tree = self.codec.decode(data)?;
        Some((self.tool.serializer)(&tree, tree.root()))
    }

    /// Starts a trim session over the individual. Returns false when
    /// there is nothing to trim.
    pub fn init_trim(&mut self, individual: &mut Individual, max_steps: usize) -> bool {
        let mut trimmer = TreeTrimmer::new(max_steps);
        let ok = trimmer.init(individual.tree_mut(), &*self.codec);
        self.trimmer = if ok { Some(trimmer) } else { None };
        ok
    }

    /// Encoded candidate for the oracle to execute.
    pub fn trim_candidate(&self) -> Option<&[u8]> {
        self.trimmer.as_ref().map(|t| t.current())
    }

    /// Oracle feedback for the last candidate. On completion the
    /// surviving deletions are committed to the tree and the trimmed
    /// tree is interned into the population. Returns true when done.
    pub fn post_trim(&mut self, individual: &mut Individual, success: bool) -> bool {
        let Some(trimmer) = self.trimmer.as_mut() else {
            return true;
        };
        let done = trimmer.post(individual.tree_mut(), &*self.codec, success);
        if done {
            trimmer.commit(individual.tree_mut());
            self.tool.save_tree(individual.tree());
            self.trimmer = None;
        }
        done
    }
}
