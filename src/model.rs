//! Decision policies consulted by the generation context stack.

use crate::rule::{NodeId, Tree};
use crate::weights::{AltMap, QuantMap};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Policy object behind every stochastic decision made during generation:
/// which alternative to take, whether to keep repeating a quantifier, and
/// which character to emit from a set.
pub trait Model {
    /// Picks an alternative index under the supplied weight vector.
    fn choice(&mut self, tree: &Tree, node: NodeId, idx: usize, weights: &[f64]) -> usize;

    /// Decides whether repetition `cnt` of quantifier `idx` should happen.
    #[allow(clippy::too_many_arguments)]
    fn quantify(
        &mut self,
        tree: &Tree,
        node: NodeId,
        idx: usize,
        cnt: i32,
        start: i32,
        stop: i32,
        prob: f64,
    ) -> bool;

    /// Picks one code point from a character set.
    fn charset(&mut self, tree: &Tree, node: NodeId, idx: usize, chars: &[char]) -> char;
}

/// Proportional random model. All-zero weight vectors fall back to the
/// last alternative so that `choice` is total.
pub struct DefaultModel {
    rng: SmallRng,
}

impl DefaultModel {
    pub fn new() -> Self {
        Self { rng: SmallRng::from_entropy() }
    }

    pub fn seeded(seed: u64) -> Self {
        Self { rng: SmallRng::seed_from_u64(seed) }
    }
}

impl Default for DefaultModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for DefaultModel {
    fn choice(&mut self, _tree: &Tree, _node: NodeId, _idx: usize, weights: &[f64]) -> usize {
        let sum: f64 = weights.iter().sum();
        if sum <= 0.0 {
            return weights.len() - 1;
        }
        let mut rest = self.rng.gen::<f64>() * sum;
        let mut last_positive = weights.len() - 1;
        for (i, &w) in weights.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            last_positive = i;
            rest -= w;
            if rest < 0.0 {
                return i;
            }
        }
        last_positive
    }

    fn quantify(
        &mut self,
        _tree: &Tree,
        _node: NodeId,
        _idx: usize,
        _cnt: i32,
        _start: i32,
        _stop: i32,
        prob: f64,
    ) -> bool {
        self.rng.gen::<f64>() < prob
    }

    fn charset(&mut self, _tree: &Tree, _node: NodeId, _idx: usize, chars: &[char]) -> char {
        chars[self.rng.gen_range(0..chars.len())]
    }
}

/// Model wrapper that pre-multiplies alternative weights and overrides
/// quantifier probabilities from externally loaded tables before
/// delegating to the underlying model.
pub struct WeightedModel {
    model: Box<dyn Model>,
    alts: AltMap,
    quants: QuantMap,
}

impl WeightedModel {
    pub fn new(model: Box<dyn Model>, alts: AltMap, quants: QuantMap) -> Self {
        Self { model, alts, quants }
    }
}

impl Model for WeightedModel {
    fn choice(&mut self, tree: &Tree, node: NodeId, idx: usize, weights: &[f64]) -> usize {
        if self.alts.is_empty() {
            return self.model.choice(tree, node, idx, weights);
        }
        let name = tree.node(node).name();
        let multiplied: Vec<f64> = weights
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                w * self.alts.get(&(name.to_string(), idx, i)).copied().unwrap_or(1.0)
            })
            .collect();
        self.model.choice(tree, node, idx, &multiplied)
    }

    fn quantify(
        &mut self,
        tree: &Tree,
        node: NodeId,
        idx: usize,
        cnt: i32,
        start: i32,
        stop: i32,
        prob: f64,
    ) -> bool {
        let name = tree.node(node).name();
        let prob = self.quants.get(&(name.to_string(), idx)).copied().unwrap_or(prob);
        self.model.quantify(tree, node, idx, cnt, start, stop, prob)
    }

    fn charset(&mut self, tree: &Tree, node: NodeId, idx: usize, chars: &[char]) -> char {
        self.model.charset(tree, node, idx, chars)
    }
}
