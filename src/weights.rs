//! External weight tables for [`WeightedModel`](crate::model::WeightedModel)
//! and their JSON loader.
//!
//! The recognized document shape is
//! `{"alts": {rule: {alt_idx: {branch_idx: weight}}},
//!   "quants": {rule: {quantifier_idx: prob}}}`; both sections are
//! optional. Absent entries imply multiplier 1.0 / probability 0.5.

use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Alternative weight multipliers keyed by `(rule, alternation, branch)`.
pub type AltMap = FxHashMap<(String, usize, usize), f64>;
/// Quantifier continue-probabilities keyed by `(rule, quantifier)`.
pub type QuantMap = FxHashMap<(String, usize), f64>;

#[derive(Debug, Error)]
pub enum WeightLoadError {
    #[error("failed to read weights file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON in weights document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("non-numeric index `{0}` in weights document")]
    BadIndex(String),
}

#[derive(Default, Deserialize)]
struct WeightDoc {
    #[serde(default)]
    alts: HashMap<String, HashMap<String, HashMap<String, f64>>>,
    #[serde(default)]
    quants: HashMap<String, HashMap<String, f64>>,
}

fn parse_idx(s: &str) -> Result<usize, WeightLoadError> {
    s.parse().map_err(|_| WeightLoadError::BadIndex(s.to_string()))
}

/// Parses a weights document into the alternative and quantifier tables.
pub fn load_weights(data: &str) -> Result<(AltMap, QuantMap), WeightLoadError> {
    let doc: WeightDoc = serde_json::from_str(data)?;
    let mut alts = AltMap::default();
    let mut quants = QuantMap::default();
    for (rule, alternations) in doc.alts {
        for (alternation_idx, alternatives) in alternations {
            let alternation_idx = parse_idx(&alternation_idx)?;
            for (alternative_idx, weight) in alternatives {
                let alternative_idx = parse_idx(&alternative_idx)?;
                alts.insert((rule.clone(), alternation_idx, alternative_idx), weight);
            }
        }
    }
    for (rule, quantifiers) in doc.quants {
        for (quantifier_idx, prob) in quantifiers {
            quants.insert((rule.clone(), parse_idx(&quantifier_idx)?), prob);
        }
    }
    Ok((alts, quants))
}

/// Reads and parses a weights file.
pub fn load_weights_file(path: &Path) -> Result<(AltMap, QuantMap), WeightLoadError> {
    load_weights(&std::fs::read_to_string(path)?)
}
