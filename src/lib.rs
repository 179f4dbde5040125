pub mod annot;
pub mod codec;
pub mod fuzz;
pub mod generator;
pub mod model;
pub mod population;
pub mod rule;
pub mod serializer;
pub mod tool;
pub mod trim;
pub mod weights;

pub use annot::{Annotations, NodeInfo, NodeKey, NodeKind};
pub use population::{Individual, Population, SubtreePopulation};
pub use rule::{Node, NodeId, RuleSize, Tree};
