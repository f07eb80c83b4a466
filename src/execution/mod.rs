// Position state and the real-mode evaluation pass
pub mod evaluator;
pub mod position_store;

pub use evaluator::{evaluate_pairs, EvaluationReport};
pub use position_store::{InMemoryPositions, LedgerPositions, PositionStore};
