//! # supernet-search — The Search Engine
//!
//! Find the best architecture inside a trained supernet subject to a
//! hardware budget (`cost <= target_hc` under one lookup-table metric),
//! without retraining.
//!
//! | Strategy | Candidates |
//! |----------|-----------|
//! | [`RandomSearch`] | `random_iteration` feasible draws from the training strategy |
//! | [`EvolutionSearch`] | feasible population refined by mutation and crossover |
//! | [`DifferentiableSearch`] | per-stage argmax of the architecture parameter |

pub mod differentiable;
pub mod evaluator;
pub mod evolution;
pub mod random;
pub mod types;

pub use differentiable::DifferentiableSearch;
pub use evaluator::{evaluate_dataset, ValidationObjective};
pub use evolution::EvolutionSearch;
pub use random::RandomSearch;
pub use types::{
    best_candidate, Candidate, CostConstraint, EvaluationObjective, SearchContext, SearchOutcome,
    SearchStrategy,
};

use supernet_common::{AgentConfig, SearchStrategyKind};

/// Build the configured search strategy.
pub fn build_search_strategy(config: &AgentConfig) -> Box<dyn SearchStrategy> {
    let constraint = CostConstraint::new(config.info_metric, config.target_hc, config.max_resample);
    match config.search_strategy {
        SearchStrategyKind::Random => Box::new(
            RandomSearch::new(constraint, config.random_iteration).with_progress(config.show_progress),
        ),
        SearchStrategyKind::Evolution => Box::new(
            EvolutionSearch::new(constraint, config.evolution.clone(), config.seed)
                .with_progress(config.show_progress),
        ),
        SearchStrategyKind::Differentiable => Box::new(DifferentiableSearch::new(constraint)),
    }
}
