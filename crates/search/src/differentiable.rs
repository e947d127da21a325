//! Differentiable search: read the per-stage argmax of the learned logits,
//! gate it on the budget and evaluate it once.

use std::time::Instant;

use supernet_common::{NasError, Result};

use crate::types::{CostConstraint, SearchContext, SearchOutcome, SearchStrategy};

pub struct DifferentiableSearch {
    constraint: CostConstraint,
}

impl DifferentiableSearch {
    pub fn new(constraint: CostConstraint) -> Self {
        Self { constraint }
    }
}

impl SearchStrategy for DifferentiableSearch {
    fn search(&mut self, ctx: &mut SearchContext<'_>) -> Result<SearchOutcome> {
        let start = Instant::now();
        let architecture = ctx.supernet.best_architecture()?;
        let cost = self
            .constraint
            .feasible_cost(ctx.lookup_table, &architecture)?
            .ok_or_else(|| NasError::Infeasible {
                target: self.constraint.target,
                attempts: 1,
                min_cost: ctx.lookup_table.min_cost(self.constraint.metric).ok(),
            })?;

        let candidate = ctx.evaluate_architecture(&architecture, cost)?;
        tracing::info!(
            architecture = %candidate.architecture,
            top1 = format!("{:.4}", candidate.metrics.top1),
            cost = format!("{cost:.3}"),
            "Differentiable search complete"
        );

        Ok(SearchOutcome {
            strategy: self.name().to_string(),
            architecture: candidate.architecture,
            top1: candidate.metrics.top1,
            top5: candidate.metrics.top5,
            loss: candidate.metrics.loss,
            cost,
            info_metric: self.constraint.metric,
            target_hc: self.constraint.target,
            evaluations: 1,
            search_time_secs: start.elapsed().as_secs_f64(),
        })
    }

    fn name(&self) -> &'static str {
        "differentiable"
    }
}
