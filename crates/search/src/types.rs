//! Core types for cost-constrained architecture search.

use serde::{Deserialize, Serialize};

use supernet_common::{EvalMetrics, InfoMetric, NasError, Result};
use supernet_core::{Architecture, ForwardState, LookupTable, Supernet, TrainingStrategy};

/// Scores the supernet in its current configuration.
pub trait EvaluationObjective {
    fn evaluate(&mut self, supernet: &Supernet) -> Result<EvalMetrics>;
}

/// Everything a strategy may touch during one search.
pub struct SearchContext<'a> {
    pub supernet: &'a mut Supernet,
    pub training_strategy: &'a mut dyn TrainingStrategy,
    pub lookup_table: &'a LookupTable,
    pub objective: &'a mut dyn EvaluationObjective,
}

impl SearchContext<'_> {
    /// Activate `architecture` in `single` mode and score it.
    pub fn evaluate_architecture(&mut self, architecture: &Architecture, cost: f64) -> Result<Candidate> {
        self.supernet.set_forward_state(ForwardState::Single)?;
        self.supernet.set_active_architecture(architecture.clone())?;
        let metrics = self.objective.evaluate(&*self.supernet)?;
        tracing::debug!(
            architecture = %architecture,
            top1 = format!("{:.4}", metrics.top1),
            cost = format!("{cost:.3}"),
            "Candidate evaluated"
        );
        Ok(Candidate {
            architecture: architecture.clone(),
            metrics,
            cost,
        })
    }
}

pub trait SearchStrategy {
    fn search(&mut self, ctx: &mut SearchContext<'_>) -> Result<SearchOutcome>;

    fn name(&self) -> &'static str;
}

/// One evaluated architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub architecture: Architecture,
    pub metrics: EvalMetrics,
    pub cost: f64,
}

/// Index of the highest top-1 candidate; ties go to the earliest.
pub fn best_candidate(candidates: &[Candidate]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, c) in candidates.iter().enumerate() {
        if best.map_or(true, |b| c.metrics.top1 > candidates[b].metrics.top1) {
            best = Some(i);
        }
    }
    best
}

/// Search result with all metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub strategy: String,
    pub architecture: Architecture,
    pub top1: f64,
    pub top5: f64,
    pub loss: f64,
    pub cost: f64,
    pub info_metric: InfoMetric,
    pub target_hc: f64,
    /// Candidates evaluated by the objective.
    pub evaluations: usize,
    pub search_time_secs: f64,
}

impl SearchOutcome {
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

// ── Hardware constraint ─────────────────────────────────────────────────────

/// `cost(architecture) <= target` under one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostConstraint {
    pub metric: InfoMetric,
    pub target: f64,
    /// Draws allowed per feasible architecture.
    pub max_resample: usize,
}

impl CostConstraint {
    pub fn new(metric: InfoMetric, target: f64, max_resample: usize) -> Self {
        Self {
            metric,
            target,
            max_resample,
        }
    }

    /// Fail fast when even the cheapest architecture exceeds the budget.
    pub fn precheck(&self, table: &LookupTable) -> Result<()> {
        let min_cost = table.min_cost(self.metric)?;
        if min_cost > self.target {
            return Err(NasError::Infeasible {
                target: self.target,
                attempts: 0,
                min_cost: Some(min_cost),
            });
        }
        Ok(())
    }

    /// `Some(cost)` when `architecture` fits the budget.
    pub fn feasible_cost(&self, table: &LookupTable, architecture: &Architecture) -> Result<Option<f64>> {
        let cost = table.get_cost(architecture, self.metric)?;
        Ok((cost <= self.target).then_some(cost))
    }

    /// Draw from `strategy` until a feasible architecture appears.
    pub fn sample_feasible(
        &self,
        strategy: &mut dyn TrainingStrategy,
        table: &LookupTable,
    ) -> Result<(Architecture, f64)> {
        for _ in 0..self.max_resample {
            let architecture = strategy.generate_training_architecture()?;
            if let Some(cost) = self.feasible_cost(table, &architecture)? {
                return Ok((architecture, cost));
            }
        }
        Err(NasError::Infeasible {
            target: self.target,
            attempts: self.max_resample,
            min_cost: table.min_cost(self.metric).ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use supernet_core::UniformSampler;

    fn table() -> LookupTable {
        LookupTable::from_fn(4, 3, InfoMetric::Flops, |_, c| (c + 1) as f64)
    }

    #[test]
    fn precheck_rejects_budget_below_minimum() {
        let c = CostConstraint::new(InfoMetric::Flops, 3.0, 10);
        let err = c.precheck(&table()).unwrap_err();
        assert!(matches!(
            err,
            NasError::Infeasible { attempts: 0, min_cost: Some(m), .. } if m == 4.0
        ));
        CostConstraint::new(InfoMetric::Flops, 4.0, 10).precheck(&table()).unwrap();
    }

    #[test]
    fn sample_feasible_respects_budget() {
        let c = CostConstraint::new(InfoMetric::Flops, 6.0, 1000);
        let mut sampler = UniformSampler::new(4, 3, Some(5));
        for _ in 0..50 {
            let (arch, cost) = c.sample_feasible(&mut sampler, &table()).unwrap();
            assert!(cost <= 6.0);
            assert_eq!(table().get_cost(&arch, InfoMetric::Flops).unwrap(), cost);
        }
    }

    #[test]
    fn partial_architecture_is_never_feasible() {
        let c = CostConstraint::new(InfoMetric::Flops, 6.0, 10);
        let partial = Architecture::new(vec![2]);
        assert!(matches!(c.feasible_cost(&table(), &partial), Err(NasError::Config(_))));
    }

    #[test]
    fn sample_feasible_gives_up_after_cap() {
        // Below the minimum cost of 4: every draw is rejected.
        let c = CostConstraint::new(InfoMetric::Flops, 3.5, 25);
        let mut sampler = UniformSampler::new(4, 3, Some(5));
        match c.sample_feasible(&mut sampler, &table()) {
            Err(NasError::Infeasible { attempts, .. }) => assert_eq!(attempts, 25),
            other => panic!("expected infeasible, got {other:?}"),
        }
    }

    #[test]
    fn ties_go_to_first_candidate() {
        let mk = |top1: f64, c: usize| Candidate {
            architecture: Architecture::new(vec![c]),
            metrics: EvalMetrics {
                top1,
                ..Default::default()
            },
            cost: 0.0,
        };
        let cands = vec![mk(0.2, 0), mk(0.5, 1), mk(0.5, 2), mk(0.1, 3)];
        assert_eq!(best_candidate(&cands), Some(1));
        assert_eq!(best_candidate(&[]), None);
    }
}
