//! Evolutionary search under a hardware budget.
//!
//! 1. Initial population: `population_size` feasible draws from the training
//!    strategy.
//! 2. Each generation keeps the `parent_size` best (top-1) as parents, then
//!    adds `mutation_size` mutated and `crossover_size` crossed-over children.
//!    Children over budget or already evaluated are redrawn, at most
//!    `max_resample` times per child.
//! 3. The population is truncated back to `population_size` by top-1.

use std::collections::HashSet;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use supernet_common::{EvolutionConfig, NasError, Result};
use supernet_core::Architecture;

use crate::random::progress_bar;
use crate::types::{
    best_candidate, Candidate, CostConstraint, SearchContext, SearchOutcome, SearchStrategy,
};

pub struct EvolutionSearch {
    constraint: CostConstraint,
    config: EvolutionConfig,
    rng: StdRng,
    show_progress: bool,
}

impl EvolutionSearch {
    pub fn new(constraint: CostConstraint, config: EvolutionConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            constraint,
            config,
            rng,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Resample each stage with probability `mutation_prob`.
    fn mutate(&mut self, parent: &Architecture, choices: usize) -> Architecture {
        let genes = parent
            .iter()
            .map(|&c| {
                if self.rng.gen_bool(self.config.mutation_prob) {
                    self.rng.gen_range(0..choices)
                } else {
                    c
                }
            })
            .collect();
        Architecture::new(genes)
    }

    /// Each stage inherited from either parent with equal probability.
    fn crossover(&mut self, a: &Architecture, b: &Architecture) -> Architecture {
        let genes = a
            .iter()
            .zip(b.iter())
            .map(|(&x, &y)| if self.rng.gen_bool(0.5) { x } else { y })
            .collect();
        Architecture::new(genes)
    }

    /// Produce one unseen feasible child via `make`, or `None` when the
    /// resample budget runs out.
    fn feasible_child(
        &mut self,
        ctx: &SearchContext<'_>,
        seen: &HashSet<Architecture>,
        mut make: impl FnMut(&mut Self) -> Architecture,
    ) -> Result<Option<(Architecture, f64)>> {
        for _ in 0..self.constraint.max_resample {
            let child = make(self);
            if seen.contains(&child) {
                continue;
            }
            if let Some(cost) = self.constraint.feasible_cost(ctx.lookup_table, &child)? {
                return Ok(Some((child, cost)));
            }
        }
        Ok(None)
    }

    fn select(&self, mut population: Vec<Candidate>, size: usize) -> Vec<Candidate> {
        let mut ranked = Vec::with_capacity(size.min(population.len()));
        while ranked.len() < size {
            match best_candidate(&population) {
                Some(i) => ranked.push(population.remove(i)),
                None => break,
            }
        }
        ranked
    }
}

impl SearchStrategy for EvolutionSearch {
    fn search(&mut self, ctx: &mut SearchContext<'_>) -> Result<SearchOutcome> {
        let start = Instant::now();
        let cfg = self.config.clone();
        if cfg.population_size == 0 || cfg.parent_size == 0 || cfg.parent_size > cfg.population_size {
            return Err(NasError::config(
                "evolution: need 0 < parent_size <= population_size",
            ));
        }
        if !(0.0..=1.0).contains(&cfg.mutation_prob) {
            return Err(NasError::config("evolution: mutation_prob must be in [0, 1]"));
        }
        self.constraint.precheck(ctx.lookup_table)?;
        let choices = ctx.supernet.num_choices();

        let total = cfg.population_size + cfg.generations * (cfg.mutation_size + cfg.crossover_size);
        let pb = progress_bar(total, self.show_progress, "candidates");
        tracing::info!(
            population = cfg.population_size,
            generations = cfg.generations,
            target = self.constraint.target,
            metric = %self.constraint.metric,
            "Starting evolution search"
        );

        let mut seen: HashSet<Architecture> = HashSet::new();
        let mut population = Vec::with_capacity(cfg.population_size);
        for _ in 0..cfg.population_size {
            let (architecture, cost) = self
                .constraint
                .sample_feasible(ctx.training_strategy, ctx.lookup_table)?;
            seen.insert(architecture.clone());
            population.push(ctx.evaluate_architecture(&architecture, cost)?);
            pb.inc(1);
        }
        let mut evaluations = population.len();

        for generation in 0..cfg.generations {
            let parents = self.select(population.clone(), cfg.parent_size);
            let mut children = Vec::with_capacity(cfg.mutation_size + cfg.crossover_size);

            for _ in 0..cfg.mutation_size {
                let made = self.feasible_child(ctx, &seen, |s| {
                    let i = s.rng.gen_range(0..parents.len());
                    s.mutate(&parents[i].architecture, choices)
                })?;
                if let Some((architecture, cost)) = made {
                    seen.insert(architecture.clone());
                    children.push((architecture, cost));
                }
            }
            for _ in 0..cfg.crossover_size {
                let made = self.feasible_child(ctx, &seen, |s| {
                    let a = s.rng.gen_range(0..parents.len());
                    let b = s.rng.gen_range(0..parents.len());
                    s.crossover(&parents[a].architecture, &parents[b].architecture)
                })?;
                if let Some((architecture, cost)) = made {
                    seen.insert(architecture.clone());
                    children.push((architecture, cost));
                }
            }

            for (architecture, cost) in &children {
                population.push(ctx.evaluate_architecture(architecture, *cost)?);
                pb.inc(1);
            }
            evaluations += children.len();
            population = self.select(population, cfg.population_size);

            if let Some(best) = population.first() {
                tracing::info!(
                    generation,
                    children = children.len(),
                    best_top1 = format!("{:.4}", best.metrics.top1),
                    "Generation complete"
                );
            }
        }
        pb.finish_with_message("done");

        let best = best_candidate(&population)
            .map(|i| population.swap_remove(i))
            .ok_or_else(|| NasError::state("evolution search produced no candidates"))?;
        ctx.supernet.set_active_architecture(best.architecture.clone())?;

        Ok(SearchOutcome {
            strategy: self.name().to_string(),
            architecture: best.architecture,
            top1: best.metrics.top1,
            top5: best.metrics.top5,
            loss: best.metrics.loss,
            cost: best.cost,
            info_metric: self.constraint.metric,
            target_hc: self.constraint.target,
            evaluations,
            search_time_secs: start.elapsed().as_secs_f64(),
        })
    }

    fn name(&self) -> &'static str {
        "evolution"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use supernet_common::InfoMetric;

    fn search(prob: f64) -> EvolutionSearch {
        let config = EvolutionConfig {
            mutation_prob: prob,
            ..Default::default()
        };
        EvolutionSearch::new(CostConstraint::new(InfoMetric::Flops, 10.0, 10), config, Some(1))
    }

    #[test]
    fn mutation_probability_bounds() {
        let parent = Architecture::new(vec![2, 1, 0, 2]);
        assert_eq!(search(0.0).mutate(&parent, 3), parent);
        let mut s = search(1.0);
        for _ in 0..10 {
            let child = s.mutate(&parent, 3);
            assert!(child.iter().all(|&c| c < 3));
        }
    }

    #[test]
    fn crossover_takes_genes_from_parents() {
        let a = Architecture::new(vec![0, 0, 0, 0]);
        let b = Architecture::new(vec![2, 2, 2, 2]);
        let mut s = search(0.1);
        for _ in 0..10 {
            let child = s.crossover(&a, &b);
            assert!(child.iter().all(|&c| c == 0 || c == 2));
        }
    }
}
