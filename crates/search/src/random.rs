//! Random search: rejection-sample feasible architectures from the training
//! strategy, evaluate each in `single` mode, keep the best top-1.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

use supernet_common::{NasError, Result};

use crate::types::{best_candidate, CostConstraint, SearchContext, SearchOutcome, SearchStrategy};

pub struct RandomSearch {
    constraint: CostConstraint,
    iterations: usize,
    show_progress: bool,
}

impl RandomSearch {
    pub fn new(constraint: CostConstraint, iterations: usize) -> Self {
        Self {
            constraint,
            iterations,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}

/// Bar over `len` candidate evaluations, hidden when disabled.
pub(crate) fn progress_bar(len: usize, show: bool, unit: &str) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let template = format!("[{{elapsed_precise}}] {{bar:40}} {{pos}}/{{len}} {unit}");
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb
}

impl SearchStrategy for RandomSearch {
    fn search(&mut self, ctx: &mut SearchContext<'_>) -> Result<SearchOutcome> {
        if self.iterations == 0 {
            return Err(NasError::config("random_iteration must be > 0"));
        }
        let start = Instant::now();
        self.constraint.precheck(ctx.lookup_table)?;
        tracing::info!(
            iterations = self.iterations,
            target = self.constraint.target,
            metric = %self.constraint.metric,
            "Starting random search"
        );

        let pb = progress_bar(self.iterations, self.show_progress, "candidates");
        let mut candidates = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let (architecture, cost) = self
                .constraint
                .sample_feasible(ctx.training_strategy, ctx.lookup_table)?;
            candidates.push(ctx.evaluate_architecture(&architecture, cost)?);
            pb.inc(1);
        }
        pb.finish_with_message("done");

        let best = best_candidate(&candidates)
            .map(|i| candidates[i].clone())
            .ok_or_else(|| NasError::state("random search produced no candidates"))?;
        ctx.supernet.set_active_architecture(best.architecture.clone())?;

        tracing::info!(
            architecture = %best.architecture,
            top1 = format!("{:.4}", best.metrics.top1),
            cost = format!("{:.3}", best.cost),
            "Random search complete"
        );

        Ok(SearchOutcome {
            strategy: self.name().to_string(),
            architecture: best.architecture,
            top1: best.metrics.top1,
            top5: best.metrics.top5,
            loss: best.metrics.loss,
            cost: best.cost,
            info_metric: self.constraint.metric,
            target_hc: self.constraint.target,
            evaluations: candidates.len(),
            search_time_secs: start.elapsed().as_secs_f64(),
        })
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
