//! Training agent: drives a supernet through warmup, search and finalize.
//!
//! | Phase | Forward state | Trained |
//! |-------|---------------|---------|
//! | `warmup`   | `warmup_forward_state` from config | weights |
//! | `search`   | set by the training strategy before every step | weights (+ architecture logits for differentiable strategies) |
//! | `finalize` | `single` on each candidate | nothing; one `search()` call |
//!
//! Phases only move forward. Every epoch ends with a validation pass under
//! the forward configuration current at that moment.

use std::path::PathBuf;
use std::time::Instant;

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

use supernet_common::{
    AgentConfig, BatchDataset, EvalMetrics, MetricSink, NasError, Result, TracingSink,
    TrainingStrategyKind,
};
use supernet_core::{
    Architecture, DifferentiableSampler, ForwardState, LookupTable, Supernet, TrainingStrategy,
    UniformSampler,
};
use supernet_search::{
    build_search_strategy, SearchContext, SearchOutcome, SearchStrategy, ValidationObjective,
};

use crate::epoch::{record, train_epoch, validate_epoch, EpochPlan, SupernetTrainee};
use crate::scheduler::{LrDecay, LrScheduler};

// ── Phases and reports ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Warmup,
    Search,
    Finalize,
    /// Training a standalone child network.
    Evaluate,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warmup => "warmup",
            Self::Search => "search",
            Self::Finalize => "finalize",
            Self::Evaluate => "evaluate",
        }
    }
}

/// Per-epoch means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub phase: Phase,
    pub train: EvalMetrics,
    pub valid: EvalMetrics,
    /// Weight learning rate of the epoch's last step.
    pub lr: f64,
    /// Architecture-parameter learning rate of the epoch's last step (zero
    /// when the logits are not trained).
    pub arch_lr: f64,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochStats>,
    pub outcome: SearchOutcome,
    pub total_steps: usize,
    pub architecture_path: PathBuf,
}

/// Training strategy named by the config.
pub fn build_training_strategy(config: &AgentConfig, supernet: &Supernet) -> Box<dyn TrainingStrategy> {
    match config.training_strategy {
        TrainingStrategyKind::Uniform => Box::new(UniformSampler::for_supernet(supernet, config.seed)),
        TrainingStrategyKind::Differentiable => {
            Box::new(DifferentiableSampler::new(config.differentiable.clone(), config.seed))
        }
    }
}

// ── Agent ───────────────────────────────────────────────────────────────────

/// Owns the supernet, both strategies, the optimisers and the metric sink.
pub struct TrainingAgent<'s> {
    config: AgentConfig,
    supernet: Supernet,
    lookup_table: LookupTable,
    training_strategy: Box<dyn TrainingStrategy>,
    search_strategy: Box<dyn SearchStrategy>,
    optimizer: AdamW,
    arch_optimizer: Option<AdamW>,
    sink: Box<dyn MetricSink + 's>,
    phase: Phase,
    global_step: usize,
}

impl<'s> TrainingAgent<'s> {
    /// Strategies are built from `config`; override them with
    /// [`with_training_strategy`](Self::with_training_strategy) and
    /// [`with_search_strategy`](Self::with_search_strategy).
    pub fn new(config: AgentConfig, supernet: Supernet, lookup_table: LookupTable) -> Result<Self> {
        config.validate()?;
        config.lr_decay.parse::<LrDecay>()?;
        if (lookup_table.num_stages(), lookup_table.num_choices()) != supernet.arch_param_shape() {
            return Err(NasError::config(format!(
                "lookup table is {} × {}, supernet is {:?}",
                lookup_table.num_stages(),
                lookup_table.num_choices(),
                supernet.arch_param_shape()
            )));
        }
        if !lookup_table.has_metric(config.info_metric) {
            return Err(NasError::MissingMetric {
                metric: config.info_metric.to_string(),
            });
        }

        let optimizer = AdamW::new(
            supernet.weight_vars(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        let training_strategy = build_training_strategy(&config, &supernet);
        let search_strategy = build_search_strategy(&config);

        Ok(Self {
            config,
            supernet,
            lookup_table,
            training_strategy,
            search_strategy,
            optimizer,
            arch_optimizer: None,
            sink: Box::new(TracingSink),
            phase: Phase::Warmup,
            global_step: 0,
        })
    }

    pub fn with_training_strategy(mut self, strategy: Box<dyn TrainingStrategy>) -> Self {
        self.training_strategy = strategy;
        self
    }

    pub fn with_search_strategy(mut self, strategy: Box<dyn SearchStrategy>) -> Self {
        self.search_strategy = strategy;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn MetricSink + 's>) -> Self {
        self.sink = sink;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn supernet(&self) -> &Supernet {
        &self.supernet
    }

    pub fn into_supernet(self) -> Supernet {
        self.supernet
    }

    /// Warmup, search, finalize. Writes `architecture.json`,
    /// `search_outcome.json` and `training_report.json` to `output_dir`.
    pub fn run(&mut self, train: &dyn BatchDataset, val: &dyn BatchDataset) -> Result<TrainingReport> {
        if self.phase != Phase::Warmup {
            return Err(NasError::state(format!(
                "agent already ran (phase {})",
                self.phase.as_str()
            )));
        }
        if train.is_empty() || val.is_empty() {
            return Err(NasError::config("train and validation sets must be non-empty"));
        }
        std::fs::create_dir_all(&self.config.output_dir)?;

        let steps_per_epoch = train.num_batches(self.config.batch_size);
        let mut scheduler = LrScheduler::new(&self.config, steps_per_epoch)?;
        tracing::info!(
            warmup_epochs = self.config.warmup_epochs,
            search_epochs = self.config.epochs,
            steps_per_epoch,
            training_strategy = self.training_strategy.name(),
            search_strategy = self.search_strategy.name(),
            "Starting supernet training"
        );

        let mut epochs = Vec::with_capacity(self.config.total_epochs());
        self.enter_warmup()?;
        for epoch in 0..self.config.warmup_epochs {
            epochs.push(self.run_epoch(epoch, train, val, &mut scheduler)?);
        }
        self.enter_search(&scheduler)?;
        for epoch in self.config.warmup_epochs..self.config.total_epochs() {
            epochs.push(self.run_epoch(epoch, train, val, &mut scheduler)?);
        }

        self.phase = Phase::Finalize;
        let outcome = self.finalize(val)?;

        let architecture_path = self.config.output_dir.join("architecture.json");
        std::fs::write(&architecture_path, serde_json::to_string_pretty(&outcome.architecture)?)?;
        outcome.save(&self.config.output_dir.join("search_outcome.json"))?;

        let report = TrainingReport {
            epochs,
            outcome,
            total_steps: self.global_step,
            architecture_path,
        };
        std::fs::write(
            self.config.output_dir.join("training_report.json"),
            serde_json::to_string_pretty(&report)?,
        )?;
        tracing::info!(
            architecture = %report.outcome.architecture,
            top1 = format!("{:.1}%", report.outcome.top1 * 100.0),
            cost = format!("{:.3} {}", report.outcome.cost, report.outcome.info_metric),
            path = %report.architecture_path.display(),
            "Training complete"
        );
        Ok(report)
    }

    // ── Phase transitions ───────────────────────────────────────────────────

    fn enter_warmup(&mut self) -> Result<()> {
        self.phase = Phase::Warmup;
        let mut forward: ForwardState = self.config.warmup_forward_state.parse()?;
        if let ForwardState::GumbelSum { .. } = forward {
            forward = ForwardState::GumbelSum {
                tau: self.config.differentiable.tau_initial,
            };
        }

        if forward.is_differentiable() {
            if self.supernet.architecture_parameter().is_none() {
                self.supernet.initialize_architecture_parameter()?;
            }
            if let Some(param) = self.supernet.architecture_parameter_mut() {
                param.set_trainable(false);
            }
        } else if self.supernet.active_architecture().is_none() {
            tracing::warn!("warmup in single mode without an active architecture; using candidate 0 everywhere");
            let zeros = Architecture::new(vec![0; self.supernet.num_stages()]);
            self.supernet.set_active_architecture(zeros)?;
        }
        self.supernet.set_forward_state(forward)?;
        tracing::info!(forward_state = %forward, "Entering warmup phase");
        Ok(())
    }

    fn enter_search(&mut self, scheduler: &LrScheduler) -> Result<()> {
        if scheduler.step() != scheduler.search_start() {
            return Err(NasError::state(format!(
                "search phase entered at step {}, schedule expects {}",
                scheduler.step(),
                scheduler.search_start()
            )));
        }
        self.phase = Phase::Search;
        if self.training_strategy.trains_architecture_parameter() {
            if self.supernet.architecture_parameter().is_none() {
                self.supernet.initialize_architecture_parameter()?;
            }
            let mut vars = Vec::new();
            if let Some(param) = self.supernet.architecture_parameter_mut() {
                param.set_trainable(true);
                vars.push(param.var().clone());
            }
            self.arch_optimizer = Some(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: self.config.arch_lr,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?);
        } else if let Some(param) = self.supernet.architecture_parameter_mut() {
            param.set_trainable(false);
        }
        tracing::info!(
            strategy = self.training_strategy.name(),
            step = scheduler.step(),
            "Entering search phase"
        );
        Ok(())
    }

    fn finalize(&mut self, val: &dyn BatchDataset) -> Result<SearchOutcome> {
        if let Some(param) = self.supernet.architecture_parameter_mut() {
            param.set_trainable(false);
        }
        tracing::info!(strategy = self.search_strategy.name(), "Entering finalize phase");

        let mut objective = ValidationObjective::new(
            val,
            self.config.batch_size,
            self.config.eval_max_batches,
            self.config.eval_cache_size,
        );
        let mut ctx = SearchContext {
            supernet: &mut self.supernet,
            training_strategy: self.training_strategy.as_mut(),
            lookup_table: &self.lookup_table,
            objective: &mut objective,
        };
        let outcome = self.search_strategy.search(&mut ctx)?;

        let step = self.config.total_epochs();
        let metrics = EvalMetrics {
            top1: outcome.top1,
            top5: outcome.top5,
            loss: outcome.loss,
        };
        record(self.sink.as_mut(), "search", &metrics, step)?;
        self.sink.add_scalar("search/cost", outcome.cost, step)?;
        Ok(outcome)
    }

    // ── Epochs ──────────────────────────────────────────────────────────────

    fn run_epoch(
        &mut self,
        epoch: usize,
        train: &dyn BatchDataset,
        val: &dyn BatchDataset,
        scheduler: &mut LrScheduler,
    ) -> Result<EpochStats> {
        let start = Instant::now();
        let plan = EpochPlan {
            epoch,
            total_epochs: self.config.total_epochs(),
            batch_size: self.config.batch_size,
            report_interval: self.config.report_interval,
            phase: self.phase.as_str(),
        };

        let strategy: Option<&mut dyn TrainingStrategy> = if self.phase == Phase::Search {
            Some(self.training_strategy.as_mut())
        } else {
            None
        };
        let mut trainee = SupernetTrainee {
            supernet: &mut self.supernet,
            strategy,
        };
        let trained = train_epoch(
            &mut trainee,
            &mut self.optimizer,
            self.arch_optimizer.as_mut(),
            scheduler,
            train,
            &plan,
        )?;
        self.global_step = scheduler.step();
        record(self.sink.as_mut(), "train", &trained.metrics, epoch)?;

        let valid = validate_epoch(&self.supernet, val, self.config.eval_max_batches, &plan)?;
        record(self.sink.as_mut(), "valid", &valid, epoch)?;

        Ok(EpochStats {
            epoch,
            phase: self.phase,
            train: trained.metrics,
            valid,
            lr: trained.lr,
            arch_lr: trained.arch_lr,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
