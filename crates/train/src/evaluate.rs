//! Evaluate agent: trains the standalone child network of one searched
//! architecture from scratch and reports its held-out accuracy.
//!
//! Uses the supernet agent's epoch loop and weight-LR curve with a single
//! `evaluate` phase and no architecture parameter.

use std::path::PathBuf;
use std::time::Instant;

use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};

use supernet_common::{AgentConfig, BatchDataset, EvalMetrics, MetricSink, NasError, Result, TracingSink};
use supernet_core::{Architecture, ChildNet};

use crate::agent::{EpochStats, Phase};
use crate::epoch::{record, train_epoch, validate_epoch, EpochPlan, FixedTrainee};
use crate::scheduler::LrScheduler;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateReport {
    pub architecture: Architecture,
    pub epochs: Vec<EpochStats>,
    /// Epoch with the highest validation top-1 (earliest on ties).
    pub best_epoch: usize,
    pub best_valid: EvalMetrics,
    pub total_steps: usize,
    pub report_path: PathBuf,
}

pub struct EvaluateAgent<'s> {
    config: AgentConfig,
    epochs: usize,
    child: ChildNet,
    optimizer: AdamW,
    sink: Box<dyn MetricSink + 's>,
    done: bool,
}

impl<'s> EvaluateAgent<'s> {
    /// `varmap` must hold the child's weights (see
    /// [`ChildNet::with_varmap`]). Trains for `config.total_epochs()` epochs
    /// unless overridden with [`with_epochs`](Self::with_epochs).
    pub fn new(config: AgentConfig, child: ChildNet, varmap: &VarMap) -> Result<Self> {
        config.validate()?;
        config.lr_decay.parse::<crate::scheduler::LrDecay>()?;
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        Ok(Self {
            epochs: config.total_epochs(),
            config,
            child,
            optimizer,
            sink: Box::new(TracingSink),
            done: false,
        })
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn MetricSink + 's>) -> Self {
        self.sink = sink;
        self
    }

    pub fn child(&self) -> &ChildNet {
        &self.child
    }

    /// Train and validate every epoch; writes `evaluate_report.json` to
    /// `output_dir`.
    pub fn run(&mut self, train: &dyn BatchDataset, val: &dyn BatchDataset) -> Result<EvaluateReport> {
        if self.done {
            return Err(NasError::state("evaluate agent already ran"));
        }
        if self.epochs == 0 {
            return Err(NasError::config("evaluation needs at least one epoch"));
        }
        if train.is_empty() || val.is_empty() {
            return Err(NasError::config("train and validation sets must be non-empty"));
        }
        self.done = true;
        std::fs::create_dir_all(&self.config.output_dir)?;

        let steps_per_epoch = train.num_batches(self.config.batch_size);
        let mut scheduler = LrScheduler::fixed(&self.config, self.epochs, steps_per_epoch)?;
        tracing::info!(
            architecture = %self.child.architecture(),
            epochs = self.epochs,
            steps_per_epoch,
            "Starting child network training"
        );

        let mut epochs: Vec<EpochStats> = Vec::with_capacity(self.epochs);
        for epoch in 0..self.epochs {
            let start = Instant::now();
            let plan = EpochPlan {
                epoch,
                total_epochs: self.epochs,
                batch_size: self.config.batch_size,
                report_interval: self.config.report_interval,
                phase: Phase::Evaluate.as_str(),
            };
            let trained = train_epoch(
                &mut FixedTrainee(&self.child),
                &mut self.optimizer,
                None,
                &mut scheduler,
                train,
                &plan,
            )?;
            record(self.sink.as_mut(), "child_train", &trained.metrics, epoch)?;
            let valid = validate_epoch(&self.child, val, self.config.eval_max_batches, &plan)?;
            record(self.sink.as_mut(), "child_valid", &valid, epoch)?;

            epochs.push(EpochStats {
                epoch,
                phase: Phase::Evaluate,
                train: trained.metrics,
                valid,
                lr: trained.lr,
                arch_lr: trained.arch_lr,
                duration_secs: start.elapsed().as_secs_f64(),
            });
        }

        let mut best_epoch = 0;
        for (i, stats) in epochs.iter().enumerate() {
            if stats.valid.top1 > epochs[best_epoch].valid.top1 {
                best_epoch = i;
            }
        }
        let best_valid = epochs[best_epoch].valid;

        let report = EvaluateReport {
            architecture: self.child.architecture().clone(),
            epochs,
            best_epoch,
            best_valid,
            total_steps: scheduler.step(),
            report_path: self.config.output_dir.join("evaluate_report.json"),
        };
        std::fs::write(&report.report_path, serde_json::to_string_pretty(&report)?)?;
        tracing::info!(
            architecture = %report.architecture,
            best_epoch = report.best_epoch + 1,
            top1 = format!("{:.1}%", best_valid.top1 * 100.0),
            top5 = format!("{:.1}%", best_valid.top5 * 100.0),
            path = %report.report_path.display(),
            "Child evaluation complete"
        );
        Ok(report)
    }
}
