//! Epoch loop shared by supernet training and child-network evaluation.

use std::time::Instant;

use candle_nn::{AdamW, Optimizer};

use supernet_common::{
    accuracy_topk, batch_to_tensors, AverageMeter, BatchDataset, EvalMetrics, MetricSink, NasError,
    Result,
};
use supernet_core::{Classifier, Supernet, TrainingStrategy};
use supernet_search::evaluate_dataset;

use crate::scheduler::LrScheduler;

/// The network being trained, plus whatever runs before each batch.
pub(crate) trait Trainee {
    fn before_step(&mut self) -> Result<()> {
        Ok(())
    }

    fn network(&self) -> &dyn Classifier;
}

/// Supernet whose path or relaxation is re-sampled before every batch when a
/// strategy is attached.
pub(crate) struct SupernetTrainee<'a> {
    pub supernet: &'a mut Supernet,
    pub strategy: Option<&'a mut dyn TrainingStrategy>,
}

impl Trainee for SupernetTrainee<'_> {
    fn before_step(&mut self) -> Result<()> {
        if let Some(strategy) = self.strategy.as_mut() {
            strategy.step(&mut *self.supernet)?;
        }
        Ok(())
    }

    fn network(&self) -> &dyn Classifier {
        &*self.supernet
    }
}

/// A fixed network with nothing to do between batches.
pub(crate) struct FixedTrainee<'a, N: Classifier>(pub &'a N);

impl<N: Classifier> Trainee for FixedTrainee<'_, N> {
    fn network(&self) -> &dyn Classifier {
        self.0
    }
}

/// Knobs of one pass over the training set.
pub(crate) struct EpochPlan<'a> {
    pub epoch: usize,
    pub total_epochs: usize,
    pub batch_size: usize,
    pub report_interval: usize,
    pub phase: &'a str,
}

/// Means of one training pass and the learning rates of its last step.
pub(crate) struct TrainedEpoch {
    pub metrics: EvalMetrics,
    pub lr: f64,
    /// Zero when no architecture optimiser is attached.
    pub arch_lr: f64,
}

/// One optimisation pass over `data`. The weight optimiser follows
/// `scheduler.weight_lr()`, the architecture optimiser (if any)
/// `scheduler.arch_lr()`; the scheduler advances once per batch.
pub(crate) fn train_epoch(
    trainee: &mut dyn Trainee,
    optimizer: &mut AdamW,
    mut arch_optimizer: Option<&mut AdamW>,
    scheduler: &mut LrScheduler,
    data: &dyn BatchDataset,
    plan: &EpochPlan<'_>,
) -> Result<TrainedEpoch> {
    let start = Instant::now();
    let num_batches = data.num_batches(plan.batch_size);
    let shape = data.sample_shape();
    let mut losses = AverageMeter::new();
    let mut top1 = AverageMeter::new();
    let mut top5 = AverageMeter::new();
    let mut last_lr = scheduler.weight_lr();
    let mut last_arch_lr = 0.0;

    for (step, (features, labels)) in data.batches(plan.batch_size).enumerate() {
        trainee.before_step()?;

        let n = labels.len();
        let net = trainee.network();
        let (input, labels) = batch_to_tensors(features, labels, shape, net.device())?;
        let logits = net.logits(&input)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
        let loss_val = loss.to_scalar::<f32>()? as f64;
        if !loss_val.is_finite() {
            return Err(NasError::NonFiniteLoss {
                loss: loss_val,
                epoch: plan.epoch,
                step,
            });
        }

        let lr = scheduler.weight_lr();
        optimizer.set_learning_rate(lr);
        let grads = loss.backward()?;
        optimizer.step(&grads)?;
        if let Some(arch_optimizer) = arch_optimizer.as_deref_mut() {
            last_arch_lr = scheduler.arch_lr();
            arch_optimizer.set_learning_rate(last_arch_lr);
            arch_optimizer.step(&grads)?;
        }
        last_lr = lr;
        scheduler.advance();

        let acc = accuracy_topk(&logits.detach(), &labels, &[1, 5])?;
        losses.update(loss_val, n);
        top1.update(acc[0], n);
        top5.update(acc[1], n);

        if (step > 1 && step % plan.report_interval == 0) || step + 1 == num_batches {
            tracing::info!(
                phase = plan.phase,
                epoch = format!("{}/{}", plan.epoch + 1, plan.total_epochs),
                step = format!("{}/{}", step, num_batches.saturating_sub(1)),
                loss = format!("{:.3}", losses.avg()),
                top1 = format!("{:.1}%", top1.avg() * 100.0),
                top5 = format!("{:.1}%", top5.avg() * 100.0),
                lr = format!("{lr:.2e}"),
                "Train"
            );
        }
    }

    let metrics = EvalMetrics {
        top1: top1.avg(),
        top5: top5.avg(),
        loss: losses.avg(),
    };
    tracing::info!(
        epoch = format!("{}/{}", plan.epoch + 1, plan.total_epochs),
        loss = format!("{:.3}", metrics.loss),
        top1 = format!("{:.1}%", metrics.top1 * 100.0),
        top5 = format!("{:.1}%", metrics.top5 * 100.0),
        secs = format!("{:.2}", start.elapsed().as_secs_f64()),
        "Train epoch done"
    );
    Ok(TrainedEpoch {
        metrics,
        lr: last_lr,
        arch_lr: last_arch_lr,
    })
}

/// Validation pass over `val`, logged like a training epoch.
pub(crate) fn validate_epoch(
    net: &dyn Classifier,
    val: &dyn BatchDataset,
    max_batches: Option<usize>,
    plan: &EpochPlan<'_>,
) -> Result<EvalMetrics> {
    let start = Instant::now();
    let metrics = evaluate_dataset(net, val, plan.batch_size, max_batches)?;
    tracing::info!(
        epoch = format!("{}/{}", plan.epoch + 1, plan.total_epochs),
        loss = format!("{:.3}", metrics.loss),
        top1 = format!("{:.1}%", metrics.top1 * 100.0),
        top5 = format!("{:.1}%", metrics.top5 * 100.0),
        secs = format!("{:.2}", start.elapsed().as_secs_f64()),
        "Valid"
    );
    Ok(metrics)
}

/// `{prefix}/loss`, `{prefix}/top1` and `{prefix}/top5` at `step`.
pub(crate) fn record(sink: &mut dyn MetricSink, prefix: &str, metrics: &EvalMetrics, step: usize) -> Result<()> {
    sink.add_scalar(&format!("{prefix}/loss"), metrics.loss, step)?;
    sink.add_scalar(&format!("{prefix}/top1"), metrics.top1, step)?;
    sink.add_scalar(&format!("{prefix}/top5"), metrics.top5, step)
}
