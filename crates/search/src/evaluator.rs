//! Held-out evaluation of a classifier, with per-architecture caching for
//! the supernet.

use std::num::NonZeroUsize;

use candle_core::DType;

use supernet_common::{
    accuracy_topk, batch_to_tensors, AverageMeter, BatchDataset, EvalMetrics, NasError, Result,
};
use supernet_core::{Classifier, ForwardState, Supernet};

use crate::types::EvaluationObjective;

/// Loss, top-1 and top-5 means of `net` over at most `max_batches` batches
/// of `dataset`. A supernet is evaluated under its current state.
pub fn evaluate_dataset(
    net: &dyn Classifier,
    dataset: &dyn BatchDataset,
    batch_size: usize,
    max_batches: Option<usize>,
) -> Result<EvalMetrics> {
    let shape = dataset.sample_shape();
    let limit = max_batches.unwrap_or(usize::MAX);
    let mut loss_meter = AverageMeter::new();
    let mut top1_meter = AverageMeter::new();
    let mut top5_meter = AverageMeter::new();

    for (features, labels) in dataset.batches(batch_size).take(limit) {
        let n = labels.len();
        let (input, labels) = batch_to_tensors(features, labels, shape, net.device())?;
        let logits = net.logits(&input)?.detach();
        let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
        let acc = accuracy_topk(&logits.to_dtype(DType::F32)?, &labels, &[1, 5])?;
        loss_meter.update(loss.to_scalar::<f32>()? as f64, n);
        top1_meter.update(acc[0], n);
        top5_meter.update(acc[1], n);
    }

    if loss_meter.count() == 0 {
        return Err(NasError::config("evaluation dataset yielded no batches"));
    }
    Ok(EvalMetrics {
        top1: top1_meter.avg(),
        top5: top5_meter.avg(),
        loss: loss_meter.avg(),
    })
}

/// Default objective: a validation pass, cached by architecture key while
/// the supernet runs in `single` mode.
///
/// The cache assumes frozen weights; call [`clear_cache`](Self::clear_cache)
/// after any training step.
pub struct ValidationObjective<'a> {
    dataset: &'a dyn BatchDataset,
    batch_size: usize,
    max_batches: Option<usize>,
    cache: lru::LruCache<String, EvalMetrics>,
    evaluations: usize,
    hits: usize,
}

impl<'a> ValidationObjective<'a> {
    pub fn new(
        dataset: &'a dyn BatchDataset,
        batch_size: usize,
        max_batches: Option<usize>,
        cache_size: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            dataset,
            batch_size,
            max_batches,
            cache: lru::LruCache::new(capacity),
            evaluations: 0,
            hits: 0,
        }
    }

    /// Full validation passes run (cache misses).
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn cache_hits(&self) -> usize {
        self.hits
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

impl EvaluationObjective for ValidationObjective<'_> {
    fn evaluate(&mut self, supernet: &Supernet) -> Result<EvalMetrics> {
        let key = match (supernet.forward_state(), supernet.active_architecture()) {
            (ForwardState::Single, Some(arch)) => Some(arch.key()),
            _ => None,
        };
        if let Some(metrics) = key.as_ref().and_then(|k| self.cache.get(k)) {
            self.hits += 1;
            return Ok(*metrics);
        }
        let metrics = evaluate_dataset(supernet, self.dataset, self.batch_size, self.max_batches)?;
        self.evaluations += 1;
        if let Some(key) = key {
            self.cache.put(key, metrics);
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use supernet_common::{InMemoryDataset, SearchSpaceConfig};
    use supernet_core::Architecture;

    fn setup() -> (Supernet, InMemoryDataset) {
        let mut space = SearchSpaceConfig::default();
        space.input_size = 8;
        space.classes = 4;
        let net = Supernet::new(&space, &Device::Cpu).unwrap();
        let data = InMemoryDataset::synthetic(12, 4, [3, 8, 8], 0).unwrap();
        (net, data)
    }

    #[test]
    fn metrics_are_in_range() {
        let (mut net, data) = setup();
        net.set_active_architecture(Architecture::new(vec![0; 4])).unwrap();
        let m = evaluate_dataset(&net, &data, 5, None).unwrap();
        assert!((0.0..=1.0).contains(&m.top1));
        assert!(m.top5 >= m.top1);
        // Four classes: top-5 always contains the label.
        assert_eq!(m.top5, 1.0);
        assert!(m.loss.is_finite());
    }

    #[test]
    fn single_mode_results_are_cached() {
        let (mut net, data) = setup();
        let mut objective = ValidationObjective::new(&data, 4, Some(2), 8);
        net.set_active_architecture(Architecture::new(vec![1, 0, 2, 3])).unwrap();
        let a = objective.evaluate(&net).unwrap();
        let b = objective.evaluate(&net).unwrap();
        assert_eq!(a, b);
        assert_eq!(objective.evaluations(), 1);
        assert_eq!(objective.cache_hits(), 1);

        objective.clear_cache();
        objective.evaluate(&net).unwrap();
        assert_eq!(objective.evaluations(), 2);
    }

    #[test]
    fn relaxed_mode_bypasses_cache() {
        let (mut net, data) = setup();
        net.initialize_architecture_parameter().unwrap();
        net.set_forward_state(ForwardState::SoftmaxSum).unwrap();
        let mut objective = ValidationObjective::new(&data, 6, None, 8);
        objective.evaluate(&net).unwrap();
        objective.evaluate(&net).unwrap();
        assert_eq!(objective.evaluations(), 2);
    }
}
