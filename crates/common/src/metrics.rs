//! Running means, top-k accuracy and scalar metric sinks.

use std::fs::File;
use std::path::Path;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ── Running means ───────────────────────────────────────────────────────────

/// Count-weighted running mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` as the mean of `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Loss and accuracy means over one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub top1: f64,
    pub top5: f64,
    pub loss: f64,
}

// ── Accuracy ────────────────────────────────────────────────────────────────

/// Top-k accuracy of `logits` `(N, classes)` against `labels` `(N,)`, as a
/// fraction in `[0, 1]` for every `k` in `ks`.
///
/// A sample counts as correct for `k` when fewer than `k` classes score
/// strictly higher than the true class.
pub fn accuracy_topk(logits: &Tensor, labels: &Tensor, ks: &[usize]) -> candle_core::Result<Vec<f64>> {
    let scores: Vec<Vec<f32>> = logits.to_vec2()?;
    let labels: Vec<u32> = labels.to_vec1()?;
    let n = labels.len().max(1) as f64;

    let ranks: Vec<usize> = scores
        .iter()
        .zip(&labels)
        .map(|(row, &label)| {
            let target = row[label as usize];
            row.iter().filter(|&&s| s > target).count()
        })
        .collect();

    Ok(ks
        .iter()
        .map(|&k| ranks.iter().filter(|&&r| r < k).count() as f64 / n)
        .collect())
}

// ── Metric sinks ────────────────────────────────────────────────────────────

/// Receiver of named scalar events.
pub trait MetricSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()>;
}

impl<S: MetricSink + ?Sized> MetricSink for &mut S {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        (**self).add_scalar(name, value, step)
    }
}

/// Emits every scalar as a `tracing` debug event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        tracing::debug!(name, value, step, "metric");
        Ok(())
    }
}

/// One row of a [`CsvSink`] file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub name: String,
    pub value: f64,
    pub step: usize,
}

/// Appends `name,value,step` records to a CSV file, flushed per event.
pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    /// Create (or truncate) `path`. The header is written with the first record.
    pub fn create(path: &Path) -> Result<Self> {
        let writer = csv::Writer::from_path(path)?;
        Ok(Self { writer })
    }
}

impl MetricSink for CsvSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.writer.serialize(ScalarRecord {
            name: name.to_string(),
            value,
            step,
        })?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<(String, f64, usize)>,
}

impl MemorySink {
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.events
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|&(_, v, _)| v)
            .collect()
    }
}

impl MetricSink for MemorySink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.events.push((name.to_string(), value, step));
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
