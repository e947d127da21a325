//! Hardware-cost lookup table.
//!
//! One `[stages × choices]` column per [`InfoMetric`]. The cost of an
//! architecture is the sum of its per-stage entries, so a query touches
//! exactly one entry per stage and never executes the network.
//!
//! Columns can be computed analytically from the search space
//! ([`LookupTable::from_search_space`]: MFLOPs, M params), measured on a
//! built supernet ([`LookupTable::profile_latency`]: ms), or loaded from JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use supernet_common::{BlockSpec, BlockType, InfoMetric, NasError, Result, SearchSpaceConfig};

use crate::architecture::Architecture;
use crate::block::{conv_output_size, se_channels};
use crate::supernet::Supernet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupTable {
    stages: usize,
    choices: usize,
    /// Keyed by [`InfoMetric::as_str`].
    columns: BTreeMap<String, Vec<Vec<f64>>>,
}

impl LookupTable {
    pub fn new(stages: usize, choices: usize) -> Self {
        Self {
            stages,
            choices,
            columns: BTreeMap::new(),
        }
    }

    /// Table with a single column filled by `cost(stage, choice)`.
    pub fn from_fn(
        stages: usize,
        choices: usize,
        metric: InfoMetric,
        cost: impl Fn(usize, usize) -> f64,
    ) -> Self {
        let column = (0..stages)
            .map(|s| (0..choices).map(|c| cost(s, c)).collect())
            .collect();
        let mut table = Self::new(stages, choices);
        table.columns.insert(metric.as_str().to_string(), column);
        table
    }

    /// Analytic MFLOPs and M-parameter columns for every searchable
    /// `(stage, choice)` of `space`.
    pub fn from_search_space(space: &SearchSpaceConfig) -> Result<Self> {
        space.validate()?;
        let mut size = space.input_size;
        for layer in &space.macro_config.first {
            size = conv_output_size(size, layer.stride);
        }

        let mut flops = Vec::with_capacity(space.num_stages());
        let mut params = Vec::with_capacity(space.num_stages());
        for stage in &space.macro_config.search {
            let costs: Vec<BlockCost> = space
                .micro_config
                .iter()
                .map(|spec| block_cost(spec, stage.in_channels, stage.out_channels, stage.stride, size))
                .collect();
            flops.push(costs.iter().map(|c| c.flops / 1e6).collect());
            params.push(costs.iter().map(|c| c.params / 1e6).collect());
            size = conv_output_size(size, stage.stride);
        }

        let mut table = Self::new(space.num_stages(), space.num_choices());
        table.insert_column(InfoMetric::Flops, flops)?;
        table.insert_column(InfoMetric::Param, params)?;
        Ok(table)
    }

    /// Add or replace a column. It must cover every `(stage, choice)` pair.
    pub fn insert_column(&mut self, metric: InfoMetric, column: Vec<Vec<f64>>) -> Result<()> {
        if column.len() != self.stages || column.iter().any(|row| row.len() != self.choices) {
            return Err(NasError::config(format!(
                "`{metric}` column must be {} × {}",
                self.stages, self.choices
            )));
        }
        self.columns.insert(metric.as_str().to_string(), column);
        Ok(())
    }

    /// Measure the latency (ms) of every candidate on a `batch_size` dummy
    /// input and store it as the `latency` column. Stage inputs are produced
    /// by running candidate 0 of each preceding stage.
    pub fn profile_latency(&mut self, supernet: &Supernet, batch_size: usize, repeats: usize) -> Result<()> {
        let space = supernet.search_space();
        if (self.stages, self.choices) != supernet.arch_param_shape() {
            return Err(NasError::config(format!(
                "lookup table is {} × {}, supernet is {:?}",
                self.stages,
                self.choices,
                supernet.arch_param_shape()
            )));
        }
        let repeats = repeats.max(1);
        let input = Tensor::zeros(
            (batch_size.max(1), space.input_channels, space.input_size, space.input_size),
            DType::F32,
            supernet.device(),
        )?;

        let mut x = supernet.forward_first(&input)?;
        let mut column = Vec::with_capacity(self.stages);
        for stage in 0..self.stages {
            let candidates = supernet
                .stage_candidates(stage)
                .ok_or_else(|| NasError::config(format!("stage {stage} out of range")))?;
            let mut row = Vec::with_capacity(candidates.len());
            for block in candidates {
                // warm-up run
                block.forward(&x)?;
                let start = Instant::now();
                for _ in 0..repeats {
                    block.forward(&x)?;
                }
                row.push(start.elapsed().as_secs_f64() * 1e3 / repeats as f64);
            }
            column.push(row);
            if let Some(first) = candidates.first() {
                x = first.forward(&x)?;
            }
        }
        tracing::info!(stages = self.stages, repeats, "Latency lookup table profiled");
        self.insert_column(InfoMetric::Latency, column)
    }

    pub fn num_stages(&self) -> usize {
        self.stages
    }

    pub fn num_choices(&self) -> usize {
        self.choices
    }

    pub fn has_metric(&self, metric: InfoMetric) -> bool {
        self.columns.contains_key(metric.as_str())
    }

    fn column(&self, metric: InfoMetric) -> Result<&Vec<Vec<f64>>> {
        self.columns
            .get(metric.as_str())
            .ok_or_else(|| NasError::MissingMetric {
                metric: metric.to_string(),
            })
    }

    /// Cost of one `(stage, choice)` pair.
    pub fn cost(&self, metric: InfoMetric, stage: usize, choice: usize) -> Result<f64> {
        self.column(metric)?
            .get(stage)
            .and_then(|row| row.get(choice))
            .copied()
            .ok_or_else(|| NasError::Lookup {
                metric: metric.to_string(),
                stage,
                choice,
            })
    }

    /// `Σ_i table[metric][i][architecture[i]]`. The architecture must cover
    /// every stage of the table.
    pub fn get_cost(&self, architecture: &Architecture, metric: InfoMetric) -> Result<f64> {
        if architecture.len() != self.stages {
            return Err(NasError::config(format!(
                "architecture {architecture} has {} stages, lookup table has {}",
                architecture.len(),
                self.stages
            )));
        }
        let column = self.column(metric)?;
        let mut total = 0.0;
        for (stage, &choice) in architecture.iter().enumerate() {
            total += column
                .get(stage)
                .and_then(|row| row.get(choice))
                .ok_or_else(|| NasError::Lookup {
                    metric: metric.to_string(),
                    stage,
                    choice,
                })?;
        }
        Ok(total)
    }

    /// Cheapest achievable architecture cost.
    pub fn min_cost(&self, metric: InfoMetric) -> Result<f64> {
        self.extreme_cost(metric, f64::min)
    }

    /// Most expensive achievable architecture cost.
    pub fn max_cost(&self, metric: InfoMetric) -> Result<f64> {
        self.extreme_cost(metric, f64::max)
    }

    fn extreme_cost(&self, metric: InfoMetric, pick: fn(f64, f64) -> f64) -> Result<f64> {
        let column = self.column(metric)?;
        let mut total = 0.0;
        for (stage, row) in column.iter().enumerate() {
            let best = row.iter().copied().reduce(pick).ok_or_else(|| NasError::Lookup {
                metric: metric.to_string(),
                stage,
                choice: 0,
            })?;
            total += best;
        }
        Ok(total)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let table: Self = serde_json::from_str(&json)?;
        for (name, column) in &table.columns {
            let metric: InfoMetric = name.parse()?;
            if column.len() != table.stages || column.iter().any(|r| r.len() != table.choices) {
                return Err(NasError::config(format!(
                    "`{metric}` column in {} is not {} × {}",
                    path.display(),
                    table.stages,
                    table.choices
                )));
            }
        }
        Ok(table)
    }
}

// ── Analytic block cost ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockCost {
    /// Multiply-accumulates.
    pub flops: f64,
    pub params: f64,
}

impl std::ops::Add for BlockCost {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            flops: self.flops + rhs.flops,
            params: self.params + rhs.params,
        }
    }
}

/// Biased `k×k` convolution producing an `out_size × out_size` map.
fn conv_cost(k: usize, cin: usize, cout: usize, groups: usize, out_size: usize) -> BlockCost {
    let weights = (k * k * (cin / groups) * cout) as f64;
    BlockCost {
        flops: weights * (out_size * out_size) as f64,
        params: weights + cout as f64,
    }
}

/// Two 1×1 convolutions on the pooled `channels` vector.
fn se_cost(channels: usize) -> BlockCost {
    let hidden = se_channels(channels);
    conv_cost(1, channels, hidden, 1, 1) + conv_cost(1, hidden, channels, 1, 1)
}

/// Cost of one block built by [`crate::block::Block::new`] on an
/// `in_size × in_size` input.
pub fn block_cost(spec: &BlockSpec, cin: usize, cout: usize, stride: usize, in_size: usize) -> BlockCost {
    let k = spec.kernel_size;
    let out_size = conv_output_size(in_size, stride);
    let se = |c: usize| if spec.se { se_cost(c) } else { BlockCost::default() };
    match spec.block_type {
        BlockType::Conv => conv_cost(k, cin, cout, 1, out_size) + se(cout),
        BlockType::Mobile => {
            let hidden = cin * spec.expansion_rate;
            let expand = if spec.expansion_rate != 1 {
                conv_cost(1, cin, hidden, 1, in_size)
            } else {
                BlockCost::default()
            };
            expand
                + conv_cost(k, hidden, hidden, hidden, out_size)
                + se(hidden)
                + conv_cost(1, hidden, cout, 1, out_size)
        }
        BlockType::Skip => {
            if stride != 1 || cin != cout {
                conv_cost(1, cin, cout, 1, out_size)
            } else {
                BlockCost::default()
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use supernet_common::Activation;

    fn scenario_table() -> LookupTable {
        LookupTable::from_fn(4, 3, InfoMetric::Flops, |_, c| (c + 1) as f64)
    }

    #[test]
    fn cost_is_sum_of_stage_entries() {
        let table = LookupTable::from_fn(3, 4, InfoMetric::Latency, |s, c| (10 * s + c) as f64);
        let arch = Architecture::new(vec![3, 0, 2]);
        let expected: f64 = arch
            .iter()
            .enumerate()
            .map(|(s, &c)| table.cost(InfoMetric::Latency, s, c).unwrap())
            .sum();
        assert_eq!(table.get_cost(&arch, InfoMetric::Latency).unwrap(), expected);
        assert_eq!(expected, 3.0 + 10.0 + 22.0);
    }

    #[test]
    fn min_and_max_cost() {
        let table = scenario_table();
        assert_eq!(table.min_cost(InfoMetric::Flops).unwrap(), 4.0);
        assert_eq!(table.max_cost(InfoMetric::Flops).unwrap(), 12.0);
    }

    #[test]
    fn missing_pair_or_metric_is_a_lookup_error() {
        let table = scenario_table();
        let err = table.get_cost(&Architecture::new(vec![0, 0, 5, 0]), InfoMetric::Flops);
        assert!(matches!(err, Err(NasError::Lookup { stage: 2, choice: 5, .. })));
        let err = table.get_cost(&Architecture::new(vec![0; 4]), InfoMetric::Param);
        assert!(matches!(err, Err(NasError::MissingMetric { ref metric }) if metric == "param"));
        assert!(matches!(table.min_cost(InfoMetric::Latency), Err(NasError::MissingMetric { .. })));
    }

    #[test]
    fn architecture_length_must_match_table() {
        let table = scenario_table();
        let short = table.get_cost(&Architecture::new(vec![2]), InfoMetric::Flops);
        assert!(matches!(short, Err(NasError::Config(_))));
        let long = table.get_cost(&Architecture::new(vec![0; 5]), InfoMetric::Flops);
        assert!(matches!(long, Err(NasError::Config(_))));
    }

    #[test]
    fn ragged_column_is_rejected() {
        let mut table = LookupTable::new(2, 2);
        let err = table.insert_column(InfoMetric::Flops, vec![vec![1.0, 2.0], vec![1.0]]);
        assert!(matches!(err, Err(NasError::Config(_))));
    }

    #[test]
    fn analytic_costs_match_hand_computation() {
        // 3×3 conv, 4 → 8, stride 2 on 8×8: out 4×4.
        let c = block_cost(&BlockSpec::conv(3, Activation::Relu), 4, 8, 2, 8);
        assert_eq!(c.params, (9 * 4 * 8 + 8) as f64);
        assert_eq!(c.flops, (9 * 4 * 8 * 16) as f64);

        assert_eq!(block_cost(&BlockSpec::skip(), 8, 8, 1, 8), BlockCost::default());

        // Mobile e=2, k=3, 4 → 4, stride 1 on 8×8.
        let m = block_cost(&BlockSpec::mobile(3, 2, Activation::Relu, false), 4, 4, 1, 8);
        let expand = (4 * 8) as f64;
        let dw = (9 * 8) as f64;
        let project = (8 * 4) as f64;
        assert_eq!(m.params, expand + 8.0 + dw + 8.0 + project + 4.0);
        assert_eq!(m.flops, (expand + dw + project) * 64.0);
    }

    #[test]
    fn analytic_params_match_built_supernet() {
        let space = SearchSpaceConfig::default();
        let table = LookupTable::from_search_space(&space).unwrap();
        let net = Supernet::new(&space, &Device::Cpu).unwrap();

        let counted: usize = net
            .varmap()
            .data()
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.starts_with("search."))
            .map(|(_, v)| v.as_tensor().elem_count())
            .sum();
        let mut tabulated = 0.0;
        for s in 0..table.num_stages() {
            for c in 0..table.num_choices() {
                tabulated += table.cost(InfoMetric::Param, s, c).unwrap();
            }
        }
        assert!((tabulated * 1e6 - counted as f64).abs() < 1e-3);
    }

    #[test]
    fn profiled_latency_covers_every_pair() {
        let space = SearchSpaceConfig::default();
        let net = Supernet::new(&space, &Device::Cpu).unwrap();
        let mut table = LookupTable::from_search_space(&space).unwrap();
        table.profile_latency(&net, 1, 1).unwrap();
        assert!(table.has_metric(InfoMetric::Latency));
        let cost = table
            .get_cost(&Architecture::new(vec![0; 4]), InfoMetric::Latency)
            .unwrap();
        assert!(cost >= 0.0);
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lut.json");
        let table = LookupTable::from_search_space(&SearchSpaceConfig::default()).unwrap();
        table.save(&path).unwrap();
        assert_eq!(LookupTable::load(&path).unwrap(), table);
    }
}
