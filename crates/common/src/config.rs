//! Search-space and agent configuration.
//!
//! Both configs are serialised as JSON. Every optional field has a
//! `#[serde(default)]` so a minimal file still produces a runnable setup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NasError, Result};

// ── Candidate operations ────────────────────────────────────────────────────

/// Operation family of a block. Closed set: the supernet resolves each
/// variant to a constructor once, at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// `k×k` convolution followed by the activation.
    Conv,
    /// Inverted bottleneck: 1×1 expand → depthwise `k×k` → 1×1 project.
    Mobile,
    /// Identity, or a strided 1×1 projection when the shape changes.
    Skip,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    Relu6,
    Swish,
    Hswish,
}

/// One candidate operation (an entry of the micro config), also used for the
/// fixed `first`/`last` layers of the macro config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub block_type: BlockType,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    #[serde(default)]
    pub activation: Activation,
    /// Squeeze-and-excite after the spatial convolution.
    #[serde(default)]
    pub se: bool,
    /// Hidden width multiplier (`Mobile` only).
    #[serde(default = "default_expansion_rate")]
    pub expansion_rate: usize,
}

impl BlockSpec {
    pub fn conv(kernel_size: usize, activation: Activation) -> Self {
        Self {
            block_type: BlockType::Conv,
            kernel_size,
            activation,
            se: false,
            expansion_rate: 1,
        }
    }

    pub fn mobile(kernel_size: usize, expansion_rate: usize, activation: Activation, se: bool) -> Self {
        Self {
            block_type: BlockType::Mobile,
            kernel_size,
            activation,
            se,
            expansion_rate,
        }
    }

    pub fn skip() -> Self {
        Self {
            block_type: BlockType::Skip,
            kernel_size: 1,
            activation: Activation::Relu,
            se: false,
            expansion_rate: 1,
        }
    }

    fn validate(&self, what: &str) -> Result<()> {
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(NasError::config(format!(
                "{what}: kernel_size must be odd and positive, got {}",
                self.kernel_size
            )));
        }
        if self.expansion_rate == 0 {
            return Err(NasError::config(format!("{what}: expansion_rate must be > 0")));
        }
        Ok(())
    }
}

// ── Macro / micro config ────────────────────────────────────────────────────

/// A fixed (non-searchable) layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(flatten)]
    pub block: BlockSpec,
}

/// A searchable stage: every candidate of the micro config is built with
/// these channel counts and stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroConfig {
    #[serde(default)]
    pub first: Vec<LayerConfig>,
    pub search: Vec<StageConfig>,
    #[serde(default)]
    pub last: Vec<LayerConfig>,
}

/// Shared choice set for every searchable stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MicroConfig(pub Vec<BlockSpec>);

impl MicroConfig {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, choice: usize) -> Option<&BlockSpec> {
        self.0.get(choice)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BlockSpec> {
        self.0.iter()
    }
}

/// Full description of the supernet: input geometry, classifier width and
/// the macro/micro topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpaceConfig {
    #[serde(default = "default_input_channels")]
    pub input_channels: usize,
    /// Square input resolution.
    #[serde(default = "default_input_size")]
    pub input_size: usize,
    pub classes: usize,
    #[serde(rename = "macro")]
    pub macro_config: MacroConfig,
    #[serde(rename = "micro")]
    pub micro_config: MicroConfig,
}

impl Default for SearchSpaceConfig {
    /// Small CIFAR-sized space: 4 searchable stages × 6 candidates.
    fn default() -> Self {
        let first = vec![LayerConfig {
            in_channels: 3,
            out_channels: 16,
            stride: 1,
            block: BlockSpec::conv(3, Activation::Relu),
        }];
        let search = vec![
            StageConfig { in_channels: 16, out_channels: 24, stride: 2 },
            StageConfig { in_channels: 24, out_channels: 24, stride: 1 },
            StageConfig { in_channels: 24, out_channels: 40, stride: 2 },
            StageConfig { in_channels: 40, out_channels: 40, stride: 1 },
        ];
        let last = vec![LayerConfig {
            in_channels: 40,
            out_channels: 64,
            stride: 1,
            block: BlockSpec::conv(1, Activation::Relu),
        }];
        let micro = vec![
            BlockSpec::mobile(3, 3, Activation::Relu, false),
            BlockSpec::mobile(5, 3, Activation::Relu, false),
            BlockSpec::mobile(3, 6, Activation::Hswish, false),
            BlockSpec::mobile(5, 6, Activation::Hswish, true),
            BlockSpec::conv(3, Activation::Relu6),
            BlockSpec::skip(),
        ];
        Self {
            input_channels: 3,
            input_size: 32,
            classes: 10,
            macro_config: MacroConfig { first, search, last },
            micro_config: MicroConfig(micro),
        }
    }
}

impl SearchSpaceConfig {
    pub fn num_stages(&self) -> usize {
        self.macro_config.search.len()
    }

    pub fn num_choices(&self) -> usize {
        self.micro_config.len()
    }

    /// Channel count entering the classifier.
    pub fn feature_channels(&self) -> usize {
        self.macro_config
            .last
            .last()
            .map(|l| l.out_channels)
            .or_else(|| self.macro_config.search.last().map(|s| s.out_channels))
            .unwrap_or(self.input_channels)
    }

    /// Check channel continuity and per-block parameters.
    pub fn validate(&self) -> Result<()> {
        if self.classes == 0 {
            return Err(NasError::config("classes must be > 0"));
        }
        if self.input_size == 0 || self.input_channels == 0 {
            return Err(NasError::config("input_size and input_channels must be > 0"));
        }
        if self.macro_config.search.is_empty() {
            return Err(NasError::config("macro config has no searchable stages"));
        }
        if self.micro_config.is_empty() {
            return Err(NasError::config("micro config has no candidate operations"));
        }
        for (i, spec) in self.micro_config.iter().enumerate() {
            spec.validate(&format!("micro[{i}]"))?;
        }

        let mut channels = self.input_channels;
        let fixed = self
            .macro_config
            .first
            .iter()
            .enumerate()
            .map(|(i, l)| (format!("first[{i}]"), l));
        for (name, layer) in fixed {
            check_layer(&name, channels, layer.in_channels, layer.stride)?;
            layer.block.validate(&name)?;
            channels = layer.out_channels;
        }
        for (i, stage) in self.macro_config.search.iter().enumerate() {
            check_layer(&format!("search[{i}]"), channels, stage.in_channels, stage.stride)?;
            channels = stage.out_channels;
        }
        for (i, layer) in self.macro_config.last.iter().enumerate() {
            let name = format!("last[{i}]");
            check_layer(&name, channels, layer.in_channels, layer.stride)?;
            layer.block.validate(&name)?;
            channels = layer.out_channels;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

fn check_layer(name: &str, expected_in: usize, in_channels: usize, stride: usize) -> Result<()> {
    if in_channels != expected_in {
        return Err(NasError::config(format!(
            "{name}: in_channels {in_channels} does not match previous output {expected_in}"
        )));
    }
    if stride == 0 {
        return Err(NasError::config(format!("{name}: stride must be > 0")));
    }
    Ok(())
}

// ── Agent config ────────────────────────────────────────────────────────────

/// Which lookup-table column feasibility is judged on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoMetric {
    /// Multiply-accumulates, in millions.
    Flops,
    /// Parameter count, in millions.
    Param,
    /// Measured latency, in milliseconds.
    Latency,
}

impl InfoMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flops => "flops",
            Self::Param => "param",
            Self::Latency => "latency",
        }
    }
}

impl std::fmt::Display for InfoMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InfoMetric {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flops" => Ok(Self::Flops),
            "param" => Ok(Self::Param),
            "latency" => Ok(Self::Latency),
            other => Err(NasError::config(format!("unknown info metric: {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStrategyKind {
    #[default]
    Uniform,
    Differentiable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategyKind {
    #[default]
    Random,
    Evolution,
    Differentiable,
}

/// Evolutionary search knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub population_size: usize,
    pub generations: usize,
    /// Top-k survivors used as parents.
    pub parent_size: usize,
    pub mutation_size: usize,
    pub crossover_size: usize,
    /// Per-stage probability of resampling a gene.
    pub mutation_prob: f64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            population_size: 20,
            generations: 10,
            parent_size: 5,
            mutation_size: 10,
            crossover_size: 10,
            mutation_prob: 0.1,
        }
    }
}

/// Relaxation used by the differentiable sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DifferentiableConfig {
    /// `gumbel_sum` when true, `softmax_sum` otherwise.
    pub gumbel: bool,
    pub tau_initial: f64,
    pub tau_min: f64,
    /// Multiplicative decay applied after every sampler step.
    pub tau_decay: f64,
}

impl Default for DifferentiableConfig {
    fn default() -> Self {
        Self {
            gumbel: true,
            tau_initial: 5.0,
            tau_min: 0.1,
            tau_decay: 0.9995,
        }
    }
}

/// Training-agent and search hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Search-phase epochs (after warmup).
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_warmup_epochs")]
    pub warmup_epochs: usize,
    /// Log progress every N batches.
    #[serde(default = "default_report_interval")]
    pub report_interval: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    // ── Optimisation ────────────────────────────────────────────────────────
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_lr_min")]
    pub lr_min: f64,
    #[serde(default)]
    pub lr_warmup_steps: usize,
    /// `cosine`, `linear` or `none`.
    #[serde(default = "default_lr_decay")]
    pub lr_decay: String,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Learning rate of the architecture parameter (differentiable sampler).
    #[serde(default = "default_arch_lr")]
    pub arch_lr: f64,

    // ── Phases / strategies ────────────────────────────────────────────────
    /// Forward state used while warming up: `single`, `sum`, `softmax_sum`
    /// or `gumbel_sum`.
    #[serde(default = "default_warmup_forward_state")]
    pub warmup_forward_state: String,
    #[serde(default)]
    pub training_strategy: TrainingStrategyKind,
    #[serde(default)]
    pub search_strategy: SearchStrategyKind,
    #[serde(default)]
    pub differentiable: DifferentiableConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,

    // ── Hardware constraint ────────────────────────────────────────────────
    #[serde(default = "default_info_metric")]
    pub info_metric: InfoMetric,
    /// Hardware budget in units of `info_metric`.
    #[serde(default = "default_target_hc")]
    pub target_hc: f64,
    /// Feasible candidates drawn by random search.
    #[serde(default = "default_random_iteration")]
    pub random_iteration: usize,
    /// Draws allowed per feasible candidate before giving up.
    #[serde(default = "default_max_resample")]
    pub max_resample: usize,

    // ── Misc ────────────────────────────────────────────────────────────────
    /// Cap on validation batches per candidate (None = whole set).
    #[serde(default)]
    pub eval_max_batches: Option<usize>,
    #[serde(default = "default_eval_cache_size")]
    pub eval_cache_size: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_kernel_size() -> usize {
    3
}
fn default_expansion_rate() -> usize {
    1
}
fn default_stride() -> usize {
    1
}
fn default_input_channels() -> usize {
    3
}
fn default_input_size() -> usize {
    32
}
fn default_epochs() -> usize {
    10
}
fn default_warmup_epochs() -> usize {
    2
}
fn default_report_interval() -> usize {
    100
}
fn default_batch_size() -> usize {
    64
}
fn default_lr() -> f64 {
    1e-3
}
fn default_lr_min() -> f64 {
    1e-5
}
fn default_lr_decay() -> String {
    "cosine".to_string()
}
fn default_weight_decay() -> f64 {
    1e-4
}
fn default_arch_lr() -> f64 {
    1e-3
}
fn default_warmup_forward_state() -> String {
    "softmax_sum".to_string()
}
fn default_info_metric() -> InfoMetric {
    InfoMetric::Flops
}
fn default_target_hc() -> f64 {
    100.0
}
fn default_random_iteration() -> usize {
    100
}
fn default_max_resample() -> usize {
    10_000
}
fn default_eval_cache_size() -> usize {
    1000
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            warmup_epochs: default_warmup_epochs(),
            report_interval: default_report_interval(),
            batch_size: default_batch_size(),
            lr: default_lr(),
            lr_min: default_lr_min(),
            lr_warmup_steps: 0,
            lr_decay: default_lr_decay(),
            weight_decay: default_weight_decay(),
            arch_lr: default_arch_lr(),
            warmup_forward_state: default_warmup_forward_state(),
            training_strategy: TrainingStrategyKind::default(),
            search_strategy: SearchStrategyKind::default(),
            differentiable: DifferentiableConfig::default(),
            evolution: EvolutionConfig::default(),
            info_metric: default_info_metric(),
            target_hc: default_target_hc(),
            random_iteration: default_random_iteration(),
            max_resample: default_max_resample(),
            eval_max_batches: None,
            eval_cache_size: default_eval_cache_size(),
            seed: None,
            output_dir: default_output_dir(),
            show_progress: true,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.random_iteration == 0 {
            return Err(NasError::config("random_iteration must be > 0"));
        }
        if self.report_interval == 0 {
            return Err(NasError::config("report_interval must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(NasError::config("batch_size must be > 0"));
        }
        if self.max_resample == 0 {
            return Err(NasError::config("max_resample must be > 0"));
        }
        if !self.target_hc.is_finite() {
            return Err(NasError::config("target_hc must be finite"));
        }
        let d = &self.differentiable;
        if !(d.tau_initial > 0.0 && d.tau_min > 0.0 && d.tau_decay > 0.0 && d.tau_decay <= 1.0) {
            return Err(NasError::config(
                "differentiable: tau_initial and tau_min must be > 0, tau_decay in (0, 1]",
            ));
        }
        let e = &self.evolution;
        if e.population_size == 0 || e.parent_size == 0 || e.parent_size > e.population_size {
            return Err(NasError::config(
                "evolution: need 0 < parent_size <= population_size",
            ));
        }
        if !(0.0..=1.0).contains(&e.mutation_prob) {
            return Err(NasError::config("evolution: mutation_prob must be in [0, 1]"));
        }
        match (self.training_strategy, self.search_strategy) {
            (TrainingStrategyKind::Uniform, SearchStrategyKind::Differentiable) => {
                return Err(NasError::config(
                    "differentiable search needs training_strategy = differentiable \
                     (uniform training never optimises the architecture parameter)",
                ));
            }
            (TrainingStrategyKind::Differentiable, _) if self.epochs == 0 => {
                return Err(NasError::config(
                    "training_strategy = differentiable needs epochs > 0 \
                     (the sampler is only stepped during the search phase)",
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Total number of training epochs across warmup and search.
    pub fn total_epochs(&self) -> usize {
        self.warmup_epochs + self.epochs
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_search_space_is_valid() {
        let space = SearchSpaceConfig::default();
        space.validate().unwrap();
        assert_eq!(space.num_stages(), 4);
        assert_eq!(space.num_choices(), 6);
        assert_eq!(space.feature_channels(), 64);
    }

    #[test]
    fn search_space_json_round_trip() {
        let space = SearchSpaceConfig::default();
        let json = serde_json::to_string(&space).unwrap();
        assert!(json.contains("\"macro\""));
        assert!(json.contains("\"micro\""));
        let loaded: SearchSpaceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(space, loaded);
    }

    #[test]
    fn minimal_search_space_json_uses_defaults() {
        let json = r#"{
            "classes": 4,
            "macro": { "search": [ { "in_channels": 3, "out_channels": 8 } ] },
            "micro": [ { "block_type": "conv" }, { "block_type": "skip" } ]
        }"#;
        let space: SearchSpaceConfig = serde_json::from_str(json).unwrap();
        space.validate().unwrap();
        assert_eq!(space.input_size, 32);
        assert_eq!(space.macro_config.search[0].stride, 1);
        assert_eq!(space.micro_config.get(0).unwrap().kernel_size, 3);
        assert_eq!(space.micro_config.get(0).unwrap().activation, Activation::Relu);
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let mut space = SearchSpaceConfig::default();
        space.macro_config.search[2].in_channels = 99;
        let err = space.validate().unwrap_err();
        assert!(matches!(err, NasError::Config(_)));
        assert!(err.to_string().contains("search[2]"));
    }

    #[test]
    fn even_kernel_is_rejected() {
        let mut space = SearchSpaceConfig::default();
        space.micro_config.0[1].kernel_size = 4;
        assert!(matches!(space.validate(), Err(NasError::Config(_))));
    }

    #[test]
    fn agent_config_backward_compat_missing_fields() {
        let json = r#"{ "epochs": 3, "target_hc": 6.0, "info_metric": "param" }"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.warmup_epochs, 2);
        assert_eq!(config.info_metric, InfoMetric::Param);
        assert_eq!(config.training_strategy, TrainingStrategyKind::Uniform);
        assert_eq!(config.search_strategy, SearchStrategyKind::Random);
        assert_eq!(config.evolution.population_size, 20);
        assert!(config.differentiable.gumbel);
    }

    #[test]
    fn agent_config_rejects_zero_random_iteration() {
        let config = AgentConfig {
            random_iteration: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(NasError::Config(_))));
    }

    #[test]
    fn differentiable_search_requires_differentiable_training() {
        let config = AgentConfig {
            training_strategy: TrainingStrategyKind::Uniform,
            search_strategy: SearchStrategyKind::Differentiable,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, NasError::Config(_)));
        assert!(err.to_string().contains("differentiable search"));

        let config = AgentConfig {
            training_strategy: TrainingStrategyKind::Differentiable,
            search_strategy: SearchStrategyKind::Differentiable,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn differentiable_training_requires_search_epochs() {
        for search_strategy in [
            SearchStrategyKind::Random,
            SearchStrategyKind::Evolution,
            SearchStrategyKind::Differentiable,
        ] {
            let config = AgentConfig {
                epochs: 0,
                training_strategy: TrainingStrategyKind::Differentiable,
                search_strategy,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(NasError::Config(_))));
        }
        let config = AgentConfig {
            epochs: 0,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn agent_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        let config = AgentConfig {
            seed: Some(7),
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn info_metric_parse() {
        assert_eq!("latency".parse::<InfoMetric>().unwrap(), InfoMetric::Latency);
        assert!(matches!("energy".parse::<InfoMetric>(), Err(NasError::Config(_))));
    }
}
