//! Weight-sharing supernet.
//!
//! Layout: fixed `first` layers → searchable stages (one [`Block`] per
//! micro-config candidate) → fixed `last` layers → global average pool →
//! linear classifier.
//!
//! How a stage combines its candidates is decided by the [`SupernetState`]
//! passed to [`Supernet::evaluate`]:
//!
//! | Forward state | Executed candidates | Stage output |
//! |---------------|---------------------|--------------|
//! | `single`      | `architecture[i]`   | that candidate's output |
//! | `sum`         | all                 | `Σ_j θ[i][j] · op_j(x)` |
//! | `softmax_sum` | all                 | `Σ_j softmax(θ[i])_j · op_j(x)` |
//! | `gumbel_sum`  | all                 | `Σ_j gumbel_softmax(θ[i], τ)_j · op_j(x)` |
//!
//! Stage `i` always reads row `i` of the architecture parameter `θ`.

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

use supernet_common::{NasError, Result, SearchSpaceConfig};

use crate::architecture::{
    gumbel_softmax, Architecture, ArchitectureParameter, ForwardState, SupernetState,
};
use crate::block::{fixed_layers, Block};

/// Anything that maps a `(N, C, H, W)` batch to `(N, classes)` logits.
pub trait Classifier {
    fn logits(&self, x: &Tensor) -> Result<Tensor>;

    fn device(&self) -> &Device;
}

/// Global average pool over the spatial dims, then the linear classifier.
pub(crate) fn classify(x: &Tensor, classifier: &Linear) -> Result<Tensor> {
    let pooled = x.mean(D::Minus1)?.mean(D::Minus1)?;
    Ok(classifier.forward(&pooled)?)
}

pub struct Supernet {
    first: Vec<Block>,
    stages: Vec<Vec<Block>>,
    last: Vec<Block>,
    classifier: Linear,
    space: SearchSpaceConfig,
    varmap: VarMap,
    device: Device,
    state: SupernetState,
}

impl Supernet {
    /// Build every candidate of every stage. Weights live in an internal
    /// [`VarMap`]; the architecture parameter is kept outside it.
    pub fn new(space: &SearchSpaceConfig, device: &Device) -> Result<Self> {
        space.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let macro_config = &space.macro_config;

        let first = fixed_layers(&macro_config.first, vb.pp("first"))?;

        let mut stages = Vec::with_capacity(macro_config.search.len());
        for (i, stage) in macro_config.search.iter().enumerate() {
            let candidates = space
                .micro_config
                .iter()
                .enumerate()
                .map(|(j, spec)| {
                    Block::new(
                        spec,
                        stage.in_channels,
                        stage.out_channels,
                        stage.stride,
                        vb.pp(format!("search.{i}.{j}")),
                    )
                })
                .collect::<candle_core::Result<Vec<_>>>()?;
            stages.push(candidates);
        }

        let last = fixed_layers(&macro_config.last, vb.pp("last"))?;

        let classifier = linear(space.feature_channels(), space.classes, vb.pp("classifier"))?;

        tracing::debug!(
            stages = stages.len(),
            choices = space.num_choices(),
            weights = varmap.all_vars().len(),
            "Supernet built"
        );

        Ok(Self {
            first,
            stages,
            last,
            classifier,
            space: space.clone(),
            varmap,
            device: device.clone(),
            state: SupernetState::default(),
        })
    }

    // ── Shape / accessors ───────────────────────────────────────────────────

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn num_choices(&self) -> usize {
        self.space.num_choices()
    }

    /// `(stages, choices)`.
    pub fn arch_param_shape(&self) -> (usize, usize) {
        (self.num_stages(), self.num_choices())
    }

    pub fn search_space(&self) -> &SearchSpaceConfig {
        &self.space
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Operation weights only (excludes the architecture parameter).
    pub fn weight_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn state(&self) -> &SupernetState {
        &self.state
    }

    pub fn forward_state(&self) -> ForwardState {
        self.state.forward
    }

    pub fn active_architecture(&self) -> Option<&Architecture> {
        self.state.architecture.as_ref()
    }

    pub fn architecture_parameter(&self) -> Option<&ArchitectureParameter> {
        self.state.arch_param.as_ref()
    }

    pub fn architecture_parameter_mut(&mut self) -> Option<&mut ArchitectureParameter> {
        self.state.arch_param.as_mut()
    }

    // ── State mutation ──────────────────────────────────────────────────────

    /// Activate the path used by `single` mode.
    pub fn set_active_architecture(&mut self, architecture: Architecture) -> Result<()> {
        architecture.validate(self.num_stages(), self.num_choices())?;
        self.state.architecture = Some(architecture);
        Ok(())
    }

    /// Switch the forward mode. On error the previous mode is kept.
    pub fn set_forward_state(&mut self, state: ForwardState) -> Result<()> {
        state.validate()?;
        self.state.forward = state;
        Ok(())
    }

    /// Parse and switch the forward mode (`single`, `sum`, `softmax_sum`,
    /// `gumbel_sum`). On error the previous mode is kept.
    pub fn set_forward_state_by_name(&mut self, name: &str) -> Result<()> {
        let state: ForwardState = name.parse()?;
        self.set_forward_state(state)
    }

    /// Allocate fresh `N(0, 1e-3)` logits of shape `[stages × choices]`,
    /// frozen until made trainable.
    pub fn initialize_architecture_parameter(&mut self) -> Result<&ArchitectureParameter> {
        let (stages, choices) = self.arch_param_shape();
        let param = ArchitectureParameter::random(stages, choices, &self.device)?;
        Ok(self.state.arch_param.insert(param))
    }

    /// Install externally created logits; the shape must match.
    pub fn set_architecture_parameter(&mut self, param: ArchitectureParameter) -> Result<()> {
        if param.shape() != self.arch_param_shape() {
            return Err(NasError::config(format!(
                "architecture parameter shape {:?} does not match supernet {:?}",
                param.shape(),
                self.arch_param_shape()
            )));
        }
        self.state.arch_param = Some(param);
        Ok(())
    }

    /// Per-stage argmax of the logits; ties go to the lowest index.
    pub fn best_architecture(&self) -> Result<Architecture> {
        let param = self
            .state
            .arch_param
            .as_ref()
            .ok_or_else(|| NasError::state("architecture parameter is not initialized"))?;
        let choices = param
            .values()?
            .iter()
            .map(|row| {
                let mut best = 0;
                for (j, &v) in row.iter().enumerate() {
                    if v > row[best] {
                        best = j;
                    }
                }
                best
            })
            .collect();
        Ok(Architecture::new(choices))
    }

    // ── Evaluation ──────────────────────────────────────────────────────────

    /// Evaluate with the supernet's own state.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.evaluate(x, &self.state)
    }

    /// Run `x` through the network under `state`; returns `(N, classes)` logits.
    pub fn evaluate(&self, x: &Tensor, state: &SupernetState) -> Result<Tensor> {
        self.check_state(state)?;

        let mut x = self.forward_first(x)?;
        for stage in 0..self.stages.len() {
            x = self.evaluate_stage(stage, &x, state)?;
        }
        for block in &self.last {
            x = block.forward(&x)?;
        }
        classify(&x, &self.classifier)
    }

    /// Fixed stem; output is the input of searchable stage 0.
    pub fn forward_first(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for block in &self.first {
            x = block.forward(&x)?;
        }
        Ok(x)
    }

    /// Candidates of searchable `stage`, in micro-config order.
    pub fn stage_candidates(&self, stage: usize) -> Option<&[Block]> {
        self.stages.get(stage).map(|c| c.as_slice())
    }

    /// Evaluate one searchable stage. `stage` selects both the candidate
    /// list and the architecture-parameter row.
    pub fn evaluate_stage(&self, stage: usize, x: &Tensor, state: &SupernetState) -> Result<Tensor> {
        let candidates = self
            .stages
            .get(stage)
            .ok_or_else(|| NasError::config(format!("stage {stage} out of range")))?;

        let weights = match state.forward {
            ForwardState::Single => {
                let architecture = state
                    .architecture
                    .as_ref()
                    .ok_or_else(|| NasError::state("single mode requires an active architecture"))?;
                let block = architecture
                    .get(stage)
                    .and_then(|&choice| candidates.get(choice))
                    .ok_or_else(|| {
                        NasError::config(format!(
                            "architecture {architecture} has no valid choice for stage {stage} \
                             ({} candidates)",
                            candidates.len()
                        ))
                    })?;
                return Ok(block.forward(x)?);
            }
            ForwardState::Sum => self.param_row(state, stage)?,
            ForwardState::SoftmaxSum => candle_nn::ops::softmax(&self.param_row(state, stage)?, 0)?,
            ForwardState::GumbelSum { tau } => gumbel_softmax(&self.param_row(state, stage)?, tau)?,
        };

        let mut out: Option<Tensor> = None;
        for (j, block) in candidates.iter().enumerate() {
            let y = block.forward(x)?.broadcast_mul(&weights.get(j)?)?;
            out = Some(match out {
                None => y,
                Some(acc) => (acc + y)?,
            });
        }
        out.ok_or_else(|| NasError::config(format!("stage {stage} has no candidates")))
    }

    fn param_row(&self, state: &SupernetState, stage: usize) -> Result<Tensor> {
        let param = state.arch_param.as_ref().ok_or_else(|| {
            NasError::state(format!(
                "{} mode requires an initialized architecture parameter",
                state.forward.name()
            ))
        })?;
        param.row(stage)
    }

    fn check_state(&self, state: &SupernetState) -> Result<()> {
        state.forward.validate()?;
        if state.forward.is_differentiable() {
            let param = state.arch_param.as_ref().ok_or_else(|| {
                NasError::state(format!(
                    "{} mode requires an initialized architecture parameter",
                    state.forward.name()
                ))
            })?;
            if param.shape() != self.arch_param_shape() {
                return Err(NasError::config(format!(
                    "architecture parameter shape {:?} does not match supernet {:?}",
                    param.shape(),
                    self.arch_param_shape()
                )));
            }
        } else {
            let architecture = state
                .architecture
                .as_ref()
                .ok_or_else(|| NasError::state("single mode requires an active architecture"))?;
            architecture.validate(self.num_stages(), self.num_choices())?;
        }
        Ok(())
    }
}

impl Classifier for Supernet {
    /// Logits under the supernet's own state.
    fn logits(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use supernet_common::{Activation, BlockSpec, LayerConfig, MacroConfig, MicroConfig, StageConfig};

    /// 4 stages × 3 candidates on 1×6×6 inputs.
    fn tiny_space() -> SearchSpaceConfig {
        SearchSpaceConfig {
            input_channels: 1,
            input_size: 6,
            classes: 5,
            macro_config: MacroConfig {
                first: vec![LayerConfig {
                    in_channels: 1,
                    out_channels: 4,
                    stride: 1,
                    block: BlockSpec::conv(3, Activation::Relu),
                }],
                search: vec![
                    StageConfig { in_channels: 4, out_channels: 4, stride: 1 },
                    StageConfig { in_channels: 4, out_channels: 6, stride: 2 },
                    StageConfig { in_channels: 6, out_channels: 6, stride: 1 },
                    StageConfig { in_channels: 6, out_channels: 8, stride: 1 },
                ],
                last: vec![],
            },
            micro_config: MicroConfig(vec![
                BlockSpec::mobile(3, 2, Activation::Relu, false),
                BlockSpec::conv(3, Activation::Hswish),
                BlockSpec::skip(),
            ]),
        }
    }

    fn input() -> Tensor {
        Tensor::randn(0f32, 1f32, (2, 1, 6, 6), &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(1)
            .unwrap()
            .max_keepdim(0)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0]
    }

    #[test]
    fn parameter_shape_and_best_architecture_range() {
        let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
        let param = net.initialize_architecture_parameter().unwrap();
        assert_eq!(param.shape(), (4, 3));
        let best = net.best_architecture().unwrap();
        assert_eq!(best.len(), 4);
        assert!(best.iter().all(|&c| c < 3));
    }

    #[test]
    fn best_architecture_ties_go_to_lowest_index() {
        let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
        let logits = Tensor::new(
            &[[0f32, 0.0, 0.0], [1.0, 2.0, 2.0], [3.0, 1.0, 3.0], [0.0, 0.0, 5.0]],
            &Device::Cpu,
        )
        .unwrap();
        net.set_architecture_parameter(ArchitectureParameter::from_tensor(&logits).unwrap())
            .unwrap();
        assert_eq!(net.best_architecture().unwrap().as_slice(), &[0, 1, 0, 2]);
    }

    #[test]
    fn single_mode_is_deterministic() {
        let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
        net.set_active_architecture(Architecture::new(vec![0, 1, 2, 1])).unwrap();
        let x = input();
        let a = net.forward(&x).unwrap();
        let b = net.forward(&x).unwrap();
        assert_eq!(a.dims(), &[2, 5]);
        assert_eq!(max_abs_diff(&a, &b), 0.0);
    }

    #[test]
    fn invalid_architectures_are_rejected() {
        let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
        let short = net.set_active_architecture(Architecture::new(vec![0, 1]));
        assert!(matches!(short, Err(NasError::Config(_))));
        let out_of_range = net.set_active_architecture(Architecture::new(vec![0, 1, 3, 0]));
        assert!(matches!(out_of_range, Err(NasError::Config(_))));
        assert!(net.active_architecture().is_none());
    }

    #[test]
    fn unknown_forward_state_keeps_previous() {
        let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
        net.set_forward_state(ForwardState::SoftmaxSum).unwrap();
        assert!(matches!(net.set_forward_state_by_name("median"), Err(NasError::Config(_))));
        assert_eq!(net.forward_state(), ForwardState::SoftmaxSum);
        let bad_tau = net.set_forward_state(ForwardState::GumbelSum { tau: -1.0 });
        assert!(matches!(bad_tau, Err(NasError::Config(_))));
        assert_eq!(net.forward_state(), ForwardState::SoftmaxSum);
    }

    #[test]
    fn missing_state_is_a_state_error() {
        let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
        let x = input();
        assert!(matches!(net.forward(&x), Err(NasError::State(_))));
        net.set_forward_state(ForwardState::Sum).unwrap();
        assert!(matches!(net.forward(&x), Err(NasError::State(_))));
        net.initialize_architecture_parameter().unwrap();
        assert_eq!(net.forward(&x).unwrap().dims(), &[2, 5]);
    }

    #[test]
    fn softmax_sum_with_peaked_logits_matches_single_path() {
        let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
        let arch = Architecture::new(vec![2, 0, 1, 0]);
        let mut flat = vec![0f32; 4 * 3];
        for (stage, &choice) in arch.iter().enumerate() {
            flat[stage * 3 + choice] = 50.0;
        }
        let logits = Tensor::from_vec(flat, (4, 3), &Device::Cpu).unwrap();
        let param = ArchitectureParameter::from_tensor(&logits).unwrap();

        let x = input();
        let single = net.evaluate(&x, &SupernetState::single(arch)).unwrap();
        let relaxed = net
            .evaluate(&x, &SupernetState::relaxed(ForwardState::SoftmaxSum, param.clone()))
            .unwrap();
        assert!(max_abs_diff(&single, &relaxed) < 1e-4);

        net.set_architecture_parameter(param).unwrap();
        net.set_forward_state(ForwardState::GumbelSum { tau: 1.0 }).unwrap();
        assert_eq!(net.forward(&x).unwrap().dims(), &[2, 5]);
    }

    #[test]
    fn evaluate_stage_rejects_short_or_out_of_range_architectures() {
        let net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
        let stem = net.forward_first(&input()).unwrap();

        let short = SupernetState::single(Architecture::new(vec![0]));
        assert!(matches!(net.evaluate_stage(2, &stem, &short), Err(NasError::Config(_))));

        let out_of_range = SupernetState::single(Architecture::new(vec![3, 0, 0, 0]));
        assert!(matches!(net.evaluate_stage(0, &stem, &out_of_range), Err(NasError::Config(_))));

        let valid = SupernetState::single(Architecture::new(vec![1, 0, 0, 0]));
        assert!(matches!(net.evaluate_stage(4, &stem, &valid), Err(NasError::Config(_))));
        assert_eq!(net.evaluate_stage(0, &stem, &valid).unwrap().dims(), &[2, 4, 6, 6]);
    }

    #[test]
    fn sum_mode_uses_raw_logits() {
        let net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
        let x = input();
        let zeros = Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap();
        let param = ArchitectureParameter::from_tensor(&zeros).unwrap();
        let stem = net.forward_first(&x).unwrap();
        let state = SupernetState::relaxed(ForwardState::Sum, param);
        let out = net.evaluate_stage(0, &stem, &state).unwrap();
        let total = out.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn gradients_reach_trainable_parameter_only() {
        let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
        net.initialize_architecture_parameter().unwrap();
        net.set_forward_state(ForwardState::SoftmaxSum).unwrap();
        let x = input();

        let frozen = net.forward(&x).unwrap().sum_all().unwrap().backward().unwrap();
        let var = net.architecture_parameter().unwrap().var().clone();
        assert!(frozen.get(var.as_tensor()).is_none());

        net.architecture_parameter_mut().unwrap().set_trainable(true);
        let grads = net.forward(&x).unwrap().sum_all().unwrap().backward().unwrap();
        assert!(grads.get(var.as_tensor()).is_some());
    }
}
