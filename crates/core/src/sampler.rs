//! Training strategies: how the supernet is configured before each
//! training step of the search phase.
//!
//! | Strategy | `step` | `generate_training_architecture` |
//! |----------|--------|----------------------------------|
//! | [`UniformSampler`] | `single` mode on a uniform random path | each stage uniform over choices |
//! | [`DifferentiableSampler`] | `softmax_sum` / `gumbel_sum(τ)`, τ annealed | each stage from `softmax(θ[i])` |

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use supernet_common::{DifferentiableConfig, NasError, Result};

use crate::architecture::{Architecture, ArchitectureParameter, ForwardState};
use crate::supernet::Supernet;

pub trait TrainingStrategy {
    /// Configure `supernet` for the next forward/backward step.
    fn step(&mut self, supernet: &mut Supernet) -> Result<()>;

    /// Draw one architecture from the strategy's distribution.
    fn generate_training_architecture(&mut self) -> Result<Architecture>;

    /// Whether the architecture parameter should receive gradients while
    /// this strategy is active.
    fn trains_architecture_parameter(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

// ── Uniform ─────────────────────────────────────────────────────────────────

/// Single-path one-shot sampling (SPOS).
pub struct UniformSampler {
    stages: usize,
    choices: usize,
    rng: StdRng,
}

impl UniformSampler {
    pub fn new(stages: usize, choices: usize, seed: Option<u64>) -> Self {
        Self {
            stages,
            choices,
            rng: rng_from(seed),
        }
    }

    pub fn for_supernet(supernet: &Supernet, seed: Option<u64>) -> Self {
        let (stages, choices) = supernet.arch_param_shape();
        Self::new(stages, choices, seed)
    }
}

impl TrainingStrategy for UniformSampler {
    fn step(&mut self, supernet: &mut Supernet) -> Result<()> {
        let architecture = self.generate_training_architecture()?;
        supernet.set_forward_state(ForwardState::Single)?;
        supernet.set_active_architecture(architecture)
    }

    fn generate_training_architecture(&mut self) -> Result<Architecture> {
        if self.choices == 0 {
            return Err(NasError::config("cannot sample from zero choices"));
        }
        let choices = (0..self.stages)
            .map(|_| self.rng.gen_range(0..self.choices))
            .collect();
        Ok(Architecture::new(choices))
    }

    fn name(&self) -> &'static str {
        "uniform"
    }
}

// ── Differentiable ──────────────────────────────────────────────────────────

/// Continuous relaxation over the architecture parameter.
///
/// The sampler never writes the logits; it only selects the relaxation and
/// anneals the Gumbel temperature by `tau_decay` after every step, floored at
/// `tau_min`.
pub struct DifferentiableSampler {
    config: DifferentiableConfig,
    tau: f64,
    param: Option<ArchitectureParameter>,
    rng: StdRng,
}

impl DifferentiableSampler {
    pub fn new(config: DifferentiableConfig, seed: Option<u64>) -> Self {
        Self {
            tau: config.tau_initial,
            config,
            param: None,
            rng: rng_from(seed),
        }
    }

    /// Current Gumbel temperature.
    pub fn tau(&self) -> f64 {
        self.tau
    }

    /// The forward state the next `step` would select.
    pub fn forward_state(&self) -> ForwardState {
        if self.config.gumbel {
            ForwardState::GumbelSum { tau: self.tau }
        } else {
            ForwardState::SoftmaxSum
        }
    }
}

impl TrainingStrategy for DifferentiableSampler {
    fn step(&mut self, supernet: &mut Supernet) -> Result<()> {
        if supernet.architecture_parameter().is_none() {
            supernet.initialize_architecture_parameter()?;
        }
        supernet.set_forward_state(self.forward_state())?;
        // Clones share storage, so later optimizer updates stay visible.
        self.param = supernet.architecture_parameter().cloned();
        self.tau = (self.tau * self.config.tau_decay).max(self.config.tau_min);
        Ok(())
    }

    fn generate_training_architecture(&mut self) -> Result<Architecture> {
        let param = self
            .param
            .as_ref()
            .ok_or_else(|| NasError::state("differentiable sampler has not been stepped yet"))?;
        let mut choices = Vec::with_capacity(param.shape().0);
        for (stage, row) in param.probabilities()?.iter().enumerate() {
            let dist = WeightedIndex::new(row)
                .map_err(|e| NasError::state(format!("stage {stage}: {e}")))?;
            choices.push(dist.sample(&mut self.rng));
        }
        Ok(Architecture::new(choices))
    }

    fn trains_architecture_parameter(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "differentiable"
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use std::collections::HashMap;
    use supernet_common::SearchSpaceConfig;

    #[test]
    fn uniform_draws_are_in_range() {
        let mut sampler = UniformSampler::new(5, 4, Some(1));
        for _ in 0..100 {
            let arch = sampler.generate_training_architecture().unwrap();
            assert_eq!(arch.len(), 5);
            assert!(arch.iter().all(|&c| c < 4));
        }
    }

    #[test]
    fn uniform_draws_pass_chi_square() {
        // 4 stages × 3 choices = 81 architectures.
        let mut sampler = UniformSampler::new(4, 3, Some(7));
        let draws = 10_000;
        let mut counts: HashMap<Architecture, usize> = HashMap::new();
        for _ in 0..draws {
            *counts
                .entry(sampler.generate_training_architecture().unwrap())
                .or_default() += 1;
        }
        assert_eq!(counts.len(), 81);
        let expected = draws as f64 / 81.0;
        let chi2: f64 = counts
            .values()
            .map(|&c| (c as f64 - expected).powi(2) / expected)
            .sum();
        // 80 degrees of freedom; p = 1e-4 critical value is ~131.1.
        assert!(chi2 < 131.1, "chi2 = {chi2}");
    }

    #[test]
    fn uniform_step_activates_single_path() {
        let mut net = Supernet::new(&SearchSpaceConfig::default(), &Device::Cpu).unwrap();
        net.set_forward_state(ForwardState::SoftmaxSum).unwrap();
        let mut sampler = UniformSampler::for_supernet(&net, Some(3));
        sampler.step(&mut net).unwrap();
        assert_eq!(net.forward_state(), ForwardState::Single);
        assert_eq!(net.active_architecture().unwrap().len(), net.num_stages());
        assert!(!sampler.trains_architecture_parameter());
    }

    #[test]
    fn differentiable_step_anneals_tau_and_keeps_logits() {
        let mut net = Supernet::new(&SearchSpaceConfig::default(), &Device::Cpu).unwrap();
        let config = DifferentiableConfig {
            gumbel: true,
            tau_initial: 1.0,
            tau_min: 0.5,
            tau_decay: 0.5,
        };
        let mut sampler = DifferentiableSampler::new(config, Some(0));
        sampler.step(&mut net).unwrap();
        let before = net.architecture_parameter().unwrap().values().unwrap();
        assert_eq!(net.forward_state(), ForwardState::GumbelSum { tau: 1.0 });
        assert_eq!(sampler.tau(), 0.5);

        sampler.step(&mut net).unwrap();
        sampler.step(&mut net).unwrap();
        assert_eq!(sampler.tau(), 0.5);
        assert_eq!(net.architecture_parameter().unwrap().values().unwrap(), before);
    }

    #[test]
    fn differentiable_sampling_follows_softmax() {
        let mut net = Supernet::new(&SearchSpaceConfig::default(), &Device::Cpu).unwrap();
        let (stages, choices) = net.arch_param_shape();
        let mut flat = vec![-30f32; stages * choices];
        for stage in 0..stages {
            flat[stage * choices + stage % choices] = 30.0;
        }
        let logits = Tensor::from_vec(flat, (stages, choices), &Device::Cpu).unwrap();
        net.set_architecture_parameter(ArchitectureParameter::from_tensor(&logits).unwrap())
            .unwrap();

        let config = DifferentiableConfig {
            gumbel: false,
            ..Default::default()
        };
        let mut sampler = DifferentiableSampler::new(config, Some(11));
        assert!(matches!(sampler.generate_training_architecture(), Err(NasError::State(_))));
        sampler.step(&mut net).unwrap();
        assert_eq!(net.forward_state(), ForwardState::SoftmaxSum);

        let expected: Vec<usize> = (0..stages).map(|s| s % choices).collect();
        for _ in 0..20 {
            let arch = sampler.generate_training_architecture().unwrap();
            assert_eq!(arch.as_slice(), expected.as_slice());
        }
    }
}
