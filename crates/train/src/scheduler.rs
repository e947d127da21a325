//! Per-batch learning rates for the two optimisers of a supernet run.
//!
//! One schedule spans every training epoch of the run. The weight LR ramps
//! linearly over `lr_warmup_steps`, then decays from `lr` toward `lr_min`.
//! The architecture-parameter LR is zero until the first step of the search
//! phase and `arch_lr` from there on.

use std::f64::consts::PI;
use std::str::FromStr;

use supernet_common::{AgentConfig, NasError, Result};

/// Shape of the weight-LR decay after the ramp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    Cosine,
    Linear,
    None,
}

impl LrDecay {
    /// Share of the `lr - lr_min` span still applied at `progress` ∈ [0, 1].
    fn remaining(self, progress: f64) -> f64 {
        match self {
            Self::Cosine => 0.5 * (1.0 + (PI * progress).cos()),
            Self::Linear => 1.0 - progress,
            Self::None => 1.0,
        }
    }
}

impl FromStr for LrDecay {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(Self::Cosine),
            "linear" => Ok(Self::Linear),
            "none" | "constant" => Ok(Self::None),
            other => Err(NasError::config(format!("unknown lr_decay: {other:?}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LrScheduler {
    lr: f64,
    lr_min: f64,
    ramp_steps: usize,
    decay: LrDecay,
    arch_lr: f64,
    steps_per_epoch: usize,
    /// First global step of the search phase.
    search_start: usize,
    total_steps: usize,
    step: usize,
}

impl LrScheduler {
    /// Schedule for a supernet run: `warmup_epochs` of weight-only training,
    /// then `epochs` of search.
    pub fn new(config: &AgentConfig, steps_per_epoch: usize) -> Result<Self> {
        Ok(Self {
            lr: config.lr,
            lr_min: config.lr_min,
            ramp_steps: config.lr_warmup_steps,
            decay: config.lr_decay.parse()?,
            arch_lr: config.arch_lr,
            steps_per_epoch,
            search_start: steps_per_epoch * config.warmup_epochs,
            total_steps: steps_per_epoch * config.total_epochs(),
            step: 0,
        })
    }

    /// Schedule for training a fixed network for `epochs`: the same weight
    /// LR curve, no search phase.
    pub fn fixed(config: &AgentConfig, epochs: usize, steps_per_epoch: usize) -> Result<Self> {
        let total_steps = steps_per_epoch * epochs;
        Ok(Self {
            search_start: total_steps,
            total_steps,
            arch_lr: 0.0,
            ..Self::new(config, steps_per_epoch)?
        })
    }

    /// Learning rate of the operation weights at the current step.
    pub fn weight_lr(&self) -> f64 {
        if self.step < self.ramp_steps {
            return self.lr * (self.step + 1) as f64 / self.ramp_steps as f64;
        }
        let span = self.total_steps.saturating_sub(self.ramp_steps);
        if span == 0 {
            return self.lr;
        }
        let progress = ((self.step - self.ramp_steps) as f64 / span as f64).min(1.0);
        self.lr_min + (self.lr - self.lr_min) * self.decay.remaining(progress)
    }

    /// Learning rate of the architecture parameter at the current step.
    pub fn arch_lr(&self) -> f64 {
        if self.in_search() {
            self.arch_lr
        } else {
            0.0
        }
    }

    pub fn in_search(&self) -> bool {
        self.step >= self.search_start && self.search_start < self.total_steps
    }

    pub fn search_start(&self) -> usize {
        self.search_start
    }

    /// Epoch the next step belongs to.
    pub fn epoch(&self) -> usize {
        self.step / self.steps_per_epoch.max(1)
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(decay: &str) -> AgentConfig {
        AgentConfig {
            lr: 1e-2,
            lr_min: 1e-4,
            arch_lr: 3e-3,
            lr_decay: decay.to_string(),
            warmup_epochs: 2,
            epochs: 3,
            ..Default::default()
        }
    }

    fn advance_to(sched: &mut LrScheduler, step: usize) {
        while sched.step() < step {
            sched.advance();
        }
    }

    #[test]
    fn ramp_reaches_base_lr() {
        let mut cfg = config("cosine");
        cfg.lr_warmup_steps = 4;
        let mut sched = LrScheduler::new(&cfg, 10).unwrap();
        assert!((sched.weight_lr() - 2.5e-3).abs() < 1e-12);
        advance_to(&mut sched, 3);
        assert!((sched.weight_lr() - 1e-2).abs() < 1e-12);
    }

    #[test]
    fn cosine_hits_midpoint_and_floor() {
        let mut sched = LrScheduler::new(&config("cosine"), 10).unwrap();
        assert_eq!(sched.total_steps(), 50);
        assert!((sched.weight_lr() - 1e-2).abs() < 1e-12);
        advance_to(&mut sched, 25);
        assert!((sched.weight_lr() - (1e-4 + 0.5 * (1e-2 - 1e-4))).abs() < 1e-12);
        advance_to(&mut sched, 80);
        assert!((sched.weight_lr() - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn linear_and_constant_decay() {
        let mut linear = LrScheduler::new(&config("linear"), 10).unwrap();
        advance_to(&mut linear, 10);
        assert!((linear.weight_lr() - (1e-2 - 0.2 * (1e-2 - 1e-4))).abs() < 1e-12);

        let mut constant = LrScheduler::new(&config("constant"), 10).unwrap();
        advance_to(&mut constant, 49);
        assert!((constant.weight_lr() - 1e-2).abs() < 1e-12);
    }

    #[test]
    fn architecture_lr_starts_with_search_phase() {
        let mut sched = LrScheduler::new(&config("cosine"), 10).unwrap();
        assert_eq!(sched.search_start(), 20);
        advance_to(&mut sched, 19);
        assert!(!sched.in_search());
        assert_eq!(sched.arch_lr(), 0.0);
        assert_eq!(sched.epoch(), 1);
        sched.advance();
        assert!(sched.in_search());
        assert_eq!(sched.arch_lr(), 3e-3);
        assert_eq!(sched.epoch(), 2);
    }

    #[test]
    fn fixed_schedule_never_trains_architecture() {
        let mut sched = LrScheduler::fixed(&config("linear"), 4, 5).unwrap();
        assert_eq!(sched.total_steps(), 20);
        for _ in 0..25 {
            assert!(!sched.in_search());
            assert_eq!(sched.arch_lr(), 0.0);
            sched.advance();
        }
        assert!((sched.weight_lr() - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn decay_names() {
        assert_eq!("linear".parse::<LrDecay>().unwrap(), LrDecay::Linear);
        assert_eq!("none".parse::<LrDecay>().unwrap(), LrDecay::None);
        assert!(matches!("step".parse::<LrDecay>(), Err(NasError::Config(_))));
    }
}
