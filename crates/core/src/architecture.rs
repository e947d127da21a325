//! Architecture encoding, forward states and the architecture parameter.
//!
//! The supernet's mutable configuration is a single explicit value,
//! [`SupernetState`], which [`Supernet::evaluate`](crate::Supernet::evaluate)
//! takes by reference. Nothing about the active path lives in hidden fields
//! of individual layers.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, Var, D};
use serde::{Deserialize, Serialize};

use supernet_common::{NasError, Result};

// ── Architecture ────────────────────────────────────────────────────────────

/// One candidate index per searchable stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Architecture(Vec<usize>);

impl Architecture {
    pub fn new(choices: Vec<usize>) -> Self {
        Self(choices)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<usize> {
        self.0
    }

    /// Unique key, e.g. `"0-2-1-1"`.
    pub fn key(&self) -> String {
        self.0
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Length must equal `stages` and every index must be `< choices`.
    pub fn validate(&self, stages: usize, choices: usize) -> Result<()> {
        if self.0.len() != stages {
            return Err(NasError::config(format!(
                "architecture has {} stages, supernet has {stages}",
                self.0.len()
            )));
        }
        if let Some((stage, &choice)) = self.0.iter().enumerate().find(|&(_, &c)| c >= choices) {
            return Err(NasError::config(format!(
                "stage {stage}: choice {choice} out of range [0, {choices})"
            )));
        }
        Ok(())
    }

    /// Read an `architecture.json` written by the training agent.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl Deref for Architecture {
    type Target = [usize];

    fn deref(&self) -> &[usize] {
        &self.0
    }
}

impl From<Vec<usize>> for Architecture {
    fn from(choices: Vec<usize>) -> Self {
        Self(choices)
    }
}

impl FromStr for Architecture {
    type Err = NasError;

    /// Parses the [`key`](Self::key) form (`"0-2-1"`); commas are accepted too.
    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split(['-', ','])
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|e| NasError::config(format!("invalid architecture {s:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.key())
    }
}

// ── ForwardState ────────────────────────────────────────────────────────────

/// How the candidates of a stage combine into one output.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ForwardState {
    /// Execute only the active architecture's candidate.
    #[default]
    Single,
    /// Weighted sum of all candidates, weights = raw logits row.
    Sum,
    /// Weighted sum, weights = `softmax(row)`.
    SoftmaxSum,
    /// Weighted sum, weights = `softmax((row + gumbel) / tau)`.
    GumbelSum { tau: f64 },
}

impl ForwardState {
    /// Every mode except `Single` reads the architecture parameter.
    pub fn is_differentiable(&self) -> bool {
        !matches!(self, Self::Single)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Sum => "sum",
            Self::SoftmaxSum => "softmax_sum",
            Self::GumbelSum { .. } => "gumbel_sum",
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Self::GumbelSum { tau } = self {
            if !(tau.is_finite() && *tau > 0.0) {
                return Err(NasError::config(format!(
                    "gumbel temperature must be finite and > 0, got {tau}"
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for ForwardState {
    type Err = NasError;

    /// Accepts `single`, `sum`, `softmax_sum` and `gumbel_sum` (τ = 1), with
    /// `-` accepted in place of `_`.
    fn from_str(s: &str) -> Result<Self> {
        match s.replace('-', "_").as_str() {
            "single" => Ok(Self::Single),
            "sum" => Ok(Self::Sum),
            "softmax_sum" | "softmax" => Ok(Self::SoftmaxSum),
            "gumbel_sum" | "gumbel_softmax" => Ok(Self::GumbelSum { tau: 1.0 }),
            _ => Err(NasError::config(format!("unknown forward state: {s:?}"))),
        }
    }
}

impl fmt::Display for ForwardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GumbelSum { tau } => write!(f, "gumbel_sum(tau={tau:.3})"),
            other => f.write_str(other.name()),
        }
    }
}

// ── ArchitectureParameter ───────────────────────────────────────────────────

/// Learnable `[stages × choices]` preference logits.
///
/// Clones share storage with the original (`Var` is reference counted), so a
/// sampler holding a clone observes optimizer updates. Gradient tracking is
/// off until [`set_trainable`](Self::set_trainable) is called: while frozen,
/// [`tensor`](Self::tensor) hands out a detached copy.
#[derive(Debug, Clone)]
pub struct ArchitectureParameter {
    var: Var,
    trainable: bool,
}

impl ArchitectureParameter {
    /// Logits drawn from `N(0, 1e-3)`.
    pub fn random(stages: usize, choices: usize, device: &Device) -> Result<Self> {
        let var = Var::randn(0f32, 1e-3f32, (stages, choices), device)?;
        Ok(Self {
            var,
            trainable: false,
        })
    }

    pub fn from_tensor(logits: &Tensor) -> Result<Self> {
        if logits.rank() != 2 {
            return Err(NasError::config(format!(
                "architecture parameter must be 2-D, got shape {:?}",
                logits.dims()
            )));
        }
        let var = Var::from_tensor(&logits.to_dtype(DType::F32)?)?;
        Ok(Self {
            var,
            trainable: false,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        let dims = self.var.as_tensor().dims();
        (dims[0], dims[1])
    }

    pub fn var(&self) -> &Var {
        &self.var
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// The logits, attached to the graph only when trainable.
    pub fn tensor(&self) -> Tensor {
        if self.trainable {
            self.var.as_tensor().clone()
        } else {
            self.var.as_tensor().detach()
        }
    }

    /// Logits row of `stage`.
    pub fn row(&self, stage: usize) -> Result<Tensor> {
        Ok(self.tensor().get(stage)?)
    }

    pub fn values(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.var.as_tensor().to_vec2()?)
    }

    /// Row-wise softmax of the logits.
    pub fn probabilities(&self) -> Result<Vec<Vec<f32>>> {
        let probs = candle_nn::ops::softmax(&self.var.as_tensor().detach(), D::Minus1)?;
        Ok(probs.to_vec2()?)
    }
}

/// `softmax((logits + g) / tau)` with `g = -log(-log(U))`, `U ~ U(0, 1)`.
pub fn gumbel_softmax(logits: &Tensor, tau: f64) -> Result<Tensor> {
    let uniform = Tensor::rand(0f32, 1f32, logits.dims(), logits.device())?;
    let gumbel = uniform
        .maximum(1e-10f32)?
        .log()?
        .neg()?
        .maximum(1e-10f32)?
        .log()?
        .neg()?;
    let perturbed = (logits + gumbel)?.affine(1.0 / tau, 0.0)?;
    Ok(candle_nn::ops::softmax(&perturbed, D::Minus1)?)
}

// ── SupernetState ───────────────────────────────────────────────────────────

/// Everything `evaluate` needs besides the weights.
#[derive(Debug, Clone, Default)]
pub struct SupernetState {
    pub forward: ForwardState,
    pub architecture: Option<Architecture>,
    pub arch_param: Option<ArchitectureParameter>,
}

impl SupernetState {
    /// `single` mode with `architecture` active.
    pub fn single(architecture: Architecture) -> Self {
        Self {
            forward: ForwardState::Single,
            architecture: Some(architecture),
            arch_param: None,
        }
    }

    /// A differentiable mode reading `arch_param`.
    pub fn relaxed(forward: ForwardState, arch_param: ArchitectureParameter) -> Self {
        Self {
            forward,
            architecture: None,
            arch_param: Some(arch_param),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
