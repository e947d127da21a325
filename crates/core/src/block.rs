//! Candidate operations.
//!
//! [`Block::new`] is the registry: a closed `match` over [`BlockType`]
//! resolved once when the supernet is built. Forward passes dispatch on the
//! enum variant, never on strings.
//!
//! | Block | Structure |
//! |-------|-----------|
//! | `Conv`   | `k×k` conv → activation → optional SE |
//! | `Mobile` | 1×1 expand → act → depthwise `k×k` → act → optional SE → 1×1 project (+ residual) |
//! | `Skip`   | identity, or strided 1×1 projection when the shape changes |

use candle_core::{Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};

use supernet_common::{Activation, BlockSpec, BlockType, LayerConfig};

/// Reduced width inside squeeze-and-excite.
pub fn se_channels(channels: usize) -> usize {
    (channels / 4).max(1)
}

/// Spatial size after a padded (`k / 2`) convolution with `stride`.
pub fn conv_output_size(size: usize, stride: usize) -> usize {
    (size - 1) / stride + 1
}

// ── Activations ─────────────────────────────────────────────────────────────

fn hard_sigmoid(x: &Tensor) -> Result<Tensor> {
    x.affine(1.0, 3.0)?.clamp(0f32, 6f32)?.affine(1.0 / 6.0, 0.0)
}

pub fn activate(x: &Tensor, activation: Activation) -> Result<Tensor> {
    match activation {
        Activation::Relu => x.relu(),
        Activation::Relu6 => x.clamp(0f32, 6f32),
        Activation::Swish => x.silu(),
        Activation::Hswish => x.mul(&hard_sigmoid(x)?),
    }
}

fn padded(kernel_size: usize, stride: usize, groups: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding: kernel_size / 2,
        stride,
        groups,
        ..Default::default()
    }
}

// ── Squeeze-and-excite ──────────────────────────────────────────────────────

pub struct SqueezeExcite {
    reduce: Conv2d,
    expand: Conv2d,
}

impl SqueezeExcite {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = se_channels(channels);
        let reduce = conv2d(channels, hidden, 1, Conv2dConfig::default(), vb.pp("reduce"))?;
        let expand = conv2d(hidden, channels, 1, Conv2dConfig::default(), vb.pp("expand"))?;
        Ok(Self { reduce, expand })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let s = x.mean_keepdim(3)?.mean_keepdim(2)?;
        let s = self.reduce.forward(&s)?.relu()?;
        let s = hard_sigmoid(&self.expand.forward(&s)?)?;
        x.broadcast_mul(&s)
    }
}

// ── Blocks ──────────────────────────────────────────────────────────────────

pub struct ConvBlock {
    conv: Conv2d,
    activation: Activation,
    se: Option<SqueezeExcite>,
}

impl ConvBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = activate(&self.conv.forward(x)?, self.activation)?;
        match &self.se {
            Some(se) => se.forward(&x),
            None => Ok(x),
        }
    }
}

pub struct MobileBlock {
    expand: Option<Conv2d>,
    depthwise: Conv2d,
    se: Option<SqueezeExcite>,
    project: Conv2d,
    activation: Activation,
    residual: bool,
}

impl MobileBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = match &self.expand {
            Some(expand) => activate(&expand.forward(x)?, self.activation)?,
            None => x.clone(),
        };
        h = activate(&self.depthwise.forward(&h)?, self.activation)?;
        if let Some(se) = &self.se {
            h = se.forward(&h)?;
        }
        let out = self.project.forward(&h)?;
        if self.residual {
            out + x
        } else {
            Ok(out)
        }
    }
}

pub struct SkipBlock {
    projection: Option<Conv2d>,
}

impl SkipBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.projection {
            Some(p) => p.forward(x),
            None => Ok(x.clone()),
        }
    }
}

/// One executable candidate operation.
pub enum Block {
    Conv(ConvBlock),
    Mobile(MobileBlock),
    Skip(SkipBlock),
}

impl Block {
    /// Build the operation described by `spec`. `vb` should be scoped to the
    /// block prefix (e.g. `vb.pp("search.2.1")`).
    pub fn new(
        spec: &BlockSpec,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let k = spec.kernel_size;
        match spec.block_type {
            BlockType::Conv => {
                let conv = conv2d(in_channels, out_channels, k, padded(k, stride, 1), vb.pp("conv"))?;
                let se = if spec.se {
                    Some(SqueezeExcite::new(out_channels, vb.pp("se"))?)
                } else {
                    None
                };
                Ok(Self::Conv(ConvBlock {
                    conv,
                    activation: spec.activation,
                    se,
                }))
            }
            BlockType::Mobile => {
                let hidden = in_channels * spec.expansion_rate;
                let expand = if spec.expansion_rate != 1 {
                    Some(conv2d(in_channels, hidden, 1, Conv2dConfig::default(), vb.pp("expand"))?)
                } else {
                    None
                };
                let depthwise = conv2d(hidden, hidden, k, padded(k, stride, hidden), vb.pp("depthwise"))?;
                let se = if spec.se {
                    Some(SqueezeExcite::new(hidden, vb.pp("se"))?)
                } else {
                    None
                };
                let project = conv2d(hidden, out_channels, 1, Conv2dConfig::default(), vb.pp("project"))?;
                Ok(Self::Mobile(MobileBlock {
                    expand,
                    depthwise,
                    se,
                    project,
                    activation: spec.activation,
                    residual: stride == 1 && in_channels == out_channels,
                }))
            }
            BlockType::Skip => {
                let projection = if stride != 1 || in_channels != out_channels {
                    Some(conv2d(in_channels, out_channels, 1, padded(1, stride, 1), vb.pp("projection"))?)
                } else {
                    None
                };
                Ok(Self::Skip(SkipBlock { projection }))
            }
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Conv(b) => b.forward(x),
            Self::Mobile(b) => b.forward(x),
            Self::Skip(b) => b.forward(x),
        }
    }
}

/// Build the fixed `first` / `last` layers of the macro config; layer `i`
/// lives under `vb.pp(i)`.
pub fn fixed_layers(layers: &[LayerConfig], vb: VarBuilder) -> Result<Vec<Block>> {
    layers
        .iter()
        .enumerate()
        .map(|(i, l)| Block::new(&l.block, l.in_channels, l.out_channels, l.stride, vb.pp(i.to_string())))
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────
