//! Standalone network for one searched architecture.
//!
//! Same macro layout as the [`Supernet`](crate::Supernet), but every
//! searchable stage holds only the chosen candidate. Weights are fresh; the
//! child is trained from scratch to measure what the architecture is worth
//! outside weight sharing.

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Linear, VarBuilder, VarMap};

use supernet_common::{NasError, Result, SearchSpaceConfig};

use crate::architecture::Architecture;
use crate::block::{fixed_layers, Block};
use crate::supernet::{classify, Classifier};

pub struct ChildNet {
    first: Vec<Block>,
    stages: Vec<Block>,
    last: Vec<Block>,
    classifier: Linear,
    architecture: Architecture,
    device: Device,
}

impl ChildNet {
    /// Build the child of `architecture` with weights under `vb`. Parameter
    /// names follow the supernet's, minus the choice index
    /// (`search.{stage}` instead of `search.{stage}.{choice}`).
    pub fn new(space: &SearchSpaceConfig, architecture: &Architecture, vb: VarBuilder) -> Result<Self> {
        space.validate()?;
        architecture.validate(space.num_stages(), space.num_choices())?;
        let macro_config = &space.macro_config;

        let first = fixed_layers(&macro_config.first, vb.pp("first"))?;
        let mut stages = Vec::with_capacity(architecture.len());
        for (i, (stage, &choice)) in macro_config.search.iter().zip(architecture.iter()).enumerate() {
            let spec = space
                .micro_config
                .get(choice)
                .ok_or_else(|| NasError::config(format!("stage {i}: choice {choice} out of range")))?;
            stages.push(Block::new(
                spec,
                stage.in_channels,
                stage.out_channels,
                stage.stride,
                vb.pp(format!("search.{i}")),
            )?);
        }
        let last = fixed_layers(&macro_config.last, vb.pp("last"))?;
        let classifier = linear(space.feature_channels(), space.classes, vb.pp("classifier"))?;

        tracing::debug!(architecture = %architecture, "Child network built");
        Ok(Self {
            first,
            stages,
            last,
            classifier,
            architecture: architecture.clone(),
            device: vb.device().clone(),
        })
    }

    /// Build the child with its own [`VarMap`], returned alongside for the
    /// optimiser.
    pub fn with_varmap(
        space: &SearchSpaceConfig,
        architecture: &Architecture,
        device: &Device,
    ) -> Result<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let child = Self::new(space, architecture, vb)?;
        Ok((child, varmap))
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for block in self.first.iter().chain(&self.stages).chain(&self.last) {
            x = block.forward(&x)?;
        }
        classify(&x, &self.classifier)
    }
}

impl Classifier for ChildNet {
    fn logits(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
