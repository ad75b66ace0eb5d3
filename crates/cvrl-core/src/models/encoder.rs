//! Query/key encoder stack for the momentum-contrast variants.

use candle_core::{bail, ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use super::projection::{l2_normalize, ProjectionHead, HIDDEN_DROPOUT};
use super::resnet::{BackboneConfig, ResNetBackbone};
use super::{ModelKind, MOCO_V2_HIDDEN};

/// Backbone `f` plus projection head `g`, output L2-normalized.
#[derive(Clone, Debug)]
pub struct MocoEncoder {
    f: ResNetBackbone,
    g: ProjectionHead,
    dim: usize,
}

impl MocoEncoder {
    /// Build the encoder for `mocov1` (linear head) or `mocov2` (MLP head).
    pub fn new(kind: ModelKind, backbone: BackboneConfig, dim: usize, vb: VarBuilder) -> Result<Self> {
        let feature_dim = backbone.feature_dim();
        let g = match kind {
            ModelKind::MocoV1 => ProjectionHead::linear(feature_dim, dim, vb.pp("g"))?,
            ModelKind::MocoV2 => ProjectionHead::mlp(
                feature_dim,
                MOCO_V2_HIDDEN,
                dim,
                Some(HIDDEN_DROPOUT),
                vb.pp("g"),
            )?,
            other => bail!("{} is not a momentum-contrast variant", other),
        };
        Ok(Self {
            f: ResNetBackbone::new(backbone, vb.pp("f"))?,
            g,
            dim,
        })
    }

    /// Embedding dimensionality.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn backbone(&self) -> &ResNetBackbone {
        &self.f
    }
}

impl ModuleT for MocoEncoder {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let feature = self.f.forward_t(xs, train)?;
        l2_normalize(&self.g.forward_t(&feature, train)?)
    }
}
