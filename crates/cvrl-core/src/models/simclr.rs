//! SimCLR encoders.
//!
//! Both versions return the normalized backbone feature together with the
//! normalized projection. Linear evaluation of v2 reads `f -> g1` through
//! [`SimClrV2Features`].

use candle_core::{bail, ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use super::projection::{l2_normalize, HiddenLayer, ProjectionHead, HIDDEN_DROPOUT};
use super::resnet::{BackboneConfig, ResNetBackbone};
use super::{FeatureEncoder, ModelKind, SIMCLR_HIDDEN, SIMCLR_V2_HIDDEN};
use crate::error::{CvrlError, CvrlResult};
use crate::loss::nt_xent_loss;

#[derive(Clone, Debug)]
enum SimClrHead {
    V1 {
        g: ProjectionHead,
    },
    V2 {
        g1: HiddenLayer,
        g2: ProjectionHead,
    },
}

/// Single-encoder contrastive model trained with NT-Xent.
#[derive(Clone, Debug)]
pub struct SimClr {
    f: ResNetBackbone,
    head: SimClrHead,
    kind: ModelKind,
    dim: usize,
}

impl SimClr {
    pub fn new(kind: ModelKind, backbone: BackboneConfig, dim: usize, vb: VarBuilder) -> Result<Self> {
        let feature_dim = backbone.feature_dim();
        let head = match kind {
            ModelKind::SimClrV1 => SimClrHead::V1 {
                g: ProjectionHead::mlp(feature_dim, SIMCLR_HIDDEN, dim, None, vb.pp("g"))?,
            },
            ModelKind::SimClrV2 => SimClrHead::V2 {
                g1: HiddenLayer::new(feature_dim, SIMCLR_V2_HIDDEN, Some(HIDDEN_DROPOUT), vb.pp("g1"))?,
                g2: ProjectionHead::mlp(SIMCLR_V2_HIDDEN, SIMCLR_HIDDEN, dim, None, vb.pp("g2"))?,
            },
            other => bail!("{} is not a SimCLR variant", other),
        };
        Ok(Self {
            f: ResNetBackbone::new(backbone, vb.pp("f"))?,
            head,
            kind,
            dim,
        })
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `(normalized backbone feature, normalized projection)`.
    pub fn forward(&self, images: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let feature = self.f.forward_t(images, train)?;
        let out = match &self.head {
            SimClrHead::V1 { g } => g.forward_t(&feature, train)?,
            SimClrHead::V2 { g1, g2 } => g2.forward_t(&g1.forward_t(&feature, train)?, train)?,
        };
        Ok((l2_normalize(&feature)?, l2_normalize(&out)?))
    }

    /// NT-Xent loss between the projections of two views of the same batch.
    pub fn step(&self, view_a: &Tensor, view_b: &Tensor, temperature: f64) -> CvrlResult<Tensor> {
        let (_, z1) = self
            .forward(view_a, true)
            .map_err(|e| CvrlError::tensor("SimCLR forward", e))?;
        let (_, z2) = self
            .forward(view_b, true)
            .map_err(|e| CvrlError::tensor("SimCLR forward", e))?;
        nt_xent_loss(&z1, &z2, temperature)
    }
}

/// Frozen `f -> g1` stack of SimCLR v2, as read by linear evaluation.
#[derive(Clone, Debug)]
pub struct SimClrV2Features {
    f: ResNetBackbone,
    g1: HiddenLayer,
}

impl SimClrV2Features {
    pub fn new(backbone: BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let feature_dim = backbone.feature_dim();
        Ok(Self {
            f: ResNetBackbone::new(backbone, vb.pp("f"))?,
            g1: HiddenLayer::new(feature_dim, SIMCLR_V2_HIDDEN, Some(HIDDEN_DROPOUT), vb.pp("g1"))?,
        })
    }
}

impl FeatureEncoder for SimClrV2Features {
    fn feature_dim(&self) -> usize {
        self.g1.out_dim()
    }

    fn encode(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        self.g1.forward_t(&self.f.forward_t(images, train)?, train)
    }
}
