//! Encoder networks and the model-variant selector.
//!
//! Every variant is a ResNet backbone `f` followed by a projection head:
//!
//! - `mocov1` / `mocov2`: [`MocoEncoder`], used twice (query and key) by
//!   [`crate::moco::Moco`].
//! - `simclrv1` / `simclrv2`: [`SimClr`], a single encoder trained with NT-Xent.
//!
//! Linear evaluation only needs the frozen part of each variant, which
//! [`build_feature_encoder`] returns as a [`FeatureEncoder`] trait object.

pub mod encoder;
pub mod norm;
pub mod projection;
pub mod resnet;
pub mod simclr;

use std::fmt;
use std::str::FromStr;

use candle_core::{Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::error::CvrlError;

pub use encoder::MocoEncoder;
pub use projection::{l2_normalize, HiddenLayer, ProjectionHead};
pub use resnet::{Arch, BackboneConfig, ResNetBackbone};
pub use simclr::{SimClr, SimClrV2Features};

/// Width of the SimCLR v2 hidden layer `g1`, which linear evaluation reads.
pub const SIMCLR_V2_HIDDEN: usize = 1024;

/// Width of the MoCo v2 projection hidden layer.
pub const MOCO_V2_HIDDEN: usize = 1024;

/// Width of the last hidden layer of both SimCLR heads.
pub const SIMCLR_HIDDEN: usize = 512;

/// Frozen feature extractor used by linear evaluation.
pub trait FeatureEncoder: Send + Sync {
    /// Width of the flat feature vector produced per image.
    fn feature_dim(&self) -> usize;

    /// Map `(N, 3, H, W)` images to `(N, feature_dim)` features.
    fn encode(&self, images: &Tensor, train: bool) -> Result<Tensor>;
}

/// Supported contrastive model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "mocov1")]
    MocoV1,
    #[serde(rename = "mocov2")]
    MocoV2,
    #[serde(rename = "simclrv1")]
    SimClrV1,
    #[serde(rename = "simclrv2")]
    SimClrV2,
}

impl ModelKind {
    pub fn all() -> &'static [ModelKind] {
        &[
            ModelKind::MocoV1,
            ModelKind::MocoV2,
            ModelKind::SimClrV1,
            ModelKind::SimClrV2,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::MocoV1 => "mocov1",
            ModelKind::MocoV2 => "mocov2",
            ModelKind::SimClrV1 => "simclrv1",
            ModelKind::SimClrV2 => "simclrv2",
        }
    }

    /// True for the momentum-contrast variants.
    pub fn is_moco(&self) -> bool {
        matches!(self, ModelKind::MocoV1 | ModelKind::MocoV2)
    }

    /// Backbone used when the configuration does not name one.
    pub fn default_arch(&self) -> Arch {
        if self.is_moco() {
            Arch::ResNet18
        } else {
            Arch::ResNet50
        }
    }

    /// Batch-norm split factor used when the configuration does not name one.
    pub fn default_bn_splits(&self) -> usize {
        if self.is_moco() {
            8
        } else {
            1
        }
    }

    /// Width of the features linear evaluation trains on.
    ///
    /// At the default backbones and width: 512, 512, 2048 and 1024.
    pub fn feature_dim(&self, backbone: &BackboneConfig) -> usize {
        match self {
            ModelKind::SimClrV2 => SIMCLR_V2_HIDDEN,
            _ => backbone.feature_dim(),
        }
    }

    /// Name prefix of the frozen encoder sub-tree inside a pre-training checkpoint.
    pub fn checkpoint_prefix(&self) -> &'static str {
        if self.is_moco() {
            "encoder_q."
        } else {
            ""
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = CvrlError;

    /// Accepts exactly `mocov1`, `mocov2`, `simclrv1` or `simclrv2`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ModelKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CvrlError::UnknownModel {
                name: s.to_string(),
            })
    }
}

/// Backbone options shared by pre-training and linear evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderOptions {
    /// Backbone depth; the variant default when `None`.
    pub arch: Option<Arch>,
    /// Stem width of the backbone.
    pub base_width: usize,
    /// Batch-norm split factor; the variant default when `None`.
    pub bn_splits: Option<usize>,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            arch: None,
            base_width: 64,
            bn_splits: None,
        }
    }
}

impl EncoderOptions {
    /// Resolve variant defaults into a concrete backbone configuration.
    pub fn backbone(&self, kind: ModelKind) -> BackboneConfig {
        BackboneConfig::new(self.arch.unwrap_or_else(|| kind.default_arch()))
            .with_base_width(self.base_width)
            .with_bn_splits(self.bn_splits.unwrap_or_else(|| kind.default_bn_splits()))
    }
}

/// Build the frozen part of a variant under `vb`.
///
/// MoCo and SimCLR v1 yield the backbone `f`; SimCLR v2 yields `f` followed by
/// the hidden layer `g1`. Parameter names match the pre-training model once the
/// variant's [`ModelKind::checkpoint_prefix`] is stripped.
pub fn build_feature_encoder(
    kind: ModelKind,
    options: &EncoderOptions,
    vb: VarBuilder,
) -> Result<Box<dyn FeatureEncoder>> {
    let backbone = options.backbone(kind);
    match kind {
        ModelKind::SimClrV2 => Ok(Box::new(SimClrV2Features::new(backbone, vb)?)),
        _ => Ok(Box::new(ResNetBackbone::new(backbone, vb.pp("f"))?)),
    }
}

/// True for batch-norm running statistics, which are state rather than
/// trainable parameters.
pub fn is_buffer(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

/// Number of trainable scalars in a var map.
pub fn count_parameters(varmap: &VarMap) -> usize {
    let data = varmap.data().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    data.iter()
        .filter(|(name, _)| !is_buffer(name))
        .map(|(_, var)| var.elem_count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_model_kind_parse() {
        assert_eq!("mocov1".parse::<ModelKind>().unwrap(), ModelKind::MocoV1);
        assert_eq!("mocov2".parse::<ModelKind>().unwrap(), ModelKind::MocoV2);
        assert_eq!("simclrv1".parse::<ModelKind>().unwrap(), ModelKind::SimClrV1);
        assert_eq!("simclrv2".parse::<ModelKind>().unwrap(), ModelKind::SimClrV2);
    }

    #[test]
    fn test_model_kind_parse_is_exact() {
        for tag in ["MoCo-v2", "simclr_v2", "MOCOV1", " mocov1", "moco-v1"] {
            assert!(
                matches!(tag.parse::<ModelKind>(), Err(CvrlError::UnknownModel { .. })),
                "{:?} should be rejected",
                tag
            );
        }
    }

    #[test]
    fn test_unknown_model_rejected() {
        let err = "byol".parse::<ModelKind>().unwrap_err();
        assert!(matches!(err, CvrlError::UnknownModel { ref name } if name == "byol"));
    }

    #[test]
    fn test_feature_dims_at_defaults() {
        let options = EncoderOptions::default();
        let dims: Vec<usize> = ModelKind::all()
            .iter()
            .map(|k| k.feature_dim(&options.backbone(*k)))
            .collect();
        assert_eq!(dims, vec![512, 512, 2048, 1024]);
    }

    #[test]
    fn test_checkpoint_prefix() {
        assert_eq!(ModelKind::MocoV2.checkpoint_prefix(), "encoder_q.");
        assert_eq!(ModelKind::SimClrV1.checkpoint_prefix(), "");
    }

    #[test]
    fn test_serde_tags() {
        let json = serde_json::to_string(&ModelKind::SimClrV1).unwrap();
        assert_eq!(json, "\"simclrv1\"");
        let kind: ModelKind = serde_json::from_str("\"mocov2\"").unwrap();
        assert_eq!(kind, ModelKind::MocoV2);
    }

    #[test]
    fn test_build_feature_encoder_dims() {
        let options = EncoderOptions {
            arch: Some(Arch::ResNet18),
            base_width: 4,
            bn_splits: Some(1),
        };
        let images = Tensor::randn(0f32, 1f32, (2, 3, 8, 8), &Device::Cpu).unwrap();
        for kind in ModelKind::all() {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let encoder = build_feature_encoder(*kind, &options, vb).unwrap();
            let features = encoder.encode(&images, false).unwrap();
            assert_eq!(features.dims(), &[2, encoder.feature_dim()]);
            assert_eq!(encoder.feature_dim(), kind.feature_dim(&options.backbone(*kind)));
        }
    }

    #[test]
    fn test_count_parameters_skips_buffers() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        norm::batch_norm_1d(8, vb.pp("bn")).unwrap();
        // weight + bias, not running_mean/running_var
        assert_eq!(count_parameters(&varmap), 16);
        assert!(is_buffer("f.bn1.running_var"));
        assert!(!is_buffer("f.bn1.weight"));
    }
}
