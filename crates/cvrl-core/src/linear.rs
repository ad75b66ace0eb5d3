//! Linear evaluation: a trainable linear classifier on frozen features.
//!
//! The encoder is the frozen part of a pre-trained variant (see
//! [`build_feature_encoder`]). It always runs in inference mode and its
//! output is detached, so gradients reach only the `fc` layer.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{linear, Linear, VarBuilder, VarMap};
use tracing::{debug, info, warn};

use crate::checkpoint::{load_partial, load_tensors, named_vars, save_tensors, LoadReport};
use crate::error::{CvrlError, CvrlResult};
use crate::models::{build_feature_encoder, count_parameters, EncoderOptions, FeatureEncoder, ModelKind};

fn map_candle(e: candle_core::Error) -> CvrlError {
    CvrlError::tensor("Linear classifier", e)
}

/// Frozen encoder followed by `Linear(D, num_classes)`.
pub struct LinearClassifier {
    kind: ModelKind,
    encoder: Box<dyn FeatureEncoder>,
    fc: Linear,
    encoder_vars: VarMap,
    head_vars: VarMap,
    num_classes: usize,
    device: Device,
}

impl LinearClassifier {
    pub fn new(
        kind: ModelKind,
        options: &EncoderOptions,
        num_classes: usize,
        device: &Device,
    ) -> CvrlResult<Self> {
        if num_classes == 0 {
            return Err(CvrlError::InvalidHyperparameter {
                name: "num_classes",
                value: num_classes.to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let encoder_vars = VarMap::new();
        let encoder = build_feature_encoder(
            kind,
            options,
            VarBuilder::from_varmap(&encoder_vars, DType::F32, device),
        )
        .map_err(map_candle)?;

        let head_vars = VarMap::new();
        let fc = linear(
            encoder.feature_dim(),
            num_classes,
            VarBuilder::from_varmap(&head_vars, DType::F32, device).pp("fc"),
        )
        .map_err(map_candle)?;

        debug!(
            "Linear classifier for {}: {} frozen parameters, {} -> {} classes",
            kind,
            count_parameters(&encoder_vars),
            encoder.feature_dim(),
            num_classes
        );

        Ok(Self {
            kind,
            encoder,
            fc,
            encoder_vars,
            head_vars,
            num_classes,
            device: device.clone(),
        })
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Width of the frozen feature.
    pub fn feature_dim(&self) -> usize {
        self.encoder.feature_dim()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Frozen scalars of the encoder, buffers excluded.
    pub fn encoder_parameters(&self) -> usize {
        count_parameters(&self.encoder_vars)
    }

    /// Load encoder weights from a pre-training checkpoint.
    ///
    /// Stored names are matched after the variant's checkpoint prefix. Names
    /// missing on either side are reported, not rejected. A shape mismatch
    /// is an error and leaves the encoder untouched.
    pub fn load_encoder(&mut self, path: &Path) -> CvrlResult<LoadReport> {
        let tensors = load_tensors(path, &self.device)?;
        let targets = named_vars(&self.encoder_vars, "");
        let report = load_partial(&targets, &tensors, self.kind.checkpoint_prefix())?;

        info!(
            "Loaded {} encoder tensors from {} ({} missing, {} unused)",
            report.loaded.len(),
            path.display(),
            report.missing.len(),
            report.unexpected.len()
        );
        if !report.missing.is_empty() {
            warn!(
                "Encoder tensors not found in checkpoint keep their initialization: {:?}",
                report.missing
            );
        }
        Ok(report)
    }

    /// Frozen features `(N, D)`, computed in inference mode and detached.
    pub fn features(&self, images: &Tensor) -> CvrlResult<Tensor> {
        Ok(self.encoder.encode(images, false).map_err(map_candle)?.detach())
    }

    /// Class logits `(N, num_classes)`.
    pub fn forward(&self, images: &Tensor) -> CvrlResult<Tensor> {
        let features = self.features(images)?;
        self.fc.forward(&features).map_err(map_candle)
    }

    /// Parameters of the linear layer; the encoder contributes none.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.head_vars.all_vars()
    }

    /// Persist encoder and classifier together.
    pub fn save(&self, path: &Path) -> CvrlResult<()> {
        let tensors: Vec<(String, Tensor)> = named_vars(&self.encoder_vars, "")
            .into_iter()
            .chain(named_vars(&self.head_vars, ""))
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        save_tensors(path, &tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Arch;

    fn tiny_options() -> EncoderOptions {
        EncoderOptions {
            arch: Some(Arch::ResNet18),
            base_width: 2,
            bn_splits: Some(1),
        }
    }

    #[test]
    fn test_feature_width_per_variant() {
        let options = tiny_options();
        for (kind, width) in [
            (ModelKind::MocoV1, 16),
            (ModelKind::MocoV2, 16),
            (ModelKind::SimClrV1, 16),
            (ModelKind::SimClrV2, 1024),
        ] {
            let clf = LinearClassifier::new(kind, &options, 10, &Device::Cpu).unwrap();
            assert_eq!(clf.feature_dim(), width, "{}", kind);
        }
    }

    #[test]
    fn test_only_head_is_trainable() {
        let clf = LinearClassifier::new(ModelKind::MocoV1, &tiny_options(), 10, &Device::Cpu).unwrap();
        let vars = clf.trainable_vars();
        assert_eq!(vars.len(), 2);
        let scalars: usize = vars.iter().map(|v| v.elem_count()).sum();
        assert_eq!(scalars, 16 * 10 + 10);

        let images = Tensor::randn(0f32, 1f32, (3, 3, 8, 8), &Device::Cpu).unwrap();
        let logits = clf.forward(&images).unwrap();
        assert_eq!(logits.dims(), &[3, 10]);

        let grads = logits.sum_all().unwrap().backward().unwrap();
        assert!(vars.iter().all(|v| grads.get(v.as_tensor()).is_some()));
        let frozen = named_vars(&clf.encoder_vars, "");
        assert!(frozen.iter().all(|(_, v)| grads.get(v.as_tensor()).is_none()));
    }

    #[test]
    fn test_rejects_zero_classes() {
        assert!(matches!(
            LinearClassifier::new(ModelKind::SimClrV1, &tiny_options(), 0, &Device::Cpu),
            Err(CvrlError::InvalidHyperparameter { name: "num_classes", .. })
        ));
    }

    #[test]
    fn test_save_contains_encoder_and_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear_model.safetensors");
        let clf = LinearClassifier::new(ModelKind::SimClrV1, &tiny_options(), 10, &Device::Cpu).unwrap();
        clf.save(&path).unwrap();

        let stored = load_tensors(&path, &Device::Cpu).unwrap();
        assert!(stored.contains_key("fc.weight"));
        assert!(stored.contains_key("fc.bias"));
        assert!(stored.contains_key("f.conv1.weight"));
    }

    #[test]
    fn test_load_own_checkpoint_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simclr.safetensors");
        let source = LinearClassifier::new(ModelKind::SimClrV2, &tiny_options(), 10, &Device::Cpu).unwrap();
        source.save(&path).unwrap();

        let mut target = LinearClassifier::new(ModelKind::SimClrV2, &tiny_options(), 10, &Device::Cpu).unwrap();
        let report = target.load_encoder(&path).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.unexpected, vec!["fc.bias".to_string(), "fc.weight".to_string()]);
    }
}
