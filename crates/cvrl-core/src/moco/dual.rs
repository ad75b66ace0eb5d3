//! Query/key encoder pair with the momentum update.
//!
//! The query encoder is trained by the optimizer. The key encoder starts as an
//! exact copy and afterwards only follows the query through an exponential
//! moving average:
//!
//! `key <- key * m + query * (1 - m)`
//!
//! Batch-norm running statistics are excluded from the average. Each encoder
//! keeps the statistics of its own forward passes.

use candle_core::{DType, Device, ModuleT, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::debug;

use crate::checkpoint::named_vars;
use crate::error::{CvrlError, CvrlResult};
use crate::models::{is_buffer, BackboneConfig, MocoEncoder, ModelKind};

fn map_candle(e: candle_core::Error) -> CvrlError {
    CvrlError::tensor("Dual encoder", e)
}

/// Query parameter and the key parameter that tracks it.
struct ParamPair {
    query: Var,
    key: Var,
}

/// Two encoders with identical topology and a momentum-coupled key side.
pub struct DualEncoder {
    query_vars: VarMap,
    key_vars: VarMap,
    encoder_q: MocoEncoder,
    encoder_k: MocoEncoder,
    pairs: Vec<ParamPair>,
    momentum: f64,
}

impl DualEncoder {
    /// Build both encoders and copy every query value into the key encoder.
    ///
    /// # Errors
    /// - `InvalidHyperparameter` unless `0 < momentum < 1`
    /// - `Internal` if the two encoders disagree on parameter names or shapes
    pub fn new(
        kind: ModelKind,
        backbone: BackboneConfig,
        dim: usize,
        momentum: f64,
        device: &Device,
    ) -> CvrlResult<Self> {
        if !(momentum > 0.0 && momentum < 1.0) {
            return Err(CvrlError::InvalidHyperparameter {
                name: "momentum",
                value: momentum.to_string(),
                reason: "must lie strictly between 0 and 1".to_string(),
            });
        }

        let query_vars = VarMap::new();
        let key_vars = VarMap::new();
        let encoder_q = MocoEncoder::new(
            kind,
            backbone,
            dim,
            VarBuilder::from_varmap(&query_vars, DType::F32, device),
        )
        .map_err(map_candle)?;
        let encoder_k = MocoEncoder::new(
            kind,
            backbone,
            dim,
            VarBuilder::from_varmap(&key_vars, DType::F32, device),
        )
        .map_err(map_candle)?;

        let query = named_vars(&query_vars, "");
        let key = named_vars(&key_vars, "");
        if query.len() != key.len() {
            return Err(CvrlError::Internal {
                message: format!(
                    "query encoder has {} tensors, key encoder has {}",
                    query.len(),
                    key.len()
                ),
            });
        }

        let mut pairs = Vec::new();
        for ((q_name, q_var), (k_name, k_var)) in query.into_iter().zip(key) {
            if q_name != k_name {
                return Err(CvrlError::Internal {
                    message: format!("encoder tensor names diverge: '{}' vs '{}'", q_name, k_name),
                });
            }
            if q_var.dims() != k_var.dims() {
                return Err(CvrlError::ShapeMismatch {
                    context: format!("key encoder tensor '{}'", k_name),
                    expected: q_var.dims().to_vec(),
                    actual: k_var.dims().to_vec(),
                });
            }
            k_var.set(&q_var.as_tensor().detach()).map_err(map_candle)?;
            if !is_buffer(&q_name) {
                pairs.push(ParamPair {
                    query: q_var,
                    key: k_var,
                });
            }
        }

        debug!(
            "Dual encoder ready: {} momentum-coupled parameters, m={}",
            pairs.len(),
            momentum
        );

        Ok(Self {
            query_vars,
            key_vars,
            encoder_q,
            encoder_k,
            pairs,
            momentum,
        })
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    pub fn dim(&self) -> usize {
        self.encoder_q.dim()
    }

    /// Query embeddings, attached to the autodiff graph.
    pub fn forward_query(&self, images: &Tensor) -> CvrlResult<Tensor> {
        self.encoder_q.forward_t(images, true).map_err(map_candle)
    }

    /// Key embeddings, always detached.
    pub fn forward_key(&self, images: &Tensor) -> CvrlResult<Tensor> {
        Ok(self
            .encoder_k
            .forward_t(images, true)
            .map_err(map_candle)?
            .detach())
    }

    /// Blend every query parameter into its key counterpart.
    pub fn momentum_update(&self) -> CvrlResult<()> {
        let m = self.momentum;
        for pair in &self.pairs {
            let blended = pair
                .key
                .as_tensor()
                .affine(m, 0.0)
                .map_err(map_candle)?
                .add(&pair.query.as_tensor().detach().affine(1.0 - m, 0.0).map_err(map_candle)?)
                .map_err(map_candle)?
                .detach();
            pair.key.set(&blended).map_err(map_candle)?;
        }
        Ok(())
    }

    /// Query tensors by name, buffers included.
    pub fn query_parameters(&self) -> Vec<(String, Tensor)> {
        named_vars(&self.query_vars, "")
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect()
    }

    /// Key tensors by name, buffers included.
    pub fn key_parameters(&self) -> Vec<(String, Tensor)> {
        named_vars(&self.key_vars, "")
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect()
    }

    /// Query parameters for the optimizer. Buffers and key parameters are never included.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.pairs.iter().map(|pair| pair.query.clone()).collect()
    }

    /// Every tensor of both encoders under `encoder_q.` / `encoder_k.`.
    pub(crate) fn checkpoint_vars(&self) -> Vec<(String, Var)> {
        let mut vars = named_vars(&self.query_vars, "encoder_q.");
        vars.extend(named_vars(&self.key_vars, "encoder_k."));
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Arch;

    fn tiny_pair(momentum: f64) -> DualEncoder {
        let backbone = BackboneConfig::new(Arch::ResNet18).with_base_width(2).with_bn_splits(2);
        DualEncoder::new(ModelKind::MocoV1, backbone, 8, momentum, &Device::Cpu).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_key_starts_equal_to_query() {
        let dual = tiny_pair(0.99);
        let query = dual.query_parameters();
        let key = dual.key_parameters();
        assert_eq!(query.len(), key.len());
        for ((qn, qt), (kn, kt)) in query.iter().zip(key.iter()) {
            assert_eq!(qn, kn);
            assert_eq!(values(qt), values(kt), "tensor {} differs", qn);
        }
    }

    #[test]
    fn test_trainable_vars_exclude_buffers() {
        let dual = tiny_pair(0.99);
        let total = dual.query_parameters().len();
        let buffers = dual
            .query_parameters()
            .iter()
            .filter(|(name, _)| is_buffer(name))
            .count();
        assert!(buffers > 0);
        assert_eq!(dual.trainable_vars().len(), total - buffers);
    }

    #[test]
    fn test_rejects_momentum_out_of_range() {
        let backbone = BackboneConfig::new(Arch::ResNet18).with_base_width(2);
        for m in [0.0, 1.0, -0.5, 1.5] {
            assert!(matches!(
                DualEncoder::new(ModelKind::MocoV1, backbone, 8, m, &Device::Cpu),
                Err(CvrlError::InvalidHyperparameter { name: "momentum", .. })
            ));
        }
    }

    #[test]
    fn test_momentum_update_is_exact_ema() {
        let m = 0.75;
        let dual = tiny_pair(m);

        // Move the query away from the key.
        for var in dual.trainable_vars() {
            let shifted = var.as_tensor().affine(1.0, 0.5).unwrap();
            var.set(&shifted).unwrap();
        }
        // Parameter tensors share storage with the vars, so copy values out first.
        let snapshot = |params: Vec<(String, Tensor)>| -> Vec<(String, Vec<f32>)> {
            params.iter().map(|(name, t)| (name.clone(), values(t))).collect()
        };
        let before_key = snapshot(dual.key_parameters());
        let query = snapshot(dual.query_parameters());
        dual.momentum_update().unwrap();
        let after_key = snapshot(dual.key_parameters());

        for (((name, k0), (_, q)), (_, k1)) in before_key.iter().zip(query.iter()).zip(after_key.iter()) {
            for i in 0..k0.len() {
                let expected = if is_buffer(name) {
                    k0[i]
                } else {
                    k0[i] * m as f32 + q[i] * (1.0 - m as f32)
                };
                assert!((k1[i] - expected).abs() < 1e-5, "{}[{}]: {} vs {}", name, i, k1[i], expected);
            }
        }
    }

    #[test]
    fn test_forward_key_is_detached() {
        let dual = tiny_pair(0.99);
        let images = Tensor::randn(0f32, 1f32, (4, 3, 8, 8), &Device::Cpu).unwrap();
        let q = dual.forward_query(&images).unwrap();
        let k = dual.forward_key(&images).unwrap();
        assert_eq!(q.dims(), &[4, 8]);
        assert_eq!(k.dims(), &[4, 8]);

        let loss = (q * k).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let key_vars = named_vars(&dual.key_vars, "");
        assert!(key_vars.iter().all(|(_, v)| grads.get(v.as_tensor()).is_none()));
        assert!(dual
            .trainable_vars()
            .iter()
            .any(|v| grads.get(v.as_tensor()).is_some()));
    }
}
