//! Momentum contrast (MoCo v1/v2).
//!
//! A training step on two augmented views `a` and `b`:
//!
//! 1. momentum update of the key encoder
//! 2. `q1 = query(a)`, `k2 = unshuffle(key(shuffle(b)))`, and symmetrically `q2`, `k1`
//! 3. `loss = L(q1, k2) + L(q2, k1)`, each an InfoNCE loss against the queue
//! 4. enqueue `cat([k1, k2])`, evicting the oldest keys
//!
//! The caller back-propagates the returned loss and steps an optimizer over
//! [`Moco::trainable_vars`], which holds query parameters only.

pub mod dual;
pub mod queue;
pub mod shuffle;

use std::collections::BTreeSet;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{load_strict, load_tensors, save_tensors};
use crate::error::{CvrlError, CvrlResult};
use crate::loss::moco_loss;
use crate::models::{Arch, BackboneConfig, ModelKind};

pub use dual::DualEncoder;
pub use queue::NegativeQueue;
pub use shuffle::{BatchShuffle, Unshuffle};

const QUEUE_NAME: &str = "queue";
const QUEUE_PTR_NAME: &str = "queue_ptr";

fn map_candle(e: candle_core::Error) -> CvrlError {
    CvrlError::tensor("MoCo", e)
}

/// Construction parameters of a [`Moco`] model. Fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MocoConfig {
    pub kind: ModelKind,
    pub backbone: BackboneConfig,
    /// Embedding dimensionality.
    pub dim: usize,
    /// Number of negative keys kept in the queue (K).
    pub queue_size: usize,
    /// Momentum of the key encoder update (m).
    pub momentum: f64,
    /// Softmax temperature (T).
    pub temperature: f64,
    /// Images per view per step. Each step enqueues `2 * batch_size` keys.
    pub batch_size: usize,
    /// Seed of the batch-shuffle generator.
    pub seed: u64,
}

impl MocoConfig {
    /// Defaults for `kind`: dim 128, K 4096, m 0.99, T 0.1, batch 256.
    pub fn new(kind: ModelKind) -> Self {
        let arch = if kind.is_moco() {
            kind.default_arch()
        } else {
            Arch::ResNet18
        };
        Self {
            kind,
            backbone: BackboneConfig::new(arch).with_bn_splits(kind.default_bn_splits()),
            dim: 128,
            queue_size: 4096,
            momentum: 0.99,
            temperature: 0.1,
            batch_size: 256,
            seed: 42,
        }
    }

    /// Check every invariant that must hold before any tensor is allocated.
    pub fn validate(&self) -> CvrlResult<()> {
        if !self.kind.is_moco() {
            return Err(CvrlError::InvalidHyperparameter {
                name: "model",
                value: self.kind.to_string(),
                reason: "momentum contrast requires mocov1 or mocov2".to_string(),
            });
        }
        if self.dim == 0 {
            return Err(CvrlError::InvalidHyperparameter {
                name: "dim",
                value: self.dim.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.queue_size == 0 {
            return Err(CvrlError::InvalidHyperparameter {
                name: "queue_size",
                value: self.queue_size.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !(self.momentum > 0.0 && self.momentum < 1.0) {
            return Err(CvrlError::InvalidHyperparameter {
                name: "momentum",
                value: self.momentum.to_string(),
                reason: "must lie strictly between 0 and 1".to_string(),
            });
        }
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(CvrlError::InvalidHyperparameter {
                name: "temperature",
                value: self.temperature.to_string(),
                reason: "must be a positive finite number".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(CvrlError::InvalidHyperparameter {
                name: "batch_size",
                value: self.batch_size.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.queue_size % (2 * self.batch_size) != 0 {
            return Err(CvrlError::QueueCapacity {
                capacity: self.queue_size,
                batch: 2 * self.batch_size,
            });
        }
        let splits = self.backbone.bn_splits.max(1);
        if self.batch_size % splits != 0 {
            return Err(CvrlError::InvalidHyperparameter {
                name: "bn_splits",
                value: splits.to_string(),
                reason: format!("must divide batch_size {}", self.batch_size),
            });
        }
        Ok(())
    }
}

/// Loss of one query/key pairing with the embeddings that produced it.
#[derive(Debug, Clone)]
pub struct ContrastiveOutput {
    /// Scalar InfoNCE loss, attached to the query graph.
    pub loss: Tensor,
    /// Query embeddings `(N, dim)`.
    pub q: Tensor,
    /// Detached key embeddings `(N, dim)` in the original batch order.
    pub k: Tensor,
}

/// MoCo model: dual encoder, negative queue and batch shuffler.
pub struct Moco {
    config: MocoConfig,
    encoders: DualEncoder,
    queue: NegativeQueue,
    shuffle: BatchShuffle,
    device: Device,
}

impl Moco {
    pub fn new(config: MocoConfig, device: &Device) -> CvrlResult<Self> {
        config.validate()?;
        let encoders = DualEncoder::new(config.kind, config.backbone, config.dim, config.momentum, device)?;
        let queue = NegativeQueue::new(config.dim, config.queue_size, 2 * config.batch_size, device)?;

        info!(
            "Built {} ({}, width {}, bn_splits {}): dim={}, K={}, m={}, T={}",
            config.kind,
            config.backbone.arch,
            config.backbone.base_width,
            config.backbone.bn_splits,
            config.dim,
            config.queue_size,
            config.momentum,
            config.temperature
        );

        Ok(Self {
            config,
            encoders,
            queue,
            shuffle: BatchShuffle::new(config.seed),
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &MocoConfig {
        &self.config
    }

    pub fn encoders(&self) -> &DualEncoder {
        &self.encoders
    }

    pub fn queue(&self) -> &NegativeQueue {
        &self.queue
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Query parameters for the optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.encoders.trainable_vars()
    }

    /// InfoNCE loss of queries from `im_q` against keys from `im_k` and the queue.
    ///
    /// Keys are computed on a shuffled batch and restored to the input order.
    pub fn contrastive_loss(&mut self, im_q: &Tensor, im_k: &Tensor) -> CvrlResult<ContrastiveOutput> {
        let q = self.encoders.forward_query(im_q)?;

        let (shuffled, unshuffle) = self.shuffle.shuffle(im_k)?;
        let k = self.encoders.forward_key(&shuffled)?;
        let k = unshuffle.apply(&k)?;

        let loss = moco_loss(&q, &k, &self.queue.snapshot(), self.config.temperature)?;
        Ok(ContrastiveOutput { loss, q, k })
    }

    /// Symmetric training step. Updates the key encoder and the queue.
    ///
    /// Returns the scalar loss `L(q1, k2) + L(q2, k1)`, still attached to the
    /// query encoder's graph.
    pub fn step(&mut self, view_a: &Tensor, view_b: &Tensor) -> CvrlResult<Tensor> {
        if view_a.dims() != view_b.dims() {
            return Err(CvrlError::ShapeMismatch {
                context: "moco step views".to_string(),
                expected: view_a.dims().to_vec(),
                actual: view_b.dims().to_vec(),
            });
        }
        let n = view_a.dim(0).map_err(map_candle)?;
        if n == 0 {
            return Err(CvrlError::EmptyBatch {
                context: "moco step".to_string(),
            });
        }
        self.queue.check_batch(2 * n)?;

        self.encoders.momentum_update()?;

        let first = self.contrastive_loss(view_a, view_b)?;
        let second = self.contrastive_loss(view_b, view_a)?;
        let loss = (&first.loss + &second.loss).map_err(map_candle)?;

        // first.k came from view_b (k2), second.k from view_a (k1).
        let keys = Tensor::cat(&[&second.k, &first.k], 0).map_err(map_candle)?;
        self.queue.enqueue(&keys)?;

        debug!("MoCo step: n={}, queue_ptr={}", n, self.queue.ptr());
        Ok(loss)
    }

    /// Persist both encoders, the queue and its pointer.
    pub fn save(&self, path: &Path) -> CvrlResult<()> {
        let mut tensors: Vec<(String, Tensor)> = self
            .encoders
            .checkpoint_vars()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        tensors.push((QUEUE_NAME.to_string(), self.queue.snapshot()));
        let ptr = Tensor::new(&[self.queue.ptr() as i64], &self.device).map_err(map_candle)?;
        tensors.push((QUEUE_PTR_NAME.to_string(), ptr));
        save_tensors(path, &tensors)
    }

    /// Restore a checkpoint written by [`Moco::save`] for the same configuration.
    ///
    /// Every name and shape must match in both directions. On error nothing
    /// is modified.
    pub fn load_strict(&mut self, path: &Path) -> CvrlResult<()> {
        let mut tensors = load_tensors(path, &self.device)?;
        let targets = self.encoders.checkpoint_vars();

        let mut expected: BTreeSet<String> = targets.iter().map(|(name, _)| name.clone()).collect();
        expected.insert(QUEUE_NAME.to_string());
        expected.insert(QUEUE_PTR_NAME.to_string());
        let missing: Vec<String> = expected
            .iter()
            .filter(|name| !tensors.contains_key(name.as_str()))
            .cloned()
            .collect();
        let unexpected: Vec<String> = tensors
            .keys()
            .filter(|name| !expected.contains(name.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(CvrlError::CheckpointMismatch { missing, unexpected });
        }

        let queue_buffer = tensors
            .remove(QUEUE_NAME)
            .ok_or_else(|| CvrlError::Internal {
                message: "queue vanished after name check".to_string(),
            })?;
        let ptr_tensor = tensors
            .remove(QUEUE_PTR_NAME)
            .ok_or_else(|| CvrlError::Internal {
                message: "queue_ptr vanished after name check".to_string(),
            })?;
        let ptr_values: Vec<i64> = ptr_tensor
            .flatten_all()
            .and_then(|t| t.to_dtype(DType::I64))
            .and_then(|t| t.to_vec1())
            .map_err(map_candle)?;
        let ptr = match ptr_values.as_slice() {
            [value] if *value >= 0 => *value as usize,
            other => {
                return Err(CvrlError::Checkpoint {
                    message: format!("queue_ptr must be one non-negative value, got {:?}", other),
                })
            }
        };

        let mut queue = self.queue.clone();
        queue.restore(&queue_buffer, ptr)?;
        load_strict(&targets, &tensors)?;
        self.queue = queue;

        info!(
            "Restored {} from {} (queue_ptr={})",
            self.config.kind,
            path.display(),
            ptr
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config(kind: ModelKind) -> MocoConfig {
        let mut config = MocoConfig::new(kind);
        config.backbone = BackboneConfig::new(Arch::ResNet18).with_base_width(2).with_bn_splits(2);
        config.dim = 8;
        config.queue_size = 16;
        config.batch_size = 4;
        config
    }

    fn views(n: usize) -> (Tensor, Tensor) {
        let a = Tensor::randn(0f32, 1f32, (n, 3, 8, 8), &Device::Cpu).unwrap();
        let b = Tensor::randn(0f32, 1f32, (n, 3, 8, 8), &Device::Cpu).unwrap();
        (a, b)
    }

    #[test]
    fn test_default_config_is_valid() {
        MocoConfig::new(ModelKind::MocoV2).validate().unwrap();
        let config = MocoConfig::new(ModelKind::MocoV1);
        assert_eq!(config.backbone.arch, Arch::ResNet18);
        assert_eq!(config.backbone.bn_splits, 8);
    }

    #[test]
    fn test_config_rejects_indivisible_queue() {
        let mut config = tiny_config(ModelKind::MocoV1);
        config.queue_size = 20;
        assert!(matches!(
            Moco::new(config, &Device::Cpu),
            Err(CvrlError::QueueCapacity { capacity: 20, batch: 8 })
        ));
    }

    #[test]
    fn test_config_rejects_simclr_kind() {
        let config = tiny_config(ModelKind::SimClrV1);
        assert!(matches!(
            config.validate(),
            Err(CvrlError::InvalidHyperparameter { name: "model", .. })
        ));
    }

    #[test]
    fn test_config_rejects_bad_bn_splits() {
        let mut config = tiny_config(ModelKind::MocoV1);
        config.backbone = config.backbone.with_bn_splits(3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_step_advances_queue_by_two_batches() {
        let mut moco = Moco::new(tiny_config(ModelKind::MocoV2), &Device::Cpu).unwrap();
        let (a, b) = views(4);

        let loss = moco.step(&a, &b).unwrap();
        let value: f32 = loss.to_scalar().unwrap();
        assert!(value.is_finite() && value > 0.0);
        assert_eq!(moco.queue().ptr(), 8);

        moco.step(&a, &b).unwrap();
        assert_eq!(moco.queue().ptr(), 0);
    }

    #[test]
    fn test_step_rejects_batch_that_breaks_queue() {
        let mut moco = Moco::new(tiny_config(ModelKind::MocoV1), &Device::Cpu).unwrap();
        let (a, b) = views(6);
        assert!(matches!(
            moco.step(&a, &b),
            Err(CvrlError::QueueCapacity { batch: 12, .. })
        ));
        assert_eq!(moco.queue().ptr(), 0);
    }

    #[test]
    fn test_enqueued_keys_are_unit_length() {
        let mut moco = Moco::new(tiny_config(ModelKind::MocoV1), &Device::Cpu).unwrap();
        let (a, b) = views(4);
        let out = moco.contrastive_loss(&a, &b).unwrap();
        assert_eq!(out.q.dims(), &[4, 8]);
        let norms: Vec<f32> = out.k.sqr().unwrap().sum(1).unwrap().to_vec1().unwrap();
        assert!(norms.iter().all(|n| (n - 1.0).abs() < 1e-4));
    }
}
