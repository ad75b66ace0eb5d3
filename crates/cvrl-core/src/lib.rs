//! Contrastive visual representation learning on Candle.
//!
//! This crate trains image encoders without labels (MoCo v1/v2, SimCLR v1/v2)
//! and measures the learned features with a linear classifier.
//!
//! # Architecture
//!
//! - **ModelKind**: selector over the four variants
//! - **Moco**: query/key encoder pair, momentum update, negative queue and
//!   batch shuffling behind one training step
//! - **SimClr**: single encoder trained with NT-Xent
//! - **LinearClassifier**: frozen encoder plus a trainable linear layer
//! - **trainer**: epoch loops with statistics and checkpoints
//!
//! # Example
//!
//! ```rust
//! use cvrl_core::{ModelKind, MocoConfig};
//!
//! let kind: ModelKind = "mocov2".parse().unwrap();
//! let config = MocoConfig::new(kind);
//! assert_eq!(config.queue_size % (2 * config.batch_size), 0);
//! assert!("byol".parse::<ModelKind>().is_err());
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod linear;
pub mod loss;
pub mod metrics;
pub mod models;
pub mod moco;
pub mod optim;
pub mod trainer;

pub use checkpoint::LoadReport;
pub use config::{LinearEvalConfig, PretrainConfig};
pub use data::{Cifar10, ImageLoader, Split, Transform};
pub use error::{CvrlError, CvrlResult};
pub use linear::LinearClassifier;
pub use loss::{moco_logits, moco_loss, nt_xent_loss};
pub use metrics::{AccuracyMeter, LinearEpochStats, PretrainEpochStats};
pub use models::{
    build_feature_encoder, Arch, BackboneConfig, EncoderOptions, FeatureEncoder, ModelKind, SimClr,
};
pub use moco::{BatchShuffle, DualEncoder, Moco, MocoConfig, NegativeQueue, Unshuffle};
pub use optim::{LrSchedule, Optimizer, OptimizerConfig, OptimizerKind};
pub use trainer::{linear_eval, pretrain, select_device, summarize, ContrastiveModel, ModelSummary};
