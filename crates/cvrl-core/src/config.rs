//! Run configuration for pre-training and linear evaluation.
//!
//! # Loading
//!
//! ```rust,ignore
//! use cvrl_core::config::PretrainConfig;
//!
//! let config = PretrainConfig::from_file("pretrain.toml")?.with_env_overrides();
//! config.validate()?;
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! model = "mocov2"
//! feature_dim = 128
//! queue_size = 4096
//! momentum = 0.99
//! temperature = 0.1
//! batch_size = 256
//! epochs = 200
//!
//! [encoder]
//! arch = "resnet18"
//! base_width = 64
//! bn_splits = 8
//!
//! [optimizer]
//! kind = "sgd"
//! learning_rate = 0.06
//!
//! [optimizer.schedule]
//! type = "cosine"
//! total_epochs = 200
//! min_lr = 0.0
//! ```
//!
//! Missing keys take their defaults. Invalid values are reported by
//! `validate()`, never silently replaced.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::AugmentConfig;
use crate::error::{CvrlError, CvrlResult};
use crate::moco::MocoConfig;
use crate::models::{EncoderOptions, ModelKind};
use crate::optim::{LrSchedule, OptimizerConfig};

fn default_model() -> ModelKind {
    ModelKind::MocoV1
}

fn default_feature_dim() -> usize {
    128
}

fn default_queue_size() -> usize {
    4096
}

fn default_momentum() -> f64 {
    0.99
}

fn default_temperature() -> f64 {
    0.1
}

fn default_pretrain_batch_size() -> usize {
    256
}

fn default_pretrain_epochs() -> usize {
    200
}

fn default_seed() -> u64 {
    42
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("train_log")
}

fn default_log_every() -> usize {
    10
}

fn default_pretrain_optimizer() -> OptimizerConfig {
    OptimizerConfig::pretrain(default_pretrain_epochs())
}

fn default_linear_batch_size() -> usize {
    512
}

fn default_linear_epochs() -> usize {
    100
}

fn default_num_classes() -> usize {
    10
}

fn default_linear_optimizer() -> OptimizerConfig {
    OptimizerConfig::linear_probe()
}

fn positive(name: &'static str, value: usize) -> CvrlResult<()> {
    if value == 0 {
        return Err(CvrlError::InvalidHyperparameter {
            name,
            value: value.to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(())
}

fn read_config<T: for<'de> Deserialize<'de>>(path: &Path) -> CvrlResult<T> {
    let contents = std::fs::read_to_string(path).map_err(|e| CvrlError::Config {
        message: format!("Failed to read config file '{}': {}", path.display(), e),
    })?;
    toml::from_str(&contents).map_err(|e| CvrlError::Config {
        message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
    })
}

fn parse_toml<T: for<'de> Deserialize<'de>>(toml: &str) -> CvrlResult<T> {
    toml::from_str(toml).map_err(|e| CvrlError::Config {
        message: format!("Failed to parse TOML: {}", e),
    })
}

fn write_toml<T: Serialize>(value: &T) -> CvrlResult<String> {
    toml::to_string_pretty(value).map_err(|e| CvrlError::Config {
        message: format!("Failed to serialize to TOML: {}", e),
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.parse().ok())
}

// ============================================================================
// PRE-TRAINING
// ============================================================================

/// Contrastive pre-training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainConfig {
    #[serde(default = "default_model")]
    pub model: ModelKind,

    #[serde(default)]
    pub encoder: EncoderOptions,

    /// Embedding dimensionality of the projection head.
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,

    /// Negative queue capacity (MoCo only).
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Key encoder momentum (MoCo only).
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_pretrain_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_pretrain_epochs")]
    pub epochs: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Directory holding the CIFAR-10 binary batches.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory receiving statistics, trajectory and checkpoints.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Steps between trajectory records.
    #[serde(default = "default_log_every")]
    pub log_every: usize,

    #[serde(default = "default_pretrain_optimizer")]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub augment: AugmentConfig,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            encoder: EncoderOptions::default(),
            feature_dim: default_feature_dim(),
            queue_size: default_queue_size(),
            momentum: default_momentum(),
            temperature: default_temperature(),
            batch_size: default_pretrain_batch_size(),
            epochs: default_pretrain_epochs(),
            seed: default_seed(),
            data_dir: default_data_dir(),
            output_dir: default_output_dir(),
            log_every: default_log_every(),
            optimizer: default_pretrain_optimizer(),
            augment: AugmentConfig::default(),
        }
    }
}

impl PretrainConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `CvrlError::Config` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> CvrlResult<Self> {
        read_config(path.as_ref())
    }

    pub fn from_toml_str(toml: &str) -> CvrlResult<Self> {
        parse_toml(toml)
    }

    pub fn to_toml_string(&self) -> CvrlResult<String> {
        write_toml(self)
    }

    /// Set the epoch count, stretching a cosine schedule to match.
    #[must_use]
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        if let LrSchedule::Cosine { min_lr, .. } = self.optimizer.schedule {
            self.optimizer.schedule = LrSchedule::Cosine {
                total_epochs: epochs.max(1),
                min_lr,
            };
        }
        self
    }

    /// MoCo model parameters derived from this run.
    pub fn moco_config(&self) -> MocoConfig {
        MocoConfig {
            kind: self.model,
            backbone: self.encoder.backbone(self.model),
            dim: self.feature_dim,
            queue_size: self.queue_size,
            momentum: self.momentum,
            temperature: self.temperature,
            batch_size: self.batch_size,
            seed: self.seed,
        }
    }

    /// Checkpoint written after every epoch.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_model.safetensors", self.model))
    }

    /// Validate every value; returns the first problem found.
    pub fn validate(&self) -> CvrlResult<()> {
        positive("feature_dim", self.feature_dim)?;
        positive("batch_size", self.batch_size)?;
        positive("epochs", self.epochs)?;
        positive("log_every", self.log_every)?;
        positive("base_width", self.encoder.base_width)?;
        if self.model.is_moco() {
            self.moco_config().validate()?;
        } else {
            if !(self.temperature > 0.0 && self.temperature.is_finite()) {
                return Err(CvrlError::InvalidHyperparameter {
                    name: "temperature",
                    value: self.temperature.to_string(),
                    reason: "must be a positive finite number".to_string(),
                });
            }
            let splits = self.encoder.backbone(self.model).bn_splits.max(1);
            if self.batch_size % splits != 0 {
                return Err(CvrlError::InvalidHyperparameter {
                    name: "bn_splits",
                    value: splits.to_string(),
                    reason: format!("must divide batch_size {}", self.batch_size),
                });
            }
        }
        self.optimizer.validate()
    }

    /// Apply environment variable overrides.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `CVRL_MODEL` | `model` |
    /// | `CVRL_DATA_DIR` | `data_dir` |
    /// | `CVRL_OUTPUT_DIR` | `output_dir` |
    /// | `CVRL_BATCH_SIZE` | `batch_size` |
    /// | `CVRL_EPOCHS` | `epochs` |
    /// | `CVRL_SEED` | `seed` |
    /// | `CVRL_BASE_WIDTH` | `encoder.base_width` |
    /// | `CVRL_LEARNING_RATE` | `optimizer.learning_rate` |
    /// | `CVRL_QUEUE_SIZE` | `queue_size` |
    /// | `CVRL_MOMENTUM` | `momentum` |
    /// | `CVRL_TEMPERATURE` | `temperature` |
    ///
    /// Unparseable values are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(model) = env_parse::<ModelKind>("CVRL_MODEL") {
            self.model = model;
        }
        if let Ok(val) = env::var("CVRL_DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("CVRL_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(val);
        }
        if let Some(n) = env_parse("CVRL_BATCH_SIZE") {
            self.batch_size = n;
        }
        if let Some(n) = env_parse("CVRL_EPOCHS") {
            self = self.with_epochs(n);
        }
        if let Some(n) = env_parse("CVRL_SEED") {
            self.seed = n;
        }
        if let Some(n) = env_parse("CVRL_BASE_WIDTH") {
            self.encoder.base_width = n;
        }
        if let Some(lr) = env_parse("CVRL_LEARNING_RATE") {
            self.optimizer.learning_rate = lr;
        }
        if let Some(n) = env_parse("CVRL_QUEUE_SIZE") {
            self.queue_size = n;
        }
        if let Some(m) = env_parse("CVRL_MOMENTUM") {
            self.momentum = m;
        }
        if let Some(t) = env_parse("CVRL_TEMPERATURE") {
            self.temperature = t;
        }
        self
    }
}

// ============================================================================
// LINEAR EVALUATION
// ============================================================================

/// Linear evaluation of a frozen pre-trained encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearEvalConfig {
    #[serde(default = "default_model")]
    pub model_name: ModelKind,

    /// Pre-training checkpoint holding the encoder weights.
    #[serde(default)]
    pub model_path: PathBuf,

    #[serde(default)]
    pub encoder: EncoderOptions,

    #[serde(default = "default_linear_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_linear_epochs")]
    pub epochs: usize,

    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Adam with step decay by default.
    #[serde(default = "default_linear_optimizer")]
    pub optimizer: OptimizerConfig,
}

impl Default for LinearEvalConfig {
    fn default() -> Self {
        Self {
            model_name: default_model(),
            model_path: PathBuf::new(),
            encoder: EncoderOptions::default(),
            batch_size: default_linear_batch_size(),
            epochs: default_linear_epochs(),
            num_classes: default_num_classes(),
            seed: default_seed(),
            data_dir: default_data_dir(),
            output_dir: default_output_dir(),
            optimizer: default_linear_optimizer(),
        }
    }
}

impl LinearEvalConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `CvrlError::Config` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> CvrlResult<Self> {
        read_config(path.as_ref())
    }

    pub fn from_toml_str(toml: &str) -> CvrlResult<Self> {
        parse_toml(toml)
    }

    pub fn to_toml_string(&self) -> CvrlResult<String> {
        write_toml(self)
    }

    /// Replace the step-decay parameters of the schedule.
    #[must_use]
    pub fn with_step_decay(mut self, step_size: usize, gamma: f64) -> Self {
        self.optimizer.schedule = LrSchedule::Step { step_size, gamma };
        self
    }

    pub fn statistics_path(&self) -> PathBuf {
        self.output_dir.join("linear_statistics.csv")
    }

    pub fn best_model_path(&self) -> PathBuf {
        self.output_dir.join("linear_model.safetensors")
    }

    pub fn validate(&self) -> CvrlResult<()> {
        if self.model_path.as_os_str().is_empty() {
            return Err(CvrlError::Config {
                message: "model_path must name a pre-trained checkpoint".to_string(),
            });
        }
        positive("batch_size", self.batch_size)?;
        positive("epochs", self.epochs)?;
        positive("num_classes", self.num_classes)?;
        positive("base_width", self.encoder.base_width)?;
        self.optimizer.validate()
    }

    /// Apply environment variable overrides.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `CVRL_MODEL` | `model_name` |
    /// | `CVRL_MODEL_PATH` | `model_path` |
    /// | `CVRL_DATA_DIR` | `data_dir` |
    /// | `CVRL_OUTPUT_DIR` | `output_dir` |
    /// | `CVRL_BATCH_SIZE` | `batch_size` |
    /// | `CVRL_EPOCHS` | `epochs` |
    /// | `CVRL_SEED` | `seed` |
    /// | `CVRL_BASE_WIDTH` | `encoder.base_width` |
    /// | `CVRL_LEARNING_RATE` | `optimizer.learning_rate` |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(model) = env_parse::<ModelKind>("CVRL_MODEL") {
            self.model_name = model;
        }
        if let Ok(val) = env::var("CVRL_MODEL_PATH") {
            self.model_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("CVRL_DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("CVRL_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(val);
        }
        if let Some(n) = env_parse("CVRL_BATCH_SIZE") {
            self.batch_size = n;
        }
        if let Some(n) = env_parse("CVRL_EPOCHS") {
            self.epochs = n;
        }
        if let Some(n) = env_parse("CVRL_SEED") {
            self.seed = n;
        }
        if let Some(n) = env_parse("CVRL_BASE_WIDTH") {
            self.encoder.base_width = n;
        }
        if let Some(lr) = env_parse("CVRL_LEARNING_RATE") {
            self.optimizer.learning_rate = lr;
        }
        self
    }
}
