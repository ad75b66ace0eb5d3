//! `cvrl pretrain`: contrastive pre-training.

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use cvrl_core::{pretrain, select_device, CvrlResult, ModelKind, PretrainConfig};

use super::{fail, EncoderArgs};

/// Arguments for the pretrain command.
///
/// Values are resolved as defaults, then the config file, then `CVRL_*`
/// environment variables, then these flags.
#[derive(Args, Debug)]
pub struct PretrainArgs {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Model variant (mocov1, mocov2, simclrv1, simclrv2)
    #[arg(long)]
    pub model: Option<ModelKind>,

    #[command(flatten)]
    pub encoder: EncoderArgs,

    /// Embedding dimensionality of the projection head
    #[arg(long)]
    pub feature_dim: Option<usize>,

    /// Negative queue capacity (MoCo)
    #[arg(long)]
    pub queue_size: Option<usize>,

    /// Key encoder momentum (MoCo)
    #[arg(long)]
    pub momentum: Option<f64>,

    /// Softmax temperature
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Images per view per step
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Number of sweeps over the training set
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Base learning rate
    #[arg(long)]
    pub learning_rate: Option<f64>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Directory holding the CIFAR-10 binary batches
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Directory for statistics and checkpoints
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Run on CPU even when CUDA is available
    #[arg(long)]
    pub cpu: bool,
}

impl PretrainArgs {
    fn resolve(&self) -> CvrlResult<PretrainConfig> {
        let mut config = match &self.config {
            Some(path) => PretrainConfig::from_file(path)?,
            None => PretrainConfig::default(),
        }
        .with_env_overrides();

        if let Some(model) = self.model {
            config.model = model;
        }
        self.encoder.apply(&mut config.encoder);
        if let Some(dim) = self.feature_dim {
            config.feature_dim = dim;
        }
        if let Some(queue_size) = self.queue_size {
            config.queue_size = queue_size;
        }
        if let Some(momentum) = self.momentum {
            config.momentum = momentum;
        }
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(epochs) = self.epochs {
            config = config.with_epochs(epochs);
        }
        if let Some(lr) = self.learning_rate {
            config.optimizer.learning_rate = lr;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Execute the pretrain command.
pub fn handle_pretrain(args: PretrainArgs) -> i32 {
    let result = args.resolve().and_then(|config| {
        let device = select_device(args.cpu)?;
        info!("Pre-training {} on {:?}", config.model, device);
        pretrain(&config, &device)
    });

    match result {
        Ok(summary) => {
            if let Some(last) = summary.epochs.last() {
                println!(
                    "Finished {} epochs, final loss {:.4}. Checkpoint: {}",
                    last.epoch,
                    last.train_loss,
                    summary.checkpoint.display()
                );
            }
            0
        }
        Err(e) => fail("pretrain", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: PretrainArgs,
    }

    #[test]
    fn test_flags_override_defaults() {
        let harness = Harness::parse_from([
            "cvrl",
            "--model",
            "mocov2",
            "--batch-size",
            "128",
            "--epochs",
            "50",
            "--base-width",
            "32",
            "--output-dir",
            "runs/a",
        ]);
        let config = harness.args.resolve().unwrap();
        assert_eq!(config.model, ModelKind::MocoV2);
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.epochs, 50);
        assert_eq!(config.encoder.base_width, 32);
        assert_eq!(config.output_dir, PathBuf::from("runs/a"));
    }

    #[test]
    fn test_invalid_combination_is_rejected() {
        let harness = Harness::parse_from(["cvrl", "--queue-size", "1000"]);
        assert!(harness.args.resolve().is_err());
    }
}
