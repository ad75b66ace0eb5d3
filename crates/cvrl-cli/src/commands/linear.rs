//! `cvrl linear`: linear evaluation of a frozen encoder.

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use cvrl_core::{linear_eval, select_device, CvrlResult, LinearEvalConfig, ModelKind};

use super::{fail, EncoderArgs};

/// Arguments for the linear command.
#[derive(Args, Debug)]
pub struct LinearArgs {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Variant that produced the checkpoint (mocov1, mocov2, simclrv1, simclrv2)
    #[arg(long)]
    pub model_name: Option<ModelKind>,

    /// Pre-training checkpoint
    #[arg(long)]
    pub model_path: Option<PathBuf>,

    #[command(flatten)]
    pub encoder: EncoderArgs,

    /// Number of images in each mini-batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Weight decay factor
    #[arg(long)]
    pub weight_decay: Option<f64>,

    /// Decay the learning rate every this many epochs
    #[arg(long)]
    pub step_size: Option<usize>,

    /// Learning-rate decay factor
    #[arg(long)]
    pub gamma: Option<f64>,

    /// Number of sweeps over the training set
    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Run on CPU even when CUDA is available
    #[arg(long)]
    pub cpu: bool,
}

impl LinearArgs {
    fn resolve(&self) -> CvrlResult<LinearEvalConfig> {
        let mut config = match &self.config {
            Some(path) => LinearEvalConfig::from_file(path)?,
            None => LinearEvalConfig::default(),
        }
        .with_env_overrides();

        if let Some(model) = self.model_name {
            config.model_name = model;
        }
        if let Some(path) = &self.model_path {
            config.model_path = path.clone();
        }
        self.encoder.apply(&mut config.encoder);
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(lr) = self.learning_rate {
            config.optimizer.learning_rate = lr;
        }
        if let Some(wd) = self.weight_decay {
            config.optimizer.weight_decay = wd;
        }
        if self.step_size.is_some() || self.gamma.is_some() {
            let (step_size, gamma) = match config.optimizer.schedule {
                cvrl_core::LrSchedule::Step { step_size, gamma } => (step_size, gamma),
                _ => (10, 0.5),
            };
            config = config.with_step_decay(
                self.step_size.unwrap_or(step_size),
                self.gamma.unwrap_or(gamma),
            );
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
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

/// Execute the linear command.
pub fn handle_linear(args: LinearArgs) -> i32 {
    let result = args.resolve().and_then(|config| {
        let device = select_device(args.cpu)?;
        info!(
            "Linear evaluation of {} from {} on {:?}",
            config.model_name,
            config.model_path.display(),
            device
        );
        linear_eval(&config, &device)
    });

    match result {
        Ok(summary) => {
            println!(
                "Best test ACC@1 {:.2}% at epoch {} ({} encoder tensors loaded, {} missing)",
                summary.best_acc1,
                summary.best_epoch,
                summary.encoder_load.loaded.len(),
                summary.encoder_load.missing.len()
            );
            0
        }
        Err(e) => fail("linear", e),
    }
}
