//! CLI command handlers
//!
//! Each handler returns the process exit code: 0 on success, 1 on error.

pub mod inspect;
pub mod linear;
pub mod pretrain;

use cvrl_core::{Arch, CvrlError, EncoderOptions};
use tracing::error;

/// Backbone flags shared by every command.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct EncoderArgs {
    /// Backbone depth (resnet18, resnet34, resnet50); variant default if omitted
    #[arg(long)]
    pub arch: Option<Arch>,

    /// Stem width of the backbone
    #[arg(long)]
    pub base_width: Option<usize>,

    /// Batch-norm split factor; variant default if omitted
    #[arg(long)]
    pub bn_splits: Option<usize>,
}

impl EncoderArgs {
    /// Overlay the given flags onto `options`.
    pub fn apply(&self, options: &mut EncoderOptions) {
        if let Some(arch) = self.arch {
            options.arch = Some(arch);
        }
        if let Some(base_width) = self.base_width {
            options.base_width = base_width;
        }
        if let Some(bn_splits) = self.bn_splits {
            options.bn_splits = Some(bn_splits);
        }
    }
}

/// Log `err` and return the failure exit code.
pub fn fail(command: &str, err: CvrlError) -> i32 {
    error!("{} failed: {}", command, err);
    eprintln!("Error: {}", err);
    1
}
