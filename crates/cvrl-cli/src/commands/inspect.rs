//! `cvrl inspect`: parameter counts and feature widths.

use clap::Args;
use cvrl_core::{summarize, CvrlError, CvrlResult, ModelKind, ModelSummary, PretrainConfig};

use super::{fail, EncoderArgs};

/// Arguments for the inspect command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Model variant (mocov1, mocov2, simclrv1, simclrv2)
    #[arg(long)]
    pub model_name: ModelKind,

    #[command(flatten)]
    pub encoder: EncoderArgs,

    /// Embedding dimensionality of the projection head
    #[arg(long, default_value = "128")]
    pub feature_dim: usize,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

fn run(args: &InspectArgs) -> CvrlResult<ModelSummary> {
    let mut config = PretrainConfig {
        model: args.model_name,
        feature_dim: args.feature_dim,
        ..Default::default()
    };
    args.encoder.apply(&mut config.encoder);
    summarize(&config, &candle_core::Device::Cpu)
}

fn render(summary: &ModelSummary, json: bool) -> CvrlResult<String> {
    if json {
        return serde_json::to_string_pretty(summary).map_err(|e| CvrlError::Internal {
            message: format!("Failed to serialize summary: {}", e),
        });
    }
    Ok(format!(
        "model:               {}\n\
         backbone:            {} (width {}, bn_splits {})\n\
         feature dim:         {}\n\
         embedding dim:       {}\n\
         # pretrain params:   {}\n\
         # encoder params:    {}",
        summary.model,
        summary.arch,
        summary.base_width,
        summary.bn_splits,
        summary.feature_dim,
        summary.embedding_dim,
        summary.pretrain_parameters,
        summary.encoder_parameters
    ))
}

/// Execute the inspect command.
pub fn handle_inspect(args: InspectArgs) -> i32 {
    match run(&args).and_then(|summary| render(&summary, args.json)) {
        Ok(text) => {
            println!("{}", text);
            0
        }
        Err(e) => fail("inspect", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_tiny_simclr() {
        let args = InspectArgs {
            model_name: ModelKind::SimClrV1,
            encoder: EncoderArgs {
                arch: Some(cvrl_core::Arch::ResNet18),
                base_width: Some(4),
                bn_splits: None,
            },
            feature_dim: 16,
            json: true,
        };
        let summary = run(&args).unwrap();
        assert_eq!(summary.feature_dim, 32);
        let json = render(&summary, true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["model"], "simclrv1");
        assert_eq!(value["feature_dim"], 32);
    }
}
