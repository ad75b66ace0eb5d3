//! Epoch loops for contrastive pre-training and linear evaluation.
//!
//! Both loops step the learning-rate schedule once per epoch, rewrite their
//! statistics CSV after every epoch and log progress through `tracing`.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::{named_vars, save_tensors, LoadReport};
use crate::config::{LinearEvalConfig, PretrainConfig};
use crate::data::{Cifar10, ImageLoader, Split, Transform};
use crate::error::{CvrlError, CvrlResult};
use crate::linear::LinearClassifier;
use crate::metrics::{AccuracyMeter, LinearEpochStats, PretrainEpochStats, StatsTable, TrajectoryLog};
use crate::models::{is_buffer, ModelKind, SimClr};
use crate::moco::Moco;
use crate::optim::Optimizer;

fn map_candle(e: candle_core::Error) -> CvrlError {
    CvrlError::tensor("Trainer", e)
}

/// CPU when requested or when no CUDA device is present.
pub fn select_device(force_cpu: bool) -> CvrlResult<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    Device::cuda_if_available(0).map_err(map_candle)
}

// ============================================================================
// CONTRASTIVE MODELS
// ============================================================================

/// Pre-training model for any [`ModelKind`].
pub enum ContrastiveModel {
    Moco(Moco),
    SimClr {
        model: SimClr,
        vars: VarMap,
        temperature: f64,
    },
}

impl ContrastiveModel {
    pub fn new(config: &PretrainConfig, device: &Device) -> CvrlResult<Self> {
        if config.model.is_moco() {
            return Ok(ContrastiveModel::Moco(Moco::new(config.moco_config(), device)?));
        }
        let vars = VarMap::new();
        let model = SimClr::new(
            config.model,
            config.encoder.backbone(config.model),
            config.feature_dim,
            VarBuilder::from_varmap(&vars, DType::F32, device),
        )
        .map_err(map_candle)?;
        info!(
            "Built {} ({}, width {}): dim={}, T={}",
            config.model,
            config.encoder.backbone(config.model).arch,
            config.encoder.base_width,
            config.feature_dim,
            config.temperature
        );
        Ok(ContrastiveModel::SimClr {
            model,
            vars,
            temperature: config.temperature,
        })
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            ContrastiveModel::Moco(moco) => moco.config().kind,
            ContrastiveModel::SimClr { model, .. } => model.kind(),
        }
    }

    /// One training step on two views; returns the graph-attached loss.
    pub fn step(&mut self, view_a: &Tensor, view_b: &Tensor) -> CvrlResult<Tensor> {
        match self {
            ContrastiveModel::Moco(moco) => moco.step(view_a, view_b),
            ContrastiveModel::SimClr {
                model, temperature, ..
            } => model.step(view_a, view_b, *temperature),
        }
    }

    /// Parameters the optimizer updates. Never includes key encoder or buffers.
    pub fn trainable_vars(&self) -> Vec<Var> {
        match self {
            ContrastiveModel::Moco(moco) => moco.trainable_vars(),
            ContrastiveModel::SimClr { vars, .. } => named_vars(vars, "")
                .into_iter()
                .filter(|(name, _)| !is_buffer(name))
                .map(|(_, var)| var)
                .collect(),
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.trainable_vars().iter().map(|v| v.elem_count()).sum()
    }

    pub fn save(&self, path: &std::path::Path) -> CvrlResult<()> {
        match self {
            ContrastiveModel::Moco(moco) => moco.save(path),
            ContrastiveModel::SimClr { vars, .. } => {
                let tensors: Vec<(String, Tensor)> = named_vars(vars, "")
                    .into_iter()
                    .map(|(name, var)| (name, var.as_tensor().clone()))
                    .collect();
                save_tensors(path, &tensors)
            }
        }
    }
}

// ============================================================================
// PRE-TRAINING
// ============================================================================

/// Outcome of a pre-training run.
#[derive(Debug, Clone)]
pub struct PretrainSummary {
    pub epochs: Vec<PretrainEpochStats>,
    pub checkpoint: PathBuf,
    pub statistics: PathBuf,
}

/// Pre-train on the CIFAR-10 training split found in `config.data_dir`.
pub fn pretrain(config: &PretrainConfig, device: &Device) -> CvrlResult<PretrainSummary> {
    config.validate()?;
    let train = Cifar10::load(&config.data_dir, Split::Train)?;
    pretrain_on(config, &train, device)
}

/// Pre-train on an already loaded dataset.
pub fn pretrain_on(config: &PretrainConfig, train: &Cifar10, device: &Device) -> CvrlResult<PretrainSummary> {
    config.validate()?;
    if train.len() < config.batch_size {
        return Err(CvrlError::Dataset {
            message: format!(
                "{} training images cannot fill one batch of {}",
                train.len(),
                config.batch_size
            ),
        });
    }

    let mut model = ContrastiveModel::new(config, device)?;
    let mut optimizer = config.optimizer.build(model.trainable_vars())?;
    let base_lr = config.optimizer.learning_rate;
    let transform = Transform::with_augment(config.augment);
    let mut loader = ImageLoader::new(train.len(), config.batch_size, true, true, config.seed);
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));

    let statistics = config.output_dir.join("pretrain_statistics.csv");
    let checkpoint = config.checkpoint_path();
    let mut table = StatsTable::new(&statistics);
    let mut trajectory = TrajectoryLog::open(config.output_dir.join("pretrain_trajectory.jsonl"))?;

    info!(
        "Pre-training {} for {} epochs: {} images, {} batches/epoch, {} trainable parameters",
        config.model,
        config.epochs,
        train.len(),
        loader.num_batches(),
        model.num_parameters()
    );

    for epoch in 1..=config.epochs {
        let lr = config.optimizer.schedule.lr_at(base_lr, epoch - 1);
        optimizer.set_learning_rate(lr);
        loader.start_epoch();

        let mut total_loss = 0.0f64;
        let mut total_num = 0usize;
        while let Some(indices) = loader.next_batch() {
            let pair = train.pair_batch(&indices, &transform, &mut rng, device)?;
            let loss = model.step(&pair.view_a, &pair.view_b)?;
            optimizer.backward_step(&loss)?;

            let value: f32 = loss.to_scalar().map_err(map_candle)?;
            if !value.is_finite() {
                warn!("Non-finite loss {} at epoch {} step {}", value, epoch, optimizer.global_step());
            }
            total_loss += value as f64 * indices.len() as f64;
            total_num += indices.len();

            if optimizer.global_step() % config.log_every == 0 {
                trajectory.record(epoch, optimizer.global_step(), value as f64, lr)?;
                debug!(
                    "Train Epoch: [{}/{}] step {} loss {:.4}",
                    epoch,
                    config.epochs,
                    optimizer.global_step(),
                    value
                );
            }
        }

        let train_loss = total_loss / total_num.max(1) as f64;
        info!(
            "Train Epoch: [{}/{}] Loss: {:.4} lr: {:.6}",
            epoch, config.epochs, train_loss, lr
        );
        table.push(PretrainEpochStats {
            epoch,
            train_loss,
            lr,
        })?;
        model.save(&checkpoint)?;
    }

    Ok(PretrainSummary {
        epochs: table.rows().to_vec(),
        checkpoint,
        statistics,
    })
}

// ============================================================================
// LINEAR EVALUATION
// ============================================================================

/// Outcome of a linear evaluation run.
#[derive(Debug, Clone)]
pub struct LinearSummary {
    pub epochs: Vec<LinearEpochStats>,
    pub best_acc1: f64,
    pub best_epoch: usize,
    pub encoder_load: LoadReport,
}

/// Evaluate on the CIFAR-10 splits found in `config.data_dir`.
pub fn linear_eval(config: &LinearEvalConfig, device: &Device) -> CvrlResult<LinearSummary> {
    config.validate()?;
    let train = Cifar10::load(&config.data_dir, Split::Train)?;
    let test = Cifar10::load(&config.data_dir, Split::Test)?;
    linear_eval_on(config, &train, &test, device)
}

/// Evaluate on already loaded datasets.
pub fn linear_eval_on(
    config: &LinearEvalConfig,
    train: &Cifar10,
    test: &Cifar10,
    device: &Device,
) -> CvrlResult<LinearSummary> {
    config.validate()?;
    let mut classifier = LinearClassifier::new(config.model_name, &config.encoder, config.num_classes, device)?;
    let encoder_load = classifier.load_encoder(&config.model_path)?;
    let mut optimizer = config.optimizer.build(classifier.trainable_vars())?;
    let base_lr = config.optimizer.learning_rate;

    let train_transform = Transform::train();
    let test_transform = Transform::test();
    let mut train_loader = ImageLoader::new(train.len(), config.batch_size, true, false, config.seed);
    let mut test_loader = ImageLoader::new(test.len(), config.batch_size, false, false, config.seed);
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));

    let mut table = StatsTable::new(config.statistics_path());
    let best_path = config.best_model_path();
    let mut best_acc1 = 0.0f64;
    let mut best_epoch = 0usize;

    info!(
        "Linear evaluation of {} ({} -> {} classes) for {} epochs",
        config.model_name,
        classifier.feature_dim(),
        config.num_classes,
        config.epochs
    );

    for epoch in 1..=config.epochs {
        let lr = config.optimizer.schedule.lr_at(base_lr, epoch - 1);
        optimizer.set_learning_rate(lr);

        let train_meter = run_epoch(
            &classifier,
            train,
            &mut train_loader,
            &train_transform,
            Some(optimizer.as_mut()),
            &mut rng,
            device,
        )?;
        info!(
            "Train Epoch: [{}/{}] Loss: {:.4} ACC@1: {:.2}% ACC@5: {:.2}%",
            epoch,
            config.epochs,
            train_meter.mean_loss(),
            train_meter.acc1(),
            train_meter.acc5()
        );

        let test_meter = run_epoch(
            &classifier,
            test,
            &mut test_loader,
            &test_transform,
            None,
            &mut rng,
            device,
        )?;
        info!(
            "Test Epoch: [{}/{}] Loss: {:.4} ACC@1: {:.2}% ACC@5: {:.2}%",
            epoch,
            config.epochs,
            test_meter.mean_loss(),
            test_meter.acc1(),
            test_meter.acc5()
        );

        table.push(LinearEpochStats {
            epoch,
            train_loss: train_meter.mean_loss(),
            train_acc1: train_meter.acc1(),
            train_acc5: train_meter.acc5(),
            test_loss: test_meter.mean_loss(),
            test_acc1: test_meter.acc1(),
            test_acc5: test_meter.acc5(),
        })?;

        if test_meter.acc1() > best_acc1 {
            best_acc1 = test_meter.acc1();
            best_epoch = epoch;
            classifier.save(&best_path)?;
            info!("New best ACC@1 {:.2}% at epoch {}", best_acc1, epoch);
        }
    }

    Ok(LinearSummary {
        epochs: table.rows().to_vec(),
        best_acc1,
        best_epoch,
        encoder_load,
    })
}

/// One pass over `data`. Trains when an optimizer is given.
fn run_epoch(
    classifier: &LinearClassifier,
    data: &Cifar10,
    loader: &mut ImageLoader,
    transform: &Transform,
    mut optimizer: Option<&mut dyn Optimizer>,
    rng: &mut StdRng,
    device: &Device,
) -> CvrlResult<AccuracyMeter> {
    let mut meter = AccuracyMeter::new();
    loader.start_epoch();
    while let Some(indices) = loader.next_batch() {
        let batch = data.batch(&indices, transform, rng, device)?;
        let logits = classifier.forward(&batch.images)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels).map_err(map_candle)?;
        if let Some(optimizer) = optimizer.as_mut() {
            optimizer.backward_step(&loss)?;
        }
        let value: f32 = loss.to_scalar().map_err(map_candle)?;
        meter.update(value, &logits, &batch.labels)?;
    }
    Ok(meter)
}

// ============================================================================
// INSPECTION
// ============================================================================

/// Size and shape summary of a configured model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub model: ModelKind,
    pub arch: String,
    pub base_width: usize,
    pub bn_splits: usize,
    /// Width of the frozen feature read by linear evaluation.
    pub feature_dim: usize,
    /// Embedding width of the projection head.
    pub embedding_dim: usize,
    /// Trainable scalars of the pre-training model.
    pub pretrain_parameters: usize,
    /// Frozen scalars of the linear-evaluation encoder.
    pub encoder_parameters: usize,
}

/// Build the configured models and report their sizes.
pub fn summarize(config: &PretrainConfig, device: &Device) -> CvrlResult<ModelSummary> {
    let backbone = config.encoder.backbone(config.model);
    let model = ContrastiveModel::new(config, device)?;
    let classifier = LinearClassifier::new(config.model, &config.encoder, 1, device)?;

    Ok(ModelSummary {
        model: config.model,
        arch: backbone.arch.to_string(),
        base_width: backbone.base_width,
        bn_splits: backbone.bn_splits,
        feature_dim: config.model.feature_dim(&backbone),
        embedding_dim: config.feature_dim,
        pretrain_parameters: model.num_parameters(),
        encoder_parameters: classifier.encoder_parameters(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Arch, EncoderOptions};
    use crate::optim::{LrSchedule, OptimizerConfig};

    fn tiny_pretrain(model: ModelKind, output_dir: PathBuf) -> PretrainConfig {
        PretrainConfig {
            model,
            encoder: EncoderOptions {
                arch: Some(Arch::ResNet18),
                base_width: 2,
                bn_splits: Some(2),
            },
            feature_dim: 8,
            queue_size: 16,
            batch_size: 4,
            epochs: 2,
            log_every: 1,
            output_dir,
            ..Default::default()
        }
        .with_epochs(2)
    }

    #[test]
    fn test_pretrain_writes_statistics_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let train = Cifar10::synthetic(10, 8, &mut rng).unwrap();

        for model in [ModelKind::MocoV2, ModelKind::SimClrV1] {
            let config = tiny_pretrain(model, dir.path().join(model.as_str()));
            let summary = pretrain_on(&config, &train, &Device::Cpu).unwrap();

            assert_eq!(summary.epochs.len(), 2);
            assert!(summary.epochs.iter().all(|e| e.train_loss.is_finite() && e.train_loss > 0.0));
            assert!(summary.epochs[1].lr < summary.epochs[0].lr);
            assert!(summary.checkpoint.exists());

            let csv = std::fs::read_to_string(&summary.statistics).unwrap();
            assert!(csv.starts_with("epoch,train_loss,lr"));
            // Two batches per epoch with drop_last, one record per step.
            let trajectory =
                std::fs::read_to_string(config.output_dir.join("pretrain_trajectory.jsonl")).unwrap();
            assert_eq!(trajectory.lines().count(), 4);
        }
    }

    #[test]
    fn test_pretrain_rejects_dataset_smaller_than_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let train = Cifar10::synthetic(3, 8, &mut rng).unwrap();
        let config = tiny_pretrain(ModelKind::MocoV1, dir.path().to_path_buf());
        assert!(matches!(
            pretrain_on(&config, &train, &Device::Cpu),
            Err(CvrlError::Dataset { .. })
        ));
    }

    #[test]
    fn test_simclr_trainable_vars_exclude_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_pretrain(ModelKind::SimClrV2, dir.path().to_path_buf());
        let model = ContrastiveModel::new(&config, &Device::Cpu).unwrap();
        assert_eq!(model.kind(), ModelKind::SimClrV2);
        let ContrastiveModel::SimClr { vars, .. } = &model else {
            panic!("expected a SimCLR model");
        };
        let all = named_vars(vars, "").len();
        assert!(model.trainable_vars().len() < all);
    }

    #[test]
    fn test_linear_eval_after_pretraining() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let train = Cifar10::synthetic(12, 8, &mut rng).unwrap();
        let test = Cifar10::synthetic(6, 8, &mut rng).unwrap();

        let pretrain_config = PretrainConfig {
            epochs: 1,
            ..tiny_pretrain(ModelKind::MocoV1, dir.path().to_path_buf())
        };
        let pretrained = pretrain_on(&pretrain_config, &train, &Device::Cpu).unwrap();

        let config = LinearEvalConfig {
            model_name: ModelKind::MocoV1,
            model_path: pretrained.checkpoint,
            encoder: pretrain_config.encoder,
            batch_size: 5,
            epochs: 3,
            output_dir: dir.path().to_path_buf(),
            optimizer: OptimizerConfig {
                schedule: LrSchedule::Step {
                    step_size: 1,
                    gamma: 0.5,
                },
                ..OptimizerConfig::linear_probe()
            },
            ..Default::default()
        };
        let summary = linear_eval_on(&config, &train, &test, &Device::Cpu).unwrap();

        assert_eq!(summary.epochs.len(), 3);
        assert!(summary.encoder_load.is_complete());
        assert!(summary.encoder_load.unexpected.iter().any(|n| n.starts_with("encoder_k.")));
        for row in &summary.epochs {
            for acc in [row.train_acc1, row.train_acc5, row.test_acc1, row.test_acc5] {
                assert!((0.0..=100.0).contains(&acc));
            }
        }
        assert!(config.statistics_path().exists());
        if summary.best_epoch > 0 {
            assert!(config.best_model_path().exists());
        }
    }

    #[test]
    fn test_summarize_reports_feature_width() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_pretrain(ModelKind::SimClrV2, dir.path().to_path_buf());
        let summary = summarize(&config, &Device::Cpu).unwrap();
        assert_eq!(summary.feature_dim, 1024);
        assert_eq!(summary.arch, "resnet18");
        assert!(summary.pretrain_parameters > summary.encoder_parameters);
    }
}
