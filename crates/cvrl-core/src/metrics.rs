//! Accuracy accounting and per-epoch statistics files.
//!
//! - [`AccuracyMeter`] accumulates loss and top-1/top-5 hits over an epoch
//! - [`StatsTable`] keeps every epoch row and rewrites its CSV after each push
//! - [`TrajectoryLog`] appends one JSON line per logged training step

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CvrlError, CvrlResult};

fn map_candle(e: candle_core::Error) -> CvrlError {
    CvrlError::tensor("Metrics", e)
}

/// Rows of `logits` whose true label ranks within the top `k` scores.
///
/// A label ranks `r` when exactly `r` other classes score strictly higher.
pub fn topk_correct(logits: &Tensor, labels: &Tensor, k: usize) -> CvrlResult<usize> {
    let scores: Vec<Vec<f32>> = logits.to_vec2().map_err(map_candle)?;
    let labels: Vec<u32> = labels.to_vec1().map_err(map_candle)?;
    if scores.len() != labels.len() {
        return Err(CvrlError::ShapeMismatch {
            context: "top-k labels".to_string(),
            expected: vec![scores.len()],
            actual: vec![labels.len()],
        });
    }

    let mut correct = 0;
    for (row, &label) in scores.iter().zip(labels.iter()) {
        let target = match row.get(label as usize) {
            Some(score) => *score,
            None => {
                return Err(CvrlError::ShapeMismatch {
                    context: format!("label {} out of range", label),
                    expected: vec![row.len()],
                    actual: vec![label as usize + 1],
                })
            }
        };
        let rank = row.iter().filter(|&&score| score > target).count();
        if rank < k {
            correct += 1;
        }
    }
    Ok(correct)
}

/// Running loss and accuracy totals over one pass of a data loader.
#[derive(Debug, Clone, Default)]
pub struct AccuracyMeter {
    total: usize,
    loss_sum: f64,
    correct_1: usize,
    correct_5: usize,
}

impl AccuracyMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch: its mean loss, logits `(N, classes)` and labels `(N,)`.
    pub fn update(&mut self, mean_loss: f32, logits: &Tensor, labels: &Tensor) -> CvrlResult<()> {
        let n = labels.dim(0).map_err(map_candle)?;
        self.correct_1 += topk_correct(logits, labels, 1)?;
        self.correct_5 += topk_correct(logits, labels, 5)?;
        self.loss_sum += mean_loss as f64 * n as f64;
        self.total += n;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.total
    }

    pub fn mean_loss(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.loss_sum / self.total as f64
        }
    }

    /// Top-1 accuracy in percent.
    pub fn acc1(&self) -> f64 {
        self.percent(self.correct_1)
    }

    /// Top-5 accuracy in percent.
    pub fn acc5(&self) -> f64 {
        self.percent(self.correct_5)
    }

    fn percent(&self, correct: usize) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            correct as f64 / self.total as f64 * 100.0
        }
    }
}

/// One row of the linear-evaluation statistics table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearEpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    #[serde(rename = "train_acc@1")]
    pub train_acc1: f64,
    #[serde(rename = "train_acc@5")]
    pub train_acc5: f64,
    pub test_loss: f64,
    #[serde(rename = "test_acc@1")]
    pub test_acc1: f64,
    #[serde(rename = "test_acc@5")]
    pub test_acc5: f64,
}

/// One row of the pre-training statistics table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainEpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    pub lr: f64,
}

/// Statistics table rewritten in full after every appended row.
#[derive(Debug)]
pub struct StatsTable<T> {
    path: PathBuf,
    rows: Vec<T>,
}

impl<T: Serialize> StatsTable<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rows: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    /// Append a row and rewrite the CSV file.
    pub fn push(&mut self, row: T) -> CvrlResult<()> {
        self.rows.push(row);
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_path(&self.path)?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One JSON line of the training trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub timestamp: DateTime<Utc>,
    pub epoch: usize,
    pub step: usize,
    pub loss: f64,
    pub lr: f64,
}

/// Append-only JSONL trajectory file.
pub struct TrajectoryLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TrajectoryLog {
    /// Open `path` for appending, creating it and its parent directory.
    pub fn open(path: impl Into<PathBuf>) -> CvrlResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, epoch: usize, step: usize, loss: f64, lr: f64) -> CvrlResult<()> {
        let record = TrajectoryRecord {
            timestamp: Utc::now(),
            epoch,
            step,
            loss,
            lr,
        };
        let line = serde_json::to_string(&record).map_err(|e| CvrlError::Internal {
            message: format!("Failed to serialize trajectory record: {}", e),
        })?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}
