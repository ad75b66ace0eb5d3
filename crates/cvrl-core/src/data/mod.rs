//! CIFAR-10 loading, augmentation, and batching.
//!
//! The binary distribution stores each image as one 3073-byte record: a label
//! byte followed by 1024 red, 1024 green and 1024 blue bytes in row-major
//! order. Images are kept as raw bytes and converted to normalized `f32`
//! tensors batch by batch.

pub mod augment;
pub mod loader;

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use rand::Rng;
use tracing::info;

use crate::error::{CvrlError, CvrlResult};

pub use augment::{AugmentConfig, ColorJitter, Transform};
pub use loader::ImageLoader;

/// Side length of a CIFAR-10 image.
pub const IMAGE_SIZE: usize = 32;
/// Colour channels per image.
pub const CHANNELS: usize = 3;
/// Classes in CIFAR-10.
pub const NUM_CLASSES: usize = 10;

const RECORD_BYTES: usize = 1 + CHANNELS * IMAGE_SIZE * IMAGE_SIZE;
const BATCHES_DIR: &str = "cifar-10-batches-bin";
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";

fn map_candle(e: candle_core::Error) -> CvrlError {
    CvrlError::tensor("Data", e)
}

/// Dataset partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// Labelled images stored channel-major (`C, H, W`) as bytes.
#[derive(Debug, Clone)]
pub struct Cifar10 {
    pixels: Vec<u8>,
    labels: Vec<u8>,
    height: usize,
    width: usize,
}

/// A batch of images `(N, 3, H, W)` with `u32` labels `(N,)`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
}

/// Two independently augmented views of the same images.
#[derive(Debug, Clone)]
pub struct PairBatch {
    pub view_a: Tensor,
    pub view_b: Tensor,
    pub labels: Tensor,
}

impl Cifar10 {
    /// Read a split from `dir` or from its `cifar-10-batches-bin` subdirectory.
    pub fn load(dir: &Path, split: Split) -> CvrlResult<Self> {
        let root = resolve_root(dir)?;
        let files: Vec<&str> = match split {
            Split::Train => TRAIN_FILES.to_vec(),
            Split::Test => vec![TEST_FILE],
        };

        let mut pixels = Vec::new();
        let mut labels = Vec::new();
        for file in files {
            let path = root.join(file);
            let bytes = std::fs::read(&path).map_err(|e| CvrlError::Dataset {
                message: format!("Failed to read {}: {}", path.display(), e),
            })?;
            parse_records(&bytes, &path, &mut pixels, &mut labels)?;
        }

        info!("Loaded {:?} split: {} images from {}", split, labels.len(), root.display());
        Self::from_parts(pixels, labels, IMAGE_SIZE, IMAGE_SIZE)
    }

    /// Build a dataset from raw channel-major bytes.
    pub fn from_parts(pixels: Vec<u8>, labels: Vec<u8>, height: usize, width: usize) -> CvrlResult<Self> {
        let image_bytes = CHANNELS * height * width;
        if image_bytes == 0 || pixels.len() != labels.len() * image_bytes {
            return Err(CvrlError::Dataset {
                message: format!(
                    "{} pixel bytes do not hold {} images of {}x{}x{}",
                    pixels.len(),
                    labels.len(),
                    CHANNELS,
                    height,
                    width
                ),
            });
        }
        if let Some(bad) = labels.iter().find(|&&l| l as usize >= NUM_CLASSES) {
            return Err(CvrlError::Dataset {
                message: format!("label {} outside 0..{}", bad, NUM_CLASSES),
            });
        }
        Ok(Self {
            pixels,
            labels,
            height,
            width,
        })
    }

    /// Random images with random labels, for tests and smoke runs.
    pub fn synthetic<R: Rng>(len: usize, size: usize, rng: &mut R) -> CvrlResult<Self> {
        let pixels = (0..len * CHANNELS * size * size).map(|_| rng.gen()).collect();
        let labels = (0..len).map(|_| rng.gen_range(0..NUM_CLASSES as u8)).collect();
        Self::from_parts(pixels, labels, size, size)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn label(&self, index: usize) -> u8 {
        self.labels[index]
    }

    /// Raw `C, H, W` bytes of one image.
    pub fn image(&self, index: usize) -> &[u8] {
        let size = CHANNELS * self.height * self.width;
        &self.pixels[index * size..(index + 1) * size]
    }

    /// Transform the images at `indices` into one batch.
    pub fn batch<R: Rng>(
        &self,
        indices: &[usize],
        transform: &Transform,
        rng: &mut R,
        device: &Device,
    ) -> CvrlResult<Batch> {
        let images = self.stack(indices, transform, rng, device)?;
        Ok(Batch {
            images,
            labels: self.label_tensor(indices, device)?,
        })
    }

    /// Two independently transformed views of the images at `indices`.
    pub fn pair_batch<R: Rng>(
        &self,
        indices: &[usize],
        transform: &Transform,
        rng: &mut R,
        device: &Device,
    ) -> CvrlResult<PairBatch> {
        let view_a = self.stack(indices, transform, rng, device)?;
        let view_b = self.stack(indices, transform, rng, device)?;
        Ok(PairBatch {
            view_a,
            view_b,
            labels: self.label_tensor(indices, device)?,
        })
    }

    fn stack<R: Rng>(
        &self,
        indices: &[usize],
        transform: &Transform,
        rng: &mut R,
        device: &Device,
    ) -> CvrlResult<Tensor> {
        if indices.is_empty() {
            return Err(CvrlError::EmptyBatch {
                context: "image batch".to_string(),
            });
        }
        let mut data = Vec::with_capacity(indices.len() * CHANNELS * self.height * self.width);
        for &index in indices {
            if index >= self.len() {
                return Err(CvrlError::Dataset {
                    message: format!("index {} out of range for {} images", index, self.len()),
                });
            }
            data.extend(transform.apply(self.image(index), self.height, self.width, rng)?);
        }
        Tensor::from_vec(data, (indices.len(), CHANNELS, self.height, self.width), device)
            .map_err(map_candle)
    }

    fn label_tensor(&self, indices: &[usize], device: &Device) -> CvrlResult<Tensor> {
        let labels: Vec<u32> = indices.iter().map(|&i| self.labels[i] as u32).collect();
        Tensor::from_vec(labels, indices.len(), device).map_err(map_candle)
    }
}

fn resolve_root(dir: &Path) -> CvrlResult<PathBuf> {
    let nested = dir.join(BATCHES_DIR);
    if nested.join(TEST_FILE).exists() {
        return Ok(nested);
    }
    if dir.join(TEST_FILE).exists() {
        return Ok(dir.to_path_buf());
    }
    Err(CvrlError::Dataset {
        message: format!(
            "no CIFAR-10 binary batches in {} (expected {} or {}/{})",
            dir.display(),
            TEST_FILE,
            BATCHES_DIR,
            TEST_FILE
        ),
    })
}

fn parse_records(bytes: &[u8], path: &Path, pixels: &mut Vec<u8>, labels: &mut Vec<u8>) -> CvrlResult<()> {
    if bytes.len() % RECORD_BYTES != 0 {
        return Err(CvrlError::Dataset {
            message: format!(
                "{} has {} bytes, not a multiple of the {}-byte record",
                path.display(),
                bytes.len(),
                RECORD_BYTES
            ),
        });
    }
    for record in bytes.chunks_exact(RECORD_BYTES) {
        labels.push(record[0]);
        pixels.extend_from_slice(&record[1..]);
    }
    Ok(())
}
