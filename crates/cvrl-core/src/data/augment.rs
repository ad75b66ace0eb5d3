//! Image transforms from channel-major bytes to normalized `f32` tensors.
//!
//! The training pipeline is random resized crop, horizontal flip, colour
//! jitter, random grayscale, then per-channel normalization. The test
//! pipeline only normalizes. Geometry and colour operations run on
//! `image::RgbImage`.

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::CHANNELS;
use crate::error::{CvrlError, CvrlResult};

/// Per-channel CIFAR-10 mean.
pub const CIFAR_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
/// Per-channel CIFAR-10 standard deviation.
pub const CIFAR_STD: [f32; 3] = [0.2023, 0.1994, 0.2010];

const CROP_ATTEMPTS: usize = 10;

/// Strengths of the colour jitter. Each factor is drawn uniformly from
/// `[1 - s, 1 + s]`; hue shifts by up to `hue` of a full turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorJitter {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
}

impl Default for ColorJitter {
    fn default() -> Self {
        Self {
            brightness: 0.4,
            contrast: 0.4,
            saturation: 0.4,
            hue: 0.1,
        }
    }
}

/// Random augmentation parameters of the training pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Crop area range as a fraction of the image.
    pub crop_scale: (f32, f32),
    /// Crop aspect-ratio range.
    pub crop_ratio: (f32, f32),
    pub flip_prob: f32,
    pub jitter: ColorJitter,
    pub jitter_prob: f32,
    pub grayscale_prob: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            crop_scale: (0.08, 1.0),
            crop_ratio: (3.0 / 4.0, 4.0 / 3.0),
            flip_prob: 0.5,
            jitter: ColorJitter::default(),
            jitter_prob: 0.8,
            grayscale_prob: 0.2,
        }
    }
}

/// Byte image to normalized `f32` image, optionally with random augmentation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    augment: Option<AugmentConfig>,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Transform {
    /// Full augmentation followed by CIFAR-10 normalization.
    pub fn train() -> Self {
        Self::with_augment(AugmentConfig::default())
    }

    /// Normalization only.
    pub fn test() -> Self {
        Self {
            augment: None,
            mean: CIFAR_MEAN,
            std: CIFAR_STD,
        }
    }

    pub fn with_augment(augment: AugmentConfig) -> Self {
        Self {
            augment: Some(augment),
            ..Self::test()
        }
    }

    pub fn is_random(&self) -> bool {
        self.augment.is_some()
    }

    /// Apply the pipeline to one `C, H, W` byte image of the given size.
    ///
    /// Returns the normalized image in the same `C, H, W` layout.
    pub fn apply<R: Rng>(&self, image: &[u8], height: usize, width: usize, rng: &mut R) -> CvrlResult<Vec<f32>> {
        let mut img = to_rgb_image(image, height, width)?;
        if let Some(augment) = &self.augment {
            img = random_resized_crop(&img, augment, rng);
            if rng.gen::<f32>() < augment.flip_prob {
                imageops::flip_horizontal_in_place(&mut img);
            }
            if rng.gen::<f32>() < augment.jitter_prob {
                img = color_jitter(img, &augment.jitter, rng);
            }
            if rng.gen::<f32>() < augment.grayscale_prob {
                img = to_grayscale(&img);
            }
        }
        Ok(normalize(&img, &self.mean, &self.std))
    }
}

fn to_rgb_image(image: &[u8], height: usize, width: usize) -> CvrlResult<RgbImage> {
    let plane = height * width;
    if image.len() != CHANNELS * plane || plane == 0 {
        return Err(CvrlError::ShapeMismatch {
            context: "image transform input".to_string(),
            expected: vec![CHANNELS, height, width],
            actual: vec![image.len()],
        });
    }
    let mut img = RgbImage::new(width as u32, height as u32);
    for (i, pixel) in img.pixels_mut().enumerate() {
        *pixel = Rgb([image[i], image[plane + i], image[2 * plane + i]]);
    }
    Ok(img)
}

/// Sample a crop window `(top, left, crop_h, crop_w)` of random area and
/// aspect ratio. Falls back to the largest centered window within the ratio
/// bounds.
fn crop_window<R: Rng>(height: u32, width: u32, config: &AugmentConfig, rng: &mut R) -> (u32, u32, u32, u32) {
    let area = (height * width) as f32;
    let (log_lo, log_hi) = (config.crop_ratio.0.ln(), config.crop_ratio.1.ln());

    for _ in 0..CROP_ATTEMPTS {
        let target_area = area * rng.gen_range(config.crop_scale.0..=config.crop_scale.1);
        let aspect = rng.gen_range(log_lo..=log_hi).exp();
        let crop_w = (target_area * aspect).sqrt().round() as u32;
        let crop_h = (target_area / aspect).sqrt().round() as u32;
        if crop_w > 0 && crop_w <= width && crop_h > 0 && crop_h <= height {
            let top = rng.gen_range(0..=height - crop_h);
            let left = rng.gen_range(0..=width - crop_w);
            return (top, left, crop_h, crop_w);
        }
    }

    let in_ratio = width as f32 / height as f32;
    let (crop_h, crop_w) = if in_ratio < config.crop_ratio.0 {
        (((width as f32 / config.crop_ratio.0).round() as u32).clamp(1, height), width)
    } else if in_ratio > config.crop_ratio.1 {
        (height, ((height as f32 * config.crop_ratio.1).round() as u32).clamp(1, width))
    } else {
        (height, width)
    };
    ((height - crop_h) / 2, (width - crop_w) / 2, crop_h, crop_w)
}

/// Crop a random window and resize it back to the input size (bilinear).
fn random_resized_crop<R: Rng>(img: &RgbImage, config: &AugmentConfig, rng: &mut R) -> RgbImage {
    let (width, height) = img.dimensions();
    let (top, left, crop_h, crop_w) = crop_window(height, width, config, rng);
    let crop = imageops::crop_imm(img, left, top, crop_w, crop_h).to_image();
    if (crop_w, crop_h) == (width, height) {
        return crop;
    }
    imageops::resize(&crop, width, height, FilterType::Triangle)
}

fn to_grayscale(img: &RgbImage) -> RgbImage {
    DynamicImage::ImageLuma8(imageops::grayscale(img)).to_rgb8()
}

/// `anchor + (value - anchor) * factor`, rounded back to a byte.
fn blend(value: u8, anchor: f32, factor: f32) -> u8 {
    (anchor + (value as f32 - anchor) * factor).round().clamp(0.0, 255.0) as u8
}

/// Brightness, contrast, saturation and hue adjustments in random order.
fn color_jitter<R: Rng>(mut img: RgbImage, jitter: &ColorJitter, rng: &mut R) -> RgbImage {
    let mut order = [0usize, 1, 2, 3];
    order.shuffle(rng);
    for op in order {
        match op {
            0 if jitter.brightness > 0.0 => {
                let factor = jitter_factor(rng, jitter.brightness);
                for pixel in img.pixels_mut() {
                    pixel.0 = pixel.0.map(|v| blend(v, 0.0, factor));
                }
            }
            1 if jitter.contrast > 0.0 => {
                let factor = jitter_factor(rng, jitter.contrast);
                let gray = imageops::grayscale(&img);
                let count = (gray.width() * gray.height()) as f32;
                let mean = gray.pixels().map(|p| p.0[0] as f32).sum::<f32>() / count;
                for pixel in img.pixels_mut() {
                    pixel.0 = pixel.0.map(|v| blend(v, mean, factor));
                }
            }
            2 if jitter.saturation > 0.0 => {
                let factor = jitter_factor(rng, jitter.saturation);
                let gray = imageops::grayscale(&img);
                for (pixel, luma) in img.pixels_mut().zip(gray.pixels()) {
                    let anchor = luma.0[0] as f32;
                    pixel.0 = pixel.0.map(|v| blend(v, anchor, factor));
                }
            }
            3 if jitter.hue > 0.0 => {
                let turns = rng.gen_range(-jitter.hue..=jitter.hue);
                img = imageops::huerotate(&img, (turns * 360.0).round() as i32);
            }
            _ => {}
        }
    }
    img
}

fn jitter_factor<R: Rng>(rng: &mut R, strength: f32) -> f32 {
    rng.gen_range((1.0 - strength).max(0.0)..=1.0 + strength)
}

/// Scale to `[0, 1]`, normalize per channel and lay out as `C, H, W`.
fn normalize(img: &RgbImage, mean: &[f32; 3], std: &[f32; 3]) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut out = vec![0.0f32; CHANNELS * plane];
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..CHANNELS {
            out[c * plane + i] = (pixel.0[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient_image(size: usize) -> Vec<u8> {
        (0..CHANNELS * size * size).map(|i| (i % 251) as u8).collect()
    }

    fn only(augment: AugmentConfig) -> Transform {
        Transform::with_augment(AugmentConfig {
            crop_scale: (1.0, 1.0),
            crop_ratio: (1.0, 1.0),
            flip_prob: 0.0,
            jitter_prob: 0.0,
            grayscale_prob: 0.0,
            ..augment
        })
    }

    fn denormalize(out: &[f32], plane: usize) -> Vec<u8> {
        out.iter()
            .enumerate()
            .map(|(i, &p)| {
                let c = i / plane;
                ((p * CIFAR_STD[c] + CIFAR_MEAN[c]) * 255.0).round() as u8
            })
            .collect()
    }

    #[test]
    fn test_test_transform_only_normalizes() {
        let mut rng = StdRng::seed_from_u64(0);
        let image = vec![255u8; CHANNELS * 4];
        let out = Transform::test().apply(&image, 2, 2, &mut rng).unwrap();
        for c in 0..CHANNELS {
            let expected = (1.0 - CIFAR_MEAN[c]) / CIFAR_STD[c];
            assert!(out[c * 4..(c + 1) * 4].iter().all(|&p| (p - expected).abs() < 1e-5));
        }
    }

    #[test]
    fn test_full_crop_keeps_pixels() {
        let mut rng = StdRng::seed_from_u64(1);
        let image = gradient_image(6);
        let out = only(AugmentConfig::default()).apply(&image, 6, 6, &mut rng).unwrap();
        assert_eq!(denormalize(&out, 36), image);
    }

    #[test]
    fn test_crop_window_stays_inside_image() {
        let mut rng = StdRng::seed_from_u64(2);
        let config = AugmentConfig::default();
        for _ in 0..200 {
            let (top, left, h, w) = crop_window(32, 24, &config, &mut rng);
            assert!(h > 0 && w > 0);
            assert!(top + h <= 32 && left + w <= 24);
        }
    }

    #[test]
    fn test_flip_reverses_rows() {
        let mut rng = StdRng::seed_from_u64(3);
        let image: Vec<u8> = (0..CHANNELS as u8 * 4).collect();
        let transform = Transform::with_augment(AugmentConfig {
            flip_prob: 1.0,
            ..only(AugmentConfig::default()).augment.unwrap()
        });
        let out = denormalize(&transform.apply(&image, 2, 2, &mut rng).unwrap(), 4);
        assert_eq!(&out[..4], &[1, 0, 3, 2]);
    }

    #[test]
    fn test_grayscale_equalizes_channels() {
        let img = to_rgb_image(&[255, 0, 0, 255, 0, 0], 1, 2).unwrap();
        let gray = to_grayscale(&img);
        for pixel in gray.pixels() {
            assert_eq!(pixel.0[0], pixel.0[1]);
            assert_eq!(pixel.0[1], pixel.0[2]);
        }
        assert!(gray.get_pixel(0, 0).0[0] > 0);
    }

    #[test]
    fn test_zero_jitter_is_identity() {
        let mut rng = StdRng::seed_from_u64(4);
        let img = to_rgb_image(&gradient_image(4), 4, 4).unwrap();
        let zero = ColorJitter {
            brightness: 0.0,
            contrast: 0.0,
            saturation: 0.0,
            hue: 0.0,
        };
        assert_eq!(color_jitter(img.clone(), &zero, &mut rng), img);
    }

    #[test]
    fn test_rejects_wrong_buffer_length() {
        let mut rng = StdRng::seed_from_u64(5);
        assert!(matches!(
            Transform::test().apply(&[0u8; 10], 2, 2, &mut rng),
            Err(CvrlError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_augmented_values_stay_in_normalized_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let transform = Transform::train();
        let image = gradient_image(8);
        for _ in 0..20 {
            let out = transform.apply(&image, 8, 8, &mut rng).unwrap();
            assert_eq!(out.len(), image.len());
            for (i, &p) in out.iter().enumerate() {
                let c = i / 64;
                let lo = -CIFAR_MEAN[c] / CIFAR_STD[c] - 1e-4;
                let hi = (1.0 - CIFAR_MEAN[c]) / CIFAR_STD[c] + 1e-4;
                assert!(p >= lo && p <= hi, "pixel {} = {}", i, p);
            }
        }
    }
}
