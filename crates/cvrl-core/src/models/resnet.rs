//! ResNet backbones adapted for 32x32 inputs.
//!
//! Compared with the ImageNet layout the stem is a single 3x3 stride-1
//! convolution, the max-pool is dropped, and the classifier is removed: the
//! network ends at global average pooling and yields one flat feature vector
//! per image.
//!
//! Parameter names follow the usual layout (`conv1`, `bn1`,
//! `layer{1..4}.{block}.conv1`, `...downsample.conv`, `...downsample.bn`).

use std::fmt;
use std::str::FromStr;

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{conv2d_no_bias, Conv2d, Conv2dConfig, VarBuilder};
use serde::{Deserialize, Serialize};

use super::norm::Norm2d;
use super::FeatureEncoder;
use crate::error::CvrlError;

/// Supported backbone depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    ResNet18,
    ResNet34,
    ResNet50,
}

impl Arch {
    /// All supported architectures.
    pub fn all() -> &'static [Arch] {
        &[Arch::ResNet18, Arch::ResNet34, Arch::ResNet50]
    }

    /// Selector string, e.g. `resnet18`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::ResNet18 => "resnet18",
            Arch::ResNet34 => "resnet34",
            Arch::ResNet50 => "resnet50",
        }
    }

    /// Blocks per stage.
    pub fn block_depths(&self) -> [usize; 4] {
        match self {
            Arch::ResNet18 => [2, 2, 2, 2],
            Arch::ResNet34 | Arch::ResNet50 => [3, 4, 6, 3],
        }
    }

    /// Output channels of a block relative to its inner width.
    pub fn expansion(&self) -> usize {
        match self {
            Arch::ResNet18 | Arch::ResNet34 => 1,
            Arch::ResNet50 => 4,
        }
    }

    /// Width of the pooled feature vector for a given stem width.
    ///
    /// 512 for ResNet-18/34 and 2048 for ResNet-50 at the standard width 64.
    pub fn feature_dim(&self, base_width: usize) -> usize {
        base_width * 8 * self.expansion()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = CvrlError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Arch::all()
            .iter()
            .copied()
            .find(|arch| arch.as_str() == s)
            .ok_or_else(|| CvrlError::UnknownArch {
                name: s.to_string(),
            })
    }
}

/// Shape of a backbone: depth, stem width and batch-norm split factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneConfig {
    pub arch: Arch,
    /// Channels after the stem; stage `i` uses `base_width * 2^i`.
    pub base_width: usize,
    /// Sample groups for split batch norm; 1 means plain batch norm.
    pub bn_splits: usize,
}

impl BackboneConfig {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            base_width: 64,
            bn_splits: 1,
        }
    }

    pub fn with_base_width(mut self, base_width: usize) -> Self {
        self.base_width = base_width;
        self
    }

    pub fn with_bn_splits(mut self, bn_splits: usize) -> Self {
        self.bn_splits = bn_splits;
        self
    }

    pub fn feature_dim(&self) -> usize {
        self.arch.feature_dim(self.base_width)
    }
}

fn conv3x3(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    conv2d_no_bias(in_c, out_c, 3, config, vb)
}

fn conv1x1(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let config = Conv2dConfig {
        stride,
        ..Default::default()
    };
    conv2d_no_bias(in_c, out_c, 1, config, vb)
}

/// 1x1 projection shortcut used when a block changes shape.
#[derive(Clone, Debug)]
struct Downsample {
    conv: Conv2d,
    bn: Norm2d,
}

impl Downsample {
    fn new(in_c: usize, out_c: usize, stride: usize, splits: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: conv1x1(in_c, out_c, stride, vb.pp("conv"))?,
            bn: Norm2d::new(out_c, splits, vb.pp("bn"))?,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.bn.forward_t(&self.conv.forward(xs)?, train)
    }
}

#[derive(Clone, Debug)]
struct BasicBlock {
    conv1: Conv2d,
    bn1: Norm2d,
    conv2: Conv2d,
    bn2: Norm2d,
    downsample: Option<Downsample>,
}

impl BasicBlock {
    fn new(in_c: usize, planes: usize, stride: usize, splits: usize, vb: VarBuilder) -> Result<Self> {
        let downsample = if stride != 1 || in_c != planes {
            Some(Downsample::new(in_c, planes, stride, splits, vb.pp("downsample"))?)
        } else {
            None
        };
        Ok(Self {
            conv1: conv3x3(in_c, planes, stride, vb.pp("conv1"))?,
            bn1: Norm2d::new(planes, splits, vb.pp("bn1"))?,
            conv2: conv3x3(planes, planes, 1, vb.pp("conv2"))?,
            bn2: Norm2d::new(planes, splits, vb.pp("bn2"))?,
            downsample,
        })
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, train)?;
        let identity = match &self.downsample {
            Some(ds) => ds.forward_t(xs, train)?,
            None => xs.clone(),
        };
        (out + identity)?.relu()
    }
}

#[derive(Clone, Debug)]
struct Bottleneck {
    conv1: Conv2d,
    bn1: Norm2d,
    conv2: Conv2d,
    bn2: Norm2d,
    conv3: Conv2d,
    bn3: Norm2d,
    downsample: Option<Downsample>,
}

impl Bottleneck {
    const EXPANSION: usize = 4;

    fn new(in_c: usize, planes: usize, stride: usize, splits: usize, vb: VarBuilder) -> Result<Self> {
        let out_c = planes * Self::EXPANSION;
        let downsample = if stride != 1 || in_c != out_c {
            Some(Downsample::new(in_c, out_c, stride, splits, vb.pp("downsample"))?)
        } else {
            None
        };
        Ok(Self {
            conv1: conv1x1(in_c, planes, 1, vb.pp("conv1"))?,
            bn1: Norm2d::new(planes, splits, vb.pp("bn1"))?,
            conv2: conv3x3(planes, planes, stride, vb.pp("conv2"))?,
            bn2: Norm2d::new(planes, splits, vb.pp("bn2"))?,
            conv3: conv1x1(planes, out_c, 1, vb.pp("conv3"))?,
            bn3: Norm2d::new(out_c, splits, vb.pp("bn3"))?,
            downsample,
        })
    }
}

impl ModuleT for Bottleneck {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, train)?.relu()?;
        let out = self.bn3.forward_t(&self.conv3.forward(&out)?, train)?;
        let identity = match &self.downsample {
            Some(ds) => ds.forward_t(xs, train)?,
            None => xs.clone(),
        };
        (out + identity)?.relu()
    }
}

#[derive(Clone, Debug)]
enum Block {
    Basic(BasicBlock),
    Bottleneck(Bottleneck),
}

impl ModuleT for Block {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Block::Basic(b) => b.forward_t(xs, train),
            Block::Bottleneck(b) => b.forward_t(xs, train),
        }
    }
}

/// Convolutional feature extractor ending in global average pooling.
#[derive(Clone, Debug)]
pub struct ResNetBackbone {
    conv1: Conv2d,
    bn1: Norm2d,
    stages: Vec<Vec<Block>>,
    config: BackboneConfig,
}

impl ResNetBackbone {
    pub fn new(config: BackboneConfig, vb: VarBuilder) -> Result<Self> {
        if config.base_width == 0 {
            candle_core::bail!("backbone base width must be positive");
        }
        let splits = config.bn_splits;
        let expansion = config.arch.expansion();

        let conv1 = conv3x3(3, config.base_width, 1, vb.pp("conv1"))?;
        let bn1 = Norm2d::new(config.base_width, splits, vb.pp("bn1"))?;

        let mut in_c = config.base_width;
        let mut stages = Vec::with_capacity(4);
        for (stage_idx, depth) in config.arch.block_depths().iter().enumerate() {
            let planes = config.base_width << stage_idx;
            let stage_stride = if stage_idx == 0 { 1 } else { 2 };
            let stage_vb = vb.pp(format!("layer{}", stage_idx + 1));

            let mut blocks = Vec::with_capacity(*depth);
            for block_idx in 0..*depth {
                let stride = if block_idx == 0 { stage_stride } else { 1 };
                let block_vb = stage_vb.pp(block_idx.to_string());
                let block = if expansion == 1 {
                    Block::Basic(BasicBlock::new(in_c, planes, stride, splits, block_vb)?)
                } else {
                    Block::Bottleneck(Bottleneck::new(in_c, planes, stride, splits, block_vb)?)
                };
                blocks.push(block);
                in_c = planes * expansion;
            }
            stages.push(blocks);
        }

        Ok(Self {
            conv1,
            bn1,
            stages,
            config,
        })
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }
}

impl ModuleT for ResNetBackbone {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        for stage in &self.stages {
            for block in stage {
                xs = block.forward_t(&xs, train)?;
            }
        }
        // Global average pool + flatten: (N, C, H, W) -> (N, C)
        xs.mean((2, 3))
    }
}

impl FeatureEncoder for ResNetBackbone {
    fn feature_dim(&self) -> usize {
        self.config.feature_dim()
    }

    fn encode(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(images, train)
    }
}
