//! 2-D batch normalization for the convolutional backbones.
//!
//! `SplitBatchNorm` normalizes a batch as `num_splits` independent groups,
//! emulating per-device statistics on a single device. Sample `i` belongs to
//! group `i % num_splits`.
//! Weights and running statistics are shared across groups, so a checkpoint
//! written with any split factor loads into a plain `BatchNorm` and back.

use candle_core::{bail, ModuleT, Result, Tensor, Var};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, Init, VarBuilder};

const BN_EPS: f64 = 1e-5;
const BN_MOMENTUM: f64 = 0.1;

/// Batch norm whose training statistics are computed per group of samples.
#[derive(Clone, Debug)]
pub struct SplitBatchNorm {
    weight: Tensor,
    bias: Tensor,
    running_mean: Var,
    running_var: Var,
    num_features: usize,
    num_splits: usize,
}

impl SplitBatchNorm {
    /// Create a split batch norm over `num_features` channels.
    pub fn new(num_features: usize, num_splits: usize, vb: VarBuilder) -> Result<Self> {
        if num_splits == 0 {
            bail!("split batch norm requires at least one split");
        }
        let running_mean = vb.get_with_hints(num_features, "running_mean", Init::Const(0.))?;
        let running_var = vb.get_with_hints(num_features, "running_var", Init::Const(1.))?;
        let weight = vb.get_with_hints(num_features, "weight", Init::Const(1.))?;
        let bias = vb.get_with_hints(num_features, "bias", Init::Const(0.))?;

        Ok(Self {
            weight,
            bias,
            running_mean: Var::from_tensor(&running_mean)?,
            running_var: Var::from_tensor(&running_var)?,
            num_features,
            num_splits,
        })
    }

    /// Number of sample groups normalized independently in training mode.
    pub fn num_splits(&self) -> usize {
        self.num_splits
    }

    /// Current running mean, shape `[num_features]`.
    pub fn running_mean(&self) -> &Tensor {
        self.running_mean.as_tensor()
    }

    /// Current running variance, shape `[num_features]`.
    pub fn running_var(&self) -> &Tensor {
        self.running_var.as_tensor()
    }

    fn forward_train(&self, xs: &Tensor) -> Result<Tensor> {
        let (n, c, h, w) = xs.dims4()?;
        if c != self.num_features {
            bail!("split batch norm expected {} channels, got {}", self.num_features, c);
        }
        let s = self.num_splits;
        if n % s != 0 {
            bail!("batch of {} samples cannot be split into {} groups", n, s);
        }

        // Sample i lands in group i % s, channels [g*c, (g+1)*c).
        let grouped = xs.reshape((n / s, c * s, h, w))?;
        let mean = grouped.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)?;
        let centered = grouped.broadcast_sub(&mean)?;
        let var = centered
            .sqr()?
            .mean_keepdim(0)?
            .mean_keepdim(2)?
            .mean_keepdim(3)?;
        let std = var.affine(1.0, BN_EPS)?.sqrt()?;

        let weight = self.weight.repeat(s)?.reshape((1, c * s, 1, 1))?;
        let bias = self.bias.repeat(s)?.reshape((1, c * s, 1, 1))?;
        let out = centered
            .broadcast_div(&std)?
            .broadcast_mul(&weight)?
            .broadcast_add(&bias)?
            .reshape((n, c, h, w))?;

        self.update_running_stats(&mean, &var, (n / s) * h * w)?;
        Ok(out)
    }

    /// Blend the per-group batch statistics into the shared running buffers.
    ///
    /// Every group starts from the same running value, so averaging the
    /// per-group updates equals one update with the mean group statistic.
    fn update_running_stats(&self, mean: &Tensor, var: &Tensor, count: usize) -> Result<()> {
        let (s, c) = (self.num_splits, self.num_features);
        let unbiased = if count > 1 {
            count as f64 / (count as f64 - 1.0)
        } else {
            1.0
        };
        let batch_mean = mean.detach().reshape((s, c))?.mean(0)?;
        let batch_var = var.detach().reshape((s, c))?.mean(0)?.affine(unbiased, 0.0)?;

        let new_mean = (self.running_mean.as_tensor().affine(1.0 - BN_MOMENTUM, 0.0)?
            + batch_mean.affine(BN_MOMENTUM, 0.0)?)?;
        let new_var = (self.running_var.as_tensor().affine(1.0 - BN_MOMENTUM, 0.0)?
            + batch_var.affine(BN_MOMENTUM, 0.0)?)?;
        self.running_mean.set(&new_mean.detach())?;
        self.running_var.set(&new_var.detach())?;
        Ok(())
    }

    fn forward_eval(&self, xs: &Tensor) -> Result<Tensor> {
        let c = self.num_features;
        let mean = self.running_mean.as_tensor().reshape((1, c, 1, 1))?;
        let std = self
            .running_var
            .as_tensor()
            .affine(1.0, BN_EPS)?
            .sqrt()?
            .reshape((1, c, 1, 1))?;
        let weight = self.weight.reshape((1, c, 1, 1))?;
        let bias = self.bias.reshape((1, c, 1, 1))?;
        xs.broadcast_sub(&mean)?
            .broadcast_div(&std)?
            .broadcast_mul(&weight)?
            .broadcast_add(&bias)
    }
}

impl ModuleT for SplitBatchNorm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if train {
            self.forward_train(xs)
        } else {
            self.forward_eval(xs)
        }
    }
}

/// Normalization layer used inside the backbones.
#[derive(Clone, Debug)]
pub enum Norm2d {
    /// Standard batch norm over the whole batch.
    Batch(BatchNorm),
    /// Batch norm over independent groups of samples.
    Split(SplitBatchNorm),
}

impl Norm2d {
    /// Plain batch norm when `bn_splits <= 1`, split batch norm otherwise.
    pub fn new(num_features: usize, bn_splits: usize, vb: VarBuilder) -> Result<Self> {
        if bn_splits > 1 {
            Ok(Norm2d::Split(SplitBatchNorm::new(num_features, bn_splits, vb)?))
        } else {
            let config = BatchNormConfig {
                eps: BN_EPS,
                momentum: BN_MOMENTUM,
                ..Default::default()
            };
            Ok(Norm2d::Batch(batch_norm(num_features, config, vb)?))
        }
    }
}

impl ModuleT for Norm2d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Norm2d::Batch(bn) => bn.forward_t(xs, train),
            Norm2d::Split(bn) => bn.forward_t(xs, train),
        }
    }
}

/// Batch norm over `(N, C)` activations for the projection heads.
pub fn batch_norm_1d(num_features: usize, vb: VarBuilder) -> Result<BatchNorm> {
    let config = BatchNormConfig {
        eps: BN_EPS,
        momentum: BN_MOMENTUM,
        ..Default::default()
    };
    batch_norm(num_features, config, vb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(splits: usize, channels: usize) -> (VarMap, Norm2d) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = Norm2d::new(channels, splits, vb.pp("bn")).unwrap();
        (varmap, norm)
    }

    fn input(n: usize, c: usize) -> Tensor {
        let data: Vec<f32> = (0..n * c * 2 * 2).map(|i| ((i * 37) % 11) as f32 * 0.3).collect();
        Tensor::from_vec(data, (n, c, 2, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_split_one_matches_plain_batch_norm_shape() {
        let (_vm, plain) = build(1, 3);
        assert!(matches!(plain, Norm2d::Batch(_)));
        let (_vm, split) = build(2, 3);
        assert!(matches!(split, Norm2d::Split(_)));
    }

    #[test]
    fn test_split_groups_are_normalized_independently() {
        let (_vm, norm) = build(2, 3);
        let xs = input(4, 3);
        let out = norm.forward_t(&xs, true).unwrap();
        assert_eq!(out.dims(), &[4, 3, 2, 2]);

        // Samples {0, 2} and {1, 3} form the two groups; each has per-channel
        // mean ~0 after normalization.
        for group in 0..2u32 {
            let members = Tensor::new(&[group, group + 2], &Device::Cpu).unwrap();
            let slice = out.index_select(&members, 0).unwrap();
            let means: Vec<f32> = slice
                .mean_keepdim(0)
                .unwrap()
                .mean_keepdim(2)
                .unwrap()
                .mean_keepdim(3)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            for m in means {
                assert!(m.abs() < 1e-4, "group {} channel mean {}", group, m);
            }
        }
    }

    #[test]
    fn test_split_updates_running_stats() {
        let (_vm, norm) = build(2, 3);
        let xs = input(4, 3);
        norm.forward_t(&xs, true).unwrap();
        if let Norm2d::Split(bn) = &norm {
            let mean: Vec<f32> = bn.running_mean().to_vec1().unwrap();
            assert!(mean.iter().any(|v| v.abs() > 1e-6), "running mean should move");
            let var: Vec<f32> = bn.running_var().to_vec1().unwrap();
            assert!(var.iter().all(|v| *v > 0.0));
        } else {
            panic!("expected split batch norm");
        }
    }

    #[test]
    fn test_split_rejects_indivisible_batch() {
        let (_vm, norm) = build(4, 3);
        let xs = input(6, 3);
        assert!(norm.forward_t(&xs, true).is_err());
        // Inference mode uses running stats and accepts any batch size.
        assert!(norm.forward_t(&xs, false).is_ok());
    }

    #[test]
    fn test_split_and_plain_share_parameter_names() {
        let (split_vm, _) = build(2, 3);
        let (plain_vm, _) = build(1, 3);
        let mut split_names: Vec<String> =
            split_vm.data().lock().unwrap().keys().cloned().collect();
        let mut plain_names: Vec<String> =
            plain_vm.data().lock().unwrap().keys().cloned().collect();
        split_names.sort();
        plain_names.sort();
        assert_eq!(split_names, plain_names);
    }
}
