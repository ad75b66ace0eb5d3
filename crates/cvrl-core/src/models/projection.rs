//! Projection heads mapping backbone features into the contrastive space.
//!
//! | Variant   | Topology                                                     |
//! |-----------|--------------------------------------------------------------|
//! | MoCo v1   | `Linear(F, dim)`                                             |
//! | MoCo v2   | `Linear(F, 1024, no bias) -> BN -> ReLU -> Dropout(0.3) -> Linear(1024, dim)` |
//! | SimCLR v1 | `Linear(F, 512, no bias) -> BN -> ReLU -> Linear(512, dim)`  |
//! | SimCLR v2 | `g1`: `Linear(F, 1024, no bias) -> BN -> ReLU -> Dropout(0.3)`, then `g2`: as SimCLR v1 over 1024 |

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{linear, linear_no_bias, BatchNorm, Dropout, Linear, VarBuilder};

use super::norm::batch_norm_1d;

/// Dropout used by the wide hidden layers.
pub const HIDDEN_DROPOUT: f32 = 0.3;

/// Floor on the norm in [`l2_normalize`].
pub const NORM_EPS: f64 = 1e-12;

/// Scale each row of `(N, D)` to unit length: `x / max(||x||, 1e-12)`.
pub fn l2_normalize(xs: &Tensor) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(NORM_EPS)?;
    xs.broadcast_div(&norm)
}

/// `Linear(no bias) -> BatchNorm1d -> ReLU -> [Dropout]`.
#[derive(Clone, Debug)]
pub struct HiddenLayer {
    fc: Linear,
    bn: BatchNorm,
    dropout: Option<Dropout>,
    out_dim: usize,
}

impl HiddenLayer {
    pub fn new(in_dim: usize, out_dim: usize, dropout: Option<f32>, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc: linear_no_bias(in_dim, out_dim, vb.pp("fc"))?,
            bn: batch_norm_1d(out_dim, vb.pp("bn"))?,
            dropout: dropout.map(Dropout::new),
            out_dim,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

impl ModuleT for HiddenLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.bn.forward_t(&self.fc.forward(xs)?, train)?.relu()?;
        match &self.dropout {
            Some(dropout) => dropout.forward_t(&xs, train),
            None => Ok(xs),
        }
    }
}

/// Unnormalized projection head. Callers apply [`l2_normalize`].
#[derive(Clone, Debug)]
pub enum ProjectionHead {
    /// A single affine map.
    Linear(Linear),
    /// One hidden layer followed by an affine output map.
    Mlp { hidden: HiddenLayer, out: Linear },
}

impl ProjectionHead {
    /// MoCo v1 head: `Linear(in_dim, dim)`.
    pub fn linear(in_dim: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(ProjectionHead::Linear(linear(in_dim, dim, vb.pp("out"))?))
    }

    /// Hidden layer of width `hidden_dim` then `Linear(hidden_dim, dim)`.
    pub fn mlp(
        in_dim: usize,
        hidden_dim: usize,
        dim: usize,
        dropout: Option<f32>,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(ProjectionHead::Mlp {
            hidden: HiddenLayer::new(in_dim, hidden_dim, dropout, vb.pp("hidden"))?,
            out: linear(hidden_dim, dim, vb.pp("out"))?,
        })
    }
}

impl ModuleT for ProjectionHead {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            ProjectionHead::Linear(out) => out.forward(xs),
            ProjectionHead::Mlp { hidden, out } => out.forward(&hidden.forward_t(xs, train)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_l2_normalize_rows() {
        let xs = Tensor::new(&[[3f32, 4.0], [0.0, 2.0]], &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = l2_normalize(&xs).unwrap().to_vec2().unwrap();
        assert!((out[0][0] - 0.6).abs() < 1e-6);
        assert!((out[0][1] - 0.8).abs() < 1e-6);
        assert!((out[1][1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_row_stays_finite() {
        let xs = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = l2_normalize(&xs).unwrap().to_vec2().unwrap();
        assert!(out[0].iter().all(|v| v.is_finite() && *v == 0.0));
    }

    #[test]
    fn test_mlp_head_shapes_and_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ProjectionHead::mlp(16, 32, 8, Some(HIDDEN_DROPOUT), vb.pp("g")).unwrap();

        let xs = Tensor::randn(0f32, 1f32, (4, 16), &Device::Cpu).unwrap();
        assert_eq!(head.forward_t(&xs, true).unwrap().dims(), &[4, 8]);
        assert_eq!(head.forward_t(&xs, false).unwrap().dims(), &[4, 8]);

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("g.hidden.fc.weight"));
        assert!(!data.contains_key("g.hidden.fc.bias"));
        assert!(data.contains_key("g.hidden.bn.running_var"));
        assert!(data.contains_key("g.out.bias"));
    }

    #[test]
    fn test_linear_head() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ProjectionHead::linear(16, 8, vb.pp("g")).unwrap();
        let xs = Tensor::randn(0f32, 1f32, (3, 16), &Device::Cpu).unwrap();
        assert_eq!(head.forward_t(&xs, true).unwrap().dims(), &[3, 8]);
        assert_eq!(varmap.all_vars().len(), 2);
    }
}
