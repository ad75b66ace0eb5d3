//! Contrastive objectives.
//!
//! Both losses are cross-entropy over similarity logits:
//! - MoCo (InfoNCE against a queue): one positive key per query at logit
//!   column 0, followed by one column per queued negative.
//! - SimCLR (NT-Xent): every other sample in the doubled batch is a negative,
//!   and the positive is the other view of the same image.
//!
//! Inputs are expected to be L2-normalized, so dot products are cosine
//! similarities. Returned losses stay attached to the autodiff graph.

use candle_core::{DType, Tensor, D};
use candle_nn::loss::cross_entropy;

use crate::error::{CvrlError, CvrlResult};

/// Added to self-similarity logits so a sample never counts as its own positive.
const SELF_MASK: f32 = -1e9;

fn map_candle(e: candle_core::Error) -> CvrlError {
    CvrlError::tensor("Loss", e)
}

fn check_temperature(temperature: f64) -> CvrlResult<()> {
    if temperature > 0.0 && temperature.is_finite() {
        Ok(())
    } else {
        Err(CvrlError::InvalidHyperparameter {
            name: "temperature",
            value: temperature.to_string(),
            reason: "must be a positive finite number".to_string(),
        })
    }
}

fn check_pair(context: &str, a: &Tensor, b: &Tensor) -> CvrlResult<(usize, usize)> {
    let (n, c) = a.dims2().map_err(map_candle)?;
    if a.dims() != b.dims() {
        return Err(CvrlError::ShapeMismatch {
            context: context.to_string(),
            expected: a.dims().to_vec(),
            actual: b.dims().to_vec(),
        });
    }
    if n == 0 {
        return Err(CvrlError::EmptyBatch {
            context: context.to_string(),
        });
    }
    Ok((n, c))
}

/// Logits `cat([q·k, q @ queue], 1) / T` of shape `(N, 1 + K)`.
///
/// `q` and `k` are `(N, C)`, `queue` is `(C, K)`. The queue is read detached.
pub fn moco_logits(q: &Tensor, k: &Tensor, queue: &Tensor, temperature: f64) -> CvrlResult<Tensor> {
    check_temperature(temperature)?;
    let (_, c) = check_pair("moco logits", q, k)?;
    let (queue_dim, _) = queue.dims2().map_err(map_candle)?;
    if queue_dim != c {
        return Err(CvrlError::ShapeMismatch {
            context: "moco logits queue".to_string(),
            expected: vec![c, queue.dim(1).map_err(map_candle)?],
            actual: queue.dims().to_vec(),
        });
    }

    // Positive logits: Nx1
    let l_pos = (q * k).map_err(map_candle)?.sum_keepdim(1).map_err(map_candle)?;
    // Negative logits: NxK
    let l_neg = q.matmul(&queue.detach()).map_err(map_candle)?;

    Tensor::cat(&[&l_pos, &l_neg], 1)
        .map_err(map_candle)?
        .affine(1.0 / temperature, 0.0)
        .map_err(map_candle)
}

/// Cross-entropy of [`moco_logits`] with the positive at index 0 for every row.
pub fn moco_loss(q: &Tensor, k: &Tensor, queue: &Tensor, temperature: f64) -> CvrlResult<Tensor> {
    let logits = moco_logits(q, k, queue, temperature)?;
    let n = logits.dim(0).map_err(map_candle)?;
    let labels = Tensor::zeros(n, DType::U32, logits.device()).map_err(map_candle)?;
    cross_entropy(&logits, &labels).map_err(map_candle)
}

/// NT-Xent over the `2N` projections of two views.
///
/// Row `i` of `cat([z1, z2])` takes row `(i + N) mod 2N` as its positive and
/// every other row except itself as a negative.
pub fn nt_xent_loss(z1: &Tensor, z2: &Tensor, temperature: f64) -> CvrlResult<Tensor> {
    check_temperature(temperature)?;
    let (n, _) = check_pair("nt-xent", z1, z2)?;
    let device = z1.device();

    let z = Tensor::cat(&[z1, z2], 0).map_err(map_candle)?;
    let sim = z
        .matmul(&z.t().map_err(map_candle)?)
        .map_err(map_candle)?
        .affine(1.0 / temperature, 0.0)
        .map_err(map_candle)?;
    let mask: Vec<f32> = (0..4 * n * n)
        .map(|idx| if idx / (2 * n) == idx % (2 * n) { SELF_MASK } else { 0.0 })
        .collect();
    let mask = Tensor::from_vec(mask, (2 * n, 2 * n), device)
        .map_err(map_candle)?
        .to_dtype(z.dtype())
        .map_err(map_candle)?;
    let logits = (sim + mask).map_err(map_candle)?;

    let labels: Vec<u32> = (0..2 * n).map(|i| ((i + n) % (2 * n)) as u32).collect();
    let labels = Tensor::from_vec(labels, 2 * n, device).map_err(map_candle)?;
    cross_entropy(&logits, &labels).map_err(map_candle)
}

/// Fraction of rows whose largest logit is column 0, i.e. the positive key.
pub fn positive_top1(logits: &Tensor) -> CvrlResult<f32> {
    let n = logits.dim(0).map_err(map_candle)?;
    if n == 0 {
        return Ok(0.0);
    }
    let argmax: Vec<u32> = logits
        .argmax(D::Minus1)
        .map_err(map_candle)?
        .to_vec1()
        .map_err(map_candle)?;
    let hits = argmax.iter().filter(|&&idx| idx == 0).count();
    Ok(hits as f32 / n as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::l2_normalize;
    use candle_core::Device;

    fn unit(rows: &[&[f32]]) -> Tensor {
        let cols = rows[0].len();
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        let t = Tensor::from_vec(flat, (rows.len(), cols), &Device::Cpu).unwrap();
        l2_normalize(&t).unwrap()
    }

    #[test]
    fn test_identical_query_key_gives_inverse_temperature() {
        let q = unit(&[&[1.0, 2.0, 3.0], &[-1.0, 0.5, 0.0]]);
        let queue = unit(&[&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]]).t().unwrap();
        let logits: Vec<Vec<f32>> = moco_logits(&q, &q, &queue, 0.1).unwrap().to_vec2().unwrap();

        assert_eq!(logits[0].len(), 3);
        for row in &logits {
            assert!((row[0] - 10.0).abs() < 1e-4, "positive logit {}", row[0]);
        }
    }

    #[test]
    fn test_loss_decreases_as_positive_rises() {
        // Query fixed; key rotates towards the query, negatives fixed.
        let q = unit(&[&[1.0, 0.0, 0.0]]);
        let queue = unit(&[&[0.0, 1.0, 0.0], &[0.0, 0.0, 1.0], &[0.0, -1.0, 0.0]])
            .t()
            .unwrap();

        let mut previous = f32::INFINITY;
        for step in 0..=10 {
            let angle = std::f32::consts::FRAC_PI_2 * (1.0 - step as f32 / 10.0);
            let k = unit(&[&[angle.cos(), angle.sin(), 0.0]]);
            let loss: f32 = moco_loss(&q, &k, &queue, 0.2).unwrap().to_scalar().unwrap();
            assert!(loss < previous, "loss {} did not drop below {}", loss, previous);
            previous = loss;
        }
    }

    #[test]
    fn test_queue_dim_mismatch() {
        let q = unit(&[&[1.0, 0.0]]);
        let queue = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let err = moco_logits(&q, &q, &queue, 0.1).unwrap_err();
        assert!(matches!(err, CvrlError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_rejects_non_positive_temperature() {
        let q = unit(&[&[1.0, 0.0]]);
        let queue = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            moco_loss(&q, &q, &queue, 0.0),
            Err(CvrlError::InvalidHyperparameter { name: "temperature", .. })
        ));
    }

    #[test]
    fn test_nt_xent_prefers_aligned_views() {
        let z1 = unit(&[&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]]);
        let aligned = nt_xent_loss(&z1, &z1, 0.5).unwrap().to_scalar::<f32>().unwrap();
        let crossed = unit(&[&[0.0, 1.0, 0.0], &[1.0, 0.0, 0.0]]);
        let swapped = nt_xent_loss(&z1, &crossed, 0.5).unwrap().to_scalar::<f32>().unwrap();
        assert!(aligned.is_finite() && swapped.is_finite());
        assert!(aligned < swapped, "aligned {} vs swapped {}", aligned, swapped);
    }

    #[test]
    fn test_nt_xent_shape_mismatch() {
        let z1 = unit(&[&[1.0, 0.0]]);
        let z2 = unit(&[&[1.0, 0.0], &[0.0, 1.0]]);
        assert!(matches!(
            nt_xent_loss(&z1, &z2, 0.5),
            Err(CvrlError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_positive_top1() {
        let logits = Tensor::new(&[[5f32, 1.0, 0.0], [0.0, 3.0, 1.0]], &Device::Cpu).unwrap();
        assert!((positive_top1(&logits).unwrap() - 0.5).abs() < 1e-6);
    }
}
