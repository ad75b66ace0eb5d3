//! Single-device batch shuffling around the key encoder.
//!
//! Batch norm statistics of a batch leak information between samples. The key
//! batch is permuted before the key encoder and restored afterwards, so a query
//! and its positive key are never normalized with the same sample layout.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{CvrlError, CvrlResult};

fn map_candle(e: candle_core::Error) -> CvrlError {
    CvrlError::tensor("Shuffle", e)
}

/// Source of uniform random permutations over the batch axis.
#[derive(Debug, Clone)]
pub struct BatchShuffle {
    rng: StdRng,
}

impl BatchShuffle {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniformly random permutation of `0..n`.
    pub fn permutation(&mut self, n: usize) -> Vec<u32> {
        let mut perm: Vec<u32> = (0..n as u32).collect();
        perm.shuffle(&mut self.rng);
        perm
    }

    /// Permute `batch` along axis 0, returning the handle that undoes it.
    pub fn shuffle(&mut self, batch: &Tensor) -> CvrlResult<(Tensor, Unshuffle)> {
        let n = batch.dim(0).map_err(map_candle)?;
        if n == 0 {
            return Err(CvrlError::EmptyBatch {
                context: "batch shuffle".to_string(),
            });
        }
        let perm = self.permutation(n);
        let shuffled = gather_rows(batch, &perm, batch.device())?;
        Ok((shuffled, Unshuffle::from_permutation(&perm)))
    }
}

/// Inverse of one shuffle; valid for a single batch of the same length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unshuffle {
    inverse: Vec<u32>,
}

impl Unshuffle {
    /// Inverse permutation (argsort of `perm`).
    pub fn from_permutation(perm: &[u32]) -> Self {
        let mut inverse = vec![0u32; perm.len()];
        for (position, &source) in perm.iter().enumerate() {
            inverse[source as usize] = position as u32;
        }
        Self { inverse }
    }

    pub fn len(&self) -> usize {
        self.inverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inverse.is_empty()
    }

    /// Restore the original order of a batch produced from a shuffled one.
    pub fn apply(&self, batch: &Tensor) -> CvrlResult<Tensor> {
        let n = batch.dim(0).map_err(map_candle)?;
        if n != self.inverse.len() {
            let mut expected = batch.dims().to_vec();
            expected[0] = self.inverse.len();
            return Err(CvrlError::ShapeMismatch {
                context: "batch unshuffle".to_string(),
                expected,
                actual: batch.dims().to_vec(),
            });
        }
        gather_rows(batch, &self.inverse, batch.device())
    }
}

fn gather_rows(batch: &Tensor, rows: &[u32], device: &Device) -> CvrlResult<Tensor> {
    let idx = Tensor::from_slice(rows, rows.len(), device).map_err(map_candle)?;
    batch.index_select(&idx, 0).map_err(map_candle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_round_trip_is_exact() {
        let mut shuffler = BatchShuffle::new(7);
        let batch = Tensor::arange(0f32, 24.0, &Device::Cpu)
            .unwrap()
            .reshape((6, 2, 2))
            .unwrap();

        let (shuffled, unshuffle) = shuffler.shuffle(&batch).unwrap();
        assert_eq!(shuffled.dims(), batch.dims());
        let restored = unshuffle.apply(&shuffled).unwrap();

        let a: Vec<f32> = batch.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = restored.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_permutation_is_bijection() {
        let mut shuffler = BatchShuffle::new(1);
        let mut perm = shuffler.permutation(100);
        perm.sort_unstable();
        assert_eq!(perm, (0..100).collect::<Vec<u32>>());
    }

    #[test]
    fn test_inverse_is_argsort() {
        let unshuffle = Unshuffle::from_permutation(&[2, 0, 3, 1]);
        assert_eq!(unshuffle.inverse, vec![1, 3, 0, 2]);
        assert_eq!(unshuffle.len(), 4);
    }

    #[test]
    fn test_same_seed_same_permutation() {
        let mut a = BatchShuffle::new(42);
        let mut b = BatchShuffle::new(42);
        assert_eq!(a.permutation(32), b.permutation(32));
    }

    #[test]
    fn test_length_mismatch_and_empty_batch() {
        let mut shuffler = BatchShuffle::new(0);
        let batch = Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap();
        let (_, unshuffle) = shuffler.shuffle(&batch).unwrap();
        let other = Tensor::zeros((5, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            unshuffle.apply(&other),
            Err(CvrlError::ShapeMismatch { .. })
        ));

        let empty = Tensor::zeros((0, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            shuffler.shuffle(&empty),
            Err(CvrlError::EmptyBatch { .. })
        ));
    }
}
