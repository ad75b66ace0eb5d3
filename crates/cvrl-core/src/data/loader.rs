//! Seeded index batching over a dataset.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Yields batches of dataset indices, reshuffled at the start of every epoch.
#[derive(Debug, Clone)]
pub struct ImageLoader {
    indices: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    position: usize,
    rng: StdRng,
}

impl ImageLoader {
    pub fn new(len: usize, batch_size: usize, shuffle: bool, drop_last: bool, seed: u64) -> Self {
        Self {
            indices: (0..len).collect(),
            batch_size: batch_size.max(1),
            shuffle,
            drop_last,
            position: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per epoch.
    pub fn num_batches(&self) -> usize {
        if self.drop_last {
            self.indices.len() / self.batch_size
        } else {
            (self.indices.len() + self.batch_size - 1) / self.batch_size
        }
    }

    /// Rewind to the first batch, drawing a new order when shuffling.
    pub fn start_epoch(&mut self) {
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
        self.position = 0;
    }

    /// Indices of the next batch, or `None` once the epoch is exhausted.
    pub fn next_batch(&mut self) -> Option<Vec<usize>> {
        let remaining = self.indices.len().saturating_sub(self.position);
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let batch = self.indices[self.position..end].to_vec();
        self.position = end;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(loader: &mut ImageLoader) -> Vec<Vec<usize>> {
        loader.start_epoch();
        std::iter::from_fn(|| loader.next_batch()).collect()
    }

    #[test]
    fn test_sequential_keeps_tail() {
        let mut loader = ImageLoader::new(10, 4, false, false, 0);
        assert_eq!(loader.num_batches(), 3);
        let batches = drain(&mut loader);
        assert_eq!(batches, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
    }

    #[test]
    fn test_drop_last_skips_partial_batch() {
        let mut loader = ImageLoader::new(10, 4, true, true, 0);
        assert_eq!(loader.num_batches(), 2);
        let batches = drain(&mut loader);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 4));
    }

    #[test]
    fn test_shuffled_epochs_cover_every_index() {
        let mut loader = ImageLoader::new(12, 5, true, false, 9);
        let first: Vec<usize> = drain(&mut loader).concat();
        let second: Vec<usize> = drain(&mut loader).concat();
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..12).collect::<Vec<_>>());
        assert_ne!(first, second);
    }

    #[test]
    fn test_same_seed_same_order() {
        let mut a = ImageLoader::new(50, 8, true, true, 42);
        let mut b = ImageLoader::new(50, 8, true, true, 42);
        assert_eq!(drain(&mut a), drain(&mut b));
    }
}
