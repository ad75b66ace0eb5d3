//! Fixed-capacity FIFO bank of negative keys.

use candle_core::{DType, Device, Tensor};

use crate::error::{CvrlError, CvrlResult};

fn map_candle(e: candle_core::Error) -> CvrlError {
    CvrlError::tensor("Queue", e)
}

/// `(dim, capacity)` buffer of L2-normalized keys, one per column.
///
/// New keys overwrite the oldest columns, starting at the write pointer and
/// wrapping around. The buffer is never resized and entries are never removed
/// except by being overwritten.
#[derive(Debug, Clone)]
pub struct NegativeQueue {
    buffer: Tensor,
    ptr: usize,
    dim: usize,
    capacity: usize,
}

impl NegativeQueue {
    /// Allocate a queue filled with normalized Gaussian columns.
    ///
    /// # Errors
    /// - `QueueCapacity` if `capacity` is not a multiple of `enqueue_batch`
    /// - `InvalidHyperparameter` if `dim` or `capacity` is zero
    pub fn new(dim: usize, capacity: usize, enqueue_batch: usize, device: &Device) -> CvrlResult<Self> {
        if dim == 0 {
            return Err(CvrlError::InvalidHyperparameter {
                name: "dim",
                value: dim.to_string(),
                reason: "queue embedding dimension must be positive".to_string(),
            });
        }
        if capacity == 0 {
            return Err(CvrlError::InvalidHyperparameter {
                name: "queue_size",
                value: capacity.to_string(),
                reason: "queue capacity must be positive".to_string(),
            });
        }
        if enqueue_batch == 0 || capacity % enqueue_batch != 0 {
            return Err(CvrlError::QueueCapacity {
                capacity,
                batch: enqueue_batch,
            });
        }

        let raw = Tensor::randn(0f32, 1f32, (dim, capacity), device).map_err(map_candle)?;
        let norm = raw
            .sqr()
            .and_then(|t| t.sum_keepdim(0))
            .and_then(|t| t.sqrt())
            .and_then(|t| t.maximum(1e-12))
            .map_err(map_candle)?;
        let buffer = raw.broadcast_div(&norm).map_err(map_candle)?;

        Ok(Self {
            buffer,
            ptr: 0,
            dim,
            capacity,
        })
    }

    /// Fail with `QueueCapacity` unless a batch of `n` keys can be enqueued.
    pub fn check_batch(&self, n: usize) -> CvrlResult<()> {
        if n == 0 || self.capacity % n != 0 {
            return Err(CvrlError::QueueCapacity {
                capacity: self.capacity,
                batch: n,
            });
        }
        Ok(())
    }

    /// Overwrite the `n` oldest columns with `keys^T` and advance the pointer.
    ///
    /// `keys` is `(n, dim)` and must satisfy `capacity % n == 0`. A write that
    /// would run past the end starts at column 0 instead. On error the queue
    /// is unchanged.
    pub fn enqueue(&mut self, keys: &Tensor) -> CvrlResult<()> {
        let (n, d) = keys.dims2().map_err(map_candle)?;
        if d != self.dim {
            return Err(CvrlError::ShapeMismatch {
                context: "queue enqueue".to_string(),
                expected: vec![n, self.dim],
                actual: keys.dims().to_vec(),
            });
        }
        if n == 0 {
            return Err(CvrlError::EmptyBatch {
                context: "queue enqueue".to_string(),
            });
        }
        self.check_batch(n)?;
        // Only reachable when earlier batches had a different size.
        let start = if self.ptr + n > self.capacity { 0 } else { self.ptr };

        let columns = keys
            .detach()
            .to_dtype(self.buffer.dtype())
            .and_then(|t| t.t())
            .and_then(|t| t.contiguous())
            .map_err(map_candle)?;
        self.buffer = self
            .buffer
            .slice_assign(&[0..self.dim, start..start + n], &columns)
            .map_err(map_candle)?;
        self.ptr = (start + n) % self.capacity;
        Ok(())
    }

    /// The current buffer, detached from any graph.
    pub fn snapshot(&self) -> Tensor {
        self.buffer.detach()
    }

    /// Column the next enqueue writes to.
    pub fn ptr(&self) -> usize {
        self.ptr
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Replace buffer and pointer with checkpointed values.
    pub(crate) fn restore(&mut self, buffer: &Tensor, ptr: usize) -> CvrlResult<()> {
        if buffer.dims() != [self.dim, self.capacity] {
            return Err(CvrlError::ShapeMismatch {
                context: "queue restore".to_string(),
                expected: vec![self.dim, self.capacity],
                actual: buffer.dims().to_vec(),
            });
        }
        if ptr >= self.capacity {
            return Err(CvrlError::Checkpoint {
                message: format!("queue_ptr {} out of range for capacity {}", ptr, self.capacity),
            });
        }
        self.buffer = buffer
            .detach()
            .to_dtype(DType::F32)
            .map_err(map_candle)?;
        self.ptr = ptr;
        Ok(())
    }
}
