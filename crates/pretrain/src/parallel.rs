use candle_core::Tensor;

use crate::PretrainError;

/// Collective operations of one process group. Keeping these behind a
/// trait lets single-process runs and tests drive the exact control
/// flow that a multi-rank deployment would.
pub trait ParallelGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Broadcast a tensor from the source rank to every rank. The
    /// source rank passes `Some`, the others pass `None` and receive
    /// the replicated tensor.
    fn broadcast(&self, src_rank: usize, tensor: Option<Tensor>)
        -> Result<Tensor, PretrainError>;

    /// Average the given scalars across all ranks in place.
    fn all_reduce_mean(&self, values: &mut [f64]) -> Result<(), PretrainError>;

    fn barrier(&self) -> Result<(), PretrainError>;

    fn is_rank_zero(&self) -> bool {
        self.rank() == 0
    }
}

/// Degenerate one-rank group. Broadcast returns the local tensor and
/// reductions are identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ParallelGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(
        &self,
        src_rank: usize,
        tensor: Option<Tensor>,
    ) -> Result<Tensor, PretrainError> {
        if src_rank != 0 {
            return Err(PretrainError::runtime(format!(
                "broadcast source rank {} out of range for a single-process group",
                src_rank
            )));
        }
        tensor.ok_or_else(|| {
            PretrainError::runtime("broadcast source rank must supply a tensor")
        })
    }

    fn all_reduce_mean(&self, _values: &mut [f64]) -> Result<(), PretrainError> {
        Ok(())
    }

    fn barrier(&self) -> Result<(), PretrainError> {
        Ok(())
    }
}
