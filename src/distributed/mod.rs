//! Distributed training plumbing.
//!
//! Collective communication sits behind [`CollectiveCommunicator`].
//! Collectives are blocking and barrier-like: every worker must call
//! them the same number of times in the same order or the group
//! stalls. There is no timeout and no cancellation; a crashed worker
//! stalls the others at the next collective.

use candle_core::{Result, Tensor};

/// Trait for collective communications.
///
/// Implementations:
/// - `NullCommunicator`: single-worker identity backend
/// - `LocalCommunicator`: in-process thread group, used by tests and
///   single-host multi-worker runs
pub trait CollectiveCommunicator: Send + Sync {
    /// Rank of this worker.
    fn rank(&self) -> usize;

    /// Total number of workers.
    fn world_size(&self) -> usize;

    /// Sum a tensor across all ranks and return the result to every
    /// rank.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Gather tensors from all ranks, concatenating along dim 0.
    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Send a tensor from `root_rank` to all ranks.
    fn broadcast(&self, tensor: &Tensor, root_rank: usize) -> Result<Tensor>;
}

pub mod backend;
pub mod optimizer;

pub use backend::{LocalCommunicator, NullCommunicator};
pub use optimizer::{DistributedOptimizer, OptimizerKind};
