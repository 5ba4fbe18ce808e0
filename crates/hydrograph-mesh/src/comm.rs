//! Global reductions across partitions.

/// Collective reductions over all ranks sharing a mesh.
///
/// Every rank must call the same reductions in the same order; a call
/// blocks until all ranks have contributed.
pub trait Communicator: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Global maximum of `local`.
    fn max_all(&self, local: f64) -> f64;

    /// Global minimum of `local`.
    fn min_all(&self, local: f64) -> f64;

    /// Global sum of `local`.
    fn sum_all(&self, local: f64) -> f64;
}

/// Single-rank communicator. Every reduction is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn max_all(&self, local: f64) -> f64 {
        local
    }

    fn min_all(&self, local: f64) -> f64 {
        local
    }

    fn sum_all(&self, local: f64) -> f64 {
        local
    }
}
