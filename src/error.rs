//! Error types for gather planning and execution.

use thiserror::Error;

use crate::cc::gather::PublicHandle;

/// Result type used throughout the collective planner.
pub type Result<T> = std::result::Result<T, GatherError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatherError {
    /// Geometry or scenario rejected before anything was compiled.
    #[error("invalid gather configuration: {0}")]
    InvalidConfig(String),

    #[error("rank {rank} outside communicator of size {nproc}")]
    InvalidRank { rank: usize, nproc: usize },

    /// The memory-registration layer could not provide a public buffer.
    #[error("public memory exhausted: requested {requested} bytes, {available} available")]
    OutOfPublicMemory { requested: u64, available: u64 },

    #[error("unknown public buffer {0:?}")]
    UnknownBuffer(PublicHandle),

    #[error("public buffer {handle:?} registered with {expected} bytes, released with {actual}")]
    SizeMismatch {
        handle: PublicHandle,
        expected: u64,
        actual: u64,
    },

    /// A send without its reciprocal receive (or the reverse).
    #[error("mispaired {kind} on rank {rank}: round {round}, partner {partner}")]
    Mispaired {
        kind: &'static str,
        rank: usize,
        round: u32,
        partner: usize,
    },

    #[error("internal planner error: {0}")]
    Internal(String),

    #[error("gather did not complete; ranks still pending: {pending_ranks:?}")]
    Incomplete { pending_ranks: Vec<usize> },
}

impl GatherError {
    /// Configuration and resource errors abort the operation for every rank;
    /// anything else is a planner defect.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Mispaired { .. } | Self::Internal(_))
    }
}
