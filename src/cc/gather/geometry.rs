//! Communicator geometry shared by every rank of one gather.

use serde::{Deserialize, Serialize};

use crate::error::{GatherError, Result};

/// Inputs of one gather invocation; identical on every rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatherGeometry {
    pub nproc: usize,
    pub root: usize,
    /// Elements contributed by each rank.
    pub nelems: usize,
    /// Bytes per element.
    pub elem_size: usize,
}

impl GatherGeometry {
    pub fn validate(&self) -> Result<()> {
        if self.nproc == 0 {
            return Err(GatherError::InvalidConfig(
                "communicator must contain at least one rank".to_string(),
            ));
        }
        if self.root >= self.nproc {
            return Err(GatherError::InvalidConfig(format!(
                "root {} outside communicator of size {}",
                self.root, self.nproc
            )));
        }
        if self.elem_size == 0 {
            return Err(GatherError::InvalidConfig(
                "element size must be non-zero".to_string(),
            ));
        }
        // every offset and size below is bounded by the result size
        if self
            .nproc
            .checked_mul(self.nelems)
            .and_then(|e| e.checked_mul(self.elem_size))
            .is_none()
        {
            return Err(GatherError::InvalidConfig(format!(
                "result of {} ranks x {} elements x {} bytes does not fit in memory",
                self.nproc, self.nelems, self.elem_size
            )));
        }
        Ok(())
    }

    pub fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.nproc {
            return Err(GatherError::InvalidRank {
                rank,
                nproc: self.nproc,
            });
        }
        Ok(())
    }

    /// Bytes contributed by a single rank.
    pub fn contribution_bytes(&self) -> usize {
        self.nelems.saturating_mul(self.elem_size)
    }

    /// Bytes of the fully gathered result held by the root.
    pub fn result_bytes(&self) -> usize {
        self.nproc.saturating_mul(self.contribution_bytes())
    }

    pub fn elems_to_bytes(&self, elems: usize) -> usize {
        elems.saturating_mul(self.elem_size)
    }
}
