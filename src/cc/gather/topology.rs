//! Binary-tree shape for a communicator of `nproc` ranks.

use serde::Serialize;

/// Shape of the recursive-doubling tree.
///
/// `depth` is the number of doubling rounds needed to cover every rank and
/// `midpoint` the largest power of two strictly below `nproc` (0 when there
/// is a single rank). Ranks `[0, midpoint)` and `[midpoint, nproc)` form the
/// two halves that are gathered independently when the root is not rank 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeShape {
    pub depth: u32,
    pub midpoint: usize,
}

impl TreeShape {
    pub fn plan(nproc: usize) -> Self {
        let mut acc = 1usize;
        let mut depth = 0u32;
        while acc < nproc {
            acc *= 2;
            depth += 1;
        }
        // the last doubling overshot
        TreeShape {
            depth,
            midpoint: acc / 2,
        }
    }

    /// Size of the upper half, i.e. the ranks collected at `midpoint`.
    pub fn upper_half(&self, nproc: usize) -> usize {
        nproc.saturating_sub(self.midpoint)
    }
}

