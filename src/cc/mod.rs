//! Collective communication algorithms.

pub mod gather;
