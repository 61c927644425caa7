//! Binary-tree gather: planning, buffer management, and simulated execution.

mod action;
mod buffer;
mod dag;
mod exec;
mod geometry;
mod topology;
pub mod verify;

pub use action::{Action, ActionDag, ActionId, ActionKind, ActionNode, CopyMode};
pub use buffer::{
    BufferRole, GatherBuffer, PublicHandle, PublicMemory, PublicMemoryRegistry, RegistryCounters,
    acquire, release,
};
pub use dag::{compile, compile_all, compile_with_mode};
pub use exec::{
    GatherConfig, GatherHandle, GatherStats, GatherTransport, GatherWorld, LinkTransport,
    TransferDoneCallback, start_btree_gather, start_btree_gather_at,
};
pub use geometry::GatherGeometry;
pub use topology::TreeShape;
