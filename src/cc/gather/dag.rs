//! Per-rank action compiler for the binary-tree gather.
//!
//! Every rank runs the same deterministic compiler over the same geometry, so
//! each send it emits has a matching receive on the partner without any
//! runtime handshake.
//!
//! The gather proceeds in three phases:
//! 1. recursive doubling toward rank 0 (and, when the root is not rank 0,
//!    independently toward `midpoint` for the upper half);
//! 2. a local shuffle on the root when the root is `midpoint` itself;
//! 3. relocation of both halves to the root when the root is not rank 0.

use tracing::{debug, trace};

use super::action::{Action, ActionDag, ActionId, ActionKind, CopyMode};
use super::geometry::GatherGeometry;
use super::topology::TreeShape;
use crate::error::Result;

/// Compiles the action chain of `my_rank`.
pub fn compile(my_rank: usize, geometry: &GatherGeometry, shape: &TreeShape) -> Result<ActionDag> {
    compile_with_mode(my_rank, geometry, shape, CopyMode::InPlace)
}

/// Like [`compile`], with `mode` applied to every send and receive.
pub fn compile_with_mode(
    my_rank: usize,
    geometry: &GatherGeometry,
    shape: &TreeShape,
    mode: CopyMode,
) -> Result<ActionDag> {
    geometry.validate()?;
    geometry.check_rank(my_rank)?;

    let mut dag = ActionDag::new(my_rank);
    let mut emit = Emitter {
        dag: &mut dag,
        mode,
    };
    let prev = tree_rounds(&mut emit, my_rank, geometry, shape);
    let prev = shuffle_correction(&mut emit, prev, my_rank, geometry, shape);
    relocate_to_root(&mut emit, prev, my_rank, geometry, shape);

    debug!(
        rank = my_rank,
        root = geometry.root,
        nproc = geometry.nproc,
        actions = dag.len(),
        "compiled gather dag"
    );
    Ok(dag)
}

/// Compiles every rank's chain; entry `r` belongs to rank `r`.
pub fn compile_all(geometry: &GatherGeometry) -> Result<Vec<ActionDag>> {
    geometry.validate()?;
    let shape = TreeShape::plan(geometry.nproc);
    (0..geometry.nproc)
        .map(|rank| compile(rank, geometry, &shape))
        .collect()
}

struct Emitter<'a> {
    dag: &'a mut ActionDag,
    mode: CopyMode,
}

impl Emitter<'_> {
    fn chain(&mut self, prev: Option<ActionId>, action: Action) -> ActionId {
        let action = match action.kind {
            ActionKind::Shuffle => action,
            _ => action.with_mode(self.mode),
        };
        self.dag.chain(prev, action)
    }
}

fn tree_rounds(
    emit: &mut Emitter<'_>,
    me: usize,
    geometry: &GatherGeometry,
    shape: &TreeShape,
) -> Option<ActionId> {
    let nproc = geometry.nproc;
    let nelems = geometry.nelems;
    // With a non-zero root the last round is left to the relocation phase.
    let max_gap = if geometry.root == 0 {
        shape.midpoint
    } else {
        shape.midpoint / 2
    };

    let mut prev = None;
    let mut round = 0u32;
    let mut partner_gap = 1usize;
    let mut stride = 2usize;
    while partner_gap <= max_gap {
        if me % stride == 0 {
            let partner = me + partner_gap;
            if partner < nproc {
                let chunk_stop = (partner + partner_gap).min(nproc);
                let recv = Action::recv(
                    round,
                    partner,
                    partner_gap * nelems,
                    nelems * (chunk_stop - partner),
                );
                trace!(rank = me, ?recv, "tree receive");
                prev = Some(emit.chain(prev, recv));
            }
        } else {
            debug_assert!(me >= partner_gap, "sender {me} has no partner at gap {partner_gap}");
            let partner = me - partner_gap;
            let chunk_stop = (me + partner_gap).min(nproc);
            let send = Action::send(round, partner, 0, nelems * (chunk_stop - me));
            trace!(rank = me, ?send, "tree send");
            // a sender is finished with the tree after its one send
            return Some(emit.chain(prev, send));
        }
        round += 1;
        partner_gap *= 2;
        stride *= 2;
    }
    prev
}

fn shuffle_correction(
    emit: &mut Emitter<'_>,
    prev: Option<ActionId>,
    me: usize,
    geometry: &GatherGeometry,
    shape: &TreeShape,
) -> Option<ActionId> {
    let root = geometry.root;
    if root == 0 || root != shape.midpoint || me != root {
        return prev;
    }
    // the upper half was gathered at the head of the root's buffer
    let shuffle = Action::shuffle(
        shape.depth,
        me,
        shape.midpoint * geometry.nelems,
        shape.upper_half(geometry.nproc) * geometry.nelems,
    );
    Some(emit.chain(prev, shuffle))
}

fn relocate_to_root(
    emit: &mut Emitter<'_>,
    mut prev: Option<ActionId>,
    me: usize,
    geometry: &GatherGeometry,
    shape: &TreeShape,
) {
    let root = geometry.root;
    if root == 0 {
        return;
    }
    let round = shape.depth;
    let nelems = geometry.nelems;
    let lower = nelems * shape.midpoint;
    let upper = nelems * shape.upper_half(geometry.nproc);

    if me == root {
        prev = Some(emit.chain(prev, Action::recv(round, 0, 0, lower)));
        if shape.midpoint != root {
            prev = Some(emit.chain(
                prev,
                Action::recv(round, shape.midpoint, shape.midpoint * nelems, upper),
            ));
        }
    }
    if me == 0 {
        prev = Some(emit.chain(prev, Action::send(round, root, 0, lower)));
    }
    if me == shape.midpoint && shape.midpoint != root {
        // the midpoint's buffer holds only the upper half, starting at its head
        emit.chain(prev, Action::send(round, root, 0, upper));
    }
}
