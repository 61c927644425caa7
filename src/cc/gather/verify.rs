//! Whole-communicator checks over compiled action chains.
//!
//! Pairing is never negotiated at runtime, so these checks are the only thing
//! that catches a send without its receive. [`replay`] additionally runs the
//! chains against real bytes, without timing, and returns the root's buffer.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use super::action::{ActionDag, ActionKind};
use super::buffer::BufferRole;
use super::dag::compile_all;
use super::geometry::GatherGeometry;
use super::topology::TreeShape;
use crate::error::{GatherError, Result};

/// Key of a point-to-point message: (source, destination, round).
type Edge = (usize, usize, u32);

/// Checks that every send has exactly one matching receive and vice versa,
/// with identical sizes.
pub fn verify_pairing(geometry: &GatherGeometry, dags: &[ActionDag]) -> Result<()> {
    geometry.validate()?;
    if dags.len() != geometry.nproc {
        return Err(GatherError::Internal(format!(
            "{} action chains for {} ranks",
            dags.len(),
            geometry.nproc
        )));
    }

    // edge -> (send sizes, recv sizes)
    let mut edges: BTreeMap<Edge, (Vec<usize>, Vec<usize>)> = BTreeMap::new();
    for dag in dags {
        let me = dag.rank();
        for action in dag.actions() {
            if action.kind != ActionKind::Shuffle && action.partner >= geometry.nproc {
                return Err(GatherError::Internal(format!(
                    "rank {me} {} targets rank {} outside communicator of size {}",
                    action.kind.as_str(),
                    action.partner,
                    geometry.nproc
                )));
            }
            match action.kind {
                ActionKind::Send => edges
                    .entry((me, action.partner, action.round))
                    .or_default()
                    .0
                    .push(action.nelems),
                ActionKind::Recv => edges
                    .entry((action.partner, me, action.round))
                    .or_default()
                    .1
                    .push(action.nelems),
                ActionKind::Shuffle => {}
            }
        }
    }

    for ((src, dst, round), (sends, recvs)) in &edges {
        match (sends.as_slice(), recvs.as_slice()) {
            ([s], [r]) if s == r => {}
            ([s], [r]) => {
                return Err(GatherError::Internal(format!(
                    "round {round} {src}->{dst}: send of {s} elements, receive of {r}"
                )));
            }
            ([], _) | (_, [_, _, ..]) => {
                return Err(GatherError::Mispaired {
                    kind: "recv",
                    rank: *dst,
                    round: *round,
                    partner: *src,
                });
            }
            _ => {
                return Err(GatherError::Mispaired {
                    kind: "send",
                    rank: *src,
                    round: *round,
                    partner: *dst,
                });
            }
        }
    }
    debug!(edges = edges.len(), nproc = geometry.nproc, "pairing verified");
    Ok(())
}

/// Deterministic per-rank input used by checks and the CLI.
///
/// Each element starts with its global index as little-endian bytes, so a
/// correctly gathered result holds ascending indices.
pub fn synthetic_contribution(rank: usize, geometry: &GatherGeometry) -> Vec<u8> {
    let mut out = Vec::with_capacity(geometry.contribution_bytes());
    for i in 0..geometry.nelems {
        let global = (rank * geometry.nelems + i) as u64;
        let tag = global.to_le_bytes();
        for b in 0..geometry.elem_size {
            out.push(tag.get(b).copied().unwrap_or(rank as u8 ^ 0xa5));
        }
    }
    out
}

/// Expected root buffer: every contribution concatenated in rank order.
pub fn expected_result(inputs: &[Vec<u8>]) -> Vec<u8> {
    inputs.concat()
}

/// Applies every chain in order against in-memory buffers and returns the
/// root's final buffer.
pub fn replay(geometry: &GatherGeometry, dags: &[ActionDag], inputs: &[Vec<u8>]) -> Result<Vec<u8>> {
    geometry.validate()?;
    if dags.len() != geometry.nproc || inputs.len() != geometry.nproc {
        return Err(GatherError::InvalidConfig(format!(
            "replay needs {} chains and inputs, got {} and {}",
            geometry.nproc,
            dags.len(),
            inputs.len()
        )));
    }
    let shape = TreeShape::plan(geometry.nproc);
    let contribution = geometry.contribution_bytes();

    let mut buffers = Vec::with_capacity(geometry.nproc);
    for (rank, input) in inputs.iter().enumerate() {
        if input.len() != contribution {
            return Err(GatherError::InvalidConfig(format!(
                "rank {rank} contributes {} bytes, expected {contribution}",
                input.len()
            )));
        }
        let size = BufferRole::of(rank, geometry).buffer_bytes(geometry, &shape) as usize;
        let mut buf = vec![0u8; size];
        buf[..contribution].copy_from_slice(input);
        buffers.push(buf);
    }

    let mut cursor = vec![0usize; geometry.nproc];
    let mut mailbox: HashMap<Edge, Vec<u8>> = HashMap::new();
    loop {
        let mut progressed = false;
        for dag in dags {
            let me = dag.rank();
            let actions: Vec<_> = dag.actions().copied().collect();
            while let Some(action) = actions.get(cursor[me]) {
                let start = geometry.elems_to_bytes(action.offset);
                let len = geometry.elems_to_bytes(action.nelems);
                if start + len > buffers[me].len() {
                    return Err(GatherError::Internal(format!(
                        "rank {me} {} of {len} bytes at {start} overruns a {}-byte buffer",
                        action.kind.as_str(),
                        buffers[me].len()
                    )));
                }
                match action.kind {
                    ActionKind::Shuffle => buffers[me].copy_within(0..len, start),
                    ActionKind::Send => {
                        let payload = buffers[me][start..start + len].to_vec();
                        let edge = (me, action.partner, action.round);
                        if mailbox.insert(edge, payload).is_some() {
                            return Err(GatherError::Mispaired {
                                kind: "send",
                                rank: me,
                                round: action.round,
                                partner: action.partner,
                            });
                        }
                    }
                    ActionKind::Recv => {
                        let Some(payload) = mailbox.remove(&(action.partner, me, action.round))
                        else {
                            break;
                        };
                        if payload.len() != len {
                            return Err(GatherError::Internal(format!(
                                "rank {me} expected {len} bytes from {}, got {}",
                                action.partner,
                                payload.len()
                            )));
                        }
                        buffers[me][start..start + len].copy_from_slice(&payload);
                    }
                }
                cursor[me] += 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    let pending_ranks: Vec<usize> = dags
        .iter()
        .filter(|d| cursor[d.rank()] < d.len())
        .map(|d| d.rank())
        .collect();
    if !pending_ranks.is_empty() {
        return Err(GatherError::Incomplete { pending_ranks });
    }
    if let Some(((src, dst, round), _)) = mailbox.into_iter().next() {
        return Err(GatherError::Mispaired {
            kind: "send",
            rank: src,
            round,
            partner: dst,
        });
    }
    Ok(std::mem::take(&mut buffers[geometry.root]))
}

/// Compiles every rank, checks pairing, and replays synthetic data through
/// the chains. Used by `--check` and by debug builds of the executor.
pub fn verify_plan(geometry: &GatherGeometry) -> Result<()> {
    let dags = compile_all(geometry)?;
    verify_pairing(geometry, &dags)?;
    let inputs: Vec<Vec<u8>> = (0..geometry.nproc)
        .map(|rank| synthetic_contribution(rank, geometry))
        .collect();
    let result = replay(geometry, &dags, &inputs)?;
    if result != expected_result(&inputs) {
        return Err(GatherError::Internal(format!(
            "replayed gather of {} ranks to root {} does not reproduce the inputs",
            geometry.nproc, geometry.root
        )));
    }
    Ok(())
}
