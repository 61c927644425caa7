//! Executes compiled gather DAGs on the event-driven simulator.
//!
//! Each rank starts any action whose predecessors have completed. Sends are
//! handed to a [`GatherTransport`]; when the transport reports delivery the
//! send completes and the message is matched against the destination's
//! receive for the same (source, round). Receives posted before their message
//! arrives wait; messages arriving before their receive is posted wait in a
//! mailbox. Shuffles are applied immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace, warn};

use super::action::{ActionDag, ActionId, ActionKind, CopyMode};
use super::buffer::{self, BufferRole, GatherBuffer, PublicMemory, PublicMemoryRegistry};
use super::dag::compile_with_mode;
use super::geometry::GatherGeometry;
use super::topology::TreeShape;
use super::verify::verify_pairing;
use crate::error::{GatherError, Result};
use crate::sim::{Event, SimTime, Simulator, World};

/// Callback invoked by the transport once a transfer has been delivered.
pub type TransferDoneCallback = Box<dyn FnOnce(SimTime, &mut Simulator) + Send>;

/// Moves bytes between ranks. Implementations decide how long that takes.
pub trait GatherTransport: Send + 'static {
    fn start_transfer(
        &mut self,
        transfer_id: u64,
        src: usize,
        dst: usize,
        bytes: u64,
        sim: &mut Simulator,
        world: &mut GatherWorld,
        done: TransferDoneCallback,
    );
}

/// World of a gather run: the public-memory registry every rank uses.
#[derive(Debug, Default)]
pub struct GatherWorld {
    pub memory: PublicMemoryRegistry,
}

impl World for GatherWorld {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// A dedicated link per rank pair: fixed latency plus serialization delay.
#[derive(Debug, Clone, Copy)]
pub struct LinkTransport {
    pub latency: SimTime,
    pub bandwidth_bps: u64,
}

impl LinkTransport {
    pub fn new(latency: SimTime, gbps: u64) -> Self {
        Self {
            latency,
            bandwidth_bps: gbps.saturating_mul(1_000_000_000),
        }
    }

    /// ceil(bytes * 8 / bps) seconds, in nanoseconds.
    pub fn tx_time(&self, bytes: u64) -> SimTime {
        if self.bandwidth_bps == 0 {
            return SimTime(u64::MAX / 4);
        }
        let bits = (bytes as u128).saturating_mul(8);
        let nanos = (bits.saturating_mul(1_000_000_000u128) + (self.bandwidth_bps as u128 - 1))
            / self.bandwidth_bps as u128;
        SimTime(nanos.min(u64::MAX as u128) as u64)
    }
}

impl Default for LinkTransport {
    fn default() -> Self {
        Self::new(SimTime::from_micros(1), 100)
    }
}

struct Delivered {
    done: TransferDoneCallback,
}

impl Event for Delivered {
    fn execute(self: Box<Self>, sim: &mut Simulator, _world: &mut dyn World) {
        let Delivered { done } = *self;
        done(sim.now(), sim);
    }
}

impl GatherTransport for LinkTransport {
    fn start_transfer(
        &mut self,
        transfer_id: u64,
        src: usize,
        dst: usize,
        bytes: u64,
        sim: &mut Simulator,
        _world: &mut GatherWorld,
        done: TransferDoneCallback,
    ) {
        let at = sim
            .now()
            .saturating_add(self.latency)
            .saturating_add(self.tx_time(bytes));
        trace!(transfer_id, src, dst, bytes, arrive_at = ?at, "link transfer");
        sim.schedule(at, Delivered { done });
    }
}

/// Bytes in flight between two ranks. `payload` is absent for timing-only
/// senders.
#[derive(Debug)]
struct Message {
    bytes: u64,
    payload: Option<Vec<u8>>,
}

/// (source, destination, round)
type Edge = (usize, usize, u32);

struct RankState {
    dag: ActionDag,
    buffer: Option<GatherBuffer>,
    started: Vec<bool>,
    done: Vec<bool>,
    remaining: usize,
    posted: Vec<ActionId>,
    done_at: Option<SimTime>,
}

impl RankState {
    fn new(dag: ActionDag, buffer: Option<GatherBuffer>) -> Self {
        let n = dag.len();
        Self {
            dag,
            buffer,
            started: vec![false; n],
            done: vec![false; n],
            remaining: n,
            posted: Vec::new(),
            done_at: None,
        }
    }

    fn ready(&self) -> Vec<ActionId> {
        self.dag
            .ids()
            .filter(|id| !self.started[id.0])
            .filter(|id| self.dag.deps(*id).iter().all(|d| self.done[d.0]))
            .collect()
    }
}

struct PendingTransfer {
    transfer_id: u64,
    src: usize,
    dst: usize,
    round: u32,
    action: ActionId,
    message: Message,
}

struct State {
    geometry: GatherGeometry,
    shape: TreeShape,
    copy_mode: CopyMode,
    ranks: Vec<RankState>,
    mailbox: HashMap<Edge, Message>,
    next_transfer_id: u64,
    transfer_start_at: HashMap<u64, SimTime>,
    start_at: Option<SimTime>,
    done_at: Option<SimTime>,
    error: Option<GatherError>,
    result: Option<Vec<u8>>,
    transfers: u64,
    bytes_sent: u64,
    shuffles: u64,
    buffered_copies: u64,
    transfer_ns: Vec<u64>,
}

impl State {
    fn new(geometry: GatherGeometry, copy_mode: CopyMode, start_flow_id: u64) -> Self {
        Self {
            geometry,
            shape: TreeShape::plan(geometry.nproc),
            copy_mode,
            ranks: Vec::new(),
            mailbox: HashMap::new(),
            next_transfer_id: start_flow_id,
            transfer_start_at: HashMap::new(),
            start_at: None,
            done_at: None,
            error: None,
            result: None,
            transfers: 0,
            bytes_sent: 0,
            shuffles: 0,
            buffered_copies: 0,
            transfer_ns: Vec::new(),
        }
    }

    fn is_over(&self) -> bool {
        self.done_at.is_some() || self.error.is_some()
    }

    /// Compiles every rank and registers its buffer. Buffers acquired before
    /// a failure are released by the caller through `abort`.
    fn setup(&mut self, inputs: &[Option<Vec<u8>>], mem: &mut PublicMemoryRegistry) -> Result<()> {
        self.geometry.validate()?;
        if inputs.len() != self.geometry.nproc {
            return Err(GatherError::InvalidConfig(format!(
                "{} local contributions for {} ranks",
                inputs.len(),
                self.geometry.nproc
            )));
        }
        let mut dags = Vec::with_capacity(self.geometry.nproc);
        for rank in 0..self.geometry.nproc {
            dags.push(compile_with_mode(
                rank,
                &self.geometry,
                &self.shape,
                self.copy_mode,
            )?);
        }
        if cfg!(debug_assertions) {
            verify_pairing(&self.geometry, &dags)?;
        }
        for (rank, dag) in dags.into_iter().enumerate() {
            let role = BufferRole::of(rank, &self.geometry);
            let buffer = buffer::acquire(
                mem,
                role,
                &self.geometry,
                &self.shape,
                inputs[rank].as_deref(),
            )?;
            self.ranks.push(RankState::new(dag, buffer));
        }
        Ok(())
    }

    fn start(
        &mut self,
        inputs: &[Option<Vec<u8>>],
        now: SimTime,
        mem: &mut PublicMemoryRegistry,
    ) -> Result<Vec<PendingTransfer>> {
        self.setup(inputs, mem)?;
        let mut pending = Vec::new();
        for rank in 0..self.ranks.len() {
            if self.ranks[rank].dag.is_empty() {
                self.finish_rank(rank, now, mem)?;
                continue;
            }
            pending.extend(self.progress(rank, now, mem)?);
        }
        Ok(pending)
    }

    fn abort(&mut self, err: GatherError, mem: &mut PublicMemoryRegistry) {
        warn!(target: "collective", error = %err, "gather aborted");
        for rank in &mut self.ranks {
            if let Err(e) = buffer::release(mem, rank.buffer.take(), &self.geometry, &self.shape)
            {
                warn!(target: "collective", error = %e, "release during abort failed");
            }
        }
        self.error = Some(err);
    }

    fn new_transfer_id(&mut self) -> u64 {
        let id = self.next_transfer_id;
        self.next_transfer_id = self.next_transfer_id.wrapping_add(1);
        id
    }

    /// Starts everything `rank` can start and returns the sends to launch.
    fn progress(
        &mut self,
        rank: usize,
        now: SimTime,
        mem: &mut PublicMemoryRegistry,
    ) -> Result<Vec<PendingTransfer>> {
        let mut out = Vec::new();
        loop {
            let ready = self.ranks[rank].ready();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                self.ranks[rank].started[id.0] = true;
                let action = *self.ranks[rank].dag.get(id);
                let start = self.geometry.elems_to_bytes(action.offset);
                let len = self.geometry.elems_to_bytes(action.nelems);
                match action.kind {
                    ActionKind::Shuffle => {
                        if let Some(buf) = &self.ranks[rank].buffer {
                            let whole = mem
                                .bytes_mut(buf.handle)
                                .ok_or(GatherError::UnknownBuffer(buf.handle))?;
                            // the source is the head, so only the destination can overrun
                            if start + len > whole.len() {
                                return Err(GatherError::Internal(format!(
                                    "rank {rank} shuffle to {start}..{} overruns a {}-byte buffer",
                                    start + len,
                                    whole.len()
                                )));
                            }
                            whole.copy_within(0..len, start);
                        }
                        self.shuffles += 1;
                        debug!(rank, round = action.round, offset = action.offset, nelems = action.nelems, "shuffle");
                        self.complete(rank, id, now, mem)?;
                    }
                    ActionKind::Send => {
                        let payload = match &self.ranks[rank].buffer {
                            Some(buf) => Some(region(mem, buf, start, len, rank)?.to_vec()),
                            None => None,
                        };
                        let transfer_id = self.new_transfer_id();
                        self.transfer_start_at.insert(transfer_id, now);
                        debug!(
                            rank,
                            partner = action.partner,
                            round = action.round,
                            bytes = len,
                            transfer_id,
                            "send posted"
                        );
                        out.push(PendingTransfer {
                            transfer_id,
                            src: rank,
                            dst: action.partner,
                            round: action.round,
                            action: id,
                            message: Message {
                                bytes: len as u64,
                                payload,
                            },
                        });
                    }
                    ActionKind::Recv => {
                        let edge = (action.partner, rank, action.round);
                        match self.mailbox.remove(&edge) {
                            Some(message) => self.deliver(rank, id, message, now, mem)?,
                            None => {
                                trace!(rank, partner = action.partner, round = action.round, "recv posted");
                                self.ranks[rank].posted.push(id);
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Writes `message` into the buffer region of receive `id`.
    fn deliver(
        &mut self,
        rank: usize,
        id: ActionId,
        message: Message,
        now: SimTime,
        mem: &mut PublicMemoryRegistry,
    ) -> Result<()> {
        let action = *self.ranks[rank].dag.get(id);
        let start = self.geometry.elems_to_bytes(action.offset);
        let len = self.geometry.elems_to_bytes(action.nelems);
        if message.bytes != len as u64 {
            return Err(GatherError::Internal(format!(
                "rank {rank} round {} expected {len} bytes from {}, got {}",
                action.round, action.partner, message.bytes
            )));
        }
        if let (Some(buf), Some(payload)) = (&self.ranks[rank].buffer, message.payload) {
            let payload = match action.mode {
                CopyMode::InPlace => payload,
                CopyMode::Buffered => {
                    self.buffered_copies += 1;
                    payload.as_slice().to_vec()
                }
            };
            let dst = region(mem, buf, start, len, rank)?;
            dst.copy_from_slice(&payload);
        }
        debug!(rank, partner = action.partner, round = action.round, bytes = len, "recv complete");
        self.complete(rank, id, now, mem)
    }

    fn complete(
        &mut self,
        rank: usize,
        id: ActionId,
        now: SimTime,
        mem: &mut PublicMemoryRegistry,
    ) -> Result<()> {
        let rs = &mut self.ranks[rank];
        debug_assert!(!rs.done[id.0], "action {id:?} on rank {rank} completed twice");
        rs.done[id.0] = true;
        rs.remaining -= 1;
        if rs.remaining > 0 {
            return Ok(());
        }
        self.finish_rank(rank, now, mem)
    }

    fn finish_rank(&mut self, rank: usize, now: SimTime, mem: &mut PublicMemoryRegistry) -> Result<()> {
        let rs = &mut self.ranks[rank];
        rs.done_at = Some(now);
        let released = buffer::release(mem, rs.buffer.take(), &self.geometry, &self.shape)?;
        if rank == self.geometry.root {
            self.result = released;
        }
        debug!(target: "collective", rank, at = ?now, "rank finished gather");
        Ok(())
    }

    /// Marks the send finished and hands the message to its destination.
    fn transfer_done(
        &mut self,
        meta: TransferMeta,
        message: Message,
        now: SimTime,
        mem: &mut PublicMemoryRegistry,
    ) -> Result<Vec<PendingTransfer>> {
        if let Some(start_at) = self.transfer_start_at.remove(&meta.transfer_id) {
            self.transfer_ns.push(now.saturating_sub(start_at).as_nanos());
        }
        self.transfers += 1;
        self.bytes_sent = self.bytes_sent.saturating_add(message.bytes);
        self.complete(meta.src, meta.action, now, mem)?;

        let dst = meta.dst;
        if dst >= self.ranks.len() {
            return Err(GatherError::Internal(format!(
                "transfer {} addressed to rank {dst} outside communicator",
                meta.transfer_id
            )));
        }
        let posted = self.ranks[dst].posted.iter().position(|id| {
            let a = self.ranks[dst].dag.get(*id);
            a.partner == meta.src && a.round == meta.round
        });
        match posted {
            Some(pos) => {
                let id = self.ranks[dst].posted.swap_remove(pos);
                self.deliver(dst, id, message, now, mem)?;
            }
            None => {
                let edge = (meta.src, dst, meta.round);
                if self.mailbox.insert(edge, message).is_some() {
                    return Err(GatherError::Mispaired {
                        kind: "send",
                        rank: meta.src,
                        round: meta.round,
                        partner: dst,
                    });
                }
            }
        }

        let mut out = self.progress(meta.src, now, mem)?;
        out.extend(self.progress(dst, now, mem)?);
        Ok(out)
    }

    fn check_finished(&mut self, now: SimTime) {
        if self.done_at.is_none() && self.ranks.iter().all(|r| r.done_at.is_some()) {
            self.done_at = Some(now);
            info!(
                target: "collective",
                nproc = self.geometry.nproc,
                root = self.geometry.root,
                transfers = self.transfers,
                bytes = self.bytes_sent,
                at = ?now,
                "gather complete"
            );
        }
    }
}

/// Byte range `[start, start+len)` of a rank's registered buffer.
fn region<'m>(
    mem: &'m mut PublicMemoryRegistry,
    buf: &GatherBuffer,
    start: usize,
    len: usize,
    rank: usize,
) -> Result<&'m mut [u8]> {
    let bytes = mem
        .bytes_mut(buf.handle)
        .ok_or(GatherError::UnknownBuffer(buf.handle))?;
    let total = bytes.len();
    bytes.get_mut(start..start + len).ok_or_else(|| {
        GatherError::Internal(format!(
            "rank {rank} range {start}..{} overruns a {total}-byte buffer",
            start + len
        ))
    })
}

#[derive(Debug, Clone, Copy)]
struct TransferMeta {
    transfer_id: u64,
    src: usize,
    dst: usize,
    round: u32,
    action: ActionId,
}

struct StartGather {
    state: Arc<Mutex<State>>,
    transport: Arc<Mutex<Box<dyn GatherTransport>>>,
    inputs: Vec<Option<Vec<u8>>>,
}

struct TransferDone {
    state: Arc<Mutex<State>>,
    transport: Arc<Mutex<Box<dyn GatherTransport>>>,
    meta: TransferMeta,
    message: Message,
}

fn gather_world(world: &mut dyn World) -> &mut GatherWorld {
    world
        .as_any_mut()
        .downcast_mut::<GatherWorld>()
        .expect("world must be GatherWorld")
}

fn launch(
    pending: Vec<PendingTransfer>,
    state: &Arc<Mutex<State>>,
    transport: &Arc<Mutex<Box<dyn GatherTransport>>>,
    sim: &mut Simulator,
    world: &mut GatherWorld,
) {
    if pending.is_empty() {
        return;
    }
    let mut tx = transport.lock().expect("gather transport lock");
    for p in pending {
        let meta = TransferMeta {
            transfer_id: p.transfer_id,
            src: p.src,
            dst: p.dst,
            round: p.round,
            action: p.action,
        };
        let bytes = p.message.bytes;
        let done_state = Arc::clone(state);
        let done_transport = Arc::clone(transport);
        let message = p.message;
        let done: TransferDoneCallback = Box::new(move |now, sim| {
            sim.schedule(
                now,
                TransferDone {
                    state: done_state,
                    transport: done_transport,
                    meta,
                    message,
                },
            );
        });
        tx.start_transfer(meta.transfer_id, meta.src, meta.dst, bytes, sim, world, done);
    }
}

impl Event for StartGather {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let StartGather {
            state,
            transport,
            inputs,
        } = *self;
        let w = gather_world(world);
        let now = sim.now();

        let pending = {
            let mut st = state.lock().expect("gather state lock");
            st.start_at = Some(now);
            info!(
                target: "collective",
                nproc = st.geometry.nproc,
                root = st.geometry.root,
                depth = st.shape.depth,
                midpoint = st.shape.midpoint,
                "gather starting"
            );
            match st.start(&inputs, now, &mut w.memory) {
                Ok(pending) => {
                    st.check_finished(now);
                    pending
                }
                Err(e) => {
                    st.abort(e, &mut w.memory);
                    Vec::new()
                }
            }
        };
        launch(pending, &state, &transport, sim, w);
    }
}

impl Event for TransferDone {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let TransferDone {
            state,
            transport,
            meta,
            message,
        } = *self;
        let w = gather_world(world);
        let now = sim.now();

        let pending = {
            let mut st = state.lock().expect("gather state lock");
            if st.is_over() {
                return;
            }
            match st.transfer_done(meta, message, now, &mut w.memory) {
                Ok(pending) => {
                    st.check_finished(now);
                    pending
                }
                Err(e) => {
                    st.abort(e, &mut w.memory);
                    Vec::new()
                }
            }
        };
        launch(pending, &state, &transport, sim, w);
    }
}

/// Configuration for one simulated gather.
pub struct GatherConfig {
    pub geometry: GatherGeometry,
    /// Local contribution per rank; `None` runs that rank timing-only.
    pub inputs: Vec<Option<Vec<u8>>>,
    /// Copy mode of every send and receive.
    pub copy_mode: CopyMode,
    pub start_flow_id: u64,
    pub transport: Box<dyn GatherTransport>,
}

/// Runtime stats collected by a gather.
#[derive(Debug, Clone)]
pub struct GatherStats {
    pub start_at: Option<SimTime>,
    pub done_at: Option<SimTime>,
    pub rank_done_at: Vec<Option<SimTime>>,
    pub transfers: u64,
    pub bytes_sent: u64,
    pub shuffles: u64,
    pub buffered_copies: u64,
    pub transfer_ns: Vec<u64>,
}

/// Handle for inspecting a gather's progress and result.
pub struct GatherHandle {
    state: Arc<Mutex<State>>,
}

impl GatherHandle {
    pub fn stats(&self) -> GatherStats {
        let st = self.state.lock().expect("gather state lock");
        GatherStats {
            start_at: st.start_at,
            done_at: st.done_at,
            rank_done_at: st.ranks.iter().map(|r| r.done_at).collect(),
            transfers: st.transfers,
            bytes_sent: st.bytes_sent,
            shuffles: st.shuffles,
            buffered_copies: st.buffered_copies,
            transfer_ns: st.transfer_ns.clone(),
        }
    }

    /// Compiled chain of every rank, once the gather has started.
    pub fn dags(&self) -> Vec<ActionDag> {
        let st = self.state.lock().expect("gather state lock");
        st.ranks.iter().map(|r| r.dag.clone()).collect()
    }

    /// The root's gathered buffer, or `None` when the root ran timing-only.
    pub fn result(&self) -> Result<Option<Vec<u8>>> {
        let st = self.state.lock().expect("gather state lock");
        if let Some(err) = &st.error {
            return Err(err.clone());
        }
        if st.done_at.is_none() {
            let pending_ranks = if st.ranks.is_empty() {
                (0..st.geometry.nproc).collect()
            } else {
                st.ranks
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.done_at.is_none())
                    .map(|(rank, _)| rank)
                    .collect()
            };
            return Err(GatherError::Incomplete { pending_ranks });
        }
        Ok(st.result.clone())
    }
}

/// Schedule a binary-tree gather at `SimTime::ZERO`.
pub fn start_btree_gather(sim: &mut Simulator, cfg: GatherConfig) -> GatherHandle {
    start_btree_gather_at(sim, cfg, SimTime::ZERO)
}

/// Schedule a binary-tree gather at `start_at`.
pub fn start_btree_gather_at(
    sim: &mut Simulator,
    cfg: GatherConfig,
    start_at: SimTime,
) -> GatherHandle {
    let state = Arc::new(Mutex::new(State::new(cfg.geometry, cfg.copy_mode, cfg.start_flow_id)));
    let transport = Arc::new(Mutex::new(cfg.transport));
    sim.schedule(
        start_at,
        StartGather {
            state: Arc::clone(&state),
            transport,
            inputs: cfg.inputs,
        },
    );
    GatherHandle { state }
}
