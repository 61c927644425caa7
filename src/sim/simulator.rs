//! Event-driven simulator.

use super::event::Event;
use super::scheduled_event::ScheduledEvent;
use super::time::SimTime;
use super::world::World;
use std::collections::BinaryHeap;
use tracing::{debug, info, trace};

/// Owns simulated time and the pending-event queue. Events scheduled for the
/// same instant run in scheduling order.
#[derive(Default)]
pub struct Simulator {
    now: SimTime,
    next_seq: u64,
    executed: u64,
    q: BinaryHeap<ScheduledEvent>,
}

impl Simulator {
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Events still waiting in the queue.
    pub fn pending(&self) -> usize {
        self.q.len()
    }

    /// Events executed since construction.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Schedules `ev` at `at`; times in the past are clamped to now.
    #[tracing::instrument(level = "trace", skip(self, ev), fields(event_type = std::any::type_name::<E>(), schedule_at = ?at))]
    pub fn schedule<E: Event>(&mut self, at: SimTime, ev: E) {
        let at = at.max(self.now);
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.q.push(ScheduledEvent {
            at,
            seq,
            ev: Box::new(ev),
        });
        trace!(now = ?self.now, seq, queue_size = self.q.len(), "event queued");
    }

    fn step(&mut self, item: ScheduledEvent, world: &mut dyn World) {
        self.now = item.at;
        self.executed = self.executed.saturating_add(1);
        trace!(now = ?self.now, seq = item.seq, remaining = self.q.len(), "executing event");
        item.ev.execute(self, world);
        world.on_tick(self);
    }

    /// Runs events up to and including `until`, then advances the clock to
    /// `until` even if the queue ran dry earlier.
    pub fn run_until(&mut self, until: SimTime, world: &mut dyn World) {
        while self.q.peek().is_some_and(|top| top.at <= until) {
            let Some(item) = self.q.pop() else { break };
            self.step(item, world);
        }
        self.now = self.now.max(until);
    }

    /// Runs until the queue is empty.
    #[tracing::instrument(skip(self, world))]
    pub fn run(&mut self, world: &mut dyn World) {
        let start = self.executed;
        debug!(now = ?self.now, queue_size = self.q.len(), "simulation starting");
        while let Some(item) = self.q.pop() {
            self.step(item, world);
        }
        info!(
            events = self.executed - start,
            final_time = ?self.now,
            "simulation drained"
        );
    }
}
