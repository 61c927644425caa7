use crate::sim::{Event, SimTime, Simulator, World};
use std::any::Any;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CountingWorld {
    ticks: usize,
}

impl World for CountingWorld {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn on_tick(&mut self, _sim: &mut Simulator) {
        self.ticks += 1;
    }
}

struct Record {
    id: u32,
    log: Arc<Mutex<Vec<(u32, SimTime)>>>,
}

impl Event for Record {
    fn execute(self: Box<Self>, sim: &mut Simulator, _world: &mut dyn World) {
        self.log.lock().expect("log lock").push((self.id, sim.now()));
    }
}

/// Schedules a follow-up `delay` after itself.
struct Chain {
    id: u32,
    delay: SimTime,
    log: Arc<Mutex<Vec<(u32, SimTime)>>>,
}

impl Event for Chain {
    fn execute(self: Box<Self>, sim: &mut Simulator, _world: &mut dyn World) {
        let Chain { id, delay, log } = *self;
        log.lock().expect("log lock").push((id, sim.now()));
        sim.schedule(sim.now().saturating_add(delay), Record { id: id + 1, log });
    }
}

fn record(id: u32, log: &Arc<Mutex<Vec<(u32, SimTime)>>>) -> Record {
    Record {
        id,
        log: Arc::clone(log),
    }
}

#[test]
fn events_run_by_time_then_scheduling_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut sim = Simulator::default();
    sim.schedule(SimTime(10), record(1, &log));
    sim.schedule(SimTime(5), record(2, &log));
    sim.schedule(SimTime(10), record(3, &log));
    assert_eq!(sim.pending(), 3);

    let mut world = CountingWorld::default();
    sim.run(&mut world);

    let ids: Vec<u32> = log.lock().expect("log lock").iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![2, 1, 3]);
    assert_eq!(world.ticks, 3);
    assert_eq!(sim.executed(), 3);
    assert_eq!(sim.pending(), 0);
    assert_eq!(sim.now(), SimTime(10));
}

#[test]
fn events_may_schedule_follow_ups() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut sim = Simulator::default();
    sim.schedule(
        SimTime(4),
        Chain {
            id: 1,
            delay: SimTime(6),
            log: Arc::clone(&log),
        },
    );
    let mut world = CountingWorld::default();
    sim.run(&mut world);

    assert_eq!(
        &*log.lock().expect("log lock"),
        &[(1, SimTime(4)), (2, SimTime(10))]
    );
}

#[test]
fn scheduling_in_the_past_runs_now() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut sim = Simulator::default();
    let mut world = CountingWorld::default();
    sim.run_until(SimTime(20), &mut world);

    sim.schedule(SimTime(3), record(9, &log));
    sim.run(&mut world);
    assert_eq!(&*log.lock().expect("log lock"), &[(9, SimTime(20))]);
}

#[test]
fn run_until_stops_at_the_bound_and_advances_the_clock() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut sim = Simulator::default();
    sim.schedule(SimTime(5), record(1, &log));
    sim.schedule(SimTime(10), record(2, &log));

    let mut world = CountingWorld::default();
    sim.run_until(SimTime(5), &mut world);
    assert_eq!(log.lock().expect("log lock").len(), 1);
    assert_eq!(sim.now(), SimTime(5));

    sim.run_until(SimTime(7), &mut world);
    assert_eq!(log.lock().expect("log lock").len(), 1);
    assert_eq!(sim.now(), SimTime(7));

    sim.run(&mut world);
    assert_eq!(log.lock().expect("log lock").len(), 2);
    assert_eq!(sim.now(), SimTime(10));
}
