//! Discrete-event simulation kernel.
//!
//! Simulated time, events, the world they act on, and the simulator that
//! orders them. Scenario files describing a gather run also live here.

mod event;
mod scenario;
mod scheduled_event;
mod simulator;
mod time;
mod world;

pub use event::Event;
pub use scenario::{CommSpec, LinkSpec, PayloadMode, ScenarioMeta, ScenarioSpec};
pub use scheduled_event::ScheduledEvent;
pub use simulator::Simulator;
pub use time::SimTime;
pub use world::World;
