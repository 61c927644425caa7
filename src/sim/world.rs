//! World trait.

use super::simulator::Simulator;
use std::any::Any;

/// Mutable state shared by all events of a run (buffers, registries, ...).
pub trait World: Any {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Called after every executed event.
    fn on_tick(&mut self, _sim: &mut Simulator) {}
}
