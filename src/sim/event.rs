//! Event trait.

use super::simulator::Simulator;
use super::world::World;

/// Something that happens at a scheduled instant. Events are consumed when
/// they run, so they may move their payload out of `self`.
pub trait Event: Send + 'static {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World);
}
