//! State machine traits.

use crate::{Action, Event};
use std::time::Duration;

/// A deterministic node state machine.
///
/// Runners own the clock: they call [`StateMachine::set_time`] before every
/// [`StateMachine::handle`], so handling the same events at the same times
/// always yields the same actions.
pub trait StateMachine {
    /// Process one event and return the actions it causes.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Advance the state machine's notion of now.
    fn set_time(&mut self, now: Duration);

    /// Current time as last set by the runner.
    fn now(&self) -> Duration;
}

/// A component of a composed state machine.
pub trait SubStateMachine {
    /// Handle the event if it belongs to this component, `None` otherwise.
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>>;

    fn set_time(&mut self, now: Duration);
}
