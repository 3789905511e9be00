//! Declarative state-machine tables shared by all entity machines.
//!
//! A definition is built once per machine type (held in a `LazyLock`) and
//! validated at construction: registering two transitions for the same
//! `(state, trigger)` pair is a programmer error and panics immediately.
//! Lookup is a single hash probe. Machine instances carry a reference to
//! the shared definition plus their current state; attempting a trigger
//! with no registered transition surfaces as a nondeterminism error, since
//! it means history delivered an event the machine cannot be in a position
//! to receive.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use windlass_types::{CommandType, EventType};

use crate::error::WorkflowMachinesError;

/// Synthetic events local to the owning machine, fired by SDK code rather
/// than by history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExplicitEvent {
    /// Fired in the constructor: create the initial command.
    Schedule,
    /// Workflow code requested cancellation.
    Cancel,
    /// Cancellation with abandon semantics: give up without a command.
    Abandon,
    /// A replay marker command was dropped because history holds no
    /// matching marker at this position.
    Skipped,
    /// A non-replay workflow task started; lost local-activity requests
    /// may be re-issued.
    NonReplayTaskStarted,
    /// A local activity finished executing on the worker.
    LocalActivityResolved,
}

/// A transition trigger: the machine's own command being created, a
/// history event, or an explicit machine-local event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Trigger {
    Command(CommandType),
    Event(EventType),
    Explicit(ExplicitEvent),
}

/// Shared transition table: `(state, trigger) → (next state, action)`.
#[derive(Debug)]
pub struct StateMachineDefinition<S, A> {
    name: &'static str,
    final_states: HashSet<S>,
    transitions: HashMap<(S, Trigger), (S, Option<A>)>,
}

impl<S, A> StateMachineDefinition<S, A>
where
    S: Copy + Eq + Hash + Debug,
    A: Copy,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            final_states: HashSet::new(),
            transitions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Declare `state` terminal. Terminal states accept no transitions.
    pub fn final_state(mut self, state: S) -> Self {
        self.final_states.insert(state);
        self
    }

    /// Register `(from, trigger) → to` with no action.
    pub fn transition(self, from: S, trigger: Trigger, to: S) -> Self {
        self.transition_impl(from, trigger, to, None)
    }

    /// Register `(from, trigger) → to` running `action` on the way.
    pub fn transition_with(self, from: S, trigger: Trigger, to: S, action: A) -> Self {
        self.transition_impl(from, trigger, to, Some(action))
    }

    fn transition_impl(mut self, from: S, trigger: Trigger, to: S, action: Option<A>) -> Self {
        let prev = self.transitions.insert((from, trigger), (to, action));
        assert!(
            prev.is_none(),
            "{}: duplicate transition registered for ({:?}, {:?})",
            self.name,
            from,
            trigger
        );
        self
    }

    pub fn is_final(&self, state: S) -> bool {
        self.final_states.contains(&state)
    }

    /// Look up a transition without applying it.
    pub fn lookup(&self, from: S, trigger: Trigger) -> Option<(S, Option<A>)> {
        self.transitions.get(&(from, trigger)).copied()
    }

    /// Apply `trigger` to `state`, returning the transition's action.
    ///
    /// A missing transition is a nondeterminism error: the machine received
    /// an event that cannot follow from its recorded past.
    pub fn apply(&self, state: &mut S, trigger: Trigger) -> Result<Option<A>, WorkflowMachinesError> {
        match self.lookup(*state, trigger) {
            Some((next, action)) => {
                *state = next;
                Ok(action)
            }
            None => Err(WorkflowMachinesError::Nondeterminism(format!(
                "{}: no transition from {:?} on {:?}",
                self.name, state, trigger
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum S {
        A,
        B,
        Done,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Act {
        Fire,
    }

    fn def() -> StateMachineDefinition<S, Act> {
        StateMachineDefinition::new("test")
            .final_state(S::Done)
            .transition(S::A, Trigger::Explicit(ExplicitEvent::Schedule), S::B)
            .transition_with(
                S::B,
                Trigger::Event(EventType::TimerFired),
                S::Done,
                Act::Fire,
            )
    }

    #[test]
    fn apply_walks_the_table() {
        let d = def();
        let mut state = S::A;
        assert_eq!(
            d.apply(&mut state, Trigger::Explicit(ExplicitEvent::Schedule))
                .unwrap(),
            None
        );
        assert_eq!(state, S::B);
        let action = d
            .apply(&mut state, Trigger::Event(EventType::TimerFired))
            .unwrap();
        assert_eq!(action, Some(Act::Fire));
        assert!(d.is_final(state));
    }

    #[test]
    fn unknown_trigger_is_nondeterminism() {
        let d = def();
        let mut state = S::A;
        let err = d
            .apply(&mut state, Trigger::Event(EventType::TimerFired))
            .unwrap_err();
        assert!(err.is_nondeterminism());
        assert_eq!(state, S::A);
    }

    #[test]
    #[should_panic(expected = "duplicate transition")]
    fn duplicate_registration_panics() {
        let _ = def().transition(S::A, Trigger::Explicit(ExplicitEvent::Schedule), S::Done);
    }
}
