//! Mutable-side-effect state machine.
//!
//! Keyed by a user-chosen id. On first execution each invocation computes
//! `new = f(previous)` and a marker is recorded only when the value
//! changed, so history holds a sparse subset of invocations. The marker
//! carries a `skip_count` (invocations since the last recorded marker for
//! the id); during replay a call matches a marker only when id and skip
//! count both align, otherwise its alignment command is skipped and the
//! call resolves with the last recorded value. The user function is never
//! invoked during replay.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::LazyLock;

use windlass_types::{
    Command, CommandType, EventAttributes, EventType, HistoryEvent, KnownMarker,
    MutableSideEffectMarker, Payload, MUTABLE_SIDE_EFFECT_MARKER_NAME,
};

use super::{notify, CompletionCallback, EntityMachine, MachineResponse, NewMachineWithCommand};
use crate::definition::{ExplicitEvent, StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

/// Per-workflow mutable-side-effect bookkeeping, shared between the
/// coordinator and the machines it creates.
#[derive(Debug, Default)]
pub struct MutableSideEffectState {
    /// Latest value per id, live or replayed.
    pub latest: HashMap<String, Payload>,
    /// Invocations since the last recorded marker, per id.
    pub skip_counts: HashMap<String, u32>,
}

pub type SharedMutableSideEffectState = Rc<RefCell<MutableSideEffectState>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    Created,
    MarkerCommandCreated,
    MarkerRecorded,
    Skipped,
}

static DEFINITION: LazyLock<StateMachineDefinition<State, ()>> = LazyLock::new(|| {
    use Trigger::{Command as Cmd, Event, Explicit};
    StateMachineDefinition::new("MutableSideEffect")
        .final_state(State::MarkerRecorded)
        .final_state(State::Skipped)
        .transition(
            State::Created,
            Explicit(ExplicitEvent::Schedule),
            State::MarkerCommandCreated,
        )
        .transition(
            State::MarkerCommandCreated,
            Cmd(CommandType::RecordMarker),
            State::MarkerCommandCreated,
        )
        .transition(
            State::MarkerCommandCreated,
            Event(EventType::MarkerRecorded),
            State::MarkerRecorded,
        )
        .transition(
            State::MarkerCommandCreated,
            Trigger::Explicit(ExplicitEvent::Skipped),
            State::Skipped,
        )
});

pub struct MutableSideEffectMachine {
    state: State,
    id: String,
    expected_skip_count: u32,
    replaying: bool,
    shared: SharedMutableSideEffectState,
    callback: Option<CompletionCallback>,
}

fn schedule(machine: &mut MutableSideEffectMachine) {
    DEFINITION
        .apply(&mut machine.state, Trigger::Explicit(ExplicitEvent::Schedule))
        .expect("schedule transition is registered");
}

fn marker_command(marker: MutableSideEffectMarker) -> Command {
    Command::RecordMarker {
        marker_name: MUTABLE_SIDE_EFFECT_MARKER_NAME.to_string(),
        details: Some(KnownMarker::MutableSideEffect(marker).encode()),
    }
}

/// First execution, value changed: record it and resolve immediately.
pub fn new_mutable_side_effect_recorded(
    id: String,
    value: Payload,
    shared: SharedMutableSideEffectState,
    callback: CompletionCallback,
) -> NewMachineWithCommand<MutableSideEffectMachine> {
    let skip_count = {
        let mut s = shared.borrow_mut();
        let count = s.skip_counts.insert(id.clone(), 0).unwrap_or(0);
        s.latest.insert(id.clone(), value.clone());
        count
    };
    let mut machine = MutableSideEffectMachine {
        state: State::Created,
        id: id.clone(),
        expected_skip_count: skip_count,
        replaying: false,
        shared,
        callback: None,
    };
    schedule(&mut machine);
    callback(Ok(Some(value.clone())));
    NewMachineWithCommand {
        machine,
        command: marker_command(MutableSideEffectMarker {
            id,
            skip_count,
            value,
        }),
    }
}

/// Replay: queue an alignment command; resolution comes from the matching
/// marker or, when history has none at this position, from the cache.
pub fn new_mutable_side_effect_replaying(
    id: String,
    shared: SharedMutableSideEffectState,
    callback: CompletionCallback,
) -> NewMachineWithCommand<MutableSideEffectMachine> {
    let expected_skip_count = *shared.borrow().skip_counts.get(&id).unwrap_or(&0);
    let mut machine = MutableSideEffectMachine {
        state: State::Created,
        id: id.clone(),
        expected_skip_count,
        replaying: true,
        shared,
        callback: Some(callback),
    };
    schedule(&mut machine);
    NewMachineWithCommand {
        machine,
        command: marker_command(MutableSideEffectMarker {
            id,
            skip_count: expected_skip_count,
            value: Payload::new(Vec::new()),
        }),
    }
}

impl MutableSideEffectMachine {
    fn decode(event: &HistoryEvent) -> Option<MutableSideEffectMarker> {
        match &event.attributes {
            EventAttributes::MarkerRecorded {
                marker_name,
                details,
            } => match KnownMarker::parse(marker_name, details.as_ref()) {
                Some(KnownMarker::MutableSideEffect(m)) => Some(m),
                _ => None,
            },
            _ => None,
        }
    }
}

impl EntityMachine for MutableSideEffectMachine {
    fn name(&self) -> &'static str {
        DEFINITION.name()
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        _has_next: bool,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        DEFINITION.apply(&mut self.state, Trigger::Event(event.event_type()))?;
        if let Some(marker) = Self::decode(event) {
            {
                let mut s = self.shared.borrow_mut();
                s.latest.insert(self.id.clone(), marker.value.clone());
                s.skip_counts.insert(self.id.clone(), 0);
            }
            notify(&mut self.callback, Ok(Some(marker.value)));
        }
        Ok(Vec::new())
    }

    fn handle_command(
        &mut self,
        command_type: CommandType,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        DEFINITION.apply(&mut self.state, Trigger::Command(command_type))?;
        Ok(Vec::new())
    }

    fn cancel(&mut self) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        Ok(Vec::new())
    }

    fn is_final_state(&self) -> bool {
        DEFINITION.is_final(self.state)
    }

    fn matches_event(&self, event: &HistoryEvent) -> bool {
        self.state == State::MarkerCommandCreated
            && Self::decode(event)
                .is_some_and(|m| m.id == self.id && m.skip_count == self.expected_skip_count)
    }

    fn is_replay_skippable(&self) -> bool {
        self.replaying && self.state == State::MarkerCommandCreated
    }

    fn resolve_skipped(&mut self) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        DEFINITION.apply(&mut self.state, Trigger::Explicit(ExplicitEvent::Skipped))?;
        let value = {
            let mut s = self.shared.borrow_mut();
            *s.skip_counts.entry(self.id.clone()).or_insert(0) += 1;
            s.latest.get(&self.id).cloned()
        };
        let value = value.ok_or_else(|| {
            WorkflowMachinesError::Nondeterminism(format!(
                "mutable side effect '{}' replayed with no recorded value",
                self.id
            ))
        })?;
        notify(&mut self.callback, Ok(Some(value)));
        Ok(Vec::new())
    }
}
