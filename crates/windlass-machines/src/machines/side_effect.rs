//! Side-effect state machine.
//!
//! On first execution the user function has already run by the time the
//! machine is created; the machine records the result in a
//! `windlass_side_effect` marker and the callback fires immediately.
//! During replay the function is not invoked: a marker command is still
//! queued for alignment, and the callback resolves with the recorded value
//! once the marker event is consumed. A call whose function produced no
//! result creates no machine at all.

use std::sync::LazyLock;

use windlass_types::{
    Command, CommandType, EventAttributes, HistoryEvent, KnownMarker, Payload, SideEffectMarker,
    EventType, SIDE_EFFECT_MARKER_NAME,
};

use super::{notify, CompletionCallback, EntityMachine, MachineResponse, NewMachineWithCommand};
use crate::definition::{ExplicitEvent, StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    Created,
    MarkerCommandCreated,
    MarkerRecorded,
    /// Replay found no marker at this position: the original invocation
    /// produced no result.
    Skipped,
}

static DEFINITION: LazyLock<StateMachineDefinition<State, ()>> = LazyLock::new(|| {
    use Trigger::{Command as Cmd, Event, Explicit};
    StateMachineDefinition::new("SideEffect")
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
            Explicit(ExplicitEvent::Skipped),
            State::Skipped,
        )
});

pub struct SideEffectMachine {
    state: State,
    id: u64,
    replaying: bool,
    /// Callback still pending only on the replay path.
    callback: Option<CompletionCallback>,
}

fn schedule(machine: &mut SideEffectMachine) {
    DEFINITION
        .apply(&mut machine.state, Trigger::Explicit(ExplicitEvent::Schedule))
        .expect("schedule transition is registered");
}

/// First execution: the function ran and produced `result`.
pub fn new_side_effect_executed(
    id: u64,
    result: Payload,
    callback: CompletionCallback,
) -> NewMachineWithCommand<SideEffectMachine> {
    let mut machine = SideEffectMachine {
        state: State::Created,
        id,
        replaying: false,
        callback: None,
    };
    schedule(&mut machine);
    callback(Ok(Some(result.clone())));
    NewMachineWithCommand {
        machine,
        command: Command::RecordMarker {
            marker_name: SIDE_EFFECT_MARKER_NAME.to_string(),
            details: Some(KnownMarker::SideEffect(SideEffectMarker { id, result }).encode()),
        },
    }
}

/// Replay: the result comes from the recorded marker; the queued command
/// exists only to align with it.
pub fn new_side_effect_replaying(
    id: u64,
    callback: CompletionCallback,
) -> NewMachineWithCommand<SideEffectMachine> {
    let mut machine = SideEffectMachine {
        state: State::Created,
        id,
        replaying: true,
        callback: Some(callback),
    };
    schedule(&mut machine);
    NewMachineWithCommand {
        machine,
        command: Command::RecordMarker {
            marker_name: SIDE_EFFECT_MARKER_NAME.to_string(),
            details: Some(
                KnownMarker::SideEffect(SideEffectMarker {
                    id,
                    result: Payload::new(Vec::new()),
                })
                .encode(),
            ),
        },
    }
}

impl SideEffectMachine {
    fn decode(event: &HistoryEvent) -> Option<SideEffectMarker> {
        match &event.attributes {
            EventAttributes::MarkerRecorded {
                marker_name,
                details,
            } => match KnownMarker::parse(marker_name, details.as_ref()) {
                Some(KnownMarker::SideEffect(m)) => Some(m),
                _ => None,
            },
            _ => None,
        }
    }
}

impl EntityMachine for SideEffectMachine {
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
            notify(&mut self.callback, Ok(Some(marker.result)));
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
        // Side effects are instantaneous; there is nothing to cancel.
        Ok(Vec::new())
    }

    fn is_final_state(&self) -> bool {
        DEFINITION.is_final(self.state)
    }

    fn matches_event(&self, event: &HistoryEvent) -> bool {
        self.state == State::MarkerCommandCreated
            && Self::decode(event).is_some_and(|m| m.id == self.id)
    }

    fn is_replay_skippable(&self) -> bool {
        self.replaying && self.state == State::MarkerCommandCreated
    }

    fn resolve_skipped(&mut self) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        DEFINITION.apply(&mut self.state, Trigger::Explicit(ExplicitEvent::Skipped))?;
        notify(&mut self.callback, Ok(None));
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn marker_event(event_id: i64, id: u64, value: &str) -> HistoryEvent {
        HistoryEvent::new(
            event_id,
            EventAttributes::MarkerRecorded {
                marker_name: SIDE_EFFECT_MARKER_NAME.into(),
                details: Some(
                    KnownMarker::SideEffect(SideEffectMarker {
                        id,
                        result: Payload::text(value),
                    })
                    .encode(),
                ),
            },
        )
    }

    #[test]
    fn first_execution_resolves_before_the_event_arrives() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let writer = seen.clone();
        let NewMachineWithCommand { mut machine, command } = new_side_effect_executed(
            1,
            Payload::text("42"),
            Box::new(move |r| writer.borrow_mut().push(r)),
        );
        assert_eq!(seen.borrow()[0], Ok(Some(Payload::text("42"))));
        assert!(matches!(command, Command::RecordMarker { .. }));

        machine.handle_event(&marker_event(7, 1, "42"), true).unwrap();
        assert!(machine.is_final_state());
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn replay_resolves_from_the_recorded_marker() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let writer = seen.clone();
        let NewMachineWithCommand { mut machine, .. } =
            new_side_effect_replaying(1, Box::new(move |r| writer.borrow_mut().push(r)));
        assert!(seen.borrow().is_empty());
        assert!(machine.matches_event(&marker_event(7, 1, "42")));
        assert!(!machine.matches_event(&marker_event(7, 2, "42")));

        machine.handle_event(&marker_event(7, 1, "42"), true).unwrap();
        assert_eq!(seen.borrow()[0], Ok(Some(Payload::text("42"))));
    }
}
