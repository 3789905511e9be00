//! Version (`get_version`) state machine, keyed by a user `change_id`.
//!
//! The first call on first execution records a `windlass_version` marker
//! carrying `max_supported`; every later call returns the recorded value.
//! During replay the coordinator preloads version markers from each batch
//! before dispatch, so a marker whose `get_version` call was removed from
//! the code is absorbed by the preloaded machine instead of failing the
//! task, and a call replayed before its marker event arrives still sees
//! the recorded value.

use std::sync::LazyLock;

use windlass_types::{
    Command, CommandType, EventAttributes, EventType, HistoryEvent, KnownMarker, VersionMarker,
    VERSION_MARKER_NAME,
};

use super::{EntityMachine, MachineResponse, NewMachineWithCommand};
use crate::definition::{ExplicitEvent, StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

/// Returned by `get_version` during replay when history has no marker for
/// the change id: the code path that existed before the change was made.
pub const DEFAULT_VERSION: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    Created,
    MarkerCommandCreated,
    /// Created from a preloaded marker; no command exists.
    Preloaded,
    MarkerRecorded,
}

static DEFINITION: LazyLock<StateMachineDefinition<State, ()>> = LazyLock::new(|| {
    use Trigger::{Command as Cmd, Event, Explicit};
    StateMachineDefinition::new("Version")
        .final_state(State::MarkerRecorded)
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
            State::Preloaded,
            Event(EventType::MarkerRecorded),
            State::MarkerRecorded,
        )
});

pub struct VersionMachine {
    state: State,
    change_id: String,
    version: i32,
}

/// First execution: record `version` (the caller's `max_supported`).
pub fn new_version_recording(
    change_id: String,
    version: i32,
) -> NewMachineWithCommand<VersionMachine> {
    let mut machine = VersionMachine {
        state: State::Created,
        change_id: change_id.clone(),
        version,
    };
    DEFINITION
        .apply(&mut machine.state, Trigger::Explicit(ExplicitEvent::Schedule))
        .expect("schedule transition is registered");
    NewMachineWithCommand {
        machine,
        command: Command::RecordMarker {
            marker_name: VERSION_MARKER_NAME.to_string(),
            details: Some(KnownMarker::Version(VersionMarker { change_id, version }).encode()),
        },
    }
}

/// Replay: a marker for `change_id` was seen in the incoming batch.
pub fn new_version_preloaded(change_id: String, version: i32) -> VersionMachine {
    VersionMachine {
        state: State::Preloaded,
        change_id,
        version,
    }
}

impl VersionMachine {
    pub fn change_id(&self) -> &str {
        &self.change_id
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    fn decode(event: &HistoryEvent) -> Option<VersionMarker> {
        match &event.attributes {
            EventAttributes::MarkerRecorded {
                marker_name,
                details,
            } => match KnownMarker::parse(marker_name, details.as_ref()) {
                Some(KnownMarker::Version(m)) => Some(m),
                _ => None,
            },
            _ => None,
        }
    }
}

impl EntityMachine for VersionMachine {
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
            self.version = marker.version;
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
            && Self::decode(event).is_some_and(|m| m.change_id == self.change_id)
    }
}
