//! Fail-workflow state machine.

use std::sync::LazyLock;

use windlass_types::{Command, CommandType, EventType, Failure, HistoryEvent};

use super::{EntityMachine, MachineResponse, NewMachineWithCommand};
use crate::definition::{ExplicitEvent, StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    Created,
    CommandCreated,
    Failed,
}

static DEFINITION: LazyLock<StateMachineDefinition<State, ()>> = LazyLock::new(|| {
    use Trigger::{Command as Cmd, Event, Explicit};
    StateMachineDefinition::new("FailWorkflow")
        .final_state(State::Failed)
        .transition(
            State::Created,
            Explicit(ExplicitEvent::Schedule),
            State::CommandCreated,
        )
        .transition(
            State::CommandCreated,
            Cmd(CommandType::FailWorkflowExecution),
            State::CommandCreated,
        )
        .transition(
            State::CommandCreated,
            Event(EventType::WorkflowExecutionFailed),
            State::Failed,
        )
});

pub struct FailWorkflowMachine {
    state: State,
}

pub fn fail_workflow(failure: Failure) -> NewMachineWithCommand<FailWorkflowMachine> {
    let mut machine = FailWorkflowMachine {
        state: State::Created,
    };
    DEFINITION
        .apply(&mut machine.state, Trigger::Explicit(ExplicitEvent::Schedule))
        .expect("schedule transition is registered");
    NewMachineWithCommand {
        machine,
        command: Command::FailWorkflowExecution { failure },
    }
}

impl EntityMachine for FailWorkflowMachine {
    fn name(&self) -> &'static str {
        DEFINITION.name()
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        _has_next: bool,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        DEFINITION.apply(&mut self.state, Trigger::Event(event.event_type()))?;
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
        self.state == State::CommandCreated
            && event.event_type() == EventType::WorkflowExecutionFailed
    }
}
