//! Complete-workflow state machine: one terminal command, one terminal
//! event. Mutually exclusive with fail-workflow; the coordinator rejects
//! any command produced after it.

use std::sync::LazyLock;

use windlass_types::{Command, CommandType, EventType, HistoryEvent, Payload};

use super::{EntityMachine, MachineResponse, NewMachineWithCommand};
use crate::definition::{ExplicitEvent, StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    Created,
    CommandCreated,
    Completed,
}

static DEFINITION: LazyLock<StateMachineDefinition<State, ()>> = LazyLock::new(|| {
    use Trigger::{Command as Cmd, Event, Explicit};
    StateMachineDefinition::new("CompleteWorkflow")
        .final_state(State::Completed)
        .transition(
            State::Created,
            Explicit(ExplicitEvent::Schedule),
            State::CommandCreated,
        )
        .transition(
            State::CommandCreated,
            Cmd(CommandType::CompleteWorkflowExecution),
            State::CommandCreated,
        )
        .transition(
            State::CommandCreated,
            Event(EventType::WorkflowExecutionCompleted),
            State::Completed,
        )
});

pub struct CompleteWorkflowMachine {
    state: State,
}

pub fn complete_workflow(result: Option<Payload>) -> NewMachineWithCommand<CompleteWorkflowMachine> {
    let mut machine = CompleteWorkflowMachine {
        state: State::Created,
    };
    DEFINITION
        .apply(&mut machine.state, Trigger::Explicit(ExplicitEvent::Schedule))
        .expect("schedule transition is registered");
    NewMachineWithCommand {
        machine,
        command: Command::CompleteWorkflowExecution { result },
    }
}

impl EntityMachine for CompleteWorkflowMachine {
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
            && event.event_type() == EventType::WorkflowExecutionCompleted
    }
}
