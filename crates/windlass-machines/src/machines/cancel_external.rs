//! Cancel-external-workflow state machine. Mirrors the signal-external
//! machine: one request, one completion callback.

use std::sync::LazyLock;

use windlass_types::{Command, CommandType, EventAttributes, EventType, Failure, HistoryEvent};

use super::{notify, CompletionCallback, EntityMachine, MachineResponse, NewMachineWithCommand};
use crate::definition::{ExplicitEvent, StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    Created,
    CommandCreated,
    Initiated,
    Requested,
    Failed,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Resolve,
    Fail,
}

static DEFINITION: LazyLock<StateMachineDefinition<State, Action>> = LazyLock::new(|| {
    use Trigger::{Command as Cmd, Event, Explicit};
    StateMachineDefinition::new("CancelExternal")
        .final_state(State::Requested)
        .final_state(State::Failed)
        .final_state(State::Canceled)
        .transition(
            State::Created,
            Explicit(ExplicitEvent::Schedule),
            State::CommandCreated,
        )
        .transition(
            State::CommandCreated,
            Cmd(CommandType::RequestCancelExternalWorkflowExecution),
            State::CommandCreated,
        )
        .transition(
            State::CommandCreated,
            Event(EventType::RequestCancelExternalWorkflowExecutionInitiated),
            State::Initiated,
        )
        .transition(
            State::CommandCreated,
            Explicit(ExplicitEvent::Cancel),
            State::Canceled,
        )
        .transition_with(
            State::Initiated,
            Event(EventType::ExternalWorkflowExecutionCancelRequested),
            State::Requested,
            Action::Resolve,
        )
        .transition_with(
            State::Initiated,
            Event(EventType::RequestCancelExternalWorkflowExecutionFailed),
            State::Failed,
            Action::Fail,
        )
});

pub struct CancelExternalMachine {
    state: State,
    workflow_id: String,
    callback: Option<CompletionCallback>,
    cancelled_before_sent: bool,
}

pub fn new_cancel_external(
    workflow_id: String,
    child_workflow_only: bool,
    callback: CompletionCallback,
) -> NewMachineWithCommand<CancelExternalMachine> {
    let mut machine = CancelExternalMachine {
        state: State::Created,
        workflow_id: workflow_id.clone(),
        callback: Some(callback),
        cancelled_before_sent: false,
    };
    DEFINITION
        .apply(&mut machine.state, Trigger::Explicit(ExplicitEvent::Schedule))
        .expect("schedule transition is registered");
    NewMachineWithCommand {
        machine,
        command: Command::RequestCancelExternalWorkflowExecution {
            workflow_id,
            child_workflow_only,
        },
    }
}

impl EntityMachine for CancelExternalMachine {
    fn name(&self) -> &'static str {
        DEFINITION.name()
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        _has_next: bool,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        let action = DEFINITION.apply(&mut self.state, Trigger::Event(event.event_type()))?;
        match (action, &event.attributes) {
            (Some(Action::Resolve), _) => notify(&mut self.callback, Ok(None)),
            (
                Some(Action::Fail),
                EventAttributes::RequestCancelExternalWorkflowExecutionFailed { cause, .. },
            ) => notify(
                &mut self.callback,
                Err(Failure::application("cancel-external-failed", cause.clone())),
            ),
            _ => {}
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
        if self.state != State::CommandCreated {
            return Ok(Vec::new());
        }
        DEFINITION.apply(&mut self.state, Trigger::Explicit(ExplicitEvent::Cancel))?;
        self.cancelled_before_sent = true;
        notify(
            &mut self.callback,
            Err(Failure::canceled("external cancel request dropped before sent")),
        );
        Ok(Vec::new())
    }

    fn is_final_state(&self) -> bool {
        DEFINITION.is_final(self.state)
    }

    fn was_cancelled_before_sent(&self) -> bool {
        self.cancelled_before_sent
    }

    fn matches_event(&self, event: &HistoryEvent) -> bool {
        matches!(
            (&self.state, &event.attributes),
            (
                State::CommandCreated,
                EventAttributes::RequestCancelExternalWorkflowExecutionInitiated {
                    workflow_id,
                    ..
                },
            ) if workflow_id == &self.workflow_id
        )
    }
}
