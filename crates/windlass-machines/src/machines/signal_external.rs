//! Signal-external-workflow state machine: a single request with a single
//! completion callback, resolved when the service records delivery or
//! failure of the signal.

use std::sync::LazyLock;

use windlass_types::{Command, CommandType, EventAttributes, EventType, Failure, HistoryEvent, Payload};

use super::{notify, CompletionCallback, EntityMachine, MachineResponse, NewMachineWithCommand};
use crate::definition::{ExplicitEvent, StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    Created,
    CommandCreated,
    Initiated,
    Signaled,
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
    StateMachineDefinition::new("SignalExternal")
        .final_state(State::Signaled)
        .final_state(State::Failed)
        .final_state(State::Canceled)
        .transition(
            State::Created,
            Explicit(ExplicitEvent::Schedule),
            State::CommandCreated,
        )
        .transition(
            State::CommandCreated,
            Cmd(CommandType::SignalExternalWorkflowExecution),
            State::CommandCreated,
        )
        .transition(
            State::CommandCreated,
            Event(EventType::SignalExternalWorkflowExecutionInitiated),
            State::Initiated,
        )
        .transition(
            State::CommandCreated,
            Explicit(ExplicitEvent::Cancel),
            State::Canceled,
        )
        .transition_with(
            State::Initiated,
            Event(EventType::ExternalWorkflowExecutionSignaled),
            State::Signaled,
            Action::Resolve,
        )
        .transition_with(
            State::Initiated,
            Event(EventType::SignalExternalWorkflowExecutionFailed),
            State::Failed,
            Action::Fail,
        )
});

pub struct SignalExternalMachine {
    state: State,
    workflow_id: String,
    signal_name: String,
    callback: Option<CompletionCallback>,
    cancelled_before_sent: bool,
}

pub fn new_signal_external(
    workflow_id: String,
    signal_name: String,
    input: Option<Payload>,
    child_workflow_only: bool,
    callback: CompletionCallback,
) -> NewMachineWithCommand<SignalExternalMachine> {
    let mut machine = SignalExternalMachine {
        state: State::Created,
        workflow_id: workflow_id.clone(),
        signal_name: signal_name.clone(),
        callback: Some(callback),
        cancelled_before_sent: false,
    };
    DEFINITION
        .apply(&mut machine.state, Trigger::Explicit(ExplicitEvent::Schedule))
        .expect("schedule transition is registered");
    NewMachineWithCommand {
        machine,
        command: Command::SignalExternalWorkflowExecution {
            workflow_id,
            signal_name,
            input,
            child_workflow_only,
        },
    }
}

impl EntityMachine for SignalExternalMachine {
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
                EventAttributes::SignalExternalWorkflowExecutionFailed { cause, .. },
            ) => notify(
                &mut self.callback,
                Err(Failure::application("signal-external-failed", cause.clone())),
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
            Err(Failure::canceled("external signal canceled before sent")),
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
                EventAttributes::SignalExternalWorkflowExecutionInitiated {
                    workflow_id,
                    signal_name,
                    ..
                },
            ) if workflow_id == &self.workflow_id && signal_name == &self.signal_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn resolves_on_signaled_event() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let writer = seen.clone();
        let NewMachineWithCommand { mut machine, command } = new_signal_external(
            "other".into(),
            "ping".into(),
            None,
            false,
            Box::new(move |r| writer.borrow_mut().push(r)),
        );
        assert_eq!(
            command.command_type(),
            CommandType::SignalExternalWorkflowExecution
        );
        machine
            .handle_event(
                &HistoryEvent::new(
                    5,
                    EventAttributes::SignalExternalWorkflowExecutionInitiated {
                        workflow_id: "other".into(),
                        signal_name: "ping".into(),
                        input: None,
                    },
                ),
                true,
            )
            .unwrap();
        machine
            .handle_event(
                &HistoryEvent::new(
                    8,
                    EventAttributes::ExternalWorkflowExecutionSignaled { initiated_event_id: 5 },
                ),
                true,
            )
            .unwrap();
        assert!(machine.is_final_state());
        assert_eq!(seen.borrow()[0], Ok(None));
    }

    #[test]
    fn delivery_failure_surfaces_as_application_failure() {
        let seen: Rc<RefCell<Vec<super::super::CompletionResult>>> =
            Rc::new(RefCell::new(Vec::new()));
        let writer = seen.clone();
        let NewMachineWithCommand { mut machine, .. } = new_signal_external(
            "other".into(),
            "ping".into(),
            None,
            false,
            Box::new(move |r| writer.borrow_mut().push(r)),
        );
        machine
            .handle_event(
                &HistoryEvent::new(
                    5,
                    EventAttributes::SignalExternalWorkflowExecutionInitiated {
                        workflow_id: "other".into(),
                        signal_name: "ping".into(),
                        input: None,
                    },
                ),
                true,
            )
            .unwrap();
        machine
            .handle_event(
                &HistoryEvent::new(
                    8,
                    EventAttributes::SignalExternalWorkflowExecutionFailed {
                        initiated_event_id: 5,
                        cause: "workflow not found".into(),
                    },
                ),
                true,
            )
            .unwrap();
        let failure = seen.borrow()[0].clone().unwrap_err();
        assert_eq!(
            failure.application_cause().map(|a| a.error_type.clone()),
            Some("signal-external-failed".to_string())
        );
    }
}
