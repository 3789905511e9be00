//! Child workflow state machine.
//!
//! Carries two callbacks: one fired when the child is recorded as started
//! (delivering its run id), one when it reaches a terminal state. The
//! cancellation type dictates when the completion callback fires; a child
//! already known to the service is cancelled via a
//! `RequestCancelExternalWorkflowExecution` command with
//! `child_workflow_only` set.

use std::sync::LazyLock;

use windlass_types::{
    ChildWorkflowFailure, Command, CommandType, EventAttributes, EventType, Failure, HistoryEvent,
    Payload, TimeoutKind,
};

use super::{notify, CompletionCallback, EntityMachine, MachineResponse, NewMachineWithCommand};
use crate::definition::{ExplicitEvent, StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

/// How workflow-side cancellation of a child workflow behaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildWorkflowCancellationType {
    /// Resolve as cancelled; never ask the service to cancel the child.
    Abandon,
    /// Emit the cancel command and resolve immediately.
    TryCancel,
    /// Emit the cancel command; resolve once the request is recorded.
    WaitCancellationRequested,
    /// Emit the cancel command; resolve when the child actually ends.
    WaitCancellationCompleted,
}

#[derive(Clone, Debug)]
pub struct ChildWorkflowAttributes {
    pub workflow_id: String,
    pub workflow_type: String,
    pub input: Option<Payload>,
    pub cancellation_type: ChildWorkflowCancellationType,
}

/// Fired once when the child workflow's run id is recorded.
pub type StartedCallback = Box<dyn FnOnce(String)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    Created,
    StartCommandCreated,
    Initiated,
    Started,
    Abandoned,
    Completed,
    Failed,
    Canceled,
    TimedOut,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    NotifyStarted,
    Complete,
    Fail,
    ResolveCanceled,
    TimeOut,
    Terminate,
    NotifyCancelRequested,
}

static DEFINITION: LazyLock<StateMachineDefinition<State, Action>> = LazyLock::new(|| {
    use Trigger::{Command as Cmd, Event, Explicit};
    let mut def = StateMachineDefinition::new("ChildWorkflow")
        .final_state(State::Completed)
        .final_state(State::Failed)
        .final_state(State::Canceled)
        .final_state(State::TimedOut)
        .final_state(State::Terminated)
        .transition(
            State::Created,
            Explicit(ExplicitEvent::Schedule),
            State::StartCommandCreated,
        )
        .transition(
            State::StartCommandCreated,
            Cmd(CommandType::StartChildWorkflowExecution),
            State::StartCommandCreated,
        )
        .transition(
            State::StartCommandCreated,
            Event(EventType::StartChildWorkflowExecutionInitiated),
            State::Initiated,
        )
        .transition(
            State::StartCommandCreated,
            Explicit(ExplicitEvent::Cancel),
            State::Canceled,
        )
        .transition_with(
            State::Initiated,
            Event(EventType::ChildWorkflowExecutionStarted),
            State::Started,
            Action::NotifyStarted,
        );
    // Terminal child events are accepted from both Initiated and Started:
    // a fast child can end within the same task sequence.
    for from in [State::Initiated, State::Started] {
        def = def
            .transition_with(
                from,
                Event(EventType::ChildWorkflowExecutionCompleted),
                State::Completed,
                Action::Complete,
            )
            .transition_with(
                from,
                Event(EventType::ChildWorkflowExecutionFailed),
                State::Failed,
                Action::Fail,
            )
            .transition_with(
                from,
                Event(EventType::ChildWorkflowExecutionCanceled),
                State::Canceled,
                Action::ResolveCanceled,
            )
            .transition_with(
                from,
                Event(EventType::ChildWorkflowExecutionTimedOut),
                State::TimedOut,
                Action::TimeOut,
            )
            .transition_with(
                from,
                Event(EventType::ChildWorkflowExecutionTerminated),
                State::Terminated,
                Action::Terminate,
            )
            // Cancel-request plumbing owned by this machine.
            .transition(
                from,
                Cmd(CommandType::RequestCancelExternalWorkflowExecution),
                from,
            )
            .transition(
                from,
                Event(EventType::RequestCancelExternalWorkflowExecutionInitiated),
                from,
            )
            .transition_with(
                from,
                Event(EventType::ExternalWorkflowExecutionCancelRequested),
                from,
                Action::NotifyCancelRequested,
            )
            .transition(
                from,
                Event(EventType::RequestCancelExternalWorkflowExecutionFailed),
                from,
            )
            .transition(from, Explicit(ExplicitEvent::Abandon), State::Abandoned);
    }
    // An abandoned child keeps running; swallow whatever it reports.
    for trigger in [
        EventType::ChildWorkflowExecutionStarted,
        EventType::ChildWorkflowExecutionCompleted,
        EventType::ChildWorkflowExecutionFailed,
        EventType::ChildWorkflowExecutionCanceled,
        EventType::ChildWorkflowExecutionTimedOut,
        EventType::ChildWorkflowExecutionTerminated,
    ] {
        def = def.transition(State::Abandoned, Event(trigger), State::Abandoned);
    }
    def
});

pub struct ChildWorkflowMachine {
    state: State,
    workflow_id: String,
    workflow_type: String,
    cancellation_type: ChildWorkflowCancellationType,
    cancel_requested: bool,
    started_callback: Option<StartedCallback>,
    callback: Option<CompletionCallback>,
    cancelled_before_sent: bool,
}

/// Create the machine and its `StartChildWorkflowExecution` command.
pub fn new_child_workflow(
    attributes: ChildWorkflowAttributes,
    started_callback: StartedCallback,
    callback: CompletionCallback,
) -> NewMachineWithCommand<ChildWorkflowMachine> {
    let mut machine = ChildWorkflowMachine {
        state: State::Created,
        workflow_id: attributes.workflow_id.clone(),
        workflow_type: attributes.workflow_type.clone(),
        cancellation_type: attributes.cancellation_type,
        cancel_requested: false,
        started_callback: Some(started_callback),
        callback: Some(callback),
        cancelled_before_sent: false,
    };
    DEFINITION
        .apply(&mut machine.state, Trigger::Explicit(ExplicitEvent::Schedule))
        .expect("schedule transition is registered");
    NewMachineWithCommand {
        machine,
        command: Command::StartChildWorkflowExecution {
            workflow_id: attributes.workflow_id,
            workflow_type: attributes.workflow_type,
            input: attributes.input,
        },
    }
}

impl ChildWorkflowMachine {
    fn wrap(&self, cause: Failure) -> Failure {
        Failure::ChildWorkflow(ChildWorkflowFailure {
            workflow_id: self.workflow_id.clone(),
            workflow_type: self.workflow_type.clone(),
            cause: Box::new(cause),
        })
    }

    fn run_action(&mut self, action: Action, event: &HistoryEvent) {
        match (action, &event.attributes) {
            (Action::NotifyStarted, EventAttributes::ChildWorkflowExecutionStarted { run_id, .. }) => {
                if let Some(cb) = self.started_callback.take() {
                    cb(run_id.clone());
                }
            }
            (Action::Complete, EventAttributes::ChildWorkflowExecutionCompleted { result, .. }) => {
                notify(&mut self.callback, Ok(result.clone()));
            }
            (Action::Fail, EventAttributes::ChildWorkflowExecutionFailed { failure, .. }) => {
                let wrapped = self.wrap(failure.clone());
                notify(&mut self.callback, Err(wrapped));
            }
            (Action::ResolveCanceled, _) => {
                notify(
                    &mut self.callback,
                    Err(Failure::canceled("child workflow canceled")),
                );
            }
            (Action::TimeOut, _) => {
                let wrapped = self.wrap(Failure::timeout(TimeoutKind::ScheduleToClose));
                notify(&mut self.callback, Err(wrapped));
            }
            (Action::Terminate, _) => {
                let wrapped = self.wrap(
                    Failure::Application(
                        windlass_types::ApplicationFailure::new(
                            "child-workflow-terminated",
                            "child workflow was terminated",
                        )
                        .non_retryable(),
                    ),
                );
                notify(&mut self.callback, Err(wrapped));
            }
            (Action::NotifyCancelRequested, _) => {
                if self.cancellation_type == ChildWorkflowCancellationType::WaitCancellationRequested
                {
                    notify(
                        &mut self.callback,
                        Err(Failure::canceled("child workflow cancel requested")),
                    );
                }
            }
            _ => {}
        }
    }
}

impl EntityMachine for ChildWorkflowMachine {
    fn name(&self) -> &'static str {
        DEFINITION.name()
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        _has_next: bool,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        let action = DEFINITION.apply(&mut self.state, Trigger::Event(event.event_type()))?;
        if let Some(action) = action {
            self.run_action(action, event);
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
        if self.is_final_state() || self.state == State::Abandoned || self.cancel_requested {
            return Ok(Vec::new());
        }
        if self.state == State::StartCommandCreated {
            DEFINITION.apply(&mut self.state, Trigger::Explicit(ExplicitEvent::Cancel))?;
            self.cancelled_before_sent = true;
            notify(
                &mut self.callback,
                Err(Failure::canceled("child workflow canceled before initiated")),
            );
            return Ok(Vec::new());
        }
        if self.cancellation_type == ChildWorkflowCancellationType::Abandon {
            DEFINITION.apply(&mut self.state, Trigger::Explicit(ExplicitEvent::Abandon))?;
            notify(
                &mut self.callback,
                Err(Failure::canceled("child workflow abandoned")),
            );
            return Ok(Vec::new());
        }
        self.cancel_requested = true;
        if self.cancellation_type == ChildWorkflowCancellationType::TryCancel {
            notify(
                &mut self.callback,
                Err(Failure::canceled("child workflow cancel requested")),
            );
        }
        Ok(vec![MachineResponse::IssueNewCommand(
            Command::RequestCancelExternalWorkflowExecution {
                workflow_id: self.workflow_id.clone(),
                child_workflow_only: true,
            },
        )])
    }

    fn is_final_state(&self) -> bool {
        DEFINITION.is_final(self.state)
    }

    fn was_cancelled_before_sent(&self) -> bool {
        self.cancelled_before_sent
    }

    fn matches_event(&self, event: &HistoryEvent) -> bool {
        match &event.attributes {
            EventAttributes::StartChildWorkflowExecutionInitiated {
                workflow_id,
                workflow_type,
                ..
            } => {
                self.state == State::StartCommandCreated
                    && workflow_id == &self.workflow_id
                    && workflow_type == &self.workflow_type
            }
            EventAttributes::RequestCancelExternalWorkflowExecutionInitiated {
                workflow_id,
                child_workflow_only,
            } => self.cancel_requested && *child_workflow_only && workflow_id == &self.workflow_id,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::super::CompletionResult;

    fn attrs(cancellation_type: ChildWorkflowCancellationType) -> ChildWorkflowAttributes {
        ChildWorkflowAttributes {
            workflow_id: "child-1".into(),
            workflow_type: "Child".into(),
            input: None,
            cancellation_type,
        }
    }

    #[allow(clippy::type_complexity)]
    fn probes() -> (
        Rc<RefCell<Vec<String>>>,
        Rc<RefCell<Vec<CompletionResult>>>,
        StartedCallback,
        CompletionCallback,
    ) {
        let started = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sw = started.clone();
        let cw = seen.clone();
        (
            started,
            seen,
            Box::new(move |run_id| sw.borrow_mut().push(run_id)),
            Box::new(move |r| cw.borrow_mut().push(r)),
        )
    }

    fn initiated(event_id: i64) -> HistoryEvent {
        HistoryEvent::new(
            event_id,
            EventAttributes::StartChildWorkflowExecutionInitiated {
                workflow_id: "child-1".into(),
                workflow_type: "Child".into(),
                input: None,
            },
        )
    }

    fn started_ev(event_id: i64, initiated_event_id: i64) -> HistoryEvent {
        HistoryEvent::new(
            event_id,
            EventAttributes::ChildWorkflowExecutionStarted {
                initiated_event_id,
                run_id: "run-child".into(),
            },
        )
    }

    #[test]
    fn started_and_completed_fire_their_callbacks() {
        let (started, seen, scb, ccb) = probes();
        let NewMachineWithCommand { mut machine, .. } =
            new_child_workflow(attrs(ChildWorkflowCancellationType::TryCancel), scb, ccb);
        machine.handle_event(&initiated(5), true).unwrap();
        machine.handle_event(&started_ev(6, 5), true).unwrap();
        assert_eq!(started.borrow().as_slice(), ["run-child"]);

        machine
            .handle_event(
                &HistoryEvent::new(
                    9,
                    EventAttributes::ChildWorkflowExecutionCompleted {
                        initiated_event_id: 5,
                        result: Some(Payload::text("done")),
                    },
                ),
                true,
            )
            .unwrap();
        assert!(machine.is_final_state());
        assert_eq!(seen.borrow()[0], Ok(Some(Payload::text("done"))));
    }

    #[test]
    fn cancel_of_started_child_targets_child_only() {
        let (_started, seen, scb, ccb) = probes();
        let NewMachineWithCommand { mut machine, .. } =
            new_child_workflow(attrs(ChildWorkflowCancellationType::TryCancel), scb, ccb);
        machine.handle_event(&initiated(5), true).unwrap();
        machine.handle_event(&started_ev(6, 5), true).unwrap();

        let responses = machine.cancel().unwrap();
        assert!(matches!(
            &responses[..],
            [MachineResponse::IssueNewCommand(
                Command::RequestCancelExternalWorkflowExecution {
                    child_workflow_only: true,
                    ..
                }
            )]
        ));
        assert!(matches!(&seen.borrow()[0], Err(f) if f.is_canceled()));
        // Second cancel is a no-op.
        assert!(machine.cancel().unwrap().is_empty());
    }

    #[test]
    fn abandon_swallows_later_child_events() {
        let (_started, seen, scb, ccb) = probes();
        let NewMachineWithCommand { mut machine, .. } =
            new_child_workflow(attrs(ChildWorkflowCancellationType::Abandon), scb, ccb);
        machine.handle_event(&initiated(5), true).unwrap();
        assert!(machine.cancel().unwrap().is_empty());
        assert!(matches!(&seen.borrow()[0], Err(f) if f.is_canceled()));

        machine.handle_event(&started_ev(6, 5), true).unwrap();
        machine
            .handle_event(
                &HistoryEvent::new(
                    9,
                    EventAttributes::ChildWorkflowExecutionFailed {
                        initiated_event_id: 5,
                        failure: Failure::application("x", "y"),
                    },
                ),
                true,
            )
            .unwrap();
        assert_eq!(seen.borrow().len(), 1);
    }
}
