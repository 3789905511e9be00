//! Activity task state machine.
//!
//! `Created → ScheduleCommandCreated → ScheduledEventRecorded → {Started,
//! CancelCommandCreated, Completed, Failed, TimedOut, Canceled}`. The
//! cancellation type decides whether a cancel command is emitted and when
//! the activity promise resolves as cancelled.

use std::sync::LazyLock;
use std::time::Duration;

use windlass_types::{
    ActivityFailure, Command, CommandType, EventAttributes, EventType, Failure, HistoryEvent,
    Payload, RetryPolicy, TimeoutKind,
};

use super::{notify, CompletionCallback, EntityMachine, MachineResponse, NewMachineWithCommand};
use crate::definition::{ExplicitEvent, StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

/// How workflow-side cancellation of an activity behaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityCancellationType {
    /// Emit a cancel command and resolve as cancelled immediately.
    TryCancel,
    /// Emit a cancel command; resolve only when the activity reaches a
    /// terminal state.
    WaitCancellationCompleted,
    /// Emit a cancel command; resolve once the cancel request is recorded.
    WaitCancellationRequested,
    /// No cancel command; resolve as cancelled and let the activity run on.
    Abandon,
}

/// Scheduling attributes supplied by workflow code.
#[derive(Clone, Debug)]
pub struct ActivityScheduleAttributes {
    pub activity_id: String,
    pub activity_type: String,
    pub input: Option<Payload>,
    pub retry_policy: Option<RetryPolicy>,
    pub schedule_to_close_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub cancellation_type: ActivityCancellationType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    Created,
    ScheduleCommandCreated,
    ScheduledEventRecorded,
    Started,
    CancelCommandCreated,
    /// Cancelled with abandon semantics; absorbs whatever the activity
    /// still produces.
    Abandoned,
    Completed,
    Failed,
    TimedOut,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    RecordScheduled,
    Complete,
    Fail,
    TimeOut,
    CancelBeforeSent,
    IssueCancelCommand,
    NotifyCancelRequested,
    ResolveCanceled,
}

static DEFINITION: LazyLock<StateMachineDefinition<State, Action>> = LazyLock::new(|| {
    use Trigger::{Command as Cmd, Event, Explicit};
    StateMachineDefinition::new("Activity")
        .final_state(State::Completed)
        .final_state(State::Failed)
        .final_state(State::TimedOut)
        .final_state(State::Canceled)
        .transition(
            State::Created,
            Explicit(ExplicitEvent::Schedule),
            State::ScheduleCommandCreated,
        )
        .transition(
            State::ScheduleCommandCreated,
            Cmd(CommandType::ScheduleActivityTask),
            State::ScheduleCommandCreated,
        )
        .transition_with(
            State::ScheduleCommandCreated,
            Event(EventType::ActivityTaskScheduled),
            State::ScheduledEventRecorded,
            Action::RecordScheduled,
        )
        .transition_with(
            State::ScheduleCommandCreated,
            Explicit(ExplicitEvent::Cancel),
            State::Canceled,
            Action::CancelBeforeSent,
        )
        .transition(
            State::ScheduledEventRecorded,
            Event(EventType::ActivityTaskStarted),
            State::Started,
        )
        .transition_with(
            State::ScheduledEventRecorded,
            Event(EventType::ActivityTaskTimedOut),
            State::TimedOut,
            Action::TimeOut,
        )
        .transition_with(
            State::ScheduledEventRecorded,
            Explicit(ExplicitEvent::Cancel),
            State::CancelCommandCreated,
            Action::IssueCancelCommand,
        )
        .transition_with(
            State::ScheduledEventRecorded,
            Explicit(ExplicitEvent::Abandon),
            State::Abandoned,
            Action::ResolveCanceled,
        )
        .transition_with(
            State::Started,
            Event(EventType::ActivityTaskCompleted),
            State::Completed,
            Action::Complete,
        )
        .transition_with(
            State::Started,
            Event(EventType::ActivityTaskFailed),
            State::Failed,
            Action::Fail,
        )
        .transition_with(
            State::Started,
            Event(EventType::ActivityTaskTimedOut),
            State::TimedOut,
            Action::TimeOut,
        )
        .transition_with(
            State::Started,
            Explicit(ExplicitEvent::Cancel),
            State::CancelCommandCreated,
            Action::IssueCancelCommand,
        )
        .transition_with(
            State::Started,
            Explicit(ExplicitEvent::Abandon),
            State::Abandoned,
            Action::ResolveCanceled,
        )
        .transition(
            State::CancelCommandCreated,
            Cmd(CommandType::RequestCancelActivityTask),
            State::CancelCommandCreated,
        )
        .transition_with(
            State::CancelCommandCreated,
            Event(EventType::ActivityTaskCancelRequested),
            State::CancelCommandCreated,
            Action::NotifyCancelRequested,
        )
        .transition_with(
            State::CancelCommandCreated,
            Event(EventType::ActivityTaskCanceled),
            State::Canceled,
            Action::ResolveCanceled,
        )
        .transition_with(
            State::CancelCommandCreated,
            Event(EventType::ActivityTaskCompleted),
            State::Completed,
            Action::Complete,
        )
        .transition_with(
            State::CancelCommandCreated,
            Event(EventType::ActivityTaskFailed),
            State::Failed,
            Action::Fail,
        )
        .transition_with(
            State::CancelCommandCreated,
            Event(EventType::ActivityTaskTimedOut),
            State::TimedOut,
            Action::TimeOut,
        )
        // A start racing the cancel request is absorbed.
        .transition(
            State::CancelCommandCreated,
            Event(EventType::ActivityTaskStarted),
            State::CancelCommandCreated,
        )
        // Abandoned activities keep running; swallow whatever they report.
        .transition(
            State::Abandoned,
            Event(EventType::ActivityTaskStarted),
            State::Abandoned,
        )
        .transition(
            State::Abandoned,
            Event(EventType::ActivityTaskCompleted),
            State::Abandoned,
        )
        .transition(
            State::Abandoned,
            Event(EventType::ActivityTaskFailed),
            State::Abandoned,
        )
        .transition(
            State::Abandoned,
            Event(EventType::ActivityTaskTimedOut),
            State::Abandoned,
        )
        .transition(
            State::Abandoned,
            Event(EventType::ActivityTaskCanceled),
            State::Abandoned,
        )
        .transition(
            State::Abandoned,
            Event(EventType::ActivityTaskCancelRequested),
            State::Abandoned,
        )
});

pub struct ActivityMachine {
    state: State,
    activity_id: String,
    activity_type: String,
    cancellation_type: ActivityCancellationType,
    scheduled_event_id: Option<i64>,
    callback: Option<CompletionCallback>,
    cancelled_before_sent: bool,
}

/// Create the machine and its `ScheduleActivityTask` command.
pub fn new_activity(
    attributes: ActivityScheduleAttributes,
    callback: CompletionCallback,
) -> NewMachineWithCommand<ActivityMachine> {
    let mut machine = ActivityMachine {
        state: State::Created,
        activity_id: attributes.activity_id.clone(),
        activity_type: attributes.activity_type.clone(),
        cancellation_type: attributes.cancellation_type,
        scheduled_event_id: None,
        callback: Some(callback),
        cancelled_before_sent: false,
    };
    DEFINITION
        .apply(&mut machine.state, Trigger::Explicit(ExplicitEvent::Schedule))
        .expect("schedule transition is registered");
    NewMachineWithCommand {
        machine,
        command: Command::ScheduleActivityTask {
            activity_id: attributes.activity_id,
            activity_type: attributes.activity_type,
            input: attributes.input,
            retry_policy: attributes.retry_policy,
            schedule_to_close_timeout: attributes.schedule_to_close_timeout,
            start_to_close_timeout: attributes.start_to_close_timeout,
        },
    }
}

impl ActivityMachine {
    fn wrap(&self, cause: Failure) -> Failure {
        Failure::Activity(ActivityFailure {
            activity_id: self.activity_id.clone(),
            activity_type: self.activity_type.clone(),
            cause: Box::new(cause),
        })
    }

    fn run_action(&mut self, action: Action, event: &HistoryEvent) {
        match (action, &event.attributes) {
            (Action::RecordScheduled, _) => {
                self.scheduled_event_id = Some(event.event_id);
            }
            (Action::Complete, EventAttributes::ActivityTaskCompleted { result, .. }) => {
                notify(&mut self.callback, Ok(result.clone()));
            }
            (Action::Fail, EventAttributes::ActivityTaskFailed { failure, .. }) => {
                let wrapped = self.wrap(failure.clone());
                notify(&mut self.callback, Err(wrapped));
            }
            (Action::TimeOut, EventAttributes::ActivityTaskTimedOut { timeout_kind, .. }) => {
                let wrapped = self.wrap(Failure::timeout(*timeout_kind));
                notify(&mut self.callback, Err(wrapped));
            }
            (Action::TimeOut, _) => {
                let wrapped = self.wrap(Failure::timeout(TimeoutKind::StartToClose));
                notify(&mut self.callback, Err(wrapped));
            }
            (Action::NotifyCancelRequested, _) => {
                if self.cancellation_type == ActivityCancellationType::WaitCancellationRequested {
                    notify(
                        &mut self.callback,
                        Err(Failure::canceled("activity cancel requested")),
                    );
                }
            }
            (Action::ResolveCanceled, _) => {
                notify(&mut self.callback, Err(Failure::canceled("activity canceled")));
            }
            _ => {}
        }
    }
}

impl EntityMachine for ActivityMachine {
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
        if self.is_final_state()
            || matches!(self.state, State::CancelCommandCreated | State::Abandoned)
        {
            return Ok(Vec::new());
        }
        if self.state == State::ScheduleCommandCreated {
            DEFINITION.apply(&mut self.state, Trigger::Explicit(ExplicitEvent::Cancel))?;
            self.cancelled_before_sent = true;
            notify(
                &mut self.callback,
                Err(Failure::canceled("activity canceled before scheduled")),
            );
            return Ok(Vec::new());
        }
        if self.cancellation_type == ActivityCancellationType::Abandon {
            DEFINITION.apply(&mut self.state, Trigger::Explicit(ExplicitEvent::Abandon))?;
            notify(&mut self.callback, Err(Failure::canceled("activity abandoned")));
            return Ok(Vec::new());
        }
        DEFINITION.apply(&mut self.state, Trigger::Explicit(ExplicitEvent::Cancel))?;
        if self.cancellation_type == ActivityCancellationType::TryCancel {
            notify(
                &mut self.callback,
                Err(Failure::canceled("activity cancel requested")),
            );
        }
        let scheduled_event_id = self.scheduled_event_id.ok_or_else(|| {
            WorkflowMachinesError::Fatal(
                "cancel of recorded activity without a scheduled event id".to_string(),
            )
        })?;
        Ok(vec![MachineResponse::IssueNewCommand(
            Command::RequestCancelActivityTask {
                activity_id: self.activity_id.clone(),
                scheduled_event_id,
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
        match (&self.state, &event.attributes) {
            (
                State::ScheduleCommandCreated,
                EventAttributes::ActivityTaskScheduled {
                    activity_id,
                    activity_type,
                    ..
                },
            ) => activity_id == &self.activity_id && activity_type == &self.activity_type,
            (
                State::CancelCommandCreated,
                EventAttributes::ActivityTaskCancelRequested { scheduled_event_id },
            ) => Some(*scheduled_event_id) == self.scheduled_event_id,
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

    fn attrs(cancellation_type: ActivityCancellationType) -> ActivityScheduleAttributes {
        ActivityScheduleAttributes {
            activity_id: "1".into(),
            activity_type: "Fetch".into(),
            input: None,
            retry_policy: None,
            schedule_to_close_timeout: None,
            start_to_close_timeout: None,
            cancellation_type,
        }
    }

    fn probe() -> (Rc<RefCell<Vec<CompletionResult>>>, CompletionCallback) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let writer = seen.clone();
        (seen, Box::new(move |r| writer.borrow_mut().push(r)))
    }

    fn scheduled(event_id: i64) -> HistoryEvent {
        HistoryEvent::new(
            event_id,
            EventAttributes::ActivityTaskScheduled {
                activity_id: "1".into(),
                activity_type: "Fetch".into(),
                input: None,
            },
        )
    }

    fn started(event_id: i64, scheduled_event_id: i64) -> HistoryEvent {
        HistoryEvent::new(
            event_id,
            EventAttributes::ActivityTaskStarted {
                scheduled_event_id,
                attempt: 1,
            },
        )
    }

    #[test]
    fn completion_resolves_with_result() {
        let (seen, cb) = probe();
        let NewMachineWithCommand { mut machine, .. } =
            new_activity(attrs(ActivityCancellationType::TryCancel), cb);
        machine.handle_event(&scheduled(5), true).unwrap();
        machine.handle_event(&started(6, 5), true).unwrap();
        machine
            .handle_event(
                &HistoryEvent::new(
                    7,
                    EventAttributes::ActivityTaskCompleted {
                        scheduled_event_id: 5,
                        result: Some(Payload::text("ok")),
                    },
                ),
                true,
            )
            .unwrap();
        assert!(machine.is_final_state());
        assert_eq!(seen.borrow()[0], Ok(Some(Payload::text("ok"))));
    }

    #[test]
    fn failure_is_wrapped_in_activity_failure() {
        let (seen, cb) = probe();
        let NewMachineWithCommand { mut machine, .. } =
            new_activity(attrs(ActivityCancellationType::TryCancel), cb);
        machine.handle_event(&scheduled(5), true).unwrap();
        machine.handle_event(&started(6, 5), true).unwrap();
        machine
            .handle_event(
                &HistoryEvent::new(
                    7,
                    EventAttributes::ActivityTaskFailed {
                        scheduled_event_id: 5,
                        failure: Failure::application("io-error", "boom"),
                    },
                ),
                true,
            )
            .unwrap();
        let failure = seen.borrow()[0].clone().unwrap_err();
        let app = failure.application_cause().expect("application cause");
        assert_eq!(app.error_type, "io-error");
        assert!(matches!(failure, Failure::Activity(_)));
    }

    #[test]
    fn abandon_cancel_emits_no_command_and_resolves_canceled() {
        let (seen, cb) = probe();
        let NewMachineWithCommand { mut machine, .. } =
            new_activity(attrs(ActivityCancellationType::Abandon), cb);
        machine.handle_event(&scheduled(5), true).unwrap();

        let responses = machine.cancel().unwrap();
        assert!(responses.is_empty());
        assert!(matches!(&seen.borrow()[0], Err(f) if f.is_canceled()));
        assert!(!machine.is_final_state());

        // Whatever the abandoned activity still reports is swallowed.
        machine.handle_event(&started(6, 5), true).unwrap();
        machine
            .handle_event(
                &HistoryEvent::new(
                    9,
                    EventAttributes::ActivityTaskCompleted {
                        scheduled_event_id: 5,
                        result: None,
                    },
                ),
                true,
            )
            .unwrap();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn try_cancel_emits_command_and_resolves_immediately() {
        let (seen, cb) = probe();
        let NewMachineWithCommand { mut machine, .. } =
            new_activity(attrs(ActivityCancellationType::TryCancel), cb);
        machine.handle_event(&scheduled(5), true).unwrap();
        machine.handle_event(&started(6, 5), true).unwrap();

        let responses = machine.cancel().unwrap();
        assert!(matches!(
            &responses[..],
            [MachineResponse::IssueNewCommand(Command::RequestCancelActivityTask {
                scheduled_event_id: 5,
                ..
            })]
        ));
        assert!(matches!(&seen.borrow()[0], Err(f) if f.is_canceled()));
    }

    #[test]
    fn wait_cancellation_completed_resolves_on_terminal_event() {
        let (seen, cb) = probe();
        let NewMachineWithCommand { mut machine, .. } =
            new_activity(attrs(ActivityCancellationType::WaitCancellationCompleted), cb);
        machine.handle_event(&scheduled(5), true).unwrap();
        machine.handle_event(&started(6, 5), true).unwrap();

        machine.cancel().unwrap();
        assert!(seen.borrow().is_empty());

        machine
            .handle_event(
                &HistoryEvent::new(
                    8,
                    EventAttributes::ActivityTaskCancelRequested { scheduled_event_id: 5 },
                ),
                true,
            )
            .unwrap();
        assert!(seen.borrow().is_empty());

        machine
            .handle_event(
                &HistoryEvent::new(
                    9,
                    EventAttributes::ActivityTaskCanceled { scheduled_event_id: 5 },
                ),
                true,
            )
            .unwrap();
        assert!(machine.is_final_state());
        assert!(matches!(&seen.borrow()[0], Err(f) if f.is_canceled()));
    }
}
