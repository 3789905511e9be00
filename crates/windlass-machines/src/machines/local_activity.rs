//! Local-activity state machine.
//!
//! The only machine whose scheduling emits no command: the worker runs the
//! activity in-process and a `windlass_local_activity` marker command is
//! appended on completion. Replay matches the marker by `activity_id`
//! ahead of the normal head-of-queue matching. If a workflow task is
//! force-failed and rebuilt before the request was collected, a non-replay
//! task start re-surfaces the request for dispatch.

use std::sync::LazyLock;

use windlass_types::{
    ActivityFailure, Command, CommandType, EventAttributes, EventType, Failure, HistoryEvent,
    KnownMarker, LocalActivityMarker, LOCAL_ACTIVITY_MARKER_NAME,
};

use super::{
    notify, CompletionCallback, EntityMachine, ExecuteLocalActivityParameters, MachineResponse,
};
use crate::definition::{ExplicitEvent, StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    /// Non-replay: waiting for the worker to execute the activity.
    RequestPrepared,
    /// Replay: waiting for the recorded completion marker.
    WaitingMarkerEvent,
    /// Completed locally; the marker command is queued.
    MarkerCommandCreated,
    MarkerRecorded,
}

static DEFINITION: LazyLock<StateMachineDefinition<State, ()>> = LazyLock::new(|| {
    use Trigger::{Command as Cmd, Event, Explicit};
    StateMachineDefinition::new("LocalActivity")
        .final_state(State::MarkerRecorded)
        .transition(
            State::RequestPrepared,
            Explicit(ExplicitEvent::LocalActivityResolved),
            State::MarkerCommandCreated,
        )
        .transition(
            State::RequestPrepared,
            Explicit(ExplicitEvent::NonReplayTaskStarted),
            State::RequestPrepared,
        )
        .transition(
            State::WaitingMarkerEvent,
            Event(EventType::MarkerRecorded),
            State::MarkerRecorded,
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
});

pub struct LocalActivityMachine {
    state: State,
    params: ExecuteLocalActivityParameters,
    /// Set once the driver collected the execution request.
    dispatched: bool,
    callback: Option<CompletionCallback>,
}

/// Create the machine. No command is produced; the non-replay path
/// surfaces an execution request instead.
pub fn new_local_activity(
    params: ExecuteLocalActivityParameters,
    replaying: bool,
    callback: CompletionCallback,
) -> (LocalActivityMachine, Option<ExecuteLocalActivityParameters>) {
    let machine = LocalActivityMachine {
        state: if replaying {
            State::WaitingMarkerEvent
        } else {
            State::RequestPrepared
        },
        params: params.clone(),
        dispatched: false,
        callback: Some(callback),
    };
    let request = (!replaying).then_some(params);
    (machine, request)
}

impl LocalActivityMachine {
    pub fn activity_id(&self) -> &str {
        &self.params.activity_id
    }

    pub fn mark_dispatched(&mut self) {
        self.dispatched = true;
    }

    /// The worker finished executing the activity. Emits the completion
    /// marker command and resolves the workflow-side callback.
    pub fn resolve_executed(
        &mut self,
        result: Result<Option<windlass_types::Payload>, Failure>,
        attempt: u32,
        backoff_millis: Option<u64>,
        replay_time_millis: i64,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        DEFINITION.apply(
            &mut self.state,
            Trigger::Explicit(ExplicitEvent::LocalActivityResolved),
        )?;
        let marker = LocalActivityMarker {
            activity_id: self.params.activity_id.clone(),
            activity_type: self.params.activity_type.clone(),
            result: result.as_ref().ok().cloned().flatten(),
            failure: result.as_ref().err().cloned(),
            replay_time_millis,
            attempt,
            backoff_millis,
        };
        let resolved = result.map_err(|cause| self.wrap(cause));
        notify(&mut self.callback, resolved);
        Ok(vec![MachineResponse::IssueNewCommand(Command::RecordMarker {
            marker_name: LOCAL_ACTIVITY_MARKER_NAME.to_string(),
            details: Some(KnownMarker::LocalActivity(marker).encode()),
        })])
    }

    /// Non-replay workflow task started: recreate a request lost to a
    /// force-failed task.
    pub fn non_replay_task_started(
        &mut self,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        if self.state != State::RequestPrepared || self.dispatched {
            return Ok(Vec::new());
        }
        DEFINITION.apply(
            &mut self.state,
            Trigger::Explicit(ExplicitEvent::NonReplayTaskStarted),
        )?;
        Ok(vec![MachineResponse::QueueLocalActivity(self.params.clone())])
    }

    fn wrap(&self, cause: Failure) -> Failure {
        Failure::Activity(ActivityFailure {
            activity_id: self.params.activity_id.clone(),
            activity_type: self.params.activity_type.clone(),
            cause: Box::new(cause),
        })
    }

    fn decode(event: &HistoryEvent) -> Option<LocalActivityMarker> {
        match &event.attributes {
            EventAttributes::MarkerRecorded {
                marker_name,
                details,
            } => match KnownMarker::parse(marker_name, details.as_ref()) {
                Some(KnownMarker::LocalActivity(m)) => Some(m),
                _ => None,
            },
            _ => None,
        }
    }
}

impl EntityMachine for LocalActivityMachine {
    fn name(&self) -> &'static str {
        DEFINITION.name()
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        _has_next: bool,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        let was_waiting = self.state == State::WaitingMarkerEvent;
        DEFINITION.apply(&mut self.state, Trigger::Event(event.event_type()))?;
        if was_waiting {
            let marker = Self::decode(event).ok_or_else(|| {
                WorkflowMachinesError::Nondeterminism(format!(
                    "local activity '{}' marker event could not be decoded",
                    self.params.activity_id
                ))
            })?;
            let result = match marker.failure {
                Some(failure) => Err(self.wrap(failure)),
                None => Ok(marker.result),
            };
            notify(&mut self.callback, result);
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
        // Local activities run to completion once handed to the worker;
        // workflow-side cancellation resolves the promise only.
        notify(
            &mut self.callback,
            Err(Failure::canceled("local activity canceled")),
        );
        Ok(Vec::new())
    }

    fn is_final_state(&self) -> bool {
        DEFINITION.is_final(self.state)
    }

    fn matches_event(&self, event: &HistoryEvent) -> bool {
        self.state == State::MarkerCommandCreated
            && Self::decode(event).is_some_and(|m| m.activity_id == self.params.activity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use windlass_types::{Payload, RetryPolicy};

    fn params() -> ExecuteLocalActivityParameters {
        ExecuteLocalActivityParameters {
            activity_id: "la-1".into(),
            activity_type: "Hash".into(),
            input: None,
            retry_policy: RetryPolicy::default(),
            attempt: 1,
        }
    }

    fn probe() -> (
        Rc<RefCell<Vec<super::super::CompletionResult>>>,
        CompletionCallback,
    ) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let writer = seen.clone();
        (seen, Box::new(move |r| writer.borrow_mut().push(r)))
    }

    fn marker_event(event_id: i64, marker: LocalActivityMarker) -> HistoryEvent {
        HistoryEvent::new(
            event_id,
            EventAttributes::MarkerRecorded {
                marker_name: LOCAL_ACTIVITY_MARKER_NAME.into(),
                details: Some(KnownMarker::LocalActivity(marker).encode()),
            },
        )
    }

    #[test]
    fn execution_emits_marker_command_and_resolves() {
        let (seen, cb) = probe();
        let (mut machine, request) = new_local_activity(params(), false, cb);
        assert!(request.is_some());

        let responses = machine
            .resolve_executed(Ok(Some(Payload::text("ok"))), 1, None, 1_000)
            .unwrap();
        assert!(matches!(
            &responses[..],
            [MachineResponse::IssueNewCommand(Command::RecordMarker { marker_name, .. })]
                if marker_name == LOCAL_ACTIVITY_MARKER_NAME
        ));
        assert_eq!(seen.borrow()[0], Ok(Some(Payload::text("ok"))));
    }

    #[test]
    fn replay_resolves_from_marker_by_activity_id() {
        let (seen, cb) = probe();
        let (mut machine, request) = new_local_activity(params(), true, cb);
        assert!(request.is_none());

        machine
            .handle_event(
                &marker_event(
                    9,
                    LocalActivityMarker {
                        activity_id: "la-1".into(),
                        activity_type: "Hash".into(),
                        result: Some(Payload::text("ok")),
                        failure: None,
                        replay_time_millis: 1_000,
                        attempt: 3,
                        backoff_millis: Some(2_000),
                    },
                ),
                true,
            )
            .unwrap();
        assert!(machine.is_final_state());
        assert_eq!(seen.borrow()[0], Ok(Some(Payload::text("ok"))));
    }

    #[test]
    fn recorded_failure_replays_as_failure() {
        let (seen, cb) = probe();
        let (mut machine, _request) = new_local_activity(params(), true, cb);
        machine
            .handle_event(
                &marker_event(
                    9,
                    LocalActivityMarker {
                        activity_id: "la-1".into(),
                        activity_type: "Hash".into(),
                        result: None,
                        failure: Some(Failure::application("io-error", "nope")),
                        replay_time_millis: 1_000,
                        attempt: 3,
                        backoff_millis: None,
                    },
                ),
                true,
            )
            .unwrap();
        let failure = seen.borrow()[0].clone().unwrap_err();
        assert!(matches!(&failure, Failure::Activity(_)));
        assert_eq!(
            failure.application_cause().map(|a| a.error_type.clone()),
            Some("io-error".to_string())
        );
    }
}
