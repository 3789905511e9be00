use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::EventType;
use crate::failure::Failure;
use crate::payload::Payload;
use crate::retry::RetryPolicy;

/// Fieldless command-type tag, the FSM trigger for "command created"
/// transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    ScheduleActivityTask,
    RequestCancelActivityTask,
    StartTimer,
    CancelTimer,
    StartChildWorkflowExecution,
    SignalExternalWorkflowExecution,
    RequestCancelExternalWorkflowExecution,
    RecordMarker,
    CompleteWorkflowExecution,
    FailWorkflowExecution,
    CancelWorkflowExecution,
    ContinueAsNewWorkflowExecution,
    UpsertWorkflowSearchAttributes,
}

/// An instruction for the orchestration service, produced by an entity
/// machine. Every non-marker command produces exactly one matching command
/// event in later history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    ScheduleActivityTask {
        activity_id: String,
        activity_type: String,
        input: Option<Payload>,
        retry_policy: Option<RetryPolicy>,
        schedule_to_close_timeout: Option<Duration>,
        start_to_close_timeout: Option<Duration>,
    },
    RequestCancelActivityTask {
        activity_id: String,
        scheduled_event_id: i64,
    },
    StartTimer {
        timer_id: String,
        duration: Duration,
    },
    CancelTimer {
        timer_id: String,
    },
    StartChildWorkflowExecution {
        workflow_id: String,
        workflow_type: String,
        input: Option<Payload>,
    },
    SignalExternalWorkflowExecution {
        workflow_id: String,
        signal_name: String,
        input: Option<Payload>,
        child_workflow_only: bool,
    },
    RequestCancelExternalWorkflowExecution {
        workflow_id: String,
        child_workflow_only: bool,
    },
    RecordMarker {
        marker_name: String,
        details: Option<Payload>,
    },
    CompleteWorkflowExecution {
        result: Option<Payload>,
    },
    FailWorkflowExecution {
        failure: Failure,
    },
    CancelWorkflowExecution,
    ContinueAsNewWorkflowExecution {
        workflow_type: String,
        input: Option<Payload>,
    },
    UpsertWorkflowSearchAttributes {
        attributes: BTreeMap<String, Payload>,
    },
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::ScheduleActivityTask { .. } => CommandType::ScheduleActivityTask,
            Self::RequestCancelActivityTask { .. } => CommandType::RequestCancelActivityTask,
            Self::StartTimer { .. } => CommandType::StartTimer,
            Self::CancelTimer { .. } => CommandType::CancelTimer,
            Self::StartChildWorkflowExecution { .. } => CommandType::StartChildWorkflowExecution,
            Self::SignalExternalWorkflowExecution { .. } => {
                CommandType::SignalExternalWorkflowExecution
            }
            Self::RequestCancelExternalWorkflowExecution { .. } => {
                CommandType::RequestCancelExternalWorkflowExecution
            }
            Self::RecordMarker { .. } => CommandType::RecordMarker,
            Self::CompleteWorkflowExecution { .. } => CommandType::CompleteWorkflowExecution,
            Self::FailWorkflowExecution { .. } => CommandType::FailWorkflowExecution,
            Self::CancelWorkflowExecution => CommandType::CancelWorkflowExecution,
            Self::ContinueAsNewWorkflowExecution { .. } => {
                CommandType::ContinueAsNewWorkflowExecution
            }
            Self::UpsertWorkflowSearchAttributes { .. } => {
                CommandType::UpsertWorkflowSearchAttributes
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.command_type().name()
    }

    /// The command event this command produces once the service records it.
    pub fn expected_event_type(&self) -> EventType {
        match self.command_type() {
            CommandType::ScheduleActivityTask => EventType::ActivityTaskScheduled,
            CommandType::RequestCancelActivityTask => EventType::ActivityTaskCancelRequested,
            CommandType::StartTimer => EventType::TimerStarted,
            CommandType::CancelTimer => EventType::TimerCanceled,
            CommandType::StartChildWorkflowExecution => {
                EventType::StartChildWorkflowExecutionInitiated
            }
            CommandType::SignalExternalWorkflowExecution => {
                EventType::SignalExternalWorkflowExecutionInitiated
            }
            CommandType::RequestCancelExternalWorkflowExecution => {
                EventType::RequestCancelExternalWorkflowExecutionInitiated
            }
            CommandType::RecordMarker => EventType::MarkerRecorded,
            CommandType::CompleteWorkflowExecution => EventType::WorkflowExecutionCompleted,
            CommandType::FailWorkflowExecution => EventType::WorkflowExecutionFailed,
            CommandType::CancelWorkflowExecution => EventType::WorkflowExecutionCanceled,
            CommandType::ContinueAsNewWorkflowExecution => {
                EventType::WorkflowExecutionContinuedAsNew
            }
            CommandType::UpsertWorkflowSearchAttributes => {
                EventType::UpsertWorkflowSearchAttributes
            }
        }
    }

    /// True for terminal workflow commands; once one is emitted no further
    /// commands may be produced in the same workflow task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.command_type(),
            CommandType::CompleteWorkflowExecution
                | CommandType::FailWorkflowExecution
                | CommandType::CancelWorkflowExecution
                | CommandType::ContinueAsNewWorkflowExecution
        )
    }
}

impl CommandType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScheduleActivityTask => "ScheduleActivityTask",
            Self::RequestCancelActivityTask => "RequestCancelActivityTask",
            Self::StartTimer => "StartTimer",
            Self::CancelTimer => "CancelTimer",
            Self::StartChildWorkflowExecution => "StartChildWorkflowExecution",
            Self::SignalExternalWorkflowExecution => "SignalExternalWorkflowExecution",
            Self::RequestCancelExternalWorkflowExecution => {
                "RequestCancelExternalWorkflowExecution"
            }
            Self::RecordMarker => "RecordMarker",
            Self::CompleteWorkflowExecution => "CompleteWorkflowExecution",
            Self::FailWorkflowExecution => "FailWorkflowExecution",
            Self::CancelWorkflowExecution => "CancelWorkflowExecution",
            Self::ContinueAsNewWorkflowExecution => "ContinueAsNewWorkflowExecution",
            Self::UpsertWorkflowSearchAttributes => "UpsertWorkflowSearchAttributes",
        }
    }
}
