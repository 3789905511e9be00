use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::{Failure, TimeoutKind};
use crate::payload::Payload;

/// Fieldless event-type tag. Used as an FSM trigger and for command/event
/// cross-checks, where attribute payloads would get in the way of hashing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionTimedOut,
    WorkflowExecutionCanceled,
    WorkflowExecutionTerminated,
    WorkflowExecutionContinuedAsNew,
    WorkflowExecutionSignaled,
    WorkflowExecutionCancelRequested,
    WorkflowTaskScheduled,
    WorkflowTaskStarted,
    WorkflowTaskCompleted,
    WorkflowTaskFailed,
    WorkflowTaskTimedOut,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    ActivityTaskCancelRequested,
    ActivityTaskCanceled,
    TimerStarted,
    TimerFired,
    TimerCanceled,
    StartChildWorkflowExecutionInitiated,
    ChildWorkflowExecutionStarted,
    ChildWorkflowExecutionCompleted,
    ChildWorkflowExecutionFailed,
    ChildWorkflowExecutionCanceled,
    ChildWorkflowExecutionTimedOut,
    ChildWorkflowExecutionTerminated,
    SignalExternalWorkflowExecutionInitiated,
    ExternalWorkflowExecutionSignaled,
    SignalExternalWorkflowExecutionFailed,
    RequestCancelExternalWorkflowExecutionInitiated,
    ExternalWorkflowExecutionCancelRequested,
    RequestCancelExternalWorkflowExecutionFailed,
    MarkerRecorded,
    UpsertWorkflowSearchAttributes,
}

/// Type-specific attribute payload, one variant per event type.
///
/// Only the fields the replay core consults are modeled; the transport owns
/// whatever else the service records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        workflow_id: String,
        original_run_id: String,
        input: Option<Payload>,
    },
    WorkflowExecutionCompleted {
        result: Option<Payload>,
    },
    WorkflowExecutionFailed {
        failure: Failure,
    },
    WorkflowExecutionTimedOut,
    WorkflowExecutionCanceled,
    WorkflowExecutionTerminated {
        reason: String,
    },
    WorkflowExecutionContinuedAsNew {
        workflow_type: String,
        input: Option<Payload>,
    },
    WorkflowExecutionSignaled {
        signal_name: String,
        input: Option<Payload>,
    },
    WorkflowExecutionCancelRequested {
        reason: String,
    },
    WorkflowTaskScheduled,
    WorkflowTaskStarted {
        scheduled_event_id: i64,
    },
    WorkflowTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
    },
    WorkflowTaskFailed {
        scheduled_event_id: i64,
    },
    WorkflowTaskTimedOut {
        scheduled_event_id: i64,
    },
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
        input: Option<Payload>,
    },
    ActivityTaskStarted {
        scheduled_event_id: i64,
        attempt: u32,
    },
    ActivityTaskCompleted {
        scheduled_event_id: i64,
        result: Option<Payload>,
    },
    ActivityTaskFailed {
        scheduled_event_id: i64,
        failure: Failure,
    },
    ActivityTaskTimedOut {
        scheduled_event_id: i64,
        timeout_kind: TimeoutKind,
    },
    ActivityTaskCancelRequested {
        scheduled_event_id: i64,
    },
    ActivityTaskCanceled {
        scheduled_event_id: i64,
    },
    TimerStarted {
        timer_id: String,
        duration: Duration,
    },
    TimerFired {
        timer_id: String,
        started_event_id: i64,
    },
    TimerCanceled {
        timer_id: String,
        started_event_id: i64,
    },
    StartChildWorkflowExecutionInitiated {
        workflow_id: String,
        workflow_type: String,
        input: Option<Payload>,
    },
    ChildWorkflowExecutionStarted {
        initiated_event_id: i64,
        run_id: String,
    },
    ChildWorkflowExecutionCompleted {
        initiated_event_id: i64,
        result: Option<Payload>,
    },
    ChildWorkflowExecutionFailed {
        initiated_event_id: i64,
        failure: Failure,
    },
    ChildWorkflowExecutionCanceled {
        initiated_event_id: i64,
    },
    ChildWorkflowExecutionTimedOut {
        initiated_event_id: i64,
    },
    ChildWorkflowExecutionTerminated {
        initiated_event_id: i64,
    },
    SignalExternalWorkflowExecutionInitiated {
        workflow_id: String,
        signal_name: String,
        input: Option<Payload>,
    },
    ExternalWorkflowExecutionSignaled {
        initiated_event_id: i64,
    },
    SignalExternalWorkflowExecutionFailed {
        initiated_event_id: i64,
        cause: String,
    },
    RequestCancelExternalWorkflowExecutionInitiated {
        workflow_id: String,
        child_workflow_only: bool,
    },
    ExternalWorkflowExecutionCancelRequested {
        initiated_event_id: i64,
    },
    RequestCancelExternalWorkflowExecutionFailed {
        initiated_event_id: i64,
        cause: String,
    },
    MarkerRecorded {
        marker_name: String,
        details: Option<Payload>,
    },
    UpsertWorkflowSearchAttributes {
        attributes: BTreeMap<String, Payload>,
    },
}

/// One immutable history record.
///
/// `event_id` is assigned by the service, monotonic from 1. `time` is the
/// service-side wall clock; workflow time only ever advances via
/// `WorkflowTaskStarted` times.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub time: Option<DateTime<Utc>>,
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    pub fn new(event_id: i64, attributes: EventAttributes) -> Self {
        Self {
            event_id,
            time: None,
            attributes,
        }
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn event_type(&self) -> EventType {
        match &self.attributes {
            EventAttributes::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            EventAttributes::WorkflowExecutionCompleted { .. } => {
                EventType::WorkflowExecutionCompleted
            }
            EventAttributes::WorkflowExecutionFailed { .. } => EventType::WorkflowExecutionFailed,
            EventAttributes::WorkflowExecutionTimedOut => EventType::WorkflowExecutionTimedOut,
            EventAttributes::WorkflowExecutionCanceled => EventType::WorkflowExecutionCanceled,
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                EventType::WorkflowExecutionTerminated
            }
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                EventType::WorkflowExecutionContinuedAsNew
            }
            EventAttributes::WorkflowExecutionSignaled { .. } => {
                EventType::WorkflowExecutionSignaled
            }
            EventAttributes::WorkflowExecutionCancelRequested { .. } => {
                EventType::WorkflowExecutionCancelRequested
            }
            EventAttributes::WorkflowTaskScheduled => EventType::WorkflowTaskScheduled,
            EventAttributes::WorkflowTaskStarted { .. } => EventType::WorkflowTaskStarted,
            EventAttributes::WorkflowTaskCompleted { .. } => EventType::WorkflowTaskCompleted,
            EventAttributes::WorkflowTaskFailed { .. } => EventType::WorkflowTaskFailed,
            EventAttributes::WorkflowTaskTimedOut { .. } => EventType::WorkflowTaskTimedOut,
            EventAttributes::ActivityTaskScheduled { .. } => EventType::ActivityTaskScheduled,
            EventAttributes::ActivityTaskStarted { .. } => EventType::ActivityTaskStarted,
            EventAttributes::ActivityTaskCompleted { .. } => EventType::ActivityTaskCompleted,
            EventAttributes::ActivityTaskFailed { .. } => EventType::ActivityTaskFailed,
            EventAttributes::ActivityTaskTimedOut { .. } => EventType::ActivityTaskTimedOut,
            EventAttributes::ActivityTaskCancelRequested { .. } => {
                EventType::ActivityTaskCancelRequested
            }
            EventAttributes::ActivityTaskCanceled { .. } => EventType::ActivityTaskCanceled,
            EventAttributes::TimerStarted { .. } => EventType::TimerStarted,
            EventAttributes::TimerFired { .. } => EventType::TimerFired,
            EventAttributes::TimerCanceled { .. } => EventType::TimerCanceled,
            EventAttributes::StartChildWorkflowExecutionInitiated { .. } => {
                EventType::StartChildWorkflowExecutionInitiated
            }
            EventAttributes::ChildWorkflowExecutionStarted { .. } => {
                EventType::ChildWorkflowExecutionStarted
            }
            EventAttributes::ChildWorkflowExecutionCompleted { .. } => {
                EventType::ChildWorkflowExecutionCompleted
            }
            EventAttributes::ChildWorkflowExecutionFailed { .. } => {
                EventType::ChildWorkflowExecutionFailed
            }
            EventAttributes::ChildWorkflowExecutionCanceled { .. } => {
                EventType::ChildWorkflowExecutionCanceled
            }
            EventAttributes::ChildWorkflowExecutionTimedOut { .. } => {
                EventType::ChildWorkflowExecutionTimedOut
            }
            EventAttributes::ChildWorkflowExecutionTerminated { .. } => {
                EventType::ChildWorkflowExecutionTerminated
            }
            EventAttributes::SignalExternalWorkflowExecutionInitiated { .. } => {
                EventType::SignalExternalWorkflowExecutionInitiated
            }
            EventAttributes::ExternalWorkflowExecutionSignaled { .. } => {
                EventType::ExternalWorkflowExecutionSignaled
            }
            EventAttributes::SignalExternalWorkflowExecutionFailed { .. } => {
                EventType::SignalExternalWorkflowExecutionFailed
            }
            EventAttributes::RequestCancelExternalWorkflowExecutionInitiated { .. } => {
                EventType::RequestCancelExternalWorkflowExecutionInitiated
            }
            EventAttributes::ExternalWorkflowExecutionCancelRequested { .. } => {
                EventType::ExternalWorkflowExecutionCancelRequested
            }
            EventAttributes::RequestCancelExternalWorkflowExecutionFailed { .. } => {
                EventType::RequestCancelExternalWorkflowExecutionFailed
            }
            EventAttributes::MarkerRecorded { .. } => EventType::MarkerRecorded,
            EventAttributes::UpsertWorkflowSearchAttributes { .. } => {
                EventType::UpsertWorkflowSearchAttributes
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.event_type().name()
    }

    /// True for events generated by a prior command of this workflow.
    /// These must align 1-1 with the coordinator's command queue.
    pub fn is_command_event(&self) -> bool {
        matches!(
            self.event_type(),
            EventType::ActivityTaskScheduled
                | EventType::ActivityTaskCancelRequested
                | EventType::TimerStarted
                | EventType::TimerCanceled
                | EventType::StartChildWorkflowExecutionInitiated
                | EventType::SignalExternalWorkflowExecutionInitiated
                | EventType::RequestCancelExternalWorkflowExecutionInitiated
                | EventType::MarkerRecorded
                | EventType::UpsertWorkflowSearchAttributes
                | EventType::WorkflowExecutionCompleted
                | EventType::WorkflowExecutionFailed
                | EventType::WorkflowExecutionCanceled
                | EventType::WorkflowExecutionContinuedAsNew
        )
    }

    /// The `scheduled`/`started`/`initiated` event id this event refers back
    /// to, used to route it to the entity machine registered under that id.
    pub fn initial_command_event_id(&self) -> Option<i64> {
        match &self.attributes {
            EventAttributes::ActivityTaskStarted {
                scheduled_event_id, ..
            }
            | EventAttributes::ActivityTaskCompleted {
                scheduled_event_id, ..
            }
            | EventAttributes::ActivityTaskFailed {
                scheduled_event_id, ..
            }
            | EventAttributes::ActivityTaskTimedOut {
                scheduled_event_id, ..
            }
            | EventAttributes::ActivityTaskCancelRequested { scheduled_event_id }
            | EventAttributes::ActivityTaskCanceled { scheduled_event_id }
            | EventAttributes::WorkflowTaskStarted { scheduled_event_id }
            | EventAttributes::WorkflowTaskCompleted {
                scheduled_event_id, ..
            }
            | EventAttributes::WorkflowTaskFailed { scheduled_event_id }
            | EventAttributes::WorkflowTaskTimedOut { scheduled_event_id } => {
                Some(*scheduled_event_id)
            }
            EventAttributes::TimerFired {
                started_event_id, ..
            }
            | EventAttributes::TimerCanceled {
                started_event_id, ..
            } => Some(*started_event_id),
            EventAttributes::ChildWorkflowExecutionStarted {
                initiated_event_id, ..
            }
            | EventAttributes::ChildWorkflowExecutionCompleted {
                initiated_event_id, ..
            }
            | EventAttributes::ChildWorkflowExecutionFailed {
                initiated_event_id, ..
            }
            | EventAttributes::ChildWorkflowExecutionCanceled { initiated_event_id }
            | EventAttributes::ChildWorkflowExecutionTimedOut { initiated_event_id }
            | EventAttributes::ChildWorkflowExecutionTerminated { initiated_event_id }
            | EventAttributes::ExternalWorkflowExecutionSignaled { initiated_event_id }
            | EventAttributes::SignalExternalWorkflowExecutionFailed {
                initiated_event_id, ..
            }
            | EventAttributes::ExternalWorkflowExecutionCancelRequested { initiated_event_id }
            | EventAttributes::RequestCancelExternalWorkflowExecutionFailed {
                initiated_event_id, ..
            } => Some(*initiated_event_id),
            _ => None,
        }
    }

    /// True when this event ends the workflow execution.
    pub fn is_final_execution_event(&self) -> bool {
        matches!(
            self.event_type(),
            EventType::WorkflowExecutionCompleted
                | EventType::WorkflowExecutionFailed
                | EventType::WorkflowExecutionTimedOut
                | EventType::WorkflowExecutionCanceled
                | EventType::WorkflowExecutionTerminated
                | EventType::WorkflowExecutionContinuedAsNew
        )
    }

    /// Version-marker shortcut used by preload and absorption paths.
    pub fn version_marker_details(&self) -> Option<crate::marker::VersionMarker> {
        match &self.attributes {
            EventAttributes::MarkerRecorded {
                marker_name,
                details: Some(details),
            } if marker_name == crate::marker::VERSION_MARKER_NAME => {
                details.decode_json().ok()
            }
            _ => None,
        }
    }
}

impl EventType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowExecutionStarted => "WorkflowExecutionStarted",
            Self::WorkflowExecutionCompleted => "WorkflowExecutionCompleted",
            Self::WorkflowExecutionFailed => "WorkflowExecutionFailed",
            Self::WorkflowExecutionTimedOut => "WorkflowExecutionTimedOut",
            Self::WorkflowExecutionCanceled => "WorkflowExecutionCanceled",
            Self::WorkflowExecutionTerminated => "WorkflowExecutionTerminated",
            Self::WorkflowExecutionContinuedAsNew => "WorkflowExecutionContinuedAsNew",
            Self::WorkflowExecutionSignaled => "WorkflowExecutionSignaled",
            Self::WorkflowExecutionCancelRequested => "WorkflowExecutionCancelRequested",
            Self::WorkflowTaskScheduled => "WorkflowTaskScheduled",
            Self::WorkflowTaskStarted => "WorkflowTaskStarted",
            Self::WorkflowTaskCompleted => "WorkflowTaskCompleted",
            Self::WorkflowTaskFailed => "WorkflowTaskFailed",
            Self::WorkflowTaskTimedOut => "WorkflowTaskTimedOut",
            Self::ActivityTaskScheduled => "ActivityTaskScheduled",
            Self::ActivityTaskStarted => "ActivityTaskStarted",
            Self::ActivityTaskCompleted => "ActivityTaskCompleted",
            Self::ActivityTaskFailed => "ActivityTaskFailed",
            Self::ActivityTaskTimedOut => "ActivityTaskTimedOut",
            Self::ActivityTaskCancelRequested => "ActivityTaskCancelRequested",
            Self::ActivityTaskCanceled => "ActivityTaskCanceled",
            Self::TimerStarted => "TimerStarted",
            Self::TimerFired => "TimerFired",
            Self::TimerCanceled => "TimerCanceled",
            Self::StartChildWorkflowExecutionInitiated => "StartChildWorkflowExecutionInitiated",
            Self::ChildWorkflowExecutionStarted => "ChildWorkflowExecutionStarted",
            Self::ChildWorkflowExecutionCompleted => "ChildWorkflowExecutionCompleted",
            Self::ChildWorkflowExecutionFailed => "ChildWorkflowExecutionFailed",
            Self::ChildWorkflowExecutionCanceled => "ChildWorkflowExecutionCanceled",
            Self::ChildWorkflowExecutionTimedOut => "ChildWorkflowExecutionTimedOut",
            Self::ChildWorkflowExecutionTerminated => "ChildWorkflowExecutionTerminated",
            Self::SignalExternalWorkflowExecutionInitiated => {
                "SignalExternalWorkflowExecutionInitiated"
            }
            Self::ExternalWorkflowExecutionSignaled => "ExternalWorkflowExecutionSignaled",
            Self::SignalExternalWorkflowExecutionFailed => "SignalExternalWorkflowExecutionFailed",
            Self::RequestCancelExternalWorkflowExecutionInitiated => {
                "RequestCancelExternalWorkflowExecutionInitiated"
            }
            Self::ExternalWorkflowExecutionCancelRequested => {
                "ExternalWorkflowExecutionCancelRequested"
            }
            Self::RequestCancelExternalWorkflowExecutionFailed => {
                "RequestCancelExternalWorkflowExecutionFailed"
            }
            Self::MarkerRecorded => "MarkerRecorded",
            Self::UpsertWorkflowSearchAttributes => "UpsertWorkflowSearchAttributes",
        }
    }
}
