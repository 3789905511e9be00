use std::fmt;

/// One-line replay-state snapshot attached to internal errors for
/// diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStateDescriptor {
    pub previous_started_event_id: i64,
    pub workflow_task_started_event_id: i64,
    pub current_started_event_id: i64,
}

impl fmt::Display for ReplayStateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{PreviousStartedEventId={}, WorkflowTaskStartedEventId={}, CurrentStartedEventId={}}}",
            self.previous_started_event_id,
            self.workflow_task_started_event_id,
            self.current_started_event_id
        )
    }
}

/// Errors produced while driving the workflow state machines.
///
/// `Nondeterminism` means recorded history cannot be reconciled with the
/// commands the current code generates; the transport fails the workflow
/// task and lets the service decide what to do next. `Fatal` is an
/// unexpected failure raised inside a machine; the coordinator wraps it
/// into `Internal`, attaching the replay-state descriptor.
/// `ProgressRegression` means the service handed us history older than
/// what this coordinator already processed; its cached state must be
/// discarded.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowMachinesError {
    #[error("nondeterminism: {0}")]
    Nondeterminism(String),

    #[error("fatal error in workflow machines: {0}")]
    Fatal(String),

    #[error("internal workflow task error: {message} {state}")]
    Internal {
        message: String,
        state: ReplayStateDescriptor,
    },

    #[error(
        "service lost progress: previous_started_event_id {previous_started_event_id} < \
         current_started_event_id {current_started_event_id}"
    )]
    ProgressRegression {
        previous_started_event_id: i64,
        current_started_event_id: i64,
    },
}

impl WorkflowMachinesError {
    pub fn is_nondeterminism(&self) -> bool {
        matches!(self, Self::Nondeterminism(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_renders_one_line() {
        let state = ReplayStateDescriptor {
            previous_started_event_id: 7,
            workflow_task_started_event_id: 12,
            current_started_event_id: 7,
        };
        assert_eq!(
            state.to_string(),
            "{PreviousStartedEventId=7, WorkflowTaskStartedEventId=12, CurrentStartedEventId=7}"
        );
    }
}
