use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// Which activity timeout elapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutKind {
    ScheduleToClose,
    ScheduleToStart,
    StartToClose,
    Heartbeat,
}

impl TimeoutKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScheduleToClose => "schedule-to-close",
            Self::ScheduleToStart => "schedule-to-start",
            Self::StartToClose => "start-to-close",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// User-raised domain failure.
///
/// `error_type` is opaque to the engine; retry policies consult it against
/// their `do_not_retry` lists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationFailure {
    pub error_type: String,
    pub message: String,
    pub details: Option<Payload>,
    pub non_retryable: bool,
}

impl ApplicationFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            details: None,
            non_retryable: false,
        }
    }

    /// Marks the failure as non-retryable regardless of policy.
    pub fn non_retryable(mut self) -> Self {
        self.non_retryable = true;
        self
    }

    pub fn with_details(mut self, details: Payload) -> Self {
        self.details = Some(details);
        self
    }
}

/// A cancellation surfaced through a promise chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanceledFailure {
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutFailure {
    pub kind: TimeoutKind,
}

/// Wraps the failure of a (possibly retried) activity invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFailure {
    pub activity_id: String,
    pub activity_type: String,
    pub cause: Box<Failure>,
}

/// Wraps the failure of a child workflow execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildWorkflowFailure {
    pub workflow_id: String,
    pub workflow_type: String,
    pub cause: Box<Failure>,
}

/// Failure taxonomy carried through promises, markers, and commands.
///
/// These are data, not engine errors: they cross activity and
/// child-workflow boundaries transparently and are persisted inside
/// history events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Failure {
    #[error("application failure [{}]: {}", .0.error_type, .0.message)]
    Application(ApplicationFailure),
    #[error("canceled: {}", .0.message)]
    Canceled(CanceledFailure),
    #[error("timeout: {}", .0.kind.name())]
    Timeout(TimeoutFailure),
    #[error("activity '{}' ({}) failed: {}", .0.activity_id, .0.activity_type, .0.cause)]
    Activity(ActivityFailure),
    #[error("child workflow '{}' ({}) failed: {}", .0.workflow_id, .0.workflow_type, .0.cause)]
    ChildWorkflow(ChildWorkflowFailure),
}

impl Failure {
    pub fn application(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application(ApplicationFailure::new(error_type, message))
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::Canceled(CanceledFailure {
            message: message.into(),
        })
    }

    pub fn timeout(kind: TimeoutKind) -> Self {
        Self::Timeout(TimeoutFailure { kind })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    /// Innermost application failure, traversing activity/child wrappers.
    pub fn application_cause(&self) -> Option<&ApplicationFailure> {
        match self {
            Self::Application(a) => Some(a),
            Self::Activity(a) => a.cause.application_cause(),
            Self::ChildWorkflow(c) => c.cause.application_cause(),
            _ => None,
        }
    }

    /// Whether a retry policy may retry this failure at all.
    ///
    /// Cancellations are never retried; an application failure flagged
    /// non-retryable wins over any policy.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Canceled(_) => false,
            Self::Application(a) => !a.non_retryable,
            Self::Activity(a) => a.cause.retryable(),
            Self::ChildWorkflow(c) => c.cause.retryable(),
            Self::Timeout(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_cause_unwraps_nested_wrappers() {
        let inner = ApplicationFailure::new("io-error", "disk on fire");
        let failure = Failure::Activity(ActivityFailure {
            activity_id: "1".into(),
            activity_type: "Fetch".into(),
            cause: Box::new(Failure::Application(inner.clone())),
        });

        assert_eq!(failure.application_cause(), Some(&inner));
        assert!(failure.retryable());
    }

    #[test]
    fn canceled_and_non_retryable_are_not_retryable() {
        assert!(!Failure::canceled("scope closed").retryable());
        let f = Failure::Application(ApplicationFailure::new("bad-input", "nope").non_retryable());
        assert!(!f.retryable());
    }
}
