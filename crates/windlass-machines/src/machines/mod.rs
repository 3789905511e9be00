//! The entity state machines: one per durable operation.
//!
//! Every machine follows the same skeleton. Its constructor fires an
//! internal `Schedule` event that moves `Created → <command created>` and
//! returns the initial command; replayed command events move it to the
//! recorded state; further events drive it to a terminal state, firing the
//! completion callback exactly once. `cancel` semantics depend on the
//! current state: a command not yet shipped is cancelled in place, an
//! in-flight operation produces a cancel command or is abandoned.
//!
//! Machines are plain structs behind `dyn EntityMachine`; the coordinator
//! owns them in a key-addressed map and routes events by initiating event
//! id. Completion callbacks are owned and fired by the machine itself, so
//! the coordinator never holds workflow-side state.

pub mod activity;
pub mod cancel_external;
pub mod cancel_workflow;
pub mod child_workflow;
pub mod complete_workflow;
pub mod continue_as_new;
pub mod fail_workflow;
pub mod local_activity;
pub mod mutable_side_effect;
pub mod side_effect;
pub mod signal_external;
pub mod timer;
pub mod upsert_search_attributes;
pub mod version;
pub mod workflow_task;

use chrono::{DateTime, Utc};
use windlass_types::{Command, CommandType, Failure, HistoryEvent, Payload, RetryPolicy};

use crate::error::WorkflowMachinesError;

/// Key of a machine in the coordinator's registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineKey(pub(crate) u64);

/// Outcome delivered to workflow code when an operation resolves.
pub type CompletionResult = Result<Option<Payload>, Failure>;

/// Fired at most once by the owning machine.
pub type CompletionCallback = Box<dyn FnOnce(CompletionResult)>;

/// A local activity the worker must execute, surfaced to the driver
/// instead of a command (local activities only hit history via their
/// completion marker).
#[derive(Clone, Debug, PartialEq)]
pub struct ExecuteLocalActivityParameters {
    pub activity_id: String,
    pub activity_type: String,
    pub input: Option<Payload>,
    pub retry_policy: RetryPolicy,
    pub attempt: u32,
}

/// Jobs the coordinator surfaces to the runtime between machine steps.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkflowJob {
    StartWorkflow {
        workflow_type: String,
        workflow_id: String,
        run_id: String,
        input: Option<Payload>,
    },
    SignalWorkflow {
        signal_name: String,
        input: Option<Payload>,
    },
    CancelWorkflow {
        reason: String,
    },
}

/// What a machine asks the coordinator to do after a step.
#[derive(Debug)]
pub enum MachineResponse {
    /// Enqueue a new command owned by the same machine.
    IssueNewCommand(Command),
    /// Surface a job to the runtime.
    PushJob(WorkflowJob),
    /// A workflow task started: advance workflow time/ids and release the
    /// event loop.
    TriggerWorkflowTaskStarted {
        started_event_id: i64,
        time: Option<DateTime<Utc>>,
    },
    /// Hand a local activity to the worker for execution.
    QueueLocalActivity(ExecuteLocalActivityParameters),
}

/// A machine plus the initial command its constructor produced.
pub struct NewMachineWithCommand<M> {
    pub machine: M,
    pub command: Command,
}

/// Thin dispatch interface over all machine variants.
pub trait EntityMachine {
    fn name(&self) -> &'static str;

    /// Feed a history event belonging to this machine.
    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        has_next: bool,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError>;

    /// Notification that the machine's pending command moved onto the
    /// authoritative command queue.
    fn handle_command(
        &mut self,
        _command_type: CommandType,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        Ok(Vec::new())
    }

    /// Workflow code requested cancellation of this operation.
    fn cancel(&mut self) -> Result<Vec<MachineResponse>, WorkflowMachinesError>;

    fn is_final_state(&self) -> bool;

    /// True if the machine's command was cancelled before being shipped;
    /// such commands are dropped instead of sent or matched.
    fn was_cancelled_before_sent(&self) -> bool {
        false
    }

    /// Whether the given command event is the one this machine's pending
    /// command expects. Used for queue-head matching of marker commands,
    /// where the event type alone is ambiguous.
    fn matches_event(&self, event: &HistoryEvent) -> bool;

    /// True for marker commands created during replay that may be dropped
    /// when history holds no matching marker at this position.
    fn is_replay_skippable(&self) -> bool {
        false
    }

    /// Resolve a skippable machine from cached state after its command was
    /// dropped.
    fn resolve_skipped(&mut self) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        Ok(Vec::new())
    }
}

/// Fire a completion callback at most once.
pub(crate) fn notify(cb: &mut Option<CompletionCallback>, result: CompletionResult) {
    if let Some(cb) = cb.take() {
        cb(result);
    }
}
