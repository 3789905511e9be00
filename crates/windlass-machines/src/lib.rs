//! The deterministic replay core: entity state machines, the workflow-task
//! buffer, and the coordinator that aligns recorded history with the
//! commands re-generated by workflow code.

pub mod buffer;
pub mod coordinator;
pub mod definition;
pub mod error;
pub mod machines;

pub use buffer::WftBuffer;
pub use coordinator::{EventHandlingOutcome, WorkflowStateMachines};
pub use definition::{ExplicitEvent, StateMachineDefinition, Trigger};
pub use error::{ReplayStateDescriptor, WorkflowMachinesError};
pub use machines::activity::{ActivityCancellationType, ActivityScheduleAttributes};
pub use machines::child_workflow::{ChildWorkflowAttributes, ChildWorkflowCancellationType};
pub use machines::version::DEFAULT_VERSION;
pub use machines::{
    CompletionCallback, CompletionResult, ExecuteLocalActivityParameters, MachineKey,
    WorkflowJob,
};
