//! The execution-hosting half of the replay engine: the cooperative
//! scheduler and promise primitive workflow code runs on, the context
//! exposing the coordinator's operations, cancellation scopes, the async
//! invocation shim, deterministic randomness, replay-aware metrics, and
//! the transport-facing driver.

pub mod context;
pub mod determinism;
pub mod driver;
pub mod metrics;
pub mod promise;
pub mod scheduler;
pub mod scope;
pub mod shim;

pub use context::{
    ActivityOptions, ChildWorkflowHandle, ChildWorkflowOptions, LocalActivityOptions,
    OperationHandle, WfContext, WorkflowError, WorkflowStartInfo,
};
pub use determinism::{deterministic_rng, deterministic_uuid};
pub use driver::{
    HistoryUpdate, LocalActivityExecutor, NoLocalActivities, WorkflowDriver, WorkflowFunction,
    WorkflowTaskResult,
};
pub use metrics::MetricsContext;
pub use promise::{completion_pair, resolved, WfPromise};
pub use scheduler::{WorkflowExit, WorkflowFuture, WorkflowScheduler};
pub use scope::{CancelHandle, CancellationScope};
pub use shim::{in_async_invocation, invoke, ActivityStub, ChildWorkflowStub, StubInvocation};
