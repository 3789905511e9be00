//! Async invocation detection for stub calls.
//!
//! Workflow code reaches activities and child workflows through stubs. A
//! stub method produces a *call value*; handing it to [`invoke`] starts the
//! operation and returns its promise instead of suspending. The marker
//! capability ([`StubInvocation`], sealed) is implemented only by the call
//! values stubs produce, so plain closures, free functions, and other
//! function values cannot pass the check at all. The per-thread invocation
//! context mirrors the stub-side `is_async` test: it is scoped to the
//! workflow thread, never process-global.

use std::cell::Cell;

use windlass_types::Payload;

use crate::context::{
    ActivityOptions, ChildWorkflowOptions, WfContext, WorkflowError,
};
use crate::promise::WfPromise;

thread_local! {
    static ASYNC_DEPTH: Cell<u32> = const { Cell::new(0) };
}

mod sealed {
    pub trait Sealed {}
}

/// Marker capability of stub call values. Sealed: only the stubs in this
/// module implement it.
pub trait StubInvocation: sealed::Sealed {
    /// Start the operation and return its promise.
    fn start(self) -> Result<WfPromise, WorkflowError>;
}

/// True while a stub call is being converted into a promise on this
/// workflow thread. Stub internals consult this instead of suspending.
pub fn in_async_invocation() -> bool {
    ASYNC_DEPTH.with(|depth| depth.get()) > 0
}

/// Start a stub call asynchronously, producing a promise instead of
/// suspending the workflow.
pub fn invoke<C: StubInvocation>(call: C) -> Result<WfPromise, WorkflowError> {
    ASYNC_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = call.start();
    ASYNC_DEPTH.with(|depth| depth.set(depth.get() - 1));
    result
}

/// A typed activity stub bound to a context and default options.
pub struct ActivityStub {
    ctx: WfContext,
    defaults: ActivityOptions,
}

impl ActivityStub {
    pub fn new(ctx: WfContext, defaults: ActivityOptions) -> Self {
        Self { ctx, defaults }
    }

    /// Produce a call value for one invocation.
    pub fn call(&self, input: Option<Payload>) -> ActivityCall {
        let mut options = self.defaults.clone();
        options.input = input;
        ActivityCall {
            ctx: self.ctx.clone(),
            options,
        }
    }
}

pub struct ActivityCall {
    ctx: WfContext,
    options: ActivityOptions,
}

impl ActivityCall {
    /// Synchronous-style execution: start and await in place.
    pub async fn execute(self) -> Result<Option<Payload>, WorkflowError> {
        let promise = self.start()?;
        promise.await.map_err(WorkflowError::Failure)
    }
}

impl sealed::Sealed for ActivityCall {}

impl StubInvocation for ActivityCall {
    fn start(self) -> Result<WfPromise, WorkflowError> {
        self.ctx.schedule_activity(self.options).map(|h| h.promise)
    }
}

/// A child-workflow stub.
pub struct ChildWorkflowStub {
    ctx: WfContext,
}

impl ChildWorkflowStub {
    pub fn new(ctx: WfContext) -> Self {
        Self { ctx }
    }

    pub fn call(&self, options: ChildWorkflowOptions) -> ChildWorkflowCall {
        ChildWorkflowCall {
            ctx: self.ctx.clone(),
            options,
        }
    }
}

pub struct ChildWorkflowCall {
    ctx: WfContext,
    options: ChildWorkflowOptions,
}

impl sealed::Sealed for ChildWorkflowCall {}

impl StubInvocation for ChildWorkflowCall {
    fn start(self) -> Result<WfPromise, WorkflowError> {
        self.ctx
            .start_child_workflow(self.options)
            .map(|h| h.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::resolved;

    struct Probe {
        observed_async: std::rc::Rc<std::cell::Cell<bool>>,
    }

    impl sealed::Sealed for Probe {}

    impl StubInvocation for Probe {
        fn start(self) -> Result<WfPromise, WorkflowError> {
            self.observed_async.set(in_async_invocation());
            Ok(resolved(Ok(None)))
        }
    }

    #[test]
    fn invoke_marks_the_thread_async_only_for_the_duration() {
        let observed = std::rc::Rc::new(std::cell::Cell::new(false));
        assert!(!in_async_invocation());
        let promise = invoke(Probe {
            observed_async: observed.clone(),
        })
        .unwrap();
        assert!(observed.get());
        assert!(!in_async_invocation());
        assert!(promise.is_resolved());
    }
}
