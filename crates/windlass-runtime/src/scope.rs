//! Cancellation scopes.
//!
//! A scope owns the cancellation handles of every entity machine created
//! under it. Cancelling the scope fires each machine's cancellation path
//! exactly once (handles are drained) and cascades into child scopes; the
//! cancellation signal itself surfaces to workflow code at its next
//! suspension point, through the promises the machines resolve.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use windlass_machines::{MachineKey, WorkflowMachinesError, WorkflowStateMachines};

/// Cancels one entity machine through the coordinator.
#[derive(Clone)]
pub struct CancelHandle {
    key: MachineKey,
    machines: Rc<RefCell<WorkflowStateMachines>>,
}

impl CancelHandle {
    pub fn new(key: MachineKey, machines: Rc<RefCell<WorkflowStateMachines>>) -> Self {
        Self { key, machines }
    }

    pub fn cancel(&self) -> Result<(), WorkflowMachinesError> {
        self.machines.borrow_mut().cancel_machine(self.key)
    }
}

#[derive(Default)]
struct ScopeState {
    cancelled: bool,
    handles: Vec<CancelHandle>,
    children: Vec<CancellationScope>,
    waiters: Vec<Waker>,
}

#[derive(Clone, Default)]
pub struct CancellationScope {
    inner: Rc<RefCell<ScopeState>>,
}

impl CancellationScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a child scope; cancelling the parent cancels it too.
    pub fn child(&self) -> CancellationScope {
        let child = CancellationScope::new();
        if self.is_cancelled() {
            child.inner.borrow_mut().cancelled = true;
        } else {
            self.inner.borrow_mut().children.push(child.clone());
        }
        child
    }

    /// Register an operation owned by this scope. If the scope is already
    /// cancelled the operation is cancelled on the spot.
    pub fn register(&self, handle: CancelHandle) -> Result<(), WorkflowMachinesError> {
        if self.is_cancelled() {
            return handle.cancel();
        }
        self.inner.borrow_mut().handles.push(handle);
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.borrow().cancelled
    }

    /// Cancel every owned machine exactly once and cascade to children.
    pub fn cancel(&self) -> Result<(), WorkflowMachinesError> {
        let (handles, children, waiters) = {
            let mut state = self.inner.borrow_mut();
            if state.cancelled {
                return Ok(());
            }
            state.cancelled = true;
            (
                std::mem::take(&mut state.handles),
                std::mem::take(&mut state.children),
                std::mem::take(&mut state.waiters),
            )
        };
        for handle in handles {
            handle.cancel()?;
        }
        for child in children {
            child.cancel()?;
        }
        for waker in waiters {
            waker.wake();
        }
        Ok(())
    }

    /// Resolves once the scope is cancelled; workflow code awaits this to
    /// react to an external cancellation request.
    pub fn cancelled(&self) -> CancelledFuture {
        CancelledFuture {
            scope: self.clone(),
        }
    }
}

pub struct CancelledFuture {
    scope: CancellationScope,
}

impl Future for CancelledFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.scope.inner.borrow_mut();
        if state.cancelled {
            Poll::Ready(())
        } else {
            state.waiters.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent_and_cascades_to_children() {
        let parent = CancellationScope::new();
        let child = parent.child();
        parent.cancel().unwrap();
        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
        // A second cancel is a no-op.
        parent.cancel().unwrap();

        // Scopes created under a cancelled parent start cancelled.
        assert!(parent.child().is_cancelled());
    }
}
