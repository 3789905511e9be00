//! The cooperative single-threaded scheduler for workflow code.
//!
//! Workflow code runs as one future on one logical thread; there is no
//! preemption and no parallelism. The only suspension points are awaits on
//! promises. The scheduler polls the future while resolutions keep
//! arriving (the wake flag) and stops as soon as the code is blocked on
//! unresolved promises; an `executing` guard keeps the loop from
//! re-entering itself when a completion callback lands mid-poll.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use windlass_types::{Failure, Payload};

/// How the workflow future ended.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkflowExit {
    Complete(Option<Payload>),
    Fail(Failure),
    /// The workflow acknowledged a cancellation request and unwound.
    Cancel,
    ContinueAsNew {
        workflow_type: String,
        input: Option<Payload>,
    },
}

pub type WorkflowFuture = Pin<Box<dyn Future<Output = WorkflowExit>>>;

struct WakeFlag(AtomicBool);

impl WakeFlag {
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::Release);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct WorkflowScheduler {
    future: Option<WorkflowFuture>,
    wake: Arc<WakeFlag>,
    waker: Waker,
    result: Option<WorkflowExit>,
    executing: bool,
}

impl WorkflowScheduler {
    pub fn new(future: WorkflowFuture) -> Self {
        let wake = Arc::new(WakeFlag(AtomicBool::new(true)));
        let waker = Waker::from(wake.clone());
        Self {
            future: Some(future),
            wake,
            waker,
            result: None,
            executing: false,
        }
    }

    /// True when a resolution arrived since the last poll and the workflow
    /// still has code to run.
    pub fn has_pending_wake(&self) -> bool {
        self.future.is_some() && self.wake.is_set()
    }

    /// Request a poll on the next run (used for deliveries that bypass
    /// promise wakers).
    pub fn wake_now(&self) {
        self.wake.0.store(true, Ordering::Release);
    }

    /// Poll the workflow until it is blocked on unresolved promises or
    /// finished. Returns true when at least one poll happened. Never
    /// re-enters itself.
    pub fn run_until_blocked(&mut self) -> bool {
        if self.executing {
            return false;
        }
        self.executing = true;
        let mut polled = false;
        while self.result.is_none() {
            let Some(future) = self.future.as_mut() else {
                break;
            };
            if !self.wake.take() {
                break;
            }
            polled = true;
            let mut cx = Context::from_waker(&self.waker);
            if let Poll::Ready(exit) = future.as_mut().poll(&mut cx) {
                self.result = Some(exit);
                self.future = None;
            }
        }
        self.executing = false;
        polled
    }

    /// The workflow's exit value, once. `None` while it is still running.
    pub fn take_result(&mut self) -> Option<WorkflowExit> {
        self.result.take()
    }

    pub fn is_finished(&self) -> bool {
        self.future.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::completion_pair;

    #[test]
    fn runs_to_first_suspension_then_resumes_on_resolution() {
        let (promise, callback) = completion_pair();
        let mut scheduler = WorkflowScheduler::new(Box::pin(async move {
            let result = promise.await;
            assert!(result.is_ok());
            WorkflowExit::Complete(None)
        }));

        assert!(scheduler.run_until_blocked());
        assert!(scheduler.take_result().is_none());
        // Blocked: nothing resolved, polling again is a no-op.
        assert!(!scheduler.run_until_blocked());

        callback(Ok(None));
        assert!(scheduler.has_pending_wake());
        assert!(scheduler.run_until_blocked());
        assert_eq!(scheduler.take_result(), Some(WorkflowExit::Complete(None)));
        assert!(scheduler.is_finished());
    }

    #[test]
    fn within_task_resolutions_complete_in_history_order() {
        let (first, resolve_first) = completion_pair();
        let (second, resolve_second) = completion_pair();
        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let log = order.clone();
        let mut scheduler = WorkflowScheduler::new(Box::pin(async move {
            first.await.ok();
            log.borrow_mut().push("first");
            second.await.ok();
            log.borrow_mut().push("second");
            WorkflowExit::Complete(None)
        }));
        scheduler.run_until_blocked();

        // Resolutions arrive in event order; one run drains both awaits.
        resolve_first(Ok(None));
        resolve_second(Ok(None));
        scheduler.run_until_blocked();
        assert_eq!(order.borrow().as_slice(), ["first", "second"]);
        assert!(scheduler.take_result().is_some());
    }
}
