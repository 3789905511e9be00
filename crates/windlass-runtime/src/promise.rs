//! The promise primitive workflow code suspends on.
//!
//! A `WfPromise` is a write-once container of a completion result. Entity
//! machines resolve it through the completion callback half of a
//! [`completion_pair`]; workflow code awaits it. Everything is
//! single-threaded (`Rc`), matching the cooperative scheduling model: the
//! stored waker is the scheduler's, and resolving a promise just flags the
//! event loop to poll again.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use windlass_machines::{CompletionCallback, CompletionResult};

#[derive(Default)]
struct PromiseState {
    value: Option<CompletionResult>,
    waker: Option<Waker>,
}

/// Write-once promise resolved by an entity machine (or the signal
/// registry) and awaited by workflow code.
#[derive(Clone)]
pub struct WfPromise {
    inner: Rc<RefCell<PromiseState>>,
}

/// Create a promise and the machine-facing callback that resolves it.
pub fn completion_pair() -> (WfPromise, CompletionCallback) {
    let inner = Rc::new(RefCell::new(PromiseState::default()));
    let resolver = inner.clone();
    let callback: CompletionCallback = Box::new(move |result| {
        let mut state = resolver.borrow_mut();
        if state.value.is_none() {
            state.value = Some(result);
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }
    });
    (WfPromise { inner }, callback)
}

/// A promise already carrying its result.
pub fn resolved(result: CompletionResult) -> WfPromise {
    let (promise, callback) = completion_pair();
    callback(result);
    promise
}

impl WfPromise {
    pub fn is_resolved(&self) -> bool {
        self.inner.borrow().value.is_some()
    }

    /// Peek at the result without awaiting.
    pub fn peek(&self) -> Option<CompletionResult> {
        self.inner.borrow().value.clone()
    }

    /// Await all promises, returning their results in order.
    pub async fn all(promises: Vec<WfPromise>) -> Vec<CompletionResult> {
        let mut results = Vec::with_capacity(promises.len());
        for promise in promises {
            results.push(promise.await);
        }
        results
    }

    /// Await whichever promise resolves first, returning its index and
    /// result. Ties resolve to the lowest index, deterministically.
    pub fn any(promises: Vec<WfPromise>) -> AnyPromise {
        AnyPromise { promises }
    }

    /// Chain a transformation onto the resolved value.
    pub async fn map<T>(self, f: impl FnOnce(CompletionResult) -> T) -> T {
        f(self.await)
    }
}

impl Future for WfPromise {
    type Output = CompletionResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.borrow_mut();
        match &state.value {
            Some(value) => Poll::Ready(value.clone()),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

pub struct AnyPromise {
    promises: Vec<WfPromise>,
}

impl Future for AnyPromise {
    type Output = (usize, CompletionResult);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        for (index, promise) in self.promises.iter().enumerate() {
            let mut state = promise.inner.borrow_mut();
            if let Some(value) = &state.value {
                return Poll::Ready((index, value.clone()));
            }
            state.waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}
