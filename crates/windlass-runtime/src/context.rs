//! The handle workflow code uses to reach the coordinator.
//!
//! Every operation here maps to a public operation of the workflow state
//! machines and is legal only while the event loop is running the workflow
//! (the coordinator enforces the guard). Operations return promises,
//! deterministic values, or cancellation handles; machines created through
//! a context are owned by its cancellation scope.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use uuid::Uuid;
use windlass_machines::{
    ActivityCancellationType, ActivityScheduleAttributes, ChildWorkflowAttributes,
    ChildWorkflowCancellationType, MachineKey, WorkflowMachinesError, WorkflowStateMachines,
};
use windlass_types::{Failure, Payload, RetryPolicy};

use crate::determinism::{deterministic_rng, deterministic_uuid};
use crate::promise::{completion_pair, resolved, WfPromise};
use crate::scope::{CancelHandle, CancellationScope, CancelledFuture};

/// Errors surfaced to workflow code by context operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Engine(#[from] WorkflowMachinesError),
    /// A deterministic, user-visible failure (for example an unsupported
    /// version).
    #[error(transparent)]
    Failure(#[from] Failure),
}

#[derive(Clone, Debug)]
pub struct WorkflowStartInfo {
    pub workflow_type: String,
    pub workflow_id: String,
    pub run_id: String,
    pub input: Option<Payload>,
}

/// Buffers signals delivered before workflow code awaits them and resolves
/// promises for signals awaited before delivery.
#[derive(Default)]
pub(crate) struct SignalRegistry {
    buffered: HashMap<String, VecDeque<Option<Payload>>>,
    waiting: HashMap<String, VecDeque<windlass_machines::CompletionCallback>>,
}

impl SignalRegistry {
    /// Returns true when the delivery resolved a waiting promise.
    pub(crate) fn deliver(&mut self, signal_name: &str, payload: Option<Payload>) -> bool {
        if let Some(queue) = self.waiting.get_mut(signal_name) {
            if let Some(callback) = queue.pop_front() {
                callback(Ok(payload));
                return true;
            }
        }
        self.buffered
            .entry(signal_name.to_string())
            .or_default()
            .push_back(payload);
        false
    }

    pub(crate) fn await_signal(&mut self, signal_name: &str) -> WfPromise {
        if let Some(queue) = self.buffered.get_mut(signal_name) {
            if let Some(payload) = queue.pop_front() {
                return resolved(Ok(payload));
            }
        }
        let (promise, callback) = completion_pair();
        self.waiting
            .entry(signal_name.to_string())
            .or_default()
            .push_back(callback);
        promise
    }
}

#[derive(Clone, Debug)]
pub struct ActivityOptions {
    pub activity_type: String,
    pub input: Option<Payload>,
    pub retry_policy: Option<RetryPolicy>,
    pub schedule_to_close_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub cancellation_type: ActivityCancellationType,
}

impl ActivityOptions {
    pub fn new(activity_type: impl Into<String>) -> Self {
        Self {
            activity_type: activity_type.into(),
            input: None,
            retry_policy: None,
            schedule_to_close_timeout: None,
            start_to_close_timeout: None,
            cancellation_type: ActivityCancellationType::TryCancel,
        }
    }

    pub fn input(mut self, input: Payload) -> Self {
        self.input = Some(input);
        self
    }

    pub fn cancellation_type(mut self, cancellation_type: ActivityCancellationType) -> Self {
        self.cancellation_type = cancellation_type;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ChildWorkflowOptions {
    pub workflow_id: String,
    pub workflow_type: String,
    pub input: Option<Payload>,
    pub cancellation_type: ChildWorkflowCancellationType,
}

#[derive(Clone, Debug)]
pub struct LocalActivityOptions {
    pub activity_type: String,
    pub input: Option<Payload>,
    pub retry_policy: RetryPolicy,
}

/// A scheduled operation: the promise it resolves plus its cancellation
/// handle.
pub struct OperationHandle {
    pub promise: WfPromise,
    pub cancel: CancelHandle,
}

/// A started child workflow: the run id arrives on `started`, the outcome
/// on `result`.
pub struct ChildWorkflowHandle {
    pub started: WfPromise,
    pub result: WfPromise,
    pub cancel: CancelHandle,
}

#[derive(Clone)]
pub struct WfContext {
    machines: Rc<RefCell<WorkflowStateMachines>>,
    scope: CancellationScope,
    signals: Rc<RefCell<SignalRegistry>>,
    start: Rc<RefCell<Option<WorkflowStartInfo>>>,
}

impl WfContext {
    pub(crate) fn new(
        machines: Rc<RefCell<WorkflowStateMachines>>,
        scope: CancellationScope,
        signals: Rc<RefCell<SignalRegistry>>,
        start: Rc<RefCell<Option<WorkflowStartInfo>>>,
    ) -> Self {
        Self {
            machines,
            scope,
            signals,
            start,
        }
    }

    pub fn workflow_info(&self) -> Option<WorkflowStartInfo> {
        self.start.borrow().clone()
    }

    pub fn input(&self) -> Option<Payload> {
        self.start.borrow().as_ref().and_then(|info| info.input.clone())
    }

    fn handle(&self, key: MachineKey) -> CancelHandle {
        CancelHandle::new(key, self.machines.clone())
    }

    fn register_scoped(&self, key: MachineKey) -> Result<(), WorkflowError> {
        self.scope.register(self.handle(key))?;
        Ok(())
    }

    pub fn schedule_activity(
        &self,
        options: ActivityOptions,
    ) -> Result<OperationHandle, WorkflowError> {
        let (promise, callback) = completion_pair();
        let key = self.machines.borrow_mut().schedule_activity(
            ActivityScheduleAttributes {
                activity_id: String::new(),
                activity_type: options.activity_type,
                input: options.input,
                retry_policy: options.retry_policy,
                schedule_to_close_timeout: options.schedule_to_close_timeout,
                start_to_close_timeout: options.start_to_close_timeout,
                cancellation_type: options.cancellation_type,
            },
            callback,
        )?;
        self.register_scoped(key)?;
        Ok(OperationHandle {
            promise,
            cancel: self.handle(key),
        })
    }

    pub fn timer(&self, duration: Duration) -> Result<OperationHandle, WorkflowError> {
        let (promise, callback) = completion_pair();
        let key = self.machines.borrow_mut().new_timer(duration, callback)?;
        self.register_scoped(key)?;
        Ok(OperationHandle {
            promise,
            cancel: self.handle(key),
        })
    }

    pub fn start_child_workflow(
        &self,
        options: ChildWorkflowOptions,
    ) -> Result<ChildWorkflowHandle, WorkflowError> {
        let (result, callback) = completion_pair();
        let (started, started_resolver) = completion_pair();
        let started_callback =
            Box::new(move |run_id: String| started_resolver(Ok(Some(Payload::text(&run_id)))));
        let key = self.machines.borrow_mut().start_child_workflow(
            ChildWorkflowAttributes {
                workflow_id: options.workflow_id,
                workflow_type: options.workflow_type,
                input: options.input,
                cancellation_type: options.cancellation_type,
            },
            started_callback,
            callback,
        )?;
        self.register_scoped(key)?;
        Ok(ChildWorkflowHandle {
            started,
            result,
            cancel: self.handle(key),
        })
    }

    pub fn signal_external_workflow(
        &self,
        workflow_id: impl Into<String>,
        signal_name: impl Into<String>,
        input: Option<Payload>,
    ) -> Result<OperationHandle, WorkflowError> {
        let (promise, callback) = completion_pair();
        let key = self.machines.borrow_mut().signal_external_workflow(
            workflow_id.into(),
            signal_name.into(),
            input,
            false,
            callback,
        )?;
        self.register_scoped(key)?;
        Ok(OperationHandle {
            promise,
            cancel: self.handle(key),
        })
    }

    pub fn request_cancel_external_workflow(
        &self,
        workflow_id: impl Into<String>,
    ) -> Result<OperationHandle, WorkflowError> {
        let (promise, callback) = completion_pair();
        let key = self.machines.borrow_mut().request_cancel_external_workflow(
            workflow_id.into(),
            false,
            callback,
        )?;
        self.register_scoped(key)?;
        Ok(OperationHandle {
            promise,
            cancel: self.handle(key),
        })
    }

    pub fn upsert_search_attributes(
        &self,
        attributes: BTreeMap<String, Payload>,
    ) -> Result<(), WorkflowError> {
        self.machines
            .borrow_mut()
            .upsert_search_attributes(attributes)?;
        Ok(())
    }

    pub fn schedule_local_activity(
        &self,
        options: LocalActivityOptions,
    ) -> Result<WfPromise, WorkflowError> {
        let (promise, callback) = completion_pair();
        let (key, _activity_id) = self.machines.borrow_mut().schedule_local_activity(
            options.activity_type,
            options.input,
            options.retry_policy,
            callback,
        )?;
        self.register_scoped(key)?;
        Ok(promise)
    }

    /// Run `func` once, durably. During replay the recorded result is
    /// returned and `func` is not invoked.
    pub fn side_effect(
        &self,
        func: impl FnOnce() -> Option<Payload> + 'static,
    ) -> Result<WfPromise, WorkflowError> {
        let (promise, callback) = completion_pair();
        self.machines
            .borrow_mut()
            .side_effect(Box::new(func), callback)?;
        Ok(promise)
    }

    /// `new = func(previous)`, recorded only when the value changes.
    pub fn mutable_side_effect(
        &self,
        id: &str,
        func: impl FnOnce(Option<&Payload>) -> Payload + 'static,
    ) -> Result<WfPromise, WorkflowError> {
        let (promise, callback) = completion_pair();
        self.machines
            .borrow_mut()
            .mutable_side_effect(id, Box::new(func), callback)?;
        Ok(promise)
    }

    pub fn get_version(
        &self,
        change_id: &str,
        min_supported: i32,
        max_supported: i32,
    ) -> Result<i32, WorkflowError> {
        match self
            .machines
            .borrow_mut()
            .get_version(change_id, min_supported, max_supported)?
        {
            Ok(version) => Ok(version),
            Err(failure) => Err(WorkflowError::Failure(failure)),
        }
    }

    pub fn random_uuid(&self) -> Result<Uuid, WorkflowError> {
        let (run_id, counter) = self.machines.borrow_mut().next_random_material()?;
        Ok(deterministic_uuid(&run_id, counter))
    }

    pub fn new_random(&self) -> Result<StdRng, WorkflowError> {
        let (run_id, counter) = self.machines.borrow_mut().next_random_material()?;
        Ok(deterministic_rng(&run_id, counter))
    }

    /// Workflow time: the latest `WorkflowTaskStarted` time, never the
    /// wall clock.
    pub fn current_time_millis(&self) -> i64 {
        self.machines.borrow().current_time_millis()
    }

    pub fn is_replaying(&self) -> bool {
        self.machines.borrow().is_replaying()
    }

    pub fn await_signal(&self, signal_name: &str) -> WfPromise {
        self.signals.borrow_mut().await_signal(signal_name)
    }

    /// Resolves when this context's scope is cancelled (for the root
    /// context, when the execution receives a cancel request).
    pub fn cancel_requested(&self) -> CancelledFuture {
        self.scope.cancelled()
    }

    pub fn scope(&self) -> CancellationScope {
        self.scope.clone()
    }

    /// A context whose operations belong to a child cancellation scope.
    pub fn child_scope(&self) -> WfContext {
        let mut child = self.clone();
        child.scope = self.scope.child();
        child
    }
}
