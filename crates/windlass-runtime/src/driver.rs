//! The driver: the transport-facing contract.
//!
//! Consumes ordered history deliveries (optionally over an SPSC channel),
//! groups them into workflow-task batches, dispatches events into the
//! coordinator, and pumps the cooperative scheduler whenever a workflow
//! task starts or a resolution lands. Marker-based calls that suspend the
//! workflow mid-batch surface as `Stalled` outcomes; the driver runs the
//! event loop and command preparation and redelivers the event, failing
//! with the nondeterminism error only when that makes no progress.
//!
//! Local activities are executed through the `LocalActivityExecutor`
//! contract with SDK-side retry, and their completions are fed back into
//! the coordinator before the task closes.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;
use windlass_machines::{
    EventHandlingOutcome, ExecuteLocalActivityParameters, WftBuffer, WorkflowJob,
    WorkflowMachinesError, WorkflowStateMachines,
};
use windlass_types::{Command, Failure, HistoryEvent, Payload};

use crate::context::{SignalRegistry, WfContext, WorkflowStartInfo};
use crate::metrics::MetricsContext;
use crate::scheduler::{WorkflowExit, WorkflowFuture, WorkflowScheduler};
use crate::scope::CancellationScope;

/// One history delivery from the transport.
#[derive(Clone, Debug)]
pub struct HistoryUpdate {
    pub events: Vec<HistoryEvent>,
    pub previous_started_event_id: i64,
    pub workflow_task_started_event_id: i64,
}

/// What the transport ships back to the service for one workflow task.
#[derive(Clone, Debug)]
pub struct WorkflowTaskResult {
    pub commands: Vec<Command>,
    pub run_finished: bool,
}

/// Executes local activities on behalf of the driver.
#[async_trait::async_trait(?Send)]
pub trait LocalActivityExecutor {
    async fn execute(
        &self,
        params: &ExecuteLocalActivityParameters,
    ) -> Result<Option<Payload>, Failure>;
}

/// Executor for workflows that schedule no local activities.
pub struct NoLocalActivities;

#[async_trait::async_trait(?Send)]
impl LocalActivityExecutor for NoLocalActivities {
    async fn execute(
        &self,
        params: &ExecuteLocalActivityParameters,
    ) -> Result<Option<Payload>, Failure> {
        Err(Failure::application(
            "no-local-activity-executor",
            format!(
                "local activity '{}' scheduled but no executor is configured",
                params.activity_type
            ),
        ))
    }
}

pub type WorkflowFunction = Box<dyn FnOnce(WfContext) -> WorkflowFuture>;

pub struct WorkflowDriver {
    machines: Rc<RefCell<WorkflowStateMachines>>,
    scheduler: WorkflowScheduler,
    buffer: WftBuffer,
    root_scope: CancellationScope,
    signals: Rc<RefCell<SignalRegistry>>,
    start: Rc<RefCell<Option<WorkflowStartInfo>>>,
    metrics: MetricsContext,
    /// Becomes true at the first workflow-task-started trigger; the
    /// scheduler never runs before it.
    started: bool,
}

impl WorkflowDriver {
    pub fn new(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        workflow: WorkflowFunction,
    ) -> Self {
        let machines = Rc::new(RefCell::new(WorkflowStateMachines::new(
            workflow_id.into(),
            run_id.into(),
        )));
        let signals = Rc::new(RefCell::new(SignalRegistry::default()));
        let start = Rc::new(RefCell::new(None));
        let root_scope = CancellationScope::new();
        let ctx = WfContext::new(
            machines.clone(),
            root_scope.clone(),
            signals.clone(),
            start.clone(),
        );
        let scheduler = WorkflowScheduler::new(workflow(ctx));
        Self {
            machines,
            scheduler,
            buffer: WftBuffer::new(),
            root_scope,
            signals,
            start,
            metrics: MetricsContext::new(),
            started: false,
        }
    }

    pub fn metrics(&self) -> &MetricsContext {
        &self.metrics
    }

    /// Apply one history delivery and return the commands it produced.
    pub async fn process_task(
        &mut self,
        update: HistoryUpdate,
        executor: &dyn LocalActivityExecutor,
    ) -> Result<WorkflowTaskResult, WorkflowMachinesError> {
        self.machines.borrow_mut().set_task_ids(
            update.previous_started_event_id,
            update.workflow_task_started_event_id,
        )?;
        self.metrics
            .set_replaying(self.machines.borrow().is_replaying());

        let total = update.events.len();
        let mut batches = Vec::new();
        for (index, event) in update.events.into_iter().enumerate() {
            if self.buffer.add_event(event, index + 1 < total) {
                while let Some(batch) = self.buffer.fetch() {
                    batches.push(batch);
                }
            }
        }
        let batch_count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            self.apply_batch(batch, index + 1 == batch_count, executor)
                .await?;
        }

        self.metrics.counter("workflow_task_completed");
        let machines = self.machines.borrow();
        Ok(WorkflowTaskResult {
            commands: machines.get_commands(),
            run_finished: machines.workflow_is_finished(),
        })
    }

    /// Drain history deliveries from an SPSC channel until the sender
    /// closes or the run finishes.
    pub async fn run_from_channel(
        &mut self,
        mut updates: tokio::sync::mpsc::Receiver<HistoryUpdate>,
        executor: &dyn LocalActivityExecutor,
    ) -> Result<Vec<WorkflowTaskResult>, WorkflowMachinesError> {
        let mut results = Vec::new();
        while let Some(update) = updates.recv().await {
            let result = self.process_task(update, executor).await?;
            let finished = result.run_finished;
            results.push(result);
            if finished {
                break;
            }
        }
        Ok(results)
    }

    async fn apply_batch(
        &mut self,
        batch: Vec<HistoryEvent>,
        is_last_batch: bool,
        executor: &dyn LocalActivityExecutor,
    ) -> Result<(), WorkflowMachinesError> {
        self.machines.borrow_mut().preload_version_markers(&batch);
        let len = batch.len();
        for (index, event) in batch.iter().enumerate() {
            let has_next = !(is_last_batch && index + 1 == len);
            loop {
                let outcome = self.machines.borrow_mut().handle_event(event, has_next)?;
                match outcome {
                    EventHandlingOutcome::Applied => break,
                    EventHandlingOutcome::Stalled => {
                        debug!(event_id = event.event_id, "command event stalled; pumping");
                        if !self.pump()? {
                            return Err(WorkflowMachinesError::Nondeterminism(format!(
                                "event id={} {} cannot be reconciled with any command the \
                                 workflow produced",
                                event.event_id,
                                event.name()
                            )));
                        }
                    }
                }
            }
            self.after_event()?;
        }

        // History holds no markers for trailing replay marker commands of
        // this batch; resolve them from cache so replayed code never hangs.
        loop {
            let flushed = self.machines.borrow_mut().flush_replay_skipped_commands()?;
            if !flushed {
                break;
            }
            self.pump()?;
        }
        if self.scheduler.has_pending_wake() {
            self.pump()?;
        }
        self.run_local_activities(executor).await
    }

    fn after_event(&mut self) -> Result<(), WorkflowMachinesError> {
        self.drain_jobs()?;
        let triggered = self.machines.borrow_mut().take_pending_trigger();
        if triggered {
            self.started = true;
        }
        if triggered || self.scheduler.has_pending_wake() {
            self.pump()?;
        }
        Ok(())
    }

    fn drain_jobs(&mut self) -> Result<(), WorkflowMachinesError> {
        let jobs = self.machines.borrow_mut().drain_jobs();
        for job in jobs {
            match job {
                WorkflowJob::StartWorkflow {
                    workflow_type,
                    workflow_id,
                    run_id,
                    input,
                } => {
                    *self.start.borrow_mut() = Some(WorkflowStartInfo {
                        workflow_type,
                        workflow_id,
                        run_id,
                        input,
                    });
                }
                WorkflowJob::SignalWorkflow { signal_name, input } => {
                    debug!(signal = %signal_name, "delivering signal");
                    self.signals.borrow_mut().deliver(&signal_name, input);
                }
                WorkflowJob::CancelWorkflow { reason } => {
                    debug!(reason = %reason, "cancel requested for workflow");
                    self.root_scope.cancel()?;
                    self.scheduler.wake_now();
                }
            }
        }
        Ok(())
    }

    /// Run the event loop until quiescent: poll the workflow, convert its
    /// exit into a terminal command if it finished, and prepare newly
    /// created commands. Returns true when anything moved.
    fn pump(&mut self) -> Result<bool, WorkflowMachinesError> {
        if !self.started {
            return Ok(false);
        }
        let mut progressed = false;
        loop {
            self.metrics
                .set_replaying(self.machines.borrow().is_replaying());
            self.machines.borrow_mut().set_event_loop_active(true);
            let polled = self.scheduler.run_until_blocked();
            self.machines.borrow_mut().set_event_loop_active(false);
            progressed |= polled;

            if let Some(exit) = self.scheduler.take_result() {
                self.finish_workflow(exit)?;
                progressed = true;
            }

            let before = self.machines.borrow().pending_command_count();
            self.machines.borrow_mut().prepare_commands()?;
            progressed |= self.machines.borrow().pending_command_count() != before;

            if !self.scheduler.has_pending_wake() {
                break;
            }
        }
        Ok(progressed)
    }

    fn finish_workflow(&mut self, exit: WorkflowExit) -> Result<(), WorkflowMachinesError> {
        let mut machines = self.machines.borrow_mut();
        machines.set_event_loop_active(true);
        let result = match exit {
            WorkflowExit::Complete(payload) => {
                self.metrics.counter("workflow_completed");
                machines.complete_workflow(payload)
            }
            WorkflowExit::Fail(failure) => {
                self.metrics.counter("workflow_failed");
                machines.fail_workflow(failure)
            }
            WorkflowExit::Cancel => {
                self.metrics.counter("workflow_canceled");
                machines.cancel_workflow()
            }
            WorkflowExit::ContinueAsNew {
                workflow_type,
                input,
            } => {
                self.metrics.counter("workflow_continued_as_new");
                machines.continue_as_new(workflow_type, input)
            }
        };
        machines.set_event_loop_active(false);
        result
    }

    async fn run_local_activities(
        &mut self,
        executor: &dyn LocalActivityExecutor,
    ) -> Result<(), WorkflowMachinesError> {
        loop {
            let requests = self.machines.borrow_mut().drain_local_activity_requests();
            if requests.is_empty() {
                return Ok(());
            }
            for request in requests {
                let mut attempt = request.attempt;
                loop {
                    self.metrics.counter("local_activity_executions");
                    match executor.execute(&request).await {
                        Ok(result) => {
                            self.machines.borrow_mut().notify_local_activity_completed(
                                &request.activity_id,
                                Ok(result),
                                attempt,
                                None,
                            )?;
                            break;
                        }
                        Err(failure) => {
                            match request.retry_policy.next_delay(attempt, &failure) {
                                Some(delay) => {
                                    debug!(
                                        activity_id = %request.activity_id,
                                        attempt,
                                        ?delay,
                                        "retrying local activity"
                                    );
                                    tokio::time::sleep(delay).await;
                                    attempt += 1;
                                }
                                None => {
                                    self.machines.borrow_mut().notify_local_activity_completed(
                                        &request.activity_id,
                                        Err(failure),
                                        attempt,
                                        None,
                                    )?;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            // Completions resolved promises; downstream code may schedule
            // more local activities before the task closes.
            self.pump()?;
        }
    }
}
