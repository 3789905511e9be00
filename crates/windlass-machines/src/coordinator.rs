//! The workflow state machines coordinator.
//!
//! One instance exists per workflow execution. It consumes history events
//! in workflow-task batches, matches each replayed command event against
//! the head of the command queue, drives the entity machines, and exposes
//! the public operations workflow code calls (schedule activity, start
//! timer, side effect, ...). Nothing here is shared across workflows.
//!
//! Replay discipline: commands generated by re-executing workflow code are
//! consumed by the command events recorded in history, in order. Any
//! mismatch in order, type, or identity is a nondeterminism error. A
//! command event arriving while the workflow is still suspended inside a
//! marker-based call reports `Stalled` instead, and the driver pumps the
//! scheduler and redelivers it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use windlass_types::{
    Command, EventAttributes, EventType, Failure, HistoryEvent, KnownMarker, Payload, RetryPolicy,
};

use crate::error::{ReplayStateDescriptor, WorkflowMachinesError};
use crate::machines::activity::{new_activity, ActivityScheduleAttributes};
use crate::machines::cancel_external::new_cancel_external;
use crate::machines::cancel_workflow::cancel_workflow;
use crate::machines::child_workflow::{new_child_workflow, ChildWorkflowAttributes, StartedCallback};
use crate::machines::complete_workflow::complete_workflow;
use crate::machines::continue_as_new::continue_as_new;
use crate::machines::fail_workflow::fail_workflow;
use crate::machines::local_activity::{new_local_activity, LocalActivityMachine};
use crate::machines::mutable_side_effect::{
    new_mutable_side_effect_recorded, new_mutable_side_effect_replaying,
    SharedMutableSideEffectState,
};
use crate::machines::side_effect::{new_side_effect_executed, new_side_effect_replaying};
use crate::machines::signal_external::new_signal_external;
use crate::machines::timer::new_timer;
use crate::machines::upsert_search_attributes::upsert_search_attributes as new_upsert;
use crate::machines::version::{new_version_preloaded, new_version_recording, VersionMachine,
    DEFAULT_VERSION};
use crate::machines::workflow_task::new_workflow_task;
use crate::machines::{
    CompletionCallback, EntityMachine, ExecuteLocalActivityParameters, MachineKey,
    MachineResponse, NewMachineWithCommand, WorkflowJob,
};

type Result<T, E = WorkflowMachinesError> = std::result::Result<T, E>;

/// Outcome of delivering one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventHandlingOutcome {
    Applied,
    /// A command event arrived before the workflow produced its matching
    /// command; pump the event loop and redeliver.
    Stalled,
}

/// A queued command plus the machine that owns it.
#[derive(Debug)]
struct CommandAndMachine {
    command: Command,
    machine: MachineKey,
}

pub struct WorkflowStateMachines {
    workflow_id: String,
    run_id: String,

    previous_started_event_id: i64,
    workflow_task_started_event_id: i64,
    current_started_event_id: i64,
    last_handled_event_id: i64,
    replaying: bool,
    current_time: Option<DateTime<Utc>>,

    machines: HashMap<MachineKey, Box<dyn EntityMachine>>,
    local_activities: HashMap<MachineKey, LocalActivityMachine>,
    versions: HashMap<MachineKey, VersionMachine>,
    next_machine_key: u64,

    /// Initiating event id → machine, for routing non-command events.
    machines_by_event_id: HashMap<i64, MachineKey>,
    version_index: HashMap<String, MachineKey>,
    local_activity_index: HashMap<String, MachineKey>,

    /// Authoritative FIFO: shipped to the service or matched against
    /// incoming command events during replay.
    commands: VecDeque<CommandAndMachine>,
    /// Commands created during the current workflow task, not yet exposed.
    current_wf_task_commands: VecDeque<CommandAndMachine>,
    preparing: bool,

    mutable_side_effects: SharedMutableSideEffectState,
    jobs: VecDeque<WorkflowJob>,
    local_activity_requests: Vec<ExecuteLocalActivityParameters>,

    timer_seq: u64,
    activity_seq: u64,
    local_activity_seq: u64,
    side_effect_seq: u64,
    id_counter: u64,

    event_loop_active: bool,
    pending_trigger: bool,
    have_seen_terminal_event: bool,
    workflow_end_requested: bool,
}

impl WorkflowStateMachines {
    pub fn new(workflow_id: String, run_id: String) -> Self {
        Self {
            workflow_id,
            run_id,
            previous_started_event_id: 0,
            workflow_task_started_event_id: 0,
            current_started_event_id: 0,
            last_handled_event_id: 0,
            replaying: false,
            current_time: None,
            machines: HashMap::new(),
            local_activities: HashMap::new(),
            versions: HashMap::new(),
            next_machine_key: 0,
            machines_by_event_id: HashMap::new(),
            version_index: HashMap::new(),
            local_activity_index: HashMap::new(),
            commands: VecDeque::new(),
            current_wf_task_commands: VecDeque::new(),
            preparing: false,
            mutable_side_effects: Rc::new(std::cell::RefCell::new(Default::default())),
            jobs: VecDeque::new(),
            local_activity_requests: Vec::new(),
            timer_seq: 0,
            activity_seq: 0,
            local_activity_seq: 0,
            side_effect_seq: 0,
            id_counter: 0,
            event_loop_active: false,
            pending_trigger: false,
            have_seen_terminal_event: false,
            workflow_end_requested: false,
        }
    }

    /// Record the ids carried by a new history delivery. Detecting the
    /// service handing back history older than what this coordinator has
    /// already processed is fatal for its cached state.
    pub fn set_task_ids(
        &mut self,
        previous_started_event_id: i64,
        workflow_task_started_event_id: i64,
    ) -> Result<()> {
        if previous_started_event_id < self.current_started_event_id {
            return Err(WorkflowMachinesError::ProgressRegression {
                previous_started_event_id,
                current_started_event_id: self.current_started_event_id,
            });
        }
        self.previous_started_event_id = previous_started_event_id;
        self.workflow_task_started_event_id = workflow_task_started_event_id;
        self.replaying = self.previous_started_event_id > self.current_started_event_id;
        Ok(())
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn workflow_is_finished(&self) -> bool {
        self.workflow_end_requested || self.have_seen_terminal_event
    }

    pub fn have_seen_terminal_event(&self) -> bool {
        self.have_seen_terminal_event
    }

    /// Latest workflow time, advanced only by `WorkflowTaskStarted` events.
    pub fn current_time_millis(&self) -> i64 {
        self.current_time.map(|t| t.timestamp_millis()).unwrap_or(0)
    }

    /// Set by the runtime while workflow code runs on the event loop; the
    /// public operations reject calls from anywhere else.
    pub fn set_event_loop_active(&mut self, active: bool) {
        self.event_loop_active = active;
    }

    /// Taken by the driver after events that started a workflow task.
    pub fn take_pending_trigger(&mut self) -> bool {
        std::mem::take(&mut self.pending_trigger)
    }

    pub fn drain_jobs(&mut self) -> Vec<WorkflowJob> {
        self.jobs.drain(..).collect()
    }

    pub fn drain_local_activity_requests(&mut self) -> Vec<ExecuteLocalActivityParameters> {
        let requests: Vec<_> = self.local_activity_requests.drain(..).collect();
        for request in &requests {
            if let Some(key) = self.local_activity_index.get(&request.activity_id) {
                if let Some(machine) = self.local_activities.get_mut(key) {
                    machine.mark_dispatched();
                }
            }
        }
        requests
    }

    fn state_descriptor(&self) -> ReplayStateDescriptor {
        ReplayStateDescriptor {
            previous_started_event_id: self.previous_started_event_id,
            workflow_task_started_event_id: self.workflow_task_started_event_id,
            current_started_event_id: self.current_started_event_id,
        }
    }

    // ── Event ingestion ──────────────────────────────────────────────

    /// Version markers in the incoming batch are offered to their machines
    /// before any event is dispatched, so that markers whose `get_version`
    /// calls were removed from the code are absorbed instead of rejected,
    /// and calls replayed ahead of their marker event see the recorded
    /// value.
    pub fn preload_version_markers(&mut self, batch: &[HistoryEvent]) {
        for event in batch {
            if let Some(marker) = event.version_marker_details() {
                if !self.version_index.contains_key(&marker.change_id) {
                    debug!(change_id = %marker.change_id, version = marker.version,
                        "preloading version marker");
                    let key = self.next_key();
                    self.version_index.insert(marker.change_id.clone(), key);
                    self.versions.insert(
                        key,
                        new_version_preloaded(marker.change_id, marker.version),
                    );
                }
            }
        }
    }

    /// Handle a single event. `has_next` is false only for the last event
    /// of the delivered history.
    pub fn handle_event(
        &mut self,
        event: &HistoryEvent,
        has_next: bool,
    ) -> Result<EventHandlingOutcome> {
        self.handle_event_impl(event, has_next)
            .map_err(|e| self.wrap_event_error(e, event))
    }

    fn handle_event_impl(
        &mut self,
        event: &HistoryEvent,
        has_next: bool,
    ) -> Result<EventHandlingOutcome> {
        if event.event_id <= self.last_handled_event_id {
            if event.event_id == self.last_handled_event_id {
                debug!(event_id = event.event_id, "dropping duplicate event");
                return Ok(EventHandlingOutcome::Applied);
            }
            return Err(WorkflowMachinesError::Fatal(format!(
                "event {} delivered after event {} was already handled",
                event.event_id, self.last_handled_event_id
            )));
        }

        if event.is_final_execution_event() {
            self.have_seen_terminal_event = true;
        }

        if event.is_command_event() {
            let outcome = self.handle_command_event(event)?;
            if outcome == EventHandlingOutcome::Applied {
                self.last_handled_event_id = event.event_id;
            }
            return Ok(outcome);
        }

        // Command events must remain part of replay until the following
        // workflow-task sequence begins; hence the flip happens only on
        // non-command events other than the task completion itself.
        if self.replaying
            && self.current_started_event_id >= self.previous_started_event_id
            && event.event_type() != EventType::WorkflowTaskCompleted
        {
            debug!("caught up to present; replay is over");
            self.replaying = false;
        }

        match event.initial_command_event_id() {
            Some(initial) => {
                let Some(key) = self.machines_by_event_id.remove(&initial) else {
                    return Err(WorkflowMachinesError::Nondeterminism(format!(
                        "event {} refers to initiating event {} with no registered machine",
                        event.name(),
                        initial
                    )));
                };
                self.submachine_handle_event(key, event, has_next)?;
                if !self.machine(key)?.is_final_state() {
                    self.machines_by_event_id.insert(initial, key);
                }
            }
            None => self.handle_non_stateful_event(event, has_next)?,
        }
        self.last_handled_event_id = event.event_id;
        Ok(EventHandlingOutcome::Applied)
    }

    /// Command events align 1-1 with the command queue. Local-activity
    /// markers match by activity id ahead of the queue; version markers may
    /// be absorbed; replay marker commands may be skipped; anything else is
    /// matched against the head with the attribute cross-check.
    fn handle_command_event(&mut self, event: &HistoryEvent) -> Result<EventHandlingOutcome> {
        if let EventAttributes::MarkerRecorded {
            marker_name,
            details,
        } = &event.attributes
        {
            if let Some(KnownMarker::LocalActivity(marker)) =
                KnownMarker::parse(marker_name, details.as_ref())
            {
                return self.handle_local_activity_marker(event, marker.activity_id);
            }
        }

        loop {
            let Some(front) = self.commands.front() else {
                if event.version_marker_details().is_some() {
                    self.absorb_version_marker(event)?;
                    return Ok(EventHandlingOutcome::Applied);
                }
                return Ok(EventHandlingOutcome::Stalled);
            };
            let key = front.machine;

            if self.machine(key)?.was_cancelled_before_sent() {
                self.commands.pop_front();
                continue;
            }

            if !self.machine(key)?.matches_event(event) {
                if event.version_marker_details().is_some() {
                    self.absorb_version_marker(event)?;
                    return Ok(EventHandlingOutcome::Applied);
                }
                if self.machine(key)?.is_replay_skippable() {
                    self.commands.pop_front();
                    let responses = self.machine_mut(key)?.resolve_skipped()?;
                    self.process_responses(key, responses)?;
                    continue;
                }
                let command_name = self
                    .commands
                    .front()
                    .map(|c| c.command.name())
                    .unwrap_or("<none>");
                return Err(WorkflowMachinesError::Nondeterminism(format!(
                    "queued command {} does not correspond to event {}",
                    command_name,
                    event.name()
                )));
            }

            let command = self
                .commands
                .pop_front()
                .expect("front checked above")
                .command;
            validate_command_event(&command, event)?;
            self.submachine_handle_event(key, event, true)?;
            if !self.machine(key)?.is_final_state() {
                self.machines_by_event_id.insert(event.event_id, key);
            }
            return Ok(EventHandlingOutcome::Applied);
        }
    }

    fn absorb_version_marker(&mut self, event: &HistoryEvent) -> Result<()> {
        let marker = event
            .version_marker_details()
            .ok_or_else(|| WorkflowMachinesError::Fatal("expected a version marker".into()))?;
        let Some(&key) = self.version_index.get(&marker.change_id) else {
            return Err(WorkflowMachinesError::Nondeterminism(format!(
                "version marker for change '{}' has no corresponding machine",
                marker.change_id
            )));
        };
        debug!(change_id = %marker.change_id, "absorbing version marker without a command");
        self.submachine_handle_event(key, event, true)
    }

    fn handle_local_activity_marker(
        &mut self,
        event: &HistoryEvent,
        activity_id: String,
    ) -> Result<EventHandlingOutcome> {
        let Some(&key) = self.local_activity_index.get(&activity_id) else {
            // The replayed workflow may not have re-scheduled the activity
            // yet; the driver pumps the event loop and redelivers.
            return Ok(EventHandlingOutcome::Stalled);
        };
        // Consume this machine's queued marker command when it reached the
        // head; replayed machines have no command.
        if self.commands.front().map(|c| c.machine) == Some(key) {
            self.commands.pop_front();
        }
        self.submachine_handle_event(key, event, true)?;
        Ok(EventHandlingOutcome::Applied)
    }

    fn handle_non_stateful_event(&mut self, event: &HistoryEvent, _has_next: bool) -> Result<()> {
        debug!(event = event.name(), event_id = event.event_id, "handling non-stateful event");
        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted {
                workflow_type,
                workflow_id,
                original_run_id,
                input,
            } => {
                self.run_id = original_run_id.clone();
                self.jobs.push_back(WorkflowJob::StartWorkflow {
                    workflow_type: workflow_type.clone(),
                    workflow_id: workflow_id.clone(),
                    run_id: original_run_id.clone(),
                    input: input.clone(),
                });
            }
            EventAttributes::WorkflowTaskScheduled => {
                // The machine is born in its Scheduled state; later events
                // reach it through this registration.
                let key = self.next_key();
                self.machines.insert(key, Box::new(new_workflow_task()));
                self.machines_by_event_id.insert(event.event_id, key);
            }
            EventAttributes::WorkflowExecutionSignaled { signal_name, input } => {
                self.jobs.push_back(WorkflowJob::SignalWorkflow {
                    signal_name: signal_name.clone(),
                    input: input.clone(),
                });
            }
            EventAttributes::WorkflowExecutionCancelRequested { reason } => {
                self.jobs.push_back(WorkflowJob::CancelWorkflow {
                    reason: reason.clone(),
                });
            }
            // Service-imposed terminals. Treated as the end of the
            // execution, never silently dropped.
            EventAttributes::WorkflowExecutionTimedOut
            | EventAttributes::WorkflowExecutionTerminated { .. } => {
                debug!(event = event.name(), "workflow ended by the service");
            }
            _ => {
                return Err(WorkflowMachinesError::Fatal(format!(
                    "event {} cannot be handled as a non-stateful event",
                    event.name()
                )));
            }
        }
        Ok(())
    }

    /// Resolve trailing replay marker commands after a batch has been fully
    /// dispatched: history holds no marker for them, so they resolve from
    /// cache. Returns true when anything resolved.
    pub fn flush_replay_skipped_commands(&mut self) -> Result<bool> {
        let mut any = false;
        while let Some(front) = self.commands.front() {
            let key = front.machine;
            if !self.machine(key)?.is_replay_skippable() {
                break;
            }
            self.commands.pop_front();
            let responses = self.machine_mut(key)?.resolve_skipped()?;
            self.process_responses(key, responses)?;
            any = true;
        }
        Ok(any)
    }

    fn submachine_handle_event(
        &mut self,
        key: MachineKey,
        event: &HistoryEvent,
        has_next: bool,
    ) -> Result<()> {
        let responses = self.machine_mut(key)?.handle_event(event, has_next)?;
        self.process_responses(key, responses)
    }

    fn process_responses(&mut self, key: MachineKey, responses: Vec<MachineResponse>) -> Result<()> {
        for response in responses {
            match response {
                MachineResponse::IssueNewCommand(command) => {
                    self.current_wf_task_commands
                        .push_back(CommandAndMachine { command, machine: key });
                }
                MachineResponse::PushJob(job) => self.jobs.push_back(job),
                MachineResponse::TriggerWorkflowTaskStarted {
                    started_event_id,
                    time,
                } => self.task_started(started_event_id, time)?,
                MachineResponse::QueueLocalActivity(params) => {
                    self.local_activity_requests.push(params);
                }
            }
        }
        Ok(())
    }

    fn task_started(&mut self, started_event_id: i64, time: Option<DateTime<Utc>>) -> Result<()> {
        debug!(started_event_id, "workflow task started trigger");
        self.current_started_event_id = started_event_id;
        if let Some(time) = time {
            self.set_current_time(time);
        }
        self.pending_trigger = true;
        if !self.replaying {
            // Requests lost to a force-failed task are re-surfaced.
            let keys: Vec<MachineKey> = self.local_activity_index.values().copied().collect();
            for key in keys {
                let responses = match self.local_activities.get_mut(&key) {
                    Some(machine) => machine.non_replay_task_started()?,
                    None => continue,
                };
                self.process_responses(key, responses)?;
            }
        }
        Ok(())
    }

    fn set_current_time(&mut self, time: DateTime<Utc>) {
        if self.current_time.is_none_or(|t| t < time) {
            self.current_time = Some(time);
        }
    }

    // ── Command preparation and retrieval ────────────────────────────

    /// Move commands created by the current workflow task onto the
    /// authoritative queue, notifying each machine. Machine notifications
    /// may create further commands (marker resolutions, local-activity
    /// completions), hence the queue and the re-entry guard.
    pub fn prepare_commands(&mut self) -> Result<()> {
        if self.preparing {
            return Ok(());
        }
        self.preparing = true;
        let result = self.prepare_commands_inner();
        self.preparing = false;
        result
    }

    fn prepare_commands_inner(&mut self) -> Result<()> {
        while let Some(c) = self.current_wf_task_commands.pop_front() {
            if self.machine(c.machine)?.was_cancelled_before_sent() {
                continue;
            }
            let responses = self
                .machine_mut(c.machine)?
                .handle_command(c.command.command_type())?;
            self.process_responses(c.machine, responses)?;
            self.commands.push_back(c);
        }
        Ok(())
    }

    /// Number of commands on the authoritative queue. The driver compares
    /// this across a pump to detect progress while resolving a stall.
    pub fn pending_command_count(&self) -> usize {
        self.commands.len()
    }

    /// Commands ready to ship to the service. They stay queued; matching
    /// against future history events consumes them.
    pub fn get_commands(&self) -> Vec<Command> {
        self.commands
            .iter()
            .filter_map(|c| {
                let final_state = self
                    .machine(c.machine)
                    .map(|m| m.is_final_state())
                    .unwrap_or(true);
                (!final_state).then(|| c.command.clone())
            })
            .collect()
    }

    // ── Public operations for workflow code ──────────────────────────

    fn assert_in_event_loop(&self) -> Result<()> {
        if self.event_loop_active {
            Ok(())
        } else {
            Err(WorkflowMachinesError::Fatal(
                "workflow operation invoked outside the workflow event loop".into(),
            ))
        }
    }

    fn assert_commands_allowed(&self) -> Result<()> {
        self.assert_in_event_loop()?;
        if self.workflow_end_requested {
            return Err(WorkflowMachinesError::Fatal(
                "no commands may follow a terminal workflow command".into(),
            ));
        }
        Ok(())
    }

    pub fn schedule_activity(
        &mut self,
        mut attributes: ActivityScheduleAttributes,
        callback: CompletionCallback,
    ) -> Result<MachineKey> {
        self.assert_commands_allowed()?;
        if attributes.activity_id.is_empty() {
            self.activity_seq += 1;
            attributes.activity_id = self.activity_seq.to_string();
        }
        Ok(self.add_command_machine(new_activity(attributes, callback)))
    }

    pub fn new_timer(&mut self, duration: Duration, callback: CompletionCallback) -> Result<MachineKey> {
        self.assert_commands_allowed()?;
        self.timer_seq += 1;
        let timer_id = self.timer_seq.to_string();
        Ok(self.add_command_machine(new_timer(timer_id, duration, callback)))
    }

    pub fn start_child_workflow(
        &mut self,
        attributes: ChildWorkflowAttributes,
        started_callback: StartedCallback,
        callback: CompletionCallback,
    ) -> Result<MachineKey> {
        self.assert_commands_allowed()?;
        Ok(self.add_command_machine(new_child_workflow(attributes, started_callback, callback)))
    }

    pub fn signal_external_workflow(
        &mut self,
        workflow_id: String,
        signal_name: String,
        input: Option<Payload>,
        child_workflow_only: bool,
        callback: CompletionCallback,
    ) -> Result<MachineKey> {
        self.assert_commands_allowed()?;
        Ok(self.add_command_machine(new_signal_external(
            workflow_id,
            signal_name,
            input,
            child_workflow_only,
            callback,
        )))
    }

    pub fn request_cancel_external_workflow(
        &mut self,
        workflow_id: String,
        child_workflow_only: bool,
        callback: CompletionCallback,
    ) -> Result<MachineKey> {
        self.assert_commands_allowed()?;
        Ok(self.add_command_machine(new_cancel_external(
            workflow_id,
            child_workflow_only,
            callback,
        )))
    }

    pub fn upsert_search_attributes(
        &mut self,
        attributes: BTreeMap<String, Payload>,
    ) -> Result<()> {
        self.assert_commands_allowed()?;
        self.add_command_machine(new_upsert(attributes));
        Ok(())
    }

    pub fn schedule_local_activity(
        &mut self,
        activity_type: String,
        input: Option<Payload>,
        retry_policy: RetryPolicy,
        callback: CompletionCallback,
    ) -> Result<(MachineKey, String)> {
        self.assert_commands_allowed()?;
        self.local_activity_seq += 1;
        let activity_id = format!("la-{}", self.local_activity_seq);
        let params = ExecuteLocalActivityParameters {
            activity_id: activity_id.clone(),
            activity_type,
            input,
            retry_policy,
            attempt: 1,
        };
        let (machine, request) = new_local_activity(params, self.replaying, callback);
        let key = self.next_key();
        self.local_activities.insert(key, machine);
        self.local_activity_index.insert(activity_id.clone(), key);
        if let Some(request) = request {
            self.local_activity_requests.push(request);
        }
        Ok((key, activity_id))
    }

    /// The worker finished executing a local activity; append its marker
    /// command and resolve the workflow-side promise.
    pub fn notify_local_activity_completed(
        &mut self,
        activity_id: &str,
        result: std::result::Result<Option<Payload>, Failure>,
        attempt: u32,
        backoff_millis: Option<u64>,
    ) -> Result<()> {
        let Some(&key) = self.local_activity_index.get(activity_id) else {
            return Err(WorkflowMachinesError::Fatal(format!(
                "local activity completion for unknown activity '{activity_id}'"
            )));
        };
        let replay_time_millis = self.current_time_millis();
        let responses = self
            .local_activities
            .get_mut(&key)
            .ok_or_else(|| WorkflowMachinesError::Fatal("machine must exist".into()))?
            .resolve_executed(result, attempt, backoff_millis, replay_time_millis)?;
        self.process_responses(key, responses)?;
        self.prepare_commands()
    }

    pub fn side_effect(
        &mut self,
        func: Box<dyn FnOnce() -> Option<Payload>>,
        callback: CompletionCallback,
    ) -> Result<()> {
        self.assert_commands_allowed()?;
        self.side_effect_seq += 1;
        let id = self.side_effect_seq;
        if self.replaying {
            self.add_command_machine(new_side_effect_replaying(id, callback));
        } else {
            match func() {
                Some(result) => {
                    self.add_command_machine(new_side_effect_executed(id, result, callback));
                }
                None => callback(Ok(None)),
            }
        }
        Ok(())
    }

    pub fn mutable_side_effect(
        &mut self,
        id: &str,
        func: Box<dyn FnOnce(Option<&Payload>) -> Payload>,
        callback: CompletionCallback,
    ) -> Result<()> {
        self.assert_commands_allowed()?;
        if self.replaying {
            self.add_command_machine(new_mutable_side_effect_replaying(
                id.to_string(),
                self.mutable_side_effects.clone(),
                callback,
            ));
            return Ok(());
        }
        let previous = self.mutable_side_effects.borrow().latest.get(id).cloned();
        let value = func(previous.as_ref());
        if previous.as_ref() == Some(&value) {
            let mut shared = self.mutable_side_effects.borrow_mut();
            *shared.skip_counts.entry(id.to_string()).or_insert(0) += 1;
            drop(shared);
            callback(Ok(Some(value)));
            return Ok(());
        }
        self.add_command_machine(new_mutable_side_effect_recorded(
            id.to_string(),
            value,
            self.mutable_side_effects.clone(),
            callback,
        ));
        Ok(())
    }

    /// Versioned branching keyed by `change_id`. The outer error is an
    /// engine failure; the inner one is the deterministic, non-retryable
    /// failure surfaced to workflow code when the recorded version falls
    /// outside `[min_supported, max_supported]`.
    pub fn get_version(
        &mut self,
        change_id: &str,
        min_supported: i32,
        max_supported: i32,
    ) -> Result<std::result::Result<i32, Failure>> {
        self.assert_in_event_loop()?;
        let version = if let Some(&key) = self.version_index.get(change_id) {
            self.versions
                .get(&key)
                .ok_or_else(|| WorkflowMachinesError::Fatal("machine must exist".into()))?
                .version()
        } else if self.replaying {
            DEFAULT_VERSION
        } else {
            self.assert_commands_allowed()?;
            let recorded = new_version_recording(change_id.to_string(), max_supported);
            let key = self.next_key();
            self.version_index.insert(change_id.to_string(), key);
            self.current_wf_task_commands.push_back(CommandAndMachine {
                command: recorded.command,
                machine: key,
            });
            self.versions.insert(key, recorded.machine);
            max_supported
        };
        if version < min_supported || version > max_supported {
            return Ok(Err(Failure::Application(
                windlass_types::ApplicationFailure::new(
                    "unsupported-version",
                    format!(
                        "version {version} of change '{change_id}' is outside the supported \
                         range [{min_supported}, {max_supported}]"
                    ),
                )
                .non_retryable(),
            )));
        }
        Ok(Ok(version))
    }

    /// Material for deterministic randomness: the run id plus a counter
    /// that advances identically on every replay.
    pub fn next_random_material(&mut self) -> Result<(String, u64)> {
        self.assert_in_event_loop()?;
        self.id_counter += 1;
        Ok((self.run_id.clone(), self.id_counter))
    }

    pub fn complete_workflow(&mut self, result: Option<Payload>) -> Result<()> {
        self.assert_commands_allowed()?;
        let machine = complete_workflow(result);
        self.add_command_machine(machine);
        self.workflow_end_requested = true;
        Ok(())
    }

    pub fn fail_workflow(&mut self, failure: Failure) -> Result<()> {
        self.assert_commands_allowed()?;
        let machine = fail_workflow(failure);
        self.add_command_machine(machine);
        self.workflow_end_requested = true;
        Ok(())
    }

    pub fn cancel_workflow(&mut self) -> Result<()> {
        self.assert_commands_allowed()?;
        let machine = cancel_workflow();
        self.add_command_machine(machine);
        self.workflow_end_requested = true;
        Ok(())
    }

    pub fn continue_as_new(&mut self, workflow_type: String, input: Option<Payload>) -> Result<()> {
        self.assert_commands_allowed()?;
        let machine = continue_as_new(workflow_type, input);
        self.add_command_machine(machine);
        self.workflow_end_requested = true;
        Ok(())
    }

    /// Cancel the operation owned by `key`, per its machine's cancellation
    /// semantics.
    pub fn cancel_machine(&mut self, key: MachineKey) -> Result<()> {
        let responses = self.machine_mut(key)?.cancel()?;
        self.process_responses(key, responses)
    }

    // ── Machine registry ─────────────────────────────────────────────

    fn next_key(&mut self) -> MachineKey {
        self.next_machine_key += 1;
        MachineKey(self.next_machine_key)
    }

    fn add_command_machine<M: EntityMachine + 'static>(
        &mut self,
        new_machine: NewMachineWithCommand<M>,
    ) -> MachineKey {
        let key = self.next_key();
        self.machines.insert(key, Box::new(new_machine.machine));
        self.current_wf_task_commands.push_back(CommandAndMachine {
            command: new_machine.command,
            machine: key,
        });
        key
    }

    fn machine(&self, key: MachineKey) -> Result<&dyn EntityMachine> {
        if let Some(m) = self.machines.get(&key) {
            return Ok(m.as_ref());
        }
        if let Some(m) = self.local_activities.get(&key) {
            return Ok(m);
        }
        if let Some(m) = self.versions.get(&key) {
            return Ok(m);
        }
        Err(WorkflowMachinesError::Fatal(format!(
            "machine {key:?} must exist"
        )))
    }

    fn machine_mut(&mut self, key: MachineKey) -> Result<&mut dyn EntityMachine> {
        if let Some(m) = self.machines.get_mut(&key) {
            return Ok(m.as_mut());
        }
        if let Some(m) = self.local_activities.get_mut(&key) {
            return Ok(m);
        }
        if let Some(m) = self.versions.get_mut(&key) {
            return Ok(m);
        }
        Err(WorkflowMachinesError::Fatal(format!(
            "machine {key:?} must exist"
        )))
    }

    fn wrap_event_error(
        &self,
        error: WorkflowMachinesError,
        event: &HistoryEvent,
    ) -> WorkflowMachinesError {
        match error {
            WorkflowMachinesError::Nondeterminism(message) => {
                WorkflowMachinesError::Nondeterminism(format!(
                    "while handling event id={} {}: {}",
                    event.event_id,
                    event.name(),
                    message
                ))
            }
            WorkflowMachinesError::Fatal(message) => WorkflowMachinesError::Internal {
                message: format!(
                    "while handling event id={} {}: {}",
                    event.event_id,
                    event.name(),
                    message
                ),
                state: self.state_descriptor(),
            },
            other => other,
        }
    }
}

/// The command/event cross-check: the recorded event must be of the type
/// the command produces, and identifying attributes must match exactly.
fn validate_command_event(command: &Command, event: &HistoryEvent) -> Result<()> {
    if command.expected_event_type() != event.event_type() {
        return Err(WorkflowMachinesError::Nondeterminism(format!(
            "command {} expected event {}, history recorded {}",
            command.name(),
            command.expected_event_type().name(),
            event.name()
        )));
    }
    let mismatch = |field: &str, expected: &str, actual: &str| {
        Err(WorkflowMachinesError::Nondeterminism(format!(
            "command {} {field} '{expected}' does not match event {} '{actual}'",
            command.name(),
            event.name(),
        )))
    };
    match (command, &event.attributes) {
        (
            Command::ScheduleActivityTask {
                activity_id,
                activity_type,
                ..
            },
            EventAttributes::ActivityTaskScheduled {
                activity_id: event_activity_id,
                activity_type: event_activity_type,
                ..
            },
        ) => {
            if activity_id != event_activity_id {
                return mismatch("activity id", activity_id, event_activity_id);
            }
            if activity_type != event_activity_type {
                return mismatch("activity type", activity_type, event_activity_type);
            }
        }
        (
            Command::StartTimer { timer_id, .. },
            EventAttributes::TimerStarted {
                timer_id: event_timer_id,
                ..
            },
        )
        | (
            Command::CancelTimer { timer_id },
            EventAttributes::TimerCanceled {
                timer_id: event_timer_id,
                ..
            },
        ) => {
            if timer_id != event_timer_id {
                return mismatch("timer id", timer_id, event_timer_id);
            }
        }
        (
            Command::StartChildWorkflowExecution {
                workflow_id,
                workflow_type,
                ..
            },
            EventAttributes::StartChildWorkflowExecutionInitiated {
                workflow_id: event_workflow_id,
                workflow_type: event_workflow_type,
                ..
            },
        ) => {
            if workflow_id != event_workflow_id {
                return mismatch("workflow id", workflow_id, event_workflow_id);
            }
            if workflow_type != event_workflow_type {
                return mismatch("workflow type", workflow_type, event_workflow_type);
            }
        }
        (
            Command::SignalExternalWorkflowExecution {
                workflow_id,
                signal_name,
                ..
            },
            EventAttributes::SignalExternalWorkflowExecutionInitiated {
                workflow_id: event_workflow_id,
                signal_name: event_signal_name,
                ..
            },
        ) => {
            if workflow_id != event_workflow_id {
                return mismatch("workflow id", workflow_id, event_workflow_id);
            }
            if signal_name != event_signal_name {
                return mismatch("signal name", signal_name, event_signal_name);
            }
        }
        (
            Command::RequestCancelExternalWorkflowExecution { workflow_id, .. },
            EventAttributes::RequestCancelExternalWorkflowExecutionInitiated {
                workflow_id: event_workflow_id,
                ..
            },
        ) => {
            if workflow_id != event_workflow_id {
                return mismatch("workflow id", workflow_id, event_workflow_id);
            }
        }
        (
            Command::RecordMarker { marker_name, .. },
            EventAttributes::MarkerRecorded {
                marker_name: event_marker_name,
                ..
            },
        ) => {
            if marker_name != event_marker_name {
                return mismatch("marker name", marker_name, event_marker_name);
            }
        }
        // Terminal commands, cancel-activity, and upserts carry no further
        // identity beyond the event type checked above.
        _ => {}
    }
    Ok(())
}
