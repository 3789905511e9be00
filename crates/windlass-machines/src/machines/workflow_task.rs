//! Workflow-task state machine: `Scheduled → Started → {Completed, Failed,
//! TimedOut}`.
//!
//! The started trigger advances `current_started_event_id` and workflow
//! time, and releases queued commands to command preparation. It fires at
//! `Started` when that is the final history event (this is the task to
//! execute now) and otherwise at `Completed`, so failed or timed-out
//! attempts never run workflow code.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use windlass_types::{EventType, HistoryEvent};

use super::{EntityMachine, MachineResponse};
use crate::definition::{StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    Scheduled,
    Started,
    Completed,
    Failed,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Start,
    Complete,
}

static DEFINITION: LazyLock<StateMachineDefinition<State, Action>> = LazyLock::new(|| {
    use Trigger::Event;
    StateMachineDefinition::new("WorkflowTask")
        .final_state(State::Completed)
        .final_state(State::Failed)
        .final_state(State::TimedOut)
        .transition_with(
            State::Scheduled,
            Event(EventType::WorkflowTaskStarted),
            State::Started,
            Action::Start,
        )
        .transition_with(
            State::Started,
            Event(EventType::WorkflowTaskCompleted),
            State::Completed,
            Action::Complete,
        )
        .transition(
            State::Started,
            Event(EventType::WorkflowTaskFailed),
            State::Failed,
        )
        .transition(
            State::Started,
            Event(EventType::WorkflowTaskTimedOut),
            State::TimedOut,
        )
});

pub struct WorkflowTaskMachine {
    state: State,
    started_event_id: Option<i64>,
    started_time: Option<DateTime<Utc>>,
}

pub fn new_workflow_task() -> WorkflowTaskMachine {
    WorkflowTaskMachine {
        state: State::Scheduled,
        started_event_id: None,
        started_time: None,
    }
}

impl WorkflowTaskMachine {
    fn trigger(&self) -> Result<MachineResponse, WorkflowMachinesError> {
        let started_event_id = self.started_event_id.ok_or_else(|| {
            WorkflowMachinesError::Fatal("workflow task trigger without a started event".into())
        })?;
        Ok(MachineResponse::TriggerWorkflowTaskStarted {
            started_event_id,
            time: self.started_time,
        })
    }
}

impl EntityMachine for WorkflowTaskMachine {
    fn name(&self) -> &'static str {
        DEFINITION.name()
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        has_next: bool,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        let action = DEFINITION.apply(&mut self.state, Trigger::Event(event.event_type()))?;
        match action {
            Some(Action::Start) => {
                self.started_event_id = Some(event.event_id);
                self.started_time = event.time;
                if !has_next {
                    return Ok(vec![self.trigger()?]);
                }
                Ok(Vec::new())
            }
            Some(Action::Complete) => Ok(vec![self.trigger()?]),
            None => Ok(Vec::new()),
        }
    }

    fn cancel(&mut self) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        Ok(Vec::new())
    }

    fn is_final_state(&self) -> bool {
        DEFINITION.is_final(self.state)
    }

    fn matches_event(&self, _event: &HistoryEvent) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windlass_types::EventAttributes;

    fn started(event_id: i64) -> HistoryEvent {
        HistoryEvent::new(
            event_id,
            EventAttributes::WorkflowTaskStarted {
                scheduled_event_id: event_id - 1,
            },
        )
    }

    #[test]
    fn final_started_event_triggers_immediately() {
        let mut machine = new_workflow_task();
        let responses = machine.handle_event(&started(3), false).unwrap();
        assert!(matches!(
            &responses[..],
            [MachineResponse::TriggerWorkflowTaskStarted {
                started_event_id: 3,
                ..
            }]
        ));
    }

    #[test]
    fn replayed_attempt_triggers_at_completion() {
        let mut machine = new_workflow_task();
        assert!(machine.handle_event(&started(3), true).unwrap().is_empty());
        let responses = machine
            .handle_event(
                &HistoryEvent::new(
                    4,
                    EventAttributes::WorkflowTaskCompleted {
                        scheduled_event_id: 2,
                        started_event_id: 3,
                    },
                ),
                true,
            )
            .unwrap();
        assert!(matches!(
            &responses[..],
            [MachineResponse::TriggerWorkflowTaskStarted {
                started_event_id: 3,
                ..
            }]
        ));
        assert!(machine.is_final_state());
    }

    #[test]
    fn timed_out_attempt_never_triggers() {
        let mut machine = new_workflow_task();
        machine.handle_event(&started(3), true).unwrap();
        let responses = machine
            .handle_event(
                &HistoryEvent::new(
                    4,
                    EventAttributes::WorkflowTaskTimedOut {
                        scheduled_event_id: 2,
                    },
                ),
                true,
            )
            .unwrap();
        assert!(responses.is_empty());
        assert!(machine.is_final_state());
    }
}
