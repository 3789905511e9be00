//! Groups a streamed history into workflow-task-attempt batches.
//!
//! Events arrive one at a time from transport paging. A batch spans from
//! just after the previous `WorkflowTaskStarted` through the next
//! `WorkflowTaskCompleted`/`Failed`/`TimedOut`, including the command
//! events recorded after the completion. The batch boundary matters:
//! marker preloading must see the whole batch before any event in it is
//! dispatched.

use std::collections::VecDeque;

use windlass_types::{EventType, HistoryEvent};

#[derive(Debug, Default)]
pub struct WftBuffer {
    pending: Vec<HistoryEvent>,
    /// Set once the pending run contains a finished workflow-task attempt
    /// (completed, failed, or timed out). The next non-command event then
    /// closes the batch.
    attempt_finished: bool,
    ready: VecDeque<Vec<HistoryEvent>>,
}

impl WftBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one event. `has_next` is false for the last event of the
    /// delivered history. Returns true when at least one complete batch is
    /// ready to fetch.
    pub fn add_event(&mut self, event: HistoryEvent, has_next: bool) -> bool {
        if self.attempt_finished && !event.is_command_event() {
            self.close_batch();
        }

        match event.event_type() {
            EventType::WorkflowTaskCompleted
            | EventType::WorkflowTaskFailed
            | EventType::WorkflowTaskTimedOut => {
                self.attempt_finished = true;
            }
            _ => {}
        }
        self.pending.push(event);

        if !has_next {
            self.close_batch();
        }
        !self.ready.is_empty()
    }

    /// Drain the next complete batch.
    pub fn fetch(&mut self) -> Option<Vec<HistoryEvent>> {
        self.ready.pop_front()
    }

    fn close_batch(&mut self) {
        if !self.pending.is_empty() {
            self.ready.push_back(std::mem::take(&mut self.pending));
        }
        self.attempt_finished = false;
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use windlass_types::EventAttributes;

    fn ev(id: i64, attributes: EventAttributes) -> HistoryEvent {
        HistoryEvent::new(id, attributes)
    }

    fn simple_history() -> Vec<HistoryEvent> {
        vec![
            ev(
                1,
                EventAttributes::WorkflowExecutionStarted {
                    workflow_type: "Wf".into(),
                    workflow_id: "wf-1".into(),
                    original_run_id: "run-1".into(),
                    input: None,
                },
            ),
            ev(2, EventAttributes::WorkflowTaskScheduled),
            ev(3, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 2 }),
            ev(
                4,
                EventAttributes::WorkflowTaskCompleted {
                    scheduled_event_id: 2,
                    started_event_id: 3,
                },
            ),
            ev(
                5,
                EventAttributes::TimerStarted {
                    timer_id: "1".into(),
                    duration: std::time::Duration::from_secs(5),
                },
            ),
            ev(6, EventAttributes::WorkflowTaskScheduled),
            ev(7, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 6 }),
        ]
    }

    #[test]
    fn batches_split_after_trailing_command_events() {
        let mut buffer = WftBuffer::new();
        let history = simple_history();
        let last = history.len() - 1;
        for (i, event) in history.into_iter().enumerate() {
            buffer.add_event(event, i != last);
        }

        let first = buffer.fetch().expect("first batch");
        let ids: Vec<i64> = first.iter().map(|e| e.event_id).collect();
        // Command event 5 (TimerStarted) belongs to the completed attempt.
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let second = buffer.fetch().expect("second batch");
        let ids: Vec<i64> = second.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![6, 7]);

        assert!(buffer.fetch().is_none());
    }

    #[test]
    fn failed_attempt_closes_at_next_schedule() {
        let mut buffer = WftBuffer::new();
        let events = vec![
            ev(1, EventAttributes::WorkflowTaskScheduled),
            ev(2, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 1 }),
            ev(3, EventAttributes::WorkflowTaskTimedOut { scheduled_event_id: 1 }),
            ev(4, EventAttributes::WorkflowTaskScheduled),
            ev(5, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 4 }),
        ];
        let last = events.len() - 1;
        for (i, event) in events.into_iter().enumerate() {
            buffer.add_event(event, i != last);
        }
        let first = buffer.fetch().expect("first batch");
        assert_eq!(first.last().map(|e| e.event_id), Some(3));
        let second = buffer.fetch().expect("retry batch");
        assert_eq!(second.first().map(|e| e.event_id), Some(4));
    }

    #[test]
    fn incomplete_run_is_not_ready_until_end_of_history() {
        let mut buffer = WftBuffer::new();
        assert!(!buffer.add_event(ev(1, EventAttributes::WorkflowTaskScheduled), true));
        assert!(buffer.fetch().is_none());
        assert!(buffer.add_event(
            ev(2, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 1 }),
            false
        ));
        let batch = buffer.fetch().expect("final batch");
        assert_eq!(batch.len(), 2);
    }
}
