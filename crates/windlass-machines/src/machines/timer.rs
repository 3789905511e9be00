//! Timer state machine.
//!
//! `Created → StartCommandCreated → Started → {Fired, CancelCommandCreated
//! → Canceled}`. Cancelling while the start command is still unsent drops
//! the command and resolves the callback with a cancellation synchronously;
//! cancelling a started timer emits a `CancelTimer` command and resolves
//! immediately (a fire racing the cancellation is absorbed).

use std::sync::LazyLock;
use std::time::Duration;

use windlass_types::{Command, CommandType, EventAttributes, EventType, Failure, HistoryEvent};

use super::{notify, CompletionCallback, EntityMachine, MachineResponse, NewMachineWithCommand};
use crate::definition::{ExplicitEvent, StateMachineDefinition, Trigger};
use crate::error::WorkflowMachinesError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum State {
    Created,
    StartCommandCreated,
    Started,
    CancelCommandCreated,
    Fired,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Fire,
    CancelBeforeSent,
    IssueCancelCommand,
}

static DEFINITION: LazyLock<StateMachineDefinition<State, Action>> = LazyLock::new(|| {
    StateMachineDefinition::new("Timer")
        .final_state(State::Fired)
        .final_state(State::Canceled)
        .transition(
            State::Created,
            Trigger::Explicit(ExplicitEvent::Schedule),
            State::StartCommandCreated,
        )
        .transition(
            State::StartCommandCreated,
            Trigger::Command(CommandType::StartTimer),
            State::StartCommandCreated,
        )
        .transition(
            State::StartCommandCreated,
            Trigger::Event(EventType::TimerStarted),
            State::Started,
        )
        .transition_with(
            State::StartCommandCreated,
            Trigger::Explicit(ExplicitEvent::Cancel),
            State::Canceled,
            Action::CancelBeforeSent,
        )
        .transition_with(
            State::Started,
            Trigger::Event(EventType::TimerFired),
            State::Fired,
            Action::Fire,
        )
        .transition_with(
            State::Started,
            Trigger::Explicit(ExplicitEvent::Cancel),
            State::CancelCommandCreated,
            Action::IssueCancelCommand,
        )
        .transition(
            State::CancelCommandCreated,
            Trigger::Command(CommandType::CancelTimer),
            State::CancelCommandCreated,
        )
        .transition(
            State::CancelCommandCreated,
            Trigger::Event(EventType::TimerCanceled),
            State::Canceled,
        )
        // Fire raced the cancel request; the callback already resolved.
        .transition(
            State::CancelCommandCreated,
            Trigger::Event(EventType::TimerFired),
            State::Fired,
        )
});

pub struct TimerMachine {
    state: State,
    timer_id: String,
    callback: Option<CompletionCallback>,
    cancelled_before_sent: bool,
}

/// Create the machine and its `StartTimer` command.
pub fn new_timer(
    timer_id: String,
    duration: Duration,
    callback: CompletionCallback,
) -> NewMachineWithCommand<TimerMachine> {
    let mut machine = TimerMachine {
        state: State::Created,
        timer_id: timer_id.clone(),
        callback: Some(callback),
        cancelled_before_sent: false,
    };
    DEFINITION
        .apply(&mut machine.state, Trigger::Explicit(ExplicitEvent::Schedule))
        .expect("schedule transition is registered");
    NewMachineWithCommand {
        machine,
        command: Command::StartTimer { timer_id, duration },
    }
}

impl EntityMachine for TimerMachine {
    fn name(&self) -> &'static str {
        DEFINITION.name()
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        _has_next: bool,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        let action = DEFINITION.apply(&mut self.state, Trigger::Event(event.event_type()))?;
        if action == Some(Action::Fire) {
            notify(&mut self.callback, Ok(None));
        }
        Ok(Vec::new())
    }

    fn handle_command(
        &mut self,
        command_type: CommandType,
    ) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        DEFINITION.apply(&mut self.state, Trigger::Command(command_type))?;
        Ok(Vec::new())
    }

    fn cancel(&mut self) -> Result<Vec<MachineResponse>, WorkflowMachinesError> {
        if self.is_final_state() || self.state == State::CancelCommandCreated {
            return Ok(Vec::new());
        }
        let action = DEFINITION.apply(&mut self.state, Trigger::Explicit(ExplicitEvent::Cancel))?;
        let mut responses = Vec::new();
        match action {
            Some(Action::CancelBeforeSent) => {
                self.cancelled_before_sent = true;
                notify(
                    &mut self.callback,
                    Err(Failure::canceled("timer canceled before started")),
                );
            }
            Some(Action::IssueCancelCommand) => {
                notify(&mut self.callback, Err(Failure::canceled("timer canceled")));
                responses.push(MachineResponse::IssueNewCommand(Command::CancelTimer {
                    timer_id: self.timer_id.clone(),
                }));
            }
            _ => {}
        }
        Ok(responses)
    }

    fn is_final_state(&self) -> bool {
        DEFINITION.is_final(self.state)
    }

    fn was_cancelled_before_sent(&self) -> bool {
        self.cancelled_before_sent
    }

    fn matches_event(&self, event: &HistoryEvent) -> bool {
        match (&self.state, &event.attributes) {
            (State::StartCommandCreated, EventAttributes::TimerStarted { timer_id, .. })
            | (State::CancelCommandCreated, EventAttributes::TimerCanceled { timer_id, .. }) => {
                timer_id == &self.timer_id
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use windlass_types::HistoryEvent;

    fn callback_probe() -> (Rc<RefCell<Vec<super::super::CompletionResult>>>, CompletionCallback) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let writer = seen.clone();
        (seen, Box::new(move |r| writer.borrow_mut().push(r)))
    }

    fn started(event_id: i64, timer_id: &str) -> HistoryEvent {
        HistoryEvent::new(
            event_id,
            EventAttributes::TimerStarted {
                timer_id: timer_id.into(),
                duration: Duration::from_secs(5),
            },
        )
    }

    fn fired(event_id: i64, timer_id: &str, started_event_id: i64) -> HistoryEvent {
        HistoryEvent::new(
            event_id,
            EventAttributes::TimerFired {
                timer_id: timer_id.into(),
                started_event_id,
            },
        )
    }

    #[test]
    fn fires_once_through_the_happy_path() {
        let (seen, cb) = callback_probe();
        let NewMachineWithCommand { mut machine, command } =
            new_timer("1".into(), Duration::from_secs(5), cb);
        assert_eq!(command.command_type(), CommandType::StartTimer);

        machine.handle_command(CommandType::StartTimer).unwrap();
        machine.handle_event(&started(5, "1"), true).unwrap();
        assert!(!machine.is_final_state());
        machine.handle_event(&fired(8, "1", 5), true).unwrap();
        assert!(machine.is_final_state());
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].is_ok());
    }

    #[test]
    fn immediate_cancel_never_ships_the_command() {
        let (seen, cb) = callback_probe();
        let NewMachineWithCommand { mut machine, .. } =
            new_timer("1".into(), Duration::from_secs(5), cb);
        let responses = machine.cancel().unwrap();
        assert!(responses.is_empty());
        assert!(machine.was_cancelled_before_sent());
        assert!(machine.is_final_state());
        assert!(matches!(&seen.borrow()[0], Err(f) if f.is_canceled()));
    }

    #[test]
    fn cancel_after_start_issues_cancel_command_and_resolves() {
        let (seen, cb) = callback_probe();
        let NewMachineWithCommand { mut machine, .. } =
            new_timer("1".into(), Duration::from_secs(5), cb);
        machine.handle_event(&started(5, "1"), true).unwrap();

        let responses = machine.cancel().unwrap();
        assert_eq!(responses.len(), 1);
        assert!(matches!(
            &responses[0],
            MachineResponse::IssueNewCommand(Command::CancelTimer { timer_id }) if timer_id == "1"
        ));
        assert!(matches!(&seen.borrow()[0], Err(f) if f.is_canceled()));

        // A fire racing the cancel is absorbed without a second callback.
        machine.handle_event(&fired(9, "1", 5), true).unwrap();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn wrong_timer_id_does_not_match() {
        let (_seen, cb) = callback_probe();
        let NewMachineWithCommand { machine, .. } =
            new_timer("1".into(), Duration::from_secs(5), cb);
        assert!(machine.matches_event(&started(5, "1")));
        assert!(!machine.matches_event(&started(5, "2")));
    }
}
