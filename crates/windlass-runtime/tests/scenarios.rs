//! End-to-end replay scenarios, driven through the transport contract:
//! scripted histories in, command lists out.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use similar_asserts::assert_eq;
use windlass_machines::{ActivityCancellationType, ExecuteLocalActivityParameters};
use windlass_runtime::{
    ActivityOptions, HistoryUpdate, LocalActivityExecutor, LocalActivityOptions,
    NoLocalActivities, WfContext, WorkflowDriver, WorkflowExit, WorkflowFunction,
};
use windlass_types::{
    Command, EventAttributes, Failure, HistoryEvent, KnownMarker, MutableSideEffectMarker,
    Payload, RetryPolicy, VersionMarker, MUTABLE_SIDE_EFFECT_MARKER_NAME, VERSION_MARKER_NAME,
};

fn ev(event_id: i64, attributes: EventAttributes) -> HistoryEvent {
    let time = Utc
        .timestamp_opt(1_700_000_000 + event_id, 0)
        .single()
        .expect("valid timestamp");
    HistoryEvent::new(event_id, attributes).at(time)
}

fn started_events() -> Vec<HistoryEvent> {
    vec![
        ev(
            1,
            EventAttributes::WorkflowExecutionStarted {
                workflow_type: "TestWorkflow".into(),
                workflow_id: "wf-1".into(),
                original_run_id: "run-1".into(),
                input: None,
            },
        ),
        ev(2, EventAttributes::WorkflowTaskScheduled),
        ev(3, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 2 }),
    ]
}

fn update(
    events: Vec<HistoryEvent>,
    previous_started_event_id: i64,
    workflow_task_started_event_id: i64,
) -> HistoryUpdate {
    HistoryUpdate {
        events,
        previous_started_event_id,
        workflow_task_started_event_id,
    }
}

fn wft_completed(event_id: i64, scheduled: i64, started: i64) -> HistoryEvent {
    ev(
        event_id,
        EventAttributes::WorkflowTaskCompleted {
            scheduled_event_id: scheduled,
            started_event_id: started,
        },
    )
}

// ── Scenario 1: timer-only workflow ─────────────────────────────────

fn timer_workflow() -> WorkflowFunction {
    Box::new(|ctx: WfContext| {
        Box::pin(async move {
            let timer = ctx.timer(Duration::from_secs(5)).expect("timer scheduled");
            timer.promise.await.expect("timer fires");
            WorkflowExit::Complete(None)
        })
    })
}

#[tokio::test]
async fn timer_only_workflow_commands() {
    let mut driver = WorkflowDriver::new("wf-1", "run-1", timer_workflow());
    let result = driver
        .process_task(update(started_events(), 0, 3), &NoLocalActivities)
        .await
        .unwrap();
    assert!(matches!(
        &result.commands[..],
        [Command::StartTimer { timer_id, duration }]
            if timer_id == "1" && *duration == Duration::from_secs(5)
    ));

    let result = driver
        .process_task(
            update(
                vec![
                    wft_completed(4, 2, 3),
                    ev(
                        5,
                        EventAttributes::TimerStarted {
                            timer_id: "1".into(),
                            duration: Duration::from_secs(5),
                        },
                    ),
                    ev(6, EventAttributes::WorkflowTaskScheduled),
                    ev(7, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 6 }),
                    ev(
                        8,
                        EventAttributes::TimerFired {
                            timer_id: "1".into(),
                            started_event_id: 5,
                        },
                    ),
                ],
                3,
                7,
            ),
            &NoLocalActivities,
        )
        .await
        .unwrap();
    assert!(matches!(
        &result.commands[..],
        [Command::CompleteWorkflowExecution { result: None }]
    ));
    assert!(result.run_finished);
}

#[tokio::test]
async fn timer_workflow_replay_from_full_history_is_deterministic() {
    let mut events = started_events();
    events.extend([
        wft_completed(4, 2, 3),
        ev(
            5,
            EventAttributes::TimerStarted {
                timer_id: "1".into(),
                duration: Duration::from_secs(5),
            },
        ),
        ev(6, EventAttributes::WorkflowTaskScheduled),
        ev(7, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 6 }),
        ev(
            8,
            EventAttributes::TimerFired {
                timer_id: "1".into(),
                started_event_id: 5,
            },
        ),
    ]);
    let mut driver = WorkflowDriver::new("wf-1", "run-1", timer_workflow());
    let result = driver
        .process_task(update(events, 7, 7), &NoLocalActivities)
        .await
        .unwrap();
    assert!(matches!(
        &result.commands[..],
        [Command::CompleteWorkflowExecution { result: None }]
    ));
}

// ── Scenario 2: local activity retried on a transient failure ──────

struct FlakyExecutor {
    calls: Cell<u32>,
}

#[async_trait::async_trait(?Send)]
impl LocalActivityExecutor for FlakyExecutor {
    async fn execute(
        &self,
        _params: &ExecuteLocalActivityParameters,
    ) -> Result<Option<Payload>, Failure> {
        self.calls.set(self.calls.get() + 1);
        Err(Failure::application("io-error", "connection reset"))
    }
}

#[tokio::test(start_paused = true)]
async fn local_activity_retries_then_fails_workflow() {
    let workflow: WorkflowFunction = Box::new(|ctx: WfContext| {
        Box::pin(async move {
            let promise = ctx
                .schedule_local_activity(LocalActivityOptions {
                    activity_type: "flaky-io".into(),
                    input: None,
                    retry_policy: RetryPolicy {
                        initial_interval: Duration::from_secs(1),
                        backoff_coefficient: 1.0,
                        maximum_interval: Some(Duration::from_secs(1)),
                        maximum_attempts: 3,
                        do_not_retry: vec!["assertion".into()],
                    },
                })
                .expect("local activity scheduled");
            match promise.await {
                Ok(_) => WorkflowExit::Complete(None),
                Err(failure) => WorkflowExit::Fail(failure),
            }
        })
    });

    let executor = FlakyExecutor { calls: Cell::new(0) };
    let mut driver = WorkflowDriver::new("wf-1", "run-1", workflow);
    let result = driver
        .process_task(update(started_events(), 0, 3), &executor)
        .await
        .unwrap();

    assert_eq!(executor.calls.get(), 3, "exactly three invocations");
    assert_eq!(result.commands.len(), 2);
    match &result.commands[0] {
        Command::RecordMarker { marker_name, details } => {
            let marker = KnownMarker::parse(marker_name, details.as_ref());
            match marker {
                Some(KnownMarker::LocalActivity(m)) => {
                    assert_eq!(m.attempt, 3);
                    assert_eq!(
                        m.failure.as_ref().and_then(|f| f.application_cause()).map(|a| a
                            .error_type
                            .clone()),
                        Some("io-error".to_string())
                    );
                }
                other => panic!("unexpected marker {other:?}"),
            }
        }
        other => panic!("expected a local activity marker, got {other:?}"),
    }
    match &result.commands[1] {
        Command::FailWorkflowExecution { failure } => {
            assert!(matches!(failure, Failure::Activity(_)));
            assert_eq!(
                failure.application_cause().map(|a| a.error_type.clone()),
                Some("io-error".to_string())
            );
        }
        other => panic!("expected the workflow to fail, got {other:?}"),
    }
}

// ── Scenario 3: abandon-on-cancel ──────────────────────────────────

#[tokio::test]
async fn abandoned_activity_is_not_cancel_requested() {
    let workflow: WorkflowFunction = Box::new(|ctx: WfContext| {
        Box::pin(async move {
            let activity = ctx
                .schedule_activity(
                    ActivityOptions::new("long-op")
                        .cancellation_type(ActivityCancellationType::Abandon),
                )
                .expect("activity scheduled");
            match activity.promise.await {
                Err(failure) if failure.is_canceled() => WorkflowExit::Cancel,
                _ => WorkflowExit::Complete(None),
            }
        })
    });

    let mut driver = WorkflowDriver::new("wf-1", "run-1", workflow);
    let result = driver
        .process_task(update(started_events(), 0, 3), &NoLocalActivities)
        .await
        .unwrap();
    assert!(matches!(
        &result.commands[..],
        [Command::ScheduleActivityTask { .. }]
    ));

    let result = driver
        .process_task(
            update(
                vec![
                    wft_completed(4, 2, 3),
                    ev(
                        5,
                        EventAttributes::ActivityTaskScheduled {
                            activity_id: "1".into(),
                            activity_type: "long-op".into(),
                            input: None,
                        },
                    ),
                    ev(
                        6,
                        EventAttributes::WorkflowExecutionCancelRequested {
                            reason: "operator requested".into(),
                        },
                    ),
                    ev(7, EventAttributes::WorkflowTaskScheduled),
                    ev(8, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 7 }),
                ],
                3,
                8,
            ),
            &NoLocalActivities,
        )
        .await
        .unwrap();

    assert!(matches!(
        &result.commands[..],
        [Command::CancelWorkflowExecution]
    ));
    assert!(result
        .commands
        .iter()
        .all(|c| !matches!(c, Command::RequestCancelActivityTask { .. })));
    assert!(result.run_finished);
}

// ── Scenario 4: get_version removed from code ──────────────────────

#[test_log::test(tokio::test)]
async fn version_marker_for_removed_call_replays_cleanly() {
    // The history was recorded by code that called get_version("foo", ..);
    // the current code no longer does.
    let workflow: WorkflowFunction =
        Box::new(|_ctx: WfContext| Box::pin(async move { WorkflowExit::Complete(None) }));

    let mut events = started_events();
    events.extend([
        wft_completed(4, 2, 3),
        ev(
            5,
            EventAttributes::MarkerRecorded {
                marker_name: VERSION_MARKER_NAME.into(),
                details: Some(
                    KnownMarker::Version(VersionMarker {
                        change_id: "foo".into(),
                        version: 1,
                    })
                    .encode(),
                ),
            },
        ),
        ev(6, EventAttributes::WorkflowExecutionCompleted { result: None }),
    ]);

    let mut driver = WorkflowDriver::new("wf-1", "run-1", workflow);
    let result = driver
        .process_task(update(events, 3, 3), &NoLocalActivities)
        .await
        .expect("replay must not raise");
    assert!(result.run_finished);
}

// ── Scenario 5: mutable side effect idempotence ────────────────────

fn mutable_side_effect_workflow() -> WorkflowFunction {
    Box::new(|ctx: WfContext| {
        Box::pin(async move {
            let mut observed = Vec::new();
            for _ in 0..3 {
                let value = ctx
                    .mutable_side_effect("x", |_| Payload::text("42"))
                    .expect("mutable side effect")
                    .await
                    .expect("resolves")
                    .expect("carries a value");
                observed.push(value);
            }
            if observed.iter().all(|v| v.as_text() == Some("42")) {
                WorkflowExit::Complete(Some(Payload::text("42")))
            } else {
                WorkflowExit::Fail(Failure::application(
                    "bad-value",
                    "call sites observed different values",
                ))
            }
        })
    })
}

#[tokio::test]
async fn mutable_side_effect_records_exactly_one_marker() {
    let mut driver = WorkflowDriver::new("wf-1", "run-1", mutable_side_effect_workflow());
    let result = driver
        .process_task(update(started_events(), 0, 3), &NoLocalActivities)
        .await
        .unwrap();

    let markers: Vec<_> = result
        .commands
        .iter()
        .filter_map(|c| match c {
            Command::RecordMarker { marker_name, details }
                if marker_name == MUTABLE_SIDE_EFFECT_MARKER_NAME =>
            {
                KnownMarker::parse(marker_name, details.as_ref())
            }
            _ => None,
        })
        .collect();
    assert!(matches!(
        &markers[..],
        [KnownMarker::MutableSideEffect(MutableSideEffectMarker { id, skip_count: 0, value })]
            if id == "x" && value.as_text() == Some("42")
    ));
    assert!(matches!(
        result.commands.last(),
        Some(Command::CompleteWorkflowExecution { result: Some(p) })
            if p.as_text() == Some("42")
    ));
}

#[tokio::test]
async fn mutable_side_effect_replays_the_recorded_value_at_every_call_site() {
    let mut events = started_events();
    events.extend([
        wft_completed(4, 2, 3),
        ev(
            5,
            EventAttributes::MarkerRecorded {
                marker_name: MUTABLE_SIDE_EFFECT_MARKER_NAME.into(),
                details: Some(
                    KnownMarker::MutableSideEffect(MutableSideEffectMarker {
                        id: "x".into(),
                        skip_count: 0,
                        value: Payload::text("42"),
                    })
                    .encode(),
                ),
            },
        ),
        ev(
            6,
            EventAttributes::WorkflowExecutionCompleted {
                result: Some(Payload::text("42")),
            },
        ),
    ]);

    let mut driver = WorkflowDriver::new("wf-1", "run-1", mutable_side_effect_workflow());
    let result = driver
        .process_task(update(events, 3, 3), &NoLocalActivities)
        .await
        .expect("replay must not raise");
    // Had any call site observed something other than 42 the workflow
    // would have failed instead of matching its recorded completion.
    assert!(result.run_finished);
}

// ── Scenario 6: signal ordering ────────────────────────────────────

fn signal_workflow() -> WorkflowFunction {
    Box::new(|ctx: WfContext| {
        Box::pin(async move {
            let first = ctx.await_signal("word").await.expect("first signal");
            let second = ctx.await_signal("word").await.expect("second signal");
            let mut text = String::new();
            if let Some(p) = first {
                text.push_str(p.as_text().unwrap_or_default());
            }
            if let Some(p) = second {
                text.push_str(p.as_text().unwrap_or_default());
            }
            WorkflowExit::Complete(Some(Payload::text(&text)))
        })
    })
}

fn signal_events_after_start() -> [HistoryEvent; 8] {
    [
        wft_completed(4, 2, 3),
        ev(
            5,
            EventAttributes::WorkflowExecutionSignaled {
                signal_name: "word".into(),
                input: Some(Payload::text("Hello ")),
            },
        ),
        ev(6, EventAttributes::WorkflowTaskScheduled),
        ev(7, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 6 }),
        wft_completed(8, 6, 7),
        ev(
            9,
            EventAttributes::WorkflowExecutionSignaled {
                signal_name: "word".into(),
                input: Some(Payload::text("World!")),
            },
        ),
        ev(10, EventAttributes::WorkflowTaskScheduled),
        ev(11, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 10 }),
    ]
}

#[tokio::test]
async fn signals_delivered_across_tasks_concatenate_in_order() {
    let mut driver = WorkflowDriver::new("wf-1", "run-1", signal_workflow());
    let result = driver
        .process_task(update(started_events(), 0, 3), &NoLocalActivities)
        .await
        .unwrap();
    assert!(result.commands.is_empty());

    let [e4, e5, e6, e7, e8, e9, e10, e11] = signal_events_after_start();
    let result = driver
        .process_task(update(vec![e4, e5, e6, e7], 3, 7), &NoLocalActivities)
        .await
        .unwrap();
    assert!(result.commands.is_empty());

    let result = driver
        .process_task(update(vec![e8, e9, e10, e11], 7, 11), &NoLocalActivities)
        .await
        .unwrap();
    assert!(matches!(
        &result.commands[..],
        [Command::CompleteWorkflowExecution { result: Some(p) }]
            if p.as_text() == Some("Hello World!")
    ));
}

#[tokio::test]
async fn signal_workflow_replay_from_full_history_matches() {
    let mut events = started_events();
    events.extend(signal_events_after_start());

    let mut driver = WorkflowDriver::new("wf-1", "run-1", signal_workflow());
    let result = driver
        .process_task(update(events, 11, 11), &NoLocalActivities)
        .await
        .unwrap();
    assert!(matches!(
        &result.commands[..],
        [Command::CompleteWorkflowExecution { result: Some(p) }]
            if p.as_text() == Some("Hello World!")
    ));
}

// ── Transport contract: SPSC channel delivery ──────────────────────

#[tokio::test]
async fn driver_consumes_updates_over_a_channel() {
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tx.send(update(started_events(), 0, 3)).await.unwrap();
    tx.send(update(
        vec![
            wft_completed(4, 2, 3),
            ev(
                5,
                EventAttributes::TimerStarted {
                    timer_id: "1".into(),
                    duration: Duration::from_secs(5),
                },
            ),
            ev(6, EventAttributes::WorkflowTaskScheduled),
            ev(7, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 6 }),
            ev(
                8,
                EventAttributes::TimerFired {
                    timer_id: "1".into(),
                    started_event_id: 5,
                },
            ),
        ],
        3,
        7,
    ))
    .await
    .unwrap();
    drop(tx);

    let mut driver = WorkflowDriver::new("wf-1", "run-1", timer_workflow());
    let results = driver
        .run_from_channel(rx, &NoLocalActivities)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[1].run_finished);
}

// ── Replay invariants ──────────────────────────────────────────────

#[tokio::test]
async fn workflow_sees_replay_flag_clear_once_caught_up() {
    let replay_observations = Rc::new(std::cell::RefCell::new(Vec::new()));
    let log = replay_observations.clone();
    let workflow: WorkflowFunction = Box::new(move |ctx: WfContext| {
        Box::pin(async move {
            log.borrow_mut().push(ctx.is_replaying());
            ctx.await_signal("go").await.ok();
            log.borrow_mut().push(ctx.is_replaying());
            WorkflowExit::Complete(None)
        })
    });

    let mut events = started_events();
    events.extend([
        wft_completed(4, 2, 3),
        ev(
            5,
            EventAttributes::WorkflowExecutionSignaled {
                signal_name: "go".into(),
                input: None,
            },
        ),
        ev(6, EventAttributes::WorkflowTaskScheduled),
        ev(7, EventAttributes::WorkflowTaskStarted { scheduled_event_id: 6 }),
    ]);

    // previous_started=3: the first task is replayed, the second is new.
    let mut driver = WorkflowDriver::new("wf-1", "run-1", workflow);
    driver
        .process_task(update(events, 3, 7), &NoLocalActivities)
        .await
        .unwrap();
    assert_eq!(replay_observations.borrow().as_slice(), [true, false]);
}

#[tokio::test]
async fn deterministic_randomness_is_identical_across_replay() {
    fn uuid_workflow(out: Rc<std::cell::RefCell<Vec<String>>>) -> WorkflowFunction {
        Box::new(move |ctx: WfContext| {
            Box::pin(async move {
                let a = ctx.random_uuid().expect("uuid");
                let b = ctx.random_uuid().expect("uuid");
                out.borrow_mut().push(a.to_string());
                out.borrow_mut().push(b.to_string());
                WorkflowExit::Complete(None)
            })
        })
    }

    let first = Rc::new(std::cell::RefCell::new(Vec::new()));
    let mut driver = WorkflowDriver::new("wf-1", "run-1", uuid_workflow(first.clone()));
    driver
        .process_task(update(started_events(), 0, 3), &NoLocalActivities)
        .await
        .unwrap();

    let second = Rc::new(std::cell::RefCell::new(Vec::new()));
    let mut replay = WorkflowDriver::new("wf-1", "run-1", uuid_workflow(second.clone()));
    replay
        .process_task(update(started_events(), 0, 3), &NoLocalActivities)
        .await
        .unwrap();

    assert_eq!(*first.borrow(), *second.borrow());
    assert_ne!(first.borrow()[0], first.borrow()[1]);
}
