//! End-to-end tests of the consistency layer over in-memory storage and a mock client.

use chatsync_engine::{
    handler, ClientError, EngineError, EventPipeline, Flow, MockCall, ResetReason, Rpc, SyncOutcome,
};
use chatsync_protocol::{Event, EventKind, MessageStatus};
use chatsync_storage::StorageDriver;
use chatsync_testkit::prelude::*;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type Trace = Arc<Mutex<Vec<String>>>;

fn tracing_handler(trace: &Trace, label: String, delay_ms: u64) -> chatsync_engine::Handler<String, ()> {
    let trace = Arc::clone(trace);
    handler(move |event: Arc<String>, _| {
        let trace = Arc::clone(&trace);
        let label = label.clone();
        async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            trace.lock().push(format!("{label}({event})"));
            Ok(Flow::Continue)
        }
    })
}

#[tokio::test]
async fn pipeline_runs_handlers_in_order_per_event() {
    init_test_logging();
    let pipeline: EventPipeline<String, ()> = EventPipeline::new("trace");
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let _a = pipeline.append("a", tracing_handler(&trace, "A".into(), 15));
    let _b = pipeline.append("b", tracing_handler(&trace, "B".into(), 0));

    let first = pipeline.run("e1".into(), ());
    let second = pipeline.run("e2".into(), ());
    second.await.unwrap();
    first.await.unwrap();

    assert_eq!(*trace.lock(), vec!["A(e1)", "B(e1)", "A(e2)", "B(e2)"]);
}

#[tokio::test]
async fn unhealthy_connection_queues_the_task() {
    init_test_logging();
    let general = cid("general");
    let harness = TestHarness::with_channels("alice", &[general.clone()]);
    let queue = harness.queue();
    harness.client.set_healthy(false);

    let result = queue.queue_task(send_message_task(&general, "m1")).await;
    assert!(matches!(
        result,
        Err(EngineError::Client(ClientError::ConnectionLost(_)))
    ));
    assert_eq!(harness.storage.pending_task_count(), 1);
    assert_eq!(harness.client.call_count(Rpc::SendMessage), 0);

    harness.client.set_healthy(true);
    let report = queue.execute_all().await.unwrap();
    assert_eq!(report.executed, 1);
    assert_eq!(harness.storage.pending_task_count(), 0);
    assert!(harness.storage.get_message("m1").await.unwrap().is_some());
}

#[tokio::test]
async fn rejected_task_is_not_queued() {
    let general = cid("general");
    let harness = TestHarness::with_channels("alice", &[general.clone()]);
    let queue = harness.queue();
    harness
        .client
        .fail_next(Rpc::SendMessage, ClientError::api(17, 403, "not allowed"));

    let result = queue.queue_task(send_message_task(&general, "m1")).await;
    assert!(result.is_err());
    assert_eq!(harness.storage.pending_task_count(), 0);
}

#[tokio::test]
async fn stale_cursor_resets_instead_of_syncing() {
    init_test_logging();
    let harness = TestHarness::with_channels("alice", &[cid("general")]);
    harness.set_cursor_days_ago("alice", 40).await;

    let outcome = harness.coordinator().sync().await;

    assert_eq!(outcome, SyncOutcome::Reset(ResetReason::Drift { days: 40 }));
    assert_eq!(harness.storage.reset_count(), 1);
    assert_eq!(harness.client.call_count(Rpc::Sync), 0);
    assert!(harness.storage.get_last_synced_at("alice").await.unwrap().is_some());
}

#[tokio::test]
async fn recent_cursor_catches_up_on_missed_events() {
    let general = cid("general");
    let harness = TestHarness::with_channels("alice", &[general.clone()]);
    harness.set_cursor_days_ago("alice", 10).await;
    harness
        .client
        .set_sync_events(vec![message_new_with_channel(message(&general, "m1", "bob"))]);

    let outcome = harness.coordinator().sync().await;

    assert!(matches!(outcome, SyncOutcome::CaughtUp { events: 1, .. }));
    assert_eq!(harness.storage.reset_count(), 0);
    assert!(harness.storage.get_message("m1").await.unwrap().is_some());
    let synced = harness.client.calls().into_iter().find_map(|call| match call {
        MockCall::Sync { cids, .. } => Some(cids),
        _ => None,
    });
    assert_eq!(synced, Some(vec![general]));
}

#[tokio::test]
async fn channel_is_written_before_its_messages() {
    let general = cid("general");
    let harness = TestHarness::new("alice");
    let router = harness.router();

    let orphan = router
        .handle_event(&message_new(message(&general, "m0", "bob")), true)
        .await;
    assert!(orphan.is_empty());
    assert!(harness.storage.get_message("m0").await.unwrap().is_none());

    let batch = router
        .handle_event(&message_new_with_channel(message(&general, "m1", "bob")), true)
        .await;
    assert_eq!(&batch.op_names()[..2], &["upsert_channel_data", "upsert_messages"]);
    assert!(harness.storage.channel_exists(&general).await.unwrap());
    assert!(harness.storage.get_message("m1").await.unwrap().is_some());
}

#[tokio::test]
async fn live_channel_stands_in_for_missing_payload() {
    let general = cid("general");
    let harness = TestHarness::new("alice");
    harness.client.set_runtime(general.clone(), live_runtime(&general, 2));

    let batch = harness
        .router()
        .handle_event(&message_new(message(&general, "m1", "bob")), true)
        .await;

    assert_eq!(batch.op_names().first(), Some(&"upsert_channel_data"));
    assert!(harness.storage.get_message("m1").await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_send_converges_to_received() {
    let general = cid("general");
    let harness = TestHarness::new("alice");
    let reconciler = harness.reconciler();
    harness.client.fail_next(
        Rpc::SendMessage,
        ClientError::api(4, 400, "message with id m1 already exists"),
    );

    let result = reconciler.send(&general, message(&general, "m1", "alice")).await;

    assert!(result.is_err());
    let local = reconciler.get("m1").unwrap();
    assert_eq!(local.status, MessageStatus::Received);
    assert!(local.error.is_none());
}

#[tokio::test]
async fn other_send_failures_mark_the_message_failed() {
    let general = cid("general");
    let harness = TestHarness::new("alice");
    let reconciler = harness.reconciler();
    harness
        .client
        .fail_next(Rpc::SendMessage, ClientError::api(17, 403, "not allowed"));

    assert!(reconciler
        .send(&general, message(&general, "m1", "alice"))
        .await
        .is_err());
    let local = reconciler.get("m1").unwrap();
    assert_eq!(local.status, MessageStatus::Failed);
    assert_eq!(local.error.unwrap().code, Some(17));

    let retried = reconciler.retry(&general, message(&general, "m1", "alice")).await.unwrap();
    assert_eq!(retried.id, "m1");
    assert_eq!(reconciler.get("m1").unwrap().status, MessageStatus::Received);
}

#[tokio::test]
async fn offline_mutation_replays_before_catch_up_on_reconnect() {
    init_test_logging();
    let general = cid("general");
    let harness = TestHarness::with_channels("alice", &[general.clone()]);
    let support = harness.offline_support();
    assert!(support.init("alice").await.unwrap());

    let (status_tx, mut status_rx) = watch::channel(false);
    let _status = support.coordinator().on_status_change(move |status| {
        status_tx.send_replace(status);
    });

    harness.client.set_healthy(false);
    harness.client.emit(&Event::connection_changed(false));
    assert!(support
        .queue()
        .queue_task(send_message_task(&general, "m1"))
        .await
        .is_err());
    assert_eq!(harness.storage.pending_task_count(), 1);

    let calls_before = harness.client.calls().len();
    harness.client.set_healthy(true);
    harness.client.emit(&Event::connection_changed(true));
    tokio::time::timeout(Duration::from_secs(2), status_rx.wait_for(|status| *status))
        .await
        .expect("reconnect did not finish")
        .unwrap();

    assert_eq!(harness.storage.pending_task_count(), 0);
    assert!(harness.storage.get_message("m1").await.unwrap().is_some());
    let rpcs: Vec<Rpc> = harness.client.calls()[calls_before..]
        .iter()
        .map(MockCall::rpc)
        .collect();
    assert_eq!(rpcs, vec![Rpc::SendMessage, Rpc::Sync]);

    harness
        .client
        .emit(&message_new_with_channel(message(&general, "m2", "bob")));
    support.mirror().drain().await;
    assert!(harness.storage.get_message("m2").await.unwrap().is_some());
    assert_eq!(
        harness.storage.get_message("m2").await.unwrap().map(|m| m.text),
        Some("message m2".to_string())
    );

    support.shutdown();
    assert_eq!(harness.client.subscriber_count(), 0);
}

#[tokio::test]
async fn reaction_events_mirror_reactions() {
    let general = cid("general");
    let harness = TestHarness::with_channels("alice", &[general.clone()]);
    let router = harness.router();
    let target = message(&general, "m1", "bob");
    router.handle_event(&message_new(target.clone()), true).await;

    let batch = router
        .handle_event(&reaction_new(&general, target, "like", "carol"), true)
        .await;

    assert!(!batch.is_empty());
    let reactions = harness.storage.get_reactions("m1").await.unwrap();
    assert_eq!(reactions.len(), 1);
    assert_eq!(reactions[0].kind, "like");
}

#[tokio::test]
async fn failing_handler_does_not_block_later_runs() {
    let pipeline: EventPipeline<Event, ()> = EventPipeline::new("mirror");
    let _broken = pipeline.append(
        "broken",
        handler(|_event: Arc<Event>, _| async { Err("boom".into()) }),
    );

    assert!(pipeline.run(Event::new(EventKind::Other("x".into())), ()).await.is_err());
    assert!(pipeline.run(Event::new(EventKind::Other("y".into())), ()).await.is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn unknown_channel_without_a_source_is_never_written(event in message_event_strategy(cid("ghost"))) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let harness = TestHarness::new("alice");

        let (batch, stored) = runtime.block_on(async {
            let batch = harness.router().handle_event(&event, true).await;
            let stored = harness.storage.channel_exists(&cid("ghost")).await.unwrap();
            (batch, stored)
        });

        prop_assert!(batch.is_empty());
        prop_assert!(!stored);
        prop_assert!(harness.storage.committed_batches().is_empty());
    }

    #[test]
    fn channel_payload_is_written_ahead_of_message_writes(event in message_event_strategy(cid("general"))) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let harness = TestHarness::new("alice");
        let event = event.with_channel(channel(&cid("general")));

        let batch = runtime.block_on(harness.router().route(&event)).unwrap();

        let names = batch.op_names();
        if event.kind == EventKind::MessageNew {
            prop_assert_eq!(&names[..2], &["upsert_channel_data", "upsert_messages"]);
        }
        if !batch.is_empty() {
            prop_assert_eq!(names[0], "upsert_channel_data");
        }
    }

    #[test]
    fn every_event_sees_every_handler_in_order(labels in handler_labels_strategy(), events in 1usize..5) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));

        runtime.block_on(async {
            let pipeline: EventPipeline<String, ()> = EventPipeline::new("prop");
            let _registered: Vec<_> = labels
                .iter()
                .enumerate()
                .map(|(i, label)| {
                    let delay = if i % 2 == 0 { 2 } else { 0 };
                    pipeline.append(label.clone(), tracing_handler(&trace, label.clone(), delay))
                })
                .collect();
            let runs: Vec<_> = (0..events).map(|i| pipeline.run(format!("e{i}"), ())).collect();
            for run in runs {
                run.await.unwrap();
            }
        });

        let expected: Vec<String> = (0..events)
            .flat_map(|i| labels.iter().map(move |label| format!("{label}(e{i})")))
            .collect();
        prop_assert_eq!(trace.lock().clone(), expected);
    }
}
