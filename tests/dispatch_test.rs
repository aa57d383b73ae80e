//! End-to-end tests: queue mutations land in storage, then fan out to the
//! workcenter's live subscribers.

use std::sync::Arc;
use std::time::Duration;

use checkq::dispatch::Dispatcher;
use checkq::hub::{BroadcastHub, HubConfig};
use checkq::model::*;
use checkq::queue::ControlPlanQueue;
use serde_json::json;
use tokio::time::timeout;

fn test_dispatcher() -> Dispatcher {
    let queue = ControlPlanQueue::in_memory().expect("in-memory queue");
    Dispatcher::new(queue, Arc::new(BroadcastHub::new(HubConfig::default())))
}

async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<String>) -> serde_json::Value {
    let frame = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("stream closed");
    serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap()
}

#[tokio::test]
async fn enqueue_notifies_the_workcenter_channel() {
    let dispatcher = test_dispatcher();
    let (_id, mut rx) = dispatcher.hub().connect("W").await;
    next_event(&mut rx).await; // connected

    let plan = dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], json!("plan_activated"));
    assert_eq!(event["id"], json!(plan.id.0.to_string()));
    assert_eq!(event["workcenter_key"], json!("W"));

    let waiting = dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();
    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], json!("plan_queued"));
    assert_eq!(event["id"], json!(waiting.id.0.to_string()));
}

#[tokio::test]
async fn enqueue_does_not_leak_to_other_channels() {
    let dispatcher = test_dispatcher();
    let (_id, mut rx_other) = dispatcher.hub().connect("V").await;
    next_event(&mut rx_other).await;

    dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();

    assert!(
        timeout(Duration::from_millis(100), rx_other.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn complete_promotes_and_announces_both_transitions() {
    let dispatcher = test_dispatcher();

    let r1 = dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();
    let r2 = dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();

    let (_id, mut rx) = dispatcher.hub().connect("W").await;
    next_event(&mut rx).await; // connected

    let promoted = dispatcher.complete(r1.id).await.unwrap().unwrap();
    assert_eq!(promoted.id, r2.id);

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], json!("plan_completed"));
    assert_eq!(event["id"], json!(r1.id.0.to_string()));

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], json!("plan_activated"));
    assert_eq!(event["id"], json!(r2.id.0.to_string()));

    // Storage agrees with what was announced.
    assert_eq!(dispatcher.get(r1.id).unwrap().state(), WorkflowState::Completed);
    assert!(dispatcher.get(r2.id).unwrap().active);
}

#[tokio::test]
async fn skip_promotes_the_next_in_line() {
    let dispatcher = test_dispatcher();

    let r1 = dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();
    let r2 = dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();

    let (_id, mut rx) = dispatcher.hub().connect("W").await;
    next_event(&mut rx).await;

    dispatcher.skip(r1.id).await.unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], json!("plan_skipped"));
    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], json!("plan_activated"));

    assert_eq!(dispatcher.get(r1.id).unwrap().state(), WorkflowState::Skipped);
    assert!(dispatcher.get(r2.id).unwrap().active);
}

#[tokio::test]
async fn complete_with_empty_queue_announces_only_completion() {
    let dispatcher = test_dispatcher();
    let r1 = dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();

    let (_id, mut rx) = dispatcher.hub().connect("W").await;
    next_event(&mut rx).await;

    let promoted = dispatcher.complete(r1.id).await.unwrap();
    assert!(promoted.is_none());

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], json!("plan_completed"));
    assert!(
        timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn completing_a_waiting_item_leaves_the_active_slot_alone() {
    let dispatcher = test_dispatcher();

    let active = dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();
    let waiting = dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();

    let (_id, mut rx) = dispatcher.hub().connect("W").await;
    next_event(&mut rx).await; // connected

    // Completing out of line must not try to promote into the held slot.
    let promoted = dispatcher.complete(waiting.id).await.unwrap();
    assert!(promoted.is_none());

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], json!("plan_completed"));
    assert_eq!(event["id"], json!(waiting.id.0.to_string()));
    assert!(
        timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );

    assert_eq!(
        dispatcher.get(waiting.id).unwrap().state(),
        WorkflowState::Completed
    );
    assert!(dispatcher.get(active.id).unwrap().active);
}

#[tokio::test]
async fn backup_lines_merges_and_announces() {
    let dispatcher = test_dispatcher();
    let plan = dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();

    let (_id, mut rx) = dispatcher.hub().connect("W").await;
    next_event(&mut rx).await;

    dispatcher
        .backup_lines(plan.id, vec![MeasurementLine::new("A").value(json!(1))])
        .await
        .unwrap();
    let merged = dispatcher
        .backup_lines(
            plan.id,
            vec![
                MeasurementLine::new("A").value(json!(2)),
                MeasurementLine::new("B").value(json!(3)),
            ],
        )
        .await
        .unwrap();

    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].value, Some(json!(2)));

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], json!("lines_backed_up"));
    assert_eq!(event["line_count"], json!(1));
    let event = next_event(&mut rx).await;
    assert_eq!(event["line_count"], json!(2));

    let active = dispatcher.get_active("T", "W").unwrap().unwrap();
    assert_eq!(active.lines.unwrap().len(), 2);
}

#[tokio::test]
async fn purge_runs_through_the_dispatcher() {
    let dispatcher = test_dispatcher();
    dispatcher
        .enqueue(NewControlPlan::new("T", "W", "MILL-01"))
        .await
        .unwrap();

    // Nothing is older than the window yet.
    let deleted = dispatcher.purge("T", chrono::Duration::days(7)).unwrap();
    assert_eq!(deleted, 0);
}
