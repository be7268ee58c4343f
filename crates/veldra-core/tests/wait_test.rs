// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wait-for-event tests: matching, timeouts, expiry, and deterministic
//! pause ids.

mod common;

use common::*;
use veldra_core::state::StateStore;
use chrono::{Duration, Utc};
use serde_json::json;
use veldra_core::queue::Kind;
use veldra_core::state::{Pause, Status};

#[tokio::test]
async fn matching_event_resumes_the_wait() {
    let ctx = TestContext::new();
    let f = test_function("app/waiter", 0);
    ctx.driver.on(
        "step",
        op_response(vec![wait_op("w", "approval", "1m", Some("async.data.ok == true"))]),
    );
    ctx.driver.on("step", final_response(json!("approved")));

    let id = ctx
        .schedule(&f, test_event("test/run", json!({})))
        .await
        .unwrap();
    ctx.drive(Utc::now()).await;

    assert_eq!(ctx.state.pause_count(), 1);
    // A timeout job is parked at the wait's expiry.
    assert!(ctx
        .queue
        .items()
        .iter()
        .any(|s| s.item.kind == Kind::Pause));

    // A non-matching event leaves the pause in place.
    let (_, res) = ctx
        .post_event(test_event("approval", json!({"ok": false})))
        .await;
    assert_eq!(res.consumed, 0);
    assert_eq!(ctx.state.pause_count(), 1);

    // The matching event consumes it exactly once.
    let (_, res) = ctx
        .post_event(test_event("approval", json!({"ok": true})))
        .await;
    assert_eq!(res.consumed, 1);
    assert_eq!(ctx.state.pause_count(), 0);

    ctx.drive(Utc::now()).await;
    let state = ctx.state.load(id.run_id).await.unwrap();
    assert_eq!(state.metadata().status, Status::Completed);

    // The matched event is the step's memoized result.
    let stored = state.action("w").unwrap();
    assert_eq!(stored["data"]["name"], "approval");
    assert_eq!(stored["data"]["data"]["ok"], true);

    let second_call = &ctx.driver.calls()[1];
    assert!(second_call.memoized.contains(&"w".to_string()));

    ctx.settle().await;
    assert_eq!(ctx.lifecycle.count("wait_for_event"), 1);
    assert_eq!(ctx.lifecycle.count("wait_for_event_resumed"), 1);
}

#[tokio::test]
async fn timeout_resumes_with_null_data() {
    let ctx = TestContext::new();
    let f = test_function("app/timeout", 0);
    ctx.driver
        .on("step", op_response(vec![wait_op("w", "approval", "1m", None)]));
    ctx.driver.on("step", final_response(json!("timed out")));

    let now = Utc::now();
    let id = ctx
        .schedule(&f, test_event("test/run", json!({})))
        .await
        .unwrap();
    ctx.drive(now).await;
    assert_eq!(ctx.state.pause_count(), 1);

    // The timeout job fires and the wait resolves to null.
    ctx.drive(now + Duration::minutes(2)).await;

    let state = ctx.state.load(id.run_id).await.unwrap();
    assert_eq!(state.metadata().status, Status::Completed);
    assert_eq!(state.action("w"), Some(&json!({"data": null})));
    assert_eq!(ctx.state.pause_count(), 0);
}

#[tokio::test]
async fn expired_pauses_are_deleted_not_consumed() {
    let ctx = TestContext::new();
    let f = test_function("app/expired", 0);
    ctx.driver
        .on("step", op_response(vec![wait_op("w", "approval", "10ms", None)]));

    ctx.schedule(&f, test_event("test/run", json!({})))
        .await
        .unwrap();
    ctx.drive(Utc::now()).await;
    assert_eq!(ctx.state.pause_count(), 1);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The first match after expiry deletes; no resume happens.
    let (_, res) = ctx
        .post_event(test_event("approval", json!({})))
        .await;
    assert_eq!(res.consumed, 0);
    assert_eq!(ctx.state.pause_count(), 0);
    // No continuation was enqueued for the wait.
    assert!(!ctx
        .queue
        .items()
        .iter()
        .any(|s| s.item.kind == Kind::Edge));
}

#[tokio::test]
async fn pause_ids_are_deterministic_per_run_and_step() {
    let ctx = TestContext::new();
    let f = test_function("app/deterministic", 0);
    ctx.driver
        .on("step", op_response(vec![wait_op("w", "approval", "1h", None)]));
    // The re-delivered discovery returns the same wait; saving again must be
    // a no-op.
    ctx.driver
        .on("step", op_response(vec![wait_op("w", "approval", "1h", None)]));

    let id = ctx
        .schedule(&f, test_event("test/run", json!({})))
        .await
        .unwrap();
    ctx.drive(Utc::now()).await;
    assert_eq!(ctx.state.pause_count(), 1);

    let expected = Pause::deterministic_id(id.run_id, "w");
    ctx.state.pause_by_id(expected).await.unwrap();

    // Re-deliver the trigger edge: the SDK re-issues the same wait.
    let item = ctx.queue.items(); // timeout job only
    assert_eq!(item.len(), 1);
    let edge = veldra_core::queue::Edge::source();
    let start_item = veldra_core::queue::Item {
        job_id: None,
        group_id: "redelivery".to_string(),
        workspace_id: ctx.workspace_id,
        kind: Kind::Start,
        identifier: id.clone(),
        attempt: 0,
        max_attempts: Some(2),
        payload: veldra_core::queue::Payload::Edge { edge: edge.clone() },
        throttle: None,
        run_info: None,
        metadata: Default::default(),
    };
    ctx.executor
        .execute(&id, &start_item, &edge, 0)
        .await
        .unwrap();

    // Still exactly one pause, same id.
    assert_eq!(ctx.state.pause_count(), 1);
    ctx.state.pause_by_id(expected).await.unwrap();
}

#[tokio::test]
async fn wait_expression_interpolates_trigger_values() {
    let ctx = TestContext::new();
    let f = test_function("app/interpolated", 0);
    ctx.driver.on(
        "step",
        op_response(vec![wait_op(
            "w",
            "order/paid",
            "1h",
            Some("async.data.order_id == event.data.order_id"),
        )]),
    );
    ctx.driver.on("step", final_response(json!("paid")));

    let id = ctx
        .schedule(&f, test_event("test/run", json!({"order_id": "ord-1"})))
        .await
        .unwrap();
    ctx.drive(Utc::now()).await;

    let pauses = ctx
        .state
        .pauses_by_event(ctx.workspace_id, "order/paid")
        .await
        .unwrap();
    let expression = pauses[0].expression.as_deref().unwrap();
    assert!(expression.contains("\"ord-1\""), "{expression}");

    // The wrong order doesn't match; the right one resumes the run.
    let (_, res) = ctx
        .post_event(test_event("order/paid", json!({"order_id": "other"})))
        .await;
    assert_eq!(res.consumed, 0);
    let (_, res) = ctx
        .post_event(test_event("order/paid", json!({"order_id": "ord-1"})))
        .await;
    assert_eq!(res.consumed, 1);

    ctx.drive(Utc::now()).await;
    let state = ctx.state.load(id.run_id).await.unwrap();
    assert_eq!(state.metadata().status, Status::Completed);
}
