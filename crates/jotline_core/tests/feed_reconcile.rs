mod common;

use common::{batch, change, channel_source, row, server_key, task_row, MockWriteApi, TaskApi};
use jotline_core::sync::shape::{decode_messages, ShapeSchema, ValueParser};
use jotline_core::{
    Collection, RecordPhase, ShapeError, ShapeMessage, ShapeOperation, Task, TxId,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn tasks(api: &Arc<TaskApi>) -> Collection<Task> {
    Collection::new(api.clone())
}

#[tokio::test]
async fn feed_event_before_acknowledgement_still_reconciles() {
    let api = MockWriteApi::<Task>::gated();
    let collection = tasks(&api);

    let ticket = collection.insert(Task::new("Buy milk")).unwrap();
    tokio::task::yield_now().await;

    // The feed delivers the committed row before the write response arrives.
    collection.apply_batch(&batch(vec![change(
        ShapeOperation::Insert,
        1,
        task_row(1, "Buy milk", false),
        &[100],
    )]));

    api.release(1);
    let receipt = ticket.confirmed().await.unwrap();
    assert_eq!(receipt.txid, Some(TxId(100)));

    let snapshot = collection.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].key, server_key(1));
    assert_eq!(snapshot[0].phase, RecordPhase::Synced);
    assert_eq!(collection.pending_count(), 0);
}

#[tokio::test]
async fn overlay_stays_until_its_txid_arrives() {
    let api = MockWriteApi::<Task>::new();
    let collection = tasks(&api);
    collection.apply_batch(&batch(vec![change(
        ShapeOperation::Insert,
        1,
        task_row(1, "a", false),
        &[],
    )]));

    collection
        .update(server_key(1), |task| task.text = "b".to_string())
        .unwrap()
        .confirmed()
        .await
        .unwrap();

    // Unrelated transaction: the optimistic value must keep showing.
    collection.apply_batch(&batch(vec![change(
        ShapeOperation::Update,
        1,
        row(json!({"id": 1, "completed": false})),
        &[55],
    )]));
    assert_eq!(collection.get(server_key(1)).unwrap().value.text, "b");
    assert_eq!(collection.pending_count(), 1);

    let report = collection.apply_batch(&batch(vec![change(
        ShapeOperation::Update,
        1,
        row(json!({"id": 1, "text": "b"})),
        &[100],
    )]));
    assert_eq!(report.confirmed, 1);
    assert_eq!(collection.pending_count(), 0);
    assert_eq!(collection.get(server_key(1)).unwrap().value.text, "b");
}

#[tokio::test]
async fn partial_updates_merge_and_deletes_remove() {
    let api = MockWriteApi::<Task>::new();
    let collection = tasks(&api);

    let report = collection.apply_batch(&batch(vec![
        change(ShapeOperation::Insert, 1, task_row(1, "a", false), &[]),
        change(ShapeOperation::Insert, 2, task_row(2, "b", false), &[]),
        change(
            ShapeOperation::Update,
            1,
            row(json!({"id": 1, "completed": true})),
            &[],
        ),
        change(ShapeOperation::Delete, 2, row(json!({"id": 2})), &[]),
    ]));
    assert_eq!(report.changes, 4);
    assert_eq!(report.skipped, 0);

    let snapshot = collection.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].value.text, "a");
    assert!(snapshot[0].value.completed);
}

#[tokio::test]
async fn undecodable_rows_are_skipped() {
    let api = MockWriteApi::<Task>::new();
    let collection = tasks(&api);
    let report = collection.apply_batch(&batch(vec![change(
        ShapeOperation::Insert,
        3,
        row(json!({"id": 3, "text": "no timestamps"})),
        &[],
    )]));
    assert_eq!(report.skipped, 1);
    assert!(collection.snapshot().is_empty());
}

#[tokio::test]
async fn must_refetch_truncates_synced_rows_but_keeps_pending() {
    let api = MockWriteApi::<Task>::gated();
    let collection = tasks(&api);
    collection.apply_batch(&batch(vec![
        change(ShapeOperation::Insert, 1, task_row(1, "a", false), &[]),
        ShapeMessage::UpToDate,
    ]));
    assert!(collection.is_up_to_date());
    let ticket = collection.insert(Task::new("local")).unwrap();

    collection.apply_batch(&batch(vec![ShapeMessage::MustRefetch]));

    let snapshot = collection.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].value.text, "local");
    assert!(!collection.is_up_to_date());

    api.release(1);
    ticket.confirmed().await.unwrap();
}

#[tokio::test]
async fn waiters_resolve_when_feed_catches_up() {
    let api = MockWriteApi::<Task>::new();
    let collection = tasks(&api);

    let waiter = {
        let collection = collection.clone();
        tokio::spawn(async move {
            collection.wait_for_txid(TxId(7)).await;
            collection.wait_until_up_to_date().await;
        })
    };
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    collection.apply_batch(&batch(vec![
        change(ShapeOperation::Insert, 1, task_row(1, "a", false), &[7]),
        ShapeMessage::UpToDate,
    ]));
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter finishes")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn follow_applies_batches_and_retries_after_errors() {
    let api = MockWriteApi::<Task>::new();
    let collection = tasks(&api);
    let (feed, source) = channel_source();
    let cancel = CancellationToken::new();

    let follower = {
        let collection = collection.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { collection.follow(source, cancel).await })
    };

    feed.send(Err(ShapeError::Status(502))).unwrap();
    feed.send(Ok(batch(vec![
        change(ShapeOperation::Insert, 4, task_row(4, "from feed", false), &[]),
        ShapeMessage::UpToDate,
    ])))
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), collection.wait_until_up_to_date())
        .await
        .expect("feed applied after backoff");
    assert_eq!(collection.get(server_key(4)).unwrap().value.text, "from feed");

    cancel.cancel();
    follower.await.unwrap();
}

#[tokio::test]
async fn decoded_wire_messages_apply_to_collection() {
    let schema = ShapeSchema::from_header(
        r#"{"id":{"type":"int4"},"text":{"type":"text"},"completed":{"type":"bool"},
            "created_at":{"type":"timestamptz"},"updated_at":{"type":"timestamptz"}}"#,
    )
    .unwrap();
    let body = json!([
        {
            "key": "\"public\".\"todos\"/\"12\"",
            "value": {
                "text": "Water plants",
                "completed": "t",
                "created_at": "2024-05-01 08:30:00.5+02",
                "updated_at": "2024-05-01 08:30:00.5+02"
            },
            "headers": {"operation": "insert", "txids": ["901"]}
        },
        {"headers": {"control": "up-to-date"}}
    ])
    .to_string();

    let messages = decode_messages(body.as_bytes(), &schema, &ValueParser::default()).unwrap();
    assert_eq!(messages.len(), 2);
    match &messages[0] {
        ShapeMessage::Change { id, txids, .. } => {
            assert_eq!(*id, server_key(12).server_id().unwrap());
            assert_eq!(txids, &vec![TxId(901)]);
        }
        other => panic!("unexpected message: {other:?}"),
    }

    let api = MockWriteApi::<Task>::new();
    let collection = tasks(&api);
    collection.apply_batch(&batch(messages));

    let row = collection.get(server_key(12)).unwrap();
    assert_eq!(row.value, Task {
        text: "Water plants".to_string(),
        completed: true,
    });
    assert_eq!(row.updated_at.to_rfc3339(), "2024-05-01T06:30:00.500+00:00");
    assert!(collection.is_up_to_date());
}

#[test]
fn unknown_operations_are_rejected() {
    let body = br#"[{"key":"k","value":{"id":"1"},"headers":{"operation":"upsert"}}]"#;
    assert!(matches!(
        decode_messages(body, &ShapeSchema::default(), &ValueParser::default()),
        Err(ShapeError::UnknownOperation(_))
    ));
}
