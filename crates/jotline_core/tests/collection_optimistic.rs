mod common;

use common::{batch, change, server_key, task_row, MockWriteApi, TaskApi, WriteCall};
use jotline_core::{
    Collection, CollectionError, RecordKey, RecordPhase, ShapeOperation, Task, TaskPatch, TxId,
};
use std::sync::Arc;

fn tasks(api: &Arc<TaskApi>) -> Collection<Task> {
    Collection::new(api.clone())
}

fn seeded(api: &Arc<TaskApi>, rows: &[(i64, &str, bool)]) -> Collection<Task> {
    let collection = tasks(api);
    collection.apply_batch(&batch(
        rows.iter()
            .map(|(id, text, completed)| {
                change(ShapeOperation::Insert, *id, task_row(*id, text, *completed), &[])
            })
            .collect(),
    ));
    collection
}

#[tokio::test]
async fn insert_is_visible_before_any_network_response() {
    let api = MockWriteApi::<Task>::gated();
    let collection = tasks(&api);
    let mut updates = collection.subscribe();

    let ticket = collection.insert(Task::new("Buy milk")).unwrap();

    let snapshot = collection.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].value, Task::new("Buy milk"));
    assert_eq!(snapshot[0].phase, RecordPhase::PendingCreate);
    assert!(matches!(snapshot[0].key, RecordKey::Local(_)));
    assert_eq!(snapshot[0].key, ticket.key());
    assert!(updates.has_changed().unwrap());
    assert_eq!(updates.borrow_and_update().len(), 1);

    api.release(1);
    ticket.confirmed().await.unwrap();
}

#[tokio::test]
async fn confirmed_insert_shows_once_with_server_id() {
    let api = MockWriteApi::<Task>::new();
    let collection = tasks(&api);

    let ticket = collection.insert(Task::new("Buy milk")).unwrap();
    let placeholder = ticket.key();
    let receipt = ticket.confirmed().await.unwrap();
    assert_eq!(receipt.key, server_key(1));
    assert_eq!(receipt.txid, Some(TxId(100)));

    // Acknowledged, not yet seen on the feed.
    let snapshot = collection.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].key, server_key(1));
    assert_eq!(collection.resolve(placeholder), server_key(1));

    collection.apply_batch(&batch(vec![change(
        ShapeOperation::Insert,
        1,
        task_row(1, "Buy milk", false),
        &[100],
    )]));

    let snapshot = collection.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].key, server_key(1));
    assert_eq!(snapshot[0].phase, RecordPhase::Synced);
    assert_eq!(collection.pending_count(), 0);
    assert_eq!(collection.get(placeholder).unwrap().key, server_key(1));
    assert_eq!(api.calls(), vec![WriteCall::Create(Task::new("Buy milk"))]);
}

#[tokio::test]
async fn delete_removes_row_synchronously() {
    let api = MockWriteApi::<Task>::gated();
    let collection = seeded(&api, &[(1, "a", false), (2, "b", false)]);

    let ticket = collection.delete(server_key(1)).unwrap();
    let snapshot = collection.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].key, server_key(2));
    assert_eq!(collection.phase(server_key(1)), Some(RecordPhase::PendingDelete));

    api.release(1);
    ticket.confirmed().await.unwrap();
    assert_eq!(api.calls(), vec![WriteCall::Delete(server_key(1).server_id().unwrap())]);
}

#[tokio::test]
async fn update_sends_only_changed_fields() {
    let api = MockWriteApi::<Task>::new();
    let collection = seeded(&api, &[(1, "a", false)]);

    let ticket = collection
        .update(server_key(1), |task| task.completed = true)
        .unwrap();
    assert!(collection.get(server_key(1)).unwrap().value.completed);
    ticket.confirmed().await.unwrap();

    assert_eq!(
        api.updates(),
        vec![(
            server_key(1).server_id().unwrap(),
            TaskPatch {
                text: None,
                completed: Some(true),
            }
        )]
    );
}

#[tokio::test]
async fn unchanged_update_skips_network() {
    let api = MockWriteApi::<Task>::new();
    let collection = seeded(&api, &[(1, "a", false)]);

    let receipt = collection
        .update(server_key(1), |task| task.text = "a".to_string())
        .unwrap()
        .confirmed()
        .await
        .unwrap();
    assert!(receipt.txid.is_none());
    assert!(api.calls().is_empty());
    assert_eq!(collection.pending_count(), 0);
}

#[tokio::test]
async fn failed_insert_rolls_back() {
    let api = MockWriteApi::<Task>::new();
    api.set_failing(true);
    let collection = tasks(&api);

    let ticket = collection.insert(Task::new("doomed")).unwrap();
    assert_eq!(collection.snapshot().len(), 1);

    let err = ticket.confirmed().await.unwrap_err();
    assert!(matches!(err, CollectionError::Api { .. }));
    assert!(collection.snapshot().is_empty());
    assert_eq!(collection.pending_count(), 0);
}

#[tokio::test]
async fn failed_update_and_delete_restore_synced_row() {
    let api = MockWriteApi::<Task>::new();
    let collection = seeded(&api, &[(1, "a", false)]);
    api.set_failing(true);

    let update = collection
        .update(server_key(1), |task| task.text = "renamed".to_string())
        .unwrap();
    assert_eq!(collection.get(server_key(1)).unwrap().value.text, "renamed");
    assert!(update.confirmed().await.is_err());
    assert_eq!(collection.get(server_key(1)).unwrap().value.text, "a");

    let delete = collection.delete(server_key(1)).unwrap();
    assert!(collection.get(server_key(1)).is_none());
    assert!(delete.confirmed().await.is_err());
    assert_eq!(collection.get(server_key(1)).unwrap().phase, RecordPhase::Synced);
}

#[tokio::test]
async fn mutations_on_pending_create_wait_for_server_id() {
    let api = MockWriteApi::<Task>::gated();
    let collection = tasks(&api);

    let insert = collection.insert(Task::new("draft")).unwrap();
    let local = insert.key();
    let update = collection
        .update(local, |task| task.text = "final".to_string())
        .unwrap();
    assert_eq!(collection.get(local).unwrap().value.text, "final");

    api.release(2);
    insert.confirmed().await.unwrap();
    let receipt = update.confirmed().await.unwrap();
    assert_eq!(receipt.key, server_key(1));

    let calls = api.calls();
    assert_eq!(calls[0], WriteCall::Create(Task::new("draft")));
    assert_eq!(
        calls[1],
        WriteCall::Update(
            server_key(1).server_id().unwrap(),
            TaskPatch {
                text: Some("final".to_string()),
                completed: None,
            }
        )
    );
}

#[tokio::test]
async fn dependants_fail_when_create_fails() {
    let api = MockWriteApi::<Task>::gated();
    api.set_failing(true);
    let collection = tasks(&api);

    let insert = collection.insert(Task::new("draft")).unwrap();
    let delete = collection.delete(insert.key()).unwrap();
    assert!(collection.snapshot().is_empty());

    api.release(1);
    assert!(insert.confirmed().await.is_err());
    assert!(matches!(
        delete.confirmed().await,
        Err(CollectionError::DependencyFailed(_))
    ));
    assert!(collection.snapshot().is_empty());
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn invalid_values_are_rejected_before_becoming_visible() {
    let api = MockWriteApi::<Task>::new();
    let collection = seeded(&api, &[(1, "a", false)]);

    assert!(matches!(
        collection.insert(Task::new("   ")),
        Err(CollectionError::Validation(_))
    ));
    assert!(matches!(
        collection.update(server_key(1), |task| task.text.clear()),
        Err(CollectionError::Validation(_))
    ));
    assert!(matches!(
        collection.delete(server_key(9)),
        Err(CollectionError::NotFound(_))
    ));
    assert_eq!(collection.snapshot().len(), 1);
    assert!(api.calls().is_empty());
}

#[test]
fn mutations_need_a_runtime() {
    let api = MockWriteApi::<Task>::new();
    let collection = tasks(&api);
    assert!(matches!(
        collection.insert(Task::new("x")),
        Err(CollectionError::NoRuntime)
    ));
    assert!(collection.snapshot().is_empty());
}
