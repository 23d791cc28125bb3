//! Local collection: optimistic mirror of one remote table.
//!
//! # Responsibility
//! - Hold the authoritative rows delivered by the change feed.
//! - Apply optimistic insert/update/delete synchronously and confirm each
//!   one through the record kind's [`WriteApi`] exactly once.
//! - Publish a fresh immutable snapshot to subscribers after every change.
//!
//! # Invariants
//! - A mutation is visible in the snapshot before its confirmation task
//!   starts.
//! - The snapshot is `synced rows + pending mutations in issue order`; an
//!   overlay is dropped in the same step that applies the feed message
//!   carrying its txid, so confirmed rows never flicker or duplicate.
//! - A failed confirmation removes its overlay (rollback).
//! - The state lock is never held across an await point.

use crate::api::client::WriteApi;
use crate::model::record::{
    LocalId, RecordKey, RecordPhase, ServerId, Synced, SyncRecord, TxId,
};
use crate::sync::mutation::{
    CollectionError, CollectionResult, MutationId, MutationKind, MutationPhase, MutationReceipt,
    MutationTicket, SeenTxIds,
};
use crate::sync::shape::{ShapeBatch, ShapeMessage, ShapeOperation};
use crate::sync::shape_stream::ShapeSource;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;

const FEED_RETRY_BASE: Duration = Duration::from_millis(250);
const FEED_RETRY_MAX: Duration = Duration::from_secs(10);

/// One row of the live view.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveRow<T> {
    pub key: RecordKey,
    pub phase: RecordPhase,
    pub value: T,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<T: Clone> LiveRow<T> {
    fn from_synced(row: &Synced<T>) -> Self {
        Self {
            key: RecordKey::Server(row.id),
            phase: RecordPhase::Synced,
            value: row.value.clone(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Immutable view published to subscribers.
pub type Snapshot<T> = Arc<Vec<LiveRow<T>>>;

/// Counters describing one applied feed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Row changes applied to synced state.
    pub changes: usize,
    /// Optimistic mutations retired by txids in this batch.
    pub confirmed: usize,
    /// Change messages that could not be decoded into a row.
    pub skipped: usize,
}

#[derive(Debug, Clone)]
enum PendingOp<T: SyncRecord> {
    Insert {
        local: LocalId,
        value: T,
        inserted_at: DateTime<Utc>,
    },
    Update {
        target: RecordKey,
        patch: T::Patch,
    },
    Delete {
        target: RecordKey,
    },
}

#[derive(Debug, Clone)]
struct PendingMutation<T: SyncRecord> {
    id: MutationId,
    op: PendingOp<T>,
    phase: MutationPhase,
}

struct State<T: SyncRecord> {
    synced: BTreeMap<ServerId, Synced<T>>,
    pending: Vec<PendingMutation<T>>,
    aliases: HashMap<LocalId, ServerId>,
    seen_txids: SeenTxIds,
    next_mutation: u64,
    up_to_date: bool,
}

impl<T: SyncRecord> State<T> {
    fn new() -> Self {
        Self {
            synced: BTreeMap::new(),
            pending: Vec::new(),
            aliases: HashMap::new(),
            seen_txids: SeenTxIds::default(),
            next_mutation: 0,
            up_to_date: false,
        }
    }

    fn canonical(&self, key: RecordKey) -> RecordKey {
        match key {
            RecordKey::Local(local) => self
                .aliases
                .get(&local)
                .map_or(key, |id| RecordKey::Server(*id)),
            server => server,
        }
    }

    fn rows(&self) -> Vec<LiveRow<T>> {
        let mut rows: Vec<LiveRow<T>> = self.synced.values().map(LiveRow::from_synced).collect();
        for mutation in &self.pending {
            match &mutation.op {
                PendingOp::Insert {
                    local,
                    value,
                    inserted_at,
                } => {
                    let key = self.canonical(RecordKey::Local(*local));
                    if rows.iter().any(|row| row.key == key) {
                        continue;
                    }
                    rows.push(LiveRow {
                        key,
                        phase: RecordPhase::PendingCreate,
                        value: value.clone(),
                        created_at: *inserted_at,
                        updated_at: *inserted_at,
                    });
                }
                PendingOp::Update { target, patch } => {
                    let key = self.canonical(*target);
                    if let Some(row) = rows.iter_mut().find(|row| row.key == key) {
                        row.value.apply_patch(patch);
                    }
                }
                PendingOp::Delete { target } => {
                    let key = self.canonical(*target);
                    rows.retain(|row| row.key != key);
                }
            }
        }
        rows
    }

    fn row(&self, key: RecordKey) -> Option<LiveRow<T>> {
        let key = self.canonical(key);
        self.rows().into_iter().find(|row| row.key == key)
    }

    fn phase(&self, key: RecordKey) -> Option<RecordPhase> {
        let canonical = self.canonical(key);
        let pending_delete = self.pending.iter().any(|mutation| match &mutation.op {
            PendingOp::Delete { target } => self.canonical(*target) == canonical,
            _ => false,
        });
        if pending_delete {
            return Some(RecordPhase::PendingDelete);
        }
        self.row(canonical).map(|row| row.phase)
    }

    fn push(&mut self, op: PendingOp<T>) -> MutationId {
        self.next_mutation += 1;
        let id = MutationId(self.next_mutation);
        self.pending.push(PendingMutation {
            id,
            op,
            phase: MutationPhase::InFlight,
        });
        id
    }

    fn remove(&mut self, id: MutationId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|mutation| mutation.id != id);
        self.pending.len() != before
    }

    /// Moves a mutation to `AwaitingFeed`, or retires it if the feed already
    /// delivered `txid`.
    fn acknowledge(&mut self, id: MutationId, txid: TxId) {
        if self.seen_txids.contains(txid) {
            self.remove(id);
            return;
        }
        if let Some(mutation) = self.pending.iter_mut().find(|mutation| mutation.id == id) {
            mutation.phase = MutationPhase::AwaitingFeed { txid };
        }
    }

    fn retire_txid(&mut self, txid: TxId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|mutation| {
            !matches!(mutation.phase, MutationPhase::AwaitingFeed { txid: awaited } if awaited == txid)
        });
        before - self.pending.len()
    }

    fn has_pending_insert(&self, local: LocalId) -> bool {
        self.pending.iter().any(|mutation| {
            matches!(&mutation.op, PendingOp::Insert { local: pending, .. } if *pending == local)
        })
    }

    fn apply_change(
        &mut self,
        operation: ShapeOperation,
        id: ServerId,
        value: &Map<String, Value>,
    ) -> bool {
        match operation {
            ShapeOperation::Insert => match decode_row::<T>(value.clone()) {
                Some(row) => {
                    self.synced.insert(id, row);
                    true
                }
                None => false,
            },
            ShapeOperation::Update => {
                let merged = match self.synced.get(&id) {
                    Some(existing) => merge_row(existing, value),
                    None => Some(value.clone()),
                };
                match merged.and_then(decode_row::<T>) {
                    Some(row) => {
                        self.synced.insert(id, row);
                        true
                    }
                    None => false,
                }
            }
            ShapeOperation::Delete => {
                self.synced.remove(&id);
                true
            }
        }
    }
}

fn decode_row<T: SyncRecord>(value: Map<String, Value>) -> Option<Synced<T>> {
    serde_json::from_value(Value::Object(value)).ok()
}

fn merge_row<T: SyncRecord>(
    existing: &Synced<T>,
    changes: &Map<String, Value>,
) -> Option<Map<String, Value>> {
    match serde_json::to_value(existing).ok()? {
        Value::Object(mut base) => {
            for (column, value) in changes {
                base.insert(column.clone(), value.clone());
            }
            Some(base)
        }
        _ => None,
    }
}

struct Inner<T: SyncRecord> {
    api: Arc<dyn WriteApi<T>>,
    state: Mutex<State<T>>,
    changed: Notify,
    snapshot_tx: watch::Sender<Snapshot<T>>,
}

/// Cheaply clonable handle to one record kind's local collection.
pub struct Collection<T: SyncRecord> {
    inner: Arc<Inner<T>>,
}

impl<T: SyncRecord> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SyncRecord> Collection<T> {
    /// Creates an empty collection confirming writes through `api`.
    pub fn new(api: Arc<dyn WriteApi<T>>) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(Inner {
                api,
                state: Mutex::new(State::new()),
                changed: Notify::new(),
                snapshot_tx,
            }),
        }
    }

    /// Current live view.
    pub fn snapshot(&self) -> Snapshot<T> {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot<T>> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Looks up one visible row. Placeholder keys keep resolving after the
    /// server id is known.
    pub fn get(&self, key: RecordKey) -> Option<LiveRow<T>> {
        self.inner.state.lock().row(key)
    }

    /// Lifecycle phase of `key`, or `None` when the key is unknown.
    pub fn phase(&self, key: RecordKey) -> Option<RecordPhase> {
        self.inner.state.lock().phase(key)
    }

    /// Resolves a key to the server id when one is known.
    pub fn resolve(&self, key: RecordKey) -> RecordKey {
        self.inner.state.lock().canonical(key)
    }

    pub fn is_up_to_date(&self) -> bool {
        self.inner.state.lock().up_to_date
    }

    /// Number of mutations not yet confirmed by the feed.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Inserts `value` under a fresh placeholder key.
    pub fn insert(&self, value: T) -> CollectionResult<MutationTicket> {
        value.validate()?;
        let runtime = Handle::try_current().map_err(|_| CollectionError::NoRuntime)?;
        let local = LocalId::generate();

        let id = self.mutate(|state| {
            state.push(PendingOp::Insert {
                local,
                value: value.clone(),
                inserted_at: Utc::now(),
            })
        });
        debug!(
            "event=mutation_apply module=sync status=ok op=insert kind={} key={}",
            T::KIND.as_str(),
            local
        );

        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        runtime.spawn(async move {
            let _ = tx.send(this.confirm_insert(id, local, value).await);
        });
        Ok(MutationTicket::new(RecordKey::Local(local), rx))
    }

    /// Applies `mutator` to a draft copy of the row and sends only the
    /// changed fields.
    pub fn update<F>(&self, key: RecordKey, mutator: F) -> CollectionResult<MutationTicket>
    where
        F: FnOnce(&mut T),
    {
        let runtime = Handle::try_current().map_err(|_| CollectionError::NoRuntime)?;

        let staged = {
            let mut state = self.inner.state.lock();
            let current = state.row(key).ok_or(CollectionError::NotFound(key))?;
            let mut draft = current.value.clone();
            mutator(&mut draft);
            draft.validate()?;
            match current.value.diff(&draft) {
                Some(patch) => {
                    let id = state.push(PendingOp::Update {
                        target: key,
                        patch: patch.clone(),
                    });
                    self.publish(&state);
                    Some((id, patch))
                }
                None => None,
            }
        };

        let Some((id, patch)) = staged else {
            return Ok(MutationTicket::unchanged(key));
        };
        debug!(
            "event=mutation_apply module=sync status=ok op=update kind={} key={}",
            T::KIND.as_str(),
            key
        );

        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        runtime.spawn(async move {
            let _ = tx.send(this.confirm_update(id, key, patch).await);
        });
        Ok(MutationTicket::new(key, rx))
    }

    /// Removes the row from the view and deletes it remotely.
    pub fn delete(&self, key: RecordKey) -> CollectionResult<MutationTicket> {
        let runtime = Handle::try_current().map_err(|_| CollectionError::NoRuntime)?;

        let id = {
            let mut state = self.inner.state.lock();
            if state.row(key).is_none() {
                return Err(CollectionError::NotFound(key));
            }
            let id = state.push(PendingOp::Delete { target: key });
            self.publish(&state);
            id
        };
        debug!(
            "event=mutation_apply module=sync status=ok op=delete kind={} key={}",
            T::KIND.as_str(),
            key
        );

        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        runtime.spawn(async move {
            let _ = tx.send(this.confirm_delete(id, key).await);
        });
        Ok(MutationTicket::new(key, rx))
    }

    /// Applies one feed batch and retires mutations whose txid it carries.
    pub fn apply_batch(&self, batch: &ShapeBatch) -> ApplyReport {
        let mut report = ApplyReport::default();
        {
            let mut state = self.inner.state.lock();
            for message in &batch.messages {
                match message {
                    ShapeMessage::Change {
                        operation,
                        id,
                        value,
                        txids,
                    } => {
                        if state.apply_change(*operation, *id, value) {
                            report.changes += 1;
                        } else {
                            report.skipped += 1;
                        }
                        for txid in txids {
                            state.seen_txids.insert(*txid);
                            report.confirmed += state.retire_txid(*txid);
                        }
                    }
                    ShapeMessage::UpToDate => state.up_to_date = true,
                    ShapeMessage::MustRefetch => {
                        state.synced.clear();
                        state.up_to_date = false;
                    }
                }
            }
            self.publish(&state);
        }
        self.inner.changed.notify_waiters();

        if report.skipped > 0 {
            warn!(
                "event=feed_apply module=sync status=partial kind={} changes={} skipped={}",
                T::KIND.as_str(),
                report.changes,
                report.skipped
            );
        } else {
            debug!(
                "event=feed_apply module=sync status=ok kind={} changes={} confirmed={}",
                T::KIND.as_str(),
                report.changes,
                report.confirmed
            );
        }
        report
    }

    /// Waits until the feed has reported the collection is up to date.
    pub async fn wait_until_up_to_date(&self) {
        loop {
            let notified = self.inner.changed.notified();
            if self.is_up_to_date() {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the feed has delivered `txid`.
    pub async fn wait_for_txid(&self, txid: TxId) {
        loop {
            let notified = self.inner.changed.notified();
            if self.inner.state.lock().seen_txids.contains(txid) {
                return;
            }
            notified.await;
        }
    }

    /// Pulls batches from `source` until `cancel` fires.
    ///
    /// Feed errors are logged and retried with capped exponential backoff.
    pub async fn follow<S: ShapeSource>(&self, mut source: S, cancel: CancellationToken) {
        info!(
            "event=feed_follow module=sync status=start kind={}",
            T::KIND.as_str()
        );
        let mut failures: u32 = 0;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = source.next_batch() => next,
            };
            match next {
                Ok(batch) => {
                    failures = 0;
                    self.apply_batch(&batch);
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = feed_retry_delay(failures);
                    warn!(
                        "event=feed_follow module=sync status=error kind={} attempt={} retry_ms={} error={}",
                        T::KIND.as_str(),
                        failures,
                        delay.as_millis(),
                        err
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!(
            "event=feed_follow module=sync status=stopped kind={}",
            T::KIND.as_str()
        );
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut State<T>) -> R) -> R {
        let mut state = self.inner.state.lock();
        let result = f(&mut state);
        self.publish(&state);
        result
    }

    fn publish(&self, state: &State<T>) {
        self.inner.snapshot_tx.send_replace(Arc::new(state.rows()));
    }

    async fn resolve_target(&self, key: RecordKey) -> CollectionResult<ServerId> {
        let local = match key {
            RecordKey::Server(id) => return Ok(id),
            RecordKey::Local(local) => local,
        };
        loop {
            let notified = self.inner.changed.notified();
            {
                let state = self.inner.state.lock();
                if let Some(id) = state.aliases.get(&local) {
                    return Ok(*id);
                }
                if !state.has_pending_insert(local) {
                    return Err(CollectionError::DependencyFailed(local));
                }
            }
            notified.await;
        }
    }

    async fn confirm_insert(
        &self,
        id: MutationId,
        local: LocalId,
        value: T,
    ) -> CollectionResult<MutationReceipt> {
        match self.inner.api.create(&value).await {
            Ok(receipt) => {
                self.mutate(|state| {
                    state.aliases.insert(local, receipt.id);
                    state.acknowledge(id, receipt.txid);
                });
                self.inner.changed.notify_waiters();
                info!(
                    "event=mutation_confirm module=sync status=ok op=insert kind={} key={} txid={}",
                    T::KIND.as_str(),
                    receipt.id,
                    receipt.txid
                );
                Ok(MutationReceipt {
                    key: RecordKey::Server(receipt.id),
                    txid: Some(receipt.txid),
                })
            }
            Err(source) => {
                self.rollback(id, MutationKind::Insert, RecordKey::Local(local));
                Err(CollectionError::Api {
                    kind: MutationKind::Insert,
                    source,
                })
            }
        }
    }

    async fn confirm_update(
        &self,
        id: MutationId,
        key: RecordKey,
        patch: T::Patch,
    ) -> CollectionResult<MutationReceipt> {
        let outcome = async {
            let server_id = self.resolve_target(key).await?;
            let txid = self
                .inner
                .api
                .update(server_id, &patch)
                .await
                .map_err(|source| CollectionError::Api {
                    kind: MutationKind::Update,
                    source,
                })?;
            Ok::<_, CollectionError>((server_id, txid))
        }
        .await;
        self.settle(id, MutationKind::Update, key, outcome)
    }

    async fn confirm_delete(
        &self,
        id: MutationId,
        key: RecordKey,
    ) -> CollectionResult<MutationReceipt> {
        let outcome = async {
            let server_id = self.resolve_target(key).await?;
            let txid = self
                .inner
                .api
                .delete(server_id)
                .await
                .map_err(|source| CollectionError::Api {
                    kind: MutationKind::Delete,
                    source,
                })?;
            Ok::<_, CollectionError>((server_id, txid))
        }
        .await;
        self.settle(id, MutationKind::Delete, key, outcome)
    }

    fn settle(
        &self,
        id: MutationId,
        kind: MutationKind,
        key: RecordKey,
        outcome: CollectionResult<(ServerId, TxId)>,
    ) -> CollectionResult<MutationReceipt> {
        match outcome {
            Ok((server_id, txid)) => {
                self.mutate(|state| state.acknowledge(id, txid));
                self.inner.changed.notify_waiters();
                info!(
                    "event=mutation_confirm module=sync status=ok op={} kind={} key={} txid={}",
                    kind.as_str(),
                    T::KIND.as_str(),
                    server_id,
                    txid
                );
                Ok(MutationReceipt {
                    key: RecordKey::Server(server_id),
                    txid: Some(txid),
                })
            }
            Err(err) => {
                self.rollback(id, kind, key);
                Err(err)
            }
        }
    }

    fn rollback(&self, id: MutationId, kind: MutationKind, key: RecordKey) {
        let removed = self.mutate(|state| state.remove(id));
        self.inner.changed.notify_waiters();
        warn!(
            "event=mutation_rollback module=sync status=error op={} kind={} key={} removed={}",
            kind.as_str(),
            T::KIND.as_str(),
            key,
            removed
        );
    }
}

fn feed_retry_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    FEED_RETRY_BASE
        .saturating_mul(1u32 << exponent)
        .min(FEED_RETRY_MAX)
}

#[cfg(test)]
mod tests {
    use super::feed_retry_delay;
    use std::time::Duration;

    #[test]
    fn feed_retry_delay_doubles_and_caps() {
        assert_eq!(feed_retry_delay(1), Duration::from_millis(250));
        assert_eq!(feed_retry_delay(3), Duration::from_millis(1_000));
        assert_eq!(feed_retry_delay(40), Duration::from_secs(10));
    }
}
