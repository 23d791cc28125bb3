#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use jotline_core::chat::stream::{ChatResult, DeltaStream};
use jotline_core::sync::shape::ShapeResult;
use jotline_core::{
    ApiError, ChatBackend, ChatDelta, CreateReceipt, JournalEntry, RecordKey, ServerId,
    ShapeBatch, ShapeMessage, ShapeOperation, ShapeSource, SyncRecord, Task, TxId, WireMessage,
    WriteApi,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

pub const CREATED_AT: &str = "2024-05-01T08:00:00Z";

/// One request received by [`MockWriteApi`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCall<T: SyncRecord> {
    Create(T),
    Update(ServerId, T::Patch),
    Delete(ServerId),
}

/// Write API double: assigns ids from 1 and txids from 100, records calls,
/// and can hold responses or fail them.
pub struct MockWriteApi<T: SyncRecord> {
    calls: Mutex<Vec<WriteCall<T>>>,
    next_id: AtomicI64,
    next_txid: AtomicU64,
    failing: AtomicBool,
    gated: AtomicBool,
    gate: Semaphore,
}

impl<T: SyncRecord> MockWriteApi<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            next_txid: AtomicU64::new(100),
            failing: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    /// Responses wait for [`MockWriteApi::release`] until ungated.
    pub fn gated() -> Arc<Self> {
        let api = Self::new();
        api.gated.store(true, Ordering::SeqCst);
        api
    }

    pub fn release(&self, responses: usize) {
        self.gate.add_permits(responses);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<WriteCall<T>> {
        self.calls.lock().clone()
    }

    pub fn updates(&self) -> Vec<(ServerId, T::Patch)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                WriteCall::Update(id, patch) => Some((id, patch)),
                _ => None,
            })
            .collect()
    }

    async fn respond(&self, call: WriteCall<T>) -> Result<TxId, ApiError> {
        self.calls.lock().push(call);
        if self.gated.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                body: "write rejected".to_string(),
            });
        }
        Ok(TxId(self.next_txid.fetch_add(1, Ordering::SeqCst)))
    }
}

#[async_trait]
impl<T: SyncRecord> WriteApi<T> for MockWriteApi<T> {
    async fn create(&self, value: &T) -> Result<CreateReceipt, ApiError> {
        let id = ServerId::new(self.next_id.fetch_add(1, Ordering::SeqCst)).unwrap();
        let txid = self.respond(WriteCall::Create(value.clone())).await?;
        Ok(CreateReceipt { id, txid })
    }

    async fn update(&self, id: ServerId, patch: &T::Patch) -> Result<TxId, ApiError> {
        self.respond(WriteCall::Update(id, patch.clone())).await
    }

    async fn delete(&self, id: ServerId) -> Result<TxId, ApiError> {
        self.respond(WriteCall::Delete(id)).await
    }
}

pub fn server_key(id: i64) -> RecordKey {
    RecordKey::Server(ServerId::new(id).unwrap())
}

pub fn task_row(id: i64, text: &str, completed: bool) -> Map<String, Value> {
    row(json!({
        "id": id,
        "text": text,
        "completed": completed,
        "created_at": CREATED_AT,
        "updated_at": CREATED_AT,
    }))
}

pub fn entry_row(id: i64, title: &str, content: Option<&str>, updated_at: &str) -> Map<String, Value> {
    row(json!({
        "id": id,
        "title": title,
        "content": content,
        "created_at": CREATED_AT,
        "updated_at": updated_at,
    }))
}

pub fn row(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn change(
    operation: ShapeOperation,
    id: i64,
    value: Map<String, Value>,
    txids: &[u64],
) -> ShapeMessage {
    ShapeMessage::Change {
        operation,
        id: ServerId::new(id).unwrap(),
        value,
        txids: txids.iter().copied().map(TxId).collect(),
    }
}

pub fn batch(messages: Vec<ShapeMessage>) -> ShapeBatch {
    ShapeBatch::new(messages)
}

/// Feed double driven through a channel. A closed channel never yields.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<ShapeResult<ShapeBatch>>,
}

pub fn channel_source() -> (mpsc::UnboundedSender<ShapeResult<ShapeBatch>>, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelSource { rx })
}

#[async_trait]
impl ShapeSource for ChannelSource {
    async fn next_batch(&mut self) -> ShapeResult<ShapeBatch> {
        match self.rx.recv().await {
            Some(next) => next,
            None => std::future::pending().await,
        }
    }
}

/// Chat double replaying scripted deltas; optionally never ends.
pub struct ScriptedChat {
    script: Mutex<Vec<ChatResult<ChatDelta>>>,
    hang_after_script: bool,
    requests: Mutex<Vec<Vec<WireMessage>>>,
}

impl ScriptedChat {
    pub fn new(script: Vec<ChatResult<ChatDelta>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            hang_after_script: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn hanging(script: Vec<ChatResult<ChatDelta>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            hang_after_script: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Vec<WireMessage>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedChat {
    async fn stream_chat(&self, messages: Vec<WireMessage>) -> ChatResult<DeltaStream> {
        self.requests.lock().push(messages);
        let script = std::mem::take(&mut *self.script.lock());
        let replay = stream::iter(script);
        if self.hang_after_script {
            Ok(replay.chain(stream::pending()).boxed())
        } else {
            Ok(replay.boxed())
        }
    }
}

pub fn text(chunk: &str) -> ChatResult<ChatDelta> {
    Ok(ChatDelta::Text(chunk.to_string()))
}

pub fn reasoning(chunk: &str) -> ChatResult<ChatDelta> {
    Ok(ChatDelta::Reasoning(chunk.to_string()))
}

pub type TaskApi = MockWriteApi<Task>;
pub type EntryApi = MockWriteApi<JournalEntry>;
