//! Application sync context.
//!
//! # Responsibility
//! - Own the task and journal entry collections for one app session.
//! - Start and stop the change-feed followers that keep them current.
//!
//! # Invariants
//! - One context means one collection per record kind; every consumer gets a
//!   handle to the same collection.
//! - Dropping the context stops its followers.

use crate::api::client::{ApiError, HttpApiClient, WriteApi};
use crate::config::AppConfig;
use crate::model::journal::JournalEntry;
use crate::model::record::{RecordKind, SyncRecord};
use crate::model::task::Task;
use crate::sync::collection::Collection;
use crate::sync::shape::{ShapeError, ValueParser};
use crate::sync::shape_stream::{HttpShapeStream, ShapeSource};
use log::info;
use parking_lot::Mutex;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum ContextError {
    NoRuntime,
    Api(ApiError),
    Shape(ShapeError),
}

impl Display for ContextError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRuntime => write!(f, "sync requires an async runtime"),
            Self::Api(err) => write!(f, "{err}"),
            Self::Shape(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Api(err) => Some(err),
            Self::Shape(err) => Some(err),
            Self::NoRuntime => None,
        }
    }
}

impl From<ApiError> for ContextError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl From<ShapeError> for ContextError {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

pub struct SyncContext {
    config: AppConfig,
    api: Option<Arc<HttpApiClient>>,
    tasks: Collection<Task>,
    entries: Collection<JournalEntry>,
    shutdown: CancellationToken,
    followers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncContext {
    /// Context writing through the HTTP API at `config.api_base_url`.
    pub fn new(config: AppConfig) -> Self {
        let api = Arc::new(HttpApiClient::new(config.api_base_url.clone()));
        let task_api: Arc<dyn WriteApi<Task>> = api.clone();
        let entry_api: Arc<dyn WriteApi<JournalEntry>> = api.clone();
        let mut context = Self::with_write_apis(config, task_api, entry_api);
        context.api = Some(api);
        context
    }

    /// Context over arbitrary write APIs; feeds are attached with
    /// [`SyncContext::follow_tasks`] and [`SyncContext::follow_entries`].
    pub fn with_write_apis(
        config: AppConfig,
        task_api: Arc<dyn WriteApi<Task>>,
        entry_api: Arc<dyn WriteApi<JournalEntry>>,
    ) -> Self {
        Self {
            config,
            api: None,
            tasks: Collection::new(task_api),
            entries: Collection::new(entry_api),
            shutdown: CancellationToken::new(),
            followers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn tasks(&self) -> &Collection<Task> {
        &self.tasks
    }

    pub fn entries(&self) -> &Collection<JournalEntry> {
        &self.entries
    }

    /// Subscribes both collections to their HTTP change feeds.
    pub fn start_sync(&self) -> Result<(), ContextError> {
        let Some(api) = self.api.as_ref() else {
            return Ok(());
        };
        let task_feed = HttpShapeStream::new(
            api.collection_url(RecordKind::Task)?,
            ValueParser::default(),
        )?;
        let entry_feed = HttpShapeStream::new(
            api.collection_url(RecordKind::JournalEntry)?,
            ValueParser::default(),
        )?;
        self.follow_tasks(task_feed)?;
        self.follow_entries(entry_feed)?;
        info!(
            "event=sync_start module=context status=ok followers={}",
            self.followers.lock().len()
        );
        Ok(())
    }

    pub fn follow_tasks<S: ShapeSource + 'static>(&self, source: S) -> Result<(), ContextError> {
        self.spawn_follower(self.tasks.clone(), source)
    }

    pub fn follow_entries<S: ShapeSource + 'static>(&self, source: S) -> Result<(), ContextError> {
        self.spawn_follower(self.entries.clone(), source)
    }

    /// Waits until both collections have received their initial snapshot.
    pub async fn wait_until_up_to_date(&self) {
        self.tasks.wait_until_up_to_date().await;
        self.entries.wait_until_up_to_date().await;
    }

    /// Stops every follower and waits for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let followers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.followers.lock());
        for follower in followers {
            let _ = follower.await;
        }
        info!("event=sync_stop module=context status=ok");
    }

    fn spawn_follower<T, S>(&self, collection: Collection<T>, source: S) -> Result<(), ContextError>
    where
        T: SyncRecord,
        S: ShapeSource + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| ContextError::NoRuntime)?;
        let cancel = self.shutdown.child_token();
        let follower = runtime.spawn(async move { collection.follow(source, cancel).await });
        self.followers.lock().push(follower);
        Ok(())
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
