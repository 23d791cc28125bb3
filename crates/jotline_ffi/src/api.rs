//! FFI use-case API for Flutter-facing calls.
//!
//! # Responsibility
//! - Expose task list, journal and editor use-cases to Dart via FRB.
//! - Own the tokio runtime the core's confirmation and autosave tasks run on.
//!
//! # Invariants
//! - Exported functions must not panic across the FFI boundary.
//! - Failures are flattened into `ok=false` envelopes with a message.
//! - Optimistic mutations return as soon as the change is visible; remote
//!   confirmation happens in the background.

use jotline_core::config::ENV_API_BASE_URL;
use jotline_core::{
    compose_into_entry, core_version as core_version_inner, init_logging as init_logging_inner,
    ping as ping_inner, AppConfig, ChatBackend, ChatClient, ChatSession, ComposeOutcome,
    EntryEditor, JournalEntry, JournalService, LiveRow, MessagePart, MutationTicket, RecordKey,
    RecordPhase, SendOutcome, ServiceError, SyncContext, TaskService,
};
use log::warn;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

const CHAT_SYSTEM_PROMPT: &str = "You are a friendly assistant inside a journaling app.";

/// Minimal health-check API for FRB smoke integration.
#[flutter_rust_bridge::frb(sync)]
pub fn ping() -> String {
    ping_inner().to_owned()
}

/// Expose core crate version through FFI.
#[flutter_rust_bridge::frb(sync)]
pub fn core_version() -> String {
    core_version_inner().to_owned()
}

/// Initializes Rust core logging once per process.
///
/// Input semantics:
/// - `level`: one of `trace|debug|info|warn|error` (case-insensitive).
/// - `log_dir`: absolute directory path where rolling logs are written.
///
/// # FFI contract
/// - Safe to call repeatedly with the same `level + log_dir`.
/// - Returns empty string on success and error message on failure.
#[flutter_rust_bridge::frb(sync)]
pub fn init_logging(level: String, log_dir: String) -> String {
    match init_logging_inner(level.as_str(), log_dir.as_str()) {
        Ok(()) => String::new(),
        Err(err) => err.to_string(),
    }
}

/// Generic action response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResponse {
    pub ok: bool,
    /// Key of the affected record (`"42"` or `"local-<uuid>"`).
    pub key: Option<String>,
    pub message: String,
}

impl ActionResponse {
    fn success(message: impl Into<String>, key: Option<RecordKey>) -> Self {
        Self {
            ok: true,
            key: key.map(|key| key.to_string()),
            message: message.into(),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            key: None,
            message: message.into(),
        }
    }
}

/// Task row as shown by the list screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskItem {
    pub key: String,
    pub text: String,
    pub completed: bool,
    /// `pending_create|synced|pending_delete`.
    pub phase: String,
    pub updated_at_ms: i64,
}

/// Journal entry row as shown by the list and editor screens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryItem {
    pub key: String,
    pub title: String,
    pub content: String,
    pub phase: String,
    pub updated_at_ms: i64,
}

/// Editor state after an editor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorResponse {
    pub ok: bool,
    pub title: String,
    pub content: String,
    pub dirty: bool,
    pub generating: bool,
    pub message: String,
}

/// Chat reply envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub ok: bool,
    pub reply: String,
    pub reasoning: String,
    pub stopped: bool,
    pub message: String,
}

/// One app session: sync context, open editors and assistant state.
#[flutter_rust_bridge::frb(opaque)]
pub struct JotlineApp {
    runtime: Arc<Runtime>,
    context: Arc<SyncContext>,
    tasks: TaskService,
    journal: JournalService,
    assistant: Option<Arc<ChatClient>>,
    editors: Mutex<HashMap<String, EntryEditor>>,
    chat: Arc<tokio::sync::Mutex<Option<ChatSession>>>,
    chat_cancel: Mutex<Option<CancellationToken>>,
    compose_cancel: Mutex<Option<CancellationToken>>,
}

/// Opens an app session.
///
/// `api_base_url` overrides `JOTLINE_API_BASE_URL`; other settings come
/// from the environment.
#[flutter_rust_bridge::frb(sync)]
pub fn app_open(api_base_url: Option<String>) -> Result<JotlineApp, String> {
    let api_base_url = api_base_url
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty());
    let config = AppConfig::from_lookup(|name| {
        if name == ENV_API_BASE_URL && api_base_url.is_some() {
            return api_base_url.clone();
        }
        std::env::var(name).ok()
    })
    .map_err(|err| err.to_string())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("jotline-core")
        .enable_all()
        .build()
        .map_err(|err| format!("failed to start runtime: {err}"))?;

    let assistant = if config.chat.api_key.is_some() {
        match ChatClient::new(&config.chat) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                warn!("event=chat_init module=ffi status=disabled error={err}");
                None
            }
        }
    } else {
        None
    };
    let chat = assistant.as_ref().map(|client| {
        let backend: Arc<dyn ChatBackend> = client.clone();
        ChatSession::new(backend).with_system_prompt(CHAT_SYSTEM_PROMPT)
    });
    Ok(JotlineApp::assemble(
        runtime,
        SyncContext::new(config),
        assistant,
        chat,
    ))
}

impl JotlineApp {
    fn assemble(
        runtime: Runtime,
        context: SyncContext,
        assistant: Option<Arc<ChatClient>>,
        chat: Option<ChatSession>,
    ) -> Self {
        let save = context.config().save;
        let context = Arc::new(context);
        Self {
            runtime: Arc::new(runtime),
            tasks: TaskService::new(context.tasks().clone()),
            journal: JournalService::new(context.entries().clone(), save),
            context,
            assistant,
            editors: Mutex::new(HashMap::new()),
            chat: Arc::new(tokio::sync::Mutex::new(chat)),
            chat_cancel: Mutex::new(None),
            compose_cancel: Mutex::new(None),
        }
    }

    /// Starts both change feeds.
    #[flutter_rust_bridge::frb(sync)]
    pub fn sync_start(&self) -> ActionResponse {
        let _guard = self.runtime.enter();
        match self.context.start_sync() {
            Ok(()) => ActionResponse::success("Sync started.", None),
            Err(err) => ActionResponse::failure(format!("sync_start failed: {err}")),
        }
    }

    /// Stops the change feeds.
    pub async fn sync_stop(&self) -> ActionResponse {
        let context = Arc::clone(&self.context);
        match self
            .run(async move { context.shutdown().await })
            .await
        {
            Ok(()) => ActionResponse::success("Sync stopped.", None),
            Err(message) => ActionResponse::failure(message),
        }
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn tasks_list(&self) -> Vec<TaskItem> {
        self.tasks
            .list()
            .into_iter()
            .map(|row| TaskItem {
                key: row.key.to_string(),
                text: row.value.text.clone(),
                completed: row.value.completed,
                phase: phase_label(row.phase).to_string(),
                updated_at_ms: row.updated_at.timestamp_millis(),
            })
            .collect()
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn task_add(&self, text: String) -> ActionResponse {
        let _guard = self.runtime.enter();
        match self.tasks.add(&text) {
            Ok(ticket) => ActionResponse::success("Task added.", Some(ticket.key())),
            Err(err) => ActionResponse::failure(format!("task_add failed: {err}")),
        }
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn task_toggle(&self, key: String) -> ActionResponse {
        self.keyed("task_toggle", &key, |key| self.tasks.toggle(key))
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn task_rename(&self, key: String, text: String) -> ActionResponse {
        self.keyed("task_rename", &key, |key| self.tasks.rename(key, &text))
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn task_remove(&self, key: String) -> ActionResponse {
        self.keyed("task_remove", &key, |key| self.tasks.remove(key))
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn entries_list(&self) -> Vec<EntryItem> {
        self.journal.list().iter().map(entry_item).collect()
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn entry_create(&self, title: String) -> ActionResponse {
        let _guard = self.runtime.enter();
        match self.journal.create(&title) {
            Ok(ticket) => ActionResponse::success("Entry created.", Some(ticket.key())),
            Err(err) => ActionResponse::failure(format!("entry_create failed: {err}")),
        }
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn entry_remove(&self, key: String) -> ActionResponse {
        self.forget_editor(&key);
        self.keyed("entry_remove", &key, |key| self.journal.remove(key))
    }

    /// Opens (or reuses) the editor for one entry.
    #[flutter_rust_bridge::frb(sync)]
    pub fn editor_open(&self, key: String) -> EditorResponse {
        match self.editor(&key) {
            Ok(editor) => editor_response(&editor, "Editor opened."),
            Err(message) => editor_failure(message),
        }
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn editor_set_title(&self, key: String, title: String) -> EditorResponse {
        match self.editor(&key) {
            Ok(editor) => {
                editor.set_title(title);
                editor_response(&editor, "Title updated.")
            }
            Err(message) => editor_failure(message),
        }
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn editor_set_content(&self, key: String, html: String) -> EditorResponse {
        match self.editor(&key) {
            Ok(editor) => match editor.set_content(html) {
                Ok(()) => editor_response(&editor, "Content updated."),
                Err(err) => editor_failure(format!("editor_set_content failed: {err}")),
            },
            Err(message) => editor_failure(message),
        }
    }

    /// Blur: saves pending edits immediately.
    pub async fn editor_end_edit(&self, key: String) -> EditorResponse {
        let editor = match self.editor(&key) {
            Ok(editor) => editor,
            Err(message) => return editor_failure(message),
        };
        let saving = editor.clone();
        match self.run(async move { saving.end_editing().await }).await {
            Ok(Ok(())) => editor_response(&editor, "Saved."),
            Ok(Err(err)) => editor_failure(format!("editor_end_edit failed: {err}")),
            Err(message) => editor_failure(message),
        }
    }

    /// Saves pending edits and forgets the editor.
    pub async fn editor_close(&self, key: String) -> ActionResponse {
        let Some(editor) = self.forget_editor(&key) else {
            return ActionResponse::success("Editor not open.", None);
        };
        match self.run(async move { editor.end_editing().await }).await {
            Ok(Ok(())) => ActionResponse::success("Editor closed.", None),
            Ok(Err(err)) => ActionResponse::failure(format!("editor_close failed: {err}")),
            Err(message) => ActionResponse::failure(message),
        }
    }

    /// Streams assistant text for `prompt` into the entry.
    pub async fn editor_compose(&self, key: String, prompt: String) -> EditorResponse {
        let editor = match self.editor(&key) {
            Ok(editor) => editor,
            Err(message) => return editor_failure(message),
        };
        let Some(assistant) = self.assistant.clone() else {
            return editor_failure("editor_compose failed: assistant is not configured");
        };
        let cancel = CancellationToken::new();
        *lock(&self.compose_cancel) = Some(cancel.clone());

        let composing = editor.clone();
        let outcome = self
            .run(async move {
                compose_into_entry(&composing, assistant.as_ref(), &prompt, &cancel)
                    .await
                    .map_err(|err| err.to_string())
            })
            .await;
        lock(&self.compose_cancel).take();

        match outcome {
            Ok(Ok(ComposeOutcome::Finished)) => editor_response(&editor, "Generation finished."),
            Ok(Ok(ComposeOutcome::Cancelled)) => editor_response(&editor, "Generation cancelled."),
            Ok(Err(message)) | Err(message) => {
                editor_failure(format!("editor_compose failed: {message}"))
            }
        }
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn editor_compose_stop(&self) {
        if let Some(cancel) = lock(&self.compose_cancel).take() {
            cancel.cancel();
        }
    }

    /// Sends one chat message and waits for the full reply.
    pub async fn chat_send(&self, text: String) -> ChatResponse {
        let cancel = CancellationToken::new();
        *lock(&self.chat_cancel) = Some(cancel.clone());
        let chat = Arc::clone(&self.chat);

        let outcome = self
            .run(async move {
                let mut guard = chat.lock().await;
                let Some(session) = guard.as_mut() else {
                    return Err("assistant is not configured".to_string());
                };
                let outcome = session
                    .send(&text, &cancel, |_| {})
                    .await
                    .map_err(|err| err.to_string())?;
                let (reply, reasoning) = session
                    .last_reply()
                    .filter(|_| outcome != SendOutcome::Ignored)
                    .map(|message| {
                        let reasoning = message
                            .parts
                            .iter()
                            .filter_map(|part| match part {
                                MessagePart::Reasoning(text) => Some(text.as_str()),
                                MessagePart::Text(_) => None,
                            })
                            .collect::<String>();
                        (message.text(), reasoning)
                    })
                    .unwrap_or_default();
                Ok((outcome, reply, reasoning))
            })
            .await;
        lock(&self.chat_cancel).take();

        match outcome {
            Ok(Ok((outcome, reply, reasoning))) => ChatResponse {
                ok: true,
                reply,
                reasoning,
                stopped: outcome == SendOutcome::Stopped,
                message: match outcome {
                    SendOutcome::Ignored => "Nothing to send.".to_string(),
                    SendOutcome::Completed => "Reply received.".to_string(),
                    SendOutcome::Stopped => "Reply stopped.".to_string(),
                },
            },
            Ok(Err(message)) | Err(message) => ChatResponse {
                ok: false,
                reply: String::new(),
                reasoning: String::new(),
                stopped: false,
                message: format!("chat_send failed: {message}"),
            },
        }
    }

    #[flutter_rust_bridge::frb(sync)]
    pub fn chat_stop(&self) {
        if let Some(cancel) = lock(&self.chat_cancel).take() {
            cancel.cancel();
        }
    }

    fn keyed<F>(&self, operation: &str, raw_key: &str, action: F) -> ActionResponse
    where
        F: FnOnce(RecordKey) -> Result<MutationTicket, ServiceError>,
    {
        let _guard = self.runtime.enter();
        let result = RecordKey::parse(raw_key)
            .map_err(ServiceError::from)
            .and_then(action);
        match result {
            Ok(ticket) => ActionResponse::success("Change applied.", Some(ticket.key())),
            Err(err) => ActionResponse::failure(format!("{operation} failed: {err}")),
        }
    }

    /// Editor for `raw_key`, shared between the placeholder and server keys
    /// of one entry.
    fn editor(&self, raw_key: &str) -> Result<EntryEditor, String> {
        let key = RecordKey::parse(raw_key).map_err(|err| format!("invalid key: {err}"))?;
        let key = self.journal.resolve(key);
        let mut editors = self.lock_editors();
        if let Some(editor) = cached_editor(&mut editors, key) {
            return Ok(editor);
        }
        let _guard = self.runtime.enter();
        let editor = self
            .journal
            .open_editor(key)
            .map_err(|err| format!("editor_open failed: {err}"))?;
        editors.insert(key.to_string(), editor.clone());
        Ok(editor)
    }

    fn forget_editor(&self, raw_key: &str) -> Option<EntryEditor> {
        let key = self.journal.resolve(RecordKey::parse(raw_key).ok()?);
        let mut editors = self.lock_editors();
        cached_editor(&mut editors, key)?;
        editors.remove(&key.to_string())
    }

    fn lock_editors(&self) -> MutexGuard<'_, HashMap<String, EntryEditor>> {
        lock(&self.editors)
    }

    /// Runs `future` on the core runtime and awaits it from any executor.
    async fn run<F>(&self, future: F) -> Result<F::Output, String>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime
            .spawn(future)
            .await
            .map_err(|err| format!("core task failed: {err}"))
    }
}

/// Finds the editor of `key`, moving it from its placeholder slot to the
/// server key slot once the entry's id is known.
fn cached_editor(
    editors: &mut HashMap<String, EntryEditor>,
    key: RecordKey,
) -> Option<EntryEditor> {
    let slot = key.to_string();
    if let Some(editor) = editors.get(&slot) {
        return Some(editor.clone());
    }
    let stale = editors
        .iter()
        .find(|(_, editor)| editor.key() == key)
        .map(|(stale, _)| stale.clone())?;
    let editor = editors.remove(&stale)?;
    editors.insert(slot, editor.clone());
    Some(editor)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn phase_label(phase: RecordPhase) -> &'static str {
    match phase {
        RecordPhase::PendingCreate => "pending_create",
        RecordPhase::Synced => "synced",
        RecordPhase::PendingDelete => "pending_delete",
    }
}

fn entry_item(row: &LiveRow<JournalEntry>) -> EntryItem {
    EntryItem {
        key: row.key.to_string(),
        title: row.value.title.clone(),
        content: row.value.content_or_empty().to_string(),
        phase: phase_label(row.phase).to_string(),
        updated_at_ms: row.updated_at.timestamp_millis(),
    }
}

fn editor_response(editor: &EntryEditor, message: &str) -> EditorResponse {
    let fields = editor.fields();
    EditorResponse {
        ok: true,
        content: fields.content_or_empty().to_string(),
        title: fields.title,
        dirty: editor.is_dirty(),
        generating: editor.is_generating(),
        message: message.to_string(),
    }
}

fn editor_failure(message: impl Into<String>) -> EditorResponse {
    EditorResponse {
        ok: false,
        title: String::new(),
        content: String::new(),
        dirty: false,
        generating: false,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::{app_open, core_version, init_logging, ping, JotlineApp};
    use async_trait::async_trait;
    use jotline_core::{
        ApiError, AppConfig, CreateReceipt, SaveConfig, ServerId, SyncContext, SyncRecord, TxId,
        WriteApi,
    };
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// Acknowledges every write at once with sequential ids.
    struct InstantApi {
        next: AtomicI64,
    }

    #[async_trait]
    impl<T: SyncRecord> WriteApi<T> for InstantApi {
        async fn create(&self, _value: &T) -> Result<CreateReceipt, ApiError> {
            let next = self.next.fetch_add(1, Ordering::SeqCst);
            Ok(CreateReceipt {
                id: ServerId::new(next).expect("positive id"),
                txid: TxId(next as u64),
            })
        }

        async fn update(&self, _id: ServerId, _patch: &T::Patch) -> Result<TxId, ApiError> {
            Ok(TxId(self.next.fetch_add(1, Ordering::SeqCst) as u64))
        }

        async fn delete(&self, _id: ServerId) -> Result<TxId, ApiError> {
            Ok(TxId(self.next.fetch_add(1, Ordering::SeqCst) as u64))
        }
    }

    fn acknowledging_app() -> JotlineApp {
        let api = Arc::new(InstantApi {
            next: AtomicI64::new(1),
        });
        let mut config = AppConfig::default();
        config.save = SaveConfig {
            debounce: Duration::from_secs(60),
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("runtime");
        let context = SyncContext::with_write_apis(config, api.clone(), api);
        JotlineApp::assemble(runtime, context, None, None)
    }

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }

    #[test]
    fn init_logging_rejects_empty_log_dir() {
        let error = init_logging("info".to_string(), String::new());
        assert!(!error.is_empty());
    }

    #[test]
    fn init_logging_rejects_unsupported_level() {
        let error = init_logging("verbose".to_string(), "/tmp/jotline-logs".to_string());
        assert!(error.contains("unsupported"));
    }

    #[test]
    fn app_open_rejects_malformed_base_url() {
        assert!(app_open(Some("not a url".to_string())).is_err());
    }

    #[test]
    fn task_actions_apply_optimistically_and_flatten_errors() {
        let app = app_open(Some("http://127.0.0.1:9".to_string())).expect("app opens");

        let added = app.task_add("Buy milk".to_string());
        assert!(added.ok, "{}", added.message);
        assert!(added.key.as_deref().unwrap_or("").starts_with("local-"));

        let blank = app.task_add("  ".to_string());
        assert!(!blank.ok);

        let bad_key = app.task_toggle("abc".to_string());
        assert!(!bad_key.ok);
        assert!(bad_key.message.contains("invalid record key"));

        let missing = app.task_remove("42".to_string());
        assert!(!missing.ok);
        assert!(missing.message.contains("not found"));
    }

    #[test]
    fn editor_follows_entry_from_placeholder_to_server_key() {
        let app = acknowledging_app();
        let created = app.entry_create("Draft".to_string());
        let local_key = created.key.expect("placeholder key");
        assert!(local_key.starts_with("local-"));

        assert!(app.editor_open(local_key.clone()).ok);
        let edited = app.editor_set_title(local_key.clone(), "Draft one".to_string());
        assert!(edited.dirty);

        let deadline = Instant::now() + Duration::from_secs(2);
        while app.entries_list()[0].key.starts_with("local-") {
            assert!(Instant::now() < deadline, "create was not acknowledged");
            std::thread::sleep(Duration::from_millis(5));
        }
        let server_key = app.entries_list()[0].key.clone();
        assert_eq!(server_key, "1");

        let reopened = app.editor_open(server_key.clone());
        assert!(reopened.ok, "{}", reopened.message);
        assert_eq!(reopened.title, "Draft one");
        assert!(reopened.dirty);
        assert_eq!(app.lock_editors().len(), 1);
        assert!(app.lock_editors().contains_key("1"));

        // Stale placeholder keys keep reaching the same editor.
        assert_eq!(app.editor_open(local_key).title, "Draft one");
        assert_eq!(app.lock_editors().len(), 1);

        assert!(app.entry_remove(server_key).ok);
        assert!(app.lock_editors().is_empty());
    }

    #[test]
    fn editor_compose_without_assistant_leaves_no_stop_token() {
        let app = acknowledging_app();
        let key = app.entry_create("Draft".to_string()).key.expect("key");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let response = runtime.block_on(app.editor_compose(key, "write".to_string()));
        assert!(!response.ok);
        assert!(response.message.contains("not configured"));
        assert!(super::lock(&app.compose_cancel).is_none());
    }

    #[test]
    fn editor_open_reports_unknown_entries() {
        let app = app_open(Some("http://127.0.0.1:9".to_string())).expect("app opens");
        let response = app.editor_open("7".to_string());
        assert!(!response.ok);
        assert!(response.message.contains("not found"));
    }
}
