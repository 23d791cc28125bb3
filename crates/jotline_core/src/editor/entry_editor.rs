//! Journal entry editor with debounced autosave.
//!
//! # Responsibility
//! - Track the title/content being edited against the last saved values.
//! - Schedule one save per quiet period and force a save when editing ends.
//! - Hold the pre-generation snapshot while assistant output streams in.
//!
//! # Invariants
//! - At most one save is in flight per editor. An edit made while a save is
//!   in flight is saved by exactly one follow-up save with the latest values.
//! - Clearing the title never schedules an autosave on its own; ending the
//!   edit saves it. Content edits are autosaved whatever the title is.
//! - Autosave is suspended while a generation is active.
//! - Cancelling a generation restores the snapshot content byte-for-byte;
//!   a title typed meanwhile is kept.

use crate::editor::markdown::{append_html, markdown_to_html};
use crate::model::journal::{JournalEntry, EMPTY_HTML};
use crate::model::record::RecordKey;
use crate::sync::collection::Collection;
use crate::sync::mutation::CollectionError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Quiet period before an edit is saved.
pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(1_000);

/// Autosave tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveConfig {
    pub debounce: Duration,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_SAVE_DEBOUNCE,
        }
    }
}

/// Editor operation errors.
#[derive(Debug)]
pub enum EditorError {
    NotFound(RecordKey),
    /// The editor must be opened inside a tokio runtime.
    NoRuntime,
    GenerationActive,
    NoGeneration,
    Save(CollectionError),
}

impl Display for EditorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "journal entry not found: {key}"),
            Self::NoRuntime => write!(f, "editor requires an async runtime"),
            Self::GenerationActive => write!(f, "a generation is already in progress"),
            Self::NoGeneration => write!(f, "no generation in progress"),
            Self::Save(err) => write!(f, "save failed: {err}"),
        }
    }
}

impl Error for EditorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Save(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CollectionError> for EditorError {
    fn from(value: CollectionError) -> Self {
        Self::Save(value)
    }
}

pub type EditorResult<T> = Result<T, EditorError>;

/// Field values shown by the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorFields {
    pub title: String,
    pub content: Option<String>,
}

impl EditorFields {
    fn from_entry(entry: &JournalEntry) -> Self {
        Self {
            title: entry.title.clone(),
            content: entry.content.clone(),
        }
    }

    pub fn content_or_empty(&self) -> &str {
        self.content.as_deref().unwrap_or(EMPTY_HTML)
    }

    fn differs_from(&self, other: &Self) -> bool {
        self.title != other.title || self.content_or_empty() != other.content_or_empty()
    }
}

struct Generation {
    snapshot: EditorFields,
    base_html: String,
    markdown: String,
}

enum SaveStart {
    Clean,
    Busy,
    Ready(EditorFields),
}

struct EditorState {
    current: EditorFields,
    saved: EditorFields,
    saving: bool,
    follow_up: bool,
    timer: Option<JoinHandle<()>>,
    timer_epoch: u64,
    generation: Option<Generation>,
}

impl EditorState {
    fn is_dirty(&self) -> bool {
        self.current.differs_from(&self.saved)
    }

    fn autosave_allowed(&self) -> bool {
        self.generation.is_none()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn begin_save(&mut self) -> SaveStart {
        if !self.is_dirty() {
            return SaveStart::Clean;
        }
        if self.saving {
            self.follow_up = true;
            return SaveStart::Busy;
        }
        self.saving = true;
        SaveStart::Ready(self.current.clone())
    }
}

struct EditorInner {
    entries: Collection<JournalEntry>,
    key: RecordKey,
    config: SaveConfig,
    runtime: Handle,
    state: Mutex<EditorState>,
    idle: Notify,
}

/// Editing session over one journal entry.
#[derive(Clone)]
pub struct EntryEditor {
    inner: Arc<EditorInner>,
}

impl EntryEditor {
    /// Opens the entry at `key`. Must be called inside a tokio runtime.
    pub fn open(
        entries: Collection<JournalEntry>,
        key: RecordKey,
        config: SaveConfig,
    ) -> EditorResult<Self> {
        let runtime = Handle::try_current().map_err(|_| EditorError::NoRuntime)?;
        let row = entries.get(key).ok_or(EditorError::NotFound(key))?;
        let fields = EditorFields::from_entry(&row.value);
        info!(
            "event=editor_open module=editor status=ok key={} debounce_ms={}",
            row.key,
            config.debounce.as_millis()
        );
        Ok(Self {
            inner: Arc::new(EditorInner {
                entries,
                key,
                config,
                runtime,
                state: Mutex::new(EditorState {
                    current: fields.clone(),
                    saved: fields,
                    saving: false,
                    follow_up: false,
                    timer: None,
                    timer_epoch: 0,
                    generation: None,
                }),
                idle: Notify::new(),
            }),
        })
    }

    /// Key of the entry, resolved to its server id once known.
    pub fn key(&self) -> RecordKey {
        self.inner.entries.resolve(self.inner.key)
    }

    pub fn fields(&self) -> EditorFields {
        self.inner.state.lock().current.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.state.lock().is_dirty()
    }

    pub fn is_saving(&self) -> bool {
        self.inner.state.lock().saving
    }

    pub fn is_generating(&self) -> bool {
        self.inner.state.lock().generation.is_some()
    }

    pub fn set_title(&self, title: impl Into<String>) {
        let title = title.into();
        let mut state = self.inner.state.lock();
        if state.current.title == title {
            return;
        }
        state.current.title = title;
        if state.current.title.trim().is_empty() {
            // Held until the edit ends.
            return;
        }
        self.after_edit(&mut state);
    }

    /// Replaces the content HTML. Rejected while a generation is writing it.
    pub fn set_content(&self, html: impl Into<String>) -> EditorResult<()> {
        let html = html.into();
        let mut state = self.inner.state.lock();
        if state.generation.is_some() {
            return Err(EditorError::GenerationActive);
        }
        if state.current.content.as_deref() == Some(html.as_str()) {
            return Ok(());
        }
        state.current.content = Some(html);
        self.after_edit(&mut state);
        Ok(())
    }

    /// Ends the edit (blur): saves immediately when dirty.
    pub async fn end_editing(&self) -> EditorResult<()> {
        if self.is_generating() {
            return Err(EditorError::GenerationActive);
        }
        self.save_now().await
    }

    /// Saves the current values without waiting for the debounce.
    ///
    /// When a save is already in flight this waits for it and its follow-up.
    pub async fn save_now(&self) -> EditorResult<()> {
        loop {
            let idle = self.inner.idle.notified();
            let start = {
                let mut state = self.inner.state.lock();
                state.cancel_timer();
                state.begin_save()
            };
            match start {
                SaveStart::Clean => return Ok(()),
                SaveStart::Busy => idle.await,
                SaveStart::Ready(fields) => {
                    return run_saves(Arc::clone(&self.inner), fields).await;
                }
            }
        }
    }

    /// Replaces the fields with the collection's row when nothing local is
    /// pending. Returns whether the fields changed.
    pub fn adopt_remote(&self) -> bool {
        let Some(row) = self.inner.entries.get(self.inner.key) else {
            return false;
        };
        let mut state = self.inner.state.lock();
        if state.is_dirty() || state.saving || state.generation.is_some() {
            return false;
        }
        let fields = EditorFields::from_entry(&row.value);
        if fields == state.current {
            return false;
        }
        state.current = fields.clone();
        state.saved = fields;
        true
    }

    /// Captures the current fields and suspends autosave.
    pub fn begin_generation(&self) -> EditorResult<EditorFields> {
        let mut state = self.inner.state.lock();
        if state.generation.is_some() {
            return Err(EditorError::GenerationActive);
        }
        state.cancel_timer();
        let snapshot = state.current.clone();
        state.generation = Some(Generation {
            base_html: snapshot.content_or_empty().to_string(),
            snapshot: snapshot.clone(),
            markdown: String::new(),
        });
        debug!("event=generation_begin module=editor status=ok");
        Ok(snapshot)
    }

    /// Appends one streamed markdown chunk after the snapshot content.
    pub fn append_generated(&self, chunk: &str) -> EditorResult<()> {
        let mut state = self.inner.state.lock();
        let content = {
            let generation = state
                .generation
                .as_mut()
                .ok_or(EditorError::NoGeneration)?;
            generation.markdown.push_str(chunk);
            append_html(
                &generation.base_html,
                &markdown_to_html(&generation.markdown),
            )
        };
        state.current.content = Some(content);
        Ok(())
    }

    /// Keeps the generated content and schedules its save.
    pub fn finish_generation(&self) -> EditorResult<()> {
        let mut state = self.inner.state.lock();
        let generation = state.generation.take().ok_or(EditorError::NoGeneration)?;
        info!(
            "event=generation_finish module=editor status=ok markdown_chars={}",
            generation.markdown.chars().count()
        );
        self.after_edit(&mut state);
        Ok(())
    }

    /// Discards generated content and restores the snapshot content.
    pub fn cancel_generation(&self) -> EditorResult<()> {
        let mut state = self.inner.state.lock();
        let generation = state.generation.take().ok_or(EditorError::NoGeneration)?;
        state.current.content = generation.snapshot.content;
        info!("event=generation_cancel module=editor status=restored");
        self.after_edit(&mut state);
        Ok(())
    }

    /// Restores the snapshot content after the generation stream failed.
    pub fn fail_generation(&self, reason: &dyn Error) -> EditorResult<()> {
        warn!("event=generation_fail module=editor status=error error={reason}");
        self.cancel_generation()
    }

    fn after_edit(&self, state: &mut EditorState) {
        if !state.is_dirty() || !state.autosave_allowed() {
            if state.generation.is_none() {
                state.cancel_timer();
            }
            return;
        }
        schedule_save(&self.inner, state);
    }
}

fn schedule_save(inner: &Arc<EditorInner>, state: &mut EditorState) {
    state.cancel_timer();
    state.timer_epoch += 1;
    let epoch = state.timer_epoch;
    let delay = inner.config.debounce;
    let task_inner = Arc::clone(inner);
    state.timer = Some(inner.runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        let start = {
            let mut state = task_inner.state.lock();
            if state.timer_epoch != epoch {
                return;
            }
            state.timer = None;
            if !state.autosave_allowed() {
                return;
            }
            state.begin_save()
        };
        if let SaveStart::Ready(fields) = start {
            // Failures are logged by the save loop; the editor stays dirty.
            let _ = run_saves(task_inner, fields).await;
        }
    }));
}

async fn run_saves(inner: Arc<EditorInner>, mut fields: EditorFields) -> EditorResult<()> {
    loop {
        let result = push_fields(&inner, &fields).await;
        match &result {
            Ok(()) => debug!(
                "event=editor_save module=editor status=ok key={}",
                inner.entries.resolve(inner.key)
            ),
            Err(err) => warn!(
                "event=editor_save module=editor status=error key={} error={}",
                inner.entries.resolve(inner.key),
                err
            ),
        }

        let next = {
            let mut state = inner.state.lock();
            if result.is_ok() {
                state.saved = fields.clone();
            }
            let follow_up = std::mem::take(&mut state.follow_up);
            if follow_up && state.is_dirty() && state.generation.is_none() {
                Some(state.current.clone())
            } else {
                state.saving = false;
                None
            }
        };

        match next {
            Some(latest) => fields = latest,
            None => {
                inner.idle.notify_waiters();
                return result;
            }
        }
    }
}

async fn push_fields(inner: &EditorInner, fields: &EditorFields) -> EditorResult<()> {
    let title = fields.title.clone();
    let content = fields.content_or_empty().to_string();
    let ticket = inner.entries.update(inner.key, move |entry| {
        entry.title = title;
        entry.content = Some(content);
    })?;
    ticket.confirmed().await?;
    Ok(())
}
