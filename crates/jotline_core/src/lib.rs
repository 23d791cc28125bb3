//! Core of the Jotline journal and task app.
//! Local-first collections kept in sync with the remote store, plus the
//! entry editor and assistant features built on them.

pub mod api;
pub mod chat;
pub mod config;
pub mod context;
pub mod editor;
pub mod logging;
pub mod model;
pub mod service;
pub mod sync;

pub use api::client::{ApiError, CreateReceipt, HttpApiClient, WriteApi};
pub use chat::compose::{compose_into_entry, ComposeOutcome};
pub use chat::session::{ChatMessage, ChatSession, MessagePart, SendOutcome};
pub use chat::stream::{ChatBackend, ChatClient, ChatDelta, ChatError, ChatRole, WireMessage};
pub use config::{AppConfig, ChatSettings, ConfigError};
pub use context::{ContextError, SyncContext};
pub use editor::entry_editor::{EditorError, EditorFields, EntryEditor, SaveConfig};
pub use editor::markdown::markdown_to_html;
pub use logging::{init_logging, logging_status, LogLevel, LoggingError};
pub use model::journal::{JournalEntry, JournalEntryPatch, EMPTY_HTML};
pub use model::record::{
    LocalId, RecordKey, RecordKeyError, RecordKind, RecordPhase, RecordValidationError, ServerId,
    SyncRecord, Synced, TxId,
};
pub use model::task::{Task, TaskPatch};
pub use service::journal_service::JournalService;
pub use service::task_service::TaskService;
pub use service::{ServiceError, ServiceResult};
pub use sync::collection::{ApplyReport, Collection, LiveRow, Snapshot};
pub use sync::mutation::{CollectionError, CollectionResult, MutationReceipt, MutationTicket};
pub use sync::shape::{ShapeBatch, ShapeError, ShapeMessage, ShapeOperation};
pub use sync::shape_stream::{HttpShapeStream, ShapeSource};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
