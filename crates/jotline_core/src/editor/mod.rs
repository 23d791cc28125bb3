//! Journal entry editing.
//!
//! # Responsibility
//! - Debounced autosave of title/content edits through the entry collection.
//! - Streaming assistant output into entry content as HTML.

pub mod entry_editor;
pub mod markdown;
