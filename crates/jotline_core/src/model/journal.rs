//! Journal entry record.
//!
//! `content` is editor HTML and is nullable on the wire; a missing value is
//! rendered by the editor as [`EMPTY_HTML`].

use crate::model::record::{RecordKind, RecordValidationError, SyncRecord};
use serde::{Deserialize, Serialize};

/// Editor representation of an empty document.
pub const EMPTY_HTML: &str = "<p></p>";

const ENTRY_TITLE_MAX_CHARS: usize = 500;

/// Business fields of one journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl JournalEntry {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: Some(EMPTY_HTML.to_string()),
        }
    }

    /// Content as shown by the editor.
    pub fn content_or_empty(&self) -> &str {
        self.content.as_deref().unwrap_or(EMPTY_HTML)
    }
}

/// Changed entry fields for the partial update endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl SyncRecord for JournalEntry {
    type Patch = JournalEntryPatch;

    const KIND: RecordKind = RecordKind::JournalEntry;

    fn diff(&self, modified: &Self) -> Option<JournalEntryPatch> {
        let content = if self.content_or_empty() != modified.content_or_empty() {
            Some(modified.content_or_empty().to_string())
        } else {
            None
        };
        let patch = JournalEntryPatch {
            title: (self.title != modified.title).then(|| modified.title.clone()),
            content,
        };
        if patch == JournalEntryPatch::default() {
            None
        } else {
            Some(patch)
        }
    }

    fn apply_patch(&mut self, patch: &JournalEntryPatch) {
        if let Some(title) = patch.title.as_ref() {
            self.title = title.clone();
        }
        if let Some(content) = patch.content.as_ref() {
            self.content = Some(content.clone());
        }
    }

    fn validate(&self) -> Result<(), RecordValidationError> {
        if self.title.chars().count() > ENTRY_TITLE_MAX_CHARS {
            return Err(RecordValidationError::TooLong {
                field: "title",
                max_chars: ENTRY_TITLE_MAX_CHARS,
            });
        }
        Ok(())
    }
}
