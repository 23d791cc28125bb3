//! Journal list and editor use-cases.
//!
//! # Invariants
//! - Lists show entries awaiting their server id first, then the rest by
//!   `updated_at` descending.

use crate::editor::entry_editor::{EntryEditor, SaveConfig};
use crate::model::journal::JournalEntry;
use crate::model::record::{RecordKey, RecordPhase};
use crate::service::ServiceResult;
use crate::sync::collection::{Collection, LiveRow};
use crate::sync::mutation::MutationTicket;
use std::cmp::Reverse;

#[derive(Clone)]
pub struct JournalService {
    entries: Collection<JournalEntry>,
    save: SaveConfig,
}

impl JournalService {
    pub fn new(entries: Collection<JournalEntry>, save: SaveConfig) -> Self {
        Self { entries, save }
    }

    /// Creates an entry with an empty document body.
    pub fn create(&self, title: &str) -> ServiceResult<MutationTicket> {
        Ok(self.entries.insert(JournalEntry::new(title.trim()))?)
    }

    pub fn list(&self) -> Vec<LiveRow<JournalEntry>> {
        let mut rows = self.entries.snapshot().as_ref().clone();
        rows.sort_by_key(|row| (row.phase != RecordPhase::PendingCreate, Reverse(row.updated_at)));
        rows
    }

    /// Most recently updated entry.
    pub fn latest(&self) -> Option<LiveRow<JournalEntry>> {
        self.list().into_iter().next()
    }

    pub fn get(&self, key: RecordKey) -> Option<LiveRow<JournalEntry>> {
        self.entries.get(key)
    }

    /// Resolves a placeholder key to the server key once it is known.
    pub fn resolve(&self, key: RecordKey) -> RecordKey {
        self.entries.resolve(key)
    }

    pub fn remove(&self, key: RecordKey) -> ServiceResult<MutationTicket> {
        Ok(self.entries.delete(key)?)
    }

    /// Opens a debounced editor over the entry. Requires a tokio runtime.
    pub fn open_editor(&self, key: RecordKey) -> ServiceResult<EntryEditor> {
        Ok(EntryEditor::open(self.entries.clone(), key, self.save)?)
    }
}
