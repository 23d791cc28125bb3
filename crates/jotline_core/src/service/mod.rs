//! Use-case services for the task and journal screens.
//!
//! # Responsibility
//! - Translate screen actions into collection mutations.
//! - Provide the list orderings each screen shows.

pub mod journal_service;
pub mod task_service;

use crate::editor::entry_editor::EditorError;
use crate::model::record::{RecordKey, RecordKeyError};
use crate::sync::mutation::CollectionError;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Service error shared by task and journal use-cases.
#[derive(Debug)]
pub enum ServiceError {
    /// Caller supplied a malformed record key.
    InvalidKey(RecordKeyError),
    /// Target record is not in the collection.
    NotFound(RecordKey),
    Collection(CollectionError),
    Editor(EditorError),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey(err) => write!(f, "invalid record key: {err}"),
            Self::NotFound(key) => write!(f, "record not found: {key}"),
            Self::Collection(err) => write!(f, "{err}"),
            Self::Editor(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidKey(err) => Some(err),
            Self::Collection(err) => Some(err),
            Self::Editor(err) => Some(err),
            Self::NotFound(_) => None,
        }
    }
}

impl From<RecordKeyError> for ServiceError {
    fn from(value: RecordKeyError) -> Self {
        Self::InvalidKey(value)
    }
}

impl From<CollectionError> for ServiceError {
    fn from(value: CollectionError) -> Self {
        match value {
            CollectionError::NotFound(key) => Self::NotFound(key),
            other => Self::Collection(other),
        }
    }
}

impl From<EditorError> for ServiceError {
    fn from(value: EditorError) -> Self {
        match value {
            EditorError::NotFound(key) => Self::NotFound(key),
            other => Self::Editor(other),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
