//! Record identity, lifecycle phases and the shared record contract.
//!
//! # Responsibility
//! - Provide typed identifiers for server rows (`ServerId`), optimistic
//!   placeholders (`LocalId`) and write transactions (`TxId`).
//! - Normalize textual identifiers coming from UI/FFI callers in one place.
//! - Define the `SyncRecord` contract implemented by every record kind.
//!
//! # Invariants
//! - `ServerId` is always strictly positive.
//! - `RecordKey` text form is `"<server id>"` or `"local-<uuid>"`.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use uuid::Uuid;

const LOCAL_KEY_PREFIX: &str = "local-";

static SERVER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?0*([1-9][0-9]{0,18})$").expect("valid server id regex"));

/// Authoritative identifier assigned by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(i64);

impl ServerId {
    /// Builds a server id, rejecting zero and negative values.
    pub fn new(value: i64) -> Result<Self, RecordKeyError> {
        if value <= 0 {
            return Err(RecordKeyError::NonPositive(value));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated placeholder for a record the server has not acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for LocalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{LOCAL_KEY_PREFIX}{}", self.0)
    }
}

/// Transaction token returned by remote writes and carried by feed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub u64);

impl Display for TxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key used by callers to address one row of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKey {
    Server(ServerId),
    Local(LocalId),
}

impl RecordKey {
    /// Parses the textual key form used across the FFI boundary.
    ///
    /// Accepts surrounding whitespace, a leading `+` and leading zeros for
    /// server ids. Rejects zero, negative and non-numeric values.
    pub fn parse(value: &str) -> Result<Self, RecordKeyError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(RecordKeyError::Empty);
        }

        if let Some(rest) = trimmed.strip_prefix(LOCAL_KEY_PREFIX) {
            return Uuid::parse_str(rest)
                .map(|uuid| Self::Local(LocalId(uuid)))
                .map_err(|_| RecordKeyError::Malformed(trimmed.to_string()));
        }

        if trimmed.starts_with('-') {
            return match trimmed.parse::<i64>() {
                Ok(value) => Err(RecordKeyError::NonPositive(value)),
                Err(_) => Err(RecordKeyError::Malformed(trimmed.to_string())),
            };
        }

        let digits = SERVER_ID_RE
            .captures(trimmed)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str());
        match digits {
            Some(digits) => digits
                .parse::<i64>()
                .map_err(|_| RecordKeyError::Malformed(trimmed.to_string()))
                .and_then(ServerId::new)
                .map(Self::Server),
            None if is_zero_literal(trimmed) => Err(RecordKeyError::NonPositive(0)),
            None => Err(RecordKeyError::Malformed(trimmed.to_string())),
        }
    }

    pub fn server_id(&self) -> Option<ServerId> {
        match self {
            Self::Server(id) => Some(*id),
            Self::Local(_) => None,
        }
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Local(id) => write!(f, "{id}"),
        }
    }
}

impl From<ServerId> for RecordKey {
    fn from(value: ServerId) -> Self {
        Self::Server(value)
    }
}

impl From<LocalId> for RecordKey {
    fn from(value: LocalId) -> Self {
        Self::Local(value)
    }
}

fn is_zero_literal(value: &str) -> bool {
    let digits = value.strip_prefix('+').unwrap_or(value);
    !digits.is_empty() && digits.chars().all(|c| c == '0')
}

/// Identifier parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKeyError {
    Empty,
    NonPositive(i64),
    Malformed(String),
}

impl Display for RecordKeyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "record key must not be empty"),
            Self::NonPositive(value) => write!(f, "record id must be positive, got {value}"),
            Self::Malformed(value) => write!(f, "record key is malformed: `{value}`"),
        }
    }
}

impl Error for RecordKeyError {}

/// Lifecycle phase of one record as seen by the local collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPhase {
    /// Inserted locally, create not yet confirmed by the change feed.
    PendingCreate,
    /// Mirrors remote state, possibly with pending local edits on top.
    Synced,
    /// Deleted locally, delete not yet confirmed by the change feed.
    PendingDelete,
}

/// Record kinds known to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Task,
    JournalEntry,
}

impl RecordKind {
    /// Stable label used in log events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::JournalEntry => "journal_entry",
        }
    }
}

/// Authoritative row as delivered by the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synced<T> {
    pub id: ServerId,
    #[serde(flatten)]
    pub value: T,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Record validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValidationError {
    BlankField(&'static str),
    TooLong { field: &'static str, max_chars: usize },
}

impl Display for RecordValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankField(field) => write!(f, "{field} must not be blank"),
            Self::TooLong { field, max_chars } => {
                write!(f, "{field} exceeds {max_chars} characters")
            }
        }
    }
}

impl Error for RecordValidationError {}

/// Contract implemented by every record kind held in a collection.
///
/// `Patch` is the partial-field payload sent to the update endpoint; fields
/// left as `None` are omitted from the wire body.
pub trait SyncRecord:
    Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    type Patch: Clone + Debug + PartialEq + Send + Sync + Serialize + 'static;

    const KIND: RecordKind;

    /// Returns the changed fields, or `None` when nothing changed.
    fn diff(&self, modified: &Self) -> Option<Self::Patch>;

    fn apply_patch(&mut self, patch: &Self::Patch);

    fn validate(&self) -> Result<(), RecordValidationError>;
}
