//! Optimistic mutation bookkeeping.
//!
//! Every local mutation is tracked by an explicit state machine:
//!
//! ```text
//! InFlight --(write acknowledged with txid)--> AwaitingFeed{txid}
//!    |                                               |
//!    | write failed: overlay rolled back             | feed message tagged txid
//!    v                                               v
//!  (removed)                                     (removed, authoritative row shows)
//! ```
//!
//! An acknowledgement whose txid was already observed on the feed skips
//! `AwaitingFeed` and is removed immediately.

use crate::api::client::ApiError;
use crate::model::record::{LocalId, RecordKey, RecordValidationError, TxId};
use std::collections::{HashSet, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::sync::oneshot;

/// Maximum number of feed txids remembered for late acknowledgements.
const SEEN_TXID_CAPACITY: usize = 4_096;

/// Process-local mutation sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutationId(pub(crate) u64);

/// Mutation operation label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Reconciliation phase of one optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    /// Confirmation handler has not returned yet.
    InFlight,
    /// Write acknowledged; waiting for the feed to deliver `txid`.
    AwaitingFeed { txid: TxId },
}

/// Successful outcome of a mutation confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationReceipt {
    /// Key of the affected row; server key once the id is known.
    pub key: RecordKey,
    /// `None` when the mutation changed nothing and no write was sent.
    pub txid: Option<TxId>,
}

/// Collection operation errors.
#[derive(Debug)]
pub enum CollectionError {
    Validation(RecordValidationError),
    NotFound(RecordKey),
    /// Remote write failed; the optimistic change was rolled back.
    Api {
        kind: MutationKind,
        source: ApiError,
    },
    /// The pending create this mutation depends on failed.
    DependencyFailed(LocalId),
    /// Mutations need a tokio runtime to run their confirmation task.
    NoRuntime,
    /// Confirmation task ended without reporting an outcome.
    Abandoned,
}

impl Display for CollectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::NotFound(key) => write!(f, "record not found: {key}"),
            Self::Api { kind, source } => {
                write!(f, "{} rolled back: {source}", kind.as_str())
            }
            Self::DependencyFailed(local) => {
                write!(f, "pending create {local} failed; dependent mutation dropped")
            }
            Self::NoRuntime => write!(f, "no async runtime available for confirmation"),
            Self::Abandoned => write!(f, "mutation confirmation was abandoned"),
        }
    }
}

impl Error for CollectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Api { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<RecordValidationError> for CollectionError {
    fn from(value: RecordValidationError) -> Self {
        Self::Validation(value)
    }
}

pub type CollectionResult<T> = Result<T, CollectionError>;

/// Handle returned by every optimistic mutation.
///
/// The local change is already visible when the ticket is returned; awaiting
/// [`MutationTicket::confirmed`] yields the remote outcome.
#[derive(Debug)]
pub struct MutationTicket {
    key: RecordKey,
    outcome: oneshot::Receiver<CollectionResult<MutationReceipt>>,
}

impl MutationTicket {
    pub(crate) fn new(
        key: RecordKey,
        outcome: oneshot::Receiver<CollectionResult<MutationReceipt>>,
    ) -> Self {
        Self { key, outcome }
    }

    /// Ticket for a mutation that needed no remote write.
    pub(crate) fn unchanged(key: RecordKey) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(MutationReceipt { key, txid: None }));
        Self::new(key, rx)
    }

    /// Key the caller used (or the placeholder key for inserts).
    pub fn key(&self) -> RecordKey {
        self.key
    }

    /// Waits for the confirmation handler to finish.
    pub async fn confirmed(self) -> CollectionResult<MutationReceipt> {
        self.outcome.await.unwrap_or(Err(CollectionError::Abandoned))
    }
}

/// Bounded set of txids already delivered by the feed.
#[derive(Debug, Default)]
pub(crate) struct SeenTxIds {
    order: VecDeque<TxId>,
    members: HashSet<TxId>,
}

impl SeenTxIds {
    pub(crate) fn insert(&mut self, txid: TxId) {
        if !self.members.insert(txid) {
            return;
        }
        self.order.push_back(txid);
        while self.order.len() > SEEN_TXID_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    pub(crate) fn contains(&self, txid: TxId) -> bool {
        self.members.contains(&txid)
    }
}

#[cfg(test)]
mod tests {
    use super::{CollectionError, MutationTicket, SeenTxIds, SEEN_TXID_CAPACITY};
    use crate::model::record::{RecordKey, ServerId, TxId};

    #[test]
    fn seen_txids_evicts_oldest() {
        let mut seen = SeenTxIds::default();
        for value in 0..(SEEN_TXID_CAPACITY as u64 + 1) {
            seen.insert(TxId(value));
        }
        assert!(!seen.contains(TxId(0)));
        assert!(seen.contains(TxId(SEEN_TXID_CAPACITY as u64)));
    }

    #[tokio::test]
    async fn unchanged_ticket_resolves_without_txid() {
        let key = RecordKey::Server(ServerId::new(3).unwrap());
        let receipt = MutationTicket::unchanged(key).confirmed().await.unwrap();
        assert_eq!(receipt.key, key);
        assert!(receipt.txid.is_none());
    }

    #[tokio::test]
    async fn dropped_sender_reports_abandoned() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        drop(tx);
        let ticket = MutationTicket::new(RecordKey::Server(ServerId::new(1).unwrap()), rx);
        assert!(matches!(
            ticket.confirmed().await,
            Err(CollectionError::Abandoned)
        ));
    }
}
