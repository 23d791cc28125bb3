//! Remote write API contracts and HTTP implementation.
//!
//! # Responsibility
//! - Define the `WriteApi` seam used by collection confirmation tasks.
//! - Issue create/partial-update/delete requests for tasks and entries.
//!
//! # Invariants
//! - Every successful write returns the transaction id the remote store
//!   committed it under; that id is later observed on the change feed.

pub mod client;
