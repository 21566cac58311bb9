//! armada-state: versioned ledger for Armada.
//!
//! Backed by [redb](https://docs.rs/redb). Every resource kind (clusters,
//! compute capabilities, nodes, deployment plans, meta instances) lives in a
//! [`Ledger`] that offers the same uniform operations: create, get, list with
//! filters, status update, soft delete, and compare-and-swap.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns, keyed by
//! id, with a second table mapping live names to ids. Each record carries a
//! monotonically increasing `version`; writers must present the version they
//! read, and a stale version is rejected with
//! [`StateError::VersionConflict`].
//!
//! Nested collections are mutated only through their owner's CAS: see
//! [`aggregate`] for the meta-instance mutators and [`plan`] for
//! deployments.
//!
//! The [`StateStore`] is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub mod aggregate;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod operation;
pub mod plan;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use filter::{Filter, VersionRange};
pub use ledger::{Ledger, LedgerRecord};
pub use operation::validate_transition;
pub use store::StateStore;
pub use types::*;
