//! longterm-state: embedded state store for the longterm scheduler.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for tasks, experiments, and machines.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Tasks are keyed by a monotonically increasing `u64` id, so iterating the
//! task table yields creation order and an experiment's last task is the
//! last match of a scan.
//!
//! Multi-record updates go through [`StateStore::write`], which hands a
//! [`StoreTxn`] to a closure and commits only when the closure succeeds.
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is passed explicitly to every component that needs it.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, StoreTxn};
pub use types::*;
