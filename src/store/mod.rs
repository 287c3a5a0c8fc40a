//! Reservation persistence.
//!
//! Two keyspaces live behind one [`ReservationStore`]:
//! - records, keyed by reservation id;
//! - the slot index, keyed by slot key and holding the id of the reservation
//!   that currently owns the slot.
//!
//! `claim_slot` is the only synchronization primitive the booking layer uses.
//! Every backend must make it atomic: between "absent" and "present" for a
//! given key there is no observable intermediate state.

mod durable;
mod memory;
mod redis_kv;

pub use durable::{run_compactor, DurableStore};
pub use memory::InMemoryStore;
pub use redis_kv::RedisStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::Reservation;

/// Result of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    AlreadyExists,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Predicate<'a> = &'a (dyn Fn(&Reservation) -> bool + Send + Sync);

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Insert a record under its id unless one already exists.
    async fn insert_if_absent(&self, reservation: &Reservation) -> Result<PutOutcome, StoreError>;

    /// Point `slot_key` at `id` unless the slot is already held.
    async fn claim_slot(&self, slot_key: &str, id: Ulid) -> Result<PutOutcome, StoreError>;

    /// Remove the slot entry, but only while it is still held by `holder`.
    /// Returns whether an entry was removed.
    async fn release_slot(&self, slot_key: &str, holder: Ulid) -> Result<bool, StoreError>;

    async fn slot_holder(&self, slot_key: &str) -> Result<Option<Ulid>, StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// Remove and return the record.
    async fn delete(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// Every record matching `predicate`, unordered. Cost is O(total records).
    async fn scan(&self, predicate: Predicate<'_>) -> Result<Vec<Reservation>, StoreError>;

    /// Every slot-index entry as `(slot_key, holder)`, unordered.
    async fn slot_entries(&self) -> Result<Vec<(String, Ulid)>, StoreError>;
}
