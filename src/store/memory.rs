use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::{Predicate, PutOutcome, ReservationStore, StoreError};

/// Process-local store. Also the state layer under [`super::DurableStore`].
pub struct InMemoryStore {
    records: DashMap<Ulid, Reservation>,
    slots: DashMap<String, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    // ── Synchronous primitives ───────────────────────────────
    //
    // Each runs under a single DashMap shard lock and never awaits.

    pub(crate) fn insert_record(&self, reservation: &Reservation) -> PutOutcome {
        match self.records.entry(reservation.id) {
            Entry::Occupied(_) => PutOutcome::AlreadyExists,
            Entry::Vacant(v) => {
                v.insert(reservation.clone());
                PutOutcome::Inserted
            }
        }
    }

    pub(crate) fn claim(&self, slot_key: &str, id: Ulid) -> PutOutcome {
        match self.slots.entry(slot_key.to_string()) {
            Entry::Occupied(_) => PutOutcome::AlreadyExists,
            Entry::Vacant(v) => {
                v.insert(id);
                PutOutcome::Inserted
            }
        }
    }

    pub(crate) fn release(&self, slot_key: &str, holder: Ulid) -> bool {
        self.slots.remove_if(slot_key, |_, id| *id == holder).is_some()
    }

    pub(crate) fn holder(&self, slot_key: &str) -> Option<Ulid> {
        self.slots.get(slot_key).map(|e| *e.value())
    }

    pub(crate) fn get_record(&self, id: &Ulid) -> Option<Reservation> {
        self.records.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn remove_record(&self, id: &Ulid) -> Option<Reservation> {
        self.records.remove(id).map(|(_, r)| r)
    }

    pub(crate) fn matching(&self, predicate: Predicate<'_>) -> Vec<Reservation> {
        self.records
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    pub(crate) fn slot_entries_now(&self) -> Vec<(String, Ulid)> {
        self.slots.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a replayed WAL event.
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::ReservationStored { reservation } => {
                self.records.insert(reservation.id, reservation.clone());
            }
            Event::ReservationRemoved { id } => {
                self.records.remove(id);
            }
            Event::SlotClaimed { slot_key, id } => {
                self.slots.insert(slot_key.clone(), *id);
            }
            Event::SlotReleased { slot_key, id } => {
                self.release(slot_key, *id);
            }
        }
    }

    /// Minimal event list that recreates the current state.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .slots
            .iter()
            .map(|e| Event::SlotClaimed {
                slot_key: e.key().clone(),
                id: *e.value(),
            })
            .collect();
        events.extend(self.records.iter().map(|e| Event::ReservationStored {
            reservation: e.value().clone(),
        }));
        events
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn insert_if_absent(&self, reservation: &Reservation) -> Result<PutOutcome, StoreError> {
        Ok(self.insert_record(reservation))
    }

    async fn claim_slot(&self, slot_key: &str, id: Ulid) -> Result<PutOutcome, StoreError> {
        Ok(self.claim(slot_key, id))
    }

    async fn release_slot(&self, slot_key: &str, holder: Ulid) -> Result<bool, StoreError> {
        Ok(self.release(slot_key, holder))
    }

    async fn slot_holder(&self, slot_key: &str) -> Result<Option<Ulid>, StoreError> {
        Ok(self.holder(slot_key))
    }

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.get_record(&id))
    }

    async fn delete(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.remove_record(&id))
    }

    async fn scan(&self, predicate: Predicate<'_>) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.matching(predicate))
    }

    async fn slot_entries(&self) -> Result<Vec<(String, Ulid)>, StoreError> {
        Ok(self.slot_entries_now())
    }
}
