use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::limits::{RELEASE_BACKOFF_MS, RELEASE_RETRIES};
use crate::model::*;
use crate::observability::STORE_ERRORS_TOTAL;
use crate::reconciler::{Reconciler, Repair};
use crate::store::{PutOutcome, ReservationStore, StoreError};

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The slot was free; the reservation is now stored and holds it.
    Won(Reservation),
    /// Another reservation holds the slot. Nothing was written.
    Lost,
}

/// What happened to a slot-index entry on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Freed,
    /// The entry was already gone or held by someone else.
    NotHeld,
    /// The store kept failing; the reconciler owns the cleanup now.
    Deferred,
}

/// Turns a requested slot into an admission decision.
///
/// The decision is the conditional insert on the slot index. There is no
/// preceding read of existing bookings: any number of callers may race here
/// and the store lets exactly one of them insert the entry.
pub struct SlotResolver {
    store: Arc<dyn ReservationStore>,
    reconciler: Arc<Reconciler>,
}

impl SlotResolver {
    pub fn new(store: Arc<dyn ReservationStore>, reconciler: Arc<Reconciler>) -> Self {
        Self { store, reconciler }
    }

    pub async fn admit(&self, reservation: Reservation) -> Result<Admission, StoreError> {
        let slot_key = reservation.slot().key();

        match self.store.claim_slot(&slot_key, reservation.id).await {
            Ok(PutOutcome::Inserted) => {}
            Ok(PutOutcome::AlreadyExists) => {
                debug!("slot {slot_key} already held, rejecting {}", reservation.id);
                return Ok(Admission::Lost);
            }
            Err(e) => {
                metrics::counter!(STORE_ERRORS_TOTAL, "op" => "claim_slot").increment(1);
                return Err(e);
            }
        }

        // The slot is ours; the record write below cannot race on slot identity.
        match self.store.insert_if_absent(&reservation).await {
            Ok(PutOutcome::Inserted) => Ok(Admission::Won(reservation)),
            Ok(PutOutcome::AlreadyExists) => {
                error!("reservation id {} already stored, abandoning claim on {slot_key}", reservation.id);
                self.release_key(slot_key, reservation.id).await;
                Err(StoreError::Corrupt(format!("duplicate reservation id {}", reservation.id)))
            }
            Err(e) => {
                metrics::counter!(STORE_ERRORS_TOTAL, "op" => "insert_record").increment(1);
                // The write may still have landed; let the reconciler look
                // before freeing the slot.
                self.reconciler.schedule(slot_key, reservation.id, Repair::Verify);
                Err(e)
            }
        }
    }

    /// Free `slot` if `holder` still owns it, retrying with backoff and
    /// handing the entry to the reconciler if the store keeps failing.
    pub async fn release(&self, slot: &SlotId, holder: Ulid) -> Release {
        self.release_key(slot.key(), holder).await
    }

    async fn release_key(&self, slot_key: String, holder: Ulid) -> Release {
        let mut delay = Duration::from_millis(RELEASE_BACKOFF_MS);
        for attempt in 0..=RELEASE_RETRIES {
            match self.store.release_slot(&slot_key, holder).await {
                Ok(true) => return Release::Freed,
                Ok(false) => return Release::NotHeld,
                Err(e) => {
                    metrics::counter!(STORE_ERRORS_TOTAL, "op" => "release_slot").increment(1);
                    warn!("release of {slot_key} failed (attempt {}): {e}", attempt + 1);
                }
            }
            if attempt < RELEASE_RETRIES {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        error!("slot {slot_key} could not be released; flagged for reconciliation");
        self.reconciler.schedule(slot_key, holder, Repair::Release);
        Release::Deferred
    }
}
