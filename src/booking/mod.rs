mod error;
mod queries;
mod resolver;

pub use error::BookingError;
pub use resolver::{Admission, Release, SlotResolver};

use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::*;
use crate::reconciler::Reconciler;
use crate::store::ReservationStore;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// Result of a create call that reached a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Reservation),
    /// The slot is already booked. Expected under contention, not an error.
    Conflict { slot: SlotId },
}

/// Create, cancel and list reservations.
///
/// Holds no per-request state and takes no locks: concurrent calls meet only
/// in the store, through [`ReservationStore::claim_slot`].
pub struct ReservationService {
    store: Arc<dyn ReservationStore>,
    resolver: SlotResolver,
    reconciler: Arc<Reconciler>,
    notify: Arc<NotifyHub>,
}

impl ReservationService {
    pub fn new(store: Arc<dyn ReservationStore>, notify: Arc<NotifyHub>) -> Self {
        let reconciler = Arc::new(Reconciler::new(store.clone()));
        Self {
            resolver: SlotResolver::new(store.clone(), reconciler.clone()),
            store,
            reconciler,
            notify,
        }
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    pub async fn create(&self, request: &ReservationRequest) -> Result<CreateOutcome, BookingError> {
        self.create_at(request, now_ms()).await
    }

    /// Create with an explicit `created_at`.
    pub async fn create_at(
        &self,
        request: &ReservationRequest,
        now: Ms,
    ) -> Result<CreateOutcome, BookingError> {
        let reservation = Reservation::new(Ulid::new(), request, now).inspect_err(|e| {
            metrics::counter!(VALIDATION_FAILURES_TOTAL).increment(1);
            debug!("rejected create request: {e}");
        })?;
        let slot = reservation.slot();

        match self.resolver.admit(reservation).await? {
            Admission::Won(reservation) => {
                metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
                info!("reservation {} confirmed for {slot} by {}", reservation.id, reservation.owner_id);
                self.notify.send(&BookingEvent::Confirmed(reservation.clone()));
                Ok(CreateOutcome::Created(reservation))
            }
            Admission::Lost => {
                metrics::counter!(RESERVATIONS_CONFLICTED_TOTAL).increment(1);
                Ok(CreateOutcome::Conflict { slot })
            }
        }
    }

    /// Cancel a reservation and free its slot. Returns the removed record,
    /// marked `Cancelled`.
    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, BookingError> {
        let prior = self
            .store
            .delete(id)
            .await
            .inspect_err(|_| metrics::counter!(STORE_ERRORS_TOTAL, "op" => "delete").increment(1))?
            .ok_or(BookingError::NotFound(id))?;

        let slot = prior.slot();
        match self.resolver.release(&slot, id).await {
            Release::Freed => {}
            Release::NotHeld => debug!("slot {slot} was not held by {id} at cancel"),
            Release::Deferred => info!("cancel of {id} succeeded; slot {slot} cleanup deferred"),
        }

        let cancelled = prior.cancelled();
        metrics::counter!(RESERVATIONS_CANCELLED_TOTAL).increment(1);
        info!("reservation {id} cancelled, {slot} released");
        self.notify.send(&BookingEvent::Cancelled(cancelled.clone()));
        Ok(cancelled)
    }

    pub async fn get(&self, id: Ulid) -> Result<Reservation, BookingError> {
        self.store.get(id).await?.ok_or(BookingError::NotFound(id))
    }
}
