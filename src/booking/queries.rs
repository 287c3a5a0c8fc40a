use crate::model::*;

use super::{BookingError, ReservationService};

impl ReservationService {
    /// Reservations matching `filter`, ordered by date, time slot, court, then id.
    ///
    /// A full scan of the store; fine at court-booking table sizes.
    pub async fn list(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, BookingError> {
        let predicate = |r: &Reservation| filter.matches(r);
        let mut rows = self.store.scan(&predicate).await?;
        rows.sort_by(|a, b| {
            (a.date, &a.time_slot, &a.resource_id, a.id).cmp(&(b.date, &b.time_slot, &b.resource_id, b.id))
        });
        Ok(rows)
    }
}
