use ulid::Ulid;

use crate::model::ValidationError;
use crate::store::StoreError;

/// Failures of a booking operation. Losing a slot is not one of them: see
/// [`super::CreateOutcome::Conflict`].
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("reservation not found: {0}")]
    NotFound(Ulid),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}
