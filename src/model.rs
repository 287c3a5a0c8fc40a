use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_FIELD_LEN;

/// Unix milliseconds.
pub type Ms = i64;

/// Date format accepted on input and used in slot keys.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "confirmed" => Some(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The triple that must be uniquely claimed: (court, day, time unit).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId {
    pub resource_id: String,
    pub date: NaiveDate,
    pub time_slot: String,
}

impl SlotId {
    /// Store key naming this slot.
    ///
    /// The free-text parts are length-prefixed, so no choice of characters in
    /// `resource_id` or `time_slot` can make two distinct slots share a key.
    pub fn key(&self) -> String {
        format!(
            "slot:{}:{}:{}:{}:{}",
            self.resource_id.len(),
            self.resource_id,
            self.date.format(DATE_FORMAT),
            self.time_slot.len(),
            self.time_slot,
        )
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} at {}",
            self.resource_id,
            self.date.format(DATE_FORMAT),
            self.time_slot
        )
    }
}

/// A create request as it arrives from the request layer. Fields are optional
/// so that missing ones can be reported rather than rejected at parse time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationRequest {
    pub resource_id: Option<String>,
    pub date: Option<String>,
    pub time_slot: Option<String>,
    pub owner_id: Option<String>,
}

impl ReservationRequest {
    pub fn new(
        resource_id: impl Into<String>,
        date: impl Into<String>,
        time_slot: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: Some(resource_id.into()),
            date: Some(date.into()),
            time_slot: Some(time_slot.into()),
            owner_id: Some(owner_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn missing(field: &'static str) -> Self {
        Self {
            field,
            reason: "required field is missing or empty".into(),
        }
    }
}

/// One granted booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: String,
    pub date: NaiveDate,
    pub time_slot: String,
    pub owner_id: String,
    pub created_at: Ms,
    pub status: ReservationStatus,
}

impl Reservation {
    /// Build a confirmed reservation from a request.
    ///
    /// Pure: the id and timestamp come from the caller, nothing is read from
    /// the clock or the store.
    pub fn new(id: Ulid, request: &ReservationRequest, created_at: Ms) -> Result<Self, ValidationError> {
        let resource_id = required("resource_id", request.resource_id.as_deref())?;
        let date_raw = required("date", request.date.as_deref())?;
        let time_slot = required("time_slot", request.time_slot.as_deref())?;
        let owner_id = required("owner_id", request.owner_id.as_deref())?;

        let date = NaiveDate::parse_from_str(&date_raw, DATE_FORMAT).map_err(|e| ValidationError {
            field: "date",
            reason: format!("expected YYYY-MM-DD, got {date_raw:?} ({e})"),
        })?;

        Ok(Self {
            id,
            resource_id,
            date,
            time_slot,
            owner_id,
            created_at,
            status: ReservationStatus::Confirmed,
        })
    }

    pub fn slot(&self) -> SlotId {
        SlotId {
            resource_id: self.resource_id.clone(),
            date: self.date,
            time_slot: self.time_slot.clone(),
        }
    }

    pub fn cancelled(mut self) -> Self {
        self.status = ReservationStatus::Cancelled;
        self
    }
}

fn required(field: &'static str, value: Option<&str>) -> Result<String, ValidationError> {
    let value = value.map(str::trim).unwrap_or_default();
    if value.is_empty() {
        return Err(ValidationError::missing(field));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(ValidationError {
            field,
            reason: format!("longer than {MAX_FIELD_LEN} bytes"),
        });
    }
    Ok(value.to_string())
}

/// Optional filter set for listing. Every `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub resource_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub owner_id: Option<String>,
    pub status: Option<ReservationStatus>,
}

impl ReservationFilter {
    pub fn is_empty(&self) -> bool {
        self.resource_id.is_none() && self.date.is_none() && self.owner_id.is_none() && self.status.is_none()
    }

    pub fn matches(&self, r: &Reservation) -> bool {
        self.resource_id.as_ref().is_none_or(|v| *v == r.resource_id)
            && self.date.is_none_or(|d| d == r.date)
            && self.owner_id.as_ref().is_none_or(|v| *v == r.owner_id)
            && self.status.is_none_or(|s| s == r.status)
    }
}

/// Store mutations. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationStored { reservation: Reservation },
    ReservationRemoved { id: Ulid },
    SlotClaimed { slot_key: String, id: Ulid },
    /// Applied only while `id` still holds the slot.
    SlotReleased { slot_key: String, id: Ulid },
}

/// What the service publishes to the notification hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingEvent {
    Confirmed(Reservation),
    Cancelled(Reservation),
}

impl BookingEvent {
    pub fn reservation(&self) -> &Reservation {
        match self {
            BookingEvent::Confirmed(r) | BookingEvent::Cancelled(r) => r,
        }
    }
}
