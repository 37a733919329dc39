use ulid::Ulid;

use crate::model::BookingStatus;
use crate::store::StoreError;

/// Every way a booking operation can fail. Business-rule rejections are
/// ordinary values; only `StoreUnavailable` is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookingError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("user already holds a booking for this slot")]
    DuplicateBooking,
    #[error("booking quota of {limit} reached")]
    QuotaExceeded { limit: usize },
    #[error("slot is full ({max_bookings} bookings)")]
    SlotFull { max_bookings: u32 },
    #[error("slot not found: {0}")]
    SlotNotFound(Ulid),
    #[error("slot is disabled: {0}")]
    SlotDisabled(Ulid),
    #[error("booking not found: {0}")]
    NotFound(Ulid),
    #[error("cannot move booking from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BookingError {
    /// Stable label for metrics and transport status mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::InvalidRequest(_) => "invalid_request",
            BookingError::DuplicateBooking => "duplicate_booking",
            BookingError::QuotaExceeded { .. } => "quota_exceeded",
            BookingError::SlotFull { .. } => "slot_full",
            BookingError::SlotNotFound(_) => "slot_not_found",
            BookingError::SlotDisabled(_) => "slot_disabled",
            BookingError::NotFound(_) => "not_found",
            BookingError::InvalidTransition { .. } => "invalid_transition",
            BookingError::StoreUnavailable(_) => "store_unavailable",
            BookingError::InvariantViolation(_) => "invariant_violation",
            BookingError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::StoreUnavailable(_))
    }

    /// Map a store failure that has no more specific meaning at the call site.
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => BookingError::DuplicateBooking,
            StoreError::QuotaExceeded { limit } => BookingError::QuotaExceeded { limit },
            StoreError::LimitExceeded(what) => BookingError::InvalidRequest(what.to_string()),
            StoreError::Unavailable(reason) => BookingError::StoreUnavailable(reason),
            StoreError::Conflict => BookingError::StoreUnavailable("write contention".into()),
            other => BookingError::Internal(other.to_string()),
        }
    }
}
