use tracing::{error, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::BookingNotice;
use crate::observability::STATUS_TRANSITIONS_TOTAL;
use crate::store::StoreError;

use super::{AdmissionEngine, BookingError};

impl AdmissionEngine {
    /// Move a booking to `next`. Setting the current status again is a no-op;
    /// `Failed` and `Canceled` give the seat back.
    pub async fn transition(&self, id: Ulid, next: BookingStatus) -> Result<Booking, BookingError> {
        let booking = self.find_booking(id).await?;
        if booking.status == next {
            return Ok(booking);
        }
        if !booking.status.can_transition_to(next) {
            return Err(BookingError::InvalidTransition {
                from: booking.status,
                to: next,
            });
        }

        let engine = self.clone();
        self.run_detached(async move { engine.transition_unit(booking, next).await })
            .await
    }

    /// Status CAS plus seat release. Runs detached.
    async fn transition_unit(self, booking: Booking, next: BookingStatus) -> Result<Booking, BookingError> {
        let mut expected = booking.status;
        loop {
            match self.bookings.update_status(booking.id, expected, next, now_ms()).await {
                Ok(updated) => {
                    metrics::counter!(STATUS_TRANSITIONS_TOTAL, "to" => next.as_str()).increment(1);
                    info!(booking_id = %updated.id, from = %expected, to = %next, "booking status changed");
                    if next.releases_slot()
                        && let Err(e) = self.release_seat(&updated.facility, updated.slot.slot_id()).await
                    {
                        error!(booking_id = %updated.id, slot = %updated.slot, "seat release failed: {e}");
                    }
                    self.notify.send(BookingNotice::StatusChanged(updated.clone()));
                    return Ok(updated);
                }
                // Another writer got there first.
                Err(StoreError::StatusMismatch { current }) if current == next => {
                    return self.find_booking(booking.id).await;
                }
                Err(StoreError::StatusMismatch { current }) => {
                    if !current.can_transition_to(next) {
                        return Err(BookingError::InvalidTransition { from: current, to: next });
                    }
                    expected = current;
                }
                Err(StoreError::NotFound) => return Err(BookingError::NotFound(booking.id)),
                Err(e) => return Err(BookingError::from_store(e)),
            }
        }
    }
}
