use std::time::Instant;

use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::MAX_USER_ID_LEN;
use crate::model::*;
use crate::notify::BookingNotice;
use crate::observability::*;
use crate::store::{InsertConstraints, StoreError};

use super::{AdmissionEngine, BookingError};

impl AdmissionEngine {
    /// Admit `user_id` into a slot: duplicate, quota and capacity checks in
    /// that order, then increment and insert. A rejection has no side effect.
    pub async fn admit(
        &self,
        user_id: &str,
        facility: &str,
        slot: SlotReference,
    ) -> Result<Booking, BookingError> {
        let started = Instant::now();
        let result = self.try_admit(user_id, facility, slot).await;
        metrics::histogram!(ADMISSION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(booking) => {
                metrics::counter!(BOOKINGS_ADMITTED_TOTAL, "facility" => facility.to_string())
                    .increment(1);
                info!(
                    booking_id = %booking.id,
                    user_id,
                    facility,
                    %slot,
                    current = booking.occupancy.current_bookings,
                    max = booking.occupancy.max_bookings,
                    "booking admitted"
                );
            }
            Err(e) => {
                metrics::counter!(BOOKINGS_REJECTED_TOTAL, "reason" => e.kind()).increment(1);
                debug!(user_id, facility, %slot, reason = e.kind(), "booking rejected: {e}");
            }
        }
        result
    }

    async fn try_admit(
        &self,
        user_id: &str,
        facility: &str,
        slot: SlotReference,
    ) -> Result<Booking, BookingError> {
        if user_id.is_empty() || user_id.len() > MAX_USER_ID_LEN {
            return Err(BookingError::InvalidRequest(format!(
                "user_id must be 1 to {MAX_USER_ID_LEN} bytes"
            )));
        }
        let Some(entry) = self.catalog.get(facility) else {
            return Err(BookingError::InvalidRequest(format!("unknown facility {facility:?}")));
        };
        if entry.is_badminton() != slot.is_badminton() {
            let msg = if slot.is_badminton() {
                format!("{facility} does not take badminton slot references")
            } else {
                format!("{facility} requires a badminton slot reference")
            };
            return Err(BookingError::InvalidRequest(msg));
        }

        let held = self
            .bounded(self.bookings.count_by_user_and_slot(user_id, slot))
            .await
            .map_err(BookingError::from_store)?;
        if held > 0 {
            return Err(BookingError::DuplicateBooking);
        }

        let quota = if slot.is_badminton() {
            let limit = self.settings.badminton_quota;
            let held = self
                .bounded(self.bookings.count_badminton_by_user(user_id))
                .await
                .map_err(BookingError::from_store)?;
            if held >= limit {
                return Err(BookingError::QuotaExceeded { limit });
            }
            Some(limit)
        } else {
            None
        };

        let engine = self.clone();
        let user_id = user_id.to_string();
        let facility = facility.to_string();
        self.run_detached(async move { engine.admission_unit(user_id, facility, slot, quota).await })
            .await
    }

    /// Increment, insert, and compensate on a failed insert. Runs detached.
    async fn admission_unit(
        self,
        user_id: String,
        facility: String,
        slot: SlotReference,
        quota: Option<usize>,
    ) -> Result<Booking, BookingError> {
        let seat = self.reserve_seat(&facility, slot.slot_id()).await?;
        let booking = Booking::pending(user_id.as_str(), facility.as_str(), slot, seat.snapshot(), now_ms());
        let constraints = InsertConstraints { badminton_quota: quota };

        match self.bookings.insert(booking.clone(), constraints).await {
            Ok(_) => {
                self.notify.send(BookingNotice::Created(booking.clone()));
                Ok(booking)
            }
            Err(e) => {
                metrics::counter!(COMPENSATIONS_TOTAL).increment(1);
                match self.release_seat(&facility, slot.slot_id()).await {
                    Ok(()) => debug!(user_id, facility, %slot, "released seat after failed insert: {e}"),
                    Err(release) => error!(
                        user_id,
                        facility,
                        %slot,
                        "compensating release failed after insert error ({e}): {release}"
                    ),
                }
                Err(BookingError::from_store(e))
            }
        }
    }

    /// Take one seat with a version CAS, re-reading on every lost race.
    async fn reserve_seat(&self, facility: &str, slot_id: Ulid) -> Result<Slot, BookingError> {
        for _ in 0..=self.settings.max_cas_retries {
            let slot = self.load_slot(facility, slot_id).await?;
            check_capacity(&slot)?;
            match self
                .slots
                .set_occupancy(facility, slot_id, slot.version, slot.current_bookings + 1)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(StoreError::Conflict) => {
                    metrics::counter!(OCCUPANCY_CAS_RETRIES_TOTAL).increment(1);
                }
                Err(StoreError::NotFound) => return Err(BookingError::SlotNotFound(slot_id)),
                Err(e) => return Err(BookingError::from_store(e)),
            }
        }
        Err(BookingError::StoreUnavailable(format!(
            "occupancy contention on slot {slot_id}"
        )))
    }

    /// Give one seat back. Floored at zero; at zero nothing is written.
    pub(crate) async fn release_seat(&self, facility: &str, slot_id: Ulid) -> Result<(), BookingError> {
        for _ in 0..=self.settings.max_cas_retries {
            let slot = self.load_slot(facility, slot_id).await?;
            if slot.current_bookings == 0 {
                return Ok(());
            }
            if !slot.occupancy_in_range() {
                error!(
                    facility,
                    slot_id = %slot_id,
                    current = slot.current_bookings,
                    max = slot.max_bookings,
                    "slot over capacity during release"
                );
            }
            match self
                .slots
                .set_occupancy(facility, slot_id, slot.version, slot.current_bookings - 1)
                .await
            {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict) => {
                    metrics::counter!(OCCUPANCY_CAS_RETRIES_TOTAL).increment(1);
                }
                Err(StoreError::NotFound) => return Err(BookingError::SlotNotFound(slot_id)),
                Err(e) => return Err(BookingError::from_store(e)),
            }
        }
        Err(BookingError::StoreUnavailable(format!(
            "occupancy contention on slot {slot_id}"
        )))
    }

    async fn load_slot(&self, facility: &str, slot_id: Ulid) -> Result<Slot, BookingError> {
        self.bounded(self.slots.get(facility, slot_id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => BookingError::SlotNotFound(slot_id),
                other => BookingError::from_store(other),
            })
    }
}

fn check_capacity(slot: &Slot) -> Result<(), BookingError> {
    if slot.status == SlotStatus::Disabled {
        return Err(BookingError::SlotDisabled(slot.id));
    }
    if !slot.occupancy_in_range() {
        error!(
            facility = %slot.facility,
            slot_id = %slot.id,
            current = slot.current_bookings,
            max = slot.max_bookings,
            "slot over capacity"
        );
        return Err(BookingError::InvariantViolation(format!(
            "slot {} holds {} of {}",
            slot.id, slot.current_bookings, slot.max_bookings
        )));
    }
    if slot.is_full() {
        return Err(BookingError::SlotFull {
            max_bookings: slot.max_bookings,
        });
    }
    Ok(())
}
