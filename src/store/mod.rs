//! Persistence seams for slots and bookings.
//!
//! The engine only talks to the [`SlotStore`] and [`BookingStore`] traits. The
//! capacity invariant relies on two store guarantees:
//!
//! - `SlotStore::set_occupancy` is a compare-and-swap on the slot's `version`;
//! - `BookingStore::insert` checks the duplicate rule and quota atomically per user.
//!
//! Mutating calls must be driven to completion once started: the WAL-backed
//! implementations append before they apply, so a dropped future can leave
//! the log ahead of memory. The engine runs every mutation inside a detached task.

mod bookings;
mod slots;
mod writer;

pub use bookings::WalBookingStore;
pub use slots::WalSlotStore;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Optimistic-concurrency token did not match.
    #[error("version conflict")]
    Conflict,
    #[error("user already holds a booking for this slot")]
    Duplicate,
    #[error("quota of {limit} exceeded")]
    QuotaExceeded { limit: usize },
    #[error("status is {current}")]
    StatusMismatch { current: BookingStatus },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Which of a facility's slots the lifecycle run resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Every slot.
    Unconditional,
    /// Only slots with `current_bookings >= threshold`.
    FullOnly { threshold: u32 },
}

impl ResetPolicy {
    pub fn applies_to(&self, slot: &Slot) -> bool {
        match self {
            ResetPolicy::Unconditional => true,
            ResetPolicy::FullOnly { threshold } => slot.current_bookings >= *threshold,
        }
    }
}

/// Conditions `BookingStore::insert` enforces in the same atomic step as the write.
/// The duplicate rule is always enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertConstraints {
    pub badminton_quota: Option<usize>,
}

#[async_trait]
pub trait SlotStore: Send + Sync {
    async fn get(&self, facility: &str, slot_id: Ulid) -> Result<Slot, StoreError>;

    /// Compare-and-swap the occupancy counter. Fails with `Conflict` when the
    /// slot's version is no longer `expected_version`. Does not check capacity.
    async fn set_occupancy(
        &self,
        facility: &str,
        slot_id: Ulid,
        expected_version: u64,
        current_bookings: u32,
    ) -> Result<Slot, StoreError>;

    /// Unknown facilities yield an empty list.
    async fn list_by_facility(&self, facility: &str) -> Result<Vec<Slot>, StoreError>;

    /// Set every slot selected by `policy` back to the number of live bookings
    /// still holding it (`held`, absent means 0). Returns how many slots changed.
    async fn reset_all(
        &self,
        facility: &str,
        policy: ResetPolicy,
        held: &HashMap<Ulid, u32>,
    ) -> Result<usize, StoreError>;

    async fn insert(&self, slot: Slot) -> Result<(), StoreError>;

    async fn compact(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert(
        &self,
        booking: Booking,
        constraints: InsertConstraints,
    ) -> Result<Ulid, StoreError>;

    async fn find_by_id(&self, id: Ulid) -> Result<Booking, StoreError>;

    /// Live bookings of a user, oldest first.
    async fn find_by_user(&self, user_id: &str) -> Result<Vec<Booking>, StoreError>;

    /// Slot-holding bookings of `user_id` against exactly `slot`.
    async fn count_by_user_and_slot(
        &self,
        user_id: &str,
        slot: SlotReference,
    ) -> Result<usize, StoreError>;

    /// Slot-holding badminton bookings of `user_id`.
    async fn count_badminton_by_user(&self, user_id: &str) -> Result<usize, StoreError>;

    /// Compare-and-swap on status. Fails with `StatusMismatch` carrying the
    /// actual status when it is no longer `expected`.
    async fn update_status(
        &self,
        id: Ulid,
        expected: BookingStatus,
        next: BookingStatus,
        now: Ms,
    ) -> Result<Booking, StoreError>;

    /// Copy every live booking created before `cutoff` into history, then
    /// remove it from the live set. Returns how many moved.
    async fn move_expired_to_history(&self, cutoff: Ms) -> Result<usize, StoreError>;

    /// Slot-holding live bookings per slot id.
    async fn holding_counts(&self) -> Result<HashMap<Ulid, u32>, StoreError>;

    /// Drop every live booking without archiving it.
    async fn delete_all_live(&self) -> Result<usize, StoreError>;

    async fn find_archived(&self, id: Ulid) -> Result<ArchivedBooking, StoreError>;

    async fn compact(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Spawn a store mutation and wait for it at most `timeout`. The mutation
/// runs to completion even when the wait gives up.
pub(crate) async fn detached<T, F>(timeout: Duration, unit: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::spawn(unit)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(StoreError::Unavailable(format!("store task failed: {join}"))),
        Err(_) => Err(StoreError::Unavailable(format!("store call timed out after {timeout:?}"))),
    }
}

/// Reject names that would be unusable as facility keys.
pub(crate) fn sanitize_facility(facility: &str) -> Result<String, StoreError> {
    use crate::limits::MAX_FACILITY_NAME_LEN;
    if facility.len() > MAX_FACILITY_NAME_LEN {
        return Err(StoreError::LimitExceeded("facility name too long"));
    }
    let safe: String = facility
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() || safe != facility {
        return Err(StoreError::LimitExceeded("facility name must be [A-Za-z0-9_-]"));
    }
    Ok(safe)
}
