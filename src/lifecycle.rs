//! Daily maintenance: archive yesterday's bookings, reset slot occupancy,
//! compact the logs. Runs at local midnight.
//!
//! A reset never drops below the seats held by bookings that are still live,
//! so `ClearPolicy::Keep` cannot reopen a seat its booking still occupies.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::calendar::{duration_until_next_midnight, start_of_local_day};
use crate::catalog::FacilityCatalog;
use crate::config::ClearPolicy;
use crate::model::{Ms, now_ms};
use crate::observability::*;
use crate::store::{BookingStore, SlotStore, StoreError, detached};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("a lifecycle run is already in progress")]
    AlreadyRunning,
    #[error("archiving bookings failed: {0}")]
    Archive(StoreError),
    #[error("counting live bookings failed: {0}")]
    Holdings(StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    pub archived: usize,
    /// Facilities whose slots were reset.
    pub reset: Vec<String>,
    /// Facilities whose reset failed.
    pub failed: Vec<String>,
}

pub struct LifecycleScheduler {
    slots: Arc<dyn SlotStore>,
    bookings: Arc<dyn BookingStore>,
    catalog: Arc<FacilityCatalog>,
    timezone: Tz,
    clear_policy: ClearPolicy,
    store_timeout: Duration,
    running: Mutex<()>,
}

impl LifecycleScheduler {
    pub fn new(
        slots: Arc<dyn SlotStore>,
        bookings: Arc<dyn BookingStore>,
        catalog: Arc<FacilityCatalog>,
        timezone: Tz,
        clear_policy: ClearPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            slots,
            bookings,
            catalog,
            timezone,
            clear_policy,
            store_timeout,
            running: Mutex::new(()),
        }
    }

    /// Sleep until each local midnight and run once, until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(timezone = %self.timezone, "lifecycle scheduler started");
        loop {
            let sleep = duration_until_next_midnight(chrono::Utc::now(), self.timezone);
            info!("next lifecycle run in {} minutes", sleep.as_secs() / 60);

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {
                    if let Err(e) = self.run_once(now_ms()).await {
                        warn!("lifecycle run skipped: {e}");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("lifecycle scheduler stopped");
                    return;
                }
            }
        }
    }

    /// One pass: archive, clear, reset, compact. Only one pass runs at a time.
    pub async fn run_once(&self, now: Ms) -> Result<LifecycleReport, LifecycleError> {
        let Ok(_running) = self.running.try_lock() else {
            return Err(LifecycleError::AlreadyRunning);
        };

        let result = self.archive_and_reset(now).await;
        let outcome = match &result {
            Ok(report) if report.failed.is_empty() => "ok",
            Ok(_) => "partial",
            Err(_) => "aborted",
        };
        metrics::counter!(LIFECYCLE_RUNS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn archive_and_reset(&self, now: Ms) -> Result<LifecycleReport, LifecycleError> {
        let cutoff = start_of_local_day(now, self.timezone);
        let mut report = LifecycleReport {
            archived: self.archive_before(cutoff).await?,
            ..LifecycleReport::default()
        };
        info!(archived = report.archived, cutoff, "archived expired bookings");

        if self.clear_policy == ClearPolicy::ArchiveAll {
            let rest = self.archive_before(Ms::MAX).await?;
            info!(archived = rest, "archived remaining live bookings");
            report.archived += rest;
        }
        metrics::counter!(LIFECYCLE_ARCHIVED_TOTAL).increment(report.archived as u64);

        let held = match tokio::time::timeout(self.store_timeout, self.bookings.holding_counts()).await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "store read timed out after {:?}",
                self.store_timeout
            ))),
        }
        .map_err(LifecycleError::Holdings)?;
        let held = Arc::new(held);

        for facility in self.catalog.facilities() {
            let slots = self.slots.clone();
            let name = facility.name.clone();
            let policy = facility.reset_policy();
            let held = held.clone();
            let reset = detached(self.store_timeout, async move {
                slots.reset_all(&name, policy, &held).await
            })
            .await;
            match reset {
                Ok(count) => {
                    metrics::counter!(SLOTS_RESET_TOTAL, "facility" => facility.name.clone())
                        .increment(count as u64);
                    info!(facility = %facility.name, slots = count, "reset slot occupancy");
                    report.reset.push(facility.name.clone());
                }
                Err(e) => {
                    tracing::error!(facility = %facility.name, "slot reset failed: {e}");
                    report.failed.push(facility.name.clone());
                }
            }
        }

        let bookings = self.bookings.clone();
        if let Err(e) = detached(self.store_timeout, async move { bookings.compact().await }).await {
            warn!("booking log compaction failed: {e}");
        }
        let slots = self.slots.clone();
        if let Err(e) = detached(self.store_timeout, async move { slots.compact().await }).await {
            warn!("slot log compaction failed: {e}");
        }
        Ok(report)
    }

    async fn archive_before(&self, cutoff: Ms) -> Result<usize, LifecycleError> {
        let bookings = self.bookings.clone();
        detached(self.store_timeout, async move {
            bookings.move_expired_to_history(cutoff).await
        })
        .await
        .map_err(LifecycleError::Archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::seed_slots;
    use crate::model::*;
    use crate::store::{InsertConstraints, ResetPolicy, WalBookingStore, WalSlotStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use ulid::Ulid;

    const DAY: Ms = 86_400_000;

    struct Fixture {
        scheduler: Arc<LifecycleScheduler>,
        slots: Arc<WalSlotStore>,
        bookings: Arc<WalBookingStore>,
        catalog: Arc<FacilityCatalog>,
    }

    async fn fixture(name: &str, policy: ClearPolicy) -> Fixture {
        fixture_with(name, policy, |s| s as Arc<dyn SlotStore>, Duration::from_secs(10)).await
    }

    async fn fixture_with(
        name: &str,
        policy: ClearPolicy,
        wrap_slots: impl FnOnce(Arc<WalSlotStore>) -> Arc<dyn SlotStore>,
        store_timeout: Duration,
    ) -> Fixture {
        let dir = std::env::temp_dir().join("courtbook_test_lifecycle").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        let slots = Arc::new(WalSlotStore::open(&dir).unwrap());
        let bookings = Arc::new(WalBookingStore::open(&dir).unwrap());
        let catalog = Arc::new(FacilityCatalog::sports_complex());
        seed_slots(&catalog, slots.as_ref()).await.unwrap();
        let scheduler = Arc::new(LifecycleScheduler::new(
            wrap_slots(slots.clone()),
            bookings.clone(),
            catalog.clone(),
            chrono_tz::UTC,
            policy,
            store_timeout,
        ));
        Fixture {
            scheduler,
            slots,
            bookings,
            catalog,
        }
    }

    async fn book(f: &Fixture, facility: &str, created_at: Ms) -> Booking {
        let slot = f.slots.list_by_facility(facility).await.unwrap()[0].clone();
        let reference = if f.catalog.get(facility).unwrap().is_badminton() {
            SlotReference::Badminton(slot.id)
        } else {
            SlotReference::Normal(slot.id)
        };
        let updated = f
            .slots
            .set_occupancy(facility, slot.id, slot.version, slot.current_bookings + 1)
            .await
            .unwrap();
        let booking = Booking::pending(
            Ulid::new().to_string(),
            facility,
            reference,
            updated.snapshot(),
            created_at,
        );
        f.bookings
            .insert(booking.clone(), InsertConstraints::default())
            .await
            .unwrap();
        booking
    }

    async fn first_slot(f: &Fixture, facility: &str) -> Slot {
        f.slots.list_by_facility(facility).await.unwrap()[0].clone()
    }

    #[tokio::test]
    async fn archives_only_previous_days() {
        let f = fixture("keep", ClearPolicy::Keep).await;
        let now = 20_000 * DAY + 3_600_000;
        let old = book(&f, "gym", now - DAY).await;
        let today = book(&f, "gym", now - 60_000).await;

        let report = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(report.archived, 1);
        assert!(report.failed.is_empty());
        assert_eq!(report.reset.len(), 4);

        assert_eq!(f.bookings.find_archived(old.id).await.unwrap().booking, old);
        assert_eq!(f.bookings.find_by_id(old.id).await, Err(StoreError::NotFound));
        assert_eq!(f.bookings.find_by_id(today.id).await.unwrap(), today);
        // The archived seat is freed, the kept one is not.
        assert_eq!(first_slot(&f, "gym").await.current_bookings, 1);
    }

    #[tokio::test]
    async fn archive_all_leaves_no_live_bookings() {
        let f = fixture("archive_all", ClearPolicy::ArchiveAll).await;
        let now = 20_000 * DAY + 3_600_000;
        let old = book(&f, "pool", now - DAY).await;
        let today = book(&f, "pool", now - 60_000).await;

        let report = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(report.archived, 2);
        assert_eq!(f.bookings.live_len(), 0);
        assert!(f.bookings.find_archived(old.id).await.is_ok());
        assert!(f.bookings.find_archived(today.id).await.is_ok());
        assert_eq!(first_slot(&f, "pool").await.current_bookings, 0);
    }

    #[tokio::test]
    async fn archive_all_resets_standard_slots_to_zero() {
        let f = fixture("reset_archive_all", ClearPolicy::ArchiveAll).await;
        let now = 20_000 * DAY;
        book(&f, "gym", now).await;
        book(&f, "badminton", now).await;

        f.scheduler.run_once(now).await.unwrap();

        let gym = f.slots.list_by_facility("gym").await.unwrap();
        assert!(gym.iter().all(|s| s.current_bookings == 0));
        // Below the full threshold, badminton occupancy survives the reset.
        assert_eq!(first_slot(&f, "badminton").await.current_bookings, 1);
    }

    #[tokio::test]
    async fn keep_policy_reset_retains_live_seats() {
        let f = fixture("reset_keep", ClearPolicy::Keep).await;
        let now = 20_000 * DAY;
        let live = book(&f, "gym", now).await;

        f.scheduler.run_once(now).await.unwrap();

        let gym = first_slot(&f, "gym").await;
        assert_eq!(gym.current_bookings, 1);
        assert_eq!(f.bookings.find_by_id(live.id).await.unwrap(), live);
        let rest = f.slots.list_by_facility("gym").await.unwrap();
        assert!(rest[1..].iter().all(|s| s.current_bookings == 0));
    }

    /// Slot store whose resets never finish in time.
    struct StallingResets(Arc<WalSlotStore>);

    #[async_trait]
    impl SlotStore for StallingResets {
        async fn get(&self, facility: &str, slot_id: Ulid) -> Result<Slot, StoreError> {
            self.0.get(facility, slot_id).await
        }
        async fn set_occupancy(&self, facility: &str, slot_id: Ulid, version: u64, current: u32) -> Result<Slot, StoreError> {
            self.0.set_occupancy(facility, slot_id, version, current).await
        }
        async fn list_by_facility(&self, facility: &str) -> Result<Vec<Slot>, StoreError> {
            self.0.list_by_facility(facility).await
        }
        async fn reset_all(
            &self,
            facility: &str,
            policy: ResetPolicy,
            held: &HashMap<Ulid, u32>,
        ) -> Result<usize, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.0.reset_all(facility, policy, held).await
        }
        async fn insert(&self, slot: Slot) -> Result<(), StoreError> {
            self.0.insert(slot).await
        }
    }

    #[tokio::test]
    async fn stalled_resets_are_reported_not_awaited() {
        let f = fixture_with(
            "stalled_reset",
            ClearPolicy::ArchiveAll,
            |s| Arc::new(StallingResets(s)) as Arc<dyn SlotStore>,
            Duration::from_millis(50),
        )
        .await;

        let report = tokio::time::timeout(Duration::from_secs(2), f.scheduler.run_once(now_ms()))
            .await
            .unwrap()
            .unwrap();
        assert!(report.reset.is_empty());
        assert_eq!(report.failed.len(), f.catalog.facilities().len());
    }

    #[tokio::test]
    async fn concurrent_runs_are_rejected() {
        let f = fixture("single_flight", ClearPolicy::Keep).await;
        let _held = f.scheduler.running.lock().await;
        assert_eq!(
            f.scheduler.run_once(now_ms()).await,
            Err(LifecycleError::AlreadyRunning)
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture("shutdown", ClearPolicy::Keep).await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(f.scheduler.clone().run(token.clone()));
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
