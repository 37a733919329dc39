//! The booking facade that transports and the binary talk to.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use ulid::Ulid;

use crate::catalog::FacilityCatalog;
use crate::config::Config;
use crate::engine::{AdmissionEngine, BookingError, EngineSettings};
use crate::lifecycle::{LifecycleError, LifecycleReport, LifecycleScheduler};
use crate::model::*;
use crate::notify::{BookingNotice, NotifyHub};
use crate::store::{BookingStore, SlotStore, StoreError, WalBookingStore, WalSlotStore};

const PAYMENT_RETRY_ATTEMPTS: u32 = 3;
const PAYMENT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Status change reported by the payment processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentUpdate {
    pub booking_id: Ulid,
    pub new_status: BookingStatus,
}

pub struct BookingService {
    engine: AdmissionEngine,
    lifecycle: Arc<LifecycleScheduler>,
    slots: Arc<dyn SlotStore>,
    bookings: Arc<dyn BookingStore>,
    notify: Arc<NotifyHub>,
    catalog: Arc<FacilityCatalog>,
    payment_retry_base: Duration,
}

impl BookingService {
    /// Open the WAL stores under `config.data_dir` and seed empty facilities.
    pub async fn open(config: &Config, catalog: FacilityCatalog) -> Result<Self, StoreError> {
        let unavailable = |e: std::io::Error| StoreError::Unavailable(e.to_string());
        let slots: Arc<dyn SlotStore> =
            Arc::new(WalSlotStore::open(&config.data_dir).map_err(unavailable)?);
        let bookings: Arc<dyn BookingStore> =
            Arc::new(WalBookingStore::open(&config.data_dir).map_err(unavailable)?);
        let seeded = crate::catalog::seed_slots(&catalog, slots.as_ref()).await?;
        if seeded > 0 {
            info!(slots = seeded, "seeded catalog slots");
        }
        Ok(Self::with_stores(config, catalog, slots, bookings))
    }

    pub fn with_stores(
        config: &Config,
        catalog: FacilityCatalog,
        slots: Arc<dyn SlotStore>,
        bookings: Arc<dyn BookingStore>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let notify = Arc::new(NotifyHub::new());
        let engine = AdmissionEngine::new(
            slots.clone(),
            bookings.clone(),
            catalog.clone(),
            notify.clone(),
            EngineSettings::from(config),
        );
        let lifecycle = Arc::new(LifecycleScheduler::new(
            slots.clone(),
            bookings.clone(),
            catalog.clone(),
            config.timezone,
            config.clear_policy,
            config.store_timeout,
        ));
        Self {
            engine,
            lifecycle,
            slots,
            bookings,
            notify,
            catalog,
            payment_retry_base: Duration::from_millis(PAYMENT_RETRY_BASE_DELAY_MS),
        }
    }

    /// Shorten the payment listener's backoff. Tests only need milliseconds.
    pub fn with_payment_retry_base(mut self, base: Duration) -> Self {
        self.payment_retry_base = base;
        self
    }

    pub async fn create_booking(
        &self,
        user_id: &str,
        facility: &str,
        slot: SlotReference,
    ) -> Result<Booking, BookingError> {
        self.engine.admit(user_id, facility, slot).await
    }

    /// Admit a transport request carrying two optional slot references.
    pub async fn create_booking_from_request(
        &self,
        request: &BookingRequest,
    ) -> Result<Booking, BookingError> {
        let Some(slot) = request.slot_reference() else {
            return Err(BookingError::InvalidRequest(
                "exactly one of slot_id and badminton_slot_id is required".into(),
            ));
        };
        self.create_booking(&request.user_id, &request.facility, slot).await
    }

    pub async fn update_booking_status(
        &self,
        booking_id: Ulid,
        new_status: BookingStatus,
    ) -> Result<Booking, BookingError> {
        self.engine.transition(booking_id, new_status).await
    }

    pub async fn find_booking(&self, booking_id: Ulid) -> Result<Booking, BookingError> {
        self.engine.find_booking(booking_id).await
    }

    pub async fn find_user_bookings(&self, user_id: &str) -> Result<Vec<Booking>, BookingError> {
        self.engine.find_user_bookings(user_id).await
    }

    pub async fn find_archived_booking(&self, booking_id: Ulid) -> Result<ArchivedBooking, BookingError> {
        self.engine
            .bounded(self.bookings.find_archived(booking_id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => BookingError::NotFound(booking_id),
                other => BookingError::from_store(other),
            })
    }

    /// Slots of a facility, for availability views.
    pub async fn list_slots(&self, facility: &str) -> Result<Vec<Slot>, BookingError> {
        self.engine
            .bounded(self.slots.list_by_facility(facility))
            .await
            .map_err(BookingError::from_store)
    }

    pub async fn run_daily_lifecycle(&self) -> Result<LifecycleReport, LifecycleError> {
        self.lifecycle.run_once(now_ms()).await
    }

    pub fn subscribe(&self, facility: &str) -> broadcast::Receiver<BookingNotice> {
        self.notify.subscribe(facility)
    }

    pub fn catalog(&self) -> &FacilityCatalog {
        &self.catalog
    }

    pub fn lifecycle(&self) -> Arc<LifecycleScheduler> {
        self.lifecycle.clone()
    }

    /// Apply payment updates until the sender closes. `StoreUnavailable` is
    /// retried with exponential backoff; anything else drops the update.
    pub fn spawn_payment_listener(
        self: &Arc<Self>,
        mut updates: mpsc::Receiver<PaymentUpdate>,
    ) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                service.apply_payment(update).await;
            }
            info!("payment listener stopped");
        })
    }

    async fn apply_payment(&self, update: PaymentUpdate) {
        let PaymentUpdate { booking_id, new_status } = update;
        for attempt in 0..PAYMENT_RETRY_ATTEMPTS {
            match self.update_booking_status(booking_id, new_status).await {
                Ok(_) => return,
                Err(e) if e.is_retryable() && attempt + 1 < PAYMENT_RETRY_ATTEMPTS => {
                    let delay = self.payment_retry_base * 2u32.pow(attempt);
                    warn!(
                        booking_id = %booking_id,
                        attempt = attempt + 1,
                        "payment update failed, retrying in {delay:?}: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(booking_id = %booking_id, status = %new_status, "payment update dropped: {e}");
                    return;
                }
            }
        }
    }
}
