//! Capacity admission and the booking status machine.
//!
//! The engine holds no lock of its own. Capacity rests on the slot store's
//! version compare-and-swap and duplicates on the booking store's per-user
//! ledger. Every sequence that mutates more than one document runs as a
//! detached task, so a caller that gives up never leaves an increment
//! without either its booking or its compensation.

mod admission;
mod error;
mod transition;

pub use error::BookingError;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use crate::catalog::FacilityCatalog;
use crate::config::Config;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::{BookingStore, SlotStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Bound on each read and on every detached unit, from the caller's view.
    pub store_timeout: Duration,
    pub badminton_quota: usize,
    pub max_cas_retries: u32,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            store_timeout: config.store_timeout,
            badminton_quota: config.badminton_quota,
            max_cas_retries: config.max_cas_retries,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings::from(&Config::default())
    }
}

#[derive(Clone)]
pub struct AdmissionEngine {
    slots: Arc<dyn SlotStore>,
    bookings: Arc<dyn BookingStore>,
    catalog: Arc<FacilityCatalog>,
    notify: Arc<NotifyHub>,
    settings: EngineSettings,
}

impl AdmissionEngine {
    pub fn new(
        slots: Arc<dyn SlotStore>,
        bookings: Arc<dyn BookingStore>,
        catalog: Arc<FacilityCatalog>,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            slots,
            bookings,
            catalog,
            notify,
            settings,
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub async fn find_booking(&self, id: Ulid) -> Result<Booking, BookingError> {
        self.bounded(self.bookings.find_by_id(id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => BookingError::NotFound(id),
                other => BookingError::from_store(other),
            })
    }

    pub async fn find_user_bookings(&self, user_id: &str) -> Result<Vec<Booking>, BookingError> {
        self.bounded(self.bookings.find_by_user(user_id))
            .await
            .map_err(BookingError::from_store)
    }

    /// Run a read under `store_timeout`. Reads are safe to abandon.
    pub(crate) async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.settings.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "store read timed out after {:?}",
                self.settings.store_timeout
            ))),
        }
    }

    /// Spawn `unit` and wait for it under `store_timeout`. The unit keeps
    /// running after a timeout, so its outcome may still commit.
    async fn run_detached<T, F>(&self, unit: F) -> Result<T, BookingError>
    where
        F: Future<Output = Result<T, BookingError>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::spawn(unit);
        match tokio::time::timeout(self.settings.store_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => {
                tracing::error!("booking unit failed: {join}");
                Err(BookingError::Internal(format!("booking unit failed: {join}")))
            }
            Err(_) => Err(BookingError::StoreUnavailable(format!(
                "booking unit timed out after {:?}",
                self.settings.store_timeout
            ))),
        }
    }
}
