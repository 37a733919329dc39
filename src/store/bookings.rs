use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::writer::WalWriter;
use super::{BookingStore, InsertConstraints, StoreError};

/// Ids of one user's live bookings. Every mutation of a user's bookings
/// happens while holding this ledger's lock.
type Ledger = Arc<Mutex<Vec<Ulid>>>;

/// Booking store backed by two logs under `data_dir`:
/// `bookings.wal` (live set) and `history.wal` (append-only archive).
pub struct WalBookingStore {
    live: DashMap<Ulid, Booking>,
    ledgers: DashMap<String, Ledger>,
    history: DashMap<Ulid, ArchivedBooking>,
    live_log: WalWriter<BookingRecord>,
    history_log: WalWriter<ArchivedBooking>,
    /// Held shared by inserts and status changes, exclusively by
    /// archive, clear and compact passes.
    maintenance: RwLock<()>,
}

impl WalBookingStore {
    pub fn open(data_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let (live_log, live_records) = WalWriter::open(&data_dir.join("bookings.wal"))?;
        let (history_log, archived) = WalWriter::open(&data_dir.join("history.wal"))?;

        let store = Self {
            live: DashMap::new(),
            ledgers: DashMap::new(),
            history: DashMap::new(),
            live_log,
            history_log,
            maintenance: RwLock::new(()),
        };

        // Write-once: a record re-archived after a crash between copy and delete keeps the first copy.
        for record in archived {
            store.history.entry(record.booking.id).or_insert(record);
        }
        for record in live_records {
            store.replay(record);
        }
        // A booking copied to history whose removal never reached the live log
        // is still live; it is archived again on the next lifecycle run.
        for entry in store.live.iter() {
            store
                .ledger_handle(&entry.user_id)
                .try_lock()
                .map_err(|_| io::Error::other("replay: contended ledger"))?
                .push(*entry.key());
        }
        info!(
            live = store.live.len(),
            archived = store.history.len(),
            "loaded booking store"
        );
        Ok(store)
    }

    fn replay(&self, record: BookingRecord) {
        match record {
            BookingRecord::Inserted(booking) => {
                self.live.insert(booking.id, booking);
            }
            BookingRecord::StatusChanged { id, status, updated_at } => {
                if let Some(mut b) = self.live.get_mut(&id) {
                    b.status = status;
                    b.updated_at = updated_at;
                }
            }
            BookingRecord::Removed { id } => {
                self.live.remove(&id);
            }
            BookingRecord::Cleared => self.live.clear(),
        }
    }

    fn ledger_handle(&self, user_id: &str) -> Ledger {
        if let Some(l) = self.ledgers.get(user_id) {
            return l.value().clone();
        }
        self.ledgers
            .entry(user_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn live_clone(&self, id: &Ulid) -> Option<Booking> {
        self.live.get(id).map(|e| e.value().clone())
    }

    fn count_where(&self, ledger: &[Ulid], pred: impl Fn(&Booking) -> bool) -> usize {
        ledger
            .iter()
            .filter(|id| self.live.get(*id).is_some_and(|b| b.holds_slot() && pred(&b)))
            .count()
    }

    /// Lock the ledgers of `users` in sorted order.
    async fn lock_ledgers(&self, mut users: Vec<String>) -> Vec<(String, OwnedMutexGuard<Vec<Ulid>>)> {
        users.sort();
        users.dedup();
        let mut guards = Vec::with_capacity(users.len());
        for user in users {
            let guard = self.ledger_handle(&user).lock_owned().await;
            guards.push((user, guard));
        }
        guards
    }

    /// Copy-then-delete for every live booking matching `pred`, atomically with
    /// respect to inserts and status changes of the affected users. Callers hold
    /// `maintenance` exclusively, so no insert can be waiting on a ledger that
    /// becomes empty and is dropped here.
    async fn archive_where(&self, pred: impl Fn(&Booking) -> bool) -> Result<usize, StoreError> {
        let users: Vec<String> = self
            .live
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.user_id.clone())
            .collect();
        if users.is_empty() {
            return Ok(0);
        }
        let mut guards = self.lock_ledgers(users).await;

        // Re-read under the locks; statuses may have moved since the scan.
        let mut moving = Vec::new();
        for (_, ledger) in &guards {
            for id in ledger.iter() {
                if let Some(b) = self.live_clone(id)
                    && pred(&b)
                {
                    moving.push(b);
                }
            }
        }
        if moving.is_empty() {
            return Ok(0);
        }

        let archived_at = now_ms();
        let copies: Vec<ArchivedBooking> = moving
            .iter()
            .map(|b| ArchivedBooking { booking: b.clone(), archived_at })
            .collect();
        self.history_log.append_all(copies.clone()).await?;
        for copy in copies {
            self.history.entry(copy.booking.id).or_insert(copy);
        }

        let removals = moving
            .iter()
            .map(|b| BookingRecord::Removed { id: b.id })
            .collect();
        self.live_log.append_all(removals).await?;
        for b in &moving {
            self.live.remove(&b.id);
        }
        for (user, ledger) in guards.iter_mut() {
            ledger.retain(|id| self.live.contains_key(id));
            if ledger.is_empty() {
                self.ledgers.remove(user.as_str());
            }
        }
        Ok(moving.len())
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[async_trait]
impl BookingStore for WalBookingStore {
    async fn insert(
        &self,
        booking: Booking,
        constraints: InsertConstraints,
    ) -> Result<Ulid, StoreError> {
        let _shared = self.maintenance.read().await;
        let ledger = self.ledger_handle(&booking.user_id);
        let mut ledger = ledger.lock().await;

        if self.count_where(&ledger, |b| b.slot == booking.slot) > 0 {
            return Err(StoreError::Duplicate);
        }
        if let Some(limit) = constraints.badminton_quota
            && booking.slot.is_badminton()
            && self.count_where(&ledger, |b| b.slot.is_badminton()) >= limit
        {
            return Err(StoreError::QuotaExceeded { limit });
        }
        if self.live.contains_key(&booking.id) {
            return Err(StoreError::AlreadyExists(booking.id));
        }

        self.live_log.append(BookingRecord::Inserted(booking.clone())).await?;
        let id = booking.id;
        self.live.insert(id, booking);
        ledger.push(id);
        Ok(id)
    }

    async fn find_by_id(&self, id: Ulid) -> Result<Booking, StoreError> {
        self.live_clone(&id).ok_or(StoreError::NotFound)
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<Booking>, StoreError> {
        let Some(ledger) = self.ledgers.get(user_id).map(|l| l.value().clone()) else {
            return Ok(Vec::new());
        };
        let ledger = ledger.lock().await;
        let mut bookings: Vec<Booking> = ledger.iter().filter_map(|id| self.live_clone(id)).collect();
        bookings.sort_by_key(|b| (b.created_at, b.id));
        Ok(bookings)
    }

    async fn count_by_user_and_slot(
        &self,
        user_id: &str,
        slot: SlotReference,
    ) -> Result<usize, StoreError> {
        let Some(ledger) = self.ledgers.get(user_id).map(|l| l.value().clone()) else {
            return Ok(0);
        };
        let ledger = ledger.lock().await;
        Ok(self.count_where(&ledger, |b| b.slot == slot))
    }

    async fn count_badminton_by_user(&self, user_id: &str) -> Result<usize, StoreError> {
        let Some(ledger) = self.ledgers.get(user_id).map(|l| l.value().clone()) else {
            return Ok(0);
        };
        let ledger = ledger.lock().await;
        Ok(self.count_where(&ledger, |b| b.slot.is_badminton()))
    }

    async fn update_status(
        &self,
        id: Ulid,
        expected: BookingStatus,
        next: BookingStatus,
        now: Ms,
    ) -> Result<Booking, StoreError> {
        let _shared = self.maintenance.read().await;
        let user_id = self.live_clone(&id).ok_or(StoreError::NotFound)?.user_id;
        let _ledger = self.ledger_handle(&user_id).lock_owned().await;

        // Archived between the lookup and the lock.
        let mut booking = self.live_clone(&id).ok_or(StoreError::NotFound)?;
        if booking.status != expected {
            return Err(StoreError::StatusMismatch { current: booking.status });
        }
        self.live_log
            .append(BookingRecord::StatusChanged { id, status: next, updated_at: now })
            .await?;
        booking.status = next;
        booking.updated_at = now;
        self.live.insert(id, booking.clone());
        Ok(booking)
    }

    async fn holding_counts(&self) -> Result<HashMap<Ulid, u32>, StoreError> {
        let mut held: HashMap<Ulid, u32> = HashMap::new();
        for entry in self.live.iter().filter(|e| e.holds_slot()) {
            *held.entry(entry.slot.slot_id()).or_default() += 1;
        }
        Ok(held)
    }

    async fn move_expired_to_history(&self, cutoff: Ms) -> Result<usize, StoreError> {
        let _exclusive = self.maintenance.write().await;
        self.archive_where(|b| b.created_at < cutoff).await
    }

    async fn delete_all_live(&self) -> Result<usize, StoreError> {
        let _exclusive = self.maintenance.write().await;
        let users: Vec<String> = self.ledgers.iter().map(|e| e.key().clone()).collect();
        let mut guards = self.lock_ledgers(users).await;

        self.live_log.append(BookingRecord::Cleared).await?;
        let removed = self.live.len();
        self.live.clear();
        for (_, ledger) in guards.iter_mut() {
            ledger.clear();
        }
        self.ledgers.clear();
        Ok(removed)
    }

    async fn find_archived(&self, id: Ulid) -> Result<ArchivedBooking, StoreError> {
        self.history
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound)
    }

    /// Rewrite `bookings.wal` as one `Inserted` record per live booking.
    /// `history.wal` is never rewritten.
    async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.maintenance.write().await;
        let mut live: Vec<Booking> = self.live.iter().map(|e| e.value().clone()).collect();
        live.sort_by_key(|b| (b.created_at, b.id));
        let records = live.into_iter().map(BookingRecord::Inserted).collect();
        self.live_log.compact(records).await
    }
}
