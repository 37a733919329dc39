use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::writer::WalWriter;
use super::{ResetPolicy, SlotStore, StoreError, sanitize_facility};

type SharedSlot = Arc<RwLock<Slot>>;

/// One facility's slot namespace, backed by its own WAL.
struct Partition {
    slots: DashMap<Ulid, SharedSlot>,
    writer: WalWriter<SlotRecord>,
    /// Serializes inserts against compaction.
    structure: Mutex<()>,
}

impl Partition {
    fn load(path: &Path) -> io::Result<Self> {
        let (writer, records) = WalWriter::open(path)?;
        let slots = DashMap::new();
        for record in records {
            match record {
                SlotRecord::Created(slot) | SlotRecord::Updated(slot) => {
                    slots.insert(slot.id, Arc::new(RwLock::new(slot)));
                }
            }
        }
        Ok(Self {
            slots,
            writer,
            structure: Mutex::new(()),
        })
    }

    fn handle(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    /// Write-lock every slot in ascending id order.
    async fn lock_all(&self) -> Vec<OwnedRwLockWriteGuard<Slot>> {
        let mut handles: Vec<(Ulid, SharedSlot)> = self
            .slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(handles.len());
        for (_, handle) in handles {
            guards.push(handle.write_owned().await);
        }
        guards
    }
}

/// Slot store with one partition (and one WAL file) per facility under `<data_dir>/slots/`.
///
/// Each slot sits behind its own lock, so `set_occupancy` is an atomic
/// single-document compare-and-swap; there is no cross-slot lock on the hot path.
pub struct WalSlotStore {
    dir: PathBuf,
    partitions: DashMap<String, Arc<Partition>>,
}

impl WalSlotStore {
    /// Open the store, replaying every facility WAL found on disk.
    pub fn open(data_dir: &Path) -> io::Result<Self> {
        let dir = data_dir.join("slots");
        std::fs::create_dir_all(&dir)?;
        let partitions = DashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wal") {
                continue;
            }
            let Some(facility) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let partition = Partition::load(&path)?;
            info!(facility, slots = partition.slots.len(), "loaded slot partition");
            partitions.insert(facility.to_string(), Arc::new(partition));
        }
        Ok(Self { dir, partitions })
    }

    fn partition(&self, facility: &str) -> Option<Arc<Partition>> {
        self.partitions.get(facility).map(|e| e.value().clone())
    }

    fn partition_or_create(&self, facility: &str) -> Result<Arc<Partition>, StoreError> {
        if let Some(p) = self.partition(facility) {
            return Ok(p);
        }
        let name = sanitize_facility(facility)?;
        if self.partitions.len() >= MAX_FACILITIES {
            return Err(StoreError::LimitExceeded("too many facilities"));
        }
        let path = self.dir.join(format!("{name}.wal"));
        let entry = self
            .partitions
            .entry(name)
            .or_try_insert_with(|| Partition::load(&path).map(Arc::new))
            .map_err(|e| StoreError::Unavailable(format!("open slot partition: {e}")))?;
        Ok(entry.value().clone())
    }

    fn slot_handle(&self, facility: &str, id: &Ulid) -> Result<(Arc<Partition>, SharedSlot), StoreError> {
        let partition = self.partition(facility).ok_or(StoreError::NotFound)?;
        let handle = partition.handle(id).ok_or(StoreError::NotFound)?;
        Ok((partition, handle))
    }
}

#[async_trait]
impl SlotStore for WalSlotStore {
    async fn get(&self, facility: &str, slot_id: Ulid) -> Result<Slot, StoreError> {
        let (_, handle) = self.slot_handle(facility, &slot_id)?;
        let slot = handle.read().await.clone();
        Ok(slot)
    }

    async fn set_occupancy(
        &self,
        facility: &str,
        slot_id: Ulid,
        expected_version: u64,
        current_bookings: u32,
    ) -> Result<Slot, StoreError> {
        let (partition, handle) = self.slot_handle(facility, &slot_id)?;
        let mut guard = handle.write().await;
        if guard.version != expected_version {
            return Err(StoreError::Conflict);
        }
        let next = guard.with_occupancy(current_bookings, now_ms());
        partition.writer.append(SlotRecord::Updated(next.clone())).await?;
        *guard = next.clone();
        Ok(next)
    }

    async fn list_by_facility(&self, facility: &str) -> Result<Vec<Slot>, StoreError> {
        let Some(partition) = self.partition(facility) else {
            return Ok(Vec::new());
        };
        let handles: Vec<SharedSlot> = partition.slots.iter().map(|e| e.value().clone()).collect();
        let mut slots = Vec::with_capacity(handles.len());
        for handle in handles {
            slots.push(handle.read().await.clone());
        }
        slots.sort_by(|a, b| {
            (&a.start_time, &a.court_id, a.id).cmp(&(&b.start_time, &b.court_id, b.id))
        });
        Ok(slots)
    }

    async fn reset_all(
        &self,
        facility: &str,
        policy: ResetPolicy,
        held: &HashMap<Ulid, u32>,
    ) -> Result<usize, StoreError> {
        let Some(partition) = self.partition(facility) else {
            return Ok(0);
        };
        let now = now_ms();
        let mut guards = partition.lock_all().await;

        let mut records = Vec::new();
        let mut touched = Vec::new();
        for (idx, guard) in guards.iter().enumerate() {
            if !policy.applies_to(guard) {
                continue;
            }
            let next = guard.with_occupancy(held.get(&guard.id).copied().unwrap_or(0), now);
            if next.current_bookings != guard.current_bookings || next.status != guard.status {
                records.push(SlotRecord::Updated(next.clone()));
                touched.push((idx, next));
            }
        }

        partition.writer.append_all(records).await?;
        let reset = touched.len();
        for (idx, next) in touched {
            *guards[idx] = next;
        }
        Ok(reset)
    }

    async fn insert(&self, slot: Slot) -> Result<(), StoreError> {
        if slot.max_bookings == 0 || slot.max_bookings > MAX_SLOT_CAPACITY {
            return Err(StoreError::LimitExceeded("slot capacity out of range"));
        }
        if slot.current_bookings > slot.max_bookings {
            return Err(StoreError::LimitExceeded("occupancy above capacity"));
        }
        if slot.court_id.as_ref().is_some_and(|c| c.len() > MAX_COURT_ID_LEN) {
            return Err(StoreError::LimitExceeded("court id too long"));
        }
        let partition = self.partition_or_create(&slot.facility)?;
        let _structure = partition.structure.lock().await;
        if partition.slots.contains_key(&slot.id) {
            return Err(StoreError::AlreadyExists(slot.id));
        }
        if partition.slots.len() >= MAX_SLOTS_PER_FACILITY {
            return Err(StoreError::LimitExceeded("too many slots in facility"));
        }
        partition.writer.append(SlotRecord::Created(slot.clone())).await?;
        partition.slots.insert(slot.id, Arc::new(RwLock::new(slot)));
        Ok(())
    }

    /// Rewrite each facility WAL as one `Created` record per slot.
    async fn compact(&self) -> Result<(), StoreError> {
        let partitions: Vec<Arc<Partition>> =
            self.partitions.iter().map(|e| e.value().clone()).collect();
        for partition in partitions {
            let _structure = partition.structure.lock().await;
            let guards = partition.lock_all().await;
            let records = guards
                .iter()
                .map(|g| SlotRecord::Created((**g).clone()))
                .collect();
            partition.writer.compact(records).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtbook_test_slots").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn slot(facility: &str, start: &str, max: u32) -> Slot {
        Slot::new(Ulid::new(), facility, None, start, "23:59", max, 0)
    }

    #[tokio::test]
    async fn insert_get_and_list() {
        let store = WalSlotStore::open(&test_dir("insert_get")).unwrap();
        let late = slot("gym", "18:00", 20);
        let early = slot("gym", "06:00", 20);
        store.insert(late.clone()).await.unwrap();
        store.insert(early.clone()).await.unwrap();

        assert_eq!(store.get("gym", late.id).await.unwrap(), late);
        let listed = store.list_by_facility("gym").await.unwrap();
        assert_eq!(listed, vec![early, late]);
        assert!(store.list_by_facility("pool").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_rejects_duplicates_and_bad_names() {
        let store = WalSlotStore::open(&test_dir("insert_reject")).unwrap();
        let s = slot("pool", "07:00", 4);
        store.insert(s.clone()).await.unwrap();
        assert_eq!(store.insert(s.clone()).await, Err(StoreError::AlreadyExists(s.id)));
        assert!(matches!(
            store.insert(slot("../pool", "07:00", 4)).await,
            Err(StoreError::LimitExceeded(_))
        ));
        assert!(matches!(
            store.insert(slot("pool", "08:00", 0)).await,
            Err(StoreError::LimitExceeded(_))
        ));
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = WalSlotStore::open(&test_dir("unknown")).unwrap();
        assert_eq!(store.get("gym", Ulid::new()).await, Err(StoreError::NotFound));
        store.insert(slot("gym", "06:00", 1)).await.unwrap();
        assert_eq!(store.get("gym", Ulid::new()).await, Err(StoreError::NotFound));
    }

    #[tokio::test]
    async fn set_occupancy_is_compare_and_swap() {
        let store = WalSlotStore::open(&test_dir("cas")).unwrap();
        let s = slot("gym", "06:00", 2);
        store.insert(s.clone()).await.unwrap();

        let one = store.set_occupancy("gym", s.id, 0, 1).await.unwrap();
        assert_eq!(one.current_bookings, 1);
        assert_eq!(one.version, 1);

        // Stale token loses.
        assert_eq!(store.set_occupancy("gym", s.id, 0, 2).await, Err(StoreError::Conflict));
        assert_eq!(store.get("gym", s.id).await.unwrap().current_bookings, 1);

        let full = store.set_occupancy("gym", s.id, 1, 2).await.unwrap();
        assert_eq!(full.status, SlotStatus::Full);
    }

    #[tokio::test]
    async fn reset_policies() {
        let store = WalSlotStore::open(&test_dir("reset")).unwrap();
        let mut low = slot("badminton", "08:00", 10);
        low.current_bookings = 3;
        let mut full = slot("badminton", "09:00", 10);
        full.current_bookings = 10;
        full.status = SlotStatus::Full;
        store.insert(low.clone()).await.unwrap();
        store.insert(full.clone()).await.unwrap();

        let n = store
            .reset_all("badminton", ResetPolicy::FullOnly { threshold: 10 }, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.get("badminton", low.id).await.unwrap().current_bookings, 3);
        let after = store.get("badminton", full.id).await.unwrap();
        assert_eq!(after.current_bookings, 0);
        assert_eq!(after.status, SlotStatus::Available);
        assert_eq!(after.version, full.version + 1);

        let n = store
            .reset_all("badminton", ResetPolicy::Unconditional, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.get("badminton", low.id).await.unwrap().current_bookings, 0);

        assert_eq!(store.reset_all("nowhere", ResetPolicy::Unconditional, &HashMap::new()).await, Ok(0));
    }

    #[tokio::test]
    async fn reset_keeps_seats_still_held() {
        let store = WalSlotStore::open(&test_dir("reset_held")).unwrap();
        let mut kept = slot("gym", "06:00", 1);
        kept.current_bookings = 1;
        kept.status = SlotStatus::Full;
        let mut freed = slot("gym", "07:00", 5);
        freed.current_bookings = 4;
        store.insert(kept.clone()).await.unwrap();
        store.insert(freed.clone()).await.unwrap();

        let held = HashMap::from([(kept.id, 1), (freed.id, 2)]);
        let n = store.reset_all("gym", ResetPolicy::Unconditional, &held).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.get("gym", kept.id).await.unwrap(), kept);
        assert_eq!(store.get("gym", freed.id).await.unwrap().current_bookings, 2);
    }

    #[tokio::test]
    async fn reset_keeps_disabled_slots_disabled() {
        let store = WalSlotStore::open(&test_dir("reset_disabled")).unwrap();
        let mut s = slot("pool", "10:00", 5);
        s.current_bookings = 2;
        s.status = SlotStatus::Disabled;
        store.insert(s.clone()).await.unwrap();
        store.reset_all("pool", ResetPolicy::Unconditional, &HashMap::new()).await.unwrap();
        let after = store.get("pool", s.id).await.unwrap();
        assert_eq!(after.current_bookings, 0);
        assert_eq!(after.status, SlotStatus::Disabled);
    }

    #[tokio::test]
    async fn state_survives_reopen_and_compaction() {
        let dir = test_dir("reopen");
        let s = slot("football", "17:00", 22);
        {
            let store = WalSlotStore::open(&dir).unwrap();
            store.insert(s.clone()).await.unwrap();
            let mut version = 0;
            for n in 1..=5 {
                version = store.set_occupancy("football", s.id, version, n).await.unwrap().version;
            }
            store.compact().await.unwrap();
            store.set_occupancy("football", s.id, version, 6).await.unwrap();
        }

        let reopened = WalSlotStore::open(&dir).unwrap();
        let after = reopened.get("football", s.id).await.unwrap();
        assert_eq!(after.current_bookings, 6);
        assert_eq!(after.version, 6);
    }

    #[tokio::test]
    async fn concurrent_cas_has_single_winner_per_version() {
        let store = Arc::new(WalSlotStore::open(&test_dir("cas_race")).unwrap());
        let s = slot("gym", "12:00", 100);
        store.insert(s.clone()).await.unwrap();
        let id = s.id;

        let attempts = (0..16).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.set_occupancy("gym", id, 0, 1).await })
        });
        let results = futures::future::join_all(attempts).await;
        let winners = results.into_iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        assert_eq!(winners, 1);
    }
}
