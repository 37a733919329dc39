//! Facility catalog: which facilities exist, how their slots reset, and the
//! slots they are seeded with.
//!
//! ```json
//! { "facilities": [
//!     { "name": "gym", "kind": { "type": "standard" }, "price": 50,
//!       "slots": [ { "start_time": "06:00", "end_time": "07:00", "max_bookings": 30 } ] },
//!     { "name": "badminton", "kind": { "type": "badminton", "full_threshold": 10 },
//!       "slots": [ { "court_id": "C1", "start_time": "08:00", "end_time": "09:00", "max_bookings": 10 } ] }
//! ] }
//! ```

use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::{Slot, now_ms};
use crate::store::{ResetPolicy, SlotStore, StoreError, sanitize_facility};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("reading catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid catalog: {0}")]
    Invalid(String),
}

fn default_full_threshold() -> u32 {
    DEFAULT_BADMINTON_FULL_THRESHOLD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FacilityKind {
    Standard,
    /// Courts with a per-user quota; slots only reset once they reach `full_threshold`.
    Badminton {
        #[serde(default = "default_full_threshold")]
        full_threshold: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSeed {
    #[serde(default)]
    pub id: Option<Ulid>,
    #[serde(default)]
    pub court_id: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub max_bookings: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub name: String,
    pub kind: FacilityKind,
    /// Per booking, in whole currency units. Informational; payment is external.
    #[serde(default)]
    pub price: u32,
    #[serde(default)]
    pub slots: Vec<SlotSeed>,
}

impl Facility {
    pub fn is_badminton(&self) -> bool {
        matches!(self.kind, FacilityKind::Badminton { .. })
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        match self.kind {
            FacilityKind::Standard => ResetPolicy::Unconditional,
            FacilityKind::Badminton { full_threshold } => ResetPolicy::FullOnly {
                threshold: full_threshold,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityCatalog {
    facilities: Vec<Facility>,
}

impl FacilityCatalog {
    pub fn new(facilities: Vec<Facility>) -> Result<Self, CatalogError> {
        let catalog = Self { facilities };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let catalog: FacilityCatalog = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn get(&self, name: &str) -> Option<&Facility> {
        self.facilities.iter().find(|f| f.name == name)
    }

    pub fn facilities(&self) -> &[Facility] {
        &self.facilities
    }

    /// Gym, pool, football pitch and four badminton courts, with hourly slots.
    pub fn sports_complex() -> Self {
        fn hourly(from: u32, to: u32, step: u32, court: Option<&str>, max: u32) -> Vec<SlotSeed> {
            (from..to)
                .step_by(step as usize)
                .map(|h| SlotSeed {
                    id: None,
                    court_id: court.map(str::to_string),
                    start_time: format!("{h:02}:00"),
                    end_time: format!("{:02}:00", h + step),
                    max_bookings: max,
                })
                .collect()
        }

        let courts = ["C1", "C2", "C3", "C4"]
            .iter()
            .flat_map(|c| hourly(8, 22, 1, Some(c), 10))
            .collect();

        Self {
            facilities: vec![
                Facility {
                    name: "gym".into(),
                    kind: FacilityKind::Standard,
                    price: 50,
                    slots: hourly(6, 22, 1, None, 30),
                },
                Facility {
                    name: "pool".into(),
                    kind: FacilityKind::Standard,
                    price: 80,
                    slots: hourly(7, 21, 1, None, 20),
                },
                Facility {
                    name: "football".into(),
                    kind: FacilityKind::Standard,
                    price: 300,
                    slots: hourly(8, 22, 2, None, 22),
                },
                Facility {
                    name: "badminton".into(),
                    kind: FacilityKind::Badminton {
                        full_threshold: DEFAULT_BADMINTON_FULL_THRESHOLD,
                    },
                    price: 100,
                    slots: courts,
                },
            ],
        }
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let invalid = |msg: String| Err(CatalogError::Invalid(msg));
        if self.facilities.len() > MAX_FACILITIES {
            return invalid(format!("more than {MAX_FACILITIES} facilities"));
        }
        let mut names = HashSet::new();
        for facility in &self.facilities {
            if sanitize_facility(&facility.name).is_err() {
                return invalid(format!("facility name {:?} must be [A-Za-z0-9_-]", facility.name));
            }
            if !names.insert(facility.name.as_str()) {
                return invalid(format!("duplicate facility {:?}", facility.name));
            }
            if let FacilityKind::Badminton { full_threshold: 0 } = facility.kind {
                return invalid(format!("{}: full_threshold must be positive", facility.name));
            }
            if facility.slots.len() > MAX_SLOTS_PER_FACILITY {
                return invalid(format!("{}: too many slots", facility.name));
            }
            for seed in &facility.slots {
                let start = parse_wall_clock(&seed.start_time);
                let end = parse_wall_clock(&seed.end_time);
                match (start, end) {
                    (Some(s), Some(e)) if s < e => {}
                    _ => {
                        return invalid(format!(
                            "{}: bad slot window {}-{}",
                            facility.name, seed.start_time, seed.end_time
                        ));
                    }
                }
                if seed.max_bookings == 0 || seed.max_bookings > MAX_SLOT_CAPACITY {
                    return invalid(format!("{}: max_bookings out of range", facility.name));
                }
                if seed.court_id.as_ref().is_some_and(|c| c.len() > MAX_COURT_ID_LEN) {
                    return invalid(format!("{}: court id too long", facility.name));
                }
            }
        }
        Ok(())
    }
}

fn parse_wall_clock(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Insert catalog slots into every facility that has none yet.
/// Returns the number of slots created.
pub async fn seed_slots(catalog: &FacilityCatalog, store: &dyn SlotStore) -> Result<usize, StoreError> {
    let now = now_ms();
    let mut created = 0;
    for facility in catalog.facilities() {
        if !store.list_by_facility(&facility.name).await?.is_empty() {
            continue;
        }
        for seed in &facility.slots {
            let slot = Slot::new(
                seed.id.unwrap_or_else(Ulid::new),
                facility.name.clone(),
                seed.court_id.clone(),
                seed.start_time.clone(),
                seed.end_time.clone(),
                seed.max_bookings,
                now,
            );
            store.insert(slot).await?;
            created += 1;
        }
        info!(facility = %facility.name, slots = facility.slots.len(), "seeded facility");
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WalSlotStore;

    #[test]
    fn parses_json_catalog() {
        let json = r#"{ "facilities": [
            { "name": "gym", "kind": { "type": "standard" }, "price": 50,
              "slots": [ { "start_time": "06:00", "end_time": "07:00", "max_bookings": 30 } ] },
            { "name": "badminton", "kind": { "type": "badminton" },
              "slots": [ { "court_id": "C1", "start_time": "08:00", "end_time": "09:00", "max_bookings": 10 } ] }
        ] }"#;
        let catalog = FacilityCatalog::from_json(json).unwrap();
        assert_eq!(catalog.facilities().len(), 2);
        let badminton = catalog.get("badminton").unwrap();
        assert!(badminton.is_badminton());
        assert_eq!(badminton.reset_policy(), ResetPolicy::FullOnly { threshold: 10 });
        assert_eq!(catalog.get("gym").unwrap().reset_policy(), ResetPolicy::Unconditional);
        assert!(catalog.get("sauna").is_none());
    }

    #[test]
    fn rejects_bad_windows_and_duplicates() {
        let bad_window = r#"{ "facilities": [ { "name": "gym", "kind": { "type": "standard" },
            "slots": [ { "start_time": "09:00", "end_time": "08:00", "max_bookings": 1 } ] } ] }"#;
        assert!(matches!(FacilityCatalog::from_json(bad_window), Err(CatalogError::Invalid(_))));

        let not_a_time = r#"{ "facilities": [ { "name": "gym", "kind": { "type": "standard" },
            "slots": [ { "start_time": "9am", "end_time": "10:00", "max_bookings": 1 } ] } ] }"#;
        assert!(matches!(FacilityCatalog::from_json(not_a_time), Err(CatalogError::Invalid(_))));

        let dup = r#"{ "facilities": [
            { "name": "pool", "kind": { "type": "standard" } },
            { "name": "pool", "kind": { "type": "standard" } } ] }"#;
        assert!(matches!(FacilityCatalog::from_json(dup), Err(CatalogError::Invalid(_))));

        assert!(matches!(FacilityCatalog::from_json("{"), Err(CatalogError::Parse(_))));
    }

    #[test]
    fn sports_complex_is_valid() {
        let catalog = FacilityCatalog::sports_complex();
        catalog.validate().unwrap();
        assert_eq!(catalog.get("badminton").unwrap().slots.len(), 4 * 14);
        assert_eq!(catalog.get("football").unwrap().slots.len(), 7);
        assert_eq!(catalog.get("gym").unwrap().slots[0].start_time, "06:00");
    }

    #[tokio::test]
    async fn seeding_only_fills_empty_facilities() {
        let dir = std::env::temp_dir().join("courtbook_test_catalog").join("seed");
        let _ = std::fs::remove_dir_all(&dir);
        let store = WalSlotStore::open(&dir).unwrap();
        let catalog = FacilityCatalog::sports_complex();

        let first = seed_slots(&catalog, &store).await.unwrap();
        let expected: usize = catalog.facilities().iter().map(|f| f.slots.len()).sum();
        assert_eq!(first, expected);
        assert_eq!(seed_slots(&catalog, &store).await.unwrap(), 0);
        assert_eq!(store.list_by_facility("pool").await.unwrap().len(), 14);
    }
}
