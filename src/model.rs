use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Full,
    Disabled,
}

/// A bookable time interval at a facility with a fixed capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub facility: String,
    /// Badminton only.
    pub court_id: Option<String>,
    /// Wall-clock `HH:MM`.
    pub start_time: String,
    pub end_time: String,
    pub status: SlotStatus,
    pub max_bookings: u32,
    pub current_bookings: u32,
    /// Optimistic-concurrency token, bumped on every write.
    pub version: u64,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Slot {
    pub fn new(
        id: Ulid,
        facility: impl Into<String>,
        court_id: Option<String>,
        start_time: impl Into<String>,
        end_time: impl Into<String>,
        max_bookings: u32,
        now: Ms,
    ) -> Self {
        Self {
            id,
            facility: facility.into(),
            court_id,
            start_time: start_time.into(),
            end_time: end_time.into(),
            status: SlotStatus::Available,
            max_bookings,
            current_bookings: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_full(&self) -> bool {
        self.current_bookings >= self.max_bookings
    }

    pub fn occupancy_in_range(&self) -> bool {
        self.current_bookings <= self.max_bookings
    }

    /// Next revision of this slot with `current_bookings` replaced.
    /// `Disabled` is sticky; otherwise status follows occupancy.
    pub fn with_occupancy(&self, current_bookings: u32, now: Ms) -> Slot {
        let status = match self.status {
            SlotStatus::Disabled => SlotStatus::Disabled,
            _ if current_bookings >= self.max_bookings => SlotStatus::Full,
            _ => SlotStatus::Available,
        };
        Slot {
            current_bookings,
            status,
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn snapshot(&self) -> OccupancySnapshot {
        OccupancySnapshot {
            current_bookings: self.current_bookings,
            max_bookings: self.max_bookings,
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

/// Which slot namespace a booking points into. Exactly one, by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotReference {
    Normal(Ulid),
    Badminton(Ulid),
}

impl SlotReference {
    pub fn slot_id(&self) -> Ulid {
        match self {
            SlotReference::Normal(id) | SlotReference::Badminton(id) => *id,
        }
    }

    pub fn is_badminton(&self) -> bool {
        matches!(self, SlotReference::Badminton(_))
    }
}

impl fmt::Display for SlotReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotReference::Normal(id) => write!(f, "slot:{id}"),
            SlotReference::Badminton(id) => write!(f, "badminton_slot:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Paid,
    Completed,
    Failed,
    Canceled,
}

impl BookingStatus {
    /// The full transition table. Anything not listed is rejected.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Paid) | (Paid, Completed) | (Pending, Failed) | (Pending, Canceled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Failed | BookingStatus::Canceled
        )
    }

    /// Whether a booking in this status counts against slot occupancy,
    /// the duplicate rule and the badminton quota.
    pub fn holds_slot(self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Paid | BookingStatus::Completed
        )
    }

    /// Entering this status gives the seat back.
    pub fn releases_slot(self) -> bool {
        matches!(self, BookingStatus::Failed | BookingStatus::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Paid => "paid",
            BookingStatus::Completed => "completed",
            BookingStatus::Failed => "failed",
            BookingStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown booking status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    /// Case-insensitive; upstream collaborators send both `"PAID"` and `"paid"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "paid" => Ok(BookingStatus::Paid),
            "completed" => Ok(BookingStatus::Completed),
            "failed" => Ok(BookingStatus::Failed),
            "canceled" | "cancelled" => Ok(BookingStatus::Canceled),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Slot occupancy as seen right after the admitting increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancySnapshot {
    pub current_bookings: u32,
    pub max_bookings: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: String,
    pub facility: String,
    pub slot: SlotReference,
    pub status: BookingStatus,
    pub occupancy: OccupancySnapshot,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn pending(
        user_id: impl Into<String>,
        facility: impl Into<String>,
        slot: SlotReference,
        occupancy: OccupancySnapshot,
        now: Ms,
    ) -> Self {
        Self {
            id: Ulid::new(),
            user_id: user_id.into(),
            facility: facility.into(),
            slot,
            status: BookingStatus::Pending,
            occupancy,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn holds_slot(&self) -> bool {
        self.status.holds_slot()
    }
}

/// Request shape as delivered by transports: two optional references,
/// exactly one of which must be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub user_id: String,
    pub facility: String,
    #[serde(default)]
    pub slot_id: Option<Ulid>,
    #[serde(default)]
    pub badminton_slot_id: Option<Ulid>,
}

impl BookingRequest {
    pub fn slot_reference(&self) -> Option<SlotReference> {
        match (self.slot_id, self.badminton_slot_id) {
            (Some(id), None) => Some(SlotReference::Normal(id)),
            (None, Some(id)) => Some(SlotReference::Badminton(id)),
            _ => None,
        }
    }
}

/// Append-only history record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedBooking {
    pub booking: Booking,
    pub archived_at: Ms,
}

// ── WAL record formats ───────────────────────────────────────────

/// Slot partition WAL record. Slots are small, so every write logs the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotRecord {
    Created(Slot),
    Updated(Slot),
}

/// Live booking WAL record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingRecord {
    Inserted(Booking),
    StatusChanged {
        id: Ulid,
        status: BookingStatus,
        updated_at: Ms,
    },
    /// Emitted only after the history copy is durable.
    Removed { id: Ulid },
    Cleared,
}
