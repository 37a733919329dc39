/// Per-user ledger and facility keys end up in file names and log fields.
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_FACILITY_NAME_LEN: usize = 64;
pub const MAX_COURT_ID_LEN: usize = 32;

/// Each facility owns a WAL file; cap the number of open partitions.
pub const MAX_FACILITIES: usize = 64;
pub const MAX_SLOTS_PER_FACILITY: usize = 10_000;
pub const MAX_SLOT_CAPACITY: u32 = 10_000;

/// Badminton quota when the configuration does not override it.
pub const DEFAULT_BADMINTON_QUOTA: usize = 2;
/// Badminton "full" reset threshold when the catalog does not set one.
pub const DEFAULT_BADMINTON_FULL_THRESHOLD: u32 = 10;

pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 32;

/// Largest record payload a WAL frame may carry. Longer length prefixes
/// are treated as corruption on replay.
pub const MAX_WAL_FRAME_BYTES: usize = 1 << 20;

/// Group-commit channel depth per WAL writer.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;
