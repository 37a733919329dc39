use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::limits::*;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// What the lifecycle run does with live bookings after archiving expired ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClearPolicy {
    /// Same-day bookings stay live and keep their seats through the reset.
    Keep,
    /// Every remaining live booking is archived too.
    #[default]
    ArchiveAll,
}

impl FromStr for ClearPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keep" => Ok(ClearPolicy::Keep),
            "archive-all" | "archive_all" => Ok(ClearPolicy::ArchiveAll),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// JSON catalog; the built-in sports complex when unset.
    pub catalog: Option<PathBuf>,
    pub timezone: Tz,
    pub store_timeout: Duration,
    pub badminton_quota: usize,
    pub max_cas_retries: u32,
    pub clear_policy: ClearPolicy,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            catalog: None,
            timezone: chrono_tz::UTC,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            badminton_quota: DEFAULT_BADMINTON_QUOTA,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
            clear_policy: ClearPolicy::ArchiveAll,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(dir) = lookup("COURTBOOK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.catalog = lookup("COURTBOOK_CATALOG").map(PathBuf::from);
        if let Some(tz) = parsed(&lookup, "COURTBOOK_TIMEZONE")? {
            config.timezone = tz;
        }
        if let Some(ms) = parsed::<u64>(&lookup, "COURTBOOK_STORE_TIMEOUT_MS")? {
            config.store_timeout = Duration::from_millis(ms);
        }
        if let Some(quota) = parsed(&lookup, "COURTBOOK_BADMINTON_QUOTA")? {
            config.badminton_quota = quota;
        }
        if let Some(retries) = parsed(&lookup, "COURTBOOK_MAX_CAS_RETRIES")? {
            config.max_cas_retries = retries;
        }
        if let Some(policy) = parsed(&lookup, "COURTBOOK_CLEAR_POLICY")? {
            config.clear_policy = policy;
        }
        config.metrics_port = parsed(&lookup, "COURTBOOK_METRICS_PORT")?;
        Ok(config)
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
