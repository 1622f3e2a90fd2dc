use std::path::PathBuf;
use std::time::Duration;

use crate::policy::BookingPolicy;

/// Service settings, read from `LABRES_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub policy: BookingPolicy,
    pub reconcile_interval: Duration,
    pub reminder_lead: Duration,
    pub compact_threshold: u64,
    pub notify_queue: usize,
    pub admin_email: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            policy: BookingPolicy::default(),
            reconcile_interval: Duration::from_secs(30 * 60),
            reminder_lead: Duration::from_secs(60 * 60),
            compact_threshold: 1000,
            notify_queue: 1024,
            admin_email: "admin@localhost".into(),
        }
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or unparsable values fall
    /// back to the defaults; an inconsistent booking policy is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let defaults = Self::default();

        let open_hour = parsed(&lookup, "LABRES_OPEN_HOUR").unwrap_or(defaults.policy.open_hour);
        let close_hour = parsed(&lookup, "LABRES_CLOSE_HOUR").unwrap_or(defaults.policy.close_hour);
        let offset_minutes: i32 = parsed(&lookup, "LABRES_UTC_OFFSET_MINUTES").unwrap_or(0);
        let policy = BookingPolicy::new(open_hour, close_hour, offset_minutes.saturating_mul(60))?;

        let reconcile_secs: u64 = parsed(&lookup, "LABRES_RECONCILE_INTERVAL_SECS")
            .unwrap_or(defaults.reconcile_interval.as_secs());
        if reconcile_secs == 0 {
            return Err("LABRES_RECONCILE_INTERVAL_SECS must be positive".into());
        }

        Ok(Self {
            data_dir: parsed(&lookup, "LABRES_DATA_DIR").unwrap_or(defaults.data_dir),
            metrics_port: parsed(&lookup, "LABRES_METRICS_PORT"),
            policy,
            reconcile_interval: Duration::from_secs(reconcile_secs),
            reminder_lead: parsed(&lookup, "LABRES_REMINDER_LEAD_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reminder_lead),
            compact_threshold: parsed(&lookup, "LABRES_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            notify_queue: parsed(&lookup, "LABRES_NOTIFY_QUEUE").unwrap_or(defaults.notify_queue),
            admin_email: parsed::<String, _>(&lookup, "LABRES_ADMIN_EMAIL")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.admin_email),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("labres.wal")
    }
}
