//! Post-return quality signal: the running mean of a device's ratings decides
//! whether it is pulled for maintenance.

use crate::model::DeviceStatus;

/// Devices whose mean rating falls below this are flagged.
pub const QUALITY_THRESHOLD: f64 = 3.0;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

pub fn rating_in_range(rating: u8) -> bool {
    (MIN_RATING..=MAX_RATING).contains(&rating)
}

/// Mean over every rating given so far; `None` when nothing is rated.
pub fn mean_rating(ratings: impl IntoIterator<Item = u8>) -> Option<f64> {
    let (sum, count) = ratings
        .into_iter()
        .fold((0u64, 0u64), |(s, c), r| (s + u64::from(r), c + 1));
    (count > 0).then(|| sum as f64 / count as f64)
}

/// New device status if the mean demands maintenance. Devices already in the
/// repair pipeline are left alone.
pub fn evaluate(mean: Option<f64>, current: DeviceStatus) -> Option<DeviceStatus> {
    let mean = mean?;
    if mean >= QUALITY_THRESHOLD {
        return None;
    }
    match current {
        DeviceStatus::InRepair | DeviceStatus::MaintenanceRequired => None,
        _ => Some(DeviceStatus::MaintenanceRequired),
    }
}
