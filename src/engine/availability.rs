use crate::model::*;

use super::{Engine, EngineError};

// ── Availability Algorithm ────────────────────────────────────────

/// Whether a device can take a new reservation for `span`: it is `Available`,
/// it carries every requested capability, and no holding reservation overlaps.
///
/// `InUse` devices are excluded even when the window is free; a device out on
/// loan is not offered to new searches.
pub fn device_qualifies(ds: &DeviceState, query: &CapabilityQuery, span: &Span) -> bool {
    ds.device.status == DeviceStatus::Available
        && query.matches(&ds.device)
        && ds.holding(span).next().is_none()
}

/// Every qualifying device, ordered by id.
pub fn find_available<'a>(
    states: impl IntoIterator<Item = &'a DeviceState>,
    query: &CapabilityQuery,
    span: &Span,
) -> Vec<Device> {
    let mut found: Vec<Device> = states
        .into_iter()
        .filter(|ds| device_qualifies(ds, query, span))
        .map(|ds| ds.device.clone())
        .collect();
    found.sort_by_key(|d| d.id);
    found
}

impl Engine {
    /// Devices free for `span` that satisfy `query`. The window is checked
    /// against the booking rules first; an empty result is not an error.
    pub async fn search_available(
        &self,
        query: &CapabilityQuery,
        span: Span,
    ) -> Result<Vec<Device>, EngineError> {
        self.validate_window(&span)?;
        Ok(self.resolve_available(query, &span).await)
    }

    /// Snapshot every device under its read lock and run the resolver. Each
    /// device is read independently, so the answer is advisory: writers
    /// re-check under the write lock.
    pub(super) async fn resolve_available(&self, query: &CapabilityQuery, span: &Span) -> Vec<Device> {
        let mut snapshots = Vec::new();
        for (_, ds) in self.store.devices_sorted() {
            let guard = ds.read().await;
            if device_qualifies(&guard, query, span) {
                snapshots.push(guard.clone());
            }
        }
        find_available(snapshots.iter(), query, span)
    }
}
