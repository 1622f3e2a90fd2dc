use ulid::Ulid;

use crate::model::*;
use crate::quality;

use super::{Engine, EngineError, SharedDeviceState};

impl Engine {
    pub async fn get_device(&self, id: &Ulid) -> Result<Device, EngineError> {
        let ds = self
            .get_device_state(id)
            .ok_or(EngineError::NotFound(*id))?;
        let guard = ds.read().await;
        Ok(guard.device.clone())
    }

    /// Every device in id order.
    pub async fn list_devices(&self) -> Vec<Device> {
        let mut out = Vec::with_capacity(self.store.device_count());
        for (_, ds) in self.store.devices_sorted() {
            out.push(ds.read().await.device.clone());
        }
        out
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Result<Reservation, EngineError> {
        let device_id = self
            .store
            .device_for_reservation(id)
            .ok_or(EngineError::NotFound(*id))?;
        let ds = self
            .get_device_state(&device_id)
            .ok_or(EngineError::NotFound(device_id))?;
        let guard = ds.read().await;
        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(*id))
    }

    /// Reservations matching `filter`, ordered by start then id.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let devices: Vec<(Ulid, SharedDeviceState)> = match filter.device_id {
            Some(id) => self.get_device_state(&id).into_iter().map(|ds| (id, ds)).collect(),
            None => self.store.devices_sorted(),
        };
        let mut out = Vec::new();
        for (_, ds) in devices {
            let guard = ds.read().await;
            out.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    pub async fn reservations_for_requester(&self, requester_id: Ulid) -> Vec<Reservation> {
        self.list_reservations(&ReservationFilter {
            requester_id: Some(requester_id),
            ..Default::default()
        })
        .await
    }

    pub fn get_requester(&self, id: &Ulid) -> Option<Requester> {
        self.store.requester(id)
    }

    pub fn requesters(&self) -> Vec<Requester> {
        let mut all = self.store.requesters();
        all.sort_by_key(|r| r.id);
        all
    }

    pub fn blocked_dates(&self) -> Vec<BlockedDate> {
        self.store.blocked_dates()
    }

    pub async fn device_mean_rating(&self, device_id: &Ulid) -> Result<Option<f64>, EngineError> {
        let ds = self
            .get_device_state(device_id)
            .ok_or(EngineError::NotFound(*device_id))?;
        let guard = ds.read().await;
        Ok(quality::mean_rating(guard.ratings()))
    }

    /// Every incident reported on a device, oldest first.
    pub async fn incidents_for_device(&self, device_id: &Ulid) -> Result<Vec<Incident>, EngineError> {
        let ds = self
            .get_device_state(device_id)
            .ok_or(EngineError::NotFound(*device_id))?;
        let guard = ds.read().await;
        Ok(guard.incidents.clone())
    }

    /// Unresolved incidents across all devices, oldest first.
    pub async fn open_incidents(&self) -> Vec<Incident> {
        let mut out = Vec::new();
        for (_, ds) in self.store.devices_sorted() {
            let guard = ds.read().await;
            out.extend(guard.incidents.iter().filter(|i| i.is_open()).cloned());
        }
        out.sort_by_key(|i| (i.reported_at, i.id));
        out
    }

    /// `Active` reservations whose window has ended by `now`.
    pub async fn collect_overdue(&self, now: Ms) -> Vec<Reservation> {
        self.collect_active(|r| r.span.end <= now).await
    }

    /// `Active` reservations ending within `(now, now + lead]`.
    pub async fn collect_due_soon(&self, now: Ms, lead: Ms) -> Vec<Reservation> {
        self.collect_active(|r| r.span.end > now && r.span.end <= now + lead)
            .await
    }

    async fn collect_active(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out = Vec::new();
        for (_, ds) in self.store.devices_sorted() {
            let guard = ds.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.status == ReservationStatus::Active && pred(r))
                    .cloned(),
            );
        }
        out.sort_by_key(|r| (r.span.end, r.id));
        out
    }

    /// Device snapshot for notification payloads.
    pub(crate) async fn device_snapshot(&self, device_id: &Ulid) -> Option<Device> {
        let ds = self.get_device_state(device_id)?;
        let guard = ds.read().await;
        Some(guard.device.clone())
    }
}
