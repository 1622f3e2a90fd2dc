use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedDeviceState;

/// In-memory indexes over devices, reservations, requesters and the blocked
/// calendar. Rebuilt from the journal on start.
pub struct Store {
    devices: DashMap<Ulid, SharedDeviceState>,
    /// Reverse lookup: reservation id → device id.
    reservation_to_device: DashMap<Ulid, Ulid>,
    incident_to_device: DashMap<Ulid, Ulid>,
    serials: DashMap<String, Ulid>,
    requesters: DashMap<Ulid, Requester>,
    blocked: DashMap<NaiveDate, BlockedDate>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
            reservation_to_device: DashMap::new(),
            incident_to_device: DashMap::new(),
            serials: DashMap::new(),
            requesters: DashMap::new(),
            blocked: DashMap::new(),
        }
    }

    // ── Devices ──────────────────────────────────────────────

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, id: &Ulid) -> Option<SharedDeviceState> {
        self.devices.get(id).map(|e| e.value().clone())
    }

    /// Every device handle, in id order (the lock order for multi-device writes).
    pub fn devices_sorted(&self) -> Vec<(Ulid, SharedDeviceState)> {
        let mut all: Vec<_> = self
            .devices
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn serial_taken(&self, serial: &str) -> bool {
        self.serials.contains_key(&serial.to_lowercase())
    }

    pub fn device_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_device
            .get(reservation_id)
            .map(|e| *e.value())
    }

    pub fn device_for_incident(&self, incident_id: &Ulid) -> Option<Ulid> {
        self.incident_to_device.get(incident_id).map(|e| *e.value())
    }

    // ── Requesters & calendar ────────────────────────────────

    pub fn requester(&self, id: &Ulid) -> Option<Requester> {
        self.requesters.get(id).map(|e| e.value().clone())
    }

    pub fn requesters(&self) -> Vec<Requester> {
        self.requesters.iter().map(|e| e.value().clone()).collect()
    }

    pub fn is_blocked(&self, date: &NaiveDate) -> bool {
        self.blocked.contains_key(date)
    }

    pub fn blocked_dates(&self) -> Vec<BlockedDate> {
        let mut dates: Vec<_> = self.blocked.iter().map(|e| e.value().clone()).collect();
        dates.sort_by_key(|b| b.date);
        dates
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event that is not scoped to a single device lock.
    pub fn apply_global(&self, event: &Event) {
        match event {
            Event::DeviceRegistered { device } => {
                self.serials
                    .insert(device.serial_number.to_lowercase(), device.id);
                self.devices.insert(
                    device.id,
                    Arc::new(RwLock::new(DeviceState::new(device.clone()))),
                );
            }
            Event::RequesterRegistered { requester } => {
                self.requesters.insert(requester.id, requester.clone());
            }
            Event::RequesterSanctioned { id } => self.mark_sanctioned(id),
            Event::DateBlocked { blocked } => {
                self.blocked.insert(blocked.date, blocked.clone());
            }
            Event::DateUnblocked { date } => {
                self.blocked.remove(date);
            }
            Event::ReservationCreated { .. }
            | Event::BatchCreated { .. }
            | Event::StatusChanged { .. }
            | Event::FeedbackRecorded { .. }
            | Event::IncidentReported { .. }
            | Event::IncidentResolved { .. } => {}
        }
    }

    fn mark_sanctioned(&self, id: &Ulid) {
        self.requesters
            .entry(*id)
            .or_insert_with(|| Requester::bare(*id))
            .sanctioned = true;
    }

    /// Apply a device-scoped event. Caller holds the device write lock.
    /// Batch records touch several devices; only this device's share is applied.
    pub fn apply_to_device(&self, ds: &mut DeviceState, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => {
                self.reservation_to_device
                    .insert(reservation.id, reservation.device_id);
                ds.insert_reservation(reservation.clone());
            }
            Event::BatchCreated { reservations, .. } => {
                let device_id = ds.device.id;
                for r in reservations.iter().filter(|r| r.device_id == device_id) {
                    self.reservation_to_device.insert(r.id, r.device_id);
                    ds.insert_reservation(r.clone());
                }
            }
            Event::StatusChanged {
                id,
                status,
                device_status,
                sanction,
                ..
            } => {
                if let Some(r) = ds.reservation_mut(id) {
                    r.status = *status;
                }
                if let Some(s) = device_status {
                    ds.device.status = *s;
                }
                if let Some(requester_id) = sanction {
                    self.mark_sanctioned(requester_id);
                }
            }
            Event::FeedbackRecorded {
                id,
                rating,
                feedback,
                device_status,
                ..
            } => {
                if let Some(r) = ds.reservation_mut(id) {
                    r.rating = Some(*rating);
                    r.feedback = feedback.clone();
                }
                if let Some(s) = device_status {
                    ds.device.status = *s;
                }
            }
            Event::IncidentReported {
                incident,
                device_status,
            } => {
                self.incident_to_device
                    .insert(incident.id, incident.device_id);
                ds.incidents.push(incident.clone());
                if let Some(s) = device_status {
                    ds.device.status = *s;
                }
            }
            Event::IncidentResolved {
                id,
                resolved_at,
                device_status,
                ..
            } => {
                if let Some(i) = ds.incident_mut(id) {
                    i.resolved_at = Some(*resolved_at);
                }
                if let Some(s) = device_status {
                    ds.device.status = *s;
                }
            }
            Event::DeviceRegistered { .. }
            | Event::RequesterRegistered { .. }
            | Event::RequesterSanctioned { .. }
            | Event::DateBlocked { .. }
            | Event::DateUnblocked { .. } => {}
        }
    }

    /// Device ids an event touches, for routing during replay.
    fn event_devices(event: &Event) -> Vec<Ulid> {
        match event {
            Event::ReservationCreated { reservation } => vec![reservation.device_id],
            Event::BatchCreated { reservations, .. } => {
                let mut ids: Vec<Ulid> = reservations.iter().map(|r| r.device_id).collect();
                ids.sort();
                ids.dedup();
                ids
            }
            Event::StatusChanged { device_id, .. }
            | Event::FeedbackRecorded { device_id, .. }
            | Event::IncidentResolved { device_id, .. } => vec![*device_id],
            Event::IncidentReported { incident, .. } => vec![incident.device_id],
            _ => Vec::new(),
        }
    }

    /// Apply one replayed event. Replay runs before the engine is shared, so
    /// no lock is ever held here; never block because replay may run inside
    /// an async context.
    pub fn replay(&self, event: &Event) {
        let targets = Self::event_devices(event);
        if targets.is_empty() {
            self.apply_global(event);
            return;
        }
        for device_id in targets {
            let Some(ds) = self.device(&device_id) else {
                tracing::warn!("replay: event for unknown device {device_id} skipped");
                continue;
            };
            let Ok(mut guard) = ds.try_write() else {
                tracing::warn!("replay: device {device_id} locked, event skipped");
                continue;
            };
            self.apply_to_device(&mut guard, event);
        }
    }
}
