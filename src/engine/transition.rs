use ulid::Ulid;

use crate::model::{DeviceState, DeviceStatus, ReservationStatus};
use crate::notify::NotificationKind;

use super::EngineError;

use ReservationStatus::*;

/// Reservation state machine:
///
/// ```text
/// Pending --approve--> Approved --pickup--> Active --return--> Completed
/// Pending --reject-->  Rejected
/// {Pending, Approved} --cancel--> Cancelled
/// Active --reconciler(end <= now)--> Overdue
/// ```
///
/// Everything else, including any move out of a terminal status, is rejected.
pub fn check_transition(from: ReservationStatus, to: ReservationStatus) -> Result<(), EngineError> {
    let allowed = matches!(
        (from, to),
        (Pending, Approved)
            | (Pending, Rejected)
            | (Pending, Cancelled)
            | (Approved, Active)
            | (Approved, Cancelled)
            | (Active, Completed)
            | (Active, Overdue)
    );
    if allowed {
        Ok(())
    } else {
        Err(EngineError::State { from, to })
    }
}

/// Device status implied by entering `to`. `None` leaves the device untouched.
pub fn device_effect(to: ReservationStatus) -> Option<DeviceStatus> {
    match to {
        Active => Some(DeviceStatus::InUse),
        Completed => Some(DeviceStatus::Available),
        _ => None,
    }
}

/// Device status to commit alongside moving reservation `id` to `to`.
///
/// A device taken out of service keeps that status through pickup and return.
/// A return only frees the device when no other reservation on it is out on loan.
pub fn paired_device_status(
    ds: &DeviceState,
    id: &Ulid,
    to: ReservationStatus,
) -> Option<DeviceStatus> {
    if ds.device.status.is_out_of_service() {
        return None;
    }
    match device_effect(to)? {
        DeviceStatus::Available if ds.has_active_besides(id) => None,
        status => Some(status).filter(|s| *s != ds.device.status),
    }
}

/// Device status once incident `resolving` is closed. `None` when the device
/// stays as it is: retired, or still held out by another severe incident.
pub fn restored_status(ds: &DeviceState, resolving: &Ulid) -> Option<DeviceStatus> {
    if ds.device.status == DeviceStatus::Inactive || ds.has_open_severe_besides(resolving) {
        return None;
    }
    let in_use = ds
        .reservations
        .iter()
        .any(|r| r.status == ReservationStatus::Active);
    let target = if in_use {
        DeviceStatus::InUse
    } else {
        DeviceStatus::Available
    };
    Some(target).filter(|s| *s != ds.device.status)
}

/// Message owed to the requester after entering `to`.
pub fn notification_kind(to: ReservationStatus) -> Option<NotificationKind> {
    match to {
        Approved => Some(NotificationKind::ReservationConfirmed),
        Rejected => Some(NotificationKind::ReservationRejected),
        Cancelled => Some(NotificationKind::ReservationCancelled),
        Completed => Some(NotificationKind::ReturnConfirmed),
        Overdue => Some(NotificationKind::OverdueNotice),
        Pending | Active => None,
    }
}
