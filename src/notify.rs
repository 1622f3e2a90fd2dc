use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::{Device, Ms, Requester, Reservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    /// Sent on approval; carries the pickup code.
    ReservationConfirmed,
    ReservationRejected,
    ReservationCancelled,
    ReturnConfirmed,
    /// Reservation ends soon and the device is still out.
    ReturnReminder,
    OverdueNotice,
    SanctionNotice,
    /// Admin copy of an overdue reservation.
    OverdueAlert,
    /// Admin notice that a device was flagged for maintenance.
    MaintenanceAlert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub requester_id: Option<Ulid>,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Recipient {
    pub fn requester(id: Ulid, requester: Option<&Requester>) -> Self {
        Self {
            requester_id: Some(id),
            name: requester.and_then(|r| r.full_name.clone()),
            email: requester.and_then(|r| r.email.clone()),
        }
    }

    pub fn admin(email: &str) -> Self {
        Self {
            requester_id: None,
            name: None,
            email: Some(email.to_string()),
        }
    }
}

/// Detached copy of what a message needs. Never a handle into engine state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    Reservation {
        reservation_id: Ulid,
        subject: Option<String>,
        start: Ms,
        end: Ms,
        device_model: String,
        device_serial: String,
        pickup_code: Option<String>,
    },
    Device {
        device_id: Ulid,
        device_model: String,
        device_serial: String,
        mean_rating: Option<f64>,
    },
}

impl Payload {
    pub fn reservation(r: &Reservation, device: &Device, with_pickup_code: bool) -> Self {
        Payload::Reservation {
            reservation_id: r.id,
            subject: r.subject.clone(),
            start: r.span.start,
            end: r.span.end,
            device_model: device.model.clone(),
            device_serial: device.serial_number.clone(),
            pickup_code: with_pickup_code.then(|| r.pickup_code()),
        }
    }

    pub fn device(device: &Device, mean_rating: Option<f64>) -> Self {
        Payload::Device {
            device_id: device.id,
            device_model: device.model.clone(),
            device_serial: device.serial_number.clone(),
            mean_rating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: Recipient,
    pub payload: Payload,
}

#[derive(Debug)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Outbound delivery (email, chat, ...). Best effort: the engine never reads
/// the result.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Notifier that only logs. Stands in for SMTP delivery.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let body =
            serde_json::to_string(notification).map_err(|e| NotifyError(e.to_string()))?;
        tracing::info!(kind = ?notification.kind, "notification: {body}");
        Ok(())
    }
}

/// Producer side of the notification worker channel. Enqueue never waits: a
/// full or closed queue drops the message.
#[derive(Clone)]
pub struct NotifyQueue {
    tx: mpsc::Sender<Notification>,
}

impl NotifyQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn send(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
                warn!("notification queue full, dropping {:?}", n.kind);
            }
            Err(TrySendError::Closed(n)) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
                debug!("notification dispatcher gone, dropping {:?}", n.kind);
            }
        }
    }
}

/// Background sender: drain the queue and hand each message to the notifier.
/// Failures are logged and forgotten.
pub async fn run_dispatcher(mut rx: mpsc::Receiver<Notification>, notifier: Arc<dyn Notifier>) {
    while let Some(notification) = rx.recv().await {
        match notifier.notify(&notification).await {
            Ok(()) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_SENT_TOTAL).increment(1);
            }
            Err(e) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                warn!("{:?} to {:?}: {e}", notification.kind, notification.recipient.email);
            }
        }
    }
    debug!("notification dispatcher stopped");
}
